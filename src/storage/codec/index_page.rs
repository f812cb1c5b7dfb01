use super::{CommonCodec, DecodedData, RecordIdCodec};
use crate::buffer::PAGE_SIZE;
use crate::error::{PlumeError, PlumeResult};
use crate::storage::page::{
    default_comparator, BPlusTreeInternalPage, BPlusTreeInternalPageHeader, BPlusTreeLeafPage,
    BPlusTreeLeafPageHeader, BPlusTreePage, BPlusTreePageType, IndexRootsPage,
};

pub struct BPlusTreePageTypeCodec;

impl BPlusTreePageTypeCodec {
    pub fn encode(page_type: &BPlusTreePageType) -> Vec<u8> {
        match page_type {
            BPlusTreePageType::LeafPage => CommonCodec::encode_u32(1),
            BPlusTreePageType::InternalPage => CommonCodec::encode_u32(2),
        }
    }

    pub fn decode(bytes: &[u8]) -> PlumeResult<DecodedData<BPlusTreePageType>> {
        let (flag, offset) = CommonCodec::decode_u32(bytes)?;
        match flag {
            1 => Ok((BPlusTreePageType::LeafPage, offset)),
            2 => Ok((BPlusTreePageType::InternalPage, offset)),
            _ => Err(PlumeError::Storage(format!(
                "invalid page type flag {}",
                flag
            ))),
        }
    }
}

pub struct BPlusTreePageCodec;

impl BPlusTreePageCodec {
    pub fn encode(page: &BPlusTreePage) -> Vec<u8> {
        match page {
            BPlusTreePage::Leaf(page) => BPlusTreeLeafPageCodec::encode(page),
            BPlusTreePage::Internal(page) => BPlusTreeInternalPageCodec::encode(page),
        }
    }

    pub fn decode(bytes: &[u8]) -> PlumeResult<DecodedData<BPlusTreePage>> {
        if bytes.len() != PAGE_SIZE {
            return Err(PlumeError::Storage(format!(
                "index page size is {} instead of {}",
                bytes.len(),
                PAGE_SIZE
            )));
        }
        // Peek the tag without consuming.
        let (page_type, _) = BPlusTreePageTypeCodec::decode(bytes)?;
        match page_type {
            BPlusTreePageType::LeafPage => {
                let (page, offset) = BPlusTreeLeafPageCodec::decode(bytes)?;
                Ok((BPlusTreePage::Leaf(page), offset))
            }
            BPlusTreePageType::InternalPage => {
                let (page, offset) = BPlusTreeInternalPageCodec::decode(bytes)?;
                Ok((BPlusTreePage::Internal(page), offset))
            }
        }
    }
}

/**
 * Header layout (little-endian, 24 bytes; leaves append next_page_id for
 * 28):
 *
 * | PageType (4) | Lsn (4) | CurrentSize (4) | MaxSize (4)
 * | ParentPageId (4) | PageId (4) | [NextPageId (4)] |
 */
pub struct BPlusTreeLeafPageHeaderCodec;

impl BPlusTreeLeafPageHeaderCodec {
    pub fn encode(header: &BPlusTreeLeafPageHeader) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(BPlusTreePageTypeCodec::encode(&header.page_type));
        bytes.extend(CommonCodec::encode_u32(header.lsn));
        bytes.extend(CommonCodec::encode_u32(header.current_size));
        bytes.extend(CommonCodec::encode_u32(header.max_size));
        bytes.extend(CommonCodec::encode_u32(header.parent_page_id));
        bytes.extend(CommonCodec::encode_u32(header.page_id));
        bytes.extend(CommonCodec::encode_u32(header.next_page_id));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> PlumeResult<DecodedData<BPlusTreeLeafPageHeader>> {
        let mut left_bytes = bytes;

        let (page_type, offset) = BPlusTreePageTypeCodec::decode(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (lsn, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (current_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (max_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (parent_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (next_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        Ok((
            BPlusTreeLeafPageHeader {
                page_type,
                lsn,
                current_size,
                max_size,
                parent_page_id,
                page_id,
                next_page_id,
            },
            bytes.len() - left_bytes.len(),
        ))
    }
}

pub struct BPlusTreeInternalPageHeaderCodec;

impl BPlusTreeInternalPageHeaderCodec {
    pub fn encode(header: &BPlusTreeInternalPageHeader) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(BPlusTreePageTypeCodec::encode(&header.page_type));
        bytes.extend(CommonCodec::encode_u32(header.lsn));
        bytes.extend(CommonCodec::encode_u32(header.current_size));
        bytes.extend(CommonCodec::encode_u32(header.max_size));
        bytes.extend(CommonCodec::encode_u32(header.parent_page_id));
        bytes.extend(CommonCodec::encode_u32(header.page_id));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> PlumeResult<DecodedData<BPlusTreeInternalPageHeader>> {
        let mut left_bytes = bytes;

        let (page_type, offset) = BPlusTreePageTypeCodec::decode(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (lsn, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (current_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (max_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (parent_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        Ok((
            BPlusTreeInternalPageHeader {
                page_type,
                lsn,
                current_size,
                max_size,
                parent_page_id,
                page_id,
            },
            bytes.len() - left_bytes.len(),
        ))
    }
}

pub struct BPlusTreeLeafPageCodec;

impl BPlusTreeLeafPageCodec {
    pub fn encode(page: &BPlusTreeLeafPage) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PAGE_SIZE);
        bytes.extend(BPlusTreeLeafPageHeaderCodec::encode(&page.header));
        for (key, rid) in page.array.iter() {
            bytes.extend(CommonCodec::encode_bytes(key));
            bytes.extend(RecordIdCodec::encode(rid));
        }
        assert!(bytes.len() <= PAGE_SIZE, "leaf page overflows frame");
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> PlumeResult<DecodedData<BPlusTreeLeafPage>> {
        if bytes.len() != PAGE_SIZE {
            return Err(PlumeError::Storage(format!(
                "index page size is {} instead of {}",
                bytes.len(),
                PAGE_SIZE
            )));
        }
        let mut left_bytes = bytes;

        let (header, offset) = BPlusTreeLeafPageHeaderCodec::decode(left_bytes)?;
        if !matches!(header.page_type, BPlusTreePageType::LeafPage) {
            return Err(PlumeError::Storage(
                "index page type must be leaf page".to_string(),
            ));
        }
        left_bytes = &left_bytes[offset..];

        let mut array = Vec::with_capacity(header.current_size as usize);
        for _ in 0..header.current_size {
            let (key, offset) = CommonCodec::decode_bytes(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            let (rid, offset) = RecordIdCodec::decode(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            array.push((key, rid));
        }

        Ok((
            BPlusTreeLeafPage {
                header,
                array,
                comparator: default_comparator,
            },
            PAGE_SIZE,
        ))
    }
}

pub struct BPlusTreeInternalPageCodec;

impl BPlusTreeInternalPageCodec {
    pub fn encode(page: &BPlusTreeInternalPage) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PAGE_SIZE);
        bytes.extend(BPlusTreeInternalPageHeaderCodec::encode(&page.header));
        for (key, page_id) in page.array.iter() {
            bytes.extend(CommonCodec::encode_bytes(key));
            bytes.extend(CommonCodec::encode_u32(*page_id));
        }
        assert!(bytes.len() <= PAGE_SIZE, "internal page overflows frame");
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> PlumeResult<DecodedData<BPlusTreeInternalPage>> {
        if bytes.len() != PAGE_SIZE {
            return Err(PlumeError::Storage(format!(
                "index page size is {} instead of {}",
                bytes.len(),
                PAGE_SIZE
            )));
        }
        let mut left_bytes = bytes;

        let (header, offset) = BPlusTreeInternalPageHeaderCodec::decode(left_bytes)?;
        if !matches!(header.page_type, BPlusTreePageType::InternalPage) {
            return Err(PlumeError::Storage(
                "index page type must be internal page".to_string(),
            ));
        }
        left_bytes = &left_bytes[offset..];

        let mut array = Vec::with_capacity(header.current_size as usize);
        for _ in 0..header.current_size {
            let (key, offset) = CommonCodec::decode_bytes(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            let (page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            array.push((key, page_id));
        }

        Ok((
            BPlusTreeInternalPage {
                header,
                array,
                comparator: default_comparator,
            },
            PAGE_SIZE,
        ))
    }
}

/**
 * Roots directory layout:
 *
 * | RecordCount (4) | Name bytes (4 + n) | RootPageId (4) | ... |
 */
pub struct IndexRootsPageCodec;

impl IndexRootsPageCodec {
    pub fn encode(page: &IndexRootsPage) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PAGE_SIZE);
        bytes.extend(CommonCodec::encode_u32(page.records.len() as u32));
        for (name, root_page_id) in page.records.iter() {
            bytes.extend(CommonCodec::encode_bytes(name.as_bytes()));
            bytes.extend(CommonCodec::encode_u32(*root_page_id));
        }
        assert!(bytes.len() <= PAGE_SIZE, "roots directory overflows frame");
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> PlumeResult<DecodedData<IndexRootsPage>> {
        let mut left_bytes = bytes;

        let (count, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (name_bytes, offset) = CommonCodec::decode_bytes(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            let (root_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            let name = String::from_utf8(name_bytes)
                .map_err(|e| PlumeError::Storage(format!("invalid index name: {}", e)))?;
            records.push((name, root_page_id));
        }

        Ok((
            IndexRootsPage { records },
            bytes.len() - left_bytes.len(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::INVALID_PAGE_ID;
    use crate::storage::page::RecordId;
    use crate::utils::util::page_bytes_to_array;

    #[test]
    fn test_leaf_page_codec_round_trip() {
        let mut leaf = BPlusTreeLeafPage::new(9, 3, 4);
        leaf.header.next_page_id = 17;
        leaf.insert(b"apple", RecordId::new(1, 1));
        leaf.insert(b"banana", RecordId::new(2, 2));

        let bytes = BPlusTreeLeafPageCodec::encode(&leaf);
        assert_eq!(bytes.len(), PAGE_SIZE);
        let (decoded, _) = BPlusTreeLeafPageCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, leaf);
    }

    #[test]
    fn test_internal_page_codec_round_trip() {
        let mut internal = BPlusTreeInternalPage::new(4, INVALID_PAGE_ID, 4);
        internal.populate_new_root(7, b"melon".to_vec(), 8);

        let bytes = BPlusTreeInternalPageCodec::encode(&internal);
        assert_eq!(bytes.len(), PAGE_SIZE);
        let (decoded, _) = BPlusTreeInternalPageCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, internal);
    }

    #[test]
    fn test_tree_page_codec_dispatches_on_tag() {
        let mut leaf = BPlusTreeLeafPage::new(9, 3, 4);
        leaf.insert(b"k", RecordId::new(1, 1));
        let bytes = page_bytes_to_array(&BPlusTreeLeafPageCodec::encode(&leaf));
        let (page, _) = BPlusTreePageCodec::decode(&bytes).unwrap();
        assert!(matches!(page, BPlusTreePage::Leaf(_)));

        let internal = BPlusTreeInternalPage::new(4, INVALID_PAGE_ID, 4);
        let bytes = page_bytes_to_array(&BPlusTreeInternalPageCodec::encode(&internal));
        let (page, _) = BPlusTreePageCodec::decode(&bytes).unwrap();
        assert!(matches!(page, BPlusTreePage::Internal(_)));

        assert!(BPlusTreeLeafPageCodec::decode(&BPlusTreeInternalPageCodec::encode(&internal)).is_err());
    }

    #[test]
    fn test_index_roots_page_codec_round_trip() {
        let mut page = IndexRootsPage::default();
        page.insert_record("orders_pk", 12).unwrap();
        page.insert_record("users_pk", 31).unwrap();

        let bytes = IndexRootsPageCodec::encode(&page);
        assert_eq!(bytes.len(), PAGE_SIZE);
        let (decoded, _) = IndexRootsPageCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn test_index_roots_zeroed_page_decodes_empty() {
        let bytes = [0u8; PAGE_SIZE];
        let (decoded, _) = IndexRootsPageCodec::decode(&bytes).unwrap();
        assert!(decoded.records.is_empty());
    }
}
