mod index_page;

pub use index_page::*;

use crate::error::{PlumeError, PlumeResult};
use crate::storage::page::RecordId;

/// A decoded value plus the number of bytes it consumed.
pub type DecodedData<T> = (T, usize);

/// Fixed-width little-endian primitives shared by all page codecs.
pub struct CommonCodec;

impl CommonCodec {
    pub fn encode_u32(data: u32) -> Vec<u8> {
        data.to_le_bytes().to_vec()
    }

    pub fn decode_u32(bytes: &[u8]) -> PlumeResult<DecodedData<u32>> {
        if bytes.len() < 4 {
            return Err(PlumeError::Storage(format!(
                "bytes length {} is less than 4",
                bytes.len()
            )));
        }
        let data = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok((data, 4))
    }

    pub fn encode_bytes(data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + data.len());
        bytes.extend(CommonCodec::encode_u32(data.len() as u32));
        bytes.extend_from_slice(data);
        bytes
    }

    pub fn decode_bytes(bytes: &[u8]) -> PlumeResult<DecodedData<Vec<u8>>> {
        let (length, offset) = CommonCodec::decode_u32(bytes)?;
        let length = length as usize;
        if bytes.len() < offset + length {
            return Err(PlumeError::Storage(format!(
                "bytes length {} is less than expected {}",
                bytes.len(),
                offset + length
            )));
        }
        let data = bytes[offset..offset + length].to_vec();
        Ok((data, offset + length))
    }
}

pub struct RecordIdCodec;

impl RecordIdCodec {
    pub const LENGTH: usize = 8;

    pub fn encode(rid: &RecordId) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::LENGTH);
        bytes.extend(CommonCodec::encode_u32(rid.page_id));
        bytes.extend(CommonCodec::encode_u32(rid.slot_num));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> PlumeResult<DecodedData<RecordId>> {
        let mut left_bytes = bytes;
        let (page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (slot_num, offset2) = CommonCodec::decode_u32(left_bytes)?;
        Ok((RecordId::new(page_id, slot_num), offset + offset2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_codec_u32_little_endian() {
        let bytes = CommonCodec::encode_u32(0x0403_0201);
        assert_eq!(bytes, vec![0x01, 0x02, 0x03, 0x04]);
        let (value, offset) = CommonCodec::decode_u32(&bytes).unwrap();
        assert_eq!(value, 0x0403_0201);
        assert_eq!(offset, 4);
    }

    #[test]
    fn test_common_codec_bytes() {
        let bytes = CommonCodec::encode_bytes(b"hello");
        let (data, offset) = CommonCodec::decode_bytes(&bytes).unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(offset, 9);

        assert!(CommonCodec::decode_bytes(&bytes[..6]).is_err());
    }

    #[test]
    fn test_record_id_codec() {
        let rid = RecordId::new(3, 7);
        let bytes = RecordIdCodec::encode(&rid);
        assert_eq!(bytes.len(), RecordIdCodec::LENGTH);
        let (decoded, offset) = RecordIdCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, rid);
        assert_eq!(offset, RecordIdCodec::LENGTH);
    }
}
