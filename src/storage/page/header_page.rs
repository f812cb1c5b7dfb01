use crate::buffer::PageId;
use crate::error::{PlumeError, PlumeResult};

/// Well-known id of the index roots directory. The disk manager reserves
/// this page when the database file is created.
pub const INDEX_ROOTS_PAGE_ID: PageId = 1;

/// Directory page mapping index names to their root page ids. A tree
/// inserts its record when it first acquires a root and updates it on
/// every subsequent root change, so an index can be reopened by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexRootsPage {
    pub records: Vec<(String, PageId)>,
}

impl IndexRootsPage {
    pub fn get_record(&self, name: &str) -> Option<PageId> {
        self.records
            .iter()
            .find(|(record_name, _)| record_name == name)
            .map(|(_, root_page_id)| *root_page_id)
    }

    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> PlumeResult<()> {
        if self.get_record(name).is_some() {
            return Err(PlumeError::Storage(format!(
                "index {} already registered",
                name
            )));
        }
        self.records.push((name.to_string(), root_page_id));
        Ok(())
    }

    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> PlumeResult<()> {
        for record in self.records.iter_mut() {
            if record.0 == name {
                record.1 = root_page_id;
                return Ok(());
            }
        }
        Err(PlumeError::Storage(format!(
            "index {} is not registered",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_roots_insert_update() {
        let mut page = IndexRootsPage::default();
        assert_eq!(page.get_record("idx"), None);

        page.insert_record("idx", 5).unwrap();
        assert_eq!(page.get_record("idx"), Some(5));
        assert!(page.insert_record("idx", 6).is_err());

        page.update_record("idx", 7).unwrap();
        assert_eq!(page.get_record("idx"), Some(7));
        assert!(page.update_record("other", 1).is_err());
    }
}
