use crate::common::{PageId, PAGE_SIZE};

const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 8;

/// Maximum length of an index name stored in a header record
pub const MAX_INDEX_NAME_LEN: usize = 32;

const RECORD_SIZE: usize = MAX_INDEX_NAME_LEN + 4;
const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

/// Mutable view over the header page: a flat table of
/// `(index name, root page id)` records consulted and updated whenever an
/// index's root moves.
pub struct HeaderPage<'a> {
    data: &'a mut [u8],
}

impl<'a> HeaderPage<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    pub fn init(&mut self) {
        self.data.fill(0);
        self.set_record_count(0);
    }

    pub fn record_count(&self) -> u32 {
        read_record_count(self.data)
    }

    fn set_record_count(&mut self, count: u32) {
        self.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4]
            .copy_from_slice(&count.to_le_bytes());
    }

    /// Appends a record for `name`; false when the name is already present
    /// or the page is full.
    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        assert!(name.len() <= MAX_INDEX_NAME_LEN);

        if find_record(self.data, name).is_some() {
            return false;
        }
        let count = self.record_count() as usize;
        if count >= MAX_RECORDS {
            return false;
        }

        let offset = RECORDS_OFFSET + count * RECORD_SIZE;
        self.data[offset..offset + MAX_INDEX_NAME_LEN].fill(0);
        self.data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        self.data[offset + MAX_INDEX_NAME_LEN..offset + RECORD_SIZE]
            .copy_from_slice(&root_page_id.as_u32().to_le_bytes());

        self.set_record_count(count as u32 + 1);
        true
    }

    /// Overwrites the root id of an existing record; false when absent.
    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        assert!(name.len() <= MAX_INDEX_NAME_LEN);

        match find_record(self.data, name) {
            Some(index) => {
                let offset = RECORDS_OFFSET + index * RECORD_SIZE;
                self.data[offset + MAX_INDEX_NAME_LEN..offset + RECORD_SIZE]
                    .copy_from_slice(&root_page_id.as_u32().to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// Removes a record, shifting the tail down; false when absent.
    pub fn delete_record(&mut self, name: &str) -> bool {
        let index = match find_record(self.data, name) {
            Some(index) => index,
            None => return false,
        };
        let count = self.record_count() as usize;

        for i in index..count - 1 {
            let src = RECORDS_OFFSET + (i + 1) * RECORD_SIZE;
            let dst = RECORDS_OFFSET + i * RECORD_SIZE;
            self.data.copy_within(src..src + RECORD_SIZE, dst);
        }
        let last = RECORDS_OFFSET + (count - 1) * RECORD_SIZE;
        self.data[last..last + RECORD_SIZE].fill(0);

        self.set_record_count(count as u32 - 1);
        true
    }

    pub fn get_record(&self, name: &str) -> Option<PageId> {
        read_record(self.data, name)
    }
}

/// Read-only view over the header page.
pub struct HeaderPageRef<'a> {
    data: &'a [u8],
}

impl<'a> HeaderPageRef<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    pub fn record_count(&self) -> u32 {
        read_record_count(self.data)
    }

    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }

    pub fn get_record(&self, name: &str) -> Option<PageId> {
        read_record(self.data, name)
    }
}

fn read_record_count(data: &[u8]) -> u32 {
    u32::from_le_bytes(
        data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4]
            .try_into()
            .unwrap(),
    )
}

fn find_record(data: &[u8], name: &str) -> Option<usize> {
    let count = read_record_count(data) as usize;
    let name_bytes = name.as_bytes();

    (0..count).find(|&i| {
        let offset = RECORDS_OFFSET + i * RECORD_SIZE;
        let stored = &data[offset..offset + MAX_INDEX_NAME_LEN];
        let len = stored.iter().position(|&b| b == 0).unwrap_or(MAX_INDEX_NAME_LEN);
        &stored[..len] == name_bytes
    })
}

fn read_record(data: &[u8], name: &str) -> Option<PageId> {
    find_record(data, name).map(|i| {
        let offset = RECORDS_OFFSET + i * RECORD_SIZE + MAX_INDEX_NAME_LEN;
        let raw = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
        PageId::new(raw)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::INVALID_PAGE_ID;

    #[test]
    fn test_insert_and_get() {
        let mut data = [0u8; PAGE_SIZE];
        let mut page = HeaderPage::new(&mut data);
        page.init();

        assert!(page.insert_record("orders_pk", PageId::new(7)));
        assert!(page.insert_record("users_pk", PageId::new(9)));
        assert!(!page.insert_record("orders_pk", PageId::new(8)));

        assert_eq!(page.get_record("orders_pk"), Some(PageId::new(7)));
        assert_eq!(page.get_record("users_pk"), Some(PageId::new(9)));
        assert_eq!(page.get_record("missing"), None);
        assert_eq!(page.record_count(), 2);
    }

    #[test]
    fn test_update() {
        let mut data = [0u8; PAGE_SIZE];
        let mut page = HeaderPage::new(&mut data);
        page.init();

        assert!(!page.update_record("idx", PageId::new(1)));
        assert!(page.insert_record("idx", PageId::new(1)));
        assert!(page.update_record("idx", INVALID_PAGE_ID));
        assert_eq!(page.get_record("idx"), Some(INVALID_PAGE_ID));
    }

    #[test]
    fn test_delete_shifts_records() {
        let mut data = [0u8; PAGE_SIZE];
        let mut page = HeaderPage::new(&mut data);
        page.init();

        page.insert_record("a", PageId::new(1));
        page.insert_record("b", PageId::new(2));
        page.insert_record("c", PageId::new(3));

        assert!(page.delete_record("b"));
        assert!(!page.delete_record("b"));
        assert_eq!(page.record_count(), 2);
        assert_eq!(page.get_record("a"), Some(PageId::new(1)));
        assert_eq!(page.get_record("c"), Some(PageId::new(3)));
    }

    #[test]
    fn test_readonly_view_matches() {
        let mut data = [0u8; PAGE_SIZE];
        {
            let mut page = HeaderPage::new(&mut data);
            page.init();
            page.insert_record("idx", PageId::new(5));
        }

        let view = HeaderPageRef::new(&data);
        assert!(!view.is_empty());
        assert_eq!(view.get_record("idx"), Some(PageId::new(5)));
    }
}
