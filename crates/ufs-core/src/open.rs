//! Open-inode reference counts.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use ufs_types::InodeNumber;

#[derive(Debug, Default)]
pub(crate) struct OpenInodes {
    counts: Mutex<BTreeMap<InodeNumber, u32>>,
}

impl OpenInodes {
    pub fn acquire(&self, ino: InodeNumber) -> u32 {
        let mut counts = self.counts.lock();
        let count = counts.entry(ino).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop one reference; `None` if `ino` was not open, otherwise the
    /// references left.
    pub fn release(&self, ino: InodeNumber) -> Option<u32> {
        let mut counts = self.counts.lock();
        let count = counts.get_mut(&ino)?;
        *count -= 1;
        let left = *count;
        if left == 0 {
            counts.remove(&ino);
        }
        Some(left)
    }

    pub fn is_open(&self, ino: InodeNumber) -> bool {
        self.counts.lock().contains_key(&ino)
    }

    pub fn inodes(&self) -> Vec<InodeNumber> {
        self.counts.lock().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_are_counted() {
        let open = OpenInodes::default();
        let ino = InodeNumber(7);
        assert_eq!(open.acquire(ino), 1);
        assert_eq!(open.acquire(ino), 2);
        assert_eq!(open.release(ino), Some(1));
        assert!(open.is_open(ino));
        assert_eq!(open.release(ino), Some(0));
        assert!(!open.is_open(ino));
        assert_eq!(open.release(ino), None);
        assert!(open.inodes().is_empty());
    }
}
