//! deferred writes of dirtied metadata blocks
//!
//! mutations snapshot the block they touched into the queue while the allocation
//! lock is held. Snapshots of the same block coalesce, the newest one wins.
//! Only the flushes talk to the device.
use std::collections::BTreeMap;

use log::{debug, error};
use parking_lot::Mutex;

use crate::device::BlockDevice;

use super::error::Result;

/// what kind of metadata a dirty block holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DirtyBlock {
    Superblock,
    /// the `nth` block of the group descriptor table
    Descriptors { nth: u64 },
    /// inode bitmap of `group`
    Bitmap { group: u32 },
}

/// a dirty block pending write-back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBackEntry {
    pub kind: DirtyBlock,
    pub data: Vec<u8>,
}

/// dirty blocks keyed by absolute block number
#[derive(Debug, Default)]
pub struct WriteBackQueue {
    pending: Mutex<BTreeMap<u64, WriteBackEntry>>,
}

impl WriteBackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// queue `data` for `block`, replacing any older snapshot of it
    /// # Return
    /// `true` if the block was not pending yet
    pub fn enqueue(&self, block: u64, kind: DirtyBlock, data: Vec<u8>) -> bool {
        self.pending
            .lock()
            .insert(block, WriteBackEntry { kind, data })
            .is_none()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn contains(&self, block: u64) -> bool {
        self.pending.lock().contains_key(&block)
    }

    /// snapshot of a pending block
    pub fn get(&self, block: u64) -> Option<WriteBackEntry> {
        self.pending.lock().get(&block).cloned()
    }

    /// write every pending block and sync the device
    ///
    /// call with the device lock held, so that drains of concurrent flushers
    /// reach the device in the order they were taken
    /// # Return
    /// the number of blocks written
    pub fn flush<D>(&self, dev: &mut D) -> Result<usize>
    where
        D: BlockDevice + ?Sized,
    {
        let entries = std::mem::take(&mut *self.pending.lock());
        let written = self.write_entries(dev, entries.into_iter().collect())?;
        dev.sync()?;
        Ok(written)
    }

    /// write only `blocks`, leaving everything else queued
    pub fn flush_blocks<D>(&self, dev: &mut D, blocks: &[u64]) -> Result<usize>
    where
        D: BlockDevice + ?Sized,
    {
        let entries: Vec<(u64, WriteBackEntry)> = {
            let mut pending = self.pending.lock();
            blocks
                .iter()
                .filter_map(|block| pending.remove(block).map(|e| (*block, e)))
                .collect()
        };
        let written = self.write_entries(dev, entries)?;
        dev.sync()?;
        Ok(written)
    }

    fn write_entries<D>(&self, dev: &mut D, entries: Vec<(u64, WriteBackEntry)>) -> Result<usize>
    where
        D: BlockDevice + ?Sized,
    {
        let mut entries = entries.into_iter();
        let mut written = 0;
        while let Some((block, entry)) = entries.next() {
            if let Err(e) = dev.write_block(block, &entry.data) {
                error!("write-back of {:?} at block {block} failed: {e}", entry.kind);
                // requeue what was not written unless a newer snapshot arrived meanwhile
                let mut pending = self.pending.lock();
                for (block, entry) in std::iter::once((block, entry)).chain(entries) {
                    pending.entry(block).or_insert(entry);
                }
                return Err(e);
            }
            debug!("wrote back {:?} at block {block}", entry.kind);
            written += 1;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::fs::error::FsError;

    #[test]
    fn test_enqueue_coalesces_by_block() {
        let queue = WriteBackQueue::new();
        assert!(queue.enqueue(3, DirtyBlock::Bitmap { group: 0 }, vec![1; 4]));
        assert!(!queue.enqueue(3, DirtyBlock::Bitmap { group: 0 }, vec![2; 4]));
        assert!(queue.enqueue(0, DirtyBlock::Superblock, vec![9; 4]));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get(3).unwrap().data, vec![2; 4]);
    }

    #[test]
    fn test_flush_writes_newest_snapshot() {
        let mut dev = MemoryDevice::new(4, 8);
        let queue = WriteBackQueue::new();
        queue.enqueue(5, DirtyBlock::Bitmap { group: 1 }, vec![1; 4]);
        queue.enqueue(5, DirtyBlock::Bitmap { group: 1 }, vec![7; 4]);
        queue.enqueue(1, DirtyBlock::Descriptors { nth: 0 }, vec![3; 4]);

        assert_eq!(queue.flush(&mut dev).unwrap(), 2);
        assert!(queue.is_empty());
        assert_eq!(dev.writes(), 2);
        assert_eq!(&dev.as_bytes()[20..24], &[7; 4]);
        assert_eq!(&dev.as_bytes()[4..8], &[3; 4]);
    }

    #[test]
    fn test_flush_blocks_leaves_others_queued() {
        let mut dev = MemoryDevice::new(4, 8);
        let queue = WriteBackQueue::new();
        queue.enqueue(0, DirtyBlock::Superblock, vec![1; 4]);
        queue.enqueue(2, DirtyBlock::Bitmap { group: 0 }, vec![2; 4]);
        queue.enqueue(6, DirtyBlock::Bitmap { group: 4 }, vec![6; 4]);

        assert_eq!(queue.flush_blocks(&mut dev, &[0, 2, 4]).unwrap(), 2);
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(6));
    }

    #[test]
    fn test_failed_flush_requeues_unwritten_blocks() {
        let mut dev = MemoryDevice::new(4, 4);
        let queue = WriteBackQueue::new();
        queue.enqueue(1, DirtyBlock::Descriptors { nth: 0 }, vec![1; 4]);
        // beyond the end of the device
        queue.enqueue(10, DirtyBlock::Bitmap { group: 2 }, vec![2; 4]);
        queue.enqueue(11, DirtyBlock::Bitmap { group: 3 }, vec![3; 4]);

        assert!(matches!(queue.flush(&mut dev), Err(FsError::Io(_))));
        assert!(!queue.contains(1));
        assert!(queue.contains(10));
        assert!(queue.contains(11));
    }
}
