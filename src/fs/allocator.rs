//! inode number allocation, reclamation and free-count verification
//!
//! There are two policies for placing an inode. A directory goes to the group
//! with the most free blocks among those holding at least the average number of
//! free inodes. Any other inode stays in its parent directory's group if it can,
//! otherwise a doubling-step probe and then a linear scan look for a group with
//! a free inode.
//!
//! A single lock guards the superblock counters, every group descriptor and
//! every bitmap. It is held for a whole allocate or free, retries included,
//! and never across device I/O: touched blocks are snapshotted into the
//! [WriteBackQueue] instead.
use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::utils::fs_size_calculator;

use super::{
    bitmap::{BitmapStore, InodeBitmap},
    block_group::GroupDescriptorTable,
    error::{Anomaly, FsError, Result},
    superblock::SuperBlock,
    write_back::{DirtyBlock, WriteBackQueue},
    FsLayout, MIN_ALLOC_RETRIES,
};

/// everything the allocation lock guards
#[derive(Debug)]
pub(crate) struct AllocState<B> {
    pub(crate) superblock: SuperBlock,
    pub(crate) groups: GroupDescriptorTable,
    pub(crate) bitmaps: Vec<B>,
}

/// a successfully allocated inode number and the group it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeAlloc {
    pub ino: u64,
    pub group: u32,
}

/// result of [InodeAllocator::free]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    /// the bit was cleared and the counters restored
    Freed,
    /// nothing changed
    Ignored(Anomaly),
}

/// a group whose stored free count disagrees with its bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupMismatch {
    pub group: u32,
    pub stored: u32,
    pub counted: u32,
}

/// outcome of [InodeAllocator::check]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub mismatches: Vec<GroupMismatch>,
    /// `free_inodes_count` recorded in the superblock
    pub superblock_stored: u64,
    /// sum of the descriptors' free counts
    pub descriptor_total: u64,
    /// zero bits over every bitmap
    pub bitmap_total: u64,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty() && self.superblock_stored == self.bitmap_total
    }

    /// `(stored, counted)` when the superblock counter drifted
    pub fn superblock_mismatch(&self) -> Option<(u64, u64)> {
        (self.superblock_stored != self.bitmap_total)
            .then_some((self.superblock_stored, self.bitmap_total))
    }
}

/// allocator state of one filesystem instance
#[derive(Debug)]
pub struct InodeAllocator<B = InodeBitmap> {
    layout: FsLayout,
    state: Mutex<AllocState<B>>,
    write_back: WriteBackQueue,
}

impl InodeAllocator<InodeBitmap> {
    /// allocator state of a freshly formatted filesystem:
    /// every inode free except the reserved ones below `first_valid_inode`
    pub fn fresh(layout: &FsLayout, uid: u32, gid: u32) -> Result<Self> {
        layout.validate()?;
        let superblock = SuperBlock::new(layout, uid, gid);
        let groups = GroupDescriptorTable::new(layout);
        let bitmaps = (0..layout.groups)
            .map(|g| {
                let mut bitmap = InodeBitmap::new(layout.inodes_per_group);
                for bit in 0..layout.reserved_in_group(g) {
                    bitmap.set(bit);
                }
                bitmap
            })
            .collect();
        Self::new(superblock, groups, bitmaps)
    }
}

impl<B> InodeAllocator<B>
where
    B: BitmapStore,
{
    /// take ownership of the state loaded at mount time
    pub fn new(superblock: SuperBlock, groups: GroupDescriptorTable, bitmaps: Vec<B>) -> Result<Self> {
        let layout = superblock.validate()?;
        if groups.len() != layout.groups as usize || bitmaps.len() != layout.groups as usize {
            return Err(FsError::Format(format!(
                "superblock has {} groups, got {} descriptors and {} bitmaps",
                layout.groups,
                groups.len(),
                bitmaps.len()
            )));
        }
        Ok(Self {
            layout,
            state: Mutex::new(AllocState {
                superblock,
                groups,
                bitmaps,
            }),
            write_back: WriteBackQueue::new(),
        })
    }

    #[inline]
    pub fn layout(&self) -> &FsLayout {
        &self.layout
    }

    #[inline]
    pub fn write_back(&self) -> &WriteBackQueue {
        &self.write_back
    }

    /// copy of the current superblock
    pub fn superblock(&self) -> SuperBlock {
        self.state.lock().superblock.clone()
    }

    /// copy of the current group descriptors
    pub fn groups(&self) -> GroupDescriptorTable {
        self.state.lock().groups.clone()
    }

    /// whether `ino` is a valid inode number whose bit is set
    pub fn is_allocated(&self, ino: u64) -> bool {
        if !self.layout.is_valid_inode(ino) {
            return false;
        }
        let (group, bit) = self.layout.inode_location(ino);
        self.state
            .lock()
            .bitmaps
            .get(group as usize)
            .map_or(false, |bitmap| bitmap.test(bit))
    }

    /// blocks one allocation or free in `group` dirties:
    /// the group's bitmap, its descriptor block and the superblock
    pub fn touched_blocks(&self, group: u32) -> [u64; 3] {
        [
            self.layout.bitmap_block(group),
            self.layout.descriptor_block(group),
            0,
        ]
    }

    /// publish a group's free block count, maintained by the block allocator
    pub fn set_free_blocks(&self, group: u32, free_blocks: u32) -> Result<()> {
        let mut state = self.state.lock();
        let desc = state
            .groups
            .get_mut(group)
            .ok_or_else(|| FsError::corrupt(group, "no such group"))?;
        desc.free_blocks_count = free_blocks;
        self.enqueue_descriptors(&state, group)
    }

    /// record a mount in the superblock
    pub fn note_mounted(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.superblock.update_last_mounted_at();
        self.enqueue_superblock(&mut state)
    }

    /// queue every metadata block, used when formatting
    pub fn enqueue_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        for group in 0..self.layout.groups {
            self.enqueue_bitmap(&state, group);
        }
        for nth in 0..self.layout.descriptor_blocks() {
            self.write_back.enqueue(
                self.layout.descriptor_table_start() + nth,
                DirtyBlock::Descriptors { nth },
                state.groups.encode_block(&self.layout, nth)?,
            );
        }
        self.enqueue_superblock(&mut state)
    }
}

/// allocation
impl<B> InodeAllocator<B>
where
    B: BitmapStore,
{
    /// pick a free inode number near `parent_group`
    ///
    /// # Errors
    /// - [FsError::NoSpace] when no group qualifies, nothing is mutated
    /// - [FsError::CorruptState] when a bitmap disagrees with its free count,
    ///   when the picked number is reserved, or when bitmap races keep
    ///   recurring past the retry bound
    pub fn allocate(&self, parent_group: u32, is_directory: bool) -> Result<InodeAlloc> {
        let mut state = self.state.lock();
        let ipg = self.layout.inodes_per_group;
        let max_retries = self.layout.groups.max(MIN_ALLOC_RETRIES);
        let mut group = 0;

        for attempt in 0..=max_retries {
            if state.superblock.free_inodes_count == 0 {
                return Err(FsError::NoSpace);
            }
            group = if is_directory {
                self.find_group_for_dir(&state)
            } else {
                self.find_group_near(&state, parent_group)
            }
            .ok_or(FsError::NoSpace)?;

            let stored_free = state.groups.get(group).map_or(0, |d| d.free_inodes_count);
            let bitmap = state
                .bitmaps
                .get_mut(group as usize)
                .ok_or_else(|| FsError::corrupt(group, "group has no bitmap"))?;

            let bit = bitmap.find_first_zero(ipg);
            if bit >= ipg {
                if stored_free != 0 {
                    error!(
                        "free inodes count corrupted in group {group}: \
                         stored = {stored_free}, bitmap is full"
                    );
                    return Err(FsError::corrupt(
                        group,
                        format!("{stored_free} free inodes recorded but the bitmap is full"),
                    ));
                }
                warn!("group {group} has a stale free inode count, retrying (attempt {attempt})");
                continue;
            }
            if bitmap.set(bit) {
                let anomaly = Anomaly::BitmapRace {
                    ino: self.layout.inode_number(group, bit),
                };
                warn!("bit already set for inode: {anomaly:?}, retrying (attempt {attempt})");
                continue;
            }

            let ino = self.layout.inode_number(group, bit);
            if !self.layout.is_valid_inode(ino) {
                // leave the bitmap exactly as it was found
                bitmap.clear(bit);
                error!("reserved inode or inode > inodes count - group = {group}, inode = {ino}");
                return Err(FsError::corrupt(
                    group,
                    format!("picked inode {ino} outside the allocatable range"),
                ));
            }

            let desc = state
                .groups
                .get_mut(group)
                .ok_or_else(|| FsError::corrupt(group, "no such group"))?;
            desc.free_inodes_count -= 1;
            if is_directory {
                desc.used_dirs_count += 1;
            }
            state.superblock.free_inodes_count -= 1;
            self.enqueue_group(&mut state, group)?;

            debug!("allocated inode {ino} in group {group} (directory: {is_directory})");
            return Ok(InodeAlloc { ino, group });
        }

        error!("allocation gave up after {max_retries} retries on bitmap anomalies");
        Err(FsError::corrupt(
            group,
            format!("bitmap anomalies persisted through {max_retries} retries"),
        ))
    }

    /// among groups with at least the average free inode count,
    /// the one with strictly the most free blocks, lowest index on ties
    ///
    /// groups below the average are never considered, even if they are
    /// the only ones left with free inodes
    fn find_group_for_dir(&self, state: &AllocState<B>) -> Option<u32> {
        let average_free = state.superblock.free_inodes_count / self.layout.groups as u64;
        let mut best: Option<(u32, u32)> = None;
        for (g, desc) in state.groups.iter().enumerate() {
            let free = desc.free_inodes_count as u64;
            if free == 0 || free < average_free {
                continue;
            }
            if best.map_or(true, |(_, blocks)| desc.free_blocks_count > blocks) {
                best = Some((g as u32, desc.free_blocks_count));
            }
        }
        best.map(|(g, _)| g)
    }

    /// the parent's group, else probe at doubling offsets, else scan linearly
    fn find_group_near(&self, state: &AllocState<B>, parent_group: u32) -> Option<u32> {
        let n = self.layout.groups as u64;
        let parent = parent_group as u64 % n;
        let has_free = |g: u64| {
            state
                .groups
                .get(g as u32)
                .map_or(false, |d| d.free_inodes_count > 0)
        };

        if has_free(parent) {
            return Some(parent as u32);
        }
        let mut step = 1u64;
        while step < n {
            let g = (parent + step) % n;
            if has_free(g) {
                return Some(g as u32);
            }
            step <<= 1;
        }
        (1..n)
            .map(|offset| (parent + offset) % n)
            .find(|g| has_free(*g))
            .map(|g| g as u32)
    }
}

/// reclamation
impl<B> InodeAllocator<B>
where
    B: BitmapStore,
{
    /// return `ino` to its group
    ///
    /// reserved or nonexistent numbers and already free inodes are logged
    /// and ignored, they never touch the counters
    pub fn free(&self, ino: u64, was_directory: bool) -> Result<FreeOutcome> {
        debug!("freeing inode {ino}");
        if !self.layout.is_valid_inode(ino) {
            let anomaly = Anomaly::ReservedInodeAccess { ino };
            warn!("free_inode: reserved inode or nonexistent inode: {anomaly:?}");
            return Ok(FreeOutcome::Ignored(anomaly));
        }

        let (group, bit) = self.layout.inode_location(ino);
        let mut state = self.state.lock();
        let bitmap = state
            .bitmaps
            .get_mut(group as usize)
            .ok_or_else(|| FsError::corrupt(group, "group has no bitmap"))?;
        if !bitmap.clear(bit) {
            let anomaly = Anomaly::BitmapRace { ino };
            warn!("free_inode: bit already cleared: {anomaly:?}");
            return Ok(FreeOutcome::Ignored(anomaly));
        }

        let desc = state
            .groups
            .get_mut(group)
            .ok_or_else(|| FsError::corrupt(group, "no such group"))?;
        desc.free_inodes_count = desc.free_inodes_count.saturating_add(1);
        if was_directory {
            desc.used_dirs_count = desc.used_dirs_count.saturating_sub(1);
        }
        state.superblock.free_inodes_count += 1;
        self.enqueue_group(&mut state, group)?;
        Ok(FreeOutcome::Freed)
    }
}

/// verification
impl<B> InodeAllocator<B>
where
    B: BitmapStore,
{
    /// recount every bitmap and compare against the stored counters
    ///
    /// diagnostic only, nothing is mutated
    pub fn check(&self) -> ConsistencyReport {
        let state = self.state.lock();
        let ipg = self.layout.inodes_per_group;
        let mut report = ConsistencyReport {
            superblock_stored: state.superblock.free_inodes_count,
            ..ConsistencyReport::default()
        };

        for (g, (desc, bitmap)) in state.groups.iter().zip(&state.bitmaps).enumerate() {
            let counted = bitmap.count_zeros(ipg);
            report.descriptor_total += desc.free_inodes_count as u64;
            report.bitmap_total += counted as u64;
            if desc.free_inodes_count != counted {
                error!(
                    "wrong free inodes count in group {g}, stored = {}, counted = {counted}",
                    desc.free_inodes_count
                );
                report.mismatches.push(GroupMismatch {
                    group: g as u32,
                    stored: desc.free_inodes_count,
                    counted,
                });
            }
        }
        if let Some((stored, counted)) = report.superblock_mismatch() {
            error!(
                "wrong free inodes count in super block, stored = {stored}, counted = {counted}"
            );
        }
        report
    }

    /// free inode count, from the superblock counter unless `cross_check` is set,
    /// in which case the descriptors are summed and compared against the bitmaps
    pub fn count_free_inodes(&self, cross_check: bool) -> u64 {
        let state = self.state.lock();
        if !cross_check {
            return state.superblock.free_inodes_count;
        }
        let ipg = self.layout.inodes_per_group;
        let mut desc_count = 0u64;
        let mut bitmap_count = 0u64;
        for (g, (desc, bitmap)) in state.groups.iter().zip(&state.bitmaps).enumerate() {
            let counted = bitmap.count_zeros(ipg);
            debug!(
                "group {g}: stored = {}, counted = {counted}",
                desc.free_inodes_count
            );
            desc_count += desc.free_inodes_count as u64;
            bitmap_count += counted as u64;
        }
        debug!(
            "stored = {}, computed = {desc_count}, {bitmap_count}",
            state.superblock.free_inodes_count
        );
        desc_count
    }
}

/// write-back snapshots, always taken with the lock held
impl<B> InodeAllocator<B>
where
    B: BitmapStore,
{
    fn enqueue_group(&self, state: &mut AllocState<B>, group: u32) -> Result<()> {
        self.enqueue_bitmap(state, group);
        self.enqueue_descriptors(state, group)?;
        state.superblock.update_modified_at();
        self.enqueue_superblock(state)
    }

    fn enqueue_bitmap(&self, state: &AllocState<B>, group: u32) {
        let Some(bitmap) = state.bitmaps.get(group as usize) else {
            return;
        };
        // the rest of the block stays zero
        let used = fs_size_calculator::bitmap_size(self.layout.inodes_per_group) as usize;
        let raw = bitmap.as_bytes();
        let len = used.min(raw.len());
        let mut data = vec![0u8; self.layout.block_size as usize];
        data[..len].copy_from_slice(&raw[..len]);
        self.write_back.enqueue(
            self.layout.bitmap_block(group),
            DirtyBlock::Bitmap { group },
            data,
        );
    }

    fn enqueue_descriptors(&self, state: &AllocState<B>, group: u32) -> Result<()> {
        let nth = self.layout.descriptor_nth(group);
        self.write_back.enqueue(
            self.layout.descriptor_block(group),
            DirtyBlock::Descriptors { nth },
            state.groups.encode_block(&self.layout, nth)?,
        );
        Ok(())
    }

    fn enqueue_superblock(&self, state: &mut AllocState<B>) -> Result<()> {
        let data = state.superblock.encode_block()?;
        self.write_back.enqueue(0, DirtyBlock::Superblock, data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::block_group::GroupDescriptor;
    use std::{collections::HashSet, sync::Arc, thread};

    fn layout(groups: u32, inodes_per_group: u32, first_valid_inode: u32) -> FsLayout {
        FsLayout {
            block_size: 512,
            groups,
            inodes_per_group,
            first_valid_inode,
            blocks_per_group: 4096,
        }
    }

    /// an allocator whose groups have exactly `free[g]` free inodes,
    /// taken from the top of each bitmap, and `free_blocks[g]` free blocks
    fn allocator_with(
        inodes_per_group: u32,
        free: &[u32],
        free_blocks: &[u32],
    ) -> InodeAllocator<InodeBitmap> {
        let layout = layout(free.len() as u32, inodes_per_group, 1);
        let mut superblock = SuperBlock::new(&layout, 0, 0);
        superblock.free_inodes_count = free.iter().map(|f| *f as u64).sum();
        let descriptors = free
            .iter()
            .zip(free_blocks)
            .enumerate()
            .map(|(g, (free, blocks))| GroupDescriptor {
                group_index: g as u32,
                bitmap_block: layout.bitmap_block(g as u32),
                inode_table_block: layout.inode_table_block(g as u32),
                free_blocks_count: *blocks,
                free_inodes_count: *free,
                used_dirs_count: 0,
            })
            .collect();
        let bitmaps = free
            .iter()
            .map(|free| {
                let mut bitmap = InodeBitmap::new(inodes_per_group);
                for bit in 0..inodes_per_group - free {
                    bitmap.set(bit);
                }
                bitmap
            })
            .collect();
        InodeAllocator::new(
            superblock,
            GroupDescriptorTable::from_descriptors(descriptors),
            bitmaps,
        )
        .unwrap()
    }

    fn assert_counters_agree<B: BitmapStore>(allocator: &InodeAllocator<B>) {
        let report = allocator.check();
        assert!(report.is_consistent(), "{report:?}");
        assert_eq!(report.descriptor_total, report.superblock_stored);
    }

    #[test]
    fn test_fresh_allocator_skips_reserved_inodes() {
        let allocator = InodeAllocator::fresh(&layout(2, 16, 11), 0, 0).unwrap();
        assert_eq!(allocator.count_free_inodes(false), 22);

        let first = allocator.allocate(0, false).unwrap();
        assert_eq!(first, InodeAlloc { ino: 11, group: 0 });
        let second = allocator.allocate(0, false).unwrap();
        assert_eq!(second.ino, 12);
        assert_eq!(allocator.count_free_inodes(false), 20);
        assert_counters_agree(&allocator);
    }

    #[test]
    fn test_file_stays_in_parent_group() {
        let allocator = InodeAllocator::fresh(&layout(4, 16, 1), 0, 0).unwrap();
        let alloc = allocator.allocate(2, false).unwrap();
        assert_eq!(alloc, InodeAlloc { ino: 33, group: 2 });
        // out of range hints wrap around
        let alloc = allocator.allocate(6, false).unwrap();
        assert_eq!(alloc.group, 2);
        assert_eq!(alloc.ino, 34);
    }

    #[test]
    fn test_allocate_then_free_restores_counters() {
        let allocator = InodeAllocator::fresh(&layout(4, 16, 11), 0, 0).unwrap();
        let before_sb = allocator.superblock().free_inodes_count;
        let before_groups = allocator.groups();

        let alloc = allocator.allocate(1, true).unwrap();
        assert_eq!(allocator.superblock().free_inodes_count, before_sb - 1);
        assert_eq!(allocator.groups().get(alloc.group).unwrap().used_dirs_count, 1);

        assert_eq!(allocator.free(alloc.ino, true).unwrap(), FreeOutcome::Freed);
        assert_eq!(allocator.superblock().free_inodes_count, before_sb);
        assert_eq!(allocator.groups(), before_groups);
        let (group, bit) = allocator.layout().inode_location(alloc.ino);
        assert!(!allocator.state.lock().bitmaps[group as usize].test(bit));
        assert_counters_agree(&allocator);
    }

    #[test]
    fn test_double_free_is_a_no_op() {
        let allocator = InodeAllocator::fresh(&layout(2, 16, 11), 0, 0).unwrap();
        let alloc = allocator.allocate(0, false).unwrap();
        assert_eq!(allocator.free(alloc.ino, false).unwrap(), FreeOutcome::Freed);
        let groups = allocator.groups();
        let free = allocator.count_free_inodes(false);

        assert_eq!(
            allocator.free(alloc.ino, false).unwrap(),
            FreeOutcome::Ignored(Anomaly::BitmapRace { ino: alloc.ino })
        );
        assert_eq!(allocator.count_free_inodes(false), free);
        assert_eq!(allocator.groups(), groups);
        assert_counters_agree(&allocator);
    }

    #[test]
    fn test_free_of_reserved_or_nonexistent_inode_is_ignored() {
        let allocator = InodeAllocator::fresh(&layout(2, 16, 11), 0, 0).unwrap();
        let free = allocator.count_free_inodes(false);
        for ino in [0, 5, 10, 33, u64::MAX] {
            assert_eq!(
                allocator.free(ino, false).unwrap(),
                FreeOutcome::Ignored(Anomaly::ReservedInodeAccess { ino })
            );
        }
        assert_eq!(allocator.count_free_inodes(false), free);
        assert!(allocator.write_back().is_empty());
    }

    #[test]
    fn test_no_space_when_superblock_reports_none() {
        let allocator = allocator_with(8, &[0, 0, 0], &[1, 1, 1]);
        let groups = allocator.groups();
        assert!(matches!(allocator.allocate(0, false), Err(FsError::NoSpace)));
        assert!(matches!(allocator.allocate(0, true), Err(FsError::NoSpace)));
        assert_eq!(allocator.groups(), groups);
        assert!(allocator.write_back().is_empty());
    }

    #[test]
    fn test_directory_goes_to_group_with_most_free_blocks() {
        // average free = 8, every group qualifies, group 0 has the most free blocks
        let allocator = allocator_with(8, &[8, 8, 8, 8], &[10, 5, 8, 8]);
        let alloc = allocator.allocate(3, true).unwrap();
        assert_eq!(alloc, InodeAlloc { ino: 1, group: 0 });
    }

    #[test]
    fn test_directory_ties_keep_lowest_group() {
        let allocator = allocator_with(8, &[2, 8, 8, 8], &[50, 7, 9, 9]);
        // group 0 is below the average of 6
        assert_eq!(allocator.allocate(0, true).unwrap().group, 2);
    }

    #[test]
    fn test_directory_ignores_groups_below_average() {
        let allocator = allocator_with(8, &[1, 1, 1, 1], &[1, 1, 1, 1]);
        // the superblock claims far more free inodes than the groups hold
        allocator.state.lock().superblock.free_inodes_count = 40;
        assert!(matches!(allocator.allocate(0, true), Err(FsError::NoSpace)));
        // files still find them
        assert_eq!(allocator.allocate(0, false).unwrap().group, 0);
    }

    #[test]
    fn test_file_probes_at_doubling_offsets() {
        let allocator = allocator_with(8, &[0, 0, 1, 0, 0, 0, 0, 1], &[1; 8]);
        let alloc = allocator.allocate(0, false).unwrap();
        assert_eq!(alloc.group, 2);
        assert_eq!(alloc.ino, 2 * 8 + 7 + 1);
    }

    #[test]
    fn test_file_falls_back_to_linear_scan() {
        // offsets 1, 2 and 4 from group 0 are all full, only group 3 has room
        let allocator = allocator_with(8, &[0, 0, 0, 1, 0, 0, 0, 0], &[1; 8]);
        assert_eq!(allocator.allocate(0, false).unwrap().group, 3);
        assert!(matches!(allocator.allocate(0, false), Err(FsError::NoSpace)));
    }

    #[test]
    fn test_full_bitmap_with_free_count_is_corruption() {
        let allocator = allocator_with(8, &[3, 0], &[1, 1]);
        {
            let mut state = allocator.state.lock();
            for bit in 0..8 {
                state.bitmaps[0].set(bit);
            }
        }
        let groups = allocator.groups();
        let free = allocator.count_free_inodes(false);

        let err = allocator.allocate(0, false).unwrap_err();
        assert!(matches!(err, FsError::CorruptState { group: 0, .. }), "{err}");
        assert_eq!(allocator.groups(), groups);
        assert_eq!(allocator.count_free_inodes(false), free);
        assert!(allocator.write_back().is_empty());
    }

    #[test]
    fn test_reserved_pick_is_corruption_and_leaves_bitmap_untouched() {
        let allocator = InodeAllocator::fresh(&layout(1, 16, 11), 0, 0).unwrap();
        // a reserved inode's bit went missing
        allocator.state.lock().bitmaps[0].clear(4);

        let err = allocator.allocate(0, false).unwrap_err();
        assert!(matches!(err, FsError::CorruptState { group: 0, .. }));
        assert!(!allocator.state.lock().bitmaps[0].test(4));
        assert_eq!(allocator.count_free_inodes(false), 6);
    }

    /// reports the first bit as free no matter what
    struct StuckBitmap(InodeBitmap);

    impl BitmapStore for StuckBitmap {
        fn test(&self, bit: u32) -> bool {
            self.0.test(bit)
        }
        fn set(&mut self, bit: u32) -> bool {
            self.0.set(bit)
        }
        fn clear(&mut self, bit: u32) -> bool {
            self.0.clear(bit)
        }
        fn find_first_zero(&self, _limit: u32) -> u32 {
            0
        }
        fn count_zeros(&self, limit: u32) -> u32 {
            self.0.count_zeros(limit)
        }
        fn as_bytes(&self) -> &[u8] {
            self.0.as_bytes()
        }
    }

    #[test]
    fn test_persistent_bitmap_race_escalates_to_corruption() {
        let layout = layout(2, 8, 1);
        let superblock = SuperBlock::new(&layout, 0, 0);
        let groups = GroupDescriptorTable::new(&layout);
        let bitmaps = (0..2)
            .map(|_| {
                let mut bitmap = InodeBitmap::new(8);
                bitmap.set(0);
                StuckBitmap(bitmap)
            })
            .collect();
        let allocator = InodeAllocator::new(superblock, groups, bitmaps).unwrap();
        let groups = allocator.groups();

        let err = allocator.allocate(0, false).unwrap_err();
        assert!(matches!(err, FsError::CorruptState { .. }), "{err}");
        assert_eq!(allocator.groups(), groups);
    }

    #[test]
    fn test_allocation_queues_its_blocks_once() {
        let allocator = InodeAllocator::fresh(&layout(4, 16, 11), 0, 0).unwrap();
        let a = allocator.allocate(1, false).unwrap();
        let b = allocator.allocate(1, false).unwrap();
        assert_eq!(a.group, b.group);

        let queue = allocator.write_back();
        assert_eq!(queue.len(), 3);
        for block in allocator.touched_blocks(1) {
            assert!(queue.contains(block));
        }
        // the newest bitmap snapshot holds both inodes
        let bitmap = queue.get(allocator.layout().bitmap_block(1)).unwrap();
        assert_eq!(bitmap.kind, DirtyBlock::Bitmap { group: 1 });
        assert_eq!(bitmap.data[0], 0b0000_0011);
        assert_eq!(bitmap.data.len(), 512);
        // 16 inodes take 2 bytes, the padding is zero
        assert!(bitmap.data[2..].iter().all(|b| *b == 0));

        for _ in 0..14 {
            allocator.allocate(1, false).unwrap();
        }
        let bitmap = queue.get(allocator.layout().bitmap_block(1)).unwrap();
        assert_eq!(&bitmap.data[..3], &[0xff, 0xff, 0x00]);
    }

    #[test]
    fn test_free_blocks_hint_steers_directories() {
        let allocator = InodeAllocator::fresh(&layout(4, 16, 1), 0, 0).unwrap();
        allocator.set_free_blocks(3, 9000).unwrap();
        assert_eq!(allocator.allocate(0, true).unwrap().group, 3);
        assert!(allocator
            .write_back()
            .contains(allocator.layout().descriptor_block(3)));
        assert!(allocator.set_free_blocks(4, 1).is_err());
    }

    #[test]
    fn test_check_reports_drift() {
        let allocator = InodeAllocator::fresh(&layout(3, 16, 1), 0, 0).unwrap();
        {
            let mut state = allocator.state.lock();
            state.groups.get_mut(1).unwrap().free_inodes_count = 10;
            state.superblock.free_inodes_count = 47;
        }
        let report = allocator.check();
        assert!(!report.is_consistent());
        assert_eq!(
            report.mismatches,
            vec![GroupMismatch {
                group: 1,
                stored: 10,
                counted: 16
            }]
        );
        assert_eq!(report.superblock_mismatch(), Some((47, 48)));
        assert_eq!(report.descriptor_total, 42);
        // the cross-checked count follows the descriptors
        assert_eq!(allocator.count_free_inodes(true), 42);
        assert_eq!(allocator.count_free_inodes(false), 47);
    }

    #[test]
    fn test_random_sequence_keeps_counters_consistent() {
        let allocator = InodeAllocator::fresh(&layout(5, 24, 11), 0, 0).unwrap();
        let mut live = Vec::new();
        for round in 0..200u32 {
            if round % 3 == 2 && !live.is_empty() {
                let (ino, dir) = live.remove((round as usize * 7) % live.len());
                assert_eq!(allocator.free(ino, dir).unwrap(), FreeOutcome::Freed);
            } else {
                let dir = round % 4 == 0;
                match allocator.allocate(round % 5, dir) {
                    Ok(alloc) => live.push((alloc.ino, dir)),
                    Err(FsError::NoSpace) => {}
                    Err(e) => panic!("unexpected {e}"),
                }
            }
            assert_counters_agree(&allocator);
        }
        let dirs: u32 = allocator.groups().iter().map(|d| d.used_dirs_count).sum();
        assert_eq!(dirs as usize, live.iter().filter(|(_, dir)| *dir).count());
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        let allocator = Arc::new(InodeAllocator::fresh(&layout(8, 64, 11), 0, 0).unwrap());
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let allocator = Arc::clone(&allocator);
                thread::spawn(move || {
                    (0..40)
                        .map(|i| allocator.allocate(t, i % 5 == 0).unwrap().ino)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let inos: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let unique: HashSet<_> = inos.iter().copied().collect();
        assert_eq!(unique.len(), 320);
        assert_eq!(allocator.count_free_inodes(false), 8 * 64 - 10 - 320);
        assert_counters_agree(&allocator);

        let handles: Vec<_> = inos
            .chunks(80)
            .map(|chunk| {
                let allocator = Arc::clone(&allocator);
                let chunk = chunk.to_vec();
                thread::spawn(move || {
                    for ino in chunk {
                        assert_eq!(allocator.free(ino, false).unwrap(), FreeOutcome::Freed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(allocator.count_free_inodes(false), 8 * 64 - 10);
        assert_counters_agree(&allocator);
    }
}
