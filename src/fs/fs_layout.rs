//! what does our filesystem look like on the device and in the memory
//!
//! an image has the following layout, in blocks:
//! - superblock
//! - group descriptor table
//! - block groups, each one inode bitmap block followed by its inode table
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    device::BlockDevice,
    utils::{
        fs_size_calculator,
        time_util::{Clock, SystemClock},
    },
};

use super::{
    allocator::{ConsistencyReport, FreeOutcome, InodeAlloc, InodeAllocator},
    bitmap::InodeBitmap,
    block_group::GroupDescriptorTable,
    error::{FsError, Result},
    filekind::FileKind,
    node_store::{InodeTable, NodeStore},
    superblock::SuperBlock,
    Node, GROUP_DESC_SIZE, INODE_SIZE,
};

/// geometry of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsLayout {
    pub block_size: u32,
    pub groups: u32,
    pub inodes_per_group: u32,
    /// inode numbers below this one are reserved
    pub first_valid_inode: u32,
    /// handed to the block allocator as each group's initial free block count
    pub blocks_per_group: u32,
}

impl FsLayout {
    /// block sizes are powers of two in `512..=65536`
    pub fn validate_block_size(bs: u32) -> Result<()> {
        if !bs.is_power_of_two() || !(512..=65536).contains(&bs) {
            return Err(FsError::Format(format!(
                "block size {bs} is not a power of two in 512..=65536"
            )));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let bs = self.block_size;
        Self::validate_block_size(bs)?;
        if self.groups == 0 {
            return Err(FsError::Format("an image needs at least one group".into()));
        }
        let ipg = self.inodes_per_group;
        if ipg == 0 || ipg % 8 != 0 || ipg as u64 > bs as u64 * 8 {
            return Err(FsError::Format(format!(
                "{ipg} inodes per group must be a positive multiple of 8 \
                 fitting one {bs} byte bitmap block"
            )));
        }
        if self.first_valid_inode == 0 || self.first_valid_inode as u64 > self.inodes_count() {
            return Err(FsError::Format(format!(
                "first valid inode {} outside 1..={}",
                self.first_valid_inode,
                self.inodes_count()
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn inodes_count(&self) -> u64 {
        self.groups as u64 * self.inodes_per_group as u64
    }

    /// blocks of the whole image
    pub fn total_blocks(&self) -> u64 {
        fs_size_calculator::image_blocks(self.groups, self.inodes_per_group, self.block_size)
    }
}

/// descriptor table addressing
impl FsLayout {
    #[inline]
    pub fn descriptors_per_block(&self) -> u32 {
        self.block_size / GROUP_DESC_SIZE
    }

    #[inline]
    pub fn descriptor_blocks(&self) -> u64 {
        fs_size_calculator::descriptor_table_blocks(self.groups, self.block_size)
    }

    #[inline]
    pub fn descriptor_table_start(&self) -> u64 {
        1
    }

    /// index within the descriptor table of the block holding `group`'s descriptor
    #[inline]
    pub fn descriptor_nth(&self, group: u32) -> u64 {
        (group / self.descriptors_per_block()) as u64
    }

    /// absolute block holding `group`'s descriptor
    #[inline]
    pub fn descriptor_block(&self, group: u32) -> u64 {
        self.descriptor_table_start() + self.descriptor_nth(group)
    }
}

/// group addressing
impl FsLayout {
    fn group_start(&self, group: u32) -> u64 {
        self.descriptor_table_start()
            + self.descriptor_blocks()
            + group as u64
                * fs_size_calculator::group_span_blocks(self.inodes_per_group, self.block_size)
    }

    #[inline]
    pub fn bitmap_block(&self, group: u32) -> u64 {
        self.group_start(group)
    }

    #[inline]
    pub fn inode_table_block(&self, group: u32) -> u64 {
        self.group_start(group) + 1
    }

    #[inline]
    pub fn inode_table_blocks(&self) -> u64 {
        fs_size_calculator::inode_table_blocks(self.inodes_per_group, self.block_size)
    }

    /// how many of `group`'s inode numbers lie below `first_valid_inode`
    pub fn reserved_in_group(&self, group: u32) -> u32 {
        let reserved = self.first_valid_inode as u64 - 1;
        let before = group as u64 * self.inodes_per_group as u64;
        reserved
            .saturating_sub(before)
            .min(self.inodes_per_group as u64) as u32
    }
}

/// inode number addressing, numbers start at 1
impl FsLayout {
    #[inline]
    pub fn is_valid_inode(&self, ino: u64) -> bool {
        ino >= self.first_valid_inode as u64 && ino <= self.inodes_count()
    }

    /// group holding `ino`, clamped to `u32::MAX` for garbage numbers
    pub fn inode_group(&self, ino: u64) -> u32 {
        let group = ino.saturating_sub(1) / self.inodes_per_group as u64;
        group.min(u32::MAX as u64) as u32
    }

    /// `(group, bit)` of `ino`
    pub fn inode_location(&self, ino: u64) -> (u32, u32) {
        let index = ino.saturating_sub(1);
        let ipg = self.inodes_per_group as u64;
        (self.inode_group(ino), (index % ipg) as u32)
    }

    #[inline]
    pub fn inode_number(&self, group: u32, bit: u32) -> u64 {
        group as u64 * self.inodes_per_group as u64 + bit as u64 + 1
    }

    /// `(block, byte offset)` of `ino`'s record in its inode table
    pub fn inode_slot(&self, ino: u64) -> (u64, usize) {
        let (group, bit) = self.inode_location(ino);
        let per_block = self.block_size / INODE_SIZE;
        let block = self.inode_table_block(group) + (bit / per_block) as u64;
        (block, ((bit % per_block) * INODE_SIZE) as usize)
    }
}

/// a mounted image: the allocator state plus the device it was loaded from
pub struct GroupFs<D> {
    allocator: InodeAllocator,
    device: Mutex<D>,
    /// last generation number handed out
    next_generation: Mutex<u32>,
    clock: Box<dyn Clock>,
}

impl<D> std::fmt::Debug for GroupFs<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupFs")
            .field("layout", self.allocator.layout())
            .field("next_generation", &*self.next_generation.lock())
            .finish_non_exhaustive()
    }
}

impl<D> GroupFs<D>
where
    D: BlockDevice,
{
    /// mount a formatted device, generation numbers follow the system clock
    pub fn open(dev: D) -> Result<Self> {
        Self::open_with_clock(dev, SystemClock)
    }

    pub fn open_with_clock<C>(dev: D, clock: C) -> Result<Self>
    where
        C: Clock + 'static,
    {
        let mut buf = vec![0u8; dev.block_size() as usize];
        dev.read_block(0, &mut buf)?;
        let superblock = SuperBlock::decode_block(&buf)?;
        let layout = superblock.validate()?;
        if layout.block_size != dev.block_size() {
            return Err(FsError::Format(format!(
                "superblock says {} byte blocks, device has {}",
                layout.block_size,
                dev.block_size()
            )));
        }
        if dev.block_count() < layout.total_blocks() {
            return Err(FsError::Format(format!(
                "image needs {} blocks, device has {}",
                layout.total_blocks(),
                dev.block_count()
            )));
        }

        let groups = GroupDescriptorTable::read_from(&dev, &layout)?;
        let bitmaps = (0..layout.groups)
            .map(|g| -> Result<InodeBitmap> {
                dev.read_block(layout.bitmap_block(g), &mut buf)?;
                Ok(InodeBitmap::from_bytes(&buf, layout.inodes_per_group))
            })
            .collect::<Result<Vec<_>>>()?;

        let allocator = InodeAllocator::new(superblock, groups, bitmaps)?;
        allocator.note_mounted()?;
        let report = allocator.check();
        if !report.is_consistent() {
            warn!(
                "free inode counters drifted: {} group(s) disagree with their bitmaps, \
                 superblock {} vs bitmaps {}",
                report.mismatches.len(),
                report.superblock_stored,
                report.bitmap_total
            );
        }
        info!(
            "mounted {} groups of {} inodes, {} free",
            layout.groups,
            layout.inodes_per_group,
            allocator.count_free_inodes(false)
        );

        Ok(Self {
            allocator,
            device: Mutex::new(dev),
            next_generation: Mutex::new(0),
            clock: Box::new(clock),
        })
    }

    #[inline]
    pub fn layout(&self) -> &FsLayout {
        self.allocator.layout()
    }

    #[inline]
    pub fn allocator(&self) -> &InodeAllocator {
        &self.allocator
    }

    /// write every queued metadata block and sync the device
    pub fn sync(&self) -> Result<usize> {
        let mut dev = self.device.lock();
        self.allocator.write_back().flush(&mut *dev)
    }

    /// sync, then give the device back
    pub fn into_device(self) -> Result<D> {
        self.sync()?;
        Ok(self.device.into_inner())
    }
}

/// [Node] operations
impl<D> GroupFs<D>
where
    D: BlockDevice,
{
    /// allocate an inode number near `parent` and set up its record
    ///
    /// the blocks the allocation dirtied are on the device when this returns
    pub fn allocate_node(&self, parent: &Node, mode: u16) -> Result<Node> {
        let layout = *self.layout();
        let is_dir = FileKind::from_mode(mode) == FileKind::Directory;
        let InodeAlloc { ino, group } = self
            .allocator
            .allocate(layout.inode_group(parent.inode_number), is_dir)?;
        let generation = self.next_generation();

        let mut dev = self.device.lock();
        let stored = {
            let mut table = InodeTable::new(&mut *dev, &layout);
            Self::init_node(&mut table, ino, mode, generation)
        };
        let node = match stored {
            Ok(node) => node,
            Err(e) => {
                drop(dev);
                warn!("could not set up inode {ino}, releasing it: {e}");
                self.allocator.free(ino, is_dir)?;
                return Err(e);
            }
        };
        self.allocator
            .write_back()
            .flush_blocks(&mut *dev, &self.allocator.touched_blocks(group))?;
        debug!("allocated node {ino} with generation {generation} in group {group}");
        Ok(node)
    }

    fn init_node<S>(store: &mut S, ino: u64, mode: u16, generation: u32) -> Result<Node>
    where
        S: NodeStore,
    {
        let mut node = store.fetch_or_create(ino)?;
        if node.scrub_stale() {
            debug!("inode {ino} still had content from a previous owner");
        }
        node.flags = 0;
        node.set_mode(mode);
        node.generation = generation;
        if node.ctime_dirty {
            node.update_changed_at();
        }
        store.persist(&mut node)?;
        Ok(node)
    }

    /// `counter + 1`, raised to the current second so that numbers never
    /// repeat across mounts
    fn next_generation(&self) -> u32 {
        let mut counter = self.next_generation.lock();
        let next = counter.wrapping_add(1).max(self.clock.now_secs());
        *counter = next;
        next
    }

    pub fn free_node(&self, node: &Node) -> Result<FreeOutcome> {
        self.allocator.free(node.inode_number, node.is_dir())
    }

    /// the record of an allocated inode, `None` if `ino` is free or invalid
    pub fn find_node(&self, ino: u64) -> Result<Option<Node>> {
        if !self.allocator.is_allocated(ino) {
            return Ok(None);
        }
        let dev = self.device.lock();
        InodeTable::load(&*dev, self.layout(), ino)
    }
}

/// delegated to the [InodeAllocator]
impl<D> GroupFs<D>
where
    D: BlockDevice,
{
    pub fn count_free_inodes(&self, cross_check: bool) -> u64 {
        self.allocator.count_free_inodes(cross_check)
    }

    pub fn check(&self) -> ConsistencyReport {
        self.allocator.check()
    }

    /// hook for the block allocator to publish a group's free block count
    pub fn set_free_blocks(&self, group: u32, free_blocks: u32) -> Result<()> {
        self.allocator.set_free_blocks(group, free_blocks)
    }
}
