use log::warn;
use serde::{Deserialize, Serialize};

use crate::device::BlockDevice;

use super::{
    error::{FsError, Result},
    FsLayout, GROUP_DESC_SIZE,
};

/// per-group metadata, one 32 byte slot in the descriptor table
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupDescriptor {
    pub group_index: u32,
    /// inode bitmap block, never shared with another group
    pub bitmap_block: u64,
    pub inode_table_block: u64,
    /// maintained by the block allocator, used here as a data locality hint
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub used_dirs_count: u32,
}

impl GroupDescriptor {
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::legacy())
            .map_err(|e| FsError::Codec(e.to_string()))
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        bincode::serde::decode_from_slice(raw, bincode::config::legacy())
            .map(|(desc, _)| desc)
            .map_err(|e| FsError::Codec(e.to_string()))
    }
}

/// all group descriptors, loaded once at mount and mutated in place
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupDescriptorTable {
    descriptors: Vec<GroupDescriptor>,
}

/// construction
impl GroupDescriptorTable {
    /// descriptors of a freshly formatted filesystem
    pub fn new(layout: &FsLayout) -> Self {
        let descriptors = (0..layout.groups)
            .map(|g| GroupDescriptor {
                group_index: g,
                bitmap_block: layout.bitmap_block(g),
                inode_table_block: layout.inode_table_block(g),
                free_blocks_count: layout.blocks_per_group,
                free_inodes_count: layout.inodes_per_group - layout.reserved_in_group(g),
                used_dirs_count: 0,
            })
            .collect();
        Self { descriptors }
    }

    pub fn from_descriptors(descriptors: Vec<GroupDescriptor>) -> Self {
        Self { descriptors }
    }
}

/// lookup
impl GroupDescriptorTable {
    #[inline]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    #[inline]
    pub fn get(&self, group: u32) -> Option<&GroupDescriptor> {
        self.descriptors.get(group as usize)
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, group: u32) -> Option<&mut GroupDescriptor> {
        self.descriptors.get_mut(group as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GroupDescriptor> {
        self.descriptors.iter()
    }

    /// sum of every group's stored free inode count
    pub fn free_inodes_total(&self) -> u64 {
        self.iter().map(|d| d.free_inodes_count as u64).sum()
    }
}

/// for serialize and deserialize
impl GroupDescriptorTable {
    /// render the `nth` block of the descriptor table
    pub fn encode_block(&self, layout: &FsLayout, nth: u64) -> Result<Vec<u8>> {
        let per_block = layout.descriptors_per_block() as usize;
        let mut block = vec![0u8; layout.block_size as usize];
        let first = nth as usize * per_block;
        for (slot, desc) in self.descriptors.iter().skip(first).take(per_block).enumerate() {
            let raw = desc.encode()?;
            let start = slot * GROUP_DESC_SIZE as usize;
            block[start..start + raw.len()].copy_from_slice(&raw);
        }
        Ok(block)
    }

    pub fn write_to<D>(&self, dev: &mut D, layout: &FsLayout) -> Result<()>
    where
        D: BlockDevice + ?Sized,
    {
        for nth in 0..layout.descriptor_blocks() {
            dev.write_block(layout.descriptor_table_start() + nth, &self.encode_block(layout, nth)?)?;
        }
        Ok(())
    }

    pub fn read_from<D>(dev: &D, layout: &FsLayout) -> Result<Self>
    where
        D: BlockDevice + ?Sized,
    {
        let mut descriptors = Vec::with_capacity(layout.groups as usize);
        let mut buf = vec![0u8; layout.block_size as usize];
        let slot = GROUP_DESC_SIZE as usize;

        for nth in 0..layout.descriptor_blocks() {
            dev.read_block(layout.descriptor_table_start() + nth, &mut buf)?;
            for raw in buf.chunks_exact(slot) {
                if descriptors.len() == layout.groups as usize {
                    break;
                }
                let desc = GroupDescriptor::decode(raw)?;
                let expected = descriptors.len() as u32;
                if desc.group_index != expected {
                    return Err(FsError::Format(format!(
                        "descriptor slot {expected} holds group {}",
                        desc.group_index
                    )));
                }
                if desc.bitmap_block != layout.bitmap_block(expected) {
                    return Err(FsError::Format(format!(
                        "group {expected} bitmap at block {}, expected {}",
                        desc.bitmap_block,
                        layout.bitmap_block(expected)
                    )));
                }
                if desc.free_inodes_count > layout.inodes_per_group {
                    // loaded anyway, the consistency check reports it
                    warn!(
                        "group {expected} claims {} free inodes out of {}",
                        desc.free_inodes_count, layout.inodes_per_group
                    );
                }
                descriptors.push(desc);
            }
        }

        Ok(Self { descriptors })
    }
}
