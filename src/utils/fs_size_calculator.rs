//! This module contains functions to calculate the size of differennt fs components

use crate::fs::{GROUP_DESC_SIZE, INODE_SIZE};

/// calculate needed bitmap size in bytes
/// # Arguments
/// - `element_count`: the number of bits
/// # Example
/// ```
/// use groupfs::utils::fs_size_calculator::bitmap_size;
/// assert_eq!(bitmap_size(100), 13);
/// ```
pub const fn bitmap_size(element_count: u32) -> u64 {
    element_count.div_ceil(8) as u64
}

/// calculate how many blocks the group descriptor table occupies
/// # Example
/// ```
/// use groupfs::utils::fs_size_calculator::descriptor_table_blocks;
/// // 16 descriptors of 32 bytes fit in one 512 byte block
/// assert_eq!(descriptor_table_blocks(16, 512), 1);
/// assert_eq!(descriptor_table_blocks(17, 512), 2);
/// ```
pub const fn descriptor_table_blocks(groups: u32, block_size: u32) -> u64 {
    (groups as u64 * GROUP_DESC_SIZE as u64).div_ceil(block_size as u64)
}

/// calculate how many blocks one group's inode table occupies
/// # Example
/// ```
/// use groupfs::utils::fs_size_calculator::inode_table_blocks;
/// use groupfs::INODE_SIZE;
/// let block_size = 1024;
/// assert_eq!(inode_table_blocks(8, block_size), 2);
/// assert_eq!(inode_table_blocks(9, block_size), (9 * INODE_SIZE as u64).div_ceil(1024));
/// ```
pub const fn inode_table_blocks(inodes_per_group: u32, block_size: u32) -> u64 {
    (inodes_per_group as u64 * INODE_SIZE as u64).div_ceil(block_size as u64)
}

/// caculate block group size in blocks: one inode bitmap block plus the inode table
/// # Example
/// ```
/// use groupfs::utils::fs_size_calculator::group_span_blocks;
/// assert_eq!(group_span_blocks(8, 512), 1 + 4);
/// ```
pub const fn group_span_blocks(inodes_per_group: u32, block_size: u32) -> u64 {
    1 + inode_table_blocks(inodes_per_group, block_size)
}

/// calculate the block count of a whole image:
/// superblock, descriptor table and every block group
/// # Example
/// ```
/// use groupfs::utils::fs_size_calculator::image_blocks;
/// // 1 superblock + 1 descriptor block + 4 * (1 bitmap + 4 table blocks)
/// assert_eq!(image_blocks(4, 8, 512), 22);
/// ```
pub const fn image_blocks(groups: u32, inodes_per_group: u32, block_size: u32) -> u64 {
    1 + descriptor_table_blocks(groups, block_size)
        + groups as u64 * group_span_blocks(inodes_per_group, block_size)
}

/// calculate the byte size of a whole image
pub const fn image_size(groups: u32, inodes_per_group: u32, block_size: u32) -> u64 {
    image_blocks(groups, inodes_per_group, block_size) * block_size as u64
}
