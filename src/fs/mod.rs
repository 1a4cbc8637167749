//! our block-group filesystem and its inode allocator
pub mod allocator;
pub mod bitmap;
pub mod block_group;
pub mod error;
pub mod filekind;
pub mod fs_layout;
pub mod inode;
pub mod node_store;
pub mod superblock;
pub mod write_back;
pub use allocator::*;
pub use bitmap::*;
pub use block_group::*;
pub use error::{Anomaly, FsError};
pub use filekind::*;
pub use fs_layout::*;
pub use inode::*;
pub use node_store::*;
pub use superblock::*;
pub use write_back::*;

const FS_MAGIC: u32 = 0x4752_5046;
pub const INODE_SIZE: u32 = 256;
pub const GROUP_DESC_SIZE: u32 = 32;
pub const DEFAULT_FIRST_INODE: u32 = 11;
/// retry floor for allocations on filesystems with very few groups
const MIN_ALLOC_RETRIES: u32 = 4;
/// block pointers per inode
pub const N_BLOCKS: usize = 15;
