use serde::{Deserialize, Serialize};

use crate::utils::{
    digest,
    time_util::{self, *},
    traits::{DigestInSelf, SerializeAndDigest},
};

use super::{
    error::{FsError, Result},
    FsLayout, FS_MAGIC,
};

type InodeCountType = u64;
/// The superblock of this filesystem
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SuperBlock {
    /// magic number
    pub magic: u32,
    /// block size, every on-disk structure is addressed in these units
    pub block_size: u32,
    pub created_at: TimeDurationStruct,
    pub modified_at: Option<TimeDurationStruct>,
    pub last_mounted_at: Option<TimeDurationStruct>,
    /// total addressable inode numbers, `groups * inodes_per_group`
    pub inodes_count: InodeCountType,
    pub free_inodes_count: InodeCountType,
    pub inodes_per_group: u32,
    /// smallest inode number that may be handed out
    pub first_valid_inode: u32,
    pub groups: u32,
    /// data blocks each group starts with, owned by the block allocator
    pub blocks_per_group: u32,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    /// to verify the integrity of this superblock
    /// intend to use a fast secure hash function,like [blake3]
    pub digest: [u8; 32],
}
impl SuperBlock {
    pub fn new(layout: &FsLayout, uid: u32, gid: u32) -> Self {
        let inodes_count = layout.inodes_count();
        Self {
            magic: FS_MAGIC,
            block_size: layout.block_size,
            created_at: time_util::now(),
            modified_at: None,
            last_mounted_at: None,
            inodes_count,
            // reserved inodes are never free
            free_inodes_count: inodes_count - (layout.first_valid_inode as u64 - 1),
            inodes_per_group: layout.inodes_per_group,
            first_valid_inode: layout.first_valid_inode,
            groups: layout.groups,
            blocks_per_group: layout.blocks_per_group,
            uid,
            gid,
            digest: [0u8; 32],
        }
    }

    /// geometry recorded in this superblock
    pub fn layout(&self) -> FsLayout {
        FsLayout {
            block_size: self.block_size,
            groups: self.groups,
            inodes_per_group: self.inodes_per_group,
            first_valid_inode: self.first_valid_inode,
            blocks_per_group: self.blocks_per_group,
        }
    }

    /// check magic and geometry of a superblock read from disk
    pub fn validate(&self) -> Result<FsLayout> {
        if self.magic != FS_MAGIC {
            return Err(FsError::Format(format!(
                "bad magic {:#x}, expected {FS_MAGIC:#x}",
                self.magic
            )));
        }
        let layout = self.layout();
        layout.validate()?;
        if self.inodes_count != layout.inodes_count() {
            return Err(FsError::Format(format!(
                "inodes_count {} does not match {} groups of {} inodes",
                self.inodes_count, self.groups, self.inodes_per_group
            )));
        }
        if self.free_inodes_count > self.inodes_count {
            return Err(FsError::Format(format!(
                "free_inodes_count {} exceeds inodes_count {}",
                self.free_inodes_count, self.inodes_count
            )));
        }
        Ok(layout)
    }

    /// render this superblock as a whole block
    pub fn encode_block(&mut self) -> Result<Vec<u8>> {
        let mut block = self.serialize_to_vec()?;
        if block.len() > self.block_size as usize {
            return Err(FsError::Codec(format!(
                "superblock needs {} bytes, block is {}",
                block.len(),
                self.block_size
            )));
        }
        block.resize(self.block_size as usize, 0);
        Ok(block)
    }

    /// decode and verify a superblock from the first block of a device
    pub fn decode_block(buf: &[u8]) -> Result<Self> {
        let (superblock, _) = Self::deserialize_from_slice(buf)?;
        Ok(superblock)
    }

    /// read `block_size` from the raw head of an image without decoding the rest
    pub fn peek_block_size(raw: &[u8]) -> Result<u32> {
        let field = |range: std::ops::Range<usize>| -> Result<u32> {
            raw.get(range)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
                .ok_or_else(|| FsError::Format("image too small for a superblock".into()))
        };
        let magic = field(0..4)?;
        if magic != FS_MAGIC {
            return Err(FsError::Format(format!("bad magic {magic:#x}")));
        }
        let block_size = field(4..8)?;
        FsLayout::validate_block_size(block_size)?;
        Ok(block_size)
    }
}
impl SuperBlock {
    pub fn update_last_mounted_at(&mut self) {
        self.last_mounted_at = Some(time_util::now());
    }

    pub fn update_modified_at(&mut self) {
        self.modified_at = Some(time_util::now());
    }
}

impl DigestInSelf for SuperBlock {
    fn digest(&mut self) -> Result<()> {
        self.digest = [0u8; 32];
        self.digest = digest::digest(&*self)?;
        Ok(())
    }

    fn verify_digest(&mut self) -> Result<bool> {
        // get digest from itself
        let digest = self.digest;
        // clear the digest from struct
        self.digest = [0u8; 32];
        // calulate the digest
        let digest2 = digest::digest(&*self)?;
        // verify
        let ok = digest == digest2;
        // store newest digest to itself
        self.digest = digest2;
        // return verify result
        Ok(ok)
    }
}

impl SerializeAndDigest for SuperBlock {}
