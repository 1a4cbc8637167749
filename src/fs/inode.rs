use serde::{Deserialize, Serialize};

use crate::utils::{
    self,
    time_util::TimeDurationStruct,
    traits::{DigestInSelf, SerializeAndDigest},
};

use super::{error::Result, filekind::FileKind, N_BLOCKS};

/// an inode record as stored in its inode table slot
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub inode_number: u64,
    pub mode: u16,
    pub file_kind: FileKind,
    pub hard_links: u32,
    /// distinguishes reuses of the same inode number
    pub generation: u32,
    pub file_size: u64,
    pub block_count: u32,
    pub flags: u32,
    pub user_id: libc::uid_t,
    pub group_id: libc::gid_t,
    pub created_at: TimeDurationStruct,
    pub metadata_changed_at: Option<TimeDurationStruct>,
    /// data block pointers, owned by the block allocator
    pub blocks: [u32; N_BLOCKS],
    pub digest: [u8; 32],
    /// metadata changed since the last ctime update
    #[serde(skip)]
    pub ctime_dirty: bool,
}

/// This block is about digest and verify digest
impl DigestInSelf for Node {
    fn digest(&mut self) -> Result<()> {
        self.digest = [0u8; 32];
        self.digest = utils::digest::digest(&*self)?;
        Ok(())
    }

    fn verify_digest(&mut self) -> Result<bool> {
        let current_digest = self.digest;
        self.digest = [0u8; 32];
        let ok = current_digest == utils::digest::digest(&*self)?;
        self.digest = current_digest;
        Ok(ok)
    }
}
// This block is about serialization and deserialization
impl SerializeAndDigest for Node {}

impl Node {
    pub fn new(inode_number: u64) -> Self {
        Node {
            inode_number,
            created_at: utils::time_util::now(),
            // don't calculate digest and other fields now
            ..Node::default()
        }
    }
}

/// This block is about file metadata operations
impl Node {
    pub fn is_regular_file(&self) -> bool {
        (self.mode as libc::mode_t & libc::S_IFMT) == libc::S_IFREG
            && self.file_kind == FileKind::RegularFile
    }

    pub fn is_dir(&self) -> bool {
        (self.mode as libc::mode_t & libc::S_IFMT) == libc::S_IFDIR
            && self.file_kind == FileKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        (self.mode as libc::mode_t & libc::S_IFMT) == libc::S_IFLNK
            && self.file_kind == FileKind::SymbolicLink
    }

    /// set the mode bits, the file kind follows them
    pub fn set_mode(&mut self, mode: u16) {
        self.mode = mode;
        self.file_kind = FileKind::from_mode(mode);
    }

    /// zero whatever a previous owner of this inode number left behind
    /// # Return
    /// `true` if anything had to be zeroed, the node is then marked ctime dirty
    pub fn scrub_stale(&mut self) -> bool {
        let stale =
            self.block_count != 0 || self.file_size != 0 || self.blocks.iter().any(|b| *b != 0);
        if stale {
            self.block_count = 0;
            self.file_size = 0;
            self.blocks = [0u32; N_BLOCKS];
            self.ctime_dirty = true;
        }
        stale
    }

    pub fn update_changed_at(&mut self) {
        self.metadata_changed_at = Some(utils::time_util::now());
        self.ctime_dirty = false;
    }
}
