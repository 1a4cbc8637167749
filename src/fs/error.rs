//! error types of the inode allocation subsystem
use thiserror::Error;

/// errors surfaced to callers of this filesystem
#[derive(Debug, Error)]
pub enum FsError {
    /// no qualifying group or free bit was found, nothing was mutated
    #[error("no free inode left on device")]
    NoSpace,

    /// bitmap and free counters disagree, or a computed inode number
    /// is out of range
    #[error("corrupt allocation state in group {group}: {detail}")]
    CorruptState { group: u32, detail: String },

    /// underlying device error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// image layout or geometry is invalid (mount time)
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// encode/decode of an on-disk structure failed
    #[error("codec error: {0}")]
    Codec(String),
}

impl FsError {
    pub(crate) fn corrupt(group: u32, detail: impl Into<String>) -> Self {
        FsError::CorruptState {
            group,
            detail: detail.into(),
        }
    }

    /// map an error to the errno a kernel-facing caller should see
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            FsError::NoSpace => libc::ENOSPC,
            FsError::CorruptState { .. } => libc::EIO,
            FsError::Io(_) => libc::EIO,
            FsError::Format(_) => libc::EINVAL,
            FsError::Codec(_) => libc::EIO,
        }
    }
}

/// result type of this filesystem
pub type Result<T> = std::result::Result<T, FsError>;

/// local anomalies that are logged and recovered from, never raised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anomaly {
    /// a bit was already set on allocation, or already clear on free
    BitmapRace { ino: u64 },
    /// free was requested for a reserved or nonexistent inode number
    ReservedInodeAccess { ino: u64 },
}
