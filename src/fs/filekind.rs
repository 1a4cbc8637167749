use serde::{Deserialize, Serialize};

/// an enum to describe the type of a file
#[derive(Serialize, Deserialize, Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum FileKind {
    /// an regular file
    RegularFile,
    /// a directory
    Directory,
    /// a symbolic link
    SymbolicLink,
    /// device nodes, fifos and sockets
    #[default]
    Unknown,
}

impl FileKind {
    /// kind encoded in the `S_IFMT` bits of `mode`
    pub fn from_mode(mode: u16) -> Self {
        match mode as libc::mode_t & libc::S_IFMT {
            libc::S_IFREG => FileKind::RegularFile,
            libc::S_IFDIR => FileKind::Directory,
            libc::S_IFLNK => FileKind::SymbolicLink,
            _ => FileKind::Unknown,
        }
    }
}
