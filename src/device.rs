//! block devices the filesystem reads bitmaps, descriptors and inode tables from.
//!
//! [MmapDevice] maps an image file like a real block device such as **/dev/sda1**,
//! [MemoryDevice] keeps everything in a `Vec<u8>` and is what unit tests run on.
use std::{
    fs::OpenOptions,
    io::{Error, ErrorKind},
    path::Path,
};

use memmap2::MmapMut;

use crate::fs::error::{FsError, Result};

/// fixed-size block storage
pub trait BlockDevice: Send {
    /// block size in bytes
    fn block_size(&self) -> u32;

    /// total number of blocks
    fn block_count(&self) -> u64;

    /// read block `block` into `buf`, `buf.len()` must equal [block_size](Self::block_size)
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()>;

    /// write `data` to block `block`, `data.len()` must equal [block_size](Self::block_size)
    fn write_block(&mut self, block: u64, data: &[u8]) -> Result<()>;

    /// flush pending writes to stable storage
    fn sync(&mut self) -> Result<()>;
}

fn block_range(block: u64, len: usize, block_size: u32, total: usize) -> Result<(usize, usize)> {
    if len != block_size as usize {
        return Err(FsError::Io(Error::new(
            ErrorKind::InvalidInput,
            format!("buffer of {len} bytes for a {block_size} byte block"),
        )));
    }
    let start = block
        .checked_mul(block_size as u64)
        .and_then(|s| usize::try_from(s).ok())
        .filter(|s| s + len <= total)
        .ok_or_else(|| {
            FsError::Io(Error::new(
                ErrorKind::UnexpectedEof,
                format!("block {block} is beyond the end of the device"),
            ))
        })?;
    Ok((start, start + len))
}

/// a block device backed by a memory mapped image file
#[derive(Debug)]
pub struct MmapDevice {
    mmap: MmapMut,
    block_size: u32,
}

impl MmapDevice {
    /// open an existing image file for read and write
    pub fn open<P>(image_path: P, block_size: u32) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(image_path.as_ref())?;
        // Safety
        // This method returns an error when the underlying system call fails,
        // which can happen for a variety of reasons,
        // such as when the file is not open with read and write permissions.
        // from https://docs.rs/memmap2/0.5.10/memmap2/struct.MmapMut.html
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { mmap, block_size })
    }

    /// read the block size stored in an image's superblock without mounting it
    pub fn probe_block_size<P>(image_path: P) -> Result<u32>
    where
        P: AsRef<Path>,
    {
        let file = OpenOptions::new().read(true).open(image_path.as_ref())?;
        // Safety: see [MmapDevice::open], the map is read only and dropped right away
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        crate::fs::SuperBlock::peek_block_size(&mmap)
    }
}

impl BlockDevice for MmapDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.mmap.len() as u64 / self.block_size as u64
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        let (start, end) = block_range(block, buf.len(), self.block_size, self.mmap.len())?;
        buf.copy_from_slice(&self.mmap[start..end]);
        Ok(())
    }

    fn write_block(&mut self, block: u64, data: &[u8]) -> Result<()> {
        let (start, end) = block_range(block, data.len(), self.block_size, self.mmap.len())?;
        self.mmap[start..end].copy_from_slice(data);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(self.mmap.flush()?)
    }
}

/// a block device living entirely in memory
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    data: Vec<u8>,
    block_size: u32,
    writes: u64,
}

impl MemoryDevice {
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            data: vec![0; (block_size as u64 * block_count) as usize],
            block_size,
            writes: 0,
        }
    }

    /// number of block writes issued so far
    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl BlockDevice for MemoryDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.data.len() as u64 / self.block_size as u64
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        let (start, end) = block_range(block, buf.len(), self.block_size, self.data.len())?;
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_block(&mut self, block: u64, data: &[u8]) -> Result<()> {
        let (start, end) = block_range(block, data.len(), self.block_size, self.data.len())?;
        self.data[start..end].copy_from_slice(data);
        self.writes += 1;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}
