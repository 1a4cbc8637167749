//! open an image file and run single operations against it
use std::{fmt, path::Path};

use byte_unit::Byte;
use log::debug;

use crate::{
    device::MmapDevice,
    fs::{ConsistencyReport, FreeOutcome, FsLayout, GroupFs, Node},
};

/// load the image at `image_path`, its block size is read from the superblock
pub fn mount<P>(image_path: P) -> anyhow::Result<GroupFs<MmapDevice>>
where
    P: AsRef<Path>,
{
    let block_size = MmapDevice::probe_block_size(image_path.as_ref())?;
    let dev = MmapDevice::open(image_path.as_ref(), block_size)?;
    Ok(GroupFs::open(dev)?)
}

/// what `stat` reports about an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageStat {
    pub layout: FsLayout,
    pub free_inodes: u64,
    pub used_dirs: u64,
}

impl fmt::Display for ImageStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let layout = &self.layout;
        let size = layout.total_blocks() * layout.block_size as u64;
        writeln!(
            f,
            "image size:        {}",
            Byte::from_bytes(size as _).get_appropriate_unit(true)
        )?;
        writeln!(f, "block size:        {}", layout.block_size)?;
        writeln!(f, "groups:            {}", layout.groups)?;
        writeln!(f, "inodes per group:  {}", layout.inodes_per_group)?;
        writeln!(f, "first valid inode: {}", layout.first_valid_inode)?;
        writeln!(f, "inodes:            {}", layout.inodes_count())?;
        writeln!(f, "directories:       {}", self.used_dirs)?;
        write!(f, "free inodes:       {}", self.free_inodes)
    }
}

pub fn stat<P>(image_path: P, cross_check: bool) -> anyhow::Result<ImageStat>
where
    P: AsRef<Path>,
{
    let fs = mount(image_path)?;
    let used_dirs = fs
        .allocator()
        .groups()
        .iter()
        .map(|d| d.used_dirs_count as u64)
        .sum();
    Ok(ImageStat {
        layout: *fs.layout(),
        free_inodes: fs.count_free_inodes(cross_check),
        used_dirs,
    })
}

pub fn check<P>(image_path: P) -> anyhow::Result<ConsistencyReport>
where
    P: AsRef<Path>,
{
    Ok(mount(image_path)?.check())
}

/// allocate a regular file or a directory near `parent` and persist it
pub fn alloc<P>(image_path: P, parent: u64, dir: bool) -> anyhow::Result<Node>
where
    P: AsRef<Path>,
{
    let fs = mount(image_path)?;
    let parent = match fs.find_node(parent)? {
        Some(node) => node,
        None => {
            debug!("inode {parent} is not allocated, using it as a placement hint only");
            Node::new(parent)
        }
    };
    let mode = if dir {
        libc::S_IFDIR as u16 | 0o755
    } else {
        libc::S_IFREG as u16 | 0o644
    };
    let node = fs.allocate_node(&parent, mode)?;
    fs.sync()?;
    Ok(node)
}

pub fn free<P>(image_path: P, inode: u64, dir: bool) -> anyhow::Result<FreeOutcome>
where
    P: AsRef<Path>,
{
    let fs = mount(image_path)?;
    let outcome = fs.allocator().free(inode, dir)?;
    fs.sync()?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fs::Anomaly,
        mkfs::{mkfs, MkfsOptions},
    };

    fn image(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("fs.img");
        let options = MkfsOptions {
            groups: 4,
            inodes_per_group: 64,
            block_size: 2048,
            ..MkfsOptions::default()
        };
        mkfs(&path, &options).unwrap();
        path
    }

    #[test]
    fn test_alloc_free_cycle_on_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = image(&dir);
        assert_eq!(stat(&path, false).unwrap().free_inodes, 246);

        let top = alloc(&path, 1, true).unwrap();
        assert!(top.is_dir());
        let file = alloc(&path, top.inode_number, false).unwrap();
        assert!(file.is_regular_file());
        // files follow their parent directory
        assert_eq!(
            file.inode_number.saturating_sub(1) / 64,
            top.inode_number.saturating_sub(1) / 64
        );

        let stat = stat(&path, true).unwrap();
        assert_eq!(stat.free_inodes, 244);
        assert_eq!(stat.used_dirs, 1);
        assert!(check(&path).unwrap().is_consistent());

        assert_eq!(free(&path, file.inode_number, false).unwrap(), FreeOutcome::Freed);
        assert_eq!(
            free(&path, file.inode_number, false).unwrap(),
            FreeOutcome::Ignored(Anomaly::BitmapRace {
                ino: file.inode_number
            })
        );
        assert_eq!(
            free(&path, 3, false).unwrap(),
            FreeOutcome::Ignored(Anomaly::ReservedInodeAccess { ino: 3 })
        );
        assert_eq!(stat_free(&path), 245);
    }

    fn stat_free(path: &Path) -> u64 {
        stat(path, false).unwrap().free_inodes
    }

    #[test]
    fn test_stat_display() {
        let dir = tempfile::tempdir().unwrap();
        let path = image(&dir);
        let text = stat(&path, false).unwrap().to_string();
        assert!(text.contains("groups:            4"));
        assert!(text.contains("free inodes:       246"));
    }

    #[test]
    fn test_mount_missing_image() {
        let dir = tempfile::tempdir().unwrap();
        assert!(mount(dir.path().join("missing.img")).is_err());
    }
}
