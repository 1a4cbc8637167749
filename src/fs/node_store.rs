//! [Node] records in the per-group inode tables
use log::warn;

use crate::{device::BlockDevice, utils::traits::SerializeAndDigest};

use super::{
    error::{FsError, Result},
    FsLayout, Node, INODE_SIZE,
};

/// fetch-or-create and persist of inode records
pub trait NodeStore {
    /// the record stored for `ino`, or a new one if the slot was never written
    fn fetch_or_create(&mut self, ino: u64) -> Result<Node>;

    /// write `node` back to its slot
    fn persist(&mut self, node: &mut Node) -> Result<()>;
}

/// [NodeStore] over the inode tables of a [BlockDevice]
pub struct InodeTable<'a, D: ?Sized> {
    dev: &'a mut D,
    layout: &'a FsLayout,
}

impl<'a, D> InodeTable<'a, D>
where
    D: BlockDevice + ?Sized,
{
    pub fn new(dev: &'a mut D, layout: &'a FsLayout) -> Self {
        Self { dev, layout }
    }

    /// read the record of `ino` without a mutable device
    /// # Return
    /// `None` if the slot was never written
    pub fn load(dev: &D, layout: &FsLayout, ino: u64) -> Result<Option<Node>> {
        let (block, offset) = slot_of(layout, ino)?;
        let mut buf = vec![0u8; layout.block_size as usize];
        dev.read_block(block, &mut buf)?;
        let slot = &buf[offset..offset + INODE_SIZE as usize];
        if slot.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        let (node, _) = Node::deserialize_from_slice(slot)?;
        Ok(Some(node))
    }
}

fn slot_of(layout: &FsLayout, ino: u64) -> Result<(u64, usize)> {
    if ino == 0 || ino > layout.inodes_count() {
        return Err(FsError::corrupt(
            layout.inode_group(ino),
            format!("inode {ino} has no table slot"),
        ));
    }
    Ok(layout.inode_slot(ino))
}

impl<'a, D> NodeStore for InodeTable<'a, D>
where
    D: BlockDevice + ?Sized,
{
    fn fetch_or_create(&mut self, ino: u64) -> Result<Node> {
        match Self::load(&*self.dev, self.layout, ino) {
            Ok(Some(node)) if node.inode_number == ino => Ok(node),
            Ok(Some(node)) => {
                warn!(
                    "slot of inode {ino} holds inode {}, starting over",
                    node.inode_number
                );
                let mut fresh = Node::new(ino);
                fresh.ctime_dirty = true;
                Ok(fresh)
            }
            Ok(None) => Ok(Node::new(ino)),
            Err(FsError::Codec(e)) => {
                warn!("unreadable record for inode {ino}, starting over: {e}");
                let mut fresh = Node::new(ino);
                fresh.ctime_dirty = true;
                Ok(fresh)
            }
            Err(e) => Err(e),
        }
    }

    fn persist(&mut self, node: &mut Node) -> Result<()> {
        let (block, offset) = slot_of(self.layout, node.inode_number)?;
        let raw = node.serialize_to_vec()?;
        if raw.len() > INODE_SIZE as usize {
            return Err(FsError::Codec(format!(
                "inode {} needs {} bytes, slot is {INODE_SIZE}",
                node.inode_number,
                raw.len()
            )));
        }
        let mut buf = vec![0u8; self.layout.block_size as usize];
        self.dev.read_block(block, &mut buf)?;
        let slot = &mut buf[offset..offset + INODE_SIZE as usize];
        slot.fill(0);
        slot[..raw.len()].copy_from_slice(&raw);
        self.dev.write_block(block, &buf)
    }
}
