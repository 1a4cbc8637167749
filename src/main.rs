use anyhow::bail;
use clap::Parser;
use groupfs::{cli_interface::GroupFsCli, mount, FreeOutcome};
/// a CLI interface to users to create our filesystem,
/// inspect it, or allocate and free single inodes on it.
///
/// every subcommand opens the image, runs one operation and syncs it back.
fn main() -> anyhow::Result<()> {
    env_logger::builder().format_timestamp_nanos().init();
    let args = GroupFsCli::parse();
    match args {
        GroupFsCli::Mkfs(args) => {
            //create a new file system
            let layout = groupfs::mkfs::mkfs(&args.image_file_path, &args.options())?;
            println!(
                "created {} with {} inodes",
                args.image_file_path,
                layout.inodes_count()
            );
        }
        GroupFsCli::Stat(args) => {
            println!("{}", mount::stat(&args.image_file_path, args.cross_check)?);
        }
        GroupFsCli::Check(args) => {
            let report = mount::check(&args.image_file_path)?;
            for m in &report.mismatches {
                println!(
                    "group {}: stored {} free inodes, bitmap has {}",
                    m.group, m.stored, m.counted
                );
            }
            if let Some((stored, counted)) = report.superblock_mismatch() {
                println!("superblock: stored {stored} free inodes, bitmaps have {counted}");
            }
            if !report.is_consistent() {
                bail!("{} is inconsistent", args.image_file_path);
            }
            println!("{} free inodes, consistent", report.bitmap_total);
        }
        GroupFsCli::Alloc(args) => {
            let node = mount::alloc(&args.image_file_path, args.parent, args.dir)?;
            println!(
                "allocated inode {} generation {}",
                node.inode_number, node.generation
            );
        }
        GroupFsCli::Free(args) => match mount::free(&args.image_file_path, args.inode, args.dir)? {
            FreeOutcome::Freed => println!("freed inode {}", args.inode),
            FreeOutcome::Ignored(anomaly) => {
                println!("inode {} left untouched: {anomaly:?}", args.inode)
            }
        },
    }
    Ok(())
}
