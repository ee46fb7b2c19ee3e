//! Format a disk image.

use std::path::PathBuf;
use std::process::exit;

use clap::Parser;

use minios_kernel::fs::diskutil::mkfs_image;

#[derive(Parser)]
#[command(about = "Create and format a minifile disk image")]
struct Args {
    /// Image file to create (overwritten if present).
    image: PathBuf,
    /// Size of the disk in 4096-byte blocks.
    blocks: u64,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    match mkfs_image(&args.image, args.blocks) {
        Ok(sb) => {
            println!("{}: {} blocks", args.image.display(), sb.disk_num_blocks);
            println!("  magic             {:#010x}", sb.magic);
            println!("  inode blocks      {}..{}", sb.first_inode_block, sb.inode_bitmap_first - 1);
            println!("  inode bitmap      {}..{}", sb.inode_bitmap_first, sb.inode_bitmap_last);
            println!("  block bitmap      {}..{}", sb.block_bitmap_first, sb.block_bitmap_last);
            println!("  first data block  {}", sb.first_data_block);
            println!("  free inodes       {}", sb.free_inodes);
            println!("  free blocks       {}", sb.free_blocks);
        }
        Err(e) => {
            eprintln!("mkfs: {e}");
            exit(-1);
        }
    }
}
