//! Check a disk image for consistency.

use std::path::PathBuf;
use std::process::exit;

use clap::Parser;

use minios_kernel::fs::diskutil::fsck_image;

#[derive(Parser)]
#[command(about = "Validate a minifile disk image")]
struct Args {
    /// Image file to check.
    image: PathBuf,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    match fsck_image(&args.image) {
        Ok(report) => {
            let sb = report.sb;
            println!("{}: clean", args.image.display());
            println!("  {} blocks, {} inodes", sb.disk_num_blocks, sb.total_inodes);
            println!(
                "  free inodes: {} counted / {} recorded",
                report.counted_free_inodes, sb.free_inodes
            );
            println!(
                "  free blocks: {} counted / {} recorded",
                report.counted_free_blocks, sb.free_blocks
            );
            println!(
                "  tree: {} inodes over {} data/pointer blocks",
                report.reachable_inodes, report.reachable_blocks
            );
        }
        Err(e) => {
            eprintln!("fsck: {}: {e}", args.image.display());
            exit(-1);
        }
    }
}
