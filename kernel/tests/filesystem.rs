//! Filesystem end-to-end: one formatted image, scenarios run in order.

mod common;

use std::sync::Arc;

use minios_kernel::errors::FsError;
use minios_kernel::fs::{self, diskutil};
use minios_kernel::sync::{Mutex, Semaphore};
use minios_kernel::{task, Config, DiskConfig};

const DISK_BLOCKS: u64 = 2048;

#[test]
fn filesystem_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("minifile.img");
    diskutil::mkfs_image(&image, DISK_BLOCKS).expect("mkfs");

    let config = Config {
        disk: Some(DiskConfig {
            path: image.clone(),
            create_blocks: None,
            failure_rate: 0.0,
            crash_rate: 0.0,
        }),
        ..Config::default()
    };
    common::run_scenario(config, || {
        fs::mount().expect("mount");
        file_round_trip_through_indirect_blocks();
        concurrent_readers_see_the_same_bytes();
        directory_invariants();
        unlink_defers_reclamation_to_last_close();
        bitmaps_and_counters_stay_consistent();
        working_directory_navigation();
    });
}

/// Spans the 11 direct blocks, the whole single-indirect range, and the
/// start of the double-indirect range: 600 blocks of patterned data.
fn file_round_trip_through_indirect_blocks() {
    let len = 600 * 4096;
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

    let mut f = fs::creat("/bigfile").expect("creat");
    assert_eq!(f.write(&data).expect("write"), len);
    fs::close(f);

    let mut f = fs::open("/bigfile", "r").expect("open");
    assert_eq!(f.size(), len as u64);
    let mut back = vec![0u8; len];
    let mut got = 0;
    while got < len {
        let n = f.read(&mut back[got..]).expect("read");
        assert!(n > 0, "short read at {got}");
        got += n;
    }
    fs::close(f);
    assert_eq!(back, data, "round-tripped bytes differ");

    assert_eq!(fs::stat("/bigfile").unwrap(), fs::Stat::File(len as u64));
    fs::unlink("/bigfile").expect("unlink");
    assert_eq!(fs::stat("/bigfile"), Err(FsError::NotFound));
}

/// S6: twenty threads read the same 64 KiB file concurrently.
fn concurrent_readers_see_the_same_bytes() {
    let len = 65_536usize;
    let data: Vec<u8> = (0..len).map(|i| (i & 127) as u8).collect();
    let mut f = fs::creat("/readfiletest").expect("creat");
    f.write(&data).expect("write");
    fs::close(f);

    let done = Arc::new(Semaphore::new(0));
    let failures = Arc::new(Mutex::new(Vec::new()));
    for reader in 0..20 {
        let done = done.clone();
        let failures = failures.clone();
        task::fork(move || {
            let verdict = (|| {
                let mut f = fs::open("/readfiletest", "r").map_err(|e| format!("open: {e}"))?;
                let mut buf = vec![0u8; 65_536];
                let mut got = 0;
                while got < buf.len() {
                    let n = f.read(&mut buf[got..]).map_err(|e| format!("read: {e}"))?;
                    if n == 0 {
                        return Err(format!("eof at {got}"));
                    }
                    got += n;
                }
                fs::close(f);
                for (i, b) in buf.iter().enumerate() {
                    if *b != (i & 127) as u8 {
                        return Err(format!("byte {i} = {b}"));
                    }
                }
                Ok(())
            })();
            if let Err(e) = verdict {
                failures.lock().push(format!("reader {reader}: {e}"));
            }
            done.v();
        })
        .unwrap();
    }
    for _ in 0..20 {
        done.p();
    }
    let failed = failures.lock().clone();
    assert!(failed.is_empty(), "{failed:?}");
    fs::unlink("/readfiletest").unwrap();
}

fn directory_invariants() {
    fs::mkdir("/a").expect("mkdir /a");
    fs::mkdir("/a/b").expect("mkdir /a/b");

    let listing = fs::ls(Some("/a")).expect("ls /a");
    assert!(listing.contains(&"b".to_string()), "{listing:?}");
    assert!(listing.contains(&".".to_string()));
    assert!(listing.contains(&"..".to_string()));

    // "." and ".." resolve to the directory and its parent.
    assert_eq!(fs::resolve_path("/a/b/.").unwrap(), fs::resolve_path("/a/b").unwrap());
    assert_eq!(fs::resolve_path("/a/b/..").unwrap(), fs::resolve_path("/a").unwrap());

    // Duplicate names are refused.
    assert_eq!(fs::mkdir("/a/b"), Err(FsError::Exists));

    // Removing a populated directory fails; emptied, it succeeds.
    assert_eq!(fs::rmdir("/a"), Err(FsError::NotEmpty));
    fs::rmdir("/a/b").expect("rmdir /a/b");
    fs::rmdir("/a").expect("rmdir /a");
    assert_eq!(fs::stat("/a"), Err(FsError::NotFound));

    // The root is non-removable.
    assert_eq!(fs::rmdir("/"), Err(FsError::RootForbidden));
}

fn unlink_defers_reclamation_to_last_close() {
    let mut f = fs::creat("/doomed").expect("creat");
    f.write(b"still readable").expect("write");
    fs::close(f);

    let mut held = fs::open("/doomed", "r").expect("open");
    fs::unlink("/doomed").expect("unlink");
    // The name is gone, but the open handle still reads.
    assert_eq!(fs::stat("/doomed"), Err(FsError::NotFound));
    let mut buf = [0u8; 32];
    let n = held.read(&mut buf).expect("read after unlink");
    assert_eq!(&buf[..n], b"still readable");
    fs::close(held);
}

fn bitmaps_and_counters_stay_consistent() {
    let (inodes_before, blocks_before) = fs::free_counts().unwrap();

    let mut f = fs::creat("/churn").expect("creat");
    f.write(&vec![7u8; 40 * 4096]).expect("write");
    fs::close(f);
    fs::consistency_check().expect("consistent while allocated");

    let (_, blocks_mid) = fs::free_counts().unwrap();
    assert!(blocks_mid < blocks_before, "writing allocated nothing");

    fs::unlink("/churn").expect("unlink");
    fs::consistency_check().expect("consistent after reclaim");
    let (inodes_after, blocks_after) = fs::free_counts().unwrap();
    assert_eq!(inodes_after, inodes_before);
    assert_eq!(blocks_after, blocks_before);
}

fn working_directory_navigation() {
    fs::mkdir("/w").unwrap();
    fs::mkdir("/w/x").unwrap();
    fs::cd("/w/x").expect("cd");
    assert_eq!(fs::pwd().unwrap(), "/w/x");

    // Relative paths resolve against the working directory.
    let mut f = fs::creat("here.txt").expect("relative creat");
    f.write(b"hi").unwrap();
    fs::close(f);
    assert_eq!(fs::stat("/w/x/here.txt").unwrap(), fs::Stat::File(2));

    fs::cd("..").expect("cd ..");
    assert_eq!(fs::pwd().unwrap(), "/w");
    fs::cd("/").expect("cd /");
    assert_eq!(fs::pwd().unwrap(), "/");

    fs::unlink("/w/x/here.txt").unwrap();
    fs::rmdir("/w/x").unwrap();
    fs::rmdir("/w").unwrap();
}
