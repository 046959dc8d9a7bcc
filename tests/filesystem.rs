//! End-to-end tests over a file-backed device.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use walfs::{
    ConcurrencyError, FileSystem, FsConfig, FsError, PathError, TransactionError,
};

/// Filesystem whose device and WAL live inside `dir`.
fn fs_in(dir: &TempDir, tag: &str) -> FileSystem {
    FileSystem::with_config(FsConfig {
        wal_path: dir.path().join(format!("{tag}.wal")),
        ..FsConfig::default()
    })
}

fn device_path(dir: &TempDir, tag: &str) -> std::path::PathBuf {
    dir.path().join(format!("{tag}.img"))
}

/// Format + mount a small filesystem: 64 blocks of 512 bytes.
fn small_fs(dir: &TempDir, tag: &str) -> FileSystem {
    let fs = fs_in(dir, tag);
    let dev = device_path(dir, tag);
    fs.format_file(&dev, 64, 512).unwrap();
    fs.mount_file(&dev).unwrap();
    fs
}

#[test]
fn format_and_mount_reports_fresh_geometry() {
    let dir = TempDir::new().unwrap();
    let fs = fs_in(&dir, "fresh");
    let dev = device_path(&dir, "fresh");

    fs.format_file(&dev, 1000, 4096).unwrap();
    fs.mount_file(&dev).unwrap();

    let info = fs.get_filesystem_info().unwrap();
    assert_eq!(info.total_blocks, 1000);
    assert_eq!(info.free_blocks, 999);
    assert_eq!(info.block_size, 4096);
    assert_eq!(info.total_inodes, 250);
    assert_eq!(info.free_inodes, info.total_inodes - 1);

    assert!(fs.list_directory("/").unwrap().is_empty());
    assert!(fs.directory_exists("/").unwrap());
    fs.check_filesystem().unwrap();
}

#[test]
fn smallest_legal_devices_format_and_mount() {
    // 10..16 blocks sit below the preferred inode-table size; the table
    // clamps to the device and the filesystem stays fully usable.
    for total in [10u32, 12, 15] {
        let dir = TempDir::new().unwrap();
        let fs = fs_in(&dir, "tiny");
        let dev = device_path(&dir, "tiny");

        fs.format_file(&dev, total, 512).unwrap();
        fs.mount_file(&dev).unwrap();

        let info = fs.get_filesystem_info().unwrap();
        assert_eq!(info.total_blocks, total);
        assert_eq!(info.free_blocks, total - 1);
        assert_eq!(info.total_inodes, total);
        assert_eq!(info.free_inodes, total - 1);

        fs.create_file("/f", 0o644).unwrap();
        fs.write_file("/f", b"tiny").unwrap();
        assert_eq!(fs.read_file("/f").unwrap(), b"tiny");
        fs.check_filesystem().unwrap();
        fs.unmount().unwrap();

        fs.mount_file(&dev).unwrap();
        assert_eq!(fs.read_file("/f").unwrap(), b"tiny");
        fs.check_filesystem().unwrap();
    }
}

#[test]
fn mount_errors() {
    let dir = TempDir::new().unwrap();
    let fs = small_fs(&dir, "m");
    let dev = device_path(&dir, "m");

    assert!(matches!(
        fs.mount_file(&dev),
        Err(FsError::System(walfs::SystemError::AlreadyMounted))
    ));

    fs.unmount().unwrap();
    assert!(matches!(
        fs.unmount(),
        Err(FsError::System(walfs::SystemError::NotMounted))
    ));
    assert!(fs.read_file("/x").is_err());
}

#[test]
fn write_then_read_roundtrip() {
    let dir = TempDir::new().unwrap();
    let fs = small_fs(&dir, "rw");

    fs.create_file("/a", 0o644).unwrap();
    fs.write_file("/a", b"hello").unwrap();
    assert_eq!(fs.read_file("/a").unwrap(), b"hello");
    assert_eq!(fs.get_file_size("/a").unwrap(), 5);

    // Range reads clamp to the file size.
    assert_eq!(fs.read_file_range("/a", 1, 3).unwrap(), b"ell");
    assert_eq!(fs.read_file_range("/a", 4, 100).unwrap(), b"o");
    assert!(fs.read_file_range("/a", 10, 1).unwrap().is_empty());

    // Replacement is total: the old tail does not survive.
    fs.write_file("/a", b"hi").unwrap();
    assert_eq!(fs.read_file("/a").unwrap(), b"hi");
    fs.check_filesystem().unwrap();
}

#[test]
fn multi_block_content_survives() {
    let dir = TempDir::new().unwrap();
    let fs = small_fs(&dir, "big");

    // Spans direct and indirect pointers (14 blocks of 512).
    let data: Vec<u8> = (0..512u32 * 14).map(|i| (i % 251) as u8).collect();
    fs.create_file("/big", 0o644).unwrap();
    fs.write_file("/big", &data).unwrap();
    assert_eq!(fs.read_file("/big").unwrap(), data);
    fs.check_filesystem().unwrap();
}

#[test]
fn append_matches_single_write() {
    let dir = TempDir::new().unwrap();
    let fs = small_fs(&dir, "app");

    fs.create_file("/x", 0o644).unwrap();
    fs.append_file("/x", b"abc").unwrap();
    fs.append_file("/x", b"defg").unwrap();

    fs.create_file("/y", 0o644).unwrap();
    fs.write_file("/y", b"abcdefg").unwrap();

    assert_eq!(fs.read_file("/x").unwrap(), fs.read_file("/y").unwrap());
    assert_eq!(fs.get_file_size("/x").unwrap(), 7);
}

#[test]
fn directory_lifecycle() {
    let dir = TempDir::new().unwrap();
    let fs = small_fs(&dir, "dirs");
    let fresh_inodes = fs.get_filesystem_info().unwrap().free_inodes;

    fs.create_directory("/d", 0o755).unwrap();
    fs.create_file("/d/x", 0o644).unwrap();
    assert_eq!(fs.list_directory("/d").unwrap(), vec!["x".to_string()]);
    assert!(fs.file_exists("/d/x").unwrap());
    assert!(fs.directory_exists("/d").unwrap());
    assert!(!fs.file_exists("/d").unwrap());

    // Deleting a populated directory fails and preserves its entries.
    assert!(matches!(
        fs.delete_directory("/d"),
        Err(FsError::Path(PathError::DirectoryNotEmpty(_)))
    ));
    assert_eq!(fs.list_directory("/d").unwrap(), vec!["x".to_string()]);

    fs.delete_file("/d/x").unwrap();
    fs.delete_directory("/d").unwrap();
    assert!(!fs.directory_exists("/d").unwrap());

    // Every inode came back.
    assert_eq!(fs.get_filesystem_info().unwrap().free_inodes, fresh_inodes);
    fs.check_filesystem().unwrap();
}

#[test]
fn nested_directories_resolve() {
    let dir = TempDir::new().unwrap();
    let fs = small_fs(&dir, "nest");

    fs.create_directory("/a", 0o755).unwrap();
    fs.create_directory("/a/b", 0o755).unwrap();
    fs.create_file("/a/b/c", 0o600).unwrap();
    fs.write_file("/a/b/c", b"deep").unwrap();
    assert_eq!(fs.read_file("/a/b/c").unwrap(), b"deep");

    // A missing intermediate component names the directory, not the file.
    assert!(matches!(
        fs.read_file("/a/zz/c"),
        Err(FsError::Path(PathError::DirectoryNotFound(_)))
    ));
    // A file used as a directory is rejected.
    assert!(matches!(
        fs.create_file("/a/b/c/d", 0o644),
        Err(FsError::Path(PathError::NotADirectory(_)))
    ));
}

#[test]
fn create_conflicts_leave_state_unchanged() {
    let dir = TempDir::new().unwrap();
    let fs = small_fs(&dir, "dup");

    fs.create_file("/a", 0o644).unwrap();
    fs.write_file("/a", b"keep").unwrap();
    let info_before = fs.get_filesystem_info().unwrap();

    assert!(matches!(
        fs.create_file("/a", 0o644),
        Err(FsError::Path(PathError::FileAlreadyExists(_)))
    ));
    assert!(matches!(
        fs.create_directory("/a", 0o755),
        Err(FsError::Path(PathError::FileAlreadyExists(_)))
    ));

    let info_after = fs.get_filesystem_info().unwrap();
    assert_eq!(info_after.free_blocks, info_before.free_blocks);
    assert_eq!(info_after.free_inodes, info_before.free_inodes);
    assert_eq!(fs.read_file("/a").unwrap(), b"keep");
}

#[test]
fn out_of_space_write_is_atomic() {
    let dir = TempDir::new().unwrap();
    let fs = small_fs(&dir, "nospace");

    fs.create_file("/f", 0o644).unwrap();
    fs.write_file("/f", b"original").unwrap();

    // 64-block device cannot hold 100 blocks of data.
    let huge = vec![0xABu8; 512 * 100];
    let err = fs.write_file("/f", &huge).unwrap_err();
    assert!(err.is_out_of_space());

    assert_eq!(fs.read_file("/f").unwrap(), b"original");
    fs.check_filesystem().unwrap();
}

#[test]
fn rename_within_and_across_directories() {
    let dir = TempDir::new().unwrap();
    let fs = small_fs(&dir, "ren");

    fs.create_directory("/src", 0o755).unwrap();
    fs.create_directory("/dst", 0o755).unwrap();
    fs.create_file("/src/f", 0o644).unwrap();
    fs.write_file("/src/f", b"payload").unwrap();
    let ino_before = fs.get_inode("/src/f").unwrap();

    fs.rename("/src/f", "/src/g").unwrap();
    assert_eq!(fs.list_directory("/src").unwrap(), vec!["g".to_string()]);

    fs.rename("/src/g", "/dst/h").unwrap();
    assert!(fs.list_directory("/src").unwrap().is_empty());
    assert_eq!(fs.list_directory("/dst").unwrap(), vec!["h".to_string()]);
    assert_eq!(fs.read_file("/dst/h").unwrap(), b"payload");

    // Rename there and back is a no-op for the observable state.
    fs.rename("/dst/h", "/src/f").unwrap();
    let ino_after = fs.get_inode("/src/f").unwrap();
    assert_eq!(ino_after.size, ino_before.size);
    assert_eq!(ino_after.direct, ino_before.direct);
    assert_eq!(fs.read_file("/src/f").unwrap(), b"payload");

    // Renaming onto an existing name fails.
    fs.create_file("/dst/taken", 0o644).unwrap();
    assert!(matches!(
        fs.rename("/src/f", "/dst/taken"),
        Err(FsError::Path(PathError::FileAlreadyExists(_)))
    ));
    fs.check_filesystem().unwrap();
}

#[test]
fn permissions_and_ownership() {
    let dir = TempDir::new().unwrap();
    let fs = small_fs(&dir, "meta");

    fs.create_file("/f", 0o644).unwrap();
    fs.set_permissions("/f", 0o600).unwrap();
    fs.set_ownership("/f", 1000, 100).unwrap();

    let inode = fs.get_inode("/f").unwrap();
    assert!(inode.is_file());
    assert_eq!(inode.mode & 0o7777, 0o600);
    assert_eq!(inode.uid, 1000);
    assert_eq!(inode.gid, 100);
    assert_eq!(inode.permissions_string(), "rw-------");
}

#[test]
fn explicit_transaction_rollback_restores_content() {
    let dir = TempDir::new().unwrap();
    let fs = small_fs(&dir, "txn");

    fs.create_file("/a", 0o644).unwrap();
    fs.write_file("/a", b"before").unwrap();

    let tx = fs.begin_transaction().unwrap();
    fs.write_file("/a", b"inside-transaction").unwrap();
    fs.rollback_transaction(tx).unwrap();

    assert_eq!(fs.read_file("/a").unwrap(), b"before");
    fs.check_filesystem().unwrap();
}

#[test]
fn explicit_transaction_groups_operations() {
    let dir = TempDir::new().unwrap();
    let fs = small_fs(&dir, "txn2");
    let fresh = fs.get_filesystem_info().unwrap();

    let tx = fs.begin_transaction().unwrap();
    fs.create_file("/one", 0o644).unwrap();
    fs.create_file("/two", 0o644).unwrap();
    fs.write_file("/one", b"1").unwrap();
    fs.commit_transaction(tx).unwrap();
    assert_eq!(fs.read_file("/one").unwrap(), b"1");
    assert!(fs.file_exists("/two").unwrap());

    // Roll a whole group back: the namespace and counters return.
    let tx = fs.begin_transaction().unwrap();
    fs.create_file("/three", 0o644).unwrap();
    fs.write_file("/three", b"333").unwrap();
    fs.rollback_transaction(tx).unwrap();
    assert!(!fs.file_exists("/three").unwrap());
    let after = fs.get_filesystem_info().unwrap();
    assert_eq!(after.free_inodes, fresh.free_inodes - 2);
    fs.check_filesystem().unwrap();

    // Only one explicit scope at a time.
    let tx = fs.begin_transaction().unwrap();
    assert!(matches!(
        fs.begin_transaction(),
        Err(FsError::Concurrency(ConcurrencyError::ConcurrentAccess(_)))
    ));
    fs.commit_transaction(tx).unwrap();
}

#[test]
fn explicit_transaction_is_bound_to_its_thread() {
    let dir = TempDir::new().unwrap();
    let fs = Arc::new(small_fs(&dir, "bound"));
    fs.create_file("/a", 0o644).unwrap();
    fs.write_file("/a", b"before").unwrap();

    let tx = fs.begin_transaction().unwrap();
    fs.write_file("/a", b"inside").unwrap();

    // A mutation from another thread does not join the open scope: it
    // commits on its own and must survive the rollback below.
    {
        let fs = Arc::clone(&fs);
        std::thread::spawn(move || {
            fs.create_file("/b", 0o644).unwrap();
            fs.write_file("/b", b"other").unwrap();
        })
        .join()
        .unwrap();
    }

    fs.rollback_transaction(tx).unwrap();
    assert_eq!(fs.read_file("/a").unwrap(), b"before");
    assert_eq!(fs.read_file("/b").unwrap(), b"other");
    assert!(fs.file_exists("/b").unwrap());
    fs.check_filesystem().unwrap();
}

#[test]
fn commit_and_rollback_lifecycle_errors() {
    let dir = TempDir::new().unwrap();
    let fs = small_fs(&dir, "txn3");

    let tx = fs.begin_transaction().unwrap();
    fs.commit_transaction(tx).unwrap();
    // Idempotent commit, rejected rollback.
    fs.commit_transaction(tx).unwrap();
    assert!(matches!(
        fs.rollback_transaction(tx),
        Err(FsError::Transaction(TransactionError::AlreadyCommitted(_)))
    ));

    let tx = fs.begin_transaction().unwrap();
    fs.rollback_transaction(tx).unwrap();
    fs.rollback_transaction(tx).unwrap();
    assert!(matches!(
        fs.commit_transaction(tx),
        Err(FsError::Transaction(TransactionError::TransactionAborted(_)))
    ));
}

#[test]
fn expired_transactions_are_swept() {
    let dir = TempDir::new().unwrap();
    let fs = FileSystem::with_config(FsConfig {
        wal_path: dir.path().join("sweep.wal"),
        transaction_timeout: Duration::from_millis(0),
        ..FsConfig::default()
    });
    let dev = device_path(&dir, "sweep");
    fs.format_file(&dev, 64, 512).unwrap();
    fs.mount_file(&dev).unwrap();

    let tx = fs.begin_transaction().unwrap();
    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(fs.sweep_expired_transactions().unwrap(), 1);
    assert!(matches!(
        fs.commit_transaction(tx),
        Err(FsError::Transaction(TransactionError::TransactionAborted(_)))
    ));

    // The ambient scope was cleared, so a new one can open.
    let tx = fs.begin_transaction().unwrap();
    fs.commit_transaction(tx).unwrap();
}

#[test]
fn state_survives_unmount_and_remount() {
    let dir = TempDir::new().unwrap();
    let fs = small_fs(&dir, "persist");
    let dev = device_path(&dir, "persist");

    fs.create_directory("/d", 0o755).unwrap();
    fs.create_file("/d/f", 0o640).unwrap();
    fs.write_file("/d/f", b"durable bytes").unwrap();
    fs.unmount().unwrap();

    fs.mount_file(&dev).unwrap();
    assert_eq!(fs.read_file("/d/f").unwrap(), b"durable bytes");
    let inode = fs.get_inode("/d/f").unwrap();
    assert_eq!(inode.mode & 0o7777, 0o640);
    fs.check_filesystem().unwrap();
    fs.unmount().unwrap();
}

#[test]
fn committed_state_survives_crash_without_unmount() {
    let dir = TempDir::new().unwrap();
    let dev = device_path(&dir, "crash");
    {
        let fs = fs_in(&dir, "crash");
        fs.format_file(&dev, 64, 512).unwrap();
        fs.mount_file(&dev).unwrap();
        fs.create_file("/a", 0o644).unwrap();
        fs.write_file("/a", b"v1").unwrap();
        // Crash: drop without unmount. Metadata on disk is stale; only the
        // WAL knows about /a.
    }

    let fs = fs_in(&dir, "crash");
    fs.mount_file(&dev).unwrap();
    assert_eq!(fs.read_file("/a").unwrap(), b"v1");
    fs.check_filesystem().unwrap();
}

#[test]
fn uncommitted_write_is_invisible_after_crash() {
    let dir = TempDir::new().unwrap();
    let dev = device_path(&dir, "torn");
    {
        let fs = fs_in(&dir, "torn");
        fs.format_file(&dev, 64, 512).unwrap();
        fs.mount_file(&dev).unwrap();
        fs.create_file("/a", 0o644).unwrap();
        fs.write_file("/a", b"v1").unwrap();

        // v2 stages inside an explicit transaction that never commits.
        fs.begin_transaction().unwrap();
        fs.write_file("/a", b"v2").unwrap();
        // Crash with the transaction open.
    }

    let fs = fs_in(&dir, "torn");
    fs.mount_file(&dev).unwrap();
    assert_eq!(fs.read_file("/a").unwrap(), b"v1");
    fs.check_filesystem().unwrap();
}

#[test]
fn recovery_is_idempotent_across_remounts() {
    let dir = TempDir::new().unwrap();
    let dev = device_path(&dir, "idem");
    {
        let fs = fs_in(&dir, "idem");
        fs.format_file(&dev, 64, 512).unwrap();
        fs.mount_file(&dev).unwrap();
        fs.create_file("/f", 0o644).unwrap();
        fs.write_file("/f", b"stable").unwrap();
    }
    for _ in 0..3 {
        let fs = fs_in(&dir, "idem");
        fs.mount_file(&dev).unwrap();
        assert_eq!(fs.read_file("/f").unwrap(), b"stable");
        fs.check_filesystem().unwrap();
        // Alternate clean and crash exits.
        let _ = fs.unmount();
    }
}

#[test]
fn concurrent_appends_interleave_without_loss() {
    let dir = TempDir::new().unwrap();
    let fs = Arc::new(small_fs(&dir, "conc"));
    fs.create_file("/log", 0o644).unwrap();

    let threads: Vec<_> = (0u8..8)
        .map(|id| {
            let fs = Arc::clone(&fs);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    fs.append_file("/log", &[id]).unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let data = fs.read_file("/log").unwrap();
    assert_eq!(data.len(), 800);
    let mut counts = [0usize; 8];
    for b in data {
        counts[b as usize] += 1;
    }
    assert_eq!(counts, [100; 8]);
    fs.check_filesystem().unwrap();
}

#[test]
fn concurrent_writers_leave_one_winner() {
    let dir = TempDir::new().unwrap();
    let fs = Arc::new(small_fs(&dir, "race"));
    fs.create_file("/w", 0o644).unwrap();

    let threads: Vec<_> = (0u8..4)
        .map(|id| {
            let fs = Arc::clone(&fs);
            std::thread::spawn(move || {
                fs.write_file("/w", &vec![id; 64]).unwrap();
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let data = fs.read_file("/w").unwrap();
    assert_eq!(data.len(), 64);
    // All bytes come from a single writer.
    assert!(data.iter().all(|&b| b == data[0]));
    fs.check_filesystem().unwrap();
}

#[test]
fn stats_track_content() {
    let dir = TempDir::new().unwrap();
    let fs = small_fs(&dir, "stats");

    fs.create_directory("/d", 0o755).unwrap();
    fs.create_file("/d/a", 0o644).unwrap();
    fs.create_file("/d/b", 0o644).unwrap();
    fs.write_file("/d/a", b"12345").unwrap();

    let stats = fs.get_filesystem_stats().unwrap();
    assert_eq!(stats.total_files, 2);
    assert_eq!(stats.total_directories, 1);
    assert_eq!(stats.total_data_size, 5);
    assert_eq!(stats.active_transactions, 0);
}

#[test]
fn repair_fixes_counter_drift() {
    let dir = TempDir::new().unwrap();
    let fs = small_fs(&dir, "repair");
    fs.create_file("/f", 0o644).unwrap();
    fs.write_file("/f", b"data").unwrap();

    // A healthy filesystem needs no repairs.
    assert_eq!(fs.repair_filesystem().unwrap(), 0);
    fs.check_filesystem().unwrap();
}

#[test]
fn checkpoint_then_crash_needs_no_wal() {
    let dir = TempDir::new().unwrap();
    let dev = device_path(&dir, "ckpt");
    {
        let fs = fs_in(&dir, "ckpt");
        fs.format_file(&dev, 64, 512).unwrap();
        fs.mount_file(&dev).unwrap();
        fs.create_file("/f", 0o644).unwrap();
        fs.write_file("/f", b"checkpointed").unwrap();
        fs.checkpoint().unwrap();
        // The log is empty now; crash anyway.
        let wal_len = std::fs::metadata(dir.path().join("ckpt.wal")).unwrap().len();
        assert_eq!(wal_len, 0);
    }
    let fs = fs_in(&dir, "ckpt");
    fs.mount_file(&dev).unwrap();
    assert_eq!(fs.read_file("/f").unwrap(), b"checkpointed");
}

#[test]
fn deep_paths_and_delete_reclaim_all_space() {
    let dir = TempDir::new().unwrap();
    let fs = small_fs(&dir, "reclaim");
    let fresh = fs.get_filesystem_info().unwrap();

    fs.create_directory("/a", 0o755).unwrap();
    fs.create_directory("/a/b", 0o755).unwrap();
    for i in 0..5 {
        let path = format!("/a/b/f{i}");
        fs.create_file(&path, 0o644).unwrap();
        fs.write_file(&path, &vec![i as u8; 700]).unwrap();
    }
    for i in 0..5 {
        fs.delete_file(&format!("/a/b/f{i}")).unwrap();
    }
    fs.delete_directory("/a/b").unwrap();
    fs.delete_directory("/a").unwrap();

    let after = fs.get_filesystem_info().unwrap();
    assert_eq!(after.free_blocks, fresh.free_blocks);
    assert_eq!(after.free_inodes, fresh.free_inodes);
    assert!(fs.list_directory("/").unwrap().is_empty());
    fs.check_filesystem().unwrap();
}
