// Copyright 2025 The cinder Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use cinder_ds_ram::RamNorFlash;
use cinder_fs::{Config, EntryKind, Error, Fs, FsError, Whence};

fn cfg() -> Config {
    Config {
        read_size: 1,
        prog_size: 1,
        sector_size: 4096,
        sector_count: 8192,
        cache_size: 256,
        region_cnt: 128,
        name_max: 255,
        file_max: 32 * 1024 * 1024,
    }
}

fn fresh() -> Fs<RamNorFlash> {
    Fs::format(RamNorFlash::new(4096, 8192), cfg()).unwrap()
}

fn remount(fs: Fs<RamNorFlash>) -> Fs<RamNorFlash> {
    let dev = fs.unmount().unwrap();
    Fs::mount(dev, cfg()).unwrap()
}

#[test]
fn format_mount_and_empty_root() {
    // S1: a fresh volume mounts and the root enumerates as empty.
    let fs = fresh();
    let mut fs = remount(fs);
    let root = fs.dir_open("/").unwrap();
    assert!(fs.dir_read(root).unwrap().is_none());
}

#[test]
fn mount_formats_a_blank_device() {
    let mut fs = Fs::mount(RamNorFlash::new(4096, 8192), cfg()).unwrap();
    let root = fs.dir_open("/").unwrap();
    assert!(fs.dir_read(root).unwrap().is_none());
}

#[test]
fn small_file_round_trip() {
    // S2: 32 bytes survive close, unmount and mount.
    let mut fs = fresh();
    let data: Vec<u8> = (0u8..0x20).collect();

    let fd = fs.file_open("/f").unwrap();
    assert_eq!(fs.file_write(fd, &data).unwrap(), 32);
    fs.file_close(fd).unwrap();

    let mut fs = remount(fs);
    let fd = fs.file_open("/f").unwrap();
    assert_eq!(fs.file_size(fd).unwrap(), 32);
    fs.file_seek(fd, 0, Whence::Set).unwrap();
    let mut back = [0u8; 32];
    assert_eq!(fs.file_read(fd, &mut back).unwrap(), 32);
    assert_eq!(back.as_slice(), data.as_slice());
    fs.file_close(fd).unwrap();
}

#[test]
fn small_file_crosses_the_inline_threshold() {
    // S3: 60 bytes stay inline, 20 more promote the file to big.
    let mut fs = fresh();
    let fd = fs.file_open("/g").unwrap();
    fs.file_write(fd, &[0u8; 60]).unwrap();
    fs.file_write(fd, &[0u8; 20]).unwrap();
    assert_eq!(fs.file_size(fd).unwrap(), 80);
    fs.file_close(fd).unwrap();

    let mut fs = remount(fs);
    let fd = fs.file_open("/g").unwrap();
    assert_eq!(fs.file_size(fd).unwrap(), 80);
    let mut back = [0xffu8; 80];
    fs.file_seek(fd, 0, Whence::Set).unwrap();
    assert_eq!(fs.file_read(fd, &mut back).unwrap(), 80);
    assert!(back.iter().all(|&byte| byte == 0));
    fs.file_close(fd).unwrap();
}

#[test]
fn big_file_random_overwrite() {
    // S4: 2 MiB of 0xAA, 1 KiB of 0xBB spliced in at offset 1_000_000.
    const SIZE: u32 = 2 * 1024 * 1024;
    let mut fs = fresh();
    let fd = fs.file_open("/h").unwrap();
    let chunk = vec![0xaau8; 128 * 1024];
    for _ in 0..(SIZE / chunk.len() as u32) {
        fs.file_write(fd, &chunk).unwrap();
    }
    assert_eq!(fs.file_size(fd).unwrap(), SIZE);

    fs.file_seek(fd, 1_000_000, Whence::Set).unwrap();
    fs.file_write(fd, &vec![0xbbu8; 1024]).unwrap();
    assert_eq!(fs.file_size(fd).unwrap(), SIZE);

    let mut verify = |fs: &mut Fs<RamNorFlash>, fd| {
        fs.file_seek(fd, 1_000_000, Whence::Set).unwrap();
        let mut middle = vec![0u8; 1024];
        assert_eq!(fs.file_read(fd, &mut middle).unwrap(), 1024);
        assert!(middle.iter().all(|&byte| byte == 0xbb));

        let mut byte = [0u8; 1];
        fs.file_seek(fd, 0, Whence::Set).unwrap();
        fs.file_read(fd, &mut byte).unwrap();
        assert_eq!(byte[0], 0xaa);
        fs.file_seek(fd, -1, Whence::End).unwrap();
        fs.file_read(fd, &mut byte).unwrap();
        assert_eq!(byte[0], 0xaa);
        // The splice boundaries.
        fs.file_seek(fd, 999_999, Whence::Set).unwrap();
        fs.file_read(fd, &mut byte).unwrap();
        assert_eq!(byte[0], 0xaa);
        fs.file_seek(fd, 1_001_024, Whence::Set).unwrap();
        fs.file_read(fd, &mut byte).unwrap();
        assert_eq!(byte[0], 0xaa);
    };
    verify(&mut fs, fd);
    fs.file_close(fd).unwrap();

    let mut fs = remount(fs);
    let fd = fs.file_open("/h").unwrap();
    assert_eq!(fs.file_size(fd).unwrap(), SIZE);
    verify(&mut fs, fd);
    fs.file_close(fd).unwrap();
}

#[test]
fn directory_gc_preserves_the_live_entries() {
    // S5: churn one directory hard enough to force compaction, then make
    // sure exactly the undeleted files remain visible.
    let mut fs = fresh();
    fs.dir_open("/d").unwrap();

    let payload = [0x5au8; 60];
    for round in 0..400 {
        let path = format!("/d/churn_file_{:03}", round % 8);
        let fd = fs.file_open(&path).unwrap();
        fs.file_seek(fd, 0, Whence::Set).unwrap();
        fs.file_write(fd, &payload).unwrap();
        if round % 2 == 0 {
            fs.file_delete(fd).unwrap();
        } else {
            fs.file_close(fd).unwrap();
            if round % 8 != 7 {
                fs.unlink(&path).unwrap();
            }
        }
    }
    for keep in 0..4 {
        let fd = fs.file_open(&format!("/d/keep_{keep}")).unwrap();
        fs.file_write(fd, &payload[..32]).unwrap();
        fs.file_close(fd).unwrap();
    }

    let mut fs = remount(fs);
    let dd = fs.dir_open("/d").unwrap();
    let mut names = Vec::new();
    while let Some(entry) = fs.dir_read(dd).unwrap() {
        assert_eq!(entry.kind, EntryKind::File);
        names.push(entry.name);
    }
    names.sort();
    let mut expected: Vec<String> = (0..4).map(|keep| format!("keep_{keep}")).collect();
    expected.push("churn_file_007".into());
    expected.sort();
    assert_eq!(names, expected);

    for name in names {
        let fd = fs.file_open(&format!("/d/{name}")).unwrap();
        let size = fs.file_size(fd).unwrap();
        assert!(size == 60 || size == 32);
        fs.file_close(fd).unwrap();
    }
}

#[test]
fn create_unlink_cycles_across_mounts() {
    // S6 (scaled down): thousands of create/unlink cycles with mounts
    // interspersed; every mount succeeds and wear stays bounded.
    // Enough cycles to exhaust the 13-bit id space once, forcing the id
    // planes to rotate and freed ids to come back.
    let mut fs = fresh();
    for cycle in 0..9000 {
        let fd = fs.file_open("/ai").unwrap();
        fs.file_write(fd, b"transient").unwrap();
        fs.file_close(fd).unwrap();
        fs.unlink("/ai").unwrap();
        if cycle % 500 == 499 {
            fs = remount(fs);
        }
    }
    let dev = fs.unmount().unwrap();
    assert!(dev.max_erase_count() < 200, "wear ran away: {}", dev.max_erase_count());
    let mut fs = Fs::mount(dev, cfg()).unwrap();
    let root = fs.dir_open("/").unwrap();
    while let Some(entry) = fs.dir_read(root).unwrap() {
        assert_ne!(entry.name, "ai");
    }
}

#[test]
fn nested_directories_resolve_and_enumerate() {
    let mut fs = fresh();
    fs.dir_open("/a").unwrap();
    fs.dir_open("/a/b").unwrap();
    let fd = fs.file_open("/a/b/long_name_beyond_inline_cache").unwrap();
    fs.file_write(fd, b"nested").unwrap();
    fs.file_close(fd).unwrap();

    let mut fs = remount(fs);
    let fd = fs.file_open("/a/b/long_name_beyond_inline_cache").unwrap();
    let mut back = [0u8; 6];
    fs.file_seek(fd, 0, Whence::Set).unwrap();
    fs.file_read(fd, &mut back).unwrap();
    assert_eq!(&back, b"nested");
    fs.file_close(fd).unwrap();

    let dd = fs.dir_open("/a").unwrap();
    let entry = fs.dir_read(dd).unwrap().unwrap();
    assert_eq!(entry.name, "b");
    assert_eq!(entry.kind, EntryKind::Dir);
    assert!(fs.dir_read(dd).unwrap().is_none());
}

#[test]
fn directory_with_subdirectory_refuses_deletion() {
    let mut fs = fresh();
    let dd = fs.dir_open("/outer").unwrap();
    fs.dir_open("/outer/inner").unwrap();
    assert!(fs.dir_delete(dd).is_err());
}

#[test]
fn deleting_a_directory_purges_its_files() {
    let mut fs = fresh();
    let dd = fs.dir_open("/victim").unwrap();
    let fd = fs.file_open("/victim/big").unwrap();
    fs.file_write(fd, &vec![7u8; 10_000]).unwrap();
    fs.file_close(fd).unwrap();
    fs.dir_delete(dd).unwrap();

    let mut fs = remount(fs);
    let root = fs.dir_open("/").unwrap();
    assert!(fs.dir_read(root).unwrap().is_none());
}

#[test]
fn error_paths() {
    let mut fs = fresh();

    // Too many open files.
    let fds: Vec<_> = (0..5)
        .map(|at| fs.file_open(&format!("/file_{at}")).unwrap())
        .collect();
    assert_eq!(fs.file_open("/one_more"), Err(Error::Fs(FsError::TooManyOpen)));
    for fd in fds {
        fs.file_close(fd).unwrap();
    }

    // Name length is bounded.
    let long = format!("/{}", "x".repeat(300));
    assert_eq!(fs.file_open(&long), Err(Error::Fs(FsError::NameTooLong)));

    // Unlinking something that never existed.
    assert_eq!(fs.unlink("/ghost"), Err(Error::Fs(FsError::NoEntry)));

    // Resolution fails without the parent.
    assert_eq!(fs.file_open("/no_dir/f"), Err(Error::Fs(FsError::NoFather)));

    // Seeking outside the file.
    let fd = fs.file_open("/seek").unwrap();
    fs.file_write(fd, b"0123").unwrap();
    assert_eq!(fs.file_seek(fd, 5, Whence::Set), Err(Error::Fs(FsError::Invalid)));
    assert_eq!(fs.file_seek(fd, -5, Whence::End), Err(Error::Fs(FsError::Invalid)));
    fs.file_close(fd).unwrap();

    // Stale descriptors are rejected.
    let fd = fs.file_open("/stale").unwrap();
    fs.file_close(fd).unwrap();
    assert_eq!(fs.file_read(fd, &mut [0u8; 1]), Err(Error::Fs(FsError::BadDescriptor)));
}

#[test]
fn file_max_is_enforced() {
    let mut small_limit = cfg();
    small_limit.file_max = 1024;
    let mut fs = Fs::format(RamNorFlash::new(4096, 8192), small_limit).unwrap();
    let fd = fs.file_open("/capped").unwrap();
    fs.file_write(fd, &[1u8; 1024]).unwrap();
    assert_eq!(fs.file_write(fd, &[1u8; 1]), Err(Error::Fs(FsError::FileTooBig)));
}

#[test]
fn unclean_shutdown_is_detected() {
    // A crash between mount and unmount leaves no commit record; the next
    // mount refuses the volume instead of trusting a stale cursor.
    let mut dev = RamNorFlash::new(4096, 8192);
    {
        let fs = Fs::format(&mut dev, cfg()).unwrap();
        fs.unmount().unwrap();
    }
    {
        let mut fs = Fs::mount(&mut dev, cfg()).unwrap();
        let fd = fs.file_open("/doomed").unwrap();
        fs.file_write(fd, b"never committed").unwrap();
        // Power loss: the filesystem is dropped without unmounting.
        drop(fs);
    }
    assert!(matches!(Fs::mount(&mut dev, cfg()), Err(Error::Corrupt(_))));
}

#[test]
fn committed_state_survives_the_crash_window() {
    // Everything written before the last unmount stays readable even if a
    // later session dies uncleanly and the volume is reformatted-free.
    let mut dev = RamNorFlash::new(4096, 8192);
    {
        let mut fs = Fs::format(&mut dev, cfg()).unwrap();
        let fd = fs.file_open("/kept").unwrap();
        fs.file_write(fd, b"durable").unwrap();
        fs.file_close(fd).unwrap();
        fs.unmount().unwrap();
    }
    let snapshot = dev.clone();
    {
        let mut fs = Fs::mount(&mut dev, cfg()).unwrap();
        let fd = fs.file_open("/kept").unwrap();
        fs.file_write(fd, b"chaos!!").unwrap();
        drop(fs);
    }
    // The pre-crash snapshot still mounts and holds the committed bytes.
    let mut fs = Fs::mount(snapshot, cfg()).unwrap();
    let fd = fs.file_open("/kept").unwrap();
    let mut back = [0u8; 7];
    fs.file_seek(fd, 0, Whence::Set).unwrap();
    fs.file_read(fd, &mut back).unwrap();
    assert_eq!(&back, b"durable");
}

#[test]
fn readdir_reports_both_kinds() {
    let mut fs = fresh();
    fs.dir_open("/docs").unwrap();
    let fd = fs.file_open("/notes").unwrap();
    fs.file_write(fd, b"x").unwrap();
    fs.file_close(fd).unwrap();

    let root = fs.dir_open("/").unwrap();
    let mut seen = Vec::new();
    while let Some(entry) = fs.dir_read(root).unwrap() {
        seen.push((entry.name, entry.kind));
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("docs".to_string(), EntryKind::Dir),
            ("notes".to_string(), EntryKind::File),
        ]
    );
}

#[test]
fn stats_count_allocator_and_header_work() {
    let fs = fresh();
    let stats = fs.stats();
    assert!(stats.sectors_allocated > 0);
    assert!(stats.header_rewrites > 0);
}
