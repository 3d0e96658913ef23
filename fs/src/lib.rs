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

//! A log-structured file system for raw NOR flash.
//!
//! The medium reads any byte, programs bits from 1 to 0 without erasure,
//! and erases whole sectors back to all-ones. On top of that this crate
//! provides a hierarchical namespace with POSIX-style file operations,
//! crash consistency built on two-step "program then validate" writes,
//! space reclamation by in-place invalidation plus compaction, and erase
//! wear distribution across allocation regions.

pub use cinder_ds::NorFlash;
pub use cinder_err::{CorruptError, Error, FsError, IoError, Result};

pub use crate::config::Config;

use cinder_err::FsError as Fse;
use log::{debug, error};
use zerocopy::IntoBytes;

use crate::cache::Io;
use crate::dir::{Dir, NameKind};
use crate::file::File;
use crate::head::{DataType, DHEAD_DELETE_SET};
use crate::manager::Manager;
use crate::map::IdMap;
use crate::record::{Commit, DirName, RecordView, HEAD_SIZE};
use crate::superblock::SuperBlock;
use crate::tree::{NameKey, Tree, TreeEntry};

pub mod config;

mod cache;
mod dir;
mod file;
mod head;
mod manager;
mod map;
mod record;
mod superblock;
mod tree;
mod wl;

/// An erased 32-bit word; doubles as the in-RAM "no value" sentinel for
/// fields that mirror flash content.
pub(crate) const NULL: u32 = 0xffff_ffff;

pub(crate) const VERSION: u32 = 0x0001_0000;
pub(crate) const FS_NAME: [u8; 8] = *b"NF2FS\0\0\0";

pub(crate) const NAME_MAX: u32 = 255;
pub(crate) const FILE_MAX_SIZE: u32 = 33_554_432;
pub(crate) const ID_MAX: u32 = 8192;
pub(crate) const REGION_NUM_MAX: u32 = 1024;
pub(crate) const RAM_REGION_NUM: usize = 4;
pub(crate) const WL_START: u32 = 3000;
pub(crate) const WL_MIGRATE_THRESHOLD: u32 = 2 * RAM_REGION_NUM as u32 * 50;
pub(crate) const FILE_LIST_MAX: usize = 5;
pub(crate) const DIR_LIST_MAX: usize = 10;
pub(crate) const WL_SECTOR_NUM: u32 = 1;
pub(crate) const ENTRY_NAME_LEN: usize = 12;
pub(crate) const FILE_SIZE_THRESHOLD: u32 = 64;
pub(crate) const FILE_CACHE_SIZE: usize = 512;
pub(crate) const FILE_INDEX_NUM: usize = 20;
pub(crate) const FILE_INDEX_MAX: usize = 42;

pub(crate) const ID_SUPER: u32 = 0;
pub(crate) const ID_ROOT: u32 = 1;

pub(crate) fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

/// Sectors needed for the two sector-map planes.
pub(crate) fn smap_sectors(cfg: &Config) -> u32 {
    align_up(2 * cfg.sector_count / 8, cfg.sector_size) / cfg.sector_size
}

/// Runtime counters, superseding the diagnostic globals of embedded
/// builds.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsStats {
    /// Sectors handed out by the allocator since mount.
    pub sectors_allocated: u64,
    /// Single-word header reprograms (commit, delete, state flips).
    pub header_rewrites: u64,
}

/// Handle to an open file; stable until `file_close` or `file_delete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDesc(u32);

/// Handle to an open directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirDesc(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

pub struct Fs<D: NorFlash> {
    pub(crate) io: Io<D>,
    pub(crate) superblock: SuperBlock,
    pub(crate) manager: Manager,
    pub(crate) tree: Tree,
    pub(crate) id_map: IdMap,
    pub(crate) files: Vec<File>,
    pub(crate) dirs: Vec<Dir>,
}

impl<D: NorFlash> Fs<D> {
    fn new_raw(dev: D, cfg: Config) -> Result<Self> {
        cfg.check()?;
        let region_size = cfg.region_size();
        let tree_capacity = (cfg.cache_size as usize / 32).max(1);
        let ids_in_buffer = ID_MAX / cfg.region_cnt;
        let smap_num = smap_sectors(&cfg);
        let manager = Manager::new(&cfg, region_size, smap_num);
        Ok(Self {
            io: Io::new(dev, cfg),
            superblock: SuperBlock::new(),
            manager,
            tree: Tree::new(tree_capacity),
            id_map: IdMap::new(ids_in_buffer),
            files: Vec::new(),
            dirs: Vec::new(),
        })
    }

    /// Formats the device and returns the live, mounted filesystem. The
    /// resume cursor is only persisted by [`Fs::unmount`].
    pub fn format(dev: D, cfg: Config) -> Result<Self> {
        let mut fs = Self::new_raw(dev, cfg)?;
        fs.do_format()?;
        Ok(fs)
    }

    /// Mounts the filesystem; an entirely blank device is formatted first.
    pub fn mount(dev: D, cfg: Config) -> Result<Self> {
        let mut fs = Self::new_raw(dev, cfg)?;
        match fs.do_mount() {
            Ok(()) => Ok(fs),
            Err(Error::Io(IoError::NoData)) => {
                debug!("no superblock found, formatting");
                fs.do_format()?;
                Ok(fs)
            }
            Err(err) => Err(err),
        }
    }

    /// Flushes every open object, persists the resume cursor and returns
    /// the device.
    pub fn unmount(mut self) -> Result<D> {
        let mut i = 0;
        while i < self.files.len() {
            self.file_flush(i)?;
            i += 1;
        }

        let mut i = 0;
        while i < self.dirs.len() {
            self.dir_ospace_prog(i)?;
            i += 1;
        }

        // A compaction triggered by the old-space records may have pulled
        // open payloads back into RAM; settle until everything is on
        // flash.
        for _ in 0..32 {
            let Some(index) = self.files.iter().position(|file| file.cache.dirty) else {
                break;
            };
            self.file_flush(index)?;
        }
        if self.files.iter().any(|file| file.cache.dirty) {
            error!("open files would not settle at unmount");
            return Err(Error::Corrupt(CorruptError::Calculation));
        }

        self.region_map_flush()?;

        let commit = self.commit_record();
        self.prog_in_superblock(commit.as_bytes())?;

        self.smap_flush()?;
        self.io.cache_flush()?;
        self.io.dev.sync()?;
        let Fs { io, .. } = self;
        Ok(io.dev)
    }

    pub fn stats(&self) -> FsStats {
        self.io.stats
    }

    pub(crate) fn commit_record(&self) -> Commit {
        let next_id = if self.id_map.free_map.region == NULL {
            NULL
        } else {
            self.id_map.free_map.region * self.id_map.ids_in_buffer + self.id_map.free_map.cursor
        };
        let next_dir = if self.manager.dir_map.region == NULL {
            NULL
        } else {
            self.manager.dir_map.region * self.manager.region_size + self.manager.dir_map.cursor
        };
        let next_bfile = if self.manager.bfile_map.region == NULL {
            NULL
        } else {
            self.manager.bfile_map.region * self.manager.region_size + self.manager.bfile_map.cursor
        };
        Commit {
            head: head::mkdhead(ID_SUPER, DataType::Commit, core::mem::size_of::<Commit>() as u32)
                .into(),
            next_id: next_id.into(),
            scan_times: self.manager.scan_times.into(),
            next_dir_sector: next_dir.into(),
            next_bfile_sector: next_bfile.into(),
            reserve_region: self.manager.region_map.reserve.into(),
        }
    }

    fn do_format(&mut self) -> Result<()> {
        debug!("formatting: {:?}", self.io.cfg);
        self.manager.scan_times = 0;
        self.manager.smap_begin = 2;
        self.manager.smap_off = 0;
        self.manager.etimes.fill(0);

        // Region 0 is the meta region, region 1 the first dir region.
        self.manager.region_map.reserve = 0;
        self.next_smap(manager::MapKind::Meta)?;
        self.next_smap(manager::MapKind::Dir)?;

        // Sectors 0 and 1 for the superblock, then the sector-map store
        // and the id-map store.
        let (begin, _etimes) = self.map_sector_alloc(2 + smap_sectors(&self.io.cfg) + 1)?;
        debug_assert_eq!(begin, 0);

        let root_tail = self.sector_alloc(head::SectorType::Dir, 1, NULL, ID_ROOT, ID_SUPER)?;
        self.tree.add(TreeEntry {
            id: ID_ROOT,
            father_id: ID_SUPER,
            name_sector: NULL,
            name_off: NULL,
            tail_sector: root_tail,
            name: NameKey::for_name(b""),
        });
        self.dirs.push(Dir::fresh(ID_ROOT, ID_SUPER, root_tail));

        self.id_map.begin = 2 + smap_sectors(&self.io.cfg);
        self.id_map.off = 0;
        self.id_map.etimes = 0;
        let (begin, off, bits) = (self.id_map.begin, self.id_map.off, self.id_map.ids_in_buffer);
        self.id_map.free_map.load(&mut self.io, 0, bits, begin, off)?;

        // Ids 0 and 1 belong to the superblock and the root directory.
        for expect in 0..2 {
            let id = self.id_alloc()?;
            debug_assert_eq!(id, expect);
        }

        self.superblock_change(false)?;
        Ok(())
    }

    fn do_mount(&mut self) -> Result<()> {
        self.superblock.sector = self.select_supersector()?;
        self.superblock.free_off = HEAD_SIZE;
        debug!("mounting from super sector {}", self.superblock.sector);

        let super_sector = self.superblock.sector;
        let mut pos = self.superblock.free_off;
        let mut root: Option<(u32, u32)> = None; // (tail, record off)
        let commit_vals;
        let commit_pos;
        loop {
            if pos + HEAD_SIZE > self.io.cfg.sector_size {
                error!("superblock log ran past the sector without a commit");
                return Err(Error::Corrupt(CorruptError::Data));
            }
            let dhead = self.io.read_word(super_sector, pos)?;
            head::dhead_check(dhead, None, None)?;
            if dhead == NULL {
                error!("hit free space before a commit record");
                return Err(Error::Corrupt(CorruptError::Data));
            }
            let len = head::dhead_dsize(dhead);
            if len < HEAD_SIZE || pos + len > self.io.cfg.sector_size {
                return Err(Error::Corrupt(CorruptError::Data));
            }
            let mut bytes = vec![0u8; len as usize];
            self.io.cache_read(super_sector, pos, &mut bytes)?;

            match RecordView::parse(dhead, &bytes)? {
                RecordView::SuperMessage(message) => {
                    let cfg = &self.io.cfg;
                    if message.fs_name != FS_NAME
                        || message.version.get() != VERSION
                        || message.sector_size.get() != cfg.sector_size
                        || message.sector_count.get() != cfg.sector_count
                        || message.name_max.get() != cfg.name_max
                        || message.file_max.get() != cfg.file_max
                        || message.region_cnt.get() != cfg.region_cnt
                    {
                        error!("superblock message does not match the config");
                        return Err(Error::Corrupt(CorruptError::Config));
                    }
                }
                RecordView::IdMap { addr, erase_times } => {
                    if erase_times.is_empty() {
                        return Err(Error::Corrupt(CorruptError::Data));
                    }
                    self.id_map.begin = addr.begin.get();
                    self.id_map.off = addr.off.get();
                    self.id_map.etimes = erase_times[0].get();
                }
                RecordView::SectorMap { addr, erase_times } => {
                    if erase_times.len() != smap_sectors(&self.io.cfg) as usize {
                        return Err(Error::Corrupt(CorruptError::Data));
                    }
                    self.manager.smap_begin = addr.begin.get();
                    self.manager.smap_off = addr.off.get();
                    for (stored, read) in self.manager.etimes.iter_mut().zip(erase_times) {
                        *stored = read.get();
                    }
                }
                RecordView::RegionMap { map } => {
                    let len = self.manager.region_map.dir_region.len();
                    if map.len() < 2 * len {
                        return Err(Error::Corrupt(CorruptError::Data));
                    }
                    self.manager.region_map.assign(map, super_sector, pos);
                }
                RecordView::WlAddr(addr) => {
                    self.manager.wl = Some(wl::Wl::from_addr(
                        addr.begin.get(),
                        addr.off.get(),
                        addr.erase_times.get(),
                    ));
                }
                RecordView::DirName { tail, .. } => {
                    if head::dhead_id(dhead) != ID_ROOT {
                        return Err(Error::Corrupt(CorruptError::Data));
                    }
                    root = Some((tail, pos));
                }
                RecordView::Delete => {}
                RecordView::Commit(commit) => {
                    commit_vals = Commit {
                        head: commit.head,
                        next_id: commit.next_id,
                        scan_times: commit.scan_times,
                        next_dir_sector: commit.next_dir_sector,
                        next_bfile_sector: commit.next_bfile_sector,
                        reserve_region: commit.reserve_region,
                    };
                    commit_pos = pos;
                    pos += len;
                    break;
                }
                _ => {
                    error!("unexpected record in the superblock log");
                    return Err(Error::Corrupt(CorruptError::Data));
                }
            }
            pos += len;
        }
        self.superblock.free_off = pos;

        let Some((root_tail, root_off)) = root else {
            error!("no root directory record before the commit");
            return Err(Error::Corrupt(CorruptError::Data));
        };

        self.tree.add(TreeEntry {
            id: ID_ROOT,
            father_id: ID_SUPER,
            name_sector: super_sector,
            name_off: root_off,
            tail_sector: root_tail,
            name: NameKey::for_name(b""),
        });

        self.init_with_commit(&commit_vals)?;
        self.dir_lowopen(root_tail, ID_ROOT, ID_SUPER, super_sector, root_off)?;

        // Consume the commit; a fresh one is appended at unmount, so an
        // unclean shutdown is detected as a missing commit.
        self.io.head_validate(super_sector, commit_pos, DHEAD_DELETE_SET)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Path resolution
    // ------------------------------------------------------------------

    /// Does `entry` carry `name`? Long names keep only a hash in RAM and
    /// are settled against the flash copy.
    fn tree_name_matches(&mut self, entry: &TreeEntry, name: &[u8]) -> Result<bool> {
        match &entry.name {
            NameKey::Inline { len, bytes } => {
                Ok(*len as usize == name.len() && &bytes[..name.len().min(ENTRY_NAME_LEN)] == name)
            }
            NameKey::Hash(hash) => {
                if *hash != tree::djb2(name) {
                    return Ok(false);
                }
                let dhead = self.io.read_word(entry.name_sector, entry.name_off)?;
                head::dhead_check(dhead, Some(entry.id), None)?;
                let stored_len = head::dhead_dsize(dhead) - core::mem::size_of::<DirName>() as u32;
                if stored_len as usize != name.len() {
                    return Ok(false);
                }
                let mut stored = vec![0u8; name.len()];
                self.io.cache_read(
                    entry.name_sector,
                    entry.name_off + core::mem::size_of::<DirName>() as u32,
                    &mut stored,
                )?;
                Ok(stored == name)
            }
        }
    }

    fn tree_name_matches_ok(&mut self, entry: &TreeEntry, name: &[u8]) -> bool {
        self.tree_name_matches(entry, name).unwrap_or(false)
    }

    /// Resolves every component but the last, returning the parent
    /// directory's tree entry. Components missing from the RAM tree are
    /// looked up in the parent's on-flash log, which caches them.
    pub(crate) fn father_dir_find(&mut self, components: &[&str]) -> Result<TreeEntry> {
        let mut current = self
            .tree
            .get(0)
            .cloned()
            .ok_or(Error::Corrupt(CorruptError::TreeEntry))?;
        debug_assert_eq!(current.id, ID_ROOT);

        for component in components {
            let name = component.as_bytes();
            if name.len() as u32 > self.io.cfg.name_max {
                return Err(Error::Fs(Fse::NameTooLong));
            }

            let mut next: Option<TreeEntry> = None;
            let candidates: Vec<usize> = self.tree.candidates(current.id).collect();
            for index in candidates {
                let Some(entry) = self.tree.get(index).cloned() else {
                    continue;
                };
                if self.tree_name_matches(&entry, name)? {
                    next = Some(entry);
                    break;
                }
            }

            if next.is_none() {
                let found = self
                    .dtraverse_name(current.tail_sector, name, NameKind::Dir)?
                    .ok_or(Error::Fs(Fse::NoFather))?;
                next = Some(TreeEntry {
                    id: found.id,
                    father_id: current.id,
                    name_sector: found.name_sector,
                    name_off: found.name_off,
                    tail_sector: found.tail,
                    name: NameKey::for_name(name),
                });
            }
            current = next.unwrap();
        }
        Ok(current)
    }

    // ------------------------------------------------------------------
    // File API
    // ------------------------------------------------------------------

    pub fn file_open(&mut self, path: &str) -> Result<FileDesc> {
        if self.files.len() >= FILE_LIST_MAX {
            return Err(Error::Fs(Fse::TooManyOpen));
        }
        let (components, name) = tree::split_path(path);
        if name.is_empty() {
            return Err(Error::Fs(Fse::Invalid));
        }
        if name.len() as u32 > self.io.cfg.name_max {
            return Err(Error::Fs(Fse::NameTooLong));
        }

        let father = self.father_dir_find(&components)?;
        let father_index = self.dir_lowopen(
            father.tail_sector,
            father.id,
            father.father_id,
            father.name_sector,
            father.name_off,
        )?;

        let tail = self.dirs[father_index].tail_sector;
        let index = match self.dtraverse_name(tail, name.as_bytes(), NameKind::File)? {
            Some(found) => self.file_lowopen(
                father_index,
                found.id,
                found.name_sector,
                found.name_off,
                name.len() as u32,
            )?,
            None => self.create_file(father_index, name.as_bytes())?,
        };
        Ok(FileDesc(self.files[index].id))
    }

    pub fn file_close(&mut self, fd: FileDesc) -> Result<()> {
        let index = self.file_index(fd.0)?;
        self.file_flush(index)?;
        self.io.cache_flush()?;
        self.files.remove(index);
        Ok(())
    }

    pub fn file_read(&mut self, fd: FileDesc, buf: &mut [u8]) -> Result<usize> {
        let index = self.file_index(fd.0)?;
        let file = &self.files[index];
        let n = (buf.len() as u32).min(file.file_size - file.file_pos) as usize;
        if n == 0 {
            return Ok(0);
        }
        if file.file_size <= FILE_SIZE_THRESHOLD {
            self.small_file_read(index, buf, n)?;
        } else {
            self.big_file_read(index, buf, n)?;
        }
        Ok(n)
    }

    pub fn file_write(&mut self, fd: FileDesc, buf: &[u8]) -> Result<usize> {
        let index = self.file_index(fd.0)?;
        if self.files[index].file_pos + buf.len() as u32 > self.io.cfg.file_max {
            return Err(Error::Fs(Fse::FileTooBig));
        }

        // Big-file runs must stay inside one region, so a large write is
        // carved into region-sized pieces; the dispatch is re-evaluated
        // for every piece as the file grows through the inline threshold.
        let payload_per = self.io.cfg.sector_size - record::BFILE_SECTOR_HEAD_SIZE;
        let max_piece = (self.manager.region_size / 2).max(1) * payload_per;
        let mut written = 0usize;
        while written < buf.len() {
            let piece = &buf[written..buf.len().min(written + max_piece as usize)];
            let (pos, size) = (self.files[index].file_pos, self.files[index].file_size);
            let n = piece.len() as u32;
            if size <= FILE_SIZE_THRESHOLD && pos + n <= FILE_SIZE_THRESHOLD {
                self.small_file_write(index, piece)?;
            } else if size <= FILE_SIZE_THRESHOLD {
                self.s2b_file_write(index, piece)?;
            } else {
                self.big_file_write(index, piece)?;
            }
            written += piece.len();
        }
        Ok(buf.len())
    }

    pub fn file_seek(&mut self, fd: FileDesc, off: i64, whence: Whence) -> Result<u32> {
        let index = self.file_index(fd.0)?;
        let file = &mut self.files[index];
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => file.file_pos as i64,
            Whence::End => file.file_size as i64,
        };
        let pos = base + off;
        if pos < 0 || pos > file.file_size as i64 {
            return Err(Error::Fs(Fse::Invalid));
        }
        file.file_pos = pos as u32;
        Ok(file.file_pos)
    }

    pub fn file_sync(&mut self, fd: FileDesc) -> Result<()> {
        let index = self.file_index(fd.0)?;
        self.file_flush(index)?;
        self.io.cache_flush()
    }

    pub fn file_delete(&mut self, fd: FileDesc) -> Result<()> {
        let index = self.file_index(fd.0)?;
        self.file_delete_inner(index)
    }

    pub fn file_size(&self, fd: FileDesc) -> Result<u32> {
        let index = self.file_index(fd.0)?;
        Ok(self.files[index].file_size)
    }

    /// Deletes the file at `path`, opening it first if needed.
    pub fn unlink(&mut self, path: &str) -> Result<()> {
        let (components, name) = tree::split_path(path);
        if name.is_empty() {
            return Err(Error::Fs(Fse::Invalid));
        }
        let father = self.father_dir_find(&components)?;
        let father_index = self.dir_lowopen(
            father.tail_sector,
            father.id,
            father.father_id,
            father.name_sector,
            father.name_off,
        )?;
        let tail = self.dirs[father_index].tail_sector;
        let found = self
            .dtraverse_name(tail, name.as_bytes(), NameKind::File)?
            .ok_or(Error::Fs(Fse::NoEntry))?;
        let index = self.file_lowopen(
            father_index,
            found.id,
            found.name_sector,
            found.name_off,
            name.len() as u32,
        )?;
        self.file_delete_inner(index)
    }

    // ------------------------------------------------------------------
    // Directory API
    // ------------------------------------------------------------------

    pub fn dir_open(&mut self, path: &str) -> Result<DirDesc> {
        if self.dirs.len() >= DIR_LIST_MAX {
            return Err(Error::Fs(Fse::TooManyOpen));
        }
        let (components, name) = tree::split_path(path);
        if name.is_empty() {
            // The root is opened at mount and immortal.
            debug_assert!(!self.dirs.is_empty());
            return Ok(DirDesc(ID_ROOT));
        }
        if name.len() as u32 > self.io.cfg.name_max {
            return Err(Error::Fs(Fse::NameTooLong));
        }

        let father = self.father_dir_find(&components)?;
        let father_index = self.dir_lowopen(
            father.tail_sector,
            father.id,
            father.father_id,
            father.name_sector,
            father.name_off,
        )?;
        let father_id = self.dirs[father_index].id;

        // The RAM tree first, the parent's on-flash log second.
        let candidates: Vec<usize> = self.tree.candidates(father_id).collect();
        for index in candidates {
            let Some(entry) = self.tree.get(index).cloned() else {
                continue;
            };
            if self.tree_name_matches_ok(&entry, name.as_bytes()) {
                let index = self.dir_lowopen(
                    entry.tail_sector,
                    entry.id,
                    entry.father_id,
                    entry.name_sector,
                    entry.name_off,
                )?;
                return Ok(DirDesc(self.dirs[index].id));
            }
        }

        let tail = self.dirs[father_index].tail_sector;
        let index = match self.dtraverse_name(tail, name.as_bytes(), NameKind::Dir)? {
            Some(found) => self.dir_lowopen(
                found.tail,
                found.id,
                father_id,
                found.name_sector,
                found.name_off,
            )?,
            None => self.create_dir(father_index, name.as_bytes())?,
        };
        Ok(DirDesc(self.dirs[index].id))
    }

    pub fn dir_close(&mut self, dd: DirDesc) -> Result<()> {
        if dd.0 == ID_ROOT {
            return Err(Error::Fs(Fse::Invalid));
        }
        let index = self.dir_index(dd.0)?;
        if self.files.iter().any(|file| file.father_id == dd.0) {
            error!("directory {} still has open files", dd.0);
            return Err(Error::Fs(Fse::Invalid));
        }
        self.dir_ospace_prog(index)?;
        self.io.cache_flush()?;
        self.dirs.remove(index);
        Ok(())
    }

    pub fn dir_delete(&mut self, dd: DirDesc) -> Result<()> {
        if dd.0 == ID_ROOT {
            return Err(Error::Fs(Fse::Invalid));
        }
        let index = self.dir_index(dd.0)?;
        if self.files.iter().any(|file| file.father_id == dd.0) {
            return Err(Error::Fs(Fse::Invalid));
        }
        self.dir_delete_inner(index)
    }

    pub fn dir_read(&mut self, dd: DirDesc) -> Result<Option<DirEntry>> {
        let index = self.dir_index(dd.0)?;
        self.dir_read_next(index)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use cinder_ds_ram::RamNorFlash;

    /// A small volume: 128 KiB in 1 KiB sectors, 16 regions of 8 sectors.
    pub fn small_cfg() -> Config {
        Config {
            read_size: 1,
            prog_size: 1,
            sector_size: 1024,
            sector_count: 128,
            cache_size: 128,
            region_cnt: 16,
            name_max: 255,
            file_max: FILE_MAX_SIZE,
        }
    }

    pub fn small_fs() -> Fs<RamNorFlash> {
        Fs::format(RamNorFlash::new(1024, 128), small_cfg()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiples() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn smap_sectors_covers_both_planes() {
        let cfg = Config {
            read_size: 1,
            prog_size: 1,
            sector_size: 4096,
            sector_count: 8192,
            cache_size: 256,
            region_cnt: 128,
            name_max: 255,
            file_max: FILE_MAX_SIZE,
        };
        assert_eq!(smap_sectors(&cfg), 1);
    }
}
