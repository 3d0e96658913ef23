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

//! The directory store.
//!
//! A directory is a singly-linked chain of sectors, newest first, each
//! holding an append log of self-describing records: names of children,
//! inline small-file payloads, big-file indexes, old-space accumulators
//! and in-place delete tombstones. Garbage collection copies the live
//! records into a fresh chain and retires the old one.

use cinder_ds::NorFlash;
use cinder_err::{CorruptError, Error, FsError, Result};
use log::{debug, error};
use zerocopy::IntoBytes;

use crate::cache::{Io, ProgKind};
use crate::head::{self, DataType, SectorState, SectorType, SHEAD_OLD_SET};
use crate::record::{
    DirName, DirOspace, IndexEntry, RecordView, DIR_SECTOR_HEAD_SIZE, HEAD_SIZE, INDEX_ENTRY_SIZE,
};
use crate::tree::{NameKey, TreeEntry};
use crate::{DirEntry, EntryKind, Fs, ID_ROOT, ID_SUPER, NULL};

/// An open directory. Positions mirror flash content, so `NULL` means
/// "not there".
pub(crate) struct Dir {
    pub id: u32,
    pub father_id: u32,
    /// Reclaimable bytes in the chain; GC trigger.
    pub old_space: u32,
    /// readdir cursor.
    pub pos_sector: u32,
    pub pos_off: u32,
    pub pos_presector: u32,
    /// Position of this directory's name record in its parent (the
    /// superblock for root).
    pub name_sector: u32,
    pub name_off: u32,
    pub namelen: u32,
    pub tail_sector: u32,
    pub tail_off: u32,
}

impl Dir {
    pub fn fresh(id: u32, father_id: u32, tail_sector: u32) -> Self {
        Self {
            id,
            father_id,
            old_space: 0,
            pos_sector: NULL,
            pos_off: NULL,
            pos_presector: NULL,
            name_sector: NULL,
            name_off: NULL,
            namelen: 0,
            tail_sector,
            tail_off: DIR_SECTOR_HEAD_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NameKind {
    File,
    Dir,
}

/// A located name record.
pub(crate) struct FoundName {
    pub id: u32,
    pub name_sector: u32,
    pub name_off: u32,
    /// Tail of the found directory; `NULL` for files.
    pub tail: u32,
}

pub(crate) enum WalkEvent {
    /// Entered a sector of the chain.
    Prefix { sector: u32, pre_sector: u32 },
    /// A record, committed or tombstoned; `head` has passed the header
    /// check.
    Record { sector: u32, off: u32, head: u32 },
    /// Ran out of records in this sector. `end_off` is the first free
    /// byte; `more` tells whether the chain continues.
    SectorEnd { sector: u32, end_off: u32, more: bool },
    End,
}

/// Streaming cursor over one directory chain, tail first.
pub(crate) struct DirWalk {
    pub sector: u32,
    pub off: u32,
    pub pre: u32,
    pub owner: u32,
    pub entered: bool,
    pub done: bool,
}

impl DirWalk {
    pub fn new(tail: u32) -> Self {
        Self {
            sector: tail,
            off: 0,
            pre: NULL,
            owner: NULL,
            entered: false,
            done: tail == NULL,
        }
    }

    /// Resumes from a persisted cursor (readdir).
    pub fn resume(sector: u32, off: u32, pre: u32) -> Self {
        Self {
            sector,
            off,
            pre,
            owner: NULL,
            entered: off != 0,
            done: sector == NULL,
        }
    }

    pub fn next<D: NorFlash>(&mut self, io: &mut Io<D>) -> Result<WalkEvent> {
        loop {
            if self.done {
                return Ok(WalkEvent::End);
            }
            if !self.entered {
                let mut prefix = [0u8; DIR_SECTOR_HEAD_SIZE as usize];
                io.cache_read(self.sector, 0, &mut prefix)?;
                let shead = u32::from_le_bytes(prefix[0..4].try_into().unwrap());
                head::shead_check(shead, Some(SectorState::Using), Some(SectorType::Dir))?;
                self.pre = u32::from_le_bytes(prefix[4..8].try_into().unwrap());
                if self.owner == NULL {
                    self.owner = u32::from_le_bytes(prefix[8..12].try_into().unwrap());
                }
                self.off = DIR_SECTOR_HEAD_SIZE;
                self.entered = true;
                return Ok(WalkEvent::Prefix {
                    sector: self.sector,
                    pre_sector: self.pre,
                });
            }

            if self.off + HEAD_SIZE > io.cfg.sector_size {
                return Ok(self.sector_end(io.cfg.sector_size.min(self.off)));
            }
            let dhead = io.read_word(self.sector, self.off)?;
            head::dhead_check(dhead, None, None)?;
            if dhead == NULL {
                let end = self.off;
                return Ok(self.sector_end(end));
            }
            let len = head::dhead_dsize(dhead);
            if len < HEAD_SIZE || self.off + len > io.cfg.sector_size {
                error!("record of length {len} at ({}, {})", self.sector, self.off);
                return Err(Error::Corrupt(CorruptError::Calculation));
            }
            let event = WalkEvent::Record {
                sector: self.sector,
                off: self.off,
                head: dhead,
            };
            self.off += len;
            return Ok(event);
        }
    }

    fn sector_end(&mut self, end_off: u32) -> WalkEvent {
        let more = self.pre != NULL;
        let event = WalkEvent::SectorEnd {
            sector: self.sector,
            end_off,
            more,
        };
        if more {
            self.sector = self.pre;
            self.pre = NULL;
            self.off = 0;
            self.entered = false;
        } else {
            self.done = true;
        }
        event
    }
}

impl<D: NorFlash> Fs<D> {
    pub(crate) fn dir_index(&self, id: u32) -> Result<usize> {
        self.dirs
            .iter()
            .position(|dir| dir.id == id)
            .ok_or(Error::Fs(FsError::DirNotOpen))
    }

    /// Opens a directory unless it already is, rebuilding `old_space` and
    /// the append position from the chain.
    pub(crate) fn dir_lowopen(
        &mut self,
        tail: u32,
        id: u32,
        father_id: u32,
        name_sector: u32,
        name_off: u32,
    ) -> Result<usize> {
        if let Some(index) = self.dirs.iter().position(|dir| dir.id == id) {
            return Ok(index);
        }

        let namelen = if name_sector == NULL {
            0
        } else {
            let dhead = self.io.read_word(name_sector, name_off)?;
            head::dhead_check(dhead, Some(id), None)?;
            head::dhead_dsize(dhead) - core::mem::size_of::<DirName>() as u32
        };

        let mut dir = Dir::fresh(id, father_id, tail);
        dir.name_sector = name_sector;
        dir.name_off = name_off;
        dir.namelen = namelen;
        self.dirs.push(dir);
        let index = self.dirs.len() - 1;
        match self.dtraverse_ospace(index, tail) {
            Ok(()) => Ok(index),
            Err(err) => {
                self.dirs.pop();
                Err(err)
            }
        }
    }

    /// Rebuilds the directory's reclaimable-byte count and its append
    /// position: delete tombstones, superseded old-space records and the
    /// unreachable slack of non-tail sectors all count as old space.
    fn dtraverse_ospace(&mut self, index: usize, tail: u32) -> Result<()> {
        let sector_size = self.io.cfg.sector_size;
        self.dirs[index].tail_sector = tail;
        self.dirs[index].tail_off = sector_size;
        self.dirs[index].old_space = 0;

        let mut old_space = 0u32;
        let mut first_sector = true;
        let mut walk = DirWalk::new(tail);
        loop {
            match walk.next(&mut self.io)? {
                WalkEvent::Prefix { .. } => {}
                WalkEvent::Record { head, .. } => {
                    match DataType::from_bits(head::dhead_type(head)) {
                        Some(DataType::Delete) | Some(DataType::DirOspace) => {
                            old_space += head::dhead_dsize(head);
                        }
                        _ => {}
                    }
                }
                WalkEvent::SectorEnd { end_off, .. } => {
                    if first_sector {
                        self.dirs[index].tail_off = end_off;
                        first_sector = false;
                    } else {
                        old_space += sector_size - end_off;
                    }
                }
                WalkEvent::End => break,
            }
        }
        self.dirs[index].old_space = old_space;
        Ok(())
    }

    /// Locates a name record of `kind` in the chain starting at
    /// `begin_sector`. Directory hits are inserted into the RAM tree.
    pub(crate) fn dtraverse_name(
        &mut self,
        begin_sector: u32,
        name: &[u8],
        kind: NameKind,
    ) -> Result<Option<FoundName>> {
        let mut walk = DirWalk::new(begin_sector);
        loop {
            match walk.next(&mut self.io)? {
                WalkEvent::Record { sector, off, head } => {
                    let typ = DataType::from_bits(head::dhead_type(head));
                    let wanted = match (kind, typ) {
                        (NameKind::Dir, Some(DataType::DirName | DataType::NDirName)) => true,
                        (NameKind::File, Some(DataType::FileName | DataType::NFileName)) => true,
                        _ => false,
                    };
                    if !wanted {
                        continue;
                    }
                    let prefix = match kind {
                        NameKind::Dir => core::mem::size_of::<DirName>() as u32,
                        NameKind::File => HEAD_SIZE,
                    };
                    let len = head::dhead_dsize(head);
                    if len < prefix || (len - prefix) as usize != name.len() {
                        continue;
                    }
                    let mut bytes = vec![0u8; len as usize];
                    self.io.cache_read(sector, off, &mut bytes)?;
                    if &bytes[prefix as usize..] != name {
                        continue;
                    }

                    let id = head::dhead_id(head);
                    let tail = match kind {
                        NameKind::Dir => {
                            let tail = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
                            self.tree.add(TreeEntry {
                                id,
                                father_id: walk.owner,
                                name_sector: sector,
                                name_off: off,
                                tail_sector: tail,
                                name: NameKey::for_name(name),
                            });
                            tail
                        }
                        NameKind::File => NULL,
                    };
                    return Ok(Some(FoundName {
                        id,
                        name_sector: sector,
                        name_off: off,
                        tail,
                    }));
                }
                WalkEvent::End => return Ok(None),
                _ => {}
            }
        }
    }

    /// Finds the file's payload record (inline data or extent index) and
    /// loads it into the file's payload cache.
    pub(crate) fn dtraverse_data(&mut self, file_index: usize, begin_sector: u32) -> Result<()> {
        let file_id = self.files[file_index].id;
        let mut walk = DirWalk::new(begin_sector);
        loop {
            match walk.next(&mut self.io)? {
                WalkEvent::Record { sector, off, head } => {
                    let typ = DataType::from_bits(head::dhead_type(head));
                    if !matches!(typ, Some(DataType::SfileData | DataType::BfileIndex))
                        || head::dhead_id(head) != file_id
                    {
                        continue;
                    }
                    let len = head::dhead_dsize(head) as usize;
                    {
                        let (files, io) = (&mut self.files, &mut self.io);
                        io.cache_read(sector, off, &mut files[file_index].cache.buffer[..len])?;
                    }
                    let file_size = {
                        let cache = &mut self.files[file_index].cache;
                        cache.sector = sector;
                        cache.off = off;
                        cache.size = len as u32;
                        cache.dirty = false;
                        if typ == Some(DataType::SfileData) {
                            len as u32 - HEAD_SIZE
                        } else {
                            let entries = (len as u32 - HEAD_SIZE) / INDEX_ENTRY_SIZE;
                            let mut total = 0;
                            for i in 0..entries as usize {
                                let at = HEAD_SIZE as usize + i * INDEX_ENTRY_SIZE as usize + 8;
                                total += u32::from_le_bytes(
                                    cache.buffer[at..at + 4].try_into().unwrap(),
                                );
                            }
                            total
                        }
                    };
                    self.files[file_index].file_size = file_size;
                    return Ok(());
                }
                WalkEvent::End => {
                    // Never synced: an empty file.
                    let cache = &mut self.files[file_index].cache;
                    cache.sector = NULL;
                    cache.off = NULL;
                    cache.size = 0;
                    cache.dirty = false;
                    self.files[file_index].file_size = 0;
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    /// Reclaims the extents of every live big-file index in the chain and
    /// releases the ids of the files still named there. Used when a whole
    /// directory goes away.
    pub(crate) fn dtraverse_bfile_delete(&mut self, index: usize) -> Result<()> {
        let tail = self.dirs[index].tail_sector;
        let mut walk = DirWalk::new(tail);
        loop {
            match walk.next(&mut self.io)? {
                WalkEvent::Record { sector, off, head } => {
                    match DataType::from_bits(head::dhead_type(head)) {
                        Some(DataType::BfileIndex) => {
                            let len = head::dhead_dsize(head) as usize;
                            let mut bytes = vec![0u8; len];
                            self.io.cache_read(sector, off, &mut bytes)?;
                            let entries = match RecordView::parse(head, &bytes)? {
                                RecordView::BfileIndex { entries } => entries.to_vec(),
                                _ => return Err(Error::Corrupt(CorruptError::Data)),
                            };
                            self.bfile_sector_old(&entries)?;
                        }
                        Some(DataType::FileName | DataType::NFileName) => {
                            self.id_free(head::dhead_id(head))?;
                        }
                        _ => {}
                    }
                }
                WalkEvent::End => return Ok(()),
                _ => {}
            }
        }
    }

    /// Does the chain still name a live sub-directory?
    fn dir_has_subdir(&mut self, index: usize) -> Result<bool> {
        let tail = self.dirs[index].tail_sector;
        let mut walk = DirWalk::new(tail);
        loop {
            match walk.next(&mut self.io)? {
                WalkEvent::Record { head, .. } => {
                    if matches!(
                        DataType::from_bits(head::dhead_type(head)),
                        Some(DataType::DirName | DataType::NDirName)
                    ) {
                        return Ok(true);
                    }
                }
                WalkEvent::End => return Ok(false),
                _ => {}
            }
        }
    }

    /// Appends one record to the directory's log, garbage-collecting or
    /// growing the chain when the tail sector is full.
    pub(crate) fn dir_prog(&mut self, index: usize, record: &[u8]) -> Result<()> {
        let len = record.len() as u32;
        let sector_size = self.io.cfg.sector_size;
        debug_assert!(len < sector_size);

        if self.dirs[index].tail_off + len >= sector_size {
            if self.dirs[index].old_space >= 3 * sector_size {
                self.dir_gc(index)?;
            }
            if self.dirs[index].tail_off + len >= sector_size {
                let (pre, id) = (self.dirs[index].tail_sector, self.dirs[index].id);
                let new_tail = self.sector_alloc(SectorType::Dir, 1, pre, id, NULL)?;
                self.dirs[index].tail_sector = new_tail;
                self.dirs[index].tail_off = DIR_SECTOR_HEAD_SIZE;
                self.dir_update(index)?;
            }
        }

        let (tail, off) = (self.dirs[index].tail_sector, self.dirs[index].tail_off);
        if len >= self.io.cfg.cache_size {
            self.io.cache_flush()?;
            self.io.direct_prog(ProgKind::Dhead, tail, off, record)?;
        } else {
            self.io.cache_prog(tail, off, record)?;
        }
        self.dirs[index].tail_off = off + len;
        debug_assert!(self.dirs[index].tail_off <= sector_size);
        Ok(())
    }

    /// Copies the live records of the chain into a fresh one and retires
    /// the old sectors. Open children are re-emitted from their RAM
    /// payload caches afterwards.
    pub(crate) fn dir_gc(&mut self, index: usize) -> Result<()> {
        let dir_id = self.dirs[index].id;
        let old_tail = self.dirs[index].tail_sector;
        debug!("directory {dir_id} gc, reclaiming {} bytes", self.dirs[index].old_space);

        self.io.cache_flush()?;

        // Open children re-emit from RAM below; tombstone their records so
        // the copy pass skips them.
        for file_index in 0..self.files.len() {
            let file = &self.files[file_index];
            if file.father_id != dir_id || file.cache.sector == NULL {
                continue;
            }
            let (sector, off) = (file.cache.sector, file.cache.off);
            let stored = self.io.read_word(sector, off)?;
            self.data_delete(dir_id, sector, off, head::dhead_dsize(stored))?;
        }

        self.dtraverse_gc(index, old_tail)?;

        // Open children keep their payload in RAM only; the next flush
        // (at the latest, unmount) re-emits it exactly once.
        for file in &mut self.files {
            if file.father_id != dir_id {
                continue;
            }
            file.cache.sector = NULL;
            file.cache.off = NULL;
            if file.cache.size > 0 {
                file.cache.dirty = true;
            }
        }

        self.dir_old(old_tail)?;
        // Any readdir cursor into the retired chain restarts.
        let dir = &mut self.dirs[index];
        dir.pos_sector = NULL;
        dir.pos_off = NULL;
        dir.pos_presector = NULL;
        self.dir_update(index)?;
        Ok(())
    }

    /// The copy-forward pass of [`Fs::dir_gc`].
    fn dtraverse_gc(&mut self, index: usize, old_tail: u32) -> Result<()> {
        let dir_id = self.dirs[index].id;
        let new_tail = self.sector_alloc(SectorType::Dir, 1, NULL, dir_id, NULL)?;
        self.dirs[index].tail_sector = new_tail;
        self.dirs[index].tail_off = DIR_SECTOR_HEAD_SIZE;
        self.dirs[index].old_space = 0;
        self.io.cache_flush()?;

        let mut walk = DirWalk::new(old_tail);
        loop {
            match walk.next(&mut self.io)? {
                WalkEvent::Record { sector, off, head } => {
                    let typ = DataType::from_bits(head::dhead_type(head));
                    match typ {
                        Some(DataType::Delete) | Some(DataType::DirOspace) => continue,
                        Some(
                            DataType::DirName
                            | DataType::NDirName
                            | DataType::FileName
                            | DataType::NFileName
                            | DataType::SfileData
                            | DataType::BfileIndex,
                        ) => {}
                        _ => {
                            error!("unexpected record in directory {dir_id}");
                            return Err(Error::Corrupt(CorruptError::Data));
                        }
                    }
                    let len = head::dhead_dsize(head) as usize;
                    let mut bytes = vec![0u8; len];
                    self.io.cache_read(sector, off, &mut bytes)?;
                    self.dir_prog(index, &bytes)?;
                    let new_sector = self.dirs[index].tail_sector;
                    let new_off = self.dirs[index].tail_off - len as u32;

                    let record_id = head::dhead_id(head);
                    match typ {
                        Some(DataType::DirName | DataType::NDirName) => {
                            self.tree.update(record_id, new_sector, new_off, NULL);
                            if let Some(child) =
                                self.dirs.iter_mut().find(|dir| dir.id == record_id)
                            {
                                child.name_sector = new_sector;
                                child.name_off = new_off;
                            }
                        }
                        Some(DataType::FileName | DataType::NFileName) => {
                            if let Some(child) =
                                self.files.iter_mut().find(|file| file.id == record_id)
                            {
                                child.sector = new_sector;
                                child.off = new_off;
                            }
                        }
                        _ => {}
                    }
                }
                WalkEvent::End => return Ok(()),
                _ => {}
            }
        }
    }

    /// Retires a whole chain: every sector's state flips to Old and its
    /// erase-plane bit is cleared.
    pub(crate) fn dir_old(&mut self, tail: u32) -> Result<()> {
        let mut sector = tail;
        while sector != NULL {
            let mut prefix = [0u8; DIR_SECTOR_HEAD_SIZE as usize];
            self.io.cache_read(sector, 0, &mut prefix)?;
            let pre = u32::from_le_bytes(prefix[4..8].try_into().unwrap());
            self.io.head_validate(sector, 0, SHEAD_OLD_SET)?;
            self.emap_set(sector, 1)?;
            sector = pre;
        }
        Ok(())
    }

    /// Supersedes the directory's name record after its tail moved: the
    /// old record is tombstoned, a fresh one appended to the parent (or
    /// the superblock for root), and the RAM mirrors follow.
    pub(crate) fn dir_update(&mut self, index: usize) -> Result<()> {
        let id = self.dirs[index].id;
        let tail_sector = self.dirs[index].tail_sector;
        self.tree.update(id, NULL, NULL, tail_sector);

        if id == ID_ROOT {
            let (old_sector, old_off) = (self.dirs[index].name_sector, self.dirs[index].name_off);
            let len = core::mem::size_of::<DirName>() as u32;
            self.data_delete(ID_SUPER, old_sector, old_off, len)?;
            let record = DirName {
                head: head::mkdhead(ID_ROOT, DataType::DirName, len).into(),
                tail: tail_sector.into(),
            };
            self.prog_in_superblock(record.as_bytes())?;
            let pos = self.superblock.free_off - len;
            let super_sector = self.superblock.sector;
            let root = &mut self.dirs[index];
            root.name_sector = super_sector;
            root.name_off = pos;
            root.namelen = 0;
            self.tree.update(id, super_sector, pos, NULL);
            return Ok(());
        }

        let father_id = self.dirs[index].father_id;
        let father_index = match self.dirs.iter().position(|dir| dir.id == father_id) {
            Some(father_index) => father_index,
            None => {
                let entry = self
                    .tree
                    .find_by_id(father_id)
                    .and_then(|at| self.tree.get(at).cloned())
                    .ok_or(Error::Corrupt(CorruptError::TreeEntry))?;
                self.dir_lowopen(
                    entry.tail_sector,
                    entry.id,
                    entry.father_id,
                    entry.name_sector,
                    entry.name_off,
                )?
            }
        };

        let (old_sector, old_off) = (self.dirs[index].name_sector, self.dirs[index].name_off);
        let len = core::mem::size_of::<DirName>() as u32 + self.dirs[index].namelen;
        let mut record = vec![0u8; len as usize];
        self.io.cache_read(old_sector, old_off, &mut record)?;
        record[..4].copy_from_slice(&head::mkdhead(id, DataType::DirName, len).to_le_bytes());
        record[4..8].copy_from_slice(&tail_sector.to_le_bytes());

        self.data_delete(father_id, old_sector, old_off, len)?;
        self.dir_prog(father_index, &record)?;

        let new_sector = self.dirs[father_index].tail_sector;
        let new_off = self.dirs[father_index].tail_off - len;
        let dir = &mut self.dirs[index];
        dir.name_sector = new_sector;
        dir.name_off = new_off;
        self.tree.update(id, new_sector, new_off, NULL);
        Ok(())
    }

    /// Creates a sub-directory: fresh id, fresh chain, a new-name record
    /// in the parent, and RAM state for both.
    pub(crate) fn create_dir(&mut self, father_index: usize, name: &[u8]) -> Result<usize> {
        let father_id = self.dirs[father_index].id;
        let id = self.id_alloc()?;
        let tail = self.sector_alloc(SectorType::Dir, 1, NULL, id, father_id)?;

        let len = core::mem::size_of::<DirName>() as u32 + name.len() as u32;
        let mut record = Vec::with_capacity(len as usize);
        record.extend_from_slice(&head::mkdhead(id, DataType::NDirName, len).to_le_bytes());
        record.extend_from_slice(&tail.to_le_bytes());
        record.extend_from_slice(name);
        self.dir_prog(father_index, &record)?;

        let name_sector = self.dirs[father_index].tail_sector;
        let name_off = self.dirs[father_index].tail_off - len;
        let mut dir = Dir::fresh(id, father_id, tail);
        dir.name_sector = name_sector;
        dir.name_off = name_off;
        dir.namelen = name.len() as u32;
        self.dirs.push(dir);

        self.tree.add(TreeEntry {
            id,
            father_id,
            name_sector,
            name_off,
            tail_sector: tail,
            name: NameKey::for_name(name),
        });
        Ok(self.dirs.len() - 1)
    }

    /// Persists the directory's reclaimable-byte count.
    pub(crate) fn dir_ospace_prog(&mut self, index: usize) -> Result<()> {
        let record = DirOspace {
            head: head::mkdhead(
                self.dirs[index].id,
                DataType::DirOspace,
                core::mem::size_of::<DirOspace>() as u32,
            )
            .into(),
            old_space: self.dirs[index].old_space.into(),
        };
        self.dir_prog(index, record.as_bytes())
    }

    /// One readdir step; the cursor survives in the open directory.
    pub(crate) fn dir_read_next(&mut self, index: usize) -> Result<Option<DirEntry>> {
        if self.dirs[index].pos_sector == NULL {
            let dir = &mut self.dirs[index];
            dir.pos_sector = dir.tail_sector;
            dir.pos_off = 0;
            dir.pos_presector = NULL;
        }

        let dir = &self.dirs[index];
        let mut walk = DirWalk::resume(dir.pos_sector, dir.pos_off, dir.pos_presector);
        loop {
            let event = walk.next(&mut self.io)?;
            {
                let dir = &mut self.dirs[index];
                if !walk.done {
                    dir.pos_sector = walk.sector;
                    dir.pos_off = walk.off;
                    dir.pos_presector = walk.pre;
                }
            }
            match event {
                WalkEvent::Record { sector, off, head } => {
                    let (kind, prefix) = match DataType::from_bits(head::dhead_type(head)) {
                        Some(DataType::DirName | DataType::NDirName) => {
                            (EntryKind::Dir, core::mem::size_of::<DirName>() as u32)
                        }
                        Some(DataType::FileName | DataType::NFileName) => {
                            (EntryKind::File, HEAD_SIZE)
                        }
                        _ => continue,
                    };
                    let len = head::dhead_dsize(head);
                    let mut bytes = vec![0u8; len as usize];
                    self.io.cache_read(sector, off, &mut bytes)?;
                    let name = String::from_utf8_lossy(&bytes[prefix as usize..]).into_owned();
                    return Ok(Some(DirEntry { name, kind }));
                }
                WalkEvent::End => return Ok(None),
                _ => {}
            }
        }
    }

    /// Removes the directory from media and RAM. Live sub-directories
    /// block the deletion; contained files are purged.
    pub(crate) fn dir_delete_inner(&mut self, index: usize) -> Result<()> {
        if self.dir_has_subdir(index)? {
            error!("directory {} still has sub-directories", self.dirs[index].id);
            return Err(Error::Corrupt(CorruptError::CantDelete));
        }
        let id = self.dirs[index].id;
        let father_id = self.dirs[index].father_id;
        let tail = self.dirs[index].tail_sector;
        let (name_sector, name_off) = (self.dirs[index].name_sector, self.dirs[index].name_off);
        let name_len = core::mem::size_of::<DirName>() as u32 + self.dirs[index].namelen;

        self.dtraverse_bfile_delete(index)?;
        self.dir_old(tail)?;
        self.data_delete(father_id, name_sector, name_off, name_len)?;
        self.tree.remove(id);
        self.id_free(id)?;
        let index = self.dir_index(id)?;
        self.dirs.remove(index);
        Ok(())
    }
}

pub(crate) fn entries_of(buffer: &[u8], size: u32) -> Vec<IndexEntry> {
    let payload = &buffer[HEAD_SIZE as usize..size as usize];
    payload
        .chunks_exact(INDEX_ENTRY_SIZE as usize)
        .map(|chunk| {
            IndexEntry::new(
                u32::from_le_bytes(chunk[0..4].try_into().unwrap()),
                u32::from_le_bytes(chunk[4..8].try_into().unwrap()),
                u32::from_le_bytes(chunk[8..12].try_into().unwrap()),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::small_fs;

    #[test]
    fn walker_crosses_chained_sectors() {
        let mut fs = small_fs();
        // Enough entries to spill the root log over several sectors.
        for at in 0..40 {
            let fd = fs.file_open(&format!("/file_{at:02}")).unwrap();
            fs.file_write(fd, &[at as u8; 20]).unwrap();
            fs.file_close(fd).unwrap();
        }
        let tail = fs.dirs[0].tail_sector;
        let mut walk = DirWalk::new(tail);
        let mut sectors = 0;
        let mut records = 0;
        loop {
            match walk.next(&mut fs.io).unwrap() {
                WalkEvent::Prefix { .. } => sectors += 1,
                WalkEvent::Record { .. } => records += 1,
                WalkEvent::SectorEnd { .. } => {}
                WalkEvent::End => break,
            }
        }
        assert!(sectors > 1, "chain never grew past one sector");
        // Name and payload records for every file at least.
        assert!(records >= 80);
        assert_eq!(walk.owner, crate::ID_ROOT);
    }

    #[test]
    fn name_lookup_finds_only_matching_kind_and_length() {
        let mut fs = small_fs();
        let fd = fs.file_open("/alpha").unwrap();
        fs.file_write(fd, b"a").unwrap();
        fs.file_close(fd).unwrap();
        fs.dir_open("/alphabet").unwrap();

        let tail = fs.dirs[0].tail_sector;
        let found = fs.dtraverse_name(tail, b"alpha", NameKind::File).unwrap();
        assert!(found.is_some());
        // Prefix of a longer name is not a match.
        let tail = fs.dirs[0].tail_sector;
        assert!(fs.dtraverse_name(tail, b"alph", NameKind::File).unwrap().is_none());
        // Kind is part of the key.
        let tail = fs.dirs[0].tail_sector;
        assert!(fs.dtraverse_name(tail, b"alpha", NameKind::Dir).unwrap().is_none());
        let tail = fs.dirs[0].tail_sector;
        assert!(fs.dtraverse_name(tail, b"alphabet", NameKind::Dir).unwrap().is_some());
    }

    #[test]
    fn gc_drops_tombstones_and_keeps_live_records() {
        let mut fs = small_fs();
        for at in 0..12 {
            let fd = fs.file_open(&format!("/f{at}")).unwrap();
            fs.file_write(fd, &[at as u8; 40]).unwrap();
            fs.file_close(fd).unwrap();
            if at % 2 == 0 {
                fs.unlink(&format!("/f{at}")).unwrap();
            }
        }
        let before = fs.dirs[0].old_space;
        assert!(before > 0);
        fs.dir_gc(0).unwrap();
        assert_eq!(fs.dirs[0].old_space, 0);

        // Every survivor still resolves, every victim stays gone.
        for at in 0..12 {
            let tail = fs.dirs[0].tail_sector;
            let found = fs
                .dtraverse_name(tail, format!("f{at}").as_bytes(), NameKind::File)
                .unwrap();
            assert_eq!(found.is_some(), at % 2 == 1, "entry f{at}");
        }
    }
}
