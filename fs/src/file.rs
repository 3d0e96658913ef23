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

//! The file engine.
//!
//! Files at or below the 64-byte threshold live inline in their parent's
//! log; above it the payload moves to dedicated big-file sectors and the
//! parent stores an array of `(sector, off, size)` extents as a single
//! record. The extent array is compacted when it grows too long.

use cinder_ds::NorFlash;
use cinder_err::{CorruptError, Error, FsError, IoError, Result};
use log::{debug, error};

use crate::cache::ProgKind;
use crate::dir::entries_of;
use crate::head::{self, DataType, SectorType};
use crate::record::{IndexEntry, BFILE_SECTOR_HEAD_SIZE, HEAD_SIZE, INDEX_ENTRY_SIZE};
use crate::{
    Fs, FILE_CACHE_SIZE, FILE_INDEX_MAX, FILE_INDEX_NUM, FILE_LIST_MAX, FILE_SIZE_THRESHOLD, NULL,
};

/// RAM mirror of the file's payload record: the inline bytes of a small
/// file, or the extent index of a big one. `(sector, off)` is where the
/// on-flash copy lives; `size` always reflects the RAM state.
pub(crate) struct FileCache {
    pub sector: u32,
    pub off: u32,
    pub size: u32,
    pub dirty: bool,
    pub buffer: Vec<u8>,
}

impl FileCache {
    fn new() -> Self {
        Self {
            sector: NULL,
            off: NULL,
            size: 0,
            dirty: false,
            buffer: vec![0xff; FILE_CACHE_SIZE],
        }
    }
}

pub(crate) struct File {
    pub id: u32,
    pub father_id: u32,
    pub file_size: u32,
    pub file_pos: u32,
    /// Position of the file's name record in the parent log.
    pub sector: u32,
    pub off: u32,
    pub namelen: u32,
    pub cache: FileCache,
}

/// Advances `bytes` through a big-file run: payload restarts after every
/// sector's 12-byte prefix. Returns where the next byte would go.
fn extent_advance(sector_size: u32, mut sector: u32, mut off: u32, mut bytes: u32) -> (u32, u32) {
    while bytes > 0 {
        let chunk = (sector_size - off).min(bytes);
        off += chunk;
        bytes -= chunk;
        if off == sector_size {
            sector += 1;
            off = BFILE_SECTOR_HEAD_SIZE;
        }
    }
    (sector, off)
}

/// Sectors a big-file run occupies.
pub(crate) fn extent_sectors(sector_size: u32, entry: &IndexEntry) -> u32 {
    let (end_sector, end_off) =
        extent_advance(sector_size, entry.sector.get(), entry.off.get(), entry.size.get());
    if end_off == BFILE_SECTOR_HEAD_SIZE {
        end_sector - entry.sector.get()
    } else {
        end_sector - entry.sector.get() + 1
    }
}

impl<D: NorFlash> Fs<D> {
    pub(crate) fn file_index(&self, id: u32) -> Result<usize> {
        self.files
            .iter()
            .position(|file| file.id == id)
            .ok_or(Error::Fs(FsError::BadDescriptor))
    }

    /// Opens a named file unless it already is, loading its payload
    /// record from the parent's chain.
    pub(crate) fn file_lowopen(
        &mut self,
        dir_index: usize,
        id: u32,
        name_sector: u32,
        name_off: u32,
        namelen: u32,
    ) -> Result<usize> {
        if let Some(index) = self.files.iter().position(|file| file.id == id) {
            return Ok(index);
        }
        if self.files.len() >= FILE_LIST_MAX {
            return Err(Error::Fs(FsError::TooManyOpen));
        }

        self.files.push(File {
            id,
            father_id: self.dirs[dir_index].id,
            file_size: 0,
            file_pos: 0,
            sector: name_sector,
            off: name_off,
            namelen,
            cache: FileCache::new(),
        });
        let index = self.files.len() - 1;
        let begin = self.dirs[dir_index].tail_sector;
        match self.dtraverse_data(index, begin) {
            Ok(()) => Ok(index),
            Err(err) => {
                self.files.pop();
                Err(err)
            }
        }
    }

    /// Creates a file: fresh id and a new-name record in the parent. The
    /// payload record only appears at the first sync.
    pub(crate) fn create_file(&mut self, dir_index: usize, name: &[u8]) -> Result<usize> {
        if self.files.len() >= FILE_LIST_MAX {
            return Err(Error::Fs(FsError::TooManyOpen));
        }
        let id = self.id_alloc()?;
        let len = HEAD_SIZE + name.len() as u32;
        let mut record = Vec::with_capacity(len as usize);
        record.extend_from_slice(&head::mkdhead(id, DataType::NFileName, len).to_le_bytes());
        record.extend_from_slice(name);
        self.dir_prog(dir_index, &record)?;

        let father_id = self.dirs[dir_index].id;
        self.files.push(File {
            id,
            father_id,
            file_size: 0,
            file_pos: 0,
            sector: self.dirs[dir_index].tail_sector,
            off: self.dirs[dir_index].tail_off - len,
            namelen: name.len() as u32,
            cache: FileCache::new(),
        });
        Ok(self.files.len() - 1)
    }

    /// Re-emits the payload record into the parent log and tombstones the
    /// superseded copy.
    pub(crate) fn file_flush(&mut self, index: usize) -> Result<()> {
        if !self.files[index].cache.dirty || self.files[index].cache.size == 0 {
            return Ok(());
        }
        let father_id = self.files[index].father_id;
        let father_index = self.dir_index(father_id)?;

        let (old_sector, old_off) = (self.files[index].cache.sector, self.files[index].cache.off);
        if old_sector != NULL {
            let stored = self.io.read_word(old_sector, old_off)?;
            self.data_delete(father_id, old_sector, old_off, head::dhead_dsize(stored))?;
        }

        let record = {
            let file = &mut self.files[index];
            let typ = if file.file_size <= FILE_SIZE_THRESHOLD {
                DataType::SfileData
            } else {
                DataType::BfileIndex
            };
            let dhead = head::mkdhead(file.id, typ, file.cache.size);
            file.cache.buffer[..4].copy_from_slice(&dhead.to_le_bytes());
            file.cache.buffer[..file.cache.size as usize].to_vec()
        };
        self.dir_prog(father_index, &record)?;

        let file = &mut self.files[index];
        file.cache.sector = self.dirs[father_index].tail_sector;
        file.cache.off = self.dirs[father_index].tail_off - file.cache.size;
        file.cache.dirty = false;
        Ok(())
    }

    pub(crate) fn small_file_read(&mut self, index: usize, buf: &mut [u8], n: usize) -> Result<()> {
        let file = &mut self.files[index];
        let at = HEAD_SIZE as usize + file.file_pos as usize;
        buf[..n].copy_from_slice(&file.cache.buffer[at..at + n]);
        file.file_pos += n as u32;
        debug_assert!(file.file_pos <= file.file_size);
        Ok(())
    }

    pub(crate) fn small_file_write(&mut self, index: usize, data: &[u8]) -> Result<()> {
        let file = &mut self.files[index];
        let at = HEAD_SIZE as usize + file.file_pos as usize;
        file.cache.buffer[at..at + data.len()].copy_from_slice(data);
        file.file_pos += data.len() as u32;
        file.file_size = file.file_size.max(file.file_pos);
        file.cache.size = file.file_size + HEAD_SIZE;
        file.cache.dirty = true;
        Ok(())
    }

    /// Reads a run of payload bytes starting at `(begin, off)`, rolling
    /// over sector prefixes.
    fn index_read_once(&mut self, begin: u32, off: u32, len: u32, buf: &mut [u8]) -> Result<()> {
        let sector_size = self.io.cfg.sector_size;
        let (mut sector, mut off) = (begin, off);
        let mut done = 0u32;
        while done < len {
            let chunk = (sector_size - off).min(len - done);
            self.io
                .direct_read(sector, off, &mut buf[done as usize..(done + chunk) as usize])?;
            done += chunk;
            off += chunk;
            if off == sector_size {
                sector += 1;
                off = BFILE_SECTOR_HEAD_SIZE;
            }
        }
        Ok(())
    }

    pub(crate) fn big_file_read(&mut self, index: usize, buf: &mut [u8], n: usize) -> Result<()> {
        let entries = entries_of(
            &self.files[index].cache.buffer,
            self.files[index].cache.size,
        );
        let mut pos = self.files[index].file_pos;
        let mut rest = n as u32;
        let mut done = 0u32;
        let mut cum = 0u32;
        for entry in &entries {
            let size = entry.size.get();
            if cum + size <= pos {
                cum += size;
                continue;
            }
            let skip = pos - cum;
            let len = (size - skip).min(rest);
            let (sector, off) =
                extent_advance(self.io.cfg.sector_size, entry.sector.get(), entry.off.get(), skip);
            let dst = &mut buf[done as usize..(done + len) as usize];
            self.index_read_once(sector, off, len, dst)?;
            pos += len;
            done += len;
            rest -= len;
            cum += size;
            if rest == 0 {
                break;
            }
        }
        debug_assert_eq!(rest, 0);
        self.files[index].file_pos = pos;
        Ok(())
    }

    /// Streams payload into big-file sectors, advancing the cursor.
    fn bfile_prog(&mut self, sector: &mut u32, off: &mut u32, data: &[u8]) -> Result<()> {
        let sector_size = self.io.cfg.sector_size;
        let mut done = 0usize;
        while done < data.len() {
            let chunk = ((sector_size - *off) as usize).min(data.len() - done);
            self.io
                .direct_prog(ProgKind::Data, *sector, *off, &data[done..done + chunk])?;
            done += chunk;
            *off += chunk as u32;
            if *off == sector_size {
                *sector += 1;
                *off = BFILE_SECTOR_HEAD_SIZE;
            }
        }
        Ok(())
    }

    fn store_entries(&mut self, index: usize, entries: &[IndexEntry]) {
        let file = &mut self.files[index];
        let mut at = HEAD_SIZE as usize;
        for entry in entries {
            file.cache.buffer[at..at + 4].copy_from_slice(&entry.sector.get().to_le_bytes());
            file.cache.buffer[at + 4..at + 8].copy_from_slice(&entry.off.get().to_le_bytes());
            file.cache.buffer[at + 8..at + 12].copy_from_slice(&entry.size.get().to_le_bytes());
            at += INDEX_ENTRY_SIZE as usize;
        }
        file.cache.size = at as u32;
        file.cache.dirty = true;
    }

    /// Crossing the inline threshold: stream the inline bytes up to the
    /// write position plus the new bytes into a fresh run and replace the
    /// payload record with a one-extent index.
    pub(crate) fn s2b_file_write(&mut self, index: usize, data: &[u8]) -> Result<()> {
        let sector_size = self.io.cfg.sector_size;
        let payload_per = sector_size - BFILE_SECTOR_HEAD_SIZE;
        let pos = self.files[index].file_pos;
        let total = pos + data.len() as u32;
        let (id, father_id) = (self.files[index].id, self.files[index].father_id);

        let num = total.div_ceil(payload_per);
        let begin = self.sector_alloc(SectorType::BigFile, num, NULL, id, father_id)?;
        let (mut sector, mut off) = (begin, BFILE_SECTOR_HEAD_SIZE);
        if pos > 0 {
            let inline = self.files[index].cache.buffer
                [HEAD_SIZE as usize..(HEAD_SIZE + pos) as usize]
                .to_vec();
            self.bfile_prog(&mut sector, &mut off, &inline)?;
        }
        self.bfile_prog(&mut sector, &mut off, data)?;

        let (old_sector, old_off) = (self.files[index].cache.sector, self.files[index].cache.off);
        if old_sector != NULL {
            let stored = self.io.read_word(old_sector, old_off)?;
            self.data_delete(father_id, old_sector, old_off, head::dhead_dsize(stored))?;
            self.files[index].cache.sector = NULL;
        }

        self.store_entries(index, &[IndexEntry::new(begin, BFILE_SECTOR_HEAD_SIZE, total)]);
        let file = &mut self.files[index];
        file.file_size = total;
        file.file_pos = total;
        debug!("file {id} promoted to big at {total} bytes");
        Ok(())
    }

    /// Marks the fully covered sectors of a partially superseded extent
    /// reclaimable. `keep_front`/`keep_back` bytes stay live at the ends,
    /// and a sector shared with the following live extent is preserved.
    fn reclaim_extent(
        &mut self,
        entry: &IndexEntry,
        keep_front: u32,
        keep_back: u32,
        shared_next: Option<u32>,
    ) -> Result<()> {
        let sector_size = self.io.cfg.sector_size;
        let size = entry.size.get();
        if keep_front + keep_back >= size {
            return Ok(());
        }

        let (start_sector, start_off) =
            extent_advance(sector_size, entry.sector.get(), entry.off.get(), keep_front);
        let first = if start_off == BFILE_SECTOR_HEAD_SIZE {
            start_sector
        } else {
            // The sector still carries bytes before the covered span.
            start_sector + 1
        };

        let (end_sector, end_off) =
            extent_advance(sector_size, entry.sector.get(), entry.off.get(), size - keep_back);
        let keep_end_sector =
            end_off != BFILE_SECTOR_HEAD_SIZE && (keep_back > 0 || shared_next == Some(end_sector));
        let last = if end_off == BFILE_SECTOR_HEAD_SIZE || keep_end_sector {
            end_sector.saturating_sub(1)
        } else {
            end_sector
        };

        if first > last {
            return Ok(());
        }
        self.sequen_sector_old(first, last - first + 1)
    }

    /// Append write: top up the free bytes behind the last extent, then
    /// stream the remainder into a fresh run, merging it into the last
    /// extent when physically adjacent.
    fn big_file_append(&mut self, index: usize, data: &[u8]) -> Result<()> {
        let sector_size = self.io.cfg.sector_size;
        let payload_per = sector_size - BFILE_SECTOR_HEAD_SIZE;
        let (id, father_id) = (self.files[index].id, self.files[index].father_id);
        let mut entries = entries_of(
            &self.files[index].cache.buffer,
            self.files[index].cache.size,
        );
        debug_assert!(!entries.is_empty());

        let mut consumed = 0usize;
        {
            let last = entries.last_mut().unwrap();
            let (end_sector, end_off) =
                extent_advance(sector_size, last.sector.get(), last.off.get(), last.size.get());
            if end_off != BFILE_SECTOR_HEAD_SIZE {
                let fill = ((sector_size - end_off) as usize).min(data.len());
                self.io
                    .direct_prog(ProgKind::Data, end_sector, end_off, &data[..fill])?;
                last.size = (last.size.get() + fill as u32).into();
                consumed = fill;
            }
        }

        if consumed < data.len() {
            let rest = &data[consumed..];
            let num = (rest.len() as u32).div_ceil(payload_per);
            let begin = self.sector_alloc(SectorType::BigFile, num, NULL, id, father_id)?;
            let (mut sector, mut off) = (begin, BFILE_SECTOR_HEAD_SIZE);
            self.bfile_prog(&mut sector, &mut off, rest)?;

            let last = entries.last_mut().unwrap();
            let (end_sector, end_off) =
                extent_advance(sector_size, last.sector.get(), last.off.get(), last.size.get());
            if end_off == BFILE_SECTOR_HEAD_SIZE && end_sector == begin {
                last.size = (last.size.get() + rest.len() as u32).into();
            } else {
                entries.push(IndexEntry::new(begin, BFILE_SECTOR_HEAD_SIZE, rest.len() as u32));
            }
        }

        self.store_entries(index, &entries);
        let file = &mut self.files[index];
        file.file_size += data.len() as u32;
        file.file_pos = file.file_size;
        Ok(())
    }

    /// Random overwrite: write the new bytes into a fresh run, then
    /// splice up to three replacement extents (kept front, new range,
    /// kept tail) over the superseded ones, reclaiming every sector that
    /// no live extent still touches.
    fn big_file_rwrite(&mut self, index: usize, data: &[u8]) -> Result<()> {
        let sector_size = self.io.cfg.sector_size;
        let payload_per = sector_size - BFILE_SECTOR_HEAD_SIZE;
        let (id, father_id) = (self.files[index].id, self.files[index].father_id);
        let n = data.len() as u32;
        let pos = self.files[index].file_pos;
        let file_size = self.files[index].file_size;
        let mut entries = entries_of(
            &self.files[index].cache.buffer,
            self.files[index].cache.size,
        );

        let num = n.div_ceil(payload_per);
        let begin = self.sector_alloc(SectorType::BigFile, num, NULL, id, father_id)?;
        let (mut sector, mut off) = (begin, BFILE_SECTOR_HEAD_SIZE);
        self.bfile_prog(&mut sector, &mut off, data)?;
        let new_entry = IndexEntry::new(begin, BFILE_SECTOR_HEAD_SIZE, n);

        // The extent containing the write position.
        let mut cum = 0u32;
        let mut i = 0usize;
        while i < entries.len() && cum + entries[i].size.get() <= pos {
            cum += entries[i].size.get();
            i += 1;
        }
        if i == entries.len() {
            error!("write position {pos} past the extent array");
            return Err(Error::Corrupt(CorruptError::Calculation));
        }
        let front_len = pos - cum;
        let begin_keep = (front_len > 0).then(|| {
            IndexEntry::new(entries[i].sector.get(), entries[i].off.get(), front_len)
        });

        let mut replacement: Vec<IndexEntry> = Vec::with_capacity(3);
        if let Some(keep) = &begin_keep {
            replacement.push(keep.clone());
        }
        replacement.push(new_entry);

        if pos + n >= file_size {
            // The write runs to (or past) the end of the file; everything
            // from the split point on dies, so no successor needs its
            // shared sector preserved.
            for k in i..entries.len() {
                let keep_front = if k == i { front_len } else { 0 };
                let entry = entries[k].clone();
                self.reclaim_extent(&entry, keep_front, 0, None)?;
            }
            entries.truncate(i);
            entries.extend(replacement);
            self.store_entries(index, &entries);
            let file = &mut self.files[index];
            file.file_pos = pos + n;
            file.file_size = pos + n;
            return Ok(());
        }

        // The extent containing the first byte past the write.
        let mut cum_j = cum;
        let mut j = i;
        while cum_j + entries[j].size.get() <= pos + n {
            cum_j += entries[j].size.get();
            j += 1;
        }
        let back_skip = pos + n - cum_j;
        let (keep_sector, keep_off) = extent_advance(
            sector_size,
            entries[j].sector.get(),
            entries[j].off.get(),
            back_skip,
        );
        let end_keep = IndexEntry::new(keep_sector, keep_off, entries[j].size.get() - back_skip);

        for k in i..=j {
            let keep_front = if k == i { front_len } else { 0 };
            let keep_back = if k == j { entries[j].size.get() - back_skip } else { 0 };
            let entry = entries[k].clone();
            self.reclaim_extent(&entry, keep_front, keep_back, None)?;
        }

        replacement.push(end_keep);
        entries.splice(i..=j, replacement);
        self.store_entries(index, &entries);
        let file = &mut self.files[index];
        file.file_pos = pos + n;
        file.file_size = file_size.max(pos + n);
        Ok(())
    }

    /// Compacts the extent array: the widest span of sector-or-smaller
    /// extents whose payload fits one region is rewritten as a single
    /// run.
    pub(crate) fn bfile_gc(&mut self, index: usize) -> Result<()> {
        let sector_size = self.io.cfg.sector_size;
        let entries = entries_of(
            &self.files[index].cache.buffer,
            self.files[index].cache.size,
        );
        debug_assert!(entries.len() < FILE_INDEX_MAX);
        if entries.len() < FILE_INDEX_NUM {
            return Ok(());
        }

        let candidates: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.size.get() <= sector_size)
            .map(|(at, _)| at)
            .collect();

        let region_capacity = self.manager.region_size * sector_size;
        let mut best: Option<(usize, usize, u32)> = None;
        for (a, &start) in candidates.iter().enumerate() {
            for &end in candidates.iter().skip(a + 1) {
                let span: u32 = entries[start..=end].iter().map(|entry| entry.size.get()).sum();
                if span >= region_capacity {
                    continue;
                }
                if best.map_or(true, |(s, e, _)| end - start > e - s) {
                    best = Some((start, end, span));
                }
            }
        }
        let Some((start, end, span)) = best else {
            return Ok(());
        };
        self.bfile_part_gc(index, start, end, span)
    }

    /// Rewrites extents `start..=end` as one freshly allocated run.
    fn bfile_part_gc(&mut self, index: usize, start: usize, end: usize, total: u32) -> Result<()> {
        let sector_size = self.io.cfg.sector_size;
        let payload_per = sector_size - BFILE_SECTOR_HEAD_SIZE;
        let (id, father_id) = (self.files[index].id, self.files[index].father_id);
        let mut entries = entries_of(
            &self.files[index].cache.buffer,
            self.files[index].cache.size,
        );

        let num = total.div_ceil(payload_per);
        if num > self.manager.region_size {
            return Ok(());
        }
        debug!("file {id} index gc: merging extents {start}..={end} ({total} bytes)");

        let new_begin = self.sector_alloc(SectorType::BigFile, num, NULL, id, father_id)?;
        let (mut dst_sector, mut dst_off) = (new_begin, BFILE_SECTOR_HEAD_SIZE);
        let mut chunk = vec![0u8; self.io.cfg.cache_size as usize];
        for entry in &entries[start..=end] {
            let mut src_sector = entry.sector.get();
            let mut src_off = entry.off.get();
            let mut rest = entry.size.get();
            while rest > 0 {
                let len = (sector_size - src_off).min(rest).min(chunk.len() as u32);
                self.io
                    .cache_read(src_sector, src_off, &mut chunk[..len as usize])?;
                self.bfile_prog(&mut dst_sector, &mut dst_off, &chunk[..len as usize])?;
                rest -= len;
                src_off += len;
                if src_off == sector_size {
                    src_sector += 1;
                    src_off = BFILE_SECTOR_HEAD_SIZE;
                }
            }
        }

        for k in start..=end {
            let shared_next = if k == end {
                entries.get(k + 1).map(|next| next.sector.get())
            } else {
                None
            };
            let entry = entries[k].clone();
            self.reclaim_extent(&entry, 0, 0, shared_next)?;
        }

        let father_index = self.dir_index(father_id)?;
        let (old_sector, old_off) = (self.files[index].cache.sector, self.files[index].cache.off);
        if old_sector != NULL {
            let stored = self.io.read_word(old_sector, old_off)?;
            self.data_delete(father_id, old_sector, old_off, head::dhead_dsize(stored))?;
        }

        entries.splice(
            start..=end,
            [IndexEntry::new(new_begin, BFILE_SECTOR_HEAD_SIZE, total)],
        );
        self.store_entries(index, &entries);

        // Persist the compacted index right away.
        let record = {
            let file = &mut self.files[index];
            let dhead = head::mkdhead(id, DataType::BfileIndex, file.cache.size);
            file.cache.buffer[..4].copy_from_slice(&dhead.to_le_bytes());
            file.cache.buffer[..file.cache.size as usize].to_vec()
        };
        self.dir_prog(father_index, &record)?;
        let file = &mut self.files[index];
        file.cache.sector = self.dirs[father_index].tail_sector;
        file.cache.off = self.dirs[father_index].tail_off - file.cache.size;
        file.cache.dirty = false;
        Ok(())
    }

    pub(crate) fn big_file_write(&mut self, index: usize, data: &[u8]) -> Result<()> {
        let count = (self.files[index].cache.size - HEAD_SIZE) / INDEX_ENTRY_SIZE;
        if count as usize >= FILE_INDEX_NUM
            || self.files[index].cache.size + 3 * INDEX_ENTRY_SIZE > FILE_CACHE_SIZE as u32
        {
            self.bfile_gc(index)?;
        }
        if self.files[index].cache.size + 2 * INDEX_ENTRY_SIZE > FILE_CACHE_SIZE as u32 {
            error!("extent array of file {} cannot grow", self.files[index].id);
            return Err(Error::Io(IoError::NoSpace));
        }

        if self.files[index].file_pos == self.files[index].file_size {
            self.big_file_append(index, data)
        } else {
            self.big_file_rwrite(index, data)
        }
    }

    /// Reclaims the file's payload, tombstones its records, frees its id
    /// and drops it from the open list.
    pub(crate) fn file_delete_inner(&mut self, index: usize) -> Result<()> {
        let id = self.files[index].id;
        let father_id = self.files[index].father_id;

        if self.files[index].file_size > FILE_SIZE_THRESHOLD {
            let entries = entries_of(
                &self.files[index].cache.buffer,
                self.files[index].cache.size,
            );
            self.bfile_sector_old(&entries)?;
        }

        let (payload_sector, payload_off) =
            (self.files[index].cache.sector, self.files[index].cache.off);
        if payload_sector != NULL {
            let stored = self.io.read_word(payload_sector, payload_off)?;
            self.data_delete(father_id, payload_sector, payload_off, head::dhead_dsize(stored))?;
        }

        let (name_sector, name_off) = (self.files[index].sector, self.files[index].off);
        let name_len = HEAD_SIZE + self.files[index].namelen;
        self.data_delete(father_id, name_sector, name_off, name_len)?;

        self.id_free(id)?;
        let index = self.file_index(id)?;
        self.files.remove(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extent_advance_rolls_over_prefixes() {
        // 4 KiB sectors hold 4084 payload bytes after the prefix.
        assert_eq!(extent_advance(4096, 100, 12, 0), (100, 12));
        assert_eq!(extent_advance(4096, 100, 12, 4084), (101, 12));
        assert_eq!(extent_advance(4096, 100, 12, 4085), (101, 13));
        assert_eq!(extent_advance(4096, 100, 2048, 2048), (101, 12));
    }

    #[test]
    fn extent_sectors_counts_partial_tails() {
        let one = IndexEntry::new(5, 12, 4084);
        assert_eq!(extent_sectors(4096, &one), 1);
        let two = IndexEntry::new(5, 12, 4085);
        assert_eq!(extent_sectors(4096, &two), 2);
        let mid = IndexEntry::new(5, 2048, 100);
        assert_eq!(extent_sectors(4096, &mid), 1);
    }
}
