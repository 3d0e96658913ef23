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

//! Device access with a read cache and an append-only program cache.
//!
//! Every path that programs the device runs through [`Io`], which mirrors
//! the written bytes into whichever cache window overlaps the target. The
//! invariant: any byte a caller could later read is the byte it just wrote,
//! no matter which path wrote it.

use cinder_ds::NorFlash;
use cinder_err::{CorruptError, Error, Result};
use log::error;

use crate::config::Config;
use crate::head::{self, SectorType, DHEAD_WRITTEN_SET};
use crate::record::{BFILE_SECTOR_HEAD_SIZE, DIR_SECTOR_HEAD_SIZE, HEAD_SIZE};
use crate::{FsStats, NULL};

/// One cache window over `(sector, off .. off + size)`.
pub(crate) struct Cache {
    pub sector: u32,
    pub off: u32,
    pub size: u32,
    pub dirty: bool,
    pub buffer: Vec<u8>,
}

impl Cache {
    fn new(capacity: u32) -> Self {
        Self {
            sector: NULL,
            off: NULL,
            size: 0,
            dirty: false,
            buffer: vec![0xff; capacity as usize],
        }
    }

    /// Empties the window; all buffer bits return to the erased state.
    pub fn reset(&mut self) {
        self.buffer.fill(0xff);
        self.sector = NULL;
        self.off = NULL;
        self.size = 0;
        self.dirty = false;
    }

    fn covers(&self, sector: u32, off: u32) -> bool {
        self.sector == sector && off >= self.off && off < self.off + self.size
    }

    /// Copies the overlap of `data` at `(sector, off)` into the window.
    fn patch(&mut self, sector: u32, off: u32, data: &[u8]) {
        if self.sector != sector || self.size == 0 {
            return;
        }
        let begin = off.max(self.off);
        let end = (off + data.len() as u32).min(self.off + self.size);
        if begin >= end {
            return;
        }
        let src = (begin - off) as usize;
        let dst = (begin - self.off) as usize;
        let len = (end - begin) as usize;
        self.buffer[dst..dst + len].copy_from_slice(&data[src..src + len]);
    }

    /// ANDs a masked header word at `(sector, off)` into the window.
    fn patch_word(&mut self, sector: u32, off: u32, mask: u32) {
        if self.sector != sector || self.size == 0 {
            return;
        }
        if off < self.off || off + HEAD_SIZE > self.off + self.size {
            return;
        }
        let at = (off - self.off) as usize;
        let word = word_at(&self.buffer, at) & mask;
        self.buffer[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }
}

pub(crate) fn word_at(buffer: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buffer[at..at + 4].try_into().unwrap())
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProgKind {
    /// A sector header or prefix; programmed once, no written bit.
    Shead,
    /// A complete record; the header's written bit is cleared by a second
    /// program as soon as the payload is on the device.
    Dhead,
    /// Raw payload bytes, validated elsewhere.
    Data,
}

pub(crate) struct Io<D> {
    pub cfg: Config,
    pub dev: D,
    pub rcache: Cache,
    pub pcache: Cache,
    pub stats: FsStats,
}

impl<D: NorFlash> Io<D> {
    pub fn new(dev: D, cfg: Config) -> Self {
        let cache_size = cfg.cache_size;
        Self {
            cfg,
            dev,
            rcache: Cache::new(cache_size),
            pcache: Cache::new(cache_size),
            stats: FsStats::default(),
        }
    }

    pub fn direct_read(&self, sector: u32, off: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert!(sector < self.cfg.sector_count);
        debug_assert!(off + buf.len() as u32 <= self.cfg.sector_size);
        self.dev.read(sector, off, buf)
    }

    fn sync_data(&mut self, sector: u32, off: u32, data: &[u8]) {
        self.pcache.patch(sector, off, data);
        self.rcache.patch(sector, off, data);
    }

    fn sync_head(&mut self, sector: u32, off: u32, mask: u32) {
        self.pcache.patch_word(sector, off, mask);
        self.rcache.patch_word(sector, off, mask);
    }

    /// Programs bytes that carry no header of their own (bitmap planes, the
    /// wear-leveling array).
    pub fn prog_raw(&mut self, sector: u32, off: u32, data: &[u8]) -> Result<()> {
        debug_assert!(off + data.len() as u32 <= self.cfg.sector_size);
        self.dev.prog(sector, off, data)?;
        self.sync_data(sector, off, data);
        Ok(())
    }

    /// Programs a sector prefix, a record, or raw data past the caches.
    /// Records get their written bit cleared immediately.
    pub fn direct_prog(&mut self, kind: ProgKind, sector: u32, off: u32, data: &[u8]) -> Result<()> {
        debug_assert!(sector < self.cfg.sector_count);
        debug_assert!(off + data.len() as u32 <= self.cfg.sector_size);
        self.dev.prog(sector, off, data)?;
        self.sync_data(sector, off, data);
        if let ProgKind::Dhead = kind {
            let committed = word_at(data, 0) & DHEAD_WRITTEN_SET;
            self.dev.prog(sector, off, &committed.to_le_bytes())?;
            self.stats.header_rewrites += 1;
            self.sync_head(sector, off, DHEAD_WRITTEN_SET);
        }
        Ok(())
    }

    /// Reprograms a single header word with `mask`; on NOR a program is an
    /// AND, so this clears exactly the mask's zero bits. Used to commit,
    /// delete and retire headers in place.
    pub fn head_validate(&mut self, sector: u32, off: u32, mask: u32) -> Result<()> {
        self.dev.prog(sector, off, &mask.to_le_bytes())?;
        self.stats.header_rewrites += 1;
        self.sync_head(sector, off, mask);
        Ok(())
    }

    /// Reads through the caches: pending program window first, read window
    /// second, the device for the rest.
    pub fn cache_read(&mut self, sector: u32, off: u32, buf: &mut [u8]) -> Result<()> {
        if sector >= self.cfg.sector_count || off + buf.len() as u32 > self.cfg.sector_size {
            error!("read out of range: sector {sector} off {off} len {}", buf.len());
            return Err(Error::Corrupt(CorruptError::Calculation));
        }
        let mut off = off;
        let mut done = 0usize;
        while done < buf.len() {
            let mut diff = buf.len() - done;

            if self.pcache.covers(sector, off) {
                let at = (off - self.pcache.off) as usize;
                let len = diff.min((self.pcache.size as usize) - at);
                buf[done..done + len].copy_from_slice(&self.pcache.buffer[at..at + len]);
                done += len;
                off += len as u32;
                continue;
            }
            if self.pcache.sector == sector && self.pcache.size > 0 && off < self.pcache.off {
                diff = diff.min((self.pcache.off - off) as usize);
            }

            if self.rcache.covers(sector, off) {
                let at = (off - self.rcache.off) as usize;
                let len = diff.min((self.rcache.size as usize) - at);
                buf[done..done + len].copy_from_slice(&self.rcache.buffer[at..at + len]);
                done += len;
                off += len as u32;
                continue;
            }
            if self.rcache.sector == sector && self.rcache.size > 0 && off < self.rcache.off {
                diff = diff.min((self.rcache.off - off) as usize);
            }

            self.dev.read(sector, off, &mut buf[done..done + diff])?;
            done += diff;
            off += diff as u32;
        }
        Ok(())
    }

    /// Appends a whole record into the program cache, flushing and rebasing
    /// the window whenever the append is not contiguous or would not fit.
    /// Random (non-append) programs are not accepted here.
    pub fn cache_prog(&mut self, sector: u32, off: u32, data: &[u8]) -> Result<()> {
        let len = data.len() as u32;
        debug_assert!(sector < self.cfg.sector_count);
        debug_assert!(len <= self.cfg.cache_size);
        debug_assert!(off + len <= self.cfg.sector_size);

        let contiguous = self.pcache.sector == sector
            && off == self.pcache.off + self.pcache.size
            && off + len <= self.pcache.off + self.cfg.cache_size;
        if !contiguous {
            self.cache_flush()?;
            self.pcache.reset();
            self.pcache.sector = sector;
            self.pcache.off = off;
        }

        let at = (off - self.pcache.off) as usize;
        self.pcache.buffer[at..at + data.len()].copy_from_slice(data);
        self.pcache.size = off - self.pcache.off + len;
        self.pcache.dirty = true;
        // A stale read window over the same range must see the new bytes,
        // and it shows them as they will read once flushed: committed.
        self.rcache.patch(sector, off, data);
        self.rcache.patch_word(sector, off, DHEAD_WRITTEN_SET);

        if self.pcache.size > self.cfg.cache_size - HEAD_SIZE {
            self.cache_flush()?;
        }
        Ok(())
    }

    /// Programs the window, then commits every complete record in it by
    /// clearing its written bit with a second single-word program.
    pub fn cache_flush(&mut self) -> Result<()> {
        if self.pcache.sector == NULL || !self.pcache.dirty {
            return Ok(());
        }
        let sector = self.pcache.sector;
        let base = self.pcache.off;
        let size = self.pcache.size as usize;
        debug_assert!(sector < self.cfg.sector_count);
        self.dev.prog(sector, base, &self.pcache.buffer[..size])?;

        let mut pos = 0usize;
        if base == 0 {
            let shead = word_at(&self.pcache.buffer, 0);
            pos = match head::shead_type(shead) {
                t if t == SectorType::Dir as u32 || t == SectorType::BigFile as u32 => {
                    DIR_SECTOR_HEAD_SIZE as usize
                }
                _ => HEAD_SIZE as usize,
            };
            debug_assert_eq!(DIR_SECTOR_HEAD_SIZE, BFILE_SECTOR_HEAD_SIZE);
        }
        while pos + HEAD_SIZE as usize <= size {
            let dhead = word_at(&self.pcache.buffer, pos);
            if dhead == NULL {
                break;
            }
            let len = head::dhead_dsize(dhead) as usize;
            if len < HEAD_SIZE as usize {
                error!("record of length {len} in program cache");
                return Err(Error::Corrupt(CorruptError::Calculation));
            }
            if pos + len > size {
                // Torn record: never commit it, recovery drops it.
                break;
            }
            let committed = dhead & DHEAD_WRITTEN_SET;
            self.dev.prog(sector, base + pos as u32, &committed.to_le_bytes())?;
            self.stats.header_rewrites += 1;
            self.pcache.buffer[pos..pos + 4].copy_from_slice(&committed.to_le_bytes());
            pos += len;
        }

        let (pcache, rcache) = (&mut self.pcache, &mut self.rcache);
        rcache.patch(sector, base, &pcache.buffer[..size]);
        pcache.reset();
        Ok(())
    }

    /// Loads a read window over exactly `(sector, off, size)`. Pending
    /// program bytes overlapping the window are flushed first so the window
    /// only ever shows committed records.
    pub fn fill_rcache(&mut self, sector: u32, off: u32, size: u32) -> Result<()> {
        debug_assert!(off + size <= self.cfg.sector_size);
        debug_assert!(size <= self.cfg.cache_size);
        if self.rcache.sector == sector && self.rcache.off == off && self.rcache.size == size {
            return Ok(());
        }
        if self.pcache.dirty
            && self.pcache.sector == sector
            && off < self.pcache.off + self.pcache.size
            && off + size > self.pcache.off
        {
            self.cache_flush()?;
        }
        self.rcache.reset();
        self.dev.read(sector, off, &mut self.rcache.buffer[..size as usize])?;
        self.rcache.sector = sector;
        self.rcache.off = off;
        self.rcache.size = size;
        Ok(())
    }

    /// Drops any window over `sector`; called before the sector is erased
    /// so no stale copy of its old contents survives.
    pub fn invalidate_sector(&mut self, sector: u32) {
        if self.rcache.sector == sector {
            self.rcache.reset();
        }
        if self.pcache.sector == sector {
            debug_assert!(!self.pcache.dirty);
            self.pcache.reset();
        }
    }

    /// Reads one 32-bit header word through a read window positioned at
    /// `off` (re-windowing when the current one does not cover it).
    pub fn read_word(&mut self, sector: u32, off: u32) -> Result<u32> {
        debug_assert!(off + HEAD_SIZE <= self.cfg.sector_size);
        let covered = self.rcache.sector == sector
            && off >= self.rcache.off
            && off + HEAD_SIZE <= self.rcache.off + self.rcache.size;
        if !covered {
            let size = self.cfg.cache_size.min(self.cfg.sector_size - off);
            self.fill_rcache(sector, off, size)?;
        }
        Ok(word_at(&self.rcache.buffer, (off - self.rcache.off) as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::head::{mkdhead, DataType};
    use cinder_ds_ram::RamNorFlash;

    fn io() -> Io<RamNorFlash> {
        let cfg = Config {
            read_size: 1,
            prog_size: 1,
            sector_size: 4096,
            sector_count: 64,
            cache_size: 256,
            region_cnt: 8,
            name_max: 255,
            file_max: crate::FILE_MAX_SIZE,
        };
        Io::new(RamNorFlash::new(4096, 64), cfg)
    }

    fn record(id: u32, payload: &[u8]) -> Vec<u8> {
        let len = HEAD_SIZE as usize + payload.len();
        let head = mkdhead(id, DataType::SfileData, len as u32);
        let mut bytes = head.to_le_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn flush_commits_written_bits() {
        let mut io = io();
        let rec = record(3, b"hello");
        io.cache_prog(5, 12, &rec).unwrap();
        io.cache_flush().unwrap();

        let head = io.read_word(5, 12).unwrap();
        assert!(head::dhead_check(head, Some(3), Some(DataType::SfileData)).is_ok());
        let mut payload = [0u8; 5];
        io.cache_read(5, 16, &mut payload).unwrap();
        assert_eq!(&payload, b"hello");
    }

    #[test]
    fn pending_bytes_are_readable_before_flush() {
        let mut io = io();
        let rec = record(1, b"abc");
        io.cache_prog(2, 12, &rec).unwrap();
        let mut payload = [0u8; 3];
        io.cache_read(2, 16, &mut payload).unwrap();
        assert_eq!(&payload, b"abc");
        // Nothing on the device yet.
        let mut raw = [0u8; 3];
        io.dev.read(2, 16, &mut raw).unwrap();
        assert_eq!(raw, [0xff; 3]);
    }

    #[test]
    fn window_loads_flush_overlapping_pending_writes() {
        let mut io = io();
        let rec = record(9, b"xyzw");
        io.cache_prog(7, 100, &rec).unwrap();
        io.fill_rcache(7, 96, 64).unwrap();
        let head = word_at(&io.rcache.buffer, 4);
        assert!(head::dhead_check(head, Some(9), None).is_ok());
    }

    #[test]
    fn head_validate_syncs_both_caches() {
        let mut io = io();
        let rec = record(4, b"1234");
        io.cache_prog(3, 40, &rec).unwrap();
        io.cache_flush().unwrap();
        io.fill_rcache(3, 40, 64).unwrap();
        io.head_validate(3, 40, crate::head::DHEAD_DELETE_SET).unwrap();
        let head = io.read_word(3, 40).unwrap();
        assert_eq!(head::dhead_type(head), DataType::Delete as u32);
        // Length survives the delete so traversal can still skip it.
        assert_eq!(head::dhead_dsize(head), 8);
    }

    #[test]
    fn non_contiguous_append_rebases_the_window() {
        let mut io = io();
        io.cache_prog(1, 12, &record(1, b"a")).unwrap();
        io.cache_prog(1, 40, &record(1, b"b")).unwrap();
        // First record must have been flushed and committed.
        let head = io.read_word(1, 12).unwrap();
        assert!(head::dhead_check(head, Some(1), None).is_ok());
    }
}
