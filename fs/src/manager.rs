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

//! Space management: the sector allocator, region scheduling, the
//! in-flash plane rotation and the id allocator.

use cinder_ds::NorFlash;
use cinder_err::{Error, FsError, IoError, Result};
use log::{debug, error};
use zerocopy::IntoBytes;

use crate::cache::ProgKind;
use crate::config::Config;
use crate::head::{self, DataType, SectorState, SectorType, SHEAD_OLD_SET};
use crate::map::{MapWindow, RegionMap};
use crate::record::{BfileSectorHead, Commit, DirSectorHead, IndexEntry, MapAddr};
use crate::wl::Wl;
use crate::{smap_sectors, Fs, ID_MAX, ID_SUPER, NULL, WL_MIGRATE_THRESHOLD, WL_START};

/// Which bitmap window serves an allocation. Map and wear-leveling sectors
/// are routed to the meta region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MapKind {
    Meta,
    Dir,
    BigFile,
    Reserve,
}

impl MapKind {
    pub fn of(typ: SectorType) -> MapKind {
        match typ {
            SectorType::Dir => MapKind::Dir,
            SectorType::BigFile => MapKind::BigFile,
            SectorType::Reserve => MapKind::Reserve,
            _ => MapKind::Meta,
        }
    }
}

pub(crate) struct Manager {
    pub region_num: u32,
    pub region_size: u32,
    /// Full passes of the free-plane scanner; the wear-leveling phase
    /// threshold.
    pub scan_times: u32,
    /// First sector of the on-flash sector-map store (both planes).
    pub smap_begin: u32,
    pub smap_off: u32,
    /// Erase counts of the header-less map store sectors.
    pub etimes: Vec<u32>,
    pub region_map: RegionMap,
    pub meta_map: MapWindow,
    pub dir_map: MapWindow,
    pub bfile_map: MapWindow,
    pub reserve_map: MapWindow,
    pub erase_map: MapWindow,
    pub wl: Option<Wl>,
}

impl Manager {
    pub fn new(cfg: &Config, region_size: u32, smap_num: u32) -> Self {
        Self {
            region_num: cfg.region_cnt,
            region_size,
            scan_times: 0,
            smap_begin: NULL,
            smap_off: NULL,
            etimes: vec![0; smap_num as usize],
            region_map: RegionMap::new(cfg.region_cnt),
            meta_map: MapWindow::new(region_size),
            dir_map: MapWindow::new(region_size),
            bfile_map: MapWindow::new(region_size),
            reserve_map: MapWindow::new(region_size),
            erase_map: MapWindow::new(region_size),
            wl: None,
        }
    }

    pub fn map_mut(&mut self, kind: MapKind) -> &mut MapWindow {
        match kind {
            MapKind::Meta => &mut self.meta_map,
            MapKind::Dir => &mut self.dir_map,
            MapKind::BigFile => &mut self.bfile_map,
            MapKind::Reserve => &mut self.reserve_map,
        }
    }

    pub fn map_for(&self, kind: MapKind) -> &MapWindow {
        match kind {
            MapKind::Meta => &self.meta_map,
            MapKind::Dir => &self.dir_map,
            MapKind::BigFile => &self.bfile_map,
            MapKind::Reserve => &self.reserve_map,
        }
    }

    /// Byte offset of the erase plane within the map store.
    pub fn erase_plane_off(&self, cfg: &Config) -> u32 {
        self.smap_off + cfg.sector_count / 8
    }
}

impl<D: NorFlash> Fs<D> {
    /// Rotates `kind`'s window to its next region.
    ///
    /// Before the first full scan the reserve index walks forward and each
    /// call hands out a fresh region, marking it in the region-type bitmap.
    /// Afterwards the window cycles through the regions already carrying
    /// the role, merging the planes once per full loop. In the wear phase
    /// allocations draw from the candidate pools instead.
    pub(crate) fn next_smap(&mut self, kind: MapKind) -> Result<()> {
        let region_size = self.manager.region_size;
        let region_num = self.manager.region_num;

        if matches!(kind, MapKind::Meta | MapKind::Reserve) {
            let reserve = self.manager.region_map.reserve;
            let map = self.manager.map_mut(kind);
            if map.region == NULL {
                map.region = reserve;
                map.cursor = 0;
                map.free_num = map.count_free(region_size);
                self.manager.region_map.reserve = reserve + 1;
            } else {
                map.cursor = 0;
                map.free_num = map.count_free(region_size);
            }
            return Ok(());
        }

        // Write the current window back before pointing it elsewhere.
        {
            let (smap_begin, smap_off) = (self.manager.smap_begin, self.manager.smap_off);
            let (manager, io) = (&mut self.manager, &mut self.io);
            let map = manager.map_mut(kind);
            if map.region != NULL {
                map.flush(io, region_size, smap_begin, smap_off)?;
            }
        }

        if self.manager.scan_times >= WL_START {
            return self.next_smap_wl(kind);
        }

        let reserve = self.manager.region_map.reserve;
        if self.manager.scan_times == 0 && reserve != region_num - 1 {
            // A never-used region; nothing to read from flash.
            let map = self.manager.map_mut(kind);
            map.load_fresh(reserve, region_size);
            match kind {
                MapKind::Dir => {
                    self.manager.region_map.mark_dir(reserve);
                    self.manager.region_map.dir_index = reserve + 1;
                }
                _ => {
                    self.manager.region_map.mark_bfile(reserve);
                    self.manager.region_map.bfile_index = reserve + 1;
                }
            }
            self.manager.region_map.touch_in_place();
            self.manager.region_map.reserve = reserve + 1;
            return Ok(());
        }

        let mut index = match kind {
            MapKind::Dir => self.manager.region_map.dir_index,
            _ => self.manager.region_map.bfile_index,
        };
        let mut merged = false;
        let mut steps = 0;
        loop {
            if index >= region_num {
                index = 0;
                if !merged {
                    self.flash_smap_change()?;
                    merged = true;
                }
            }
            if steps > region_num {
                error!("no region carries this role, flash is full");
                return Err(Error::Io(IoError::NoSpace));
            }
            let carries_role = match kind {
                MapKind::Dir => self.manager.region_map.is_dir(index),
                _ => self.manager.region_map.is_bfile(index),
            };
            if carries_role {
                let (smap_begin, smap_off) = (self.manager.smap_begin, self.manager.smap_off);
                let (manager, io) = (&mut self.manager, &mut self.io);
                manager
                    .map_mut(kind)
                    .load(io, index, region_size, smap_begin, smap_off)?;
                match kind {
                    MapKind::Dir => self.manager.region_map.dir_index = index + 1,
                    _ => self.manager.region_map.bfile_index = index + 1,
                }
                return Ok(());
            }
            index += 1;
            steps += 1;
        }
    }

    /// Wear-phase window rotation: draw the next region from the ranked
    /// candidate pool, migrating once the pool has been recycled often
    /// enough.
    fn next_smap_wl(&mut self, kind: MapKind) -> Result<()> {
        if !self.manager.wl.as_ref().map_or(false, |wl| wl.pools_ready()) {
            self.wl_build()?;
        }
        if self.manager.wl.as_ref().unwrap().changed_region_times >= WL_MIGRATE_THRESHOLD {
            self.wl_migrate()?;
        }

        let region_size = self.manager.region_size;
        let region = self.wl_pool_region(kind == MapKind::Dir)?;

        let (smap_begin, smap_off) = (self.manager.smap_begin, self.manager.smap_off);
        let (manager, io) = (&mut self.manager, &mut self.io);
        manager
            .map_mut(kind)
            .load(io, region, region_size, smap_begin, smap_off)
    }

    /// Finds `num` contiguous free sectors for `kind`, rotating regions
    /// until one full loop fails.
    pub(crate) fn sectors_find(&mut self, kind: MapKind, num: u32) -> Result<u32> {
        let region_size = self.manager.region_size;
        debug_assert!(num <= region_size);
        if self.manager.map_for(kind).region == NULL {
            self.next_smap(kind)?;
        }

        let start_region = self.manager.map_for(kind).region;
        let mut wrapped = false;
        loop {
            if let Some(begin) = self.manager.map_mut(kind).find_free_run(region_size, num) {
                return Ok(begin);
            }
            self.next_smap(kind)?;
            if self.manager.map_for(kind).region == start_region {
                if wrapped {
                    error!("no {num} contiguous sectors left");
                    return Err(Error::Io(IoError::NoSpace));
                }
                wrapped = true;
            }
        }
    }

    /// Erases `sector` unless it is blank or already carries the
    /// freshly-erased marker. Returns whether an erase happened and the
    /// header found beforehand.
    pub(crate) fn sector_erase(&mut self, sector: u32) -> Result<(bool, u32)> {
        debug_assert!(sector < self.io.cfg.sector_count);
        let mut word = [0u8; 4];
        self.io.direct_read(sector, 0, &mut word)?;
        let old_head = u32::from_le_bytes(word);
        if old_head == NULL {
            return Ok((false, old_head));
        }
        if head::shead_check(old_head, Some(SectorState::Free), Some(SectorType::NotSure)).is_ok() {
            // Freshly erased already; the marker records the erase count.
            return Ok((false, old_head));
        }
        self.io.invalidate_sector(sector);
        self.io.dev.erase(sector)?;
        self.emap_set(sector, 1)?;
        Ok((true, old_head))
    }

    fn erase_count_after(erased: bool, old_head: u32) -> u32 {
        if old_head == NULL {
            0
        } else if erased {
            head::shead_etimes(old_head) + 1
        } else {
            head::shead_etimes(old_head)
        }
    }

    /// Allocates `num` contiguous sectors of `typ` and programs their
    /// prefixes. Map and wear-leveling sectors go through
    /// [`Fs::map_sector_alloc`] instead.
    pub(crate) fn sector_alloc(
        &mut self,
        typ: SectorType,
        num: u32,
        pre_sector: u32,
        id: u32,
        father_id: u32,
    ) -> Result<u32> {
        let begin = self.sectors_find(MapKind::of(typ), num)?;
        self.io.stats.sectors_allocated += num as u64;
        for i in 0..num {
            let sector = begin + i;
            let (erased, old_head) = self.sector_erase(sector)?;
            let etimes = Self::erase_count_after(erased, old_head);
            match typ {
                SectorType::Dir => {
                    let prefix = DirSectorHead {
                        head: head::mkshead(SectorState::Using, typ, 0x3f, etimes).into(),
                        pre_sector: pre_sector.into(),
                        id: id.into(),
                    };
                    self.io.direct_prog(ProgKind::Shead, sector, 0, prefix.as_bytes())?;
                }
                SectorType::BigFile => {
                    let prefix = BfileSectorHead {
                        head: head::mkshead(SectorState::Using, typ, 0x3f, etimes).into(),
                        id: id.into(),
                        father_id: father_id.into(),
                    };
                    self.io.direct_prog(ProgKind::Shead, sector, 0, prefix.as_bytes())?;
                }
                SectorType::Reserve => {
                    let shead = head::mkshead(SectorState::Using, typ, 0x3f, etimes);
                    self.io
                        .direct_prog(ProgKind::Shead, sector, 0, &shead.to_le_bytes())?;
                }
                _ => {
                    error!("wrong sector type for allocation: {typ:?}");
                    return Err(Error::Fs(FsError::Invalid));
                }
            }
        }
        Ok(begin)
    }

    /// Allocates blank sectors from the meta region for the header-less
    /// stores (bitmap planes, the wear-leveling array). Returns the first
    /// sector and the erase count of each.
    pub(crate) fn map_sector_alloc(&mut self, num: u32) -> Result<(u32, Vec<u32>)> {
        let begin = self.sectors_find(MapKind::Meta, num)?;
        self.io.stats.sectors_allocated += num as u64;
        let mut etimes = Vec::with_capacity(num as usize);
        for i in 0..num {
            let sector = begin + i;
            let mut word = [0u8; 4];
            self.io.direct_read(sector, 0, &mut word)?;
            let old_head = u32::from_le_bytes(word);
            if old_head == NULL {
                etimes.push(0);
                continue;
            }
            // A plane store must start all-ones, so even the erase marker
            // has to go.
            self.io.invalidate_sector(sector);
            self.io.dev.erase(sector)?;
            etimes.push(head::shead_etimes(old_head) + 1);
        }
        Ok((begin, etimes))
    }

    /// Erases retired map store sectors and stamps each with the
    /// freshly-erased marker so its erase count survives.
    pub(crate) fn map_sector_erase(&mut self, begin: u32, old_etimes: &[u32]) -> Result<()> {
        for (i, &etimes) in old_etimes.iter().enumerate() {
            let sector = begin + i as u32;
            self.io.invalidate_sector(sector);
            self.io.dev.erase(sector)?;
            let marker = head::mkshead(SectorState::Free, SectorType::NotSure, 0x3f, etimes + 1);
            self.io
                .direct_prog(ProgKind::Shead, sector, 0, &marker.to_le_bytes())?;
        }
        Ok(())
    }

    /// Retires a contiguous run: header state to Old, erase-plane bits
    /// cleared so the sectors can be reclaimed at the next plane merge.
    pub(crate) fn sequen_sector_old(&mut self, begin: u32, num: u32) -> Result<()> {
        if begin == NULL || num == 0 {
            return Ok(());
        }
        for i in 0..num {
            self.io.head_validate(begin + i, 0, SHEAD_OLD_SET)?;
        }
        self.emap_set(begin, num)
    }

    /// Retires every sector covered by the given big-file extents.
    pub(crate) fn bfile_sector_old(&mut self, entries: &[IndexEntry]) -> Result<()> {
        let sector_size = self.io.cfg.sector_size;
        for entry in entries {
            if entry.sector.get() == NULL || entry.size.get() == 0 {
                continue;
            }
            let count = crate::file::extent_sectors(sector_size, entry);
            self.sequen_sector_old(entry.sector.get(), count)?;
        }
        Ok(())
    }

    /// Clears the erase-plane bits of `num` sectors starting at `begin`.
    /// Meta and reserve sectors live in their permanently loaded windows;
    /// anything else goes through the roaming erase window, which is
    /// flushed whenever the run moves to another region.
    pub(crate) fn emap_set(&mut self, begin: u32, num: u32) -> Result<()> {
        let region_size = self.manager.region_size;
        for i in 0..num {
            let sector = begin + i;
            let region = sector / region_size;
            let bit = sector % region_size;
            if region == self.manager.meta_map.region {
                self.manager.meta_map.clear_bit(bit);
            } else if region == self.manager.reserve_map.region {
                self.manager.reserve_map.clear_bit(bit);
            } else {
                if self.manager.erase_map.region != region {
                    if self.manager.erase_map.cursor != 0 {
                        self.erase_map_flush(region)?;
                    } else {
                        self.manager.erase_map.region = region;
                    }
                }
                self.manager.erase_map.clear_bit(bit);
                self.manager.erase_map.cursor = 1;
            }
        }
        Ok(())
    }

    /// Programs a single sector's bit in the free plane to "in use".
    pub(crate) fn free_plane_bit_clear(&mut self, sector: u32) -> Result<()> {
        let byte_off = self.manager.smap_off + sector / 8;
        let (s, o) = roll(self.io.cfg.sector_size, self.manager.smap_begin, byte_off);
        self.io.prog_raw(s, o, &[!(1u8 << (sector % 8))])
    }

    /// Programs a single sector's bit in the erase plane to "reclaimable".
    pub(crate) fn erase_plane_bit_clear(&mut self, sector: u32) -> Result<()> {
        let byte_off = self.manager.erase_plane_off(&self.io.cfg) + sector / 8;
        let (s, o) = roll(self.io.cfg.sector_size, self.manager.smap_begin, byte_off);
        self.io.prog_raw(s, o, &[!(1u8 << (sector % 8))])
    }

    /// Returns retired header-less store sectors to circulation: their
    /// erase-plane bits clear so the next merge frees them, and the meta
    /// window can hand them out again within this session.
    fn release_meta_store(&mut self, begin: u32, num: u32) -> Result<()> {
        let region_size = self.manager.region_size;
        for i in 0..num {
            let sector = begin + i;
            self.erase_plane_bit_clear(sector)?;
            if sector / region_size == self.manager.meta_map.region {
                self.manager.meta_map.set_bit(sector % region_size);
                self.manager.meta_map.free_num += 1;
            }
        }
        Ok(())
    }

    /// Writes the erase-window delta to flash and re-arms it for
    /// `next_region`.
    pub(crate) fn erase_map_flush(&mut self, next_region: u32) -> Result<()> {
        let region_size = self.manager.region_size;
        let (begin, off) = (self.manager.smap_begin, self.manager.erase_plane_off(&self.io.cfg));
        {
            let (manager, io) = (&mut self.manager, &mut self.io);
            manager.erase_map.flush(io, region_size, begin, off)?;
        }
        let map = &mut self.manager.erase_map;
        map.buffer.fill(0xff);
        map.region = next_region;
        map.cursor = 0;
        map.free_num = 0;
        Ok(())
    }

    /// Flushes every sector-map window to the store.
    pub(crate) fn smap_flush(&mut self) -> Result<()> {
        let region_size = self.manager.region_size;
        let (begin, off) = (self.manager.smap_begin, self.manager.smap_off);
        let erase_off = self.manager.erase_plane_off(&self.io.cfg);
        let (manager, io) = (&mut self.manager, &mut self.io);
        manager.meta_map.flush(io, region_size, begin, off)?;
        manager.dir_map.flush(io, region_size, begin, off)?;
        manager.bfile_map.flush(io, region_size, begin, off)?;
        manager.reserve_map.flush(io, region_size, begin, off)?;
        if manager.erase_map.cursor != 0 {
            manager.erase_map.flush(io, region_size, begin, erase_off)?;
        }
        Ok(())
    }

    /// One full scan is over: merge the erase plane into the free plane
    /// (XNOR), write the result as a fresh free plane, retire the old
    /// store if it moved, and advance `scan_times`.
    pub(crate) fn flash_smap_change(&mut self) -> Result<()> {
        self.smap_flush()?;
        self.io.cache_flush()?;

        let cfg_sector_size = self.io.cfg.sector_size;
        let plane = self.io.cfg.sector_count / 8;
        let num = smap_sectors(&self.io.cfg);
        let old_begin = self.manager.smap_begin;
        let old_off = self.manager.smap_off;
        let old_etimes_snapshot = self.manager.etimes.clone();

        let moved;
        let (new_begin, new_off, new_etimes) =
            if old_off + 4 * plane <= num * cfg_sector_size {
                moved = false;
                (old_begin, old_off + 2 * plane, self.manager.etimes.clone())
            } else {
                moved = true;
                let (begin, etimes) = self.map_sector_alloc(num)?;
                (begin, 0, etimes)
            };

        // Stream-merge the two old planes into the new free plane. The new
        // erase plane stays erased: all-ones means "in use" for every
        // sector the merged plane hands out as free.
        let chunk_len = self.io.cfg.cache_size as usize;
        let mut free_chunk = vec![0u8; chunk_len];
        let mut erase_chunk = vec![0u8; chunk_len];
        let mut done = 0;
        while done < plane {
            let (src_f_sector, src_f_off) =
                roll(cfg_sector_size, old_begin, old_off + done);
            let (src_e_sector, src_e_off) =
                roll(cfg_sector_size, old_begin, old_off + plane + done);
            let (dst_sector, dst_off) = roll(cfg_sector_size, new_begin, new_off + done);
            let len = (plane - done)
                .min(chunk_len as u32)
                .min(cfg_sector_size - src_f_off)
                .min(cfg_sector_size - src_e_off)
                .min(cfg_sector_size - dst_off);
            self.io
                .direct_read(src_f_sector, src_f_off, &mut free_chunk[..len as usize])?;
            self.io
                .direct_read(src_e_sector, src_e_off, &mut erase_chunk[..len as usize])?;
            for (free, erase) in free_chunk[..len as usize]
                .iter_mut()
                .zip(&erase_chunk[..len as usize])
            {
                *free = !(*free ^ *erase);
            }
            self.io.prog_raw(dst_sector, dst_off, &free_chunk[..len as usize])?;
            done += len;
        }

        self.manager.smap_begin = new_begin;
        self.manager.smap_off = new_off;
        self.manager.etimes = new_etimes;

        if moved {
            // The fresh plane predates the new store's own allocation, so
            // claim its sectors there, then retire the old store.
            for i in 0..num {
                self.free_plane_bit_clear(new_begin + i)?;
            }
            let old_etimes = old_etimes_snapshot;
            self.map_sector_erase(old_begin, &old_etimes)?;
            self.release_meta_store(old_begin, num)?;
        }

        let mut record = MapAddr {
            head: 0.into(),
            begin: new_begin.into(),
            off: new_off.into(),
        }
        .as_bytes()
        .to_vec();
        for etimes in &self.manager.etimes {
            record.extend_from_slice(&etimes.to_le_bytes());
        }
        let head = head::mkdhead(ID_SUPER, DataType::SectorMap, record.len() as u32);
        record[..4].copy_from_slice(&head.to_le_bytes());
        self.prog_in_superblock(&record)?;

        self.manager.scan_times += 1;
        debug!("sector map rotated, scan {}", self.manager.scan_times);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Id map
    // ------------------------------------------------------------------

    fn id_direct_prog(&mut self, id: u32, plane_off: u32) -> Result<()> {
        let byte = !(1u8 << (id % 8));
        let (sector, off) = roll(
            self.io.cfg.sector_size,
            self.id_map.begin,
            self.id_map.off + plane_off + id / 8,
        );
        self.io.prog_raw(sector, off, &[byte])
    }

    /// Claims a free id and persists the claim immediately.
    pub(crate) fn id_alloc(&mut self) -> Result<u32> {
        let ids = self.id_map.ids_in_buffer;
        let region_cnt = self.io.cfg.region_cnt;
        if self.id_map.free_map.region == NULL {
            let (begin, off) = (self.id_map.begin, self.id_map.off);
            self.id_map.free_map.load(&mut self.io, 0, ids, begin, off)?;
        }
        for _ in 0..=region_cnt {
            if let Some(id) = self.id_map.free_map.find_free_run(ids, 1) {
                if id >= ID_MAX {
                    break;
                }
                self.id_direct_prog(id, 0)?;
                return Ok(id);
            }
            let mut next = self.id_map.free_map.region + 1;
            if next == region_cnt {
                self.idmap_change()?;
                next = 0;
            }
            let (begin, off) = (self.id_map.begin, self.id_map.off);
            self.id_map.free_map.load(&mut self.io, next, ids, begin, off)?;
        }
        Err(Error::Fs(FsError::NoId))
    }

    /// Releases an id by clearing its bit in the remove plane; it becomes
    /// allocatable again after the next id-plane merge.
    pub(crate) fn id_free(&mut self, id: u32) -> Result<()> {
        self.id_direct_prog(id, ID_MAX / 8)
    }

    /// Rotates the id planes: merge free and remove into a fresh free
    /// plane, relocating the store when the current sector is full.
    pub(crate) fn idmap_change(&mut self) -> Result<()> {
        self.io.cache_flush()?;

        let sector_size = self.io.cfg.sector_size;
        let plane = ID_MAX / 8;
        let num = crate::align_up(2 * plane, sector_size) / sector_size;
        let old_begin = self.id_map.begin;
        let old_off = self.id_map.off;
        let old_etimes = self.id_map.etimes;

        let moved;
        let (new_begin, new_off, new_etimes) = if old_off + 4 * plane <= num * sector_size {
            moved = false;
            (old_begin, old_off + 2 * plane, old_etimes)
        } else {
            moved = true;
            let (begin, etimes) = self.map_sector_alloc(num)?;
            (begin, 0, etimes.first().copied().unwrap_or(0))
        };

        let chunk_len = self.io.cfg.cache_size as usize;
        let mut free_chunk = vec![0u8; chunk_len];
        let mut remove_chunk = vec![0u8; chunk_len];
        let mut done = 0;
        while done < plane {
            let (src_f_sector, src_f_off) = roll(sector_size, old_begin, old_off + done);
            let (src_r_sector, src_r_off) = roll(sector_size, old_begin, old_off + plane + done);
            let (dst_sector, dst_off) = roll(sector_size, new_begin, new_off + done);
            let len = (plane - done)
                .min(chunk_len as u32)
                .min(sector_size - src_f_off)
                .min(sector_size - src_r_off)
                .min(sector_size - dst_off);
            self.io
                .direct_read(src_f_sector, src_f_off, &mut free_chunk[..len as usize])?;
            self.io
                .direct_read(src_r_sector, src_r_off, &mut remove_chunk[..len as usize])?;
            for (free, remove) in free_chunk[..len as usize]
                .iter_mut()
                .zip(&remove_chunk[..len as usize])
            {
                *free = !(*free ^ *remove);
            }
            self.io.prog_raw(dst_sector, dst_off, &free_chunk[..len as usize])?;
            done += len;
        }

        self.id_map.begin = new_begin;
        self.id_map.off = new_off;
        self.id_map.etimes = new_etimes;

        if moved {
            // Only retire the old store once the merge has read it.
            self.free_plane_bit_clear(new_begin)?;
            self.map_sector_erase(old_begin, &[old_etimes])?;
            self.release_meta_store(old_begin, num)?;
        }

        let mut record = MapAddr {
            head: 0.into(),
            begin: new_begin.into(),
            off: new_off.into(),
        }
        .as_bytes()
        .to_vec();
        record.extend_from_slice(&self.id_map.etimes.to_le_bytes());
        let head = head::mkdhead(ID_SUPER, DataType::IdMap, record.len() as u32);
        record[..4].copy_from_slice(&head.to_le_bytes());
        self.prog_in_superblock(&record)?;
        debug!("id map rotated to ({new_begin}, {new_off})");
        Ok(())
    }

    /// Rebuilds the RAM windows from the resume cursor of a committed
    /// superblock generation.
    pub(crate) fn init_with_commit(&mut self, commit: &Commit) -> Result<()> {
        let ids = self.id_map.ids_in_buffer;
        let region_size = self.manager.region_size;

        let next_id = commit.next_id.get();
        let id_region = if next_id == NULL { 0 } else { (next_id / ids).min(self.io.cfg.region_cnt - 1) };
        let (begin, off) = (self.id_map.begin, self.id_map.off);
        self.id_map.free_map.load(&mut self.io, id_region, ids, begin, off)?;

        self.manager.scan_times = commit.scan_times.get();

        let (smap_begin, smap_off) = (self.manager.smap_begin, self.manager.smap_off);
        let next_dir = commit.next_dir_sector.get();
        if next_dir != NULL {
            // A cursor sitting exactly on a region edge may name a region
            // that never carried the role; the window stays empty then and
            // the next allocation rotates properly.
            let region = next_dir / region_size;
            if region < self.manager.region_num && self.manager.region_map.is_dir(region) {
                self.manager.region_map.dir_index = region + 1;
                let (manager, io) = (&mut self.manager, &mut self.io);
                manager.dir_map.load(io, region, region_size, smap_begin, smap_off)?;
            }
        }
        let next_bfile = commit.next_bfile_sector.get();
        if next_bfile != NULL {
            let region = next_bfile / region_size;
            if region < self.manager.region_num && self.manager.region_map.is_bfile(region) {
                self.manager.region_map.bfile_index = region + 1;
                let (manager, io) = (&mut self.manager, &mut self.io);
                manager.bfile_map.load(io, region, region_size, smap_begin, smap_off)?;
            }
        }

        {
            let (manager, io) = (&mut self.manager, &mut self.io);
            manager.meta_map.load(io, 0, region_size, smap_begin, smap_off)?;
        }

        let reserve = commit.reserve_region.get();
        self.manager.region_map.reserve = reserve;
        if reserve < self.manager.region_num {
            let (manager, io) = (&mut self.manager, &mut self.io);
            manager.reserve_map.load(io, reserve, region_size, smap_begin, smap_off)?;
        }

        if self.manager.wl.is_some() {
            self.wl_load_pools()?;
        }
        Ok(())
    }

    /// Marks a record deleted in place and accounts the reclaimable bytes
    /// to the owning directory.
    pub(crate) fn data_delete(
        &mut self,
        father_id: u32,
        sector: u32,
        off: u32,
        size: u32,
    ) -> Result<()> {
        if sector == NULL {
            // The record was never persisted.
            return Ok(());
        }
        self.io.head_validate(sector, off, head::DHEAD_DELETE_SET)?;
        if father_id == ID_SUPER {
            return Ok(());
        }
        match self.dirs.iter_mut().find(|dir| dir.id == father_id) {
            Some(dir) => {
                dir.old_space += size;
                Ok(())
            }
            None => {
                error!("parent {father_id} is not open");
                Err(Error::Fs(FsError::NoFather))
            }
        }
    }
}

/// Advances a store-relative byte offset into `(sector, offset)`.
pub(crate) fn roll(sector_size: u32, begin: u32, off: u32) -> (u32, u32) {
    (begin + off / sector_size, off % sector_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erase_counts_follow_the_marker() {
        assert_eq!(Fs::<cinder_ds_ram::RamNorFlash>::erase_count_after(false, NULL), 0);
        let marker = head::mkshead(SectorState::Free, SectorType::NotSure, 0x3f, 7);
        assert_eq!(Fs::<cinder_ds_ram::RamNorFlash>::erase_count_after(false, marker), 7);
        let used = head::mkshead(SectorState::Using, SectorType::Dir, 0x3f, 7);
        assert_eq!(Fs::<cinder_ds_ram::RamNorFlash>::erase_count_after(true, used), 8);
    }

    #[test]
    fn roll_wraps_offsets_into_sectors() {
        assert_eq!(roll(4096, 10, 0), (10, 0));
        assert_eq!(roll(4096, 10, 4095), (10, 4095));
        assert_eq!(roll(4096, 10, 4096), (11, 0));
        assert_eq!(roll(4096, 10, 10_000), (12, 1808));
    }
}
