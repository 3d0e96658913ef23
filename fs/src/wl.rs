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

//! Wear leveling, second phase.
//!
//! Once the free-plane scanner has looped often enough, allocations stop
//! walking regions in order and draw from ranked candidate pools instead.
//! When the pools have been recycled past a threshold, whole regions are
//! migrated: the least-worn regions trade physical places with the
//! most-worn ones through the reserve region, references are rewritten,
//! and the ascending-wear region array is persisted to a dedicated
//! sector referenced from the superblock.

use cinder_ds::NorFlash;
use cinder_err::{IoError, Result};
use log::debug;

use crate::cache::{word_at, ProgKind};
use crate::head::{self, DataType, SectorState, SectorType};
use crate::record::{WlAddr, DIR_SECTOR_HEAD_SIZE, HEAD_SIZE, INDEX_ENTRY_SIZE};
use crate::{Error, Fs, ID_ROOT, ID_SUPER, NULL, RAM_REGION_NUM, WL_SECTOR_NUM};

pub(crate) struct Wl {
    /// Sector holding the region array; header-less, meta region.
    pub begin: u32,
    /// Offset of the most recent array within that sector.
    pub off: u32,
    pub etimes: u32,
    /// Pool rotations since the pools were last rebuilt; the migration
    /// trigger.
    pub changed_region_times: u32,
    pub dir_region_index: usize,
    pub bfile_region_index: usize,
    /// Lowest-wear regions per role, ascending.
    pub dir_regions: Vec<u32>,
    pub bfile_regions: Vec<u32>,
}

impl Wl {
    pub fn new() -> Self {
        Self {
            begin: NULL,
            off: 0,
            etimes: 0,
            changed_region_times: 0,
            dir_region_index: 0,
            bfile_region_index: 0,
            dir_regions: Vec::new(),
            bfile_regions: Vec::new(),
        }
    }

    pub fn from_addr(begin: u32, off: u32, etimes: u32) -> Self {
        let mut wl = Self::new();
        wl.begin = begin;
        wl.off = off;
        wl.etimes = etimes;
        wl
    }

    pub fn pools_ready(&self) -> bool {
        !self.dir_regions.is_empty() || !self.bfile_regions.is_empty()
    }
}

impl<D: NorFlash> Fs<D> {
    /// Sums the erase counters of every region. Sectors without headers
    /// (map stores, the wear array) contribute their tracked counts.
    fn region_etimes_scan(&mut self) -> Result<Vec<u64>> {
        let region_size = self.manager.region_size;
        let mut sums = vec![0u64; self.manager.region_num as usize];

        let mut specials: Vec<(u32, u32)> = Vec::new();
        for (i, &etimes) in self.manager.etimes.iter().enumerate() {
            specials.push((self.manager.smap_begin + i as u32, etimes));
        }
        specials.push((self.id_map.begin, self.id_map.etimes));
        if let Some(wl) = &self.manager.wl {
            if wl.begin != NULL {
                specials.push((wl.begin, wl.etimes));
            }
        }

        for sector in 0..self.io.cfg.sector_count {
            let etimes = match specials.iter().find(|(special, _)| *special == sector) {
                Some((_, etimes)) => *etimes,
                None => {
                    let mut word = [0u8; 4];
                    self.io.direct_read(sector, 0, &mut word)?;
                    let shead = u32::from_le_bytes(word);
                    if shead == NULL || head::shead_novalid(shead) {
                        0
                    } else {
                        head::shead_etimes(shead)
                    }
                }
            };
            sums[(sector / region_size) as usize] += etimes as u64;
        }
        Ok(sums)
    }

    /// Candidate pools: the least-worn regions of each role, ascending.
    fn wl_fill_pools(&mut self, order: &[u32]) {
        let mut dir_pool = Vec::new();
        let mut bfile_pool = Vec::new();
        for &region in order {
            if dir_pool.len() < RAM_REGION_NUM && self.manager.region_map.is_dir(region) {
                dir_pool.push(region);
            }
            if bfile_pool.len() < RAM_REGION_NUM && self.manager.region_map.is_bfile(region) {
                bfile_pool.push(region);
            }
        }
        let wl = self.manager.wl.as_mut().unwrap();
        wl.dir_regions = dir_pool;
        wl.bfile_regions = bfile_pool;
        wl.dir_region_index = 0;
        wl.bfile_region_index = 0;
        wl.changed_region_times = 0;
    }

    /// Appends the ascending-wear region array to the wear sector and
    /// records its address in the superblock.
    fn wl_persist(&mut self, order: &[u32]) -> Result<()> {
        let len = 4 * order.len() as u32;
        let needs_sector = {
            let wl = self.manager.wl.as_ref().unwrap();
            wl.begin == NULL || wl.off + len > self.io.cfg.sector_size
        };
        if needs_sector {
            let (begin, etimes) = self.map_sector_alloc(WL_SECTOR_NUM)?;
            let wl = self.manager.wl.as_mut().unwrap();
            wl.begin = begin;
            wl.off = 0;
            wl.etimes = etimes[0];
        }

        let (begin, off, etimes) = {
            let wl = self.manager.wl.as_ref().unwrap();
            (wl.begin, wl.off, wl.etimes)
        };
        let mut bytes = Vec::with_capacity(len as usize);
        for &region in order {
            bytes.extend_from_slice(&region.to_le_bytes());
        }
        self.io.prog_raw(begin, off, &bytes)?;

        let record = WlAddr {
            head: head::mkdhead(
                ID_SUPER,
                DataType::WlAddr,
                core::mem::size_of::<WlAddr>() as u32,
            )
            .into(),
            begin: begin.into(),
            off: off.into(),
            erase_times: etimes.into(),
        };
        use zerocopy::IntoBytes;
        self.prog_in_superblock(record.as_bytes())?;

        self.manager.wl.as_mut().unwrap().off = off + len;
        Ok(())
    }

    /// Enters (or refreshes) the wear phase: rank regions by wear, build
    /// the candidate pools and persist the ranking. No data moves.
    pub(crate) fn wl_build(&mut self) -> Result<()> {
        if self.manager.wl.is_none() {
            self.manager.wl = Some(Wl::new());
        }
        let sums = self.region_etimes_scan()?;
        let mut order: Vec<u32> = (0..self.manager.region_num).collect();
        order.sort_unstable_by_key(|&region| sums[region as usize]);
        self.wl_fill_pools(&order);
        self.wl_persist(&order)?;
        debug!("wear phase ranking rebuilt");
        Ok(())
    }

    /// Rebuilds the pools from the persisted array at mount.
    pub(crate) fn wl_load_pools(&mut self) -> Result<()> {
        let (begin, off) = {
            let wl = self.manager.wl.as_ref().unwrap();
            (wl.begin, wl.off)
        };
        if begin == NULL {
            return Ok(());
        }
        let len = 4 * self.manager.region_num as usize;
        let mut bytes = vec![0u8; len];
        self.io.cache_read(begin, off, &mut bytes)?;
        let order: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
            .filter(|&region| region < self.manager.region_num)
            .collect();
        self.wl_fill_pools(&order);
        Ok(())
    }

    fn map_sector(perm: &[u32], region_size: u32, sector: u32) -> u32 {
        if sector == NULL {
            return NULL;
        }
        let region = sector / region_size;
        let target = perm[region as usize];
        if target == region {
            sector
        } else {
            target * region_size + sector % region_size
        }
    }

    /// Rewrites the references a dir sector image carries (chain link,
    /// child tails, big-file extents) against the region permutation.
    fn patch_dir_image(image: &mut [u8], perm: &[u32], region_size: u32) {
        let sector_size = image.len();
        let patch = |image: &mut [u8], at: usize| {
            let old = word_at(image, at);
            let new = Self::map_sector(perm, region_size, old);
            image[at..at + 4].copy_from_slice(&new.to_le_bytes());
        };
        patch(image, 4); // pre_sector

        let mut pos = DIR_SECTOR_HEAD_SIZE as usize;
        while pos + HEAD_SIZE as usize <= sector_size {
            let dhead = word_at(image, pos);
            if dhead == NULL {
                break;
            }
            let len = head::dhead_dsize(dhead) as usize;
            if len < HEAD_SIZE as usize || pos + len > sector_size {
                break;
            }
            match DataType::from_bits(head::dhead_type(dhead)) {
                Some(DataType::DirName | DataType::NDirName) => {
                    patch(image, pos + 4);
                }
                Some(DataType::BfileIndex) => {
                    let mut at = pos + HEAD_SIZE as usize;
                    while at + INDEX_ENTRY_SIZE as usize <= pos + len {
                        patch(image, at);
                        at += INDEX_ENTRY_SIZE as usize;
                    }
                }
                _ => {}
            }
            pos += len;
        }
    }

    /// Does this dir sector image reference any migrated region?
    fn image_needs_patch(image: &[u8], perm: &[u32], region_size: u32) -> bool {
        let refers = |sector: u32| {
            sector != NULL && perm[(sector / region_size) as usize] != sector / region_size
        };
        if refers(word_at(image, 4)) {
            return true;
        }
        let mut pos = DIR_SECTOR_HEAD_SIZE as usize;
        while pos + HEAD_SIZE as usize <= image.len() {
            let dhead = word_at(image, pos);
            if dhead == NULL {
                break;
            }
            let len = head::dhead_dsize(dhead) as usize;
            if len < HEAD_SIZE as usize || pos + len > image.len() {
                break;
            }
            match DataType::from_bits(head::dhead_type(dhead)) {
                Some(DataType::DirName | DataType::NDirName) => {
                    if refers(word_at(image, pos + 4)) {
                        return true;
                    }
                }
                Some(DataType::BfileIndex) => {
                    let mut at = pos + HEAD_SIZE as usize;
                    while at + INDEX_ENTRY_SIZE as usize <= pos + len {
                        if refers(word_at(image, at)) {
                            return true;
                        }
                        at += INDEX_ENTRY_SIZE as usize;
                    }
                }
                _ => {}
            }
            pos += len;
        }
        false
    }

    /// Copies one region's live sectors into `dst`, patching every image
    /// against `perm`, then erases the source.
    fn move_region(&mut self, src: u32, dst: u32, perm: &[u32]) -> Result<()> {
        let region_size = self.manager.region_size;
        let sector_size = self.io.cfg.sector_size as usize;
        let mut image = vec![0u8; sector_size];

        for k in 0..region_size {
            let src_sector = src * region_size + k;
            let dst_sector = dst * region_size + k;

            // The destination must be blank.
            let mut word = [0u8; 4];
            self.io.direct_read(dst_sector, 0, &mut word)?;
            let dst_head = u32::from_le_bytes(word);
            let dst_etimes = if dst_head == NULL {
                0
            } else {
                self.io.invalidate_sector(dst_sector);
                self.io.dev.erase(dst_sector)?;
                head::shead_etimes(dst_head) + 1
            };

            self.io.direct_read(src_sector, 0, &mut word)?;
            let src_head = u32::from_le_bytes(word);
            let live = src_head != NULL
                && !head::shead_novalid(src_head)
                && head::shead_state(src_head) == SectorState::Using as u32;

            if live {
                self.io.direct_read(src_sector, 0, &mut image)?;
                let patched_head = (src_head & !0x0003_ffff) | (dst_etimes & 0x0003_ffff);
                image[..4].copy_from_slice(&patched_head.to_le_bytes());
                if head::shead_type(src_head) == SectorType::Dir as u32 {
                    Self::patch_dir_image(&mut image, perm, region_size);
                }
                self.io.prog_raw(dst_sector, 0, &image)?;
                self.free_plane_bit_clear(dst_sector)?;
            } else if dst_etimes != 0 {
                // Keep the destination's erase count around.
                let marker =
                    head::mkshead(SectorState::Free, SectorType::NotSure, 0x3f, dst_etimes);
                self.io
                    .direct_prog(ProgKind::Shead, dst_sector, 0, &marker.to_le_bytes())?;
            }

            // Retire the source sector.
            if src_head != NULL {
                let src_etimes = head::shead_etimes(src_head);
                let was_marker = head::shead_check(
                    src_head,
                    Some(SectorState::Free),
                    Some(SectorType::NotSure),
                )
                .is_ok();
                if !was_marker || live {
                    self.io.invalidate_sector(src_sector);
                    self.io.dev.erase(src_sector)?;
                    let marker = head::mkshead(
                        SectorState::Free,
                        SectorType::NotSure,
                        0x3f,
                        src_etimes + 1,
                    );
                    self.io
                        .direct_prog(ProgKind::Shead, src_sector, 0, &marker.to_le_bytes())?;
                }
                self.erase_plane_bit_clear(src_sector)?;
            }
        }
        Ok(())
    }

    /// Global region migration: swap the least-worn data into the
    /// most-worn regions through the reserve, fix every reference, move
    /// the region roles along and rebuild the pools.
    pub(crate) fn wl_migrate(&mut self) -> Result<()> {
        self.io.cache_flush()?;
        self.smap_flush()?;

        let region_num = self.manager.region_num;
        let region_size = self.manager.region_size;
        let meta_region = self.manager.meta_map.region;
        let reserve = self.manager.region_map.reserve;

        let sums = self.region_etimes_scan()?;
        let mut order: Vec<u32> = (0..region_num)
            .filter(|&region| region != meta_region && region != reserve)
            .collect();
        order.sort_unstable_by_key(|&region| sums[region as usize]);

        let mut perm: Vec<u32> = (0..region_num).collect();
        let mut pairs: Vec<(u32, u32)> = Vec::new();
        let mut cur_reserve = reserve;
        let (mut lo, mut hi) = (0usize, order.len().saturating_sub(1));
        while lo < hi {
            let low = order[lo];
            let high = order[hi];
            pairs.push((low, cur_reserve));
            perm[low as usize] = cur_reserve;
            pairs.push((high, low));
            perm[high as usize] = low;
            cur_reserve = high;
            lo += 1;
            hi -= 1;
        }
        if pairs.is_empty() {
            return self.wl_build();
        }
        debug!("migrating {} region pairs through the reserve", pairs.len() / 2);

        for (src, dst) in pairs.clone() {
            self.move_region(src, dst, &perm)?;
        }

        // Any untouched dir sector may still point into a migrated
        // region; such sectors are patched by an in-place erase cycle.
        let targets: Vec<u32> = pairs.iter().map(|(_, dst)| *dst).collect();
        let sources: Vec<u32> = pairs.iter().map(|(src, _)| *src).collect();
        let sector_size = self.io.cfg.sector_size as usize;
        let mut image = vec![0u8; sector_size];
        for region in 0..region_num {
            if targets.contains(&region) || sources.contains(&region) || region == meta_region {
                continue;
            }
            for k in 0..region_size {
                let sector = region * region_size + k;
                let mut word = [0u8; 4];
                self.io.direct_read(sector, 0, &mut word)?;
                let shead = u32::from_le_bytes(word);
                if shead == NULL
                    || head::shead_novalid(shead)
                    || head::shead_state(shead) != SectorState::Using as u32
                    || head::shead_type(shead) != SectorType::Dir as u32
                {
                    continue;
                }
                self.io.direct_read(sector, 0, &mut image)?;
                if !Self::image_needs_patch(&image, &perm, region_size) {
                    continue;
                }
                Self::patch_dir_image(&mut image, &perm, region_size);
                let bumped = (shead & !0x0003_ffff) | ((head::shead_etimes(shead) + 1) & 0x0003_ffff);
                image[..4].copy_from_slice(&bumped.to_le_bytes());
                self.io.invalidate_sector(sector);
                self.io.dev.erase(sector)?;
                self.io.prog_raw(sector, 0, &image)?;
            }
        }

        // RAM mirrors follow the permutation.
        for entry in self.tree.iter_mut() {
            entry.name_sector = Self::map_sector(&perm, region_size, entry.name_sector);
            entry.tail_sector = Self::map_sector(&perm, region_size, entry.tail_sector);
        }
        for dir in &mut self.dirs {
            dir.tail_sector = Self::map_sector(&perm, region_size, dir.tail_sector);
            dir.name_sector = Self::map_sector(&perm, region_size, dir.name_sector);
            dir.pos_sector = Self::map_sector(&perm, region_size, dir.pos_sector);
            dir.pos_presector = Self::map_sector(&perm, region_size, dir.pos_presector);
        }
        for file in &mut self.files {
            file.sector = Self::map_sector(&perm, region_size, file.sector);
            file.cache.sector = Self::map_sector(&perm, region_size, file.cache.sector);
            if file.file_size > crate::FILE_SIZE_THRESHOLD {
                let size = file.cache.size as usize;
                let mut at = HEAD_SIZE as usize;
                while at + INDEX_ENTRY_SIZE as usize <= size {
                    let old = word_at(&file.cache.buffer, at);
                    let new = Self::map_sector(&perm, region_size, old);
                    file.cache.buffer[at..at + 4].copy_from_slice(&new.to_le_bytes());
                    at += INDEX_ENTRY_SIZE as usize;
                }
            }
        }

        // Roles travel with the data; the most-worn region becomes the
        // new reserve.
        let old_dir: Vec<u32> = (0..region_num)
            .filter(|&region| self.manager.region_map.is_dir(region))
            .collect();
        let old_bfile: Vec<u32> = (0..region_num)
            .filter(|&region| self.manager.region_map.is_bfile(region))
            .collect();
        self.manager.region_map.dir_region.fill(0xff);
        self.manager.region_map.bfile_region.fill(0xff);
        for region in old_dir {
            self.manager.region_map.mark_dir(perm[region as usize]);
        }
        for region in old_bfile {
            self.manager.region_map.mark_bfile(perm[region as usize]);
        }
        self.manager.region_map.reserve = cur_reserve;
        self.manager.region_map.change = crate::map::RegionMapChange::NewMap;
        self.manager.reserve_map.load_fresh(cur_reserve, region_size);

        // The roaming windows point at pre-migration content; drop them.
        for map in [&mut self.manager.dir_map, &mut self.manager.bfile_map, &mut self.manager.erase_map] {
            map.region = NULL;
            map.cursor = 0;
            map.free_num = NULL;
            map.buffer.fill(0xff);
        }

        // Re-anchor the root record and persist the new layout.
        let root_index = self.dir_index(ID_ROOT)?;
        self.dir_update(root_index)?;
        self.region_map_flush()?;
        self.wl_build()?;
        debug!("region migration complete, reserve is region {cur_reserve}");
        Ok(())
    }
}

impl<D: NorFlash> Fs<D> {
    /// Pops the next candidate region for the requested role; a pool that
    /// cannot serve it means the wear phase cannot place the allocation.
    pub(crate) fn wl_pool_region(&mut self, dir: bool) -> Result<u32> {
        let wl = self.manager.wl.as_mut().unwrap();
        let (pool, index) = if dir {
            (&wl.dir_regions, &mut wl.dir_region_index)
        } else {
            (&wl.bfile_regions, &mut wl.bfile_region_index)
        };
        if pool.is_empty() {
            return Err(Error::Io(IoError::NoSpace));
        }
        let region = pool[*index % pool.len()];
        *index = (*index + 1) % pool.len();
        wl.changed_region_times += 1;
        Ok(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{small_cfg, small_fs};
    use crate::{Whence, WL_MIGRATE_THRESHOLD, WL_START};

    #[test]
    fn build_ranks_regions_and_fills_pools() {
        let mut fs = small_fs();
        let fd = fs.file_open("/payload").unwrap();
        fs.file_write(fd, &[9u8; 2000]).unwrap();
        fs.file_close(fd).unwrap();

        fs.manager.scan_times = WL_START;
        fs.wl_build().unwrap();
        let wl = fs.manager.wl.as_ref().unwrap();
        assert!(wl.pools_ready());
        assert!(!wl.dir_regions.is_empty());
        assert!(!wl.bfile_regions.is_empty());
        assert_eq!(wl.changed_region_times, 0);
        for &region in &wl.dir_regions {
            assert!(fs.manager.region_map.is_dir(region));
        }
    }

    #[test]
    fn migration_preserves_data_and_swaps_roles() {
        let mut fs = small_fs();
        let payload: Vec<u8> = (0..3000u32).map(|at| (at % 251) as u8).collect();
        let fd = fs.file_open("/big").unwrap();
        fs.file_write(fd, &payload).unwrap();
        fs.file_close(fd).unwrap();
        fs.dir_open("/sub").unwrap();
        let fd = fs.file_open("/sub/small").unwrap();
        fs.file_write(fd, b"tiny").unwrap();
        fs.file_close(fd).unwrap();

        fs.manager.scan_times = WL_START;
        fs.wl_build().unwrap();
        fs.manager.wl.as_mut().unwrap().changed_region_times = WL_MIGRATE_THRESHOLD;
        fs.wl_migrate().unwrap();

        // The reserve is unique and carries no role.
        let reserve = fs.manager.region_map.reserve;
        assert!(!fs.manager.region_map.is_dir(reserve));
        assert!(!fs.manager.region_map.is_bfile(reserve));

        // Data is intact through the rebased references.
        let fd = fs.file_open("/big").unwrap();
        fs.file_seek(fd, 0, Whence::Set).unwrap();
        let mut back = vec![0u8; payload.len()];
        assert_eq!(fs.file_read(fd, &mut back).unwrap(), payload.len());
        assert_eq!(back, payload);
        fs.file_close(fd).unwrap();

        // And across an unmount/mount cycle.
        let dev = fs.unmount().unwrap();
        let mut fs = crate::Fs::mount(dev, small_cfg()).unwrap();
        let fd = fs.file_open("/sub/small").unwrap();
        fs.file_seek(fd, 0, Whence::Set).unwrap();
        let mut back = [0u8; 4];
        assert_eq!(fs.file_read(fd, &mut back).unwrap(), 4);
        assert_eq!(&back, b"tiny");
    }

    #[test]
    fn pool_rotation_counts_toward_migration() {
        let mut fs = small_fs();
        let fd = fs.file_open("/seed").unwrap();
        fs.file_write(fd, &[1u8; 1500]).unwrap();
        fs.file_close(fd).unwrap();

        fs.manager.scan_times = WL_START;
        fs.wl_build().unwrap();
        let before = fs.manager.wl.as_ref().unwrap().changed_region_times;
        fs.wl_pool_region(true).unwrap();
        fs.wl_pool_region(false).unwrap();
        assert_eq!(fs.manager.wl.as_ref().unwrap().changed_region_times, before + 2);
    }
}
