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

//! The superblock: sectors 0 and 1 alternate, each holding an append log
//! of typed records that ends in a commit. Rotation erases the other
//! sector, bumps the 6-bit generation by two and replays the live record
//! set; the new generation becomes authoritative with a single masked
//! header write flipping its state from Allocating to Using.

use cinder_ds::NorFlash;
use cinder_err::{CorruptError, Error, IoError, Result};
use log::{debug, error};
use zerocopy::IntoBytes;

use crate::cache::ProgKind;
use crate::head::{
    self, DataType, SectorState, SectorType, SHEAD_USING_SET,
};
use crate::map::RegionMapChange;
use crate::record::{DirName, MapAddr, SuperMessage, WlAddr, HEAD_SIZE};
use crate::{smap_sectors, Fs, FS_NAME, ID_ROOT, ID_SUPER, NULL, VERSION, WL_START};

pub(crate) struct SuperBlock {
    pub sector: u32,
    pub free_off: u32,
}

impl SuperBlock {
    pub fn new() -> Self {
        Self {
            sector: NULL,
            free_off: 0,
        }
    }
}

impl<D: NorFlash> Fs<D> {
    /// Picks the live superblock generation. A sector that never finished
    /// rotating (still Allocating, or erased) is ignored.
    pub(crate) fn select_supersector(&mut self) -> Result<u32> {
        let mut heads = [0u32; 2];
        for (sector, head) in heads.iter_mut().enumerate() {
            let mut word = [0u8; 4];
            self.io.direct_read(sector as u32, 0, &mut word)?;
            *head = u32::from_le_bytes(word);
        }

        let live = |head: u32| {
            head != NULL
                && head::shead_check(head, Some(SectorState::Using), Some(SectorType::Super))
                    .is_ok()
        };
        match (live(heads[0]), live(heads[1])) {
            (false, false) => {
                if heads[0] == NULL && heads[1] == NULL {
                    Err(Error::Io(IoError::NoData))
                } else {
                    error!("neither superblock generation is usable");
                    Err(Error::Corrupt(CorruptError::Data))
                }
            }
            (true, false) => Ok(0),
            (false, true) => Ok(1),
            (true, true) => {
                // Generations step by two, so the newer one is exactly the
                // other plus two modulo 0x40; this also settles the wrap.
                let gen0 = head::shead_extend(heads[0]);
                let gen1 = head::shead_extend(heads[1]);
                if (gen0 + 2) % 0x40 == gen1 {
                    Ok(1)
                } else if (gen1 + 2) % 0x40 == gen0 {
                    Ok(0)
                } else {
                    error!("superblock generations {gen0:#x}/{gen1:#x} are unrelated");
                    Err(Error::Corrupt(CorruptError::Data))
                }
            }
        }
    }

    /// Appends one record to the live super log, rotating first when the
    /// sector is full.
    pub(crate) fn prog_in_superblock(&mut self, record: &[u8]) -> Result<()> {
        if self.superblock.free_off + record.len() as u32 > self.io.cfg.sector_size {
            self.superblock_change(false)?;
        }
        let (sector, off) = (self.superblock.sector, self.superblock.free_off);
        self.io.direct_prog(ProgKind::Dhead, sector, off, record)?;
        self.superblock.free_off = off + record.len() as u32;
        Ok(())
    }

    fn super_append(&mut self, record: &[u8]) -> Result<u32> {
        let off = self.superblock.free_off;
        debug_assert!(off + record.len() as u32 <= self.io.cfg.sector_size);
        if record.len() as u32 > self.io.cfg.cache_size {
            self.io.cache_flush()?;
            self.io
                .direct_prog(ProgKind::Dhead, self.superblock.sector, off, record)?;
        } else {
            self.io.cache_prog(self.superblock.sector, off, record)?;
        }
        self.superblock.free_off = off + record.len() as u32;
        Ok(off)
    }

    fn region_map_record(&self) -> Vec<u8> {
        let map_len = self.manager.region_map.dir_region.len();
        let len = HEAD_SIZE as usize + 2 * map_len;
        let mut record =
            head::mkdhead(ID_SUPER, DataType::RegionMap, len as u32).to_le_bytes().to_vec();
        record.extend_from_slice(&self.manager.region_map.dir_region);
        record.extend_from_slice(&self.manager.region_map.bfile_region);
        record
    }

    /// Persists the region-role bitmaps: in place while only bits were
    /// cleared, as a fresh record otherwise.
    pub(crate) fn region_map_flush(&mut self) -> Result<()> {
        match self.manager.region_map.change {
            RegionMapChange::NoChange => Ok(()),
            RegionMapChange::InPlace => {
                let (begin, off) = (self.manager.region_map.begin, self.manager.region_map.off);
                if begin == NULL {
                    return Ok(());
                }
                let dir = self.manager.region_map.dir_region.clone();
                let bfile = self.manager.region_map.bfile_region.clone();
                self.io.prog_raw(begin, off + HEAD_SIZE, &dir)?;
                self.io
                    .prog_raw(begin, off + HEAD_SIZE + dir.len() as u32, &bfile)?;
                self.manager.region_map.change = RegionMapChange::NoChange;
                Ok(())
            }
            RegionMapChange::NewMap => {
                let record = self.region_map_record();
                let pos = self.superblock.free_off;
                self.prog_in_superblock(&record)?;
                // Rotation replays the record itself; only adopt the
                // position when the append landed in the same generation.
                if self.superblock.free_off == pos + record.len() as u32 {
                    self.manager.region_map.begin = self.superblock.sector;
                    self.manager.region_map.off = pos;
                }
                self.manager.region_map.change = RegionMapChange::NoChange;
                Ok(())
            }
        }
    }

    /// Rotates to the other super sector and replays the live record set:
    /// super message, region map, id map address, sector map address, the
    /// root's tail, the wear-leveling address once engaged, and optionally
    /// the commit.
    pub(crate) fn superblock_change(&mut self, if_commit: bool) -> Result<()> {
        self.io.cache_flush()?;

        let new_sector = if self.superblock.sector == NULL {
            0
        } else {
            (self.superblock.sector + 1) % 2
        };
        let (erased, old_head) = self.sector_erase(new_sector)?;
        let prev_gen = if old_head == NULL {
            0x3f
        } else {
            head::shead_extend(old_head)
        };
        let etimes = if old_head == NULL {
            0
        } else if erased {
            head::shead_etimes(old_head) + 1
        } else {
            head::shead_etimes(old_head)
        };
        let generation = (prev_gen + 2) % 0x40;
        debug!("superblock rotates to sector {new_sector}, generation {generation:#x}");

        let shead = head::mkshead(SectorState::Allocating, SectorType::Super, generation, etimes);
        self.io
            .direct_prog(ProgKind::Shead, new_sector, 0, &shead.to_le_bytes())?;
        self.superblock.sector = new_sector;
        self.superblock.free_off = HEAD_SIZE;

        // 1. The filesystem message.
        let cfg = &self.io.cfg;
        let message = SuperMessage {
            head: head::mkdhead(
                ID_SUPER,
                DataType::SuperMessage,
                core::mem::size_of::<SuperMessage>() as u32,
            )
            .into(),
            version: VERSION.into(),
            sector_size: cfg.sector_size.into(),
            sector_count: cfg.sector_count.into(),
            name_max: cfg.name_max.into(),
            file_max: cfg.file_max.into(),
            region_cnt: cfg.region_cnt.into(),
            fs_name: FS_NAME,
        };
        self.super_append(message.as_bytes())?;

        // 2. The region-role bitmaps.
        let record = self.region_map_record();
        let pos = self.super_append(&record)?;
        self.manager.region_map.begin = new_sector;
        self.manager.region_map.off = pos;
        self.manager.region_map.change = RegionMapChange::NoChange;

        // 3. The id map address.
        let mut record = MapAddr {
            head: head::mkdhead(
                ID_SUPER,
                DataType::IdMap,
                core::mem::size_of::<MapAddr>() as u32 + 4,
            )
            .into(),
            begin: self.id_map.begin.into(),
            off: self.id_map.off.into(),
        }
        .as_bytes()
        .to_vec();
        record.extend_from_slice(&self.id_map.etimes.to_le_bytes());
        self.super_append(&record)?;

        // 4. The sector map address.
        let num = smap_sectors(&self.io.cfg);
        let mut record = MapAddr {
            head: head::mkdhead(
                ID_SUPER,
                DataType::SectorMap,
                core::mem::size_of::<MapAddr>() as u32 + 4 * num,
            )
            .into(),
            begin: self.manager.smap_begin.into(),
            off: self.manager.smap_off.into(),
        }
        .as_bytes()
        .to_vec();
        for etimes in &self.manager.etimes {
            record.extend_from_slice(&etimes.to_le_bytes());
        }
        self.super_append(&record)?;

        // 5. The root directory's tail. The root has no name bytes.
        let root_tail = self
            .tree
            .get(0)
            .map(|entry| entry.tail_sector)
            .unwrap_or(NULL);
        let record = DirName {
            head: head::mkdhead(
                ID_ROOT,
                DataType::DirName,
                core::mem::size_of::<DirName>() as u32,
            )
            .into(),
            tail: root_tail.into(),
        };
        let pos = self.super_append(record.as_bytes())?;
        self.tree.update(ID_ROOT, new_sector, pos, NULL);
        if let Some(root) = self.dirs.iter_mut().find(|dir| dir.id == ID_ROOT) {
            root.name_sector = new_sector;
            root.name_off = pos;
            root.namelen = 0;
        }

        // 6. The wear-leveling address, once the second phase is engaged.
        if self.manager.scan_times >= WL_START {
            if let Some(wl) = &self.manager.wl {
                let record = WlAddr {
                    head: head::mkdhead(
                        ID_SUPER,
                        DataType::WlAddr,
                        core::mem::size_of::<WlAddr>() as u32,
                    )
                    .into(),
                    begin: wl.begin.into(),
                    off: wl.off.into(),
                    erase_times: wl.etimes.into(),
                };
                self.super_append(record.as_bytes())?;
            }
        }

        // 7. The commit, when rotation doubles as a checkpoint.
        if if_commit {
            let commit = self.commit_record();
            self.super_append(commit.as_bytes())?;
        }

        self.io.cache_flush()?;
        self.io.head_validate(new_sector, 0, SHEAD_USING_SET)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{small_cfg, small_fs};
    use crate::Fs;

    #[test]
    fn generation_comparison_handles_wrap() {
        // Freshly formatted: generation 1 alone on sector 0.
        let gen_pairs = [(0x01u32, 0x03u32), (0x3d, 0x3f), (0x3f, 0x01), (0x3e, 0x00)];
        for (older, newer) in gen_pairs {
            assert_eq!((older + 2) % 0x40, newer);
        }
    }

    #[test]
    fn rotation_alternates_and_the_newer_generation_wins() {
        let mut fs = small_fs();
        let first = fs.superblock.sector;
        // Enough rotations to wrap the 6-bit generation space.
        for _ in 0..71 {
            fs.superblock_change(false).unwrap();
        }
        assert_ne!(fs.superblock.sector, first);
        let live = fs.select_supersector().unwrap();
        assert_eq!(live, fs.superblock.sector);

        let dev = fs.unmount().unwrap();
        assert!(Fs::mount(dev, small_cfg()).is_ok());
    }

    #[test]
    fn appending_past_the_sector_rotates() {
        let mut fs = small_fs();
        let before = fs.superblock.sector;
        // Root-tail records are 8 bytes; force the log over the edge.
        let spam = fs.superblock.free_off;
        let room = (fs.io.cfg.sector_size - spam) / 8 + 1;
        for _ in 0..room {
            let record = DirName {
                head: head::mkdhead(ID_ROOT, DataType::DirName, 8).into(),
                tail: fs.tree.get(0).unwrap().tail_sector.into(),
            };
            fs.prog_in_superblock(record.as_bytes()).unwrap();
        }
        assert_ne!(fs.superblock.sector, before);
        let dev = fs.unmount().unwrap();
        assert!(Fs::mount(dev, small_cfg()).is_ok());
    }
}
