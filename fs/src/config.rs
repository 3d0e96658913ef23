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

use cinder_err::{Error, FsError, Result};
use log::error;

use crate::{FILE_MAX_SIZE, NAME_MAX, REGION_NUM_MAX};

/// Host-provided geometry and limits, fixed for the lifetime of a mount.
/// The device itself is the [`cinder_ds::NorFlash`] implementor handed to
/// [`crate::Fs`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Minimum read granularity in bytes. Must divide `cache_size`.
    pub read_size: u32,
    /// Minimum program granularity in bytes. Must divide `cache_size`.
    pub prog_size: u32,
    /// Size of an erasable sector in bytes.
    pub sector_size: u32,
    /// Number of erasable sectors on the device.
    pub sector_count: u32,
    /// Size of the two sector caches in bytes. Must divide `sector_size`.
    pub cache_size: u32,
    /// Number of allocation regions. A power of two, at most 1024, and it
    /// must divide `sector_count`.
    pub region_cnt: u32,
    /// Upper limit on name length in bytes, at most 255. Stored in the
    /// superblock and checked on mount.
    pub name_max: u32,
    /// Upper limit on file size in bytes, at most 32 MiB. Stored in the
    /// superblock and checked on mount.
    pub file_max: u32,
}

impl Config {
    pub(crate) fn check(&self) -> Result<()> {
        let ok = self.read_size > 0
            && self.prog_size > 0
            && self.sector_size > 0
            && self.sector_count > 0
            && self.cache_size > 0
            && self.cache_size % self.read_size == 0
            && self.cache_size % self.prog_size == 0
            && self.sector_size % self.cache_size == 0
            && self.region_cnt > 0
            && self.region_cnt <= REGION_NUM_MAX
            && self.region_cnt.is_power_of_two()
            && self.sector_count % self.region_cnt == 0
            && self.name_max <= NAME_MAX
            && self.file_max <= FILE_MAX_SIZE;
        if !ok {
            error!("rejecting config: {self:?}");
            return Err(Error::Fs(FsError::Invalid));
        }
        Ok(())
    }

    /// Sectors per region.
    pub(crate) fn region_size(&self) -> u32 {
        self.sector_count / self.region_cnt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            read_size: 1,
            prog_size: 1,
            sector_size: 4096,
            sector_count: 8192,
            cache_size: 256,
            region_cnt: 128,
            name_max: 255,
            file_max: FILE_MAX_SIZE,
        }
    }

    #[test]
    fn accepts_the_reference_geometry() {
        assert!(base().check().is_ok());
        assert_eq!(base().region_size(), 64);
    }

    #[test]
    fn rejects_misaligned_sizes() {
        let mut cfg = base();
        cfg.cache_size = 300;
        assert!(cfg.check().is_err());

        let mut cfg = base();
        cfg.region_cnt = 100;
        assert!(cfg.check().is_err());

        let mut cfg = base();
        cfg.name_max = 4096;
        assert!(cfg.check().is_err());
    }
}
