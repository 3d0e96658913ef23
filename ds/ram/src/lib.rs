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

use cinder_ds::NorFlash;
use cinder_err::{Error, IoError, Result};
use log::error;

/// A W25Q-class NOR flash emulated in RAM.
///
/// Program is a bitwise AND against the stored bytes, erase restores a whole
/// sector to `0xFF` and bumps that sector's erase counter. Cloning the device
/// snapshots the media, which is how the tests model power loss.
#[derive(Clone)]
pub struct RamNorFlash {
    sector_size: u32,
    sector_count: u32,
    data: Vec<u8>,
    erase_counts: Vec<u32>,
}

impl RamNorFlash {
    pub fn new(sector_size: u32, sector_count: u32) -> Self {
        Self {
            sector_size,
            sector_count,
            data: vec![0xff; sector_size as usize * sector_count as usize],
            erase_counts: vec![0; sector_count as usize],
        }
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn sector_count(&self) -> u32 {
        self.sector_count
    }

    /// How often `sector` has been erased since the device was created.
    pub fn erase_count(&self, sector: u32) -> u32 {
        self.erase_counts[sector as usize]
    }

    pub fn max_erase_count(&self) -> u32 {
        self.erase_counts.iter().copied().max().unwrap_or(0)
    }

    pub fn min_erase_count(&self) -> u32 {
        self.erase_counts.iter().copied().min().unwrap_or(0)
    }

    fn range(&self, sector: u32, off: u32, len: usize) -> Result<usize> {
        if sector >= self.sector_count || off as usize + len > self.sector_size as usize {
            error!("access out of range: sector {sector} off {off} len {len}");
            return Err(Error::Io(IoError::Device));
        }
        Ok(sector as usize * self.sector_size as usize + off as usize)
    }
}

impl NorFlash for RamNorFlash {
    fn read(&self, sector: u32, off: u32, buf: &mut [u8]) -> Result<()> {
        let begin = self.range(sector, off, buf.len())?;
        buf.copy_from_slice(&self.data[begin..begin + buf.len()]);
        Ok(())
    }

    fn prog(&mut self, sector: u32, off: u32, buf: &[u8]) -> Result<()> {
        let begin = self.range(sector, off, buf.len())?;
        for (stored, new) in self.data[begin..begin + buf.len()].iter_mut().zip(buf) {
            *stored &= *new;
        }
        Ok(())
    }

    fn erase(&mut self, sector: u32) -> Result<()> {
        let begin = self.range(sector, 0, self.sector_size as usize)?;
        self.data[begin..begin + self.sector_size as usize].fill(0xff);
        self.erase_counts[sector as usize] += 1;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prog_only_clears_bits() {
        let mut dev = RamNorFlash::new(4096, 8);
        dev.prog(0, 0, &[0xf0]).unwrap();
        dev.prog(0, 0, &[0x0f]).unwrap();
        let mut buf = [0u8; 1];
        dev.read(0, 0, &mut buf).unwrap();
        assert_eq!(buf[0], 0x00);
    }

    #[test]
    fn erase_restores_ones_and_counts() {
        let mut dev = RamNorFlash::new(4096, 8);
        dev.prog(3, 17, &[0x00, 0x12]).unwrap();
        dev.erase(3).unwrap();
        let mut buf = [0u8; 2];
        dev.read(3, 17, &mut buf).unwrap();
        assert_eq!(buf, [0xff, 0xff]);
        assert_eq!(dev.erase_count(3), 1);
    }

    #[test]
    fn out_of_range_is_a_device_error() {
        let mut dev = RamNorFlash::new(4096, 8);
        assert!(dev.prog(8, 0, &[0]).is_err());
        assert!(dev.read(0, 4095, &mut [0; 2]).is_err());
    }
}
