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

pub use cinder_err::{Error, IoError, Result};

/// Raw NOR flash, exposed as a linear array of fixed-size erase sectors.
///
/// A program operation may only clear bits (1 to 0); the only way to restore
/// a bit to 1 is to erase its whole sector. Implementations propagate device
/// failures as [`IoError::Device`] and the file system passes them through
/// unchanged.
pub trait NorFlash {
    /// Read `buf.len()` bytes starting at `off` within `sector`.
    fn read(&self, sector: u32, off: u32, buf: &mut [u8]) -> Result<()>;

    /// Program `buf` starting at `off` within `sector`, clearing bits only.
    fn prog(&mut self, sector: u32, off: u32, buf: &[u8]) -> Result<()>;

    /// Erase `sector` back to all-ones.
    fn erase(&mut self, sector: u32) -> Result<()>;

    /// Flush any buffered state in the driver to the physical device.
    fn sync(&mut self) -> Result<()>;
}

impl<T: NorFlash + ?Sized> NorFlash for &mut T {
    fn read(&self, sector: u32, off: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read(sector, off, buf)
    }

    fn prog(&mut self, sector: u32, off: u32, buf: &[u8]) -> Result<()> {
        (**self).prog(sector, off, buf)
    }

    fn erase(&mut self, sector: u32) -> Result<()> {
        (**self).erase(sector)
    }

    fn sync(&mut self) -> Result<()> {
        (**self).sync()
    }
}
