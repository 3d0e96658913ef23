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

//! Sector and data header codec.
//!
//! Both headers are single 32-bit little-endian words. Every field inverts
//! the flash idiom: the erased state of a bit is 1, so "set" means
//! programmed to 0. A word read back as `0xFFFF_FFFF` is unprogrammed and
//! legally means end-of-data.
//!
//! Sector header: `valid[31] | state[27..31] | type[24..27] | extend[18..24]
//! | etimes[0..18]`.
//!
//! Data header: `valid[31] | written[30] | id[17..30] | type[12..17]
//! | len[0..12]`. The written bit is cleared only after the payload is fully
//! programmed, which makes a torn record detectable on recovery.

use cinder_err::{CorruptError, Error, Result};
use log::error;

use crate::NULL;

/// Clears the written bit of a data header when programmed over it.
pub const DHEAD_WRITTEN_SET: u32 = 0xbfff_ffff;
/// Clears the type field of a data header to `Delete`.
pub const DHEAD_DELETE_SET: u32 = 0xfffe_0fff;
/// Forces the state field of a sector header to `Old`.
pub const SHEAD_OLD_SET: u32 = 0x87ff_ffff;
/// Forces the state field of a sector header to `Using`.
pub const SHEAD_USING_SET: u32 = 0x8fff_ffff;

/// Sector lifecycle. Transitions clear bits monotonically:
/// `Free (0xF) -> Allocating (0x3) -> Using (0x1) -> Old (0x0)`, with the
/// side states `Wl` and `Gc` for relocation work in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SectorState {
    Free = 0xf,
    Wl = 0xb,
    Gc = 0x7,
    Allocating = 0x3,
    Using = 0x1,
    Old = 0x0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SectorType {
    Super = 0x0,
    Dir = 0x1,
    BigFile = 0x2,
    Wl = 0x4,
    Map = 0x5,
    Reserve = 0x6,
    /// Placeholder written to freshly erased, header-less sectors so the
    /// erase count survives; also the wildcard in checks.
    NotSure = 0x7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DataType {
    Free = 0x1f,
    SuperMessage = 0x1e,
    Commit = 0x1d,
    SectorMap = 0x19,
    IdMap = 0x18,
    RegionMap = 0x17,
    WlAddr = 0x16,
    // The N prefix marks a name whose id allocation has not been committed
    // yet, so a crash during creation can release the id.
    NDirName = 0x14,
    NFileName = 0x13,
    DirName = 0x0e,
    FileName = 0x0c,
    BfileIndex = 0x0b,
    SfileData = 0x0a,
    DirOspace = 0x09,
    Delete = 0x00,
}

impl DataType {
    pub fn from_bits(bits: u32) -> Option<DataType> {
        Some(match bits {
            0x1f => DataType::Free,
            0x1e => DataType::SuperMessage,
            0x1d => DataType::Commit,
            0x19 => DataType::SectorMap,
            0x18 => DataType::IdMap,
            0x17 => DataType::RegionMap,
            0x16 => DataType::WlAddr,
            0x14 => DataType::NDirName,
            0x13 => DataType::NFileName,
            0x0e => DataType::DirName,
            0x0c => DataType::FileName,
            0x0b => DataType::BfileIndex,
            0x0a => DataType::SfileData,
            0x09 => DataType::DirOspace,
            0x00 => DataType::Delete,
            _ => return None,
        })
    }
}

/// Builds a sector header with the valid bit already set (programmed to 0).
pub fn mkshead(state: SectorState, typ: SectorType, extend: u32, etimes: u32) -> u32 {
    debug_assert!(extend <= 0x3f);
    debug_assert!(etimes <= 0x3ffff);
    (state as u32) << 27 | (typ as u32) << 24 | extend << 18 | etimes
}

/// Builds a data header with the valid bit set and the written bit still 1;
/// the written bit is cleared by a second masked program once the payload is
/// durable.
pub fn mkdhead(id: u32, typ: DataType, len: u32) -> u32 {
    debug_assert!(id <= 0x1fff);
    debug_assert!(len <= 0xfff);
    1 << 30 | id << 17 | (typ as u32) << 12 | len
}

pub fn shead_novalid(shead: u32) -> bool {
    shead & 0x8000_0000 != 0
}

pub fn shead_state(shead: u32) -> u32 {
    (shead & 0x7800_0000) >> 27
}

pub fn shead_type(shead: u32) -> u32 {
    (shead & 0x0700_0000) >> 24
}

/// Extend message, e.g. the generation counter for superblock sectors.
pub fn shead_extend(shead: u32) -> u32 {
    (shead & 0x00fc_0000) >> 18
}

pub fn shead_etimes(shead: u32) -> u32 {
    shead & 0x0003_ffff
}

pub fn dhead_novalid(dhead: u32) -> bool {
    dhead & 0x8000_0000 != 0
}

pub fn dhead_nowritten(dhead: u32) -> bool {
    dhead & 0x4000_0000 != 0
}

pub fn dhead_id(dhead: u32) -> u32 {
    (dhead & 0x3ffe_0000) >> 17
}

pub fn dhead_type(dhead: u32) -> u32 {
    (dhead & 0x0001_f000) >> 12
}

/// Total record length including the header itself.
pub fn dhead_dsize(dhead: u32) -> u32 {
    dhead & 0x0000_0fff
}

/// Checks a sector header against expectations. `NULL` is always accepted
/// as "not yet programmed". `None` skips the state or type comparison.
pub fn shead_check(shead: u32, state: Option<SectorState>, typ: Option<SectorType>) -> Result<()> {
    if shead == NULL {
        return Ok(());
    }
    if shead_novalid(shead) {
        error!("sector header {shead:#010x} has no valid bit");
        return Err(Error::Corrupt(CorruptError::Head));
    }
    if let Some(state) = state {
        if shead_state(shead) != state as u32 {
            error!("sector header {shead:#010x} is not in state {state:?}");
            return Err(Error::Corrupt(CorruptError::Head));
        }
    }
    if let Some(typ) = typ {
        if shead_type(shead) != typ as u32 {
            error!("sector header {shead:#010x} is not of type {typ:?}");
            return Err(Error::Corrupt(CorruptError::Head));
        }
    }
    if shead == 0 {
        return Err(Error::Corrupt(CorruptError::Head));
    }
    Ok(())
}

/// Checks a data header. A set valid or written bit means the record never
/// became durable and must not be trusted.
pub fn dhead_check(dhead: u32, id: Option<u32>, typ: Option<DataType>) -> Result<()> {
    if dhead == NULL {
        return Ok(());
    }
    if dhead_novalid(dhead) || dhead_nowritten(dhead) {
        error!("data header {dhead:#010x} was never committed");
        return Err(Error::Corrupt(CorruptError::Head));
    }
    if let Some(id) = id {
        if dhead_id(dhead) != id {
            error!("data header {dhead:#010x} does not belong to id {id}");
            return Err(Error::Corrupt(CorruptError::Head));
        }
    }
    if let Some(typ) = typ {
        if dhead_type(dhead) != typ as u32 {
            error!("data header {dhead:#010x} is not of type {typ:?}");
            return Err(Error::Corrupt(CorruptError::Head));
        }
    }
    if dhead == 0 {
        return Err(Error::Corrupt(CorruptError::Head));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_head_round_trip() {
        let head = mkshead(SectorState::Using, SectorType::Dir, 0x2a, 123_456);
        assert!(!shead_novalid(head));
        assert_eq!(shead_state(head), SectorState::Using as u32);
        assert_eq!(shead_type(head), SectorType::Dir as u32);
        assert_eq!(shead_extend(head), 0x2a);
        assert_eq!(shead_etimes(head), 123_456);
    }

    #[test]
    fn data_head_round_trip() {
        let head = mkdhead(0x1abc, DataType::BfileIndex, 0x7ff);
        assert!(!dhead_novalid(head));
        assert!(dhead_nowritten(head));
        assert_eq!(dhead_id(head), 0x1abc);
        assert_eq!(dhead_type(head), DataType::BfileIndex as u32);
        assert_eq!(dhead_dsize(head), 0x7ff);
    }

    #[test]
    fn masks_clear_the_right_fields() {
        let head = mkdhead(7, DataType::FileName, 20);
        let committed = head & DHEAD_WRITTEN_SET;
        assert!(!dhead_nowritten(committed));
        assert_eq!(dhead_id(committed), 7);
        assert_eq!(dhead_dsize(committed), 20);

        let deleted = committed & DHEAD_DELETE_SET;
        assert_eq!(dhead_type(deleted), DataType::Delete as u32);
        assert_eq!(dhead_dsize(deleted), 20);

        let shead = mkshead(SectorState::Allocating, SectorType::Super, 1, 9);
        let using = shead & SHEAD_USING_SET;
        assert_eq!(shead_state(using), SectorState::Using as u32);
        let old = using & SHEAD_OLD_SET;
        assert_eq!(shead_state(old), SectorState::Old as u32);
        assert_eq!(shead_etimes(old), 9);
    }

    #[test]
    fn checks_reject_uncommitted_headers() {
        assert!(dhead_check(NULL, None, None).is_ok());
        let head = mkdhead(2, DataType::SfileData, 10);
        assert!(dhead_check(head, None, None).is_err());
        assert!(dhead_check(head & DHEAD_WRITTEN_SET, Some(2), Some(DataType::SfileData)).is_ok());
        assert!(dhead_check(head & DHEAD_WRITTEN_SET, Some(3), None).is_err());
        assert!(dhead_check(0, None, None).is_err());

        let shead = mkshead(SectorState::Using, SectorType::BigFile, 0x3f, 0);
        assert!(shead_check(shead, Some(SectorState::Using), Some(SectorType::BigFile)).is_ok());
        assert!(shead_check(shead, Some(SectorState::Free), None).is_err());
        assert!(shead_check(shead | 0x8000_0000, None, None).is_err());
    }
}
