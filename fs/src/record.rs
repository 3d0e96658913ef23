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

//! On-media record layouts.
//!
//! Every multi-byte field is little-endian. Records are read into a buffer
//! window and parsed in place; [`RecordView`] is the tagged view decoded
//! from the data header's type field.

use cinder_err::{CorruptError, Error, Result};
use log::error;
use zerocopy::{
    little_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
};

use crate::head::{self, DataType};

/// Prefix of every directory sector: `pre_sector` chains the sectors of one
/// directory, newest first.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct DirSectorHead {
    pub head: U32,
    pub pre_sector: U32,
    pub id: U32,
}

/// Prefix of every big-file sector. These sectors are organized by the
/// owning file's index record, so only ownership is recorded here.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct BfileSectorHead {
    pub head: U32,
    pub id: U32,
    pub father_id: U32,
}

/// First record of a superblock generation.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct SuperMessage {
    pub head: U32,
    pub version: U32,
    pub sector_size: U32,
    pub sector_count: U32,
    pub name_max: U32,
    pub file_max: U32,
    pub region_cnt: U32,
    pub fs_name: [u8; 8],
}

/// Location of an on-flash bitmap store. The erase counts of the sectors
/// holding it follow as raw little-endian words (map sectors carry no
/// sector header of their own).
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct MapAddr {
    pub head: U32,
    pub begin: U32,
    pub off: U32,
}

/// Location of the wear-leveling array.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct WlAddr {
    pub head: U32,
    pub begin: U32,
    pub off: U32,
    pub erase_times: U32,
}

/// The resume cursor, last record of a committed superblock generation.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct Commit {
    pub head: U32,
    pub next_id: U32,
    pub scan_times: U32,
    pub next_dir_sector: U32,
    pub next_bfile_sector: U32,
    pub reserve_region: U32,
}

/// A directory's name record in its parent; the name bytes follow. `tail`
/// is the newest sector of the directory's chain.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct DirName {
    pub head: U32,
    pub tail: U32,
}

/// Accumulated reclaimable bytes of a directory, persisted on close.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct DirOspace {
    pub head: U32,
    pub old_space: U32,
}

/// One extent of a big file: a physically contiguous run of `size` payload
/// bytes starting at `off` in `sector`, rolling into following sectors
/// (payload restarts after each sector's 12-byte prefix).
#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct IndexEntry {
    pub sector: U32,
    pub off: U32,
    pub size: U32,
}

impl IndexEntry {
    pub fn new(sector: u32, off: u32, size: u32) -> Self {
        Self {
            sector: U32::new(sector),
            off: U32::new(off),
            size: U32::new(size),
        }
    }
}

pub const DIR_SECTOR_HEAD_SIZE: u32 = core::mem::size_of::<DirSectorHead>() as u32;
pub const BFILE_SECTOR_HEAD_SIZE: u32 = core::mem::size_of::<BfileSectorHead>() as u32;
pub const HEAD_SIZE: u32 = 4;
pub const INDEX_ENTRY_SIZE: u32 = core::mem::size_of::<IndexEntry>() as u32;

/// A record parsed in place from a buffer window. `bytes` must hold the
/// complete record including its header.
#[derive(Debug)]
pub enum RecordView<'a> {
    SuperMessage(&'a SuperMessage),
    Commit(&'a Commit),
    SectorMap { addr: &'a MapAddr, erase_times: &'a [U32] },
    IdMap { addr: &'a MapAddr, erase_times: &'a [U32] },
    RegionMap { map: &'a [u8] },
    WlAddr(&'a WlAddr),
    DirName { new: bool, tail: u32, name: &'a [u8] },
    FileName { new: bool, name: &'a [u8] },
    SfileData { data: &'a [u8] },
    BfileIndex { entries: &'a [IndexEntry] },
    DirOspace { old_space: u32 },
    Delete,
}

fn corrupt(what: &str, head: u32) -> Error {
    error!("malformed {what} record, header {head:#010x}");
    Error::Corrupt(CorruptError::Data)
}

impl<'a> RecordView<'a> {
    /// Decodes the record `bytes` according to the type field of `head`.
    /// `head` must already have passed `dhead_check` and `bytes.len()` must
    /// equal the header's length field.
    pub fn parse(head: u32, bytes: &'a [u8]) -> Result<RecordView<'a>> {
        debug_assert_eq!(bytes.len() as u32, head::dhead_dsize(head));
        let typ = DataType::from_bits(head::dhead_type(head))
            .ok_or_else(|| corrupt("unknown", head))?;
        let payload = &bytes[HEAD_SIZE as usize..];
        Ok(match typ {
            DataType::SuperMessage => RecordView::SuperMessage(
                SuperMessage::ref_from_bytes(bytes).map_err(|_| corrupt("super message", head))?,
            ),
            DataType::Commit => RecordView::Commit(
                Commit::ref_from_bytes(bytes).map_err(|_| corrupt("commit", head))?,
            ),
            DataType::SectorMap | DataType::IdMap => {
                let (addr, rest) = MapAddr::ref_from_prefix(bytes)
                    .map_err(|_| corrupt("map address", head))?;
                let erase_times =
                    <[U32]>::ref_from_bytes(rest).map_err(|_| corrupt("map address", head))?;
                if typ == DataType::SectorMap {
                    RecordView::SectorMap { addr, erase_times }
                } else {
                    RecordView::IdMap { addr, erase_times }
                }
            }
            DataType::RegionMap => RecordView::RegionMap { map: payload },
            DataType::WlAddr => RecordView::WlAddr(
                WlAddr::ref_from_bytes(bytes).map_err(|_| corrupt("wl address", head))?,
            ),
            DataType::DirName | DataType::NDirName => {
                let (name_head, name) = DirName::ref_from_prefix(bytes)
                    .map_err(|_| corrupt("dir name", head))?;
                RecordView::DirName {
                    new: typ == DataType::NDirName,
                    tail: name_head.tail.get(),
                    name,
                }
            }
            DataType::FileName | DataType::NFileName => RecordView::FileName {
                new: typ == DataType::NFileName,
                name: payload,
            },
            DataType::SfileData => RecordView::SfileData { data: payload },
            DataType::BfileIndex => RecordView::BfileIndex {
                entries: <[IndexEntry]>::ref_from_bytes(payload)
                    .map_err(|_| corrupt("big file index", head))?,
            },
            DataType::DirOspace => {
                let ospace = DirOspace::ref_from_bytes(bytes)
                    .map_err(|_| corrupt("old space", head))?;
                RecordView::DirOspace {
                    old_space: ospace.old_space.get(),
                }
            }
            DataType::Delete => RecordView::Delete,
            DataType::Free => return Err(corrupt("free", head)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::head::mkdhead;

    #[test]
    fn struct_sizes_match_the_media_layout() {
        assert_eq!(core::mem::size_of::<DirSectorHead>(), 12);
        assert_eq!(core::mem::size_of::<BfileSectorHead>(), 12);
        assert_eq!(core::mem::size_of::<SuperMessage>(), 36);
        assert_eq!(core::mem::size_of::<MapAddr>(), 12);
        assert_eq!(core::mem::size_of::<WlAddr>(), 16);
        assert_eq!(core::mem::size_of::<Commit>(), 24);
        assert_eq!(core::mem::size_of::<DirName>(), 8);
        assert_eq!(core::mem::size_of::<DirOspace>(), 8);
        assert_eq!(core::mem::size_of::<IndexEntry>(), 12);
    }

    #[test]
    fn parses_a_dir_name_record() {
        let len = core::mem::size_of::<DirName>() + 3;
        let head = mkdhead(5, DataType::DirName, len as u32) & crate::head::DHEAD_WRITTEN_SET;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&head.to_le_bytes());
        bytes.extend_from_slice(&77u32.to_le_bytes());
        bytes.extend_from_slice(b"usr");
        match RecordView::parse(head, &bytes).unwrap() {
            RecordView::DirName { new, tail, name } => {
                assert!(!new);
                assert_eq!(tail, 77);
                assert_eq!(name, b"usr");
            }
            other => panic!("wrong view: {other:?}"),
        }
    }

    #[test]
    fn parses_a_big_file_index() {
        let len = HEAD_SIZE + 2 * INDEX_ENTRY_SIZE;
        let head = mkdhead(9, DataType::BfileIndex, len) & crate::head::DHEAD_WRITTEN_SET;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&head.to_le_bytes());
        for entry in [IndexEntry::new(100, 12, 5000), IndexEntry::new(200, 12, 77)] {
            bytes.extend_from_slice(entry.as_bytes());
        }
        match RecordView::parse(head, &bytes).unwrap() {
            RecordView::BfileIndex { entries } => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].sector.get(), 100);
                assert_eq!(entries[1].size.get(), 77);
            }
            other => panic!("wrong view: {other:?}"),
        }
    }

    #[test]
    fn truncated_records_are_corrupt() {
        let head = mkdhead(1, DataType::Commit, 8) & crate::head::DHEAD_WRITTEN_SET;
        let bytes = head.to_le_bytes().iter().chain(&[0u8; 4]).copied().collect::<Vec<_>>();
        assert!(RecordView::parse(head, &bytes).is_err());
    }
}
