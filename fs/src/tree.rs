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

//! Bounded RAM cache of directory entries for path resolution.
//!
//! Short names are stored inline; longer names keep only a DJB2 hash and
//! fall back to reading the full name from flash on a hash hit. The root
//! entry occupies slot 0 and is immortal.

use crate::{ENTRY_NAME_LEN, NULL};

pub(crate) fn djb2(name: &[u8]) -> u32 {
    let mut hash = 5381u32;
    for &byte in name {
        hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(byte as u32);
    }
    hash
}

#[derive(Debug, Clone)]
pub(crate) enum NameKey {
    Inline { len: u8, bytes: [u8; ENTRY_NAME_LEN] },
    Hash(u32),
}

impl NameKey {
    pub fn for_name(name: &[u8]) -> Self {
        if name.len() <= ENTRY_NAME_LEN {
            let mut bytes = [0xff; ENTRY_NAME_LEN];
            bytes[..name.len()].copy_from_slice(name);
            NameKey::Inline {
                len: name.len() as u8,
                bytes,
            }
        } else {
            NameKey::Hash(djb2(name))
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TreeEntry {
    pub id: u32,
    pub father_id: u32,
    /// Flash position of the entry's name record in its parent's log.
    pub name_sector: u32,
    pub name_off: u32,
    /// Newest sector of the directory's own chain.
    pub tail_sector: u32,
    pub name: NameKey,
}

pub(crate) struct Tree {
    entries: Vec<Option<TreeEntry>>,
}

impl Tree {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity.max(1)).map(|_| None).collect(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&TreeEntry> {
        self.entries.get(index).and_then(|slot| slot.as_ref())
    }

    pub fn find_by_id(&self, id: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|slot| matches!(slot, Some(entry) if entry.id == id))
    }

    /// Inserts an entry unless the id is already cached. A full tree drops
    /// the entry silently; it is a cache, resolution falls back to flash.
    pub fn add(&mut self, entry: TreeEntry) {
        if self.find_by_id(entry.id).is_some() {
            return;
        }
        if let Some(slot) = self.entries.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(entry);
        }
    }

    /// Updates the cached positions of `id`; `NULL` leaves a field alone.
    pub fn update(&mut self, id: u32, name_sector: u32, name_off: u32, tail_sector: u32) {
        let Some(index) = self.find_by_id(id) else {
            return;
        };
        let entry = self.entries[index].as_mut().unwrap();
        if name_sector != NULL {
            entry.name_sector = name_sector;
            entry.name_off = name_off;
        }
        if tail_sector != NULL {
            entry.tail_sector = tail_sector;
        }
    }

    pub fn remove(&mut self, id: u32) {
        if let Some(index) = self.find_by_id(id) {
            self.entries[index] = None;
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TreeEntry> {
        self.entries.iter_mut().filter_map(|slot| slot.as_mut())
    }

    /// Candidate entries of `father_id`; the caller settles hash collisions
    /// against flash.
    pub fn candidates(&self, father_id: u32) -> impl Iterator<Item = usize> + '_ {
        self.entries.iter().enumerate().filter_map(move |(index, slot)| {
            matches!(slot, Some(entry) if entry.father_id == father_id).then_some(index)
        })
    }
}

/// Splits a path into its parent components and the final name.
/// `"/usr/bin/cc"` yields `(["usr", "bin"], "cc")`.
pub(crate) fn split_path(path: &str) -> (Vec<&str>, &str) {
    let mut components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    let name = components.pop().unwrap_or("");
    (components, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn djb2_matches_the_reference_seed() {
        // h = ((h << 5) + h) + c, seeded with 5381.
        assert_eq!(djb2(b""), 5381);
        assert_eq!(djb2(b"a"), 5381 * 33 + b'a' as u32);
        assert_eq!(djb2(b"ab"), (5381 * 33 + b'a' as u32) * 33 + b'b' as u32);
    }

    #[test]
    fn short_names_stay_inline() {
        assert!(matches!(NameKey::for_name(b"twelve_chars"), NameKey::Inline { len: 12, .. }));
        assert!(matches!(NameKey::for_name(b"thirteen_chars"), NameKey::Hash(_)));
    }

    #[test]
    fn tree_is_a_bounded_cache() {
        let mut tree = Tree::new(2);
        for id in 1..=3 {
            tree.add(TreeEntry {
                id,
                father_id: 0,
                name_sector: NULL,
                name_off: NULL,
                tail_sector: 10 + id,
                name: NameKey::for_name(b"x"),
            });
        }
        assert!(tree.find_by_id(1).is_some());
        assert!(tree.find_by_id(2).is_some());
        // The third entry was dropped, not evicted.
        assert!(tree.find_by_id(3).is_none());

        tree.remove(1);
        assert!(tree.find_by_id(1).is_none());
        tree.add(TreeEntry {
            id: 3,
            father_id: 0,
            name_sector: NULL,
            name_off: NULL,
            tail_sector: 13,
            name: NameKey::for_name(b"y"),
        });
        assert!(tree.find_by_id(3).is_some());
    }

    #[test]
    fn update_leaves_null_fields_alone() {
        let mut tree = Tree::new(4);
        tree.add(TreeEntry {
            id: 7,
            father_id: 1,
            name_sector: 5,
            name_off: 40,
            tail_sector: 9,
            name: NameKey::for_name(b"d"),
        });
        tree.update(7, NULL, NULL, 33);
        let entry = tree.get(tree.find_by_id(7).unwrap()).unwrap();
        assert_eq!((entry.name_sector, entry.name_off, entry.tail_sector), (5, 40, 33));
    }

    #[test]
    fn paths_split_into_parents_and_name() {
        assert_eq!(split_path("/usr/bin/cc"), (vec!["usr", "bin"], "cc"));
        assert_eq!(split_path("/f"), (vec![], "f"));
        assert_eq!(split_path("/"), (vec![], ""));
        assert_eq!(split_path("a//b/"), (vec!["a"], "b"));
    }
}
