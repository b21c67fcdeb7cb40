//! Synthesis of exported QID paths from underlying file identity.
//!
//! An underlying file is identified by `(dev_type, dev, ino)`. Nothing makes
//! that triple fit in the 64 bits of a QID path, and two branches may come
//! from devices that hand out inode numbers independently, so the exported
//! path has to be synthesized.
//!
//! Bit 63 splits the output space in half:
//!
//! * `0`: direct encoding. Only for the fast-pathed device type
//!   ([`DEVTYPE_MNT`]) when `dev` fits in 28 bits and `ino` fits in 35 bits
//!   without losing any set bit. `dev` lands in bits 35..63 and `ino` in bits
//!   0..35. No table entry is needed.
//! * `1`: table mapped. The low 48 bits of `ino` are kept and a 15-bit salt
//!   fills bits 48..63. The first candidate uses salt 0; if another live entry
//!   already owns that path the table salt is advanced (wrapping, never 0) and
//!   the path recombined until it is unique. Entries are reference counted and
//!   dropped when the last holder releases them.
//!
//! Exhausting every salt for one set of low bits is not handled and panics.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::hash::FnvBuildHasher;
use crate::logging::QidTableSnapshot;

/// Device type of ordinary mounted file servers; the only directly encoded type.
pub const DEVTYPE_MNT: u16 = b'M' as u16;

pub const MAP_BIT: u32 = 63;
pub const DEV_BITS: u32 = 28;
pub const PATH_BITS: u32 = 35;
pub const SALT_SHIFT: u32 = 48;
pub const SALT_MAX: u16 = 0x7fff;

const MAP_FLAG: u64 = 1 << MAP_BIT;

const fn mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

/// Identity of a file as reported by the filesystem backing a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub dev_type: u16,
    pub dev: u64,
    pub ino: u64,
}

impl FileKey {
    pub const fn new(dev_type: u16, dev: u64, ino: u64) -> Self {
        Self { dev_type, dev, ino }
    }

    /// The direct encoding of this key, if it qualifies for one.
    pub fn direct(&self) -> Option<u64> {
        if self.dev_type != DEVTYPE_MNT
            || self.dev & !mask(DEV_BITS) != 0
            || self.ino & !mask(PATH_BITS) != 0
        {
            return None;
        }
        Some(self.dev << (MAP_BIT - DEV_BITS) | self.ino)
    }
}

#[derive(Debug)]
struct MapEntry {
    path: u64,
    refs: AtomicU64,
}

#[derive(Debug, Default)]
struct QidTable {
    entries: HashMap<FileKey, MapEntry, FnvBuildHasher>,
    owned: HashSet<u64, FnvBuildHasher>,
    salt: u16,
}

impl QidTable {
    fn lookup(&self, key: &FileKey) -> Option<u64> {
        self.entries.get(key).map(|e| {
            e.refs.fetch_add(1, Ordering::Relaxed);
            e.path
        })
    }

    /// Pick an unused table path for `key`. Returns the path and how many
    /// times the salt had to be advanced.
    fn assign(&mut self, key: &FileKey) -> (u64, u64) {
        let low = key.ino & mask(SALT_SHIFT);
        let mut candidate = MAP_FLAG | low;
        let mut rerolls = 0u64;
        while self.owned.contains(&candidate) {
            rerolls += 1;
            if rerolls > u64::from(SALT_MAX) {
                panic!("qid path space exhausted for low bits {low:#014x}");
            }
            self.salt = if self.salt >= SALT_MAX { 1 } else { self.salt + 1 };
            candidate = MAP_FLAG | u64::from(self.salt) << SALT_SHIFT | low;
        }
        (candidate, rerolls)
    }
}

/// Process-wide table of synthesized QID paths.
#[derive(Debug, Default)]
pub struct QidMap {
    table: RwLock<QidTable>,
    direct: AtomicU64,
    mapped: AtomicU64,
    rerolls: AtomicU64,
    releases: AtomicU64,
}

impl QidMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exported path for `key`. Table-mapped keys gain one reference that must
    /// be returned through [`QidMap::release`]; [`QidMap::lease`] does that
    /// automatically.
    pub fn encode(&self, key: FileKey) -> u64 {
        if let Some(path) = key.direct() {
            self.direct.fetch_add(1, Ordering::Relaxed);
            return path;
        }
        self.mapped.fetch_add(1, Ordering::Relaxed);

        if let Some(path) = self.table.read().lookup(&key) {
            return path;
        }

        let mut table = self.table.write();
        // Another request may have inserted the key between the two locks.
        if let Some(path) = table.lookup(&key) {
            return path;
        }
        let (path, rerolls) = table.assign(&key);
        if rerolls > 0 {
            self.rerolls.fetch_add(rerolls, Ordering::Relaxed);
            debug!(?key, path = format_args!("{path:#018x}"), rerolls, "qid salted after collision");
        }
        table.owned.insert(path);
        table.entries.insert(
            key,
            MapEntry {
                path,
                refs: AtomicU64::new(1),
            },
        );
        path
    }

    /// Drop one reference to a table-mapped key. No-op for direct keys.
    pub fn release(&self, key: FileKey) {
        if key.direct().is_some() {
            return;
        }
        let mut table = self.table.write();
        let Some(entry) = table.entries.get(&key) else {
            return;
        };
        if entry.refs.fetch_sub(1, Ordering::Relaxed) > 1 {
            return;
        }
        let path = entry.path;
        table.entries.remove(&key);
        table.owned.remove(&path);
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Encode `key` and tie the table reference to the returned guard.
    pub fn lease(self: &Arc<Self>, key: FileKey) -> QidLease {
        let path = self.encode(key);
        QidLease {
            map: Arc::clone(self),
            key,
            path,
        }
    }

    /// Current path of a mapped key without taking a reference.
    pub fn peek(&self, key: &FileKey) -> Option<u64> {
        if let Some(path) = key.direct() {
            return Some(path);
        }
        self.table.read().entries.get(key).map(|e| e.path)
    }

    /// Live references held on a mapped key.
    pub fn refs(&self, key: &FileKey) -> u64 {
        self.table
            .read()
            .entries
            .get(key)
            .map(|e| e.refs.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.table.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> QidTableSnapshot {
        QidTableSnapshot {
            entries: self.len(),
            direct_encodes: self.direct.load(Ordering::Relaxed),
            mapped_encodes: self.mapped.load(Ordering::Relaxed),
            salt_rerolls: self.rerolls.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
        }
    }
}

/// One reference on a [`QidMap`] entry, released on drop.
#[derive(Debug)]
pub struct QidLease {
    map: Arc<QidMap>,
    key: FileKey,
    path: u64,
}

impl QidLease {
    pub fn path(&self) -> u64 {
        self.path
    }

    pub fn key(&self) -> FileKey {
        self.key
    }
}

impl Drop for QidLease {
    fn drop(&mut self) {
        self.map.release(self.key);
    }
}
