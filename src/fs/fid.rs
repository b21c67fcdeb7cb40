//! Per-fid state: the bound [`File`], its open handle and, for directories,
//! the merged listing captured when it was opened.
//!
//! A `Fid` is owned by whoever serves requests on it. Dropping it is the
//! destroy step: the `File` reference, the listing and the native handle go
//! with it.

use std::{fs, io, os::unix::fs::FileExt, sync::Arc};

use tracing::{debug, warn};

use super::{
    file::File,
    union::{open_options, Union},
};
use crate::ninep::{open_access, Qid, Stat, OEXEC, OREAD, ORCLOSE, OTRUNC};
use crate::{Error, Result};

/// Result of a read: raw bytes for files, whole entries for directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadData {
    Bytes(Vec<u8>),
    Entries(Vec<Stat>),
}

impl ReadData {
    /// Wire form of the payload; entries are packed as stat records.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            ReadData::Bytes(bytes) => bytes,
            ReadData::Entries(entries) => {
                let mut buf = Vec::with_capacity(entries.iter().map(Stat::wire_len).sum());
                for stat in &entries {
                    stat.encode_into(&mut buf);
                }
                buf
            }
        }
    }
}

/// Merged directory listing fixed at open time, replayed by offset.
#[derive(Debug)]
pub struct DirSnapshot {
    entries: Vec<Arc<File>>,
    next: usize,
    offset: u64,
}

impl DirSnapshot {
    pub fn new(entries: Vec<Arc<File>>) -> Self {
        Self {
            entries,
            next: 0,
            offset: 0,
        }
    }

    pub fn entries(&self) -> &[Arc<File>] {
        &self.entries
    }

    /// Whole entries fitting in `count` bytes. `offset` must be 0, which
    /// restarts the listing, or where the previous read ended.
    pub fn read(&mut self, offset: u64, count: u32) -> Result<Vec<Stat>> {
        if offset == 0 {
            self.next = 0;
            self.offset = 0;
        } else if offset != self.offset {
            return Err(Error::BadOffset(offset).into());
        }
        let mut out = Vec::new();
        let mut used = 0usize;
        while let Some(file) = self.entries.get(self.next) {
            let len = file.stat().wire_len();
            if used + len > count as usize {
                break;
            }
            out.push(file.stat().clone());
            used += len;
            self.next += 1;
        }
        self.offset += used as u64;
        Ok(out)
    }
}

#[derive(Debug)]
enum Opened {
    File { handle: fs::File, mode: u8 },
    Dir(DirSnapshot),
}

#[derive(Debug)]
pub struct Fid {
    file: Arc<File>,
    open: Option<Opened>,
    remove_on_close: bool,
}

impl Fid {
    pub fn new(file: Arc<File>) -> Self {
        Self {
            file,
            open: None,
            remove_on_close: false,
        }
    }

    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    pub fn qid(&self) -> Qid {
        self.file.qid()
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn open_mode(&self) -> Option<u8> {
        match &self.open {
            Some(Opened::File { mode, .. }) => Some(*mode),
            Some(Opened::Dir(_)) => Some(OREAD),
            None => None,
        }
    }

    /// The listing captured by the last directory open.
    pub fn snapshot(&self) -> Option<&DirSnapshot> {
        match &self.open {
            Some(Opened::Dir(snap)) => Some(snap),
            _ => None,
        }
    }

    /// A new fid on the same `File` with its own, unopened state.
    pub fn duplicate(&self) -> Fid {
        Fid::new(Arc::clone(&self.file))
    }

    /// Point at another `File`, releasing the current one.
    pub fn bind(&mut self, file: Arc<File>) {
        self.file = file;
    }

    pub fn open(&mut self, union: &Union, mode: u8) -> Result<()> {
        if self.is_open() {
            return Err(Error::AlreadyOpen.into());
        }
        let opened = if self.file.is_dir() {
            if !matches!(open_access(mode), OREAD | OEXEC) || mode & OTRUNC != 0 {
                return Err(Error::IsDirectory(self.file.name().to_string()).into());
            }
            Opened::Dir(DirSnapshot::new(union.merge_listing(&self.file)))
        } else {
            let handle = open_options(mode).open(self.file.real_path())?;
            Opened::File { handle, mode }
        };
        self.open = Some(opened);
        self.remove_on_close = mode & ORCLOSE != 0 && !self.file.is_root();
        Ok(())
    }

    /// Adopt a freshly created `File` and treat it as opened with `mode`.
    pub fn created(
        &mut self,
        union: &Union,
        file: Arc<File>,
        handle: Option<fs::File>,
        mode: u8,
    ) {
        self.open = Some(match handle {
            Some(handle) => Opened::File { handle, mode },
            None => Opened::Dir(DirSnapshot::new(union.merge_listing(&file))),
        });
        self.file = file;
        self.remove_on_close = mode & ORCLOSE != 0;
    }

    pub fn read(&mut self, offset: u64, count: u32) -> Result<ReadData> {
        match &mut self.open {
            None => Err(Error::NotOpen.into()),
            Some(Opened::Dir(snap)) => Ok(ReadData::Entries(snap.read(offset, count)?)),
            Some(Opened::File { handle, .. }) => {
                let mut buf = vec![0u8; count as usize];
                let n = handle.read_at(&mut buf, offset)?;
                buf.truncate(n);
                Ok(ReadData::Bytes(buf))
            }
        }
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<u32> {
        match &mut self.open {
            None => Err(Error::NotOpen.into()),
            Some(Opened::Dir(_)) => Err(Error::IsDirectory(self.file.name().to_string()).into()),
            Some(Opened::File { handle, .. }) => {
                handle.write_all_at(data, offset)?;
                Ok(data.len() as u32)
            }
        }
    }
}

impl Drop for Fid {
    fn drop(&mut self) {
        // Close before removing.
        self.open = None;
        if !self.remove_on_close {
            return;
        }
        match remove_real(&self.file) {
            Ok(()) => debug!(path = %self.file.real_path().display(), "removed on close"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.file.real_path().display(), %e, "remove on close failed"),
        }
    }
}

/// Remove the branch object behind `file`.
pub fn remove_real(file: &File) -> io::Result<()> {
    if file.is_dir() {
        fs::remove_dir(file.real_path())
    } else {
        fs::remove_file(file.real_path())
    }
}
