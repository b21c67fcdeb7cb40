//! Per-request entry points of the union file server.
//!
//! Each handler works on a [`Fid`] the caller owns for the duration of the
//! request; the fid table itself belongs to the protocol layer.

use std::{
    fs::{self, FileTimes, OpenOptions},
    os::unix::fs::PermissionsExt,
    sync::Arc,
    time::{Duration, UNIX_EPOCH},
};

use tracing::{debug, info};

use super::{
    fid::{remove_real, Fid, ReadData},
    file::{current_user, File},
    pivot::PivotGuard,
    qid::QidMap,
    union::Union,
};
use crate::config::Config;
use crate::ninep::{Qid, Stat, DMDIR, DMPERM, MAX_WALK_ELEMENTS};
use crate::{Error, Result};

pub const DEFAULT_IOUNIT: u32 = 8192;

/// Outcome of a walk. `fid` is only present when every name resolved.
#[derive(Debug)]
pub struct Walked {
    pub qids: Vec<Qid>,
    pub fid: Option<Fid>,
}

#[derive(Debug)]
pub struct UnionFs {
    union: Union,
    iounit: u32,
    _pivots: Vec<PivotGuard>,
}

impl UnionFs {
    pub fn new(config: Config) -> Result<Self> {
        let (branches, pivots) = config.into_parts();
        let union = Union::new(branches, Arc::new(QidMap::new()), &current_user())?;
        for (i, branch) in union.branches().iter().enumerate() {
            info!(index = i, root = %branch.root.display(), create = branch.create, "branch");
        }
        Ok(Self {
            union,
            iounit: DEFAULT_IOUNIT,
            _pivots: pivots,
        })
    }

    pub fn with_iounit(mut self, iounit: u32) -> Self {
        self.iounit = iounit;
        self
    }

    /// See [`Union::with_device_type`]. Set before any fid is handed out.
    pub fn with_device_type(mut self, dev_type: u16) -> Self {
        self.union = self.union.with_device_type(dev_type);
        self
    }

    pub fn union(&self) -> &Union {
        &self.union
    }

    pub fn qids(&self) -> &Arc<QidMap> {
        self.union.qids()
    }

    pub fn root(&self) -> Arc<File> {
        self.union.root()
    }

    pub fn iounit(&self) -> u32 {
        self.iounit
    }

    /// A fresh fid on the root.
    pub fn attach(&self, uname: &str) -> Fid {
        debug!(uname, "attach");
        Fid::new(self.union.root())
    }

    /// Walk `names` from `fid` without touching it. The first name failing is
    /// an error; a later failure returns the qids resolved so far.
    pub fn walk<S: AsRef<str>>(&self, fid: &Fid, names: &[S]) -> Result<Walked> {
        if fid.is_open() {
            return Err(Error::AlreadyOpen.into());
        }
        if names.len() > MAX_WALK_ELEMENTS {
            return Err(Error::Protocol(format!("too many walk elements: {}", names.len())).into());
        }
        let mut cur = Arc::clone(fid.file());
        let mut qids = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            match self.union.resolve_walk(&cur, name.as_ref()) {
                Ok(next) => {
                    qids.push(next.qid());
                    cur = next;
                }
                Err(err) if i == 0 => return Err(err),
                Err(err) => {
                    debug!(index = i, %err, "partial walk");
                    return Ok(Walked { qids, fid: None });
                }
            }
        }
        Ok(Walked {
            qids,
            fid: Some(Fid::new(cur)),
        })
    }

    /// Open `fid`; a failure leaves it bound and unopened.
    pub fn open(&self, fid: &mut Fid, mode: u8) -> Result<u32> {
        fid.open(&self.union, mode)?;
        Ok(self.iounit)
    }

    /// Create `name` under the directory `fid` points at, always on the
    /// creation branch. On success `fid` is rebound to the new, opened file.
    pub fn create(&self, fid: &mut Fid, name: &str, perm: u32, mode: u8) -> Result<(Qid, u32)> {
        if fid.is_open() {
            return Err(Error::AlreadyOpen.into());
        }
        let (file, handle) = self.union.resolve_create(fid.file(), name, perm, mode)?;
        let qid = file.qid();
        fid.created(&self.union, file, handle, mode);
        Ok((qid, self.iounit))
    }

    /// Remove the object behind `fid` from the branch it lives on. The caller
    /// discards the fid whatever the outcome.
    pub fn remove(&self, fid: &Fid) -> Result<()> {
        let file = fid.file();
        if file.is_root() {
            return Err(Error::Unsupported("removing the root").into());
        }
        remove_real(file)?;
        debug!(path = %file.real_path().display(), "removed");
        Ok(())
    }

    pub fn read(&self, fid: &mut Fid, offset: u64, count: u32) -> Result<ReadData> {
        fid.read(offset, count.min(self.iounit))
    }

    pub fn write(&self, fid: &mut Fid, offset: u64, data: &[u8]) -> Result<u32> {
        fid.write(offset, data)
    }

    pub fn stat(&self, fid: &Fid) -> Stat {
        fid.file().stat().clone()
    }

    /// Apply the fields of `stat` that are not "don't touch" to the branch
    /// object, then rebind `fid` to a re-read `File`. Every field is checked
    /// and every handle opened before anything on disk changes.
    pub fn wstat(&self, fid: &mut Fid, stat: &Stat) -> Result<()> {
        let file = Arc::clone(fid.file());
        if file.is_root() {
            return Err(Error::Unsupported("changing the root").into());
        }
        let cur = file.stat();
        if !stat.uid.is_empty() && stat.uid != cur.uid {
            return Err(Error::Unsupported("changing owner").into());
        }
        if !stat.gid.is_empty() && stat.gid != cur.gid {
            return Err(Error::Unsupported("changing group").into());
        }
        let truncate = stat.length != u64::MAX && stat.length != cur.length;
        if truncate && file.is_dir() {
            return Err(Error::IsDirectory(file.name().to_string()).into());
        }
        if stat.mode != u32::MAX && (stat.mode & DMDIR) != (cur.mode & DMDIR) {
            return Err(Error::Unsupported("changing the directory bit").into());
        }
        let rename = !stat.name.is_empty() && stat.name != cur.name;
        if rename && (stat.name.contains('/') || stat.name == "." || stat.name == "..") {
            return Err(Error::InvalidName(stat.name.clone()).into());
        }

        let real = file.real_path();
        let target = real.with_file_name(&stat.name);
        if rename {
            match fs::symlink_metadata(&target) {
                Ok(meta) if meta.is_dir() && !file.is_dir() => {
                    return Err(Error::IsDirectory(stat.name.clone()).into())
                }
                Ok(meta) if !meta.is_dir() && file.is_dir() => {
                    return Err(Error::NotDirectory(stat.name.clone()).into())
                }
                _ => {}
            }
        }
        let resize = if truncate {
            Some(OpenOptions::new().write(true).open(real)?)
        } else {
            None
        };
        let mut times = FileTimes::new();
        let touch = stat.mtime != u32::MAX || stat.atime != u32::MAX;
        if stat.mtime != u32::MAX {
            times = times.set_modified(UNIX_EPOCH + Duration::from_secs(stat.mtime.into()));
        }
        if stat.atime != u32::MAX {
            times = times.set_accessed(UNIX_EPOCH + Duration::from_secs(stat.atime.into()));
        }
        let stamp = match (touch, &resize) {
            (false, _) => None,
            (true, Some(handle)) => Some(handle.try_clone()?),
            (true, None) => Some(fs::File::open(real)?),
        };

        if let Some(handle) = &resize {
            handle.set_len(stat.length)?;
        }
        if stat.mode != u32::MAX {
            fs::set_permissions(real, fs::Permissions::from_mode(stat.mode & DMPERM))?;
        }
        if let Some(handle) = &stamp {
            handle.set_times(times)?;
        }
        let mut path = file.path().to_path_buf();
        if rename {
            path.set_file_name(&stat.name);
            fs::rename(real, &target)?;
        }

        fid.bind(self.union.refresh(&file, path)?);
        Ok(())
    }

    /// Destroy `fid`. Never fails.
    pub fn clunk(&self, fid: Fid) {
        drop(fid);
    }
}
