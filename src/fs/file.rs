//! Resolved namespace entries.
//!
//! A [`File`] is immutable once built and shared through `Arc`: the merged
//! listing of an open directory and every fid pointing at the entry hold the
//! same allocation. Refreshing metadata means building a new `File`.

use std::{
    ffi::CStr,
    fs::Metadata,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::{SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;

use super::qid::{FileKey, QidLease, QidMap};
use crate::ninep::{Qid, Stat, DMDIR, DMPERM, QTDIR, QTFILE};

/// Identity of the synthetic root. Never directly encodable.
pub const ROOT_KEY: FileKey = FileKey::new(0xffff, u64::MAX, 0);

#[derive(Debug)]
pub struct File {
    stat: Stat,
    lease: QidLease,
    branch: Option<usize>,
    real_path: PathBuf,
    path: PathBuf,
}

impl File {
    /// Wrap native metadata for `real_path`, found on branch `branch` under
    /// the logical path `path`. `dev_type` is normally
    /// [`DEVTYPE_MNT`](super::qid::DEVTYPE_MNT).
    pub fn from_metadata(
        qids: &Arc<QidMap>,
        dev_type: u16,
        branch: usize,
        real_path: PathBuf,
        path: PathBuf,
        meta: &Metadata,
    ) -> Self {
        let key = FileKey::new(dev_type, meta.dev(), meta.ino());
        let lease = qids.lease(key);
        let is_dir = meta.is_dir();
        let uid = user_name(meta.uid());
        let stat = Stat {
            dev_type: key.dev_type,
            dev: key.dev as u32,
            qid: Qid {
                qtype: if is_dir { QTDIR } else { QTFILE },
                version: meta.mtime() as u32,
                path: lease.path(),
            },
            mode: (meta.mode() & DMPERM) | if is_dir { DMDIR } else { 0 },
            atime: meta.atime() as u32,
            mtime: meta.mtime() as u32,
            length: if is_dir { 0 } else { meta.len() },
            name: entry_name(&path),
            muid: uid.clone(),
            uid,
            gid: group_name(meta.gid()),
        };
        Self {
            stat,
            lease,
            branch: Some(branch),
            real_path,
            path,
        }
    }

    /// The attach point. It has no branch and no real path.
    pub fn root(qids: &Arc<QidMap>, owner: &str) -> Self {
        let lease = qids.lease(ROOT_KEY);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        let stat = Stat {
            dev_type: ROOT_KEY.dev_type,
            dev: ROOT_KEY.dev as u32,
            qid: Qid {
                qtype: QTDIR,
                version: 0,
                path: lease.path(),
            },
            mode: DMDIR | 0o777,
            atime: now,
            mtime: now,
            length: 0,
            name: "/".into(),
            uid: owner.into(),
            gid: owner.into(),
            muid: owner.into(),
        };
        Self {
            stat,
            lease,
            branch: None,
            real_path: PathBuf::new(),
            path: PathBuf::new(),
        }
    }

    pub fn stat(&self) -> &Stat {
        &self.stat
    }

    pub fn qid(&self) -> Qid {
        self.stat.qid
    }

    pub fn key(&self) -> FileKey {
        self.lease.key()
    }

    pub fn name(&self) -> &str {
        &self.stat.name
    }

    pub fn is_dir(&self) -> bool {
        self.stat.is_dir()
    }

    pub fn is_root(&self) -> bool {
        self.branch.is_none()
    }

    /// Index of the branch this entry was found on; `None` for the root.
    pub fn branch(&self) -> Option<usize> {
        self.branch
    }

    /// Path on the owning branch's filesystem.
    pub fn real_path(&self) -> &Path {
        &self.real_path
    }

    /// Path inside the union namespace, relative to its root.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn entry_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".into())
}

static ACCOUNT_NAMES: OnceLock<DashMap<(bool, u32), String>> = OnceLock::new();

/// Login name for `uid`, or the number when the passwd database has no entry.
pub fn user_name(uid: u32) -> String {
    account_name(false, uid)
}

/// Group name for `gid`, or the number when the group database has no entry.
pub fn group_name(gid: u32) -> String {
    account_name(true, gid)
}

fn account_name(group: bool, id: u32) -> String {
    let cache = ACCOUNT_NAMES.get_or_init(DashMap::new);
    if let Some(name) = cache.get(&(group, id)) {
        return name.clone();
    }
    let name = lookup_account(group, id).unwrap_or_else(|| id.to_string());
    cache.insert((group, id), name.clone());
    name
}

fn lookup_account(group: bool, id: u32) -> Option<String> {
    let mut buf = vec![0 as libc::c_char; 4096];
    let name_ptr = if group {
        let mut grp: libc::group = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::group = std::ptr::null_mut();
        let rc = unsafe {
            libc::getgrgid_r(id, &mut grp, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc != 0 || result.is_null() {
            return None;
        }
        grp.gr_name
    } else {
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwuid_r(id, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc != 0 || result.is_null() {
            return None;
        }
        pwd.pw_name
    };
    if name_ptr.is_null() {
        return None;
    }
    // The name points into `buf`, which is still alive here.
    let name = unsafe { CStr::from_ptr(name_ptr) };
    Some(name.to_string_lossy().into_owned())
}

/// Name of the user running the server, used as owner of the root.
pub fn current_user() -> String {
    user_name(unsafe { libc::geteuid() })
}
