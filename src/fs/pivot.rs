//! Re-rooting a branch that coincides with the server's own mount point.
//!
//! Once the union is mounted over a directory that is also a branch, looking
//! through that path would reach the union itself. Such a branch is bound
//! privately onto a scratch directory first and served from there.

use std::{
    ffi::CString,
    fs, io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{Error, Result};

#[derive(Debug, Default)]
struct PoolInner {
    free: Vec<PathBuf>,
    next: usize,
}

/// Reusable scratch mount points under one directory. Slots are created on
/// demand, so acquiring never waits.
#[derive(Debug)]
pub struct ScratchPool {
    root: PathBuf,
    inner: Mutex<PoolInner>,
}

impl ScratchPool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Pool rooted in the temp directory, private to this process.
    pub fn for_process() -> Self {
        Self::new(std::env::temp_dir().join(format!("unionfs.{}", std::process::id())))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Hand out a slot with nothing mounted on it.
    pub fn acquire(&self) -> io::Result<PathBuf> {
        let slot = {
            let mut inner = self.inner.lock();
            match inner.free.pop() {
                Some(slot) => slot,
                None => {
                    let slot = self.root.join(format!("mtpt{}", inner.next));
                    inner.next += 1;
                    slot
                }
            }
        };
        fs::create_dir_all(&slot)?;
        // A reused slot may still carry an old mount.
        let _ = detach(&slot);
        Ok(slot)
    }

    pub fn release(&self, slot: PathBuf) {
        self.inner.lock().free.push(slot);
    }

    pub fn free_slots(&self) -> usize {
        self.inner.lock().free.len()
    }
}

/// A branch bound onto a scratch slot; unbinds and frees the slot on drop.
#[derive(Debug)]
pub struct PivotGuard {
    pool: Arc<ScratchPool>,
    slot: Option<PathBuf>,
}

impl PivotGuard {
    pub fn path(&self) -> &Path {
        self.slot.as_deref().unwrap_or(Path::new(""))
    }
}

impl Drop for PivotGuard {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            if let Err(e) = detach(&slot) {
                debug!(slot = %slot.display(), %e, "pivot unbind failed");
            }
            self.pool.release(slot);
        }
    }
}

/// Bind `source` onto a slot from `pool` and return the new root for it.
pub fn pivot(pool: &Arc<ScratchPool>, source: &Path) -> Result<PivotGuard> {
    let slot = pool
        .acquire()
        .map_err(|e| Error::Pivot(format!("{}: {e}", pool.root().display())))?;
    if let Err(e) = bind(source, &slot) {
        pool.release(slot);
        return Err(Error::Pivot(format!("bind {}: {e}", source.display())).into());
    }
    info!(source = %source.display(), slot = %slot.display(), "branch re-rooted");
    Ok(PivotGuard {
        pool: Arc::clone(pool),
        slot: Some(slot),
    })
}

fn cpath(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

#[cfg(target_os = "linux")]
fn bind(source: &Path, target: &Path) -> io::Result<()> {
    let src = cpath(source)?;
    let dst = cpath(target)?;
    let rc = unsafe {
        libc::mount(
            src.as_ptr(),
            dst.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND | libc::MS_REC,
            std::ptr::null(),
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // Keep the union's own mount from propagating into the bind.
    let rc = unsafe {
        libc::mount(
            std::ptr::null(),
            dst.as_ptr(),
            std::ptr::null(),
            libc::MS_PRIVATE | libc::MS_REC,
            std::ptr::null(),
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        let _ = detach(target);
        return Err(err);
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn detach(target: &Path) -> io::Result<()> {
    let dst = cpath(target)?;
    if unsafe { libc::umount2(dst.as_ptr(), libc::MNT_DETACH) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn bind(_source: &Path, _target: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "bind mounts are only supported on Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
fn detach(target: &Path) -> io::Result<()> {
    cpath(target).map(|_| ())
}
