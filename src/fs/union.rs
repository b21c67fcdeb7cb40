//! Ordered lookup and merge across branches.

use std::{
    fs::{self, DirBuilder, OpenOptions},
    io,
    os::unix::fs::{DirBuilderExt, OpenOptionsExt},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, warn};

use super::{
    file::File,
    nameset::NameSet,
    qid::{QidMap, DEVTYPE_MNT},
};
use crate::ninep::{
    open_access, open_wants_write, DMDIR, DMPERM, OEXEC, OREAD, ORDWR, OTRUNC, OWRITE,
};
use crate::{Error, Result};

/// One directory tree contributing to the namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub root: PathBuf,
    pub create: bool,
}

impl Branch {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            create: false,
        }
    }

    pub fn creating(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            create: true,
        }
    }

    /// Where the logical path `path` lives on this branch.
    pub fn real_path(&self, path: &Path) -> PathBuf {
        if path.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }
}

#[derive(Debug)]
pub struct Union {
    branches: Vec<Branch>,
    create: usize,
    qids: Arc<QidMap>,
    root: Arc<File>,
    dev_type: u16,
}

impl Union {
    /// Fixes the branch order for the life of the server. When no branch is
    /// flagged for creation the first one is.
    pub fn new(mut branches: Vec<Branch>, qids: Arc<QidMap>, owner: &str) -> Result<Self> {
        if branches.is_empty() {
            return Err(Error::EmptyBranchList.into());
        }
        let flagged: Vec<usize> = branches
            .iter()
            .enumerate()
            .filter(|(_, b)| b.create)
            .map(|(i, _)| i)
            .collect();
        let create = match flagged.as_slice() {
            [] => {
                branches[0].create = true;
                0
            }
            [one] => *one,
            _ => return Err(Error::MultipleCreateBranches.into()),
        };
        let root = Arc::new(File::root(&qids, owner));
        Ok(Self {
            branches,
            create,
            qids,
            root,
            dev_type: DEVTYPE_MNT,
        })
    }

    /// Report branch objects under `dev_type` instead of the mount driver's.
    /// Only `DEVTYPE_MNT` keys are eligible for the direct QID encoding.
    pub fn with_device_type(mut self, dev_type: u16) -> Self {
        self.dev_type = dev_type;
        self
    }

    pub fn device_type(&self) -> u16 {
        self.dev_type
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn create_branch(&self) -> &Branch {
        &self.branches[self.create]
    }

    pub fn qids(&self) -> &Arc<QidMap> {
        &self.qids
    }

    pub fn root(&self) -> Arc<File> {
        Arc::clone(&self.root)
    }

    /// Resolve `name` relative to `base`. The first branch holding the
    /// resulting path wins.
    pub fn resolve_walk(&self, base: &Arc<File>, name: &str) -> Result<Arc<File>> {
        if name.is_empty() || name == "." {
            return Ok(Arc::clone(base));
        }
        check_name(name)?;
        if !base.is_dir() {
            return Err(Error::NotDirectory(base.name().to_string()).into());
        }

        let path = if name == ".." {
            match base.path().parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => return Ok(self.root()),
            }
        } else {
            base.path().join(name)
        };

        self.lookup(&path)
            .ok_or_else(|| Error::NotFound(name.to_string()).into())
    }

    /// First branch entry for the logical `path`, if any.
    pub fn lookup(&self, path: &Path) -> Option<Arc<File>> {
        if path.as_os_str().is_empty() {
            return Some(self.root());
        }
        self.branches.iter().enumerate().find_map(|(i, branch)| {
            let real = branch.real_path(path);
            let meta = fs::metadata(&real).ok()?;
            Some(Arc::new(self.wrap(i, real, path.to_path_buf(), &meta)))
        })
    }

    /// Create `name` inside the logical directory `parent` on the creation
    /// branch, making the parent's directories there first. Directories
    /// created before a failure are left in place.
    pub fn resolve_create(
        &self,
        parent: &File,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> Result<(Arc<File>, Option<fs::File>)> {
        check_name(name)?;
        if name == "." || name == ".." {
            return Err(Error::InvalidName(name.to_string()).into());
        }
        if !parent.is_dir() {
            return Err(Error::NotDirectory(parent.name().to_string()).into());
        }
        if perm & DMDIR != 0 && open_wants_write(mode) {
            return Err(Error::IsDirectory(name.to_string()).into());
        }

        let branch = self.create_branch();
        let dir = branch.real_path(parent.path());
        mkdirp(&branch.root, parent.path())?;

        let real = dir.join(name);
        let handle = if perm & DMDIR != 0 {
            DirBuilder::new().mode(perm & DMPERM).create(&real)?;
            None
        } else if open_wants_write(mode) {
            Some(
                open_options(mode)
                    .create(true)
                    .truncate(true)
                    .mode(perm & DMPERM)
                    .open(&real)?,
            )
        } else {
            // O_CREAT needs write access; create first, then open as asked.
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(perm & DMPERM)
                .open(&real)?;
            Some(open_options(mode).open(&real)?)
        };
        let meta = match &handle {
            Some(f) => f.metadata()?,
            None => fs::metadata(&real)?,
        };
        debug!(branch = %branch.root.display(), path = %real.display(), "created");
        let file = self.wrap(self.create, real, parent.path().join(name), &meta);
        Ok((Arc::new(file), handle))
    }

    /// Merged listing of the logical directory `dir`: branch-priority order,
    /// native order within a branch, first branch wins per name.
    pub fn merge_listing(&self, dir: &File) -> Vec<Arc<File>> {
        let mut per_branch = Vec::with_capacity(self.branches.len());
        for branch in &self.branches {
            per_branch.push(list_branch_dir(&branch.real_path(dir.path())));
        }

        let estimate = per_branch.iter().map(Vec::len).sum();
        let mut seen = NameSet::with_estimate(estimate);
        let mut merged = Vec::new();
        for (i, names) in per_branch.into_iter().enumerate() {
            let branch = &self.branches[i];
            for name in names {
                let path = dir.path().join(&name);
                let real = branch.real_path(&path);
                // Only entries that stat are marked, so a later branch may
                // still supply a name this one cannot.
                match fs::metadata(&real) {
                    Ok(meta) => {
                        if !seen.seen(&name) {
                            merged.push(Arc::new(self.wrap(i, real, path, &meta)));
                        }
                    }
                    Err(err) => debug!(path = %real.display(), %err, "skipping unreadable entry"),
                }
            }
        }
        merged
    }

    /// Re-stat an existing entry on its own branch.
    pub fn refresh(&self, file: &File, path: PathBuf) -> Result<Arc<File>> {
        let Some(i) = file.branch() else {
            return Ok(self.root());
        };
        let real = self.branches[i].real_path(&path);
        let meta = fs::metadata(&real)?;
        Ok(Arc::new(self.wrap(i, real, path, &meta)))
    }

    fn wrap(&self, branch: usize, real: PathBuf, path: PathBuf, meta: &fs::Metadata) -> File {
        File::from_metadata(&self.qids, self.dev_type, branch, real, path, meta)
    }
}

/// Entry names of one branch directory. A missing directory contributes
/// nothing; a read error keeps what was read before it.
fn list_branch_dir(dir: &Path) -> Vec<String> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut names = Vec::new();
    for entry in entries {
        match entry {
            Ok(entry) => names.push(entry.file_name().to_string_lossy().into_owned()),
            Err(err) => {
                warn!(dir = %dir.display(), %err, read = names.len(), "directory read failed");
                break;
            }
        }
    }
    names
}

/// Make every directory of `path` under `root`. Existing directories are fine.
pub fn mkdirp(root: &Path, path: &Path) -> io::Result<()> {
    let full = root.join(path);
    if full.is_dir() {
        return Ok(());
    }
    let mut cur = root.to_path_buf();
    for component in path.components() {
        if let Component::Normal(part) = component {
            cur.push(part);
            match DirBuilder::new().mode(0o777).create(&cur) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && cur.is_dir() => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

/// std open options for a 9P open mode; OTRUNC implies write access.
pub fn open_options(mode: u8) -> OpenOptions {
    let mut opts = OpenOptions::new();
    match open_access(mode) {
        OREAD | OEXEC => opts.read(true),
        OWRITE => opts.write(true),
        ORDWR => opts.read(true).write(true),
        _ => unreachable!("open access is two bits"),
    };
    if mode & OTRUNC != 0 {
        opts.write(true).truncate(true);
    }
    opts
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidName(name.to_string()).into());
    }
    Ok(())
}
