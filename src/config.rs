//! Startup configuration: the validated, ordered branch list.

use std::{
    fs,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use tracing::{info, warn};

use crate::fs::{
    pivot::{pivot, PivotGuard, ScratchPool},
    union::Branch,
};
use crate::{Error, Result};

pub const DEFAULT_MOUNTPOINT: &str = "/mnt/union";
/// Token in the branch list marking the next path as the creation branch.
pub const CREATE_MARKER: &str = "-c";

#[derive(Debug, Default)]
pub struct Config {
    branches: Vec<Branch>,
    pivots: Vec<PivotGuard>,
}

#[derive(Debug, Clone, Default)]
pub struct BranchArgs<'a> {
    /// Paths in priority order, possibly interleaved with [`CREATE_MARKER`].
    pub paths: &'a [String],
    /// Make the first retained path the creation branch.
    pub create_first: bool,
    /// Where the union will be mounted, if anywhere.
    pub mountpoint: Option<&'a Path>,
    /// Pool for re-rooting a branch equal to `mountpoint`; `None` disables it.
    pub pivot_pool: Option<Arc<ScratchPool>>,
}

impl Config {
    /// Use `branches` as given. An unflagged list gets its first branch as
    /// the creation target when the server is built.
    pub fn new(branches: Vec<Branch>) -> Self {
        Self {
            branches,
            pivots: Vec::new(),
        }
    }

    pub fn from_args(args: BranchArgs<'_>) -> Result<Self> {
        let mountpoint = args.mountpoint.map(|m| clean_path(&m.to_string_lossy()));
        let mut pending = args.create_first;
        let mut assigned = false;
        let mut config = Config::default();

        for arg in args.paths {
            if arg == CREATE_MARKER {
                if pending || assigned {
                    return Err(Error::MultipleCreateBranches.into());
                }
                pending = true;
                continue;
            }

            let path = clean_path(arg);
            match fs::metadata(&path) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    warn!(path = %path.display(), "not a directory, skipping");
                    continue;
                }
                Err(_) => {
                    warn!(path = %path.display(), "does not exist, skipping");
                    continue;
                }
            }

            let mut root = path;
            if let (Some(mtpt), Some(pool)) = (&mountpoint, &args.pivot_pool) {
                if &root == mtpt {
                    let guard = pivot(pool, &root)?;
                    root = guard.path().to_path_buf();
                    config.pivots.push(guard);
                }
            }

            config.branches.push(Branch {
                root,
                create: pending,
            });
            if pending {
                assigned = true;
                pending = false;
            }
        }

        if pending {
            return Err(Error::Cli(format!("{CREATE_MARKER} must be followed by a branch path")).into());
        }
        if config.branches.is_empty() {
            return Err(Error::EmptyBranchList.into());
        }
        if !assigned {
            config.branches[0].create = true;
        }
        info!(branches = config.branches.len(), pivots = config.pivots.len(), "configuration ready");
        Ok(config)
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn into_parts(self) -> (Vec<Branch>, Vec<PivotGuard>) {
        (self.branches, self.pivots)
    }
}

/// Lexically clean a path: collapse repeated separators, drop `.` elements
/// and resolve `..` against preceding names. `..` at the root stays at the
/// root; an empty result is `.`.
pub fn clean_path(raw: &str) -> PathBuf {
    let path = Path::new(raw);
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}
