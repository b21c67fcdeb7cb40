use std::{
    fs,
    io,
    os::unix::{fs::FileTypeExt, net::UnixListener},
    path::{Path, PathBuf},
    process::Command,
    sync::{mpsc, Arc},
    thread,
};

use clap::Args;
use tracing::{info, instrument, warn};

use crate::config::{BranchArgs, Config, DEFAULT_MOUNTPOINT};
use crate::fs::{file::current_user, pivot::ScratchPool, UnionFs};
use crate::logging::log_qid_table_metrics;
use crate::ninep::{server::DEFAULT_MAX_WORKERS, Server};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, Args)]
pub struct ServeArgs {
    /// Trace every 9P message.
    #[arg(short = 'D')]
    pub chatty: bool,

    /// Serve a single 9P connection on stdin/stdout.
    #[arg(short = 'i', conflicts_with_all = ["srv", "mountpoint"])]
    pub stdio: bool,

    /// Listen on this Unix-domain socket.
    #[arg(short = 's', value_name = "SOCKET")]
    pub srv: Option<PathBuf>,

    /// Mount the union here through the kernel 9P client. Defaults to
    /// /mnt/union unless -i or -s is given.
    #[arg(short = 'm', value_name = "MTPT")]
    pub mountpoint: Option<PathBuf>,

    /// Make the first branch the creation branch.
    #[arg(short = 'c')]
    pub create_first: bool,

    /// Never re-root a branch that equals the mount point.
    #[arg(long = "no-pivot")]
    pub no_pivot: bool,

    /// Requests served concurrently on one connection.
    #[arg(long = "max-workers", value_name = "N", default_value_t = DEFAULT_MAX_WORKERS)]
    pub max_workers: usize,

    /// Branch directories, highest priority first. `-c` before a path makes
    /// it the creation branch.
    #[arg(
        value_name = "PATH",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub paths: Vec<String>,
}

impl ServeArgs {
    /// Where the union will be mounted, if anywhere.
    pub fn effective_mountpoint(&self) -> Option<PathBuf> {
        if self.stdio {
            return None;
        }
        match (&self.mountpoint, &self.srv) {
            (Some(mtpt), _) => Some(mtpt.clone()),
            (None, None) => Some(PathBuf::from(DEFAULT_MOUNTPOINT)),
            (None, Some(_)) => None,
        }
    }

    pub fn effective_socket(&self) -> PathBuf {
        self.srv.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("unionfs.{}.sock", std::process::id()))
        })
    }
}

/// Build the branch configuration for `args` without serving anything.
pub fn build_config(args: &ServeArgs) -> Result<Config> {
    let mountpoint = args.effective_mountpoint();
    let pool = match (&mountpoint, args.no_pivot) {
        (Some(_), false) => Some(Arc::new(ScratchPool::for_process())),
        _ => None,
    };
    Config::from_args(BranchArgs {
        paths: &args.paths,
        create_first: args.create_first,
        mountpoint: mountpoint.as_deref(),
        pivot_pool: pool,
    })
}

#[instrument(skip(args), fields(stdio = args.stdio))]
pub fn execute(args: ServeArgs) -> Result<()> {
    let config = build_config(&args)?;
    let union_fs = Arc::new(UnionFs::new(config)?);
    let server = Server::new(Arc::clone(&union_fs))
        .chatty(args.chatty)
        .max_workers(args.max_workers);

    if args.stdio {
        info!("serving on stdin/stdout");
        let result = server.serve(io::stdin().lock(), io::stdout());
        log_qid_table_metrics(union_fs.qids().snapshot());
        return result;
    }

    let socket = args.effective_socket();
    remove_stale_socket(&socket)?;
    let listener = UnixListener::bind(&socket)?;
    info!(socket = %socket.display(), "listening");

    let (tx, rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| Error::Cli(format!("failed to install signal handler: {e}")))?;

    thread::spawn({
        let server = server.clone();
        move || {
            if let Err(err) = server.serve_unix(listener) {
                warn!(%err, "listener stopped");
            }
        }
    });

    let mounted = match args.effective_mountpoint() {
        Some(mtpt) => {
            mount_9p(&socket, &mtpt)?;
            info!(mountpoint = %mtpt.display(), "union mounted");
            Some(mtpt)
        }
        None => None,
    };

    let _ = rx.recv();
    info!("shutting down");
    if let Some(mtpt) = &mounted {
        if let Err(err) = unmount(mtpt) {
            warn!(mountpoint = %mtpt.display(), %err, "unmount failed");
        }
    }
    let _ = fs::remove_file(&socket);
    log_qid_table_metrics(union_fs.qids().snapshot());
    Ok(())
}

/// Remove a socket left behind by an earlier run; anything else at that
/// path is an error.
fn remove_stale_socket(socket: &Path) -> Result<()> {
    match fs::symlink_metadata(socket) {
        Ok(meta) if meta.file_type().is_socket() => {
            fs::remove_file(socket)?;
            Ok(())
        }
        Ok(_) => Err(Error::Cli(format!("{} exists and is not a socket", socket.display())).into()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn mount_9p(socket: &Path, mountpoint: &Path) -> Result<()> {
    let options = format!(
        "trans=unix,version=9p2000,uname={},access=user",
        current_user()
    );
    let output = Command::new("mount")
        .args(["-t", "9p", "-o", &options])
        .arg(socket)
        .arg(mountpoint)
        .output()
        .map_err(|e| Error::Cli(format!("failed to run mount: {e}")))?;
    if !output.status.success() {
        return Err(Error::Cli(format!(
            "mount {} failed: {}",
            mountpoint.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        ))
        .into());
    }
    Ok(())
}

fn unmount(mountpoint: &Path) -> Result<()> {
    let output = Command::new("umount")
        .arg(mountpoint)
        .output()
        .map_err(|e| Error::Cli(format!("failed to run umount: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        if stderr.contains("not mounted") {
            return Ok(());
        }
        return Err(Error::Cli(format!(
            "umount {} failed: {}",
            mountpoint.display(),
            stderr.trim()
        ))
        .into());
    }
    Ok(())
}
