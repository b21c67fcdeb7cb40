use thiserror::Error;

pub mod cli;
pub mod config;
pub mod fs;
pub mod logging;
pub mod ninep;

pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("file does not exist")]
    NotFound(String),
    #[error("not a directory")]
    NotDirectory(String),
    #[error("is a directory")]
    IsDirectory(String),
    #[error("bad character in file name: {0:?}")]
    InvalidName(String),
    #[error("empty branch list")]
    EmptyBranchList,
    #[error("more than one creation branch")]
    MultipleCreateBranches,
    #[error("fid already open")]
    AlreadyOpen,
    #[error("fid not open for I/O")]
    NotOpen,
    #[error("bad offset in directory read: {0}")]
    BadOffset(u64),
    #[error("unknown fid {0}")]
    UnknownFid(u32),
    #[error("fid {0} already in use")]
    FidInUse(u32),
    #[error("authentication not required")]
    NoAuth,
    #[error("{0} not supported")]
    Unsupported(&'static str),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("cannot re-root branch: {0}")]
    Pivot(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Entry point for the library, called by the CLI thin wrapper.
pub fn run<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let cli_args = cli::parse_args(args.into_iter().map(Into::into))?;
    logging::init_logging(cli_args.logging())?;
    cli::dispatch(cli_args)
}
