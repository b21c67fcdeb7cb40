//! Command-line surface: one command that serves the union.

use clap::{error::ErrorKind, CommandFactory, Parser};

use crate::logging::{LogFormat, LoggingConfig};
use crate::{Error, Result};

pub mod serve;

#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub serve: serve::ServeArgs,
    pub log_format: LogFormat,
}

impl CliArgs {
    /// `-D` also lowers the default log level so the message trace shows.
    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig {
            format: self.log_format,
            debug: self.serve.chatty,
        }
    }
}

pub fn dispatch(args: CliArgs) -> Result<()> {
    serve::execute(args.serve)
}

#[derive(Parser, Debug)]
#[command(
    name = "unionfs",
    version,
    about = "Serve the union of several directories over 9P"
)]
struct Cli {
    #[command(flatten)]
    serve: serve::ServeArgs,

    /// Log output format.
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Human)]
    log_format: LogFormat,
}

/// Parse CLI arguments into internal representation. Help and version
/// requests print and exit; other parse failures are returned.
pub fn parse_args<I, S>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = args.into_iter().map(Into::into).collect();
    let cli = match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => return Err(Error::Cli(e.to_string()).into()),
    };

    Ok(CliArgs {
        serve: cli.serve,
        log_format: cli.log_format,
    })
}

/// Build the underlying clap `Command` (useful for help/usage contract tests).
pub fn clap_command() -> clap::Command {
    Cli::command()
}
