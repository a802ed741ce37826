//! The service's command line.
//!
//! Only the first token selects a mode. Everything after `--daemon` belongs to the daemon.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser as _;

#[derive(Debug, PartialEq)]
pub enum Command {
    Install,
    Uninstall,
    Daemon(DaemonArgs),
    Update {
        target: OsString,
        extra: Option<OsString>,
    },
    /// No recognised mode. The service manager starts us like this.
    Service,
}

#[derive(Debug, Default, PartialEq, clap::Parser)]
#[command(name = "tunnelkeeper-service --daemon", no_binary_name = true)]
pub struct DaemonArgs {
    /// A directory to write logs to, instead of `data/logs` next to the binary.
    #[arg(long, env = "TUNNELKEEPER_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Overrides `log_filter` from the settings file, e.g. `debug,mio=info`.
    #[arg(long, env = "TUNNELKEEPER_LOG_FILTER")]
    pub log_filter: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("`--update` needs the path of the new version")]
    MissingUpdateTarget,
    #[error("`--update` takes at most two arguments")]
    TooManyUpdateArgs,
    #[error("Invalid `--daemon` arguments")]
    Daemon(#[from] clap::Error),
}

pub fn parse(args: Vec<OsString>) -> Result<Command, UsageError> {
    let mut args = args.into_iter();
    let Some(mode) = args.next() else {
        return Ok(Command::Service);
    };

    let command = match mode.to_str() {
        Some("--install") => Command::Install,
        Some("--uninstall") => Command::Uninstall,
        Some("--daemon") => Command::Daemon(DaemonArgs::try_parse_from(args)?),
        Some("--update") => {
            let target = args.next().ok_or(UsageError::MissingUpdateTarget)?;
            let extra = args.next();
            if args.next().is_some() {
                return Err(UsageError::TooManyUpdateArgs);
            }

            Command::Update { target, extra }
        }
        Some(_) | None => Command::Service,
    };

    Ok(command)
}
