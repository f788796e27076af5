//! Interactive console for jails
//!
//! Attaches the terminal to a login shell inside a running jail through
//! jexec(8), optionally starting the jail first.

use crate::error::{Error, Result};
use crate::host::Backend;
use crate::jail::{JailState, StateProbe};
use crate::resource::Resource;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

/// Options for a console session
#[derive(Debug, Clone)]
pub struct ConsoleOptions {
    /// User to log in as inside the jail
    pub user: String,
    /// Start the jail when it is not running
    pub start: bool,
}

impl Default for ConsoleOptions {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            start: false,
        }
    }
}

/// jexec arguments for a login shell
pub fn login_args(jail: &str, user: &str) -> Vec<String> {
    vec![
        jail.to_string(),
        "/usr/bin/login".to_string(),
        "-f".to_string(),
        user.to_string(),
    ]
}

/// Open an interactive console in `jail`
pub fn attach(
    backend: &dyn Backend,
    probe: &StateProbe,
    jexec: &Path,
    jail: &Resource,
    opts: &ConsoleOptions,
) -> Result<ExitStatus> {
    let mut state = JailState::new(jail.jail_name());
    state.ensure_loaded(probe);
    if !state.is_running() {
        if !opts.start {
            return Err(Error::InvalidInput(format!(
                "{} is not running, use --start to start it first",
                jail.full_name()
            )));
        }
        backend.start_jail(jail)?;
    }

    tracing::debug!("attaching console to {} as {}", jail.full_name(), opts.user);

    // Inherit stdio for interactive use
    Command::new(jexec)
        .args(login_args(&jail.jail_name(), &opts.user))
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map_err(|e| Error::CommandFailed {
            command: jexec.display().to_string(),
            message: e.to_string(),
        })
}
