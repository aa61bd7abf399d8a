use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::error::{LibernetError, Result};
use crate::settings;

pub const ENV_USER: &str = "LIBERNETUSERNAME";
pub const ENV_PASS: &str = "LIBERNETPASSWORD";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

/// Arguments shared by every backup action.
#[derive(clap::Args, Clone, Debug)]
pub struct BackupArgs {
    /// Directory for local settings and logs.
    #[arg(long, default_value_os_t = settings::default_storage())]
    pub storage: PathBuf,

    /// Block server to connect to. Remembered between runs.
    #[arg(long)]
    pub server: Option<String>,

    /// The port to connect on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Warn if a source has not been backed up within this many days.
    #[arg(long)]
    pub days: Option<f64>,

    /// How many months back to look for previous backups.
    #[arg(long)]
    pub months: Option<u32>,

    /// The name of this machine.
    #[arg(long)]
    pub machine: Option<String>,

    /// Account username.
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// Account passphrase.
    #[arg(short = 'p', long)]
    pub passphrase: Option<String>,

    /// Reply 'Yes' to every question.
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Reply 'No' to every question.
    #[arg(short = 'n', long)]
    pub no: bool,

    /// Source path to add, remove, backup, or restore. Repeatable.
    #[arg(short = 's', long = "source")]
    pub source: Vec<PathBuf>,

    /// Destination path to restore into.
    #[arg(short = 'd', long)]
    pub destination: Option<PathBuf>,

    /// Read credentials from LIBERNETUSERNAME / LIBERNETPASSWORD.
    #[arg(long)]
    pub environment: bool,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Register source directories for backup on this machine.
    Add {
        #[command(flatten)]
        args: BackupArgs,
    },

    /// Unregister source directories.
    Remove {
        #[command(flatten)]
        args: BackupArgs,
    },

    /// Show the sources configured for this machine.
    List {
        #[command(flatten)]
        args: BackupArgs,
    },

    /// Back up every configured source.
    Backup {
        #[command(flatten)]
        args: BackupArgs,
    },

    /// Restore sources from their most recent backup.
    Restore {
        #[command(flatten)]
        args: BackupArgs,
    },

    /// Run the block server.
    Serve {
        /// Directory to store blocks in.
        #[arg(long, default_value_os_t = settings::default_storage())]
        storage: PathBuf,

        /// The port to listen on.
        #[arg(long)]
        port: Option<u16>,
    },
}

impl BackupArgs {
    /// Checks that cut across flags, the ones clap cannot express.
    pub fn validate(&self, action: &str) -> Result<()> {
        let requires_source = matches!(action, "add" | "remove");

        if requires_source && self.source.is_empty() {
            return Err(LibernetError::Invariant(
                "You must specify --source".to_string(),
            ));
        }

        if action == "list" && !self.source.is_empty() {
            return Err(LibernetError::Invariant("No --source for list".to_string()));
        }

        if action != "restore" && self.destination.is_some() {
            return Err(LibernetError::Invariant(
                "--destination is only for restore".to_string(),
            ));
        }

        Ok(())
    }
}

/// Read one trimmed line from the terminal.
pub fn prompt_line(prompt: &str) -> Result<String> {
    print!("{prompt}");
    std::io::stdout()
        .flush()
        .map_err(|e| LibernetError::io(e, "stdout"))?;
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .map_err(|e| LibernetError::io(e, "stdin"))?;
    Ok(line.trim().to_string())
}

/// Ask a yes/no question on the terminal.
pub fn confirm(prompt: &str) -> bool {
    prompt_line(prompt)
        .map(|answer| answer.to_lowercase().starts_with('y'))
        .unwrap_or(false)
}

/// Resolve the account credentials.
///
/// Priority: command line, then the environment (only when requested),
/// then an interactive prompt. The passphrase prompt never echoes.
pub fn resolve_credentials(
    user: Option<String>,
    passphrase: Option<String>,
    environment: bool,
) -> Result<(String, String)> {
    let mut user = user;
    let mut passphrase = passphrase;

    if environment {
        user = user.or_else(|| std::env::var(ENV_USER).ok());
        passphrase = passphrase.or_else(|| std::env::var(ENV_PASS).ok());
    }

    let user = match user {
        Some(user) => user,
        None => prompt_line("Libernet account username: ")?,
    };

    if user.is_empty() {
        return Err(LibernetError::Invariant(
            "You must specify a username".to_string(),
        ));
    }

    let passphrase = match passphrase {
        Some(passphrase) => passphrase,
        None => rpassword::prompt_password("Libernet account pass phrase: ")
            .map_err(|e| LibernetError::io(e, "terminal"))?,
    };

    if passphrase.is_empty() {
        return Err(LibernetError::Invariant(
            "You must specify a pass phrase".to_string(),
        ));
    }

    Ok((user, passphrase))
}

/// Parse the command line.
pub fn run() -> Args {
    Args::parse()
}
