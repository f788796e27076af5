//! Command-line interface for Moorage
//!
//! Uses clap with derive for type-safe CLI parsing

use crate::export::ExportFormat;
use crate::manifest::DEFAULT_CONFIG_PATH;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Moorage - FreeBSD jail lifecycle manager
#[derive(Parser)]
#[command(name = "moorage")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Create jails from a release or a template
    Create {
        /// Jail name, optionally prefixed with a source (source/name)
        name: String,

        /// Properties to set (key=value)
        props: Vec<String>,

        /// Release to create the jail from (defaults to the host release)
        #[arg(short, long, conflicts_with = "template")]
        release: Option<String>,

        /// Template to clone the jail from
        #[arg(short, long)]
        template: Option<String>,

        /// Number of jails to create
        #[arg(short, long, default_value = "1", value_parser = parse_count)]
        count: u32,

        /// Mount the release read-only instead of owning a copy (default)
        #[arg(long, overrides_with = "no_basejail")]
        basejail: bool,

        /// Give the jail its own copy of the release
        #[arg(long, overrides_with = "basejail")]
        no_basejail: bool,

        /// Fail instead of downloading a missing release
        #[arg(long)]
        no_fetch: bool,
    },

    /// Destroy jails, templates or releases
    Destroy {
        /// Filters selecting what to destroy (name or key=value)
        filters: Vec<String>,

        /// Skip the confirmation and stop running jails
        #[arg(short, long)]
        force: bool,

        /// Destroy releases instead of jails
        #[arg(short, long, conflicts_with = "template")]
        release: bool,

        /// Destroy templates instead of jails
        #[arg(short, long)]
        template: bool,

        /// Also destroy everything cloned from the targets
        #[arg(short = 'R', long)]
        recursive: bool,
    },

    /// Export a jail to an archive or directory
    Export {
        /// Jail to export
        jail: String,

        /// Destination file or directory
        destination: PathBuf,

        /// Export the root filesystem as a ZFS send stream
        #[arg(long)]
        standalone: bool,

        /// Output format
        #[arg(long, value_enum, default_value = "archive")]
        format: ExportFormat,
    },

    /// Run the provisioner of matching jails
    #[command(alias = "provision")]
    Start {
        /// Filters selecting jails (name or key=value)
        #[arg(required = true)]
        filters: Vec<String>,

        /// Temporarily override a jail property (key=value)
        #[arg(short, long = "option")]
        option: Vec<String>,
    },

    /// Manage a jail's mount table
    Fstab {
        #[command(subcommand)]
        action: FstabAction,
    },

    /// Install or remove packages inside a jail
    Pkg {
        /// Remove the packages instead of installing them
        #[arg(long)]
        remove: bool,

        /// Jail to act on
        jail: String,

        /// Packages
        #[arg(required = true)]
        packages: Vec<String>,
    },

    /// Attach to a login shell inside a jail
    Console {
        /// Start the jail if it is not running
        #[arg(long)]
        start: bool,

        /// User to log in as
        #[arg(short, long, default_value = "root")]
        user: String,

        /// Jail to attach to
        jail: String,
    },

    /// Remove a property from a jail's configuration
    Unset {
        /// Property name
        property: String,

        /// Jail to change
        jail: String,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Actions for the fstab command
#[derive(Subcommand)]
pub enum FstabAction {
    /// Print the jail's fstab
    Show {
        /// Jail name
        jail: String,
    },

    /// Add a mount to the jail's fstab
    Add {
        /// Jail name
        jail: String,

        /// Host path or filesystem to mount
        source: PathBuf,

        /// Path inside the jail (defaults to the source path)
        destination: Option<PathBuf>,

        /// Filesystem type
        #[arg(short = 't', long = "type", default_value = "nullfs")]
        fs_type: String,

        /// Mount options
        #[arg(short, long, default_value = "ro")]
        options: String,

        /// Dump frequency
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        freq: i64,

        /// fsck pass number
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        passno: i64,

        /// Comment appended to the line
        #[arg(long)]
        comment: Option<String>,
    },

    /// Remove a mount by its source
    Rm {
        /// Jail name
        jail: String,

        /// Source of the mount to remove
        source: PathBuf,
    },
}

/// Parse a count, accepting thousands separators (`1,000`)
fn parse_count(s: &str) -> Result<u32, String> {
    let digits: String = s.chars().filter(|c| *c != ',').collect();
    let count: u32 = digits
        .parse()
        .map_err(|_| format!("invalid count `{s}`"))?;
    if count == 0 {
        return Err("count must be at least 1".to_string());
    }
    Ok(count)
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "moorage", &mut std::io::stdout());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("3"), Ok(3));
        assert_eq!(parse_count("1,000"), Ok(1000));
        assert!(parse_count("0").is_err());
        assert!(parse_count("many").is_err());
    }

    #[test]
    fn test_create_arguments() {
        let cli = Cli::try_parse_from([
            "moorage", "create", "zroot/web", "group=web", "-r", "14.2-RELEASE", "-c", "2",
            "--no-basejail",
        ])
        .unwrap();
        let Commands::Create {
            name,
            props,
            release,
            count,
            no_basejail,
            ..
        } = cli.command
        else {
            panic!("expected create");
        };
        assert_eq!(name, "zroot/web");
        assert_eq!(props, vec!["group=web"]);
        assert_eq!(release.as_deref(), Some("14.2-RELEASE"));
        assert_eq!(count, 2);
        assert!(no_basejail);
    }

    #[test]
    fn test_release_conflicts_with_template() {
        assert!(Cli::try_parse_from(["moorage", "create", "web", "-r", "14.2-RELEASE", "-t", "base"]).is_err());
        assert!(Cli::try_parse_from(["moorage", "destroy", "-r", "-t", "x"]).is_err());
    }

    #[test]
    fn test_provision_alias() {
        let cli = Cli::try_parse_from(["moorage", "provision", "web", "-o", "provision.method=pkg"]).unwrap();
        let Commands::Start { filters, option } = cli.command else {
            panic!("expected start");
        };
        assert_eq!(filters, vec!["web"]);
        assert_eq!(option, vec!["provision.method=pkg"]);
    }

    #[test]
    fn test_export_format() {
        let cli = Cli::try_parse_from(["moorage", "export", "web", "/backup", "--format", "directory"]).unwrap();
        let Commands::Export { format, standalone, .. } = cli.command else {
            panic!("expected export");
        };
        assert_eq!(format, ExportFormat::Directory);
        assert!(!standalone);
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let cli = Cli::try_parse_from(["moorage", "fstab", "show", "web", "--config", "/tmp/m.toml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/m.toml"));
    }
}
