//! Moorage - FreeBSD jail lifecycle manager
//!
//! Creates, destroys, exports and provisions jails living on ZFS sources,
//! and manages their mount tables.

mod cli;
mod console;
mod error;
mod export;
mod fstab;
mod host;
mod jail;
mod lifecycle;
mod manifest;
mod paths;
mod resource;
mod supply;
mod sys;

use cli::{Cli, Commands, FstabAction};
use error::{Error, Result};
use host::{Backend, SystemHost};
use jail::{Jls, StateProbe};
use lifecycle::provision::Plan;
use lifecycle::{
    ConsoleReporter, CreateOperation, CreateRequest, DestroyOperation, DestroyRequest,
    ExportOperation, ExportRequest, Origin, ProvisionOperation, ProvisionRequest, TerminalConfirm,
};
use resource::{Resource, ResourceIdentifier, ResourceKind, TargetKind};
use std::fs;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("MOORAGE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    if let Commands::Completion { shell } = cli.command {
        Cli::generate_completion(shell);
        return Ok(());
    }

    if !nix::unistd::Uid::effective().is_root() {
        return Err(Error::RequiresRoot);
    }

    let config = manifest::load(&cli.config)?;
    let host = SystemHost::new(&config)?;
    let probe = StateProbe::new(Box::new(Jls::new(&config.tools.status)));
    let mut reporter = ConsoleReporter::stdio(cli.verbose);

    let code = match cli.command {
        Commands::Create {
            name,
            props,
            release,
            template,
            count,
            basejail: _,
            no_basejail,
            no_fetch,
        } => {
            let origin = match (release, template) {
                (_, Some(template)) => Origin::Template(ResourceIdentifier::parse(&template)?),
                (Some(release), None) => Origin::Release(release),
                (None, None) => Origin::Release(sys::HostRelease::detect()?.release_name()),
            };
            let request = CreateRequest {
                name: ResourceIdentifier::parse(&name)?,
                origin,
                count,
                properties: resource::parse_properties(&props)?,
                basejail: !no_basejail,
                fetch: !no_fetch,
            };
            lifecycle::drain(CreateOperation::new(&host, request), &mut reporter).exit_code()
        }

        Commands::Destroy {
            filters,
            force,
            release,
            template,
            recursive,
        } => {
            let kind = if release {
                TargetKind::Release
            } else if template {
                TargetKind::Template
            } else {
                TargetKind::Jail
            };
            let request = DestroyRequest {
                filters,
                kind,
                force,
                recursive,
            };
            let mut confirm = TerminalConfirm;
            let operation = DestroyOperation::new(&host, &probe, &mut confirm, request);
            lifecycle::drain(operation, &mut reporter).exit_code()
        }

        Commands::Export {
            jail,
            destination,
            standalone,
            format,
        } => {
            let request = ExportRequest {
                jail: ResourceIdentifier::parse(&jail)?,
                destination,
                standalone,
                format,
            };
            lifecycle::drain(ExportOperation::new(&host, request), &mut reporter).exit_code()
        }

        Commands::Start { filters, option } => {
            let request = ProvisionRequest {
                filters,
                overrides: resource::parse_properties(&option)?,
                plan: Plan::Configured,
            };
            lifecycle::drain(ProvisionOperation::new(&host, &probe, request), &mut reporter)
                .exit_code()
        }

        Commands::Pkg {
            remove,
            jail,
            packages,
        } => {
            let id = ResourceIdentifier::parse(&jail)?;
            let request = ProvisionRequest {
                filters: vec![id.to_string()],
                overrides: Default::default(),
                plan: Plan::Packages { packages, remove },
            };
            lifecycle::drain(ProvisionOperation::new(&host, &probe, request), &mut reporter)
                .exit_code()
        }

        Commands::Fstab { action } => {
            handle_fstab(&host, action)?;
            0
        }

        Commands::Console { start, user, jail } => {
            let jail = find_jail(&host, &jail)?;
            let opts = console::ConsoleOptions { user, start };
            let status = console::attach(&host, &probe, &config.tools.jexec, &jail, &opts)?;
            status.code().unwrap_or(1)
        }

        Commands::Unset { property, jail } => {
            let mut jail = find_jail(&host, &jail)?;
            if jail.properties.remove(&property).is_none() {
                return Err(Error::not_found("property", property));
            }
            host.save_properties(&jail)?;
            println!("{} unset on {}", property, jail.full_name());
            0
        }

        Commands::Completion { .. } => 0,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn find_jail(host: &dyn Backend, name: &str) -> Result<Resource> {
    let id = ResourceIdentifier::parse(name)?;
    resource::find_one(host.resources(ResourceKind::Jail)?, &id, ResourceKind::Jail)
}

fn handle_fstab(host: &dyn Backend, action: FstabAction) -> Result<()> {
    match action {
        FstabAction::Show { jail } => {
            let jail = find_jail(host, &jail)?;
            match fs::read_to_string(jail.fstab_path()) {
                Ok(content) => print!("{}", content),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        FstabAction::Add {
            jail,
            source,
            destination,
            fs_type,
            options,
            freq,
            passno,
            comment,
        } => {
            let jail = find_jail(host, &jail)?;
            let resolver = paths::PathResolver::new(jail.root_path());
            let request = fstab::MountRequest {
                source,
                destination,
                fs_type,
                options,
                freq,
                passno,
                comment,
            };
            let line = fstab::add_mount(&jail.fstab_path(), &resolver, request)?;
            println!(
                "Added mount {} on {} to {}",
                line.source.display(),
                resolver.to_relative(&line.destination)?.display(),
                jail.full_name()
            );
        }

        FstabAction::Rm { jail, source } => {
            let jail = find_jail(host, &jail)?;
            let (index, line) = fstab::remove_mount(&jail.fstab_path(), &source)?;
            println!(
                "Removed mount {} from {} (line {})",
                line.source.display(),
                jail.full_name(),
                index + 1
            );
        }
    }
    Ok(())
}
