//! Provision jails by running commands inside them
//!
//! A jail's provisioner comes from its `provision.method` and
//! `provision.source` properties, or from an explicit package list. Stopped
//! jails are started first. The first failing jail ends the batch.

use crate::error::{Error, Result};
use crate::host::Backend;
use crate::jail::{JailState, StateProbe};
use crate::lifecycle::{EventKind, LifecycleEvent, OperationOutcome, Step, Verdict};
use crate::paths::PathResolver;
use crate::resource::filter;
use crate::resource::{Resource, ResourceKind};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

/// What to run in each selected jail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Whatever the jail's provision properties say
    Configured,
    /// Install or remove the given packages
    Packages { packages: Vec<String>, remove: bool },
}

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub filters: Vec<String>,
    /// Applied to the in-memory properties only, never saved
    pub overrides: BTreeMap<String, String>,
    pub plan: Plan,
}

/// Provisioning routine of one jail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provisioner {
    /// Shell script at a path inside the jail
    Script(String),
    Packages { packages: Vec<String>, remove: bool },
}

impl Provisioner {
    /// Read `provision.method` and `provision.source` from a jail
    pub fn configured(jail: &Resource) -> Result<Self> {
        let method = jail.properties.get("provision.method").map(String::as_str);
        let source = jail
            .properties
            .get("provision.source")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty());

        match (method, source) {
            (None, _) | (Some(""), _) | (Some("-"), _) => Err(Error::InvalidInput(format!(
                "{} has no provision.method configured",
                jail.full_name()
            ))),
            (Some(_), None) => Err(Error::InvalidInput(format!(
                "{} has no provision.source configured",
                jail.full_name()
            ))),
            (Some("script"), Some(source)) => Ok(Provisioner::Script(source.to_string())),
            (Some("pkg"), Some(source)) => Ok(Provisioner::Packages {
                packages: split_packages(source),
                remove: false,
            }),
            (Some(other), Some(_)) => Err(Error::InvalidInput(format!(
                "unknown provision.method '{}' on {}",
                other,
                jail.full_name()
            ))),
        }
    }

    /// Commands to run inside `jail`, in order
    pub fn commands(&self, jail: &Resource) -> Result<Vec<Vec<String>>> {
        match self {
            Provisioner::Script(source) => {
                let resolver = PathResolver::new(jail.root_path());
                let host_path = resolver.to_absolute(Path::new(source))?;
                if !host_path.is_file() {
                    return Err(Error::not_found("provisioning script", source.clone()));
                }
                let inside = resolver.to_relative(&host_path)?;
                Ok(vec![vec![
                    "/bin/sh".to_string(),
                    inside.to_string_lossy().into_owned(),
                ]])
            }
            Provisioner::Packages { packages, remove } => {
                if packages.is_empty() {
                    return Err(Error::InvalidInput("no packages given".into()));
                }
                let verb = if *remove { "remove" } else { "install" };
                let mut command: Vec<String> = ["/usr/bin/env", "ASSUME_ALWAYS_YES=yes", "pkg", verb, "-y"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect();
                command.extend(packages.iter().cloned());
                Ok(vec![command])
            }
        }
    }
}

fn split_packages(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

enum Action {
    Start,
    Run(Vec<String>),
}

enum Phase {
    Select,
    Jails,
    Done,
    Finished,
}

/// Iterator provisioning every matched jail
pub struct ProvisionOperation<'a> {
    backend: &'a dyn Backend,
    probe: &'a StateProbe,
    request: ProvisionRequest,
    phase: Phase,
    jails: VecDeque<Resource>,
    current: Option<(Resource, VecDeque<Action>)>,
    outcome: OperationOutcome,
}

impl<'a> ProvisionOperation<'a> {
    pub fn new(backend: &'a dyn Backend, probe: &'a StateProbe, request: ProvisionRequest) -> Self {
        Self {
            backend,
            probe,
            request,
            phase: Phase::Select,
            jails: VecDeque::new(),
            current: None,
            outcome: OperationOutcome::default(),
        }
    }

    fn finish(&mut self, verdict: Verdict) -> Option<Step> {
        self.phase = Phase::Finished;
        Some(Step::Finished(verdict))
    }

    fn no_match(&self) -> Error {
        Error::NoMatch {
            kind: "jails".into(),
            filters: self.request.filters.join(" "),
        }
    }

    fn select(&mut self) -> Option<Step> {
        if self.request.filters.is_empty() {
            return self.finish(Verdict::Rejected(Error::InvalidInput(
                "No filter specified - cannot select jails to provision".into(),
            )));
        }

        let matched = filter::compile(&self.request.filters).and_then(|filters| {
            let jails = self.backend.resources(ResourceKind::Jail)?;
            Ok(filter::select(jails, &filters))
        });
        match matched {
            Ok(jails) if jails.is_empty() => {
                let e = self.no_match();
                self.finish(Verdict::Rejected(e))
            }
            Ok(jails) => {
                tracing::debug!("{} jails selected for provisioning", jails.len());
                self.jails = jails.into();
                self.phase = Phase::Jails;
                self.next_action()
            }
            Err(e) => self.finish(Verdict::Rejected(e)),
        }
    }

    /// Overrides, provisioner and start decision for the next jail
    fn plan(&self, jail: &mut Resource) -> Result<VecDeque<Action>> {
        jail.properties.extend(self.request.overrides.clone());

        let provisioner = match &self.request.plan {
            Plan::Configured => Provisioner::configured(jail)?,
            Plan::Packages { packages, remove } => Provisioner::Packages {
                packages: packages.clone(),
                remove: *remove,
            },
        };

        let mut actions: VecDeque<Action> = provisioner
            .commands(jail)?
            .into_iter()
            .map(Action::Run)
            .collect();
        let mut state = JailState::new(jail.jail_name());
        state.ensure_loaded(self.probe);
        if !state.is_running() {
            actions.push_front(Action::Start);
        }
        Ok(actions)
    }

    fn fail(&mut self, kind: EventKind, target: String, e: Error) -> Option<Step> {
        let event = LifecycleEvent::failed(kind, &target, &e);
        self.outcome.fail(target, e);
        self.current = None;
        self.phase = Phase::Done;
        Some(Step::Event(event))
    }

    fn next_action(&mut self) -> Option<Step> {
        if self.current.is_none() {
            let Some(mut jail) = self.jails.pop_front() else {
                return self.conclude();
            };
            match self.plan(&mut jail) {
                Ok(actions) => self.current = Some((jail, actions)),
                Err(e) => return self.fail(EventKind::JailCommand, jail.full_name(), e),
            }
        }

        let Some((jail, mut actions)) = self.current.take() else {
            return self.conclude();
        };
        let target = jail.full_name();

        let step = match actions.pop_front() {
            Some(Action::Start) => match self.backend.start_jail(&jail) {
                Ok(()) => LifecycleEvent::done(EventKind::StartJail, &target),
                Err(e) => return self.fail(EventKind::StartJail, target, e),
            },
            Some(Action::Run(command)) => match self.run(&jail, &command) {
                Ok(stdout) => LifecycleEvent::done(EventKind::JailCommand, &target).with_stdout(stdout),
                Err(e) => return self.fail(EventKind::JailCommand, target, e),
            },
            None => LifecycleEvent::done(EventKind::JailCommand, &target),
        };

        if actions.is_empty() {
            tracing::info!("provisioned {}", target);
            self.outcome.succeeded.push(target);
        } else {
            self.current = Some((jail, actions));
        }
        Some(Step::Event(step))
    }

    fn run(&self, jail: &Resource, command: &[String]) -> Result<String> {
        let output = self.backend.exec(jail, command)?;
        if !output.success() {
            let stderr = output.stderr.trim();
            return Err(Error::CommandFailed {
                command: command.join(" "),
                message: if stderr.is_empty() {
                    format!("exit code {}", output.code)
                } else {
                    stderr.to_string()
                },
            });
        }
        Ok(output.stdout)
    }

    fn conclude(&mut self) -> Option<Step> {
        if self.outcome.is_success() && self.outcome.succeeded.is_empty() {
            let e = self.no_match();
            return self.finish(Verdict::Rejected(e));
        }
        let outcome = std::mem::take(&mut self.outcome);
        self.finish(Verdict::Completed(outcome))
    }
}

impl Iterator for ProvisionOperation<'_> {
    type Item = Step;

    fn next(&mut self) -> Option<Step> {
        match std::mem::replace(&mut self.phase, Phase::Jails) {
            Phase::Select => self.select(),
            Phase::Jails => self.next_action(),
            Phase::Done => {
                let outcome = std::mem::take(&mut self.outcome);
                self.finish(Verdict::Completed(outcome))
            }
            Phase::Finished => {
                self.phase = Phase::Finished;
                None
            }
        }
    }
}
