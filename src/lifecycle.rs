//! Multi-step lifecycle operations
//!
//! Each operation is a pull-based iterator. Every call to `next` performs at
//! most one external action and yields the event describing it; the last
//! item is the operation's `Verdict`. Nothing runs until the caller pulls,
//! and events arrive in the order the steps happened.
//!
//! Batch policy differs per operation and is visible in the outcome:
//! create and provision stop at the first failed target, destroy records
//! the failure and moves on.

pub mod create;
pub mod destroy;
pub mod export;
pub mod provision;

use crate::error::Error;
use std::fmt;
use std::io::Write;

pub use create::{CreateOperation, CreateRequest, Origin};
pub use destroy::{DestroyOperation, DestroyRequest};
pub use export::{ExportOperation, ExportRequest};
pub use provision::{ProvisionOperation, ProvisionRequest};

/// Phase a lifecycle event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ResolveOrigin,
    FetchRelease,
    CreateJail,
    SelectTargets,
    StopJail,
    DestroyResource,
    StartJail,
    JailCommand,
    ExportConfig,
    ExportFstab,
    ExportRoot,
    WriteExport,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::ResolveOrigin => "resolve-origin",
            EventKind::FetchRelease => "fetch-release",
            EventKind::CreateJail => "create-jail",
            EventKind::SelectTargets => "select-targets",
            EventKind::StopJail => "stop-jail",
            EventKind::DestroyResource => "destroy",
            EventKind::StartJail => "start-jail",
            EventKind::JailCommand => "jail-command",
            EventKind::ExportConfig => "export-config",
            EventKind::ExportFstab => "export-fstab",
            EventKind::ExportRoot => "export-root",
            EventKind::WriteExport => "write-export",
        };
        write!(f, "{}", name)
    }
}

/// One completed (or failed) step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    /// Resource the step acted on
    pub target: String,
    /// False when the step failed
    pub done: bool,
    /// Captured output of a command step
    pub stdout: Option<String>,
    /// Human readable summary of the step
    pub message: Option<String>,
    pub error: Option<String>,
}

impl LifecycleEvent {
    pub fn done(kind: EventKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            done: true,
            stdout: None,
            message: None,
            error: None,
        }
    }

    pub fn failed(kind: EventKind, target: impl Into<String>, error: &Error) -> Self {
        Self {
            done: false,
            error: Some(error.to_string()),
            ..Self::done(kind, target)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = Some(stdout.into());
        self
    }
}

/// A target that did not make it, with the reason
#[derive(Debug)]
pub struct Failure {
    pub target: String,
    pub cause: Error,
}

/// Per-target results of a batch
#[derive(Debug, Default)]
pub struct OperationOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<Failure>,
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    fn fail(&mut self, target: impl Into<String>, cause: Error) {
        self.failed.push(Failure {
            target: target.into(),
            cause,
        });
    }
}

/// How an operation ended
#[derive(Debug)]
pub enum Verdict {
    /// Ran over its targets; the outcome says which ones failed
    Completed(OperationOutcome),
    /// The user declined the confirmation, nothing was touched
    Aborted,
    /// Refused before touching any target
    Rejected(Error),
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Completed(outcome) if outcome.is_success())
    }

    /// Process exit status for this verdict
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }
}

/// Item produced by an operation
#[derive(Debug)]
pub enum Step {
    Event(LifecycleEvent),
    Finished(Verdict),
}

/// Receives what operations want the user to see
pub trait Reporter {
    fn event(&mut self, event: &LifecycleEvent);

    fn failure(&mut self, message: &str);
}

/// Prints progress to stdout and failures to stderr
pub struct ConsoleReporter<W: Write, E: Write> {
    out: W,
    err: E,
    verbose: bool,
}

impl ConsoleReporter<std::io::Stdout, std::io::Stderr> {
    pub fn stdio(verbose: bool) -> Self {
        Self::new(std::io::stdout(), std::io::stderr(), verbose)
    }
}

impl<W: Write, E: Write> ConsoleReporter<W, E> {
    pub fn new(out: W, err: E, verbose: bool) -> Self {
        Self { out, err, verbose }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> (W, E) {
        (self.out, self.err)
    }
}

impl<W: Write, E: Write> Reporter for ConsoleReporter<W, E> {
    fn event(&mut self, event: &LifecycleEvent) {
        if !event.done {
            let reason = event.error.as_deref().unwrap_or("unknown error");
            let _ = writeln!(self.err, "{} {} failed: {}", event.kind, event.target, reason);
            return;
        }

        if let Some(stdout) = &event.stdout
            && !stdout.is_empty()
        {
            let _ = write!(self.out, "{}", stdout);
            if !stdout.ends_with('\n') {
                let _ = writeln!(self.out);
            }
        }

        match &event.message {
            Some(message) => {
                let _ = writeln!(self.out, "{}", message);
            }
            None if self.verbose => {
                let _ = writeln!(self.out, "{} {}: OK", event.kind, event.target);
            }
            None => {}
        }
    }

    fn failure(&mut self, message: &str) {
        let _ = writeln!(self.err, "Error: {}", message);
    }
}

/// Asks the user before destructive work
pub trait Confirm {
    fn confirm(&mut self, prompt: &str) -> Result<bool, Error>;
}

/// Interactive yes/no prompt on the terminal
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&mut self, prompt: &str) -> Result<bool, Error> {
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .map_err(|e| Error::InvalidInput(format!("confirmation failed: {}", e)))
    }
}

/// Pull every step, forwarding events to the reporter
pub fn drain<I>(operation: I, reporter: &mut dyn Reporter) -> Verdict
where
    I: IntoIterator<Item = Step>,
{
    for step in operation {
        match step {
            Step::Event(event) => reporter.event(&event),
            Step::Finished(verdict) => {
                report_verdict(&verdict, reporter);
                return verdict;
            }
        }
    }
    Verdict::Completed(OperationOutcome::default())
}

fn report_verdict(verdict: &Verdict, reporter: &mut dyn Reporter) {
    match verdict {
        Verdict::Completed(outcome) => {
            for failure in &outcome.failed {
                reporter.failure(&format!("{}: {}", failure.target, failure.cause));
            }
        }
        Verdict::Aborted => reporter.failure("Aborted"),
        Verdict::Rejected(e) => reporter.failure(&e.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Reporter keeping everything it was shown
    #[derive(Default)]
    pub struct RecordingReporter {
        pub events: Vec<LifecycleEvent>,
        pub failures: Vec<String>,
    }

    impl Reporter for RecordingReporter {
        fn event(&mut self, event: &LifecycleEvent) {
            self.events.push(event.clone());
        }

        fn failure(&mut self, message: &str) {
            self.failures.push(message.to_string());
        }
    }

    impl RecordingReporter {
        pub fn messages(&self) -> Vec<String> {
            self.events.iter().filter_map(|e| e.message.clone()).collect()
        }
    }

    /// Confirmation with canned answers, remembering the prompts
    #[derive(Default)]
    pub struct ScriptedConfirm {
        pub answers: VecDeque<bool>,
        pub prompts: Vec<String>,
    }

    impl ScriptedConfirm {
        pub fn answering(answers: &[bool]) -> Self {
            Self {
                answers: answers.iter().copied().collect(),
                prompts: Vec::new(),
            }
        }
    }

    impl Confirm for ScriptedConfirm {
        fn confirm(&mut self, prompt: &str) -> Result<bool, Error> {
            self.prompts.push(prompt.to_string());
            Ok(self.answers.pop_front().unwrap_or(false))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_reporter_output() {
        let mut reporter = ConsoleReporter::new(Vec::new(), Vec::new(), false);
        reporter.event(
            &LifecycleEvent::done(EventKind::JailCommand, "web").with_stdout("installed nginx"),
        );
        reporter.event(
            &LifecycleEvent::done(EventKind::DestroyResource, "web")
                .with_message("/zroot/moorage/jails/web destroyed"),
        );
        reporter.event(&LifecycleEvent::done(EventKind::StopJail, "web"));
        reporter.event(&LifecycleEvent::failed(
            EventKind::DestroyResource,
            "db",
            &Error::operation("db", "dataset is busy"),
        ));

        let (out, err) = reporter.into_inner();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "installed nginx\n/zroot/moorage/jails/web destroyed\n"
        );
        assert!(String::from_utf8(err).unwrap().contains("destroy db failed"));
    }

    #[test]
    fn test_verdict_exit_codes() {
        assert_eq!(Verdict::Completed(OperationOutcome::default()).exit_code(), 0);
        assert_eq!(Verdict::Aborted.exit_code(), 1);
        assert_eq!(Verdict::Rejected(Error::InvalidInput("x".into())).exit_code(), 1);

        let mut outcome = OperationOutcome::default();
        outcome.succeeded.push("a".into());
        outcome.fail("b", Error::operation("b", "boom"));
        assert_eq!(Verdict::Completed(outcome).exit_code(), 1);
    }

    #[test]
    fn test_drain_stops_at_verdict() {
        let steps = vec![
            Step::Event(LifecycleEvent::done(EventKind::StartJail, "web")),
            Step::Finished(Verdict::Aborted),
            Step::Event(LifecycleEvent::done(EventKind::StartJail, "never")),
        ];
        let mut reporter = testing::RecordingReporter::default();
        let verdict = drain(steps, &mut reporter);

        assert!(matches!(verdict, Verdict::Aborted));
        assert_eq!(reporter.events.len(), 1);
        assert_eq!(reporter.failures, vec!["Aborted"]);
    }
}
