//! Live jail state from the status tool
//!
//! The kernel's jail list is the source of truth for whether a jail runs.
//! State is cached per `JailState` and only refreshed on explicit request.

use crate::error::{Error, Result};
use crate::jail::status::{self, Record};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Captured result of one status tool invocation
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub success: bool,
    pub stdout: String,
}

/// Something that reports live jails in the status line format
pub trait StatusTool {
    /// Run the tool, scoped to `name` when given
    fn run(&self, name: Option<&str>) -> Result<ToolOutput>;
}

/// `jls` in verbose, name-prefixed, quoted mode
pub struct Jls {
    path: PathBuf,
}

impl Jls {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StatusTool for Jls {
    fn run(&self, name: Option<&str>) -> Result<ToolOutput> {
        let mut cmd = Command::new(&self.path);
        if let Some(name) = name {
            cmd.args(["-j", name]);
        }
        cmd.args(["-v", "-n", "-q"]).stderr(Stdio::null());

        let output = cmd.output().map_err(|e| Error::CommandFailed {
            command: self.path.display().to_string(),
            message: e.to_string(),
        })?;

        Ok(ToolOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        })
    }
}

/// Queries the status tool and turns its output into state
pub struct StateProbe {
    tool: Box<dyn StatusTool>,
}

impl StateProbe {
    pub fn new(tool: Box<dyn StatusTool>) -> Self {
        Self { tool }
    }

    /// Live attributes of one jail
    ///
    /// A jail that is not running is normal, so every failure collapses to
    /// an empty mapping.
    pub fn query_single(&self, name: &str) -> Record {
        let output = match self.tool.run(Some(name)) {
            Ok(output) if output.success => output,
            Ok(_) => {
                tracing::debug!("status tool reports no jail named {}", name);
                return Record::new();
            }
            Err(e) => {
                tracing::debug!("status query for {} failed: {}", name, e);
                return Record::new();
            }
        };

        match status::parse_records(&output.stdout) {
            Ok(records) => records
                .into_iter()
                .find(|r| r.get("name").map(String::as_str) == Some(name))
                .unwrap_or_default(),
            Err(e) => {
                tracing::debug!("unparseable status output for {}: {}", name, e);
                Record::new()
            }
        }
    }

    /// Every running jail
    ///
    /// Callers act on the whole table, so any failure is an error here.
    pub fn query_all(&self) -> Result<JailStateTable> {
        let output = self
            .tool
            .run(None)
            .map_err(|e| Error::StateUpdateFailed(e.to_string()))?;

        if !output.success {
            return Err(Error::StateUpdateFailed(
                "status tool exited with a failure".into(),
            ));
        }

        let records = status::parse_records(&output.stdout)
            .map_err(|e| Error::StateUpdateFailed(e.to_string()))?;

        let mut states = BTreeMap::new();
        for record in records {
            let name = record.get("name").cloned().ok_or_else(|| {
                Error::StateUpdateFailed(format!(
                    "status record without a name: {}",
                    status::render(&record)
                ))
            })?;
            states.insert(name.clone(), JailState::with_attributes(name, record));
        }

        tracing::debug!("{} running jails", states.len());
        Ok(JailStateTable { states })
    }
}

/// Cached live state of a single jail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailState {
    name: String,
    attributes: Option<Record>,
}

impl JailState {
    /// Unloaded state, filled on first `ensure_loaded`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: None,
        }
    }

    pub fn with_attributes(name: impl Into<String>, attributes: Record) -> Self {
        Self {
            name: name.into(),
            attributes: Some(attributes),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.attributes.is_some()
    }

    /// Replace the cached attributes with a fresh query
    pub fn query(&mut self, probe: &StateProbe) -> &Record {
        self.attributes.insert(probe.query_single(&self.name))
    }

    /// Query only if nothing is cached yet
    pub fn ensure_loaded(&mut self, probe: &StateProbe) -> &Record {
        if !self.is_loaded() {
            return self.query(probe);
        }
        self.attributes.get_or_insert_default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    pub fn is_running(&self) -> bool {
        self.attributes.as_ref().is_some_and(|a| !a.is_empty())
    }
}

/// Snapshot of all running jails, rebuilt on every bulk query
#[derive(Debug, Clone, Default)]
pub struct JailStateTable {
    states: BTreeMap<String, JailState>,
}

impl JailStateTable {
    pub fn get(&self, name: &str) -> Option<&JailState> {
        self.states.get(name)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.get(name).is_some_and(JailState::is_running)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Status tool replaying canned output and recording its calls
    #[derive(Clone, Default)]
    pub struct ScriptedTool {
        pub success: bool,
        pub stdout: String,
        pub launch_error: bool,
        pub calls: Rc<RefCell<Vec<Option<String>>>>,
    }

    impl ScriptedTool {
        pub fn ok(stdout: &str) -> Self {
            Self {
                success: true,
                stdout: stdout.to_string(),
                ..Default::default()
            }
        }

        pub fn failing() -> Self {
            Self::default()
        }
    }

    impl StatusTool for ScriptedTool {
        fn run(&self, name: Option<&str>) -> Result<ToolOutput> {
            self.calls.borrow_mut().push(name.map(String::from));
            if self.launch_error {
                return Err(Error::CommandFailed {
                    command: "jls".into(),
                    message: "No such file or directory".into(),
                });
            }
            Ok(ToolOutput {
                success: self.success,
                stdout: self.stdout.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::ScriptedTool;
    use super::*;

    const TWO_JAILS: &str = "devfs_ruleset=4 jid=1 name=web path=/jails/web/root persist\n\
                             jid=2 name=db 'host.hostname=db server'";

    #[test]
    fn test_query_all_builds_table() {
        let probe = StateProbe::new(Box::new(ScriptedTool::ok(TWO_JAILS)));
        let table = probe.query_all().unwrap();

        assert!(table.is_running("web"));
        assert!(table.is_running("db"));
        assert!(!table.is_running("mail"));
        assert_eq!(table.get("db").unwrap().get("host.hostname"), Some("db server"));
        assert_eq!(table.get("web").unwrap().get("jid"), Some("1"));
    }

    #[test]
    fn test_query_all_fails_on_nonzero_exit() {
        let probe = StateProbe::new(Box::new(ScriptedTool::failing()));
        assert!(matches!(probe.query_all(), Err(Error::StateUpdateFailed(_))));
    }

    #[test]
    fn test_query_all_fails_on_launch_error() {
        let tool = ScriptedTool {
            launch_error: true,
            ..Default::default()
        };
        let probe = StateProbe::new(Box::new(tool));
        assert!(matches!(probe.query_all(), Err(Error::StateUpdateFailed(_))));
    }

    #[test]
    fn test_query_all_fails_on_malformed_output() {
        let probe = StateProbe::new(Box::new(ScriptedTool::ok("name='web jid=1")));
        assert!(matches!(probe.query_all(), Err(Error::StateUpdateFailed(_))));

        let probe = StateProbe::new(Box::new(ScriptedTool::ok("jid=1 path=/x")));
        assert!(matches!(probe.query_all(), Err(Error::StateUpdateFailed(_))));
    }

    #[test]
    fn test_query_single_absent_name_is_empty() {
        let tool = ScriptedTool::ok(TWO_JAILS);
        let calls = tool.calls.clone();
        let probe = StateProbe::new(Box::new(tool));

        assert!(probe.query_single("mail").is_empty());
        assert_eq!(calls.borrow().as_slice(), &[Some("mail".to_string())]);
    }

    #[test]
    fn test_query_single_tool_failure_is_empty() {
        let probe = StateProbe::new(Box::new(ScriptedTool::failing()));
        assert!(probe.query_single("web").is_empty());

        let tool = ScriptedTool {
            launch_error: true,
            ..Default::default()
        };
        let probe = StateProbe::new(Box::new(tool));
        assert!(probe.query_single("web").is_empty());
    }

    #[test]
    fn test_lazy_load_queries_once() {
        let tool = ScriptedTool::ok("jid=7 name=web");
        let calls = tool.calls.clone();
        let probe = StateProbe::new(Box::new(tool));

        let mut state = JailState::new("web");
        assert!(!state.is_loaded());
        assert!(!state.is_running());

        state.ensure_loaded(&probe);
        state.ensure_loaded(&probe);
        assert_eq!(calls.borrow().len(), 1);
        assert_eq!(state.get("jid"), Some("7"));

        state.query(&probe);
        assert_eq!(calls.borrow().len(), 2);
    }

    #[test]
    fn test_requery_replaces_attributes() {
        let mut state = JailState::with_attributes(
            "web",
            [("name", "web"), ("stale", "yes")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        let probe = StateProbe::new(Box::new(ScriptedTool::ok("name=web jid=3")));

        state.query(&probe);
        assert_eq!(state.get("stale"), None);
        assert_eq!(state.get("jid"), Some("3"));
    }

    #[test]
    fn test_stopped_jail_state() {
        let probe = StateProbe::new(Box::new(ScriptedTool::failing()));
        let mut state = JailState::new("web");
        assert!(state.ensure_loaded(&probe).is_empty());
        assert!(state.is_loaded());
        assert!(!state.is_running());
    }

    #[test]
    fn test_seeded_state_skips_the_tool() {
        let tool = ScriptedTool::ok("jid=9 name=web");
        let calls = tool.calls.clone();
        let probe = StateProbe::new(Box::new(tool));

        let table = StateProbe::new(Box::new(ScriptedTool::ok(TWO_JAILS)))
            .query_all()
            .unwrap();
        let mut db = table.get("db").unwrap().clone();
        let reparsed = status::parse_record(&status::render(db.ensure_loaded(&probe))).unwrap();

        assert_eq!(reparsed.get("jid").map(String::as_str), Some("2"));
        assert!(calls.borrow().is_empty());
    }
}
