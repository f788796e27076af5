//! Per-jail mount table
//!
//! The table is read whole, edited in memory and written back whole. Lines
//! we cannot parse (comments, blanks, anything odd) are kept verbatim, and
//! mount lines nobody touched keep their original text, so an edit only
//! changes the lines it is about.
//!
//! Lifecycle is tracked with a state machine:
//! Unloaded -> Loaded -> Dirty -> Persisted (-> Dirty again on further edits).

use crate::error::{Error, Result};
use crate::paths::PathResolver;
use machine::{DynamicFstabMachine, FstabMachine, FstabMachineEvent};
use nom::{
    IResult, Parser,
    bytes::complete::is_not,
    character::complete::{char, digit1, multispace0, space0, space1},
    combinator::{all_consuming, map_res, opt, rest},
    sequence::preceded,
};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

mod machine {
    use state_machines::state_machine;

    state_machine! {
        name: FstabMachine,
        dynamic: true,
        initial: Unloaded,
        states: [Unloaded, Loaded, Dirty, Persisted],
        events {
            open {
                transition: { from: [Unloaded, Loaded, Persisted], to: Loaded }
            }
            change {
                transition: { from: [Loaded, Persisted], to: Dirty }
            }
            commit {
                transition: { from: Dirty, to: Persisted }
            }
        }
    }
}

pub const DEFAULT_TYPE: &str = "nullfs";
pub const DEFAULT_OPTIONS: &str = "ro";

/// One structured mount line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabLine {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub fs_type: String,
    pub options: String,
    pub freq: u32,
    pub passno: u32,
    pub comment: Option<String>,
}

impl FstabLine {
    /// Read-only nullfs mount
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            fs_type: DEFAULT_TYPE.to_string(),
            options: DEFAULT_OPTIONS.to_string(),
            freq: 0,
            passno: 0,
            comment: None,
        }
    }

    /// Set dump frequency and fsck pass, rejecting negative values
    pub fn with_counts(mut self, freq: i64, passno: i64) -> Result<Self> {
        self.freq = count("freq", freq)?;
        self.passno = count("passno", passno)?;
        Ok(self)
    }

    /// Parse a mount line, `None` for anything that is not one
    pub fn parse(line: &str) -> Option<Self> {
        all_consuming(mount_line).parse(line).ok().map(|(_, l)| l)
    }

    /// Reject fields that would not read back as this same line
    pub fn check(&self) -> Result<()> {
        for (field, value) in [("type", &self.fs_type), ("options", &self.options)] {
            if value.is_empty() || value.contains(|c: char| c.is_whitespace() || c == '#') {
                return Err(Error::InvalidInput(format!(
                    "invalid mount {} '{}'",
                    field, value
                )));
            }
        }
        if let Some(comment) = &self.comment
            && comment.contains(['\n', '\r'])
        {
            return Err(Error::InvalidInput(
                "mount comment must be a single line".into(),
            ));
        }
        Ok(())
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            encode(&self.source),
            encode(&self.destination),
            self.fs_type,
            self.options,
            self.freq,
            self.passno
        );
        if let Some(comment) = &self.comment {
            out.push_str(" # ");
            out.push_str(comment);
        }
        out
    }
}

fn count(field: &str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        Error::InvalidInput(format!(
            "{} must be a non-negative integer, got {}",
            field, value
        ))
    })
}

// fstab(5) writes blanks in paths as octal escapes. The field separators
// and `#` are escaped the same way, backslash first so escapes stay unique.
const ESCAPES: [(char, &str); 4] = [
    (' ', "\\040"),
    ('\t', "\\011"),
    ('\n', "\\012"),
    ('#', "\\043"),
];

fn encode(path: &Path) -> String {
    let mut out = path.to_string_lossy().replace('\\', "\\134");
    for (c, escape) in ESCAPES {
        out = out.replace(c, escape);
    }
    out
}

fn decode(field: &str) -> PathBuf {
    let mut out = field.to_string();
    for (c, escape) in ESCAPES {
        out = out.replace(escape, c.encode_utf8(&mut [0; 4]));
    }
    PathBuf::from(out.replace("\\134", "\\"))
}

fn field(input: &str) -> IResult<&str, &str> {
    is_not(" \t\r\n#").parse(input)
}

fn number(input: &str) -> IResult<&str, u32> {
    map_res(digit1, str::parse::<u32>).parse(input)
}

fn mount_line(input: &str) -> IResult<&str, FstabLine> {
    let (input, _) = space0.parse(input)?;
    let (input, source) = field.parse(input)?;
    let (input, _) = space1.parse(input)?;
    let (input, destination) = field.parse(input)?;
    let (input, _) = space1.parse(input)?;
    let (input, fs_type) = field.parse(input)?;
    let (input, _) = space1.parse(input)?;
    let (input, options) = field.parse(input)?;
    let (input, _) = space1.parse(input)?;
    let (input, freq) = number.parse(input)?;
    let (input, _) = space1.parse(input)?;
    let (input, passno) = number.parse(input)?;
    let (input, _) = space0.parse(input)?;
    let (input, comment) = opt(preceded(char('#'), rest)).parse(input)?;
    let (input, _) = multispace0.parse(input)?;

    Ok((
        input,
        FstabLine {
            source: decode(source),
            destination: decode(destination),
            fs_type: fs_type.to_string(),
            options: options.to_string(),
            freq,
            passno,
            comment: comment
                .map(|c: &str| c.trim().to_string())
                .filter(|c| !c.is_empty()),
        },
    ))
}

/// A line of the table as it sits in memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FstabEntry {
    /// A mount, with the text it was read from if it came from disk
    Mount { line: FstabLine, raw: Option<String> },
    /// Kept as-is and ignored by structured operations
    Verbatim(String),
}

impl FstabEntry {
    fn from_text(text: &str) -> Self {
        match FstabLine::parse(text) {
            Some(line) => FstabEntry::Mount {
                line,
                raw: Some(text.to_string()),
            },
            None => FstabEntry::Verbatim(text.to_string()),
        }
    }

    fn render(&self) -> String {
        match self {
            FstabEntry::Mount { raw: Some(raw), .. } => raw.clone(),
            FstabEntry::Mount { line, raw: None } => line.render(),
            FstabEntry::Verbatim(text) => text.clone(),
        }
    }

    pub fn mount(&self) -> Option<&FstabLine> {
        match self {
            FstabEntry::Mount { line, .. } => Some(line),
            FstabEntry::Verbatim(_) => None,
        }
    }
}

/// A jail's mount table backed by a file
pub struct Fstab {
    path: PathBuf,
    entries: Vec<FstabEntry>,
    trailing_newline: bool,
    machine: DynamicFstabMachine<()>,
}

impl Fstab {
    /// Unloaded table for `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Vec::new(),
            trailing_newline: true,
            machine: FstabMachine::new(()).into_dynamic(),
        }
    }

    /// Open and read the table in one go
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let mut fstab = Self::new(path);
        fstab.load()?;
        Ok(fstab)
    }

    /// Current lifecycle state name
    pub fn state(&self) -> &str {
        self.machine.current_state()
    }

    /// Read the backing file; a missing file is an empty table
    pub fn load(&mut self) -> Result<()> {
        self.transition(FstabMachineEvent::Open, "load")?;

        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("{} does not exist yet", self.path.display());
                String::new()
            }
            Err(e) => return Err(e.into()),
        };

        self.trailing_newline = content.is_empty() || content.ends_with('\n');
        let body = content.strip_suffix('\n').unwrap_or(&content);
        self.entries = if content.is_empty() {
            Vec::new()
        } else {
            body.split('\n').map(FstabEntry::from_text).collect()
        };

        Ok(())
    }

    /// Every entry in file order
    pub fn entries(&self) -> &[FstabEntry] {
        &self.entries
    }

    /// Structured mounts with their index in the full sequence
    pub fn mounts(&self) -> impl Iterator<Item = (usize, &FstabLine)> {
        self.entries()
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.mount().map(|m| (i, m)))
    }

    /// Append a mount at the end, returning its index
    pub fn append(&mut self, line: FstabLine) -> Result<usize> {
        line.check()?;
        self.mark_dirty("append to")?;
        self.entries.push(FstabEntry::Mount { line, raw: None });
        Ok(self.entries.len() - 1)
    }

    /// Remove the first mount accepted by `predicate`
    pub fn remove_where<P>(&mut self, predicate: P) -> Result<Option<(usize, FstabLine)>>
    where
        P: Fn(&FstabLine) -> bool,
    {
        if self.state() == "Unloaded" {
            return Err(self.state_error("remove from"));
        }

        let Some((index, line)) = self.mounts().find(|(_, m)| predicate(m)) else {
            return Ok(None);
        };
        let line = line.clone();

        self.mark_dirty("remove from")?;
        self.entries.remove(index);
        Ok(Some((index, line)))
    }

    /// Remove the first mount of `source`
    pub fn remove_source(&mut self, source: &Path) -> Result<(usize, FstabLine)> {
        self.remove_where(|line| line.source == source)?
            .ok_or_else(|| Error::not_found("fstab entry", source.display().to_string()))
    }

    /// File content for the current entries
    pub fn render(&self) -> String {
        let mut out = self
            .entries
            .iter()
            .map(FstabEntry::render)
            .collect::<Vec<_>>()
            .join("\n");
        if self.trailing_newline && !self.entries.is_empty() {
            out.push('\n');
        }
        out
    }

    /// Atomically replace the backing file; only valid with unsaved changes
    pub fn save(&mut self) -> Result<()> {
        if self.state() != "Dirty" {
            return Err(self.state_error("save"));
        }

        write_atomic(&self.path, self.render().as_bytes())?;
        self.transition(FstabMachineEvent::Commit, "save")?;
        tracing::debug!("wrote {}", self.path.display());
        Ok(())
    }

    fn mark_dirty(&mut self, action: &str) -> Result<()> {
        if self.state() == "Dirty" {
            return Ok(());
        }
        self.transition(FstabMachineEvent::Change, action)
    }

    fn transition(&mut self, event: FstabMachineEvent, action: &str) -> Result<()> {
        self.machine
            .handle(event)
            .map_err(|_| self.state_error(action))
    }

    fn state_error(&self, action: &str) -> Error {
        Error::FstabState {
            action: action.to_string(),
            state: self.state().to_lowercase(),
        }
    }
}

/// Write through a temp file in the same directory, then rename over `path`
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Create a mount destination; an existing directory is fine
pub fn ensure_destination(path: &Path) -> Result<()> {
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// What `fstab add` was asked for
#[derive(Debug, Clone)]
pub struct MountRequest {
    pub source: PathBuf,
    /// Inside the jail; defaults to the source path
    pub destination: Option<PathBuf>,
    pub fs_type: String,
    pub options: String,
    pub freq: i64,
    pub passno: i64,
    pub comment: Option<String>,
}

#[cfg(test)]
impl MountRequest {
    pub fn nullfs(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: None,
            fs_type: DEFAULT_TYPE.to_string(),
            options: DEFAULT_OPTIONS.to_string(),
            freq: 0,
            passno: 0,
            comment: None,
        }
    }
}

/// Add a mount to a jail's table and create its destination
pub fn add_mount(fstab_path: &Path, root: &PathResolver, request: MountRequest) -> Result<FstabLine> {
    if request.source.is_absolute() && !request.source.is_dir() {
        return Err(Error::InvalidInput(format!(
            "mount source {} is not an existing directory",
            request.source.display()
        )));
    }

    let destination = request
        .destination
        .clone()
        .unwrap_or_else(|| request.source.clone());
    let destination = root.to_absolute(&destination)?;

    let mut line = FstabLine::new(&request.source, &destination)
        .with_counts(request.freq, request.passno)?;
    line.fs_type = request.fs_type;
    line.options = request.options;
    line.comment = request.comment.filter(|c| !c.is_empty());
    line.check()?;

    ensure_destination(&destination)?;

    let mut fstab = Fstab::open(fstab_path)?;
    fstab.append(line.clone())?;
    fstab.save()?;
    Ok(line)
}

/// Remove the mount of `source` from a jail's table
pub fn remove_mount(fstab_path: &Path, source: &Path) -> Result<(usize, FstabLine)> {
    let mut fstab = Fstab::open(fstab_path)?;
    let removed = fstab.remove_source(source)?;
    fstab.save()?;
    Ok(removed)
}
