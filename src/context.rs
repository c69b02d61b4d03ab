//! Conversation context: turns, JSON persistence and legacy import.
//!
//! A session's history lives in memory as an ordered list of [`Turn`]s and is
//! written once, at the end of the session, to `contexts/context_<stamp>.json`:
//!
//! ```json
//! {
//!     "started_on": "October 17 2026 @ 14:03:09",
//!     "context": [ { "User": "hello", "AI": "hi there" } ]
//! }
//! ```
//!
//! Older sessions were written as plain-text `context_<stamp>.txt` files (a
//! `Start of the context from <stamp>:` header, then `User:`/`AI:` lines);
//! [`Context::from_transcript`] reads those back. The delimited string form,
//! with separator markers between turns and between the user and AI halves
//! of a turn, is still accepted by [`Context::from_delimited`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const QUERY_SEPARATOR: &str = "\n----------------QUERY SEPARATOR----------------\n";
pub const USER_AI_SEPARATOR: &str = "\n----------------USER AI SEPARATOR----------------\n";

const USER_PREFIX: &str = "User: ";
const AI_PREFIX: &str = "AI: ";
const TRANSCRIPT_HEADER: &str = "Start of the context from ";
const STARTED_ON_FORMAT: &str = "%B %d %Y @ %H:%M:%S";

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("invalid context filename {0:?}")]
    InvalidFilename(String),

    #[error("context file {0:?} does not exist")]
    NotFound(String),

    #[error("cannot read context file {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("context file {} is not a valid context document: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("malformed context segment {index}: expected one user part and one AI part, found {parts}")]
    Malformed { index: usize, parts: usize },

    #[error("failed to serialize context: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("cannot write context file {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("context file {} does not match the session it was written from", .0.display())]
    Verify(PathBuf),

    #[error("cannot delete context file {}: {source}", .path.display())]
    Delete { path: PathBuf, source: io::Error },
}

/// One exchange: what the user typed and what the model answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    #[serde(rename = "User")]
    pub user: String,
    #[serde(rename = "AI")]
    pub ai: String,
}

impl Turn {
    pub fn new(user: impl Into<String>, ai: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ai: ai.into(),
        }
    }
}

/// Ordered conversation history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    turns: Vec<Turn>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_turns(turns: Vec<Turn>) -> Self {
        Self { turns }
    }

    pub fn push(&mut self, user: impl Into<String>, ai: impl Into<String>) {
        self.turns.push(Turn::new(user, ai));
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// History as plain `User:`/`AI:` lines, the form handed to the model.
    pub fn transcript(&self) -> String {
        self.turns
            .iter()
            .map(|turn| format!("{USER_PREFIX}{}\n{AI_PREFIX}{}\n", turn.user, turn.ai))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Parse a plain-text transcript: the output of [`Context::transcript`],
    /// optionally preceded by a `Start of the context from ...:` header line.
    ///
    /// A `User: ` line opens a turn, the next `AI: ` line starts its reply,
    /// and every following line up to the next `User: ` belongs to that
    /// reply. Trailing blank lines of a reply are the gap between turns.
    pub fn from_transcript(text: &str) -> Result<Self, ContextError> {
        let mut turns = Vec::new();
        let mut user: Option<&str> = None;
        let mut ai: Option<Vec<&str>> = None;

        let mut lines = text.lines().peekable();
        if lines
            .peek()
            .is_some_and(|line| line.starts_with(TRANSCRIPT_HEADER))
        {
            lines.next();
        }

        for line in lines {
            if let Some(rest) = strip_label(line, USER_PREFIX) {
                close_turn(&mut turns, user.take(), ai.take())?;
                user = Some(rest);
            } else if let Some(rest) =
                strip_label(line, AI_PREFIX).filter(|_| user.is_some() && ai.is_none())
            {
                ai = Some(vec![rest]);
            } else if let Some(reply) = ai.as_mut() {
                reply.push(line);
            } else if !line.trim().is_empty() {
                return Err(ContextError::Malformed {
                    index: turns.len(),
                    parts: usize::from(user.is_some()),
                });
            }
        }
        close_turn(&mut turns, user, ai)?;

        Ok(Self { turns })
    }

    /// Parse the legacy delimited form.
    ///
    /// Every non-empty segment between turn separators must split into
    /// exactly one user part and one AI part; anything else is an error so
    /// that turns are never silently dropped.
    #[allow(dead_code)]
    pub fn from_delimited(text: &str) -> Result<Self, ContextError> {
        let mut turns = Vec::new();
        for (index, segment) in text
            .split(QUERY_SEPARATOR)
            .filter(|s| !s.is_empty())
            .enumerate()
        {
            let parts: Vec<&str> = segment.split(USER_AI_SEPARATOR).collect();
            let [user, ai] = parts.as_slice() else {
                return Err(ContextError::Malformed {
                    index,
                    parts: parts.len(),
                });
            };
            turns.push(Turn::new(
                strip_once(user, USER_PREFIX),
                strip_once(ai, AI_PREFIX),
            ));
        }
        Ok(Self { turns })
    }

    /// Render the legacy delimited form. Inverse of [`Context::from_delimited`]
    /// as long as no text contains a separator marker.
    #[allow(dead_code)]
    pub fn to_delimited(&self) -> String {
        self.turns
            .iter()
            .map(|turn| {
                format!(
                    "{QUERY_SEPARATOR}{USER_PREFIX}{}{USER_AI_SEPARATOR}{AI_PREFIX}{}{QUERY_SEPARATOR}",
                    turn.user, turn.ai
                )
            })
            .collect()
    }
}

fn strip_once<'a>(text: &'a str, prefix: &str) -> &'a str {
    text.strip_prefix(prefix).unwrap_or(text)
}

/// `label` is `"User: "` or `"AI: "`; an empty reply may have lost its
/// trailing space when the file was written.
fn strip_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    line.strip_prefix(label)
        .or_else(|| (line == label.trim_end()).then_some(""))
}

fn close_turn(
    turns: &mut Vec<Turn>,
    user: Option<&str>,
    ai: Option<Vec<&str>>,
) -> Result<(), ContextError> {
    match (user, ai) {
        (None, None) => Ok(()),
        (Some(user), Some(reply)) => {
            turns.push(Turn::new(user, reply.join("\n").trim_end_matches('\n')));
            Ok(())
        }
        (user, _) => Err(ContextError::Malformed {
            index: turns.len(),
            parts: usize::from(user.is_some()),
        }),
    }
}

/// On-disk document.
#[derive(Debug, Serialize, Deserialize)]
pub struct ContextFile {
    #[serde(default)]
    pub started_on: String,
    pub context: Vec<Turn>,
}

/// Load a saved context. Returns an empty context when `use_context` is
/// false, whatever `path` holds.
pub fn load_context(path: &str, use_context: bool) -> Result<Context, ContextError> {
    if !use_context {
        return Ok(Context::new());
    }
    if path.is_empty() {
        return Err(ContextError::InvalidFilename(path.to_string()));
    }

    let path = PathBuf::from(path);
    if path.extension().is_some_and(|ext| ext == "txt") {
        let text = fs::read_to_string(&path).map_err(|source| ContextError::Read {
            path: path.clone(),
            source,
        })?;
        let context = Context::from_transcript(&text)?;
        info!("Imported {} legacy turns from {}", context.len(), path.display());
        return Ok(context);
    }

    let file = read_context_file(&path)?;
    info!(
        "Loaded {} turns from {} (started {})",
        file.context.len(),
        path.display(),
        file.started_on
    );
    Ok(Context::from_turns(file.context))
}

fn read_context_file(path: &Path) -> Result<ContextFile, ContextError> {
    let contents = fs::read_to_string(path).map_err(|source| ContextError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ContextError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Result of [`ContextStore::replace`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replaced {
    pub saved: Option<PathBuf>,
    pub deleted_old: bool,
}

/// The directory holding saved contexts.
#[derive(Debug, Clone)]
pub struct ContextStore {
    dir: PathBuf,
}

impl ContextStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `context` to a new timestamped file. Empty contexts write
    /// nothing and return `None`.
    #[allow(dead_code)]
    pub fn save(&self, context: &Context) -> Result<Option<PathBuf>, ContextError> {
        self.save_at(context, Local::now())
    }

    /// Save a legacy delimited transcript.
    #[allow(dead_code)]
    pub fn save_delimited(&self, text: &str) -> Result<Option<PathBuf>, ContextError> {
        if text.is_empty() {
            return Ok(None);
        }
        self.save(&Context::from_delimited(text)?)
    }

    fn save_at(
        &self,
        context: &Context,
        now: DateTime<Local>,
    ) -> Result<Option<PathBuf>, ContextError> {
        if context.is_empty() {
            debug!("Empty context, nothing to save");
            return Ok(None);
        }

        fs::create_dir_all(&self.dir).map_err(|source| ContextError::Write {
            path: self.dir.clone(),
            source,
        })?;

        let started_on = now.format(STARTED_ON_FORMAT).to_string();
        let document = ContextFile {
            started_on: started_on.clone(),
            context: context.turns().to_vec(),
        };

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        document.serialize(&mut serializer)?;

        let path = self.persist(&file_stamp(&started_on), &buf)?;
        info!("Saved {} turns to {}", context.len(), path.display());
        Ok(Some(path))
    }

    /// Write `bytes` through a temp file in the store directory, then move it
    /// to the first free `context_<stamp>[_n].json` name.
    fn persist(&self, stamp: &str, bytes: &[u8]) -> Result<PathBuf, ContextError> {
        use std::io::Write;

        let write_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| ContextError::Write { path, source }
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(write_err(&self.dir))?;
        tmp.write_all(bytes).map_err(write_err(tmp.path()))?;
        tmp.as_file().sync_all().map_err(write_err(tmp.path()))?;

        for n in 0usize.. {
            let name = if n == 0 {
                format!("context_{stamp}.json")
            } else {
                format!("context_{stamp}_{n}.json")
            };
            let path = self.dir.join(name);
            if path.exists() {
                continue;
            }
            match tmp.persist_noclobber(&path) {
                Ok(_) => return Ok(path),
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => tmp = e.file,
                Err(e) => return Err(ContextError::Write { path, source: e.error }),
            }
        }
        unreachable!("ran out of context file names")
    }

    /// Remove the file called like `path` from the store directory. Other
    /// path components are ignored. Returns whether a file was removed.
    pub fn delete(&self, path: &str) -> Result<bool, ContextError> {
        if path.is_empty() {
            return Err(ContextError::NotFound(path.to_string()));
        }
        let Some(name) = Path::new(path).file_name() else {
            debug!("{path:?} has no file name, nothing to delete");
            return Ok(false);
        };
        let target = self.dir.join(name);

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(source) => {
                return Err(ContextError::Read {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        let present = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .any(|p| p == target && p.extension().is_some_and(|ext| ext == "json"));
        if !present {
            debug!("{} not in {}, leaving it", target.display(), self.dir.display());
            return Ok(false);
        }

        fs::remove_file(&target).map_err(|source| ContextError::Delete {
            path: target.clone(),
            source,
        })?;
        info!("Deleted old context {}", target.display());
        Ok(true)
    }

    /// Save `context` as a new file, read it back, and only then delete
    /// `old`. A failure before the delete leaves `old` in place.
    pub fn replace(&self, context: &Context, old: Option<&str>) -> Result<Replaced, ContextError> {
        self.replace_at(context, old, Local::now())
    }

    fn replace_at(
        &self,
        context: &Context,
        old: Option<&str>,
        now: DateTime<Local>,
    ) -> Result<Replaced, ContextError> {
        let saved = self.save_at(context, now)?;
        if let Some(path) = &saved {
            self.verify(path, context)?;
        }

        let deleted_old = match old {
            Some(old) if !same_name(old, saved.as_deref()) => self.delete(old)?,
            _ => false,
        };
        Ok(Replaced { saved, deleted_old })
    }

    fn verify(&self, path: &Path, context: &Context) -> Result<(), ContextError> {
        let written = read_context_file(path)?;
        if written.context.as_slice() != context.turns() {
            return Err(ContextError::Verify(path.to_path_buf()));
        }
        Ok(())
    }
}

fn file_stamp(started_on: &str) -> String {
    started_on.replace(' ', "").replace(':', "_")
}

fn same_name(old: &str, saved: Option<&Path>) -> bool {
    saved.is_some_and(|saved| saved.file_name() == Path::new(old).file_name())
}
