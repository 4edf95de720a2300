//! Append-only mutation journal.
//!
//! Every step lifecycle transition becomes one immutable entry. Sequence
//! numbers are assigned under the same lock that appends, so they are dense
//! and strictly increasing even when steps finish concurrently.

use crate::error::{Error, Result};
use crate::property::PropertyMap;
use crate::step::Step;
use crate::urn::Urn;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// What happened at one point of a step's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Mutation {
    Begin {
        step: Step,
    },
    Success {
        /// Sequence number of the matching `Begin`
        begun: u64,
        step: Step,
    },
    Failure {
        begun: u64,
        step: Step,
    },
    /// Outputs registered for an already-recorded resource
    Outputs {
        urn: Urn,
        outputs: PropertyMap,
    },
}

impl Mutation {
    pub fn step(&self) -> Option<&Step> {
        match self {
            Mutation::Begin { step }
            | Mutation::Success { step, .. }
            | Mutation::Failure { step, .. } => Some(step),
            Mutation::Outputs { .. } => None,
        }
    }
}

/// A sequenced journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    #[serde(flatten)]
    pub mutation: Mutation,
}

/// Receives every entry as it is appended, before it becomes visible.
pub trait JournalPersister: Send + Sync {
    fn persist(&self, entry: &JournalEntry) -> Result<()>;
}

#[derive(Debug, Default)]
struct Inner {
    last_seq: u64,
    entries: Vec<JournalEntry>,
}

/// Thread-safe, append-only log.
#[derive(Default)]
pub struct Journal {
    inner: Mutex<Inner>,
    persister: Option<Box<dyn JournalPersister>>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("len", &self.len())
            .field("persisted", &self.persister.is_some())
            .finish()
    }
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_persister(persister: Box<dyn JournalPersister>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            persister: Some(persister),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // entries are only ever pushed whole, so a poisoned lock is still consistent
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a mutation and return its sequence number.
    ///
    /// If the persister fails the entry is not recorded and the sequence
    /// number is not consumed.
    pub fn append(&self, mutation: Mutation) -> Result<u64> {
        let mut inner = self.lock();
        let entry = JournalEntry {
            seq: inner.last_seq + 1,
            mutation,
        };
        if let Some(persister) = &self.persister {
            persister.persist(&entry)?;
        }
        inner.last_seq = entry.seq;
        let seq = entry.seq;
        inner.entries.push(entry);
        Ok(seq)
    }

    pub fn begin(&self, step: Step) -> Result<u64> {
        self.append(Mutation::Begin { step })
    }

    pub fn end(&self, begun: u64, step: Step, success: bool) -> Result<u64> {
        self.append(if success {
            Mutation::Success { begun, step }
        } else {
            Mutation::Failure { begun, step }
        })
    }

    pub fn record_outputs(&self, urn: Urn, outputs: PropertyMap) -> Result<u64> {
        self.append(Mutation::Outputs { urn, outputs })
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every entry appended so far.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.lock().entries.clone()
    }

    pub fn into_entries(self) -> Vec<JournalEntry> {
        self.inner
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
    }
}

// ============================================================================
// JSON Lines
// ============================================================================

/// Persists entries as one JSON object per line.
pub struct JsonLinesPersister {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesPersister {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| Error::File {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JournalPersister for JsonLinesPersister {
    fn persist(&self, entry: &JournalEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer
            .write_all(&line)
            .and_then(|()| writer.flush())
            .map_err(|e| Error::Persist {
                seq: entry.seq,
                message: e.to_string(),
            })
    }
}

/// Read entries written by [`JsonLinesPersister`], in file order.
pub fn read_entries(path: &Path) -> Result<Vec<JournalEntry>> {
    let file = File::open(path).map_err(|source| Error::File {
        path: path.to_path_buf(),
        source,
    })?;
    let mut entries = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(&line).map_err(|source| Error::MalformedLine {
            line: index + 1,
            source,
        })?;
        entries.push(entry);
    }
    log::debug!("Read {} journal entries from {}", entries.len(), path.display());
    Ok(entries)
}
