//! Append-only log of finished-stage fingerprints.
//!
//! This file is the sole restart mechanism: one fingerprint per line,
//! flushed and fsync'd per append so a completed stage survives a server
//! crash. Whole-state serialization is deliberately absent (it stalled for
//! minutes at 30k+ stages in an earlier design). The log is read in full at
//! startup and never truncated; a partial last line from an interrupted
//! write is discarded on load.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::fingerprint::Fingerprint;

/// Where the finished-stages log lives relative to the working directory.
pub fn default_path(output_dir: &Path, pipeline_name: &str) -> PathBuf {
    output_dir
        .join("pydpiper-backups")
        .join(format!("{pipeline_name}-finished-stages"))
}

pub struct CompletionLog {
    path: PathBuf,
    file: File,
}

impl CompletionLog {
    /// Open the log for appending, creating it (and its directory) if
    /// needed.
    pub fn open(path: &Path) -> io::Result<CompletionLog> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(CompletionLog {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Read every fingerprint recorded in a previous run. A missing file
    /// means a fresh pipeline (empty set). A final line without a
    /// terminating newline is a torn write and is dropped; malformed lines
    /// are skipped with a warning rather than failing the restart.
    pub fn load(path: &Path) -> io::Result<HashSet<Fingerprint>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(err) => return Err(err),
        };

        let mut lines: Vec<&str> = text.split('\n').collect();
        // split always yields a trailing element; it is empty iff the file
        // ended with a newline.
        match lines.pop() {
            Some("") | None => {}
            Some(partial) => {
                warn!(
                    path = %path.display(),
                    partial = %partial,
                    "discarding partial last line of finished-stages log"
                );
            }
        }

        let mut fingerprints = HashSet::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            match Fingerprint::parse(line) {
                Some(fp) => {
                    fingerprints.insert(fp);
                }
                None => {
                    warn!(
                        path = %path.display(),
                        line = %line,
                        "skipping malformed finished-stages entry"
                    );
                }
            }
        }
        Ok(fingerprints)
    }

    /// Record a finished stage. Durable before returning: the write-ahead
    /// rule requires the fingerprint on disk before any dependent becomes
    /// runnable.
    pub fn append(&mut self, fingerprint: Fingerprint) -> io::Result<()> {
        writeln!(self.file, "{fingerprint}")?;
        self.file.flush()?;
        self.file.sync_data()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
