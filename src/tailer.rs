//! Append-only log tailing.
//!
//! [`LogTailer`] opens the tracking log positioned at its end and, on each
//! change notification, returns the records appended since the last read.
//! Notifications come from [`LogTailer::check`], which compares the open
//! handle against the path on disk, identifying files by their unix
//! (device, inode) pair:
//!
//! - the handle grew → [`FileChange::Modified`]
//! - the path now names another file, or nothing → [`FileChange::Lost`]
//! - the handle shrank below the read position → [`FileChange::Lost`]
//!
//! A read that does not end on a newline is held back whole in the race
//! buffer until the rest of the line arrives, so a record that is still
//! being written is never parsed.

use std::fs::{File, Metadata};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::{BridgeError, DecodeError, Result};
use crate::models::RawRecord;

/// Why the watched path no longer refers to the file we hold open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityLoss {
    MovedAway,
    Deleted,
    Truncated,
}

impl std::fmt::Display for IdentityLoss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            IdentityLoss::MovedAway => "tracking log file moved",
            IdentityLoss::Deleted => "tracking log file deleted",
            IdentityLoss::Truncated => "tracking log file truncated",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Unchanged,
    Modified,
    Lost(IdentityLoss),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    fn of(meta: &Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }
}

fn unlinked(meta: &Metadata) -> bool {
    meta.nlink() == 0
}

pub struct LogTailer {
    path: PathBuf,
    file: File,
    identity: FileIdentity,
    position: u64,
    race_buffer: Vec<u8>,
}

impl LogTailer {
    /// Open `path` at its current end; earlier content is never replayed.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| BridgeError::io(path, e))?;
        let position = file
            .seek(SeekFrom::End(0))
            .map_err(|e| BridgeError::io(path, e))?;
        let meta = file.metadata().map_err(|e| BridgeError::io(path, e))?;

        debug!(path = %path.display(), position, "opened tracking log");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            identity: FileIdentity::of(&meta),
            position,
            race_buffer: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Compare the open handle with the path on disk.
    pub fn check(&self) -> Result<FileChange> {
        let held = self
            .file
            .metadata()
            .map_err(|e| BridgeError::io(&self.path, e))?;

        match std::fs::metadata(&self.path) {
            Ok(on_disk) => {
                if FileIdentity::of(&on_disk) != self.identity {
                    return Ok(FileChange::Lost(IdentityLoss::MovedAway));
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let loss = if unlinked(&held) {
                    IdentityLoss::Deleted
                } else {
                    IdentityLoss::MovedAway
                };
                return Ok(FileChange::Lost(loss));
            }
            Err(e) => return Err(BridgeError::io(&self.path, e)),
        }

        let len = held.len();
        Ok(if len < self.position {
            FileChange::Lost(IdentityLoss::Truncated)
        } else if len > self.position {
            FileChange::Modified
        } else {
            FileChange::Unchanged
        })
    }

    /// Read everything appended since the last call and decode the complete
    /// lines. Lines that fail to decode are logged and skipped.
    pub fn read_records(&mut self) -> Result<Vec<RawRecord>> {
        let mut appended = Vec::new();
        let n = self
            .file
            .read_to_end(&mut appended)
            .map_err(|e| BridgeError::io(&self.path, e))?;
        self.position += n as u64;

        let Some(buffer) = take_complete_lines(&mut self.race_buffer, &appended) else {
            if !self.race_buffer.is_empty() {
                debug!(
                    buffered = self.race_buffer.len(),
                    "partial line held until its newline arrives"
                );
            }
            return Ok(Vec::new());
        };

        Ok(buffer
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .filter_map(|line| match decode_line(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(
                        line = %String::from_utf8_lossy(line),
                        "could not parse tracking log line: {}",
                        e
                    );
                    None
                }
            })
            .collect())
    }
}

fn decode_line(line: &[u8]) -> std::result::Result<RawRecord, DecodeError> {
    let text = std::str::from_utf8(line).map_err(|_| DecodeError::Utf8)?;
    RawRecord::from_line(text)
}

/// Combine the race buffer with freshly appended bytes.
///
/// Returns the combined buffer when it ends on a newline (clearing the race
/// buffer). Otherwise the whole combination is kept as the new race buffer
/// and `None` is returned, as it is for an empty read.
pub fn take_complete_lines(race_buffer: &mut Vec<u8>, appended: &[u8]) -> Option<Vec<u8>> {
    race_buffer.extend_from_slice(appended);
    match race_buffer.last() {
        None => None,
        Some(b'\n') => Some(std::mem::take(race_buffer)),
        Some(_) => None,
    }
}
