// SPDX-FileCopyrightText: 2026 GSI Helmholtzzentrum f. Schwerionenforschung GmbH, Darmstadt, Germany
// SPDX-License-Identifier: LGPL-3.0-or-later

//! Find, join, close and tear down array jobs.
//!
//! Every operation takes a [`LockHold`] as proof that the caller holds the
//! shared lock file; mutations require it in exclusive mode.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::artifacts::{ArrayArtifact, ArrayJob};
use crate::error::{QsubError, Result};
use crate::lock::{LockHold, LockMode};
use crate::sge::SlotSpec;

/// Never join an array whose window closes in less than this many seconds.
pub const SAFETY_MARGIN_SECS: i64 = 3;

/// The aggregation window: arrays are grouped by
/// `floor((now - offset) / every)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub every: u32,
    pub offset: u32,
}

impl Default for Window {
    fn default() -> Self {
        Self {
            every: 15,
            offset: 3,
        }
    }
}

/// The open array chosen for a new member, and when its window ends (Unix
/// seconds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayTicket {
    pub array: ArrayJob,
    pub deadline: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    /// Task index assigned to the new member, starting at 1.
    pub ordinal: u32,
    /// The first member writes the array scripts and submits the array.
    pub is_master: bool,
}

/// One line of `qsubber --status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArraySummary {
    pub name: String,
    pub members: u32,
    pub closed: bool,
}

#[derive(Debug, Clone)]
pub struct ArrayRegistry {
    dir: PathBuf,
}

impl ArrayRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Pick the open array for the current window. Arrays about to close, or
    /// already closed, are skipped in favour of the next window.
    pub fn identify(
        &self,
        _hold: &LockHold<'_>,
        now: i64,
        window: &Window,
        slots: &SlotSpec,
        extra: Option<&str>,
    ) -> ArrayTicket {
        let every = i64::from(window.every.max(1));
        let offset = i64::from(window.offset);

        let mut id = (now - offset).div_euclid(every);
        let mut deadline = (id + 1) * every + offset;
        if deadline - now < SAFETY_MARGIN_SECS {
            id += 1;
            deadline += every;
        }

        loop {
            let array = ArrayJob::for_window(&self.dir, id, slots, extra);
            if !array.path(ArrayArtifact::Closed).exists() {
                debug!(array = array.name(), deadline, now, "identified array");
                return ArrayTicket { array, deadline };
            }
            id += 1;
            deadline += every;
        }
    }

    /// Add a member to `array`, creating the array if this is its first one.
    pub fn join(&self, hold: &LockHold<'_>, array: &ArrayJob) -> Result<Membership> {
        debug_assert_eq!(hold.mode(), LockMode::Exclusive);
        let count = read_count(&array.path(ArrayArtifact::Size))?.unwrap_or(0);
        let tasks = read_count(&array.path(ArrayArtifact::Tasks))?.unwrap_or(0);
        // Ordinals come from the high-water mark: a member that left early
        // keeps its task slot, so nobody is renumbered out of the range.
        let ordinal = tasks.max(count) + 1;
        write_count(&array.path(ArrayArtifact::Tasks), ordinal)?;
        write_count(&array.path(ArrayArtifact::Size), count + 1)?;
        Ok(Membership {
            ordinal,
            is_master: ordinal == 1,
        })
    }

    /// Mark `array` closed so that later callers pick the next window.
    pub fn close(&self, hold: &LockHold<'_>, array: &ArrayJob) -> Result<()> {
        debug_assert_eq!(hold.mode(), LockMode::Exclusive);
        let path = array.path(ArrayArtifact::Closed);
        fs::write(&path, "").map_err(|e| QsubError::io(format!("writing {}", path.display()), e))
    }

    /// Remove a member from `array`; the last one out deletes the array's
    /// files. Returns the number of members left. The task count is left
    /// alone.
    pub fn leave(&self, hold: &LockHold<'_>, array: &ArrayJob) -> Result<u32> {
        debug_assert_eq!(hold.mode(), LockMode::Exclusive);
        let size_path = array.path(ArrayArtifact::Size);
        let count = match read_count(&size_path)? {
            Some(count) if count > 0 => count,
            found => {
                return Err(QsubError::CorruptArray {
                    path: size_path,
                    detail: format!("leaving with member count {found:?}"),
                })
            }
        };

        let remaining = count - 1;
        if remaining == 0 {
            let removed = array.remove_files()?;
            debug!(array = array.name(), removed, "removed array");
        } else {
            write_count(&size_path, remaining)?;
        }
        Ok(remaining)
    }

    /// Current member count, `None` if the array does not exist.
    pub fn member_count(&self, _hold: &LockHold<'_>, array: &ArrayJob) -> Result<Option<u32>> {
        read_count(&array.path(ArrayArtifact::Size))
    }

    /// Every array present in the directory, by name.
    pub fn list(&self, hold: &LockHold<'_>) -> Result<Vec<ArraySummary>> {
        let suffix = format!(".array.{}", ArrayArtifact::Size.suffix());
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(QsubError::io(format!("listing {}", self.dir.display()), e)),
        };

        let mut summaries = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| QsubError::io(format!("listing {}", self.dir.display()), e))?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = file_name.strip_suffix(&suffix) else {
                continue;
            };
            let array = ArrayJob::new(self.dir.clone(), stem.to_string());
            let Some(members) = self.member_count(hold, &array)? else {
                continue;
            };
            summaries.push(ArraySummary {
                name: stem.to_string(),
                members,
                closed: array.path(ArrayArtifact::Closed).exists(),
            });
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }
}

fn read_count(path: &Path) -> Result<Option<u32>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(QsubError::io(format!("reading {}", path.display()), e)),
    };
    text.trim()
        .parse()
        .map(Some)
        .map_err(|_| QsubError::CorruptArray {
            path: path.to_path_buf(),
            detail: format!("member count '{}'", text.trim()),
        })
}

fn write_count(path: &Path, count: u32) -> Result<()> {
    fs::write(path, format!("{count}\n"))
        .map_err(|e| QsubError::io(format!("writing {}", path.display()), e))
}
