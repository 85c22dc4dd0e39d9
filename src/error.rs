// SPDX-FileCopyrightText: 2026 GSI Helmholtzzentrum f. Schwerionenforschung GmbH, Darmstadt, Germany
// SPDX-License-Identifier: LGPL-3.0-or-later

//! Error taxonomy shared by the lock, the registry and the coordinator.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QsubError {
    #[error("timeout waiting {} seconds for lock file: {}", .waited.as_secs(), .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("failed to lock {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot lock {} exclusively while holding it shared", .path.display())]
    LockUpgrade { path: PathBuf },

    #[error("failed to run {program}: {detail}")]
    Probe { program: String, detail: String },

    #[error("unparsable {program} line '{line}'")]
    ProbeParse { program: String, line: String },

    #[error("corrupt array state in {}: {detail}", .path.display())]
    CorruptArray { path: PathBuf, detail: String },

    #[error("gave up after {} seconds waiting for {}.*", .waited.as_secs(), .prefix.display())]
    CompletionTimeout { prefix: PathBuf, waited: Duration },

    #[error("interrupted while waiting for {}.*", .prefix.display())]
    Interrupted { prefix: PathBuf },

    #[error("invalid slot specification '{0}'")]
    InvalidSlots(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl QsubError {
    /// Wrap an I/O error with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, QsubError>;
