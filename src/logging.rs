// SPDX-FileCopyrightText: 2026 GSI Helmholtzzentrum f. Schwerionenforschung GmbH, Darmstadt, Germany
// SPDX-License-Identifier: LGPL-3.0-or-later

//! Log output that does not interleave across processes.
//!
//! Every event is written to stderr while holding the shared lock file, so
//! messages from concurrent qsubber invocations (and from programs sharing
//! the same lock) come out whole. Locking is best effort: after the lock
//! timeout the line is written anyway.

use std::cell::Cell;
use std::io::{self, Write};
use std::sync::Arc;

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::lock::{FileLock, LockHold};

thread_local! {
    /// Set while this thread is inside a log write; events raised while
    /// acquiring the lock for that write go out unlocked.
    static IN_WRITER: Cell<bool> = const { Cell::new(false) };
}

/// Install the global subscriber. `RUST_LOG` overrides the verbosity flag.
pub fn init(verbose: bool, lock: Option<Arc<FileLock>>) {
    let default_level = if verbose { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(LockedStderr::new(lock))
        .init();
}

/// `MakeWriter` producing stderr writers that hold the lock file.
#[derive(Debug, Clone)]
pub struct LockedStderr {
    lock: Option<Arc<FileLock>>,
}

impl LockedStderr {
    pub fn new(lock: Option<Arc<FileLock>>) -> Self {
        Self { lock }
    }
}

impl<'a> MakeWriter<'a> for LockedStderr {
    type Writer = LockedWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        let nested = IN_WRITER.with(|flag| flag.replace(true));
        let hold = if nested {
            None
        } else {
            self.lock.as_deref().and_then(FileLock::acquire_for_log)
        };
        LockedWriter {
            _hold: hold,
            nested,
        }
    }
}

pub struct LockedWriter<'a> {
    _hold: Option<LockHold<'a>>,
    nested: bool,
}

impl Write for LockedWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::stderr().write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

impl Drop for LockedWriter<'_> {
    fn drop(&mut self) {
        if !self.nested {
            IN_WRITER.with(|flag| flag.set(false));
        }
    }
}
