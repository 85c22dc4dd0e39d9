// SPDX-FileCopyrightText: 2026 GSI Helmholtzzentrum f. Schwerionenforschung GmbH, Darmstadt, Germany
// SPDX-License-Identifier: LGPL-3.0-or-later

//! Cross-process mutual exclusion over a single shared lock file.
//!
//! Every cooperating process opens the same path and takes an advisory
//! `flock` on its own descriptor. Within one process the lock is re-entrant
//! per thread: a thread already holding it gets a nested [`LockHold`] without
//! touching the descriptor, and the descriptor is unlocked when the outermost
//! hold drops. Other threads of the same process wait like other processes do.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use fs2::FileExt;
use tracing::warn;

use crate::backoff::Backoff;
use crate::error::{QsubError, Result};

const FIRST_RETRY: Duration = Duration::from_millis(125);
const MAX_RETRY: Duration = Duration::from_secs(1);

/// Default cumulative wait before giving up, and before warning about a slow
/// acquisition that did eventually succeed.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Observers only; several processes may hold it at once.
    Shared,
    /// Required for every mutation of array state.
    Exclusive,
}

/// What to do when the cumulative wait reaches the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockPolicy {
    Fail,
    Skip,
}

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    /// `None` waits forever.
    pub timeout: Option<Duration>,
    pub warn_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_LOCK_TIMEOUT),
            warn_after: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

#[derive(Debug)]
struct Holder {
    owner: Option<ThreadId>,
    mode: LockMode,
    depth: usize,
}

#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: File,
    options: LockOptions,
    holder: Mutex<Holder>,
}

impl FileLock {
    /// Open (creating if needed) the lock file at `path`.
    pub fn open(path: impl Into<PathBuf>, options: LockOptions) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| QsubError::io(format!("creating {}", parent.display()), e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| QsubError::io(format!("opening lock file {}", path.display()), e))?;

        Ok(Self {
            path,
            file,
            options,
            holder: Mutex::new(Holder {
                owner: None,
                mode: LockMode::Exclusive,
                depth: 0,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held, failing with [`QsubError::LockTimeout`]
    /// once the configured timeout elapses.
    pub fn acquire(&self, mode: LockMode) -> Result<LockHold<'_>> {
        self.acquire_with(mode, LockPolicy::Fail)?
            .ok_or_else(|| QsubError::LockTimeout {
                path: self.path.clone(),
                waited: self.options.timeout.unwrap_or_default(),
            })
    }

    /// Best-effort exclusive hold for log output: after the timeout, give up
    /// and let the caller proceed unlocked.
    pub fn acquire_for_log(&self) -> Option<LockHold<'_>> {
        match self.acquire_with(LockMode::Exclusive, LockPolicy::Skip) {
            Ok(hold) => hold,
            Err(e) => {
                warn!("{}: {e}", whoami());
                None
            }
        }
    }

    /// True if the calling thread currently holds the lock.
    #[cfg(test)]
    pub fn is_held_by_current_thread(&self) -> bool {
        self.holder().owner == Some(thread::current().id())
    }

    fn acquire_with(&self, mode: LockMode, policy: LockPolicy) -> Result<Option<LockHold<'_>>> {
        let mut retry = Backoff::exponential(FIRST_RETRY, MAX_RETRY)
            .with_cap(self.options.timeout)
            .start();

        loop {
            if let Some(held) = self.try_enter(mode, policy)? {
                let waited = retry.waited();
                if waited >= self.options.warn_after {
                    warn!(
                        "{}: Waited {} seconds for lock file: {}",
                        whoami(),
                        waited.as_secs(),
                        self.path.display()
                    );
                }
                return Ok(Some(LockHold {
                    lock: self,
                    mode: held,
                    waited,
                }));
            }

            if retry.exhausted() {
                return match policy {
                    LockPolicy::Fail => Err(QsubError::LockTimeout {
                        path: self.path.clone(),
                        waited: retry.waited(),
                    }),
                    LockPolicy::Skip => {
                        warn!(
                            "{}: Timeout waiting {} seconds for lock file: {}",
                            whoami(),
                            retry.waited().as_secs(),
                            self.path.display()
                        );
                        Ok(None)
                    }
                };
            }
            retry.wait();
        }
    }

    /// One non-blocking attempt. Returns the mode actually held, which for a
    /// nested hold is the mode of the outermost one. A nested exclusive
    /// request under a shared hold is refused unless it is only for logging.
    fn try_enter(&self, mode: LockMode, policy: LockPolicy) -> Result<Option<LockMode>> {
        let me = thread::current().id();
        let mut holder = self.holder();
        match holder.owner {
            Some(owner) if owner == me => {
                if holder.mode == LockMode::Shared
                    && mode == LockMode::Exclusive
                    && policy == LockPolicy::Fail
                {
                    return Err(QsubError::LockUpgrade {
                        path: self.path.clone(),
                    });
                }
                holder.depth += 1;
                Ok(Some(holder.mode))
            }
            Some(_) => Ok(None),
            None => {
                let attempt = match mode {
                    LockMode::Shared => FileExt::try_lock_shared(&self.file),
                    LockMode::Exclusive => FileExt::try_lock_exclusive(&self.file),
                };
                match attempt {
                    Ok(()) => {
                        *holder = Holder {
                            owner: Some(me),
                            mode,
                            depth: 1,
                        };
                        Ok(Some(mode))
                    }
                    Err(e) if is_contended(&e) => Ok(None),
                    Err(e) => Err(QsubError::Lock {
                        path: self.path.clone(),
                        source: e,
                    }),
                }
            }
        }
    }

    fn release(&self) {
        let unlocked = {
            let mut holder = self.holder();
            holder.depth = holder.depth.saturating_sub(1);
            if holder.depth > 0 {
                return;
            }
            holder.owner = None;
            FileExt::unlock(&self.file)
        };
        // The holder mutex is released before logging: the log writer may
        // take this lock again.
        if let Err(e) = unlocked {
            warn!("{}: failed to unlock {}: {e}", whoami(), self.path.display());
        }
    }

    fn holder(&self) -> MutexGuard<'_, Holder> {
        self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// `pid @ host`, for lock diagnostics read across machines.
fn whoami() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{} @ {}", std::process::id(), host)
}

/// Scoped proof that the lock is held. Released on drop, so every exit path
/// of the holding scope (including `?` and panics) unlocks.
#[must_use = "the lock is released as soon as the hold is dropped"]
#[derive(Debug)]
pub struct LockHold<'a> {
    lock: &'a FileLock,
    mode: LockMode,
    waited: Duration,
}

impl LockHold<'_> {
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Time spent waiting before the lock was obtained.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

impl Drop for LockHold<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
