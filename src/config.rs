// SPDX-FileCopyrightText: 2026 GSI Helmholtzzentrum f. Schwerionenforschung GmbH, Darmstadt, Germany
// SPDX-License-Identifier: LGPL-3.0-or-later

//! Resolved run configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::array::Window;
use crate::lock::LockOptions;
use crate::sge::{CapacityProbe, SlotRequest, SlotSpec, SubmitOptions};

/// Overrides the default temporary directory.
pub const TMP_DIR_ENV: &str = "QSUB_TMP_DIR";
pub const DEFAULT_TMP_DIR: &str = ".qsub";

/// Set to `BATCH` by the grid engine inside jobs.
pub const ENVIRONMENT_ENV: &str = "ENVIRONMENT";

/// Name of the lock file inside the temporary directory.
pub const LOCK_FILE_NAME: &str = "lock";

/// True when running inside a grid engine job, where log output needs no
/// cross-process locking.
pub fn is_batch_mode() -> bool {
    std::env::var(ENVIRONMENT_ENV).is_ok_and(|v| v == "BATCH")
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Free-form identifier used in messages.
    pub job_id: String,
    pub verbose: bool,
    /// Absolute path of the shared state directory.
    pub tmp_dir: PathBuf,
    /// Directory the array tasks `cd` into.
    pub workdir: PathBuf,
    pub window: Window,
    /// Explicit slots; bypasses the capacity probe.
    pub slots: Option<SlotSpec>,
    pub request: SlotRequest,
    pub command: Vec<String>,
    pub lock: LockOptions,
    /// Give up waiting for the job after this long. `None` waits forever.
    pub completion_timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub submit: SubmitOptions,
    /// Variable exported with the slot count for fixed-size jobs.
    pub jobs_env: String,
    pub qhost: String,
    pub batch_mode: bool,
}

impl Settings {
    pub fn new(tmp_dir: PathBuf, command: Vec<String>) -> Self {
        let workdir = tmp_dir.clone();
        Self {
            job_id: "?".to_string(),
            verbose: false,
            tmp_dir,
            workdir,
            window: Window::default(),
            slots: None,
            request: SlotRequest::default(),
            command,
            lock: LockOptions::default(),
            completion_timeout: None,
            poll_interval: Duration::from_secs(1),
            submit: SubmitOptions::default(),
            jobs_env: "DYNAMAKE_JOBS".to_string(),
            qhost: "qhost".to_string(),
            batch_mode: false,
        }
    }

    pub fn lock_path(&self) -> PathBuf {
        self.tmp_dir.join(LOCK_FILE_NAME)
    }

    /// Extra `qsub` flags, if any were given.
    pub fn extra(&self) -> Option<&str> {
        self.submit.extra.as_deref().filter(|e| !e.trim().is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        if self.window.every == 0 {
            bail!("--every must be at least 1 second");
        }
        if let (Some(min), Some(max)) = (self.request.min_slots, self.request.max_slots) {
            if min > max {
                bail!("--min-slots {min} exceeds --max-slots {max}");
            }
        }
        if self.request.size == Some(0) {
            bail!("--size must be at least 1");
        }
        if self.jobs_env.is_empty()
            || !self
                .jobs_env
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            bail!("--jobs-env '{}' is not a shell variable name", self.jobs_env);
        }
        Ok(())
    }

    /// The slot spec for this submission: explicit, or computed from the
    /// batch size and the cluster's free capacity.
    pub fn slot_spec(&self, probe: &dyn CapacityProbe) -> crate::error::Result<SlotSpec> {
        match self.slots {
            Some(spec) => Ok(spec),
            None => self.request.resolve(probe),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QsubError;
    use crate::sge::qhost::ClusterCapacity;

    struct NoProbe;

    impl CapacityProbe for NoProbe {
        fn probe(&self) -> crate::error::Result<ClusterCapacity> {
            Err(QsubError::Probe {
                program: "qhost".to_string(),
                detail: "not expected".to_string(),
            })
        }
    }

    fn settings() -> Settings {
        Settings::new(PathBuf::from("/q"), vec!["true".to_string()])
    }

    #[test]
    fn test_defaults() {
        let settings = settings();
        assert_eq!(settings.lock_path(), PathBuf::from("/q/lock"));
        assert_eq!(settings.window, Window { every: 15, offset: 3 });
        assert_eq!(settings.extra(), None);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_explicit_slots_bypass_probe() {
        let mut settings = settings();
        settings.slots = Some(SlotSpec::Fixed(8));
        settings.request.size = Some(40);
        assert_eq!(settings.slot_spec(&NoProbe).unwrap(), SlotSpec::Fixed(8));
    }

    #[test]
    fn test_sized_request_probes() {
        let mut settings = settings();
        settings.request.size = Some(40);
        assert!(settings.slot_spec(&NoProbe).is_err());
    }

    #[test]
    fn test_validation() {
        let mut bad_bounds = settings();
        bad_bounds.request.min_slots = Some(8);
        bad_bounds.request.max_slots = Some(2);
        assert!(bad_bounds.validate().is_err());

        let mut bad_window = settings();
        bad_window.window.every = 0;
        assert!(bad_window.validate().is_err());

        let mut bad_env = settings();
        bad_env.jobs_env = "A B".to_string();
        assert!(bad_env.validate().is_err());

        let mut blank_extra = settings();
        blank_extra.submit.extra = Some("  ".to_string());
        assert_eq!(blank_extra.extra(), None);
    }
}
