// SPDX-FileCopyrightText: 2026 GSI Helmholtzzentrum f. Schwerionenforschung GmbH, Darmstadt, Germany
// SPDX-License-Identifier: LGPL-3.0-or-later

//! One job's slice of an array job.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use super::artifacts::{remove_artifacts, MemberArtifact};
use crate::backoff::Backoff;
use crate::error::{QsubError, Result};
use crate::sge::scripts::{quote, quote_path, write_executable};
use crate::sge::SlotSpec;

/// Final outcome of a member's command, as reported by its sentinel file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Success,
    Failure,
}

impl JobStatus {
    /// Process exit code reported for this status.
    pub fn exit_code(self) -> u8 {
        match self {
            JobStatus::Success => 0,
            JobStatus::Failure => 1,
        }
    }

    pub fn is_success(self) -> bool {
        self == JobStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMember {
    dir: PathBuf,
    stem: String,
    ordinal: u32,
}

impl JobMember {
    pub(crate) fn new(dir: PathBuf, stem: String, ordinal: u32) -> Self {
        Self { dir, stem, ordinal }
    }

    /// Task index of this member within its array, starting at 1.
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Common prefix of this member's files, for messages.
    pub fn prefix(&self) -> PathBuf {
        self.dir.join(&self.stem)
    }

    pub fn path(&self, artifact: MemberArtifact) -> PathBuf {
        self.dir.join(format!("{}.{}", self.stem, artifact.suffix()))
    }

    pub fn render_run_script(&self, command: &[String], slots: &SlotSpec, jobs_env: &str) -> String {
        let run_path = self.path(MemberArtifact::RunScript);
        let mut script = String::from("#!/bin/sh\n");
        if let Some(n) = slots.fixed() {
            let _ = writeln!(script, "export {jobs_env}='{n}'");
        }
        let _ = writeln!(
            script,
            "echo `date +'%F %T.%N' | sed 's/......$//'` - qsubber - Running {} on `hostname` using {slots} slots",
            quote_path(&run_path)
        );
        let words: Vec<String> = command.iter().map(|word| quote(word)).collect();
        script.push_str(&words.join(" "));
        script.push('\n');
        script
    }

    /// Write the executable wrapper around the user's command line.
    pub fn write_run_script(&self, command: &[String], slots: &SlotSpec, jobs_env: &str) -> Result<PathBuf> {
        let path = self.path(MemberArtifact::RunScript);
        write_executable(&path, &self.render_run_script(command, slots, jobs_env))?;
        Ok(path)
    }

    /// Check the sentinels once.
    pub fn status(&self) -> Option<JobStatus> {
        if self.path(MemberArtifact::Success).exists() {
            Some(JobStatus::Success)
        } else if self.path(MemberArtifact::Failure).exists() {
            Some(JobStatus::Failure)
        } else {
            None
        }
    }

    /// Poll until a sentinel appears. Without a cap on `poll` this waits as
    /// long as the grid engine takes; `interrupted` ends the wait early.
    pub fn wait_for_completion(&self, poll: &Backoff, interrupted: &AtomicBool) -> Result<JobStatus> {
        let mut retry = poll.start();
        loop {
            if let Some(status) = self.status() {
                debug!(member = %self.prefix().display(), ?status, waited = ?retry.waited(), "job completed");
                return Ok(status);
            }
            if interrupted.load(Ordering::SeqCst) {
                return Err(QsubError::Interrupted {
                    prefix: self.prefix(),
                });
            }
            if retry.exhausted() {
                return Err(QsubError::CompletionTimeout {
                    prefix: self.prefix(),
                    waited: retry.waited(),
                });
            }
            retry.wait();
        }
    }

    /// Captured output of the command, `None` if the task never ran.
    pub fn read_output(&self) -> Result<Option<String>> {
        let path = self.path(MemberArtifact::Output);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(QsubError::io(format!("reading {}", path.display()), e)),
        }
    }

    /// Delete the wrapper script of a finished job. Its output and sentinel
    /// stay behind.
    pub fn remove_run_script(&self) -> Result<()> {
        let path = self.path(MemberArtifact::RunScript);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QsubError::io(format!("removing {}", path.display()), e)),
        }
    }

    pub fn remove_files(&self) -> Result<usize> {
        remove_artifacts(&self.dir, &self.stem)
    }
}
