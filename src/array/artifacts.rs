// SPDX-FileCopyrightText: 2026 GSI Helmholtzzentrum f. Schwerionenforschung GmbH, Darmstadt, Germany
// SPDX-License-Identifier: LGPL-3.0-or-later

//! Artifact naming for arrays and their members.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::member::JobMember;
use crate::error::{QsubError, Result};
use crate::sge::SlotSpec;

/// Array ids wrap around to keep file and job names short.
const ARRAY_ID_WRAP: i64 = 10_000;

/// Files belonging to an array as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayArtifact {
    /// Current member count, as text.
    Size,
    /// Highest ordinal ever handed out. Never decreases, so it is the task
    /// range to submit even after members have left.
    Tasks,
    /// Sentinel: the array accepts no more members.
    Closed,
    /// Run by the grid engine once per task.
    RunScript,
    /// Calls `qsub` for the whole array.
    SubmitScript,
    /// Output of the `qsub` call itself.
    Log,
}

impl ArrayArtifact {
    pub fn suffix(self) -> &'static str {
        match self {
            ArrayArtifact::Size => "size",
            ArrayArtifact::Tasks => "tasks",
            ArrayArtifact::Closed => "closed",
            ArrayArtifact::RunScript => "run.sh",
            ArrayArtifact::SubmitScript => "submit.sh",
            ArrayArtifact::Log => "log",
        }
    }
}

/// Files belonging to one member of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberArtifact {
    /// Wraps the user's command.
    RunScript,
    /// Captured stdout and stderr of the command.
    Output,
    /// Sentinel: the command exited with status 0.
    Success,
    /// Sentinel: the command failed.
    Failure,
    /// Grid engine log of the task.
    Log,
}

impl MemberArtifact {
    pub fn suffix(self) -> &'static str {
        match self {
            MemberArtifact::RunScript => "run.sh",
            MemberArtifact::Output => "output",
            MemberArtifact::Success => "success",
            MemberArtifact::Failure => "failure",
            MemberArtifact::Log => "log",
        }
    }
}

/// The array job for one aggregation window, slot spec and set of extra
/// flags. Only names paths; the registry decides what exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayJob {
    dir: PathBuf,
    stem: String,
}

impl ArrayJob {
    pub fn new(dir: PathBuf, stem: String) -> Self {
        Self { dir, stem }
    }

    /// Name the array of window `id`.
    pub fn for_window(dir: &Path, id: i64, slots: &SlotSpec, extra: Option<&str>) -> Self {
        let mut stem = format!("a{}.s{}", id.rem_euclid(ARRAY_ID_WRAP), slots);
        if let Some(extra) = extra.filter(|e| !e.is_empty()) {
            stem.push('.');
            stem.push_str(&flags_hash(extra));
        }
        Self::new(dir.to_path_buf(), stem)
    }

    /// Job name passed to `qsub -N`.
    pub fn name(&self) -> &str {
        &self.stem
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Common prefix of all array-level files, for messages.
    pub fn prefix(&self) -> PathBuf {
        self.dir.join(format!("{}.array", self.stem))
    }

    pub fn path(&self, artifact: ArrayArtifact) -> PathBuf {
        self.dir
            .join(format!("{}.array.{}", self.stem, artifact.suffix()))
    }

    /// File stem of the member whose ordinal is `task` (a number or a shell
    /// variable reference).
    pub fn member_stem(&self, task: &str) -> String {
        format!("{}.i{}", self.stem, task)
    }

    pub fn member(&self, ordinal: u32) -> JobMember {
        JobMember::new(self.dir.clone(), self.member_stem(&ordinal.to_string()), ordinal)
    }

    /// Delete every array-level file, leaving member files alone.
    pub fn remove_files(&self) -> Result<usize> {
        remove_artifacts(&self.dir, &format!("{}.array", self.stem))
    }
}

/// Short, stable digest of the extra `qsub` flags so that arrays with
/// different flags never merge.
fn flags_hash(extra: &str) -> String {
    Sha256::digest(extra.as_bytes())[..4]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Remove every file in `dir` named `<stem>.<anything>`.
pub(crate) fn remove_artifacts(dir: &Path, stem: &str) -> Result<usize> {
    let prefix = format!("{stem}.");
    let entries =
        fs::read_dir(dir).map_err(|e| QsubError::io(format!("listing {}", dir.display()), e))?;

    let mut removed = 0;
    for entry in entries {
        let entry = entry.map_err(|e| QsubError::io(format!("listing {}", dir.display()), e))?;
        if !entry.file_name().to_string_lossy().starts_with(&prefix) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(QsubError::io(
                    format!("removing {}", entry.path().display()),
                    e,
                ))
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_naming() {
        let dir = Path::new("/q");
        let array = ArrayJob::for_window(dir, 123_456, &SlotSpec::Fixed(4), None);
        assert_eq!(array.name(), "a3456.s4");
        assert_eq!(array.prefix(), PathBuf::from("/q/a3456.s4.array"));
        assert_eq!(array.path(ArrayArtifact::Size), PathBuf::from("/q/a3456.s4.array.size"));

        let range = SlotSpec::Range { min: 2, max: None };
        assert_eq!(ArrayJob::for_window(dir, 7, &range, Some("")).name(), "a7.s2-");
    }

    #[test]
    fn test_extra_flags_separate_arrays() {
        let dir = Path::new("/q");
        let slots = SlotSpec::Fixed(1);
        let a = ArrayJob::for_window(dir, 7, &slots, Some("-l h_vmem=4G"));
        let b = ArrayJob::for_window(dir, 7, &slots, Some("-l h_vmem=8G"));
        assert_ne!(a, b);
        assert_eq!(a, ArrayJob::for_window(dir, 7, &slots, Some("-l h_vmem=4G")));

        let hash = a.name().strip_prefix("a7.s1.").unwrap();
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_member_paths() {
        let array = ArrayJob::new(PathBuf::from("/q"), "a1.s4".to_string());
        let member = array.member(3);
        assert_eq!(member.ordinal(), 3);
        assert_eq!(member.path(MemberArtifact::Output), PathBuf::from("/q/a1.s4.i3.output"));
        assert_eq!(array.member_stem("${SGE_TASK_ID}"), "a1.s4.i${SGE_TASK_ID}");
    }

    #[test]
    fn test_remove_artifacts_matches_whole_stem() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a1.s4.i1.output", "a1.s4.i1.run.sh", "a1.s4.i10.output", "a1.s4.array.size"] {
            fs::write(dir.path().join(name), "").unwrap();
        }

        assert_eq!(remove_artifacts(dir.path(), "a1.s4.i1").unwrap(), 2);
        assert!(dir.path().join("a1.s4.i10.output").exists());
        assert!(dir.path().join("a1.s4.array.size").exists());
    }
}
