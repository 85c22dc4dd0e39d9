// SPDX-FileCopyrightText: 2026 GSI Helmholtzzentrum f. Schwerionenforschung GmbH, Darmstadt, Germany
// SPDX-License-Identifier: LGPL-3.0-or-later

//! Generated shell scripts: the hand-off between qsubber and `qsub`.
//!
//! The array run script is executed by the grid engine once per task and
//! dispatches to the member run script selected by `$SGE_TASK_ID`, leaving a
//! success or failure sentinel behind. The submit script calls `qsub`
//! synchronously for the whole array.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;

use tracing::{debug, info, warn};

use super::slots::SlotSpec;
use crate::array::{ArrayArtifact, ArrayJob};
use crate::error::{QsubError, Result};

/// How the array is handed to the grid engine.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// The `qsub` binary.
    pub qsub: String,
    /// Raw low-level flags, inserted unquoted.
    pub extra: Option<String>,
    /// Parallel environment used for multi-slot jobs.
    pub parallel_env: String,
    /// Shell startup file sourced by each task, if it exists.
    pub rc_file: Option<String>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            qsub: "qsub".to_string(),
            extra: None,
            parallel_env: "threads".to_string(),
            rc_file: Some("~/.bashrc".to_string()),
        }
    }
}

/// Quote one word for `/bin/sh`.
pub fn quote(word: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(word)).into_owned()
}

pub fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

/// Write `contents` to `path` and make it executable by its owner.
pub fn write_executable(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).map_err(|e| QsubError::io(format!("writing {}", path.display()), e))?;
    let mut perms = fs::metadata(path)
        .map_err(|e| QsubError::io(format!("reading {}", path.display()), e))?
        .permissions();
    perms.set_mode(perms.mode() | 0o100);
    fs::set_permissions(path, perms)
        .map_err(|e| QsubError::io(format!("chmod {}", path.display()), e))
}

/// Quote a path, keeping a leading `~/` expandable as `$HOME`.
fn home_path(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => format!("\"$HOME\"/{}", quote(rest)),
        None if path == "~" => "\"$HOME\"".to_string(),
        None => quote(path),
    }
}

pub fn render_array_run_script(array: &ArrayJob, workdir: &Path, rc_file: Option<&str>) -> String {
    let task = format!(
        "{}/{}",
        quote_path(array.dir()),
        array.member_stem("${SGE_TASK_ID}")
    );

    let mut script = String::from("#!/bin/sh\n");
    if let Some(rc) = rc_file {
        let rc = home_path(rc);
        let _ = writeln!(script, "if [ -f {rc} ]; then . {rc}; fi");
    }
    let _ = writeln!(script, "cd {}", quote_path(workdir));
    // Members that left before their task ran have removed their script.
    let _ = writeln!(script, "[ -f {task}.run.sh ] || exit 0");
    let _ = writeln!(script, "if {task}.run.sh > {task}.output 2>&1");
    script.push_str("then\n");
    let _ = writeln!(script, "    touch {task}.success");
    script.push_str("else\n");
    let _ = writeln!(script, "    touch {task}.failure");
    script.push_str("fi\n");
    script
}

pub fn render_array_submit_script(array: &ArrayJob, slots: &SlotSpec, options: &SubmitOptions) -> String {
    let mut command = quote(&options.qsub);
    if let Some(extra) = options.extra.as_deref().filter(|e| !e.trim().is_empty()) {
        let _ = write!(command, " {}", extra.trim());
    }
    let _ = write!(command, " -N {}", array.name());
    let _ = write!(
        command,
        " -t 1-`cat {}`",
        quote_path(&array.path(ArrayArtifact::Tasks))
    );
    command.push_str(" -j y -b y");
    // $TASK_ID is expanded by the grid engine, not by the shell.
    let _ = write!(
        command,
        " -o {}/{}'$TASK_ID'.log",
        quote_path(array.dir()),
        array.member_stem("")
    );
    command.push_str(" -sync y");
    if !slots.is_single() {
        let _ = write!(command, " -pe {} {slots}", quote(&options.parallel_env));
    }
    let _ = write!(
        command,
        " {} > {} 2>&1",
        quote_path(&array.path(ArrayArtifact::RunScript)),
        quote_path(&array.path(ArrayArtifact::Log))
    );

    format!("#!/bin/sh\n{command}\n")
}

/// Write the array run and submit scripts. Called by the array master only.
pub fn write_array_scripts(
    array: &ArrayJob,
    workdir: &Path,
    slots: &SlotSpec,
    options: &SubmitOptions,
) -> Result<()> {
    write_executable(
        &array.path(ArrayArtifact::RunScript),
        &render_array_run_script(array, workdir, options.rc_file.as_deref()),
    )?;
    write_executable(
        &array.path(ArrayArtifact::SubmitScript),
        &render_array_submit_script(array, slots, options),
    )
}

/// Run the submit script. Its outcome is not reported further: every member
/// learns its own status from its sentinel files.
pub fn submit_array(array: &ArrayJob) {
    let script = array.path(ArrayArtifact::SubmitScript);
    info!(array = %array.prefix().display(), "Submitted array");

    match Command::new(&script).status() {
        Ok(status) if status.success() => debug!(array = array.name(), "qsub returned"),
        Ok(status) => debug!(array = array.name(), %status, "qsub returned non-zero"),
        Err(e) => warn!(script = %script.display(), "failed to run submit script: {e}"),
    }
}
