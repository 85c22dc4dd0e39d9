// SPDX-FileCopyrightText: 2026 GSI Helmholtzzentrum f. Schwerionenforschung GmbH, Darmstadt, Germany
// SPDX-License-Identifier: LGPL-3.0-or-later

//! Drives one command through an array: join, wait for the window to close,
//! submit (master only), wait for the task, report and clean up.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use crate::array::{
    ArrayJob, ArrayRegistry, ArraySummary, ArrayTicket, JobMember, JobStatus, MemberArtifact,
};
use crate::backoff::Backoff;
use crate::config::Settings;
use crate::error::{QsubError, Result};
use crate::lock::{FileLock, LockHold, LockMode};
use crate::sge::scripts::{submit_array, write_array_scripts};
use crate::sge::SlotSpec;

/// Members close the array this many seconds before its deadline.
const CLOSE_LEAD_SECS: i64 = 2;

/// Granularity of the window wait, so an interrupt is noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// A member of an array, from joining until it leaves.
#[derive(Debug, Clone)]
struct Enrollment {
    array: ArrayJob,
    deadline: i64,
    member: JobMember,
    is_master: bool,
}

/// Coordinator state. Each step performs the work of the state it is given
/// and returns the next one.
#[derive(Debug)]
enum Phase<'a> {
    Identifying,
    Joined {
        hold: LockHold<'a>,
        ticket: ArrayTicket,
    },
    WaitingWindow(Enrollment),
    Closed(Enrollment),
    Submitting(Enrollment),
    Polling(Enrollment),
    Reported {
        enrollment: Enrollment,
        status: JobStatus,
    },
    Cleaned {
        hold: LockHold<'a>,
        enrollment: Enrollment,
        status: JobStatus,
    },
    Done(JobStatus),
}

impl Phase<'_> {
    fn name(&self) -> &'static str {
        match self {
            Phase::Identifying => "identifying",
            Phase::Joined { .. } => "joined",
            Phase::WaitingWindow(_) => "waiting-window",
            Phase::Closed(_) => "closed",
            Phase::Submitting(_) => "submitting",
            Phase::Polling(_) => "polling",
            Phase::Reported { .. } => "reported",
            Phase::Cleaned { .. } => "cleaned",
            Phase::Done(_) => "done",
        }
    }
}

/// Everything one invocation needs, shared by all coordinator steps.
pub struct Qsubber {
    settings: Settings,
    slots: SlotSpec,
    lock: Arc<FileLock>,
    registry: ArrayRegistry,
    interrupted: Arc<AtomicBool>,
}

impl Qsubber {
    pub fn new(
        settings: Settings,
        slots: SlotSpec,
        lock: Arc<FileLock>,
        interrupted: Arc<AtomicBool>,
    ) -> Self {
        let registry = ArrayRegistry::new(settings.tmp_dir.clone());
        Self {
            settings,
            slots,
            lock,
            registry,
            interrupted,
        }
    }

    /// Run the command to completion and return its status.
    pub fn run(&self) -> Result<JobStatus> {
        let mut phase = Phase::Identifying;
        loop {
            debug!(phase = phase.name(), job = %self.settings.job_id, "coordinator step");
            phase = match phase {
                Phase::Done(status) => return Ok(status),
                phase => self.step(phase)?,
            };
        }
    }

    fn step<'a>(&'a self, phase: Phase<'a>) -> Result<Phase<'a>> {
        Ok(match phase {
            Phase::Identifying => {
                let hold = self.lock.acquire(LockMode::Exclusive)?;
                debug!(lock = %self.lock.path().display(), waited = ?hold.waited(), "lock acquired");
                let ticket = self.registry.identify(
                    &hold,
                    unix_now(),
                    &self.settings.window,
                    &self.slots,
                    self.settings.extra(),
                );
                Phase::Joined { hold, ticket }
            }
            Phase::Joined { hold, ticket } => {
                let enrollment = self.enroll(&hold, ticket)?;
                info!(
                    index = ?self.settings.request.index,
                    ordinal = enrollment.member.ordinal(),
                    slots = %self.slots,
                    "Submitted job: {} in: {}.*",
                    self.settings.job_id,
                    enrollment.member.prefix().display()
                );
                drop(hold);
                Phase::WaitingWindow(enrollment)
            }
            Phase::WaitingWindow(enrollment) => {
                self.wait_for_window(enrollment.deadline);
                Phase::Closed(enrollment)
            }
            Phase::Closed(enrollment) => {
                let hold = self.lock.acquire(LockMode::Exclusive)?;
                self.registry.close(&hold, &enrollment.array)?;
                drop(hold);
                if enrollment.is_master {
                    Phase::Submitting(enrollment)
                } else {
                    Phase::Polling(enrollment)
                }
            }
            Phase::Submitting(enrollment) => {
                submit_array(&enrollment.array);
                Phase::Polling(enrollment)
            }
            Phase::Polling(enrollment) => {
                let status = self.poll(&enrollment.member)?;
                Phase::Reported { enrollment, status }
            }
            Phase::Reported { enrollment, status } => {
                let hold = self.lock.acquire(LockMode::Exclusive)?;
                // Membership must still be released if the output is unreadable.
                if let Err(e) = self.report(&enrollment.member, status) {
                    warn!(member = %enrollment.member.prefix().display(), "failed to report output: {e}");
                }
                Phase::Cleaned {
                    hold,
                    enrollment,
                    status,
                }
            }
            Phase::Cleaned {
                hold,
                enrollment,
                status,
            } => {
                let left = self.registry.leave(&hold, &enrollment.array)?;
                debug!(array = enrollment.array.name(), left, "left array");
                if status.is_success() {
                    enrollment.member.remove_files()?;
                } else {
                    enrollment.member.remove_run_script()?;
                }
                drop(hold);
                Phase::Done(status)
            }
            Phase::Done(status) => Phase::Done(status),
        })
    }

    /// Join the ticket's array and write this member's scripts. A failed
    /// write takes the member back out so the count stays honest.
    fn enroll(&self, hold: &LockHold<'_>, ticket: ArrayTicket) -> Result<Enrollment> {
        let membership = self.registry.join(hold, &ticket.array)?;
        let member = ticket.array.member(membership.ordinal);

        if let Err(e) = self.write_scripts(&ticket.array, &member, membership.is_master) {
            if let Err(rollback) = self.registry.leave(hold, &ticket.array) {
                warn!(array = ticket.array.name(), "rollback failed: {rollback}");
            }
            if let Err(rollback) = member.remove_files() {
                warn!(member = %member.prefix().display(), "rollback failed: {rollback}");
            }
            return Err(e);
        }

        Ok(Enrollment {
            array: ticket.array,
            deadline: ticket.deadline,
            member,
            is_master: membership.is_master,
        })
    }

    fn write_scripts(&self, array: &ArrayJob, member: &JobMember, is_master: bool) -> Result<()> {
        member.write_run_script(&self.settings.command, &self.slots, &self.settings.jobs_env)?;
        if is_master {
            write_array_scripts(array, &self.settings.workdir, &self.slots, &self.settings.submit)?;
        }
        Ok(())
    }

    /// Sleep until shortly before `deadline`, or until interrupted.
    fn wait_for_window(&self, deadline: i64) {
        let left = deadline - unix_now() - CLOSE_LEAD_SECS;
        if left <= 0 {
            return;
        }
        let until = SystemTime::now() + Duration::from_secs(left.unsigned_abs());
        while !self.interrupted.load(Ordering::SeqCst) {
            match until.duration_since(SystemTime::now()) {
                Ok(rest) if !rest.is_zero() => thread::sleep(rest.min(WAIT_SLICE)),
                _ => break,
            }
        }
    }

    /// An interrupt or completion timeout reports the job as failed; its
    /// files stay behind for inspection.
    fn poll(&self, member: &JobMember) -> Result<JobStatus> {
        let poll = Backoff::fixed(self.settings.poll_interval).with_cap(self.settings.completion_timeout);
        match member.wait_for_completion(&poll, &self.interrupted) {
            Ok(status) => Ok(status),
            Err(e @ (QsubError::Interrupted { .. } | QsubError::CompletionTimeout { .. })) => {
                warn!("{e}");
                Ok(JobStatus::Failure)
            }
            Err(e) => Err(e),
        }
    }

    /// Print the command's output. Runs under the lock so the output of
    /// concurrent jobs does not interleave.
    fn report(&self, member: &JobMember, status: JobStatus) -> Result<()> {
        match member.read_output()? {
            Some(output) => {
                let output = output.trim_end_matches('\n');
                if !output.is_empty() {
                    eprintln!("{output}");
                }
            }
            None => warn!(member = %member.prefix().display(), "no output captured"),
        }

        if !status.is_success() && self.settings.verbose {
            error!(
                log = %member.path(MemberArtifact::Log).display(),
                "Failed job: {} in: {}.*",
                self.settings.job_id,
                member.prefix().display()
            );
        }
        Ok(())
    }
}

/// Summaries of the arrays currently in `registry`, read under a shared lock.
pub fn array_status(lock: &FileLock, registry: &ArrayRegistry) -> Result<Vec<ArraySummary>> {
    let hold = lock.acquire(LockMode::Shared)?;
    registry.list(&hold)
}

/// One `--status` line: the array prefix, its member count and whether it
/// has been closed.
pub fn describe(summary: &ArraySummary, dir: &Path) -> String {
    let mut line = format!(
        "{}.array members={}",
        dir.join(&summary.name).display(),
        summary.members
    );
    if summary.closed {
        line.push_str(" closed");
    }
    line
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Window;
    use crate::lock::LockOptions;
    use crate::sge::scripts::write_executable;
    use std::collections::BTreeSet;
    use std::fs;

    /// Stands in for `qsub -sync y`: runs every task of the array in turn.
    const FAKE_QSUB: &str = r#"#!/bin/sh
tasks=1
script=
while [ $# -gt 0 ]; do
    case "$1" in
        -t) tasks="${2#1-}"; shift 2 ;;
        -N|-j|-b|-o|-sync) shift 2 ;;
        -pe) shift 3 ;;
        *) script="$1"; shift ;;
    esac
done
i=1
while [ "$i" -le "$tasks" ]; do
    SGE_TASK_ID=$i "$script"
    i=$((i + 1))
done
"#;

    fn settings(dir: &Path, command: &[&str]) -> Settings {
        let qsub = dir.join("fake-qsub");
        write_executable(&qsub, FAKE_QSUB).unwrap();

        let tmp_dir = dir.join(".qsub");
        let mut settings = Settings::new(tmp_dir, command.iter().map(|s| s.to_string()).collect());
        settings.workdir = dir.to_path_buf();
        settings.window = Window { every: 1, offset: 0 };
        settings.poll_interval = Duration::from_millis(50);
        settings.completion_timeout = Some(Duration::from_secs(30));
        settings.submit.qsub = qsub.display().to_string();
        settings.submit.rc_file = None;
        settings.lock = LockOptions {
            timeout: Some(Duration::from_secs(30)),
            ..LockOptions::default()
        };
        settings
    }

    fn qsubber(settings: Settings) -> Qsubber {
        let lock = Arc::new(FileLock::open(settings.lock_path(), settings.lock).unwrap());
        Qsubber::new(settings, SlotSpec::Fixed(1), lock, Arc::new(AtomicBool::new(false)))
    }

    /// Join `array` directly, skipping window arithmetic.
    fn join<'a>(qsubber: &'a Qsubber, array: &ArrayJob) -> Phase<'a> {
        let hold = qsubber.lock.acquire(LockMode::Exclusive).unwrap();
        let ticket = ArrayTicket {
            array: array.clone(),
            deadline: 0,
        };
        qsubber.step(Phase::Joined { hold, ticket }).unwrap()
    }

    fn finish<'a>(qsubber: &'a Qsubber, mut phase: Phase<'a>) -> JobStatus {
        loop {
            phase = match phase {
                Phase::Done(status) => return status,
                phase => qsubber.step(phase).unwrap(),
            };
        }
    }

    fn file_names(dir: &Path) -> BTreeSet<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_success_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &["true"]);
        let tmp_dir = settings.tmp_dir.clone();

        let status = qsubber(settings).run().unwrap();
        assert_eq!(status, JobStatus::Success);
        assert_eq!(file_names(&tmp_dir), BTreeSet::from(["lock".to_string()]));
    }

    #[test]
    fn test_failure_keeps_member_files() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &["sh", "-c", "echo boom; exit 3"]);
        let tmp_dir = settings.tmp_dir.clone();

        let status = qsubber(settings).run().unwrap();
        assert_eq!(status, JobStatus::Failure);

        let names = file_names(&tmp_dir);
        assert!(names.iter().all(|n| !n.contains(".array.")), "{names:?}");
        let failure = names.iter().find(|n| n.ends_with(".failure")).unwrap();
        assert!(names.iter().all(|n| !n.ends_with(".success")));

        let stem = failure.trim_end_matches(".failure");
        let output = fs::read_to_string(tmp_dir.join(format!("{stem}.output"))).unwrap();
        assert!(output.contains("boom"));
        assert_eq!(
            names,
            BTreeSet::from([
                "lock".to_string(),
                format!("{stem}.failure"),
                format!("{stem}.output"),
            ])
        );
    }

    #[test]
    fn test_command_sees_working_directory_and_slots() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("pwd > {} && echo $DYNAMAKE_JOBS >> {}", marker.display(), marker.display());
        let settings = settings(dir.path(), &["sh", "-c", &script]);

        assert_eq!(qsubber(settings).run().unwrap(), JobStatus::Success);
        let lines = fs::read_to_string(&marker).unwrap();
        let mut lines = lines.lines();
        assert_eq!(
            fs::canonicalize(lines.next().unwrap()).unwrap(),
            fs::canonicalize(dir.path()).unwrap()
        );
        assert_eq!(lines.next(), Some("1"));
    }

    #[test]
    fn test_concurrent_members() {
        let dir = tempfile::tempdir().unwrap();
        // Written up front: rewriting the fake qsub while another thread runs
        // it fails with ETXTBSY.
        let all: Vec<Settings> = (0..3).map(|_| settings(dir.path(), &["true"])).collect();
        let handles: Vec<_> = all
            .into_iter()
            .map(|settings| thread::spawn(move || qsubber(settings).run().unwrap()))
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), JobStatus::Success);
        }
        assert_eq!(
            file_names(&dir.path().join(".qsub")),
            BTreeSet::from(["lock".to_string()])
        );
    }

    #[test]
    fn test_interrupted_member_fails_and_leaves() {
        let dir = tempfile::tempdir().unwrap();
        // A qsub that never runs anything: the member would wait forever.
        let mut settings = settings(dir.path(), &["true"]);
        let noop = dir.path().join("noop-qsub");
        write_executable(&noop, "#!/bin/sh\nexit 0\n").unwrap();
        settings.submit.qsub = noop.display().to_string();
        settings.completion_timeout = None;
        let tmp_dir = settings.tmp_dir.clone();

        let lock = Arc::new(FileLock::open(settings.lock_path(), settings.lock).unwrap());
        let interrupted = Arc::new(AtomicBool::new(false));
        let qsubber = Qsubber::new(settings, SlotSpec::Fixed(1), lock, interrupted.clone());

        let flag = interrupted.clone();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(qsubber.run().unwrap(), JobStatus::Failure);
        trigger.join().unwrap();

        let names = file_names(&tmp_dir);
        assert_eq!(names, BTreeSet::from(["lock".to_string()]));
    }

    #[test]
    fn test_early_leaver_does_not_strand_later_members() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("third-ran");
        let third_cmd = format!("touch {}", marker.display());

        let master = qsubber(settings(dir.path(), &["true"]));
        let leaver = qsubber(settings(dir.path(), &["true"]));
        let third = qsubber(settings(dir.path(), &["sh", "-c", &third_cmd]));
        let tmp_dir = master.settings.tmp_dir.clone();
        let array = ArrayJob::for_window(&tmp_dir, 7, &SlotSpec::Fixed(1), None);

        let master_phase = join(&master, &array);
        let leaver_phase = join(&leaver, &array);
        let third_phase = join(&third, &array);

        // The second member gives up while the window is still open.
        leaver.interrupted.store(true, Ordering::SeqCst);
        assert_eq!(finish(&leaver, leaver_phase), JobStatus::Failure);

        assert_eq!(finish(&master, master_phase), JobStatus::Success);
        assert_eq!(finish(&third, third_phase), JobStatus::Success);
        assert!(marker.exists());
        assert_eq!(file_names(&tmp_dir), BTreeSet::from(["lock".to_string()]));
    }

    #[test]
    fn test_unreadable_output_still_leaves_array() {
        let dir = tempfile::tempdir().unwrap();
        let qsubber = qsubber(settings(dir.path(), &["true"]));
        let tmp_dir = qsubber.settings.tmp_dir.clone();
        let array = ArrayJob::for_window(&tmp_dir, 7, &SlotSpec::Fixed(1), None);

        // A directory where the output file belongs cannot be read back.
        fs::create_dir_all(array.member(1).path(MemberArtifact::Output)).unwrap();

        let phase = join(&qsubber, &array);
        assert_eq!(finish(&qsubber, phase), JobStatus::Failure);

        let names = file_names(&tmp_dir);
        assert!(names.iter().all(|n| !n.contains(".array.")), "{names:?}");
        assert!(names.contains("a7.s1.i1.failure"), "{names:?}");
    }

    #[test]
    fn test_status_lists_open_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::open(dir.path().join("lock"), LockOptions::default()).unwrap();
        let registry = ArrayRegistry::new(dir.path());
        let array = {
            let hold = lock.acquire(LockMode::Exclusive).unwrap();
            let ticket = registry.identify(&hold, 1_000, &Window::default(), &SlotSpec::Fixed(2), None);
            registry.join(&hold, &ticket.array).unwrap();
            ticket.array
        };

        let summaries = array_status(&lock, &registry).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].name, array.name());
        assert_eq!(summaries[0].members, 1);
        let line = describe(&summaries[0], dir.path());
        assert!(line.ends_with("members=1"), "{line}");
    }
}
