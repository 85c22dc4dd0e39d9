// SPDX-FileCopyrightText: 2026 GSI Helmholtzzentrum f. Schwerionenforschung GmbH, Darmstadt, Germany
// SPDX-License-Identifier: LGPL-3.0-or-later

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

mod array;
mod backoff;
mod config;
mod error;
mod lock;
mod logging;
mod qsubber;
mod sge;

use array::{ArrayRegistry, JobStatus};
use config::Settings;
use lock::{FileLock, LockOptions};
use qsubber::Qsubber;
use sge::{Qhost, SlotRequest, SlotSpec, SubmitOptions};

/// Exit status for failures of qsubber itself, as opposed to the job.
const SETUP_FAILURE: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "qsubber")]
#[command(about = "Run commands on Sun Grid Engine, batched into time-windowed array jobs")]
#[command(version)]
struct Args {
    /// Log job submission and failures
    #[arg(short, long)]
    verbose: bool,

    /// Identifier used in log messages
    #[arg(short, long, default_value = "?")]
    job_id: String,

    /// Slots per job: N, N- or N-M (skips the capacity probe)
    #[arg(short, long)]
    slots: Option<SlotSpec>,

    /// Number of jobs in the batch this one belongs to
    #[arg(short = 'S', long, value_parser = clap::value_parser!(u32).range(1..))]
    size: Option<u32>,

    /// Index of this job within the batch
    #[arg(short = 'I', long)]
    index: Option<u32>,

    /// Minimum slots per job
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
    min_slots: Option<u32>,

    /// Maximum slots per job
    #[arg(short = 'M', long, value_parser = clap::value_parser!(u32).range(1..))]
    max_slots: Option<u32>,

    /// Length of the array window in seconds
    #[arg(short, long, default_value_t = 15)]
    every: u32,

    /// Offset of the array windows in seconds
    #[arg(short, long, default_value_t = 3)]
    offset: u32,

    /// Extra qsub flags, passed through unquoted
    #[arg(short = 'x', long, allow_hyphen_values = true)]
    extra: Option<String>,

    /// Directory holding the shared array state
    #[arg(short, long, env = config::TMP_DIR_ENV, default_value = config::DEFAULT_TMP_DIR)]
    tmp_dir: PathBuf,

    /// Seconds to wait for the lock file (0 waits forever)
    #[arg(long, default_value_t = 60)]
    lock_timeout: u64,

    /// Seconds to wait for the job to finish (default: forever)
    #[arg(long)]
    completion_timeout: Option<u64>,

    /// The qsub program
    #[arg(long, default_value = "qsub")]
    qsub: String,

    /// The qhost program
    #[arg(long, default_value = "qhost")]
    qhost: String,

    /// Parallel environment for multi-slot jobs
    #[arg(long, default_value = "threads")]
    parallel_env: String,

    /// Variable exported with the slot count of fixed-size jobs
    #[arg(long, default_value = "DYNAMAKE_JOBS")]
    jobs_env: String,

    /// Startup file sourced by every task (empty to disable)
    #[arg(long, default_value = "~/.bashrc")]
    rc_file: String,

    /// List the arrays in the temporary directory and exit
    #[arg(long)]
    status: bool,

    /// The command to run, with its arguments
    #[arg(
        required_unless_present = "status",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<String>,
}

impl Args {
    fn into_settings(self) -> Result<Settings> {
        let tmp_dir = if self.tmp_dir.is_absolute() {
            self.tmp_dir
        } else {
            std::env::current_dir()
                .context("failed to read the working directory")?
                .join(self.tmp_dir)
        };
        let workdir = std::env::current_dir().context("failed to read the working directory")?;

        let lock = LockOptions {
            timeout: (self.lock_timeout > 0).then(|| Duration::from_secs(self.lock_timeout)),
            ..LockOptions::default()
        };

        let mut settings = Settings::new(tmp_dir, self.command);
        settings.job_id = self.job_id;
        settings.verbose = self.verbose;
        settings.workdir = workdir;
        settings.window = array::Window {
            every: self.every,
            offset: self.offset,
        };
        settings.slots = self.slots;
        settings.request = SlotRequest {
            index: self.index,
            size: self.size,
            min_slots: self.min_slots,
            max_slots: self.max_slots,
        };
        settings.lock = lock;
        settings.completion_timeout = self.completion_timeout.map(Duration::from_secs);
        settings.submit = SubmitOptions {
            qsub: self.qsub,
            extra: self.extra,
            parallel_env: self.parallel_env,
            rc_file: Some(self.rc_file).filter(|rc| !rc.is_empty()),
        };
        settings.jobs_env = self.jobs_env;
        settings.qhost = self.qhost;
        settings.batch_mode = config::is_batch_mode();

        settings.validate()?;
        Ok(settings)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    match run(args) {
        Ok(status) => ExitCode::from(status.exit_code()),
        Err(e) => {
            eprintln!("qsubber: {e:#}");
            ExitCode::from(SETUP_FAILURE)
        }
    }
}

fn run(args: Args) -> Result<JobStatus> {
    let status_only = args.status;
    let settings = args.into_settings()?;

    let lock = Arc::new(FileLock::open(settings.lock_path(), settings.lock)?);
    let log_lock = (!settings.batch_mode).then(|| lock.clone());
    logging::init(settings.verbose, log_lock);

    if status_only {
        let registry = ArrayRegistry::new(settings.tmp_dir.clone());
        for summary in qsubber::array_status(&lock, &registry)? {
            println!("{}", qsubber::describe(&summary, registry.dir()));
        }
        return Ok(JobStatus::Success);
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_clone = interrupted.clone();

    // Stop waiting on SIGINT/SIGTERM; the job still leaves its array.
    ctrlc::set_handler(move || {
        interrupted_clone.store(true, Ordering::SeqCst);
    })
    .ok();

    let slots = settings
        .slot_spec(&Qhost::new(settings.qhost.clone()))
        .context("failed to choose the number of slots")?;
    let qsubber = Qsubber::new(settings, slots, lock, interrupted);
    Ok(qsubber.run()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("qsubber").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["make", "all"]);
        assert_eq!(args.command, vec!["make", "all"]);
        assert_eq!(args.job_id, "?");
        assert_eq!(args.every, 15);
        assert_eq!(args.offset, 3);
        assert_eq!(args.lock_timeout, 60);
        assert!(args.slots.is_none());

        let settings = args.into_settings().unwrap();
        assert!(settings.tmp_dir.is_absolute());
        assert!(settings.tmp_dir.ends_with(".qsub") || std::env::var(config::TMP_DIR_ENV).is_ok());
        assert_eq!(settings.submit.rc_file.as_deref(), Some("~/.bashrc"));
        assert_eq!(settings.lock.timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_command_keeps_its_flags() {
        let args = parse(&["-s", "4", "-x", "-l h_vmem=4G", "make", "-j", "4"]);
        assert_eq!(args.slots, Some(SlotSpec::Fixed(4)));
        assert_eq!(args.extra.as_deref(), Some("-l h_vmem=4G"));
        assert_eq!(args.command, vec!["make", "-j", "4"]);
    }

    #[test]
    fn test_slot_ranges() {
        let args = parse(&["-s", "2-8", "true"]);
        assert_eq!(args.slots, Some(SlotSpec::Range { min: 2, max: Some(8) }));
        assert!(Args::try_parse_from(["qsubber", "-s", "8-2", "true"]).is_err());
        assert!(Args::try_parse_from(["qsubber", "-S", "0", "true"]).is_err());
    }

    #[test]
    fn test_command_required_unless_status() {
        assert!(Args::try_parse_from(["qsubber"]).is_err());
        let args = parse(&["--status"]);
        assert!(args.status);
        assert!(args.command.is_empty());
    }

    #[test]
    fn test_settings_mapping() {
        let args = parse(&[
            "-t", "/tmp/q", "--lock-timeout", "0", "--completion-timeout", "90", "--rc-file", "",
            "-m", "2", "-M", "8", "-S", "10", "true",
        ]);
        let settings = args.into_settings().unwrap();
        assert_eq!(settings.tmp_dir, PathBuf::from("/tmp/q"));
        assert_eq!(settings.lock.timeout, None);
        assert_eq!(settings.completion_timeout, Some(Duration::from_secs(90)));
        assert_eq!(settings.submit.rc_file, None);
        assert_eq!(settings.request.min_slots, Some(2));
        assert_eq!(settings.request.max_slots, Some(8));
        assert_eq!(settings.request.size, Some(10));
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        let args = parse(&["-m", "8", "-M", "2", "true"]);
        assert!(args.into_settings().is_err());
    }
}
