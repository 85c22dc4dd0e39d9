// SPDX-FileCopyrightText: 2026 GSI Helmholtzzentrum f. Schwerionenforschung GmbH, Darmstadt, Germany
// SPDX-License-Identifier: LGPL-3.0-or-later

//! Cluster capacity via `qhost -q`.

use std::process::Command;

use tracing::debug;

use crate::error::{QsubError, Result};

/// Free processors of every host queue, fetched fresh for each decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterCapacity {
    pub hosts: Vec<u32>,
}

impl ClusterCapacity {
    pub fn new(hosts: Vec<u32>) -> Self {
        Self { hosts }
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn total_processors(&self) -> u64 {
        self.hosts.iter().map(|&p| u64::from(p)).sum()
    }
}

/// Source of cluster capacity.
pub trait CapacityProbe {
    fn probe(&self) -> Result<ClusterCapacity>;
}

/// Queries the grid engine through its `qhost` binary.
#[derive(Debug, Clone)]
pub struct Qhost {
    program: String,
}

impl Qhost {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl CapacityProbe for Qhost {
    fn probe(&self) -> Result<ClusterCapacity> {
        let output = Command::new(&self.program)
            .arg("-q")
            .output()
            .map_err(|e| QsubError::Probe {
                program: self.program.clone(),
                detail: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(QsubError::Probe {
                program: self.program.clone(),
                detail: format!("{}: {}", output.status, stderr.trim()),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let capacity = parse_qhost_output(&stdout, &self.program)?;
        debug!(
            hosts = capacity.host_count(),
            processors = capacity.total_processors(),
            "probed cluster capacity"
        );
        Ok(capacity)
    }
}

/// Parse `qhost -q` output.
///
/// Queue lines end with a `resv/used/total` triple; each contributes
/// `total - used`. Lines whose last field is anything else (headers, host
/// summaries, queues followed by a state flag such as `d`) are skipped.
pub fn parse_qhost_output(output: &str, program: &str) -> Result<ClusterCapacity> {
    let mut hosts = Vec::new();

    for line in output.lines() {
        let Some(last) = line.split_whitespace().last() else {
            continue;
        };
        let parts: Vec<&str> = last.split('/').collect();
        if parts.len() != 3 {
            continue;
        }

        let parse = |s: &str| {
            s.parse::<u32>().map_err(|_| QsubError::ProbeParse {
                program: program.to_string(),
                line: line.trim().to_string(),
            })
        };
        let used = parse(parts[1])?;
        let total = parse(parts[2])?;
        hosts.push(total.saturating_sub(used));
    }

    Ok(ClusterCapacity::new(hosts))
}
