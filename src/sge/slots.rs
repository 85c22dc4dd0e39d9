// SPDX-FileCopyrightText: 2026 GSI Helmholtzzentrum f. Schwerionenforschung GmbH, Darmstadt, Germany
// SPDX-License-Identifier: LGPL-3.0-or-later

//! Slot allocation for jobs submitted as part of a batch.
//!
//! Parallel speedup from extra slots is sub-linear, so when the cluster is
//! the bottleneck it is better to run many small jobs side by side than a few
//! large ones one after the other. When the batch is smaller than the
//! cluster, each job may take over a whole host.

use std::fmt;
use std::str::FromStr;

use super::qhost::{CapacityProbe, ClusterCapacity};
use crate::error::{QsubError, Result};

/// Slots requested from the parallel environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSpec {
    /// Exactly this many slots.
    Fixed(u32),
    /// As many slots as are free, within bounds (`min-` or `min-max`).
    Range { min: u32, max: Option<u32> },
}

impl SlotSpec {
    /// The exact slot count, if this is not a range.
    pub fn fixed(&self) -> Option<u32> {
        match *self {
            SlotSpec::Fixed(n) => Some(n),
            SlotSpec::Range { .. } => None,
        }
    }

    /// Single-slot jobs need no parallel environment.
    pub fn is_single(&self) -> bool {
        matches!(self, SlotSpec::Fixed(1))
    }
}

impl fmt::Display for SlotSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotSpec::Fixed(n) => write!(f, "{n}"),
            SlotSpec::Range { min, max: None } => write!(f, "{min}-"),
            SlotSpec::Range {
                min,
                max: Some(max),
            } => write!(f, "{min}-{max}"),
        }
    }
}

impl FromStr for SlotSpec {
    type Err = QsubError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || QsubError::InvalidSlots(s.to_string());
        let count = |t: &str| match t.trim().parse::<u32>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(invalid()),
        };

        let spec = match s.split_once('-') {
            None => SlotSpec::Fixed(count(s)?),
            Some((min, "")) => SlotSpec::Range {
                min: count(min)?,
                max: None,
            },
            Some((min, max)) => SlotSpec::Range {
                min: count(min)?,
                max: Some(count(max)?),
            },
        };

        if let SlotSpec::Range {
            min,
            max: Some(max),
        } = spec
        {
            if min > max {
                return Err(invalid());
            }
        }
        Ok(spec)
    }
}

/// How a job relates to the batch it is submitted with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotRequest {
    /// Position of this job in the batch. Informational only.
    pub index: Option<u32>,
    /// Number of related jobs being submitted together.
    pub size: Option<u32>,
    pub min_slots: Option<u32>,
    pub max_slots: Option<u32>,
}

impl SlotRequest {
    /// Decide the slot spec, probing the cluster only when the batch size
    /// makes capacity relevant.
    pub fn resolve(&self, probe: &dyn CapacityProbe) -> Result<SlotSpec> {
        if self.size.is_none() {
            return Ok(SlotSpec::Fixed(1));
        }
        let capacity = probe.probe()?;
        Ok(allocate(self, &capacity))
    }

    fn clamp(&self, slots: u32) -> u32 {
        let mut slots = slots;
        if let Some(min) = self.min_slots {
            slots = slots.max(min);
        }
        if let Some(max) = self.max_slots {
            slots = slots.min(max);
        }
        slots
    }
}

/// Compute the slots each job of the batch should request.
pub fn allocate(request: &SlotRequest, capacity: &ClusterCapacity) -> SlotSpec {
    let Some(size) = request.size else {
        return SlotSpec::Fixed(1);
    };
    let size = u64::from(size.max(1));

    if size <= capacity.host_count() as u64 {
        return match (request.min_slots, request.max_slots) {
            (Some(min), max) => SlotSpec::Range { min, max },
            (None, Some(max)) => SlotSpec::Fixed(max),
            (None, None) => SlotSpec::Range { min: 1, max: None },
        };
    }

    if capacity.total_processors() / size < 1 {
        return SlotSpec::Fixed(request.clamp(1));
    }

    SlotSpec::Fixed(request.clamp(slots_per_job(&capacity.hosts, size)))
}

/// Largest `k` such that packing `k`-slot jobs onto every host still fits the
/// whole batch at once.
fn slots_per_job(hosts: &[u32], size: u64) -> u32 {
    let mut best = 1;
    let mut candidate = 2;
    loop {
        let jobs: u64 = hosts.iter().map(|&p| u64::from(p / candidate)).sum();
        if jobs < size {
            return best;
        }
        best = candidate;
        candidate += 1;
    }
}
