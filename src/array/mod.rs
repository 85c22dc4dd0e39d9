// SPDX-FileCopyrightText: 2026 GSI Helmholtzzentrum f. Schwerionenforschung GmbH, Darmstadt, Germany
// SPDX-License-Identifier: LGPL-3.0-or-later

//! Filesystem-backed array jobs.
//!
//! All state lives as plain files in the qsub temporary directory, shared by
//! every process (possibly on several hosts) that submits through it:
//! - `a<id>.s<slots>[.<hash>].array.*`: one time-windowed batch
//! - `a<id>.s<slots>[.<hash>].i<n>.*`: member `n` of that batch

pub mod artifacts;
pub mod member;
pub mod registry;

pub use artifacts::{ArrayArtifact, ArrayJob, MemberArtifact};
pub use member::{JobMember, JobStatus};
pub use registry::{ArrayRegistry, ArraySummary, ArrayTicket, Window};
