// SPDX-FileCopyrightText: 2026 GSI Helmholtzzentrum f. Schwerionenforschung GmbH, Darmstadt, Germany
// SPDX-License-Identifier: LGPL-3.0-or-later

//! Sun Grid Engine integration.
//!
//! - Capacity: `qhost -q` reports free processors per host queue
//! - Slots: choose how many slots each job of a batch asks for
//! - Scripts: the generated shell scripts handed to `qsub`

pub mod qhost;
pub mod scripts;
pub mod slots;

pub use qhost::{CapacityProbe, Qhost};
pub use scripts::SubmitOptions;
pub use slots::{SlotRequest, SlotSpec};
