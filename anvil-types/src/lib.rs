// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared types for the anvil conductor: step records, the provisioning
//! state machine, agent command reports, and the persisted node record.
//!
//! These types are serialized both into the node's persisted driver-internal
//! map and across the conductor/agent boundary, so everything here derives
//! serde and keeps its wire representation stable.

pub mod agent;
pub mod node;
pub mod state;
pub mod steps;
