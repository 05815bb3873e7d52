// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The provisioning state machine, as seen by the step-execution engine.
//!
//! The full lifecycle FSM is owned by the layer above; the engine only
//! exercises the wait / resume / done / fail / abort edges of the three
//! step-driven operations plus rescue. [`ProvisionState::apply`] implements
//! exactly those edges and rejects everything else.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::steps::OpKind;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisionState {
    Enroll,
    Manageable,
    Available,
    Active,
    Rescue,
    Cleaning,
    CleanWait,
    CleanFail,
    CleanHold,
    Deploying,
    DeployWait,
    DeployFail,
    DeployHold,
    Servicing,
    ServiceWait,
    ServiceFail,
    ServiceHold,
    Rescuing,
    RescueWait,
    RescueFail,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisionState::Enroll => "enroll",
            ProvisionState::Manageable => "manageable",
            ProvisionState::Available => "available",
            ProvisionState::Active => "active",
            ProvisionState::Rescue => "rescue",
            ProvisionState::Cleaning => "cleaning",
            ProvisionState::CleanWait => "clean-wait",
            ProvisionState::CleanFail => "clean-fail",
            ProvisionState::CleanHold => "clean-hold",
            ProvisionState::Deploying => "deploying",
            ProvisionState::DeployWait => "deploy-wait",
            ProvisionState::DeployFail => "deploy-fail",
            ProvisionState::DeployHold => "deploy-hold",
            ProvisionState::Servicing => "servicing",
            ProvisionState::ServiceWait => "service-wait",
            ProvisionState::ServiceFail => "service-fail",
            ProvisionState::ServiceHold => "service-hold",
            ProvisionState::Rescuing => "rescuing",
            ProvisionState::RescueWait => "rescue-wait",
            ProvisionState::RescueFail => "rescue-fail",
        };
        f.write_str(s)
    }
}

impl ProvisionState {
    /// True for the async-wait states in which the node sits idle until the
    /// next agent heartbeat.
    pub fn is_wait(&self) -> bool {
        matches!(
            self,
            ProvisionState::CleanWait
                | ProvisionState::DeployWait
                | ProvisionState::ServiceWait
                | ProvisionState::RescueWait
        )
    }

    /// The step-driven operation this state belongs to, if any.
    pub fn op_kind(&self) -> Option<OpKind> {
        match self {
            ProvisionState::Cleaning
            | ProvisionState::CleanWait
            | ProvisionState::CleanFail
            | ProvisionState::CleanHold => Some(OpKind::Clean),
            ProvisionState::Deploying
            | ProvisionState::DeployWait
            | ProvisionState::DeployFail
            | ProvisionState::DeployHold => Some(OpKind::Deploy),
            ProvisionState::Servicing
            | ProvisionState::ServiceWait
            | ProvisionState::ServiceFail
            | ProvisionState::ServiceHold => Some(OpKind::Service),
            _ => None,
        }
    }

    /// States in which a heartbeat only refreshes agent bookkeeping: the
    /// agent is alive but no continuation is pending.
    pub fn records_heartbeat_only(&self) -> bool {
        matches!(
            self,
            ProvisionState::Enroll
                | ProvisionState::Manageable
                | ProvisionState::Available
                | ProvisionState::Cleaning
                | ProvisionState::Deploying
                | ProvisionState::Rescuing
                | ProvisionState::CleanHold
                | ProvisionState::DeployHold
                | ProvisionState::Servicing
                | ProvisionState::ServiceHold
        )
    }
}

impl OpKind {
    /// The in-progress state in which the engine executes steps of this
    /// kind synchronously.
    pub fn active_state(&self) -> ProvisionState {
        match self {
            OpKind::Clean => ProvisionState::Cleaning,
            OpKind::Deploy => ProvisionState::Deploying,
            OpKind::Service => ProvisionState::Servicing,
        }
    }

    /// The wait state entered when a step goes asynchronous.
    pub fn wait_state(&self) -> ProvisionState {
        match self {
            OpKind::Clean => ProvisionState::CleanWait,
            OpKind::Deploy => ProvisionState::DeployWait,
            OpKind::Service => ProvisionState::ServiceWait,
        }
    }

    pub fn fail_state(&self) -> ProvisionState {
        match self {
            OpKind::Clean => ProvisionState::CleanFail,
            OpKind::Deploy => ProvisionState::DeployFail,
            OpKind::Service => ProvisionState::ServiceFail,
        }
    }
}

/// The FSM events the engine requests.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionEvent {
    Wait,
    Resume,
    Done,
    Fail,
    Abort,
}

impl fmt::Display for ProvisionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisionEvent::Wait => "wait",
            ProvisionEvent::Resume => "resume",
            ProvisionEvent::Done => "done",
            ProvisionEvent::Fail => "fail",
            ProvisionEvent::Abort => "abort",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("no transition from state {state} on event {event}")]
pub struct InvalidTransition {
    pub state: ProvisionState,
    pub event: ProvisionEvent,
}

impl ProvisionState {
    /// Applies one FSM event, returning the next state.
    ///
    /// `target` is the node's target provision state; it only matters for
    /// the `done` edge of cleaning, where a manual clean returns the node
    /// to manageable rather than available.
    pub fn apply(
        self,
        event: ProvisionEvent,
        target: Option<ProvisionState>,
    ) -> Result<ProvisionState, InvalidTransition> {
        use ProvisionEvent as E;
        use ProvisionState as S;

        let next = match (self, event) {
            (S::Cleaning, E::Wait) => S::CleanWait,
            (S::CleanWait, E::Resume) => S::Cleaning,
            (S::Cleaning, E::Done) => match target {
                Some(S::Manageable) => S::Manageable,
                _ => S::Available,
            },
            (S::Cleaning | S::CleanWait | S::CleanHold, E::Fail) => {
                S::CleanFail
            }
            (S::CleanWait, E::Abort) => S::CleanFail,

            (S::Deploying, E::Wait) => S::DeployWait,
            (S::DeployWait, E::Resume) => S::Deploying,
            (S::Deploying, E::Done) => S::Active,
            (S::Deploying | S::DeployWait | S::DeployHold, E::Fail) => {
                S::DeployFail
            }
            (S::DeployWait, E::Abort) => S::DeployFail,

            (S::Servicing, E::Wait) => S::ServiceWait,
            (S::ServiceWait, E::Resume) => S::Servicing,
            (S::Servicing, E::Done) => S::Active,
            (S::Servicing | S::ServiceWait | S::ServiceHold, E::Fail) => {
                S::ServiceFail
            }
            (S::ServiceWait, E::Abort) => S::ServiceFail,

            (S::Rescuing, E::Wait) => S::RescueWait,
            (S::RescueWait, E::Resume) => S::Rescuing,
            (S::Rescuing | S::RescueWait, E::Done) => S::Rescue,
            (S::Rescuing | S::RescueWait, E::Fail) => S::RescueFail,

            (state, event) => {
                return Err(InvalidTransition { state, event });
            }
        };
        Ok(next)
    }
}
