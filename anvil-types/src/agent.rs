// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Status records reported by the remote agent.
//!
//! The agent echoes back the step it was asked to run and, on the get-steps
//! bootstrap commands, its full in-band step catalog and the hardware
//! manager version string that produced it.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::steps::{OpKind, Step};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentCommandStatus {
    Running,
    Succeeded,
    Failed,
    CleanVersionMismatch,
    VersionMismatch,
}

impl AgentCommandStatus {
    /// True for either of the hardware-manager version mismatch tokens. The
    /// clean-specific spelling is retained for agents that predate the
    /// generic one.
    pub fn is_version_mismatch(&self) -> bool {
        matches!(
            self,
            AgentCommandStatus::CleanVersionMismatch
                | AgentCommandStatus::VersionMismatch
        )
    }
}

/// One entry of the agent's command history.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct AgentCommand {
    pub command_name: String,
    pub command_status: AgentCommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_error: Option<String>,
}

impl AgentCommand {
    fn result_field(&self, key: &str) -> Option<&serde_json::Value> {
        self.command_result.as_ref()?.get(key)
    }

    /// The step this command echoed back, if any.
    pub fn echoed_step(&self, kind: OpKind) -> Option<Step> {
        let value = self.result_field(&format!("{kind}_step"))?;
        serde_json::from_value(value.clone()).ok()
    }

    /// The in-band step catalog carried by a get-steps command result.
    pub fn reported_steps(&self, kind: OpKind) -> Option<Vec<Step>> {
        let value = self.result_field(&format!("{kind}_steps"))?;
        serde_json::from_value(value.clone()).ok()
    }

    /// The hardware manager version string carried by a get-steps command
    /// result.
    pub fn hardware_manager_version(&self) -> Option<String> {
        let value = self.result_field("hardware_manager_version")?;
        value.as_str().map(str::to_owned)
    }
}

/// True if the agent looks freshly booted: its command history is empty, or
/// contains nothing beyond the get-steps bootstrap call. The latter covers
/// heartbeats retried immediately post-reboot, before any step command has
/// been issued.
pub fn freshly_booted(commands: &[AgentCommand], kind: OpKind) -> bool {
    commands.iter().all(|c| c.command_name == kind.get_steps_command())
}

/// The payload of one agent check-in.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct HeartbeatInfo {
    /// URL at which the conductor can reach the agent back.
    pub callback_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
}
