// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The persisted node record.
//!
//! The node is the single shared mutable resource of the engine: all "what
//! step are we on" reads go through it, never through in-memory executor
//! state, so that an operation survives a conductor restart. Saves are
//! last-writer-wins; every engine mutation is read, mutate in memory, then
//! an explicit save through the store.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::ProvisionState;
use crate::steps::{OpKind, Step};

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
#[serde(transparent)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// String-keyed scratch space persisted with the node, holding the step
/// list for the current operation, the step index, cached in-band steps,
/// and assorted flags. Values are JSON so collaborating drivers can stash
/// their own keys alongside the engine's.
#[derive(
    Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema,
)]
#[serde(transparent)]
pub struct DriverInternal(BTreeMap<String, serde_json::Value>);

impl DriverInternal {
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.0.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: T) {
        // Serialization of engine-owned types is infallible.
        if let Ok(value) = serde_json::to_value(value) {
            self.0.insert(key.to_owned(), value);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Node {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node: Option<NodeId>,
    #[serde(default)]
    pub maintenance: bool,
    pub provision_state: ProvisionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_provision_state: Option<ProvisionState>,
    /// Traits requested for the instance; deploy templates are selected by
    /// matching against these.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traits: Vec<String>,
    /// The clean step currently executing, mirrored here before any
    /// interface call that might fail or take a long time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_step: Option<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_step: Option<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_step: Option<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub driver_internal: DriverInternal,
}

impl Node {
    pub fn new(id: NodeId, provision_state: ProvisionState) -> Self {
        Self {
            id,
            parent_node: None,
            maintenance: false,
            provision_state,
            target_provision_state: None,
            traits: Vec::new(),
            clean_step: None,
            deploy_step: None,
            service_step: None,
            last_error: None,
            driver_internal: DriverInternal::default(),
        }
    }

    /// The externally visible "currently executing step" field for `kind`.
    pub fn current_step(&self, kind: OpKind) -> Option<&Step> {
        match kind {
            OpKind::Clean => self.clean_step.as_ref(),
            OpKind::Deploy => self.deploy_step.as_ref(),
            OpKind::Service => self.service_step.as_ref(),
        }
    }

    pub fn set_current_step(&mut self, kind: OpKind, step: Option<Step>) {
        match kind {
            OpKind::Clean => self.clean_step = step,
            OpKind::Deploy => self.deploy_step = step,
            OpKind::Service => self.service_step = step,
        }
    }
}

fn steps_key(kind: OpKind) -> String {
    format!("{kind}_steps")
}

fn index_key(kind: OpKind) -> String {
    format!("{kind}_step_index")
}

fn user_steps_key(kind: OpKind) -> String {
    format!("user_{kind}_steps")
}

fn cached_steps_key(kind: OpKind) -> String {
    format!("agent_cached_{kind}_steps")
}

fn reboot_key(kind: OpKind) -> String {
    format!("{}_reboot", kind.phase_str())
}

fn polling_key(kind: OpKind) -> String {
    format!("{}_polling", kind.phase_str())
}

fn skip_key(kind: OpKind) -> String {
    format!("skip_current_{kind}_step")
}

fn disable_ramdisk_key(kind: OpKind) -> String {
    format!("{}_disable_ramdisk", kind.phase_str())
}

const HARDWARE_MANAGER_VERSION: &str = "hardware_manager_version";
const AGENT_URL: &str = "agent_url";
const AGENT_VERSION: &str = "agent_version";
const AGENT_LAST_HEARTBEAT: &str = "agent_last_heartbeat";

/// Typed accessors over the engine-owned driver-internal keys.
impl Node {
    /// The full ordered step list for the in-progress operation.
    pub fn steps(&self, kind: OpKind) -> Option<Vec<Step>> {
        self.driver_internal.get(&steps_key(kind))
    }

    pub fn set_steps(&mut self, kind: OpKind, steps: Option<&[Step]>) {
        match steps {
            Some(steps) => self.driver_internal.set(&steps_key(kind), steps),
            None => {
                self.driver_internal.remove(&steps_key(kind));
            }
        }
    }

    /// Index of the next step to run, or of the step currently running.
    /// `None` only when the step list is empty or no operation is active.
    pub fn step_index(&self, kind: OpKind) -> Option<usize> {
        self.driver_internal.get(&index_key(kind))
    }

    pub fn set_step_index(&mut self, kind: OpKind, index: Option<usize>) {
        match index {
            Some(index) => self.driver_internal.set(&index_key(kind), index),
            None => {
                self.driver_internal.remove(&index_key(kind));
            }
        }
    }

    /// The user-supplied step list, kept for re-validation once the agent
    /// reports its in-band catalog.
    pub fn user_steps(&self, kind: OpKind) -> Option<Vec<Step>> {
        self.driver_internal.get(&user_steps_key(kind))
    }

    pub fn set_user_steps(&mut self, kind: OpKind, steps: Option<&[Step]>) {
        match steps {
            Some(steps) => {
                self.driver_internal.set(&user_steps_key(kind), steps)
            }
            None => {
                self.driver_internal.remove(&user_steps_key(kind));
            }
        }
    }

    /// In-band steps reported by the agent, cached on the first heartbeat
    /// after a ramdisk boot.
    pub fn cached_agent_steps(&self, kind: OpKind) -> Option<Vec<Step>> {
        self.driver_internal.get(&cached_steps_key(kind))
    }

    pub fn set_cached_agent_steps(
        &mut self,
        kind: OpKind,
        steps: Option<&[Step]>,
    ) {
        match steps {
            Some(steps) => {
                self.driver_internal.set(&cached_steps_key(kind), steps)
            }
            None => {
                self.driver_internal.remove(&cached_steps_key(kind));
            }
        }
    }

    pub fn hardware_manager_version(&self) -> Option<String> {
        self.driver_internal.get(HARDWARE_MANAGER_VERSION)
    }

    pub fn set_hardware_manager_version(&mut self, version: &str) {
        self.driver_internal.set(HARDWARE_MANAGER_VERSION, version);
    }

    /// Set while an out-of-band reboot back into the ramdisk is pending.
    pub fn reboot_pending(&self, kind: OpKind) -> bool {
        self.driver_internal.get(&reboot_key(kind)).unwrap_or(false)
    }

    pub fn set_reboot_pending(&mut self, kind: OpKind, pending: bool) {
        if pending {
            self.driver_internal.set(&reboot_key(kind), true);
        } else {
            self.driver_internal.remove(&reboot_key(kind));
        }
    }

    /// Set when the driver polls for step completion on its own; the
    /// heartbeat processor then leaves continuation to it.
    pub fn polling(&self, kind: OpKind) -> bool {
        self.driver_internal.get(&polling_key(kind)).unwrap_or(false)
    }

    pub fn set_polling(&mut self, kind: OpKind, polling: bool) {
        if polling {
            self.driver_internal.set(&polling_key(kind), true);
        } else {
            self.driver_internal.remove(&polling_key(kind));
        }
    }

    /// Whether continuation should advance past the recorded step index.
    /// Defaults to true; cleared when the current step must be re-executed
    /// (agent busy, manual-clean version mismatch).
    pub fn skip_current_step(&self, kind: OpKind) -> bool {
        self.driver_internal.get(&skip_key(kind)).unwrap_or(true)
    }

    pub fn set_skip_current_step(&mut self, kind: OpKind, skip: bool) {
        self.driver_internal.set(&skip_key(kind), skip);
    }

    pub fn disable_ramdisk(&self, kind: OpKind) -> bool {
        self.driver_internal
            .get(&disable_ramdisk_key(kind))
            .unwrap_or(false)
    }

    pub fn set_disable_ramdisk(&mut self, kind: OpKind, disable: bool) {
        if disable {
            self.driver_internal.set(&disable_ramdisk_key(kind), true);
        } else {
            self.driver_internal.remove(&disable_ramdisk_key(kind));
        }
    }

    pub fn agent_url(&self) -> Option<String> {
        self.driver_internal.get(AGENT_URL)
    }

    /// Records last-seen agent bookkeeping from a heartbeat.
    pub fn record_agent_heartbeat(
        &mut self,
        callback_url: &str,
        agent_version: Option<&str>,
        at: DateTime<Utc>,
    ) {
        self.driver_internal.set(AGENT_URL, callback_url);
        if let Some(version) = agent_version {
            self.driver_internal.set(AGENT_VERSION, version);
        }
        self.driver_internal.set(AGENT_LAST_HEARTBEAT, at);
    }

    pub fn last_agent_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.driver_internal.get(AGENT_LAST_HEARTBEAT)
    }

    /// Clears all per-operation bookkeeping for `kind`: the visible current
    /// step, the persisted list and index, and the transient flags. Cached
    /// agent steps and agent bookkeeping survive.
    pub fn clear_operation_state(&mut self, kind: OpKind) {
        self.set_current_step(kind, None);
        self.set_steps(kind, None);
        self.set_step_index(kind, None);
        self.set_user_steps(kind, None);
        self.set_reboot_pending(kind, false);
        self.set_polling(kind, false);
        self.driver_internal.remove(&skip_key(kind));
        self.set_disable_ramdisk(kind, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::Interface;

    #[test]
    fn step_bookkeeping_round_trips() {
        let mut node =
            Node::new(NodeId::new_v4(), ProvisionState::Cleaning);
        let steps = vec![
            Step::new(Interface::Deploy, "erase_devices", 30),
            Step::new(Interface::Deploy, "write_image", 20),
        ];
        node.set_steps(OpKind::Clean, Some(&steps));
        node.set_step_index(OpKind::Clean, Some(1));

        assert_eq!(node.steps(OpKind::Clean).unwrap(), steps);
        assert_eq!(node.step_index(OpKind::Clean), Some(1));
        // Other kinds are unaffected.
        assert!(node.steps(OpKind::Deploy).is_none());

        node.clear_operation_state(OpKind::Clean);
        assert!(node.steps(OpKind::Clean).is_none());
        assert!(node.step_index(OpKind::Clean).is_none());
    }

    #[test]
    fn skip_flag_defaults_to_true() {
        let mut node =
            Node::new(NodeId::new_v4(), ProvisionState::CleanWait);
        assert!(node.skip_current_step(OpKind::Clean));
        node.set_skip_current_step(OpKind::Clean, false);
        assert!(!node.skip_current_step(OpKind::Clean));
    }

    #[test]
    fn heartbeat_bookkeeping_is_recorded() {
        let mut node =
            Node::new(NodeId::new_v4(), ProvisionState::DeployWait);
        let now = Utc::now();
        node.record_agent_heartbeat(
            "http://10.0.0.7:9999",
            Some("9.2.0"),
            now,
        );
        assert_eq!(
            node.agent_url().as_deref(),
            Some("http://10.0.0.7:9999")
        );
        assert_eq!(node.last_agent_heartbeat(), Some(now));
    }
}
