// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Step records and ordering.
//!
//! A step is the unit of work the conductor drives against a node: an
//! operation exposed by one of the node's capability interfaces, executed
//! either out-of-band by the conductor or in-band by the agent ramdisk.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::node::NodeId;

/// The multi-step operations the conductor can drive against a node.
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
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Clean,
    Deploy,
    Service,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Clean => "clean",
            OpKind::Deploy => "deploy",
            OpKind::Service => "service",
        }
    }

    /// The gerund form used in log messages and flag keys
    /// ("cleaning_reboot", "servicing_polling", ...).
    pub fn phase_str(&self) -> &'static str {
        match self {
            OpKind::Clean => "cleaning",
            OpKind::Deploy => "deployment",
            OpKind::Service => "servicing",
        }
    }

    /// Wire name of the agent command that executes one step of this kind.
    pub fn execute_command(&self) -> &'static str {
        match self {
            OpKind::Clean => "execute_clean_step",
            OpKind::Deploy => "execute_deploy_step",
            OpKind::Service => "execute_service_step",
        }
    }

    /// Wire name of the bootstrap command through which the agent reports
    /// its in-band step catalog.
    pub fn get_steps_command(&self) -> &'static str {
        match self {
            OpKind::Clean => "get_clean_steps",
            OpKind::Deploy => "get_deploy_steps",
            OpKind::Service => "get_service_steps",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A capability interface: a named group of steps provided by the node's
/// driver composition.
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
#[serde(rename_all = "lowercase")]
pub enum Interface {
    Power,
    Management,
    Deploy,
    Bios,
    Raid,
}

impl Interface {
    pub const ALL: [Interface; 5] = [
        Interface::Power,
        Interface::Management,
        Interface::Deploy,
        Interface::Bios,
        Interface::Raid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Interface::Power => "power",
            Interface::Management => "management",
            Interface::Deploy => "deploy",
            Interface::Bios => "bios",
            Interface::Raid => "raid",
        }
    }

    /// Fixed weight used to break ties between steps that share a priority.
    /// Higher weights sort first.
    pub fn tiebreak_weight(&self) -> u8 {
        match self {
            Interface::Power => 5,
            Interface::Management => 4,
            Interface::Deploy => 3,
            Interface::Bios => 2,
            Interface::Raid => 1,
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown capability interface {value:?}")]
pub struct ParseInterfaceError {
    pub value: String,
}

impl FromStr for Interface {
    type Err = ParseInterfaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "power" => Ok(Interface::Power),
            "management" => Ok(Interface::Management),
            "deploy" => Ok(Interface::Deploy),
            "bios" => Ok(Interface::Bios),
            "raid" => Ok(Interface::Raid),
            _ => Err(ParseInterfaceError { value: s.to_owned() }),
        }
    }
}

/// Schema entry describing one argument a step accepts.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub struct ArgInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// One step of a clean, deploy, or service operation.
///
/// A step's identity is the (interface, name) pair; priority and args are
/// not part of identity.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Step {
    pub interface: Interface,
    /// Step name, unique within its interface.
    pub step: String,
    /// Selection priority; 0 means the step is disabled / not selected.
    pub priority: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, serde_json::Value>,
    /// Schema of accepted arguments; absent means the step takes none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argsinfo: Option<BTreeMap<String, ArgInfo>>,
    /// Whether the step may be aborted while in progress (clean only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abortable: Option<bool>,
    /// Whether the step needs the agent ramdisk to be booted (clean only).
    #[serde(default = "default_requires_ramdisk")]
    pub requires_ramdisk: bool,
    /// The node must be rebooted back into the ramdisk after this step
    /// completes, before the next step may run.
    #[serde(default)]
    pub reboot_requested: bool,
    /// Fail the operation after this step succeeds instead of continuing.
    #[serde(default)]
    pub abort_after: bool,
    /// Run this step against the node's children instead of the node itself.
    #[serde(default)]
    pub execute_on_child_nodes: bool,
    /// When fanning out to children, restrict execution to these nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub limit_child_node_execution: Vec<NodeId>,
}

fn default_requires_ramdisk() -> bool {
    true
}

impl Step {
    /// Minimal constructor used pervasively by the catalog and tests; all
    /// optional fields start at their serde defaults.
    pub fn new(interface: Interface, step: impl Into<String>, priority: i64) -> Self {
        Self {
            interface,
            step: step.into(),
            priority,
            args: BTreeMap::new(),
            argsinfo: None,
            abortable: None,
            requires_ramdisk: true,
            reboot_requested: false,
            abort_after: false,
            execute_on_child_nodes: false,
            limit_child_node_execution: Vec::new(),
        }
    }

    /// The "interface.step" id used in log and error messages.
    pub fn id(&self) -> String {
        format!("{}.{}", self.interface, self.step)
    }

    /// Identity comparison: same (interface, name), priority and args
    /// ignored.
    pub fn same_step(&self, other: &Step) -> bool {
        self.interface == other.interface && self.step == other.step
    }

    /// The one core deploy step whose behavior a user step may never
    /// override.
    pub fn is_core_deploy(&self) -> bool {
        self.interface == Interface::Deploy && self.step == "deploy"
    }
}

/// Sorts steps in execution order: descending by priority, ties broken by
/// descending interface weight. The sort is stable, so equal keys keep
/// their relative input order and repeated sorts are deterministic.
pub fn sort_steps(steps: &mut [Step]) {
    steps.sort_by(|a, b| {
        (b.priority, b.interface.tiebreak_weight())
            .cmp(&(a.priority, a.interface.tiebreak_weight()))
    });
}

/// Finds the first step matching `needle`'s (interface, name) identity.
pub fn find_step<'a>(steps: &'a [Step], needle: &Step) -> Option<&'a Step> {
    steps.iter().find(|s| s.same_step(needle))
}

/// What a capability handler reports back for one step execution.
#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    /// The step finished synchronously; the executor proceeds to the next
    /// index in the same call.
    Complete,
    /// The step started asynchronous work; the node must sit in the kind's
    /// wait state until the agent heartbeats back.
    Wait,
    /// Anything else the handler produced. A top-level step returning this
    /// is a contract violation; a child-node execution returning it carries
    /// the child's error message.
    Other(serde_json::Value),
}

/// A named bundle of deploy steps, selected for a node when the template
/// name matches one of the node's requested traits.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct StepTemplate {
    pub name: String,
    pub steps: Vec<Step>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_is_descending_with_interface_tiebreak() {
        let mut steps = vec![
            Step::new(Interface::Raid, "create_config", 30),
            Step::new(Interface::Deploy, "erase_devices", 30),
            Step::new(Interface::Power, "power_cycle", 10),
            Step::new(Interface::Management, "reset_bmc", 50),
        ];
        sort_steps(&mut steps);
        let ids: Vec<_> = steps.iter().map(Step::id).collect();
        assert_eq!(
            ids,
            [
                "management.reset_bmc",
                "deploy.erase_devices",
                "raid.create_config",
                "power.power_cycle",
            ]
        );

        // Sorting again must not change anything.
        let before = steps.clone();
        sort_steps(&mut steps);
        assert_eq!(before, steps);
    }

    #[test]
    fn identity_ignores_priority_and_args() {
        let a = Step::new(Interface::Deploy, "write_image", 50);
        let mut b = Step::new(Interface::Deploy, "write_image", 0);
        b.args.insert("url".into(), serde_json::json!("http://x"));
        assert!(a.same_step(&b));
        assert_eq!(find_step(&[b.clone()], &a).map(Step::id), Some(a.id()));

        let c = Step::new(Interface::Raid, "write_image", 50);
        assert!(!a.same_step(&c));
    }

    #[test]
    fn step_round_trips_with_defaults() {
        let parsed: Step = serde_json::from_value(serde_json::json!({
            "interface": "deploy",
            "step": "deploy",
            "priority": 100,
        }))
        .unwrap();
        assert!(parsed.requires_ramdisk);
        assert!(!parsed.reboot_requested);
        assert!(parsed.is_core_deploy());
    }
}
