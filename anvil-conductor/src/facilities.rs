// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Traits through which the engine reaches its collaborators: the node
//! store, the node's driver composition, and the agent transport client.
//!
//! These keep the engine a separate crate from the surrounding conductor
//! while still using facilities implemented elsewhere. Implementations are
//! expected to be cheap to clone behind `Arc`.

use std::sync::Arc;

use anvil_types::agent::AgentCommand;
use anvil_types::node::{Node, NodeId};
use anvil_types::steps::{Interface, OpKind, Step, StepOutcome};
use async_trait::async_trait;

use crate::errors::{AgentError, StepHandlerError, StoreError};

/// The persistence boundary. Saves are last-writer-wins; there are no
/// transactions, so callers mutate an in-memory copy and save explicitly.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn get(&self, id: NodeId) -> Result<Node, StoreError>;
    async fn save(&self, node: &Node) -> Result<(), StoreError>;
    /// Children of `parent`, for child-node step fan-out.
    async fn list_children(
        &self,
        parent: NodeId,
    ) -> Result<Vec<NodeId>, StoreError>;
}

/// One capability interface of a node's driver composition.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// The steps this interface offers for `kind` on `node`, including
    /// disabled (priority 0) ones.
    async fn steps(
        &self,
        kind: OpKind,
        node: &Node,
    ) -> anyhow::Result<Vec<Step>>;

    /// Executes one step. `Complete` means the step finished synchronously;
    /// `Wait` means it started asynchronous work to be continued from a
    /// heartbeat.
    async fn execute_step(
        &self,
        kind: OpKind,
        node: &Node,
        step: &Step,
    ) -> Result<StepOutcome, StepHandlerError>;
}

/// A node's driver composition: capability interfaces resolved by name,
/// plus the operation-level boot/teardown hooks.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Resolves the capability handler for `interface`, if this driver
    /// composition provides one.
    fn step_handler(
        &self,
        interface: Interface,
    ) -> Option<Arc<dyn StepHandler>>;

    /// Validates power/network (and, for deploys, instance) preconditions.
    async fn validate(&self, kind: OpKind, node: &Node) -> anyhow::Result<()>;

    /// Boots the agent ramdisk for `kind`. May itself be asynchronous,
    /// signaled by returning `Wait`.
    async fn prepare_ramdisk(
        &self,
        kind: OpKind,
        node: &Node,
    ) -> Result<StepOutcome, StepHandlerError>;

    /// Tears down the operation environment for `kind`.
    async fn tear_down(&self, kind: OpKind, node: &Node) -> anyhow::Result<()>;

    /// Issues an out-of-band reboot back into the ramdisk, used between a
    /// reboot-requested step and its successor.
    async fn reboot_to_ramdisk(&self, node: &Node) -> anyhow::Result<()>;

    /// Best-effort collection of ramdisk logs after a fatal step failure.
    /// Failures are logged by the implementation, never surfaced.
    async fn collect_ramdisk_logs(&self, kind: OpKind, node: &Node);
}

/// The agent transport client.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Asks the agent to start executing an in-band step.
    async fn execute_step(
        &self,
        node: &Node,
        kind: OpKind,
        step: &Step,
    ) -> Result<AgentCommand, AgentError>;

    /// Asks the agent for its in-band step catalog.
    async fn get_steps(
        &self,
        node: &Node,
        kind: OpKind,
    ) -> Result<AgentCommand, AgentError>;

    /// The agent's command history, oldest first.
    async fn commands_status(
        &self,
        node: &Node,
    ) -> Result<Vec<AgentCommand>, AgentError>;

    /// Finalizes a rescue: the agent sets up rescue access and reports
    /// back.
    async fn finalize_rescue(
        &self,
        node: &Node,
    ) -> Result<AgentCommand, AgentError>;

    /// Locks the agent down so it stops accepting commands.
    async fn lockdown(&self, node: &Node) -> Result<(), AgentError>;
}
