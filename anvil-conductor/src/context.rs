// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared engine context and the per-node task handle.
//!
//! Every state-mutating code path runs under an exclusive per-node lock,
//! materialized as a [`NodeTask`]: the lock guard, the in-memory node copy,
//! and the FSM entry point. Acquisition is non-blocking; contention is an
//! error the caller decides how to handle (RPC entry points propagate it,
//! heartbeats silently retry on the next check-in).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anvil_types::agent::AgentCommand;
use anvil_types::node::{Node, NodeId};
use anvil_types::state::ProvisionEvent;
use anvil_types::steps::{Interface, OpKind, Step, StepTemplate};
use slog::{debug, o, Logger};

use crate::config::Config;
use crate::errors::{EngineError, StoreError, TaskError};
use crate::facilities::{AgentClient, Driver, NodeStore};

/// A post-step hook, run after an in-band step succeeds and before the
/// operation advances. Mutations to the node are saved by the caller; an
/// error fails the step.
pub type PostStepHook = Arc<
    dyn Fn(&Logger, &mut Node, &AgentCommand) -> anyhow::Result<()>
        + Send
        + Sync,
>;

/// Registry of post-step hooks keyed by (kind, interface, step name).
/// Collaborator crates register hooks at startup.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Mutex<HashMap<(OpKind, Interface, String), PostStepHook>>,
}

impl HookRegistry {
    pub fn register(
        &self,
        kind: OpKind,
        interface: Interface,
        step_name: &str,
        hook: PostStepHook,
    ) {
        self.hooks
            .lock()
            .unwrap()
            .insert((kind, interface, step_name.to_owned()), hook);
    }

    pub fn lookup(&self, kind: OpKind, step: &Step) -> Option<PostStepHook> {
        self.hooks
            .lock()
            .unwrap()
            .get(&(kind, step.interface, step.step.clone()))
            .cloned()
    }
}

/// In-process per-node lock table. The surrounding deployment runs one
/// conductor per node partition, so an in-process table is sufficient.
#[derive(Default)]
struct LockTable {
    held: Mutex<HashMap<NodeId, String>>,
}

impl LockTable {
    /// Non-blocking acquisition; on contention reports what the lock is
    /// currently held for.
    fn try_lock(&self, id: NodeId, purpose: &str) -> Result<(), TaskError> {
        let mut held = self.held.lock().unwrap();
        if let Some(held_for) = held.get(&id) {
            return Err(TaskError::NodeLocked {
                node: id,
                held_for: held_for.clone(),
            });
        }
        held.insert(id, purpose.to_owned());
        Ok(())
    }

    fn unlock(&self, id: NodeId) {
        self.held.lock().unwrap().remove(&id);
    }
}

/// Everything the engine needs to run: configuration, collaborator
/// facilities, deploy templates, and the post-step hook registry.
pub struct ConductorContext {
    pub log: Logger,
    pub config: Arc<Config>,
    pub store: Arc<dyn NodeStore>,
    pub driver: Arc<dyn Driver>,
    pub agent: Arc<dyn AgentClient>,
    pub templates: Vec<StepTemplate>,
    pub hooks: HookRegistry,
    locks: Arc<LockTable>,
}

impl ConductorContext {
    pub fn new(
        log: &Logger,
        config: Config,
        store: Arc<dyn NodeStore>,
        driver: Arc<dyn Driver>,
        agent: Arc<dyn AgentClient>,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "conductor-engine")),
            config: Arc::new(config),
            store,
            driver,
            agent,
            templates: Vec::new(),
            hooks: HookRegistry::default(),
            locks: Arc::new(LockTable::default()),
        }
    }

    pub fn with_templates(mut self, templates: Vec<StepTemplate>) -> Self {
        self.templates = templates;
        self
    }

    /// Acquires the exclusive lock on `id` and loads the node into a task
    /// handle. Non-blocking: contention returns `TaskError::NodeLocked`.
    pub async fn acquire(
        &self,
        id: NodeId,
        purpose: &str,
    ) -> Result<NodeTask, TaskError> {
        self.locks.try_lock(id, purpose)?;
        let node = match self.store.get(id).await {
            Ok(node) => node,
            Err(error) => {
                self.locks.unlock(id);
                return Err(error.into());
            }
        };
        debug!(
            self.log, "acquired node lock";
            "node" => %id,
            "purpose" => purpose,
        );
        Ok(NodeTask {
            log: self.log.new(o!("node" => id.to_string())),
            node,
            id,
            store: Arc::clone(&self.store),
            locks: Arc::clone(&self.locks),
        })
    }
}

/// An exclusively-locked node: the in-memory working copy plus the save and
/// FSM entry points. The lock is released on drop.
pub struct NodeTask {
    pub log: Logger,
    pub node: Node,
    id: NodeId,
    store: Arc<dyn NodeStore>,
    locks: Arc<LockTable>,
}

impl NodeTask {
    /// Persists the working copy. Last-writer-wins.
    pub async fn save(&mut self) -> Result<(), StoreError> {
        self.store.save(&self.node).await
    }

    /// Drives the provisioning FSM and persists the result. The node's
    /// target provision state steers the `done` edge and is consumed by it.
    pub async fn process_event(
        &mut self,
        event: ProvisionEvent,
    ) -> Result<(), EngineError> {
        let next = self
            .node
            .provision_state
            .apply(event, self.node.target_provision_state)?;
        debug!(
            self.log, "provision state transition";
            "from" => %self.node.provision_state,
            "event" => %event,
            "to" => %next,
        );
        self.node.provision_state = next;
        if event == ProvisionEvent::Done {
            self.node.target_provision_state = None;
        }
        self.save().await?;
        Ok(())
    }
}

impl Drop for NodeTask {
    fn drop(&mut self) {
        self.locks.unlock(self.id);
    }
}
