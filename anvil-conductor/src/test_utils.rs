// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory collaborators used by the engine's tests: a node store, a
//! scriptable driver, and a scriptable agent.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anvil_types::agent::{AgentCommand, AgentCommandStatus};
use anvil_types::node::{Node, NodeId};
use anvil_types::steps::{Interface, OpKind, Step, StepOutcome};
use async_trait::async_trait;
use slog::{o, Logger};

use crate::config::Config;
use crate::context::{ConductorContext, NodeTask};
use crate::errors::{AgentError, StepHandlerError, StoreError};
use crate::facilities::{AgentClient, Driver, NodeStore, StepHandler};

pub(crate) fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

#[derive(Default)]
pub(crate) struct InMemoryNodeStore {
    nodes: Mutex<BTreeMap<NodeId, Node>>,
}

impl InMemoryNodeStore {
    pub fn insert(&self, node: Node) {
        self.nodes.lock().unwrap().insert(node.id, node);
    }

    /// Reads back persisted state for assertions.
    pub fn node(&self, id: NodeId) -> Node {
        self.nodes
            .lock()
            .unwrap()
            .get(&id)
            .expect("node exists in store")
            .clone()
    }
}

#[async_trait]
impl NodeStore for InMemoryNodeStore {
    async fn get(&self, id: NodeId) -> Result<Node, StoreError> {
        self.nodes
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn save(&self, node: &Node) -> Result<(), StoreError> {
        self.nodes.lock().unwrap().insert(node.id, node.clone());
        Ok(())
    }

    async fn list_children(
        &self,
        parent: NodeId,
    ) -> Result<Vec<NodeId>, StoreError> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .values()
            .filter(|n| n.parent_node == Some(parent))
            .map(|n| n.id)
            .collect())
    }
}

/// Scripted result for one handler or ramdisk-preparation invocation.
#[derive(Clone, Debug)]
pub(crate) enum Scripted {
    Complete,
    Wait,
    Other(serde_json::Value),
    Busy,
    Unreachable,
    Fail(String),
    Error(String),
}

impl Scripted {
    fn into_result(self) -> Result<StepOutcome, StepHandlerError> {
        match self {
            Scripted::Complete => Ok(StepOutcome::Complete),
            Scripted::Wait => Ok(StepOutcome::Wait),
            Scripted::Other(value) => Ok(StepOutcome::Other(value)),
            Scripted::Busy => Err(StepHandlerError::AgentBusy),
            Scripted::Unreachable => {
                Err(StepHandlerError::AgentUnreachable)
            }
            Scripted::Fail(message) => {
                Err(StepHandlerError::Failed(message))
            }
            Scripted::Error(message) => Err(StepHandlerError::Unexpected(
                anyhow::anyhow!(message),
            )),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeStepHandler {
    offered: Mutex<Vec<Step>>,
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    /// (node, step id) per execution, in order.
    pub executed: Mutex<Vec<(NodeId, String)>>,
}

impl FakeStepHandler {
    pub fn new(offered: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            offered: Mutex::new(offered),
            ..Default::default()
        })
    }

    /// Queues a result for the next execution of `step_id`; unscripted
    /// executions complete synchronously.
    pub fn script(&self, step_id: &str, result: Scripted) {
        self.scripts
            .lock()
            .unwrap()
            .entry(step_id.to_owned())
            .or_default()
            .push_back(result);
    }

    pub fn executed_ids(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .map(|(_, id)| id.clone())
            .collect()
    }
}

#[async_trait]
impl StepHandler for FakeStepHandler {
    async fn steps(
        &self,
        _kind: OpKind,
        _node: &Node,
    ) -> anyhow::Result<Vec<Step>> {
        Ok(self.offered.lock().unwrap().clone())
    }

    async fn execute_step(
        &self,
        _kind: OpKind,
        node: &Node,
        step: &Step,
    ) -> Result<StepOutcome, StepHandlerError> {
        self.executed.lock().unwrap().push((node.id, step.id()));
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&step.id())
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or(Scripted::Complete).into_result()
    }
}

pub(crate) struct FakeDriver {
    handlers: HashMap<Interface, Arc<FakeStepHandler>>,
    pub prepare_results: Mutex<VecDeque<Scripted>>,
    pub validate_error: Mutex<Option<String>>,
    pub teardown_error: Mutex<Option<String>>,
    pub torn_down: Mutex<Vec<OpKind>>,
    pub reboots: Mutex<usize>,
    pub log_collections: Mutex<usize>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            prepare_results: Mutex::default(),
            validate_error: Mutex::default(),
            teardown_error: Mutex::default(),
            torn_down: Mutex::default(),
            reboots: Mutex::default(),
            log_collections: Mutex::default(),
        }
    }

    pub fn with_handler(
        mut self,
        interface: Interface,
        handler: Arc<FakeStepHandler>,
    ) -> Self {
        self.handlers.insert(interface, handler);
        self
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn step_handler(
        &self,
        interface: Interface,
    ) -> Option<Arc<dyn StepHandler>> {
        self.handlers
            .get(&interface)
            .map(|h| Arc::clone(h) as Arc<dyn StepHandler>)
    }

    async fn validate(
        &self,
        _kind: OpKind,
        _node: &Node,
    ) -> anyhow::Result<()> {
        match self.validate_error.lock().unwrap().clone() {
            Some(message) => Err(anyhow::anyhow!(message)),
            None => Ok(()),
        }
    }

    async fn prepare_ramdisk(
        &self,
        _kind: OpKind,
        _node: &Node,
    ) -> Result<StepOutcome, StepHandlerError> {
        self.prepare_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Scripted::Complete)
            .into_result()
    }

    async fn tear_down(
        &self,
        kind: OpKind,
        _node: &Node,
    ) -> anyhow::Result<()> {
        self.torn_down.lock().unwrap().push(kind);
        match self.teardown_error.lock().unwrap().clone() {
            Some(message) => Err(anyhow::anyhow!(message)),
            None => Ok(()),
        }
    }

    async fn reboot_to_ramdisk(&self, _node: &Node) -> anyhow::Result<()> {
        *self.reboots.lock().unwrap() += 1;
        Ok(())
    }

    async fn collect_ramdisk_logs(&self, _kind: OpKind, _node: &Node) {
        *self.log_collections.lock().unwrap() += 1;
    }
}

#[derive(Default)]
pub(crate) struct FakeAgent {
    pub history: Mutex<Vec<AgentCommand>>,
    pub reported_steps: Mutex<HashMap<OpKind, Vec<Step>>>,
    pub hardware_manager_version: Mutex<Option<String>>,
    pub get_steps_calls: Mutex<usize>,
    pub finalize_status: Mutex<Option<AgentCommandStatus>>,
    pub lockdowns: Mutex<usize>,
}

impl FakeAgent {
    pub fn set_history(&self, commands: Vec<AgentCommand>) {
        *self.history.lock().unwrap() = commands;
    }

    pub fn set_reported_steps(&self, kind: OpKind, steps: Vec<Step>) {
        self.reported_steps.lock().unwrap().insert(kind, steps);
    }
}

#[async_trait]
impl AgentClient for FakeAgent {
    async fn execute_step(
        &self,
        _node: &Node,
        kind: OpKind,
        _step: &Step,
    ) -> Result<AgentCommand, AgentError> {
        Ok(AgentCommand {
            command_name: kind.execute_command().to_owned(),
            command_status: AgentCommandStatus::Running,
            command_result: None,
            command_error: None,
        })
    }

    async fn get_steps(
        &self,
        _node: &Node,
        kind: OpKind,
    ) -> Result<AgentCommand, AgentError> {
        *self.get_steps_calls.lock().unwrap() += 1;
        let steps = self
            .reported_steps
            .lock()
            .unwrap()
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        let mut result = serde_json::Map::new();
        result.insert(
            format!("{kind}_steps"),
            serde_json::to_value(&steps).expect("steps serialize"),
        );
        if let Some(version) =
            self.hardware_manager_version.lock().unwrap().clone()
        {
            result.insert(
                "hardware_manager_version".to_owned(),
                serde_json::Value::String(version),
            );
        }
        Ok(AgentCommand {
            command_name: kind.get_steps_command().to_owned(),
            command_status: AgentCommandStatus::Succeeded,
            command_result: Some(serde_json::Value::Object(result)),
            command_error: None,
        })
    }

    async fn commands_status(
        &self,
        _node: &Node,
    ) -> Result<Vec<AgentCommand>, AgentError> {
        Ok(self.history.lock().unwrap().clone())
    }

    async fn finalize_rescue(
        &self,
        _node: &Node,
    ) -> Result<AgentCommand, AgentError> {
        let status = self
            .finalize_status
            .lock()
            .unwrap()
            .unwrap_or(AgentCommandStatus::Succeeded);
        Ok(AgentCommand {
            command_name: "finalize_rescue".to_owned(),
            command_status: status,
            command_result: None,
            command_error: None,
        })
    }

    async fn lockdown(&self, _node: &Node) -> Result<(), AgentError> {
        *self.lockdowns.lock().unwrap() += 1;
        Ok(())
    }
}

/// A complete engine wired to in-memory fakes.
pub(crate) struct Fixture {
    pub cx: ConductorContext,
    pub store: Arc<InMemoryNodeStore>,
    pub driver: Arc<FakeDriver>,
    pub agent: Arc<FakeAgent>,
}

impl Fixture {
    pub fn new(config: Config, driver: FakeDriver) -> Self {
        let store = Arc::new(InMemoryNodeStore::default());
        let driver = Arc::new(driver);
        let agent = Arc::new(FakeAgent::default());
        let cx = ConductorContext::new(
            &test_logger(),
            config,
            Arc::clone(&store) as Arc<dyn NodeStore>,
            Arc::clone(&driver) as Arc<dyn Driver>,
            Arc::clone(&agent) as Arc<dyn AgentClient>,
        );
        Self { cx, store, driver, agent }
    }

    pub async fn task(&self, id: NodeId) -> NodeTask {
        self.cx.acquire(id, "test").await.expect("acquire node")
    }

    pub fn node(&self, id: NodeId) -> Node {
        self.store.node(id)
    }
}
