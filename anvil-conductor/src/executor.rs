// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Step executor: drives a node through its persisted step list.
//!
//! Steps run one at a time, synchronously in the calling invocation, until
//! one goes asynchronous (the node enters the kind's wait state and control
//! returns to the caller) or fails. Continuation after a wait happens from
//! the heartbeat path via [`continue_operation`].
//!
//! Before any capability call that might fail or take a long time, the
//! current step and index are persisted, so "what was running when it
//! died" is always recoverable from the node record alone.

use anvil_types::node::Node;
use anvil_types::state::{ProvisionEvent, ProvisionState};
use anvil_types::steps::{OpKind, Step, StepOutcome};
use display_error_chain::DisplayErrorChain;
use slog::{debug, info, warn};

use crate::context::{ConductorContext, NodeTask};
use crate::errors::{CatalogError, EngineError, StepHandlerError};
use crate::handlers::{self, ErrorHandlerOpts};

/// True when this operation was explicitly requested with a caller-supplied
/// step list. Only cleaning has an automated flavor; deploy and service
/// operations are always explicit requests.
pub(crate) fn is_manual(node: &Node, kind: OpKind) -> bool {
    match kind {
        OpKind::Clean => {
            node.target_provision_state == Some(ProvisionState::Manageable)
        }
        OpKind::Deploy | OpKind::Service => true,
    }
}

/// Executes the node's persisted step list for `kind`, starting at
/// `start_index`.
///
/// Step-level failures are consumed here and routed through the error
/// handlers; only infrastructure failures (store, FSM misuse) propagate.
pub async fn execute_step_list(
    cx: &ConductorContext,
    task: &mut NodeTask,
    kind: OpKind,
    start_index: usize,
) -> Result<(), EngineError> {
    let steps = task.node.steps(kind).unwrap_or_default();

    for index in start_index..steps.len() {
        let step = steps[index].clone();

        // Durability checkpoint: the step must be visible in persisted
        // state before anything slow or fallible runs.
        task.node.set_current_step(kind, Some(step.clone()));
        task.node.set_step_index(kind, Some(index));
        task.save().await?;
        info!(
            task.log, "executing {} step", kind;
            "step" => step.id(),
            "index" => index,
        );

        let result = if step.execute_on_child_nodes {
            execute_on_children(cx, task, kind, &step).await
        } else {
            match cx.driver.step_handler(step.interface) {
                Some(handler) => {
                    handler.execute_step(kind, &task.node, &step).await
                }
                None => Err(StepHandlerError::Failed(format!(
                    "node has no {} interface",
                    step.interface
                ))),
            }
        };

        match result {
            Ok(StepOutcome::Complete) => {
                info!(
                    task.log, "{} step completed", kind;
                    "step" => step.id(),
                );
                if step.abort_after && index + 1 < steps.len() {
                    warn!(
                        task.log, "failing {} after step as requested",
                        kind.phase_str();
                        "step" => step.id(),
                    );
                    task.process_event(ProvisionEvent::Wait).await?;
                    return abort_operation(cx, task, kind, Some(&step))
                        .await;
                }
                // On the last step the marker has nothing left to abort.
                if step.reboot_requested {
                    return reboot_between_steps(cx, task, kind, &step)
                        .await;
                }
            }
            Ok(StepOutcome::Wait) => {
                debug!(
                    task.log,
                    "{} step went asynchronous, waiting for agent", kind;
                    "step" => step.id(),
                );
                task.process_event(ProvisionEvent::Wait).await?;
                return Ok(());
            }
            Ok(StepOutcome::Other(value)) => {
                let message = format!(
                    "step {} returned invalid value: {value}",
                    step.id()
                );
                return fail_step(cx, task, kind, &step, message).await;
            }
            Err(StepHandlerError::AgentBusy) => {
                info!(
                    task.log,
                    "agent busy, step will be retried on the next \
                     heartbeat";
                    "step" => step.id(),
                );
                task.node.set_skip_current_step(kind, false);
                task.save().await?;
                task.process_event(ProvisionEvent::Wait).await?;
                return Ok(());
            }
            Err(StepHandlerError::AgentUnreachable)
                if task.node.reboot_pending(kind) =>
            {
                info!(
                    task.log,
                    "agent unreachable while a requested reboot is \
                     pending, waiting for it to come back";
                    "step" => step.id(),
                );
                task.process_event(ProvisionEvent::Wait).await?;
                return Ok(());
            }
            Err(error) => {
                let message = match &error {
                    StepHandlerError::Unexpected(e) => format!(
                        "{} step {} failed: {e:#}",
                        kind,
                        step.id()
                    ),
                    e => {
                        format!("{} step {} failed: {e}", kind, step.id())
                    }
                };
                return fail_step(cx, task, kind, &step, message).await;
            }
        }
    }

    finish_operation(cx, task, kind).await
}

/// Re-entry point used after an async wait: recomputes the next index from
/// persisted state rather than trusting a caller-supplied value.
pub async fn continue_operation(
    cx: &ConductorContext,
    task: &mut NodeTask,
    kind: OpKind,
) -> Result<(), EngineError> {
    let start_index = match task.node.step_index(kind) {
        None => 0,
        Some(index) => {
            if task.node.current_step(kind).is_none() {
                // The recorded step never started (for example the wait
                // came from ramdisk preparation); begin at the recorded
                // position without advancing.
                index
            } else if task.node.skip_current_step(kind) {
                index + 1
            } else {
                // The current step must be re-executed; consume the flag.
                task.node.set_skip_current_step(kind, true);
                task.save().await?;
                index
            }
        }
    };
    if task.node.provision_state == kind.wait_state() {
        task.process_event(ProvisionEvent::Resume).await?;
    }
    execute_step_list(cx, task, kind, start_index).await
}

/// Aborts an in-progress operation: teardown, a descriptive last_error
/// naming the step it aborted during (or after, for the fail-after-step
/// marker), and cleared bookkeeping. Never raises past a teardown failure.
pub async fn abort_operation(
    cx: &ConductorContext,
    task: &mut NodeTask,
    kind: OpKind,
    after_step: Option<&Step>,
) -> Result<(), EngineError> {
    let during = task.node.current_step(kind).cloned();
    let message = match (after_step, &during) {
        (Some(step), _) => format!(
            "{} aborted after step {}",
            kind.phase_str(),
            step.id()
        ),
        (None, Some(step)) => format!(
            "{} aborted during step {}",
            kind.phase_str(),
            step.id()
        ),
        (None, None) => format!("{} aborted", kind.phase_str()),
    };
    info!(task.log, "aborting {}", kind.phase_str(); "reason" => &message);

    if task.node.provision_state == kind.wait_state() {
        task.process_event(ProvisionEvent::Abort).await?;
    }

    if !task.node.disable_ramdisk(kind) {
        if let Err(error) = cx.driver.tear_down(kind, &task.node).await {
            warn!(
                task.log, "teardown failed during abort";
                "error" => %DisplayErrorChain::new(
                    AsRef::<dyn std::error::Error>::as_ref(&error)
                ),
            );
            // Store a generic message; the detailed one is in the log.
            // No second teardown attempt.
            handlers::operation_error(
                cx,
                task,
                kind,
                &format!(
                    "failed to tear down {} after abort",
                    kind.phase_str()
                ),
                ErrorHandlerOpts { tear_down: false, set_fail_state: false },
            )
            .await?;
            return Ok(());
        }
    }

    task.node.last_error = Some(message);
    task.node.clear_operation_state(kind);
    task.save().await?;
    Ok(())
}

/// Completion path once every step has executed: clear bookkeeping, tear
/// down the environment, and signal the terminal done transition.
pub(crate) async fn finish_operation(
    cx: &ConductorContext,
    task: &mut NodeTask,
    kind: OpKind,
) -> Result<(), EngineError> {
    let disable_ramdisk = task.node.disable_ramdisk(kind);
    task.node.clear_operation_state(kind);
    task.node.last_error = None;
    task.save().await?;

    if !disable_ramdisk {
        if let Err(error) = cx.driver.tear_down(kind, &task.node).await {
            // The operation itself succeeded; teardown failure is its own
            // failure path and must not trigger another teardown.
            let message = format!(
                "failed to tear down after {} completed: {error:#}",
                kind.phase_str()
            );
            handlers::operation_error(
                cx,
                task,
                kind,
                &message,
                ErrorHandlerOpts { tear_down: false, set_fail_state: true },
            )
            .await?;
            return Ok(());
        }
    }

    task.process_event(ProvisionEvent::Done).await?;
    info!(task.log, "{} finished", kind.phase_str());
    Ok(())
}

/// Asks the boot interface to bring up the agent ramdisk at operation
/// start. Returns true when the caller should stop here: either
/// preparation went asynchronous (the node is parked in the wait state) or
/// it failed (the error handler already ran).
pub(crate) async fn prepare_ramdisk(
    cx: &ConductorContext,
    task: &mut NodeTask,
    kind: OpKind,
) -> Result<bool, EngineError> {
    match cx.driver.prepare_ramdisk(kind, &task.node).await {
        Ok(StepOutcome::Complete) => Ok(false),
        Ok(StepOutcome::Wait) => {
            task.process_event(ProvisionEvent::Wait).await?;
            Ok(true)
        }
        Ok(StepOutcome::Other(value)) => {
            handlers::operation_error(
                cx,
                task,
                kind,
                &format!(
                    "ramdisk preparation returned invalid value: {value}"
                ),
                ErrorHandlerOpts::default(),
            )
            .await?;
            Ok(true)
        }
        Err(error) => {
            handlers::operation_error(
                cx,
                task,
                kind,
                &format!("failed to prepare ramdisk: {error}"),
                ErrorHandlerOpts::default(),
            )
            .await?;
            Ok(true)
        }
    }
}

/// Step-list construction failed at operation start; route through the
/// error handler.
pub(crate) async fn start_failed(
    cx: &ConductorContext,
    task: &mut NodeTask,
    kind: OpKind,
    error: CatalogError,
) -> Result<(), EngineError> {
    let message = format!(
        "cannot start {}: {}",
        kind.phase_str(),
        DisplayErrorChain::new(&error)
    );
    handlers::operation_error(
        cx,
        task,
        kind,
        &message,
        ErrorHandlerOpts::default(),
    )
    .await
}

/// Fans one step out to the node's children, each under its own exclusive
/// lock, sequentially. The first child failure fails the parent step with
/// a message naming the child.
async fn execute_on_children(
    cx: &ConductorContext,
    task: &mut NodeTask,
    kind: OpKind,
    step: &Step,
) -> Result<StepOutcome, StepHandlerError> {
    let children = cx
        .store
        .list_children(task.node.id)
        .await
        .map_err(|e| StepHandlerError::Unexpected(anyhow::Error::new(e)))?;

    for child_id in children {
        if !step.limit_child_node_execution.is_empty()
            && !step.limit_child_node_execution.contains(&child_id)
        {
            continue;
        }
        let mut child = cx
            .acquire(child_id, "child-node step execution")
            .await
            .map_err(|e| {
                StepHandlerError::Failed(format!(
                    "could not lock child node {child_id}: {e}"
                ))
            })?;
        let Some(handler) = cx.driver.step_handler(step.interface) else {
            return Err(StepHandlerError::Failed(format!(
                "child node {child_id} has no {} interface",
                step.interface
            )));
        };

        // Same durability checkpoint as on the parent.
        child.node.set_current_step(kind, Some(step.clone()));
        child.save().await.map_err(|e| {
            StepHandlerError::Unexpected(anyhow::Error::new(e))
        })?;
        debug!(
            task.log, "executing {} step on child node", kind;
            "step" => step.id(),
            "child" => %child_id,
        );

        match handler.execute_step(kind, &child.node, step).await {
            Ok(StepOutcome::Complete) => {
                child.node.set_current_step(kind, None);
                child.save().await.map_err(|e| {
                    StepHandlerError::Unexpected(anyhow::Error::new(e))
                })?;
            }
            Ok(StepOutcome::Wait)
                if cx.config.allow_child_node_async_steps =>
            {
                // The child continues on its own; move to the next one.
            }
            Ok(StepOutcome::Wait) => {
                return Err(StepHandlerError::Failed(format!(
                    "step {} on child node {child_id} returned an \
                     asynchronous result, which is not permitted",
                    step.id()
                )));
            }
            Ok(StepOutcome::Other(value)) => {
                return Err(StepHandlerError::Failed(format!(
                    "step {} failed on child node {child_id}: {value}",
                    step.id()
                )));
            }
            Err(error) => {
                return Err(StepHandlerError::Failed(format!(
                    "step {} failed on child node {child_id}: {error}",
                    step.id()
                )));
            }
        }
    }
    Ok(StepOutcome::Complete)
}

async fn reboot_between_steps(
    cx: &ConductorContext,
    task: &mut NodeTask,
    kind: OpKind,
    step: &Step,
) -> Result<(), EngineError> {
    info!(
        task.log, "rebooting into ramdisk after step";
        "step" => step.id(),
    );
    match cx.driver.reboot_to_ramdisk(&task.node).await {
        Ok(()) => {
            task.node.set_reboot_pending(kind, true);
            task.save().await?;
            task.process_event(ProvisionEvent::Wait).await?;
            Ok(())
        }
        Err(error) => {
            let message = format!(
                "failed to reboot after step {}: {error:#}",
                step.id()
            );
            fail_step(cx, task, kind, step, message).await
        }
    }
}

/// Fatal step failure: ramdisk log collection, then the kind's error
/// handler.
pub(crate) async fn fail_step(
    cx: &ConductorContext,
    task: &mut NodeTask,
    kind: OpKind,
    step: &Step,
    message: String,
) -> Result<(), EngineError> {
    warn!(
        task.log, "{} step failed", kind;
        "step" => step.id(),
        "error" => &message,
    );
    if cx.config.collect_ramdisk_logs && !task.node.disable_ramdisk(kind) {
        cx.driver.collect_ramdisk_logs(kind, &task.node).await;
    }
    handlers::operation_error(
        cx,
        task,
        kind,
        &message,
        ErrorHandlerOpts::default(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::test_utils::{
        FakeDriver, FakeStepHandler, Fixture, Scripted,
    };
    use anvil_types::node::NodeId;
    use anvil_types::steps::Interface;

    fn cleaning_node(steps: &[Step]) -> Node {
        let mut node =
            Node::new(NodeId::new_v4(), ProvisionState::Cleaning);
        node.target_provision_state = Some(ProvisionState::Available);
        node.set_steps(OpKind::Clean, Some(steps));
        node.set_step_index(
            OpKind::Clean,
            if steps.is_empty() { None } else { Some(0) },
        );
        node
    }

    fn fixture_with_deploy_handler(
        handler: &Arc<FakeStepHandler>,
    ) -> Fixture {
        Fixture::new(
            Config::default(),
            FakeDriver::new()
                .with_handler(Interface::Deploy, Arc::clone(handler)),
        )
    }

    #[tokio::test]
    async fn wait_suspends_at_current_index() {
        let handler = FakeStepHandler::new(vec![]);
        handler.script("deploy.write_image", Scripted::Wait);
        let fixture = fixture_with_deploy_handler(&handler);

        let node = cleaning_node(&[
            Step::new(Interface::Deploy, "erase_devices", 30),
            Step::new(Interface::Deploy, "write_image", 20),
        ]);
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        execute_step_list(&fixture.cx, &mut task, OpKind::Clean, 0)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(node.provision_state, ProvisionState::CleanWait);
        assert_eq!(node.step_index(OpKind::Clean), Some(1));
        assert_eq!(
            node.clean_step.as_ref().map(Step::id).as_deref(),
            Some("deploy.write_image")
        );
        assert_eq!(
            handler.executed_ids(),
            ["deploy.erase_devices", "deploy.write_image"]
        );
    }

    #[tokio::test]
    async fn completion_tears_down_and_finishes() {
        let handler = FakeStepHandler::new(vec![]);
        let fixture = fixture_with_deploy_handler(&handler);

        let node = cleaning_node(&[Step::new(
            Interface::Deploy,
            "erase_devices",
            30,
        )]);
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        execute_step_list(&fixture.cx, &mut task, OpKind::Clean, 0)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(node.provision_state, ProvisionState::Available);
        assert!(node.clean_step.is_none());
        assert!(node.steps(OpKind::Clean).is_none());
        assert!(node.step_index(OpKind::Clean).is_none());
        assert_eq!(
            *fixture.driver.torn_down.lock().unwrap(),
            [OpKind::Clean]
        );
    }

    #[tokio::test]
    async fn invalid_return_value_is_a_contract_violation() {
        let handler = FakeStepHandler::new(vec![]);
        handler.script(
            "deploy.erase_devices",
            Scripted::Other(serde_json::json!(42)),
        );
        let fixture = fixture_with_deploy_handler(&handler);

        let node = cleaning_node(&[Step::new(
            Interface::Deploy,
            "erase_devices",
            30,
        )]);
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        execute_step_list(&fixture.cx, &mut task, OpKind::Clean, 0)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(node.provision_state, ProvisionState::CleanFail);
        let last_error = node.last_error.unwrap();
        assert!(last_error.contains("deploy.erase_devices"));
        assert!(last_error.contains("returned invalid value"));
    }

    #[tokio::test]
    async fn busy_agent_waits_without_failing() {
        let handler = FakeStepHandler::new(vec![]);
        handler.script("deploy.erase_devices", Scripted::Busy);
        let fixture = fixture_with_deploy_handler(&handler);

        let node = cleaning_node(&[Step::new(
            Interface::Deploy,
            "erase_devices",
            30,
        )]);
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        execute_step_list(&fixture.cx, &mut task, OpKind::Clean, 0)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(node.provision_state, ProvisionState::CleanWait);
        assert!(node.last_error.is_none());
        // The step must be re-executed, not skipped, on continuation.
        assert!(!node.skip_current_step(OpKind::Clean));
        assert_eq!(node.step_index(OpKind::Clean), Some(0));
    }

    #[tokio::test]
    async fn unreachable_agent_waits_while_reboot_pending() {
        let handler = FakeStepHandler::new(vec![]);
        handler.script("deploy.erase_devices", Scripted::Unreachable);
        let fixture = fixture_with_deploy_handler(&handler);

        let mut node = cleaning_node(&[Step::new(
            Interface::Deploy,
            "erase_devices",
            30,
        )]);
        node.set_reboot_pending(OpKind::Clean, true);
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        execute_step_list(&fixture.cx, &mut task, OpKind::Clean, 0)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(node.provision_state, ProvisionState::CleanWait);
        assert!(node.last_error.is_none());
    }

    #[tokio::test]
    async fn unreachable_agent_fails_without_pending_reboot() {
        let handler = FakeStepHandler::new(vec![]);
        handler.script("deploy.erase_devices", Scripted::Unreachable);
        let fixture = fixture_with_deploy_handler(&handler);

        let node = cleaning_node(&[Step::new(
            Interface::Deploy,
            "erase_devices",
            30,
        )]);
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        execute_step_list(&fixture.cx, &mut task, OpKind::Clean, 0)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(node.provision_state, ProvisionState::CleanFail);
        assert_eq!(*fixture.driver.log_collections.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn reboot_requested_pauses_between_steps() {
        let handler = FakeStepHandler::new(vec![]);
        let fixture = fixture_with_deploy_handler(&handler);

        let mut first = Step::new(Interface::Deploy, "flash_firmware", 30);
        first.reboot_requested = true;
        let node = cleaning_node(&[
            first,
            Step::new(Interface::Deploy, "erase_devices", 20),
        ]);
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        execute_step_list(&fixture.cx, &mut task, OpKind::Clean, 0)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(node.provision_state, ProvisionState::CleanWait);
        assert!(node.reboot_pending(OpKind::Clean));
        assert_eq!(node.step_index(OpKind::Clean), Some(0));
        assert_eq!(*fixture.driver.reboots.lock().unwrap(), 1);
        assert_eq!(handler.executed_ids(), ["deploy.flash_firmware"]);
    }

    #[tokio::test]
    async fn abort_after_marker_aborts_mid_list() {
        let handler = FakeStepHandler::new(vec![]);
        let fixture = fixture_with_deploy_handler(&handler);

        let mut second = Step::new(Interface::Deploy, "burnin", 20);
        second.abort_after = true;
        let node = cleaning_node(&[
            Step::new(Interface::Deploy, "erase_devices", 30),
            second,
            Step::new(Interface::Deploy, "write_image", 10),
        ]);
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        execute_step_list(&fixture.cx, &mut task, OpKind::Clean, 0)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(node.provision_state, ProvisionState::CleanFail);
        let last_error = node.last_error.unwrap();
        assert!(
            last_error.contains("after step deploy.burnin"),
            "last_error: {last_error}"
        );
        // The third step never ran.
        assert_eq!(
            handler.executed_ids(),
            ["deploy.erase_devices", "deploy.burnin"]
        );
        assert_eq!(
            *fixture.driver.torn_down.lock().unwrap(),
            [OpKind::Clean]
        );
    }

    #[tokio::test]
    async fn abort_after_on_last_step_is_a_noop() {
        let handler = FakeStepHandler::new(vec![]);
        let fixture = fixture_with_deploy_handler(&handler);

        let mut last = Step::new(Interface::Deploy, "burnin", 20);
        last.abort_after = true;
        let node = cleaning_node(&[
            Step::new(Interface::Deploy, "erase_devices", 30),
            last,
        ]);
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        execute_step_list(&fixture.cx, &mut task, OpKind::Clean, 0)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(node.provision_state, ProvisionState::Available);
        assert!(node.last_error.is_none());
    }

    #[tokio::test]
    async fn child_failure_names_the_child() {
        let handler = FakeStepHandler::new(vec![]);
        // First child completes, second returns an error value.
        handler.script("deploy.update_firmware", Scripted::Complete);
        handler.script(
            "deploy.update_firmware",
            Scripted::Other(serde_json::json!("firmware image rejected")),
        );
        let fixture = fixture_with_deploy_handler(&handler);

        let mut step = Step::new(Interface::Deploy, "update_firmware", 30);
        step.execute_on_child_nodes = true;
        let parent = cleaning_node(&[step]);
        let parent_id = parent.id;
        fixture.store.insert(parent);
        for _ in 0..2 {
            let mut child = Node::new(
                NodeId::new_v4(),
                ProvisionState::Available,
            );
            child.parent_node = Some(parent_id);
            fixture.store.insert(child);
        }

        let mut task = fixture.task(parent_id).await;
        execute_step_list(&fixture.cx, &mut task, OpKind::Clean, 0)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(parent_id);
        assert_eq!(node.provision_state, ProvisionState::CleanFail);
        let failed_child =
            handler.executed.lock().unwrap().last().unwrap().0;
        let last_error = node.last_error.unwrap();
        assert!(
            last_error.contains(&failed_child.to_string()),
            "last_error does not name child {failed_child}: {last_error}"
        );
        assert!(last_error.contains("firmware image rejected"));
    }

    #[tokio::test]
    async fn child_limit_restricts_fan_out() {
        let handler = FakeStepHandler::new(vec![]);
        let fixture = fixture_with_deploy_handler(&handler);

        let first_child = NodeId::new_v4();
        let second_child = NodeId::new_v4();
        let mut step = Step::new(Interface::Deploy, "update_firmware", 30);
        step.execute_on_child_nodes = true;
        step.limit_child_node_execution = vec![second_child];
        let parent = cleaning_node(&[step]);
        let parent_id = parent.id;
        fixture.store.insert(parent);
        for id in [first_child, second_child] {
            let mut child =
                Node::new(id, ProvisionState::Available);
            child.parent_node = Some(parent_id);
            fixture.store.insert(child);
        }

        let mut task = fixture.task(parent_id).await;
        execute_step_list(&fixture.cx, &mut task, OpKind::Clean, 0)
            .await
            .unwrap();
        drop(task);

        let executed = handler.executed.lock().unwrap().clone();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].0, second_child);
        assert_eq!(
            fixture.node(parent_id).provision_state,
            ProvisionState::Available
        );
    }

    #[tokio::test]
    async fn continue_advances_or_repeats_per_skip_flag() {
        let handler = FakeStepHandler::new(vec![]);
        let fixture = fixture_with_deploy_handler(&handler);

        let steps = [
            Step::new(Interface::Deploy, "erase_devices", 30),
            Step::new(Interface::Deploy, "write_image", 20),
        ];
        let mut node = cleaning_node(&steps);
        node.provision_state = ProvisionState::CleanWait;
        node.set_current_step(OpKind::Clean, Some(steps[0].clone()));
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        continue_operation(&fixture.cx, &mut task, OpKind::Clean)
            .await
            .unwrap();
        drop(task);

        // Skip flag defaults to true: the recorded step is considered
        // consumed and execution picks up at the next index.
        assert_eq!(handler.executed_ids(), ["deploy.write_image"]);
        assert_eq!(
            fixture.node(id).provision_state,
            ProvisionState::Available
        );
    }

    #[tokio::test]
    async fn continue_repeats_current_step_when_skip_cleared() {
        let handler = FakeStepHandler::new(vec![]);
        let fixture = fixture_with_deploy_handler(&handler);

        let steps = [
            Step::new(Interface::Deploy, "erase_devices", 30),
            Step::new(Interface::Deploy, "write_image", 20),
        ];
        let mut node = cleaning_node(&steps);
        node.provision_state = ProvisionState::CleanWait;
        node.set_current_step(OpKind::Clean, Some(steps[0].clone()));
        node.set_skip_current_step(OpKind::Clean, false);
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        continue_operation(&fixture.cx, &mut task, OpKind::Clean)
            .await
            .unwrap();
        drop(task);

        assert_eq!(
            handler.executed_ids(),
            ["deploy.erase_devices", "deploy.write_image"]
        );
        // The flag is consumed on use.
        assert!(fixture.node(id).skip_current_step(OpKind::Clean));
    }

    #[tokio::test]
    async fn teardown_failure_after_completion_is_distinct() {
        let handler = FakeStepHandler::new(vec![]);
        let fixture = fixture_with_deploy_handler(&handler);
        *fixture.driver.teardown_error.lock().unwrap() =
            Some("pxe config stuck".to_owned());

        let node = cleaning_node(&[Step::new(
            Interface::Deploy,
            "erase_devices",
            30,
        )]);
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        execute_step_list(&fixture.cx, &mut task, OpKind::Clean, 0)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(node.provision_state, ProvisionState::CleanFail);
        assert!(node
            .last_error
            .unwrap()
            .contains("failed to tear down after cleaning completed"));
        // No recursive teardown.
        assert_eq!(fixture.driver.torn_down.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn abort_names_the_step_it_interrupted() {
        let handler = FakeStepHandler::new(vec![]);
        let fixture = fixture_with_deploy_handler(&handler);

        let steps =
            [Step::new(Interface::Deploy, "erase_devices", 30)];
        let mut node = cleaning_node(&steps);
        node.provision_state = ProvisionState::CleanWait;
        node.set_current_step(OpKind::Clean, Some(steps[0].clone()));
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        abort_operation(&fixture.cx, &mut task, OpKind::Clean, None)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(node.provision_state, ProvisionState::CleanFail);
        assert!(node
            .last_error
            .unwrap()
            .contains("aborted during step deploy.erase_devices"));
        assert!(node.clean_step.is_none());
        assert_eq!(
            *fixture.driver.torn_down.lock().unwrap(),
            [OpKind::Clean]
        );
    }

    #[tokio::test]
    async fn abort_time_teardown_failure_degrades_to_generic_error() {
        let handler = FakeStepHandler::new(vec![]);
        let fixture = fixture_with_deploy_handler(&handler);
        *fixture.driver.teardown_error.lock().unwrap() =
            Some("bmc wedged".to_owned());

        let mut node = cleaning_node(&[Step::new(
            Interface::Deploy,
            "erase_devices",
            30,
        )]);
        node.provision_state = ProvisionState::CleanWait;
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        abort_operation(&fixture.cx, &mut task, OpKind::Clean, None)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(node.provision_state, ProvisionState::CleanFail);
        let last_error = node.last_error.unwrap();
        // Generic message; the detailed one went to the log.
        assert!(last_error.contains("failed to tear down"));
        assert!(!last_error.contains("bmc wedged"));
        assert_eq!(fixture.driver.torn_down.lock().unwrap().len(), 1);
    }
}
