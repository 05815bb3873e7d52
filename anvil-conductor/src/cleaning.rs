// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cleaning operation façade.
//!
//! Automated cleaning runs every enabled step the node offers when it is
//! released; manual cleaning runs a caller-supplied list and returns the
//! node to manageable. Entry points are invoked with an exclusively-locked
//! node already in the cleaning state.

use anvil_types::state::{ProvisionEvent, ProvisionState};
use anvil_types::steps::{OpKind, Step};
use slog::info;

use crate::catalog;
use crate::context::{ConductorContext, NodeTask};
use crate::errors::EngineError;
use crate::executor;
use crate::handlers::{self, ErrorHandlerOpts};

/// Starts cleaning. `user_steps` being present makes this a manual clean.
pub async fn do_node_clean(
    cx: &ConductorContext,
    task: &mut NodeTask,
    user_steps: Option<Vec<Step>>,
    disable_ramdisk: bool,
) -> Result<(), EngineError> {
    let manual = user_steps.is_some();
    info!(
        task.log, "starting {} cleaning",
        if manual { "manual" } else { "automated" }
    );

    if !manual && !cx.config.automated_clean {
        info!(task.log, "automated cleaning is disabled, nothing to do");
        task.process_event(ProvisionEvent::Done).await?;
        return Ok(());
    }

    if task.node.maintenance
        && !cx.config.allow_provisioning_in_maintenance
    {
        handlers::operation_error(
            cx,
            task,
            OpKind::Clean,
            "cannot clean a node in maintenance mode",
            ErrorHandlerOpts { tear_down: false, set_fail_state: true },
        )
        .await?;
        return Ok(());
    }

    if let Err(error) =
        cx.driver.validate(OpKind::Clean, &task.node).await
    {
        handlers::operation_error(
            cx,
            task,
            OpKind::Clean,
            &format!("driver validation failed before cleaning: {error:#}"),
            ErrorHandlerOpts { tear_down: false, set_fail_state: true },
        )
        .await?;
        return Ok(());
    }

    task.node.target_provision_state = Some(if manual {
        ProvisionState::Manageable
    } else {
        ProvisionState::Available
    });
    if disable_ramdisk {
        task.node.set_disable_ramdisk(OpKind::Clean, true);
    }
    if let Some(user) = &user_steps {
        task.node.set_user_steps(OpKind::Clean, Some(user));
    }
    task.save().await?;

    if !disable_ramdisk {
        if executor::prepare_ramdisk(cx, task, OpKind::Clean).await? {
            return Ok(());
        }
    }

    // Validation of steps the agent hasn't reported yet is deferred until
    // its first heartbeat; with the ramdisk disabled nothing will ever be
    // reported, so validate strictly now.
    let skip_missing = !disable_ramdisk
        && task.node.cached_agent_steps(OpKind::Clean).is_none();
    let steps = match catalog::clean_step_list(
        cx,
        &task.node,
        user_steps.as_deref(),
        skip_missing,
        disable_ramdisk,
    )
    .await
    {
        Ok(steps) => steps,
        Err(error) => {
            return executor::start_failed(cx, task, OpKind::Clean, error)
                .await;
        }
    };
    task.node.set_steps(OpKind::Clean, Some(&steps));
    task.node.set_step_index(
        OpKind::Clean,
        if steps.is_empty() { None } else { Some(0) },
    );
    task.save().await?;

    executor::execute_step_list(cx, task, OpKind::Clean, 0).await
}

/// Re-entry point after an async wait; the next index is computed from the
/// node's recorded position, never from the caller.
pub async fn continue_node_clean(
    cx: &ConductorContext,
    task: &mut NodeTask,
) -> Result<(), EngineError> {
    executor::continue_operation(cx, task, OpKind::Clean).await
}

/// Aborts a clean sitting in the wait state.
pub async fn do_node_clean_abort(
    cx: &ConductorContext,
    task: &mut NodeTask,
) -> Result<(), EngineError> {
    executor::abort_operation(cx, task, OpKind::Clean, None).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::test_utils::{
        FakeDriver, FakeStepHandler, Fixture, Scripted,
    };
    use anvil_types::node::{Node, NodeId};
    use anvil_types::steps::Interface;

    fn cleaning_node() -> Node {
        Node::new(NodeId::new_v4(), ProvisionState::Cleaning)
    }

    #[tokio::test]
    async fn automated_clean_sorts_steps_and_suspends_on_wait() {
        let handler = FakeStepHandler::new(vec![
            Step::new(Interface::Deploy, "write_image", 20),
            Step::new(Interface::Deploy, "erase_devices", 30),
        ]);
        handler.script("deploy.write_image", Scripted::Wait);
        let fixture = Fixture::new(
            Config::default(),
            FakeDriver::new()
                .with_handler(Interface::Deploy, Arc::clone(&handler)),
        );
        let node = cleaning_node();
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        do_node_clean(&fixture.cx, &mut task, None, false)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        // Priority 30 ran first, priority 20 went asynchronous.
        assert_eq!(
            handler.executed_ids(),
            ["deploy.erase_devices", "deploy.write_image"]
        );
        assert_eq!(node.provision_state, ProvisionState::CleanWait);
        assert_eq!(node.step_index(OpKind::Clean), Some(1));
        assert_eq!(
            node.clean_step.as_ref().map(Step::id).as_deref(),
            Some("deploy.write_image")
        );
        assert_eq!(
            node.target_provision_state,
            Some(ProvisionState::Available)
        );
    }

    #[tokio::test]
    async fn automated_clean_skipped_when_disabled() {
        let handler = FakeStepHandler::new(vec![Step::new(
            Interface::Deploy,
            "erase_devices",
            30,
        )]);
        let config = Config {
            automated_clean: false,
            ..Config::default()
        };
        let fixture = Fixture::new(
            config,
            FakeDriver::new()
                .with_handler(Interface::Deploy, Arc::clone(&handler)),
        );
        let node = cleaning_node();
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        do_node_clean(&fixture.cx, &mut task, None, false)
            .await
            .unwrap();
        drop(task);

        assert!(handler.executed_ids().is_empty());
        assert_eq!(
            fixture.node(id).provision_state,
            ProvisionState::Available
        );
    }

    #[tokio::test]
    async fn manual_clean_returns_to_manageable() {
        let mut offered = Step::new(Interface::Deploy, "erase_devices", 30);
        offered.abortable = Some(true);
        let handler = FakeStepHandler::new(vec![offered]);
        let fixture = Fixture::new(
            Config::default(),
            FakeDriver::new()
                .with_handler(Interface::Deploy, Arc::clone(&handler)),
        );
        let mut node = cleaning_node();
        // In-band catalog already known, so validation is strict.
        node.set_cached_agent_steps(OpKind::Clean, Some(&[]));
        let id = node.id;
        fixture.store.insert(node);

        let user = vec![Step::new(Interface::Deploy, "erase_devices", 0)];
        let mut task = fixture.task(id).await;
        do_node_clean(&fixture.cx, &mut task, Some(user), false)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(handler.executed_ids(), ["deploy.erase_devices"]);
        assert_eq!(node.provision_state, ProvisionState::Manageable);
        assert!(node.last_error.is_none());
    }

    #[tokio::test]
    async fn manual_clean_with_unsupported_step_fails() {
        let fixture = Fixture::new(Config::default(), FakeDriver::new());
        let mut node = cleaning_node();
        node.set_cached_agent_steps(OpKind::Clean, Some(&[]));
        let id = node.id;
        fixture.store.insert(node);

        let user = vec![Step::new(Interface::Raid, "create_config", 0)];
        let mut task = fixture.task(id).await;
        do_node_clean(&fixture.cx, &mut task, Some(user), false)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(node.provision_state, ProvisionState::CleanFail);
        let last_error = node.last_error.unwrap();
        assert!(
            last_error.contains("raid.create_config"),
            "last_error: {last_error}"
        );
    }

    #[tokio::test]
    async fn maintenance_refuses_to_start() {
        let fixture = Fixture::new(Config::default(), FakeDriver::new());
        let mut node = cleaning_node();
        node.maintenance = true;
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        do_node_clean(&fixture.cx, &mut task, None, false)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(node.provision_state, ProvisionState::CleanFail);
        assert!(node.last_error.unwrap().contains("maintenance"));
    }

    #[tokio::test]
    async fn driver_validation_failure_fails_node() {
        let fixture = Fixture::new(Config::default(), FakeDriver::new());
        *fixture.driver.validate_error.lock().unwrap() =
            Some("power credentials missing".to_owned());
        let node = cleaning_node();
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        do_node_clean(&fixture.cx, &mut task, None, false)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(node.provision_state, ProvisionState::CleanFail);
        assert!(node
            .last_error
            .unwrap()
            .contains("power credentials missing"));
    }

    #[tokio::test]
    async fn async_ramdisk_preparation_parks_the_node() {
        let handler = FakeStepHandler::new(vec![Step::new(
            Interface::Deploy,
            "erase_devices",
            30,
        )]);
        let fixture = Fixture::new(
            Config::default(),
            FakeDriver::new()
                .with_handler(Interface::Deploy, Arc::clone(&handler)),
        );
        fixture
            .driver
            .prepare_results
            .lock()
            .unwrap()
            .push_back(Scripted::Wait);
        let node = cleaning_node();
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        do_node_clean(&fixture.cx, &mut task, None, false)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(node.provision_state, ProvisionState::CleanWait);
        // No step has started; the list is built on continuation.
        assert!(node.clean_step.is_none());
        assert!(handler.executed_ids().is_empty());
    }

    #[tokio::test]
    async fn empty_step_list_finishes_immediately() {
        let fixture = Fixture::new(Config::default(), FakeDriver::new());
        let node = cleaning_node();
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        do_node_clean(&fixture.cx, &mut task, None, false)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(node.provision_state, ProvisionState::Available);
        assert_eq!(
            *fixture.driver.torn_down.lock().unwrap(),
            [OpKind::Clean]
        );
    }

    #[tokio::test]
    async fn ramdisk_less_manual_clean_skips_prepare_and_teardown() {
        let mut offered =
            Step::new(Interface::Management, "reset_bmc", 10);
        offered.requires_ramdisk = false;
        let handler = FakeStepHandler::new(vec![offered]);
        let fixture = Fixture::new(
            Config::default(),
            FakeDriver::new()
                .with_handler(Interface::Management, Arc::clone(&handler)),
        );
        // If preparation were attempted it would park the node and fail
        // the assertions below.
        fixture
            .driver
            .prepare_results
            .lock()
            .unwrap()
            .push_back(Scripted::Wait);
        let mut node = cleaning_node();
        node.set_cached_agent_steps(OpKind::Clean, Some(&[]));
        let id = node.id;
        fixture.store.insert(node);

        let user = vec![Step::new(Interface::Management, "reset_bmc", 0)];
        let mut task = fixture.task(id).await;
        do_node_clean(&fixture.cx, &mut task, Some(user), true)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(handler.executed_ids(), ["management.reset_bmc"]);
        assert_eq!(node.provision_state, ProvisionState::Manageable);
        assert!(fixture.driver.torn_down.lock().unwrap().is_empty());
    }
}
