// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Servicing operation façade.
//!
//! Servicing runs a caller-supplied step list against an already-deployed
//! node and returns it to active. An empty list is the no-op fast path:
//! immediate teardown and done.

use anvil_types::steps::{OpKind, Step};
use slog::info;

use crate::catalog;
use crate::context::{ConductorContext, NodeTask};
use crate::errors::EngineError;
use crate::executor;
use crate::handlers::{self, ErrorHandlerOpts};

/// Starts servicing with the caller's explicit step list.
pub async fn do_node_service(
    cx: &ConductorContext,
    task: &mut NodeTask,
    service_steps: Vec<Step>,
    disable_ramdisk: bool,
) -> Result<(), EngineError> {
    info!(task.log, "starting servicing"; "steps" => service_steps.len());

    if disable_ramdisk {
        task.node.set_disable_ramdisk(OpKind::Service, true);
        task.save().await?;
    }
    if service_steps.is_empty() {
        // Nothing to do; tear down whatever the caller set up and finish.
        return executor::finish_operation(cx, task, OpKind::Service).await;
    }

    if task.node.maintenance
        && !cx.config.allow_provisioning_in_maintenance
    {
        handlers::operation_error(
            cx,
            task,
            OpKind::Service,
            "cannot service a node in maintenance mode",
            ErrorHandlerOpts { tear_down: false, set_fail_state: true },
        )
        .await?;
        return Ok(());
    }

    if let Err(error) =
        cx.driver.validate(OpKind::Service, &task.node).await
    {
        handlers::operation_error(
            cx,
            task,
            OpKind::Service,
            &format!(
                "driver validation failed before servicing: {error:#}"
            ),
            ErrorHandlerOpts { tear_down: false, set_fail_state: true },
        )
        .await?;
        return Ok(());
    }

    task.node.set_user_steps(OpKind::Service, Some(&service_steps));
    task.save().await?;

    if !disable_ramdisk {
        if executor::prepare_ramdisk(cx, task, OpKind::Service).await? {
            return Ok(());
        }
    }

    // With the ramdisk disabled the agent will never report in-band
    // steps, so nothing is deferred.
    let skip_missing = !disable_ramdisk
        && task.node.cached_agent_steps(OpKind::Service).is_none();
    let steps = match catalog::service_step_list(
        cx,
        &task.node,
        &service_steps,
        skip_missing,
    )
    .await
    {
        Ok(steps) => steps,
        Err(error) => {
            return executor::start_failed(
                cx,
                task,
                OpKind::Service,
                error,
            )
            .await;
        }
    };
    task.node.set_steps(OpKind::Service, Some(&steps));
    task.node.set_step_index(
        OpKind::Service,
        if steps.is_empty() { None } else { Some(0) },
    );
    task.save().await?;

    executor::execute_step_list(cx, task, OpKind::Service, 0).await
}

/// Re-entry point after an async wait.
pub async fn continue_node_service(
    cx: &ConductorContext,
    task: &mut NodeTask,
) -> Result<(), EngineError> {
    executor::continue_operation(cx, task, OpKind::Service).await
}

/// Aborts a service operation sitting in the wait state.
pub async fn do_node_service_abort(
    cx: &ConductorContext,
    task: &mut NodeTask,
) -> Result<(), EngineError> {
    executor::abort_operation(cx, task, OpKind::Service, None).await
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
    use anvil_types::state::ProvisionState;
    use anvil_types::steps::Interface;

    fn servicing_node() -> Node {
        Node::new(NodeId::new_v4(), ProvisionState::Servicing)
    }

    #[tokio::test]
    async fn empty_step_list_tears_down_and_finishes() {
        let fixture = Fixture::new(Config::default(), FakeDriver::new());
        let node = servicing_node();
        let id = node.id;
        fixture.store.insert(node);

        let mut task = fixture.task(id).await;
        do_node_service(&fixture.cx, &mut task, Vec::new(), false)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        assert_eq!(node.provision_state, ProvisionState::Active);
        assert_eq!(
            *fixture.driver.torn_down.lock().unwrap(),
            [OpKind::Service]
        );
    }

    #[tokio::test]
    async fn service_steps_run_in_priority_order() {
        let mut hold = Step::new(Interface::Management, "hold_power", 10);
        hold.requires_ramdisk = false;
        let handler = FakeStepHandler::new(vec![
            Step::new(Interface::Management, "update_firmware", 50),
            hold,
        ]);
        handler.script("management.update_firmware", Scripted::Wait);
        let fixture = Fixture::new(
            Config::default(),
            FakeDriver::new()
                .with_handler(Interface::Management, Arc::clone(&handler)),
        );
        let mut node = servicing_node();
        node.set_cached_agent_steps(OpKind::Service, Some(&[]));
        let id = node.id;
        fixture.store.insert(node);

        let steps = vec![
            Step::new(Interface::Management, "hold_power", 10),
            Step::new(Interface::Management, "update_firmware", 50),
        ];
        let mut task = fixture.task(id).await;
        do_node_service(&fixture.cx, &mut task, steps, false)
            .await
            .unwrap();
        drop(task);

        let node = fixture.node(id);
        // Higher priority first; it went asynchronous.
        assert_eq!(
            handler.executed_ids(),
            ["management.update_firmware"]
        );
        assert_eq!(node.provision_state, ProvisionState::ServiceWait);
        assert_eq!(node.step_index(OpKind::Service), Some(0));
        assert_eq!(
            node.service_step.as_ref().map(|s| s.id()).as_deref(),
            Some("management.update_firmware")
        );
    }
}
