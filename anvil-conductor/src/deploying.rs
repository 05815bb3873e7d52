// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deployment operation façade.
//!
//! The deploy step list merges three sources: caller-supplied override
//! steps, templates matched against the node's traits, and the driver's
//! enabled steps, with user steps winning identity collisions. Entry
//! points are invoked with an exclusively-locked node already in the
//! deploying state.

use anvil_types::steps::{OpKind, Step};
use slog::info;

use crate::catalog;
use crate::context::{ConductorContext, NodeTask};
use crate::errors::EngineError;
use crate::executor;
use crate::handlers::{self, ErrorHandlerOpts};

/// Starts a deployment.
pub async fn do_node_deploy(
    cx: &ConductorContext,
    task: &mut NodeTask,
    user_steps: Option<Vec<Step>>,
) -> Result<(), EngineError> {
    info!(task.log, "starting deployment");

    if task.node.maintenance
        && !cx.config.allow_provisioning_in_maintenance
    {
        handlers::operation_error(
            cx,
            task,
            OpKind::Deploy,
            "cannot deploy a node in maintenance mode",
            ErrorHandlerOpts { tear_down: false, set_fail_state: true },
        )
        .await?;
        return Ok(());
    }

    // Deploy validation covers power and network plus the instance
    // definition (traits, image references).
    if let Err(error) =
        cx.driver.validate(OpKind::Deploy, &task.node).await
    {
        handlers::operation_error(
            cx,
            task,
            OpKind::Deploy,
            &format!(
                "driver validation failed before deployment: {error:#}"
            ),
            ErrorHandlerOpts { tear_down: false, set_fail_state: true },
        )
        .await?;
        return Ok(());
    }

    if let Some(user) = &user_steps {
        task.node.set_user_steps(OpKind::Deploy, Some(user));
    }
    task.save().await?;

    if executor::prepare_ramdisk(cx, task, OpKind::Deploy).await? {
        return Ok(());
    }

    let skip_missing =
        task.node.cached_agent_steps(OpKind::Deploy).is_none();
    let steps = match catalog::merge_deploy_steps(
        cx,
        &task.node,
        user_steps.as_deref(),
        skip_missing,
    )
    .await
    {
        Ok(steps) => steps,
        Err(error) => {
            return executor::start_failed(cx, task, OpKind::Deploy, error)
                .await;
        }
    };
    task.node.set_steps(OpKind::Deploy, Some(&steps));
    task.node.set_step_index(
        OpKind::Deploy,
        if steps.is_empty() { None } else { Some(0) },
    );
    task.save().await?;

    executor::execute_step_list(cx, task, OpKind::Deploy, 0).await
}

/// Re-entry point after an async wait.
pub async fn continue_node_deploy(
    cx: &ConductorContext,
    task: &mut NodeTask,
) -> Result<(), EngineError> {
    executor::continue_operation(cx, task, OpKind::Deploy).await
}

/// Aborts a deployment sitting in the wait state.
pub async fn do_node_deploy_abort(
    cx: &ConductorContext,
    task: &mut NodeTask,
) -> Result<(), EngineError> {
    executor::abort_operation(cx, task, OpKind::Deploy, None).await
}
