// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Agent heartbeat processing.
//!
//! The remote agent checks in periodically; depending on the node's
//! provision state a heartbeat either just refreshes bookkeeping or drives
//! the next step of an in-progress operation. Nothing raised while
//! processing a heartbeat propagates to the RPC caller: failures are
//! converted into node state through the error handlers.

use anvil_types::agent::{
    freshly_booted, AgentCommand, AgentCommandStatus, HeartbeatInfo,
};
use anvil_types::node::NodeId;
use anvil_types::state::{ProvisionEvent, ProvisionState};
use anvil_types::steps::OpKind;
use chrono::Utc;
use display_error_chain::DisplayErrorChain;
use slog::{debug, error, info, warn};

use crate::catalog;
use crate::context::{ConductorContext, NodeTask};
use crate::errors::TaskError;
use crate::executor::{self, is_manual};
use crate::handlers::{self, ErrorHandlerOpts};

/// Processes one agent check-in.
///
/// Best-effort by design: if the node is locked by a concurrent operation
/// the heartbeat is skipped silently and the agent's next check-in retries.
pub async fn on_heartbeat(
    cx: &ConductorContext,
    node_id: NodeId,
    info: &HeartbeatInfo,
) {
    let mut task = match cx.acquire(node_id, "agent heartbeat").await {
        Ok(task) => task,
        Err(TaskError::NodeLocked { node, held_for }) => {
            debug!(
                cx.log,
                "node locked, deferring heartbeat to the next one";
                "node" => %node,
                "held_for" => held_for,
            );
            return;
        }
        Err(error) => {
            error!(
                cx.log, "could not load node for heartbeat";
                "node" => %node_id,
                "error" => %DisplayErrorChain::new(&error),
            );
            return;
        }
    };

    // Last-seen bookkeeping is refreshed on every accepted heartbeat,
    // whatever else happens.
    task.node.record_agent_heartbeat(
        &info.callback_url,
        info.agent_version.as_deref(),
        Utc::now(),
    );
    if let Err(error) = task.save().await {
        error!(
            task.log, "could not record heartbeat bookkeeping";
            "error" => %DisplayErrorChain::new(&error),
        );
        return;
    }

    if task.node.maintenance
        && !cx.config.allow_provisioning_in_maintenance
    {
        abort_for_maintenance(cx, &mut task).await;
        return;
    }

    let state = task.node.provision_state;
    if state.records_heartbeat_only() {
        debug!(task.log, "heartbeat recorded"; "state" => %state);
        return;
    }

    let result = match state {
        ProvisionState::CleanWait => {
            continue_wait(cx, &mut task, OpKind::Clean).await
        }
        ProvisionState::DeployWait => {
            continue_wait(cx, &mut task, OpKind::Deploy).await
        }
        ProvisionState::ServiceWait => {
            continue_wait(cx, &mut task, OpKind::Service).await
        }
        ProvisionState::RescueWait => finalize_rescue(cx, &mut task).await,
        state => {
            if !cx.config.fast_track {
                error!(
                    task.log,
                    "heartbeat received in unsupported provision state";
                    "state" => %state,
                );
            }
            Ok(())
        }
    };

    if let Err(error) = result {
        on_heartbeat_failure(cx, &mut task, error).await;
    }
}

/// Top-level catch: log with full context and, if a nested handler has not
/// already moved the node to a terminal failure, route through the
/// kind-appropriate error handler.
async fn on_heartbeat_failure(
    cx: &ConductorContext,
    task: &mut NodeTask,
    error: anyhow::Error,
) {
    warn!(
        task.log, "heartbeat processing failed";
        "state" => %task.node.provision_state,
        "error" => format!("{error:#}"),
    );
    let state = task.node.provision_state;
    let message = format!("heartbeat processing failed: {error:#}");
    let result = match state {
        ProvisionState::Rescuing | ProvisionState::RescueWait => {
            handlers::rescue_error(cx, task, &message).await
        }
        state => match state.op_kind() {
            Some(kind)
                if state.is_wait() || state == kind.active_state() =>
            {
                handlers::operation_error(
                    cx,
                    task,
                    kind,
                    &message,
                    ErrorHandlerOpts::default(),
                )
                .await
            }
            _ => Ok(()),
        },
    };
    if let Err(handler_error) = result {
        error!(
            task.log, "error handler itself failed";
            "error" => %DisplayErrorChain::new(&handler_error),
        );
    }
}

async fn abort_for_maintenance(cx: &ConductorContext, task: &mut NodeTask) {
    let state = task.node.provision_state;
    let message = "node entered maintenance mode while an operation was \
                   in progress";
    let result = match state {
        ProvisionState::Rescuing | ProvisionState::RescueWait => {
            handlers::rescue_error(cx, task, message).await
        }
        state => match state.op_kind() {
            Some(kind)
                if state.is_wait() || state == kind.active_state() =>
            {
                handlers::operation_error(
                    cx,
                    task,
                    kind,
                    message,
                    ErrorHandlerOpts::default(),
                )
                .await
            }
            _ => {
                debug!(
                    task.log,
                    "heartbeat in maintenance mode ignored";
                    "state" => %state,
                );
                Ok(())
            }
        },
    };
    if let Err(error) = result {
        error!(
            task.log, "failed to abort operation for maintenance";
            "error" => %DisplayErrorChain::new(&error),
        );
    }
}

/// Continuation for a node sitting in one of the step wait states.
async fn continue_wait(
    cx: &ConductorContext,
    task: &mut NodeTask,
    kind: OpKind,
) -> anyhow::Result<()> {
    if task.node.cached_agent_steps(kind).is_none() {
        // First heartbeat after a ramdisk boot: this is the point at which
        // in-band steps become available, so validation deferred at
        // operation start is re-run strictly now.
        refresh_agent_steps(cx, task, kind).await?;
        rebuild_step_list(cx, task, kind).await?;
    }

    if task.node.polling(kind) {
        // The capability driver polls for completion on its own.
        debug!(task.log, "driver is polling, leaving continuation to it");
        return Ok(());
    }

    process_next_step(cx, task, kind).await
}

/// Fetches and caches the agent's in-band step catalog along with the
/// hardware manager version that produced it.
async fn refresh_agent_steps(
    cx: &ConductorContext,
    task: &mut NodeTask,
    kind: OpKind,
) -> anyhow::Result<()> {
    let command = cx.agent.get_steps(&task.node, kind).await?;
    let steps = command.reported_steps(kind).unwrap_or_default();
    info!(
        task.log, "cached agent-reported steps";
        "kind" => %kind,
        "count" => steps.len(),
    );
    task.node.set_cached_agent_steps(kind, Some(&steps));
    if let Some(version) = command.hardware_manager_version() {
        task.node.set_hardware_manager_version(&version);
    }
    task.save().await?;
    Ok(())
}

/// Recomputes the persisted step list the same way operation start did,
/// but strictly (nothing deferred), preserving the current step's position
/// in the new list.
async fn rebuild_step_list(
    cx: &ConductorContext,
    task: &mut NodeTask,
    kind: OpKind,
) -> anyhow::Result<()> {
    let steps = match kind {
        OpKind::Clean => {
            let user = task.node.user_steps(kind);
            catalog::clean_step_list(
                cx,
                &task.node,
                user.as_deref(),
                false,
                task.node.disable_ramdisk(kind),
            )
            .await?
        }
        OpKind::Deploy => {
            catalog::merge_deploy_steps(cx, &task.node, None, false).await?
        }
        OpKind::Service => {
            let user = task.node.user_steps(kind).unwrap_or_default();
            catalog::service_step_list(cx, &task.node, &user, false).await?
        }
    };
    let index = match task.node.current_step(kind) {
        Some(current) => {
            steps.iter().position(|s| s.same_step(current)).unwrap_or(0)
        }
        None => task.node.step_index(kind).unwrap_or(0),
    };
    task.node.set_steps(kind, Some(&steps));
    task.node.set_step_index(
        kind,
        if steps.is_empty() { None } else { Some(index) },
    );
    task.save().await?;
    Ok(())
}

/// Inspects the agent's command history and advances the operation if the
/// in-flight step has finished.
async fn process_next_step(
    cx: &ConductorContext,
    task: &mut NodeTask,
    kind: OpKind,
) -> anyhow::Result<()> {
    let history = cx.agent.commands_status(&task.node).await?;

    if freshly_booted(&history, kind) {
        if task.node.reboot_pending(kind) {
            task.node.set_reboot_pending(kind, false);
            task.save().await?;
        }
        debug!(task.log, "agent freshly booted, resuming step list");
        return executor::continue_operation(cx, task, kind)
            .await
            .map_err(Into::into);
    }

    let Some(last) = history
        .iter()
        .rev()
        .find(|c| c.command_name == kind.execute_command())
    else {
        debug!(
            task.log,
            "no step command in agent history, nothing to continue"
        );
        return Ok(());
    };
    let last = last.clone();

    if last.command_status.is_version_mismatch() {
        return on_version_mismatch(cx, task, kind).await;
    }
    match last.command_status {
        AgentCommandStatus::Running => Ok(()),
        AgentCommandStatus::Succeeded => {
            on_step_succeeded(cx, task, kind, &last).await
        }
        AgentCommandStatus::Failed => {
            let step_id = task
                .node
                .current_step(kind)
                .map(|s| s.id())
                .unwrap_or_else(|| "<unknown>".to_owned());
            let message = format!(
                "agent reported {} step {step_id} failed: {}",
                kind,
                last.command_error
                    .as_deref()
                    .unwrap_or("no error detail provided")
            );
            handlers::operation_error(
                cx,
                task,
                kind,
                &message,
                ErrorHandlerOpts::default(),
            )
            .await
            .map_err(Into::into)
        }
        // Mismatch variants were handled above.
        _ => Ok(()),
    }
}

/// The in-flight step completed on the agent: run any post-step hook,
/// honor reboot and fail-after markers, then advance the list.
async fn on_step_succeeded(
    cx: &ConductorContext,
    task: &mut NodeTask,
    kind: OpKind,
    command: &AgentCommand,
) -> anyhow::Result<()> {
    let Some(current) = task.node.current_step(kind).cloned() else {
        // No step is recorded as running; fall back to position-based
        // resumption.
        return executor::continue_operation(cx, task, kind)
            .await
            .map_err(Into::into);
    };

    // Idempotency across heartbeats: a command echoing a different step
    // than the recorded one was already consumed by a previous heartbeat.
    // The one exception is a cleared skip flag, which means the current
    // step's command was refused while the agent was busy and still needs
    // (re-)issuing now that the busy command has finished.
    if let Some(echoed) = command.echoed_step(kind) {
        if !echoed.same_step(&current) {
            if !task.node.skip_current_step(kind) {
                debug!(
                    task.log, "agent no longer busy, re-issuing step";
                    "step" => current.id(),
                );
                return executor::continue_operation(cx, task, kind)
                    .await
                    .map_err(Into::into);
            }
            debug!(
                task.log, "stale step completion, ignoring";
                "echoed" => echoed.id(),
                "current" => current.id(),
            );
            return Ok(());
        }
    }
    info!(
        task.log, "agent completed {} step", kind;
        "step" => current.id(),
    );

    if let Some(hook) = cx.hooks.lookup(kind, &current) {
        if let Err(error) = hook(&task.log, &mut task.node, command) {
            let message = format!(
                "post-step hook for {} failed: {error:#}",
                current.id()
            );
            return executor::fail_step(
                cx,
                task,
                kind,
                &current,
                message,
            )
            .await
            .map_err(Into::into);
        }
        task.save().await?;
    }

    if current.reboot_requested {
        info!(
            task.log, "rebooting into ramdisk after step";
            "step" => current.id(),
        );
        cx.driver.reboot_to_ramdisk(&task.node).await?;
        task.node.set_reboot_pending(kind, true);
        task.save().await?;
        // The next step starts once the agent heartbeats back in with a
        // fresh boot.
        return Ok(());
    }

    let steps = task.node.steps(kind).unwrap_or_default();
    let index = task.node.step_index(kind).unwrap_or(0);
    if current.abort_after && index + 1 < steps.len() {
        warn!(
            task.log, "failing {} after step as requested",
            kind.phase_str();
            "step" => current.id(),
        );
        return executor::abort_operation(cx, task, kind, Some(&current))
            .await
            .map_err(Into::into);
    }

    executor::continue_operation(cx, task, kind).await.map_err(Into::into)
}

/// Hardware-manager version mismatch recovery.
///
/// The agent can be upgraded independently mid-operation, making the
/// computed step list stale. Automated cleaning restarts wholesale;
/// manual cleaning preserves exact user intent and only re-runs the
/// current step; deploy and service re-validate and resume from the
/// current step's position in the refreshed list.
async fn on_version_mismatch(
    cx: &ConductorContext,
    task: &mut NodeTask,
    kind: OpKind,
) -> anyhow::Result<()> {
    let previous = task.node.hardware_manager_version();
    refresh_agent_steps(cx, task, kind).await?;
    info!(
        task.log, "hardware manager version changed mid-{}",
        kind.phase_str();
        "previous" => previous,
        "current" => task.node.hardware_manager_version(),
    );

    match kind {
        OpKind::Clean if !is_manual(&task.node, kind) => {
            task.node.set_current_step(kind, None);
            let steps =
                catalog::available_steps(cx, &task.node, kind, true)
                    .await?;
            task.node.set_steps(kind, Some(&steps));
            task.node.set_step_index(
                kind,
                if steps.is_empty() { None } else { Some(0) },
            );
            task.node.set_skip_current_step(kind, true);
            task.save().await?;
            if task.node.provision_state == kind.wait_state() {
                task.process_event(ProvisionEvent::Resume).await?;
            }
            executor::execute_step_list(cx, task, kind, 0)
                .await
                .map_err(Into::into)
        }
        OpKind::Clean => {
            task.node.set_skip_current_step(kind, false);
            task.save().await?;
            executor::continue_operation(cx, task, kind)
                .await
                .map_err(Into::into)
        }
        OpKind::Deploy | OpKind::Service => {
            rebuild_step_list(cx, task, kind).await?;
            task.node.set_skip_current_step(kind, false);
            task.save().await?;
            executor::continue_operation(cx, task, kind)
                .await
                .map_err(Into::into)
        }
    }
}

/// Continuation for rescue-wait: the ramdisk is up, ask the agent to
/// finalize rescue access.
async fn finalize_rescue(
    cx: &ConductorContext,
    task: &mut NodeTask,
) -> anyhow::Result<()> {
    let command = cx.agent.finalize_rescue(&task.node).await?;
    match command.command_status {
        AgentCommandStatus::Succeeded => {
            info!(task.log, "rescue finalized");
            task.process_event(ProvisionEvent::Done).await?;
            Ok(())
        }
        AgentCommandStatus::Running => Ok(()),
        status => {
            let message = format!(
                "agent failed to finalize rescue (status {status:?}): {}",
                command
                    .command_error
                    .as_deref()
                    .unwrap_or("no error detail provided")
            );
            handlers::rescue_error(cx, task, &message)
                .await
                .map_err(Into::into)
        }
    }
}
