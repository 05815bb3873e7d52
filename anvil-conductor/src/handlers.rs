// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operation error handlers.
//!
//! These are the single funnel for "this operation is over and it did not
//! succeed": they record last_error, clear the per-operation bookkeeping,
//! optionally tear down the environment, and drive the FSM to the kind's
//! fail state. Teardown failures inside a handler are logged and folded
//! into last_error but never recurse into another teardown.

use anvil_types::state::{ProvisionEvent, ProvisionState};
use anvil_types::steps::OpKind;
use display_error_chain::DisplayErrorChain;
use slog::warn;

use crate::context::{ConductorContext, NodeTask};
use crate::errors::EngineError;

#[derive(Clone, Copy, Debug)]
pub struct ErrorHandlerOpts {
    /// Tear down the operation environment as part of failing.
    pub tear_down: bool,
    /// Drive the FSM to the kind's fail state. Disabled when the handler
    /// runs as the degraded path of an abort whose teardown failed.
    pub set_fail_state: bool,
}

impl Default for ErrorHandlerOpts {
    fn default() -> Self {
        Self { tear_down: true, set_fail_state: true }
    }
}

/// Fails an in-progress clean/deploy/service operation.
pub async fn operation_error(
    cx: &ConductorContext,
    task: &mut NodeTask,
    kind: OpKind,
    message: &str,
    opts: ErrorHandlerOpts,
) -> Result<(), EngineError> {
    warn!(
        task.log, "{} failed", kind.phase_str();
        "error" => message,
    );
    let disable_ramdisk = task.node.disable_ramdisk(kind);
    task.node.last_error = Some(message.to_owned());
    task.node.clear_operation_state(kind);
    task.save().await?;

    if opts.tear_down && !disable_ramdisk {
        if let Err(error) = cx.driver.tear_down(kind, &task.node).await {
            warn!(
                task.log, "teardown failed while handling {} failure",
                kind.phase_str();
                "error" => %DisplayErrorChain::new(
                    AsRef::<dyn std::error::Error>::as_ref(&error)
                ),
            );
            task.node.last_error = Some(format!(
                "{message}. Also failed to tear down: {error:#}"
            ));
            task.save().await?;
        }
    }

    if opts.set_fail_state
        && task.node.provision_state != kind.fail_state()
    {
        task.process_event(ProvisionEvent::Fail).await?;
    }
    Ok(())
}

/// Fails an in-progress rescue: records last_error, locks the agent down
/// so the rescue ramdisk stops accepting commands, and drives the FSM to
/// rescue-fail.
pub async fn rescue_error(
    cx: &ConductorContext,
    task: &mut NodeTask,
    message: &str,
) -> Result<(), EngineError> {
    warn!(task.log, "rescue failed"; "error" => message);
    task.node.last_error = Some(message.to_owned());
    task.save().await?;

    if let Err(error) = cx.agent.lockdown(&task.node).await {
        warn!(
            task.log, "failed to lock down agent while failing rescue";
            "error" => %DisplayErrorChain::new(&error),
        );
    }

    if task.node.provision_state != ProvisionState::RescueFail {
        task.process_event(ProvisionEvent::Fail).await?;
    }
    Ok(())
}
