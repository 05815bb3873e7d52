// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error taxonomy of the step-execution engine.
//!
//! Validation errors surface to the caller before an operation starts;
//! everything that happens after the first persisted state change is
//! converted into a node-state change (last_error plus a fail transition)
//! instead of propagating.

use anvil_types::node::NodeId;
use anvil_types::state::InvalidTransition;
use anvil_types::steps::Interface;
use thiserror::Error;

/// Client-input failure from step validation. Carries the aggregate of
/// every problem found, semicolon-joined; validation never stops at the
/// first problem.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StepValidationError {
    pub message: String,
}

impl StepValidationError {
    pub fn new(problems: Vec<String>) -> Self {
        Self { message: problems.join("; ") }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node {0} not found")]
    NotFound(NodeId),
    #[error("node store failure")]
    Other(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("node {node} is locked by a concurrent operation ({held_for})")]
    NodeLocked { node: NodeId, held_for: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures of the agent transport client.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent is busy executing another command")]
    Busy,
    #[error("agent could not be reached")]
    Unreachable,
    #[error("agent command {command} failed: {message}")]
    Command { command: String, message: String },
    #[error("agent transport failure")]
    Transport(#[source] anyhow::Error),
}

/// Failures of a capability handler executing one step.
#[derive(Debug, Error)]
pub enum StepHandlerError {
    /// The agent is busy with another command; the step will be retried on
    /// the next heartbeat without re-issuing it.
    #[error("agent is busy executing another command")]
    AgentBusy,
    /// The agent could not be reached. Quietly tolerated while a reboot we
    /// requested is pending; fatal otherwise.
    #[error("agent could not be reached")]
    AgentUnreachable,
    /// An expected, typed failure with a driver-provided message.
    #[error("{0}")]
    Failed(String),
    /// Unexpected failure from driver code; the full source chain is
    /// logged.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl From<AgentError> for StepHandlerError {
    fn from(error: AgentError) -> Self {
        match error {
            AgentError::Busy => StepHandlerError::AgentBusy,
            AgentError::Unreachable => StepHandlerError::AgentUnreachable,
            error => StepHandlerError::Unexpected(anyhow::Error::new(error)),
        }
    }
}

/// Failures producing a step list.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Validation(#[from] StepValidationError),
    #[error("querying {interface} steps failed")]
    Driver {
        interface: Interface,
        #[source]
        source: anyhow::Error,
    },
}

/// Top-level engine error: what the RPC entry points may return to their
/// caller. Step-level failures never appear here; they are consumed by the
/// error handlers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] StepValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}
