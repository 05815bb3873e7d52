// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Step catalog: collects, validates, deduplicates, and orders the steps of
//! one operation.
//!
//! Steps come from three sources: capability interfaces queried live
//! through the driver, user-supplied lists (manual cleaning, explicit
//! deploy/service steps), and deploy templates matched against the node's
//! traits. Validation collects every problem it finds and raises once with
//! the aggregate, never failing on the first.

use std::collections::BTreeMap;

use anvil_types::node::Node;
use anvil_types::steps::{
    find_step, sort_steps, Interface, OpKind, Step,
};
use itertools::Itertools;
use slog::{debug, warn};

use crate::context::ConductorContext;
use crate::errors::{CatalogError, StepValidationError};

/// Options for [`collect_steps`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CollectOptions<'a> {
    /// Drop steps whose (possibly overridden) priority is 0.
    pub enabled_only: bool,
    /// Sort the result into execution order.
    pub sort: bool,
    /// Step-id-keyed priority overrides. Values may be JSON numbers or
    /// numeric strings.
    pub priority_overrides:
        Option<&'a BTreeMap<String, serde_json::Value>>,
}

fn coerce_priority(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Queries each named interface that has a capability handler for its steps
/// of `kind`, applying overrides and filters per `opts`.
pub async fn collect_steps(
    cx: &ConductorContext,
    node: &Node,
    kind: OpKind,
    interfaces: &[Interface],
    opts: CollectOptions<'_>,
) -> Result<Vec<Step>, CatalogError> {
    let mut out = Vec::new();
    for interface in interfaces {
        let Some(handler) = cx.driver.step_handler(*interface) else {
            continue;
        };
        let steps = handler.steps(kind, node).await.map_err(|source| {
            CatalogError::Driver { interface: *interface, source }
        })?;
        out.extend(steps);
    }

    if let Some(overrides) = opts.priority_overrides {
        for step in &mut out {
            let Some(value) = overrides.get(&step.id()) else { continue };
            match coerce_priority(value) {
                Some(priority) => step.priority = priority,
                None => warn!(
                    cx.log, "ignoring non-numeric priority override";
                    "step" => step.id(),
                    "value" => %value,
                ),
            }
        }
    }

    if opts.enabled_only {
        out.retain(|s| s.priority > 0);
    }
    if opts.sort {
        sort_steps(&mut out);
    }
    Ok(out)
}

/// The full set of steps currently available for `kind` on this node: every
/// interface's out-of-band steps plus the cached in-band steps the agent
/// reported, the former shadowing the latter on identity collision.
pub async fn available_steps(
    cx: &ConductorContext,
    node: &Node,
    kind: OpKind,
    enabled_only: bool,
) -> Result<Vec<Step>, CatalogError> {
    let mut steps = collect_steps(
        cx,
        node,
        kind,
        &Interface::ALL,
        CollectOptions { enabled_only, sort: false, priority_overrides: None },
    )
    .await?;
    if let Some(cached) = node.cached_agent_steps(kind) {
        for step in cached {
            if find_step(&steps, &step).is_none()
                && (!enabled_only || step.priority > 0)
            {
                steps.push(step);
            }
        }
    }
    sort_steps(&mut steps);
    Ok(steps)
}

/// Validates user-supplied steps against the steps the driver actually
/// supports, returning the user list with driver-authoritative fields
/// injected.
///
/// With `skip_missing`, steps the driver does not (yet) report are passed
/// through untouched; this is used before the in-band agent has reported
/// its catalog, and validation is re-run strictly once it has. Re-running
/// on an already-validated list with unchanged inputs is a no-op.
pub fn validate_user_steps(
    driver_steps: &[Step],
    user_steps: &[Step],
    kind: OpKind,
    skip_missing: bool,
    disable_ramdisk: bool,
) -> Result<Vec<Step>, StepValidationError> {
    let mut problems = Vec::new();
    let mut out = Vec::with_capacity(user_steps.len());

    for user in user_steps {
        let mut user = user.clone();
        let Some(driver) = find_step(driver_steps, &user) else {
            if !skip_missing {
                problems.push(format!(
                    "node does not support step {}",
                    user.id()
                ));
            }
            out.push(user);
            continue;
        };

        validate_step_args(&user, driver, kind, &mut problems);

        match kind {
            OpKind::Clean => {
                // The driver is authoritative for these; user-provided
                // values are ignored.
                user.abortable = driver.abortable;
                user.priority = driver.priority;
                user.requires_ramdisk = driver.requires_ramdisk;
                if disable_ramdisk && driver.requires_ramdisk {
                    problems.push(format!(
                        "step {} requires the agent ramdisk, which was \
                         disabled for this operation",
                        user.id()
                    ));
                }
            }
            OpKind::Deploy => {
                // The one core deploy step may be kept but never remapped
                // to custom behavior; user steps may otherwise enable a
                // disabled step or adjust ordering.
                if driver.is_core_deploy()
                    && user.priority != driver.priority
                {
                    problems.push(format!(
                        "step {} is a core deploy step whose priority \
                         cannot be overridden",
                        user.id()
                    ));
                }
            }
            OpKind::Service => {}
        }

        out.push(user);
    }

    // Identity must be unique across the whole list, regardless of
    // priority or args.
    let duplicates: Vec<String> = out
        .iter()
        .duplicates_by(|s| (s.interface, s.step.clone()))
        .map(Step::id)
        .collect();
    if !duplicates.is_empty() {
        problems.push(format!(
            "duplicate steps: {}",
            duplicates.join(", ")
        ));
    }

    if problems.is_empty() {
        Ok(out)
    } else {
        Err(StepValidationError::new(problems))
    }
}

/// Checks one user step's args against the driver step's argsinfo schema,
/// appending every problem found.
fn validate_step_args(
    user: &Step,
    driver: &Step,
    kind: OpKind,
    problems: &mut Vec<String>,
) {
    let empty = BTreeMap::new();
    let argsinfo = driver.argsinfo.as_ref().unwrap_or(&empty);

    for name in user.args.keys() {
        if !argsinfo.contains_key(name) {
            problems.push(format!(
                "step {} does not accept argument {name:?}",
                user.id()
            ));
        }
    }

    // Mandatory arguments are enforced for every clean step, and for
    // deploy/service steps actually selected to run.
    let enforce_required =
        kind == OpKind::Clean || user.priority > 0;
    if !enforce_required {
        return;
    }
    for (name, info) in argsinfo {
        if info.required && !user.args.contains_key(name) {
            match &info.description {
                Some(desc) => problems.push(format!(
                    "step {} is missing required argument {name:?} ({desc})",
                    user.id()
                )),
                None => problems.push(format!(
                    "step {} is missing required argument {name:?}",
                    user.id()
                )),
            }
        }
    }
}

/// Builds the merged deploy step list: user-override steps (the explicit
/// argument takes precedence over previously stored node state), template
/// steps that do not collide with them, and enabled driver steps that
/// collide with neither, sorted into execution order.
pub async fn merge_deploy_steps(
    cx: &ConductorContext,
    node: &Node,
    user_steps: Option<&[Step]>,
    skip_missing: bool,
) -> Result<Vec<Step>, CatalogError> {
    let user: Vec<Step> = user_steps
        .map(<[Step]>::to_vec)
        .or_else(|| node.user_steps(OpKind::Deploy))
        .unwrap_or_default();

    let mut selected = user;
    for template in &cx.templates {
        if !node.traits.contains(&template.name) {
            continue;
        }
        debug!(
            cx.log, "applying deploy template";
            "node" => %node.id,
            "template" => &template.name,
        );
        for step in &template.steps {
            if find_step(&selected, step).is_none() {
                selected.push(step.clone());
            }
        }
    }

    // Validation runs against everything the node offers, including
    // disabled steps (a user step may enable one); only enabled steps are
    // merged in to fill the rest of the list.
    let driver_steps =
        available_steps(cx, node, OpKind::Deploy, false).await?;
    let mut merged = validate_user_steps(
        &driver_steps,
        &selected,
        OpKind::Deploy,
        skip_missing,
        false,
    )?;

    for step in driver_steps {
        if step.priority > 0 && find_step(&merged, &step).is_none() {
            merged.push(step);
        }
    }
    // Priority 0 means not selected; a user or template entry that stayed
    // at 0 is dropped from the executed list.
    merged.retain(|s| s.priority > 0);
    sort_steps(&mut merged);
    Ok(merged)
}

/// Builds the step list for a clean operation: the validated user list for
/// manual cleaning, or every enabled step the node offers for automated
/// cleaning.
pub async fn clean_step_list(
    cx: &ConductorContext,
    node: &Node,
    user_steps: Option<&[Step]>,
    skip_missing: bool,
    disable_ramdisk: bool,
) -> Result<Vec<Step>, CatalogError> {
    match user_steps {
        Some(user) => {
            // Manual cleaning may select disabled steps, so the reference
            // list includes priority-0 entries.
            let driver_steps =
                available_steps(cx, node, OpKind::Clean, false).await?;
            let mut validated = validate_user_steps(
                &driver_steps,
                user,
                OpKind::Clean,
                skip_missing,
                disable_ramdisk,
            )?;
            sort_steps(&mut validated);
            Ok(validated)
        }
        None => available_steps(cx, node, OpKind::Clean, true).await,
    }
}

/// Builds the step list for a service operation from the caller's explicit
/// steps.
pub async fn service_step_list(
    cx: &ConductorContext,
    node: &Node,
    user_steps: &[Step],
    skip_missing: bool,
) -> Result<Vec<Step>, CatalogError> {
    let driver_steps =
        available_steps(cx, node, OpKind::Service, false).await?;
    let mut validated = validate_user_steps(
        &driver_steps,
        user_steps,
        OpKind::Service,
        skip_missing,
        false,
    )?;
    sort_steps(&mut validated);
    Ok(validated)
}
