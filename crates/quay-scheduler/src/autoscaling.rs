//! Replica count changes driven by scale triggers
//!
//! A trigger never changes replica state directly. It produces a pseudo
//! [`LoadModelRequest`] identical to the current one except for
//! `deployment_spec.replicas`, which then goes through the ordinary
//! apply/placement/sync path.

use crate::error::{SchedulerError, SchedulerResult};
use chrono::{DateTime, Duration, Utc};
use quay_types::{LoadModelRequest, Model, ModelScalingTriggerMessage, ModelVersion, ScalingTrigger};
use tracing::debug;

/// Default quiet period after a model change before it may be rescaled
pub const DEFAULT_STABILIZATION_WINDOW_SECS: i64 = 60;

/// Next replica count for `trigger`, starting from `previous_replicas`
pub fn calculate_desired_num_replicas(
    model: &Model,
    trigger: ScalingTrigger,
    previous_replicas: u32,
) -> SchedulerResult<u32> {
    let spec = &model.deployment_spec;
    if !spec.autoscaling_enabled() {
        return Err(SchedulerError::ScalingDisabled(model.name().to_string()));
    }

    let limit_exceeded = |requested| SchedulerError::LimitExceeded {
        model: model.name().to_string(),
        requested,
        min: spec.min_replicas,
        max: spec.max_replicas,
    };

    match trigger {
        ScalingTrigger::ScaleUp => {
            let candidate = previous_replicas.saturating_add(1);
            if spec.max_replicas > 0 && candidate > spec.max_replicas {
                return Err(limit_exceeded(candidate));
            }
            Ok(candidate)
        }
        ScalingTrigger::ScaleDown => {
            // Going to zero takes an explicit delete, never a trigger
            let candidate = previous_replicas.saturating_sub(1);
            if candidate == 0 || candidate < spec.min_replicas {
                return Err(limit_exceeded(candidate));
            }
            Ok(candidate)
        }
    }
}

/// Build the request that rescales `last_available` in response to `trigger`.
///
/// `last_available` must be the model's last available version; the caller
/// checks that.
pub fn create_scaling_pseudo_request(
    trigger: &ModelScalingTriggerMessage,
    last_available: &ModelVersion,
    now: DateTime<Utc>,
    stabilization_window: Duration,
) -> SchedulerResult<LoadModelRequest> {
    let last_update = last_available.model_state().timestamp;
    let since = now.signed_duration_since(last_update);
    if since < stabilization_window {
        return Err(SchedulerError::ModelNotStable {
            model: trigger.model_name.clone(),
            seconds_ago: since.num_seconds(),
        });
    }

    let mut model = last_available.model().clone();
    let replicas = calculate_desired_num_replicas(
        &model,
        trigger.trigger,
        model.deployment_spec.replicas,
    )?;
    debug!(
        model = %trigger.model_name,
        version = trigger.model_version,
        from = model.deployment_spec.replicas,
        to = replicas,
        "Computed scaled replica count"
    );
    model.deployment_spec.replicas = replicas;
    Ok(LoadModelRequest { model })
}
