//! Audit logging for job lifecycle decisions.
//!
//! All events are emitted via `tracing` with a dedicated target so they can be
//! filtered and formatted (e.g. JSON) separately from operational logs.

use devscope_shared::DeviceId;
use tracing::{info, warn};

const AUDIT_TARGET: &str = "devscope::audit";

/// A job passed validation and its controllers were started.
pub fn job_accepted(job_id: &str, devices: &[DeviceId]) {
    info!(
        target: AUDIT_TARGET,
        event = "job_accepted",
        job_id = %job_id,
        devices = ?devices,
    );
}

/// A job request was refused at the API boundary.
pub fn job_rejected(job_id: &str, reason: &str) {
    warn!(
        target: AUDIT_TARGET,
        event = "job_rejected",
        job_id = %job_id,
        reason = %reason,
    );
}

pub fn job_stop_requested(job_id: &str, origin: &str) {
    info!(
        target: AUDIT_TARGET,
        event = "job_stop_requested",
        job_id = %job_id,
        origin = %origin,
    );
}

/// Every controller of the job has been joined and the registry entry removed.
pub fn job_finished(job_id: &str) {
    info!(
        target: AUDIT_TARGET,
        event = "job_finished",
        job_id = %job_id,
    );
}

/// A sentinel event was dropped without side effects.
pub fn sentinel_ignored(job_id: &str, kind: &str, reason: &str) {
    info!(
        target: AUDIT_TARGET,
        event = "sentinel_ignored",
        job_id = %job_id,
        kind = %kind,
        reason = %reason,
    );
}
