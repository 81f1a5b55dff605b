//! Operation state machine
//!
//! ```text
//! Accepted ──► Provisioning ──► Succeeded
//!                  │  ▲    └──► Failed
//!                  └──┘    └──► Canceled
//!               (in progress)
//! ```
//!
//! Each invocation advances one Operation as far as it can and reports
//! whether the key should be retried later. Status is written through the
//! store with the resource version that was read, so a stale view never
//! overwrites a newer status.

use chrono::{DateTime, Utc};
use kube::runtime::events::EventType;
use tracing::{debug, info, instrument, warn};

use hcp_common::crd::{Operation, OperationState, OperationStatus};
use hcp_common::events::{actions, reasons};
use hcp_common::{metrics, ObjectKey, Result};

use crate::controller::Context;
use crate::provider::ProbeStatus;

/// What the worker should do with the key after a successful sync
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing left to do; forget the key
    Done,
    /// Work is still running; retry with backoff
    Requeue,
}

/// Run one step of the state machine for `key`
///
/// Records that disappear before or during the sync count as done. Errors
/// returned here are transient by contract: the caller requeues with backoff.
#[instrument(skip(ctx, key), fields(operation = %key))]
pub async fn sync_operation(ctx: &Context, key: &ObjectKey) -> Result<SyncOutcome> {
    let Some(op) = ctx.cache.get_cached(key) else {
        debug!("Operation no longer exists");
        return Ok(SyncOutcome::Done);
    };

    match advance(ctx, (*op).clone()).await {
        Err(e) if e.is_not_found() => {
            debug!("Operation deleted during sync");
            Ok(SyncOutcome::Done)
        }
        other => other,
    }
}

async fn advance(ctx: &Context, op: Operation) -> Result<SyncOutcome> {
    if op.is_terminal() {
        debug!("Operation already terminal, nothing to do");
        return Ok(SyncOutcome::Done);
    }

    let now = Utc::now();
    let status = op.status.clone().unwrap_or_default();

    match status.state.clone() {
        // A terminal label without the flag: finish the write that was interrupted
        state if state.is_terminal() => {
            let details = status.details.clone();
            finalize(ctx, &op, status, state, details, now).await
        }
        OperationState::Accepted => {
            let mut next = status;
            next.state = OperationState::Provisioning;
            next.last_probe_time = Some(now);
            next.last_modified_time = Some(monotonic(next.last_modified_time, now));
            let op = persist(ctx, &op, next).await?;

            info!("Operation provisioning started");
            ctx.events
                .publish(
                    &op,
                    EventType::Normal,
                    reasons::PROVISIONING_STARTED,
                    actions::RECONCILE,
                    None,
                )
                .await;

            probe(ctx, op, now).await
        }
        _ => probe(ctx, op, now).await,
    }
}

async fn probe(ctx: &Context, op: Operation, now: DateTime<Utc>) -> Result<SyncOutcome> {
    let status = op.status.clone().unwrap_or_default();

    match ctx.provider.probe(&op).await {
        Ok(ProbeStatus::InProgress { details }) => {
            debug!(%details, "Operation still in progress");
            let mut next = status;
            next.last_probe_time = Some(now);
            next.details = details;
            persist(ctx, &op, next).await?;
            Ok(SyncOutcome::Requeue)
        }
        Ok(ProbeStatus::Succeeded { details }) => {
            finalize(ctx, &op, status, OperationState::Succeeded, details, now).await
        }
        Ok(ProbeStatus::Failed { details }) => {
            finalize(ctx, &op, status, OperationState::Failed, details, now).await
        }
        Ok(ProbeStatus::Canceled { details }) => {
            finalize(ctx, &op, status, OperationState::Canceled, details, now).await
        }
        Err(e) if e.is_retryable() => {
            warn!(error = %e, "Status provider unavailable, will retry");
            Err(e)
        }
        Err(e) => {
            let details = e.to_string();
            finalize(ctx, &op, status, OperationState::Failed, details, now).await
        }
    }
}

async fn finalize(
    ctx: &Context,
    op: &Operation,
    mut status: OperationStatus,
    state: OperationState,
    details: String,
    now: DateTime<Utc>,
) -> Result<SyncOutcome> {
    status.last_probe_time = Some(now);
    status.last_modified_time = Some(monotonic(status.last_modified_time, now));
    status.state = state.clone();
    status.details = details.clone();
    status.terminal = true;
    let op = persist(ctx, op, status).await?;

    let (type_, reason) = match state {
        OperationState::Failed => (EventType::Warning, reasons::OPERATION_FAILED),
        OperationState::Canceled => (EventType::Normal, reasons::OPERATION_CANCELED),
        _ => (EventType::Normal, reasons::OPERATION_SUCCEEDED),
    };
    info!(%state, %details, "Operation reached terminal state");
    metrics::record_terminal(state.as_str());
    ctx.events
        .publish(
            &op,
            type_,
            reason,
            actions::RECONCILE,
            (!details.is_empty()).then_some(details),
        )
        .await;

    Ok(SyncOutcome::Done)
}

/// Write `status` guarded by the resource version `op` was read at
async fn persist(ctx: &Context, op: &Operation, status: OperationStatus) -> Result<Operation> {
    ctx.store
        .update_status(&op.key(), status, op.metadata.resource_version.clone())
        .await
}

/// `LastModifiedTime` never moves backwards, even if the clock does
fn monotonic(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    previous.map_or(now, |prev| prev.max(now))
}
