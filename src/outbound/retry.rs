//! Retry scheduler: turns telephony status callbacks into next attempts.
//!
//! Outcomes are classified into human / machine / unreachable; retryable
//! ones walk a fixed ten-attempt schedule that alternates immediate redials
//! with waits pinned to Rome business hours. A write-once latch on the call
//! record makes duplicate callbacks harmless.

use crate::config::Service;
use crate::notify::NotifyContext;
use crate::shared::models::{CallRecord, NewCallQueueEntry, QueueStatus};
use crate::shared::state::AppState;
use crate::telephony::{self, StatusCallbackParams};
use crate::timeloc;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use log::{error, info, warn};
use std::sync::Arc;

/// Hard cap: ten attempts total, so the last scheduled retry carries
/// `retry_stage` 9 and schedules nothing further.
pub const MAX_ATTEMPTS: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// A person answered and the call ran to completion. Terminal.
    HumanCompleted,
    /// Machine detected while the call is still up: hang up, then retry.
    MachineLive,
    /// Machine detected on a finished call.
    MachineDone,
    /// No answer, busy, or carrier failure.
    Unreachable,
    /// Intermediate status with nothing to do.
    InProgress,
}

pub fn classify(call_status: &str, answered_by: Option<&str>) -> CallOutcome {
    let machine = answered_by.map(telephony::is_machine).unwrap_or(false);

    if machine {
        return match call_status {
            "completed" | "canceled" => CallOutcome::MachineDone,
            _ => CallOutcome::MachineLive,
        };
    }

    match call_status {
        "no-answer" | "busy" | "failed" => CallOutcome::Unreachable,
        "completed" => CallOutcome::HumanCompleted,
        _ => CallOutcome::InProgress,
    }
}

/// When the next attempt should run. `next_index` is the 0-based stage of
/// the attempt being scheduled; `None` means the sequence is exhausted.
pub fn next_attempt_time(next_index: i32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match next_index {
        1 | 3 | 5 | 7 | 9 => Some(now),
        2 => Some(now + Duration::hours(1)),
        4 => Some(timeloc::next_workday_at_rome_hour(now, 9)),
        6 => Some(timeloc::next_workday_at_rome_hour(now, 14)),
        8 => Some(timeloc::next_workday_at_rome_hour(now, 19)),
        _ => None,
    }
}

/// Handle one status callback. Never fails the HTTP response; errors are
/// logged and notified.
pub async fn handle_status_callback(state: &Arc<AppState>, params: StatusCallbackParams) {
    let record = match load_record(state, &params.call_sid) {
        Ok(Some(record)) => record,
        Ok(None) => {
            // The worker writes the record before Twilio gets the sid, so
            // this indicates a foreign or very stale callback.
            warn!("status callback for unknown call {}", params.call_sid);
            return;
        }
        Err(e) => {
            error!("status callback lookup failed for {}: {}", params.call_sid, e);
            return;
        }
    };

    if let Err(e) = update_status(state, &params) {
        error!("status update failed for {}: {}", params.call_sid, e);
    }

    let outcome = classify(&params.call_status, params.answered_by.as_deref());
    info!(
        "call {} status={} answered_by={:?} -> {:?}",
        params.call_sid, params.call_status, params.answered_by, outcome
    );

    match outcome {
        CallOutcome::HumanCompleted | CallOutcome::InProgress => {}
        CallOutcome::MachineLive => {
            if let Err(e) = state.twilio.hangup_call(&params.call_sid).await {
                warn!("hangup after machine detection failed for {}: {}", params.call_sid, e);
            }
            schedule_retry(state, &record).await;
        }
        CallOutcome::MachineDone | CallOutcome::Unreachable => {
            schedule_retry(state, &record).await;
        }
    }
}

async fn schedule_retry(state: &Arc<AppState>, record: &CallRecord) {
    // The latch is the idempotence guard: the first callback to set it owns
    // the retry, every later one backs off here.
    match acquire_retry_latch(state, &record.call_sid) {
        Ok(true) => {}
        Ok(false) => {
            info!("retry already scheduled for {}", record.call_sid);
            return;
        }
        Err(e) => {
            error!("retry latch failed for {}: {}", record.call_sid, e);
            return;
        }
    }

    let ctx = NotifyContext {
        contact_id: Some(record.contact_id.clone()),
        phone: Some(record.to_number.clone()),
        service: Some(record.service.clone()),
        province: record.province.clone(),
        call_sid: Some(record.call_sid.clone()),
        ..Default::default()
    };

    if let Some(reason) = permanent_issue(state, record) {
        warn!("call {} stopped permanently: {}", record.call_sid, reason);
        state
            .notifier
            .warning(
                &format!("Retry sequence stopped: {}", reason),
                NotifyContext {
                    detail: Some(format!("after {} attempts", record.retry_count + 1)),
                    ..ctx
                },
            )
            .await;
        return;
    }

    let next_index = record.retry_count + 1;
    let now = Utc::now();
    let Some(scheduled_at) = next_attempt_time(next_index, now) else {
        info!(
            "call {} exhausted the retry schedule ({} attempts)",
            record.call_sid, MAX_ATTEMPTS
        );
        state
            .notifier
            .warning("Retry schedule exhausted", ctx)
            .await;
        return;
    };

    match enqueue_retry(state, record, next_index, scheduled_at, now) {
        Ok(queue_id) => {
            info!(
                "retry {} scheduled for call {} at {} (queue {})",
                next_index, record.call_sid, scheduled_at, queue_id
            );
        }
        Err(e) => {
            error!("retry enqueue failed for {}: {}", record.call_sid, e);
            state
                .notifier
                .error(
                    "Retry enqueue failed",
                    NotifyContext {
                        detail: Some(e.to_string()),
                        ..ctx
                    },
                )
                .await;
        }
    }
}

/// Reasons to abandon the sequence regardless of remaining attempts.
fn permanent_issue(state: &Arc<AppState>, record: &CallRecord) -> Option<String> {
    let province_unknown = record
        .province
        .as_deref()
        .map(|p| p.is_empty() || p.eq_ignore_ascii_case("unknown"))
        .unwrap_or(true);

    if province_unknown && record.retry_count >= 2 {
        return Some("province unknown after repeated attempts".to_string());
    }

    if let (Some(province), Some(service)) = (
        record.province.as_deref(),
        Service::parse(&record.service),
    ) {
        let reps = state
            .db()
            .and_then(|mut conn| crate::reps::rep_ids_for(&mut conn, service, province))
            .unwrap_or_default();
        if reps.is_empty() {
            return Some("no sales reps cover the contact".to_string());
        }
    }

    None
}

fn load_record(state: &Arc<AppState>, sid: &str) -> anyhow::Result<Option<CallRecord>> {
    use crate::shared::schema::calls::dsl::*;
    let mut conn = state.db()?;
    Ok(calls
        .filter(call_sid.eq(sid))
        .first::<CallRecord>(&mut conn)
        .optional()?)
}

fn update_status(state: &Arc<AppState>, params: &StatusCallbackParams) -> anyhow::Result<()> {
    use crate::shared::schema::calls::dsl::*;
    let mut conn = state.db()?;
    diesel::update(calls.filter(call_sid.eq(&params.call_sid)))
        .set((
            status.eq(&params.call_status),
            answered_by.eq(params.answered_by.as_deref()),
        ))
        .execute(&mut conn)?;
    Ok(())
}

/// Set the one-way latch; true when this caller won it.
fn acquire_retry_latch(state: &Arc<AppState>, sid: &str) -> anyhow::Result<bool> {
    use crate::shared::schema::calls::dsl::*;
    let mut conn = state.db()?;
    let updated = diesel::update(
        calls
            .filter(call_sid.eq(sid))
            .filter(retry_scheduled.eq(false)),
    )
    .set(retry_scheduled.eq(true))
    .execute(&mut conn)?;
    Ok(updated == 1)
}

fn enqueue_retry(
    state: &Arc<AppState>,
    record: &CallRecord,
    next_index: i32,
    when: DateTime<Utc>,
    now: DateTime<Utc>,
) -> anyhow::Result<i32> {
    use crate::shared::schema::call_queue::dsl::*;

    let service_enum = Service::parse(&record.service).unwrap_or(Service::Infissi);
    let options = super::intake::compose_call_options(
        state,
        &record.to_number,
        service_enum,
        &record.contact_id,
        record.first_name.as_deref().unwrap_or(""),
        record.full_name.as_deref().unwrap_or(""),
        record.email.as_deref().unwrap_or(""),
        record.province.as_deref(),
        false,
        None,
        None,
    );

    let entry = NewCallQueueEntry {
        contact_id: record.contact_id.clone(),
        phone_number: record.to_number.clone(),
        first_name: record.first_name.clone().unwrap_or_default(),
        full_name: record.full_name.clone().unwrap_or_default(),
        email: record.email.clone().unwrap_or_default(),
        service: record.service.clone(),
        province: record.province.clone(),
        retry_stage: next_index,
        status: QueueStatus::Pending.as_str().to_string(),
        scheduled_at: when,
        created_at: now,
        call_options: serde_json::to_string(&options)?,
        available_slots: record.available_slots.clone(),
        signed_url: record.signed_url.clone(),
        first_attempt_at: record.first_attempt_at,
    };

    let mut conn = state.db()?;
    let queue_id = diesel::insert_into(call_queue)
        .values(&entry)
        .returning(id)
        .get_result(&mut conn)?;
    Ok(queue_id)
}
