//! Queue worker: the single ticking loop that turns queue rows into calls.
//!
//! Admission control comes from the telephony side: the worker asks Twilio
//! how many calls are live and only claims what fits under the cap. A call
//! record is written the moment Twilio hands back a sid, before any status
//! callback can possibly refer to it.

use crate::notify::NotifyContext;
use crate::shared::models::{CallQueueEntry, CallRecord, QueueStatus};
use crate::shared::state::AppState;
use crate::telephony::CallOptions;
use chrono::Utc;
use diesel::prelude::*;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

pub fn spawn_queue_worker(state: Arc<AppState>) {
    let tick = Duration::from_secs(state.config.queue_tick_seconds);
    tokio::spawn(async move {
        info!("queue worker started, tick every {:?}", tick);
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            if let Err(e) = run_tick(&state).await {
                error!("queue worker tick failed: {}", e);
            }
        }
    });
}

async fn run_tick(state: &Arc<AppState>) -> anyhow::Result<()> {
    // Fail closed: if the line count cannot be read, assume saturation
    // rather than risk overdialing.
    let active = match state.twilio.active_call_count().await {
        Ok(n) => n,
        Err(e) => {
            warn!("active call count unavailable, skipping tick: {}", e);
            return Ok(());
        }
    };

    let available = state.config.max_active_calls - active;
    if available <= 0 {
        return Ok(());
    }

    let claimed = claim_due_entries(state, available)?;
    for entry in claimed {
        process_entry(state, entry).await;
    }
    Ok(())
}

/// Claim up to `limit` due pending rows: oldest first, stamped with the
/// attempt time and moved to `processing`. Single-worker deployment, so
/// SELECT-then-UPDATE by id is race-free.
fn claim_due_entries(state: &Arc<AppState>, limit: i64) -> anyhow::Result<Vec<CallQueueEntry>> {
    use crate::shared::schema::call_queue::dsl::*;

    let mut conn = state.db()?;
    let now = Utc::now();

    let due: Vec<CallQueueEntry> = call_queue
        .filter(status.eq(QueueStatus::Pending.as_str()))
        .filter(scheduled_at.le(now))
        .order(scheduled_at.asc())
        .limit(limit)
        .load(&mut conn)?;

    if due.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<i32> = due.iter().map(|e| e.id).collect();
    diesel::update(
        call_queue
            .filter(id.eq_any(&ids))
            .filter(status.eq(QueueStatus::Pending.as_str())),
    )
    .set((status.eq(QueueStatus::Processing.as_str()), last_attempt_at.eq(now)))
    .execute(&mut conn)?;

    Ok(due)
}

async fn process_entry(state: &Arc<AppState>, entry: CallQueueEntry) {
    let ctx = NotifyContext {
        contact_id: Some(entry.contact_id.clone()),
        phone: Some(entry.phone_number.clone()),
        service: Some(entry.service.clone()),
        province: entry.province.clone(),
        ..Default::default()
    };

    match place_call(state, &entry).await {
        Ok(call_sid) => {
            info!(
                "call {} placed for queue entry {} (attempt {})",
                call_sid,
                entry.id,
                entry.retry_stage + 1
            );
            // The CRM note is informational; its failure must not fail the
            // attempt.
            let note = format!(
                "Chiamata automatica in corso (tentativo {}). Servizio: {}.",
                entry.retry_stage + 1,
                entry.service
            );
            if let Err(e) = state.crm.add_contact_note(&entry.contact_id, &note).await {
                warn!("contact note failed for {}: {}", entry.contact_id, e);
            }
            if let Err(e) = delete_entry(state, entry.id) {
                error!("failed to delete claimed queue entry {}: {}", entry.id, e);
            }
        }
        Err(e) => {
            error!("queue entry {} failed: {}", entry.id, e);
            if let Err(mark_err) = mark_failed(state, entry.id, &e) {
                error!("failed to mark queue entry {} failed: {}", entry.id, mark_err);
            }
            state
                .notifier
                .error(
                    "Outbound call attempt failed",
                    NotifyContext {
                        detail: Some(e),
                        ..ctx
                    },
                )
                .await;
        }
    }
}

/// Verify the CRM bearer, place the Twilio call, and persist the call
/// record keyed by the returned sid. Status callbacks for this sid must
/// always find the record, so the insert happens before returning.
async fn place_call(state: &Arc<AppState>, entry: &CallQueueEntry) -> Result<String, String> {
    state
        .crm
        .valid_bearer()
        .await
        .map_err(|e| format!("CRM token unavailable: {}", e))?;

    let options: CallOptions = serde_json::from_str(&entry.call_options)
        .map_err(|e| format!("corrupt call options blob: {}", e))?;

    let response = state
        .twilio
        .create_call(&options)
        .await
        .map_err(|e| format!("call creation failed: {}", e))?;

    let record = CallRecord {
        call_sid: response.sid.clone(),
        to_number: entry.phone_number.clone(),
        contact_id: entry.contact_id.clone(),
        retry_count: entry.retry_stage,
        status: response.status.clone(),
        created_at: Utc::now(),
        signed_url: entry.signed_url.clone(),
        full_name: Some(entry.full_name.clone()),
        first_name: Some(entry.first_name.clone()),
        email: Some(entry.email.clone()),
        answered_by: None,
        available_slots: entry.available_slots.clone(),
        conversation_id: None,
        first_attempt_at: entry.first_attempt_at,
        service: entry.service.clone(),
        retry_scheduled: false,
        province: entry.province.clone(),
        stream_sid: None,
        transcript_summary: None,
    };

    {
        use crate::shared::schema::calls::dsl::*;
        let mut conn = state.db().map_err(|e| e.to_string())?;
        diesel::insert_into(calls)
            .values(&record)
            .execute(&mut conn)
            .map_err(|e| format!("call record insert failed: {}", e))?;
    }

    Ok(response.sid)
}

fn delete_entry(state: &Arc<AppState>, entry_id: i32) -> anyhow::Result<()> {
    use crate::shared::schema::call_queue::dsl::*;
    let mut conn = state.db()?;
    diesel::delete(call_queue.filter(id.eq(entry_id))).execute(&mut conn)?;
    Ok(())
}

fn mark_failed(state: &Arc<AppState>, entry_id: i32, reason: &str) -> anyhow::Result<()> {
    use crate::shared::schema::call_queue::dsl::*;
    let mut conn = state.db()?;
    diesel::update(call_queue.filter(id.eq(entry_id)))
        .set((status.eq(QueueStatus::Failed.as_str()), last_error.eq(reason)))
        .execute(&mut conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, PostCallAnalysisMode};
    use crate::shared::db::run_migrations;
    use crate::shared::models::NewCallQueueEntry;

    fn test_state(db_path: &str) -> Arc<AppState> {
        let config = AppConfig {
            twilio: crate::config::TwilioConfig {
                account_sid: "AC1".into(),
                auth_token: "tok".into(),
                phone_number_infissi: "+3901".into(),
                phone_number_vetrate: "+3902".into(),
            },
            crm: crate::config::CrmConfig {
                client_id: "cid".into(),
                client_secret: "sec".into(),
                redirect_uri: "https://x/hl/callback".into(),
                location_id: "LOC".into(),
                calendar_id: "CAL".into(),
            },
            elevenlabs: crate::config::ElevenLabsConfig {
                api_key: "k".into(),
                agent_id_outbound: "agent-out".into(),
                agent_id_inbound: "agent-in".into(),
                webhook_secret: None,
            },
            notifier_webhook_url: "http://127.0.0.1:1/webhook".into(),
            public_base_url: "https://example.com".into(),
            outbound_prefix: "outgoing".into(),
            inbound_prefix: "incoming".into(),
            database_path: db_path.to_string(),
            max_active_calls: 3,
            queue_tick_seconds: 10,
            post_call_analysis: PostCallAnalysisMode::Disabled,
            gemini_api_key: None,
            zip_sheet_id: None,
            sheets_api_key: None,
            default_appointment_address: "Da definire".into(),
            rep_user_id_infissi: None,
            rep_user_id_vetrate: None,
            rep_user_id_pergole: None,
            workflow_no_rep: None,
            workflow_call_scheduled: None,
            server_port: 0,
        };
        Arc::new(AppState::new(config))
    }

    fn seed_entry(state: &Arc<AppState>, scheduled: chrono::DateTime<Utc>) -> i32 {
        use crate::shared::schema::call_queue::dsl::*;
        let mut conn = state.db().unwrap();
        diesel::insert_into(call_queue)
            .values(NewCallQueueEntry {
                contact_id: "C1".into(),
                phone_number: "+390612345678".into(),
                first_name: "Anna".into(),
                full_name: "Anna Rossi".into(),
                email: "anna@example.com".into(),
                service: "Infissi".into(),
                province: Some("RM".into()),
                retry_stage: 0,
                status: "pending".into(),
                scheduled_at: scheduled,
                created_at: Utc::now(),
                call_options: "{}".into(),
                available_slots: None,
                signed_url: None,
                first_attempt_at: Some(Utc::now()),
            })
            .returning(id)
            .get_result(&mut conn)
            .unwrap()
    }

    fn unique_db() -> String {
        format!(
            "file:worker{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        )
    }

    #[test]
    fn claim_moves_due_rows_to_processing() {
        let path = unique_db();
        let mut conn = crate::shared::db::open_conn(&path).unwrap();
        run_migrations(&mut conn).unwrap();
        let state = test_state(&path);

        let due_id = seed_entry(&state, Utc::now() - chrono::Duration::seconds(10));
        let future_id = seed_entry(&state, Utc::now() + chrono::Duration::hours(1));

        let claimed = claim_due_entries(&state, 5).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due_id);

        use crate::shared::schema::call_queue::dsl::*;
        let statuses: Vec<(i32, String)> = call_queue
            .select((id, status))
            .order(id.asc())
            .load(&mut conn)
            .unwrap();
        assert_eq!(statuses[0], (due_id, "processing".to_string()));
        assert_eq!(statuses[1], (future_id, "pending".to_string()));
    }

    #[test]
    fn claim_respects_the_limit() {
        let path = unique_db();
        let mut conn = crate::shared::db::open_conn(&path).unwrap();
        run_migrations(&mut conn).unwrap();
        let state = test_state(&path);

        for _ in 0..4 {
            seed_entry(&state, Utc::now() - chrono::Duration::seconds(10));
        }
        let claimed = claim_due_entries(&state, 2).unwrap();
        assert_eq!(claimed.len(), 2);
        drop(conn);
    }

    #[test]
    fn failed_entries_keep_the_error() {
        let path = unique_db();
        let mut conn = crate::shared::db::open_conn(&path).unwrap();
        run_migrations(&mut conn).unwrap();
        let state = test_state(&path);

        let entry_id = seed_entry(&state, Utc::now());
        mark_failed(&state, entry_id, "call creation failed: boom").unwrap();

        use crate::shared::schema::call_queue::dsl::*;
        let (row_status, err): (String, Option<String>) = call_queue
            .filter(id.eq(entry_id))
            .select((status, last_error))
            .first(&mut conn)
            .unwrap();
        assert_eq!(row_status, "failed");
        assert!(err.unwrap().contains("boom"));
    }
}
