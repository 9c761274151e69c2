//! Database models for the call pipeline.
//!
//! Row structs are `Queryable` mirrors of the schema; `New*` structs are the
//! `Insertable` halves for tables with autoincrement keys.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

pub use super::schema;
pub use super::schema::{call_queue, calls, crm_tokens, follow_ups, incoming_calls, sales_reps};

/// Lifecycle of a `call_queue` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Processing,
    Failed,
    Completed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Failed => "failed",
            QueueStatus::Completed => "completed",
        }
    }
}

/// A unit of dialing work. Owned by the queue worker once claimed.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = call_queue)]
pub struct CallQueueEntry {
    pub id: i32,
    pub contact_id: String,
    pub phone_number: String,
    pub first_name: String,
    pub full_name: String,
    pub email: String,
    pub service: String,
    pub province: Option<String>,
    pub retry_stage: i32,
    pub status: String,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub call_options: String,
    pub available_slots: Option<String>,
    pub signed_url: Option<String>,
    pub first_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = call_queue)]
pub struct NewCallQueueEntry {
    pub contact_id: String,
    pub phone_number: String,
    pub first_name: String,
    pub full_name: String,
    pub email: String,
    pub service: String,
    pub province: Option<String>,
    pub retry_stage: i32,
    pub status: String,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub call_options: String,
    pub available_slots: Option<String>,
    pub signed_url: Option<String>,
    pub first_attempt_at: Option<DateTime<Utc>>,
}

/// A placed call, keyed by the Twilio-assigned sid. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable, Selectable)]
#[diesel(table_name = calls)]
pub struct CallRecord {
    pub call_sid: String,
    pub to_number: String,
    pub contact_id: String,
    pub retry_count: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub signed_url: Option<String>,
    pub full_name: Option<String>,
    pub first_name: Option<String>,
    pub email: Option<String>,
    pub answered_by: Option<String>,
    pub available_slots: Option<String>,
    pub conversation_id: Option<String>,
    pub first_attempt_at: Option<DateTime<Utc>>,
    pub service: String,
    pub retry_scheduled: bool,
    pub province: Option<String>,
    pub stream_sid: Option<String>,
    pub transcript_summary: Option<String>,
}

/// Inbound mirror of [`CallRecord`], keyed on its own call sid.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable, Selectable)]
#[diesel(table_name = incoming_calls)]
pub struct IncomingCall {
    pub call_sid: String,
    pub caller_number: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub conversation_id: Option<String>,
    pub stream_sid: Option<String>,
}

/// A deferred re-call intent, swept hourly.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = follow_ups)]
pub struct FollowUp {
    pub id: i32,
    pub contact_id: String,
    pub follow_up_at: DateTime<Utc>,
    pub status: String,
    pub province: Option<String>,
    pub service: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = follow_ups)]
pub struct NewFollowUp {
    pub contact_id: String,
    pub follow_up_at: DateTime<Utc>,
    pub status: String,
    pub province: Option<String>,
    pub service: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Routing record for a human sales rep. `services` and `provinces` are
/// comma-separated sets (e.g. "Infissi,Pergole" / "RM,LT,FR").
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = sales_reps)]
pub struct SalesRep {
    pub id: i32,
    pub ghl_user_id: String,
    pub name: String,
    pub services: String,
    pub provinces: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SalesRep {
    pub fn service_set(&self) -> Vec<String> {
        split_set(&self.services)
    }

    pub fn province_set(&self) -> Vec<String> {
        split_set(&self.provinces)
    }
}

fn split_set(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = sales_reps)]
pub struct NewSalesRep {
    pub ghl_user_id: String,
    pub name: String,
    pub services: String,
    pub provinces: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-location OAuth state for the CRM. Opaque to everything except the
/// token store, which refreshes it on demand.
#[derive(Debug, Clone, Queryable, Insertable, Selectable)]
#[diesel(table_name = crm_tokens)]
pub struct CrmToken {
    pub location_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_status_strings_are_stable() {
        assert_eq!(QueueStatus::Pending.as_str(), "pending");
        assert_eq!(QueueStatus::Processing.as_str(), "processing");
        assert_eq!(QueueStatus::Failed.as_str(), "failed");
        assert_eq!(QueueStatus::Completed.as_str(), "completed");
    }

    #[test]
    fn rep_sets_split_and_trim() {
        let rep = SalesRep {
            id: 1,
            ghl_user_id: "u1".into(),
            name: "Mario".into(),
            services: "Infissi, Pergole".into(),
            provinces: "RM,LT, FR".into(),
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(rep.service_set(), vec!["Infissi", "Pergole"]);
        assert_eq!(rep.province_set(), vec!["RM", "LT", "FR"]);
    }
}
