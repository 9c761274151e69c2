//! Sales-rep routing.
//!
//! A rep is eligible for a call when they are active, cover the requested
//! service, and cover the prospect's province. The order of the returned
//! handles is stable (insertion order) so the slot service's round-robin
//! stays deterministic.

use crate::config::{AppConfig, Service};
use crate::shared::models::{NewSalesRep, SalesRep};
use anyhow::Result;
use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::info;

/// Wildcard province entry: the rep covers the whole country.
const ALL_PROVINCES: &str = "*";

pub fn reps_for(
    conn: &mut SqliteConnection,
    service: Service,
    province: &str,
) -> Result<Vec<SalesRep>> {
    use crate::shared::schema::sales_reps::dsl::*;

    let all: Vec<SalesRep> = sales_reps
        .filter(active.eq(true))
        .order(id.asc())
        .load(conn)?;

    Ok(all
        .into_iter()
        .filter(|rep| rep_matches(rep, service, province))
        .collect())
}

pub fn rep_matches(rep: &SalesRep, service: Service, province: &str) -> bool {
    let services = rep.service_set();
    if !services.iter().any(|s| s == service.as_str()) {
        return false;
    }
    let provinces = rep.province_set();
    provinces.iter().any(|p| p == ALL_PROVINCES || p == province)
}

/// Rep user ids for the given service, in routing order. This is what the
/// slot service and the CRM free-slot query consume.
pub fn rep_ids_for(
    conn: &mut SqliteConnection,
    service: Service,
    province: &str,
) -> Result<Vec<String>> {
    Ok(reps_for(conn, service, province)?
        .into_iter()
        .map(|rep| rep.ghl_user_id)
        .collect())
}

pub fn upsert_rep(
    conn: &mut SqliteConnection,
    user_id: &str,
    rep_name: &str,
    service_csv: &str,
    province_csv: &str,
) -> Result<()> {
    use crate::shared::schema::sales_reps::dsl::*;

    let existing: Option<SalesRep> = sales_reps
        .filter(ghl_user_id.eq(user_id))
        .first(conn)
        .optional()?;

    match existing {
        Some(rep) => {
            diesel::update(sales_reps.filter(id.eq(rep.id)))
                .set((
                    name.eq(rep_name),
                    services.eq(service_csv),
                    provinces.eq(province_csv),
                    active.eq(true),
                    updated_at.eq(Utc::now()),
                ))
                .execute(conn)?;
        }
        None => {
            diesel::insert_into(sales_reps)
                .values(NewSalesRep {
                    ghl_user_id: user_id.to_string(),
                    name: rep_name.to_string(),
                    services: service_csv.to_string(),
                    provinces: province_csv.to_string(),
                    active: true,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                })
                .execute(conn)?;
        }
    }
    Ok(())
}

/// Seed the routing table from the per-service env overrides. Seeded reps
/// cover the whole country; finer-grained coverage is managed in the table
/// directly.
pub fn seed_from_env(conn: &mut SqliteConnection, config: &AppConfig) -> Result<()> {
    let seeds = [
        (Service::Infissi, &config.rep_user_id_infissi),
        (Service::Vetrate, &config.rep_user_id_vetrate),
        (Service::Pergole, &config.rep_user_id_pergole),
    ];

    for (service, user_id) in seeds {
        if let Some(uid) = user_id {
            upsert_rep(
                conn,
                uid,
                &format!("{} default rep", service),
                service.as_str(),
                ALL_PROVINCES,
            )?;
            info!("seeded rep {} for {}", uid, service);
        }
    }
    Ok(())
}
