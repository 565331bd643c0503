//! Read-side selection logic: which participations are eligible for a new
//! call, which contacts a population job would add, which calls a queue job
//! would touch.  Every predicate renders to a SQL fragment on a
//! `QueryBuilder`, so arbitrary attribute filters and the named predicates
//! intersect in a single statement and concurrent dispatchers fall back on
//! the table's uniqueness constraints instead of locks.

use crate::db_types::PhoneCall;

use serde::Deserialize;
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};

/// Statuses that make the last attempt retryable by default.
pub const DEFAULT_RETRY_STATUSES: &[&str] = &["failed"];

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ParticipationFilter {
    pub callout_id: Option<i32>,
    pub contact_id: Option<i32>,
    pub callout_population_id: Option<i32>,
    pub call_flow_logic: Option<String>,
    pub msisdn: Option<String>,
    pub metadata: Option<Value>,
    pub has_phone_calls: Option<bool>,
    pub last_phone_call_attempt: Option<Vec<String>>,
    pub no_phone_calls_or_last_attempt: Option<Vec<String>>,
    pub having_max_phone_calls_count: Option<i64>,
}

impl ParticipationFilter {
    pub fn has_attempt_predicate(&self) -> bool {
        self.has_phone_calls.is_some()
            || self.last_phone_call_attempt.is_some()
            || self.no_phone_calls_or_last_attempt.is_some()
            || self.having_max_phone_calls_count.is_some()
    }

    /// The default "needs a call" rule: no attempts yet, or the last attempt
    /// ended in a retryable status.  Applied when the caller supplied no
    /// attempt predicate of its own.
    pub fn with_default_retry_rule(mut self) -> Self {
        if !self.has_attempt_predicate() {
            self.no_phone_calls_or_last_attempt = Some(
                DEFAULT_RETRY_STATUSES
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            );
        }
        self
    }

    /// Ordered, deduplicated selection of eligible participations.
    pub fn selection_query(&self) -> QueryBuilder<'static, Postgres> {
        let mut query = QueryBuilder::new(
            "select callout_participations.* from callout_participations where true",
        );
        self.apply(&mut query);
        query.push(" order by callout_participations.id");
        query
    }

    pub fn apply(&self, query: &mut QueryBuilder<'static, Postgres>) {
        if let Some(callout_id) = self.callout_id {
            query.push(" and callout_participations.callout_id = ");
            query.push_bind(callout_id);
        }
        if let Some(contact_id) = self.contact_id {
            query.push(" and callout_participations.contact_id = ");
            query.push_bind(contact_id);
        }
        if let Some(callout_population_id) = self.callout_population_id {
            query.push(" and callout_participations.callout_population_id = ");
            query.push_bind(callout_population_id);
        }
        if let Some(call_flow_logic) = &self.call_flow_logic {
            query.push(" and callout_participations.call_flow_logic = ");
            query.push_bind(call_flow_logic.clone());
        }
        if let Some(msisdn) = &self.msisdn {
            query.push(" and callout_participations.msisdn = ");
            query.push_bind(msisdn.clone());
        }
        if let Some(metadata) = &self.metadata {
            query.push(" and callout_participations.metadata @> ");
            query.push_bind(metadata.clone());
        }
        match self.has_phone_calls {
            Some(true) => {
                query.push(" and ");
                push_has_attempts(query);
            }
            Some(false) => {
                query.push(" and ");
                push_no_attempts(query);
            }
            None => {}
        }
        if let Some(statuses) = &self.last_phone_call_attempt {
            query.push(" and ");
            push_last_attempt(query, statuses.clone());
        }
        if let Some(statuses) = &self.no_phone_calls_or_last_attempt {
            query.push(" and (");
            push_no_attempts(query);
            query.push(" or ");
            push_last_attempt(query, statuses.clone());
            query.push(")");
        }
        if let Some(count) = self.having_max_phone_calls_count {
            query.push(
                " and (select count(*) from phone_calls \
                 where phone_calls.callout_participation_id = callout_participations.id) < ",
            );
            query.push_bind(count);
        }
    }
}

fn push_no_attempts(query: &mut QueryBuilder<'static, Postgres>) {
    query.push(
        "not exists (select 1 from phone_calls \
         where phone_calls.callout_participation_id = callout_participations.id)",
    );
}

fn push_has_attempts(query: &mut QueryBuilder<'static, Postgres>) {
    query.push(
        "exists (select 1 from phone_calls \
         where phone_calls.callout_participation_id = callout_participations.id)",
    );
}

// A row is the most recent attempt when no sibling was created strictly
// later; equal timestamps are broken by the higher id.
fn push_last_attempt(query: &mut QueryBuilder<'static, Postgres>, statuses: Vec<String>) {
    query.push(
        "exists (select 1 from phone_calls \
         where phone_calls.callout_participation_id = callout_participations.id \
         and phone_calls.status = any(",
    );
    query.push_bind(statuses);
    query.push(
        ") and not exists (select 1 from phone_calls as later_phone_calls \
         where later_phone_calls.callout_participation_id = callout_participations.id \
         and (later_phone_calls.created_at > phone_calls.created_at \
         or (later_phone_calls.created_at = phone_calls.created_at \
         and later_phone_calls.id > phone_calls.id))))",
    );
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ContactFilter {
    pub msisdn: Option<String>,
    pub metadata: Option<Value>,
    pub location_ids: Option<Vec<String>>,
}

impl ContactFilter {
    pub fn apply(&self, query: &mut QueryBuilder<'static, Postgres>) {
        if let Some(msisdn) = &self.msisdn {
            query.push(" and contacts.msisdn = ");
            query.push_bind(msisdn.clone());
        }
        if let Some(metadata) = &self.metadata {
            query.push(" and contacts.metadata @> ");
            query.push_bind(metadata.clone());
        }
        if let Some(location_ids) = &self.location_ids {
            query.push(" and contacts.metadata -> 'location_ids' ?| ");
            query.push_bind(location_ids.clone());
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PhoneCallFilter {
    pub callout_id: Option<i32>,
    pub status: Option<Vec<String>>,
    pub metadata: Option<Value>,
}

impl PhoneCallFilter {
    pub fn apply(&self, query: &mut QueryBuilder<'static, Postgres>) {
        if let Some(callout_id) = self.callout_id {
            query.push(
                " and exists (select 1 from callout_participations \
                 where callout_participations.id = phone_calls.callout_participation_id \
                 and callout_participations.callout_id = ",
            );
            query.push_bind(callout_id);
            query.push(")");
        }
        if let Some(statuses) = &self.status {
            query.push(" and phone_calls.status = any(");
            query.push_bind(statuses.clone());
            query.push(")");
        }
        if let Some(metadata) = &self.metadata {
            query.push(" and phone_calls.metadata @> ");
            query.push_bind(metadata.clone());
        }
    }
}

/// The most recent attempt among `attempts`: strictly latest `created_at`,
/// ties broken by the highest id.  The same rule the SQL predicate encodes.
pub fn latest_attempt(attempts: &[PhoneCall]) -> Option<&PhoneCall> {
    attempts
        .iter()
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
}
