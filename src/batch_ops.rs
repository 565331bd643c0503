//! The polymorphic batch-operation variants.  The state machine and the
//! `batch_operations` row are shared; the variant — selected by the
//! `op_type` discriminator — defines what `preview` would touch and what
//! `execute` actually does.  Bodies are idempotent under requeue: inserts
//! dedup on the table's uniqueness constraints, dispatch claims each call
//! with a compare-and-set update.

use crate::db_types::{Account, BatchOperation, Callout, Contact, PhoneCall};
use crate::error::AppError;
use crate::state_machine::{remote_transition, PhoneCallStatus};
use crate::targeting::{ContactFilter, ParticipationFilter, PhoneCallFilter};
use crate::twilio_types::CallStatus;
use crate::types::AppState;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOperationKind {
    CalloutPopulation,
    PhoneCallCreate,
    PhoneCallQueue,
    PhoneCallQueueRemoteFetch,
}

impl BatchOperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchOperationKind::CalloutPopulation => "callout_population",
            BatchOperationKind::PhoneCallCreate => "phone_call_create",
            BatchOperationKind::PhoneCallQueue => "phone_call_queue",
            BatchOperationKind::PhoneCallQueueRemoteFetch => "phone_call_queue_remote_fetch",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "callout_population" => Some(BatchOperationKind::CalloutPopulation),
            "phone_call_create" => Some(BatchOperationKind::PhoneCallCreate),
            "phone_call_queue" => Some(BatchOperationKind::PhoneCallQueue),
            "phone_call_queue_remote_fetch" => Some(BatchOperationKind::PhoneCallQueueRemoteFetch),
            _ => None,
        }
    }

    pub fn requires_callout(self) -> bool {
        matches!(self, BatchOperationKind::CalloutPopulation)
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct CalloutPopulationParams {
    pub contact_filter_params: ContactFilter,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct PhoneCallCreateParams {
    pub callout_participation_filter_params: ParticipationFilter,
    pub remote_request_params: Value,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct PhoneCallQueueParams {
    pub phone_call_filter_params: PhoneCallFilter,
    pub remote_request_params: Value,
    pub limit: Option<i64>,
}

fn parse_params<T>(parameters: &Value) -> Result<T, AppError>
where
    T: Default + DeserializeOwned,
{
    if parameters.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(parameters.clone())
        .map_err(|e| AppError::invalid(format!("parameters are invalid: {e}")))
}

/// Checks the type discriminator and the parameter shape before a batch
/// operation row is created.  Nothing is persisted for a bad request.
pub fn validate(op_type: &str, callout_id: Option<i32>, parameters: &Value) -> Result<BatchOperationKind, AppError> {
    let kind = BatchOperationKind::from_str(op_type)
        .ok_or_else(|| AppError::invalid(format!("op_type `{op_type}` is not a batch operation type")))?;
    if kind.requires_callout() && callout_id.is_none() {
        return Err(AppError::invalid("callout_id is required"));
    }
    match kind {
        BatchOperationKind::CalloutPopulation => {
            parse_params::<CalloutPopulationParams>(parameters)?;
        }
        BatchOperationKind::PhoneCallCreate => {
            parse_params::<PhoneCallCreateParams>(parameters)?;
        }
        BatchOperationKind::PhoneCallQueue | BatchOperationKind::PhoneCallQueueRemoteFetch => {
            parse_params::<PhoneCallQueueParams>(parameters)?;
        }
    }
    Ok(kind)
}

#[derive(Debug, Serialize)]
pub struct PreviewResult {
    pub resource: &'static str,
    pub count: usize,
    pub ids: Vec<i32>,
}

/// The would-be result set of an operation, computed without mutating
/// anything.  Used for confirmation before queueing and as a dry-run
/// endpoint.
pub async fn preview(op: &BatchOperation, state: &AppState) -> Result<PreviewResult, AppError> {
    let kind = BatchOperationKind::from_str(&op.op_type)
        .ok_or_else(|| AppError::invalid(format!("op_type `{}` is not a batch operation type", op.op_type)))?;
    match kind {
        BatchOperationKind::CalloutPopulation => {
            let params: CalloutPopulationParams = parse_params(&op.parameters)?;
            let mut query = contacts_query(op.account_id, &params.contact_filter_params);
            let contacts = query
                .build_query_as::<Contact>()
                .fetch_all(&state.db_pool)
                .await?;
            let ids: Vec<i32> = contacts.iter().map(|c| c.id).collect();
            Ok(PreviewResult {
                resource: "contacts",
                count: ids.len(),
                ids,
            })
        }
        BatchOperationKind::PhoneCallCreate => {
            let params: PhoneCallCreateParams = parse_params(&op.parameters)?;
            let mut query = dialable_participations_query(op, &params);
            let participations = query
                .build_query_as::<crate::db_types::CalloutParticipation>()
                .fetch_all(&state.db_pool)
                .await?;
            let ids: Vec<i32> = participations.iter().map(|p| p.id).collect();
            Ok(PreviewResult {
                resource: "callout_participations",
                count: ids.len(),
                ids,
            })
        }
        BatchOperationKind::PhoneCallQueue => {
            let params: PhoneCallQueueParams = parse_params(&op.parameters)?;
            let mut query = dispatchable_calls_query(op, &params);
            let calls = query
                .build_query_as::<PhoneCall>()
                .fetch_all(&state.db_pool)
                .await?;
            let ids: Vec<i32> = calls.iter().map(|c| c.id).collect();
            Ok(PreviewResult {
                resource: "phone_calls",
                count: ids.len(),
                ids,
            })
        }
        BatchOperationKind::PhoneCallQueueRemoteFetch => {
            let params: PhoneCallQueueParams = parse_params(&op.parameters)?;
            let mut query = remote_fetchable_calls_query(op, &params);
            let calls = query
                .build_query_as::<PhoneCall>()
                .fetch_all(&state.db_pool)
                .await?;
            let ids: Vec<i32> = calls.iter().map(|c| c.id).collect();
            Ok(PreviewResult {
                resource: "phone_calls",
                count: ids.len(),
                ids,
            })
        }
    }
}

/// The job body.  Per-item failures are recorded on the affected row and do
/// not abort the batch; only a job-fatal error (unreadable parameters,
/// missing prerequisites) propagates and keeps the operation out of
/// `finished`.
pub async fn execute(op: &BatchOperation, state: &AppState) -> Result<(), AppError> {
    let kind = BatchOperationKind::from_str(&op.op_type)
        .ok_or_else(|| AppError::invalid(format!("op_type `{}` is not a batch operation type", op.op_type)))?;
    match kind {
        BatchOperationKind::CalloutPopulation => execute_callout_population(op, state).await,
        BatchOperationKind::PhoneCallCreate => execute_phone_call_create(op, state).await,
        BatchOperationKind::PhoneCallQueue => execute_phone_call_queue(op, state, false).await,
        BatchOperationKind::PhoneCallQueueRemoteFetch => {
            execute_phone_call_queue(op, state, true).await
        }
    }
}

fn contacts_query(account_id: i32, filter: &ContactFilter) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new("select contacts.* from contacts where contacts.account_id = ");
    query.push_bind(account_id);
    filter.apply(&mut query);
    query.push(" order by contacts.id");
    query
}

fn dialable_participations_query(
    op: &BatchOperation,
    params: &PhoneCallCreateParams,
) -> QueryBuilder<'static, Postgres> {
    let mut filter = params.callout_participation_filter_params.clone();
    if filter.callout_id.is_none() {
        filter.callout_id = op.callout_id;
    }
    let filter = filter.with_default_retry_rule();
    let mut query =
        QueryBuilder::new("select callout_participations.* from callout_participations where true");
    filter.apply(&mut query);
    // campaigns that are not running never dispatch
    query.push(
        " and exists (select 1 from callouts \
         where callouts.id = callout_participations.callout_id and callouts.status = ",
    );
    query.push_bind("running");
    query.push(")");
    query.push(" order by callout_participations.id");
    if let Some(limit) = params.limit {
        query.push(" limit ");
        query.push_bind(limit);
    }
    query
}

fn dispatchable_calls_query(
    op: &BatchOperation,
    params: &PhoneCallQueueParams,
) -> QueryBuilder<'static, Postgres> {
    let mut filter = params.phone_call_filter_params.clone();
    if filter.callout_id.is_none() {
        filter.callout_id = op.callout_id;
    }
    let mut query = QueryBuilder::new("select phone_calls.* from phone_calls where phone_calls.status = ");
    query.push_bind(PhoneCallStatus::Created.as_str());
    filter.apply(&mut query);
    query.push(
        " and exists (select 1 from callout_participations \
         join callouts on callouts.id = callout_participations.callout_id \
         where callout_participations.id = phone_calls.callout_participation_id \
         and callouts.status = ",
    );
    query.push_bind("running");
    query.push(")");
    query.push(" order by phone_calls.id");
    if let Some(limit) = params.limit {
        query.push(" limit ");
        query.push_bind(limit);
    }
    query
}

fn remote_fetchable_calls_query(
    op: &BatchOperation,
    params: &PhoneCallQueueParams,
) -> QueryBuilder<'static, Postgres> {
    let mut filter = params.phone_call_filter_params.clone();
    if filter.callout_id.is_none() {
        filter.callout_id = op.callout_id;
    }
    let mut query = QueryBuilder::new(
        "select phone_calls.* from phone_calls \
         where phone_calls.remote_call_id is not null and phone_calls.status = any(",
    );
    query.push_bind(vec![
        PhoneCallStatus::RemotelyQueued.as_str().to_string(),
        PhoneCallStatus::InProgress.as_str().to_string(),
    ]);
    query.push(")");
    filter.apply(&mut query);
    query.push(" order by phone_calls.id");
    if let Some(limit) = params.limit {
        query.push(" limit ");
        query.push_bind(limit);
    }
    query
}

// Re-running over already-added contacts dedups on the (callout, contact)
// and (callout, msisdn) uniqueness constraints, which keeps the body
// idempotent under requeue.
fn population_insert_query(
    op: &BatchOperation,
    callout: &Callout,
    params: &CalloutPopulationParams,
) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new(
        "insert into callout_participations \
         (callout_id, contact_id, callout_population_id, msisdn, call_flow_logic) select ",
    );
    query.push_bind(callout.id);
    query.push(", contacts.id, ");
    query.push_bind(op.id);
    query.push(", contacts.msisdn, ");
    query.push_bind(callout.call_flow_logic.clone());
    query.push(" from contacts where contacts.account_id = ");
    query.push_bind(op.account_id);
    params.contact_filter_params.apply(&mut query);
    query.push(" on conflict do nothing");
    query
}

async fn execute_callout_population(op: &BatchOperation, state: &AppState) -> Result<(), AppError> {
    let params: CalloutPopulationParams = parse_params(&op.parameters)?;
    let callout_id = op
        .callout_id
        .ok_or(AppError::invalid("callout_id is required"))?;
    let callout = sqlx::query_as::<_, Callout>("select * from callouts where id = $1")
        .bind(callout_id)
        .fetch_optional(&state.db_pool)
        .await?
        .ok_or(AppError::NotFound("callout"))?;

    let mut query = population_insert_query(op, &callout, &params);
    let result = query.build().execute(&state.db_pool).await?;
    info!(
        batch_operation_id = op.id,
        callout_id,
        participations_added = result.rows_affected(),
        "populated callout"
    );
    Ok(())
}

fn phone_call_insert_query(
    op: &BatchOperation,
    params: &PhoneCallCreateParams,
) -> QueryBuilder<'static, Postgres> {
    let mut filter = params.callout_participation_filter_params.clone();
    if filter.callout_id.is_none() {
        filter.callout_id = op.callout_id;
    }
    let filter = filter.with_default_retry_rule();

    let mut query = QueryBuilder::new(
        "insert into phone_calls \
         (callout_participation_id, contact_id, batch_operation_id, msisdn, remote_request_params) \
         select callout_participations.id, callout_participations.contact_id, ",
    );
    query.push_bind(op.id);
    query.push(", callout_participations.msisdn, ");
    query.push_bind(params.remote_request_params.clone());
    query.push(" from callout_participations where true");
    filter.apply(&mut query);
    query.push(
        " and exists (select 1 from callouts \
         where callouts.id = callout_participations.callout_id and callouts.status = ",
    );
    query.push_bind("running");
    query.push(")");
    query.push(" order by callout_participations.id");
    if let Some(limit) = params.limit {
        query.push(" limit ");
        query.push_bind(limit);
    }
    query
}

async fn execute_phone_call_create(op: &BatchOperation, state: &AppState) -> Result<(), AppError> {
    let params: PhoneCallCreateParams = parse_params(&op.parameters)?;
    let mut query = phone_call_insert_query(op, &params);
    let result = query.build().execute(&state.db_pool).await?;
    info!(
        batch_operation_id = op.id,
        phone_calls_created = result.rows_affected(),
        "created phone calls"
    );
    Ok(())
}

async fn execute_phone_call_queue(
    op: &BatchOperation,
    state: &AppState,
    remote_fetch: bool,
) -> Result<(), AppError> {
    let params: PhoneCallQueueParams = parse_params(&op.parameters)?;
    let account = sqlx::query_as::<_, Account>("select * from accounts where id = $1")
        .bind(op.account_id)
        .fetch_optional(&state.db_pool)
        .await?
        .ok_or(AppError::NotFound("account"))?;

    if remote_fetch {
        let mut query = remote_fetchable_calls_query(op, &params);
        let calls = query
            .build_query_as::<PhoneCall>()
            .fetch_all(&state.db_pool)
            .await?;
        for call in calls {
            refresh_remote_status(&account, &call, state).await;
        }
    }

    let mut query = dispatchable_calls_query(op, &params);
    let calls = query
        .build_query_as::<PhoneCall>()
        .fetch_all(&state.db_pool)
        .await?;
    for call in calls {
        // claim the row; a concurrent queue run loses the race and skips it
        let claimed = sqlx::query(
            "update phone_calls set status = $1, batch_operation_id = $2, updated_at = now() \
             where id = $3 and status = $4",
        )
        .bind(PhoneCallStatus::Queued.as_str())
        .bind(op.id)
        .bind(call.id)
        .bind(PhoneCallStatus::Created.as_str())
        .execute(&state.db_pool)
        .await?
        .rows_affected();
        if claimed == 0 {
            continue;
        }
        dispatch_call(&account, &call, &params, state).await?;
    }
    Ok(())
}

/// Hand one claimed call to the provider.  A provider rejection is a
/// per-item failure: it is recorded on the row and the batch moves on.
async fn dispatch_call(
    account: &Account,
    call: &PhoneCall,
    params: &PhoneCallQueueParams,
    state: &AppState,
) -> Result<(), AppError> {
    let request_params = if call.remote_request_params.as_object().map_or(true, |o| o.is_empty()) {
        &params.remote_request_params
    } else {
        &call.remote_request_params
    };
    match state
        .provider
        .create_call(account, &call.msisdn, request_params)
        .await
    {
        Ok(remote) => {
            sqlx::query(
                "update phone_calls set status = $1, remote_call_id = $2, remote_status = $3, \
                 updated_at = now() where id = $4",
            )
            .bind(PhoneCallStatus::RemotelyQueued.as_str())
            .bind(&remote.sid)
            .bind(&remote.status)
            .bind(call.id)
            .execute(&state.db_pool)
            .await?;
        }
        Err(e) => {
            error!(phone_call_id = call.id, error = %e, "provider rejected call");
            sqlx::query(
                "update phone_calls set status = $1, remote_error_message = $2, \
                 updated_at = now() where id = $3",
            )
            .bind(PhoneCallStatus::Errored.as_str())
            .bind(e.to_string())
            .bind(call.id)
            .execute(&state.db_pool)
            .await?;
        }
    }
    Ok(())
}

/// Re-apply the provider's view of a call.  Fetch failures are logged and
/// skipped; the next run retries them.
async fn refresh_remote_status(account: &Account, call: &PhoneCall, state: &AppState) {
    let remote_call_id = match &call.remote_call_id {
        Some(id) => id,
        None => return,
    };
    match state.provider.fetch_call(account, remote_call_id).await {
        Ok(remote) => {
            let current = PhoneCallStatus::from_str(&call.status);
            let next = remote
                .status
                .as_deref()
                .and_then(CallStatus::parse)
                .zip(current)
                .and_then(|(remote_status, current)| remote_transition(current, remote_status));
            let result = sqlx::query(
                "update phone_calls set status = coalesce($1, status), remote_status = $2, \
                 updated_at = now() where id = $3",
            )
            .bind(next.map(PhoneCallStatus::as_str))
            .bind(&remote.status)
            .bind(call.id)
            .execute(&state.db_pool)
            .await;
            if let Err(e) = result {
                error!(phone_call_id = call.id, error = %e, "failed to store remote status");
            }
        }
        Err(e) => {
            warn!(phone_call_id = call.id, error = %e, "failed to fetch remote call");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::OffsetDateTime;

    fn operation(kind: BatchOperationKind, callout_id: Option<i32>, parameters: Value) -> BatchOperation {
        BatchOperation {
            id: 42,
            account_id: 1,
            callout_id,
            op_type: kind.as_str().to_string(),
            status: "preview".to_string(),
            parameters,
            metadata: json!({}),
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn kind_round_trips_through_strings() {
        for kind in [
            BatchOperationKind::CalloutPopulation,
            BatchOperationKind::PhoneCallCreate,
            BatchOperationKind::PhoneCallQueue,
            BatchOperationKind::PhoneCallQueueRemoteFetch,
        ] {
            assert_eq!(BatchOperationKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(BatchOperationKind::from_str("contact"), None);
    }

    #[test]
    fn validate_rejects_unknown_types() {
        let err = validate("contact", None, &json!({})).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn validate_requires_a_callout_for_population() {
        assert!(validate("callout_population", None, &json!({})).is_err());
        assert!(validate("callout_population", Some(1), &json!({})).is_ok());
        assert!(validate("phone_call_queue", None, &json!({})).is_ok());
    }

    #[test]
    fn validate_rejects_malformed_parameters() {
        let err = validate(
            "phone_call_create",
            None,
            &json!({ "callout_participation_filter_params": { "callout_id": "not-a-number" } }),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn null_parameters_parse_as_defaults() {
        let params: PhoneCallQueueParams = parse_params(&Value::Null).unwrap();
        assert_eq!(params.limit, None);
        let params: PhoneCallCreateParams = parse_params(&json!({
            "remote_request_params": { "From": "1234", "Url": "https://example.com/flow" },
            "limit": 50
        }))
        .unwrap();
        assert_eq!(params.limit, Some(50));
        assert_eq!(params.remote_request_params["From"], "1234");
    }

    fn callout(call_flow_logic: Option<&str>) -> Callout {
        Callout {
            id: 3,
            account_id: 1,
            status: "running".to_string(),
            call_flow_logic: call_flow_logic.map(str::to_string),
            audio_url: Some("https://example.com/voice.mp3".to_string()),
            audio_content_type: Some("audio/mpeg".to_string()),
            audio_byte_size: Some(1024),
            metadata: json!({ "location_ids": ["120101"] }),
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn population_insert_dedups_on_the_uniqueness_constraints() {
        let op = operation(
            BatchOperationKind::CalloutPopulation,
            Some(3),
            json!({ "contact_filter_params": { "location_ids": ["120101", "120102"] } }),
        );
        let params: CalloutPopulationParams = parse_params(&op.parameters).unwrap();
        let query = population_insert_query(&op, &callout(Some("play_message")), &params);
        let sql = query.sql();
        assert!(sql.starts_with("insert into callout_participations"));
        assert!(sql.contains("contacts.metadata -> 'location_ids' ?|"));
        assert!(sql.ends_with("on conflict do nothing"));
    }

    #[test]
    fn phone_call_insert_selects_from_eligible_participations() {
        let op = operation(
            BatchOperationKind::PhoneCallCreate,
            Some(3),
            json!({ "remote_request_params": { "From": "1234" }, "limit": 5 }),
        );
        let params: PhoneCallCreateParams = parse_params(&op.parameters).unwrap();
        let query = phone_call_insert_query(&op, &params);
        let sql = query.sql();
        assert!(sql.starts_with("insert into phone_calls"));
        // the default retry rule and the running-callout gate both apply
        assert!(sql.contains(" or exists"));
        assert!(sql.contains("callouts.status = "));
        assert!(sql.contains("limit"));
    }

    #[test]
    fn dialable_participations_exclude_non_running_callouts() {
        let op = operation(BatchOperationKind::PhoneCallCreate, Some(3), json!({}));
        let params: PhoneCallCreateParams = parse_params(&op.parameters).unwrap();
        let query = dialable_participations_query(&op, &params);
        let sql = query.sql();
        assert!(sql.contains("callouts.status = "));
        assert!(sql.contains("callout_participations.callout_id = $1"));
        // the default retry rule applies when no predicate was supplied
        assert!(sql.contains(" or exists"));
    }

    #[test]
    fn dispatchable_calls_are_created_only() {
        let op = operation(BatchOperationKind::PhoneCallQueue, None, json!({ "limit": 10 }));
        let params: PhoneCallQueueParams = parse_params(&op.parameters).unwrap();
        let query = dispatchable_calls_query(&op, &params);
        let sql = query.sql();
        assert!(sql.starts_with("select phone_calls.* from phone_calls where phone_calls.status = $1"));
        assert!(sql.contains("callouts.status = "));
        assert!(sql.ends_with("limit $3"));
    }

    #[test]
    fn remote_fetch_targets_calls_the_provider_knows() {
        let op = operation(BatchOperationKind::PhoneCallQueueRemoteFetch, None, json!({}));
        let params: PhoneCallQueueParams = parse_params(&op.parameters).unwrap();
        let query = remote_fetchable_calls_query(&op, &params);
        let sql = query.sql();
        assert!(sql.contains("phone_calls.remote_call_id is not null"));
        assert!(sql.contains("phone_calls.status = any($1)"));
    }
}
