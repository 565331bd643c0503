use crate::batch_ops;
use crate::call_flow::{resolve_logic_key, CallContext};
use crate::db_types::{
    Account, BatchOperation, Callout, CalloutParticipation, Contact, PhoneCall,
    RemotePhoneCallEvent,
};
use crate::error::AppError;
use crate::state_machine::{
    remote_transition, status_for_remote, BatchOperationEvent, BatchOperationStatus, CalloutEvent,
    CalloutStatus, PhoneCallStatus,
};
use crate::twilio_types::{
    missing_required_fields, validate_signature, wrap_twiml, CallDirection, ErrorsDocument,
    StatusCallbackPayload, SIGNATURE_HEADER,
};
use crate::types::AppState;
use crate::utils::normalize_msisdn;

use axum::extract::{Host, OriginalUri, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{Postgres, Transaction};
use std::sync::Arc;
use tracing::{debug, info};

fn empty_object() -> Value {
    json!({})
}

#[derive(Deserialize)]
pub struct CreateCalloutRequest {
    pub account_id: i32,
    pub call_flow_logic: Option<String>,
    pub audio_url: Option<String>,
    pub audio_content_type: Option<String>,
    pub audio_byte_size: Option<i64>,
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

pub async fn create_callout(
    State(app_state): State<Arc<AppState>>,
    Json(request): Json<CreateCalloutRequest>,
) -> Result<(StatusCode, Json<Callout>), AppError> {
    let mut errors = Vec::new();
    if crate::db_types::location_ids(&request.metadata).is_empty() {
        errors.push("metadata.location_ids must contain at least one location".to_string());
    }
    if request.audio_url.is_some() {
        errors.extend(voice_media_errors(
            request.audio_content_type.as_deref(),
            request.audio_byte_size,
        ));
    }
    if !errors.is_empty() {
        return Err(AppError::Validation(errors));
    }

    let callout = sqlx::query_as::<_, Callout>(
        "insert into callouts \
         (account_id, call_flow_logic, audio_url, audio_content_type, audio_byte_size, metadata) \
         values ($1, $2, $3, $4, $5, $6) returning *",
    )
    .bind(request.account_id)
    .bind(&request.call_flow_logic)
    .bind(&request.audio_url)
    .bind(&request.audio_content_type)
    .bind(request.audio_byte_size)
    .bind(&request.metadata)
    .fetch_one(&app_state.db_pool)
    .await?;
    Ok((StatusCode::CREATED, Json(callout)))
}

pub async fn show_callout(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<Callout>, AppError> {
    let callout = sqlx::query_as::<_, Callout>("select * from callouts where id = $1")
        .bind(id)
        .fetch_optional(&app_state.db_pool)
        .await?
        .ok_or(AppError::NotFound("callout"))?;
    Ok(Json(callout))
}

pub async fn delete_callout(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<StatusCode, AppError> {
    let (participations,): (i64,) =
        sqlx::query_as("select count(*) from callout_participations where callout_id = $1")
            .bind(id)
            .fetch_one(&app_state.db_pool)
            .await?;
    let (batch_operations,): (i64,) =
        sqlx::query_as("select count(*) from batch_operations where callout_id = $1")
            .bind(id)
            .fetch_one(&app_state.db_pool)
            .await?;
    if participations > 0 || batch_operations > 0 {
        return Err(AppError::Conflict(
            "callout has participations or batch operations",
        ));
    }
    let deleted = sqlx::query("delete from callouts where id = $1")
        .bind(id)
        .execute(&app_state.db_pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(AppError::NotFound("callout"));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct EventRequest {
    pub event: String,
}

pub async fn create_callout_event(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i32>,
    Json(request): Json<EventRequest>,
) -> Result<(StatusCode, Json<Callout>), AppError> {
    let event = CalloutEvent::from_str(&request.event).ok_or_else(|| {
        AppError::invalid(format!("event `{}` is not a callout event", request.event))
    })?;
    let callout = sqlx::query_as::<_, Callout>("select * from callouts where id = $1")
        .bind(id)
        .fetch_optional(&app_state.db_pool)
        .await?
        .ok_or(AppError::NotFound("callout"))?;
    let current = CalloutStatus::from_str(&callout.status)
        .ok_or(AppError::Conflict("callout event is not permitted"))?;
    let next = event
        .apply(current)
        .ok_or(AppError::Conflict("callout event is not permitted"))?;

    // activation gate: a campaign may only start with valid targeting and voice
    if event == CalloutEvent::Start {
        let mut errors = Vec::new();
        if callout.location_ids().is_empty() {
            errors.push("metadata.location_ids must contain at least one location".to_string());
        }
        match callout.audio_url {
            None => errors.push("voice is required".to_string()),
            Some(_) => errors.extend(voice_media_errors(
                callout.audio_content_type.as_deref(),
                callout.audio_byte_size,
            )),
        }
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }
    }

    let updated = sqlx::query_as::<_, Callout>(
        "update callouts set status = $1, updated_at = now() \
         where id = $2 and status = $3 returning *",
    )
    .bind(next.as_str())
    .bind(id)
    .bind(current.as_str())
    .fetch_optional(&app_state.db_pool)
    .await?
    .ok_or(AppError::Conflict("callout event is not permitted"))?;
    Ok((StatusCode::CREATED, Json(updated)))
}

#[derive(Deserialize)]
pub struct CreateParticipationRequest {
    pub callout_id: i32,
    pub contact_id: i32,
    pub msisdn: Option<String>,
    pub call_flow_logic: Option<String>,
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

pub async fn create_callout_participation(
    State(app_state): State<Arc<AppState>>,
    Json(request): Json<CreateParticipationRequest>,
) -> Result<(StatusCode, Json<CalloutParticipation>), AppError> {
    let callout = sqlx::query_as::<_, Callout>("select * from callouts where id = $1")
        .bind(request.callout_id)
        .fetch_optional(&app_state.db_pool)
        .await?
        .ok_or(AppError::NotFound("callout"))?;
    let contact = sqlx::query_as::<_, Contact>("select * from contacts where id = $1")
        .bind(request.contact_id)
        .fetch_optional(&app_state.db_pool)
        .await?
        .ok_or(AppError::NotFound("contact"))?;
    if contact.account_id != callout.account_id {
        return Err(AppError::invalid(
            "contact does not belong to the callout's account",
        ));
    }

    let msisdn = normalize_msisdn(request.msisdn.as_deref().unwrap_or(&contact.msisdn));
    let call_flow_logic = request
        .call_flow_logic
        .clone()
        .or_else(|| callout.call_flow_logic.clone());
    let participation = sqlx::query_as::<_, CalloutParticipation>(
        "insert into callout_participations \
         (callout_id, contact_id, msisdn, call_flow_logic, metadata) \
         values ($1, $2, $3, $4, $5) returning *",
    )
    .bind(request.callout_id)
    .bind(request.contact_id)
    .bind(&msisdn)
    .bind(&call_flow_logic)
    .bind(&request.metadata)
    .fetch_one(&app_state.db_pool)
    .await
    .map_err(|e| {
        AppError::on_unique_violation(e, "contact or msisdn already participates in this callout")
    })?;
    Ok((StatusCode::CREATED, Json(participation)))
}

pub async fn delete_callout_participation(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<StatusCode, AppError> {
    let (attempts,): (i64,) =
        sqlx::query_as("select count(*) from phone_calls where callout_participation_id = $1")
            .bind(id)
            .fetch_one(&app_state.db_pool)
            .await?;
    if attempts > 0 {
        return Err(AppError::Conflict("participation has phone calls"));
    }
    let deleted = sqlx::query("delete from callout_participations where id = $1")
        .bind(id)
        .execute(&app_state.db_pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(AppError::NotFound("callout participation"));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct CreateBatchOperationRequest {
    pub account_id: i32,
    pub op_type: String,
    pub callout_id: Option<i32>,
    #[serde(default = "empty_object")]
    pub parameters: Value,
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

pub async fn create_batch_operation(
    State(app_state): State<Arc<AppState>>,
    Json(request): Json<CreateBatchOperationRequest>,
) -> Result<(StatusCode, Json<BatchOperation>), AppError> {
    batch_ops::validate(&request.op_type, request.callout_id, &request.parameters)?;
    if let Some(callout_id) = request.callout_id {
        let callout = sqlx::query_as::<_, Callout>("select * from callouts where id = $1")
            .bind(callout_id)
            .fetch_optional(&app_state.db_pool)
            .await?
            .ok_or(AppError::NotFound("callout"))?;
        if callout.account_id != request.account_id {
            return Err(AppError::invalid(
                "callout does not belong to the requested account",
            ));
        }
    }

    let operation = sqlx::query_as::<_, BatchOperation>(
        "insert into batch_operations (account_id, callout_id, op_type, parameters, metadata) \
         values ($1, $2, $3, $4, $5) returning *",
    )
    .bind(request.account_id)
    .bind(request.callout_id)
    .bind(&request.op_type)
    .bind(&request.parameters)
    .bind(&request.metadata)
    .fetch_one(&app_state.db_pool)
    .await?;
    Ok((StatusCode::CREATED, Json(operation)))
}

pub async fn show_batch_operation(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<BatchOperation>, AppError> {
    let operation =
        sqlx::query_as::<_, BatchOperation>("select * from batch_operations where id = $1")
            .bind(id)
            .fetch_optional(&app_state.db_pool)
            .await?
            .ok_or(AppError::NotFound("batch operation"))?;
    Ok(Json(operation))
}

pub async fn create_batch_operation_event(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i32>,
    Json(request): Json<EventRequest>,
) -> Result<(StatusCode, Json<BatchOperation>), AppError> {
    let event = BatchOperationEvent::from_str(&request.event).ok_or_else(|| {
        AppError::invalid(format!(
            "event `{}` is not a batch operation event",
            request.event
        ))
    })?;
    if !matches!(
        event,
        BatchOperationEvent::Queue | BatchOperationEvent::Requeue
    ) {
        return Err(AppError::invalid(format!(
            "event `{}` cannot be requested",
            request.event
        )));
    }
    let operation =
        sqlx::query_as::<_, BatchOperation>("select * from batch_operations where id = $1")
            .bind(id)
            .fetch_optional(&app_state.db_pool)
            .await?
            .ok_or(AppError::NotFound("batch operation"))?;
    let current = BatchOperationStatus::from_str(&operation.status)
        .ok_or(AppError::Conflict("batch operation event is not permitted"))?;
    let next = event
        .apply(current)
        .ok_or(AppError::Conflict("batch operation event is not permitted"))?;

    let updated = sqlx::query_as::<_, BatchOperation>(
        "update batch_operations set status = $1, updated_at = now() \
         where id = $2 and status = $3 returning *",
    )
    .bind(next.as_str())
    .bind(id)
    .bind(current.as_str())
    .fetch_optional(&app_state.db_pool)
    .await?
    .ok_or(AppError::Conflict("batch operation event is not permitted"))?;

    // the committed row is the durable signal; this just wakes the runner
    let _ = app_state.batch_op_notifier.try_send(updated.id);
    Ok((StatusCode::CREATED, Json(updated)))
}

pub async fn preview_batch_operation(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<batch_ops::PreviewResult>, AppError> {
    let operation =
        sqlx::query_as::<_, BatchOperation>("select * from batch_operations where id = $1")
            .bind(id)
            .fetch_optional(&app_state.db_pool)
            .await?
            .ok_or(AppError::NotFound("batch operation"))?;
    let preview = batch_ops::preview(&operation, &app_state).await?;
    Ok(Json(preview))
}

/// The provider's call-status callback.  Responds with the voice-menu markup
/// produced by the callout's call flow logic; authorization and validation
/// fail closed before any state is touched.
pub async fn create_remote_phone_call_event(
    Host(host): Host,
    OriginalUri(uri): OriginalUri,
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if unsupported_format(uri.query()) {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }
    match process_remote_phone_call_event(&app_state, &host, &uri, &headers, &body).await {
        Ok(twiml) => (StatusCode::CREATED, xml_headers(), twiml).into_response(),
        Err(AppError::Validation(errors)) => {
            let document = ErrorsDocument::new(errors);
            let xml = wrap_twiml(xmlserde::xml_serialize(document));
            (StatusCode::UNPROCESSABLE_ENTITY, xml_headers(), xml).into_response()
        }
        Err(e) => e.into_response(),
    }
}

fn xml_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "application/xml".parse().unwrap());
    headers
}

/// The endpoint only answers in the default voice-menu markup format.
fn unsupported_format(query: Option<&str>) -> bool {
    let Some(query) = query else { return false };
    let params: Vec<(String, String)> = serde_urlencoded::from_str(query).unwrap_or_default();
    params
        .iter()
        .any(|(k, v)| k == "format" && v != "xml" && v != "twiml")
}

async fn process_remote_phone_call_event(
    app_state: &AppState,
    host: &str,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    body: &str,
) -> Result<String, AppError> {
    let params: Vec<(String, String)> = serde_urlencoded::from_str(body).map_err(|e| {
        debug!(error = %e, "unparseable webhook body");
        AppError::invalid("request body is not form encoded")
    })?;

    // authorization fails closed before anything is recorded
    let account_sid = params
        .iter()
        .find(|(k, _)| k == "AccountSid")
        .map(|(_, v)| v.clone())
        .ok_or(AppError::Authorization)?;
    let account = sqlx::query_as::<_, Account>(
        "select * from accounts where twilio_account_sid = $1",
    )
    .bind(&account_sid)
    .fetch_optional(&app_state.db_pool)
    .await?
    .ok_or(AppError::Authorization)?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(AppError::Authorization)?;
    let url = format!(
        "https://{}{}",
        host,
        uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    );
    if !validate_signature(&account.twilio_auth_token, &url, &params, signature) {
        return Err(AppError::Authorization);
    }

    let missing = missing_required_fields(&params);
    if !missing.is_empty() {
        return Err(AppError::Validation(
            missing.iter().map(|field| format!("{field} is required")).collect(),
        ));
    }
    let payload: StatusCallbackPayload = serde_urlencoded::from_str(body)
        .map_err(|e| AppError::invalid(format!("payload is invalid: {e}")))?;

    let (phone_call, event) = record_event(app_state, &account, &payload, &params).await?;

    let participation = match phone_call.callout_participation_id {
        Some(participation_id) => sqlx::query_as::<_, CalloutParticipation>(
            "select * from callout_participations where id = $1",
        )
        .bind(participation_id)
        .fetch_optional(&app_state.db_pool)
        .await?,
        None => None,
    };
    let callout = match participation.as_ref().map(|p| p.callout_id) {
        Some(callout_id) => sqlx::query_as::<_, Callout>("select * from callouts where id = $1")
            .bind(callout_id)
            .fetch_optional(&app_state.db_pool)
            .await?,
        None => None,
    };
    let event_history = sqlx::query_as::<_, RemotePhoneCallEvent>(
        "select * from remote_phone_call_events where phone_call_id = $1 order by created_at, id",
    )
    .bind(phone_call.id)
    .fetch_all(&app_state.db_pool)
    .await?;

    let logic_key = resolve_logic_key(
        event.call_flow_logic.as_deref(),
        participation.as_ref(),
        callout.as_ref(),
        &account,
    );
    let flow = app_state.call_flows.get(&logic_key)?;
    info!(
        phone_call_id = phone_call.id,
        remote_call_id = %payload.call_sid,
        call_flow_logic = %logic_key,
        "handled remote phone call event"
    );
    let context = CallContext {
        payload,
        phone_call,
        participation,
        callout,
        event_history,
    };
    Ok(wrap_twiml(xmlserde::xml_serialize(flow.respond(&context))))
}

/// Record the event and bring the phone call's status in line with it, in
/// one transaction.  An unseen remote call id creates the call (the first
/// leg of a call this engine did not place); a seen one is updated in place,
/// so duplicate deliveries append an event but change nothing else.
async fn record_event(
    app_state: &AppState,
    account: &Account,
    payload: &StatusCallbackPayload,
    params: &[(String, String)],
) -> Result<(PhoneCall, RemotePhoneCallEvent), AppError> {
    let details = Value::Object(
        params
            .iter()
            .cloned()
            .map(|(k, v)| (k, Value::String(v)))
            .collect(),
    );
    let mut tx = app_state.db_pool.begin().await?;
    let existing =
        sqlx::query_as::<_, PhoneCall>("select * from phone_calls where remote_call_id = $1")
            .bind(&payload.call_sid)
            .fetch_optional(&mut *tx)
            .await?;
    let phone_call = match existing {
        Some(call) => apply_event_to_call(&mut tx, &call, payload).await?,
        None => match create_phone_call_from_event(&mut tx, account, payload).await? {
            Some(call) => call,
            None => {
                // a concurrent event won the insert race; fall back to update
                let call = sqlx::query_as::<_, PhoneCall>(
                    "select * from phone_calls where remote_call_id = $1",
                )
                .bind(&payload.call_sid)
                .fetch_one(&mut *tx)
                .await?;
                apply_event_to_call(&mut tx, &call, payload).await?
            }
        },
    };
    let event = sqlx::query_as::<_, RemotePhoneCallEvent>(
        "insert into remote_phone_call_events \
         (phone_call_id, details, remote_call_id, remote_direction) \
         values ($1, $2, $3, $4) returning *",
    )
    .bind(phone_call.id)
    .bind(&details)
    .bind(&payload.call_sid)
    .bind(payload.direction.as_str())
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok((phone_call, event))
}

async fn apply_event_to_call(
    tx: &mut Transaction<'_, Postgres>,
    call: &PhoneCall,
    payload: &StatusCallbackPayload,
) -> Result<PhoneCall, AppError> {
    let next = PhoneCallStatus::from_str(&call.status)
        .and_then(|current| remote_transition(current, payload.call_status));
    let updated = sqlx::query_as::<_, PhoneCall>(
        "update phone_calls set status = coalesce($1, status), remote_status = $2, \
         remote_direction = $3, updated_at = now() where id = $4 returning *",
    )
    .bind(next.map(PhoneCallStatus::as_str))
    .bind(payload.call_status.as_str())
    .bind(payload.direction.as_str())
    .bind(call.id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(updated)
}

async fn create_phone_call_from_event(
    tx: &mut Transaction<'_, Postgres>,
    account: &Account,
    payload: &StatusCallbackPayload,
) -> Result<Option<PhoneCall>, AppError> {
    let contact_msisdn = normalize_msisdn(match payload.direction {
        CallDirection::Inbound => &payload.from,
        _ => &payload.to,
    });
    let contact = sqlx::query_as::<_, Contact>(
        "insert into contacts (account_id, msisdn) values ($1, $2) \
         on conflict (account_id, msisdn) do update set msisdn = excluded.msisdn returning *",
    )
    .bind(account.id)
    .bind(&contact_msisdn)
    .fetch_one(&mut **tx)
    .await?;
    let status = status_for_remote(payload.call_status);
    let inserted = sqlx::query_as::<_, PhoneCall>(
        "insert into phone_calls \
         (contact_id, status, msisdn, remote_call_id, remote_status, remote_direction) \
         values ($1, $2, $3, $4, $5, $6) \
         on conflict (remote_call_id) where remote_call_id is not null do nothing returning *",
    )
    .bind(contact.id)
    .bind(status.as_str())
    .bind(&contact_msisdn)
    .bind(&payload.call_sid)
    .bind(payload.call_status.as_str())
    .bind(payload.direction.as_str())
    .fetch_optional(&mut **tx)
    .await?;
    Ok(inserted)
}

fn voice_media_errors(content_type: Option<&str>, byte_size: Option<i64>) -> Vec<String> {
    let mut errors = Vec::new();
    if !matches!(content_type, Some(ct) if crate::consts::AUDIO_CONTENT_TYPES.contains(&ct)) {
        errors.push("voice must be an mpeg or wav audio file".to_string());
    }
    if !matches!(byte_size, Some(size) if size > 0 && size <= crate::consts::MAX_AUDIO_BYTES) {
        errors.push("voice must be 10 megabytes or smaller".to_string());
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_media_checks_type_and_size() {
        assert!(voice_media_errors(Some("audio/mpeg"), Some(1024)).is_empty());
        assert!(voice_media_errors(Some("audio/wav"), Some(crate::consts::MAX_AUDIO_BYTES)).is_empty());

        let errors = voice_media_errors(Some("video/mp4"), Some(1024));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("audio"));

        let errors = voice_media_errors(Some("audio/mpeg"), Some(crate::consts::MAX_AUDIO_BYTES + 1));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("10 megabytes"));

        assert_eq!(voice_media_errors(None, None).len(), 2);
    }

    #[test]
    fn only_the_default_format_is_accepted() {
        assert!(!unsupported_format(None));
        assert!(!unsupported_format(Some("")));
        assert!(!unsupported_format(Some("format=xml")));
        assert!(!unsupported_format(Some("format=twiml")));
        assert!(unsupported_format(Some("format=json")));
        assert!(unsupported_format(Some("foo=1&format=json")));
    }
}
