use serde::Serialize;
use serde_json::Value;
use sqlx::types::time::OffsetDateTime;

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Account {
    pub id: i32,
    pub twilio_account_sid: String,
    #[serde(skip_serializing)]
    pub twilio_auth_token: String,
    pub call_flow_logic: Option<String>,
    pub metadata: Value,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Contact {
    pub id: i32,
    pub account_id: i32,
    pub msisdn: String,
    pub metadata: Value,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Callout {
    pub id: i32,
    pub account_id: i32,
    pub status: String,
    pub call_flow_logic: Option<String>,
    pub audio_url: Option<String>,
    pub audio_content_type: Option<String>,
    pub audio_byte_size: Option<i64>,
    pub metadata: Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Callout {
    /// The structured location-id list carried in the targeting metadata.
    pub fn location_ids(&self) -> Vec<String> {
        location_ids(&self.metadata)
    }
}

pub fn location_ids(metadata: &Value) -> Vec<String> {
    metadata
        .get("location_ids")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct CalloutParticipation {
    pub id: i32,
    pub callout_id: i32,
    pub contact_id: i32,
    pub callout_population_id: Option<i32>,
    pub msisdn: String,
    pub call_flow_logic: Option<String>,
    pub metadata: Value,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct PhoneCall {
    pub id: i32,
    pub callout_participation_id: Option<i32>,
    pub contact_id: i32,
    pub batch_operation_id: Option<i32>,
    pub status: String,
    pub msisdn: String,
    pub remote_call_id: Option<String>,
    pub remote_status: Option<String>,
    pub remote_direction: Option<String>,
    pub remote_error_message: Option<String>,
    pub remote_request_params: Value,
    pub metadata: Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct RemotePhoneCallEvent {
    pub id: i32,
    pub phone_call_id: i32,
    pub details: Value,
    pub remote_call_id: String,
    pub remote_direction: Option<String>,
    pub call_flow_logic: Option<String>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct BatchOperation {
    pub id: i32,
    pub account_id: i32,
    pub callout_id: Option<i32>,
    pub op_type: String,
    pub status: String,
    pub parameters: Value,
    pub metadata: Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}
