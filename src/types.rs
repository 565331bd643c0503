use crate::call_flow::CallFlowRegistry;
use crate::db_types::Account;

use serde::Deserialize;
use serde_json::Value;
use sqlx::{Pool, Postgres};
use tokio::sync::mpsc;

pub struct AppState {
    pub db_pool: Pool<Postgres>,
    pub provider: ProviderClient,
    pub call_flows: CallFlowRegistry,
    /// Wake-up channel for the batch-operation runner.  The `queued` status
    /// row is the durable signal; this only cuts the pickup latency.
    pub batch_op_notifier: mpsc::Sender<i32>,
}

/// Thin client for the telephony provider's REST API, authenticated per
/// account with the same credentials the webhook signatures are checked
/// against.
pub struct ProviderClient {
    base_url: String,
    http_client: reqwest::Client,
}

/// The subset of the provider's call resource the engine consumes.
#[derive(Deserialize, Debug)]
pub struct RemoteCallResponse {
    pub sid: String,
    pub status: Option<String>,
}

impl ProviderClient {
    pub fn new(base_url: String, http_client: reqwest::Client) -> Self {
        Self {
            base_url,
            http_client,
        }
    }

    /// Create an outbound call.  `request_params` carries provider field
    /// names verbatim (`From`, `Url`, ...); the destination number is always
    /// taken from the phone call being dispatched.
    pub async fn create_call(
        &self,
        account: &Account,
        to: &str,
        request_params: &Value,
    ) -> Result<RemoteCallResponse, reqwest::Error> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Calls.json",
            self.base_url, account.twilio_account_sid
        );
        let mut form: Vec<(String, String)> = request_params
            .as_object()
            .map(|params| {
                params
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        form.push(("To".to_string(), to.to_string()));
        self.http_client
            .post(url)
            .basic_auth(
                &account.twilio_account_sid,
                Some(&account.twilio_auth_token),
            )
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json::<RemoteCallResponse>()
            .await
    }

    pub async fn fetch_call(
        &self,
        account: &Account,
        remote_call_id: &str,
    ) -> Result<RemoteCallResponse, reqwest::Error> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Calls/{}.json",
            self.base_url, account.twilio_account_sid, remote_call_id
        );
        self.http_client
            .get(url)
            .basic_auth(
                &account.twilio_account_sid,
                Some(&account.twilio_auth_token),
            )
            .send()
            .await?
            .error_for_status()?
            .json::<RemoteCallResponse>()
            .await
    }
}
