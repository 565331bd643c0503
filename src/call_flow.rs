//! Pluggable call-flow logic: a registry of strategies, looked up by a string
//! key, that turn the state of a call into the next voice-menu instruction.

use crate::db_types::{Account, Callout, CalloutParticipation, PhoneCall, RemotePhoneCallEvent};
use crate::error::AppError;
use crate::state_machine::PhoneCallStatus;
use crate::twilio_types::{PlayAction, Response, ResponseAction, SayAction, StatusCallbackPayload};

use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_CALL_FLOW_LOGIC: &str = "hello_world";

/// Everything a strategy may consult to decide the next instruction: the
/// event that just arrived, the call it belongs to, the campaign context (if
/// the call was dispatched by one) and the full event history for the call.
pub struct CallContext {
    pub payload: StatusCallbackPayload,
    pub phone_call: PhoneCall,
    pub participation: Option<CalloutParticipation>,
    pub callout: Option<Callout>,
    pub event_history: Vec<RemotePhoneCallEvent>,
}

impl CallContext {
    pub fn call_is_terminal(&self) -> bool {
        PhoneCallStatus::from_str(&self.phone_call.status)
            .map(PhoneCallStatus::is_terminal)
            .unwrap_or(false)
    }
}

/// A pure function from call context to the markup answering the webhook.
pub trait CallFlowLogic: Send + Sync {
    fn respond(&self, context: &CallContext) -> Response;
}

/// Speaks a fixed greeting on every event until the call ends.
pub struct HelloWorld;

impl CallFlowLogic for HelloWorld {
    fn respond(&self, context: &CallContext) -> Response {
        if context.call_is_terminal() {
            return Response::empty();
        }
        Response {
            actions: vec![ResponseAction::Say(SayAction {
                text: "Hello World!".to_string(),
                ..Default::default()
            })],
        }
    }
}

/// Plays the campaign's recorded voice message, then lets the call end.
pub struct PlayMessage;

impl CallFlowLogic for PlayMessage {
    fn respond(&self, context: &CallContext) -> Response {
        if context.call_is_terminal() {
            return Response::empty();
        }
        let audio_url = context
            .callout
            .as_ref()
            .and_then(|callout| callout.audio_url.clone());
        match audio_url {
            Some(url) => Response {
                actions: vec![ResponseAction::Play(PlayAction {
                    url,
                    ..Default::default()
                })],
            },
            None => Response::empty(),
        }
    }
}

pub struct CallFlowRegistry {
    flows: HashMap<String, Arc<dyn CallFlowLogic>>,
}

impl CallFlowRegistry {
    pub fn with_builtin_flows() -> Self {
        let mut registry = CallFlowRegistry {
            flows: HashMap::new(),
        };
        registry.register(DEFAULT_CALL_FLOW_LOGIC, Arc::new(HelloWorld));
        registry.register("play_message", Arc::new(PlayMessage));
        registry
    }

    pub fn register(&mut self, key: &str, flow: Arc<dyn CallFlowLogic>) {
        self.flows.insert(key.to_string(), flow);
    }

    /// Looking up a key nobody registered is a configuration error, never a
    /// silent no-op.
    pub fn get(&self, key: &str) -> Result<Arc<dyn CallFlowLogic>, AppError> {
        self.flows
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::UnknownCallFlowLogic(key.to_string()))
    }
}

/// Which strategy drives the response for this event.  The most specific
/// override wins: the event itself, then the participation, then the callout,
/// then the account default.
pub fn resolve_logic_key(
    event_logic: Option<&str>,
    participation: Option<&CalloutParticipation>,
    callout: Option<&Callout>,
    account: &Account,
) -> String {
    event_logic
        .map(str::to_string)
        .or_else(|| participation.and_then(|p| p.call_flow_logic.clone()))
        .or_else(|| callout.and_then(|c| c.call_flow_logic.clone()))
        .or_else(|| account.call_flow_logic.clone())
        .unwrap_or_else(|| DEFAULT_CALL_FLOW_LOGIC.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twilio_types::{CallDirection, CallStatus};
    use serde_json::json;
    use time::OffsetDateTime;

    fn payload(status: CallStatus) -> StatusCallbackPayload {
        StatusCallbackPayload {
            call_sid: "CA123".to_string(),
            account_sid: "AC123".to_string(),
            direction: CallDirection::OutboundApi,
            call_status: status,
            from: "345".to_string(),
            to: "+85510202101".to_string(),
            api_version: None,
            call_duration: None,
            sip_response_code: None,
        }
    }

    fn phone_call(status: &str) -> PhoneCall {
        PhoneCall {
            id: 1,
            callout_participation_id: None,
            contact_id: 1,
            batch_operation_id: None,
            status: status.to_string(),
            msisdn: "+85510202101".to_string(),
            remote_call_id: Some("CA123".to_string()),
            remote_status: None,
            remote_direction: None,
            remote_error_message: None,
            remote_request_params: json!({}),
            metadata: json!({}),
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn callout(audio_url: Option<&str>, call_flow_logic: Option<&str>) -> Callout {
        Callout {
            id: 1,
            account_id: 1,
            status: "running".to_string(),
            call_flow_logic: call_flow_logic.map(str::to_string),
            audio_url: audio_url.map(str::to_string),
            audio_content_type: Some("audio/mpeg".to_string()),
            audio_byte_size: Some(1024),
            metadata: json!({ "location_ids": ["120101"] }),
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn account(call_flow_logic: Option<&str>) -> Account {
        Account {
            id: 1,
            twilio_account_sid: "AC123".to_string(),
            twilio_auth_token: "secret".to_string(),
            call_flow_logic: call_flow_logic.map(str::to_string),
            metadata: json!({}),
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn context(status: &str, callout: Option<Callout>) -> CallContext {
        CallContext {
            payload: payload(CallStatus::InProgress),
            phone_call: phone_call(status),
            participation: None,
            callout,
            event_history: vec![],
        }
    }

    #[test]
    fn unregistered_key_is_an_error() {
        let registry = CallFlowRegistry::with_builtin_flows();
        assert!(registry.get(DEFAULT_CALL_FLOW_LOGIC).is_ok());
        assert!(matches!(
            registry.get("bogus"),
            Err(AppError::UnknownCallFlowLogic(key)) if key == "bogus"
        ));
    }

    #[test]
    fn hello_world_says_the_greeting() {
        let response = HelloWorld.respond(&context("in_progress", None));
        assert_eq!(response.actions.len(), 1);
        assert!(matches!(
            &response.actions[0],
            ResponseAction::Say(say) if say.text == "Hello World!"
        ));
    }

    #[test]
    fn terminal_calls_get_an_empty_response() {
        let response = HelloWorld.respond(&context("completed", None));
        assert!(response.actions.is_empty());
    }

    #[test]
    fn play_message_plays_the_callout_audio() {
        let ctx = context(
            "in_progress",
            Some(callout(Some("https://example.com/voice.mp3"), None)),
        );
        let response = PlayMessage.respond(&ctx);
        assert!(matches!(
            &response.actions[0],
            ResponseAction::Play(play) if play.url == "https://example.com/voice.mp3"
        ));
    }

    #[test]
    fn play_message_without_audio_is_empty() {
        let response = PlayMessage.respond(&context("in_progress", Some(callout(None, None))));
        assert!(response.actions.is_empty());
    }

    #[test]
    fn logic_key_resolution_prefers_the_most_specific_override() {
        let account_with_default = account(Some("play_message"));
        let c = callout(None, Some("callout_logic"));
        let participation = CalloutParticipation {
            id: 1,
            callout_id: 1,
            contact_id: 1,
            callout_population_id: None,
            msisdn: "+85510202101".to_string(),
            call_flow_logic: Some("participation_logic".to_string()),
            metadata: json!({}),
            created_at: OffsetDateTime::UNIX_EPOCH,
        };

        assert_eq!(
            resolve_logic_key(
                Some("event_logic"),
                Some(&participation),
                Some(&c),
                &account_with_default
            ),
            "event_logic"
        );
        assert_eq!(
            resolve_logic_key(None, Some(&participation), Some(&c), &account_with_default),
            "participation_logic"
        );
        assert_eq!(
            resolve_logic_key(None, None, Some(&c), &account_with_default),
            "callout_logic"
        );
        assert_eq!(
            resolve_logic_key(None, None, None, &account_with_default),
            "play_message"
        );
        assert_eq!(
            resolve_logic_key(None, None, None, &account(None)),
            DEFAULT_CALL_FLOW_LOGIC
        );
    }
}
