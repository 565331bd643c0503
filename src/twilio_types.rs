pub fn wrap_twiml(twiml: String) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{twiml}")
}

mod twiml {
    use xmlserde_derives::XmlSerialize;

    #[derive(PartialEq, Eq, XmlSerialize)]
    #[xmlserde(root = b"Response")]
    pub struct Response {
        #[xmlserde(ty = "untag")]
        pub actions: Vec<ResponseAction>,
    }

    impl Response {
        /// A response carrying no further instruction; a valid terminal
        /// answer to a status callback.
        pub fn empty() -> Self {
            Response { actions: vec![] }
        }
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum ResponseAction {
        #[xmlserde(name = b"Say")]
        Say(SayAction),
        #[xmlserde(name = b"Play")]
        Play(PlayAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct SayAction {
        #[xmlserde(ty = "text")]
        pub text: String,
        #[xmlserde(name = b"voice", ty = "attr")]
        pub voice: Option<String>,
        #[xmlserde(name = b"loop", ty = "attr")]
        pub lp: Option<u16>,
        #[xmlserde(name = b"language", ty = "attr")]
        pub language: Option<String>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct PlayAction {
        #[xmlserde(ty = "text")]
        pub url: String,
        #[xmlserde(name = b"loop", ty = "attr")]
        pub lp: Option<u16>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    #[xmlserde(root = b"errors")]
    pub struct ErrorsDocument {
        #[xmlserde(name = b"error", ty = "child")]
        pub errors: Vec<ErrorItem>,
    }

    impl ErrorsDocument {
        pub fn new(messages: Vec<String>) -> Self {
            ErrorsDocument {
                errors: messages
                    .into_iter()
                    .map(|message| ErrorItem { message })
                    .collect(),
            }
        }
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub struct ErrorItem {
        #[xmlserde(ty = "text")]
        pub message: String,
    }
}
pub use twiml::*;

mod webhook {
    use serde::Deserialize;

    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum CallStatus {
        Queued,
        Ringing,
        InProgress,
        Completed,
        Busy,
        Failed,
        NoAnswer,
        Canceled,
    }

    impl CallStatus {
        pub fn as_str(self) -> &'static str {
            match self {
                CallStatus::Queued => "queued",
                CallStatus::Ringing => "ringing",
                CallStatus::InProgress => "in-progress",
                CallStatus::Completed => "completed",
                CallStatus::Busy => "busy",
                CallStatus::Failed => "failed",
                CallStatus::NoAnswer => "no-answer",
                CallStatus::Canceled => "canceled",
            }
        }

        pub fn parse(s: &str) -> Option<Self> {
            match s {
                "queued" => Some(CallStatus::Queued),
                "ringing" => Some(CallStatus::Ringing),
                "in-progress" => Some(CallStatus::InProgress),
                "completed" => Some(CallStatus::Completed),
                "busy" => Some(CallStatus::Busy),
                "failed" => Some(CallStatus::Failed),
                "no-answer" => Some(CallStatus::NoAnswer),
                "canceled" => Some(CallStatus::Canceled),
                _ => None,
            }
        }
    }

    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum CallDirection {
        Inbound,
        OutboundApi,
        OutboundDial,
    }

    impl CallDirection {
        pub fn as_str(self) -> &'static str {
            match self {
                CallDirection::Inbound => "inbound",
                CallDirection::OutboundApi => "outbound-api",
                CallDirection::OutboundDial => "outbound-dial",
            }
        }
    }

    /// The call-status callback the provider posts to the webhook endpoint,
    /// form-encoded with PascalCase field names.
    #[derive(Deserialize, Debug, Clone)]
    #[serde(rename_all = "PascalCase")]
    pub struct StatusCallbackPayload {
        pub call_sid: String,
        pub account_sid: String,
        pub direction: CallDirection,
        pub call_status: CallStatus,
        pub from: String,
        pub to: String,
        pub api_version: Option<String>,
        pub call_duration: Option<String>,
        pub sip_response_code: Option<String>,
    }

    /// Fields a status callback must carry before any state is touched.
    pub const REQUIRED_FIELDS: &[&str] =
        &["CallSid", "AccountSid", "Direction", "CallStatus", "From", "To"];

    /// Names of the required fields absent (or blank) in the posted params.
    pub fn missing_required_fields(params: &[(String, String)]) -> Vec<&'static str> {
        REQUIRED_FIELDS
            .iter()
            .filter(|field| {
                !params
                    .iter()
                    .any(|(k, v)| k == *field && !v.trim().is_empty())
            })
            .copied()
            .collect()
    }
}
pub use webhook::*;

mod signature {
    use base64::{engine, Engine};
    use hmac::{Hmac, Mac};
    use sha1::Sha1;

    type HmacSha1 = Hmac<Sha1>;

    pub const SIGNATURE_HEADER: &str = "X-Twilio-Signature";

    fn mac_for(auth_token: &str, url: &str, params: &[(String, String)]) -> HmacSha1 {
        let mut sorted: Vec<&(String, String)> = params.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let mut data = url.to_string();
        for (key, value) in sorted {
            data.push_str(key);
            data.push_str(value);
        }
        let mut mac =
            HmacSha1::new_from_slice(auth_token.as_bytes()).expect("HMAC accepts any key length");
        mac.update(data.as_bytes());
        mac
    }

    /// The signature the provider computes for a request: HMAC-SHA1 over the
    /// full request URL followed by the form params sorted by name, keyed by
    /// the account's auth token, base64-encoded.
    pub fn build_signature(auth_token: &str, url: &str, params: &[(String, String)]) -> String {
        let mac = mac_for(auth_token, url, params);
        engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    pub fn validate_signature(
        auth_token: &str,
        url: &str,
        params: &[(String, String)],
        signature: &str,
    ) -> bool {
        let provided = match engine::general_purpose::STANDARD.decode(signature) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        mac_for(auth_token, url, params).verify_slice(&provided).is_ok()
    }
}
pub use signature::*;

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // The worked example from the provider's security documentation.
    #[test]
    fn builds_the_documented_signature() {
        let url = "https://mycompany.com/myapp.php?foo=1&bar=2";
        let params = params(&[
            ("Digits", "1234"),
            ("To", "+18005551212"),
            ("From", "+14158675310"),
            ("Caller", "+14158675310"),
            ("CallSid", "CA1234567890ABCDE"),
        ]);
        assert_eq!(
            build_signature("12345", url, &params),
            "RSOYDt4T1cUTdK1PDd93/VVr8B8="
        );
        assert!(validate_signature(
            "12345",
            url,
            &params,
            "RSOYDt4T1cUTdK1PDd93/VVr8B8="
        ));
    }

    #[test]
    fn rejects_a_tampered_signature() {
        let url = "https://example.com/api/remote_phone_call_events";
        let params = params(&[("CallSid", "CA123"), ("CallStatus", "completed")]);
        let good = build_signature("secret", url, &params);
        assert!(validate_signature("secret", url, &params, &good));
        assert!(!validate_signature("secret", url, &params, "wrong"));
        assert!(!validate_signature("other-secret", url, &params, &good));
        let mut tampered = params.clone();
        tampered.push(("Digits".to_string(), "1".to_string()));
        assert!(!validate_signature("secret", url, &tampered, &good));
    }

    #[test]
    fn reports_missing_required_fields() {
        let missing = missing_required_fields(&params(&[
            ("CallSid", "CA123"),
            ("AccountSid", "AC123"),
            ("CallStatus", ""),
        ]));
        assert_eq!(missing, vec!["Direction", "CallStatus", "From", "To"]);
        assert!(missing_required_fields(&params(&[
            ("CallSid", "CA123"),
            ("AccountSid", "AC123"),
            ("Direction", "inbound"),
            ("CallStatus", "ringing"),
            ("From", "+85510202101"),
            ("To", "345"),
        ]))
        .is_empty());
    }

    #[test]
    fn parses_a_status_callback_payload() {
        let body = "CallSid=CA123&AccountSid=AC123&Direction=inbound\
                    &CallStatus=in-progress&From=%2B85510202101&To=345";
        let payload: StatusCallbackPayload = serde_urlencoded::from_str(body).unwrap();
        assert_eq!(payload.call_sid, "CA123");
        assert_eq!(payload.direction, CallDirection::Inbound);
        assert_eq!(payload.call_status, CallStatus::InProgress);
        assert_eq!(payload.from, "+85510202101");
    }

    #[test]
    fn call_status_round_trips() {
        for status in [
            CallStatus::Queued,
            CallStatus::Ringing,
            CallStatus::InProgress,
            CallStatus::Completed,
            CallStatus::Busy,
            CallStatus::Failed,
            CallStatus::NoAnswer,
            CallStatus::Canceled,
        ] {
            assert_eq!(CallStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CallStatus::parse("in_progress"), None);
    }

    #[test]
    fn serializes_twiml() {
        let response = Response {
            actions: vec![ResponseAction::Say(SayAction {
                text: "Hello World!".to_string(),
                ..Default::default()
            })],
        };
        let twiml = wrap_twiml(xmlserde::xml_serialize(response));
        assert!(twiml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(twiml.contains("<Say>Hello World!</Say>"));
    }

    #[test]
    fn serializes_an_empty_response() {
        let twiml = xmlserde::xml_serialize(Response::empty());
        assert!(twiml.contains("Response"));
        assert!(!twiml.contains("<Say>"));
        assert!(!twiml.contains("<Play>"));
    }
}
