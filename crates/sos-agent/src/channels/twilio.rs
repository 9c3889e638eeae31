//! Twilio-style REST messaging provider.
//!
//! ```text
//! POST {base}/2010-04-01/Accounts/{sid}/Messages.json   To, From, Body
//! POST {base}/2010-04-01/Accounts/{sid}/Calls.json      To, From, Twiml
//! ```
//!
//! Both authenticate with HTTP basic auth (account SID, auth token) and
//! answer `{"sid": ".."}` on success or `{"code", "message", "status"}` on
//! failure.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{ProviderId, TextChannel, VoiceChannel};
use crate::config::ProviderConfig;
use crate::contacts::Contact;
use crate::errors::{ChannelError, ConfigError};
use crate::messages::VoiceScript;

/// Provider error codes that mean the destination number is unusable.
const INVALID_DESTINATION_CODES: &[i64] = &[21211, 21214, 21217, 21614];

#[derive(Debug, Deserialize)]
struct Accepted {
    sid: String,
}

#[derive(Debug, Default, Deserialize)]
struct Rejected {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

pub struct TwilioClient {
    client: reqwest::Client,
    base_url: String,
    account_sid: String,
    auth_token: String,
    from: Contact,
}

impl TwilioClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from: config.sender()?,
        })
    }

    fn resource_url(&self, resource: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/{resource}.json",
            self.base_url, self.account_sid
        )
    }

    async fn post(
        &self,
        resource: &str,
        contact: &Contact,
        form: &[(&str, &str)],
    ) -> Result<ProviderId, ChannelError> {
        let resp = self
            .client
            .post(self.resource_url(resource))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(form)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        debug!(resource, status, contact = %contact, "Provider responded");
        interpret_response(status, &body, contact)
    }
}

/// Map a provider HTTP answer to a `ProviderId` or a `ChannelError`.
pub fn interpret_response(
    status: u16,
    body: &str,
    contact: &Contact,
) -> Result<ProviderId, ChannelError> {
    if (200..300).contains(&status) {
        return serde_json::from_str::<Accepted>(body)
            .map(|a| ProviderId(a.sid))
            .map_err(|e| ChannelError::Provider {
                status,
                code: None,
                message: format!("accepted but response had no sid: {e}"),
            });
    }

    let rejected: Rejected = serde_json::from_str(body).unwrap_or_default();
    let message = rejected
        .message
        .unwrap_or_else(|| body.chars().take(200).collect());

    match (status, rejected.code) {
        (401 | 403, _) => Err(ChannelError::Authentication(message)),
        (_, Some(code)) if INVALID_DESTINATION_CODES.contains(&code) => {
            Err(ChannelError::InvalidDestination {
                contact: contact.to_string(),
                message,
            })
        }
        (_, code) => Err(ChannelError::Provider {
            status,
            code,
            message,
        }),
    }
}

#[async_trait]
impl TextChannel for TwilioClient {
    async fn send_text(&self, contact: &Contact, body: &str) -> Result<ProviderId, ChannelError> {
        self.post(
            "Messages",
            contact,
            &[
                ("To", contact.as_str()),
                ("From", self.from.as_str()),
                ("Body", body),
            ],
        )
        .await
    }
}

#[async_trait]
impl VoiceChannel for TwilioClient {
    async fn place_voice_call(
        &self,
        contact: &Contact,
        script: &VoiceScript,
    ) -> Result<ProviderId, ChannelError> {
        let twiml = script.to_twiml();
        self.post(
            "Calls",
            contact,
            &[
                ("To", contact.as_str()),
                ("From", self.from.as_str()),
                ("Twiml", twiml.as_str()),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ChannelFailureKind;

    fn contact() -> Contact {
        Contact::parse("+919391502293").unwrap()
    }

    #[test]
    fn accepted_returns_sid() {
        let id = interpret_response(201, r#"{"sid":"SM123","status":"queued"}"#, &contact()).unwrap();
        assert_eq!(id, ProviderId("SM123".into()));
    }

    #[test]
    fn accepted_without_sid_is_provider_error() {
        let err = interpret_response(201, "{}", &contact()).unwrap_err();
        assert_eq!(err.kind(), ChannelFailureKind::Provider);
    }

    #[test]
    fn unauthorized_is_authentication() {
        let err = interpret_response(
            401,
            r#"{"code":20003,"message":"Authenticate","status":401}"#,
            &contact(),
        )
        .unwrap_err();
        assert!(matches!(err, ChannelError::Authentication(ref m) if m == "Authenticate"));
    }

    #[test]
    fn invalid_number_code_is_invalid_destination() {
        let err = interpret_response(
            400,
            r#"{"code":21211,"message":"The 'To' number is not valid.","status":400}"#,
            &contact(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ChannelFailureKind::InvalidDestination);
        assert!(err.to_string().contains("+919391502293"));
    }

    #[test]
    fn other_codes_are_provider_errors() {
        let err = interpret_response(
            400,
            r#"{"code":21606,"message":"From number not capable","status":400}"#,
            &contact(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Provider {
                status: 400,
                code: Some(21606),
                ..
            }
        ));
    }

    #[test]
    fn non_json_error_body_is_kept() {
        let err = interpret_response(502, "Bad Gateway", &contact()).unwrap_err();
        assert!(err.to_string().contains("Bad Gateway"));
        assert!(err.is_transient());
    }
}
