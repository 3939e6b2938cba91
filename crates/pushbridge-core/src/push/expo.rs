use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use super::{DeliveryOutcome, PushMessage, PushTransport};
use crate::constants::{EXPO_MAX_BATCH, EXPO_PUSH_URL};
use crate::error::DispatchError;
use crate::models::PushToken;

/// Expo push service client
pub struct ExpoTransport {
    access_token: String,
    client: reqwest::Client,
}

impl ExpoTransport {
    pub fn new(access_token: String) -> Self {
        Self {
            access_token,
            client: reqwest::Client::new(),
        }
    }
}

/// Whether `token` looks like something Expo will route.
pub fn is_expo_push_token(token: &str) -> bool {
    let bracketed = ["ExponentPushToken[", "ExpoPushToken["]
        .iter()
        .any(|prefix| token.starts_with(prefix) && token.ends_with(']'));
    bracketed || is_uuid_like(token)
}

/// 8-4-4-4-12 alphanumeric groups, as Expo's SDK accepts
fn is_uuid_like(token: &str) -> bool {
    let groups: Vec<&str> = token.split('-').collect();
    groups.len() == 5
        && groups
            .iter()
            .zip([8, 4, 4, 4, 12])
            .all(|(group, len)| {
                group.len() == len && group.chars().all(|c| c.is_ascii_alphanumeric())
            })
}

#[derive(Debug, Deserialize)]
struct ExpoResponse {
    #[serde(default)]
    data: Vec<ExpoTicket>,
    #[serde(default)]
    errors: Vec<ExpoRequestError>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum ExpoTicket {
    Ok {
        #[serde(default)]
        id: Option<String>,
    },
    Error {
        #[serde(default)]
        message: String,
        #[serde(default)]
        details: Option<Value>,
    },
}

#[derive(Debug, Deserialize)]
struct ExpoRequestError {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

impl From<ExpoTicket> for DeliveryOutcome {
    fn from(ticket: ExpoTicket) -> Self {
        match ticket {
            ExpoTicket::Ok { id } => DeliveryOutcome::Accepted { ticket: id },
            ExpoTicket::Error { message, details } => {
                let code = details
                    .as_ref()
                    .and_then(|d| d.get("error"))
                    .and_then(Value::as_str);
                match code {
                    Some(code) => DeliveryOutcome::Rejected(format!("{} ({})", message, code)),
                    None => DeliveryOutcome::Rejected(message),
                }
            }
        }
    }
}

fn outcomes_from_response(response: ExpoResponse) -> Result<Vec<DeliveryOutcome>, DispatchError> {
    if !response.errors.is_empty() {
        let joined = response
            .errors
            .iter()
            .map(|e| match &e.code {
                Some(code) => format!("{}: {}", code, e.message),
                None => e.message.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ");
        return Err(DispatchError::Response(joined));
    }

    Ok(response.data.into_iter().map(DeliveryOutcome::from).collect())
}

#[async_trait]
impl PushTransport for ExpoTransport {
    fn validate_token(&self, token: &PushToken) -> Result<(), String> {
        if is_expo_push_token(token.as_str()) {
            Ok(())
        } else {
            Err(format!("{} is not a valid Expo push token", token))
        }
    }

    fn max_batch(&self) -> usize {
        EXPO_MAX_BATCH
    }

    async fn send_batch(
        &self,
        messages: &[PushMessage],
    ) -> Result<Vec<DeliveryOutcome>, DispatchError> {
        let response = self
            .client
            .post(EXPO_PUSH_URL)
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("Accept", "application/json")
            .json(messages)
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!(status, "Expo push request refused");
            return Err(DispatchError::Service { status, body });
        }

        let parsed: ExpoResponse = response
            .json()
            .await
            .map_err(|e| DispatchError::Response(e.to_string()))?;

        outcomes_from_response(parsed)
    }
}
