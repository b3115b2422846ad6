pub mod error;
pub mod types;

pub use error::{GatewayError, Result};
pub use types::{Ack, Identity, InboundEvent, RouteHandle};

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use types::{ack_from_value, identities_from_devices, DevicesData, Envelope, MessagesData};

pub const DEFAULT_BASE_URL: &str = "https://gate.exanewtech.com";

const DEVICES_PATH: &str = "/services/get-devices.php";
const SEND_PATH: &str = "/services/send.php";
const MESSAGES_PATH: &str = "/services/get-messages.php";

/// Per-request timeout. A call that exceeds it fails as a network error.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ExaGateClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ExaGateClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Fetch every SIM the account can send from, as `number -> DEVICE|SLOT`.
    pub async fn list_identities(&self) -> Result<Vec<Identity>> {
        let data: DevicesData = self.get(DEVICES_PATH, &[]).await?.unwrap_or_default();
        let (identities, skipped) = identities_from_devices(&data);
        if !skipped.is_empty() {
            tracing::info!(?skipped, "Ignoring SIM slots without a valid E.164 number");
        }
        tracing::debug!(count = identities.len(), "Fetched gateway identities");
        Ok(identities)
    }

    /// Send one SMS from the SIM behind `route` to `to`.
    pub async fn send(&self, route: &RouteHandle, to: &str, text: &str) -> Result<Ack> {
        let route = route.to_string();
        let data: Option<serde_json::Value> = self
            .get(
                SEND_PATH,
                &[
                    ("number", to),
                    ("message", text),
                    ("devices", route.as_str()),
                    ("type", "sms"),
                    ("prioritize", "1"),
                ],
            )
            .await?;

        let preview: String = text.chars().take(40).collect();
        tracing::info!(route = %route, to, text = %preview, "SMS sent");
        Ok(ack_from_value(data.as_ref()))
    }

    /// Fetch messages currently in the `Received` folder, oldest id first.
    pub async fn list_inbound(&self) -> Result<Vec<InboundEvent>> {
        let data: MessagesData = self
            .get(MESSAGES_PATH, &[("status", "Received")])
            .await?
            .unwrap_or_default();

        let mut events: Vec<InboundEvent> = data
            .messages
            .into_iter()
            .filter_map(|m| m.into_event())
            .collect();
        events.sort_by(|a, b| a.sequence().cmp(&b.sequence()).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<Option<T>> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .query(&[("key", self.api_key.as_str())])
            .query(params)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        decode(path, status, &body)
    }
}

/// Interpret one gateway response. An empty 2xx body means there is nothing to
/// report and decodes as `None`.
fn decode<T: DeserializeOwned>(path: &str, status: StatusCode, body: &str) -> Result<Option<T>> {
    if !status.is_success() {
        return Err(GatewayError::Api {
            status: status.as_u16(),
            message: body.to_string(),
        });
    }

    if body.trim().is_empty() {
        return Ok(None);
    }

    let envelope: Envelope<T> = serde_json::from_str(body).map_err(|e| {
        let snippet: String = body.chars().take(120).collect();
        tracing::warn!(path, status = %status, body = %snippet, "Unparseable gateway response");
        GatewayError::Parse(e.to_string())
    })?;
    envelope.into_result()
}
