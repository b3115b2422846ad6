use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

// --- Domain types handed to callers ---

/// Device + SIM slot pair the gateway uses to pick the sending SIM.
/// Rendered on the wire (and in snapshots) as `DEVICE|SLOT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RouteHandle {
    pub device_id: u64,
    pub slot: u32,
}

impl RouteHandle {
    pub fn new(device_id: u64, slot: u32) -> Self {
        Self { device_id, slot }
    }
}

impl fmt::Display for RouteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.device_id, self.slot)
    }
}

impl FromStr for RouteHandle {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (device, slot) = s
            .trim()
            .split_once('|')
            .ok_or_else(|| GatewayError::Parse(format!("route handle without '|': {s:?}")))?;
        let device_id = device
            .trim()
            .parse()
            .map_err(|_| GatewayError::Parse(format!("bad device id in route handle {s:?}")))?;
        let slot = slot
            .trim()
            .parse()
            .map_err(|_| GatewayError::Parse(format!("bad slot in route handle {s:?}")))?;
        Ok(Self { device_id, slot })
    }
}

impl TryFrom<String> for RouteHandle {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RouteHandle> for String {
    fn from(value: RouteHandle) -> Self {
        value.to_string()
    }
}

/// A SIM-backed phone number and the route that sends from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub address: String,
    pub route: RouteHandle,
}

/// A message the gateway reports as received on one of our SIMs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub id: String,
    pub from_address: String,
    /// SIM that received the message, when the gateway reports both device and slot.
    pub route_handle: Option<RouteHandle>,
    pub text: String,
    pub received_at: Option<DateTime<Utc>>,
}

impl InboundEvent {
    /// Ordering key: gateway ids are auto-increment integers. Non-numeric
    /// (fallback) ids sort before every numeric one.
    pub fn sequence(&self) -> u64 {
        self.id.parse().unwrap_or(0)
    }
}

/// Acknowledgement returned by `send.php`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    pub message_ids: Vec<String>,
}

// --- Wire types ---

/// Common `{success, data, error}` wrapper around every gateway response.
/// Absent fields decode as `None` without requiring `T: Default`.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub success: Option<bool>,
    pub data: Option<T>,
    pub error: Option<ApiErrorBody>,
}

impl<T> Envelope<T> {
    /// Turn an explicit `success: false` into a rejection.
    pub fn into_result(self) -> Result<Option<T>, GatewayError> {
        if self.success == Some(false) {
            let (code, message) = match self.error {
                Some(ApiErrorBody::Detailed { code, message }) => (
                    code.unwrap_or(0),
                    message.unwrap_or_else(|| "unknown gateway error".to_string()),
                ),
                Some(ApiErrorBody::Text(message)) => (0, message),
                None => (0, "unknown gateway error".to_string()),
            };
            return Err(GatewayError::Rejected { code, message });
        }
        Ok(self.data)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ApiErrorBody {
    Detailed {
        #[serde(default)]
        code: Option<i64>,
        #[serde(default)]
        message: Option<String>,
    },
    Text(String),
}

/// Ids arrive as numbers or numeric strings depending on the endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LooseId {
    Number(u64),
    Text(String),
}

impl LooseId {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            LooseId::Number(n) => Some(*n),
            LooseId::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for LooseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LooseId::Number(n) => write!(f, "{n}"),
            LooseId::Text(s) => write!(f, "{}", s.trim()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DevicesData {
    #[serde(default)]
    pub devices: Vec<Device>,
}

#[derive(Debug, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub id: Option<LooseId>,
    #[serde(default)]
    pub sims: SimSlots,
}

/// PHP encodes an empty slot map as `[]`, a populated one as `{"0": ...}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SimSlots {
    Map(BTreeMap<String, String>),
    List(Vec<String>),
}

impl Default for SimSlots {
    fn default() -> Self {
        SimSlots::Map(BTreeMap::new())
    }
}

impl SimSlots {
    fn entries(&self) -> Vec<(String, &str)> {
        match self {
            SimSlots::Map(map) => map.iter().map(|(k, v)| (k.clone(), v.as_str())).collect(),
            SimSlots::List(list) => list
                .iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v.as_str()))
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MessagesData {
    #[serde(default)]
    pub messages: Vec<RawMessage>,
}

#[derive(Debug, Deserialize)]
pub struct RawMessage {
    #[serde(default, alias = "ID")]
    pub id: Option<LooseId>,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "deviceID")]
    pub device_id: Option<LooseId>,
    #[serde(default, rename = "simSlot")]
    pub sim_slot: Option<LooseId>,
    #[serde(default, rename = "sentDate")]
    pub sent_date: Option<String>,
    #[serde(default, rename = "receivedDate")]
    pub received_date: Option<String>,
}

impl RawMessage {
    /// Normalize into an [`InboundEvent`]. Messages without a sender number are dropped.
    pub fn into_event(self) -> Option<InboundEvent> {
        let from_address = self.number.as_deref().map(str::trim).unwrap_or_default();
        if from_address.is_empty() {
            return None;
        }
        let from_address = from_address.to_string();
        let text = self.message.unwrap_or_default().trim().to_string();

        let id = match &self.id {
            Some(id) if !id.to_string().is_empty() => id.to_string(),
            _ => format!(
                "{}-{}-{}",
                from_address,
                text,
                self.sent_date.as_deref().unwrap_or_default()
            ),
        };

        let route_handle = match (
            self.device_id.as_ref().and_then(LooseId::as_u64),
            self.sim_slot.as_ref().and_then(LooseId::as_u64),
        ) {
            (Some(device), Some(slot)) => u32::try_from(slot)
                .ok()
                .map(|slot| RouteHandle::new(device, slot)),
            _ => None,
        };

        let received_at = self
            .received_date
            .as_deref()
            .or(self.sent_date.as_deref())
            .and_then(parse_gateway_timestamp);

        Some(InboundEvent {
            id,
            from_address,
            route_handle,
            text,
            received_at,
        })
    }
}

fn parse_gateway_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|ndt| ndt.and_utc())
}

// --- SIM label parsing ---

/// Extract the number from a SIM label such as `"SIM #1 [+237612345678]"`.
/// Labels without brackets are taken whole.
pub fn parse_sim_number(label: &str) -> String {
    if let Some(start) = label.find('[') {
        if let Some(len) = label[start + 1..].find(']') {
            return label[start + 1..start + 1 + len].trim().to_string();
        }
    }
    label.trim().to_string()
}

/// Strict E.164: `+` then 7 to 15 digits.
pub fn is_e164(candidate: &str) -> bool {
    let Some(digits) = candidate.strip_prefix('+') else {
        return false;
    };
    (7..=15).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Flatten the devices payload into identities. Returns the labels that were
/// skipped because they carried no usable number.
pub fn identities_from_devices(data: &DevicesData) -> (Vec<Identity>, Vec<String>) {
    let mut identities = Vec::new();
    let mut skipped = Vec::new();

    for device in &data.devices {
        let device_id = device.id.as_ref().and_then(LooseId::as_u64).filter(|id| *id > 0);
        for (slot, label) in device.sims.entries() {
            let number = parse_sim_number(label);
            let slot = slot.trim().parse::<u32>().ok();
            match (device_id, slot) {
                (Some(device_id), Some(slot)) if is_e164(&number) => {
                    identities.push(Identity {
                        address: number,
                        route: RouteHandle::new(device_id, slot),
                    });
                }
                _ => skipped.push(label.to_string()),
            }
        }
    }

    (identities, skipped)
}

/// Pull message ids out of a `send.php` success body. The shape varies across
/// gateway versions so this is best-effort.
pub fn ack_from_value(data: Option<&serde_json::Value>) -> Ack {
    let message_ids = data
        .and_then(|d| d.get("messages"))
        .and_then(|m| m.as_array())
        .map(|messages| {
            messages
                .iter()
                .filter_map(|m| m.get("ID").or_else(|| m.get("id")))
                .map(|id| match id {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    Ack { message_ids }
}
