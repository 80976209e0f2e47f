//! Control-channel message types.
//!
//! A control message is deliberately loose: a command identifier, a
//! correlation id, an ordered list of named parameters, and an optional error
//! string.  Typed views such as [`CreateSessionRequest`] and
//! [`CreateSessionResponse`] are layered on top for the commands the
//! controller itself issues.

use serde::{Deserialize, Serialize};

use crate::domain::device::DeviceId;
use crate::protocol::codec::ProtocolError;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Current protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Total size of the control message header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Largest payload accepted by the decoder.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// `errorType` value the controller uses when it refuses a session because
/// the device is no longer registered.
pub const ERROR_TYPE_DEVICE_OFFLINE: i64 = 1;

/// Command identifiers.
pub mod commands {
    /// Opens a controller session on the device helper.
    pub const CREATE_SESSION: &str = "create-session";
    /// Keep-alive sent by either side.
    pub const HEARTBEAT: &str = "heartbeat";
}

// ── Message kind ──────────────────────────────────────────────────────────────

/// Role of a message on the wire, encoded in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Expects a [`MessageKind::Response`] carrying the same correlation id.
    Request = 0x01,
    /// Answers the request with the same correlation id.
    Response = 0x02,
    /// Fire-and-forget; no response expected.
    Notification = 0x03,
}

impl TryFrom<u8> for MessageKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(MessageKind::Request),
            0x02 => Ok(MessageKind::Response),
            0x03 => Ok(MessageKind::Notification),
            _ => Err(()),
        }
    }
}

// ── Parameters ────────────────────────────────────────────────────────────────

/// A single parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(i64::from(v))
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(i64::from(v))
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Float(f64::from(v))
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

/// Ordered set of named parameters.
///
/// Insertion order is preserved on the wire.  Setting an existing name
/// replaces its value in place rather than appending a duplicate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters(Vec<(String, ParamValue)>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `name` to `value`, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Integer value of `name`; floats are not coerced.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(ParamValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Float value of `name`; integers are widened.
    pub fn get_float(&self, name: &str) -> Option<f64> {
        match self.get(name) {
            Some(ParamValue::Float(v)) => Some(*v),
            Some(ParamValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(ParamValue::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(ParamValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates parameters in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }
}

// ── Control message ───────────────────────────────────────────────────────────

/// One message on the control channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub kind: MessageKind,
    /// Command identifier, e.g. [`commands::CREATE_SESSION`].
    pub command: String,
    /// Matches a response to its request.  Assigned by the sending session
    /// for requests; zero for notifications.
    pub correlation_id: u64,
    pub params: Parameters,
    pub error: Option<String>,
}

impl ControlMessage {
    /// Creates a request for `command`.  The correlation id is assigned when sent.
    pub fn request(command: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Request,
            command: command.into(),
            correlation_id: 0,
            params: Parameters::new(),
            error: None,
        }
    }

    pub fn notification(command: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Notification,
            ..Self::request(command)
        }
    }

    /// Creates an empty response to `request`, echoing its command and correlation id.
    pub fn response_to(request: &ControlMessage) -> Self {
        Self {
            kind: MessageKind::Response,
            command: request.command.clone(),
            correlation_id: request.correlation_id,
            params: Parameters::new(),
            error: None,
        }
    }

    /// Builder-style parameter setter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.set(name, value);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_response(&self) -> bool {
        self.kind == MessageKind::Response
    }
}

// ── create-session ────────────────────────────────────────────────────────────

/// Handshake request opening a controller session on the device helper.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CreateSessionRequest {
    /// JPEG quality the helper should stream at (0–100).
    pub image_quality: i32,
    /// Scale factor applied to the device screen before encoding.
    pub zoom_rate: f32,
}

impl CreateSessionRequest {
    pub fn to_message(self) -> ControlMessage {
        ControlMessage::request(commands::CREATE_SESSION)
            .with_param("iq", self.image_quality)
            .with_param("zr", self.zoom_rate)
    }
}

/// The helper's answer to [`CreateSessionRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct CreateSessionResponse {
    pub device_id: DeviceId,
    pub phone: Option<String>,
    /// Host of the image server as seen by the device.
    pub image_host: Option<String>,
    pub screen_width: u32,
    pub screen_height: u32,
    pub rotation: i16,
    pub agent_version: Option<String>,
    pub agent_version_code: Option<i32>,
}

impl CreateSessionResponse {
    /// Extracts the typed response.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MissingParameter`] when `id`, `sw` or `sh` is
    /// absent, and [`ProtocolError::MalformedPayload`] when a numeric field is
    /// out of range.
    pub fn from_message(msg: &ControlMessage) -> Result<Self, ProtocolError> {
        let p = &msg.params;
        let device_id = p
            .get_str("id")
            .ok_or(ProtocolError::MissingParameter("id"))?
            .to_string();
        let screen_width = require_u32(p, "sw")?;
        let screen_height = require_u32(p, "sh")?;
        let rotation = match p.get_int("ro") {
            Some(v) => i16::try_from(v)
                .map_err(|_| ProtocolError::MalformedPayload(format!("rotation out of range: {v}")))?,
            None => 0,
        };
        let agent_version_code = match p.get_int("mediateVersionCode") {
            Some(v) => Some(i32::try_from(v).map_err(|_| {
                ProtocolError::MalformedPayload(format!("version code out of range: {v}"))
            })?),
            None => None,
        };

        Ok(Self {
            device_id,
            phone: p.get_str("phone").map(str::to_string),
            image_host: p.get_str("host").map(str::to_string),
            screen_width,
            screen_height,
            rotation,
            agent_version: p.get_str("mediateVersion").map(str::to_string),
            agent_version_code,
        })
    }

    /// Builds the response message the helper would send for `request`.
    pub fn to_message(&self, request: &ControlMessage) -> ControlMessage {
        let mut msg = ControlMessage::response_to(request)
            .with_param("id", self.device_id.as_str())
            .with_param("sw", self.screen_width)
            .with_param("sh", self.screen_height)
            .with_param("ro", i64::from(self.rotation));
        if let Some(phone) = &self.phone {
            msg.params.set("phone", phone.as_str());
        }
        if let Some(host) = &self.image_host {
            msg.params.set("host", host.as_str());
        }
        if let Some(version) = &self.agent_version {
            msg.params.set("mediateVersion", version.as_str());
        }
        if let Some(code) = self.agent_version_code {
            msg.params.set("mediateVersionCode", code);
        }
        msg
    }
}

fn require_u32(p: &Parameters, name: &'static str) -> Result<u32, ProtocolError> {
    let v = p.get_int(name).ok_or(ProtocolError::MissingParameter(name))?;
    u32::try_from(v).map_err(|_| ProtocolError::MalformedPayload(format!("{name} out of range: {v}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameters_set_replaces_existing_value_in_place() {
        let mut p = Parameters::new();
        p.set("a", 1);
        p.set("b", "x");
        p.set("a", 2);

        let names: Vec<&str> = p.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(p.get_int("a"), Some(2));
    }

    #[test]
    fn test_get_float_widens_integers_but_get_int_does_not_truncate_floats() {
        let mut p = Parameters::new();
        p.set("i", 3);
        p.set("f", 0.5f64);
        assert_eq!(p.get_float("i"), Some(3.0));
        assert_eq!(p.get_int("f"), None);
    }

    #[test]
    fn test_response_to_echoes_command_and_correlation_id() {
        let mut req = ControlMessage::request(commands::CREATE_SESSION);
        req.correlation_id = 77;
        let resp = ControlMessage::response_to(&req);
        assert_eq!(resp.kind, MessageKind::Response);
        assert_eq!(resp.command, commands::CREATE_SESSION);
        assert_eq!(resp.correlation_id, 77);
    }

    #[test]
    fn test_create_session_request_carries_quality_and_zoom() {
        let msg = CreateSessionRequest {
            image_quality: 60,
            zoom_rate: 0.5,
        }
        .to_message();
        assert_eq!(msg.command, commands::CREATE_SESSION);
        assert_eq!(msg.params.get_int("iq"), Some(60));
        assert_eq!(msg.params.get_float("zr"), Some(0.5));
    }

    #[test]
    fn test_create_session_response_parses_all_fields() {
        let req = ControlMessage::request(commands::CREATE_SESSION);
        let original = CreateSessionResponse {
            device_id: "dev-1".to_string(),
            phone: Some("+100".to_string()),
            image_host: Some("192.168.1.9".to_string()),
            screen_width: 1080,
            screen_height: 2340,
            rotation: 1,
            agent_version: Some("2.1".to_string()),
            agent_version_code: Some(21),
        };
        let parsed = CreateSessionResponse::from_message(&original.to_message(&req)).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_create_session_response_without_id_is_missing_parameter() {
        let req = ControlMessage::request(commands::CREATE_SESSION);
        let msg = ControlMessage::response_to(&req)
            .with_param("sw", 100)
            .with_param("sh", 200);
        assert_eq!(
            CreateSessionResponse::from_message(&msg),
            Err(ProtocolError::MissingParameter("id"))
        );
    }

    #[test]
    fn test_create_session_response_rejects_negative_width() {
        let req = ControlMessage::request(commands::CREATE_SESSION);
        let msg = ControlMessage::response_to(&req)
            .with_param("id", "dev")
            .with_param("sw", -1)
            .with_param("sh", 200);
        assert!(matches!(
            CreateSessionResponse::from_message(&msg),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_message_kind_try_from_rejects_unknown_byte() {
        assert_eq!(MessageKind::try_from(0x02), Ok(MessageKind::Response));
        assert!(MessageKind::try_from(0x7F).is_err());
    }
}
