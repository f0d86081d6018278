//! JSON frame types for the gateway protocol.
//!
//! Every frame exchanged with the gateway is a single JSON object carried in
//! one WebSocket text message.
//!
//! # Message flow
//!
//! ```text
//! Client  → Gateway:  OutboundCommand   {"messageId":"…","command":"…",…params}
//! Gateway → Client:   VersionFrame      {"type":"version",…}
//!                     ResultFrame       {"type":"result","messageId":"…","success":…}
//!                     EventFrame        {"type":"event","event":{"source":"…","event":"…",…}}
//! ```
//!
//! # Frame classification
//!
//! Inbound frames are classified by their `"type"` discriminator.  `version`
//! and `event` are recognised by name; any other frame is treated as a
//! command response and must carry a `messageId` and a `success` flag.  See
//! [`InboundFrame::classify`].
//!
//! # Why no typed command catalogue?
//!
//! The per-command parameter and response shapes are owned by the gateway's
//! schema registry and change from one schema version to the next.  This
//! crate only carries the envelope; parameters and results stay as
//! [`serde_json::Value`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// ── Well-known names ──────────────────────────────────────────────────────────

/// Command that selects the schema version for the rest of the connection.
///
/// This is the only command accepted before the client is ready.
pub const SET_API_SCHEMA: &str = "set_api_schema";

/// Command that asks the gateway to start pushing events and return a state dump.
pub const START_LISTENING: &str = "start_listening";

/// Values of the `source` field of an event.
pub mod event_source {
    /// Events about the gateway's own connection to its device driver.
    pub const DRIVER: &str = "driver";
    /// Events about a single device.
    pub const DEVICE: &str = "device";
    /// Events about a base station that hosts devices.
    pub const STATION: &str = "station";
    /// Events about the gateway server itself.
    pub const SERVER: &str = "server";
}

/// Event names emitted with `source == "driver"`.
pub mod driver_event {
    pub const CONNECTED: &str = "connected";
    pub const DISCONNECTED: &str = "disconnected";
}

/// Discriminator values of the `"type"` field.
pub mod frame_type {
    pub const VERSION: &str = "version";
    pub const RESULT: &str = "result";
    pub const EVENT: &str = "event";
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors produced while classifying an already-validated inbound frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame has no string `"type"` field.
    #[error("frame has no type discriminator")]
    MissingType,

    /// The frame named a known type but its fields did not match the shape.
    #[error("malformed {frame_type} frame: {source}")]
    Malformed {
        frame_type: String,
        #[source]
        source: serde_json::Error,
    },
}

// ── Gateway → Client frames ───────────────────────────────────────────────────

/// Sent by the gateway right after the connection opens.
///
/// ```json
/// {"type":"version","driverVersion":"3.1.0","serverVersion":"1.9.0",
///  "minSchemaVersion":13,"maxSchemaVersion":21}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionFrame {
    /// Version string of the device driver behind the gateway.
    pub driver_version: String,
    /// Version string of the gateway server.
    pub server_version: String,
    /// Oldest schema version the gateway still speaks.
    pub min_schema_version: u32,
    /// Newest schema version the gateway speaks.
    pub max_schema_version: u32,
}

/// Answer to one [`OutboundCommand`], matched by `message_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultFrame {
    /// Correlation id copied from the command.
    pub message_id: String,
    /// `true` when the gateway executed the command.
    pub success: bool,
    /// Command-specific payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Gateway error code on failure (e.g. `"device_not_found"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl ResultFrame {
    /// Converts the frame into the command outcome.
    ///
    /// A successful frame without a `result` field yields [`Value::Null`].  A
    /// failed frame without an `errorCode` yields `"unknown_error"`.
    pub fn into_outcome(self) -> Result<Value, String> {
        if self.success {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self
                .error_code
                .unwrap_or_else(|| "unknown_error".to_string()))
        }
    }
}

/// Wrapper frame around a pushed [`GatewayEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: GatewayEvent,
}

/// A notification pushed by the gateway.
///
/// Only `source` and `event` are structural; everything else (serial number,
/// property name, value, …) is kept in `fields` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEvent {
    /// Which kind of entity raised the event: `"device"`, `"station"`, `"driver"`, `"server"`.
    pub source: String,
    /// Event name, e.g. `"property changed"` or `"motion detected"`.
    pub event: String,
    /// Remaining event fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl GatewayEvent {
    /// Returns the entity id carried by the event, if any.
    pub fn serial_number(&self) -> Option<&str> {
        self.fields.get("serialNumber").and_then(Value::as_str)
    }

    /// Returns one extra field by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Version(VersionFrame),
    Result(ResultFrame),
    Event(GatewayEvent),
}

impl InboundFrame {
    /// Classifies a validated JSON object by its `"type"` discriminator.
    ///
    /// `version` and `event` frames are parsed into their typed shapes.  Any
    /// other type is parsed as a [`ResultFrame`], so a response is matched by
    /// its `messageId` regardless of the exact type string the gateway used.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::MissingType`] when there is no string type and
    /// [`FrameError::Malformed`] when the fields do not fit the shape.
    pub fn classify(value: Value) -> Result<Self, FrameError> {
        let frame_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(FrameError::MissingType)?
            .to_string();

        let malformed = |source| FrameError::Malformed {
            frame_type: frame_type.clone(),
            source,
        };

        match frame_type.as_str() {
            frame_type::VERSION => serde_json::from_value(value)
                .map(InboundFrame::Version)
                .map_err(malformed),
            frame_type::EVENT => serde_json::from_value::<EventFrame>(value)
                .map(|frame| InboundFrame::Event(frame.event))
                .map_err(malformed),
            _ => serde_json::from_value(value)
                .map(InboundFrame::Result)
                .map_err(malformed),
        }
    }
}

// ── Client → Gateway frames ───────────────────────────────────────────────────

/// Outbound command envelope: `{messageId, command, ...params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundCommand {
    /// Caller-generated correlation id.
    pub message_id: String,
    /// Command name, e.g. `"device.get_properties"`.
    pub command: String,
    /// Command parameters, flattened into the envelope.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl OutboundCommand {
    /// Builds an envelope.
    ///
    /// `messageId` and `command` keys inside `params` are dropped so that the
    /// envelope fields cannot be shadowed.
    pub fn new(
        message_id: impl Into<String>,
        command: impl Into<String>,
        mut params: Map<String, Value>,
    ) -> Self {
        params.remove("messageId");
        params.remove("command");
        Self {
            message_id: message_id.into(),
            command: command.into(),
            params,
        }
    }

    /// Serializes the envelope to its wire text.
    ///
    /// # Errors
    ///
    /// Returns the serde error when a parameter cannot be represented as JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_version_frame() {
        // Arrange
        let value = json!({
            "type": "version",
            "driverVersion": "3.1.0",
            "serverVersion": "1.9.0",
            "minSchemaVersion": 13,
            "maxSchemaVersion": 21
        });

        // Act
        let frame = InboundFrame::classify(value).unwrap();

        // Assert
        assert_eq!(
            frame,
            InboundFrame::Version(VersionFrame {
                driver_version: "3.1.0".to_string(),
                server_version: "1.9.0".to_string(),
                min_schema_version: 13,
                max_schema_version: 21,
            })
        );
    }

    #[test]
    fn test_classify_event_frame_keeps_extra_fields() {
        let value = json!({
            "type": "event",
            "event": {
                "source": "device",
                "event": "property changed",
                "serialNumber": "T8410P",
                "name": "battery",
                "value": 87
            }
        });

        let frame = InboundFrame::classify(value).unwrap();

        let InboundFrame::Event(event) = frame else {
            panic!("expected an event frame");
        };
        assert_eq!(event.source, "device");
        assert_eq!(event.event, "property changed");
        assert_eq!(event.serial_number(), Some("T8410P"));
        assert_eq!(event.field("value"), Some(&json!(87)));
    }

    #[test]
    fn test_classify_successful_result_frame() {
        let value = json!({"type": "result", "messageId": "m-1", "success": true, "result": {"ok": 1}});

        let frame = InboundFrame::classify(value).unwrap();

        let InboundFrame::Result(result) = frame else {
            panic!("expected a result frame");
        };
        assert_eq!(result.message_id, "m-1");
        assert_eq!(result.into_outcome(), Ok(json!({"ok": 1})));
    }

    #[test]
    fn test_failed_result_frame_yields_error_code() {
        let value = json!({"type": "result", "messageId": "m-2", "success": false, "errorCode": "device_not_found"});

        let InboundFrame::Result(result) = InboundFrame::classify(value).unwrap() else {
            panic!("expected a result frame");
        };

        assert_eq!(result.into_outcome(), Err("device_not_found".to_string()));
    }

    #[test]
    fn test_failed_result_frame_without_code_is_unknown_error() {
        let frame = ResultFrame {
            message_id: "m".to_string(),
            success: false,
            result: None,
            error_code: None,
        };
        assert_eq!(frame.into_outcome(), Err("unknown_error".to_string()));
    }

    #[test]
    fn test_unrecognised_type_is_parsed_as_result() {
        // A response with an unexpected type string is still a response.
        let value = json!({"type": "response", "messageId": "m-3", "success": true});

        let frame = InboundFrame::classify(value).unwrap();

        assert!(matches!(frame, InboundFrame::Result(r) if r.message_id == "m-3"));
    }

    #[test]
    fn test_classify_without_type_fails() {
        let result = InboundFrame::classify(json!({"messageId": "x"}));
        assert!(matches!(result, Err(FrameError::MissingType)));
    }

    #[test]
    fn test_classify_malformed_version_frame_fails() {
        let result = InboundFrame::classify(json!({"type": "version", "minSchemaVersion": "thirteen"}));
        assert!(matches!(result, Err(FrameError::Malformed { .. })));
    }

    #[test]
    fn test_outbound_command_flattens_params() {
        // Arrange
        let mut params = Map::new();
        params.insert("serialNumber".to_string(), json!("T8410P"));

        // Act
        let cmd = OutboundCommand::new("abc", "device.get_properties", params);
        let value: Value = serde_json::from_str(&cmd.to_json().unwrap()).unwrap();

        // Assert
        assert_eq!(
            value,
            json!({"messageId": "abc", "command": "device.get_properties", "serialNumber": "T8410P"})
        );
    }

    #[test]
    fn test_outbound_command_drops_shadowing_params() {
        let mut params = Map::new();
        params.insert("messageId".to_string(), json!("evil"));
        params.insert("command".to_string(), json!("other"));

        let cmd = OutboundCommand::new("real", "start_listening", params);

        assert!(cmd.params.is_empty());
        let value: Value = serde_json::from_str(&cmd.to_json().unwrap()).unwrap();
        assert_eq!(value["messageId"], "real");
        assert_eq!(value["command"], "start_listening");
    }
}
