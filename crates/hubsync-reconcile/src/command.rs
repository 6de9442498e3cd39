//! Corrective commands and their wire shapes.
//!
//! Devices accept one of two payloads:
//!
//! - a method call object, `{"Name":"TurnLedOn","Parameters":{"ledId":1}}`
//! - a flat delimited string, `"greenLed:on"` or `"text:Dublin is cool."`

use std::fmt;

use hubsync_core::{OutboundMessage, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Method invocation understood by multi-LED devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Parameters")]
    pub parameters: Map<String, Value>,
}

/// Payload of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    /// Serialized as a JSON object
    Method(MethodCall),
    /// Sent as-is
    Text(String),
}

impl CommandPayload {
    /// Serialize to the bytes sent to the device.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            CommandPayload::Method(call) => Ok(serde_json::to_vec(call)?),
            CommandPayload::Text(text) => Ok(text.as_bytes().to_vec()),
        }
    }
}

impl fmt::Display for CommandPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandPayload::Method(call) => match serde_json::to_string(call) {
                Ok(json) => f.write_str(&json),
                Err(_) => write!(f, "{}(..)", call.name),
            },
            CommandPayload::Text(text) => f.write_str(text),
        }
    }
}

/// A correction addressed to one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub device_id: String,
    pub payload: CommandPayload,
}

impl Command {
    pub fn new(device_id: impl Into<String>, payload: CommandPayload) -> Self {
        Self {
            device_id: device_id.into(),
            payload,
        }
    }

    /// `TurnLedOn`/`TurnLedOff` for one LED.
    pub fn led(device_id: impl Into<String>, led_id: u8, on: bool) -> Self {
        let name = if on { "TurnLedOn" } else { "TurnLedOff" };
        let mut parameters = Map::new();
        parameters.insert("ledId".to_string(), Value::from(led_id));
        Self::new(
            device_id,
            CommandPayload::Method(MethodCall {
                name: name.to_string(),
                parameters,
            }),
        )
    }

    /// `"<key>:on"` or `"<key>:off"`.
    pub fn switch(device_id: impl Into<String>, key: &str, on: bool) -> Self {
        let state = if on { "on" } else { "off" };
        Self::new(device_id, CommandPayload::Text(format!("{}:{}", key, state)))
    }

    /// `"text:<value>"`.
    pub fn text(device_id: impl Into<String>, value: &str) -> Self {
        Self::new(device_id, CommandPayload::Text(format!("text:{}", value)))
    }

    /// Encode into an outbound message.
    pub fn encode(&self) -> Result<OutboundMessage> {
        Ok(OutboundMessage::new(self.payload.to_bytes()?))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}", self.device_id, self.payload)
    }
}
