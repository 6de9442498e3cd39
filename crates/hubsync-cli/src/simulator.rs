//! Simulated device firmware.
//!
//! Stand-ins for the three reference boards. Each publishes its state on a
//! fixed interval through the in-process hub and applies the commands it
//! receives, using the same payload shapes as the real firmware.

use std::time::Duration;

use hubsync_stream::{DeviceLink, MemoryHub};
use rand::Rng;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Board {
    /// Two LEDs, driven by method calls
    Huzzah,
    /// One LED and an LCD, driven by `led:` and `text:` strings
    Rpi2,
    /// Two LEDs, an LCD and a light sensor
    Edison,
}

impl Board {
    pub fn device_id(self) -> &'static str {
        match self {
            Board::Huzzah => "huzzah",
            Board::Rpi2 => "rpi2",
            Board::Edison => "edison",
        }
    }
}

/// State of one simulated board.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    board: Board,
    state: Map<String, Value>,
}

impl SimulatedDevice {
    /// Boards start away from the default desired state so the first
    /// telemetry triggers corrections.
    pub fn new(board: Board) -> Self {
        let state = match board {
            Board::Huzzah => json!({"Led1": false, "Led2": true}),
            Board::Rpi2 => json!({"Led": true, "LcdText": "booting"}),
            Board::Edison => json!({"greenLed": true, "redLed": false, "lcdText": ""}),
        };
        Self {
            board,
            state: state.as_object().cloned().unwrap_or_default(),
        }
    }

    pub fn board(&self) -> Board {
        self.board
    }

    #[cfg(test)]
    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.state.get(attribute)
    }

    /// Current telemetry body.
    pub fn telemetry(&self) -> Value {
        let mut body = self.state.clone();
        body.insert("deviceId".into(), json!(self.board.device_id()));
        if self.board == Board::Edison {
            body.insert("location".into(), json!("simulated"));
            body.insert("type".into(), json!("edison"));
            body.insert("lightLevel".into(), json!(rand::thread_rng().gen_range(0..1024)));
        }
        Value::Object(body)
    }

    /// Apply a received payload. Returns whether it changed anything.
    pub fn apply(&mut self, payload: &[u8]) -> bool {
        match self.board {
            Board::Huzzah => self.apply_method(payload),
            Board::Rpi2 | Board::Edison => {
                let text = String::from_utf8_lossy(payload);
                self.apply_text(&text)
            }
        }
    }

    fn apply_method(&mut self, payload: &[u8]) -> bool {
        let Ok(call) = serde_json::from_slice::<Value>(payload) else {
            return false;
        };
        let on = match call.get("Name").and_then(Value::as_str) {
            Some("TurnLedOn") => true,
            Some("TurnLedOff") => false,
            _ => return false,
        };
        let attribute = match call.pointer("/Parameters/ledId").and_then(Value::as_u64) {
            Some(1) => "Led1",
            Some(2) => "Led2",
            _ => return false,
        };
        self.set(attribute, json!(on))
    }

    fn apply_text(&mut self, text: &str) -> bool {
        let Some((key, value)) = text.split_once(':') else {
            return false;
        };
        let switch = match value {
            "on" => Some(true),
            "off" => Some(false),
            _ => None,
        };
        match (self.board, key, switch) {
            (Board::Rpi2, "led", Some(on)) => self.set("Led", json!(on)),
            (Board::Rpi2, "text", _) => self.set("LcdText", json!(value)),
            (Board::Edison, "greenLed" | "redLed", Some(on)) => self.set(key, json!(on)),
            (Board::Edison, "text", _) => self.set("lcdText", json!(value)),
            _ => false,
        }
    }

    fn set(&mut self, attribute: &str, value: Value) -> bool {
        self.state.insert(attribute.to_string(), value.clone()) != Some(value)
    }
}

/// Run one board against the hub until aborted.
pub fn spawn(hub: &MemoryHub, device: SimulatedDevice, interval: Duration) -> JoinHandle<()> {
    let link = hub.connect_device(device.board().device_id());
    tokio::spawn(run(link, device, interval))
}

/// Run all three reference boards.
pub fn spawn_all(hub: &MemoryHub, interval: Duration) -> Vec<JoinHandle<()>> {
    [Board::Huzzah, Board::Rpi2, Board::Edison]
        .into_iter()
        .map(|board| spawn(hub, SimulatedDevice::new(board), interval))
        .collect()
}

async fn run(mut link: DeviceLink, mut device: SimulatedDevice, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    info!(category = "simulator", device_id = %link.device_id(), "Simulated device online");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let body = device.telemetry().to_string();
                match link.send_event(body) {
                    Ok(offset) => debug!(
                        category = "simulator",
                        device_id = %link.device_id(),
                        offset = %offset,
                        "Telemetry sent"
                    ),
                    Err(err) => warn!(
                        category = "simulator",
                        device_id = %link.device_id(),
                        error = %err,
                        "Telemetry failed"
                    ),
                }
            }
            message = link.recv() => {
                let Some(message) = message else {
                    break;
                };
                let changed = device.apply(&message.data);
                info!(
                    category = "simulator",
                    device_id = %link.device_id(),
                    command = %message.data_str(),
                    changed,
                    "Command received"
                );
            }
        }
    }
}
