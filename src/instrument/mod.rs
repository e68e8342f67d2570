//! Instrument drivers and the contract the coordinator drives them through.
//!
//! A driver owns one [`Transport`](crate::adapters::Transport) and a
//! [`ConditionMap`] of last-known values. It never lets a transport error
//! escape: unreachable fields become sentinels and failures become log lines
//! on the [`EventSink`].
//!
//! Drivers have no internal locking. The coordinator holds each one behind a
//! [`SharedDevice`] mutex, which is what keeps a status poll and a command
//! dispatch from interleaving on the same channel.

use crate::adapters::Transport;
use crate::error::AppResult;
use crate::labone::ImageFrame;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

pub mod acquisition;
pub mod delay_stage;
pub mod insight;
pub mod zurich_lockin;

pub use acquisition::{AcquisitionReader, ScanGeometry, TriggerSpec};
pub use delay_stage::DelayStage;
pub use insight::InsightLaser;
pub use zurich_lockin::ZurichLockin;

/// Placeholder for a field whose query failed
pub const SENTINEL: &str = "-";

/// Last-known value of one parameter
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConditionValue {
    /// Numeric reading or flag
    Number(f64),
    /// Text, sentinel or decoded message
    Text(String),
    /// Nested group of values
    Map(ConditionMap),
}

/// Parameter name to last-known value
pub type ConditionMap = BTreeMap<String, ConditionValue>;

impl ConditionValue {
    /// Numeric view, if the value is a number
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConditionValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// Whether this is the failed-query placeholder
    pub fn is_sentinel(&self) -> bool {
        matches!(self, ConditionValue::Text(s) if s == SENTINEL)
    }

    /// Interpret a response line: a number when it parses, text otherwise,
    /// the sentinel when empty
    pub fn from_response(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return ConditionValue::sentinel();
        }
        match raw.parse::<f64>() {
            Ok(v) => ConditionValue::Number(v),
            Err(_) => ConditionValue::Text(raw.to_string()),
        }
    }

    /// The failed-query placeholder
    pub fn sentinel() -> Self {
        ConditionValue::Text(SENTINEL.to_string())
    }
}

impl fmt::Display for ConditionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionValue::Number(v) => write!(f, "{v}"),
            ConditionValue::Text(s) => f.write_str(s),
            ConditionValue::Map(m) => {
                let parts: Vec<String> = m.iter().map(|(k, v)| format!("{k}={v}")).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
        }
    }
}

impl From<f64> for ConditionValue {
    fn from(v: f64) -> Self {
        ConditionValue::Number(v)
    }
}

impl From<bool> for ConditionValue {
    fn from(v: bool) -> Self {
        ConditionValue::Number(if v { 1.0 } else { 0.0 })
    }
}

impl From<&str> for ConditionValue {
    fn from(v: &str) -> Self {
        ConditionValue::Text(v.to_string())
    }
}

impl From<String> for ConditionValue {
    fn from(v: String) -> Self {
        ConditionValue::Text(v)
    }
}

/// Something the display layer should hear about
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceEvent {
    /// Condition map after a status refresh
    Status {
        /// Device name
        device: String,
        /// Snapshot of the map
        conditions: ConditionMap,
    },
    /// Narrative line: startup, shutdown, faults, rejected input
    Log {
        /// Device name
        device: String,
        /// Text for the operator
        line: String,
        /// Wall-clock time of the event
        at: DateTime<Local>,
    },
    /// Completed acquisition frame
    Frame {
        /// Device name
        device: String,
        /// Frame data
        frame: ImageFrame,
    },
}

/// Upward event channel shared by all drivers and the poller
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<DeviceEvent>>,
}

impl EventSink {
    /// Sink plus the receiving end for the display layer
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Sink that only logs through `tracing`
    pub fn detached() -> Self {
        Self { tx: None }
    }

    /// Narrative line
    pub fn log(&self, device: &str, line: impl Into<String>) {
        let line = line.into();
        tracing::info!(device, "{}", line);
        self.send(DeviceEvent::Log {
            device: device.to_string(),
            line,
            at: Local::now(),
        });
    }

    /// Status snapshot
    pub fn status(&self, device: &str, conditions: &ConditionMap) {
        self.send(DeviceEvent::Status {
            device: device.to_string(),
            conditions: conditions.clone(),
        });
    }

    /// Acquired frame
    pub fn frame(&self, device: &str, frame: ImageFrame) {
        self.send(DeviceEvent::Frame {
            device: device.to_string(),
            frame,
        });
    }

    fn send(&self, event: DeviceEvent) {
        if let Some(tx) = &self.tx {
            // A closed receiver means the display layer is gone; nothing to do.
            let _ = tx.send(event);
        }
    }
}

/// Coordinator-level settings routed to a driver's transport
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceSetting {
    /// Port name or device id
    Channel(String),
    /// Default settle time after writes
    Settle(Duration),
}

/// Contract between the coordinator and every instrument driver
#[async_trait]
pub trait Device: Send {
    /// Name used for routing and events
    fn name(&self) -> &str;

    /// Open the transport and run the instrument's startup sequence
    async fn open(&mut self) -> AppResult<()>;

    /// Put the instrument in a safe state and close the transport.
    /// Failures are logged, never returned.
    async fn exit(&mut self);

    /// Handle one `(parameter, value)` command. Unknown parameters and
    /// transport failures are logged, never returned.
    async fn parse_command(&mut self, parameter: &str, value: &str);

    /// Re-query the instrument and update the condition map
    async fn refresh_status(&mut self);

    /// Last-known values
    fn conditions(&self) -> &ConditionMap;

    /// The transport this driver talks through
    fn transport_mut(&mut self) -> &mut dyn Transport;

    /// Apply a channel or settle-time change. Rejected values leave the
    /// transport unchanged.
    fn configure(&mut self, setting: &DeviceSetting) -> AppResult<()> {
        match setting {
            DeviceSetting::Channel(channel) => self.transport_mut().set_channel(channel),
            DeviceSetting::Settle(settle) => self.transport_mut().set_settle_time(*settle),
        }
    }
}

/// Driver behind the lock that serializes polls and dispatches
pub type SharedDevice = Arc<Mutex<dyn Device>>;

/// Wrap a driver for sharing between the coordinator and the poller
pub fn shared<D: Device + 'static>(device: D) -> SharedDevice {
    Arc::new(Mutex::new(device))
}
