//! Lock-in data server API
//!
//! The lock-in is not driven over a serial line. A data server process owns
//! the instrument and exposes its settings as a tree of slash-delimited paths,
//! e.g. `/dev1234/demods/0/timeconstant`. These traits describe the part of
//! that API the bench uses:
//!
//! - [`Discovery`]: find a unit, describe it, and open a session
//! - [`DataServer`]: `set`/`get`/`sync` on the parameter tree, plus direct
//!   sample polling and the server's last-error slot
//! - [`AcquisitionModule`]: the server-side imaging module that assembles
//!   demodulator samples into frames
//!
//! [`sim`] implements all three in-process for tests and bench-less runs.

use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod sim;

/// A value in the instrument's parameter tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Booleans come through as switches
    Bool(bool),
    /// Integer settings (enables, indices, orders)
    Int(i64),
    /// Floating point settings (frequencies, time constants, ranges)
    Float(f64),
    /// Node names and other strings
    Text(String),
}

impl ParamValue {
    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            ParamValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Parse a command-line value: integer, then float, then bool, else text
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(i) = raw.parse::<i64>() {
            ParamValue::Int(i)
        } else if let Ok(f) = raw.parse::<f64>() {
            ParamValue::Float(f)
        } else if let Ok(b) = raw.parse::<bool>() {
            ParamValue::Bool(b)
        } else {
            ParamValue::Text(raw.to_string())
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", u8::from(*b)),
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
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

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// Ordered list of `(path, value)` settings pushed in one call
pub type SettingsBatch = Vec<(String, ParamValue)>;

/// What discovery reports about a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Lowercased device id, e.g. `dev1234`
    pub device_id: String,
    /// Port of the data server owning the device
    pub server_port: u16,
    /// API level the server speaks
    pub api_level: u32,
}

/// One assembled image from the acquisition module
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageFrame {
    /// Number of rows
    pub rows: usize,
    /// Number of columns
    pub cols: usize,
    /// Row-major samples
    pub data: Vec<f64>,
}

impl ImageFrame {
    /// Swap rows and columns
    pub fn transpose(&self) -> ImageFrame {
        let mut data = Vec::with_capacity(self.data.len());
        for c in 0..self.cols {
            for r in 0..self.rows {
                data.push(self.data.get(r * self.cols + c).copied().unwrap_or(0.0));
            }
        }
        ImageFrame {
            rows: self.cols,
            cols: self.rows,
            data,
        }
    }
}

/// Demodulator samples collected by one [`DataServer::poll`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DemodSamples {
    /// In-phase component
    pub x: Vec<f64>,
    /// Quadrature component
    pub y: Vec<f64>,
    /// Auxiliary input 0, wired to the scanner frame clock
    pub auxin0: Vec<f64>,
    /// Auxiliary input 1, wired to the scanner line clock
    pub auxin1: Vec<f64>,
}

impl DemodSamples {
    /// Number of samples
    pub fn len(&self) -> usize {
        self.x.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Locating units and opening sessions
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Ids of every unit that answered
    async fn find_all(&self) -> AppResult<Vec<String>>;

    /// Server port and API level for `device_id`
    async fn describe(&self, device_id: &str) -> AppResult<DeviceDescriptor>;

    /// Open a session on the server at `host`
    async fn connect(
        &self,
        host: &str,
        descriptor: &DeviceDescriptor,
    ) -> AppResult<Arc<dyn DataServer>>;
}

/// A session on the data server
#[async_trait]
pub trait DataServer: Send + Sync {
    /// Set one node
    async fn set(&self, path: &str, value: ParamValue) -> AppResult<()>;

    /// Set several nodes in one transfer
    async fn set_batch(&self, settings: &[(String, ParamValue)]) -> AppResult<()>;

    /// Read one node
    async fn get(&self, path: &str) -> AppResult<ParamValue>;

    /// Block until every previous set has reached the instrument
    async fn sync(&self) -> AppResult<()>;

    /// Stream a demodulator's samples to this session, e.g. `/dev1/demods/0`
    async fn subscribe(&self, path: &str) -> AppResult<()>;

    /// Stop streaming a demodulator
    async fn unsubscribe(&self, path: &str) -> AppResult<()>;

    /// Collect samples for `duration`, giving up after `timeout` without
    /// data. Keyed by `<subscribed path>/sample`.
    async fn poll(
        &self,
        duration: Duration,
        timeout: Duration,
    ) -> AppResult<HashMap<String, DemodSamples>>;

    /// Last error the server recorded for this session, "" when none.
    /// Reading it clears it.
    async fn last_error(&self) -> AppResult<String>;

    /// A handle to the server-side acquisition module
    async fn acquisition_module(&self) -> AppResult<Arc<dyn AcquisitionModule>>;

    /// End the session
    async fn disconnect(&self) -> AppResult<()>;
}

/// Server-side acquisition module. It runs on the server; the client only
/// configures it and collects what it has assembled.
#[async_trait]
pub trait AcquisitionModule: Send + Sync {
    /// Set one module parameter (`dataAcquisitionModule/...` namespace)
    async fn set(&self, path: &str, value: ParamValue) -> AppResult<()>;

    /// Add a node to the acquired signals
    async fn subscribe(&self, node: &str) -> AppResult<()>;

    /// Remove a node
    async fn unsubscribe(&self, node: &str) -> AppResult<()>;

    /// Start acquiring
    async fn execute(&self) -> AppResult<()>;

    /// Frames completed since the last read, keyed by subscribed node.
    /// A node with nothing ready is simply absent.
    async fn read(&self) -> AppResult<HashMap<String, Vec<ImageFrame>>>;

    /// Stop acquiring
    async fn finish(&self) -> AppResult<()>;
}
