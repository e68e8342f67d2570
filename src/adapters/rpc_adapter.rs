//! Data server transport for the lock-in amplifier
//!
//! There is no byte stream here. The "line" is a virtual one:
//! - `write("<path> <value>")` sets the node and syncs
//! - `write("<path>")` only selects the node for the next `read`
//! - `read()` gets the selected node and renders it as text
//!
//! `open` runs discovery: list the units, take the preferred one (or the
//! first), ask for its server port and API level, and connect.

use super::{validate_settle, Transport};
use crate::error::{AppResult, DaqError};
use crate::labone::{DataServer, Discovery, ParamValue};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

static DEVICE_ID: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^(?i)dev[0-9]+$").ok());

/// Parameter-tree transport
pub struct RpcTransport {
    discovery: Arc<dyn Discovery>,
    host: String,
    preferred: Option<String>,
    device_id: String,
    settle: Duration,
    server: Option<Arc<dyn DataServer>>,
    selected: Option<String>,
}

impl RpcTransport {
    /// Closed transport that will discover through `discovery` and connect to
    /// the server on `host`
    pub fn new(discovery: Arc<dyn Discovery>, host: impl Into<String>) -> Self {
        Self {
            discovery,
            host: host.into(),
            preferred: None,
            device_id: String::new(),
            settle: Duration::ZERO,
            server: None,
            selected: None,
        }
    }

    /// Lowercased id of the connected unit, empty before `open`
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The live session
    pub fn server(&self) -> AppResult<Arc<dyn DataServer>> {
        self.server.clone().ok_or(DaqError::NotConnected)
    }

    /// Push several settings, then sync once
    pub async fn set_batch(&mut self, settings: &[(String, ParamValue)]) -> AppResult<()> {
        let server = self.server()?;
        server.set_batch(settings).await?;
        server.sync().await?;
        if let Some((path, _)) = settings.last() {
            self.selected = Some(path.clone());
        }
        Ok(())
    }

    /// Read one node as a typed value
    pub async fn get(&mut self, path: &str) -> AppResult<ParamValue> {
        let server = self.server()?;
        self.selected = Some(path.to_string());
        server.get(path).await
    }

    async fn discover(&self) -> AppResult<String> {
        let found = self.discovery.find_all().await?;
        let chosen = match &self.preferred {
            Some(id) => found.iter().find(|d| d.eq_ignore_ascii_case(id)).cloned(),
            None => found.first().cloned(),
        };
        chosen.ok_or_else(|| {
            DaqError::DeviceNotFound(match &self.preferred {
                Some(id) => format!("lock-in {id} did not answer discovery"),
                None => "no lock-in answered discovery".to_string(),
            })
        })
    }
}

#[async_trait]
impl Transport for RpcTransport {
    async fn open(&mut self) -> AppResult<()> {
        if self.server.is_some() {
            return Ok(());
        }
        let device = self.discover().await?;
        let descriptor = self.discovery.describe(&device).await?;
        let server = self.discovery.connect(&self.host, &descriptor).await?;
        info!(
            device = %descriptor.device_id,
            port = descriptor.server_port,
            api_level = descriptor.api_level,
            "Connected to data server"
        );
        self.device_id = descriptor.device_id;
        self.server = Some(server);
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.selected = None;
        match self.server.take() {
            Some(server) => server.disconnect().await,
            None => Ok(()),
        }
    }

    fn is_open(&self) -> bool {
        self.server.is_some()
    }

    async fn write(&mut self, command: &str, settle: Duration) -> AppResult<()> {
        let server = self.server()?;
        let command = command.trim();
        match command.split_once(char::is_whitespace) {
            Some((path, value)) => {
                server.set(path, ParamValue::parse(value)).await?;
                server.sync().await?;
                debug!(path, value = value.trim(), "Node set");
                self.selected = Some(path.to_string());
            }
            None => self.selected = Some(command.to_string()),
        }
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        Ok(())
    }

    async fn read(&mut self) -> AppResult<String> {
        let server = self.server()?;
        match &self.selected {
            Some(path) => Ok(server.get(path).await?.to_string()),
            None => Ok(String::new()),
        }
    }

    fn settle_time(&self) -> Duration {
        self.settle
    }

    fn set_settle_time(&mut self, settle: Duration) -> AppResult<()> {
        validate_settle(settle)?;
        self.settle = settle;
        Ok(())
    }

    fn channel(&self) -> &str {
        if self.device_id.is_empty() {
            self.preferred.as_deref().unwrap_or("")
        } else {
            &self.device_id
        }
    }

    fn set_channel(&mut self, channel: &str) -> AppResult<()> {
        let valid = DEVICE_ID.as_ref().is_some_and(|re| re.is_match(channel));
        if !valid {
            return Err(DaqError::InvalidSetting(format!(
                "'{channel}' is not a lock-in device id (expected dev<n>)"
            )));
        }
        self.preferred = Some(channel.to_lowercase());
        Ok(())
    }
}
