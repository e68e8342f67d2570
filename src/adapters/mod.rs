//! Transports: the exclusive-access line channels the drivers talk through.
//!
//! Every instrument driver is written against [`Transport`]. Two concrete
//! channels exist:
//!
//! - [`SerialTransport`]: ASCII lines over a serial port. `write` sends the
//!   command plus `\n`, `read` returns the next terminated line.
//! - [`RpcTransport`]: the lock-in data server's parameter tree. There are no
//!   lines here. `write("<path> <value>")` is a `set` followed by `sync`, and
//!   `read()` is a `get` of the path most recently written or queried,
//!   rendered as a string.
//!
//! [`MockTransport`] replays scripted responses for tests and simulated runs.
//!
//! A transport holds no lock of its own. Callers serialize access: the
//! coordinator wraps each driver in a `tokio::sync::Mutex`, so at most one
//! write/read pair is in flight per channel.

use crate::error::AppResult;
use async_trait::async_trait;
use std::time::Duration;

pub mod mock_adapter;
pub mod rpc_adapter;
pub mod serial_adapter;

pub use mock_adapter::MockTransport;
pub use rpc_adapter::RpcTransport;
pub use serial_adapter::{list_serial_ports, SerialTransport};

/// Line-channel contract shared by serial and RPC transports.
#[async_trait]
pub trait Transport: Send {
    /// Configure the channel (baud rate, or server discovery) and mark it open.
    async fn open(&mut self) -> AppResult<()>;

    /// Release the channel. Closing an already closed channel is a no-op.
    async fn close(&mut self) -> AppResult<()>;

    /// Whether the channel is open.
    fn is_open(&self) -> bool;

    /// Send `command` and then wait `settle` before returning.
    ///
    /// Fails with [`DaqError::NotConnected`](crate::error::DaqError::NotConnected)
    /// when the channel is closed.
    async fn write(&mut self, command: &str, settle: Duration) -> AppResult<()>;

    /// Next available response line, trimmed. Empty when nothing arrived.
    async fn read(&mut self) -> AppResult<String>;

    /// Write with the default settle time, then read one line.
    async fn query(&mut self, command: &str) -> AppResult<String> {
        let settle = self.settle_time();
        self.write(command, settle).await?;
        self.read().await
    }

    /// Default wait between a write and a valid read.
    fn settle_time(&self) -> Duration;

    /// Change the default settle time. Rejected values leave it unchanged.
    fn set_settle_time(&mut self, settle: Duration) -> AppResult<()>;

    /// Channel identity: a port name, or the discovered device id.
    fn channel(&self) -> &str;

    /// Change the channel identity. Rejected values leave it unchanged.
    fn set_channel(&mut self, channel: &str) -> AppResult<()>;
}

/// Longest settle time any instrument on the bench needs after a write.
pub const MAX_SETTLE: Duration = Duration::from_secs(60);

/// Shared check for [`Transport::set_settle_time`].
pub(crate) fn validate_settle(settle: Duration) -> AppResult<()> {
    if settle > MAX_SETTLE {
        return Err(crate::error::DaqError::InvalidSetting(format!(
            "settle time {:?} exceeds {:?}",
            settle, MAX_SETTLE
        )));
    }
    Ok(())
}
