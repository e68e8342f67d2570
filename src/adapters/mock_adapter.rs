//! Mock transport for testing
//!
//! Stands in for an instrument line without hardware. It provides:
//! - Scripted responses keyed by the exact command string
//! - A write log (command and requested settle time) for verification
//! - Connection control and open-failure injection
//!
//! `MockTransport` is a cheap handle: clones share state, so a test can keep
//! one clone while a driver owns another.

use super::{validate_settle, Transport};
use crate::config::validate_port_name;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// One recorded write
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    /// Command text without terminator
    pub command: String,
    /// Settle time the caller asked for
    pub settle: Duration,
}

#[derive(Default)]
struct MockState {
    open: bool,
    fail_open: bool,
    settle: Duration,
    replies: HashMap<String, String>,
    one_shot: HashMap<String, VecDeque<String>>,
    pending: Option<String>,
    writes: Vec<WriteRecord>,
}

/// Scripted in-memory transport
///
/// # Example
///
/// ```
/// use srsmicro::adapters::{MockTransport, Transport};
///
/// # tokio_test::block_on(async {
/// let mock = MockTransport::new("COM7");
/// mock.respond("1TE", "1TE@");
///
/// let mut line = mock.clone();
/// line.open().await.unwrap();
/// assert_eq!(line.query("1TE").await.unwrap(), "1TE@");
/// assert_eq!(mock.commands(), vec!["1TE".to_string()]);
/// # })
/// ```
#[derive(Clone)]
pub struct MockTransport {
    channel: String,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Closed mock for `channel`
    pub fn new(channel: &str) -> Self {
        let state = MockState {
            settle: Duration::from_millis(100),
            ..Default::default()
        };
        Self {
            channel: channel.to_string(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Always answer `command` with `reply`
    pub fn respond(&self, command: &str, reply: &str) {
        self.state
            .lock()
            .replies
            .insert(command.to_string(), reply.to_string());
    }

    /// Answer the next `command` with `reply`, ahead of any standing reply
    pub fn respond_once(&self, command: &str, reply: &str) {
        self.state
            .lock()
            .one_shot
            .entry(command.to_string())
            .or_default()
            .push_back(reply.to_string());
    }

    /// Make the next `open` fail
    pub fn fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Drop the connection as if the cable was pulled
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        state.open = false;
        state.pending = None;
    }

    /// Every write so far
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    /// Commands written so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.state
            .lock()
            .writes
            .iter()
            .map(|w| w.command.clone())
            .collect()
    }

    /// How many times `command` was written
    pub fn count(&self, command: &str) -> usize {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|w| w.command == command)
            .count()
    }

    /// Forget the write log
    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.fail_open {
            return Err(DaqError::Transport(format!("could not open {}", self.channel)));
        }
        state.open = true;
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.disconnect();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn write(&mut self, command: &str, settle: Duration) -> AppResult<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(DaqError::NotConnected);
        }
        state.writes.push(WriteRecord {
            command: command.to_string(),
            settle,
        });
        let queued = state
            .one_shot
            .get_mut(command)
            .and_then(|queue| queue.pop_front());
        let reply = queued.or_else(|| state.replies.get(command).cloned());
        state.pending = reply;
        Ok(())
    }

    async fn read(&mut self) -> AppResult<String> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(DaqError::NotConnected);
        }
        Ok(state.pending.take().unwrap_or_default())
    }

    fn settle_time(&self) -> Duration {
        self.state.lock().settle
    }

    fn set_settle_time(&mut self, settle: Duration) -> AppResult<()> {
        validate_settle(settle)?;
        self.state.lock().settle = settle;
        Ok(())
    }

    fn channel(&self) -> &str {
        &self.channel
    }

    fn set_channel(&mut self, channel: &str) -> AppResult<()> {
        validate_port_name(channel)?;
        self.channel = channel.to_string();
        Ok(())
    }
}
