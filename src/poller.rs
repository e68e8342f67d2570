//! Background status poller
//!
//! One tokio task walks every registered device once per interval, calls
//! [`Device::refresh_status`](crate::instrument::Device::refresh_status) and
//! emits the resulting condition map as a status event.
//!
//! Each device is locked for the whole of its refresh. The coordinator takes
//! the same lock to dispatch a command, so a poll and a command never share a
//! channel. A slow device delays the rest of the cycle; that is accepted.
//!
//! `pause` is only observed between devices. A refresh already running
//! finishes first. Pauses nest: each `pause` needs its own `resume`, so two
//! overlapping command dispatches cannot lift each other's pause.

use crate::instrument::{EventSink, SharedDevice};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct PollerState {
    devices: Mutex<Vec<SharedDevice>>,
    // Outstanding pause requests
    pauses: AtomicUsize,
    stop: AtomicBool,
    wake: Notify,
    cycles: AtomicU64,
}

/// Entry point for starting the polling task
pub struct StatusPoller;

impl StatusPoller {
    /// Start polling `devices` every `interval`, reporting into `sink`
    pub fn spawn(devices: Vec<SharedDevice>, interval: Duration, sink: EventSink) -> PollerHandle {
        let state = Arc::new(PollerState {
            devices: Mutex::new(devices),
            pauses: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            wake: Notify::new(),
            cycles: AtomicU64::new(0),
        });
        let task = tokio::spawn(run(Arc::clone(&state), interval, sink));
        PollerHandle {
            state,
            task: Some(task),
        }
    }
}

async fn run(state: Arc<PollerState>, interval: Duration, sink: EventSink) {
    info!(interval_ms = interval.as_millis() as u64, "Status poller started");
    while !state.stop.load(Ordering::SeqCst) {
        let devices = state.devices.lock().clone();
        for device in devices {
            if state.stop.load(Ordering::SeqCst) || state.pauses.load(Ordering::SeqCst) > 0 {
                break;
            }
            let mut device = device.lock().await;
            device.refresh_status().await;
            sink.status(device.name(), device.conditions());
        }
        state.cycles.fetch_add(1, Ordering::SeqCst);

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = state.wake.notified() => debug!("Status poller woken"),
        }
    }
    info!("Status poller stopped");
}

/// Control handle for a running poller
pub struct PollerHandle {
    state: Arc<PollerState>,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Register another device; also clears every outstanding pause
    pub fn add_device(&self, device: SharedDevice) {
        self.state.devices.lock().push(device);
        self.state.pauses.store(0, Ordering::SeqCst);
    }

    /// Skip devices from the next boundary on, until the matching `resume`
    pub fn pause(&self) {
        self.state.pauses.fetch_add(1, Ordering::SeqCst);
    }

    /// Release one pause; polling restarts once none are left
    pub fn resume(&self) {
        // Err only when nothing was paused
        let _ = self
            .state
            .pauses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Whether polling is paused
    pub fn is_paused(&self) -> bool {
        self.state.pauses.load(Ordering::SeqCst) > 0
    }

    /// Registered devices
    pub fn device_count(&self) -> usize {
        self.state.devices.lock().len()
    }

    /// Completed poll cycles, paused ones included
    pub fn cycles(&self) -> u64 {
        self.state.cycles.load(Ordering::SeqCst)
    }

    /// Whether the task is still alive
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the task and wait for it to finish its current device
    pub async fn stop(&mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
        self.state.wake.notify_one();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Status poller ended abnormally");
            }
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
        self.state.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockTransport, Transport};
    use crate::error::AppResult;
    use crate::instrument::{shared, ConditionMap, Device, DeviceEvent};
    use async_trait::async_trait;

    struct Counter {
        name: String,
        transport: MockTransport,
        conditions: ConditionMap,
        refreshes: f64,
    }

    impl Counter {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                transport: MockTransport::new("COM1"),
                conditions: ConditionMap::new(),
                refreshes: 0.0,
            }
        }
    }

    #[async_trait]
    impl Device for Counter {
        fn name(&self) -> &str {
            &self.name
        }
        async fn open(&mut self) -> AppResult<()> {
            Ok(())
        }
        async fn exit(&mut self) {}
        async fn parse_command(&mut self, _parameter: &str, _value: &str) {}
        async fn refresh_status(&mut self) {
            self.refreshes += 1.0;
            self.conditions
                .insert("refreshes".to_string(), self.refreshes.into());
        }
        fn conditions(&self) -> &ConditionMap {
            &self.conditions
        }
        fn transport_mut(&mut self) -> &mut dyn Transport {
            &mut self.transport
        }
    }

    async fn refreshes(device: &SharedDevice) -> f64 {
        device
            .lock()
            .await
            .conditions()
            .get("refreshes")
            .and_then(|v| v.as_f64())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn polls_every_device_and_emits_status() {
        let (sink, mut rx) = EventSink::channel();
        let a = shared(Counter::new("A"));
        let b = shared(Counter::new("B"));
        let mut poller =
            StatusPoller::spawn(vec![a.clone(), b.clone()], Duration::from_millis(5), sink);

        let mut seen = Vec::new();
        while seen.len() < 4 {
            if let Some(DeviceEvent::Status { device, .. }) = rx.recv().await {
                seen.push(device);
            }
        }
        poller.stop().await;

        assert_eq!(&seen[..2], ["A", "B"]);
        assert!(refreshes(&a).await >= 2.0);
        assert!(!poller.is_running());
    }

    #[tokio::test]
    async fn pause_skips_refreshes() {
        let a = shared(Counter::new("A"));
        let mut poller = StatusPoller::spawn(vec![a.clone()], Duration::from_millis(5), EventSink::detached());
        poller.pause();
        // A cycle may already be past its pause check; let it drain.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let before = refreshes(&a).await;
        let cycles = poller.cycles();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(refreshes(&a).await, before);
        assert!(poller.cycles() > cycles);

        poller.resume();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(refreshes(&a).await > before);
        poller.stop().await;
    }

    #[tokio::test]
    async fn overlapping_pauses_need_matching_resumes() {
        let mut poller = StatusPoller::spawn(Vec::new(), Duration::from_secs(3600), EventSink::detached());
        poller.resume();
        assert!(!poller.is_paused());

        poller.pause();
        poller.pause();
        poller.resume();
        assert!(poller.is_paused());
        poller.resume();
        assert!(!poller.is_paused());
        poller.stop().await;
    }

    #[tokio::test]
    async fn add_device_resumes() {
        let mut poller = StatusPoller::spawn(Vec::new(), Duration::from_millis(5), EventSink::detached());
        poller.pause();
        poller.pause();
        let late = shared(Counter::new("Late"));
        poller.add_device(late.clone());

        assert!(!poller.is_paused());
        assert_eq!(poller.device_count(), 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(refreshes(&late).await >= 1.0);
        poller.stop().await;
    }

    #[tokio::test]
    async fn stop_wakes_a_long_interval() {
        let mut poller = StatusPoller::spawn(
            vec![shared(Counter::new("A"))],
            Duration::from_secs(3600),
            EventSink::detached(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        tokio::time::timeout(Duration::from_secs(1), poller.stop())
            .await
            .unwrap();
        assert_eq!(poller.cycles(), 1);
    }

    #[tokio::test]
    async fn held_device_blocks_its_poll() {
        let a = shared(Counter::new("A"));
        let guard = a.lock().await;
        let mut poller = StatusPoller::spawn(vec![a.clone()], Duration::from_millis(5), EventSink::detached());
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(poller.cycles(), 0);
        drop(guard);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(poller.cycles() >= 1);
        poller.stop().await;
    }
}
