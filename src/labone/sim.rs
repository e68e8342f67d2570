//! In-process data server
//!
//! Behaves like a single lock-in attached to a local server: nodes keep what
//! was set, unknown nodes fail on `get` and leave their message in the
//! last-error slot, polling returns noise at the demodulator's rate, and the
//! acquisition module produces noise frames of the configured grid size while
//! it is executing.

use super::{
    AcquisitionModule, DataServer, DemodSamples, DeviceDescriptor, Discovery, ImageFrame,
    ParamValue,
};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sample rate assumed for a demodulator whose `rate` node was never set
const DEFAULT_DEMOD_RATE: f64 = 1_000.0;
/// Most samples one poll returns
const MAX_POLL_SAMPLES: usize = 100_000;

/// Discovery that reports the units it was built with
pub struct SimDiscovery {
    devices: Vec<String>,
    server: Arc<SimServer>,
}

impl SimDiscovery {
    /// One simulated unit called `device_id`
    pub fn with_device(device_id: &str) -> Self {
        Self {
            devices: vec![device_id.to_string()],
            server: Arc::new(SimServer::new()),
        }
    }

    /// Nothing on the network
    pub fn empty() -> Self {
        Self {
            devices: Vec::new(),
            server: Arc::new(SimServer::new()),
        }
    }

    /// The server sessions connect to
    pub fn server(&self) -> Arc<SimServer> {
        Arc::clone(&self.server)
    }
}

#[async_trait]
impl Discovery for SimDiscovery {
    async fn find_all(&self) -> AppResult<Vec<String>> {
        Ok(self.devices.clone())
    }

    async fn describe(&self, device_id: &str) -> AppResult<DeviceDescriptor> {
        if !self.devices.iter().any(|d| d.eq_ignore_ascii_case(device_id)) {
            return Err(DaqError::DeviceNotFound(device_id.to_string()));
        }
        Ok(DeviceDescriptor {
            device_id: device_id.to_lowercase(),
            server_port: 8004,
            api_level: 6,
        })
    }

    async fn connect(
        &self,
        _host: &str,
        _descriptor: &DeviceDescriptor,
    ) -> AppResult<Arc<dyn DataServer>> {
        self.server.connected.store(true, Ordering::SeqCst);
        let server: Arc<dyn DataServer> = self.server.clone();
        Ok(server)
    }
}

/// Simulated data server
pub struct SimServer {
    nodes: Mutex<BTreeMap<String, ParamValue>>,
    set_log: Mutex<Vec<(String, ParamValue)>>,
    batches: AtomicUsize,
    syncs: AtomicUsize,
    connected: AtomicBool,
    streams: Mutex<Vec<String>>,
    last_error: Mutex<String>,
    module: Arc<SimAcquisitionModule>,
}

impl SimServer {
    fn new() -> Self {
        Self {
            nodes: Mutex::new(BTreeMap::new()),
            set_log: Mutex::new(Vec::new()),
            batches: AtomicUsize::new(0),
            syncs: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            streams: Mutex::new(Vec::new()),
            last_error: Mutex::new(String::new()),
            module: Arc::new(SimAcquisitionModule::default()),
        }
    }

    /// Current value of a node
    pub fn node(&self, path: &str) -> Option<ParamValue> {
        self.nodes.lock().get(path).cloned()
    }

    /// Every set, in order, batched or not
    pub fn set_log(&self) -> Vec<(String, ParamValue)> {
        self.set_log.lock().clone()
    }

    /// Number of `set_batch` calls
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Number of `sync` calls
    pub fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    /// Whether a session is open
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Demodulators currently streaming
    pub fn streams(&self) -> Vec<String> {
        self.streams.lock().clone()
    }

    /// Record an error as if the server had hit it
    pub fn inject_error(&self, message: &str) {
        *self.last_error.lock() = message.to_string();
    }

    /// The acquisition module
    pub fn module(&self) -> Arc<SimAcquisitionModule> {
        Arc::clone(&self.module)
    }

    fn ensure_connected(&self) -> AppResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DaqError::NotConnected)
        }
    }

    fn store(&self, path: &str, value: ParamValue) {
        self.nodes.lock().insert(path.to_string(), value.clone());
        self.set_log.lock().push((path.to_string(), value));
    }
}

#[async_trait]
impl DataServer for SimServer {
    async fn set(&self, path: &str, value: ParamValue) -> AppResult<()> {
        self.ensure_connected()?;
        self.store(path, value);
        Ok(())
    }

    async fn set_batch(&self, settings: &[(String, ParamValue)]) -> AppResult<()> {
        self.ensure_connected()?;
        for (path, value) in settings {
            self.store(path, value.clone());
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, path: &str) -> AppResult<ParamValue> {
        self.ensure_connected()?;
        self.node(path).ok_or_else(|| {
            let message = format!("node {path} not found");
            self.inject_error(&message);
            DaqError::Instrument(message)
        })
    }

    async fn sync(&self) -> AppResult<()> {
        self.ensure_connected()?;
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> AppResult<()> {
        self.ensure_connected()?;
        let mut streams = self.streams.lock();
        if !streams.iter().any(|p| p == path) {
            streams.push(path.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, path: &str) -> AppResult<()> {
        self.ensure_connected()?;
        self.streams.lock().retain(|p| p != path);
        Ok(())
    }

    async fn poll(
        &self,
        duration: Duration,
        _timeout: Duration,
    ) -> AppResult<HashMap<String, DemodSamples>> {
        self.ensure_connected()?;
        let mut rng = rand::thread_rng();
        let mut out = HashMap::new();
        for path in self.streams() {
            let rate = self
                .node(&format!("{path}/rate"))
                .and_then(|v| v.as_f64())
                .unwrap_or(DEFAULT_DEMOD_RATE);
            let count = ((duration.as_secs_f64() * rate).round() as usize).clamp(1, MAX_POLL_SAMPLES);
            let mut noise = |scale: f64| -> Vec<f64> {
                (0..count).map(|_| rng.gen_range(-scale..scale)).collect()
            };
            let samples = DemodSamples {
                x: noise(1e-3),
                y: noise(1e-3),
                auxin0: noise(5.0),
                auxin1: noise(5.0),
            };
            out.insert(format!("{path}/sample"), samples);
        }
        Ok(out)
    }

    async fn last_error(&self) -> AppResult<String> {
        self.ensure_connected()?;
        Ok(std::mem::take(&mut *self.last_error.lock()))
    }

    async fn acquisition_module(&self) -> AppResult<Arc<dyn AcquisitionModule>> {
        self.ensure_connected()?;
        let module: Arc<dyn AcquisitionModule> = self.module.clone();
        Ok(module)
    }

    async fn disconnect(&self) -> AppResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Simulated acquisition module
#[derive(Default)]
pub struct SimAcquisitionModule {
    params: Mutex<HashMap<String, ParamValue>>,
    subscribed: Mutex<Vec<String>>,
    running: AtomicBool,
    withheld: AtomicBool,
    reads: AtomicUsize,
}

impl SimAcquisitionModule {
    /// Value of a module parameter
    pub fn param(&self, path: &str) -> Option<ParamValue> {
        self.params.lock().get(path).cloned()
    }

    /// Subscribed nodes
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscribed.lock().clone()
    }

    /// Whether `execute` was called without a matching `finish`
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Report no completed frames until switched back
    pub fn withhold_frames(&self, withhold: bool) {
        self.withheld.store(withhold, Ordering::SeqCst);
    }

    /// Number of `read` calls
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn grid_dim(&self, key: &str) -> usize {
        self.param(key)
            .and_then(|v| v.as_f64())
            .map(|v| v.max(1.0) as usize)
            .unwrap_or(1)
    }
}

#[async_trait]
impl AcquisitionModule for SimAcquisitionModule {
    async fn set(&self, path: &str, value: ParamValue) -> AppResult<()> {
        self.params.lock().insert(path.to_string(), value);
        Ok(())
    }

    async fn subscribe(&self, node: &str) -> AppResult<()> {
        let mut subscribed = self.subscribed.lock();
        if !subscribed.iter().any(|n| n == node) {
            subscribed.push(node.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, node: &str) -> AppResult<()> {
        self.subscribed.lock().retain(|n| n != node);
        Ok(())
    }

    async fn execute(&self) -> AppResult<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self) -> AppResult<HashMap<String, Vec<ImageFrame>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut out = HashMap::new();
        if !self.is_running() || self.withheld.load(Ordering::SeqCst) {
            return Ok(out);
        }

        let rows = self.grid_dim("dataAcquisitionModule/grid/rows");
        let cols = self.grid_dim("dataAcquisitionModule/grid/cols");
        let mut rng = rand::thread_rng();
        for node in self.subscriptions() {
            let data = (0..rows * cols).map(|_| rng.gen_range(0.0..1e-3)).collect();
            out.insert(node, vec![ImageFrame { rows, cols, data }]);
        }
        Ok(out)
    }

    async fn finish(&self) -> AppResult<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn discovery_and_session() {
        let discovery = SimDiscovery::with_device("DEV4242");
        let ids = discovery.find_all().await.unwrap();
        let descriptor = discovery.describe(&ids[0]).await.unwrap();
        assert_eq!(descriptor.device_id, "dev4242");

        let server = discovery.connect("localhost", &descriptor).await.unwrap();
        server
            .set("/dev4242/oscs/0/freq", ParamValue::Float(1.0e7))
            .await
            .unwrap();
        assert_eq!(
            server.get("/dev4242/oscs/0/freq").await.unwrap(),
            ParamValue::Float(1.0e7)
        );
        assert!(server.get("/dev4242/unknown").await.is_err());

        server.disconnect().await.unwrap();
        assert!(server.get("/dev4242/oscs/0/freq").await.unwrap_err().is_not_connected());
    }

    #[tokio::test]
    async fn poll_follows_demodulator_rate() {
        let discovery = SimDiscovery::with_device("dev1");
        let descriptor = discovery.describe("dev1").await.unwrap();
        let server = discovery.connect("localhost", &descriptor).await.unwrap();
        server
            .set("/dev1/demods/0/rate", ParamValue::Float(2_000.0))
            .await
            .unwrap();

        assert!(server
            .poll(Duration::from_millis(50), Duration::from_millis(500))
            .await
            .unwrap()
            .is_empty());

        server.subscribe("/dev1/demods/0").await.unwrap();
        let data = server
            .poll(Duration::from_millis(50), Duration::from_millis(500))
            .await
            .unwrap();
        let samples = &data["/dev1/demods/0/sample"];
        assert_eq!(samples.len(), 100);
        assert_eq!(samples.auxin1.len(), 100);
    }

    #[tokio::test]
    async fn failed_get_fills_last_error_once() {
        let discovery = SimDiscovery::with_device("dev1");
        let descriptor = discovery.describe("dev1").await.unwrap();
        let server = discovery.connect("localhost", &descriptor).await.unwrap();

        assert_eq!(server.last_error().await.unwrap(), "");
        assert!(server.get("/dev1/nope").await.is_err());
        assert_eq!(server.last_error().await.unwrap(), "node /dev1/nope not found");
        assert_eq!(server.last_error().await.unwrap(), "");
    }

    #[tokio::test]
    async fn module_frames_follow_grid() {
        let module = SimAcquisitionModule::default();
        module
            .set("dataAcquisitionModule/grid/rows", ParamValue::Int(4))
            .await
            .unwrap();
        module
            .set("dataAcquisitionModule/grid/cols", ParamValue::Int(8))
            .await
            .unwrap();
        module.subscribe("/dev1/demods/0/sample.r").await.unwrap();

        assert!(module.read().await.unwrap().is_empty());

        module.execute().await.unwrap();
        let frames = module.read().await.unwrap();
        let frame = &frames["/dev1/demods/0/sample.r"][0];
        assert_eq!((frame.rows, frame.cols, frame.data.len()), (4, 8, 32));
    }
}
