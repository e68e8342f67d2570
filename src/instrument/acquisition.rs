//! Image acquisition through the lock-in data server
//!
//! The server's acquisition module assembles demodulator samples into frames
//! on its own. The reader configures it, starts it, and then polls it from a
//! background task once per period, forwarding every completed frame as a
//! [`DeviceEvent::Frame`](super::DeviceEvent). A poll that finds no frame for
//! the subscribed node is normal and simply waits for the next period.
//!
//! Stopping is cooperative: the task checks an atomic flag once per
//! iteration, so it can take up to one period to wind down. A read already
//! in flight is never interrupted.

use super::EventSink;
use crate::error::{AppResult, DaqError};
use crate::labone::{AcquisitionModule, ParamValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const PREFIX: &str = "dataAcquisitionModule";

/// How the module fills grid cells between samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    /// Nearest sample
    Nearest,
    /// Linear between neighbours
    Linear,
    /// Samples land exactly on the grid
    ExactOnGrid,
}

impl Interpolation {
    fn code(self) -> i64 {
        match self {
            Interpolation::Nearest => 1,
            Interpolation::Linear => 2,
            Interpolation::ExactOnGrid => 4,
        }
    }
}

/// Image geometry for one scan
#[derive(Debug, Clone, PartialEq)]
pub struct ScanGeometry {
    /// Lines per frame
    pub rows: u32,
    /// Pixels per line
    pub cols: u32,
    /// Frames averaged per acquisition
    pub repetitions: u32,
    /// Grid fill mode
    pub interpolation: Interpolation,
    /// Time spent on each pixel
    pub pixel_dwell: Duration,
}

impl Default for ScanGeometry {
    fn default() -> Self {
        Self {
            rows: 512,
            cols: 512,
            repetitions: 1,
            interpolation: Interpolation::Linear,
            pixel_dwell: Duration::from_micros(3),
        }
    }
}

/// Trigger edge polarity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEdge {
    /// Low to high
    Rising,
    /// High to low
    Falling,
}

/// External line trigger
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerSpec {
    /// Sample field carrying the trigger, e.g. `auxin0`
    pub source: String,
    /// Edge polarity
    pub edge: TriggerEdge,
    /// Threshold in volts
    pub level: f64,
}

impl Default for TriggerSpec {
    fn default() -> Self {
        Self {
            source: "auxin0".to_string(),
            edge: TriggerEdge::Rising,
            level: 2.5,
        }
    }
}

/// Client side of the server acquisition module
pub struct AcquisitionReader {
    device_name: String,
    events: EventSink,
    module: Arc<dyn AcquisitionModule>,
    sample_path: String,
    node: String,
    period: Duration,
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl AcquisitionReader {
    /// Configure `module` for continuous acquisition of
    /// `/<device_id>/<data_node>.<component>` and subscribe to it.
    pub async fn new(
        module: Arc<dyn AcquisitionModule>,
        device_id: &str,
        data_node: &str,
        component: &str,
        period: Duration,
        device_name: &str,
        events: EventSink,
    ) -> AppResult<Self> {
        let sample_path = format!("/{}/{}", device_id, data_node.trim_matches('/'));
        let node = format!("{sample_path}.{component}");

        let init: [(&str, ParamValue); 9] = [
            ("enable", ParamValue::Int(1)),
            ("device", device_id.into()),
            ("type", ParamValue::Int(0)),
            ("refreshrate", ParamValue::Int(200)),
            ("endless", ParamValue::Int(1)),
            ("delay", ParamValue::Int(0)),
            ("count", ParamValue::Int(512)),
            ("holdoff/time", ParamValue::Int(0)),
            ("holdoff/count", ParamValue::Int(0)),
        ];
        for (key, value) in init {
            module.set(&format!("{PREFIX}/{key}"), value).await?;
        }
        module.subscribe(&node).await?;

        Ok(Self {
            device_name: device_name.to_string(),
            events,
            module,
            sample_path,
            node,
            period,
            stop: Arc::new(AtomicBool::new(false)),
            task: None,
        })
    }

    /// Subscribed node
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Whether the polling task is alive
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Apply scan geometry; line duration is dwell time times columns
    pub async fn setup_scan(&self, geometry: &ScanGeometry) -> AppResult<()> {
        let duration = geometry.pixel_dwell.as_secs_f64() * f64::from(geometry.cols);
        let settings: [(&str, ParamValue); 7] = [
            ("grid/rows", geometry.rows.into()),
            ("grid/cols", geometry.cols.into()),
            ("grid/direction", ParamValue::Int(0)),
            ("grid/repetitions", geometry.repetitions.into()),
            ("grid/mode", geometry.interpolation.code().into()),
            ("duration", duration.into()),
            ("delay", ParamValue::Int(0)),
        ];
        for (key, value) in settings {
            self.module.set(&format!("{PREFIX}/{key}"), value).await?;
        }
        Ok(())
    }

    /// Switch from continuous to edge-triggered acquisition
    pub async fn setup_trigger(&self, trigger: &TriggerSpec) -> AppResult<()> {
        let edge: i64 = match trigger.edge {
            TriggerEdge::Rising => 1,
            TriggerEdge::Falling => 2,
        };
        let settings: [(&str, ParamValue); 4] = [
            ("type", ParamValue::Int(1)),
            (
                "triggernode",
                format!("{}.{}", self.sample_path, trigger.source).as_str().into(),
            ),
            ("edge", edge.into()),
            ("level", trigger.level.into()),
        ];
        for (key, value) in settings {
            self.module.set(&format!("{PREFIX}/{key}"), value).await?;
        }
        Ok(())
    }

    /// Start the module and the polling task
    pub async fn start(&mut self) -> AppResult<()> {
        if self.is_running() {
            return Ok(());
        }
        self.module.execute().await?;
        self.stop.store(false, Ordering::SeqCst);

        let module = Arc::clone(&self.module);
        let stop = Arc::clone(&self.stop);
        let events = self.events.clone();
        let device = self.device_name.clone();
        let node = self.node.clone();
        let period = self.period;

        self.task = Some(tokio::spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                match module.read().await {
                    Ok(mut data) => match data.remove(&node) {
                        Some(frames) => {
                            for frame in frames {
                                events.frame(&device, frame.transpose());
                            }
                        }
                        None => debug!(node = %node, "No frame ready"),
                    },
                    Err(e) => warn!(node = %node, error = %e, "Acquisition read failed"),
                }
                tokio::time::sleep(period).await;
            }
            debug!(node = %node, "Acquisition reader stopped");
        }));
        self.events.log(&self.device_name, "Acquisition started");
        Ok(())
    }

    /// Signal the task, wait for it to notice, then stop the module
    pub async fn stop(&mut self) -> AppResult<()> {
        let Some(task) = self.task.take() else {
            return Err(DaqError::Instrument("acquisition was never started".to_string()));
        };
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = task.await {
            warn!(error = %e, "Acquisition task ended abnormally");
        }
        self.module.finish().await?;
        self.events.log(&self.device_name, "Acquisition stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::DeviceEvent;
    use crate::labone::sim::SimAcquisitionModule;

    async fn reader(
        module: Arc<SimAcquisitionModule>,
        events: EventSink,
    ) -> AcquisitionReader {
        AcquisitionReader::new(
            module,
            "dev4242",
            "demods/0/sample",
            "r",
            Duration::from_millis(5),
            "Lockin",
            events,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn init_subscribes_and_configures() {
        let module = Arc::new(SimAcquisitionModule::default());
        let reader = reader(module.clone(), EventSink::detached()).await;

        assert_eq!(reader.node(), "/dev4242/demods/0/sample.r");
        assert_eq!(module.subscriptions(), vec!["/dev4242/demods/0/sample.r"]);
        assert_eq!(
            module.param("dataAcquisitionModule/count"),
            Some(ParamValue::Int(512))
        );
        assert_eq!(
            module.param("dataAcquisitionModule/device"),
            Some(ParamValue::Text("dev4242".to_string()))
        );
    }

    #[tokio::test]
    async fn scan_and_trigger_settings() {
        let module = Arc::new(SimAcquisitionModule::default());
        let reader = reader(module.clone(), EventSink::detached()).await;

        let geometry = ScanGeometry {
            rows: 256,
            cols: 1000,
            ..Default::default()
        };
        reader.setup_scan(&geometry).await.unwrap();
        reader.setup_trigger(&TriggerSpec::default()).await.unwrap();

        let duration = module
            .param("dataAcquisitionModule/duration")
            .and_then(|v| v.as_f64())
            .unwrap();
        assert!((duration - 3e-3).abs() < 1e-12);
        assert_eq!(
            module.param("dataAcquisitionModule/grid/mode"),
            Some(ParamValue::Int(2))
        );
        assert_eq!(
            module.param("dataAcquisitionModule/triggernode"),
            Some(ParamValue::Text("/dev4242/demods/0/sample.auxin0".to_string()))
        );
        assert_eq!(
            module.param("dataAcquisitionModule/type"),
            Some(ParamValue::Int(1))
        );
    }

    #[tokio::test]
    async fn frames_flow_until_stopped() {
        let module = Arc::new(SimAcquisitionModule::default());
        let (sink, mut rx) = EventSink::channel();
        let mut reader = reader(module.clone(), sink).await;
        reader
            .setup_scan(&ScanGeometry {
                rows: 2,
                cols: 3,
                ..Default::default()
            })
            .await
            .unwrap();

        module.withhold_frames(true);
        reader.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(reader.is_running());
        module.withhold_frames(false);

        let frame = loop {
            match rx.recv().await {
                Some(DeviceEvent::Frame { frame, .. }) => break frame,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        };
        // Transposed from the module's rows x cols.
        assert_eq!((frame.rows, frame.cols), (3, 2));

        reader.stop().await.unwrap();
        assert!(!reader.is_running());
        assert!(!module.is_running());
        let reads = module.read_count();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(module.read_count(), reads);
    }

    #[tokio::test]
    async fn stop_before_start_is_an_error() {
        let module = Arc::new(SimAcquisitionModule::default());
        let mut reader = reader(module, EventSink::detached()).await;
        assert!(reader.stop().await.is_err());
    }
}
