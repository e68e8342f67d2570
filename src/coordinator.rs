//! Composition root
//!
//! The coordinator owns one driver per instrument plus the status poller.
//! It routes `(device, parameter, value)` commands to the right driver and
//! runs the ordered startup and shutdown sequences.
//!
//! Commands addressed to [`GLOBAL`] are coordinator-level settings that reach
//! a driver's transport rather than the instrument:
//!
//! | Parameter              | Effect                                   |
//! |------------------------|------------------------------------------|
//! | `<Device> COM Port`    | change the port name or lock-in id       |
//! | `<Device> Settle`      | change the default settle time (seconds) |
//!
//! Nothing here returns a device failure to the caller. Open errors, bad
//! settings and unknown targets all become log events.

use crate::adapters::{MockTransport, SerialTransport};
use crate::config::Settings;
use crate::error::AppResult;
use crate::instrument::{
    shared, DelayStage, Device, DeviceSetting, EventSink, InsightLaser, SharedDevice, ZurichLockin,
};
use crate::labone::sim::SimDiscovery;
use crate::labone::Discovery;
use crate::poller::{PollerHandle, StatusPoller};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Device name for coordinator-level settings
pub const GLOBAL: &str = "Global";

/// Owner of every driver and the status poller
pub struct Coordinator {
    devices: Vec<(String, SharedDevice)>,
    poller: Option<PollerHandle>,
    poll_interval: Duration,
    events: EventSink,
}

impl Coordinator {
    /// No devices yet; add them with [`Coordinator::with_device`]
    pub fn empty(poll_interval: Duration, events: EventSink) -> Self {
        Self {
            devices: Vec::new(),
            poller: None,
            poll_interval,
            events,
        }
    }

    /// Register a driver; startup and shutdown follow registration order
    pub fn with_device<D: Device + 'static>(mut self, device: D) -> Self {
        let name = device.name().to_string();
        self.devices.push((name, shared(device)));
        self
    }

    /// The bench: laser and stage on serial ports, lock-in through `discovery`
    pub fn new(settings: &Settings, discovery: Arc<dyn Discovery>, events: EventSink) -> AppResult<Self> {
        let laser = InsightLaser::new(
            settings.laser.name.clone(),
            SerialTransport::from_settings(&settings.laser),
            events.clone(),
        );
        let stage = DelayStage::new(
            settings.delay_stage.name.clone(),
            SerialTransport::from_settings(&settings.delay_stage),
            settings.stage.clone(),
            events.clone(),
        );
        let lockin = ZurichLockin::from_settings(settings.lockin.clone(), discovery, events.clone())?;

        Ok(Self::empty(settings.poll_interval(), events.clone())
            .with_device(laser)
            .with_device(stage)
            .with_device(lockin))
    }

    /// The bench with scripted serial lines and an in-process lock-in
    pub fn simulated(settings: &Settings, events: EventSink) -> AppResult<Self> {
        let laser = InsightLaser::new(
            settings.laser.name.clone(),
            simulated_laser(&settings.laser.port),
            events.clone(),
        );
        let stage = DelayStage::new(
            settings.delay_stage.name.clone(),
            simulated_stage(&settings.delay_stage.port),
            settings.stage.clone(),
            events.clone(),
        );
        let discovery = Arc::new(SimDiscovery::with_device("dev4242"));
        let lockin = ZurichLockin::from_settings(settings.lockin.clone(), discovery, events.clone())?;

        Ok(Self::empty(settings.poll_interval(), events.clone())
            .with_device(laser)
            .with_device(stage)
            .with_device(lockin))
    }

    /// Registered device names, in startup order
    pub fn device_names(&self) -> Vec<&str> {
        self.devices.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Shared handle to a driver
    pub fn device(&self, name: &str) -> Option<SharedDevice> {
        self.devices
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| Arc::clone(d))
    }

    /// Whether the poller is running
    pub fn is_polling(&self) -> bool {
        self.poller.as_ref().is_some_and(PollerHandle::is_running)
    }

    /// Open every device in order, then start polling all of them.
    ///
    /// A device that fails to open is reported and skipped; the rest still
    /// start and the failed one is still polled (it reports sentinels).
    pub async fn startup(&mut self) {
        for (name, device) in &self.devices {
            self.events
                .log(name, format!("Opening communication with {name}"));
            let result = device.lock().await.open().await;
            if let Err(e) = result {
                warn!(device = %name, error = %e, "Open failed");
                self.events.log(name, format!("Open failed: {e}"));
            }
        }

        let devices = self.devices.iter().map(|(_, d)| Arc::clone(d)).collect();
        self.poller = Some(StatusPoller::spawn(
            devices,
            self.poll_interval,
            self.events.clone(),
        ));
        info!(devices = self.devices.len(), "Startup complete");
    }

    /// Route one command to its driver.
    ///
    /// Each dispatch holds its own poller pause, released when it finishes;
    /// concurrent dispatches keep polling paused until the last one is done.
    pub async fn dispatch(&self, device: &str, parameter: &str, value: &str) {
        if device == GLOBAL {
            self.configure(parameter, value).await;
            return;
        }
        let Some(target) = self.device(device) else {
            self.events
                .log(device, format!("{device}: {parameter} not implemented"));
            return;
        };

        if let Some(poller) = &self.poller {
            poller.pause();
        }
        target.lock().await.parse_command(parameter, value).await;
        if let Some(poller) = &self.poller {
            poller.resume();
        }
    }

    async fn configure(&self, parameter: &str, value: &str) {
        let Some((target, setting)) = self.parse_global(parameter, value) else {
            self.events
                .log(GLOBAL, format!("{parameter} not implemented"));
            return;
        };
        let Some(device) = self.device(&target) else {
            self.events.log(GLOBAL, format!("No device named {target}"));
            return;
        };
        let result = device.lock().await.configure(&setting);
        let line = match result {
            Ok(()) => format!("{parameter} changed to: {value}"),
            Err(e) => format!("{parameter} unchanged: {e}"),
        };
        self.events.log(GLOBAL, line);
    }

    fn parse_global(&self, parameter: &str, value: &str) -> Option<(String, DeviceSetting)> {
        if let Some(device) = parameter.strip_suffix(" COM Port") {
            return Some((device.to_string(), DeviceSetting::Channel(value.trim().to_string())));
        }
        if let Some(device) = parameter.strip_suffix(" Settle") {
            let settle = value
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|s| Duration::try_from_secs_f64(s).ok());
            return match settle {
                Some(settle) => Some((device.to_string(), DeviceSetting::Settle(settle))),
                None => {
                    self.events
                        .log(GLOBAL, format!("{parameter}: '{value}' is not a duration in seconds"));
                    None
                }
            };
        }
        None
    }

    /// Stop the poller, then exit every device in startup order
    pub async fn shutdown(&mut self) {
        if let Some(mut poller) = self.poller.take() {
            poller.stop().await;
        }
        for (name, device) in &self.devices {
            info!(device = %name, "Closing");
            device.lock().await.exit().await;
        }
    }
}

fn simulated_laser(port: &str) -> MockTransport {
    let line = MockTransport::new(port);
    for (query, reply) in [
        ("READ:PLASer:DIODe1:CURRent?", "31.2"),
        ("READ:PLASer:DIODe1:HOURS?", "5120"),
        ("READ:PLASer:DIODe1:TEMPerature?", "20.1"),
        ("READ:PLASer:DIODe2:CURRent?", "30.8"),
        ("READ:PLASer:DIODe2:HOURS?", "5118"),
        ("READ:PLASer:DIODe2:TEMPerature?", "20.3"),
        ("READ:HUMidity?", "4.5"),
        ("CONT:SLMAX?", "100"),
        ("CONT:SLMIN?", "0"),
        ("CONT:DSMPOS?", "48.2"),
        ("WAVelength?", "920"),
        ("IRSHUTter?", "0"),
        ("SHUTter?", "0"),
        ("MODE?", "RUN"),
        // Run state, no flags.
        ("*STB?", "3276800"),
        ("READ:AHIS?", "000"),
    ] {
        line.respond(query, reply);
    }
    line
}

fn simulated_stage(port: &str) -> MockTransport {
    let line = MockTransport::new(port);
    for (query, reply) in [
        ("1TE", "1TE@"),
        ("1TS", "1TS000033"),
        ("1TP?", "1TP0.0000"),
        ("1VA?", "1VA20.0"),
        ("1AC?", "1AC80.0"),
    ] {
        line.respond(query, reply);
    }
    line
}
