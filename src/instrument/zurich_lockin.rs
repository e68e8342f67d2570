//! Zurich Instruments HF2LI lock-in amplifier driver
//!
//! The lock-in is reached through its data server rather than a serial line
//! (see [`RpcTransport`]). Its full default parameter tree lives in a YAML
//! file of `[path, value]` pairs:
//!
//! ```yaml
//! - ['/{device}/sigins/0/ac', 1]
//! - ['/{device}/oscs/0/freq', 10280000.0]
//! ```
//!
//! `{device}` is replaced with the discovered device id before the list is
//! pushed, so the same file serves any unit. The list also seeds the
//! condition map, keyed by the path below the device (`sigins/0/ac`), which
//! is how new firmware nodes show up without code changes.
//!
//! The oscillator frequency is not a demodulator node on this instrument.
//! [`ZurichLockin::enable_demodulator`] therefore pushes two batches: the
//! demodulator settings, then the oscillator frequency.
//!
//! Spectra bypass the acquisition module: [`ZurichLockin::poll_demodulator`]
//! streams one demodulator straight to the session for a short window.

use super::acquisition::{AcquisitionReader, ScanGeometry, TriggerSpec};
use super::{ConditionMap, ConditionValue, Device, EventSink};
use crate::adapters::{RpcTransport, Transport};
use crate::config::LockinSettings;
use crate::error::{AppResult, DaqError};
use crate::labone::{DataServer, DemodSamples, Discovery, ParamValue, SettingsBatch};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEVICE_PLACEHOLDER: &str = "{device}";
/// Server-side wait for the first sample of a direct poll
const POLL_TIMEOUT: Duration = Duration::from_millis(500);
/// Time constant used while polling for spectra, in seconds
const POLL_TIME_CONSTANT: f64 = 1e-3;

/// Load a `[path, value]` list from a YAML file
pub fn load_parameter_file(path: impl AsRef<Path>) -> AppResult<SettingsBatch> {
    let text = std::fs::read_to_string(path.as_ref())?;
    Ok(serde_yaml::from_str(&text)?)
}

/// Path below the device id: `/{device}/sigins/0/ac` -> `sigins/0/ac`
fn relative_key(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((_, rest)) => rest.to_string(),
        None => trimmed.to_string(),
    }
}

fn to_condition(value: &ParamValue) -> ConditionValue {
    match value.as_f64() {
        Some(v) => ConditionValue::Number(v),
        None => ConditionValue::Text(value.to_string()),
    }
}

fn summary(title: &str, fields: &[(&str, ParamValue)]) -> String {
    let mut text = format!("{title} using:\n");
    for (key, value) in fields {
        text.push_str(&format!("\t{key}: {value}\n"));
    }
    text
}

/// Demodulator configuration
#[derive(Debug, Clone, PartialEq)]
pub struct DemodulatorSettings {
    /// Demodulator index
    pub demod: u32,
    /// Signal input feeding it
    pub input: u32,
    /// Oscillator frequency in Hz
    pub frequency: f64,
    /// Demodulation harmonic
    pub harmonic: u32,
    /// Filter time constant in seconds
    pub time_constant: f64,
    /// Low-pass filter order
    pub filter_order: u32,
    /// Oscillator index
    pub oscillator: u32,
    /// Sample transfer rate in Hz
    pub rate: f64,
}

impl Default for DemodulatorSettings {
    fn default() -> Self {
        Self {
            demod: 0,
            input: 0,
            frequency: 1.028e7,
            harmonic: 1,
            time_constant: 3e-6,
            filter_order: 4,
            oscillator: 0,
            rate: 100_000.0,
        }
    }
}

/// Signal input front end
#[derive(Debug, Clone, PartialEq)]
pub struct SignalInputSettings {
    /// Input index
    pub input: u32,
    /// AC coupling
    pub ac: bool,
    /// 50 ohm termination
    pub imp50: bool,
    /// Differential mode
    pub differential: bool,
    /// Full-scale range in volts
    pub range: f64,
}

impl Default for SignalInputSettings {
    fn default() -> Self {
        Self {
            input: 0,
            ac: true,
            imp50: true,
            differential: false,
            range: 0.01,
        }
    }
}

/// Signal output stage
#[derive(Debug, Clone, PartialEq)]
pub struct SignalOutputSettings {
    /// Output index
    pub output: u32,
    /// Output enabled
    pub on: bool,
    /// Adder enabled
    pub add: bool,
    /// Output range in volts
    pub range: f64,
}

impl Default for SignalOutputSettings {
    fn default() -> Self {
        Self {
            output: 0,
            on: true,
            add: false,
            range: 10.0,
        }
    }
}

/// Commands the lock-in accepts from the display layer
#[derive(Debug, Clone, PartialEq)]
pub enum LockinCommand {
    /// Retune an oscillator
    OscillatorFrequency {
        /// Oscillator index
        oscillator: u32,
        /// Hz
        frequency: f64,
    },
    /// Configure the scan and start acquiring frames
    StartAcquisition,
    /// Stop acquiring frames
    StopAcquisition,
    /// Lines per frame for the next acquisition
    ScanRows(u32),
    /// Pixels per line for the next acquisition
    ScanCols(u32),
    /// Edge-trigger the next acquisition at this level
    TriggerLevel(f64),
    /// Poll demodulator 0 directly for this long
    PollDemodulator(Duration),
    /// Write a node from the parameter tree directly
    Node {
        /// Path below the device id
        key: String,
        /// Value as typed
        value: ParamValue,
    },
}

/// HF2LI lock-in driver
pub struct ZurichLockin {
    name: String,
    transport: RpcTransport,
    events: EventSink,
    settings: LockinSettings,
    parameters: SettingsBatch,
    conditions: ConditionMap,
    scan: ScanGeometry,
    trigger: Option<TriggerSpec>,
    reader: Option<AcquisitionReader>,
}

impl ZurichLockin {
    /// Driver with an explicit parameter tree
    pub fn new(
        transport: RpcTransport,
        parameters: SettingsBatch,
        settings: LockinSettings,
        events: EventSink,
    ) -> Self {
        let conditions = parameters
            .iter()
            .map(|(path, value)| (relative_key(path), to_condition(value)))
            .collect();
        Self {
            name: settings.name.clone(),
            transport,
            events,
            settings,
            parameters,
            conditions,
            scan: ScanGeometry::default(),
            trigger: None,
            reader: None,
        }
    }

    /// Driver whose parameter tree is read from `settings.parameter_file`
    pub fn from_settings(
        settings: LockinSettings,
        discovery: Arc<dyn Discovery>,
        events: EventSink,
    ) -> AppResult<Self> {
        let parameters = load_parameter_file(&settings.parameter_file)?;
        let transport = RpcTransport::new(discovery, settings.host.clone());
        Ok(Self::new(transport, parameters, settings, events))
    }

    /// Whether frames are being collected
    pub fn is_acquiring(&self) -> bool {
        self.reader.as_ref().is_some_and(AcquisitionReader::is_running)
    }

    fn device_path(&self, leaf: &str) -> String {
        format!("/{}/{}", self.transport.device_id(), leaf)
    }

    fn resolved_parameters(&self) -> SettingsBatch {
        let device = self.transport.device_id();
        self.parameters
            .iter()
            .map(|(path, value)| (path.replace(DEVICE_PLACEHOLDER, device), value.clone()))
            .collect()
    }

    async fn push(&mut self, fields: &[(&str, ParamValue)], subtree: &str) -> AppResult<()> {
        let batch: SettingsBatch = fields
            .iter()
            .map(|(leaf, value)| (self.device_path(&format!("{subtree}/{leaf}")), value.clone()))
            .collect();
        self.transport.set_batch(&batch).await?;
        for (path, value) in &batch {
            self.conditions.insert(relative_key(path), to_condition(value));
        }
        Ok(())
    }

    fn mirror_group(&mut self, group: String, fields: &[(&str, ParamValue)]) {
        let map: ConditionMap = fields
            .iter()
            .map(|(key, value)| ((*key).to_string(), to_condition(value)))
            .collect();
        self.conditions.insert(group, ConditionValue::Map(map));
    }

    /// Enable a demodulator and tune its oscillator
    pub async fn enable_demodulator(&mut self, demod: &DemodulatorSettings) -> AppResult<()> {
        let fields = [
            ("enable", ParamValue::Int(1)),
            ("adcselect", demod.input.into()),
            ("harmonic", demod.harmonic.into()),
            ("timeconstant", demod.time_constant.into()),
            ("order", demod.filter_order.into()),
            ("oscselect", demod.oscillator.into()),
            ("rate", demod.rate.into()),
            ("trigger", ParamValue::Int(0)),
        ];
        self.push(&fields, &format!("demods/{}", demod.demod)).await?;

        let osc = [("freq", ParamValue::Float(demod.frequency))];
        self.push(&osc, &format!("oscs/{}", demod.oscillator)).await?;

        let mirrored = [
            ("enable", ParamValue::Int(1)),
            ("sigin", demod.input.into()),
            ("harmonic", demod.harmonic.into()),
            ("tc", demod.time_constant.into()),
            ("order", demod.filter_order.into()),
            ("oscillator", demod.oscillator.into()),
            ("rate", demod.rate.into()),
        ];
        self.mirror_group(format!("demod{}", demod.demod), &mirrored);
        self.mirror_group(format!("osc{}", demod.oscillator), &osc);

        let mut log = summary(&format!("Demodulator {}", demod.demod), &mirrored);
        log.push_str(&summary(&format!("Oscillator {}", demod.oscillator), &osc));
        self.events.log(&self.name, log);
        Ok(())
    }

    /// Set input coupling, termination and range
    pub async fn configure_signal_input(&mut self, input: &SignalInputSettings) -> AppResult<()> {
        let fields = [
            ("ac", input.ac.into()),
            ("imp50", input.imp50.into()),
            ("diff", input.differential.into()),
            ("range", input.range.into()),
        ];
        self.push(&fields, &format!("sigins/{}", input.input)).await?;
        self.mirror_group(format!("sigin{}", input.input), &fields);
        self.events.log(
            &self.name,
            summary(&format!("Configured input {}", input.input), &fields),
        );
        Ok(())
    }

    /// Switch an output and set its range
    pub async fn configure_signal_output(&mut self, output: &SignalOutputSettings) -> AppResult<()> {
        let fields = [
            ("on", output.on.into()),
            ("add", output.add.into()),
            ("range", output.range.into()),
        ];
        self.push(&fields, &format!("sigouts/{}", output.output)).await?;
        self.mirror_group(format!("sigout{}", output.output), &fields);
        self.events.log(
            &self.name,
            summary(&format!("Configured output {}", output.output), &fields),
        );
        Ok(())
    }

    /// Configure the scan and start collecting frames
    pub async fn start_acquisition(&mut self) -> AppResult<()> {
        let reader = self.reader.as_mut().ok_or(DaqError::NotConnected)?;
        reader.setup_scan(&self.scan).await?;
        if let Some(trigger) = &self.trigger {
            reader.setup_trigger(trigger).await?;
        }
        reader.start().await
    }

    /// Stop collecting frames
    pub async fn stop_acquisition(&mut self) -> AppResult<()> {
        let reader = self.reader.as_mut().ok_or(DaqError::NotConnected)?;
        reader.stop().await
    }

    /// Poll demodulator `demod` for `length` with its time constant
    /// temporarily set to `time_constant` seconds.
    ///
    /// The configured time constant is restored whether or not the poll
    /// produced samples.
    pub async fn poll_demodulator(
        &mut self,
        demod: u32,
        length: Duration,
        timeout: Duration,
        time_constant: f64,
    ) -> AppResult<DemodSamples> {
        let server = self.transport.server()?;
        let path = self.device_path(&format!("demods/{demod}"));
        let configured = self
            .conditions
            .get(&format!("demods/{demod}/timeconstant"))
            .and_then(ConditionValue::as_f64)
            .unwrap_or(DemodulatorSettings::default().time_constant);

        set_time_constant(server.as_ref(), &path, time_constant).await?;
        let result = collect_samples(server.as_ref(), &path, length, timeout).await;
        let restored = set_time_constant(server.as_ref(), &path, configured).await;

        let line = match &result {
            Ok(_) => format!(
                "Polled for {} s and time constant {time_constant} s",
                length.as_secs_f64()
            ),
            Err(e) => format!("While polling, encountered error: {e}"),
        };
        self.events.log(&self.name, line);

        let samples = result?;
        restored?;
        Ok(samples)
    }

    /// Surface the server's last error as an `APIError` line.
    /// Returns the line when there was one.
    pub async fn check_api_errors(&mut self) -> AppResult<Option<String>> {
        let server = self.transport.server()?;
        let message = server.last_error().await?;
        if message.is_empty() {
            return Ok(None);
        }
        let line = format!("APIError: {message}");
        self.events.log(&self.name, line.clone());
        self.conditions
            .insert("api_error".to_string(), line.clone().into());
        Ok(Some(line))
    }

    fn parse(&self, parameter: &str, value: &str) -> AppResult<Option<LockinCommand>> {
        let number = || {
            value.trim().parse::<f64>().map_err(|_| {
                DaqError::InvalidSetting(format!("{parameter}: '{value}' is not a number"))
            })
        };
        let count = || {
            value.trim().parse::<u32>().map_err(|_| {
                DaqError::InvalidSetting(format!("{parameter}: '{value}' is not a count"))
            })
        };
        let command = match parameter {
            "freq_osc0" => LockinCommand::OscillatorFrequency {
                oscillator: 0,
                frequency: number()?,
            },
            "freq_osc1" => LockinCommand::OscillatorFrequency {
                oscillator: 1,
                frequency: number()?,
            },
            "start_acquisition" => LockinCommand::StartAcquisition,
            "stop_acquisition" => LockinCommand::StopAcquisition,
            "scan_rows" => LockinCommand::ScanRows(count()?),
            "scan_cols" => LockinCommand::ScanCols(count()?),
            "trigger_level" => LockinCommand::TriggerLevel(number()?),
            "poll_demod" => {
                let seconds = number()?;
                let length = Duration::try_from_secs_f64(seconds).map_err(|_| {
                    DaqError::InvalidSetting(format!("{parameter}: '{value}' is not a duration"))
                })?;
                LockinCommand::PollDemodulator(length)
            }
            key if self.parameters.iter().any(|(p, _)| relative_key(p) == key) => {
                LockinCommand::Node {
                    key: key.to_string(),
                    value: ParamValue::parse(value),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(command))
    }

    async fn execute(&mut self, command: LockinCommand) -> AppResult<()> {
        match command {
            LockinCommand::OscillatorFrequency {
                oscillator,
                frequency,
            } => {
                let osc = [("freq", ParamValue::Float(frequency))];
                self.push(&osc, &format!("oscs/{oscillator}")).await?;
                self.mirror_group(format!("osc{oscillator}"), &osc);
                Ok(())
            }
            LockinCommand::StartAcquisition => self.start_acquisition().await,
            LockinCommand::StopAcquisition => self.stop_acquisition().await,
            LockinCommand::ScanRows(rows) => {
                self.scan.rows = rows;
                Ok(())
            }
            LockinCommand::ScanCols(cols) => {
                self.scan.cols = cols;
                Ok(())
            }
            LockinCommand::TriggerLevel(level) => {
                self.trigger = Some(TriggerSpec {
                    level,
                    ..TriggerSpec::default()
                });
                Ok(())
            }
            LockinCommand::PollDemodulator(length) => {
                let samples = self
                    .poll_demodulator(0, length, POLL_TIMEOUT, POLL_TIME_CONSTANT)
                    .await?;
                self.conditions
                    .insert("poll_samples".to_string(), (samples.len() as f64).into());
                Ok(())
            }
            LockinCommand::Node { key, value } => {
                let path = self.device_path(&key);
                self.transport
                    .write(&format!("{path} {value}"), Duration::ZERO)
                    .await?;
                self.conditions.insert(key, to_condition(&value));
                Ok(())
            }
        }
    }
}

async fn set_time_constant(server: &dyn DataServer, demod_path: &str, seconds: f64) -> AppResult<()> {
    server
        .set(&format!("{demod_path}/timeconstant"), ParamValue::Float(seconds))
        .await?;
    server.sync().await
}

async fn collect_samples(
    server: &dyn DataServer,
    demod_path: &str,
    length: Duration,
    timeout: Duration,
) -> AppResult<DemodSamples> {
    server.subscribe(demod_path).await?;
    server.sync().await?;
    let polled = server.poll(length, timeout).await;
    server.unsubscribe(demod_path).await?;
    polled?
        .remove(&format!("{demod_path}/sample"))
        .ok_or_else(|| DaqError::Instrument(format!("no samples from {demod_path}")))
}

#[async_trait]
impl Device for ZurichLockin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self) -> AppResult<()> {
        self.transport.open().await?;
        let parameters = self.resolved_parameters();
        self.transport.set_batch(&parameters).await?;
        self.enable_demodulator(&DemodulatorSettings::default()).await?;

        let server = self.transport.server()?;
        let module = server.acquisition_module().await?;
        let reader = AcquisitionReader::new(
            module,
            self.transport.device_id(),
            &self.settings.data_node,
            &self.settings.subscribe_suffix,
            Duration::from_millis(self.settings.acquisition_period_ms),
            &self.name,
            self.events.clone(),
        )
        .await?;
        self.reader = Some(reader);

        self.events.log(
            &self.name,
            format!("Connected to {}", self.transport.device_id()),
        );
        Ok(())
    }

    async fn exit(&mut self) {
        match self.reader.as_mut() {
            Some(reader) => {
                if let Err(e) = reader.stop().await {
                    info!(device = %self.name, "Acquisition not stopped: {}", e);
                }
            }
            None => info!(device = %self.name, "Acquisition never opened"),
        }
        self.reader = None;
        if let Err(e) = self.transport.close().await {
            warn!(device = %self.name, error = %e, "Disconnect failed");
        }
        self.events.log(&self.name, "Disconnected");
    }

    async fn parse_command(&mut self, parameter: &str, value: &str) {
        let command = match self.parse(parameter, value) {
            Ok(Some(command)) => command,
            Ok(None) => {
                self.events
                    .log(&self.name, format!("{parameter} not implemented"));
                return;
            }
            Err(e) => {
                self.events.log(&self.name, e.to_string());
                return;
            }
        };
        if let Err(e) = self.execute(command).await {
            let line = if e.is_not_connected() {
                format!("Not connected, {parameter} not sent")
            } else {
                format!("{parameter} failed: {e}")
            };
            self.events.log(&self.name, line);
        }
    }

    async fn refresh_status(&mut self) {
        if !self.transport.is_open() {
            return;
        }
        let resolved = self.resolved_parameters();
        for (path, _) in resolved {
            let value = match self.transport.get(&path).await {
                Ok(value) => to_condition(&value),
                Err(_) => ConditionValue::sentinel(),
            };
            self.conditions.insert(relative_key(&path), value);
        }
        if let Err(e) = self.check_api_errors().await {
            debug!(device = %self.name, error = %e, "Last error not readable");
        }
    }

    fn conditions(&self) -> &ConditionMap {
        &self.conditions
    }

    fn transport_mut(&mut self) -> &mut dyn Transport {
        &mut self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::instrument::DeviceEvent;
    use crate::labone::sim::{SimDiscovery, SimServer};
    use crate::labone::DataServer;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parameters() -> SettingsBatch {
        vec![
            ("/{device}/sigins/0/ac".to_string(), ParamValue::Int(1)),
            ("/{device}/sigins/0/range".to_string(), ParamValue::Float(0.01)),
            ("/{device}/oscs/0/freq".to_string(), ParamValue::Float(1.0e7)),
        ]
    }

    fn lockin(discovery: SimDiscovery, events: EventSink) -> (ZurichLockin, Arc<SimServer>) {
        let server = discovery.server();
        let transport = RpcTransport::new(Arc::new(discovery), "localhost");
        let settings = Settings::default().lockin;
        (ZurichLockin::new(transport, parameters(), settings, events), server)
    }

    #[test]
    fn conditions_seeded_from_parameter_tree() {
        let (lockin, _) = lockin(SimDiscovery::with_device("dev4242"), EventSink::detached());
        let c = lockin.conditions();
        assert_eq!(c["sigins/0/ac"], ConditionValue::Number(1.0));
        assert_eq!(c["oscs/0/freq"], ConditionValue::Number(1.0e7));
    }

    #[test]
    fn parameter_file_loads() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "- ['/{{device}}/sigouts/0/on', 1]\n- ['/{{device}}/sigouts/0/range', 10.0]").unwrap();
        let batch = load_parameter_file(file.path()).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].0, "/{device}/sigouts/0/on");
    }

    #[tokio::test]
    async fn open_pushes_tree_and_demodulator() {
        let (mut lockin, server) =
            lockin(SimDiscovery::with_device("DEV4242"), EventSink::detached());
        lockin.open().await.unwrap();

        assert_eq!(server.node("/dev4242/sigins/0/ac"), Some(ParamValue::Int(1)));
        assert_eq!(
            server.node("/dev4242/demods/0/timeconstant"),
            Some(ParamValue::Float(3e-6))
        );
        assert_eq!(
            server.node("/dev4242/oscs/0/freq"),
            Some(ParamValue::Float(1.028e7))
        );
        // Tree, demodulator, oscillator.
        assert_eq!(server.batch_count(), 3);
        assert_eq!(
            server.module().subscriptions(),
            vec!["/dev4242/demods/0/sample.r"]
        );
    }

    #[tokio::test]
    async fn demodulator_batches_and_log() {
        let (sink, mut rx) = EventSink::channel();
        let (mut lockin, server) = lockin(SimDiscovery::with_device("dev7"), sink);
        lockin.open().await.unwrap();
        while rx.try_recv().is_ok() {}
        let before = server.set_log().len();

        let demod = DemodulatorSettings {
            demod: 1,
            oscillator: 1,
            frequency: 2.0e6,
            ..Default::default()
        };
        lockin.enable_demodulator(&demod).await.unwrap();

        let pushed = &server.set_log()[before..];
        assert_eq!(pushed.len(), 9);
        assert!(pushed[..8].iter().all(|(p, _)| p.starts_with("/dev7/demods/1/")));
        assert_eq!(pushed[8].0, "/dev7/oscs/1/freq");

        match &lockin.conditions()["demod1"] {
            ConditionValue::Map(m) => assert_eq!(m["oscillator"], ConditionValue::Number(1.0)),
            other => panic!("unexpected {other:?}"),
        }
        match rx.try_recv() {
            Ok(DeviceEvent::Log { line, .. }) => {
                assert!(line.starts_with("Demodulator 1 using:\n\tenable: 1\n"));
                assert!(line.contains("Oscillator 1 using:\n\tfreq: 2000000\n"));
            }
            other => panic!("expected summary log, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn frequency_commands() {
        let (mut lockin, server) = lockin(SimDiscovery::with_device("dev7"), EventSink::detached());
        lockin.open().await.unwrap();

        lockin.parse_command("freq_osc1", "5e6").await;
        lockin.parse_command("sigins/0/range", "0.1").await;

        assert_eq!(server.node("/dev7/oscs/1/freq"), Some(ParamValue::Float(5e6)));
        assert_eq!(server.node("/dev7/sigins/0/range"), Some(ParamValue::Float(0.1)));
        assert_eq!(lockin.conditions()["sigins/0/range"], ConditionValue::Number(0.1));
    }

    #[tokio::test]
    async fn signal_io_configuration() {
        let (mut lockin, server) = lockin(SimDiscovery::with_device("dev7"), EventSink::detached());
        lockin.open().await.unwrap();

        lockin
            .configure_signal_input(&SignalInputSettings::default())
            .await
            .unwrap();
        lockin
            .configure_signal_output(&SignalOutputSettings {
                on: false,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(server.node("/dev7/sigins/0/imp50"), Some(ParamValue::Bool(true)));
        assert_eq!(server.node("/dev7/sigouts/0/on"), Some(ParamValue::Bool(false)));
        assert!(matches!(lockin.conditions()["sigout0"], ConditionValue::Map(_)));
    }

    #[tokio::test]
    async fn missing_unit_fails_open() {
        let (mut lockin, _) = lockin(SimDiscovery::empty(), EventSink::detached());
        let err = lockin.open().await.unwrap_err();
        assert!(matches!(err, DaqError::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn exit_before_open_is_quiet() {
        let (sink, mut rx) = EventSink::channel();
        let (mut lockin, server) = lockin(SimDiscovery::with_device("dev7"), sink);
        lockin.exit().await;

        assert!(!server.is_connected());
        let lines: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                DeviceEvent::Log { line, .. } => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["Disconnected"]);
    }

    #[tokio::test]
    async fn exit_stops_acquisition_then_disconnects() {
        let (mut lockin, server) = lockin(SimDiscovery::with_device("dev7"), EventSink::detached());
        lockin.open().await.unwrap();
        lockin.parse_command("scan_rows", "4").await;
        lockin.parse_command("start_acquisition", "").await;
        assert!(lockin.is_acquiring());
        assert!(server.module().is_running());

        lockin.exit().await;

        assert!(!server.module().is_running());
        assert!(!server.is_connected());
        assert_eq!(
            server.module().param("dataAcquisitionModule/grid/rows"),
            Some(ParamValue::Int(4))
        );
    }

    #[tokio::test]
    async fn poll_restores_configured_time_constant() {
        let (sink, mut rx) = EventSink::channel();
        let (mut lockin, server) = lockin(SimDiscovery::with_device("dev7"), sink);
        lockin.open().await.unwrap();
        while rx.try_recv().is_ok() {}

        let samples = lockin
            .poll_demodulator(0, Duration::from_millis(50), POLL_TIMEOUT, 1e-3)
            .await
            .unwrap();

        // Default demodulator streams at 100 kSa/s.
        assert_eq!(samples.len(), 5_000);
        assert_eq!(samples.auxin0.len(), 5_000);
        assert!(server
            .set_log()
            .contains(&("/dev7/demods/0/timeconstant".to_string(), ParamValue::Float(1e-3))));
        assert_eq!(
            server.node("/dev7/demods/0/timeconstant"),
            Some(ParamValue::Float(3e-6))
        );
        assert!(server.streams().is_empty());
        match rx.try_recv() {
            Ok(DeviceEvent::Log { line, .. }) => {
                assert_eq!(line, "Polled for 0.05 s and time constant 0.001 s")
            }
            other => panic!("expected poll log, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn poll_command_records_sample_count() {
        let (mut lockin, _) = lockin(SimDiscovery::with_device("dev7"), EventSink::detached());
        lockin.open().await.unwrap();

        lockin.parse_command("poll_demod", "0.01").await;

        assert_eq!(lockin.conditions()["poll_samples"], ConditionValue::Number(1_000.0));
    }

    #[tokio::test]
    async fn poll_before_open_is_not_connected() {
        let (mut lockin, _) = lockin(SimDiscovery::with_device("dev7"), EventSink::detached());
        let err = lockin
            .poll_demodulator(0, Duration::from_millis(10), POLL_TIMEOUT, 1e-3)
            .await
            .unwrap_err();
        assert!(err.is_not_connected());
    }

    #[tokio::test]
    async fn server_errors_are_reported_once() {
        let (sink, mut rx) = EventSink::channel();
        let (mut lockin, server) = lockin(SimDiscovery::with_device("dev7"), sink);
        lockin.open().await.unwrap();
        while rx.try_recv().is_ok() {}

        server.inject_error("Device dev7 busy");
        lockin.refresh_status().await;
        lockin.refresh_status().await;

        let lines: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                DeviceEvent::Log { line, .. } => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["APIError: Device dev7 busy"]);
        assert_eq!(
            lockin.conditions()["api_error"],
            ConditionValue::from("APIError: Device dev7 busy")
        );
    }

    #[tokio::test]
    async fn refresh_reads_tree_when_open() {
        let (mut lockin, server) = lockin(SimDiscovery::with_device("dev7"), EventSink::detached());
        lockin.refresh_status().await;
        assert_eq!(lockin.conditions()["sigins/0/ac"], ConditionValue::Number(1.0));

        lockin.open().await.unwrap();
        server.set("/dev7/sigins/0/ac", ParamValue::Int(0)).await.unwrap();
        lockin.refresh_status().await;
        assert_eq!(lockin.conditions()["sigins/0/ac"], ConditionValue::Number(0.0));
    }
}
