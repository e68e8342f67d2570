//! Spectra-Physics InSight femtosecond laser driver
//!
//! Protocol Overview:
//! - Format: SCPI-style ASCII over RS-232/USB, one command per line
//! - Baud: 115200, 8N1, no flow control
//! - Queries append `?` to the command mnemonic
//! - Commands: ON, OFF, SHUTter 0|1, IRSHUTter 0|1, WAVelength <nm>, MODE RUN|ALIGN
//! - `*STB?` returns a decimal status word:
//!   - bit 2: main shutter open, bit 3: fixed (IR) shutter open
//!   - bits 9-15: operational error flags
//!   - bits 16+: operating state (see [`OpState::classify`])
//! - `READ:AHIS?` returns the fault history as space-separated 3-digit codes
//!
//! The laser has a communication watchdog that turns the diodes off if the
//! host goes quiet. It is disabled right after opening the port because
//! operator think-time between commands easily exceeds it.

use super::{ConditionMap, ConditionValue, Device, EventSink};
use crate::adapters::Transport;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::fmt;
use tracing::{debug, warn};

/// Parameters re-read on every status refresh, with their query mnemonics
pub const MONITORED: &[(&str, &str)] = &[
    ("d1_curr", "READ:PLASer:DIODe1:CURRent"),
    ("d1_hrs", "READ:PLASer:DIODe1:HOURS"),
    ("d1_temp", "READ:PLASer:DIODe1:TEMPerature"),
    ("d2_curr", "READ:PLASer:DIODe2:CURRent"),
    ("d2_hrs", "READ:PLASer:DIODe2:HOURS"),
    ("d2_temp", "READ:PLASer:DIODe2:TEMPerature"),
    ("humidity", "READ:HUMidity"),
    ("dsm_max", "CONT:SLMAX"),
    ("dsm_min", "CONT:SLMIN"),
    ("dsm_pos", "CONT:DSMPOS"),
    ("opo_wl", "WAVelength"),
    ("fixed_shutter", "IRSHUTter"),
    ("main_shutter", "SHUTter"),
    ("align", "MODE"),
];

/// Operational error flags in the status word
pub const OP_ERRORS: &[(u32, &str)] = &[
    (0x0200, "User interlock open. Laser forced off."),
    (0x0400, "Safety keyswitch interlock open. Laser forced off."),
    (0x0800, "Power supply interlock open. Laser forced off."),
    (0x1000, "Internal interlock open. Laser forced off."),
    (0x4000, "Detecting a warning. Check history for cause."),
    (0x8000, "Fault detected. Laser diodes turned off. Check history."),
];

/// Fault history codes with severity and operator guidance
pub const FAULT_CODES: &[(&str, &str)] = &[
    ("000", "Normal operation."),
    ("056", "Fault: Hardware timeout. Notify SpectraPhysics if it continues."),
    ("066", "Fault: Software timeout. Speak with system operator."),
    ("088", "Fault: Diode thermistor short. Contact SpectraPhysics."),
    ("089", "Fault: Diode thermistor open. Contact SpectraPhysics."),
    ("090", "Fault: Diodes too hot (T>30).  Check cooling system."),
    ("091", "Fault: Diodes warm (T>27).  Check cooling system."),
    ("092", "Fault: Diodes cold (T<17). Check cooling system."),
    ("117", "Fault: Internal interlock opened. Contact SpectraPhysics."),
    ("118", "Fault: CDRH interlock open."),
    ("119", "Fault: Power supply interlock. Check cable."),
    ("120", "Fault: Key switch interlock. Turn key."),
    ("129", "Fault: Very high humidity. Change purge cartridge."),
    ("130", "Warning: High humidity. Change purge cartridge soon."),
    ("481", "Fault: Slow diode ramp. Contact SpectraPhysics."),
    ("482", "Fault: Low fs oscillator power. Contact SpectraPhysics."),
    ("483", "Fault: low FTO power. Try different wavelengths. Contact SpectraPhysics."),
];

const MAIN_SHUTTER_BIT: u32 = 0x4;
const FIXED_SHUTTER_BIT: u32 = 0x8;
const NO_ERRORS: &str = "no errors found";
const INSTRUMENT_OFF: &str = "instrument off";

/// Operating state reported in the upper half of the status word
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Initializing,
    ReadyToTurnOn,
    TurningOnOrOptimizing,
    Run,
    MovingToAlign,
    Align,
    ExitingAlign,
    Reserved,
}

impl OpState {
    /// Map the numeric state field to an operating state
    pub fn classify(state: u32) -> OpState {
        match state {
            0..=24 => OpState::Initializing,
            25 => OpState::ReadyToTurnOn,
            26..=49 => OpState::TurningOnOrOptimizing,
            50 => OpState::Run,
            51..=59 => OpState::MovingToAlign,
            60 => OpState::Align,
            61..=69 => OpState::ExitingAlign,
            _ => OpState::Reserved,
        }
    }
}

impl fmt::Display for OpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            OpState::Initializing => "Initializing",
            OpState::ReadyToTurnOn => "Ready to turn on",
            OpState::TurningOnOrOptimizing => "Turning on and/or optimizing",
            OpState::Run => "RUN",
            OpState::MovingToAlign => "Moving to align mode",
            OpState::Align => "Align mode",
            OpState::ExitingAlign => "Exiting align mode",
            OpState::Reserved => "Reserved",
        };
        f.write_str(text)
    }
}

/// Commands the laser accepts from the display layer
#[derive(Debug, Clone, PartialEq)]
pub enum LaserCommand {
    /// Turn on when off, off when running
    ToggleEmission,
    /// Open or close the main (tunable) shutter
    ToggleMainShutter,
    /// Open or close the fixed-wavelength shutter
    ToggleFixedShutter,
    /// Tune the OPO, value forwarded unchanged
    SetWavelength(String),
    /// Switch between align and run mode
    ToggleAlign,
}

impl LaserCommand {
    /// Look up a display-layer parameter name
    pub fn from_parameter(parameter: &str, value: &str) -> Option<Self> {
        match parameter {
            "op_state" => Some(LaserCommand::ToggleEmission),
            "main_shutter" => Some(LaserCommand::ToggleMainShutter),
            "fixed_shutter" => Some(LaserCommand::ToggleFixedShutter),
            "opo_wl" => Some(LaserCommand::SetWavelength(value.trim().to_string())),
            "align" => Some(LaserCommand::ToggleAlign),
            _ => None,
        }
    }
}

/// Causes whose flag is set in `status`, in table order
pub fn op_error_causes(status: u32) -> Vec<&'static str> {
    OP_ERRORS
        .iter()
        .filter(|(mask, _)| status & mask != 0)
        .map(|(_, cause)| *cause)
        .collect()
}

/// Fold the operational error bits into one message
pub fn decode_op_errors(status: u32) -> String {
    let causes = op_error_causes(status);
    if causes.is_empty() {
        NO_ERRORS.to_string()
    } else {
        causes.join("\n")
    }
}

/// Translate a `READ:AHIS?` response into one line per code
pub fn decode_history(response: &str) -> String {
    response
        .split_whitespace()
        .map(|code| {
            let cause = FAULT_CODES
                .iter()
                .find(|(c, _)| *c == code)
                .map(|(_, cause)| *cause)
                .unwrap_or("Unknown fault code.");
            format!("{code}: {cause}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// InSight laser driver
pub struct InsightLaser<T: Transport> {
    name: String,
    transport: T,
    events: EventSink,
    conditions: ConditionMap,
    op_state: OpState,
    history_read: bool,
    // Error bits already reported, so a standing fault logs once
    reported_errors: u32,
}

impl<T: Transport> InsightLaser<T> {
    /// Driver over `transport`; nothing is sent until [`Device::open`]
    pub fn new(name: impl Into<String>, transport: T, events: EventSink) -> Self {
        let mut conditions = ConditionMap::new();
        for (key, _) in MONITORED {
            conditions.insert((*key).to_string(), ConditionValue::sentinel());
        }
        conditions.insert("main_shutter".to_string(), 0.0.into());
        conditions.insert("fixed_shutter".to_string(), 0.0.into());
        conditions.insert("op_state".to_string(), OpState::ReadyToTurnOn.to_string().into());
        conditions.insert("op_errors".to_string(), INSTRUMENT_OFF.into());
        conditions.insert("history".to_string(), INSTRUMENT_OFF.into());

        Self {
            name: name.into(),
            transport,
            events,
            conditions,
            op_state: OpState::ReadyToTurnOn,
            history_read: false,
            reported_errors: 0,
        }
    }

    /// Last classified operating state
    pub fn op_state(&self) -> OpState {
        self.op_state
    }

    /// Whether the fault history has been read
    pub fn history_read(&self) -> bool {
        self.history_read
    }

    /// Send one command with the default settle time
    async fn send(&mut self, command: &str) -> AppResult<()> {
        let settle = self.transport.settle_time();
        self.transport.write(command, settle).await
    }

    async fn query(&mut self, mnemonic: &str) -> AppResult<String> {
        self.transport.query(&format!("{mnemonic}?")).await
    }

    fn flag(&self, key: &str) -> bool {
        self.conditions
            .get(key)
            .and_then(ConditionValue::as_f64)
            .is_some_and(|v| v != 0.0)
    }

    async fn refresh_scalars(&mut self) {
        for (key, mnemonic) in MONITORED {
            let value = match self.query(mnemonic).await {
                Ok(response) => ConditionValue::from_response(&response),
                Err(e) => {
                    if !e.is_not_connected() {
                        debug!(parameter = key, error = %e, "Laser query failed");
                    }
                    ConditionValue::sentinel()
                }
            };
            self.conditions.insert((*key).to_string(), value);
        }
    }

    async fn read_status_word(&mut self) -> AppResult<u32> {
        let response = self.transport.query("*STB?").await?;
        response
            .trim()
            .parse::<u32>()
            .map_err(|_| DaqError::Protocol(format!("unexpected *STB? response '{response}'")))
    }

    async fn read_history(&mut self) {
        let report = match self.query("READ:AHIS").await {
            Ok(response) if !response.trim().is_empty() => decode_history(&response),
            Ok(_) => "history unavailable".to_string(),
            Err(e) => format!("history unavailable: {e}"),
        };
        self.events
            .log(&self.name, format!("Fault history:\n{report}"));
        self.conditions.insert("history".to_string(), report.into());
    }

    fn apply_status_word(&mut self, status: u32) {
        self.conditions.insert(
            "main_shutter".to_string(),
            (status & MAIN_SHUTTER_BIT != 0).into(),
        );
        self.conditions.insert(
            "fixed_shutter".to_string(),
            (status & FIXED_SHUTTER_BIT != 0).into(),
        );
        self.conditions
            .insert("op_errors".to_string(), decode_op_errors(status).into());
        self.report_op_errors(status);
        self.op_state = OpState::classify(status >> 16);
        self.conditions
            .insert("op_state".to_string(), self.op_state.to_string().into());
    }

    fn report_op_errors(&mut self, status: u32) {
        let errors = OP_ERRORS
            .iter()
            .fold(0, |acc, (mask, _)| acc | (status & mask));
        if errors != self.reported_errors {
            for cause in op_error_causes(errors & !self.reported_errors) {
                self.events
                    .log(&self.name, format!("Operational error: {cause}"));
            }
            self.reported_errors = errors;
        }
    }

    fn apply_instrument_off(&mut self) {
        self.op_state = OpState::ReadyToTurnOn;
        self.reported_errors = 0;
        self.conditions
            .insert("op_state".to_string(), self.op_state.to_string().into());
        self.conditions.insert("main_shutter".to_string(), 0.0.into());
        self.conditions.insert("fixed_shutter".to_string(), 0.0.into());
        self.conditions
            .insert("op_errors".to_string(), INSTRUMENT_OFF.into());
        self.conditions.insert("history".to_string(), INSTRUMENT_OFF.into());
    }

    async fn execute(&mut self, command: &LaserCommand) -> AppResult<()> {
        match command {
            LaserCommand::ToggleEmission => {
                let wire = if self.op_state == OpState::Run { "OFF" } else { "ON" };
                self.send(wire).await
            }
            LaserCommand::ToggleMainShutter => self.toggle_shutter("main_shutter", "SHUTter").await,
            LaserCommand::ToggleFixedShutter => {
                self.toggle_shutter("fixed_shutter", "IRSHUTter").await
            }
            LaserCommand::SetWavelength(nm) => self.send(&format!("WAVelength {nm}")).await,
            LaserCommand::ToggleAlign => {
                // Only a confirmed RUN reading switches to align.
                let in_run = matches!(
                    self.conditions.get("align"),
                    Some(ConditionValue::Text(mode)) if mode.eq_ignore_ascii_case("RUN")
                );
                let wire = if in_run { "MODE ALIGN" } else { "MODE RUN" };
                self.send(wire).await
            }
        }
    }

    async fn toggle_shutter(&mut self, key: &str, mnemonic: &str) -> AppResult<()> {
        let open = !self.flag(key);
        self.send(&format!("{mnemonic} {}", u8::from(open))).await?;
        self.conditions.insert(key.to_string(), open.into());
        Ok(())
    }
}

#[async_trait]
impl<T: Transport + 'static> Device for InsightLaser<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self) -> AppResult<()> {
        self.transport.open().await?;
        self.send("TIMer:WATChdog 0").await?;
        self.events.log(
            &self.name,
            format!("Connected on {}, watchdog disabled", self.transport.channel()),
        );
        Ok(())
    }

    async fn exit(&mut self) {
        if self.op_state == OpState::Run {
            match self.send("OFF").await {
                Ok(()) => self.events.log(&self.name, "Laser turned off before closing"),
                Err(e) => warn!(device = %self.name, error = %e, "Could not turn laser off"),
            }
        }
        if let Err(e) = self.transport.close().await {
            warn!(device = %self.name, error = %e, "Closing transport failed");
        }
        self.events.log(&self.name, "Disconnected");
    }

    async fn parse_command(&mut self, parameter: &str, value: &str) {
        let Some(command) = LaserCommand::from_parameter(parameter, value) else {
            self.events
                .log(&self.name, format!("{parameter} not implemented"));
            return;
        };
        if let Err(e) = self.execute(&command).await {
            let line = if e.is_not_connected() {
                format!("Not connected, {parameter} not sent")
            } else {
                format!("{parameter} failed: {e}")
            };
            self.events.log(&self.name, line);
        }
    }

    async fn refresh_status(&mut self) {
        self.refresh_scalars().await;

        match self.read_status_word().await {
            Ok(status) => {
                self.apply_status_word(status);
                if !self.history_read {
                    // Consumed here even if the history read itself fails.
                    self.history_read = true;
                    self.read_history().await;
                }
            }
            Err(e) if e.is_not_connected() => self.apply_instrument_off(),
            Err(e) => warn!(device = %self.name, error = %e, "Status word unreadable"),
        }
    }

    fn conditions(&self) -> &ConditionMap {
        &self.conditions
    }

    fn transport_mut(&mut self) -> &mut dyn Transport {
        &mut self.transport
    }
}
