//! Newport FCL200 / SMC-style delay stage driver
//!
//! Protocol Overview:
//! - Format: ASCII `<address><mnemonic><value>` over RS-232, address is always 1
//! - Command terminator: LF
//! - Responses echo address and mnemonic, the value starts at byte 3
//!
//! | Command        | Meaning                                   | Response           |
//! |----------------|-------------------------------------------|--------------------|
//! | `1TE`          | last command error                        | `1TE@`             |
//! | `1TS`          | positioner error + controller state       | `1TS000033`        |
//! | `1TP?`         | current position                          | `1TP12.0000`       |
//! | `1VA?`/`1AC?`  | velocity / acceleration                   | `1VA20.0`          |
//! | `1PT<dist>`    | time needed to travel `dist`              | `1PT0.4200`        |
//! | `1PR<delta>`   | relative move                             | none               |
//! | `1VA<v>`/`1AC<a>` | set velocity / acceleration            | none               |
//!
//! The controller gives no move-complete notification and garbles replies to
//! anything sent while the carriage is moving, so a relative move is always
//! preceded by a `1PT` estimate and the move write settles for that long.

use super::{ConditionMap, ConditionValue, Device, EventSink};
use crate::adapters::Transport;
use crate::config::StageLimits;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Single-character codes returned by `1TE`
pub const COMMAND_ERRORS: &[(char, &str)] = &[
    ('@', "No error"),
    ('A', "Unknown message code or floating point controller address."),
    ('B', "Controller address not correct."),
    ('C', "Parameter missing or out of range."),
    ('D', "Command not allowed."),
    ('E', "Home sequence already started."),
    ('G', "Displacement out of limits."),
    ('H', "Command not allowed in NOT REFERENCED state."),
    ('I', "Command not allowed in CONFIGURATION state."),
    ('J', "Command not allowed in DISABLE state."),
    ('K', "Command not allowed in READY state."),
    ('L', "Command not allowed in HOMING state."),
    ('M', "Command not allowed in MOVING state."),
    ('N', "Current position out of software limit."),
    ('S', "Communication Time Out."),
    ('U', "Error during EEPROM access."),
    ('V', "Error during command execution."),
];

/// Positioner error causes, indexed left to right over the 16-bit field
pub const POSITIONER_ERRORS: [&str; 16] = [
    "Not used.",
    "Not used.",
    "Not used.",
    "Not used.",
    "Driver overheating.",
    "Driver fault.",
    "Not used.",
    "Not used.",
    "No parameters in memory.",
    "Homing time out.",
    "Not used.",
    "Newport reserved.",
    "RMS current limit.",
    "Not used.",
    "Positive end of run.",
    "Negative end of run.",
];

/// Two-hex-digit controller states returned by `1TS`
pub const CONTROLLER_STATES: &[(&str, &str)] = &[
    ("0A", "NOT REFERENCED from RESET."),
    ("0B", "NOT REFERENCED from HOMING."),
    ("0C", "NOT REFERENCED from CONFIGURATION."),
    ("0D", "NOT REFERENCED from DISABLE."),
    ("0E", "NOT REFERENCED from READY."),
    ("0F", "NOT REFERENCED from MOVING."),
    ("10", "NOT REFERENCED - NO PARAMETERS IN MEMORY."),
    ("14", "CONFIGURATION."),
    ("1E", "HOMING."),
    ("28", "MOVING."),
    ("32", "READY from HOMING."),
    ("33", "READY from MOVING."),
    ("34", "READY from DISABLE."),
    ("3C", "DISABLE from READY."),
    ("3D", "DISABLE from MOVING."),
];

/// How table positions map onto bits of the positioner error field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitOrder {
    /// Table position 0 is bit 15
    MsbFirst,
    /// Table position 0 is bit 0
    LsbFirst,
}

/// Description of a `1TE` code, `None` for codes outside the table
pub fn command_error(code: char) -> Option<&'static str> {
    COMMAND_ERRORS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, cause)| *cause)
}

/// Every active cause in table order, space-joined. Zero yields "".
pub fn decode_positioner_error(field: u16, order: BitOrder) -> String {
    let mut causes = Vec::with_capacity(field.count_ones() as usize);
    for (index, cause) in POSITIONER_ERRORS.iter().enumerate() {
        let bit = match order {
            BitOrder::MsbFirst => 15 - index,
            BitOrder::LsbFirst => index,
        };
        if field & (1 << bit) != 0 {
            causes.push(*cause);
        }
    }
    causes.join(" ")
}

/// Name of a controller state code
pub fn controller_state(code: &str) -> Option<&'static str> {
    CONTROLLER_STATES
        .iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(code))
        .map(|(_, name)| *name)
}

/// Commands the stage accepts from the display layer
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageCommand {
    /// Go to an absolute position
    MoveAbsolute(f64),
    /// Relative move by `value`
    MoveRelative(f64),
    /// Set velocity
    Velocity(f64),
    /// Set acceleration
    Acceleration(f64),
}

impl StageCommand {
    /// Look up a display-layer parameter. `Ok(None)` for unknown names.
    pub fn from_parameter(parameter: &str, value: &str) -> AppResult<Option<Self>> {
        let number = || {
            value
                .trim()
                .parse::<f64>()
                .map_err(|_| DaqError::InvalidSetting(format!("{parameter}: '{value}' is not a number")))
        };
        let command = match parameter {
            "abs_move" => StageCommand::MoveAbsolute(number()?),
            // Sign of the entered value is kept; `rel_move_neg` flips it.
            "rel_move_neg" => StageCommand::MoveRelative(-number()?),
            "rel_move_pos" => StageCommand::MoveRelative(number()?),
            "vel" => StageCommand::Velocity(number()?),
            "accel" => StageCommand::Acceleration(number()?),
            _ => return Ok(None),
        };
        Ok(Some(command))
    }
}

fn payload(response: &str) -> Option<&str> {
    response.trim().get(3..)
}

fn parse_number(response: &str) -> AppResult<f64> {
    payload(response)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .ok_or_else(|| DaqError::Protocol(format!("unexpected stage response '{response}'")))
}

/// Delay stage driver
pub struct DelayStage<T: Transport> {
    name: String,
    transport: T,
    events: EventSink,
    limits: StageLimits,
    conditions: ConditionMap,
    // None until `1TP?` answers
    position: Option<f64>,
}

impl<T: Transport> DelayStage<T> {
    /// Driver over `transport`; nothing is sent until [`Device::open`]
    pub fn new(name: impl Into<String>, transport: T, limits: StageLimits, events: EventSink) -> Self {
        let mut conditions = ConditionMap::new();
        for key in ["pos", "vel", "accel", "cmd_error", "pos_error", "state"] {
            conditions.insert(key.to_string(), ConditionValue::sentinel());
        }
        Self {
            name: name.into(),
            transport,
            events,
            limits,
            conditions,
            position: None,
        }
    }

    /// Last position the controller reported, if any
    pub fn position(&self) -> Option<f64> {
        self.position
    }

    fn in_range(&self, target: f64) -> AppResult<()> {
        if (self.limits.min_mm..=self.limits.max_mm).contains(&target) {
            Ok(())
        } else {
            Err(DaqError::OutOfRange {
                target,
                min: self.limits.min_mm,
                max: self.limits.max_mm,
            })
        }
    }

    /// Move by `delta`, then confirm the new position from the controller.
    ///
    /// Out-of-range targets and moves from an unconfirmed position are
    /// rejected before any I/O. Every failure is logged; the returned error
    /// is informational only.
    pub async fn move_relative(&mut self, delta: f64) -> AppResult<f64> {
        let result = self.try_move_relative(delta).await;
        if let Err(e) = &result {
            self.events.log(&self.name, format!("Relative move {delta:+.4} rejected: {e}"));
        }
        result
    }

    /// Move to `target` as a relative move from the last confirmed position.
    pub async fn move_absolute(&mut self, target: f64) -> AppResult<f64> {
        if let Err(e) = self.in_range(target) {
            self.events.log(&self.name, format!("Move to {target:.4} rejected: {e}"));
            return Err(e);
        }
        let Some(position) = self.position else {
            let e = DaqError::PositionUnknown;
            self.events.log(&self.name, format!("Move to {target:.4} rejected: {e}"));
            return Err(e);
        };
        self.move_relative(target - position).await
    }

    async fn try_move_relative(&mut self, delta: f64) -> AppResult<f64> {
        let position = self.position.ok_or(DaqError::PositionUnknown)?;
        self.in_range(position + delta)?;

        let estimate = self.estimate_move_time(delta.abs()).await?;
        let travel = Duration::try_from_secs_f64(estimate.max(0.0)).map_err(|_| {
            DaqError::Protocol(format!("move time estimate {estimate} is not a duration"))
        })?;
        let settle = travel + self.transport.settle_time();
        debug!(delta, estimate, "Relative move");
        self.transport.write(&format!("1PR{delta:.4}"), settle).await?;

        self.check_command_error().await;
        self.read_position().await
    }

    async fn estimate_move_time(&mut self, distance: f64) -> AppResult<f64> {
        let response = self.transport.query(&format!("1PT{distance:.4}")).await?;
        parse_number(&response)
    }

    async fn read_position(&mut self) -> AppResult<f64> {
        let response = self.transport.query("1TP?").await?;
        let position = parse_number(&response)?;
        self.position = Some(position);
        self.conditions.insert("pos".to_string(), position.into());
        Ok(position)
    }

    async fn check_command_error(&mut self) {
        let value = match self.transport.query("1TE").await {
            Ok(response) => {
                let code = payload(&response).and_then(|p| p.chars().next());
                match code {
                    Some('@') => command_error('@').unwrap_or_default().into(),
                    Some(code) => {
                        let cause = command_error(code).unwrap_or("Unknown command error.");
                        self.events
                            .log(&self.name, format!("Command error {code}: {cause}"));
                        cause.into()
                    }
                    None => ConditionValue::sentinel(),
                }
            }
            Err(_) => ConditionValue::sentinel(),
        };
        self.conditions.insert("cmd_error".to_string(), value);
    }

    async fn check_positioner_state(&mut self) {
        let response = match self.transport.query("1TS").await {
            Ok(response) => response,
            Err(_) => {
                self.conditions
                    .insert("pos_error".to_string(), ConditionValue::sentinel());
                self.conditions
                    .insert("state".to_string(), ConditionValue::sentinel());
                return;
            }
        };
        let payload = payload(&response).unwrap_or_default();
        let error_field = payload.get(0..4).and_then(|h| u16::from_str_radix(h, 16).ok());
        let state_code = payload.get(4..6);

        let pos_error = match error_field {
            Some(field) => {
                let message = decode_positioner_error(field, self.limits.bit_order);
                if !message.is_empty() {
                    self.events
                        .log(&self.name, format!("Positioner error: {message}"));
                }
                message.into()
            }
            None => ConditionValue::sentinel(),
        };
        let state = match state_code {
            Some(code) => controller_state(code)
                .map(ConditionValue::from)
                .unwrap_or_else(|| format!("Unknown state {code}").into()),
            None => ConditionValue::sentinel(),
        };
        self.conditions.insert("pos_error".to_string(), pos_error);
        self.conditions.insert("state".to_string(), state);
    }

    async fn read_scalar(&mut self, key: &str, query: &str) {
        let value = match self.transport.query(query).await {
            Ok(response) => match parse_number(&response) {
                Ok(v) => v.into(),
                Err(_) => ConditionValue::sentinel(),
            },
            Err(_) => ConditionValue::sentinel(),
        };
        self.conditions.insert(key.to_string(), value);
    }

    async fn execute(&mut self, command: StageCommand) -> AppResult<()> {
        let settle = self.transport.settle_time();
        match command {
            StageCommand::MoveAbsolute(target) => self.move_absolute(target).await.map(|_| ()),
            StageCommand::MoveRelative(delta) => self.move_relative(delta).await.map(|_| ()),
            StageCommand::Velocity(v) => self.transport.write(&format!("1VA{v}"), settle).await,
            StageCommand::Acceleration(a) => self.transport.write(&format!("1AC{a}"), settle).await,
        }
    }
}

#[async_trait]
impl<T: Transport + 'static> Device for DelayStage<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self) -> AppResult<()> {
        self.transport.open().await?;
        self.events
            .log(&self.name, format!("Connected on {}", self.transport.channel()));
        if let Err(e) = self.read_position().await {
            warn!(device = %self.name, error = %e, "Initial position unknown");
        }
        Ok(())
    }

    async fn exit(&mut self) {
        if let Err(e) = self.transport.close().await {
            warn!(device = %self.name, error = %e, "Closing transport failed");
        }
        self.events.log(&self.name, "Disconnected");
    }

    async fn parse_command(&mut self, parameter: &str, value: &str) {
        let command = match StageCommand::from_parameter(parameter, value) {
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
        let is_move = matches!(
            command,
            StageCommand::MoveAbsolute(_) | StageCommand::MoveRelative(_)
        );
        if let Err(e) = self.execute(command).await {
            // Moves log their own failures.
            if !is_move {
                self.events.log(&self.name, format!("{parameter} failed: {e}"));
            }
        }
    }

    async fn refresh_status(&mut self) {
        self.check_command_error().await;
        self.check_positioner_state().await;
        if self.read_position().await.is_err() {
            // The last confirmed position stays usable for moves.
            self.conditions
                .insert("pos".to_string(), ConditionValue::sentinel());
        }
        self.read_scalar("vel", "1VA?").await;
        self.read_scalar("accel", "1AC?").await;
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
    use crate::adapters::MockTransport;
    use crate::instrument::DeviceEvent;

    fn limits() -> StageLimits {
        StageLimits {
            min_mm: -100.0,
            max_mm: 100.0,
            bit_order: BitOrder::MsbFirst,
        }
    }

    fn stage() -> (DelayStage<MockTransport>, MockTransport) {
        let mock = MockTransport::new("COM7");
        (
            DelayStage::new("Delay Stage", mock.clone(), limits(), EventSink::detached()),
            mock,
        )
    }

    #[test]
    fn command_error_table_complete() {
        for (code, cause) in COMMAND_ERRORS {
            assert!(!cause.is_empty(), "{code}");
            assert_eq!(command_error(*code), Some(*cause));
        }
        assert_eq!(command_error('@'), Some("No error"));
        assert_eq!(command_error('Z'), None);
    }

    #[test]
    fn positioner_bits_in_table_order() {
        assert_eq!(decode_positioner_error(0, BitOrder::MsbFirst), "");
        assert_eq!(
            decode_positioner_error(0x0001, BitOrder::MsbFirst),
            "Negative end of run."
        );
        assert_eq!(
            decode_positioner_error(0x0003, BitOrder::MsbFirst),
            "Positive end of run. Negative end of run."
        );
        assert_eq!(
            decode_positioner_error(0x0800 | 0x0400, BitOrder::MsbFirst),
            "Driver overheating. Driver fault."
        );
        assert_eq!(
            decode_positioner_error(0x0001, BitOrder::LsbFirst),
            "Not used."
        );
        assert_eq!(
            decode_positioner_error(0x0010, BitOrder::LsbFirst),
            "Driver overheating."
        );
    }

    #[test]
    fn positioner_decode_matches_set_bits_for_every_field() {
        for field in 0..=u16::MAX {
            for order in [BitOrder::MsbFirst, BitOrder::LsbFirst] {
                let expected: Vec<&str> = (0..16)
                    .filter(|&i| {
                        let bit = if order == BitOrder::MsbFirst { 15 - i } else { i };
                        field & (1 << bit) != 0
                    })
                    .map(|i| POSITIONER_ERRORS[i])
                    .collect();
                assert_eq!(decode_positioner_error(field, order), expected.join(" "));
            }
        }
    }

    #[test]
    fn controller_states() {
        assert_eq!(controller_state("0F"), Some("NOT REFERENCED from MOVING."));
        assert_eq!(controller_state("3d"), Some("DISABLE from MOVING."));
        assert_eq!(controller_state("99"), None);
    }

    #[test]
    fn command_lookup() {
        assert_eq!(
            StageCommand::from_parameter("rel_move_neg", "2.5").unwrap(),
            Some(StageCommand::MoveRelative(-2.5))
        );
        assert_eq!(
            StageCommand::from_parameter("rel_move_pos", "-2.5").unwrap(),
            Some(StageCommand::MoveRelative(-2.5))
        );
        assert_eq!(
            StageCommand::from_parameter("rel_move_neg", "-1").unwrap(),
            Some(StageCommand::MoveRelative(1.0))
        );
        assert!(StageCommand::from_parameter("vel", "fast").is_err());
        assert_eq!(StageCommand::from_parameter("home", "").unwrap(), None);
    }

    #[tokio::test]
    async fn in_range_move_issues_estimate_then_move() {
        let (mut stage, mock) = stage();
        mock.respond("1PT3.0000", "1PT0.5000");
        mock.respond("1TE", "1TE@");
        mock.respond("1TP?", "1TP3.0000");
        mock.respond_once("1TP?", "1TP0.0000");
        stage.open().await.unwrap();
        mock.clear_writes();

        let position = stage.move_relative(3.0).await.unwrap();

        assert_eq!(position, 3.0);
        let commands = mock.commands();
        assert_eq!(&commands[..2], ["1PT3.0000", "1PR3.0000"]);
        assert_eq!(commands.last().map(String::as_str), Some("1TP?"));
        assert_eq!(
            commands.iter().filter(|c| c.starts_with("1P")).count(),
            2
        );

        let settle = mock.writes()[1].settle;
        assert_eq!(settle, Duration::from_millis(600));
    }

    #[tokio::test]
    async fn out_of_range_move_sends_nothing() {
        let (sink, mut rx) = EventSink::channel();
        let mock = MockTransport::new("COM7");
        let mut stage = DelayStage::new("Delay Stage", mock.clone(), limits(), sink);
        mock.respond("1TP?", "1TP99.0000");
        stage.open().await.unwrap();
        mock.clear_writes();
        while rx.try_recv().is_ok() {}

        let err = stage.move_relative(2.0).await.unwrap_err();

        assert!(matches!(err, DaqError::OutOfRange { .. }));
        assert!(mock.writes().is_empty());
        assert_eq!(stage.position(), Some(99.0));
        match rx.try_recv() {
            Ok(DeviceEvent::Log { line, .. }) => assert!(line.contains("rejected")),
            other => panic!("expected rejection log, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn absolute_move_is_relative_from_current() {
        let (mut stage, mock) = stage();
        mock.respond_once("1TP?", "1TP2.0000");
        mock.respond("1TP?", "1TP5.0000");
        mock.respond("1PT3.0000", "1PT0.3000");
        mock.respond("1TE", "1TE@");
        stage.open().await.unwrap();
        assert_eq!(stage.position(), Some(2.0));

        stage.move_absolute(5.0).await.unwrap();

        assert_eq!(mock.count("1PT3.0000"), 1);
        assert_eq!(mock.count("1PR3.0000"), 1);
        assert_eq!(stage.position(), Some(5.0));
    }

    #[tokio::test]
    async fn unconfirmed_position_blocks_moves() {
        let (sink, mut rx) = EventSink::channel();
        let mock = MockTransport::new("COM7");
        let mut stage = DelayStage::new("Delay Stage", mock.clone(), limits(), sink);
        stage.open().await.unwrap();
        assert_eq!(stage.position(), None);
        assert!(stage.conditions()["pos"].is_sentinel());
        mock.clear_writes();
        while rx.try_recv().is_ok() {}

        let err = stage.move_absolute(60.0).await.unwrap_err();
        assert!(matches!(err, DaqError::PositionUnknown));
        let err = stage.move_relative(1.0).await.unwrap_err();
        assert!(matches!(err, DaqError::PositionUnknown));

        assert!(mock.writes().is_empty());
        match rx.try_recv() {
            Ok(DeviceEvent::Log { line, .. }) => assert!(line.contains("rejected")),
            other => panic!("expected rejection log, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn position_survives_a_failed_refresh() {
        let (mut stage, mock) = stage();
        mock.respond_once("1TP?", "1TP4.0000");
        stage.open().await.unwrap();

        stage.refresh_status().await;

        assert!(stage.conditions()["pos"].is_sentinel());
        assert_eq!(stage.position(), Some(4.0));
    }

    #[tokio::test]
    async fn unbounded_move_estimate_is_a_protocol_error() {
        let (mut stage, mock) = stage();
        mock.respond("1TP?", "1TP0.0000");
        mock.respond("1PT1.0000", "1PTinf");
        stage.open().await.unwrap();
        mock.clear_writes();

        let err = stage.move_relative(1.0).await.unwrap_err();

        assert!(matches!(err, DaqError::Protocol(_)));
        assert_eq!(mock.commands(), vec!["1PT1.0000"]);
    }

    #[tokio::test]
    async fn absolute_move_out_of_range_is_rejected() {
        let (mut stage, mock) = stage();
        stage.open().await.unwrap();
        mock.clear_writes();

        assert!(stage.move_absolute(150.0).await.is_err());
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn refresh_decodes_both_error_tiers() {
        let (sink, mut rx) = EventSink::channel();
        let mock = MockTransport::new("COM7");
        let mut stage = DelayStage::new("Delay Stage", mock.clone(), limits(), sink);
        mock.respond("1TE", "1TEC");
        mock.respond("1TS", "1TS000133");
        mock.respond("1TP?", "1TP-1.2500");
        mock.respond("1VA?", "1VA20.0");
        stage.open().await.unwrap();

        stage.refresh_status().await;

        let c = stage.conditions();
        assert_eq!(c["cmd_error"], ConditionValue::from("Parameter missing or out of range."));
        assert_eq!(c["pos_error"], ConditionValue::from("Negative end of run."));
        assert_eq!(c["state"], ConditionValue::from("READY from MOVING."));
        assert_eq!(c["pos"], ConditionValue::Number(-1.25));
        assert_eq!(c["vel"], ConditionValue::Number(20.0));
        assert!(c["accel"].is_sentinel());

        let mut lines = Vec::new();
        while let Ok(DeviceEvent::Log { line, .. }) = rx.try_recv() {
            lines.push(line);
        }
        assert!(lines.iter().any(|l| l.starts_with("Command error C")));
        assert!(lines.iter().any(|l| l == "Positioner error: Negative end of run."));
    }

    #[tokio::test]
    async fn no_error_code_is_silent() {
        let (sink, mut rx) = EventSink::channel();
        let mock = MockTransport::new("COM7");
        let mut stage = DelayStage::new("Delay Stage", mock.clone(), limits(), sink);
        mock.respond("1TE", "1TE@");
        mock.respond("1TS", "1TS000032");
        stage.open().await.unwrap();
        while rx.try_recv().is_ok() {}

        stage.refresh_status().await;

        assert_eq!(stage.conditions()["cmd_error"], ConditionValue::from("No error"));
        assert_eq!(stage.conditions()["pos_error"], ConditionValue::from(""));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unreachable_refresh_is_idempotent() {
        let (mut stage, _mock) = stage();
        stage.refresh_status().await;
        let first = stage.conditions().clone();
        stage.refresh_status().await;

        assert_eq!(&first, stage.conditions());
        assert!(first.values().all(ConditionValue::is_sentinel));
    }

    #[tokio::test]
    async fn velocity_and_acceleration_writes() {
        let (mut stage, mock) = stage();
        stage.open().await.unwrap();
        mock.clear_writes();

        stage.parse_command("vel", "15").await;
        stage.parse_command("accel", "40.5").await;

        assert_eq!(mock.commands(), vec!["1VA15", "1AC40.5"]);
    }
}
