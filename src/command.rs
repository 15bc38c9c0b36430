//! Device command payloads
//!
//! Commands travel as JSON objects on `comando/{device_id}`:
//!
//! ```text
//! { "command": "LIGAR" }
//! { "command": "TEMPERATURA", "value": 23 }
//! { "command": "MODO_OPERACAO", "value": "REFRIGERAR" }
//! { "command": "VELOCIDADE", "value": "ALTA" }
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_SETPOINT: u8 = 16;
pub const MAX_SETPOINT: u8 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Setpoint outside the range the units accept
    #[error("temperature {0} is outside 16..=30")]
    TemperatureOutOfRange(i64),

    #[error("'{0}' is not a temperature")]
    InvalidTemperature(String),

    #[error("unknown operation mode '{0}'")]
    UnknownMode(String),

    #[error("unknown fan speed '{0}'")]
    UnknownFanSpeed(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// The command needs a value and none was given
    #[error("command '{0}' requires a value")]
    MissingValue(String),
}

/// Temperature setpoint in degrees Celsius, always within 16..=30
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct Setpoint(u8);

impl Setpoint {
    pub fn new(celsius: i64) -> Result<Self, CommandError> {
        Self::try_from(celsius)
    }

    pub fn celsius(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Setpoint {
    type Error = CommandError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if (i64::from(MIN_SETPOINT)..=i64::from(MAX_SETPOINT)).contains(&value) {
            // range check above guarantees the value fits
            Ok(Setpoint(value as u8))
        } else {
            Err(CommandError::TemperatureOutOfRange(value))
        }
    }
}

impl From<Setpoint> for u8 {
    fn from(setpoint: Setpoint) -> Self {
        setpoint.0
    }
}

impl fmt::Display for Setpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°C", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationMode {
    #[serde(rename = "REFRIGERAR")]
    Cool,
    #[serde(rename = "VENTILAR")]
    Fan,
    #[serde(rename = "AUTOMATICO")]
    Auto,
    #[serde(rename = "DESUMIDIFICAR")]
    Dry,
}

impl OperationMode {
    pub const ALL: [OperationMode; 4] = [Self::Cool, Self::Fan, Self::Auto, Self::Dry];

    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Cool => "REFRIGERAR",
            Self::Fan => "VENTILAR",
            Self::Auto => "AUTOMATICO",
            Self::Dry => "DESUMIDIFICAR",
        }
    }
}

impl FromStr for OperationMode {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.wire_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| CommandError::UnknownMode(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanSpeed {
    #[serde(rename = "BAIXA")]
    Low,
    #[serde(rename = "MEDIA")]
    Medium,
    #[serde(rename = "ALTA")]
    High,
    #[serde(rename = "AUTOMATICO")]
    Auto,
}

impl FanSpeed {
    pub const ALL: [FanSpeed; 4] = [Self::Low, Self::Medium, Self::High, Self::Auto];

    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Low => "BAIXA",
            Self::Medium => "MEDIA",
            Self::High => "ALTA",
            Self::Auto => "AUTOMATICO",
        }
    }
}

impl FromStr for FanSpeed {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|speed| speed.wire_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| CommandError::UnknownFanSpeed(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "value")]
pub enum DeviceCommand {
    #[serde(rename = "LIGAR")]
    PowerOn,
    #[serde(rename = "DESLIGAR")]
    PowerOff,
    #[serde(rename = "TEMPERATURA")]
    Temperature(Setpoint),
    #[serde(rename = "MODO_OPERACAO")]
    Mode(OperationMode),
    #[serde(rename = "VELOCIDADE")]
    FanSpeed(FanSpeed),
}

impl DeviceCommand {
    /// Builds a command from its wire name and optional textual value,
    /// e.g. `("TEMPERATURA", Some("23"))`
    pub fn parse(command: &str, value: Option<&str>) -> Result<Self, CommandError> {
        let require = || value.ok_or_else(|| CommandError::MissingValue(command.to_string()));

        match command.to_ascii_uppercase().as_str() {
            "LIGAR" => Ok(Self::PowerOn),
            "DESLIGAR" => Ok(Self::PowerOff),
            "TEMPERATURA" => {
                let raw = require()?;
                let celsius = raw
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| CommandError::InvalidTemperature(raw.to_string()))?;
                Ok(Self::Temperature(Setpoint::new(celsius)?))
            }
            "MODO_OPERACAO" => Ok(Self::Mode(require()?.parse()?)),
            "VELOCIDADE" => Ok(Self::FanSpeed(require()?.parse()?)),
            _ => Err(CommandError::UnknownCommand(command.to_string())),
        }
    }
}

/// Parses `LIGAR`, `TEMPERATURA=23`, `MODO_OPERACAO=VENTILAR`, ...
impl FromStr for DeviceCommand {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((command, value)) => Self::parse(command.trim(), Some(value)),
            None => Self::parse(s.trim(), None),
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PowerOn => f.write_str("LIGAR"),
            Self::PowerOff => f.write_str("DESLIGAR"),
            Self::Temperature(setpoint) => write!(f, "TEMPERATURA={}", setpoint.celsius()),
            Self::Mode(mode) => write!(f, "MODO_OPERACAO={}", mode.wire_name()),
            Self::FanSpeed(speed) => write!(f, "VELOCIDADE={}", speed.wire_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payloads_match_device_schema() {
        let cases = [
            (DeviceCommand::PowerOn, json!({ "command": "LIGAR" })),
            (DeviceCommand::PowerOff, json!({ "command": "DESLIGAR" })),
            (
                DeviceCommand::Temperature(Setpoint::new(23).unwrap()),
                json!({ "command": "TEMPERATURA", "value": 23 }),
            ),
            (
                DeviceCommand::Mode(OperationMode::Dry),
                json!({ "command": "MODO_OPERACAO", "value": "DESUMIDIFICAR" }),
            ),
            (
                DeviceCommand::FanSpeed(FanSpeed::Auto),
                json!({ "command": "VELOCIDADE", "value": "AUTOMATICO" }),
            ),
        ];
        for (command, expected) in cases {
            assert_eq!(serde_json::to_value(command).unwrap(), expected);
        }
    }

    #[test]
    fn setpoint_bounds_are_inclusive() {
        assert!(Setpoint::new(16).is_ok());
        assert!(Setpoint::new(30).is_ok());
        assert_eq!(Setpoint::new(15), Err(CommandError::TemperatureOutOfRange(15)));
        assert_eq!(Setpoint::new(31), Err(CommandError::TemperatureOutOfRange(31)));
    }

    #[test]
    fn out_of_range_payloads_are_rejected_on_decode() {
        let decoded: Result<DeviceCommand, _> =
            serde_json::from_value(json!({ "command": "TEMPERATURA", "value": 40 }));
        assert!(decoded.is_err());

        let decoded: DeviceCommand =
            serde_json::from_value(json!({ "command": "VELOCIDADE", "value": "BAIXA" })).unwrap();
        assert_eq!(decoded, DeviceCommand::FanSpeed(FanSpeed::Low));
    }

    #[test]
    fn commands_parse_from_text() {
        assert_eq!("ligar".parse::<DeviceCommand>(), Ok(DeviceCommand::PowerOn));
        assert_eq!(
            "TEMPERATURA=18".parse::<DeviceCommand>(),
            Ok(DeviceCommand::Temperature(Setpoint::new(18).unwrap()))
        );
        assert_eq!(
            "MODO_OPERACAO=ventilar".parse::<DeviceCommand>(),
            Ok(DeviceCommand::Mode(OperationMode::Fan))
        );
        assert_eq!(
            "VELOCIDADE=TURBO".parse::<DeviceCommand>(),
            Err(CommandError::UnknownFanSpeed("TURBO".into()))
        );
        assert_eq!(
            "TEMPERATURA".parse::<DeviceCommand>(),
            Err(CommandError::MissingValue("TEMPERATURA".into()))
        );
        assert!(matches!(
            "REINICIAR".parse::<DeviceCommand>(),
            Err(CommandError::UnknownCommand(_))
        ));
    }

    #[test]
    fn display_round_trips_through_parse() {
        let command = DeviceCommand::Mode(OperationMode::Auto);
        assert_eq!(command.to_string().parse::<DeviceCommand>(), Ok(command));
        assert_eq!(
            "TEMPERATURA=quente".parse::<DeviceCommand>(),
            Err(CommandError::InvalidTemperature("quente".into()))
        );
    }
}
