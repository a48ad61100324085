use crate::{types::Error, Result};
use serde_derive::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt, str::FromStr};

/// The highest speed a fan accepts. Speed 0 means the fan is off.
pub const MAX_FAN_SPEED: u8 = 4;

/// Classifies the devices twind manages. Every twin record carries
/// the type of its device and only accepts values of the matching
/// type. Temperature sensors are input-only; they never accept an
/// intent and never get a desired state.

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    Relay,
    Fan,
    TemperatureSensor,
}

impl DeviceType {
    /// Returns `true` for types that accept commands. Only output
    /// devices are subject to reconciliation.
    pub fn is_output(&self) -> bool {
        !matches!(self, DeviceType::TemperatureSensor)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Relay => write!(f, "RELAY"),
            DeviceType::Fan => write!(f, "FAN"),
            DeviceType::TemperatureSensor => write!(f, "TEMPERATURE_SENSOR"),
        }
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "RELAY" => Ok(DeviceType::Relay),
            "FAN" => Ok(DeviceType::Fan),
            "TEMPERATURE_SENSOR" => Ok(DeviceType::TemperatureSensor),
            _ => {
                Err(Error::ParseError(format!("unknown device type '{}'", s)))
            }
        }
    }
}

/// Defines the values that can be associated with an output device.
/// The variant must always agree with the device's registered type.
/// Use the checked constructors when the input comes from outside the
/// process; they are the single place where the value domain is
/// enforced.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Value {
    /// The state of a relay: energized or not.
    Relay(bool),

    /// A fan speed between 0 and [`MAX_FAN_SPEED`], inclusive.
    Fan(u8),
}

impl Value {
    /// Builds a fan speed value, refusing anything outside the legal
    /// 0..=4 domain.
    pub fn fan(speed: u8) -> Result<Self> {
        if speed <= MAX_FAN_SPEED {
            Ok(Value::Fan(speed))
        } else {
            Err(Error::InvArgument(format!(
                "fan speed {} exceeds {}",
                speed, MAX_FAN_SPEED
            )))
        }
    }

    /// The device type this value is compatible with.
    pub fn device_type(&self) -> DeviceType {
        match self {
            Value::Relay(_) => DeviceType::Relay,
            Value::Fan(_) => DeviceType::Fan,
        }
    }

    /// Verifies the value is usable for a device of type `dt`: the
    /// variant matches and the payload is within its domain. All
    /// ingress paths funnel through this check.
    pub fn validate_for(&self, dt: DeviceType) -> Result<()> {
        if self.device_type() != dt {
            return Err(Error::TypeError);
        }
        match self {
            Value::Fan(speed) if *speed > MAX_FAN_SPEED => {
                Err(Error::InvArgument(format!(
                    "fan speed {} exceeds {}",
                    speed, MAX_FAN_SPEED
                )))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Relay(v) => write!(f, "{}", v),
            Value::Fan(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Relay(value)
    }
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        if let Value::Relay(v) = value {
            Ok(v)
        } else {
            Err(Error::TypeError)
        }
    }
}

impl TryFrom<Value> for u8 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        if let Value::Fan(v) = value {
            Ok(v)
        } else {
            Err(Error::TypeError)
        }
    }
}

// Used when pulling values out of `[[rule]]` or `[[system]]` config
// sections. The target device type selects how the TOML value is
// interpreted, so a relay default must be a boolean and a fan default
// an in-range integer.

impl Value {
    pub fn from_config(
        dt: DeviceType,
        value: &toml::value::Value,
    ) -> Result<Self> {
        match (dt, value) {
            (DeviceType::Relay, toml::value::Value::Boolean(v)) => {
                Ok(Value::Relay(*v))
            }
            (DeviceType::Fan, toml::value::Value::Integer(v)) => {
                u8::try_from(*v)
                    .map_err(|_| Error::TypeError)
                    .and_then(Value::fan)
            }
            (DeviceType::TemperatureSensor, _) => Err(Error::TypeError),
            _ => Err(Error::TypeError),
        }
    }
}
