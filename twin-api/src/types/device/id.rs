//! Defines and enforces device addressing requirements.
//!
//! Every device managed by `twind` is addressed by a pair of
//! segments: the id of the controller that hosts it and the id of the
//! component on that controller. The textual form, used by the REST
//! surface and in log output, is `controller:component`. The wire
//! protocol places the same two segments into its routing keys, so a
//! segment consists of one or more UTF-8 alphanumeric, dash, or
//! underscore characters and never contains a dot or a colon.
use crate::{types::Error, Result};
use serde_derive::Deserialize;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Deserialize, Hash, Eq, PartialOrd, Ord)]
struct Segment(String);

impl Segment {
    // Returns `true` if the character can be used in a segment of a
    // device id.

    fn is_valid_char((idx, ch): (usize, char), len: usize) -> bool {
        ch.is_alphanumeric()
            || (ch == '_' && idx != 0 && idx != len - 1)
            || (ch == '-' && idx != 0 && idx != len - 1)
    }

    // Creates a `Segment`, if the string contains a well-formed
    // segment name.

    fn create(s: &str) -> Result<Self> {
        if !s.is_empty() {
            if s.chars()
                .enumerate()
                .all(|v| Segment::is_valid_char(v, s.chars().count()))
            {
                Ok(Segment(String::from(s)))
            } else {
                Err(Error::InvArgument(String::from(
                    "segment contains invalid character",
                )))
            }
        } else {
            Err(Error::InvArgument(String::from(
                "contains zero-length segment",
            )))
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0)
    }
}

/// Addresses one device: the controller that hosts it and the
/// component on that controller.
#[derive(Debug, PartialEq, Clone, Deserialize, Hash, Eq, PartialOrd, Ord)]
#[serde(try_from = "String")]
pub struct DeviceId {
    controller: Segment,
    component: Segment,
}

impl DeviceId {
    /// Creates a `DeviceId` from its two segments. If either segment
    /// contains an invalid character, an `Err()` is returned.
    pub fn create(controller: &str, component: &str) -> Result<Self> {
        Ok(DeviceId {
            controller: Segment::create(controller)?,
            component: Segment::create(component)?,
        })
    }

    /// The id of the controller hosting the device.
    pub fn controller(&self) -> &str {
        &self.controller.0
    }

    /// The id of the component on the controller.
    pub fn component(&self) -> &str {
        &self.component.0
    }
}

// This trait is defined so that the .TOML parser and the REST surface
// can use the `controller:component` form directly.

impl TryFrom<String> for DeviceId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

// This trait allows one to use `.parse::<DeviceId>()`.

impl FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((ctrl, comp)) => DeviceId::create(ctrl, comp),
            None => Err(Error::InvArgument(String::from(
                "device id needs a 'controller:component' form",
            ))),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", &self.controller, &self.component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_validation() {
        assert!(Segment::create("").is_err());
        assert!(Segment::create("a:b").is_err());
        assert!(Segment::create("a.b").is_err());
        assert!(Segment::create("_abc").is_err());
        assert!(Segment::create("abc_").is_err());
        assert!(Segment::create("-abc").is_err());
        assert!(Segment::create("abc-").is_err());

        assert!(Segment::create("r1").is_ok());
        assert!(Segment::create("fire_main").is_ok());
        assert!(Segment::create("aux-pump").is_ok());
    }

    #[test]
    fn test_device_id_parsing() {
        assert!("".parse::<DeviceId>().is_err());
        assert!("c1".parse::<DeviceId>().is_err());
        assert!(":r1".parse::<DeviceId>().is_err());
        assert!("c1:".parse::<DeviceId>().is_err());
        assert!("c1:r1:x".parse::<DeviceId>().is_err());
        assert!("c.1:r1".parse::<DeviceId>().is_err());

        let id = "c1:fire_main".parse::<DeviceId>().unwrap();

        assert_eq!(id.controller(), "c1");
        assert_eq!(id.component(), "fire_main");
        assert_eq!(format!("{}", id), "c1:fire_main");
        assert_eq!(id, DeviceId::create("c1", "fire_main").unwrap());
    }
}
