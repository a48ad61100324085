//! Defines types related to devices.

mod id;
pub use id::DeviceId;

mod value;
pub use value::{DeviceType, Value, MAX_FAN_SPEED};
