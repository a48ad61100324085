//! The device wire contract.
//!
//! Commands and telemetry travel over a topic-based message bus whose
//! routing keys look like `.{controller}.{handler}.{component}.{suffix}`
//! (the leading dot is literal). This module owns both directions:
//! encoding outbound `DeviceCommand`s and parsing inbound `state`
//! messages, including the duplicate suppression applied before
//! anything reaches the core. The bus transport itself lives outside
//! this process; it hands us `RawMessage` values and consumes the
//! encoded commands.

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde_derive::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::convert::Infallible;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use twin_api::{
    service,
    types::{
        device::{DeviceId, DeviceType, Value, MAX_FAN_SPEED},
        twin::ReportedState,
        Error,
    },
    Result,
};

const HANDLER_RELAY: &str = "digital_output";
const HANDLER_FAN: &str = "fan";
const TEMPERATURE_HANDLERS: [&str; 2] = ["ds18b20", "thermocouple"];

// Bound on the recently-seen message ids kept for duplicate
// suppression.

const DEDUP_CAPACITY: usize = 1_024;

/// An outbound setting for one device, ready to be encoded onto the
/// message bus.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCommand {
    pub id: DeviceId,
    pub device_type: DeviceType,
    pub value: Value,
}

#[derive(Serialize)]
struct RelayPayload<'a> {
    state: &'a str,
}

impl DeviceCommand {
    /// The topic the command is published under.
    pub fn routing_key(&self) -> String {
        let handler = match self.device_type {
            DeviceType::Fan => HANDLER_FAN,
            _ => HANDLER_RELAY,
        };

        format!(
            ".{}.{}.{}.set",
            self.id.controller(),
            handler,
            self.id.component()
        )
    }

    /// The raw payload. Relays take a tiny JSON document; fans take
    /// the bare ASCII speed.
    pub fn payload(&self) -> String {
        match self.value {
            Value::Relay(v) => {
                let body = RelayPayload {
                    state: if v { "1" } else { "0" },
                };

                // The payload is two fixed tokens; serializing it
                // can't fail.

                serde_json::to_string(&body).unwrap_or_default()
            }
            Value::Fan(v) => format!("{}", v),
        }
    }
}

/// One message lifted off the bus by the transport.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub routing_key: String,
    pub message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: String,
}

/// A successfully parsed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// An actuator confirmed its state.
    Actuator(ReportedState),

    /// A temperature sensor reported. A payload that didn't parse
    /// still produces a reading, flagged as an error with a NaN
    /// value.
    Temperature {
        id: DeviceId,
        celsius: f64,
        is_error: bool,
    },
}

// Parses digital-output feedback. The firmware is sloppy about
// formatting, so the match is case-insensitive and tolerant of
// whitespace.

fn parse_relay_feedback(payload: &str) -> Option<bool> {
    let s = payload.trim();

    if s == "0" || s.eq_ignore_ascii_case("low") {
        Some(false)
    } else if s == "1" || s.eq_ignore_ascii_case("high") {
        Some(true)
    } else {
        None
    }
}

fn parse_fan_feedback(payload: &str) -> Option<u8> {
    payload
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|v| (0..=i64::from(MAX_FAN_SPEED)).contains(v))
        .map(|v| v as u8)
}

/// Decodes an inbound bus message. `Ok(None)` means the message is
/// not ours to handle (an unknown handler, or a `set` echo); an
/// `Err` means a message we should have understood was malformed and
/// must be dropped.
pub fn parse_inbound(msg: &RawMessage) -> Result<Option<Inbound>> {
    let key = msg.routing_key.strip_prefix('.').ok_or_else(|| {
        Error::ParseError(format!(
            "routing key '{}' is missing its leading dot",
            &msg.routing_key
        ))
    })?;

    let parts: Vec<&str> = key.split('.').collect();

    let &[ctrl, handler, comp, suffix] = parts.as_slice() else {
        return Err(Error::ParseError(format!(
            "routing key '{}' doesn't have four segments",
            &msg.routing_key
        )));
    };

    if suffix != "state" {
        return Ok(None);
    }

    let id = DeviceId::create(ctrl, comp)?;

    match handler {
        HANDLER_RELAY => match parse_relay_feedback(&msg.payload) {
            Some(v) => Ok(Some(Inbound::Actuator(ReportedState {
                id,
                device_type: DeviceType::Relay,
                value: Value::Relay(v),
                received_at: msg.timestamp,
                is_known: true,
            }))),
            None => Err(Error::ParseError(format!(
                "unknown relay state '{}'",
                msg.payload.trim()
            ))),
        },

        HANDLER_FAN => match parse_fan_feedback(&msg.payload) {
            Some(v) => Ok(Some(Inbound::Actuator(ReportedState {
                id,
                device_type: DeviceType::Fan,
                value: Value::Fan(v),
                received_at: msg.timestamp,
                is_known: true,
            }))),
            None => Err(Error::ParseError(format!(
                "unknown fan state '{}'",
                msg.payload.trim()
            ))),
        },

        h if TEMPERATURE_HANDLERS.contains(&h) => {
            // Temperature payloads are decimal, possibly negative. A
            // garbled one is still reported so the sensor shows up as
            // broken instead of silent.

            match msg.payload.trim().parse::<f64>() {
                Ok(v) => Ok(Some(Inbound::Temperature {
                    id,
                    celsius: v,
                    is_error: false,
                })),
                Err(_) => Ok(Some(Inbound::Temperature {
                    id,
                    celsius: f64::NAN,
                    is_error: true,
                })),
            }
        }

        _ => Ok(None),
    }
}

// The identity of a message for duplicate suppression: its bus id
// when it has one, otherwise a hash over the content.

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MessageKey {
    Id(String),
    Content(u64),
}

impl MessageKey {
    fn of(msg: &RawMessage) -> MessageKey {
        match &msg.message_id {
            Some(id) => MessageKey::Id(id.clone()),
            None => {
                let mut h = DefaultHasher::new();

                msg.routing_key.hash(&mut h);
                msg.timestamp.timestamp_micros().hash(&mut h);
                msg.payload.hash(&mut h);
                MessageKey::Content(h.finish())
            }
        }
    }
}

/// A bounded memory of recently seen messages. Telemetry buses
/// redeliver; the twin must not re-publish events for a message it
/// already processed.
pub struct Dedup {
    seen: LruCache<MessageKey, ()>,
}

impl Dedup {
    pub fn new() -> Dedup {
        Dedup {
            seen: LruCache::new(
                NonZeroUsize::new(DEDUP_CAPACITY).unwrap(),
            ),
        }
    }

    /// Returns `true` the first time a message is seen.
    pub fn is_fresh(&mut self, msg: &RawMessage) -> bool {
        self.seen.put(MessageKey::of(msg), ()).is_none()
    }
}

impl Default for Dedup {
    fn default() -> Self {
        Dedup::new()
    }
}

/// The telemetry ingest task. Drains the transport's channel,
/// suppresses duplicates, parses, and forwards the result to the
/// core. Malformed messages are dropped and counted; the task itself
/// only ends when the transport goes away.
pub async fn ingest(
    mut rx: mpsc::Receiver<RawMessage>,
    chan: service::RequestChan,
) -> Result<Infallible> {
    let mut dedup = Dedup::new();
    let mut dropped: u64 = 0;
    let mut duplicates: u64 = 0;

    info!("starting");

    while let Some(msg) = rx.recv().await {
        if !dedup.is_fresh(&msg) {
            duplicates += 1;
            debug!(
                "duplicate message on '{}' ({} so far)",
                &msg.routing_key, duplicates
            );
            continue;
        }

        match parse_inbound(&msg) {
            Ok(Some(Inbound::Actuator(state))) => {
                chan.report_state(state).await?
            }

            Ok(Some(Inbound::Temperature {
                id,
                celsius,
                is_error,
            })) => chan.report_temperature(id, celsius, is_error).await?,

            Ok(None) => (),

            Err(e) => {
                dropped += 1;
                warn!(
                    "dropping message on '{}': {} ({} so far)",
                    &msg.routing_key, &e, dropped
                )
            }
        }
    }

    Err(Error::MissingPeer(String::from("transport closed")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(key: &str, payload: &str) -> RawMessage {
        RawMessage {
            routing_key: String::from(key),
            message_id: None,
            timestamp: Utc::now(),
            payload: String::from(payload),
        }
    }

    #[test]
    fn test_command_encoding() {
        let cmd = DeviceCommand {
            id: "c1:r1".parse().unwrap(),
            device_type: DeviceType::Relay,
            value: Value::Relay(true),
        };

        assert_eq!(cmd.routing_key(), ".c1.digital_output.r1.set");
        assert_eq!(cmd.payload(), "{\"state\":\"1\"}");

        let cmd = DeviceCommand {
            value: Value::Relay(false),
            ..cmd
        };

        assert_eq!(cmd.payload(), "{\"state\":\"0\"}");

        let cmd = DeviceCommand {
            id: "c1:f1".parse().unwrap(),
            device_type: DeviceType::Fan,
            value: Value::Fan(0),
        };

        assert_eq!(cmd.routing_key(), ".c1.fan.f1.set");
        assert_eq!(cmd.payload(), "0");

        let cmd = DeviceCommand {
            value: Value::Fan(4),
            ..cmd
        };

        assert_eq!(cmd.payload(), "4");
    }

    #[test]
    fn test_relay_feedback() {
        let expect = |payload, value: Value| {
            match parse_inbound(&msg(".c1.digital_output.r1.state", payload))
            {
                Ok(Some(Inbound::Actuator(state))) => {
                    assert_eq!(state.value, value);
                    assert_eq!(state.device_type, DeviceType::Relay);
                    assert!(state.is_known);
                }
                v => panic!("'{}' parsed to {:?}", payload, v),
            }
        };

        expect("0", Value::Relay(false));
        expect("1", Value::Relay(true));
        expect("LOW", Value::Relay(false));
        expect("HIGH", Value::Relay(true));
        expect("high", Value::Relay(true));
        expect("  High\n", Value::Relay(true));
        expect(" low ", Value::Relay(false));

        assert!(
            parse_inbound(&msg(".c1.digital_output.r1.state", "2")).is_err()
        );
        assert!(
            parse_inbound(&msg(".c1.digital_output.r1.state", "on")).is_err()
        );
    }

    #[test]
    fn test_fan_feedback() {
        for speed in 0..=4u8 {
            match parse_inbound(&msg(
                ".c1.fan.f1.state",
                &format!("{}", speed),
            )) {
                Ok(Some(Inbound::Actuator(state))) => {
                    assert_eq!(state.value, Value::Fan(speed))
                }
                v => panic!("speed {} parsed to {:?}", speed, v),
            }
        }

        assert!(parse_inbound(&msg(".c1.fan.f1.state", "5")).is_err());
        assert!(parse_inbound(&msg(".c1.fan.f1.state", "-1")).is_err());
        assert!(parse_inbound(&msg(".c1.fan.f1.state", "fast")).is_err());
    }

    #[test]
    fn test_temperature_feedback() {
        match parse_inbound(&msg(".c1.ds18b20.attic.state", "-12.5")) {
            Ok(Some(Inbound::Temperature {
                celsius, is_error, ..
            })) => {
                assert_eq!(celsius, -12.5);
                assert!(!is_error);
            }
            v => panic!("parsed to {:?}", v),
        }

        match parse_inbound(&msg(".c1.thermocouple.kiln.state", "garbage")) {
            Ok(Some(Inbound::Temperature {
                celsius, is_error, ..
            })) => {
                assert!(celsius.is_nan());
                assert!(is_error);
            }
            v => panic!("parsed to {:?}", v),
        }
    }

    #[test]
    fn test_foreign_messages_are_ignored() {
        // A `set` echo is not feedback.

        assert_eq!(
            parse_inbound(&msg(".c1.digital_output.r1.set", "1")).unwrap(),
            None
        );

        // Unknown handlers are someone else's traffic.

        assert_eq!(
            parse_inbound(&msg(".c1.pwm.x1.state", "1")).unwrap(),
            None
        );

        // Structurally broken keys are errors.

        assert!(parse_inbound(&msg("c1.fan.f1.state", "1")).is_err());
        assert!(parse_inbound(&msg(".c1.fan.state", "1")).is_err());
    }

    #[test]
    fn test_dedup() {
        let mut dedup = Dedup::new();

        let mut first = msg(".c1.fan.f1.state", "3");

        first.message_id = Some(String::from("m-1"));

        assert!(dedup.is_fresh(&first));
        assert!(!dedup.is_fresh(&first));

        // Without a message id, identity falls back to the content.

        let second = msg(".c1.fan.f1.state", "3");

        assert!(dedup.is_fresh(&second));
        assert!(!dedup.is_fresh(&second));

        let mut third = second.clone();

        third.payload = String::from("2");
        assert!(dedup.is_fresh(&third));
    }
}
