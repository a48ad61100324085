//! The state calculator.
//!
//! Recomputes the desired state of one device from its inputs: the
//! user intent, the resolved override, the fail-safe defaults of its
//! functional system, and the verdict of the safety rule chain. The
//! core task re-runs this whenever any of those inputs change. The
//! computation itself never suspends; only the store reads and the
//! final write do.

use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use twin_api::{
    types::{
        device::{DeviceId, DeviceType, Value},
        twin::{DesiredState, SourceCategory, TwinSnapshot},
    },
    Result,
};

use crate::{
    events::Event,
    safety::{Registry, TemperatureReading, Verdict},
    store::Store,
};

pub mod resolve;

/// What a recalculation did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Nothing to do: the device is a sensor, has no type yet, or no
    /// layer proposed a value.
    Skipped,

    /// The chain accepted a value equal to the current desired
    /// state; nothing was written.
    Unchanged { value: Value, modified_by: Option<String> },

    /// A new desired state was written and announced.
    Updated {
        state: DesiredState,
        modified_by: Option<String>,
    },

    /// A rule refused the proposal; the prior desired state stands.
    Refused { rule: String, reason: String },
}

// The device type is whatever the stored records say it is. A device
// nobody has written to yet has no type and nothing to reconcile.

pub(crate) fn device_type_of(snapshot: &TwinSnapshot) -> Option<DeviceType> {
    snapshot
        .intent
        .as_ref()
        .map(|v| v.device_type)
        .or_else(|| snapshot.desired.as_ref().map(|v| v.device_type))
        .or_else(|| snapshot.reported.as_ref().map(|v| v.device_type))
}

fn converged(desired: Option<&DesiredState>, snap: &TwinSnapshot) -> bool {
    TwinSnapshot {
        desired: desired.cloned(),
        reported: snap.reported.clone(),
        intent: None,
    }
    .is_converged()
}

/// Recomputes the desired state for `id`, writing and announcing the
/// result when it changed. Also publishes the intent disposition
/// events (`IntentModified` / `IntentRejected`) that fall out of the
/// rule chain.
pub async fn recalculate(
    store: &mut (dyn Store + Send + Sync),
    rules: &Registry,
    ambient: &HashMap<DeviceId, TemperatureReading>,
    bus: &broadcast::Sender<Event>,
    id: &DeviceId,
) -> Result<Outcome> {
    let snapshot = store.twin_snapshot(id).await?;

    let Some(device_type) = device_type_of(&snapshot) else {
        return Ok(Outcome::Skipped);
    };

    // Sensors are inputs; they never get a desired state.

    if !device_type.is_output() {
        return Ok(Outcome::Skipped);
    }

    let system = store.system_of(id).await?;

    // Collect the twins of the other system members; rules relate
    // devices through their shared system.

    let mut related = HashMap::new();

    if let Some(ref sys) = system {
        for member in &sys.devices {
            if member != id {
                related
                    .insert(member.clone(), store.twin_snapshot(member).await?);
            }
        }
    }

    let resolved = resolve::resolve(&*store, id, system.as_ref()).await?;

    // Pick the candidate value: override, then intent, then the
    // system's fail-safe default. A layer whose value doesn't fit the
    // device type is skipped with a complaint; a system-wide override
    // can legitimately cover members of several types.

    let mut candidates: Vec<(Value, SourceCategory, String)> = vec![];

    if let Some(ref ov) = resolved {
        candidates.push((ov.value, ov.category.into(), ov.reason.clone()))
    }
    if let Some(ref intent) = snapshot.intent {
        candidates.push((
            intent.value,
            SourceCategory::UserIntent,
            format!("requested by {}", intent.requested_by),
        ))
    }
    if let Some(ref sys) = system {
        if let Some(v) = sys.fail_safe_default(device_type) {
            candidates.push((
                v,
                SourceCategory::UserIntent,
                format!("fail-safe default of system {}", sys.id),
            ))
        }
    }

    let candidate = candidates.into_iter().find(|(v, source, _)| {
        let fits = v.validate_for(device_type).is_ok();

        if !fits {
            warn!(
                "{} candidate for {} doesn't fit a {} device",
                source, id, device_type
            )
        }
        fits
    });

    let Some((proposed, source, reason)) = candidate else {
        return Ok(Outcome::Skipped);
    };

    match rules.evaluate(id, device_type, proposed, &related, ambient) {
        Verdict::Refused { rule, reason, .. } => {
            let _ = bus.send(Event::IntentRejected {
                id: id.clone(),
                proposed,
                rule: rule.clone(),
                reason: reason.clone(),
            });
            Ok(Outcome::Refused { rule, reason })
        }

        Verdict::Accepted {
            value,
            modifications,
        } => {
            let modified_by = modifications.last().map(|m| m.rule.clone());
            let reason = modifications
                .last()
                .map(|m| m.reason.clone())
                .unwrap_or(reason);

            if !modifications.is_empty() {
                let _ = bus.send(Event::IntentModified {
                    id: id.clone(),
                    proposed,
                    applied: value,
                    rule: modified_by.clone().unwrap(),
                });
            }

            if snapshot.desired.as_ref().map(|d| d.value) == Some(value) {
                debug!("desired of {} already {}", id, value);
                return Ok(Outcome::Unchanged { value, modified_by });
            }

            let state = DesiredState {
                id: id.clone(),
                device_type,
                value,
                reason,
                calculated_at: Utc::now(),
                source,
            };

            let was_converged =
                converged(snapshot.desired.as_ref(), &snapshot);

            store.save_desired(state.clone()).await?;

            let _ = bus.send(Event::DesiredCalculated {
                id: id.clone(),
                value,
            });

            let now_converged = converged(Some(&state), &snapshot);

            if was_converged != now_converged {
                let _ = bus.send(if now_converged {
                    Event::Converged { id: id.clone() }
                } else {
                    Event::Diverged { id: id.clone() }
                });
            }

            Ok(Outcome::Updated { state, modified_by })
        }
    }
}
