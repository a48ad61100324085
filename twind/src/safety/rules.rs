//! The rules themselves: the hardcoded safety tier plus the builders
//! for configuration-driven rules.
//!
//! Hardcoded rules are compiled in and always load. Rules from
//! `[[rule]]` config sections are built best-effort: a bad section is
//! logged and dropped so that a broken configuration can never
//! disable the hardcoded safety tier.

use super::{
    pattern::Pattern, RuleCategory, SafetyContext, SafetyRule,
    ValidationResult,
};
use crate::config::{RuleDef, RuleKindDef};
use tracing::error;
use twin_api::{
    types::{
        device::{DeviceType, Value},
        Error,
    },
    Result,
};

// While a fire device is being driven, its pump must not be switched
// off. The relation is by component naming convention.

const PUMP_PATTERN: &str = "*pump*";
const FIRE_PATTERN: &str = "fire*";

/// Refuses to let a pump relay drop out while a related fire device
/// is desired active; the proposal is rewritten back to ON.
pub struct FirePumpInterlock {
    pump: Pattern,
    fire: Pattern,
}

impl FirePumpInterlock {
    pub fn new() -> FirePumpInterlock {
        FirePumpInterlock {
            pump: Pattern::create(PUMP_PATTERN),
            fire: Pattern::create(FIRE_PATTERN),
        }
    }
}

impl SafetyRule for FirePumpInterlock {
    fn id(&self) -> &str {
        "fire-pump-interlock"
    }

    fn name(&self) -> &str {
        "Fire-pump interlock"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::HardcodedSafety
    }

    fn priority(&self) -> i32 {
        100
    }

    fn applies_to(&self, ctx: &SafetyContext) -> bool {
        ctx.device_type == DeviceType::Relay
            && self.pump.matches(ctx.id.component())
            && ctx.proposed == Value::Relay(false)
    }

    fn evaluate(&self, ctx: &SafetyContext) -> Result<ValidationResult> {
        let fire_active = ctx.related.iter().any(|(id, snap)| {
            self.fire.matches(id.component())
                && snap
                    .desired
                    .as_ref()
                    .map(|d| d.value == Value::Relay(true))
                    .unwrap_or(false)
        });

        if fire_active {
            Ok(ValidationResult::Modified {
                modified: Value::Relay(true),
                reason: String::from("pump must remain ON while fire active"),
            })
        } else {
            Ok(ValidationResult::Accepted)
        }
    }

    fn suggest_correction(&self, _ctx: &SafetyContext) -> Option<Value> {
        Some(Value::Relay(true))
    }
}

/// A configured rule that forces matching devices to a fixed value.
struct PinRule {
    id: String,
    name: String,
    category: RuleCategory,
    priority: i32,
    device: Pattern,
    value: Value,
    reason: String,
}

impl SafetyRule for PinRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> RuleCategory {
        self.category
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn applies_to(&self, ctx: &SafetyContext) -> bool {
        ctx.device_type == self.value.device_type()
            && self.device.matches(ctx.id.component())
    }

    fn evaluate(&self, ctx: &SafetyContext) -> Result<ValidationResult> {
        if ctx.proposed == self.value {
            Ok(ValidationResult::Accepted)
        } else {
            Ok(ValidationResult::Modified {
                modified: self.value,
                reason: self.reason.clone(),
            })
        }
    }

    fn suggest_correction(&self, _ctx: &SafetyContext) -> Option<Value> {
        Some(self.value)
    }
}

/// A configured relay interlock: while any related device's desired
/// state matches the trigger, matching devices are held at a fixed
/// relay state.
struct InterlockRule {
    id: String,
    name: String,
    category: RuleCategory,
    priority: i32,
    device: Pattern,
    related: Pattern,
    related_active: bool,
    hold: bool,
    reason: String,
}

impl SafetyRule for InterlockRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> RuleCategory {
        self.category
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn applies_to(&self, ctx: &SafetyContext) -> bool {
        ctx.device_type == DeviceType::Relay
            && self.device.matches(ctx.id.component())
            && ctx.proposed != Value::Relay(self.hold)
    }

    fn evaluate(&self, ctx: &SafetyContext) -> Result<ValidationResult> {
        let triggered = ctx.related.iter().any(|(id, snap)| {
            self.related.matches(id.component())
                && snap
                    .desired
                    .as_ref()
                    .map(|d| d.value == Value::Relay(self.related_active))
                    .unwrap_or(false)
        });

        if triggered {
            Ok(ValidationResult::Modified {
                modified: Value::Relay(self.hold),
                reason: self.reason.clone(),
            })
        } else {
            Ok(ValidationResult::Accepted)
        }
    }

    fn suggest_correction(&self, _ctx: &SafetyContext) -> Option<Value> {
        Some(Value::Relay(self.hold))
    }
}

// Maps the category name of a `[[rule]]` section. The hardcoded tier
// is reserved for compiled-in rules and `USER_INTENT` isn't a rule
// tier at all.

fn category_from_config(s: &str) -> Result<RuleCategory> {
    match s {
        "SYSTEM_SAFETY" => Ok(RuleCategory::SystemSafety),
        "EMERGENCY" => Ok(RuleCategory::Emergency),
        "MAINTENANCE" => Ok(RuleCategory::Maintenance),
        "SCHEDULED" => Ok(RuleCategory::Scheduled),
        "MANUAL" => Ok(RuleCategory::Manual),
        _ => Err(Error::ConfigError(format!(
            "'{}' is not a valid rule category",
            s
        ))),
    }
}

fn from_def(def: &RuleDef) -> Result<Box<dyn SafetyRule>> {
    let category = category_from_config(&def.category)?;
    let name = def.name.clone().unwrap_or_else(|| def.id.clone());

    match &def.kind {
        RuleKindDef::Pin { relay, fan, reason } => {
            let value = match (relay, fan) {
                (Some(v), None) => Value::Relay(*v),
                (None, Some(v)) => Value::fan(*v)?,
                _ => {
                    return Err(Error::ConfigError(String::from(
                        "pin rule needs exactly one of 'relay' or 'fan'",
                    )))
                }
            };

            Ok(Box::new(PinRule {
                id: def.id.clone(),
                name,
                category,
                priority: def.priority,
                device: Pattern::create(&def.device),
                value,
                reason: reason.clone(),
            }))
        }

        RuleKindDef::Interlock {
            related,
            related_active,
            hold,
            reason,
        } => Ok(Box::new(InterlockRule {
            id: def.id.clone(),
            name,
            category,
            priority: def.priority,
            device: Pattern::create(&def.device),
            related: Pattern::create(related),
            related_active: *related_active,
            hold: *hold,
            reason: reason.clone(),
        })),
    }
}

/// The compiled-in rule set.
pub fn builtin() -> Vec<Box<dyn SafetyRule>> {
    vec![Box::new(FirePumpInterlock::new())]
}

/// Builds the full rule set: the hardcoded tier plus whatever the
/// configuration declares. Sections that fail to build are dropped
/// with an error in the log; they never take the hardcoded tier down
/// with them.
pub fn load(defs: &[RuleDef]) -> Vec<Box<dyn SafetyRule>> {
    let mut rules = builtin();

    for def in defs {
        match from_def(def) {
            Ok(rule) => rules.push(rule),
            Err(e) => error!("ignoring rule '{}': {}", &def.id, &e),
        }
    }
    rules
}
