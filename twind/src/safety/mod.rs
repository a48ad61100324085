//! The safety rule engine.
//!
//! Every proposed device value runs through an ordered chain of
//! rules before it may become the desired state. A rule can wave the
//! value through, replace it, or refuse it outright. Rules in the two
//! safety tiers can never be outranked by an override and fail
//! closed; everything below them fails open.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use tokio::time::{Duration, Instant};
use tracing::warn;
use twin_api::{
    types::{
        device::{DeviceId, DeviceType, Value},
        twin::TwinSnapshot,
    },
    Result,
};

pub mod pattern;
pub mod rules;

/// The rule tiers, declared in ascending precedence. The two safety
/// tiers sit above every override category; `UserIntent` sits below
/// everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuleCategory {
    UserIntent,
    Manual,
    Scheduled,
    Maintenance,
    Emergency,
    SystemSafety,
    HardcodedSafety,
}

impl RuleCategory {
    /// Safety tiers fail closed and cannot be overridden.
    pub fn is_safety(&self) -> bool {
        matches!(
            self,
            RuleCategory::SystemSafety | RuleCategory::HardcodedSafety
        )
    }
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleCategory::UserIntent => write!(f, "USER_INTENT"),
            RuleCategory::Manual => write!(f, "MANUAL"),
            RuleCategory::Scheduled => write!(f, "SCHEDULED"),
            RuleCategory::Maintenance => write!(f, "MAINTENANCE"),
            RuleCategory::Emergency => write!(f, "EMERGENCY"),
            RuleCategory::SystemSafety => write!(f, "SYSTEM_SAFETY"),
            RuleCategory::HardcodedSafety => write!(f, "HARDCODED_SAFETY"),
        }
    }
}

/// A temperature reading kept as ambient context for rules. A reading
/// whose payload failed to parse is kept with `is_error` set so rules
/// can distinguish "sensor broken" from "sensor silent".
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureReading {
    pub celsius: f64,
    pub is_error: bool,
    pub received_at: DateTime<Utc>,
}

/// Everything a rule may look at while judging a proposed value.
pub struct SafetyContext<'a> {
    pub id: &'a DeviceId,
    pub device_type: DeviceType,
    pub proposed: Value,

    /// Snapshots of the other devices in the same functional system.
    pub related: &'a HashMap<DeviceId, TwinSnapshot>,

    /// Latest temperature readings, keyed by sensor device.
    pub ambient: &'a HashMap<DeviceId, TemperatureReading>,
}

/// What a single rule decided about the proposed value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Accepted,

    Refused {
        reason: String,
        details: Option<String>,
    },

    Modified {
        modified: Value,
        reason: String,
    },
}

/// One step of the modification chain: which rule replaced which
/// value, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct Modification {
    pub rule: String,
    pub original: Value,
    pub modified: Value,
    pub reason: String,
}

/// The engine's final word on a proposed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The value survived the chain, possibly reshaped by the listed
    /// modifications (applied in order).
    Accepted {
        value: Value,
        modifications: Vec<Modification>,
    },

    /// A rule refused; the proposal must not be applied. `suggested`
    /// is the refusing rule's correction hint, if it offers one.
    Refused {
        rule: String,
        reason: String,
        details: Option<String>,
        suggested: Option<Value>,
    },
}

pub trait SafetyRule: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn category(&self) -> RuleCategory;

    /// Orders rules within a category; higher runs first.
    fn priority(&self) -> i32 {
        0
    }

    fn applies_to(&self, ctx: &SafetyContext) -> bool;

    /// Judges the proposed value. An `Err` counts as a rule failure:
    /// fatal inside the safety tiers, skipped below them.
    fn evaluate(&self, ctx: &SafetyContext) -> Result<ValidationResult>;

    /// A value the rule would accept instead of the one it refused.
    /// Surfaced to clients as a hint; never applied automatically.
    fn suggest_correction(&self, _ctx: &SafetyContext) -> Option<Value> {
        None
    }
}

/// The rule chain, sorted once at construction by descending
/// category, descending priority, then id.
pub struct Registry {
    rules: Vec<Box<dyn SafetyRule>>,
    budget: Duration,
}

impl Registry {
    pub fn new(mut rules: Vec<Box<dyn SafetyRule>>, budget: Duration) -> Self {
        rules.sort_by(|a, b| {
            b.category()
                .cmp(&a.category())
                .then(b.priority().cmp(&a.priority()))
                .then(a.id().cmp(b.id()))
        });
        Registry { rules, budget }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Runs the chain against a proposed value. The first refusal
    /// wins; modifications accumulate; rules that don't apply are
    /// passed over. A failing or over-budget rule refuses the value
    /// when it sits in a safety tier and is skipped otherwise.
    pub fn evaluate(
        &self,
        id: &DeviceId,
        device_type: DeviceType,
        proposed: Value,
        related: &HashMap<DeviceId, TwinSnapshot>,
        ambient: &HashMap<DeviceId, TemperatureReading>,
    ) -> Verdict {
        let mut value = proposed;
        let mut modifications: Vec<Modification> = vec![];

        for rule in &self.rules {
            let ctx = SafetyContext {
                id,
                device_type,
                proposed: value,
                related,
                ambient,
            };

            if !rule.applies_to(&ctx) {
                continue;
            }

            let started = Instant::now();
            let result = rule.evaluate(&ctx);
            let elapsed = started.elapsed();

            // Rules are synchronous, so the evaluation budget can
            // only be checked after the fact. One that blew through
            // it gets the same treatment as one that errored.

            let result = if elapsed > self.budget {
                warn!(
                    "rule {} took {:?} (budget {:?})",
                    rule.id(),
                    elapsed,
                    self.budget
                );
                Err(twin_api::types::Error::TimeoutError)
            } else {
                result
            };

            match result {
                Ok(ValidationResult::Accepted) => (),

                Ok(ValidationResult::Refused { reason, details }) => {
                    return Verdict::Refused {
                        rule: rule.id().to_string(),
                        reason,
                        details,
                        suggested: rule.suggest_correction(&ctx),
                    }
                }

                Ok(ValidationResult::Modified { modified, reason }) => {
                    // A rule may reshape the value but never change
                    // its type.

                    if modified.validate_for(device_type).is_err() {
                        if rule.category().is_safety() {
                            return Verdict::Refused {
                                rule: rule.id().to_string(),
                                reason: String::from("rule_error"),
                                details: Some(format!(
                                    "rule produced a {} value for a {} \
				     device",
                                    modified.device_type(),
                                    device_type
                                )),
                                suggested: None,
                            };
                        }
                        warn!(
                            "skipping rule {}: modified value has the \
			     wrong type",
                            rule.id()
                        );
                        continue;
                    }

                    if modified != value {
                        modifications.push(Modification {
                            rule: rule.id().to_string(),
                            original: value,
                            modified,
                            reason,
                        });
                        value = modified
                    }
                }

                Err(e) => {
                    if rule.category().is_safety() {
                        return Verdict::Refused {
                            rule: rule.id().to_string(),
                            reason: String::from("rule_error"),
                            details: Some(e.to_string()),
                            suggested: None,
                        };
                    }
                    warn!("skipping rule {}: {}", rule.id(), &e)
                }
            }
        }

        Verdict::Accepted {
            value,
            modifications,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twin_api::types::Error;

    struct FakeRule {
        id: &'static str,
        category: RuleCategory,
        priority: i32,
        applies: bool,
        result: Result<ValidationResult>,
    }

    impl SafetyRule for FakeRule {
        fn id(&self) -> &str {
            self.id
        }

        fn name(&self) -> &str {
            self.id
        }

        fn category(&self) -> RuleCategory {
            self.category
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn applies_to(&self, _ctx: &SafetyContext) -> bool {
            self.applies
        }

        fn evaluate(&self, _ctx: &SafetyContext) -> Result<ValidationResult> {
            self.result.clone()
        }
    }

    fn rule(
        id: &'static str,
        category: RuleCategory,
        priority: i32,
        result: Result<ValidationResult>,
    ) -> Box<dyn SafetyRule> {
        Box::new(FakeRule {
            id,
            category,
            priority,
            applies: true,
            result,
        })
    }

    fn run(reg: &Registry, proposed: Value) -> Verdict {
        let id: DeviceId = "c1:r1".parse().unwrap();
        let related = HashMap::new();
        let ambient = HashMap::new();

        reg.evaluate(&id, DeviceType::Relay, proposed, &related, &ambient)
    }

    #[test]
    fn test_category_precedence() {
        assert!(RuleCategory::HardcodedSafety > RuleCategory::SystemSafety);
        assert!(RuleCategory::SystemSafety > RuleCategory::Emergency);
        assert!(RuleCategory::Emergency > RuleCategory::Maintenance);
        assert!(RuleCategory::Maintenance > RuleCategory::Scheduled);
        assert!(RuleCategory::Scheduled > RuleCategory::Manual);
        assert!(RuleCategory::Manual > RuleCategory::UserIntent);

        assert!(RuleCategory::HardcodedSafety.is_safety());
        assert!(RuleCategory::SystemSafety.is_safety());
        assert!(!RuleCategory::Emergency.is_safety());
    }

    #[test]
    fn test_first_refusal_wins() {
        let reg = Registry::new(
            vec![
                rule(
                    "low",
                    RuleCategory::Manual,
                    0,
                    Ok(ValidationResult::Refused {
                        reason: String::from("later"),
                        details: None,
                    }),
                ),
                rule(
                    "high",
                    RuleCategory::SystemSafety,
                    0,
                    Ok(ValidationResult::Refused {
                        reason: String::from("first"),
                        details: None,
                    }),
                ),
            ],
            Duration::from_millis(50),
        );

        // The safety-tier rule runs first even though it was
        // registered second.

        match run(&reg, Value::Relay(true)) {
            Verdict::Refused { rule, reason, .. } => {
                assert_eq!(rule, "high");
                assert_eq!(reason, "first");
            }
            v => panic!("unexpected verdict {:?}", v),
        }
    }

    #[test]
    fn test_modification_chain() {
        let reg = Registry::new(
            vec![
                rule(
                    "flip",
                    RuleCategory::SystemSafety,
                    5,
                    Ok(ValidationResult::Modified {
                        modified: Value::Relay(true),
                        reason: String::from("hold on"),
                    }),
                ),
                rule(
                    "agree",
                    RuleCategory::SystemSafety,
                    1,
                    Ok(ValidationResult::Modified {
                        modified: Value::Relay(true),
                        reason: String::from("same"),
                    }),
                ),
            ],
            Duration::from_millis(50),
        );

        match run(&reg, Value::Relay(false)) {
            Verdict::Accepted {
                value,
                modifications,
            } => {
                assert_eq!(value, Value::Relay(true));

                // The second rule agreed with the already-modified
                // value, so only one chain entry exists.

                assert_eq!(modifications.len(), 1);
                assert_eq!(modifications[0].rule, "flip");
                assert_eq!(modifications[0].original, Value::Relay(false));
                assert_eq!(modifications[0].modified, Value::Relay(true));
            }
            v => panic!("unexpected verdict {:?}", v),
        }
    }

    #[test]
    fn test_intra_category_priority_and_id_order() {
        let reg = Registry::new(
            vec![
                rule(
                    "b-rule",
                    RuleCategory::Manual,
                    0,
                    Ok(ValidationResult::Refused {
                        reason: String::from("b"),
                        details: None,
                    }),
                ),
                rule(
                    "a-rule",
                    RuleCategory::Manual,
                    0,
                    Ok(ValidationResult::Refused {
                        reason: String::from("a"),
                        details: None,
                    }),
                ),
                rule(
                    "z-priority",
                    RuleCategory::Manual,
                    9,
                    Ok(ValidationResult::Accepted),
                ),
            ],
            Duration::from_millis(50),
        );

        // Priority outranks id; between equal priorities the lesser
        // id goes first.

        match run(&reg, Value::Relay(true)) {
            Verdict::Refused { rule, .. } => assert_eq!(rule, "a-rule"),
            v => panic!("unexpected verdict {:?}", v),
        }
    }

    #[test]
    fn test_failure_policy() {
        // A failing rule below the safety tiers is skipped.

        let reg = Registry::new(
            vec![rule(
                "shaky",
                RuleCategory::Manual,
                0,
                Err(Error::OperationError(String::from("boom"))),
            )],
            Duration::from_millis(50),
        );

        assert_eq!(
            run(&reg, Value::Relay(true)),
            Verdict::Accepted {
                value: Value::Relay(true),
                modifications: vec![]
            }
        );

        // The same failure in a safety tier refuses the value.

        let reg = Registry::new(
            vec![rule(
                "shaky",
                RuleCategory::HardcodedSafety,
                0,
                Err(Error::OperationError(String::from("boom"))),
            )],
            Duration::from_millis(50),
        );

        match run(&reg, Value::Relay(true)) {
            Verdict::Refused { rule, reason, .. } => {
                assert_eq!(rule, "shaky");
                assert_eq!(reason, "rule_error");
            }
            v => panic!("unexpected verdict {:?}", v),
        }
    }

    #[test]
    fn test_type_changing_modification_is_rejected() {
        let reg = Registry::new(
            vec![rule(
                "weird",
                RuleCategory::Manual,
                0,
                Ok(ValidationResult::Modified {
                    modified: Value::Fan(1),
                    reason: String::from("confused"),
                }),
            )],
            Duration::from_millis(50),
        );

        // Below the safety tiers the bad modification is dropped.

        assert_eq!(
            run(&reg, Value::Relay(true)),
            Verdict::Accepted {
                value: Value::Relay(true),
                modifications: vec![]
            }
        );
    }
}
