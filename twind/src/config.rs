use serde_derive::Deserialize;
use std::env;
use tokio::time::Duration;
use tracing::Level;
use twin_api::{types::Error, Result};

fn def_log_level() -> String {
    String::from("warn")
}

fn def_debounce_ms() -> u64 {
    50
}

fn def_drift_period_ms() -> u64 {
    5_000
}

fn def_stale_cron() -> String {
    String::from("0 0 3 * * *")
}

fn def_stale_threshold_days() -> i64 {
    7
}

fn def_orphan_cron() -> String {
    String::from("0 0 4 * * *")
}

fn def_failure_threshold() -> u32 {
    3
}

fn def_recovery_threshold() -> u32 {
    2
}

fn def_probe_period_ms() -> u64 {
    1_000
}

fn def_store_timeout_ms() -> u64 {
    1_000
}

fn def_publish_timeout_ms() -> u64 {
    2_000
}

fn def_rule_timeout_ms() -> u64 {
    50
}

#[derive(Deserialize)]
pub struct Config {
    #[serde(default = "def_log_level")]
    log_level: String,
    #[serde(default)]
    pub reconciliation: Reconciliation,
    #[serde(default)]
    pub maintenance: Maintenance,
    #[serde(default)]
    pub health: Health,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub publish: PublishSection,
    #[serde(default)]
    pub rules: RulesSection,
    #[serde(default, rename = "rule")]
    pub rule_defs: Vec<RuleDef>,
}

impl Config {
    pub fn get_log_level(&self) -> Level {
        match self.log_level.as_str() {
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::WARN,
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.reconciliation.debounce_ms)
    }

    pub fn drift_period(&self) -> Duration {
        Duration::from_millis(self.reconciliation.drift_period_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish.timeout_ms)
    }

    pub fn rule_budget(&self) -> Duration {
        Duration::from_millis(self.rules.evaluation_timeout_ms)
    }

    pub fn probe_period(&self) -> Duration {
        Duration::from_millis(self.health.probe_period_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: def_log_level(),
            reconciliation: Reconciliation::default(),
            maintenance: Maintenance::default(),
            health: Health::default(),
            store: StoreSection::default(),
            publish: PublishSection::default(),
            rules: RulesSection::default(),
            rule_defs: vec![],
        }
    }
}

#[derive(Deserialize)]
pub struct Reconciliation {
    #[serde(default = "def_debounce_ms", rename = "debounceMs")]
    pub debounce_ms: u64,
    #[serde(default = "def_drift_period_ms", rename = "driftPeriodMs")]
    pub drift_period_ms: u64,
}

impl Default for Reconciliation {
    fn default() -> Self {
        Reconciliation {
            debounce_ms: def_debounce_ms(),
            drift_period_ms: def_drift_period_ms(),
        }
    }
}

#[derive(Deserialize)]
pub struct Maintenance {
    #[serde(default = "def_stale_cron", rename = "staleDetectionCron")]
    pub stale_detection_cron: String,
    #[serde(
        default = "def_stale_threshold_days",
        rename = "staleThresholdDays"
    )]
    pub stale_threshold_days: i64,
    #[serde(default = "def_orphan_cron", rename = "orphanCleanupCron")]
    pub orphan_cleanup_cron: String,
}

impl Default for Maintenance {
    fn default() -> Self {
        Maintenance {
            stale_detection_cron: def_stale_cron(),
            stale_threshold_days: def_stale_threshold_days(),
            orphan_cleanup_cron: def_orphan_cron(),
        }
    }
}

#[derive(Deserialize)]
pub struct Health {
    #[serde(default = "def_failure_threshold", rename = "failureThreshold")]
    pub failure_threshold: u32,
    #[serde(
        default = "def_recovery_threshold",
        rename = "recoveryThreshold"
    )]
    pub recovery_threshold: u32,
    #[serde(default = "def_probe_period_ms", rename = "probePeriodMs")]
    pub probe_period_ms: u64,
}

impl Default for Health {
    fn default() -> Self {
        Health {
            failure_threshold: def_failure_threshold(),
            recovery_threshold: def_recovery_threshold(),
            probe_period_ms: def_probe_period_ms(),
        }
    }
}

#[derive(Deserialize)]
pub struct StoreSection {
    #[serde(default = "def_store_timeout_ms", rename = "timeoutMs")]
    pub timeout_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        StoreSection {
            timeout_ms: def_store_timeout_ms(),
        }
    }
}

#[derive(Deserialize)]
pub struct PublishSection {
    #[serde(default = "def_publish_timeout_ms", rename = "timeoutMs")]
    pub timeout_ms: u64,
}

impl Default for PublishSection {
    fn default() -> Self {
        PublishSection {
            timeout_ms: def_publish_timeout_ms(),
        }
    }
}

#[derive(Deserialize)]
pub struct RulesSection {
    #[serde(
        default = "def_rule_timeout_ms",
        rename = "evaluationTimeoutMs"
    )]
    pub evaluation_timeout_ms: u64,
}

impl Default for RulesSection {
    fn default() -> Self {
        RulesSection {
            evaluation_timeout_ms: def_rule_timeout_ms(),
        }
    }
}

/// One `[[rule]]` section. The section is converted into a live rule
/// at startup; a section that doesn't convert is dropped with an
/// error in the log.
#[derive(Deserialize)]
pub struct RuleDef {
    pub id: String,
    pub name: Option<String>,
    pub category: String,
    #[serde(default)]
    pub priority: i32,

    /// Component-id pattern selecting the devices the rule applies
    /// to.
    pub device: String,

    #[serde(flatten)]
    pub kind: RuleKindDef,
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKindDef {
    /// Forces matching devices to a fixed value. Exactly one of
    /// `relay` or `fan` must be given.
    Pin {
        relay: Option<bool>,
        fan: Option<u8>,
        reason: String,
    },

    /// Holds matching relays at `hold` while a related device's
    /// desired state equals `related_active`.
    Interlock {
        related: String,
        related_active: bool,
        hold: bool,
        reason: String,
    },
}

fn from_cmdline(mut cfg: Config) -> (bool, Config) {
    use clap::{crate_version, Arg, ArgAction, Command};

    // Define the command line arguments.

    let matches = Command::new("twind")
        .version(crate_version!())
        .about("State reconciliation engine for device twins.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .action(ArgAction::Set)
                .value_name("FILE")
                .help("Specifies the configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Sets verbosity of log; can be used more than once"),
        )
        .arg(
            Arg::new("print_cfg")
                .long("print-config")
                .action(ArgAction::SetTrue)
                .help("Displays the configuration and exits"),
        )
        .get_matches();

    // The number of '-v' options determines the log level.

    match matches.get_count("verbose") {
        0 => (),
        1 => cfg.log_level = String::from("info"),
        2 => cfg.log_level = String::from("debug"),
        _ => cfg.log_level = String::from("trace"),
    };

    // Return the config built from the command line and a flag
    // indicating the user wants the final configuration displayed.

    (matches.get_flag("print_cfg"), cfg)
}

fn parse_config(contents: &str) -> Result<Config> {
    toml::from_str(contents)
        .map_err(|e| Error::ConfigError(format!("{}", e)))
        .and_then(|cfg: Config| {
            if cfg.reconciliation.debounce_ms == 0 {
                return Err(Error::ConfigError(
                    "'debounceMs' must be greater than zero".into(),
                ));
            }
            if cfg.reconciliation.drift_period_ms == 0 {
                return Err(Error::ConfigError(
                    "'driftPeriodMs' must be greater than zero".into(),
                ));
            }
            if cfg.health.failure_threshold == 0
                || cfg.health.recovery_threshold == 0
            {
                return Err(Error::ConfigError(
                    "health thresholds must be greater than zero".into(),
                ));
            }
            Ok(cfg)
        })
}

async fn from_file(path: &str) -> Option<Result<Config>> {
    use tokio::fs;

    if let Ok(contents) = fs::read(path).await {
        let contents = String::from_utf8_lossy(&contents);

        Some(parse_config(&contents))
    } else {
        None
    }
}

async fn find_cfg() -> Result<Config> {
    const CFG_FILE: &str = "twind.toml";

    // Create a vector of directories that could contain a
    // configuration file. The directories will be searched in their
    // order within the vector.

    let mut dirs = vec![String::from("./")];

    // If the user has `HOME` defined, append their home directory to
    // the search path. Note the end of the path has a period. This is
    // done so the file will be named `.twind.toml` in the home
    // directory.

    if let Ok(home) = env::var("HOME") {
        dirs.push(format!("{}/.", home))
    }

    // Add other, common configuration areas.

    dirs.push(String::from("/usr/local/etc/"));
    dirs.push(String::from("/usr/pkg/etc/"));
    dirs.push(String::from("/etc/"));

    // Iterate through the directories. The first file that is found
    // and can be parsed is used as the configuration.

    for dir in dirs {
        let file = format!("{}{}", &dir, CFG_FILE);

        if let Some(cfg) = from_file(&file).await {
            return cfg;
        }
    }
    Ok(Config::default())
}

fn dump_config(cfg: &Config) {
    println!("Configuration:");
    println!("    log level: {}", cfg.get_log_level());
    println!("    debounce window: {} ms", cfg.reconciliation.debounce_ms);
    println!(
        "    drift sweep period: {} ms",
        cfg.reconciliation.drift_period_ms
    );
    println!(
        "    stale detection: '{}', threshold {} days",
        cfg.maintenance.stale_detection_cron,
        cfg.maintenance.stale_threshold_days
    );
    println!(
        "    orphan cleanup: '{}'",
        cfg.maintenance.orphan_cleanup_cron
    );
    println!(
        "    health thresholds: {} failures / {} recoveries",
        cfg.health.failure_threshold, cfg.health.recovery_threshold
    );
    println!("    store timeout: {} ms", cfg.store.timeout_ms);
    println!("    publish timeout: {} ms", cfg.publish.timeout_ms);
    println!(
        "    rule budget: {} ms",
        cfg.rules.evaluation_timeout_ms
    );
    println!("    configured rules: {}", cfg.rule_defs.len());
}

/// Determines the configuration. Returns `None` if the process
/// should exit (because the user asked for the configuration to be
/// displayed, for instance.)

pub async fn get() -> Option<Config> {
    match find_cfg().await {
        Ok(cfg) => {
            let (dump, cfg) = from_cmdline(cfg);

            if dump {
                dump_config(&cfg);
                None
            } else {
                Some(cfg)
            }
        }
        Err(e) => {
            eprintln!("ERROR: {}", &e);
            None
        }
    }
}
