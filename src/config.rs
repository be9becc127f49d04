use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::{Error, Result};
use crate::regime::RegimeConfig;
use crate::risk::RiskConfig;
use crate::signals::{SignalStrategyConfig, SignalsConfig};

const SECTION_FILES: &[&str] = &[
    "system.yaml",
    "brokers.yaml",
    "strategies.yaml",
    "indicators.yaml",
    "signals.yaml",
    "risk.yaml",
];

const ENV_PREFIX: &str = "ATP_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Paper,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub run_id: Option<String>,
    pub environment: Environment,
    pub log_level: String,
    pub timezone: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            run_id: None,
            environment: Environment::Development,
            log_level: "INFO".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BrokerConfig {
    pub broker_id: String,
    pub broker_type: String,
    pub enabled: bool,
    pub paper_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct IndicatorsConfig {
    #[garde(skip)]
    pub cache_enabled: bool,
    #[garde(range(min = 1))]
    pub cache_ttl_seconds: u64,
    #[garde(range(min = 10))]
    pub max_lookback_bars: usize,
    #[garde(skip)]
    pub regime: RegimeConfig,
}

impl Default for IndicatorsConfig {
    fn default() -> Self {
        IndicatorsConfig {
            cache_enabled: true,
            cache_ttl_seconds: 300,
            max_lookback_bars: 500,
            regime: RegimeConfig::default(),
        }
    }
}

/// Root merged configuration across the YAML config directory.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RootConfig {
    pub system: SystemConfig,
    pub brokers: Vec<BrokerConfig>,
    /// Stand-alone `strategies.yaml` entries; when present they replace
    /// `signals.strategies` after the merge.
    pub strategies: Vec<SignalStrategyConfig>,
    pub indicators: IndicatorsConfig,
    pub signals: SignalsConfig,
    pub risk: RiskConfig,
}

impl RootConfig {
    fn normalized(mut self) -> Self {
        if !self.strategies.is_empty() {
            self.signals.strategies = self.strategies.clone();
        }
        self
    }

    pub fn validate_all(&self) -> Result<()> {
        self.indicators
            .validate()
            .map_err(|err| Error::ConfigInvalid(format!("indicators: {err}")))?;
        self.risk
            .validate()
            .map_err(|err| Error::ConfigInvalid(format!("risk: {err}")))?;
        self.signals
            .ensemble
            .validate()
            .map_err(|err| Error::ConfigInvalid(format!("signals.ensemble: {err}")))?;
        self.signals
            .filters
            .validate()
            .map_err(|err| Error::ConfigInvalid(format!("signals.filters: {err}")))?;
        self.signals
            .confidence
            .validate()
            .map_err(|err| Error::ConfigInvalid(format!("signals.confidence: {err}")))?;
        self.signals
            .anti_overtrading
            .validate()
            .map_err(|err| Error::ConfigInvalid(format!("signals.anti_overtrading: {err}")))?;
        Ok(())
    }
}

/// Load and validate the YAML config directory, applying
/// `ATP_<SECTION>__<KEY>` environment overrides with YAML-parsed values.
pub fn load_config(config_dir: &Path) -> Result<RootConfig> {
    let mut merged = Value::Mapping(serde_yaml::Mapping::new());
    for file_name in SECTION_FILES {
        let path = config_dir.join(file_name);
        if !path.exists() {
            continue;
        }
        let raw = std::fs::read_to_string(&path)?;
        let value: Value = serde_yaml::from_str(&raw)?;
        if value.is_mapping() {
            deep_merge(&mut merged, &value);
        }
    }
    apply_env_overrides(&mut merged, ENV_PREFIX, &[]);

    let config: RootConfig = serde_yaml::from_value(merged)
        .map_err(|err| Error::ConfigInvalid(err.to_string()))?;
    let config = config.normalized();
    config.validate_all()?;
    Ok(config)
}

/// Write the config back into section files.
pub fn save_config(config: &RootConfig, config_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(config_dir)?;
    write_section(config_dir, "system.yaml", "system", &config.system)?;
    write_section(config_dir, "brokers.yaml", "brokers", &config.brokers)?;
    write_section(config_dir, "strategies.yaml", "strategies", &config.signals.strategies)?;
    write_section(config_dir, "indicators.yaml", "indicators", &config.indicators)?;
    write_section(config_dir, "signals.yaml", "signals", &config.signals)?;
    write_section(config_dir, "risk.yaml", "risk", &config.risk)?;
    Ok(())
}

fn write_section<T: Serialize>(
    config_dir: &Path,
    file_name: &str,
    key: &str,
    value: &T,
) -> Result<()> {
    let mut mapping = serde_yaml::Mapping::new();
    mapping.insert(Value::String(key.to_string()), serde_yaml::to_value(value)?);
    let rendered = serde_yaml::to_string(&Value::Mapping(mapping))?;
    std::fs::write(config_dir.join(file_name), rendered)?;
    Ok(())
}

/// Watch the config directory and invoke the callback on valid changes.
///
/// Polling watcher: captures (mtime, size) per YAML file with a debounce
/// interval. Parse/validation failures leave the running config in place
/// and are only logged.
pub fn watch_config<F>(
    config_dir: PathBuf,
    debounce: Duration,
    mut on_change: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnMut(RootConfig) + Send + 'static,
{
    tokio::spawn(async move {
        let mut previous = capture_watch_state(&config_dir);
        loop {
            tokio::time::sleep(debounce.max(Duration::from_millis(100))).await;
            let current = capture_watch_state(&config_dir);
            if current == previous {
                continue;
            }
            previous = current;
            match load_config(&config_dir) {
                Ok(config) => on_change(config),
                Err(err) => {
                    tracing::warn!(error = %err, "config reload failed, keeping previous config");
                }
            }
        }
    })
}

fn capture_watch_state(config_dir: &Path) -> BTreeMap<String, (i64, u64)> {
    let mut state = BTreeMap::new();
    let Ok(entries) = std::fs::read_dir(config_dir) else {
        return state;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "yaml") {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|ts| ts.duration_since(std::time::UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_nanos() as i64);
            state.insert(path.to_string_lossy().to_string(), (mtime, meta.len()));
        }
    }
    state
}

fn deep_merge(base: &mut Value, updates: &Value) {
    match (base, updates) {
        (Value::Mapping(base_map), Value::Mapping(update_map)) => {
            for (key, value) in update_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_mapping() && value.is_mapping() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, updates) => *base = updates.clone(),
    }
}

/// Merge `PREFIX_SECTION__KEY[__SUBKEY…]` environment variables into the
/// tree; values are parsed as YAML scalars.
fn apply_env_overrides(data: &mut Value, prefix: &str, base_path: &[&str]) {
    for (env_key, raw_value) in std::env::vars() {
        let Some(stripped) = env_key.strip_prefix(prefix) else {
            continue;
        };
        let parts: Vec<String> = stripped.to_lowercase().split("__").map(String::from).collect();
        if parts.is_empty() {
            continue;
        }
        let parsed: Value =
            serde_yaml::from_str(&raw_value).unwrap_or(Value::String(raw_value.clone()));

        let mut full_path: Vec<&str> = base_path.to_vec();
        let part_refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        full_path.extend(part_refs);
        set_path(data, &full_path, parsed);
    }
}

fn set_path(data: &mut Value, path: &[&str], value: Value) {
    if path.is_empty() {
        return;
    }
    if !data.is_mapping() {
        *data = Value::Mapping(serde_yaml::Mapping::new());
    }
    let Value::Mapping(map) = data else {
        return;
    };
    let key = Value::String(path[0].to_string());
    if path.len() == 1 {
        map.insert(key, value);
        return;
    }
    let entry = map
        .entry(key)
        .or_insert_with(|| Value::Mapping(serde_yaml::Mapping::new()));
    set_path(entry, &path[1..], value);
}

// --- Backtest module config (backtest.yaml + ATP_BACKTEST__/ATP_REPLAY__/
// ATP_SHADOW__ overrides) ---

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct WalkForwardDefaults {
    #[garde(range(min = 1))]
    pub train_periods: usize,
    #[garde(range(min = 1))]
    pub test_periods: usize,
    #[garde(range(min = 1))]
    pub step_periods: usize,
}

impl Default for WalkForwardDefaults {
    fn default() -> Self {
        WalkForwardDefaults {
            train_periods: 240,
            test_periods: 60,
            step_periods: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct OutOfSampleDefaults {
    #[garde(range(min = 0.01, max = 0.99))]
    pub oos_pct: f64,
    #[garde(skip)]
    pub purge_bars: usize,
}

impl Default for OutOfSampleDefaults {
    fn default() -> Self {
        OutOfSampleDefaults {
            oos_pct: 0.20,
            purge_bars: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct OptimizerDefaults {
    #[garde(range(min = 1))]
    pub n_trials: usize,
    #[garde(skip)]
    pub default_metric: String,
    #[garde(range(min = 0.0))]
    pub lambda_complexity: f64,
    #[garde(range(min = 0.0))]
    pub mu_instability: f64,
}

impl Default for OptimizerDefaults {
    fn default() -> Self {
        OptimizerDefaults {
            n_trials: 25,
            default_metric: "sharpe_ratio".to_string(),
            lambda_complexity: 0.05,
            mu_instability: 0.10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ViabilityThresholds {
    #[garde(range(min = 0.0))]
    pub min_profit_factor: f64,
    #[garde(skip)]
    pub min_sharpe_ratio: f64,
    #[garde(range(min = 0.0))]
    pub max_drawdown_pct: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub min_win_rate: f64,
    #[garde(range(min = 0))]
    pub min_trades: usize,
}

impl Default for ViabilityThresholds {
    fn default() -> Self {
        ViabilityThresholds {
            min_profit_factor: 1.30,
            min_sharpe_ratio: 0.80,
            max_drawdown_pct: 25.0,
            min_win_rate: 0.40,
            min_trades: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BacktestDefaults {
    #[garde(range(min = 0.01))]
    pub default_initial_capital: f64,
    #[garde(skip)]
    pub default_currency: String,
    #[garde(skip)]
    pub use_realistic_fills: bool,
    #[garde(skip)]
    pub warmup_bars: usize,
    #[garde(skip)]
    pub random_seed: u64,
    #[garde(dive)]
    pub walk_forward: WalkForwardDefaults,
    #[garde(dive)]
    pub out_of_sample: OutOfSampleDefaults,
    #[garde(dive)]
    pub optimizer: OptimizerDefaults,
    #[garde(dive)]
    pub viability_thresholds: ViabilityThresholds,
}

impl Default for BacktestDefaults {
    fn default() -> Self {
        BacktestDefaults {
            default_initial_capital: 10_000.0,
            default_currency: "USD".to_string(),
            use_realistic_fills: true,
            warmup_bars: 200,
            random_seed: 42,
            walk_forward: WalkForwardDefaults::default(),
            out_of_sample: OutOfSampleDefaults::default(),
            optimizer: OptimizerDefaults::default(),
            viability_thresholds: ViabilityThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReplayDefaults {
    #[garde(range(min = 0.000001))]
    pub default_speed: f64,
    #[garde(skip)]
    pub default_warmup_bars: usize,
}

impl Default for ReplayDefaults {
    fn default() -> Self {
        ReplayDefaults {
            default_speed: 1.0,
            default_warmup_bars: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct ShadowDefaults {
    #[garde(skip)]
    pub enabled: bool,
    #[garde(skip)]
    pub log_all_signals: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct BacktestModuleConfig {
    #[garde(dive)]
    pub backtest: BacktestDefaults,
    #[garde(dive)]
    pub replay: ReplayDefaults,
    #[garde(dive)]
    pub shadow: ShadowDefaults,
}

/// Load `backtest.yaml` with module-scoped env overrides.
pub fn load_backtest_config(path: &Path) -> Result<BacktestModuleConfig> {
    let mut value: Value = if path.exists() {
        serde_yaml::from_str(&std::fs::read_to_string(path)?)?
    } else {
        Value::Mapping(serde_yaml::Mapping::new())
    };
    apply_env_overrides(&mut value, "ATP_BACKTEST__", &["backtest"]);
    apply_env_overrides(&mut value, "ATP_REPLAY__", &["replay"]);
    apply_env_overrides(&mut value, "ATP_SHADOW__", &["shadow"]);
    let config: BacktestModuleConfig =
        serde_yaml::from_value(value).map_err(|err| Error::ConfigInvalid(err.to_string()))?;
    config
        .validate()
        .map_err(|err| Error::ConfigInvalid(err.to_string()))?;
    Ok(config)
}

pub fn save_backtest_config(config: &BacktestModuleConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_yaml::to_string(config)?)?;
    Ok(())
}
