// =============================================================================
// Job request schemas — closed, typed payload contracts
// =============================================================================
//
// Every field set a client may send is enumerated here; unknown fields are
// deserialization errors, not silently ignored. Nested override groups mirror
// the worker config sections they merge into. Dates are `YYYY-MM-DD` strings
// validated at the boundary.
// =============================================================================

use serde::{Deserialize, Serialize};

// =============================================================================
// Override groups (deep-merged into the base config under `env`)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeesOverride {
    #[serde(default)]
    pub commission_per_share: f64,
    #[serde(default = "default_commission_pct")]
    pub commission_pct_notional: f64,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: f64,
    #[serde(default)]
    pub borrow_fee_apr: f64,
}

fn default_commission_pct() -> f64 {
    0.0005
}

fn default_slippage_bps() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarginOverride {
    #[serde(default = "default_max_gross_leverage")]
    pub max_gross_leverage: f64,
    #[serde(default = "default_maintenance_margin")]
    pub maintenance_margin: f64,
    #[serde(default = "default_cash_borrow_apr")]
    pub cash_borrow_apr: f64,
    #[serde(default)]
    pub intraday_only: bool,
}

fn default_max_gross_leverage() -> f64 {
    1.0
}

fn default_maintenance_margin() -> f64 {
    0.25
}

fn default_cash_borrow_apr() -> f64 {
    0.05
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionOverride {
    #[serde(default = "default_order_type")]
    pub order_type: String,
    #[serde(default)]
    pub limit_offset_bps: f64,
    #[serde(default = "default_participation_cap")]
    pub participation_cap: f64,
    #[serde(default)]
    pub impact_k: f64,
    #[serde(default = "default_vol_lookback")]
    pub vol_lookback: u32,
}

fn default_order_type() -> String {
    "market".to_string()
}

fn default_participation_cap() -> f64 {
    0.1
}

fn default_vol_lookback() -> u32 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EpisodeOverride {
    #[serde(default = "default_lookback")]
    pub lookback: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    #[serde(default = "default_start_cash")]
    pub start_cash: f64,
    #[serde(default = "default_true")]
    pub allow_short: bool,
    #[serde(default)]
    pub rebalance_eps: f64,
    #[serde(default)]
    pub randomize_start: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizon: Option<u32>,
}

fn default_lookback() -> u32 {
    64
}

fn default_start_cash() -> f64 {
    100_000.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeaturesOverride {
    #[serde(default = "default_true")]
    pub use_custom_pipeline: bool,
    #[serde(default = "default_lookback")]
    pub window: u32,
    #[serde(default = "default_indicators")]
    pub indicators: Vec<String>,
}

fn default_indicators() -> Vec<String> {
    vec!["logret".to_string(), "rsi14".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewardOverride {
    #[serde(default = "default_reward_mode")]
    pub mode: String,
    #[serde(default)]
    pub w_drawdown: f64,
    #[serde(default)]
    pub w_turnover: f64,
    #[serde(default)]
    pub w_vol: f64,
    #[serde(default = "default_vol_window")]
    pub vol_window: u32,
    #[serde(default)]
    pub w_leverage: f64,
    #[serde(default)]
    pub stop_eq_frac: f64,
}

fn default_reward_mode() -> String {
    "delta_nav".to_string()
}

fn default_vol_window() -> u32 {
    10
}

// =============================================================================
// Policy
// =============================================================================

/// Policy network family for training runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Mlp,
    WindowCnn,
    WindowLstm,
}

impl Default for PolicyKind {
    fn default() -> Self {
        Self::WindowCnn
    }
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mlp => write!(f, "mlp"),
            Self::WindowCnn => write!(f, "window_cnn"),
            Self::WindowLstm => write!(f, "window_lstm"),
        }
    }
}

// =============================================================================
// TrainRequest
// =============================================================================

fn default_timesteps() -> u64 {
    150_000
}

fn default_seed() -> u64 {
    42
}

/// Training job submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    #[serde(default = "default_true")]
    pub normalize: bool,
    #[serde(default)]
    pub policy: PolicyKind,
    #[serde(default = "default_timesteps")]
    pub timesteps: u64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_end: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjusted: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fees: Option<FeesOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin: Option<MarginOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<EpisodeOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<FeaturesOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward: Option<RewardOverride>,

    // PPO hyperparameters, one flat record with optional fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gamma: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gae_lambda: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clip_range: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entropy_coef: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vf_coef: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_grad_norm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dropout: Option<f64>,
}

impl TrainRequest {
    /// Boundary validation: date formats and non-empty symbol lists.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("train_start", &self.train_start),
            ("train_end", &self.train_end),
            ("eval_start", &self.eval_start),
            ("eval_end", &self.eval_end),
            ("start", &self.start),
            ("end", &self.end),
        ] {
            if let Some(v) = value {
                validate_date(name, v)?;
            }
        }
        if let Some(symbols) = &self.symbols {
            if symbols.iter().all(|s| s.trim().is_empty()) {
                return Err("symbols must contain at least one non-empty entry".to_string());
            }
        }
        Ok(())
    }
}

// =============================================================================
// BacktestRequest
// =============================================================================

fn default_backtest_policy() -> String {
    "equal".to_string()
}

/// Backtest job submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BacktestRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    #[serde(default = "default_backtest_policy")]
    pub policy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_dir: Option<String>,
    #[serde(default = "default_true")]
    pub normalize: bool,
}

impl BacktestRequest {
    /// Boundary validation: start/end required and well-formed, symbols
    /// present and non-empty.
    pub fn validate(&self) -> Result<(), String> {
        let start = self.start.as_deref().unwrap_or("").trim();
        let end = self.end.as_deref().unwrap_or("").trim();
        if start.is_empty() || end.is_empty() {
            return Err("start and end are required (YYYY-MM-DD)".to_string());
        }
        validate_date("start", start)?;
        validate_date("end", end)?;

        let symbols: Vec<&str> = self
            .symbols
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        if symbols.is_empty() {
            return Err("at least one symbol is required".to_string());
        }
        Ok(())
    }
}

/// Accept only `YYYY-MM-DD`.
pub fn validate_date(field: &str, value: &str) -> Result<(), String> {
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| format!("{field} must be YYYY-MM-DD, got '{value}'"))
}
