//! Runtime configuration.
//!
//! Every tuning constant is an environment variable with a documented
//! default; a missing or unparsable value falls back to the default so
//! initialization never blocks on bad configuration.

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Forecast smoothing strategy, selected by `FORECAST_MODE`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ForecastMode {
    /// Least-squares extrapolation over the sample window.
    Linear,
    /// Exponential smoothing of per-step deltas.
    Ewma { alpha: f64 },
}

impl ForecastMode {
    pub fn from_env() -> Self {
        match std::env::var("FORECAST_MODE").as_deref() {
            Ok("ewma") => ForecastMode::Ewma { alpha: env_f64("FORECAST_EWMA_ALPHA", 0.3) },
            _ => ForecastMode::Linear,
        }
    }
}

#[derive(Clone)]
pub struct Config {
    // persistence
    pub sqlite_path: String,

    // market pricing
    pub price_floor: f64,
    pub price_ceiling: f64,
    pub default_spread: f64,
    pub elasticity: f64,
    pub spread_push_ratio: f64,
    pub max_trade_impact: f64,
    pub volume_baseline_window: usize,
    pub decay_secs: u64,
    pub decay_rate: f64,
    pub trend_lookback_secs: u64,
    pub trend_threshold: f64,
    pub volatility_window: usize,
    pub price_notify_threshold: f64,
    pub activity_norm: f64,

    // inflation & cycle
    pub sample_secs: u64,
    pub snapshot_history: usize,
    pub velocity_window_secs: u64,
    pub inflation_target: f64,
    pub inflation_band: f64,
    pub health_w_inflation: f64,
    pub health_w_equality: f64,
    pub health_w_velocity: f64,
    pub velocity_low: f64,
    pub velocity_high: f64,
    pub recession_health: f64,
    pub stagnation_health: f64,
    pub boom_health: f64,
    pub hysteresis_margin: f64,
    pub hysteresis_ticks: u32,
    pub forecast_window: usize,
    pub forecast_mode: ForecastMode,
    pub health_critical: f64,
    pub gini_critical: f64,
    pub wealth_tax_rate: f64,
    pub wealth_tax_threshold: f64,
    pub wealth_tax_cooldown_secs: u64,

    // economic events
    pub event_tick_secs: u64,
    pub event_start_chance: f64,
    pub event_min_duration_secs: u64,
    pub event_max_duration_secs: u64,

    // safe mode
    pub probe_secs: u64,
    pub latency_threshold_ms: f64,
    pub error_threshold: usize,

    // rate limiting
    pub rate_cap_per_sec: u32,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./ecopulse.sqlite".to_string()),

            price_floor: env_f64("PRICE_FLOOR", 0.01),
            price_ceiling: env_f64("PRICE_CEILING", 1_000_000.0),
            default_spread: env_f64("DEFAULT_SPREAD", 0.10),
            elasticity: env_f64("ELASTICITY", 0.05),
            spread_push_ratio: env_f64("SPREAD_PUSH_RATIO", 0.5),
            max_trade_impact: env_f64("MAX_TRADE_IMPACT", 0.25),
            volume_baseline_window: env_usize("VOLUME_BASELINE_WINDOW", 50),
            decay_secs: env_u64("DECAY_SECS", 300),
            decay_rate: env_f64("DECAY_RATE", 0.02),
            trend_lookback_secs: env_u64("TREND_LOOKBACK_SECS", 1800),
            trend_threshold: env_f64("TREND_THRESHOLD", 0.05),
            volatility_window: env_usize("VOLATILITY_WINDOW", 48),
            price_notify_threshold: env_f64("PRICE_NOTIFY_THRESHOLD", 0.10),
            activity_norm: env_f64("ACTIVITY_NORM", 1000.0),

            sample_secs: env_u64("SAMPLE_SECS", 600),
            snapshot_history: env_usize("SNAPSHOT_HISTORY", 144),
            velocity_window_secs: env_u64("VELOCITY_WINDOW_SECS", 86_400),
            inflation_target: env_f64("INFLATION_TARGET", 0.01),
            inflation_band: env_f64("INFLATION_BAND", 0.10),
            health_w_inflation: env_f64("HEALTH_W_INFLATION", 0.40),
            health_w_equality: env_f64("HEALTH_W_EQUALITY", 0.35),
            health_w_velocity: env_f64("HEALTH_W_VELOCITY", 0.25),
            velocity_low: env_f64("VELOCITY_LOW", 0.05),
            velocity_high: env_f64("VELOCITY_HIGH", 1.5),
            recession_health: env_f64("RECESSION_HEALTH", 0.25),
            stagnation_health: env_f64("STAGNATION_HEALTH", 0.45),
            boom_health: env_f64("BOOM_HEALTH", 0.75),
            hysteresis_margin: env_f64("HYSTERESIS_MARGIN", 0.03),
            hysteresis_ticks: env_u32("HYSTERESIS_TICKS", 2),
            forecast_window: env_usize("FORECAST_WINDOW", 12),
            forecast_mode: ForecastMode::from_env(),
            health_critical: env_f64("HEALTH_CRITICAL", 0.20),
            gini_critical: env_f64("GINI_CRITICAL", 0.60),
            wealth_tax_rate: env_f64("WEALTH_TAX_RATE", 0.05),
            wealth_tax_threshold: env_f64("WEALTH_TAX_THRESHOLD", 100_000.0),
            wealth_tax_cooldown_secs: env_u64("WEALTH_TAX_COOLDOWN_SECS", 3600),

            event_tick_secs: env_u64("EVENT_TICK_SECS", 30),
            event_start_chance: env_f64("EVENT_START_CHANCE", 0.10),
            event_min_duration_secs: env_u64("EVENT_MIN_DURATION_SECS", 600),
            event_max_duration_secs: env_u64("EVENT_MAX_DURATION_SECS", 3600),

            probe_secs: env_u64("PROBE_SECS", 30),
            latency_threshold_ms: env_f64("LATENCY_THRESHOLD_MS", 500.0),
            error_threshold: env_usize("ERROR_THRESHOLD", 5),

            rate_cap_per_sec: env_u32("RATE_CAP_PER_SEC", 5),
        }
    }

    /// Health weights normalized to sum to 1, so misconfigured weights can
    /// never push the score outside [0, 1].
    pub fn health_weights(&self) -> (f64, f64, f64) {
        let sum = self.health_w_inflation + self.health_w_equality + self.health_w_velocity;
        if sum <= 0.0 {
            return (1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0);
        }
        (
            self.health_w_inflation / sum,
            self.health_w_equality / sum,
            self.health_w_velocity / sum,
        )
    }
}
