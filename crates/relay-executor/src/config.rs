use std::time::Duration;

/// Executor and queue tunables. Everything comes from the environment with
/// positive-value validation; invalid input warns and falls back.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_parallel_runs: usize,
    pub max_parallel_nodes_per_run: usize,
    pub max_usd_per_run: f64,
    pub node_timeout: Duration,
    pub run_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_runs: 2,
            max_parallel_nodes_per_run: 4,
            max_usd_per_run: 5.0,
            node_timeout: Duration::from_secs(180),
            run_timeout: Duration::from_secs(1800),
            poll_interval: Duration::from_millis(1200),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_parallel_runs: env_positive("RELAY_MAX_PARALLEL_RUNS", defaults.max_parallel_runs),
            max_parallel_nodes_per_run: env_positive(
                "RELAY_MAX_PARALLEL_NODES_PER_RUN",
                defaults.max_parallel_nodes_per_run,
            ),
            max_usd_per_run: env_positive_f64("RELAY_MAX_USD_PER_RUN", defaults.max_usd_per_run),
            node_timeout: Duration::from_secs(env_positive(
                "RELAY_NODE_TIMEOUT_SECONDS",
                defaults.node_timeout.as_secs() as usize,
            ) as u64),
            run_timeout: Duration::from_secs(env_positive(
                "RELAY_RUN_TIMEOUT_SECONDS",
                defaults.run_timeout.as_secs() as usize,
            ) as u64),
            poll_interval: Duration::from_millis(env_positive(
                "RELAY_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as usize,
            ) as u64),
        }
    }
}

fn env_positive(key: &str, default: usize) -> usize {
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => value,
        _ => {
            tracing::warn!("invalid {key}={raw}; using default {default}");
            default
        }
    }
}

fn env_positive_f64(key: &str, default: f64) -> f64 {
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    match raw.trim().parse::<f64>() {
        Ok(value) if value > 0.0 && value.is_finite() => value,
        _ => {
            tracing::warn!("invalid {key}={raw}; using default {default}");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test body: from_env reads every variable, so parallel tests
    // mutating the environment would race each other.
    #[test]
    fn env_parsing_validates_and_falls_back() {
        std::env::set_var("RELAY_MAX_PARALLEL_RUNS", "0");
        std::env::set_var("RELAY_MAX_USD_PER_RUN", "-3");
        std::env::set_var("RELAY_NODE_TIMEOUT_SECONDS", "ninety");
        std::env::set_var("RELAY_POLL_INTERVAL_MS", "250");
        let config = EngineConfig::from_env();
        assert_eq!(config.max_parallel_runs, 2);
        assert_eq!(config.max_usd_per_run, 5.0);
        assert_eq!(config.node_timeout, Duration::from_secs(180));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        std::env::remove_var("RELAY_MAX_PARALLEL_RUNS");
        std::env::remove_var("RELAY_MAX_USD_PER_RUN");
        std::env::remove_var("RELAY_NODE_TIMEOUT_SECONDS");
        std::env::remove_var("RELAY_POLL_INTERVAL_MS");
    }
}
