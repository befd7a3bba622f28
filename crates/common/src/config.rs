/// The chain a single engine instance indexes.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub id: u64,
    pub name: String,
    pub rpc_url: String,
}

impl ChainConfig {
    /// Load the chain configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            id: std::env::var("LOGTIDE_CHAIN_ID")
                .map_err(|_| anyhow::anyhow!("LOGTIDE_CHAIN_ID environment variable is required"))?
                .parse()
                .map_err(|_| anyhow::anyhow!("LOGTIDE_CHAIN_ID must be a valid u64"))?,
            name: std::env::var("LOGTIDE_CHAIN_NAME").unwrap_or_else(|_| "mainnet".to_string()),
            rpc_url: std::env::var("LOGTIDE_RPC_URL")
                .map_err(|_| anyhow::anyhow!("LOGTIDE_RPC_URL environment variable is required"))?,
        })
    }
}

/// Tunables for the poll loop and the RPC layer.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Delay between poll iterations while live-tailing (default: 4000)
    pub event_poll_delay_ms: u64,

    /// Maximum retries for retryable RPC failures (default: 5)
    pub max_retries: u32,

    /// Base delay for exponential retry backoff (default: 250)
    pub retry_delay_ms: u64,

    /// Maximum number of in-flight RPC requests (default: 10)
    pub rpc_concurrency: usize,

    /// Per-request RPC timeout (default: 30000)
    pub rpc_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            event_poll_delay_ms: 4000,
            max_retries: 5,
            retry_delay_ms: 250,
            rpc_concurrency: 10,
            rpc_timeout_ms: 30_000,
        }
    }
}

impl EngineSettings {
    /// Load settings from environment variables, falling back to the
    /// defaults above for anything unset.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            event_poll_delay_ms: env_or("LOGTIDE_POLL_DELAY_MS", defaults.event_poll_delay_ms)?,
            max_retries: env_or("LOGTIDE_MAX_RETRIES", defaults.max_retries)?,
            retry_delay_ms: env_or("LOGTIDE_RETRY_DELAY_MS", defaults.retry_delay_ms)?,
            rpc_concurrency: env_or("LOGTIDE_RPC_CONCURRENCY", defaults.rpc_concurrency)?,
            rpc_timeout_ms: env_or("LOGTIDE_RPC_TIMEOUT_MS", defaults.rpc_timeout_ms)?,
        })
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{key} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = EngineSettings::default();
        assert_eq!(settings.event_poll_delay_ms, 4000);
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.rpc_concurrency, 10);
    }
}
