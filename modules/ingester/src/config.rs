use std::env;
use std::time::Duration;

/// Ingester configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct IngesterConfig {
    pub database_url: String,
    pub db_pool_size: u32,
    pub redis_url: String,
    pub host: String,
    pub port: u16,
    /// How long a consumer blocks waiting for the next stream entry.
    pub poll_timeout: Duration,
    pub enrichment: EnrichmentSettings,
}

#[derive(Debug, Clone)]
pub struct EnrichmentSettings {
    /// Empty base URL disables catalogue lookups.
    pub base_url: String,
    pub api_key: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u64_or(name: &str, default: u64) -> Result<u64, String> {
    match env::var(name) {
        Ok(v) => v.parse().map_err(|_| format!("{name} must be a number")),
        Err(_) => Ok(default),
    }
}

impl IngesterConfig {
    pub fn from_env() -> Result<Self, String> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        Ok(Self {
            database_url,
            db_pool_size: env_or("DB_POOL_SIZE", "8")
                .parse()
                .map_err(|_| "DB_POOL_SIZE must be a number".to_string())?,
            redis_url: env_or("REDIS_URL", "redis://localhost:6379"),
            host: env_or("HOST", "0.0.0.0"),
            port: env_or("PORT", "8081")
                .parse()
                .map_err(|_| "PORT must be a valid u16".to_string())?,
            poll_timeout: Duration::from_secs(env_u64_or("POLL_TIMEOUT_SECONDS", 5)?),
            enrichment: EnrichmentSettings {
                base_url: env_or("ENRICHMENT_BASE_URL", ""),
                api_key: env_or("ENRICHMENT_API_KEY", ""),
                connect_timeout: Duration::from_millis(env_u64_or(
                    "ENRICHMENT_CONNECT_TIMEOUT_MS",
                    5000,
                )?),
                read_timeout: Duration::from_millis(env_u64_or(
                    "ENRICHMENT_READ_TIMEOUT_MS",
                    10_000,
                )?),
            },
        })
    }
}
