use broker::ReconnectPolicy;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Gateway configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub database_url: String,
    pub db_pool_size: u32,
    pub redis_url: String,
    pub host: String,
    pub port: u16,
    pub listener: ListenerSettings,
}

/// The broker-facing slice of the configuration; swapped atomically by
/// `reconfigure`.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub broker_url: String,
    pub broker_user: String,
    pub broker_password: String,
    pub addresses: Vec<String>,
    /// Empty = plain anycast queues; non-empty = durable shared
    /// subscriptions named `{subscriber_name}.{address}`.
    pub subscriber_name: String,
    pub concurrency: ConcurrencyBand,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub reconnect: ReconnectPolicy,
    /// address -> stream key
    pub stream_mapping: HashMap<String, String>,
    /// When false, processing succeeds but settlements are suppressed so the
    /// broker redelivers everything. Debug-only.
    pub acknowledge_messages: bool,
}

/// Consumer auto-scaling band per address, parsed from `"min-max"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyBand {
    pub min: usize,
    pub max: usize,
}

impl ConcurrencyBand {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (min, max) = match raw.split_once('-') {
            Some((min, max)) => (min.trim(), max.trim()),
            None => (raw.trim(), raw.trim()),
        };
        let min: usize = min
            .parse()
            .map_err(|_| format!("invalid concurrency band '{raw}'"))?;
        let max: usize = max
            .parse()
            .map_err(|_| format!("invalid concurrency band '{raw}'"))?;
        if min == 0 || max < min {
            return Err(format!("invalid concurrency band '{raw}'"));
        }
        Ok(Self { min, max })
    }
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

/// Parse `"ADDRESS=stream,ADDRESS2=stream2"` into the address -> stream map.
pub fn parse_stream_mapping(raw: &str) -> Result<HashMap<String, String>, String> {
    let mut mapping = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (address, stream) = pair
            .split_once('=')
            .ok_or_else(|| format!("invalid stream mapping entry '{pair}'"))?;
        if address.trim().is_empty() || stream.trim().is_empty() {
            return Err(format!("invalid stream mapping entry '{pair}'"));
        }
        mapping.insert(address.trim().to_string(), stream.trim().to_string());
    }
    Ok(mapping)
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, String> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;
        let redis_url = env_or("REDIS_URL", "redis://localhost:6379");
        let host = env_or("HOST", "0.0.0.0");
        let port: u16 = env_or("PORT", "8080")
            .parse()
            .map_err(|_| "PORT must be a valid u16".to_string())?;

        Ok(Self {
            database_url,
            db_pool_size: env_or("DB_POOL_SIZE", "10")
                .parse()
                .map_err(|_| "DB_POOL_SIZE must be a number".to_string())?,
            redis_url,
            host,
            port,
            listener: ListenerSettings::from_env()?,
        })
    }
}

impl ListenerSettings {
    pub fn from_env() -> Result<Self, String> {
        let broker_url =
            env::var("BROKER_URL").map_err(|_| "BROKER_URL must be set".to_string())?;
        let addresses: Vec<String> = env::var("BROKER_ADDRESSES")
            .map_err(|_| "BROKER_ADDRESSES must be set".to_string())?
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
        if addresses.is_empty() {
            return Err("BROKER_ADDRESSES must name at least one address".to_string());
        }

        let stream_mapping = parse_stream_mapping(&env_or("STREAM_MAPPING", ""))?;
        let concurrency = ConcurrencyBand::parse(&env_or("LISTENER_CONCURRENCY", "1-4"))?;

        let reconnect = ReconnectPolicy {
            retry_interval: Duration::from_millis(env_u64_or("RECONNECT_RETRY_INTERVAL_MS", 2000)?),
            multiplier: env_or("RECONNECT_MULTIPLIER", "2.0")
                .parse()
                .map_err(|_| "RECONNECT_MULTIPLIER must be a number".to_string())?,
            max_retry_interval: Duration::from_millis(env_u64_or(
                "RECONNECT_MAX_INTERVAL_MS",
                60_000,
            )?),
            attempts: env_or("RECONNECT_ATTEMPTS", "-1")
                .parse()
                .map_err(|_| "RECONNECT_ATTEMPTS must be a number".to_string())?,
            failure_check_period: Duration::from_millis(env_u64_or(
                "RECONNECT_FAILURE_CHECK_PERIOD_MS",
                30_000,
            )?),
            connection_ttl: Duration::from_millis(env_u64_or("RECONNECT_CONNECTION_TTL_MS", 60_000)?),
            recovery_interval: Duration::from_millis(env_u64_or(
                "RECONNECT_RECOVERY_INTERVAL_MS",
                5000,
            )?),
        };

        Ok(Self {
            broker_url,
            broker_user: env_or("BROKER_USER", ""),
            broker_password: env_or("BROKER_PASSWORD", ""),
            addresses,
            subscriber_name: env_or("SUBSCRIBER_NAME", ""),
            concurrency,
            retry_attempts: env_u64_or("MESSAGE_RETRY_ATTEMPTS", 3)? as u32,
            retry_delay: Duration::from_millis(env_u64_or("MESSAGE_RETRY_DELAY_MS", 1000)?),
            reconnect,
            stream_mapping,
            acknowledge_messages: env_or("ACKNOWLEDGE_MESSAGES", "true")
                .parse()
                .map_err(|_| "ACKNOWLEDGE_MESSAGES must be true or false".to_string())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_band_range() {
        assert_eq!(ConcurrencyBand::parse("2-8"), Ok(ConcurrencyBand { min: 2, max: 8 }));
        assert_eq!(ConcurrencyBand::parse("4"), Ok(ConcurrencyBand { min: 4, max: 4 }));
    }

    #[test]
    fn test_concurrency_band_rejects_invalid() {
        assert!(ConcurrencyBand::parse("0-4").is_err());
        assert!(ConcurrencyBand::parse("8-2").is_err());
        assert!(ConcurrencyBand::parse("abc").is_err());
        assert!(ConcurrencyBand::parse("").is_err());
    }

    #[test]
    fn test_stream_mapping_parse() {
        let mapping = parse_stream_mapping(
            "BERNARDINI_UNIT_EVENTS=tfp-unit-events-stream, ASSET_DAMAGES=tfp-asset-damages-stream",
        )
        .unwrap();
        assert_eq!(
            mapping.get("BERNARDINI_UNIT_EVENTS").unwrap(),
            "tfp-unit-events-stream"
        );
        assert_eq!(mapping.get("ASSET_DAMAGES").unwrap(), "tfp-asset-damages-stream");
        assert_eq!(mapping.len(), 2);
    }

    #[test]
    fn test_stream_mapping_empty_and_invalid() {
        assert!(parse_stream_mapping("").unwrap().is_empty());
        assert!(parse_stream_mapping("missing-separator").is_err());
        assert!(parse_stream_mapping("=stream").is_err());
    }
}
