use std::str::FromStr;

use anyhow::Context;

/// Runtime settings, read from the environment (and `.env`, if present).
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub db_max_connections: u32,
    /// Largest websocket message accepted from a client, in bytes.
    pub max_message_size: usize,
    /// Consecutive read errors tolerated before a connection is closed.
    pub read_error_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_owned(),
            database_url: "sqlite://db.sqlite".to_owned(),
            db_max_connections: 16,
            max_message_size: 1024 * 1024,
            read_error_limit: 3,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            bind_addr: dotenv::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: dotenv::var("DATABASE_URL").unwrap_or(defaults.database_url),
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", dotenv::var("DB_MAX_CONNECTIONS").ok(), defaults.db_max_connections)?,
            max_message_size: parse_or("MAX_MESSAGE_SIZE", dotenv::var("MAX_MESSAGE_SIZE").ok(), defaults.max_message_size)?,
            read_error_limit: parse_or("READ_ERROR_LIMIT", dotenv::var("READ_ERROR_LIMIT").ok(), defaults.read_error_limit)?,
        })
    }
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(value) => value.trim().parse().with_context(|| format!("invalid {key}: {value:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_listen_on_8080() {
        let config = Config::default();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.db_max_connections, 16);
        assert_eq!(config.read_error_limit, 3);
    }

    #[test]
    fn missing_value_uses_default() {
        assert_eq!(parse_or("READ_ERROR_LIMIT", None, 3u32).unwrap(), 3);
    }

    #[test]
    fn present_value_is_parsed() {
        assert_eq!(parse_or("MAX_MESSAGE_SIZE", Some(" 4096 ".to_owned()), 0usize).unwrap(), 4096);
    }

    #[test]
    fn garbage_value_names_the_key() {
        let err = parse_or("DB_MAX_CONNECTIONS", Some("lots".to_owned()), 16u32).unwrap_err();
        assert!(err.to_string().contains("DB_MAX_CONNECTIONS"));
    }
}
