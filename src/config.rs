use std::time::Duration;

use anyhow::Context;

/// Who receives a freshly persisted chat message.
///
/// `All` mirrors the legacy dashboard, which fanned every message out to
/// every connected client. `Participants` restricts delivery to the
/// sender's and receiver's connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutScope {
    All,
    Participants,
}

impl FanoutScope {
    fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw {
            "all" => Ok(Self::All),
            "participants" => Ok(Self::Participants),
            other => anyhow::bail!("CHAT_FANOUT must be `all` or `participants`, got `{other}`"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub fanout: FanoutScope,
    /// How often the server pings each channel.
    pub heartbeat_interval: Duration,
    /// How long after a ping a silent channel is considered dead.
    pub pong_timeout: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_url = dotenv::var("DATABASE_URL").context("DATABASE_URL is not set")?;
        let bind_addr = dotenv::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned());
        let fanout = match dotenv::var("CHAT_FANOUT") {
            Ok(raw) => FanoutScope::parse(&raw)?,
            Err(_) => FanoutScope::All,
        };
        let heartbeat_interval = secs_var("CHAT_HEARTBEAT_SECS", 30)?;
        let pong_timeout = secs_var("CHAT_PONG_TIMEOUT_SECS", 10)?;

        Ok(Self {
            database_url,
            bind_addr,
            fanout,
            heartbeat_interval,
            pong_timeout,
        })
    }
}

fn secs_var(key: &str, default: u64) -> anyhow::Result<Duration> {
    let secs = match dotenv::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("{key} must be an integer"))?,
        Err(_) => default,
    };
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fanout_scope_parses_known_values() {
        assert_eq!(FanoutScope::parse("all").unwrap(), FanoutScope::All);
        assert_eq!(
            FanoutScope::parse("participants").unwrap(),
            FanoutScope::Participants
        );
        assert!(FanoutScope::parse("everyone").is_err());
    }
}
