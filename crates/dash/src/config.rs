use std::path::PathBuf;
use std::time::Duration;

use llwatch_client::ClientConfig;

/// Front-end configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct DashConfig {
    pub client: ClientConfig,
    /// Where the active-block selection is persisted.
    pub state_dir: PathBuf,
    /// Emit JSON log lines instead of the human-readable format.
    pub log_json: bool,
}

impl DashConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default                 |
    /// |-----------------------------|-------------------------|
    /// | `LLWATCH_API_BASE`          | `http://127.0.0.1:8000` |
    /// | `LLWATCH_STATE_DIR`         | `.llwatch`              |
    /// | `LLWATCH_BLOCK_REFRESH_MS`  | `1500`                  |
    /// | `LLWATCH_PRIME_REFRESH_MS`  | `2000`                  |
    /// | `LLWATCH_DIGITS_POLL_MS`    | `800`                   |
    /// | `LLWATCH_HTTP_TIMEOUT_SECS` | `30`                    |
    /// | `LLWATCH_LOG_JSON`          | unset                   |
    ///
    /// A value that does not parse is replaced by its default with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let api_base = lookup("LLWATCH_API_BASE").unwrap_or_else(|| "http://127.0.0.1:8000".into());
        let mut client = ClientConfig::new(api_base);

        client.block_refresh = millis(&lookup, "LLWATCH_BLOCK_REFRESH_MS", client.block_refresh);
        client.prime_refresh = millis(&lookup, "LLWATCH_PRIME_REFRESH_MS", client.prime_refresh);
        client.digits_poll = millis(&lookup, "LLWATCH_DIGITS_POLL_MS", client.digits_poll);
        client.http_timeout = Duration::from_secs(number(
            &lookup,
            "LLWATCH_HTTP_TIMEOUT_SECS",
            client.http_timeout.as_secs(),
        ));

        let state_dir = lookup("LLWATCH_STATE_DIR")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| ".llwatch".into())
            .into();
        let log_json = lookup("LLWATCH_LOG_JSON").is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));

        Self {
            client,
            state_dir,
            log_json,
        }
    }
}

fn number(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => value,
        _ => {
            tracing::warn!(key, value = %raw, default, "Ignoring invalid setting");
            default
        }
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    Duration::from_millis(number(lookup, key, default.as_millis() as u64))
}
