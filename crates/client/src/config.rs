use std::time::Duration;

/// Connection and timing settings shared by every surface.
///
/// Defaults match the dashboard's production cadence.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base HTTP URL of the compute service (default: `http://127.0.0.1:8000`).
    pub api_base: String,
    /// Period of the block grid refresh (default: 1.5 s).
    pub block_refresh: Duration,
    /// Period of the found-primes refresh (default: 2 s).
    pub prime_refresh: Duration,
    /// Delay between digits job status polls (default: 800 ms).
    pub digits_poll: Duration,
    /// Blocks listed by the grid (default: 6).
    pub block_list_limit: u32,
    /// Prime rows fetched per refresh before de-duplication (default: 200).
    pub prime_list_limit: u32,
    /// Worker concurrency requested when starting a block (default: 1).
    pub block_concurrency: u32,
    /// Per-request HTTP timeout (default: 30 s).
    pub http_timeout: Duration,
}

impl ClientConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8000".to_string(),
            block_refresh: Duration::from_millis(1500),
            prime_refresh: Duration::from_millis(2000),
            digits_poll: Duration::from_millis(800),
            block_list_limit: 6,
            prime_list_limit: 200,
            block_concurrency: 1,
            http_timeout: Duration::from_secs(30),
        }
    }
}
