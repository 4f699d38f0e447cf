/// Block identifiers are small integers assigned by the compute service.
pub type BlockId = i64;

/// A Mersenne exponent `p` (the test is on `2^p - 1`).
pub type Exponent = u64;

/// Opaque job token handed out by the compute service.
pub type JobId = String;

/// Wall-clock seconds since the Unix epoch, as reported by the service.
pub type UnixSeconds = f64;

/// All client-side timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
