//! Settings parsed from string options, plus the stream uid generator the bootstrap owns.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};
use crate::planner::PlannerOptions;
use crate::retry::Backoff;
use crate::store::StoreBackend;
use crate::tracker::TrackerOptions;

const STREAM_NAME: &str = "streamName";
const PROGRESS_TRACKING_DIRECTORY: &str = "progressTrackingDirectory";
const MAX_RATE_PER_PARTITION: &str = "maxRatePerPartition";
const FAIL_ON_MISSING_STARTING_OFFSET: &str = "failOnMissingStartingOffset";
const CONSUMER_GROUP: &str = "consumerGroup";
const PARTITION_COUNT: &str = "partitionCount";
const STORE_BACKEND: &str = "storeBackend";
const FETCH_TIMEOUT_MS: &str = "fetchTimeoutMs";
const FETCH_RETRY_ATTEMPTS: &str = "fetchRetryAttempts";
const COMMIT_TIMEOUT_MS: &str = "commitTimeoutMs";
const COMMIT_RETRY_ATTEMPTS: &str = "commitRetryAttempts";
const SNAPSHOT_RETENTION: &str = "snapshotRetention";
const STRICT_CONSUMPTION_CHECK: &str = "strictConsumptionCheck";

/// Every option name [Settings::load] understands.
pub const OPTION_NAMES: [&str; 13] = [
    STREAM_NAME,
    PROGRESS_TRACKING_DIRECTORY,
    MAX_RATE_PER_PARTITION,
    FAIL_ON_MISSING_STARTING_OFFSET,
    CONSUMER_GROUP,
    PARTITION_COUNT,
    STORE_BACKEND,
    FETCH_TIMEOUT_MS,
    FETCH_RETRY_ATTEMPTS,
    COMMIT_TIMEOUT_MS,
    COMMIT_RETRY_ATTEMPTS,
    SNAPSHOT_RETENTION,
    STRICT_CONSUMPTION_CHECK,
];

const DEFAULT_MAX_RATE_PER_PARTITION: i64 = 10_000;
const DEFAULT_CONSUMER_GROUP: &str = "$Default";
const DEFAULT_FETCH_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_FETCH_RETRY_ATTEMPTS: usize = 5;
const DEFAULT_COMMIT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_COMMIT_RETRY_ATTEMPTS: usize = 3;
const DEFAULT_SNAPSHOT_RETENTION: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackendKind {
    Fs,
    Memory,
}

impl FromStr for StoreBackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fs" => Ok(StoreBackendKind::Fs),
            "memory" => Ok(StoreBackendKind::Memory),
            other => Err(Error::Config(format!(
                "{STORE_BACKEND} must be 'fs' or 'memory', got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub stream_name: String,
    pub progress_tracking_directory: PathBuf,
    pub max_rate_per_partition: i64,
    pub fail_on_missing_starting_offset: bool,
    pub consumer_group: String,
    pub partition_count: Option<u32>,
    pub store_backend: StoreBackendKind,
    pub fetch_timeout: Duration,
    pub fetch_retry_attempts: usize,
    pub commit_timeout: Duration,
    pub commit_retry_attempts: usize,
    pub snapshot_retention: usize,
    pub strict_consumption_check: bool,
}

impl Settings {
    /// Builds settings from `(name, value)` pairs. Names are case sensitive; a later pair wins
    /// over an earlier one with the same name.
    pub fn load<K, V>(options: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut options: HashMap<String, String> = options
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let stream_name = required(&mut options, STREAM_NAME)?;
        let progress_tracking_directory =
            PathBuf::from(required(&mut options, PROGRESS_TRACKING_DIRECTORY)?);

        let max_rate_per_partition: i64 = optional(&mut options, MAX_RATE_PER_PARTITION)?
            .unwrap_or(DEFAULT_MAX_RATE_PER_PARTITION);
        if max_rate_per_partition <= 0 {
            return Err(Error::Config(format!(
                "{MAX_RATE_PER_PARTITION} must be positive, got {max_rate_per_partition}"
            )));
        }

        let partition_count: Option<u32> = optional(&mut options, PARTITION_COUNT)?;
        if partition_count == Some(0) {
            return Err(Error::Config(format!("{PARTITION_COUNT} must be positive")));
        }

        let snapshot_retention =
            optional(&mut options, SNAPSHOT_RETENTION)?.unwrap_or(DEFAULT_SNAPSHOT_RETENTION);
        if snapshot_retention == 0 {
            return Err(Error::Config(format!("{SNAPSHOT_RETENTION} must be positive")));
        }

        let settings = Settings {
            stream_name,
            progress_tracking_directory,
            max_rate_per_partition,
            fail_on_missing_starting_offset: optional(
                &mut options,
                FAIL_ON_MISSING_STARTING_OFFSET,
            )?
            .unwrap_or(false),
            consumer_group: options
                .remove(CONSUMER_GROUP)
                .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
            partition_count,
            store_backend: optional(&mut options, STORE_BACKEND)?.unwrap_or(StoreBackendKind::Fs),
            fetch_timeout: Duration::from_millis(
                optional(&mut options, FETCH_TIMEOUT_MS)?.unwrap_or(DEFAULT_FETCH_TIMEOUT_MS),
            ),
            fetch_retry_attempts: optional(&mut options, FETCH_RETRY_ATTEMPTS)?
                .unwrap_or(DEFAULT_FETCH_RETRY_ATTEMPTS),
            commit_timeout: Duration::from_millis(
                optional(&mut options, COMMIT_TIMEOUT_MS)?.unwrap_or(DEFAULT_COMMIT_TIMEOUT_MS),
            ),
            commit_retry_attempts: optional(&mut options, COMMIT_RETRY_ATTEMPTS)?
                .unwrap_or(DEFAULT_COMMIT_RETRY_ATTEMPTS),
            snapshot_retention,
            strict_consumption_check: optional(&mut options, STRICT_CONSUMPTION_CHECK)?
                .unwrap_or(true),
        };

        let mut unknown: Vec<_> = options.into_keys().collect();
        unknown.sort();
        for key in unknown {
            warn!(option = %key, "Ignoring unknown option");
        }
        Ok(settings)
    }

    pub fn store_backend(&self) -> StoreBackend {
        match self.store_backend {
            StoreBackendKind::Fs => StoreBackend::Fs(self.progress_tracking_directory.clone()),
            StoreBackendKind::Memory => StoreBackend::Memory,
        }
    }

    pub fn tracker_options(&self) -> TrackerOptions {
        TrackerOptions {
            commit_timeout: self.commit_timeout,
            retention: self.snapshot_retention,
        }
    }

    pub fn planner_options(&self) -> PlannerOptions {
        PlannerOptions {
            partition_count: self.partition_count,
            fetch_timeout: self.fetch_timeout,
            fetch_backoff: Backoff::with_retries(self.fetch_retry_attempts),
            commit_backoff: Backoff::with_retries(self.commit_retry_attempts),
            fail_on_missing_starting_offset: self.fail_on_missing_starting_offset,
            strict_consumption_check: self.strict_consumption_check,
        }
    }
}

fn required(options: &mut HashMap<String, String>, key: &str) -> Result<String> {
    match options.remove(key) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(Error::Config(format!("{key} is required"))),
    }
}

fn optional<T>(options: &mut HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    options
        .remove(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("invalid {key} {value:?}: {e}")))
        })
        .transpose()
}

/// Hands out the uid that namespaces a stream's snapshots in the store. One generator per
/// process, owned by whoever wires the runner up.
#[derive(Debug, Default)]
pub struct StreamIdGenerator {
    next: AtomicU64,
}

impl StreamIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `{consumer_group}_{stream}_{n}`, `n` counting up from zero per generator.
    pub fn next_uid(&self, consumer_group: &str, stream: &str) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{consumer_group}_{stream}_{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Vec<(&'static str, &'static str)> {
        vec![
            (STREAM_NAME, "telemetry"),
            (PROGRESS_TRACKING_DIRECTORY, "/var/lib/offsetgate"),
        ]
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::load(minimal()).unwrap();
        assert_eq!(settings.stream_name, "telemetry");
        assert_eq!(
            settings.progress_tracking_directory,
            PathBuf::from("/var/lib/offsetgate")
        );
        assert_eq!(settings.max_rate_per_partition, 10_000);
        assert!(!settings.fail_on_missing_starting_offset);
        assert_eq!(settings.consumer_group, "$Default");
        assert_eq!(settings.partition_count, None);
        assert_eq!(settings.store_backend, StoreBackendKind::Fs);
        assert_eq!(settings.fetch_timeout, Duration::from_secs(5));
        assert_eq!(settings.commit_timeout, Duration::from_secs(10));
        assert_eq!(settings.snapshot_retention, 100);
        assert!(settings.strict_consumption_check);
        assert_eq!(
            settings.store_backend(),
            StoreBackend::Fs(PathBuf::from("/var/lib/offsetgate"))
        );
    }

    #[test]
    fn test_overrides() {
        let mut options = minimal();
        options.extend([
            (MAX_RATE_PER_PARTITION, "250"),
            (FAIL_ON_MISSING_STARTING_OFFSET, "true"),
            (CONSUMER_GROUP, "analytics"),
            (PARTITION_COUNT, "4"),
            (STORE_BACKEND, "memory"),
            (FETCH_TIMEOUT_MS, "750"),
            (COMMIT_RETRY_ATTEMPTS, "7"),
            (STRICT_CONSUMPTION_CHECK, "false"),
        ]);

        let settings = Settings::load(options).unwrap();
        assert_eq!(settings.max_rate_per_partition, 250);
        assert!(settings.fail_on_missing_starting_offset);
        assert_eq!(settings.consumer_group, "analytics");
        assert_eq!(settings.partition_count, Some(4));
        assert_eq!(settings.store_backend(), StoreBackend::Memory);

        let planner = settings.planner_options();
        assert_eq!(planner.fetch_timeout, Duration::from_millis(750));
        assert_eq!(planner.commit_backoff.max_retries(), 7);
        assert!(!planner.strict_consumption_check);
    }

    #[test]
    fn test_missing_required_options() {
        let err = Settings::load([(STREAM_NAME, "telemetry")]).unwrap_err();
        assert!(err.to_string().contains(PROGRESS_TRACKING_DIRECTORY));

        let err = Settings::load([(STREAM_NAME, " "), (PROGRESS_TRACKING_DIRECTORY, "/tmp")])
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_invalid_values() {
        for (key, value) in [
            (MAX_RATE_PER_PARTITION, "0"),
            (MAX_RATE_PER_PARTITION, "lots"),
            (PARTITION_COUNT, "0"),
            (STORE_BACKEND, "s3"),
            (STRICT_CONSUMPTION_CHECK, "yes"),
            (SNAPSHOT_RETENTION, "0"),
        ] {
            let mut options = minimal();
            options.push((key, value));
            assert!(
                matches!(Settings::load(options), Err(Error::Config(_))),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_unknown_options_are_ignored() {
        let mut options = minimal();
        options.push(("maxRatePerPartitoin", "5"));
        let settings = Settings::load(options).unwrap();
        assert_eq!(settings.max_rate_per_partition, 10_000);
    }

    #[test]
    fn test_stream_uids_are_unique() {
        let ids = StreamIdGenerator::new();
        assert_eq!(ids.next_uid("$Default", "telemetry"), "$Default_telemetry_0");
        assert_eq!(ids.next_uid("$Default", "telemetry"), "$Default_telemetry_1");
        assert_eq!(ids.next_uid("analytics", "orders"), "analytics_orders_2");
    }
}
