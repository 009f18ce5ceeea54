//! Positions, snapshots and boundaries shared by the tracker, the planner and the recovery path.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Batch ids increase by one per committed batch and are never reused.
pub type BatchId = i64;

/// Batch id of the state that exists before anything was committed.
pub const INITIAL_BATCH_ID: BatchId = -1;

/// Sentinel used for both the byte offset and the sequence number of a partition that has not
/// been read yet. It is interpreted as "start of stream".
pub const SENTINEL: i64 = -1;

/// Identifies one partition of one stream. Orders by stream name, then numerically by index,
/// which is what keeps serialized maps deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId {
    pub stream: String,
    pub index: u32,
}

impl PartitionId {
    pub fn new(stream: impl Into<String>, index: u32) -> Self {
        Self {
            stream: stream.into(),
            index,
        }
    }

    /// All partitions `0..count` of a stream.
    pub fn all(stream: &str, count: u32) -> Vec<PartitionId> {
        (0..count).map(|i| PartitionId::new(stream, i)).collect()
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.stream, self.index)
    }
}

impl FromStr for PartitionId {
    type Err = Error;

    /// Parses `<stream>-<index>`. The stream name may itself contain dashes; the index is
    /// whatever follows the last one.
    fn from_str(s: &str) -> Result<Self> {
        let (stream, index) = s
            .rsplit_once('-')
            .ok_or_else(|| Error::Serde(format!("partition key {s:?} has no index")))?;
        if stream.is_empty() {
            return Err(Error::Serde(format!("partition key {s:?} has no stream name")));
        }
        let index = index
            .parse::<u32>()
            .map_err(|e| Error::Serde(format!("partition key {s:?} has a bad index: {e}")))?;
        Ok(PartitionId::new(stream, index))
    }
}

impl Serialize for PartitionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PartitionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        key.parse().map_err(serde::de::Error::custom)
    }
}

/// Read position within a partition. Only `seq_no` takes part in rate arithmetic, `offset` is an
/// opaque resume token for the upstream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionOffset {
    pub offset: i64,
    pub seq_no: i64,
}

impl PartitionOffset {
    pub const START_OF_STREAM: PartitionOffset = PartitionOffset {
        offset: SENTINEL,
        seq_no: SENTINEL,
    };

    pub fn new(offset: i64, seq_no: i64) -> Self {
        Self { offset, seq_no }
    }

    pub fn is_sentinel(&self) -> bool {
        self.seq_no == SENTINEL
    }

    /// Sequence number to use for rate arithmetic; a sentinel reads from the first message.
    pub fn rate_seq_no(&self) -> i64 {
        self.seq_no.max(0)
    }
}

/// Everything at or before `batch_id` has been durably processed. Each offset is the next
/// position to read in its partition. Replaced wholesale on every commit, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedState {
    pub batch_id: BatchId,
    pub offsets: BTreeMap<PartitionId, PartitionOffset>,
}

impl CommittedState {
    /// The state of a stream nothing was ever committed for.
    pub fn initial<'a>(partitions: impl IntoIterator<Item = &'a PartitionId>) -> Self {
        Self {
            batch_id: INITIAL_BATCH_ID,
            offsets: partitions
                .into_iter()
                .map(|p| (p.clone(), PartitionOffset::START_OF_STREAM))
                .collect(),
        }
    }

    pub fn is_initial(&self) -> bool {
        self.batch_id == INITIAL_BATCH_ID
    }

    pub fn next_batch_id(&self) -> BatchId {
        self.batch_id + 1
    }

    /// Committed sequence numbers as the rate limiter sees them.
    pub fn rate_seq_nos(&self) -> BTreeMap<PartitionId, i64> {
        self.offsets
            .iter()
            .map(|(p, o)| (p.clone(), o.rate_seq_no()))
            .collect()
    }
}

/// The boundary planned for one upcoming batch. Its JSON form is also the token the outer
/// engine persists as its own start/end markers, so the shape must stay stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecord {
    pub batch_id: BatchId,
    pub target_seq_nums: BTreeMap<PartitionId, i64>,
}

impl BatchRecord {
    pub fn new(batch_id: BatchId, target_seq_nums: BTreeMap<PartitionId, i64>) -> Self {
        Self {
            batch_id,
            target_seq_nums,
        }
    }

    /// Marker the engine holds before any real batch was planned.
    pub fn bootstrap() -> Self {
        Self::new(INITIAL_BATCH_ID, BTreeMap::new())
    }

    pub fn is_bootstrap(&self) -> bool {
        self.batch_id == INITIAL_BATCH_ID
    }

    /// Keys are always written in partition order (stream, then numeric index).
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Accepts keys in any order. Only tokens written by [Self::to_json] come back byte for byte;
    /// any other key order is normalized when written again.
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Latest available position per partition as observed at `fetched_at`. Never persisted.
#[derive(Debug, Clone)]
pub struct FetchedHighest {
    pub positions: BTreeMap<PartitionId, PartitionOffset>,
    pub fetched_at: Instant,
}

impl FetchedHighest {
    pub fn new(positions: BTreeMap<PartitionId, PartitionOffset>) -> Self {
        Self {
            positions,
            fetched_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    pub fn seq_nos(&self) -> BTreeMap<PartitionId, i64> {
        self.positions
            .iter()
            .map(|(p, o)| (p.clone(), o.seq_no))
            .collect()
    }
}

/// What the engine should read for one partition: `[from.seq_no, until_seq_no)`, resuming at
/// `from.offset`. `until_seq_no` is one past the batch target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRange {
    pub partition: PartitionId,
    pub from: PartitionOffset,
    pub until_seq_no: i64,
}

impl PartitionRange {
    pub fn len(&self) -> i64 {
        (self.until_seq_no - self.from.rate_seq_no()).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_id_key_format() {
        let p = PartitionId::new("click-events", 12);
        assert_eq!(p.to_string(), "click-events-12");
        assert_eq!("click-events-12".parse::<PartitionId>().unwrap(), p);

        assert!("noindex".parse::<PartitionId>().is_err());
        assert!("-3".parse::<PartitionId>().is_err());
        assert!("orders-x".parse::<PartitionId>().is_err());
    }

    #[test]
    fn test_partition_id_orders_numerically() {
        let mut ids = vec![
            PartitionId::new("s", 10),
            PartitionId::new("s", 2),
            PartitionId::new("s", 1),
        ];
        ids.sort();
        assert_eq!(
            ids.iter().map(|p| p.index).collect::<Vec<_>>(),
            vec![1, 2, 10]
        );
    }

    #[test]
    fn test_batch_record_json_shape() {
        let record = BatchRecord::new(
            5,
            BTreeMap::from([
                (PartitionId::new("eh", 0), 100),
                (PartitionId::new("eh", 1), 200),
            ]),
        );
        let json = record.to_json().unwrap();
        assert_eq!(json, r#"{"batchId":5,"targetSeqNums":{"eh-0":100,"eh-1":200}}"#);
        assert_eq!(BatchRecord::from_json(&json).unwrap(), record);
    }

    #[test]
    fn test_batch_record_reserializes_byte_for_byte() {
        let token = r#"{"batchId":12,"targetSeqNums":{"eh-2":7,"eh-10":9}}"#;
        let parsed = BatchRecord::from_json(token).unwrap();
        // keys come back in numeric partition order
        assert_eq!(
            parsed.to_json().unwrap(),
            r#"{"batchId":12,"targetSeqNums":{"eh-2":7,"eh-10":9}}"#
        );
    }

    #[test]
    fn test_batch_record_normalizes_lexical_key_order() {
        let token = r#"{"batchId":12,"targetSeqNums":{"eh-10":9,"eh-2":7}}"#;
        let parsed = BatchRecord::from_json(token).unwrap();
        assert_eq!(parsed.target_seq_nums.get(&PartitionId::new("eh", 10)), Some(&9));
        assert_eq!(
            parsed.to_json().unwrap(),
            r#"{"batchId":12,"targetSeqNums":{"eh-2":7,"eh-10":9}}"#
        );
    }

    #[test]
    fn test_batch_record_rejects_malformed_key() {
        let token = r#"{"batchId":1,"targetSeqNums":{"eh":7}}"#;
        assert!(matches!(
            BatchRecord::from_json(token),
            Err(Error::Serde(_))
        ));
    }

    #[test]
    fn test_initial_state_is_all_sentinel() {
        let partitions = PartitionId::all("eh", 3);
        let state = CommittedState::initial(&partitions);
        assert!(state.is_initial());
        assert_eq!(state.next_batch_id(), 0);
        assert_eq!(state.offsets.len(), 3);
        assert!(state.offsets.values().all(PartitionOffset::is_sentinel));
        assert!(state.rate_seq_nos().values().all(|s| *s == 0));
    }

    #[test]
    fn test_range_len() {
        let range = PartitionRange {
            partition: PartitionId::new("eh", 0),
            from: PartitionOffset::new(4096, 40),
            until_seq_no: 50,
        };
        assert_eq!(range.len(), 10);

        let empty = PartitionRange {
            partition: PartitionId::new("eh", 0),
            from: PartitionOffset::START_OF_STREAM,
            until_seq_no: 0,
        };
        assert!(empty.is_empty());
    }
}
