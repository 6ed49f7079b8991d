use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::error::{Error, ErrorDetails};

/// Allocates row ids. Ids from one call are distinct and increasing.
pub trait IdGenerator: Send + Sync {
    fn gen_id(&self) -> Result<i64, Error> {
        self.gen_multi_ids(1)?.into_iter().next().ok_or_else(|| {
            Error::new(ErrorDetails::CommonInternal {
                message: "Id generator returned no ids".to_string(),
            })
        })
    }

    /// Two ids for rows created together, such as a record and the reference to it.
    fn gen_id_pair(&self) -> Result<(i64, i64), Error> {
        let ids = self.gen_multi_ids(2)?;
        let [first, second] = <[i64; 2]>::try_from(ids).map_err(|ids| {
            Error::new(ErrorDetails::CommonInternal {
                message: format!("Id generator returned {} ids, expected 2", ids.len()),
            })
        })?;
        Ok((first, second))
    }

    fn gen_multi_ids(&self, count: usize) -> Result<Vec<i64>, Error>;
}

/// Epoch for `TimeOrderedIdGenerator` (2024-01-01T00:00:00Z, in milliseconds).
const ID_EPOCH_MS: i64 = 1_704_067_200_000;
const SEQUENCE_BITS: u32 = 22;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

/// Process-local generator laying out ids as `millis_since_epoch << 22 | sequence`.
/// Ids stay roughly time-ordered; the sequence borrows from the next millisecond when exhausted.
pub struct TimeOrderedIdGenerator {
    last: AtomicI64,
}

impl TimeOrderedIdGenerator {
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }

    fn now_component() -> Result<i64, Error> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| {
                Error::new(ErrorDetails::CommonInternal {
                    message: format!("System clock is before unix epoch: {e}"),
                })
            })?
            .as_millis() as i64;
        Ok((millis - ID_EPOCH_MS).max(0) << SEQUENCE_BITS)
    }
}

impl Default for TimeOrderedIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for TimeOrderedIdGenerator {
    fn gen_multi_ids(&self, count: usize) -> Result<Vec<i64>, Error> {
        let count = count as i64;
        let floor = Self::now_component()?;
        let mut start = 0;
        // Reserve `count` ids after max(last, floor) in one CAS.
        self.last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                start = last.max(floor - 1) + 1;
                Some(start + count - 1)
            })
            .map_err(|_| {
                Error::new(ErrorDetails::CommonInternal {
                    message: "Failed to reserve ids".to_string(),
                })
            })?;
        Ok((start..start + count).collect())
    }
}

/// Deterministic generator counting up from a seed.
pub struct SequentialIdGenerator {
    next: AtomicI64,
}

impl SequentialIdGenerator {
    pub fn new(start: i64) -> Self {
        Self {
            next: AtomicI64::new(start),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn gen_multi_ids(&self, count: usize) -> Result<Vec<i64>, Error> {
        let count = count as i64;
        let start = self.next.fetch_add(count, Ordering::SeqCst);
        Ok((start..start + count).collect())
    }
}

/// Trace ids are UUIDv7 strings so they sort by creation time.
pub fn new_trace_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Log ids correlate every row written by one scheduler tick or lifecycle call.
pub fn new_log_id() -> String {
    Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_ordered_ids_are_unique_and_increasing() {
        let generator = TimeOrderedIdGenerator::new();
        let first = generator.gen_multi_ids(1000).unwrap();
        let second = generator.gen_multi_ids(10).unwrap();
        assert_eq!(first.len(), 1000);
        assert!(first.windows(2).all(|w| w[0] < w[1]));
        assert!(
            second[0] > first[999],
            "a later batch must start after the previous batch"
        );
        assert!(first[0] > 0);
    }

    #[test]
    fn test_sequential_ids() {
        let generator = SequentialIdGenerator::new(100);
        assert_eq!(generator.gen_id().unwrap(), 100);
        assert_eq!(generator.gen_multi_ids(3).unwrap(), vec![101, 102, 103]);
        assert!(generator.gen_multi_ids(0).unwrap().is_empty());
        assert_eq!(generator.gen_id_pair().unwrap(), (104, 105));
    }

    struct ShortGenerator;

    impl IdGenerator for ShortGenerator {
        fn gen_multi_ids(&self, _count: usize) -> Result<Vec<i64>, Error> {
            Ok(vec![1])
        }
    }

    #[test]
    fn test_short_allocation_is_an_error() {
        let err = ShortGenerator.gen_id_pair().unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::CommonInternal { .. }
        ));
    }
}
