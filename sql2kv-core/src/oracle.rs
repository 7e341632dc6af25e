//! Local commit timestamp oracle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Bits reserved for the logical counter.
pub const LOGICAL_BITS: u32 = 18;

/// Hands out strictly increasing hybrid timestamps `physical_ms << 18 | logical`
/// from the local clock. Within one millisecond the logical part counts up;
/// a clock that moves backwards never yields a smaller timestamp.
#[derive(Debug, Default)]
pub struct LocalOracle {
    last: AtomicU64,
}

impl LocalOracle {
    /// Create an oracle.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Next timestamp.
    pub fn timestamp(&self) -> u64 {
        let physical = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        self.timestamp_at(physical)
    }

    fn timestamp_at(&self, physical_ms: u64) -> u64 {
        let candidate = physical_ms << LOGICAL_BITS;
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let next = candidate.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }
}

/// Physical milliseconds of a timestamp.
#[must_use]
pub const fn physical_ms(ts: u64) -> u64 {
    ts >> LOGICAL_BITS
}
