use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Service epoch: 2025-01-01T00:00:00Z.
const PALAVER_EPOCH_MS: u64 = 1_735_689_600_000;

const WORKER_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const WORKER_MASK: u64 = (1 << WORKER_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Mints a 64-bit id: milliseconds since the service epoch in the high bits,
/// then the worker id, then a rolling per-process sequence. The sequence
/// disambiguates bursts landing in the same millisecond.
pub fn generate(worker_id: u16) -> i64 {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as u64;
    let elapsed = now_ms.saturating_sub(PALAVER_EPOCH_MS);
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) & SEQUENCE_MASK;
    let worker = u64::from(worker_id) & WORKER_MASK;
    ((elapsed << (WORKER_BITS + SEQUENCE_BITS)) | (worker << SEQUENCE_BITS) | seq) as i64
}

/// Unix milliseconds the id was minted at.
pub fn timestamp_millis(id: i64) -> u64 {
    ((id as u64) >> (WORKER_BITS + SEQUENCE_BITS)) + PALAVER_EPOCH_MS
}

/// Worker that minted the id.
pub fn worker_id(id: i64) -> u16 {
    (((id as u64) >> SEQUENCE_BITS) & WORKER_MASK) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_millisecond_means_larger_id() {
        let a = generate(1);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = generate(1);
        assert!(b > a, "{b} should sort after {a}");
    }

    #[test]
    fn id_fields_round_trip() {
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let id = generate(513);
        assert_eq!(worker_id(id), 513);
        let minted = timestamp_millis(id);
        assert!(minted >= before && minted <= before + 1_000);
    }

    #[test]
    fn oversized_worker_id_is_masked() {
        let id = generate(u16::MAX);
        assert_eq!(worker_id(id), (u16::MAX as u64 & WORKER_MASK) as u16);
    }
}
