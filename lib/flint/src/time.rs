use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

static LAST_MONOTONIC: AtomicU64 = AtomicU64::new(0);

/// Returns the current unix timestamp in microseconds, strictly increasing
/// across calls within this process. Used as the monotonic-time field of
/// handshake and rekey signatures; receivers enforce per-peer non-regression
/// rather than trusting the absolute value.
pub fn monotonic_usecs() -> u64 {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_micros() as u64;

    let mut prev = LAST_MONOTONIC.load(Ordering::SeqCst);
    loop {
        let next = now.max(prev + 1);
        match LAST_MONOTONIC.compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}
