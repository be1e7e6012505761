/// Utility functions and helpers
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Weight of the newest sample in [`RollingAverage`]
const EWMA_ALPHA: f64 = 0.2;

/// Generate a unique ID based on timestamp and random component
pub fn generate_id(prefix: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();

    let random: u32 = rand::random();
    format!("{}-{}-{:x}", prefix, timestamp, random)
}

/// Hex-encoded SHA-256 over the given parts, truncated to `len_bytes`
pub fn stable_hash(parts: &[&[u8]], len_bytes: usize) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
        // Separator keeps ("ab", "c") and ("a", "bc") distinct
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..len_bytes.min(digest.len())])
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max`
pub fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .unwrap_or(max)
        .min(max)
}

/// Glob match supporting `*` and `?`.
///
/// A pattern without wildcards matches as a substring.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains(|c| c == '*' || c == '?') {
        return text.contains(pattern);
    }

    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Bit pattern marking an average that has no samples yet
const UNSEEDED: u64 = u64::MAX;

/// Lock-free exponentially weighted moving average of latencies
#[derive(Debug)]
pub struct RollingAverage {
    bits: AtomicU64,
    samples: AtomicU64,
}

impl Default for RollingAverage {
    fn default() -> Self {
        Self {
            bits: AtomicU64::new(UNSEEDED),
            samples: AtomicU64::new(0),
        }
    }
}

impl RollingAverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        // The first sample seeds the average inside the same CAS that
        // folds later samples in
        let _ = self
            .bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let next = if bits == UNSEEDED {
                    sample
                } else {
                    let current = f64::from_bits(bits);
                    current + EWMA_ALPHA * (sample - current)
                };
                Some(next.to_bits())
            });
        self.samples.fetch_add(1, Ordering::AcqRel);
    }

    pub fn average_ms(&self) -> f64 {
        match self.bits.load(Ordering::Acquire) {
            UNSEEDED => 0.0,
            bits => f64::from_bits(bits),
        }
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Acquire)
    }
}
