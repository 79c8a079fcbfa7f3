//! Hybrid logical clock producing sortable causal timestamps.
//!
//! A timestamp is a 16-character string: 7 characters encode 42 bits of
//! logical millisecond time, 4 characters encode a 24-bit monotonic counter,
//! and 5 characters encode a 30-bit hash of the owning replica's id. The
//! encoding alphabet is in ascending ASCII order, so plain lexicographic
//! comparison of two timestamps is exactly causal-order comparison.
//!
//! The empty string is reserved for unstamped bootstrap defaults and sorts
//! before every real timestamp.

use super::stamp::fnv1a;

/// A causal timestamp: either empty (bootstrap default) or 16 sortable chars.
pub type Time = String;

/// 64-character alphabet in ascending ASCII order, so encoded strings sort
/// the same way as the numbers they encode.
const ALPHABET: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

const TIME_CHARS: usize = 7; // 42 bits of milliseconds
const COUNTER_CHARS: usize = 4; // 24 bits
const SUFFIX_CHARS: usize = 5; // 30 bits of replica-id hash

/// Total length of a non-empty timestamp.
pub const TIME_LEN: usize = TIME_CHARS + COUNTER_CHARS + SUFFIX_CHARS;

const TIME_MASK: u64 = (1 << 42) - 1;
const COUNTER_MASK: u32 = (1 << 24) - 1;
const SUFFIX_MASK: u32 = (1 << 30) - 1;

fn encode(mut num: u64, chars: usize) -> String {
    let mut out = vec![0u8; chars];
    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(num & 63) as usize];
        num >>= 6;
    }
    String::from_utf8(out).unwrap_or_default()
}

fn decode_char(c: u8) -> Option<u64> {
    ALPHABET.iter().position(|&a| a == c).map(|i| i as u64)
}

fn decode(chars: &[u8]) -> Option<u64> {
    let mut num: u64 = 0;
    for &c in chars {
        num = (num << 6) | decode_char(c)?;
    }
    Some(num)
}

/// Whether a string is a structurally valid timestamp.
///
/// Empty is valid (bootstrap default); otherwise the string must be exactly
/// [`TIME_LEN`] characters from the sortable alphabet.
pub fn is_valid_time(time: &str) -> bool {
    time.is_empty()
        || (time.len() == TIME_LEN && time.bytes().all(|c| decode_char(c).is_some()))
}

fn wall_clock_ms() -> u64 {
    (chrono::Utc::now().timestamp_millis().max(0) as u64) & TIME_MASK
}

/// Per-replica hybrid logical clock.
///
/// Two replicas never produce the identical timestamp for concurrent events:
/// their suffixes differ, which makes the greater-timestamp-wins tie-break
/// deterministic and total.
#[derive(Debug, Clone)]
pub struct Hlc {
    logical_ms: u64,
    counter: u32,
    suffix: String,
}

impl Hlc {
    /// Create a clock for the given replica id.
    pub fn new(replica_id: &str) -> Self {
        let suffix = encode(
            (fnv1a(replica_id.as_bytes()) & SUFFIX_MASK) as u64,
            SUFFIX_CHARS,
        );
        Self {
            logical_ms: 0,
            counter: 0,
            suffix,
        }
    }

    /// Emit the next timestamp, strictly greater than any emitted or observed
    /// so far on this clock.
    ///
    /// Must be called for every causally-ordered event, including local
    /// writes.
    pub fn next(&mut self) -> Time {
        let now = wall_clock_ms();
        if now > self.logical_ms {
            self.logical_ms = now;
            self.counter = 0;
        } else {
            self.counter = (self.counter + 1) & COUNTER_MASK;
        }
        format!(
            "{}{}{}",
            encode(self.logical_ms, TIME_CHARS),
            encode(self.counter as u64, COUNTER_CHARS),
            self.suffix
        )
    }

    /// Fold a timestamp seen on any message or merged leaf into the clock, so
    /// subsequently emitted timestamps dominate it.
    ///
    /// Structurally invalid or empty timestamps are ignored.
    pub fn observe(&mut self, remote: &str) {
        if remote.len() != TIME_LEN {
            return;
        }
        let bytes = remote.as_bytes();
        let (Some(remote_ms), Some(remote_counter)) = (
            decode(&bytes[..TIME_CHARS]),
            decode(&bytes[TIME_CHARS..TIME_CHARS + COUNTER_CHARS]),
        ) else {
            return;
        };
        let remote_counter = remote_counter as u32;

        let local_ms = self.logical_ms;
        self.logical_ms = local_ms.max(remote_ms).max(wall_clock_ms());
        self.counter = match remote_ms.cmp(&local_ms) {
            std::cmp::Ordering::Greater => remote_counter,
            std::cmp::Ordering::Less => self.counter,
            std::cmp::Ordering::Equal => self.counter.max(remote_counter),
        };
    }

    /// The fixed 5-character replica suffix of this clock.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}
