//! Identifier generators: hop-by-hop, end-to-end and session ids.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A randomly seeded, wrapping 32-bit sequence generator.
///
/// Used for per-connection hop-by-hop identifiers. Not thread-safe by
/// itself; each connection owns its own generator.
#[derive(Debug, Clone)]
pub struct SequenceGenerator {
    current: u32,
}

impl SequenceGenerator {
    /// Create a generator with a random starting point
    pub fn new() -> Self {
        Self {
            current: rand::random(),
        }
    }

    /// Create a generator starting from a fixed seed
    pub fn from_seed(seed: u32) -> Self {
        Self { current: seed }
    }

    /// Increment and return the next sequence value
    pub fn next_sequence(&mut self) -> u32 {
        self.current = self.current.wrapping_add(1);
        self.current
    }

    /// The most recently returned value
    pub fn current(&self) -> u32 {
        self.current
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// End-to-end identifier generator.
///
/// Seeded per RFC 6733 5.3: the high 12 bits come from the node start time
/// in seconds, the low 20 bits from a randomly initialized counter. After
/// seeding it is a plain wrapping counter.
#[derive(Debug, Clone)]
pub struct EndToEndGenerator {
    inner: SequenceGenerator,
}

impl EndToEndGenerator {
    /// Seed from a unix start time
    pub fn new(start_time_secs: u64) -> Self {
        let high = ((start_time_secs as u32) & 0x0fff) << 20;
        let low = rand::random::<u32>() & 0x000f_ffff;
        Self {
            inner: SequenceGenerator::from_seed(high | low),
        }
    }

    /// Seed from the current wall clock
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::new(now)
    }

    /// Increment and return the next identifier
    pub fn next_sequence(&mut self) -> u32 {
        self.inner.next_sequence()
    }
}

/// Session-Id generator.
///
/// Produces `{origin-host};{high32};{low32}` strings, optionally with
/// appended opaque fields. `high32` is derived from the node boot time and
/// stays fixed for the generator's lifetime; `low32` is a randomly
/// initialized counter that increments by one per id, wrapping modulo
/// 2^32. Safe to share between threads.
#[derive(Debug)]
pub struct SessionIdGenerator {
    identity: String,
    high: u32,
    low: AtomicU32,
}

impl SessionIdGenerator {
    /// Create a generator for the given node identity
    pub fn new(identity: &str) -> Self {
        let high = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        Self {
            identity: identity.to_string(),
            high,
            low: AtomicU32::new(rand::random()),
        }
    }

    /// Generate the next session id
    pub fn next_id(&self) -> String {
        let low = self.low.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        format!("{};{:08x};{:08x}", self.identity, self.high, low)
    }

    /// Generate the next session id with appended opaque fields
    pub fn next_id_with(&self, optional: &[&str]) -> String {
        let mut id = self.next_id();
        for part in optional {
            id.push(';');
            id.push_str(part);
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_wraps() {
        let mut seq = SequenceGenerator::from_seed(u32::MAX - 1);
        assert_eq!(seq.next_sequence(), u32::MAX);
        assert_eq!(seq.next_sequence(), 0);
        assert_eq!(seq.next_sequence(), 1);
    }

    #[test]
    fn test_end_to_end_high_bits_from_start_time() {
        let start = 0x1234_5678u64;
        let mut gen = EndToEndGenerator::new(start);
        let id = gen.next_sequence();
        // high 12 bits carry the low 12 bits of the start time
        assert_eq!(id >> 20, (start as u32) & 0x0fff);
    }

    #[test]
    fn test_session_id_low32_monotonic() {
        let gen = SessionIdGenerator::new("node.example.net");
        let mut previous: Option<u32> = None;
        for _ in 0..100 {
            let id = gen.next_id();
            let mut parts = id.split(';');
            assert_eq!(parts.next(), Some("node.example.net"));
            let _high = parts.next().unwrap();
            let low = u32::from_str_radix(parts.next().unwrap(), 16).unwrap();
            if let Some(prev) = previous {
                assert_eq!(low, prev.wrapping_add(1));
            }
            previous = Some(low);
        }
    }

    #[test]
    fn test_session_id_optional_fields() {
        let gen = SessionIdGenerator::new("node.example.net");
        let id = gen.next_id_with(&["user@host", "opaque"]);
        assert!(id.ends_with(";user@host;opaque"));
        assert_eq!(id.split(';').count(), 5);
    }

    #[test]
    fn test_session_id_high32_stable() {
        let gen = SessionIdGenerator::new("n.example");
        let high = |id: String| id.split(';').nth(1).unwrap().to_string();
        assert_eq!(high(gen.next_id()), high(gen.next_id()));
    }
}
