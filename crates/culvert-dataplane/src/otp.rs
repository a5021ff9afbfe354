//! One-time password replay checker.
//!
//! Every inbound frame carries a `(seed_id, otp)` pair. The checker keeps a
//! small ring of seed tables; each table holds the passwords derived from
//! one seed and how many uses of each remain. A password is valid exactly
//! once, which is what makes a captured frame worthless to replay.
//!
//! How passwords are derived from a seed is the [`OtpGenerator`]'s
//! business; the checker only consumes the resulting list. The checker is
//! owned by a single actor and is not thread-safe by design.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;

/// Identifies which seed a password was drawn from.
pub type SeedId = u16;

/// A single one-time password as it appears on the wire.
pub type Otp = u16;

/// Notifications about the checker's seed tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpEvent {
    /// A seed's password table is built and frames using it will verify.
    SeedReady { seed_id: SeedId },
}

/// Derives the password list for a seed.
///
/// Implementations must be deterministic: both peers derive the same list
/// from the same `(key, iv)` or nothing ever verifies.
pub trait OtpGenerator: Send + Sync {
    fn generate(&self, key: &[u8], iv: &[u8], count: u32) -> Vec<Otp>;
}

/// Default generator: a keyed-BLAKE3 counter stream chopped into 16-bit
/// passwords.
pub struct Blake3OtpGenerator;

impl OtpGenerator for Blake3OtpGenerator {
    fn generate(&self, key: &[u8], iv: &[u8], count: u32) -> Vec<Otp> {
        let derived = blake3::derive_key("culvert otp seed v1", key);
        let mut otps = Vec::with_capacity(count as usize);
        let mut counter: u32 = 0;

        while otps.len() < count as usize {
            let mut input = Vec::with_capacity(iv.len() + 4);
            input.extend_from_slice(iv);
            input.extend_from_slice(&counter.to_le_bytes());
            let digest = blake3::keyed_hash(&derived, &input);

            for pair in digest.as_bytes().chunks_exact(2) {
                if otps.len() == count as usize {
                    break;
                }
                otps.push(u16::from_le_bytes([pair[0], pair[1]]));
            }
            counter += 1;
        }
        otps
    }
}

// ── Checker ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SeedTable {
    id: SeedId,
    /// Remaining uses per password value. Distinct derivation indices can
    /// collide on the same 16-bit value, so values are counted, not flagged.
    unused: HashMap<Otp, u32>,
}

/// Ring of seed tables with consume-once password checking.
pub struct OtpChecker {
    capacity: usize,
    num_otps: u32,
    generator: Arc<dyn OtpGenerator>,
    seeds: VecDeque<SeedTable>,
    events: Option<mpsc::UnboundedSender<OtpEvent>>,
}

impl std::fmt::Debug for OtpChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtpChecker")
            .field("capacity", &self.capacity)
            .field("num_otps", &self.num_otps)
            .field("seeds", &self.seeds)
            .field("events", &self.events)
            .finish()
    }
}

impl OtpChecker {
    pub fn new(capacity: usize, num_otps: u32, generator: Arc<dyn OtpGenerator>) -> Self {
        debug_assert!(capacity >= 1);
        OtpChecker {
            capacity,
            num_otps,
            generator,
            seeds: VecDeque::with_capacity(capacity),
            events: None,
        }
    }

    /// Route seed lifecycle notifications to `sink`.
    pub fn set_event_sink(&mut self, sink: mpsc::UnboundedSender<OtpEvent>) {
        self.events = Some(sink);
    }

    /// Install a seed, deriving its password table. The oldest seed is
    /// evicted once the ring is full; re-adding a live seed id replaces it.
    pub fn add_seed(&mut self, seed_id: SeedId, key: &[u8], iv: &[u8]) {
        self.seeds.retain(|seed| seed.id != seed_id);
        if self.seeds.len() == self.capacity {
            if let Some(evicted) = self.seeds.pop_front() {
                tracing::trace!(seed_id = evicted.id, "evicting oldest OTP seed");
            }
        }

        let mut unused = HashMap::with_capacity(self.num_otps as usize);
        for otp in self.generator.generate(key, iv, self.num_otps) {
            *unused.entry(otp).or_insert(0) += 1;
        }
        self.seeds.push_back(SeedTable { id: seed_id, unused });

        if let Some(events) = &self.events {
            let _ = events.send(OtpEvent::SeedReady { seed_id });
        }
    }

    /// Verify and consume one password use. Returns false for unknown
    /// seeds, unknown passwords, and passwords already spent.
    pub fn check(&mut self, seed_id: SeedId, otp: Otp) -> bool {
        let Some(seed) = self.seeds.iter_mut().find(|seed| seed.id == seed_id) else {
            return false;
        };
        match seed.unused.get_mut(&otp) {
            Some(remaining) => {
                *remaining -= 1;
                if *remaining == 0 {
                    seed.unused.remove(&otp);
                }
                true
            }
            None => false,
        }
    }

    /// Drop every seed table. Frames stop verifying until new seeds arrive.
    pub fn remove_seeds(&mut self) {
        self.seeds.clear();
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Generator handing out a fixed list, for exercising the table logic.
    struct FixedGenerator(Vec<Otp>);

    impl OtpGenerator for FixedGenerator {
        fn generate(&self, _key: &[u8], _iv: &[u8], count: u32) -> Vec<Otp> {
            self.0.iter().copied().take(count as usize).collect()
        }
    }

    fn checker_with(otps: Vec<Otp>, capacity: usize) -> OtpChecker {
        let count = otps.len() as u32;
        OtpChecker::new(capacity, count, Arc::new(FixedGenerator(otps)))
    }

    #[test]
    fn blake3_generator_is_deterministic() {
        let generator = Blake3OtpGenerator;
        let a = generator.generate(b"seed key", b"seed iv", 64);
        let b = generator.generate(b"seed key", b"seed iv", 64);
        let c = generator.generate(b"seed key", b"other iv", 64);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn password_is_valid_exactly_once() {
        let mut checker = checker_with(vec![100, 200, 300], 2);
        checker.add_seed(7, b"k", b"iv");

        assert!(checker.check(7, 200));
        assert!(!checker.check(7, 200));
        assert!(checker.check(7, 100));
    }

    #[test]
    fn unknown_seed_and_password_fail() {
        let mut checker = checker_with(vec![100], 2);
        checker.add_seed(7, b"k", b"iv");

        assert!(!checker.check(8, 100));
        assert!(!checker.check(7, 999));
    }

    #[test]
    fn duplicate_derivations_grant_multiple_uses() {
        let mut checker = checker_with(vec![100, 100, 200], 2);
        checker.add_seed(7, b"k", b"iv");

        assert!(checker.check(7, 100));
        assert!(checker.check(7, 100));
        assert!(!checker.check(7, 100));
    }

    #[test]
    fn oldest_seed_is_evicted_at_capacity() {
        let mut checker = checker_with(vec![100], 2);
        checker.add_seed(1, b"k", b"iv");
        checker.add_seed(2, b"k", b"iv");
        checker.add_seed(3, b"k", b"iv");

        assert!(!checker.check(1, 100), "seed 1 should have been evicted");
        assert!(checker.check(2, 100));
        assert!(checker.check(3, 100));
    }

    #[test]
    fn readding_a_seed_resets_its_table() {
        let mut checker = checker_with(vec![100], 3);
        checker.add_seed(1, b"k", b"iv");
        assert!(checker.check(1, 100));
        assert!(!checker.check(1, 100));

        checker.add_seed(1, b"k", b"iv");
        assert!(checker.check(1, 100));
    }

    #[test]
    fn remove_seeds_drops_everything() {
        let mut checker = checker_with(vec![100], 2);
        checker.add_seed(1, b"k", b"iv");
        checker.remove_seeds();
        assert!(!checker.check(1, 100));
    }

    #[test]
    fn seed_ready_events_reach_the_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut checker = checker_with(vec![100], 2);
        checker.set_event_sink(tx);

        checker.add_seed(9, b"k", b"iv");
        assert_eq!(rx.try_recv().unwrap(), OtpEvent::SeedReady { seed_id: 9 });
    }
}
