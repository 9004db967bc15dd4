// Unique id generation for inboxes and request tokens.
use parking_lot::Mutex;
use rand::Rng;
use std::fmt;

const DIGITS: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: u64 = 62;
const PREFIX_LEN: usize = 12;
const SEQ_LEN: usize = 10;
const MAX_SEQ: u64 = 839_299_365_868_340_224; // 62^10
const MIN_INC: u64 = 33;
const MAX_INC: u64 = 333;

/// Source of unique tokens, injected per client.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// 22 base62 characters: a random 12-character prefix and a 10-character
/// sequence advanced by a random increment. The prefix is re-randomized when
/// the sequence space is exhausted.
///
/// ```
/// use courier_client::{IdGenerator, Nuid};
///
/// let nuid = Nuid::new();
/// let a = nuid.next_id();
/// let b = nuid.next_id();
/// assert_eq!(a.len(), 22);
/// assert_ne!(a, b);
/// assert_eq!(a[..12], b[..12]);
/// ```
pub struct Nuid {
    state: Mutex<NuidState>,
}

struct NuidState {
    prefix: [u8; PREFIX_LEN],
    seq: u64,
    inc: u64,
}

impl NuidState {
    fn random() -> Self {
        let mut rng = rand::rng();
        let mut prefix = [0u8; PREFIX_LEN];
        for byte in &mut prefix {
            *byte = DIGITS[rng.random_range(0..DIGITS.len())];
        }
        Self {
            prefix,
            seq: rng.random_range(0..MAX_SEQ),
            inc: rng.random_range(MIN_INC..MAX_INC),
        }
    }
}

impl Nuid {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NuidState::random()),
        }
    }
}

impl Default for Nuid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Nuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Nuid")
    }
}

impl IdGenerator for Nuid {
    fn next_id(&self) -> String {
        let mut state = self.state.lock();
        state.seq += state.inc;
        if state.seq >= MAX_SEQ {
            *state = NuidState::random();
        }
        let mut out = Vec::with_capacity(PREFIX_LEN + SEQ_LEN);
        out.extend_from_slice(&state.prefix);
        let mut seq_digits = [b'0'; SEQ_LEN];
        let mut rem = state.seq;
        for slot in seq_digits.iter_mut().rev() {
            *slot = DIGITS[(rem % BASE) as usize];
            rem /= BASE;
        }
        out.extend_from_slice(&seq_digits);
        out.into_iter().map(char::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_and_base62() {
        let nuid = Nuid::new();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = nuid.next_id();
            assert_eq!(id.len(), PREFIX_LEN + SEQ_LEN);
            assert!(id.bytes().all(|b| b.is_ascii_alphanumeric()));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn prefix_rolls_over_at_sequence_exhaustion() {
        let nuid = Nuid::new();
        let old_prefix = {
            let mut state = nuid.state.lock();
            state.seq = MAX_SEQ - 1;
            state.prefix
        };
        let id = nuid.next_id();
        assert_ne!(id.as_bytes()[..PREFIX_LEN], old_prefix[..]);
    }
}
