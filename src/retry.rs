//! Two-slot rotating keyring for stateless-retry token protection.
//!
//! Keys live in epoch-aligned windows of [`RETRY_KEY_LIFETIME_MS`]. The newer
//! slot is `current`; rotation installs a fresh key into the other slot and
//! flips the index, so validation by token timestamp can reach back one full
//! epoch while minting always uses a key valid for the present one.

use std::sync::Arc;

use rand::RngCore;
use ring::aead;
use tracing::error;

use crate::Error;

/// Validity window of a single retry key, in epoch milliseconds.
pub const RETRY_KEY_LIFETIME_MS: i64 = 30_000;

/// Raw key length for AEAD-AES-256-GCM.
pub const AEAD_AES_256_GCM_KEY_SIZE: usize = 32;

/// An AEAD key minting and validating retry tokens.
pub struct RetryKey {
    key: aead::LessSafeKey,
    generation: u64,
}

impl RetryKey {
    fn create(generation: u64) -> Option<Arc<RetryKey>> {
        let mut raw = [0; AEAD_AES_256_GCM_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut raw);
        match aead::UnboundKey::new(&aead::AES_256_GCM, &raw) {
            Ok(unbound) => Some(Arc::new(RetryKey {
                key: aead::LessSafeKey::new(unbound),
                generation,
            })),
            Err(_) => {
                error!("failed to create stateless retry key");
                None
            }
        }
    }

    /// Monotonic creation index, distinct for every key this process mints.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Encrypts `data` in place, appending the authentication tag.
    pub fn seal(&self, nonce: [u8; 12], aad: &[u8], data: &mut Vec<u8>) -> Result<(), Error> {
        self.key
            .seal_in_place_append_tag(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::from(aad),
                data,
            )
            .map_err(|_| Error::Internal)
    }

    /// Decrypts and authenticates `data` in place, yielding the plaintext
    /// prefix. Authentication failure reports `InvalidParameter`: the token
    /// came from a client and is simply not ours.
    pub fn open<'a>(
        &self,
        nonce: [u8; 12],
        aad: &[u8],
        data: &'a mut [u8],
    ) -> Result<&'a mut [u8], Error> {
        self.key
            .open_in_place(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::from(aad),
                data,
            )
            .map_err(|_| Error::InvalidParameter)
    }
}

/// The two key slots plus the index of the newer one.
///
/// All methods take the caller's clock reading so the epoch arithmetic stays
/// deterministic under test; the library wraps them with the real clock.
pub struct RetryKeyring {
    keys: [Option<Arc<RetryKey>>; 2],
    expirations: [i64; 2],
    current: usize,
    generation: u64,
}

impl RetryKeyring {
    pub const fn new() -> Self {
        RetryKeyring {
            keys: [None, None],
            expirations: [0; 2],
            current: 0,
            generation: 0,
        }
    }

    /// Returns the key covering `now_ms`, rotating first when the current
    /// slot's epoch has ended. The stale slot is released before the index
    /// flips, so readers never observe a freed key through `current`.
    ///
    /// Key-creation failure is traced and surfaces as `None`; the caller
    /// skips the retry for this packet rather than retrying the creation.
    pub fn current(&mut self, now_ms: i64) -> Option<Arc<RetryKey>> {
        let start = (now_ms / RETRY_KEY_LIFETIME_MS) * RETRY_KEY_LIFETIME_MS;
        if start < self.expirations[self.current] {
            return self.keys[self.current].clone();
        }

        self.generation += 1;
        let new_key = RetryKey::create(self.generation)?;
        let other = 1 - self.current;
        self.expirations[other] = start + RETRY_KEY_LIFETIME_MS;
        self.keys[other] = Some(new_key.clone());
        self.current = other;
        Some(new_key)
    }

    /// Selects the key whose window contains `timestamp_ms`, checking the
    /// older slot first. Pure observation; never rotates.
    pub fn for_timestamp(&self, timestamp_ms: i64) -> Option<Arc<RetryKey>> {
        let other = 1 - self.current;
        if timestamp_ms < self.expirations[other] - RETRY_KEY_LIFETIME_MS {
            // Before the older key's window opened.
            None
        } else if timestamp_ms < self.expirations[other] {
            self.keys[other].clone()
        } else if timestamp_ms < self.expirations[self.current] {
            self.keys[self.current].clone()
        } else {
            None
        }
    }

    /// Drops both keys and their windows.
    pub fn clear(&mut self) {
        self.keys = [None, None];
        self.expirations = [0; 2];
    }
}

impl Default for RetryKeyring {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const L: i64 = RETRY_KEY_LIFETIME_MS;

    #[test]
    fn mint_then_rotate_yields_distinct_keys() {
        let mut ring = RetryKeyring::new();
        let first = ring.current(0).unwrap();
        let again = ring.current(L / 2).unwrap();
        assert_eq!(first.generation(), again.generation());

        let second = ring.current(L + 1).unwrap();
        assert_ne!(first.generation(), second.generation());

        assert_eq!(ring.for_timestamp(L / 2).unwrap().generation(), first.generation());
        assert_eq!(
            ring.for_timestamp(L + L / 2).unwrap().generation(),
            second.generation()
        );
        assert!(ring.for_timestamp(3 * L).is_none());
    }

    #[test]
    fn windows_are_epoch_aligned_and_disjoint() {
        let mut ring = RetryKeyring::new();
        // Mint mid-epoch; the window still spans the whole epoch.
        let key = ring.current(L + 17).unwrap();
        assert_eq!(ring.for_timestamp(L).unwrap().generation(), key.generation());
        assert_eq!(
            ring.for_timestamp(2 * L - 1).unwrap().generation(),
            key.generation()
        );
        assert!(ring.for_timestamp(L - 1).is_none());
        assert!(ring.for_timestamp(2 * L).is_none());
    }

    #[test]
    fn validation_reaches_back_one_epoch_only() {
        let mut ring = RetryKeyring::new();
        let k1 = ring.current(0).unwrap();
        let _k2 = ring.current(L).unwrap();
        let k3 = ring.current(2 * L).unwrap();
        // Slot for k1 was overwritten by k3; its window is gone.
        assert!(ring.for_timestamp(L / 2).is_none());
        assert_ne!(k1.generation(), k3.generation());
    }

    #[test]
    fn empty_ring_validates_nothing() {
        let ring = RetryKeyring::new();
        assert!(ring.for_timestamp(0).is_none());
        assert!(ring.for_timestamp(L).is_none());
    }

    #[test]
    fn clear_drops_windows() {
        let mut ring = RetryKeyring::new();
        ring.current(0).unwrap();
        ring.clear();
        assert!(ring.for_timestamp(L / 2).is_none());
    }

    #[test]
    fn seals_and_opens_a_token() {
        let mut ring = RetryKeyring::new();
        let key = ring.current(0).unwrap();
        let nonce = [7; 12];
        let aad = b"odcid";
        let mut token = b"client address proof".to_vec();
        key.seal(nonce, aad, &mut token).unwrap();
        assert_ne!(&token[..], b"client address proof");

        let mut sealed = token.clone();
        let plain = key.open(nonce, aad, &mut sealed).unwrap();
        assert_eq!(plain, b"client address proof");

        // A different key must reject the same token.
        let other = ring.current(L + 1).unwrap();
        assert!(other.open(nonce, aad, &mut token).is_err());
    }
}
