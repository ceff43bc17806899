//! Per-hop relay cryptography and the onion layer engine
//!
//! Each hop of a circuit shares four pieces of state with the client:
//! a forward and a backward AES-128-CTR cipher (keyed Kf/Kb, counter
//! starting at zero) and a forward and a backward running SHA-1 digest
//! (seeded with Df/Db). Ciphers and digests are cumulative across cells;
//! the engine must observe exactly the wire order, so nothing here is
//! speculative: a digest is only committed once a cell is recognized.
//!
//! All key material is zeroized on drop.

use aes::Aes128;
use ctr::{
    cipher::{KeyIvInit, StreamCipher},
    Ctr128BE,
};
use hkdf::Hkdf;
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

use super::cell::{EncryptedCell, MAX_PAYLOAD_LEN};
use super::relay::RelayCell;

/// AES-128-CTR with a big-endian 128-bit counter.
type Aes128Ctr = Ctr128BE<Aes128>;

/// HKDF info string for the NTor key expansion.
const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// Total KDF output: Df(20) | Db(20) | Kf(16) | Kb(16) | KH(20).
const KDF_OUT_LEN: usize = 92;

/// Maximum hops in a client circuit.
pub const MAX_HOPS: usize = 3;

/// Offset of the recognized field in a relay-cell body.
const RECOGNIZED_RANGE: std::ops::Range<usize> = 1..3;

/// Offset of the digest field in a relay-cell body.
const DIGEST_RANGE: std::ops::Range<usize> = 5..9;

/// Constant-time equality for byte strings of equal length.
pub fn ct_bytes_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Constant-time all-zero check.
pub fn ct_is_zero(data: &[u8]) -> bool {
    let mut acc = 0u8;
    for b in data {
        acc |= b;
    }
    acc.ct_eq(&0).into()
}

/// Key material for one hop, as split out of the NTor KDF output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CircuitKeys {
    /// Forward digest seed Df (client → hop).
    pub forward_digest_seed: [u8; 20],

    /// Backward digest seed Db (hop → client).
    pub backward_digest_seed: [u8; 20],

    /// Forward AES-128 key Kf.
    pub forward_key: [u8; 16],

    /// Backward AES-128 key Kb.
    pub backward_key: [u8; 16],

    /// KH verifier bytes, kept for circuit binding.
    pub kh: [u8; 20],
}

impl CircuitKeys {
    /// Expand KEY_SEED into per-hop key material.
    ///
    /// KEY_SEED is already a pseudorandom key (the output of HMAC-SHA256
    /// in the NTor handshake), so the HKDF extract step is skipped and
    /// the seed is used directly as the PRK.
    pub fn derive(key_seed: &[u8]) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::from_prk(key_seed)
            .map_err(|_| Error::Crypto("KEY_SEED is not a valid PRK".into()))?;

        let mut okm = [0u8; KDF_OUT_LEN];
        hkdf.expand(M_EXPAND, &mut okm)
            .map_err(|_| Error::Crypto("key expansion failed".into()))?;

        let mut keys = Self {
            forward_digest_seed: [0u8; 20],
            backward_digest_seed: [0u8; 20],
            forward_key: [0u8; 16],
            backward_key: [0u8; 16],
            kh: [0u8; 20],
        };
        keys.forward_digest_seed.copy_from_slice(&okm[0..20]);
        keys.backward_digest_seed.copy_from_slice(&okm[20..40]);
        keys.forward_key.copy_from_slice(&okm[40..56]);
        keys.backward_key.copy_from_slice(&okm[56..72]);
        keys.kh.copy_from_slice(&okm[72..92]);
        okm.zeroize();

        Ok(keys)
    }
}

/// The live cryptographic state shared with one hop.
///
/// Owned exclusively by the circuit; the onion engine borrows hops
/// serially, so the mutable counter and digest state need no locking.
pub struct RelayCrypto {
    forward_cipher: Aes128Ctr,
    backward_cipher: Aes128Ctr,
    forward_digest: Sha1,
    backward_digest: Sha1,
}

impl RelayCrypto {
    /// Install ciphers and digests from freshly derived key material.
    /// CTR counters start at zero; digests are seeded with Df/Db.
    pub fn new(keys: &CircuitKeys) -> Self {
        let zero_iv = [0u8; 16];
        Self {
            forward_cipher: Aes128Ctr::new(
                (&keys.forward_key).into(),
                (&zero_iv).into(),
            ),
            backward_cipher: Aes128Ctr::new(
                (&keys.backward_key).into(),
                (&zero_iv).into(),
            ),
            forward_digest: Sha1::new().chain_update(keys.forward_digest_seed),
            backward_digest: Sha1::new().chain_update(keys.backward_digest_seed),
        }
    }

    /// Check whether a just-decrypted body originated at this hop, and if
    /// so commit its bytes into the running backward digest.
    ///
    /// The recognized field is a cheap pre-filter; the 4-byte digest tag
    /// is the authenticator. The digest is computed over the body with the
    /// digest field zeroed, against a snapshot of the running state, so a
    /// miss leaves this hop's digest untouched.
    fn recognize_inbound(&mut self, body: &[u8; MAX_PAYLOAD_LEN]) -> bool {
        if !ct_is_zero(&body[RECOGNIZED_RANGE]) {
            return false;
        }

        let mut zeroed = *body;
        zeroed[DIGEST_RANGE].fill(0);

        let mut snapshot = self.backward_digest.clone();
        snapshot.update(zeroed);
        let committed = snapshot.clone();
        let computed = snapshot.finalize();

        if ct_bytes_eq(&body[DIGEST_RANGE], &computed[..4]) {
            self.backward_digest = committed;
            true
        } else {
            false
        }
    }
}

/// The ordered per-hop crypto states of a circuit: index 0 is the guard,
/// index 2 the exit.
#[derive(Default)]
pub struct CircuitPath {
    hops: Vec<RelayCrypto>,
}

impl CircuitPath {
    pub fn new() -> Self {
        Self { hops: Vec::new() }
    }

    /// Install the next hop's crypto state, guard first.
    pub fn add_hop(&mut self, keys: &CircuitKeys) -> Result<()> {
        if self.hops.len() >= MAX_HOPS {
            return Err(Error::InvalidState(format!(
                "circuit already has {} hops",
                MAX_HOPS
            )));
        }
        self.hops.push(RelayCrypto::new(keys));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Onion-encrypt `cell` to the hop at `target` and update that hop's
    /// forward digest.
    ///
    /// The digest is taken over the serialized body with its digest field
    /// zeroed (padding included), spliced in after the absorb, and only
    /// then is the body encrypted, innermost state first by hop order
    /// 0..=target.
    pub fn encrypt_to_target(
        &mut self,
        cell: &RelayCell,
        circ_id: u32,
        link_version: u8,
        target: usize,
        early: bool,
    ) -> Result<EncryptedCell> {
        if target >= self.hops.len() {
            return Err(Error::InvalidState(format!(
                "target hop {} not installed ({} hops)",
                target,
                self.hops.len()
            )));
        }

        let mut body = cell.encode_body();
        body[RECOGNIZED_RANGE].fill(0);
        body[DIGEST_RANGE].fill(0);

        let fwd = &mut self.hops[target].forward_digest;
        fwd.update(body);
        let tag = fwd.clone().finalize();
        body[DIGEST_RANGE].copy_from_slice(&tag[..4]);

        for hop in self.hops[..=target].iter_mut() {
            hop.forward_cipher.apply_keystream(&mut body);
        }

        EncryptedCell::make(circ_id, body.to_vec(), link_version, early)
    }

    /// Peel an inbound ciphertext one hop at a time, guard first, until a
    /// hop recognizes it. Returns the plaintext relay cell and the index
    /// of the hop that originated it.
    ///
    /// If no hop recognizes the cell, every hop's digest state is exactly
    /// as it was before the call and the caller must drop the cell
    /// silently.
    pub fn decrypt_until_recognized(
        &mut self,
        cell: &EncryptedCell,
    ) -> Result<(RelayCell, usize)> {
        let mut body = [0u8; MAX_PAYLOAD_LEN];
        body.copy_from_slice(&cell.payload);

        for (origin, hop) in self.hops.iter_mut().enumerate() {
            hop.backward_cipher.apply_keystream(&mut body);
            if hop.recognize_inbound(&body) {
                let relay = RelayCell::parse_body(&body)?;
                return Ok((relay, origin));
            }
        }

        Err(Error::UnrecognizedCell)
    }
}
