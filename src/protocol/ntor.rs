//! NTor handshake
//!
//! The authenticated key agreement behind CREATE2/CREATED2 (and, wrapped in
//! relay cells, EXTEND2/EXTENDED2). The client sends ID | B | X where X is
//! a fresh curve25519 public key; the relay answers Y | AUTH. Both sides
//! derive KEY_SEED from EXP(Y,x) | EXP(B,x) and the transcript, and the
//! client checks AUTH in constant time before installing any keys.

use base64::{
    engine::general_purpose::{STANDARD as BASE64, STANDARD_NO_PAD as BASE64_NO_PAD},
    Engine as _,
};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

use super::cell::{NTOR_HLEN, NTOR_REPLY_HLEN};
use super::crypto::{ct_is_zero, CircuitKeys};

type HmacSha256 = Hmac<Sha256>;

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";
const SERVER_SUFFIX: &[u8] = b"Server";

fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Decode a relay's ntor onion key from its base64 form as published in
/// directory documents.
pub fn onion_key_from_base64(encoded: &str) -> Result<PublicKey> {
    // Directory documents publish the key with its base64 padding removed.
    let bytes = BASE64
        .decode(encoded)
        .or_else(|_| BASE64_NO_PAD.decode(encoded))
        .map_err(|e| Error::HandshakeFailed(format!("bad ntor onion key encoding: {}", e)))?;
    if bytes.len() != 32 {
        return Err(Error::HandshakeFailed(format!(
            "ntor onion key must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(PublicKey::from(key))
}

/// Client side of one NTor exchange against a single relay.
///
/// The ephemeral secret lives only as long as the handshake; x25519's
/// secret type zeroizes itself on drop.
pub struct NtorHandshake {
    /// The relay's identity fingerprint (SHA-1, 20 bytes).
    node_id: [u8; 20],

    /// The relay's ntor onion key B.
    onion_key: PublicKey,

    /// Our ephemeral secret x. Stored as a StaticSecret because completing
    /// the handshake performs two Diffie-Hellman operations with it.
    secret: StaticSecret,

    /// Our ephemeral public key X.
    public: PublicKey,
}

impl NtorHandshake {
    /// Start a handshake toward the relay identified by `node_id` with
    /// ntor onion key `onion_key`.
    pub fn new(node_id: [u8; 20], onion_key: PublicKey) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            node_id,
            onion_key,
            secret,
            public,
        }
    }

    /// The 84-byte onion skin for CREATE2/EXTEND2: ID | B | X.
    pub fn onion_skin(&self) -> Vec<u8> {
        let mut skin = Vec::with_capacity(NTOR_HLEN as usize);
        skin.extend_from_slice(&self.node_id);
        skin.extend_from_slice(self.onion_key.as_bytes());
        skin.extend_from_slice(self.public.as_bytes());
        skin
    }

    /// Complete the handshake with the 64-byte reply Y | AUTH from a
    /// CREATED2 or EXTENDED2 cell, returning the per-hop key material.
    pub fn complete(self, reply: &[u8]) -> Result<CircuitKeys> {
        if reply.len() != NTOR_REPLY_HLEN as usize {
            return Err(Error::HandshakeFailed(format!(
                "handshake reply was {} bytes, expected {}",
                reply.len(),
                NTOR_REPLY_HLEN
            )));
        }
        let mut y_bytes = [0u8; 32];
        y_bytes.copy_from_slice(&reply[0..32]);
        let server_public = PublicKey::from(y_bytes);
        let server_auth = &reply[32..64];

        let shared_yx = self.secret.diffie_hellman(&server_public);
        let shared_bx = self.secret.diffie_hellman(&self.onion_key);

        // A peer supplying a low-order point would force an all-zero
        // shared secret.
        if ct_is_zero(shared_yx.as_bytes()) || ct_is_zero(shared_bx.as_bytes()) {
            return Err(Error::HandshakeFailed(
                "peer supplied a degenerate curve point".into(),
            ));
        }

        // secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y | PROTOID
        let mut secret_input = Vec::with_capacity(32 * 4 + 20 + 32 + PROTOID.len());
        secret_input.extend_from_slice(shared_yx.as_bytes());
        secret_input.extend_from_slice(shared_bx.as_bytes());
        secret_input.extend_from_slice(&self.node_id);
        secret_input.extend_from_slice(self.onion_key.as_bytes());
        secret_input.extend_from_slice(self.public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let key_seed = hmac_sha256(T_KEY, &secret_input);
        let verify = hmac_sha256(T_VERIFY, &secret_input);

        // auth_input = verify | ID | B | Y | X | PROTOID | "Server"
        let mut auth_input = Vec::with_capacity(32 * 4 + 20 + PROTOID.len() + SERVER_SUFFIX.len());
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(&self.node_id);
        auth_input.extend_from_slice(self.onion_key.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(self.public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(SERVER_SUFFIX);

        let computed_auth = hmac_sha256(T_MAC, &auth_input);

        let auth_ok: bool = computed_auth.ct_eq(server_auth).into();
        if !auth_ok {
            return Err(Error::HandshakeFailed("AUTH verification failed".into()));
        }

        CircuitKeys::derive(&key_seed)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::server_respond;
    use super::*;

    #[test]
    fn test_onion_skin_layout() {
        let node_id = [0x0b; 20];
        let b_secret = StaticSecret::random_from_rng(OsRng);
        let b_public = PublicKey::from(&b_secret);

        let hs = NtorHandshake::new(node_id, b_public);
        let skin = hs.onion_skin();
        assert_eq!(skin.len(), 84);
        assert_eq!(&skin[0..20], &node_id);
        assert_eq!(&skin[20..52], b_public.as_bytes());
    }

    #[test]
    fn test_handshake_round_trip() {
        let node_id = [0x42; 20];
        let b_secret = StaticSecret::random_from_rng(OsRng);
        let b_public = PublicKey::from(&b_secret);

        let hs = NtorHandshake::new(node_id, b_public);
        let skin = hs.onion_skin();
        let reply = server_respond(&node_id, &b_secret, &skin);
        let keys = hs.complete(&reply).unwrap();

        assert_ne!(keys.forward_key, [0u8; 16]);
        assert_ne!(keys.forward_key, keys.backward_key);
    }

    #[test]
    fn test_corrupted_auth_is_rejected() {
        let node_id = [0x42; 20];
        let b_secret = StaticSecret::random_from_rng(OsRng);
        let b_public = PublicKey::from(&b_secret);

        let hs = NtorHandshake::new(node_id, b_public);
        let skin = hs.onion_skin();
        let mut reply = server_respond(&node_id, &b_secret, &skin);
        reply[40] ^= 0x80;

        assert!(matches!(
            hs.complete(&reply),
            Err(Error::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_short_reply_is_rejected() {
        let hs = NtorHandshake::new([0; 20], PublicKey::from([9u8; 32]));
        assert!(matches!(
            hs.complete(&[0u8; 63]),
            Err(Error::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_onion_key_base64() {
        let key = PublicKey::from([0x7f; 32]);
        let encoded = BASE64.encode(key.as_bytes());
        let decoded = onion_key_from_base64(&encoded).unwrap();
        assert_eq!(decoded.as_bytes(), key.as_bytes());

        assert!(onion_key_from_base64("dG9vc2hvcnQ=").is_err());
    }
}
