//! Hop handshake and onion layer encryption.
//!
//! Handshake (one-way authenticated, X25519):
//!
//! ```text
//! client -> relay   X = x*G                         (ephemeral)
//! relay  -> client  Y = y*G, auth                   (ephemeral + proof of b)
//! ikm  = DH(y, X) || DH(b, X) || B || X || Y
//! okm  = HKDF-SHA256(salt, ikm) -> forward key, backward key, auth
//! ```
//!
//! Only the holder of the relay's static secret `b` can produce `auth`, and
//! the ephemeral pair gives each circuit forward secrecy.
//!
//! Layer (one per hop and direction):
//!
//! ```text
//! layer := [seq u64 BE][ChaCha20-Poly1305(key, nonce = 0u32 || seq, aad = cell type)(flag || content)]
//! ```
//!
//! The receiver accepts only strictly increasing sequence numbers.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::cell::CellType;
use crate::overlay::PeerKey;

const HKDF_SALT: &[u8] = b"veilseed-hop-handshake-v1";
const INFO_FORWARD: &[u8] = b"veilseed forward layer key";
const INFO_BACKWARD: &[u8] = b"veilseed backward layer key";
const INFO_AUTH: &[u8] = b"veilseed handshake auth";

const SEQ_LEN: usize = 8;
const TAG_LEN: usize = 16;

/// Bytes one layer adds to its content
pub const LAYER_OVERHEAD: usize = SEQ_LEN + TAG_LEN + 1;

/// Forward layer: pass the content on to the next hop
pub const FLAG_RELAY: u8 = 0;
/// Forward layer: the content is addressed to this hop.
/// Backward layer: this hop originated the content.
pub const FLAG_DELIVER: u8 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Handshake authentication failed")]
    AuthenticationFailed,

    #[error("Peer supplied a low-order key")]
    WeakKey,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Layer integrity check failed")]
    Integrity,

    #[error("Replayed layer: sequence {seq} not after {last}")]
    Replay { seq: u64, last: u64 },

    #[error("Layer too short: {0} bytes")]
    Truncated(usize),

    #[error("Sequence space exhausted")]
    SequenceExhausted,

    #[error("Encryption failed")]
    Encryption,
}

/// Key material for one hop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HopKeys {
    forward: [u8; 32],
    backward: [u8; 32],
}

/// Relay's answer to a handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeReply {
    pub relay_ephemeral: [u8; 32],
    pub auth: [u8; 32],
}

fn random_secret() -> StaticSecret {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let secret = StaticSecret::from(bytes);
    bytes.zeroize();
    secret
}

fn derive(
    dh_ephemeral: &[u8; 32],
    dh_static: &[u8; 32],
    relay_static: &PeerKey,
    client_ephemeral: &[u8; 32],
    relay_ephemeral: &[u8; 32],
) -> Result<(HopKeys, [u8; 32]), CryptoError> {
    let mut ikm = Vec::with_capacity(32 * 5);
    ikm.extend_from_slice(dh_ephemeral);
    ikm.extend_from_slice(dh_static);
    ikm.extend_from_slice(relay_static);
    ikm.extend_from_slice(client_ephemeral);
    ikm.extend_from_slice(relay_ephemeral);

    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), &ikm);
    ikm.zeroize();

    let mut keys = HopKeys {
        forward: [0u8; 32],
        backward: [0u8; 32],
    };
    let mut auth = [0u8; 32];
    for (info, out) in [
        (INFO_FORWARD, &mut keys.forward),
        (INFO_BACKWARD, &mut keys.backward),
        (INFO_AUTH, &mut auth),
    ] {
        hk.expand(info, out)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    }

    Ok((keys, auth))
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Client side of one hop handshake
pub struct ClientHandshake {
    secret: StaticSecret,
    public: [u8; 32],
    relay_static: PeerKey,
}

impl ClientHandshake {
    pub fn new(relay_static: PeerKey) -> Self {
        let secret = random_secret();
        let public = *PublicKey::from(&secret).as_bytes();
        Self {
            secret,
            public,
            relay_static,
        }
    }

    /// Ephemeral key to send in `Create`/`Extend`
    pub fn public(&self) -> [u8; 32] {
        self.public
    }

    /// Verify the relay's reply and derive the hop keys
    pub fn complete(self, reply: &HandshakeReply) -> Result<HopCrypto, CryptoError> {
        let relay_ephemeral = PublicKey::from(reply.relay_ephemeral);
        let relay_static = PublicKey::from(self.relay_static);

        let dh_ephemeral = self.secret.diffie_hellman(&relay_ephemeral);
        let dh_static = self.secret.diffie_hellman(&relay_static);
        if !dh_ephemeral.was_contributory() || !dh_static.was_contributory() {
            return Err(CryptoError::WeakKey);
        }

        let (keys, auth) = derive(
            dh_ephemeral.as_bytes(),
            dh_static.as_bytes(),
            &self.relay_static,
            &self.public,
            &reply.relay_ephemeral,
        )?;

        if !constant_time_eq(&auth, &reply.auth) {
            return Err(CryptoError::AuthenticationFailed);
        }

        Ok(HopCrypto::new(&keys))
    }
}

/// Relay side of one hop handshake
pub fn respond(
    identity: &StaticSecret,
    client_ephemeral: &[u8; 32],
) -> Result<(HopCrypto, HandshakeReply), CryptoError> {
    let relay_static = *PublicKey::from(identity).as_bytes();
    let client = PublicKey::from(*client_ephemeral);

    let secret = random_secret();
    let relay_ephemeral = *PublicKey::from(&secret).as_bytes();

    let dh_ephemeral = secret.diffie_hellman(&client);
    let dh_static = identity.diffie_hellman(&client);
    if !dh_ephemeral.was_contributory() || !dh_static.was_contributory() {
        return Err(CryptoError::WeakKey);
    }

    let (keys, auth) = derive(
        dh_ephemeral.as_bytes(),
        dh_static.as_bytes(),
        &relay_static,
        client_ephemeral,
        &relay_ephemeral,
    )?;

    Ok((
        HopCrypto::new(&keys),
        HandshakeReply {
            relay_ephemeral,
            auth,
        },
    ))
}

/// AEAD state for one direction of one hop
pub struct LayerCipher {
    cipher: ChaCha20Poly1305,
    next_seq: u64,
    last_seen: Option<u64>,
}

impl LayerCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key)),
            next_seq: 0,
            last_seen: None,
        }
    }

    fn nonce(seq: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&seq.to_be_bytes());
        nonce
    }

    /// Add a layer around `content`
    pub fn seal(&mut self, cell_type: CellType, flag: u8, content: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let seq = self.next_seq;
        self.next_seq = seq.checked_add(1).ok_or(CryptoError::SequenceExhausted)?;

        let mut plaintext = Vec::with_capacity(content.len() + 1);
        plaintext.push(flag);
        plaintext.extend_from_slice(content);

        let nonce = Self::nonce(seq);
        let aad = [cell_type.as_byte()];
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Encryption)?;
        plaintext.zeroize();

        let mut layer = Vec::with_capacity(SEQ_LEN + ciphertext.len());
        layer.extend_from_slice(&seq.to_be_bytes());
        layer.extend_from_slice(&ciphertext);
        Ok(layer)
    }

    /// Remove a layer. Returns the flag and the inner content.
    pub fn open(&mut self, cell_type: CellType, layer: &[u8]) -> Result<(u8, Vec<u8>), CryptoError> {
        if layer.len() < LAYER_OVERHEAD {
            return Err(CryptoError::Truncated(layer.len()));
        }

        let mut seq_bytes = [0u8; SEQ_LEN];
        seq_bytes.copy_from_slice(&layer[..SEQ_LEN]);
        let seq = u64::from_be_bytes(seq_bytes);

        if let Some(last) = self.last_seen {
            if seq <= last {
                return Err(CryptoError::Replay { seq, last });
            }
        }

        let nonce = Self::nonce(seq);
        let aad = [cell_type.as_byte()];
        let mut plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &layer[SEQ_LEN..],
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Integrity)?;

        self.last_seen = Some(seq);

        let flag = plaintext.remove(0);
        Ok((flag, plaintext))
    }
}

/// Both directions of one hop
pub struct HopCrypto {
    pub forward: LayerCipher,
    pub backward: LayerCipher,
}

impl HopCrypto {
    fn new(keys: &HopKeys) -> Self {
        Self {
            forward: LayerCipher::new(&keys.forward),
            backward: LayerCipher::new(&keys.backward),
        }
    }
}
