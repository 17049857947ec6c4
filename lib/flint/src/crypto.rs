use crate::identity::{IdentityKey, PeerIdentity};
use crate::shared::{ErrorType, NetworkError, NetworkResult};
use aes::cipher::{KeyIvInit, StreamCipher};
use byteorder::{BigEndian, WriteBytesExt};
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha512};
use std::io::Write;
use x25519_dalek::{x25519, PublicKey};
use zeroize::Zeroize;

pub use x25519_dalek::StaticSecret;

/// Bytes of the HMAC-SHA512 output carried on the wire.
pub const MAC_SIZE: usize = 32;
pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;
pub const EPHEMERAL_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

/// Purpose tags baked into every signature so a handshake signature can
/// never be replayed as a rekey signature or vice versa.
pub const PURPOSE_HANDSHAKE: u32 = 1;
pub const PURPOSE_REKEY: u32 = 2;

const SIGNATURE_BLOB_SIZE: usize = 4 + 32 + 32 + EPHEMERAL_SIZE + 8;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type HmacSha512 = Hmac<Sha512>;

/// Generates a fresh X25519 keypair for one direction of a session.
/// The secret half zeroizes itself on drop.
#[inline]
pub fn ephemeral_generate() -> (StaticSecret, [u8; EPHEMERAL_SIZE]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret).to_bytes();

    (secret, public)
}

/// ECDH between our long-term Ed25519 key and a peer's X25519 ephemeral
/// public key. The Ed25519 secret scalar doubles as an X25519 scalar.
#[inline]
pub fn ecdh_identity_ephemeral(
    identity: &IdentityKey,
    ephemeral_public: &[u8; EPHEMERAL_SIZE],
) -> [u8; 32] {
    x25519(identity.signing().to_scalar_bytes(), *ephemeral_public)
}

/// ECDH between our X25519 ephemeral secret and a peer's long-term Ed25519
/// public key, mapped to its Montgomery form. Consumes the ephemeral secret;
/// it is wiped when this function returns.
#[inline]
pub fn ecdh_ephemeral_identity(
    ephemeral: StaticSecret,
    peer: &PeerIdentity,
) -> NetworkResult<[u8; 32]> {
    let verifying = VerifyingKey::from_bytes(peer.as_bytes())
        .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;
    let montgomery = PublicKey::from(verifying.to_montgomery().to_bytes());

    Ok(ephemeral.diffie_hellman(&montgomery).to_bytes())
}

/// Symmetric material for one direction of a session. Wiped on drop.
pub struct SessionKeys {
    pub cipher_key: [u8; KEY_SIZE],
    pub counter_iv: [u8; IV_SIZE],
    pub hmac_key: [u8; MAC_SIZE],
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.cipher_key.zeroize();
        self.counter_iv.zeroize();
        self.hmac_key.zeroize();
    }
}

/// Derives the cipher key, counter IV and initial HMAC key for one direction
/// from an ECDH shared secret. Keyed on the *receiver's* identity so the two
/// directions of a session never share key material. The shared secret is
/// wiped before returning.
pub fn derive_session(mut shared: [u8; 32], receiver: &PeerIdentity) -> SessionKeys {
    let mut keys = SessionKeys {
        cipher_key: [0u8; KEY_SIZE],
        counter_iv: [0u8; IV_SIZE],
        hmac_key: [0u8; MAC_SIZE],
    };

    expand_label(b"key", &shared, receiver, &mut keys.cipher_key);
    expand_label(b"counter", &shared, receiver, &mut keys.counter_iv);
    expand_label(b"hmac", &shared, receiver, &mut keys.hmac_key);

    shared.zeroize();

    keys
}

#[inline]
fn expand_label(label: &[u8], shared: &[u8; 32], receiver: &PeerIdentity, out: &mut [u8]) {
    Hkdf::<Sha512>::new(Some(label), shared)
        .expand(receiver.as_bytes(), out)
        .expect("Derived key length exceeds HKDF output bound");
}

/// Counter-mode stream cipher state for one direction. The keystream
/// position advances by the byte length of every call, so arbitrarily
/// fragmented reads and writes stay aligned with the sender. `Clone`
/// snapshots the position; `advance` skips keystream without producing
/// output.
#[derive(Clone)]
pub struct StreamState {
    cipher: Aes256Ctr,
}

impl StreamState {
    #[inline]
    pub fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> StreamState {
        StreamState {
            cipher: Aes256Ctr::new_from_slices(&key[..], &iv[..])
                .expect("Cipher key and IV sizes are fixed"),
        }
    }

    #[inline]
    pub fn encrypt_in_place(&mut self, buf: &mut [u8]) {
        self.cipher.apply_keystream(buf);
    }

    /// Decrypts `src` into the front of `dst`. `dst` must be at least as
    /// long as `src`.
    #[inline]
    pub fn decrypt(&mut self, src: &[u8], dst: &mut [u8]) {
        let dst = &mut dst[..src.len()];
        dst.copy_from_slice(src);
        self.cipher.apply_keystream(dst);
    }

    /// Advances the keystream position by `count` bytes.
    pub fn advance(&mut self, mut count: usize) {
        let mut scratch = [0u8; 256];

        while count > 0 {
            let step = count.min(scratch.len());
            self.cipher.apply_keystream(&mut scratch[..step]);
            count -= step;
        }
    }
}

/// Computes the 32-byte wire MAC over `data`.
#[inline]
pub fn auth_tag(key: &[u8; MAC_SIZE], data: &[u8]) -> [u8; MAC_SIZE] {
    let mut mac = HmacSha512::new_from_slice(&key[..]).expect("HMAC accepts any key length");
    mac.update(data);

    let full = mac.finalize().into_bytes();
    let mut tag = [0u8; MAC_SIZE];
    tag.copy_from_slice(&full[..MAC_SIZE]);

    tag
}

/// Constant-time check of a wire MAC.
#[inline]
pub fn auth_verify(key: &[u8; MAC_SIZE], data: &[u8], tag: &[u8; MAC_SIZE]) -> bool {
    let mut mac = HmacSha512::new_from_slice(&key[..]).expect("HMAC accepts any key length");
    mac.update(data);

    mac.verify_truncated_left(&tag[..]).is_ok()
}

/// One-way ratchet of an HMAC key after each authenticated frame.
#[inline]
pub fn ratchet_key(key: &mut [u8; MAC_SIZE]) {
    let digest = Sha256::digest(&key[..]);
    key.copy_from_slice(&digest);
}

/// Signs the purpose-tagged handshake/rekey structure with our long-term key.
pub fn sign_purpose(
    identity: &IdentityKey,
    purpose: u32,
    sender: &PeerIdentity,
    receiver: &PeerIdentity,
    ephemeral: &[u8; EPHEMERAL_SIZE],
    monotonic_time: u64,
) -> [u8; SIGNATURE_SIZE] {
    let blob = signature_blob(purpose, sender, receiver, ephemeral, monotonic_time);

    identity.signing().sign(&blob).to_bytes()
}

/// Verifies a purpose-tagged signature against a peer's long-term key.
pub fn verify_purpose(
    peer: &PeerIdentity,
    purpose: u32,
    sender: &PeerIdentity,
    receiver: &PeerIdentity,
    ephemeral: &[u8; EPHEMERAL_SIZE],
    monotonic_time: u64,
    signature: &[u8; SIGNATURE_SIZE],
) -> bool {
    let verifying = match VerifyingKey::from_bytes(peer.as_bytes()) {
        Ok(key) => key,
        Err(_) => return false,
    };

    let blob = signature_blob(purpose, sender, receiver, ephemeral, monotonic_time);

    verifying
        .verify(&blob, &Signature::from_bytes(signature))
        .is_ok()
}

fn signature_blob(
    purpose: u32,
    sender: &PeerIdentity,
    receiver: &PeerIdentity,
    ephemeral: &[u8; EPHEMERAL_SIZE],
    monotonic_time: u64,
) -> [u8; SIGNATURE_BLOB_SIZE] {
    let mut blob = [0u8; SIGNATURE_BLOB_SIZE];
    {
        let mut stream = &mut blob[..];
        stream.write_u32::<BigEndian>(purpose).expect("Error writing purpose");
        stream.write_all(sender.as_bytes()).expect("Error writing sender");
        stream.write_all(receiver.as_bytes()).expect("Error writing receiver");
        stream.write_all(ephemeral).expect("Error writing ephemeral");
        stream
            .write_u64::<BigEndian>(monotonic_time)
            .expect("Error writing monotonic time");
    }

    blob
}
