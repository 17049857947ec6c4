use crate::encoding::base64;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub const IDENTITY_SIZE: usize = 32;
pub const SEED_SIZE: usize = 32;

/// The long-term Ed25519 public key naming a peer across the system.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerIdentity([u8; IDENTITY_SIZE]);

impl PeerIdentity {
    pub const SIZE: usize = IDENTITY_SIZE;

    #[inline]
    pub fn from_bytes(bytes: [u8; IDENTITY_SIZE]) -> PeerIdentity {
        PeerIdentity(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; IDENTITY_SIZE] {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", base64::encode(&self.0))
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PeerIdentity({})", base64::encode(&self.0))
    }
}

impl Serialize for PeerIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        base64::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for PeerIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(PeerIdentity(deserialize_b64_array(deserializer)?))
    }
}

/// The process's own long-term Ed25519 keypair. Carried in the config file
/// as the base64 encoding of the 32-byte seed.
pub struct IdentityKey {
    signing: SigningKey,
}

impl IdentityKey {
    /// Generates a fresh long-term keypair from the system RNG.
    #[inline]
    pub fn generate() -> IdentityKey {
        IdentityKey {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    #[inline]
    pub fn from_seed(seed: [u8; SEED_SIZE]) -> IdentityKey {
        IdentityKey {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    #[inline]
    pub fn seed(&self) -> [u8; SEED_SIZE] {
        self.signing.to_bytes()
    }

    /// The public identity other peers know this process by.
    #[inline]
    pub fn peer_identity(&self) -> PeerIdentity {
        PeerIdentity(self.signing.verifying_key().to_bytes())
    }

    #[inline]
    pub(crate) fn signing(&self) -> &SigningKey {
        &self.signing
    }
}

impl Clone for IdentityKey {
    fn clone(&self) -> IdentityKey {
        IdentityKey::from_seed(self.seed())
    }
}

impl Serialize for IdentityKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        base64::serialize(&self.seed(), serializer)
    }
}

impl<'de> Deserialize<'de> for IdentityKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(IdentityKey::from_seed(deserialize_b64_array(deserializer)?))
    }
}

#[inline]
fn deserialize_b64_array<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let decoded_raw = base64::decode(&s).map_err(de::Error::custom)?;

    if decoded_raw.len() != 32 {
        return Err(de::Error::custom("key material must decode to 32 bytes"));
    }

    let mut decoded = [0u8; 32];
    decoded.copy_from_slice(&decoded_raw);
    Ok(decoded)
}
