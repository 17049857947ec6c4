use crate::net::wire::{self, Confirmation, RekeyBody};
use flint::crypto::{self, SessionKeys, StreamState, MAC_SIZE};
use flint::identity::{IdentityKey, PeerIdentity};
use flint::shared::{ErrorType, NetworkError, NetworkResult};
use flint::time::monotonic_usecs;

/// Cipher plus rolling HMAC key for one direction of a session. The HMAC
/// key ratchets forward after every authenticated frame; the cipher position
/// advances with every encrypted byte.
pub struct DirectionState {
    cipher: StreamState,
    hmac_key: [u8; MAC_SIZE],
}

impl std::fmt::Debug for DirectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionState").finish_non_exhaustive()
    }
}

impl DirectionState {
    #[inline]
    pub fn from_keys(keys: SessionKeys) -> DirectionState {
        DirectionState {
            cipher: StreamState::new(&keys.cipher_key, &keys.counter_iv),
            hmac_key: keys.hmac_key,
        }
    }

    #[inline]
    pub fn encrypt_in_place(&mut self, buf: &mut [u8]) {
        self.cipher.encrypt_in_place(buf);
    }

    #[inline]
    pub fn decrypt(&mut self, src: &[u8], dst: &mut [u8]) {
        self.cipher.decrypt(src, dst);
    }

    /// Tags `data` with the current HMAC key, then ratchets the key.
    #[inline]
    pub fn tag(&mut self, data: &[u8]) -> [u8; MAC_SIZE] {
        let mac = crypto::auth_tag(&self.hmac_key, data);
        crypto::ratchet_key(&mut self.hmac_key);

        mac
    }

    /// Verifies `mac` over `data`. The key ratchets only on success; a
    /// failure leaves the state untouched for the caller's teardown path.
    #[inline]
    pub fn verify(&mut self, data: &[u8], mac: &[u8; MAC_SIZE]) -> bool {
        if !crypto::auth_verify(&self.hmac_key, data, mac) {
            return false;
        }

        crypto::ratchet_key(&mut self.hmac_key);
        true
    }

    /// Snapshot of the cipher position. Used by the decryption loop to
    /// rewind keystream that raced ahead of frame parsing.
    #[inline]
    pub(crate) fn fork_cipher(&self) -> StreamState {
        self.cipher.clone()
    }

    #[inline]
    pub(crate) fn restore_cipher(&mut self, cipher: StreamState) {
        self.cipher = cipher;
    }
}

/// Installs the receiving direction for a peer ephemeral key: ECDH against
/// our long-term key, derivation keyed on our own identity.
pub fn setup_in(identity: &IdentityKey, peer_ephemeral: &[u8; 32]) -> DirectionState {
    let shared = crypto::ecdh_identity_ephemeral(identity, peer_ephemeral);
    let keys = crypto::derive_session(shared, &identity.peer_identity());

    DirectionState::from_keys(keys)
}

/// Installs the sending direction under a fresh ephemeral key: ECDH against
/// the peer's long-term key, derivation keyed on the peer's identity. The
/// ephemeral secret is consumed and wiped.
pub fn setup_out(
    ephemeral: crypto::StaticSecret,
    peer: &PeerIdentity,
) -> NetworkResult<DirectionState> {
    let shared = crypto::ecdh_ephemeral_identity(ephemeral, peer)?;
    let keys = crypto::derive_session(shared, peer);

    Ok(DirectionState::from_keys(keys))
}

/// A verified initial handshake: the continuing inbound cipher state, the
/// authenticated sender and the monotonic time it signed.
pub struct HandshakeOutcome {
    pub inbound: DirectionState,
    pub sender: PeerIdentity,
    pub monotonic_time: u64,
}

/// Verifies a complete 136-byte initial handshake addressed to `identity`.
/// On success the returned cipher state has consumed exactly the
/// confirmation bytes and continues mid-stream into the framed messages.
pub fn accept_handshake(identity: &IdentityKey, bytes: &[u8]) -> NetworkResult<HandshakeOutcome> {
    if bytes.len() < wire::HANDSHAKE_SIZE {
        return Err(NetworkError::Wait);
    }

    let mut ephemeral = [0u8; crypto::EPHEMERAL_SIZE];
    ephemeral.copy_from_slice(&bytes[..crypto::EPHEMERAL_SIZE]);

    let mut inbound = setup_in(identity, &ephemeral);

    let mut plain = [0u8; Confirmation::SIZE];
    inbound.decrypt(&bytes[crypto::EPHEMERAL_SIZE..wire::HANDSHAKE_SIZE], &mut plain);

    let confirmation = Confirmation::read(&plain)?;

    let valid = crypto::verify_purpose(
        &confirmation.sender,
        crypto::PURPOSE_HANDSHAKE,
        &confirmation.sender,
        &identity.peer_identity(),
        &ephemeral,
        confirmation.monotonic_time,
        &confirmation.signature,
    );

    if !valid {
        return Err(NetworkError::Fatal(ErrorType::SignatureInvalid));
    }

    Ok(HandshakeOutcome {
        inbound,
        sender: confirmation.sender,
        monotonic_time: confirmation.monotonic_time,
    })
}

/// Builds our initial handshake toward `peer`: a fresh ephemeral key in
/// plaintext followed by the signed confirmation, encrypted under the new
/// outbound cipher. Returns the wire bytes together with the outbound state
/// that continues past them.
pub fn initiate_handshake(
    identity: &IdentityKey,
    peer: &PeerIdentity,
    monotonic_time: u64,
) -> NetworkResult<([u8; wire::HANDSHAKE_SIZE], DirectionState)> {
    let (ephemeral_secret, ephemeral_public) = crypto::ephemeral_generate();

    let signature = crypto::sign_purpose(
        identity,
        crypto::PURPOSE_HANDSHAKE,
        &identity.peer_identity(),
        peer,
        &ephemeral_public,
        monotonic_time,
    );

    let mut outbound = setup_out(ephemeral_secret, peer)?;

    let confirmation = Confirmation {
        sender: identity.peer_identity(),
        signature,
        monotonic_time,
    };

    let mut bytes = [0u8; wire::HANDSHAKE_SIZE];
    bytes[..crypto::EPHEMERAL_SIZE].copy_from_slice(&ephemeral_public);
    {
        let mut stream = &mut bytes[crypto::EPHEMERAL_SIZE..];
        confirmation.write(&mut stream)?;
    }
    outbound.encrypt_in_place(&mut bytes[crypto::EPHEMERAL_SIZE..]);

    Ok((bytes, outbound))
}

/// Builds the body of an outbound rekey plus the direction state that takes
/// over once the frame is on the wire.
pub fn build_rekey(
    identity: &IdentityKey,
    peer: &PeerIdentity,
) -> NetworkResult<(RekeyBody, DirectionState)> {
    let monotonic_time = monotonic_usecs();
    let (ephemeral_secret, ephemeral_public) = crypto::ephemeral_generate();

    let signature = crypto::sign_purpose(
        identity,
        crypto::PURPOSE_REKEY,
        &identity.peer_identity(),
        peer,
        &ephemeral_public,
        monotonic_time,
    );

    let next_outbound = setup_out(ephemeral_secret, peer)?;

    Ok((
        RekeyBody {
            ephemeral: ephemeral_public,
            signature,
            monotonic_time,
        },
        next_outbound,
    ))
}

/// Verifies a received rekey body against the peer's long-term key and, on
/// success, returns the replacement inbound direction state.
pub fn install_rekey(
    identity: &IdentityKey,
    peer: &PeerIdentity,
    body: &RekeyBody,
) -> NetworkResult<DirectionState> {
    let valid = crypto::verify_purpose(
        peer,
        crypto::PURPOSE_REKEY,
        peer,
        &identity.peer_identity(),
        &body.ephemeral,
        body.monotonic_time,
        &body.signature,
    );

    if !valid {
        return Err(NetworkError::Fatal(ErrorType::SignatureInvalid));
    }

    Ok(setup_in(identity, &body.ephemeral))
}
