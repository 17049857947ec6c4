use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flint::crypto::{EPHEMERAL_SIZE, MAC_SIZE, SIGNATURE_SIZE};
use flint::identity::PeerIdentity;
use flint::shared::{ErrorType, NetworkError, NetworkResult};
use std::io::{Read, Write};

/// Frame type tags, carried as the second u16 of every message header.
pub const TYPE_BOX: u16 = 1;
pub const TYPE_REKEY: u16 = 2;
pub const TYPE_FINISH: u16 = 3;

pub const HEADER_SIZE: usize = 4;
pub const MAX_PAYLOAD: usize = 65535;

/// Header plus wire MAC; every framed message starts with these 36 bytes.
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + MAC_SIZE;

pub const REKEY_BODY_SIZE: usize = EPHEMERAL_SIZE + SIGNATURE_SIZE + 8;
pub const REKEY_FRAME_SIZE: usize = FRAME_OVERHEAD + REKEY_BODY_SIZE;
pub const FINISH_FRAME_SIZE: usize = FRAME_OVERHEAD;

pub const CONFIRMATION_SIZE: usize = PeerIdentity::SIZE + SIGNATURE_SIZE + 8;
/// Plaintext ephemeral key followed by the encrypted confirmation.
pub const HANDSHAKE_SIZE: usize = EPHEMERAL_SIZE + CONFIRMATION_SIZE;

/// `{ size: u16, type: u16 }`, both network byte order. For boxes, `size` is
/// the payload length excluding the header and MAC; for rekey and finish
/// frames it is the size of the whole frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MessageHeader {
    pub size: u16,
    pub kind: u16,
}

impl MessageHeader {
    #[inline]
    pub fn read(mut stream: &[u8]) -> NetworkResult<MessageHeader> {
        if stream.len() < HEADER_SIZE {
            return Err(NetworkError::Wait);
        }

        Ok(MessageHeader {
            size: stream.read_u16::<BigEndian>()?,
            kind: stream.read_u16::<BigEndian>()?,
        })
    }

    #[inline]
    pub fn write<W: Write>(&self, stream: &mut W) -> NetworkResult<()> {
        stream.write_u16::<BigEndian>(self.size)?;
        stream.write_u16::<BigEndian>(self.kind)?;
        Ok(())
    }
}

/// Body of a rekey frame: the sender's next ephemeral key, signed under the
/// rekey purpose together with the monotonic timestamp.
#[derive(Debug, Clone)]
pub struct RekeyBody {
    pub ephemeral: [u8; EPHEMERAL_SIZE],
    pub signature: [u8; SIGNATURE_SIZE],
    pub monotonic_time: u64,
}

impl RekeyBody {
    #[inline]
    pub fn read<R: Read>(mut stream: R) -> NetworkResult<RekeyBody> {
        let mut ephemeral = [0u8; EPHEMERAL_SIZE];
        let mut signature = [0u8; SIGNATURE_SIZE];

        stream.read_exact(&mut ephemeral)?;
        stream.read_exact(&mut signature)?;
        let monotonic_time = stream.read_u64::<BigEndian>()?;

        Ok(RekeyBody {
            ephemeral,
            signature,
            monotonic_time,
        })
    }

    #[inline]
    pub fn write<W: Write>(&self, stream: &mut W) -> NetworkResult<()> {
        stream.write_all(&self.ephemeral)?;
        stream.write_all(&self.signature)?;
        stream.write_u64::<BigEndian>(self.monotonic_time)?;
        Ok(())
    }
}

/// One parsed frame header-plus-metadata. Box payload bytes stay in the
/// plaintext buffer; `payload_len` locates them behind the 36-byte overhead.
#[derive(Debug)]
pub enum FrameMeta {
    Box {
        mac: [u8; MAC_SIZE],
        payload_len: usize,
    },
    Rekey {
        mac: [u8; MAC_SIZE],
        body: RekeyBody,
    },
    Finish {
        mac: [u8; MAC_SIZE],
    },
}

/// Parses the frame at the front of `buf`. Returns the frame and its total
/// wire length. `Wait` means more bytes are needed; anything malformed is
/// fatal for the session.
pub fn parse_frame(buf: &[u8]) -> NetworkResult<(FrameMeta, usize)> {
    let header = MessageHeader::read(buf)?;

    match header.kind {
        TYPE_BOX => {
            if header.size == 0 {
                return Err(NetworkError::Fatal(ErrorType::EmptyPayload));
            }

            let payload_len = header.size as usize;
            let total = FRAME_OVERHEAD + payload_len;

            if buf.len() < total {
                return Err(NetworkError::Wait);
            }

            Ok((
                FrameMeta::Box {
                    mac: read_mac(buf),
                    payload_len,
                },
                total,
            ))
        }
        TYPE_REKEY => {
            if header.size as usize != REKEY_FRAME_SIZE {
                return Err(NetworkError::Fatal(ErrorType::MalformedFrame));
            }

            if buf.len() < REKEY_FRAME_SIZE {
                return Err(NetworkError::Wait);
            }

            let body = RekeyBody::read(&buf[FRAME_OVERHEAD..REKEY_FRAME_SIZE])?;

            Ok((
                FrameMeta::Rekey {
                    mac: read_mac(buf),
                    body,
                },
                REKEY_FRAME_SIZE,
            ))
        }
        TYPE_FINISH => {
            if header.size as usize != FINISH_FRAME_SIZE {
                return Err(NetworkError::Fatal(ErrorType::MalformedFrame));
            }

            if buf.len() < FINISH_FRAME_SIZE {
                return Err(NetworkError::Wait);
            }

            Ok((FrameMeta::Finish { mac: read_mac(buf) }, FINISH_FRAME_SIZE))
        }
        _ => Err(NetworkError::Fatal(ErrorType::UnknownFrameType)),
    }
}

#[inline]
fn read_mac(buf: &[u8]) -> [u8; MAC_SIZE] {
    let mut mac = [0u8; MAC_SIZE];
    mac.copy_from_slice(&buf[HEADER_SIZE..FRAME_OVERHEAD]);
    mac
}

/// Serializes a box frame: header, MAC, payload.
pub fn write_box<W: Write>(stream: &mut W, mac: &[u8; MAC_SIZE], payload: &[u8]) -> NetworkResult<()> {
    MessageHeader {
        size: payload.len() as u16,
        kind: TYPE_BOX,
    }
    .write(stream)?;
    stream.write_all(mac)?;
    stream.write_all(payload)?;
    Ok(())
}

/// Serializes a rekey frame: header, MAC, body.
pub fn write_rekey<W: Write>(stream: &mut W, mac: &[u8; MAC_SIZE], body: &RekeyBody) -> NetworkResult<()> {
    MessageHeader {
        size: REKEY_FRAME_SIZE as u16,
        kind: TYPE_REKEY,
    }
    .write(stream)?;
    stream.write_all(mac)?;
    body.write(stream)?;
    Ok(())
}

/// Serializes a finish frame: header, MAC.
pub fn write_finish<W: Write>(stream: &mut W, mac: &[u8; MAC_SIZE]) -> NetworkResult<()> {
    MessageHeader {
        size: FINISH_FRAME_SIZE as u16,
        kind: TYPE_FINISH,
    }
    .write(stream)?;
    stream.write_all(mac)?;
    Ok(())
}

/// The MAC input of a rekey frame: the whole frame with the MAC field zeroed.
pub fn rekey_mac_input(body: &RekeyBody) -> [u8; REKEY_FRAME_SIZE] {
    let mut input = [0u8; REKEY_FRAME_SIZE];
    {
        let mut stream = &mut input[..];
        MessageHeader {
            size: REKEY_FRAME_SIZE as u16,
            kind: TYPE_REKEY,
        }
        .write(&mut stream)
        .expect("Error writing rekey header");
        stream
            .write_all(&[0u8; MAC_SIZE])
            .expect("Error writing zeroed mac field");
        body.write(&mut stream).expect("Error writing rekey body");
    }

    input
}

/// The MAC input of a finish frame: header followed by the zeroed MAC field.
pub fn finish_mac_input() -> [u8; FINISH_FRAME_SIZE] {
    let mut input = [0u8; FINISH_FRAME_SIZE];
    {
        let mut stream = &mut input[..];
        MessageHeader {
            size: FINISH_FRAME_SIZE as u16,
            kind: TYPE_FINISH,
        }
        .write(&mut stream)
        .expect("Error writing finish header");
    }

    input
}

/// The encrypted continuation of the initial handshake.
#[derive(Debug)]
pub struct Confirmation {
    pub sender: PeerIdentity,
    pub signature: [u8; SIGNATURE_SIZE],
    pub monotonic_time: u64,
}

impl Confirmation {
    pub const SIZE: usize = CONFIRMATION_SIZE;

    #[inline]
    pub fn read(mut stream: &[u8]) -> NetworkResult<Confirmation> {
        if stream.len() < Self::SIZE {
            return Err(NetworkError::Wait);
        }

        let mut sender = [0u8; PeerIdentity::SIZE];
        let mut signature = [0u8; SIGNATURE_SIZE];

        stream.read_exact(&mut sender)?;
        stream.read_exact(&mut signature)?;
        let monotonic_time = stream.read_u64::<BigEndian>()?;

        Ok(Confirmation {
            sender: PeerIdentity::from_bytes(sender),
            signature,
            monotonic_time,
        })
    }

    #[inline]
    pub fn write<W: Write>(&self, stream: &mut W) -> NetworkResult<()> {
        stream.write_all(self.sender.as_bytes())?;
        stream.write_all(&self.signature)?;
        stream.write_u64::<BigEndian>(self.monotonic_time)?;
        Ok(())
    }
}
