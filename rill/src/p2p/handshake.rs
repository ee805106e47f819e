use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Encoder, Decoder};
use crate::ID;
use super::{PeerError, ProtocolViolation, Result};

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

pub const HANDSHAKE_LEN: usize = 68;

// Extension protocol (byte 5, 0x10) and DHT (byte 7, 0x01).
pub const RESERVED: [u8; 8] = [0, 0, 0, 0, 0, 0x10, 0, 0x01];

#[derive(Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol:   [u8; 19],
    pub reserved:   [u8; 8],
    pub info_hash:  ID,
    pub peer_id:    ID,
}

impl Handshake {
    pub fn new(info_hash: ID, peer_id: ID) -> Self {
        Self {
            protocol:   PROTOCOL,
            reserved:   RESERVED,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.extend_from_slice(&self.protocol);
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);
        debug_assert_eq!(buf.len(), HANDSHAKE_LEN, "encoded handshake length is not 68 bytes");
        buf
    }
}

// Parses a handshake from the front of buf, consuming exactly 68 bytes.
// Returns None until enough bytes have arrived, but fails as soon as the
// bytes already present are wrong.
pub fn parse_handshake(buf: &mut BytesMut, expected_hash: &ID) -> Result<Option<Handshake>> {

    if let Some(&len) = buf.first() {
        if len != 19 {
            return Err(ProtocolViolation::IncorrectProtocol.into());
        }
    }
    let name = &buf[1.min(buf.len())..20.min(buf.len())];
    if name != &PROTOCOL[..name.len()] {
        return Err(ProtocolViolation::IncorrectProtocol.into());
    }
    if buf.len() < HANDSHAKE_LEN {
        return Ok(None);
    }

    let mut src = buf.split_to(HANDSHAKE_LEN);
    src.advance(1);

    let mut protocol = [0; 19];
    src.copy_to_slice(&mut protocol);

    let mut reserved = [0; 8];
    src.copy_to_slice(&mut reserved);

    let mut info_hash = [0; 20];
    src.copy_to_slice(&mut info_hash);

    let mut peer_id = [0; 20];
    src.copy_to_slice(&mut peer_id);

    let handshake = Handshake { protocol, reserved, info_hash, peer_id };
    if !handshake.supports_extensions() {
        return Err(ProtocolViolation::NoExtensionSupport.into());
    }
    if &handshake.info_hash != expected_hash {
        return Err(ProtocolViolation::IncorrectInfoHash.into());
    }

    Ok(Some(handshake))
}

// Codec for the first message of a connection, only valid for one torrent.
pub struct HandshakeCodec {
    pub info_hash: ID,
}

impl Encoder<Handshake> for HandshakeCodec {

    type Error = PeerError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item.to_bytes());
        Ok(())
    }
}

impl Decoder for HandshakeCodec {

    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        parse_handshake(src, &self.info_hash)
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("protocol", &String::from_utf8_lossy(&self.protocol))
            .field("reserved", &self.reserved)
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}
