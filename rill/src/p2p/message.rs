use bytes::{BufMut, Buf, BytesMut};
use tokio_util::codec::{Encoder, Decoder};
use crate::{block, Bitfield, MAX_FRAME_LEN};
use super::{
    extension::{ExtHandshake, MetadataMessage, HANDSHAKE_ID},
    PeerError,
    ProtocolViolation,
    Result,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {

    // The keep alive message advises peers not to close the connection,
    // even if they haven’t received a message in some time.
    KeepAlive,

    // A choke message tells a peer that no further requests will be satisfied.
    Choke,

    // Conversely unchoke signifies that requests from the peer will be served.
    Unchoke,

    // Notifies a peer that the client is interested in making requests for blocks.
    Interested,

    // Notifies a peer the client is no longer interested in requesting blocks.
    NotInterested,

    // Tells a peer that the client has a piece, referenced by the piece index.
    Have { idx: u32 },

    // Short form of communicating which pieces a client has, sent once
    // the torrent's layout is known.
    Bitfield(Bitfield),

    // Requests a block by piece index, offset within the piece and length.
    Request(block::BlockInfo),

    // Clients send blocks in the piece message, referencing piece index and block offset.
    Block(block::BlockData),

    // The cancel message is sent to cancel a request for a block.
    Cancel(block::BlockInfo),

    // The port message is sent to inform the peer of the port number that the client is listening on.
    Port { port: u16 },

    // Extension protocol envelope (id 20).
    Extended(ExtendedMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendedMessage {

    Handshake(ExtHandshake),

    // The id is whatever the receiver asked ut_metadata messages to be tagged with.
    Metadata {
        id: u8,
        msg: MetadataMessage,
    },
}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        match msg {

            // [0, 0, 0, 0]
            Message::KeepAlive => dst.put_u32(0),

            // [0, 0, 0, 1, 0]
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            },

            // [0, 0, 0, 1, 1]
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            },

            // [0, 0, 0, 1, 2]
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            },

            // [0, 0, 0, 1, 3]
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                dst.put_u32(1 + raw.len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(raw);
            },

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Block(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(&block.data);
            },

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // port: <len=0003><id=9><listen-port>
            Message::Port { port } => {
                dst.put_u32(3);
                dst.put_u8(9);
                dst.put_u16(port);
            },

            // extended: <len=0002+X><id=20><ext id><bencoded dict><raw data>
            Message::Extended(ext) => {
                let mut payload = BytesMut::new();
                match ext {
                    ExtendedMessage::Handshake(hs) => {
                        payload.put_u8(HANDSHAKE_ID);
                        hs.encode(&mut payload)?;
                    },
                    ExtendedMessage::Metadata { id, msg } => {
                        payload.put_u8(id);
                        msg.encode(&mut payload)?;
                    },
                }
                dst.put_u32(1 + payload.len() as u32);
                dst.put_u8(20);
                dst.extend_from_slice(&payload);
            },
        }

        Ok(())
    }
}

// Exact payload length (id included) of fixed size messages, minimum for the rest.
fn check_len(id: u8, len: usize) -> Result<()> {
    let ok = match id {
        0..=3 => len == 1,
        4 => len == 5,
        5 => len >= 1,
        6 | 8 => len == 13,
        7 => len >= 9,
        9 => len == 3,
        20 => len >= 2,
        id => return Err(ProtocolViolation::InvalidMessageId(id).into()),
    };
    if ok {
        Ok(())
    } else {
        Err(ProtocolViolation::InvalidLength { id, len }.into())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {

        // Can't read message length.
        if src.remaining() < 4 { return Ok(None); }

        let msg_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if msg_len > MAX_FRAME_LEN {
            return Err(ProtocolViolation::MessageTooLong(msg_len).into());
        }

        if src.remaining() < 4 + msg_len {
            // Haven't recieved all of message.
            src.reserve(4 + msg_len - src.remaining());
            return Ok(None);
        }

        src.advance(4);
        if msg_len == 0 { return Ok(Some(Message::KeepAlive)); }

        let mut payload = src.split_to(msg_len);
        let id = payload.get_u8();
        check_len(id, msg_len)?;

        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => Message::Have { idx: payload.get_u32() },
            5 => Message::Bitfield(Bitfield::from_vec(payload.to_vec())),
            6 | 8 => {
                let piece_idx = payload.get_u32() as usize;
                let offset = payload.get_u32() as usize;
                let len = payload.get_u32() as usize;
                let block = block::BlockInfo { piece_idx, offset, len };
                if id == 6 { Message::Request(block) } else { Message::Cancel(block) }
            },
            7 => {
                let piece_idx = payload.get_u32() as usize;
                let offset = payload.get_u32() as usize;
                Message::Block(block::BlockData { piece_idx, offset, data: payload.to_vec() })
            },
            9 => Message::Port { port: payload.get_u16() },
            _ => {
                let ext_id = payload.get_u8();
                if ext_id == HANDSHAKE_ID {
                    Message::Extended(ExtendedMessage::Handshake(ExtHandshake::decode(&payload)?))
                } else {
                    Message::Extended(ExtendedMessage::Metadata {
                        id: ext_id,
                        msg: MetadataMessage::decode(&payload)?,
                    })
                }
            },
        };

        Ok(Some(msg))
    }
}

// Decodes every complete frame in buf, handing each message to sink in
// order. Incomplete trailing bytes are left in buf.
pub fn parse_messages<F>(buf: &mut BytesMut, mut sink: F) -> Result<()>
where
    F: FnMut(Message) -> Result<()>,
{
    while let Some(msg) = MessageCodec.decode(buf)? {
        sink(msg)?;
    }
    Ok(())
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece idx: {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(f, "request for block {{ piece idx: {}, offset {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::Block(block) => write!(f, "block data {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.data.len(),
            ),
            Message::Cancel(block) => write!(f, "cancel for block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len
            ),
            Message::Port { port } => write!(f, "port {}", port),
            Message::Extended(ExtendedMessage::Handshake(hs)) => write!(f, "extension handshake {{ ut_metadata: {}, metadata_size: {} }}",
                hs.metadata_id,
                hs.metadata_size,
            ),
            Message::Extended(ExtendedMessage::Metadata { msg, .. }) => match msg {
                MetadataMessage::Request { piece } => write!(f, "metadata request for piece {}", piece),
                MetadataMessage::Data { piece, data, .. } => write!(f, "metadata piece {} ({} bytes)", piece, data.len()),
                MetadataMessage::Reject { piece } => write!(f, "metadata reject for piece {}", piece),
            },
        }
    }
}
