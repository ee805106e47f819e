use std::collections::BTreeMap;
use bytes::{BufMut, BytesMut};
use serde_derive::{Deserialize, Serialize};
use crate::{de, MAX_FRAME_LEN};
use super::{ProtocolViolation, Result};

// Extension id reserved for the extension handshake itself.
pub const HANDSHAKE_ID: u8 = 0;

// The id we ask remotes to use when sending us ut_metadata messages.
pub const LOCAL_METADATA_ID: u8 = 1;

pub const UT_METADATA: &str = "ut_metadata";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtHandshake {

    // Id the sender wants ut_metadata messages tagged with.
    pub metadata_id: u8,

    // Size of the raw info dict, 0 if the sender doesn't know it.
    pub metadata_size: usize,

}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {

    // Asks for a 16KiB chunk of the info dict.
    Request { piece: u32 },

    Data {
        piece: u32,
        total_size: usize,
        data: Vec<u8>,
    },

    // Sender will not serve the chunk.
    Reject { piece: u32 },

}

#[derive(Serialize, Deserialize)]
struct HandshakeDict {

    #[serde(default)]
    m: BTreeMap<String, i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata_size: Option<i64>,

}

#[derive(Serialize, Deserialize)]
struct MetadataDict {

    msg_type: i64,

    piece: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_size: Option<i64>,

}

fn bencode_err(e: serde_bencode::Error) -> ProtocolViolation {
    ProtocolViolation::ExtensionDecode(e.to_string())
}

impl ExtHandshake {

    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let mut m = BTreeMap::new();
        m.insert(UT_METADATA.to_string(), self.metadata_id as i64);
        let dict = HandshakeDict {
            m,
            metadata_size: (self.metadata_size > 0).then_some(self.metadata_size as i64),
        };
        dst.extend_from_slice(&serde_bencode::to_bytes(&dict).map_err(bencode_err)?);
        Ok(())
    }

    pub fn decode(payload: &[u8]) -> Result<ExtHandshake> {
        let dict: HandshakeDict = serde_bencode::from_bytes(payload).map_err(bencode_err)?;

        let id = dict.m.get(UT_METADATA).copied().unwrap_or(0);
        if !(1..=255).contains(&id) {
            return Err(ProtocolViolation::InvalidMetadataId(id).into());
        }

        let size = dict.metadata_size.unwrap_or(0);
        if !(0..=MAX_FRAME_LEN as i64).contains(&size) {
            return Err(ProtocolViolation::InvalidMetadataSize(size).into());
        }

        Ok(ExtHandshake {
            metadata_id: id as u8,
            metadata_size: size as usize,
        })
    }
}

impl MetadataMessage {

    pub fn piece(&self) -> u32 {
        match self {
            MetadataMessage::Request { piece }
            | MetadataMessage::Data { piece, .. }
            | MetadataMessage::Reject { piece } => *piece,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let (msg_type, total_size, data): (i64, _, &[u8]) = match self {
            MetadataMessage::Request { .. } => (0, None, &[]),
            MetadataMessage::Data { total_size, data, .. } => (1, Some(*total_size as i64), data),
            MetadataMessage::Reject { .. } => (2, None, &[]),
        };
        let dict = MetadataDict {
            msg_type,
            piece: self.piece() as i64,
            total_size,
        };
        dst.extend_from_slice(&serde_bencode::to_bytes(&dict).map_err(bencode_err)?);
        dst.put_slice(data);
        Ok(())
    }

    // The dict is followed by the raw chunk for data messages, its end is
    // found by scanning rather than re-encoding.
    pub fn decode(payload: &[u8]) -> Result<MetadataMessage> {
        let dict_len = de::value_len(payload)
            .map_err(|e| ProtocolViolation::ExtensionDecode(e.to_string()))?;
        let dict: MetadataDict = serde_bencode::from_bytes(&payload[..dict_len])
            .map_err(bencode_err)?;
        let trailing = &payload[dict_len..];

        let piece = u32::try_from(dict.piece)
            .map_err(|_| ProtocolViolation::InvalidMetadataPiece(dict.piece))?;

        let msg = match dict.msg_type {
            0 => MetadataMessage::Request { piece },
            1 => {
                let total_size = dict.total_size.unwrap_or(-1);
                if !(1..=MAX_FRAME_LEN as i64).contains(&total_size) {
                    return Err(ProtocolViolation::InvalidMetadataSize(total_size).into());
                }
                return Ok(MetadataMessage::Data {
                    piece,
                    total_size: total_size as usize,
                    data: trailing.to_vec(),
                });
            },
            2 => MetadataMessage::Reject { piece },
            other => return Err(ProtocolViolation::InvalidMetadataType(other).into()),
        };

        // Only data messages carry a payload.
        if !trailing.is_empty() {
            return Err(ProtocolViolation::ExtensionDecode("trailing bytes after metadata message".into()).into());
        }
        Ok(msg)
    }
}
