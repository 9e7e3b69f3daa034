//! Chunked message framing over the data and command channels
//!
//! Bulk payloads travel as a `transfer_start` control frame, a run of binary
//! chunk frames and a closing `transfer_end` control frame. Control and command
//! frames are short JSON text written in one piece.
//!
//! ## Chunk Frame Format
//!
//! - Transfer id hash: 4 bytes (u32, big-endian)
//! - Chunk index: 4 bytes (u32, big-endian)
//! - Data: up to `chunk_size` bytes
//!
//! Reassembly concatenates fragments in the order they arrive and completes on
//! `transfer_end`, whatever the received chunk count. The embedded index is only
//! used for diagnostics.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{LinkError, LinkResult};
use crate::peer::PeerAddress;
use crate::protocol::{chunk_size_for_mtu, CHUNK_HEADER_LEN};

// ----------------------------------------------------------------------------
// Transfer Id Hash
// ----------------------------------------------------------------------------

/// 32-bit identifier carried in every chunk header.
///
/// Polynomial hash with multiplier 31 over the UTF-16 code units of the id,
/// wrapping on overflow; the mobile peer computes the same value.
pub fn transfer_id_hash(id: &str) -> u32 {
    id.encode_utf16()
        .fold(0i32, |hash, unit| {
            hash.wrapping_mul(31).wrapping_add(unit as i32)
        }) as u32
}

// ----------------------------------------------------------------------------
// Control Frames
// ----------------------------------------------------------------------------

/// Text frames bracketing a chunked transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    TransferStart { id: String, size: u64, chunks: u32 },
    TransferEnd { id: String },
}

impl ControlFrame {
    pub fn encode(&self) -> LinkResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> LinkResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| LinkError::InvalidFrame(format!("bad control frame: {}", e)))
    }
}

/// Header preceding every chunk payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub id_hash: u32,
    pub index: u32,
}

impl ChunkHeader {
    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut bytes = [0u8; CHUNK_HEADER_LEN];
        bytes[..4].copy_from_slice(&self.id_hash.to_be_bytes());
        bytes[4..].copy_from_slice(&self.index.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> LinkResult<Self> {
        if bytes.len() < CHUNK_HEADER_LEN {
            return Err(LinkError::InvalidFrame("chunk header too short".into()));
        }
        Ok(Self {
            id_hash: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            index: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}

// ----------------------------------------------------------------------------
// Outbound Transfers
// ----------------------------------------------------------------------------

/// Every frame of one bulk transfer, ready to be written in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub transfer_id: String,
    pub chunk_size: usize,
    pub start: Vec<u8>,
    pub chunks: Vec<Vec<u8>>,
    pub end: Vec<u8>,
}

impl TransferPlan {
    /// Split `payload` for a link with the given negotiated MTU
    pub fn new(
        transfer_id: &str,
        payload: &[u8],
        mtu: u16,
        max_chunk_size: usize,
    ) -> LinkResult<Self> {
        let chunk_size = chunk_size_for_mtu(mtu).min(max_chunk_size.max(1));
        let total_chunks = payload.len().div_ceil(chunk_size);
        let total_chunks = u32::try_from(total_chunks)
            .map_err(|_| LinkError::InvalidFrame("payload needs too many chunks".into()))?;

        let id_hash = transfer_id_hash(transfer_id);
        let chunks = payload
            .chunks(chunk_size)
            .enumerate()
            .map(|(index, data)| {
                let header = ChunkHeader {
                    id_hash,
                    index: index as u32,
                };
                let mut frame = Vec::with_capacity(CHUNK_HEADER_LEN + data.len());
                frame.extend_from_slice(&header.to_bytes());
                frame.extend_from_slice(data);
                frame
            })
            .collect();

        let start = ControlFrame::TransferStart {
            id: transfer_id.to_string(),
            size: payload.len() as u64,
            chunks: total_chunks,
        }
        .encode()?;
        let end = ControlFrame::TransferEnd {
            id: transfer_id.to_string(),
        }
        .encode()?;

        Ok(Self {
            transfer_id: transfer_id.to_string(),
            chunk_size,
            start,
            chunks,
            end,
        })
    }

    /// Frames in write order: start, chunks, end
    pub fn frames(&self) -> impl Iterator<Item = &[u8]> {
        std::iter::once(self.start.as_slice())
            .chain(self.chunks.iter().map(Vec::as_slice))
            .chain(std::iter::once(self.end.as_slice()))
    }

    pub fn frame_count(&self) -> usize {
        self.chunks.len() + 2
    }
}

// ----------------------------------------------------------------------------
// Inbound Reassembly
// ----------------------------------------------------------------------------

/// A payload delivered by `transfer_end`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub from: PeerAddress,
    pub transfer_id: String,
    pub payload: Vec<u8>,
    pub declared_size: u64,
    pub declared_chunks: u32,
    pub received_chunks: u32,
}

impl CompletedTransfer {
    /// Whether the received bytes and chunks match what `transfer_start` declared
    pub fn is_complete(&self) -> bool {
        self.payload.len() as u64 == self.declared_size
            && self.received_chunks == self.declared_chunks
    }
}

#[derive(Debug)]
struct Transfer {
    owner: PeerAddress,
    id_hash: u32,
    total_size: u64,
    total_chunks: u32,
    received_chunks: u32,
    fragments: Vec<(u32, Vec<u8>)>,
}

/// Collects chunk frames per transfer until `transfer_end` arrives
#[derive(Debug, Default)]
pub struct Reassembler {
    transfers: HashMap<String, Transfer>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one write received on the data channel
    pub fn ingest(&mut self, from: &PeerAddress, bytes: &[u8]) -> Option<CompletedTransfer> {
        if bytes.first() == Some(&b'{') {
            match ControlFrame::decode(bytes) {
                Ok(frame) => return self.handle_control(from, frame),
                // A chunk whose hash starts with 0x7B also begins with '{'
                Err(e) => debug!("Not a control frame from {}: {}", from, e),
            }
        }

        if bytes.len() > CHUNK_HEADER_LEN {
            self.handle_chunk(from, bytes);
        } else {
            warn!("Dropping {}-byte data write from {}", bytes.len(), from);
        }
        None
    }

    fn handle_control(
        &mut self,
        from: &PeerAddress,
        frame: ControlFrame,
    ) -> Option<CompletedTransfer> {
        match frame {
            ControlFrame::TransferStart { id, size, chunks } => {
                debug!(
                    "Transfer {} from {} started: {} bytes in {} chunks",
                    id, from, size, chunks
                );
                let transfer = Transfer {
                    owner: from.clone(),
                    id_hash: transfer_id_hash(&id),
                    total_size: size,
                    total_chunks: chunks,
                    received_chunks: 0,
                    fragments: Vec::with_capacity(chunks.min(1024) as usize),
                };
                if self.transfers.insert(id.clone(), transfer).is_some() {
                    warn!("Transfer {} restarted, discarding earlier fragments", id);
                }
                None
            }
            ControlFrame::TransferEnd { id } => {
                let Some(transfer) = self.transfers.remove(&id) else {
                    warn!("transfer_end for unknown transfer {} from {}", id, from);
                    return None;
                };

                let in_order = transfer
                    .fragments
                    .windows(2)
                    .all(|pair| pair[0].0 < pair[1].0);
                if !in_order {
                    warn!("Transfer {} chunks arrived out of order", id);
                }
                if transfer.received_chunks != transfer.total_chunks {
                    warn!(
                        "Transfer {} ended with {}/{} chunks",
                        id, transfer.received_chunks, transfer.total_chunks
                    );
                }

                let payload: Vec<u8> = transfer
                    .fragments
                    .into_iter()
                    .flat_map(|(_, data)| data)
                    .collect();

                Some(CompletedTransfer {
                    from: transfer.owner,
                    transfer_id: id,
                    payload,
                    declared_size: transfer.total_size,
                    declared_chunks: transfer.total_chunks,
                    received_chunks: transfer.received_chunks,
                })
            }
        }
    }

    fn handle_chunk(&mut self, from: &PeerAddress, bytes: &[u8]) {
        let header = match ChunkHeader::from_bytes(bytes) {
            Ok(header) => header,
            Err(e) => {
                warn!("Bad chunk from {}: {}", from, e);
                return;
            }
        };

        let transfer = self
            .transfers
            .values_mut()
            .find(|t| t.id_hash == header.id_hash && &t.owner == from);

        match transfer {
            Some(transfer) => {
                transfer
                    .fragments
                    .push((header.index, bytes[CHUNK_HEADER_LEN..].to_vec()));
                transfer.received_chunks += 1;
            }
            None => debug!(
                "Chunk {} for unknown transfer hash {:08x} from {}",
                header.index, header.id_hash, from
            ),
        }
    }

    /// Drop every transfer owned by a peer whose connection closed
    pub fn abandon(&mut self, owner: &PeerAddress) -> usize {
        let before = self.transfers.len();
        self.transfers.retain(|_, t| &t.owner != owner);
        let abandoned = before - self.transfers.len();
        if abandoned > 0 {
            debug!("Abandoned {} transfers from {}", abandoned, owner);
        }
        abandoned
    }

    pub fn pending(&self) -> usize {
        self.transfers.len()
    }
}

// ----------------------------------------------------------------------------
// Command Frames
// ----------------------------------------------------------------------------

/// Command sent on the command channel or as a server notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    pub command: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub timestamp: i64,
}

impl CommandFrame {
    pub fn new(command: impl Into<String>, params: Value) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self {
            command: command.into(),
            params,
            timestamp,
        }
    }

    pub fn encode(&self) -> LinkResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireCommand {
    Current {
        command: String,
        #[serde(default)]
        params: Value,
    },
    Legacy {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        data: Value,
    },
}

/// Command received from a peer, normalized from either wire shape
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCommand {
    pub command: String,
    pub params: Value,
}

impl IncomingCommand {
    pub fn parse(bytes: &[u8]) -> LinkResult<Self> {
        let wire: WireCommand = serde_json::from_slice(bytes)
            .map_err(|e| LinkError::InvalidFrame(format!("bad command frame: {}", e)))?;
        let (command, params) = match wire {
            WireCommand::Current { command, params } => (command, params),
            WireCommand::Legacy { kind, data } => (kind, data),
        };
        Ok(Self { command, params })
    }

    /// String parameter lookup
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn peer(name: &str) -> PeerAddress {
        PeerAddress::new(name)
    }

    fn deliver(
        reassembler: &mut Reassembler,
        from: &PeerAddress,
        frames: Vec<&[u8]>,
    ) -> Option<CompletedTransfer> {
        let mut completed = None;
        for frame in frames {
            if let Some(done) = reassembler.ingest(from, frame) {
                completed = Some(done);
            }
        }
        completed
    }

    #[test]
    fn test_transfer_id_hash_matches_peer_values() {
        assert_eq!(transfer_id_hash(""), 0);
        assert_eq!(transfer_id_hash("a"), 97);
        assert_eq!(transfer_id_hash("abc"), 96354);
        assert_eq!(transfer_id_hash("hello"), 99162322);
        // Wraps like a signed 32-bit accumulator
        assert_eq!(transfer_id_hash("polygenelubricants"), i32::MIN as u32);
    }

    #[test]
    fn test_control_frame_wire_format() {
        let start = ControlFrame::TransferStart {
            id: "t1".into(),
            size: 10,
            chunks: 2,
        };
        let value: Value = serde_json::from_slice(&start.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "transfer_start", "id": "t1", "size": 10, "chunks": 2})
        );

        let end = ControlFrame::decode(br#"{"type":"transfer_end","id":"t1"}"#).unwrap();
        assert_eq!(end, ControlFrame::TransferEnd { id: "t1".into() });
    }

    #[test]
    fn test_plan_uses_mtu_bound_chunks() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let plan = TransferPlan::new("file-1", &payload, 185, 512).unwrap();

        assert_eq!(plan.chunk_size, 182);
        assert_eq!(plan.chunks.len(), 6);
        assert_eq!(plan.frame_count(), 8);
        assert!(plan.chunks.iter().all(|c| c.len() <= 182 + CHUNK_HEADER_LEN));

        let header = ChunkHeader::from_bytes(&plan.chunks[3]).unwrap();
        assert_eq!(header.id_hash, transfer_id_hash("file-1"));
        assert_eq!(header.index, 3);

        let start = ControlFrame::decode(&plan.start).unwrap();
        assert_eq!(
            start,
            ControlFrame::TransferStart {
                id: "file-1".into(),
                size: 1000,
                chunks: 6
            }
        );
    }

    #[test]
    fn test_in_order_reassembly() {
        let payload = b"The quick brown fox jumps over the lazy dog".to_vec();
        let plan = TransferPlan::new("t", &payload, 23, 512).unwrap();
        let from = peer("A");

        let mut reassembler = Reassembler::new();
        let done = deliver(&mut reassembler, &from, plan.frames().collect()).unwrap();

        assert_eq!(done.payload, payload);
        assert_eq!(done.transfer_id, "t");
        assert!(done.is_complete());
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_out_of_order_chunks_are_kept_in_receipt_order() {
        let payload = b"0123456789abcdefghijklmnopqrstuvwxyz0123".to_vec();
        let plan = TransferPlan::new("t", &payload, 23, 512).unwrap();
        assert_eq!(plan.chunks.len(), 2);
        let from = peer("A");

        let mut reassembler = Reassembler::new();
        let frames = vec![
            plan.start.as_slice(),
            plan.chunks[1].as_slice(),
            plan.chunks[0].as_slice(),
            plan.end.as_slice(),
        ];
        let done = deliver(&mut reassembler, &from, frames).unwrap();

        let mut expected = payload[20..].to_vec();
        expected.extend_from_slice(&payload[..20]);
        assert_eq!(done.payload, expected);
    }

    #[test]
    fn test_transfer_end_completes_with_missing_chunks() {
        let payload = vec![7u8; 60];
        let plan = TransferPlan::new("t", &payload, 23, 512).unwrap();
        let from = peer("A");

        let mut reassembler = Reassembler::new();
        let frames = vec![
            plan.start.as_slice(),
            plan.chunks[0].as_slice(),
            plan.end.as_slice(),
        ];
        let done = deliver(&mut reassembler, &from, frames).unwrap();

        assert_eq!(done.payload.len(), 20);
        assert_eq!(done.received_chunks, 1);
        assert_eq!(done.declared_chunks, 3);
        assert!(!done.is_complete());
    }

    #[test]
    fn test_chunks_for_unknown_transfer_are_dropped() {
        let plan = TransferPlan::new("t", &[1u8; 40], 23, 512).unwrap();
        let mut reassembler = Reassembler::new();

        assert!(reassembler.ingest(&peer("A"), &plan.chunks[0]).is_none());
        assert!(reassembler.ingest(&peer("A"), &plan.end).is_none());
        assert!(reassembler.ingest(&peer("A"), &[1, 2, 3]).is_none());
    }

    #[test]
    fn test_chunk_starting_with_brace_is_not_a_control_frame() {
        // Find an id whose hash begins with 0x7B
        let id = (0..100_000)
            .map(|n| format!("id-{}", n))
            .find(|id| transfer_id_hash(id) >> 24 == u32::from(b'{'))
            .unwrap();
        let plan = TransferPlan::new(&id, b"payload bytes", 185, 512).unwrap();
        assert_eq!(plan.chunks[0][0], b'{');

        let mut reassembler = Reassembler::new();
        let done = deliver(&mut reassembler, &peer("A"), plan.frames().collect()).unwrap();
        assert_eq!(done.payload, b"payload bytes");
    }

    #[test]
    fn test_abandon_drops_peer_transfers() {
        let plan_a = TransferPlan::new("a", &[1u8; 10], 23, 512).unwrap();
        let plan_b = TransferPlan::new("b", &[2u8; 10], 23, 512).unwrap();
        let mut reassembler = Reassembler::new();
        reassembler.ingest(&peer("A"), &plan_a.start);
        reassembler.ingest(&peer("B"), &plan_b.start);

        assert_eq!(reassembler.abandon(&peer("A")), 1);
        assert_eq!(reassembler.pending(), 1);
        assert!(reassembler.ingest(&peer("A"), &plan_a.end).is_none());
    }

    #[test]
    fn test_empty_payload_transfer() {
        let plan = TransferPlan::new("empty", &[], 185, 512).unwrap();
        assert!(plan.chunks.is_empty());

        let mut reassembler = Reassembler::new();
        let done = deliver(&mut reassembler, &peer("A"), plan.frames().collect()).unwrap();
        assert!(done.payload.is_empty());
        assert!(done.is_complete());
    }

    #[test]
    fn test_command_shapes_normalize() {
        let frame = CommandFrame::new("pairingRequest", json!({"code": "000123"}));
        let parsed = IncomingCommand::parse(&frame.encode().unwrap()).unwrap();
        assert_eq!(parsed.command, "pairingRequest");
        assert_eq!(parsed.param_str("code"), Some("000123"));

        let legacy = IncomingCommand::parse(br#"{"type":"ring","data":{"volume":3}}"#).unwrap();
        assert_eq!(legacy.command, "ring");
        assert_eq!(legacy.params, json!({"volume": 3}));

        let bare = IncomingCommand::parse(br#"{"command":"pairingAccepted"}"#).unwrap();
        assert_eq!(bare.params, Value::Null);

        assert!(IncomingCommand::parse(b"not json").is_err());
        assert!(IncomingCommand::parse(br#"{"other":1}"#).is_err());
    }

    proptest! {
        #[test]
        fn prop_plan_chunk_count_and_round_trip(
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
            mtu in 23u16..=517,
        ) {
            let plan = TransferPlan::new("prop", &payload, mtu, 512).unwrap();
            let chunk_size = chunk_size_for_mtu(mtu);
            prop_assert_eq!(plan.chunks.len(), payload.len().div_ceil(chunk_size));

            let mut reassembler = Reassembler::new();
            let from = PeerAddress::new("P");
            let mut completed = None;
            for frame in plan.frames() {
                if let Some(done) = reassembler.ingest(&from, frame) {
                    completed = Some(done);
                }
            }
            let done = completed.unwrap();
            prop_assert_eq!(done.payload, payload);
        }
    }
}
