//! Kerf transport framing — on-wire types for the encrypted tunnel.
//!
//! These types ARE the protocol. Every websocket message after the
//! handshake carries exactly one Noise ciphertext of one serialized
//! frame; the frame header layout below is part of the wire format and
//! changing it is a breaking change.
//!
//! The frame header is #[repr(C, packed)] for deterministic layout and
//! uses zerocopy derives for safe, allocation-free serialization. There
//! is no unsafe code in this module.

use std::collections::HashMap;

use bytes::Bytes;
use rand::RngCore;
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Largest plaintext a single Noise transport message may carry.
pub const MAX_NOISE_PAYLOAD: usize = 65519;

/// AES-GCM authentication tag appended to every ciphertext.
pub const NOISE_TAG_LEN: usize = 16;

/// Largest websocket message we accept after the handshake.
pub const MAX_WIRE_FRAME: usize = 65535;

/// Largest websocket message we accept during the handshake.
pub const MAX_HANDSHAKE_FRAME: usize = 4096;

/// Serialized frame header size in bytes.
pub const FRAME_HEADER_LEN: usize = 16;

/// Header budget reserved per frame. The packed header is 16 bytes; the
/// budget keeps headroom so a full frame plus the authentication tag
/// always fits a single websocket message.
const FRAME_OVERHEAD_BUDGET: usize = 30;

/// Maximum payload bytes per frame. Messages longer than this are split
/// across frames sharing one chunk id.
pub const MAX_FRAME_PAYLOAD: usize = MAX_NOISE_PAYLOAD - FRAME_OVERHEAD_BUDGET;

// ── Frame header ──────────────────────────────────────────────────────────────

/// Fixed-size header preceding every frame payload.
///
/// Wire size: 16 bytes, little-endian native layout.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Random per-message id. All frames of one application message
    /// share it; concurrent messages never need out-of-band mapping.
    pub chunk_id: u64,

    /// Zero-based position of this frame within the message.
    pub chunk_index: u32,

    /// Total number of frames in the message. Constant per chunk_id.
    pub total_chunks: u32,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; FRAME_HEADER_LEN]);

/// A decoded transport frame: header fields plus payload slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFrame {
    pub chunk_id: u64,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub payload: Bytes,
}

// ── Encode / decode ───────────────────────────────────────────────────────────

/// Split an application message into serialized frames.
///
/// Each returned buffer is one header + payload, at most
/// `FRAME_HEADER_LEN + MAX_FRAME_PAYLOAD` bytes, so that the encrypted
/// form (plus the 16-byte tag) fits a single websocket message. A fresh
/// random chunk id is drawn per call; an empty message yields a single
/// frame with an empty payload.
pub fn encode_frames(message: &[u8]) -> Vec<Vec<u8>> {
    let chunk_id = rand::thread_rng().next_u64();

    let total_chunks = if message.is_empty() {
        1
    } else {
        message.len().div_ceil(MAX_FRAME_PAYLOAD)
    } as u32;

    let mut frames = Vec::with_capacity(total_chunks as usize);
    for index in 0..total_chunks {
        let start = index as usize * MAX_FRAME_PAYLOAD;
        let end = (start + MAX_FRAME_PAYLOAD).min(message.len());
        let payload = &message[start..end];

        let header = FrameHeader {
            chunk_id,
            chunk_index: index,
            total_chunks,
        };

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(payload);
        frames.push(frame);
    }

    frames
}

/// Parse one serialized frame.
pub fn decode_frame(bytes: &[u8]) -> Result<TransportFrame, WireError> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(WireError::MalformedFrame);
    }
    let header =
        FrameHeader::read_from_prefix(&bytes[..FRAME_HEADER_LEN]).ok_or(WireError::MalformedFrame)?;

    // Copy packed fields to locals to avoid unaligned reference UB.
    let chunk_id = header.chunk_id;
    let chunk_index = header.chunk_index;
    let total_chunks = header.total_chunks;

    Ok(TransportFrame {
        chunk_id,
        chunk_index,
        total_chunks,
        payload: Bytes::copy_from_slice(&bytes[FRAME_HEADER_LEN..]),
    })
}

// ── Reassembly ────────────────────────────────────────────────────────────────

/// In-progress reassembly of one multi-frame message.
struct MessageAssembly {
    total_chunks: u32,
    parts: HashMap<u32, Bytes>,
}

/// Reassembles inbound frames into application messages.
///
/// Per-session state: assemblies are keyed by chunk id and evicted as
/// soon as the message completes. `clear` drops everything when the
/// session terminates.
#[derive(Default)]
pub struct FrameAssembler {
    assemblies: HashMap<u64, MessageAssembly>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame. Returns the complete message once every index of
    /// its chunk id has arrived, `None` while the message is partial.
    pub fn process(&mut self, frame: TransportFrame) -> Result<Option<Vec<u8>>, WireError> {
        if frame.total_chunks == 0 || frame.chunk_index >= frame.total_chunks {
            return Err(WireError::InconsistentFrame {
                chunk_id: frame.chunk_id,
                reason: "chunk index out of range",
            });
        }
        if frame.payload.is_empty() && frame.total_chunks > 1 {
            return Err(WireError::InconsistentFrame {
                chunk_id: frame.chunk_id,
                reason: "empty payload in multi-frame message",
            });
        }

        let assembly = self
            .assemblies
            .entry(frame.chunk_id)
            .or_insert_with(|| MessageAssembly {
                total_chunks: frame.total_chunks,
                parts: HashMap::new(),
            });

        if assembly.total_chunks != frame.total_chunks {
            self.assemblies.remove(&frame.chunk_id);
            return Err(WireError::InconsistentFrame {
                chunk_id: frame.chunk_id,
                reason: "total_chunks changed between frames",
            });
        }

        if let Some(existing) = assembly.parts.get(&frame.chunk_index) {
            if existing == &frame.payload {
                // Same-payload duplicate: drop silently.
                return Ok(None);
            }
            self.assemblies.remove(&frame.chunk_id);
            return Err(WireError::InconsistentFrame {
                chunk_id: frame.chunk_id,
                reason: "duplicate index with different payload",
            });
        }

        assembly.parts.insert(frame.chunk_index, frame.payload);

        if assembly.parts.len() as u32 != assembly.total_chunks {
            return Ok(None);
        }

        // Complete: concatenate by ascending index and evict.
        let mut message =
            Vec::with_capacity(assembly.parts.values().map(|p| p.len()).sum::<usize>());
        for index in 0..assembly.total_chunks {
            message.extend_from_slice(&assembly.parts[&index]);
        }
        self.assemblies.remove(&frame.chunk_id);
        Ok(Some(message))
    }

    /// Drop all partial assemblies. Called when the session ends.
    pub fn clear(&mut self) {
        self.assemblies.clear();
    }

    /// Number of in-progress assemblies.
    pub fn pending(&self) -> usize {
        self.assemblies.len()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting framed transport data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame too short or not a valid frame envelope")]
    MalformedFrame,

    #[error("inconsistent frame for chunk {chunk_id:#018x}: {reason}")]
    InconsistentFrame { chunk_id: u64, reason: &'static str },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
