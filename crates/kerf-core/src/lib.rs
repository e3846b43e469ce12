//! kerf-core — wire format, envelope codec, and cryptographic primitives
//! for the Kerf gateway. The daemon crate depends on this one.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod wire;

pub use envelope::{BodyChunk, RequestEnvelope, RequestShape, ResponseEnvelope};
pub use wire::{FrameAssembler, TransportFrame};
