// ============================================================================
// Event Sourcing Core - Envelope model and wire codec
// ============================================================================
//
// Pure, I/O-free building blocks shared by the consumer and the store:
// - EventEnvelope: one event-store write request
// - EnvelopeCodec: queue message body <-> EventEnvelope
//
// ============================================================================

pub mod codec;
pub mod event;

// Re-export core types for convenience
pub use codec::{DecodeError, EnvelopeCodec};
pub use event::EventEnvelope;
