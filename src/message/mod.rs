//! Record envelopes and payload decoding
//!
//! A [`MessageEnvelope`] is the immutable unit handed from a consumer to the
//! dispatch engine. Payloads arrive as JSON documents and are decoded once per
//! record into a generic [`serde_json::Value`]; typing and validation belong to
//! the handlers, which can lean on [`PayloadShape`].

pub mod envelope;
pub mod payload;

pub use envelope::{MessageEnvelope, RecordPosition};
pub use payload::{decode_payload, DecodeError, PayloadShape, ShapeError};
