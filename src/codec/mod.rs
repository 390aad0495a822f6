// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming JSON codec used for crash reports and the persisted session
//! state.
//!
//! The encoder is a push API: every operation renders directly into an
//! [`AddJsonData`] sink with no intermediate tree and no heap allocation,
//! so it can run inside a signal or exception handler. The decoder is
//! event-driven and is only ever used outside the crash path (state
//! loading, validation, tests), so it is allowed to allocate.

mod decoder;
mod encoder;

pub use decoder::{decode, decode_to_value, validate_document, JsonEventSink, JsonValue};
pub use encoder::{AddJsonData, BufferSink, FdSink, JsonEncoder, MAX_ENCODE_DEPTH};

use thiserror::Error;

/// Errors shared by the encoder and decoder.
///
/// `CannotAddData` is produced by sinks, never by the decoder. `Incomplete`
/// and `InvalidData` are decoder-side (or returned by user callbacks that
/// reject decoded content).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JsonError {
    #[error("the sink could not accept more encoded data")]
    CannotAddData,
    #[error("encountered an unexpected or invalid character")]
    InvalidCharacter,
    #[error("source data appears to be truncated")]
    Incomplete,
    #[error("data is structurally or semantically invalid")]
    InvalidData,
}
