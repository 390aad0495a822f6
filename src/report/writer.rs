// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::codec::{AddJsonData, JsonEncoder, JsonError};
use std::ffi::CStr;

/// The writer handed to report helpers and to the user's on-crash callback.
///
/// A thin interface over the streaming encoder with the sink type erased,
/// so the same report code drives a file descriptor during a real crash and
/// a plain buffer in tests. No state beyond the encoder: helpers receive
/// `&mut ReportWriter` explicitly rather than finding one in thread-local
/// storage, which async-signal context forbids.
pub struct ReportWriter<'a> {
    encoder: JsonEncoder<&'a mut dyn AddJsonData>,
}

impl<'a> ReportWriter<'a> {
    pub fn new(sink: &'a mut dyn AddJsonData) -> Self {
        Self {
            encoder: JsonEncoder::new(sink),
        }
    }

    pub fn begin_object(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.encoder.begin_object(name)
    }

    pub fn begin_array(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.encoder.begin_array(name)
    }

    pub fn end_container(&mut self) -> Result<(), JsonError> {
        self.encoder.end_container()
    }

    pub fn add_bool(&mut self, name: Option<&str>, value: bool) -> Result<(), JsonError> {
        self.encoder.add_bool(name, value)
    }

    pub fn add_int(&mut self, name: Option<&str>, value: i64) -> Result<(), JsonError> {
        self.encoder.add_int(name, value)
    }

    pub fn add_uint(&mut self, name: Option<&str>, value: u64) -> Result<(), JsonError> {
        self.encoder.add_uint(name, value)
    }

    pub fn add_float(&mut self, name: Option<&str>, value: f64) -> Result<(), JsonError> {
        self.encoder.add_float(name, value)
    }

    pub fn add_null(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.encoder.add_null(name)
    }

    pub fn add_string(&mut self, name: Option<&str>, value: &str) -> Result<(), JsonError> {
        self.encoder.add_string(name, value)
    }

    pub fn add_hex_bytes(&mut self, name: Option<&str>, bytes: &[u8]) -> Result<(), JsonError> {
        self.encoder.add_hex_bytes(name, bytes)
    }

    pub fn add_uuid(&mut self, name: Option<&str>, bytes: &[u8; 16]) -> Result<(), JsonError> {
        self.encoder.add_uuid(name, bytes)
    }

    pub fn add_raw_json(&mut self, name: Option<&str>, json: &str) -> Result<(), JsonError> {
        self.encoder.add_raw_passthrough(name, json)
    }

    pub fn begin_string_element(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.encoder.begin_string_element(name)
    }

    pub fn append_string_chunk(&mut self, chunk: &str) -> Result<(), JsonError> {
        self.encoder.append_string_chunk(chunk)
    }

    pub fn end_string_element(&mut self) -> Result<(), JsonError> {
        self.encoder.end_string_element()
    }

    pub fn begin_hex_element(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.encoder.begin_hex_element(name)
    }

    pub fn append_hex_chunk(&mut self, bytes: &[u8]) -> Result<(), JsonError> {
        self.encoder.append_hex_chunk(bytes)
    }

    pub fn end_hex_element(&mut self) -> Result<(), JsonError> {
        self.encoder.end_hex_element()
    }

    pub fn add_text_file(&mut self, name: Option<&str>, path: &CStr) -> Result<(), JsonError> {
        self.encoder.add_text_file_element(name, path)
    }

    /// Byte-slice string element with lossy handling: unexpressible control
    /// bytes and invalid UTF-8 are dropped. Used for thread and queue names
    /// coming from C APIs.
    pub fn add_string_bytes(&mut self, name: Option<&str>, bytes: &[u8]) -> Result<(), JsonError> {
        self.encoder.begin_string_element(name)?;
        for chunk in bytes.split(|&b| b < 0x20 && !matches!(b, 0x08 | 0x0C | b'\n' | b'\r' | b'\t'))
        {
            let mut rest = chunk;
            while !rest.is_empty() {
                match core::str::from_utf8(rest) {
                    Ok(text) => {
                        self.encoder.append_string_chunk(text)?;
                        break;
                    }
                    Err(e) => {
                        let valid = e.valid_up_to();
                        if valid > 0 {
                            // The prefix was just validated.
                            if let Ok(text) = core::str::from_utf8(&rest[..valid]) {
                                self.encoder.append_string_chunk(text)?;
                            }
                        }
                        rest = &rest[valid + 1..];
                    }
                }
            }
        }
        self.encoder.end_string_element()
    }
}
