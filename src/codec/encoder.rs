// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::JsonError;
use std::ffi::CStr;
use std::os::unix::io::RawFd;

/// Maximum container nesting the encoder accepts. Exceeding it is a hard
/// error rather than a truncated document.
pub const MAX_ENCODE_DEPTH: usize = 200;

/// Receives encoded bytes from the encoder.
///
/// Implementations must not allocate if they are going to be driven from a
/// crash handler; the fd-backed sink below is the one used on that path.
pub trait AddJsonData {
    fn add_json_data(&mut self, data: &[u8]) -> Result<(), JsonError>;
}

impl AddJsonData for Vec<u8> {
    fn add_json_data(&mut self, data: &[u8]) -> Result<(), JsonError> {
        self.extend_from_slice(data);
        Ok(())
    }
}

impl<T: AddJsonData + ?Sized> AddJsonData for &mut T {
    fn add_json_data(&mut self, data: &[u8]) -> Result<(), JsonError> {
        (**self).add_json_data(data)
    }
}

/// Fixed-capacity sink over a caller-provided buffer. Used by the state
/// saver, which encodes onto its own stack frame before a single write.
pub struct BufferSink<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> BufferSink<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl AddJsonData for BufferSink<'_> {
    fn add_json_data(&mut self, data: &[u8]) -> Result<(), JsonError> {
        if self.len + data.len() > self.buf.len() {
            return Err(JsonError::CannotAddData);
        }
        self.buf[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }
}

/// Writes encoded bytes straight to a file descriptor with `write(2)`.
///
/// This is the crash-path sink: `write` is async-signal-safe, and short
/// writes are retried until the buffer drains or the descriptor fails.
pub struct FdSink {
    fd: RawFd,
}

impl FdSink {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl AddJsonData for FdSink {
    fn add_json_data(&mut self, data: &[u8]) -> Result<(), JsonError> {
        let mut remaining = data;
        while !remaining.is_empty() {
            // SAFETY: the pointer/length pair comes from a live slice.
            let written = unsafe {
                libc::write(
                    self.fd,
                    remaining.as_ptr() as *const libc::c_void,
                    remaining.len(),
                )
            };
            if written <= 0 {
                if errno::errno().0 == libc::EINTR {
                    continue;
                }
                return Err(JsonError::CannotAddData);
            }
            remaining = &remaining[written as usize..];
        }
        Ok(())
    }
}

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Fixed-size scratch for rendering scalars without allocation.
/// `core::fmt` for integers and floats writes through this without touching
/// the heap.
struct ScalarBuf {
    buf: [u8; 40],
    len: usize,
}

impl ScalarBuf {
    fn new() -> Self {
        Self {
            buf: [0; 40],
            len: 0,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl core::fmt::Write for ScalarBuf {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        if self.len + bytes.len() > self.buf.len() {
            return Err(core::fmt::Error);
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }
}

/// Push encoder for the report document format.
///
/// Containers are explicit: `begin_object`/`begin_array` must be balanced
/// with `end_container`. A `name` is required exactly when the enclosing
/// container is an object and must be `None` inside arrays (and at the
/// root). State is held in fixed arrays so a fully nested document costs no
/// allocation.
pub struct JsonEncoder<S> {
    sink: S,
    depth: usize,
    is_object: [bool; MAX_ENCODE_DEPTH + 1],
    first_entry: [bool; MAX_ENCODE_DEPTH + 1],
    pretty: bool,
}

impl<S: AddJsonData> JsonEncoder<S> {
    pub fn new(sink: S) -> Self {
        Self::with_pretty_print(sink, false)
    }

    pub fn with_pretty_print(sink: S, pretty: bool) -> Self {
        let mut is_object = [false; MAX_ENCODE_DEPTH + 1];
        let mut first_entry = [false; MAX_ENCODE_DEPTH + 1];
        // Depth 0 behaves like an array that holds the root value.
        is_object[0] = false;
        first_entry[0] = true;
        Self {
            sink,
            depth: 0,
            is_object,
            first_entry,
            pretty,
        }
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    fn add(&mut self, data: &[u8]) -> Result<(), JsonError> {
        self.sink.add_json_data(data)
    }

    fn indent(&mut self) -> Result<(), JsonError> {
        self.add(b"\n")?;
        for _ in 0..self.depth {
            self.add(b"    ")?;
        }
        Ok(())
    }

    /// Comma/name prologue shared by every element.
    fn begin_element(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        if self.first_entry[self.depth] {
            self.first_entry[self.depth] = false;
        } else {
            self.add(b",")?;
        }
        if self.pretty && self.depth > 0 {
            self.indent()?;
        }
        if self.is_object[self.depth] {
            let name = name.ok_or(JsonError::InvalidData)?;
            self.write_escaped(name.as_bytes())?;
            self.add(if self.pretty { b": " } else { b":" })?;
        } else if name.is_some() {
            return Err(JsonError::InvalidData);
        }
        Ok(())
    }

    fn begin_container(&mut self, name: Option<&str>, object: bool) -> Result<(), JsonError> {
        if self.depth >= MAX_ENCODE_DEPTH {
            return Err(JsonError::InvalidData);
        }
        self.begin_element(name)?;
        self.add(if object { b"{" } else { b"[" })?;
        self.depth += 1;
        self.is_object[self.depth] = object;
        self.first_entry[self.depth] = true;
        Ok(())
    }

    pub fn begin_object(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.begin_container(name, true)
    }

    pub fn begin_array(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.begin_container(name, false)
    }

    pub fn end_container(&mut self) -> Result<(), JsonError> {
        if self.depth == 0 {
            return Err(JsonError::InvalidData);
        }
        let object = self.is_object[self.depth];
        let had_entries = !self.first_entry[self.depth];
        self.depth -= 1;
        if self.pretty && had_entries {
            self.indent()?;
        }
        self.add(if object { b"}" } else { b"]" })
    }

    pub fn add_null(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.begin_element(name)?;
        self.add(b"null")
    }

    pub fn add_bool(&mut self, name: Option<&str>, value: bool) -> Result<(), JsonError> {
        self.begin_element(name)?;
        self.add(if value { b"true" } else { b"false" })
    }

    pub fn add_int(&mut self, name: Option<&str>, value: i64) -> Result<(), JsonError> {
        self.begin_element(name)?;
        let mut scratch = ScalarBuf::new();
        core::fmt::write(&mut scratch, format_args!("{value}"))
            .map_err(|_| JsonError::CannotAddData)?;
        let bytes = scratch.as_bytes();
        self.sink.add_json_data(bytes)
    }

    pub fn add_uint(&mut self, name: Option<&str>, value: u64) -> Result<(), JsonError> {
        self.begin_element(name)?;
        let mut scratch = ScalarBuf::new();
        core::fmt::write(&mut scratch, format_args!("{value}"))
            .map_err(|_| JsonError::CannotAddData)?;
        let bytes = scratch.as_bytes();
        self.sink.add_json_data(bytes)
    }

    pub fn add_float(&mut self, name: Option<&str>, value: f64) -> Result<(), JsonError> {
        self.begin_element(name)?;
        let mut scratch = ScalarBuf::new();
        // f64 Display renders the shortest round-trippable form, but never
        // an exponent-free form for non-finite values; JSON has no encoding
        // for those, so clamp them to null.
        if !value.is_finite() {
            return self.add(b"null");
        }
        core::fmt::write(&mut scratch, format_args!("{value}"))
            .map_err(|_| JsonError::CannotAddData)?;
        let bytes = scratch.as_bytes();
        self.sink.add_json_data(bytes)
    }

    pub fn add_string(&mut self, name: Option<&str>, value: &str) -> Result<(), JsonError> {
        self.begin_element(name)?;
        self.write_escaped(value.as_bytes())
    }

    /// Hex-encodes `bytes` as a quoted upper-hex string.
    pub fn add_hex_bytes(&mut self, name: Option<&str>, bytes: &[u8]) -> Result<(), JsonError> {
        self.begin_element(name)?;
        self.add(b"\"")?;
        self.append_hex(bytes)?;
        self.add(b"\"")
    }

    /// Dashed-hex UUID (8-4-4-4-12, lowercase).
    pub fn add_uuid(&mut self, name: Option<&str>, bytes: &[u8; 16]) -> Result<(), JsonError> {
        self.begin_element(name)?;
        let mut out = [0u8; 38];
        let mut pos = 0;
        out[pos] = b'"';
        pos += 1;
        for (i, byte) in bytes.iter().enumerate() {
            if i == 4 || i == 6 || i == 8 || i == 10 {
                out[pos] = b'-';
                pos += 1;
            }
            out[pos] = HEX_DIGITS[(byte >> 4) as usize].to_ascii_lowercase();
            out[pos + 1] = HEX_DIGITS[(byte & 0x0F) as usize].to_ascii_lowercase();
            pos += 2;
        }
        out[pos] = b'"';
        pos += 1;
        self.add(&out[..pos])
    }

    /// Passes `json` through untouched if it plausibly starts a JSON value.
    /// Invalid input is substituted with an error object that carries the
    /// original text, so a bad user document never breaks the report.
    pub fn add_raw_passthrough(&mut self, name: Option<&str>, json: &str) -> Result<(), JsonError> {
        let starts_value = json
            .bytes()
            .find(|b| !b.is_ascii_whitespace())
            .map(|b| b"[{\"ftn-0123456789".contains(&b))
            .unwrap_or(false);
        if starts_value {
            self.begin_element(name)?;
            self.add(json.as_bytes())
        } else {
            self.begin_object(name)?;
            self.add_string(Some("error"), "invalid json data")?;
            self.add_string(Some("json_data"), json)?;
            self.end_container()
        }
    }

    pub fn begin_string_element(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.begin_element(name)?;
        self.add(b"\"")
    }

    pub fn append_string_chunk(&mut self, chunk: &str) -> Result<(), JsonError> {
        self.append_escaped(chunk.as_bytes())
    }

    pub fn end_string_element(&mut self) -> Result<(), JsonError> {
        self.add(b"\"")
    }

    pub fn begin_hex_element(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.begin_element(name)?;
        self.add(b"\"")
    }

    pub fn append_hex_chunk(&mut self, bytes: &[u8]) -> Result<(), JsonError> {
        self.append_hex(bytes)
    }

    pub fn end_hex_element(&mut self) -> Result<(), JsonError> {
        self.add(b"\"")
    }

    /// Streams a text file's contents as one escaped string element.
    ///
    /// Reads through a fixed buffer with raw `open`/`read`/`close`, so it is
    /// usable from the crash path (the path must already be a `CStr`; no
    /// allocation happens here). A file that cannot be opened yields `null`.
    pub fn add_text_file_element(
        &mut self,
        name: Option<&str>,
        path: &CStr,
    ) -> Result<(), JsonError> {
        // SAFETY: `path` is a valid NUL-terminated string.
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY) };
        if fd < 0 {
            return self.add_null(name);
        }
        let result = self.stream_file(name, fd);
        // SAFETY: `fd` was opened above and is not used after this.
        unsafe { libc::close(fd) };
        result
    }

    fn stream_file(&mut self, name: Option<&str>, fd: RawFd) -> Result<(), JsonError> {
        self.begin_string_element(name)?;
        let mut buffer = [0u8; 512];
        loop {
            // SAFETY: buffer is a live stack array of the stated length.
            let count = unsafe {
                libc::read(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len())
            };
            if count <= 0 {
                break;
            }
            self.append_escaped(&buffer[..count as usize])?;
        }
        self.end_string_element()
    }

    fn write_escaped(&mut self, bytes: &[u8]) -> Result<(), JsonError> {
        self.add(b"\"")?;
        self.append_escaped(bytes)?;
        self.add(b"\"")
    }

    /// Escapes a byte run. Multi-byte UTF-8 sequences pass through
    /// untouched; bytes below 0x20 outside the short-escape set are
    /// rejected rather than silently mangled.
    fn append_escaped(&mut self, bytes: &[u8]) -> Result<(), JsonError> {
        let mut unescaped_start = 0;
        for (i, &byte) in bytes.iter().enumerate() {
            let escape: Option<&[u8]> = match byte {
                b'\\' => Some(b"\\\\"),
                b'"' => Some(b"\\\""),
                0x08 => Some(b"\\b"),
                0x0C => Some(b"\\f"),
                b'\n' => Some(b"\\n"),
                b'\r' => Some(b"\\r"),
                b'\t' => Some(b"\\t"),
                b if b < 0x20 => return Err(JsonError::InvalidCharacter),
                _ => None,
            };
            if let Some(escape) = escape {
                if unescaped_start < i {
                    let run = &bytes[unescaped_start..i];
                    self.sink.add_json_data(run)?;
                }
                self.sink.add_json_data(escape)?;
                unescaped_start = i + 1;
            }
        }
        if unescaped_start < bytes.len() {
            let run = &bytes[unescaped_start..];
            self.sink.add_json_data(run)?;
        }
        Ok(())
    }

    fn append_hex(&mut self, bytes: &[u8]) -> Result<(), JsonError> {
        // Hex through a fixed chunk so arbitrarily long dumps stay
        // allocation-free.
        let mut chunk = [0u8; 64];
        for run in bytes.chunks(32) {
            let mut pos = 0;
            for &byte in run {
                chunk[pos] = HEX_DIGITS[(byte >> 4) as usize];
                chunk[pos + 1] = HEX_DIGITS[(byte & 0x0F) as usize];
                pos += 2;
            }
            self.sink.add_json_data(&chunk[..pos])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut JsonEncoder<Vec<u8>>)) -> String {
        let mut encoder = JsonEncoder::new(Vec::new());
        f(&mut encoder);
        String::from_utf8(encoder.into_sink()).unwrap()
    }

    #[test]
    fn test_empty_object() {
        let out = encode(|e| {
            e.begin_object(None).unwrap();
            e.end_container().unwrap();
        });
        assert_eq!(out, "{}");
    }

    #[test]
    fn test_scalars_in_object() {
        let out = encode(|e| {
            e.begin_object(None).unwrap();
            e.add_bool(Some("a"), true).unwrap();
            e.add_int(Some("b"), -5).unwrap();
            e.add_uint(Some("c"), u64::MAX).unwrap();
            e.add_float(Some("d"), 1.5).unwrap();
            e.add_null(Some("e")).unwrap();
            e.end_container().unwrap();
        });
        assert_eq!(
            out,
            "{\"a\":true,\"b\":-5,\"c\":18446744073709551615,\"d\":1.5,\"e\":null}"
        );
    }

    #[test]
    fn test_insertion_order_preserved() {
        let out = encode(|e| {
            e.begin_object(None).unwrap();
            e.add_int(Some("z"), 1).unwrap();
            e.add_int(Some("a"), 2).unwrap();
            e.add_int(Some("m"), 3).unwrap();
            e.end_container().unwrap();
        });
        assert_eq!(out, "{\"z\":1,\"a\":2,\"m\":3}");
    }

    #[test]
    fn test_nested_containers() {
        let out = encode(|e| {
            e.begin_object(None).unwrap();
            e.begin_array(Some("xs")).unwrap();
            e.add_int(None, 1).unwrap();
            e.begin_object(None).unwrap();
            e.add_string(Some("k"), "v").unwrap();
            e.end_container().unwrap();
            e.end_container().unwrap();
            e.end_container().unwrap();
        });
        assert_eq!(out, "{\"xs\":[1,{\"k\":\"v\"}]}");
    }

    #[test]
    fn test_name_required_in_object() {
        let mut encoder = JsonEncoder::new(Vec::new());
        encoder.begin_object(None).unwrap();
        assert_eq!(encoder.add_int(None, 1), Err(JsonError::InvalidData));
    }

    #[test]
    fn test_name_rejected_in_array() {
        let mut encoder = JsonEncoder::new(Vec::new());
        encoder.begin_array(None).unwrap();
        assert_eq!(
            encoder.add_int(Some("nope"), 1),
            Err(JsonError::InvalidData)
        );
    }

    #[test]
    fn test_string_escapes() {
        let out = encode(|e| {
            e.add_string(None, "a\"b\\c\nd\te\r\x08\x0c").unwrap();
        });
        assert_eq!(out, "\"a\\\"b\\\\c\\nd\\te\\r\\b\\f\"");
    }

    #[test]
    fn test_control_character_rejected() {
        let mut encoder = JsonEncoder::new(Vec::new());
        assert_eq!(
            encoder.add_string(None, "bad\x01"),
            Err(JsonError::InvalidCharacter)
        );
    }

    #[test]
    fn test_unicode_passthrough() {
        let out = encode(|e| {
            e.add_string(None, "héllo 世界").unwrap();
        });
        assert_eq!(out, "\"héllo 世界\"");
    }

    #[test]
    fn test_hex_bytes_upper() {
        let out = encode(|e| {
            e.add_hex_bytes(None, &[0x00, 0xAB, 0xFF]).unwrap();
        });
        assert_eq!(out, "\"00ABFF\"");
    }

    #[test]
    fn test_hex_chunking_long_run() {
        let bytes = [0x5Au8; 100];
        let out = encode(|e| {
            e.add_hex_bytes(None, &bytes).unwrap();
        });
        assert_eq!(out.len(), 202);
        assert!(out[1..201].bytes().all(|b| b == b'5' || b == b'A'));
    }

    #[test]
    fn test_uuid_dashed() {
        let bytes = [
            0x1d, 0x6b, 0x97, 0xcb, 0x96, 0x8c, 0x40, 0xc9, 0xaf, 0x6e, 0xe4, 0xb4, 0xd7, 0x1e,
            0x87, 0x81,
        ];
        let out = encode(|e| {
            e.add_uuid(None, &bytes).unwrap();
        });
        assert_eq!(out, "\"1d6b97cb-968c-40c9-af6e-e4b4d71e8781\"");
    }

    #[test]
    fn test_raw_passthrough_valid() {
        let out = encode(|e| {
            e.begin_object(None).unwrap();
            e.add_raw_passthrough(Some("user"), "{\"k\": [1,2]}").unwrap();
            e.end_container().unwrap();
        });
        assert_eq!(out, "{\"user\":{\"k\": [1,2]}}");
    }

    #[test]
    fn test_raw_passthrough_invalid_substitutes() {
        let out = encode(|e| {
            e.add_raw_passthrough(None, "<html>").unwrap();
        });
        assert_eq!(
            out,
            "{\"error\":\"invalid json data\",\"json_data\":\"<html>\"}"
        );
    }

    #[test]
    fn test_string_element_chunked() {
        let out = encode(|e| {
            e.begin_string_element(None).unwrap();
            e.append_string_chunk("part one, ").unwrap();
            e.append_string_chunk("part \"two\"").unwrap();
            e.end_string_element().unwrap();
        });
        assert_eq!(out, "\"part one, part \\\"two\\\"\"");
    }

    #[test]
    fn test_hex_element_chunked() {
        let out = encode(|e| {
            e.begin_hex_element(None).unwrap();
            e.append_hex_chunk(&[0x01]).unwrap();
            e.append_hex_chunk(&[0x02, 0x03]).unwrap();
            e.end_hex_element().unwrap();
        });
        assert_eq!(out, "\"010203\"");
    }

    #[test]
    fn test_depth_limit() {
        let mut encoder = JsonEncoder::new(Vec::new());
        for _ in 0..MAX_ENCODE_DEPTH {
            encoder.begin_array(None).unwrap();
        }
        assert_eq!(encoder.begin_array(None), Err(JsonError::InvalidData));
    }

    #[test]
    fn test_end_container_underflow() {
        let mut encoder = JsonEncoder::new(Vec::new());
        assert_eq!(encoder.end_container(), Err(JsonError::InvalidData));
    }

    #[test]
    fn test_buffer_sink_overflow() {
        let mut buf = [0u8; 4];
        let mut sink = BufferSink::new(&mut buf);
        assert!(sink.add_json_data(b"1234").is_ok());
        assert_eq!(sink.add_json_data(b"5"), Err(JsonError::CannotAddData));
    }

    #[test]
    fn test_non_finite_floats_become_null() {
        let out = encode(|e| {
            e.begin_array(None).unwrap();
            e.add_float(None, f64::NAN).unwrap();
            e.add_float(None, f64::INFINITY).unwrap();
            e.end_container().unwrap();
        });
        assert_eq!(out, "[null,null]");
    }

    #[test]
    fn test_pretty_print_structure() {
        let mut encoder = JsonEncoder::with_pretty_print(Vec::new(), true);
        encoder.begin_object(None).unwrap();
        encoder.add_int(Some("a"), 1).unwrap();
        encoder.end_container().unwrap();
        let out = String::from_utf8(encoder.into_sink()).unwrap();
        assert_eq!(out, "{\n    \"a\": 1\n}");
    }

    #[test]
    fn test_text_file_element() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"line one\nline two")
            .unwrap();
        let cpath = std::ffi::CString::new(path.to_str().unwrap()).unwrap();
        let out = encode(|e| {
            e.begin_object(None).unwrap();
            e.add_text_file_element(Some("file"), &cpath).unwrap();
            e.end_container().unwrap();
        });
        assert_eq!(out, "{\"file\":\"line one\\nline two\"}");
    }

    #[test]
    fn test_text_file_element_missing_file() {
        let cpath = std::ffi::CString::new("/nonexistent/definitely-not-here").unwrap();
        let out = encode(|e| {
            e.begin_object(None).unwrap();
            e.add_text_file_element(Some("file"), &cpath).unwrap();
            e.end_container().unwrap();
        });
        assert_eq!(out, "{\"file\":null}");
    }
}
