// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::JsonError;
use super::MAX_ENCODE_DEPTH;

/// Receives decode events. The `name` is present exactly when the value
/// sits inside an object. Callbacks may return an error to abort the parse;
/// it propagates out of [`decode`] unchanged.
pub trait JsonEventSink {
    fn on_begin_object(&mut self, name: Option<&str>) -> Result<(), JsonError>;
    fn on_begin_array(&mut self, name: Option<&str>) -> Result<(), JsonError>;
    fn on_end_container(&mut self) -> Result<(), JsonError>;
    fn on_boolean(&mut self, name: Option<&str>, value: bool) -> Result<(), JsonError>;
    fn on_integer(&mut self, name: Option<&str>, value: i64) -> Result<(), JsonError>;
    fn on_float(&mut self, name: Option<&str>, value: f64) -> Result<(), JsonError>;
    fn on_null(&mut self, name: Option<&str>) -> Result<(), JsonError>;
    fn on_string(&mut self, name: Option<&str>, value: &str) -> Result<(), JsonError>;
    fn on_end_data(&mut self) -> Result<(), JsonError>;
}

/// Decodes one JSON document, driving `sink` with events.
///
/// Unlike the encoder this may allocate (string unescaping builds owned
/// buffers); it must therefore never be called from a crash handler.
pub fn decode(data: &[u8], sink: &mut dyn JsonEventSink) -> Result<(), JsonError> {
    let mut parser = Parser { data, pos: 0 };
    parser.skip_whitespace();
    parser.parse_value(sink, None, 0)?;
    parser.skip_whitespace();
    if parser.pos != parser.data.len() {
        return Err(JsonError::InvalidCharacter);
    }
    sink.on_end_data()
}

/// Parses `data` and discards the events; used to validate caller-supplied
/// documents before accepting them into the configuration.
pub fn validate_document(data: &[u8]) -> Result<(), JsonError> {
    struct Discard;
    impl JsonEventSink for Discard {
        fn on_begin_object(&mut self, _: Option<&str>) -> Result<(), JsonError> {
            Ok(())
        }
        fn on_begin_array(&mut self, _: Option<&str>) -> Result<(), JsonError> {
            Ok(())
        }
        fn on_end_container(&mut self) -> Result<(), JsonError> {
            Ok(())
        }
        fn on_boolean(&mut self, _: Option<&str>, _: bool) -> Result<(), JsonError> {
            Ok(())
        }
        fn on_integer(&mut self, _: Option<&str>, _: i64) -> Result<(), JsonError> {
            Ok(())
        }
        fn on_float(&mut self, _: Option<&str>, _: f64) -> Result<(), JsonError> {
            Ok(())
        }
        fn on_null(&mut self, _: Option<&str>) -> Result<(), JsonError> {
            Ok(())
        }
        fn on_string(&mut self, _: Option<&str>, _: &str) -> Result<(), JsonError> {
            Ok(())
        }
        fn on_end_data(&mut self) -> Result<(), JsonError> {
            Ok(())
        }
    }
    decode(data, &mut Discard)
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn advance(&mut self) -> Result<u8, JsonError> {
        let byte = self.peek().ok_or(JsonError::Incomplete)?;
        self.pos += 1;
        Ok(byte)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn expect_literal(&mut self, literal: &[u8]) -> Result<(), JsonError> {
        if self.data.len() - self.pos < literal.len() {
            return Err(JsonError::Incomplete);
        }
        if &self.data[self.pos..self.pos + literal.len()] != literal {
            return Err(JsonError::InvalidCharacter);
        }
        self.pos += literal.len();
        Ok(())
    }

    fn parse_value(
        &mut self,
        sink: &mut dyn JsonEventSink,
        name: Option<&str>,
        depth: usize,
    ) -> Result<(), JsonError> {
        if depth > MAX_ENCODE_DEPTH {
            return Err(JsonError::InvalidData);
        }
        match self.peek().ok_or(JsonError::Incomplete)? {
            b'{' => self.parse_object(sink, name, depth),
            b'[' => self.parse_array(sink, name, depth),
            b'"' => {
                let value = self.parse_string()?;
                sink.on_string(name, &value)
            }
            b't' => {
                self.expect_literal(b"true")?;
                sink.on_boolean(name, true)
            }
            b'f' => {
                self.expect_literal(b"false")?;
                sink.on_boolean(name, false)
            }
            b'n' => {
                self.expect_literal(b"null")?;
                sink.on_null(name)
            }
            b'-' | b'0'..=b'9' => self.parse_number(sink, name),
            _ => Err(JsonError::InvalidCharacter),
        }
    }

    fn parse_object(
        &mut self,
        sink: &mut dyn JsonEventSink,
        name: Option<&str>,
        depth: usize,
    ) -> Result<(), JsonError> {
        self.pos += 1; // consume '{'
        sink.on_begin_object(name)?;
        self.skip_whitespace();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return sink.on_end_container();
        }
        loop {
            self.skip_whitespace();
            if self.peek().ok_or(JsonError::Incomplete)? != b'"' {
                return Err(JsonError::InvalidCharacter);
            }
            let key = self.parse_string()?;
            self.skip_whitespace();
            if self.advance()? != b':' {
                return Err(JsonError::InvalidCharacter);
            }
            self.skip_whitespace();
            self.parse_value(sink, Some(&key), depth + 1)?;
            self.skip_whitespace();
            match self.advance()? {
                b',' => continue,
                b'}' => return sink.on_end_container(),
                _ => return Err(JsonError::InvalidCharacter),
            }
        }
    }

    fn parse_array(
        &mut self,
        sink: &mut dyn JsonEventSink,
        name: Option<&str>,
        depth: usize,
    ) -> Result<(), JsonError> {
        self.pos += 1; // consume '['
        sink.on_begin_array(name)?;
        self.skip_whitespace();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return sink.on_end_container();
        }
        loop {
            self.skip_whitespace();
            self.parse_value(sink, None, depth + 1)?;
            self.skip_whitespace();
            match self.advance()? {
                b',' => continue,
                b']' => return sink.on_end_container(),
                _ => return Err(JsonError::InvalidCharacter),
            }
        }
    }

    /// Numbers parse as i64 first; overflow or any fraction/exponent
    /// silently promotes to f64.
    fn parse_number(
        &mut self,
        sink: &mut dyn JsonEventSink,
        name: Option<&str>,
    ) -> Result<(), JsonError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        if !matches!(self.peek(), Some(b'0'..=b'9')) {
            return Err(self
                .peek()
                .map(|_| JsonError::InvalidCharacter)
                .unwrap_or(JsonError::Incomplete));
        }
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        let mut is_float = false;
        if self.peek() == Some(b'.') {
            is_float = true;
            self.pos += 1;
            if !matches!(self.peek(), Some(b'0'..=b'9')) {
                return Err(self
                    .peek()
                    .map(|_| JsonError::InvalidCharacter)
                    .unwrap_or(JsonError::Incomplete));
            }
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            is_float = true;
            self.pos += 1;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            if !matches!(self.peek(), Some(b'0'..=b'9')) {
                return Err(self
                    .peek()
                    .map(|_| JsonError::InvalidCharacter)
                    .unwrap_or(JsonError::Incomplete));
            }
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        // The scanned range is ASCII digits, sign and punctuation only.
        let text = core::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| JsonError::InvalidCharacter)?;
        if !is_float {
            if let Ok(value) = text.parse::<i64>() {
                return sink.on_integer(name, value);
            }
        }
        let value = text.parse::<f64>().map_err(|_| JsonError::InvalidCharacter)?;
        sink.on_float(name, value)
    }

    /// Parses a quoted string (the opening quote not yet consumed),
    /// unescaping into an owned buffer. Handles `\uXXXX` with UTF-16
    /// surrogate pairs up to U+10FFFF.
    fn parse_string(&mut self) -> Result<String, JsonError> {
        self.pos += 1; // consume '"'
        let mut out = String::new();
        loop {
            match self.advance()? {
                b'"' => return Ok(out),
                b'\\' => match self.advance()? {
                    b'"' => out.push('"'),
                    b'\\' => out.push('\\'),
                    b'/' => out.push('/'),
                    b'b' => out.push('\u{8}'),
                    b'f' => out.push('\u{c}'),
                    b'n' => out.push('\n'),
                    b'r' => out.push('\r'),
                    b't' => out.push('\t'),
                    b'u' => {
                        let unit = self.parse_hex4()?;
                        let code_point = match unit {
                            0xD800..=0xDBFF => {
                                // High surrogate: a low surrogate must follow.
                                if self.advance()? != b'\\' || self.advance()? != b'u' {
                                    return Err(JsonError::InvalidCharacter);
                                }
                                let low = self.parse_hex4()?;
                                if !(0xDC00..=0xDFFF).contains(&low) {
                                    return Err(JsonError::InvalidCharacter);
                                }
                                0x10000 + ((unit as u32 - 0xD800) << 10) + (low as u32 - 0xDC00)
                            }
                            0xDC00..=0xDFFF => return Err(JsonError::InvalidCharacter),
                            _ => unit as u32,
                        };
                        let ch =
                            char::from_u32(code_point).ok_or(JsonError::InvalidCharacter)?;
                        out.push(ch);
                    }
                    _ => return Err(JsonError::InvalidCharacter),
                },
                byte if byte < 0x20 => return Err(JsonError::InvalidCharacter),
                byte if byte < 0x80 => out.push(byte as char),
                byte => {
                    // Re-validate the multi-byte sequence as UTF-8.
                    let len = match byte {
                        0xC0..=0xDF => 2,
                        0xE0..=0xEF => 3,
                        0xF0..=0xF7 => 4,
                        _ => return Err(JsonError::InvalidCharacter),
                    };
                    let start = self.pos - 1;
                    if start + len > self.data.len() {
                        return Err(JsonError::Incomplete);
                    }
                    let seq = core::str::from_utf8(&self.data[start..start + len])
                        .map_err(|_| JsonError::InvalidCharacter)?;
                    out.push_str(seq);
                    self.pos = start + len;
                }
            }
        }
    }

    fn parse_hex4(&mut self) -> Result<u16, JsonError> {
        let mut value: u16 = 0;
        for _ in 0..4 {
            let digit = match self.advance()? {
                b @ b'0'..=b'9' => b - b'0',
                b @ b'a'..=b'f' => b - b'a' + 10,
                b @ b'A'..=b'F' => b - b'A' + 10,
                _ => return Err(JsonError::InvalidCharacter),
            };
            value = (value << 4) | digit as u16;
        }
        Ok(value)
    }
}

/// An ordered in-memory document: object members keep insertion order so
/// round-trip tests can assert byte-level ordering.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<JsonValue>),
    Object(Vec<(String, JsonValue)>),
}

impl JsonValue {
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        match self {
            JsonValue::Object(members) => members
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            JsonValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            JsonValue::Float(value) => Some(*value),
            JsonValue::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            JsonValue::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsonValue::String(value) => Some(value),
            _ => None,
        }
    }
}

/// Decodes a document into a [`JsonValue`] tree.
pub fn decode_to_value(data: &[u8]) -> Result<JsonValue, JsonError> {
    enum Slot {
        Array(Option<String>, Vec<JsonValue>),
        Object(Option<String>, Vec<(String, JsonValue)>),
    }

    struct Builder {
        stack: Vec<Slot>,
        root: Option<JsonValue>,
    }

    impl Builder {
        fn place(&mut self, name: Option<&str>, value: JsonValue) -> Result<(), JsonError> {
            match self.stack.last_mut() {
                Some(Slot::Array(_, items)) => items.push(value),
                Some(Slot::Object(_, members)) => {
                    let name = name.ok_or(JsonError::InvalidData)?;
                    members.push((name.to_string(), value));
                }
                None => self.root = Some(value),
            }
            Ok(())
        }
    }

    impl JsonEventSink for Builder {
        fn on_begin_object(&mut self, name: Option<&str>) -> Result<(), JsonError> {
            self.stack
                .push(Slot::Object(name.map(str::to_string), Vec::new()));
            Ok(())
        }

        fn on_begin_array(&mut self, name: Option<&str>) -> Result<(), JsonError> {
            self.stack
                .push(Slot::Array(name.map(str::to_string), Vec::new()));
            Ok(())
        }

        fn on_end_container(&mut self) -> Result<(), JsonError> {
            let slot = self.stack.pop().ok_or(JsonError::InvalidData)?;
            let (name, value) = match slot {
                Slot::Array(name, items) => (name, JsonValue::Array(items)),
                Slot::Object(name, members) => (name, JsonValue::Object(members)),
            };
            self.place(name.as_deref(), value)
        }

        fn on_boolean(&mut self, name: Option<&str>, value: bool) -> Result<(), JsonError> {
            self.place(name, JsonValue::Boolean(value))
        }

        fn on_integer(&mut self, name: Option<&str>, value: i64) -> Result<(), JsonError> {
            self.place(name, JsonValue::Integer(value))
        }

        fn on_float(&mut self, name: Option<&str>, value: f64) -> Result<(), JsonError> {
            self.place(name, JsonValue::Float(value))
        }

        fn on_null(&mut self, name: Option<&str>) -> Result<(), JsonError> {
            self.place(name, JsonValue::Null)
        }

        fn on_string(&mut self, name: Option<&str>, value: &str) -> Result<(), JsonError> {
            self.place(name, JsonValue::String(value.to_string()))
        }

        fn on_end_data(&mut self) -> Result<(), JsonError> {
            Ok(())
        }
    }

    let mut builder = Builder {
        stack: Vec::new(),
        root: None,
    };
    decode(data, &mut builder)?;
    builder.root.ok_or(JsonError::Incomplete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonEncoder;

    #[test]
    fn test_decode_scalars() {
        let value = decode_to_value(b"{\"a\": 1, \"b\": -2.5, \"c\": true, \"d\": null, \"e\": \"x\"}")
            .unwrap();
        assert_eq!(value.get("a").unwrap().as_i64(), Some(1));
        assert_eq!(value.get("b").unwrap().as_f64(), Some(-2.5));
        assert_eq!(value.get("c").unwrap().as_bool(), Some(true));
        assert_eq!(value.get("d"), Some(&JsonValue::Null));
        assert_eq!(value.get("e").unwrap().as_str(), Some("x"));
    }

    #[test]
    fn test_decode_preserves_member_order() {
        let value = decode_to_value(b"{\"z\": 1, \"a\": 2, \"m\": 3}").unwrap();
        match value {
            JsonValue::Object(members) => {
                let keys: Vec<&str> = members.iter().map(|(k, _)| k.as_str()).collect();
                assert_eq!(keys, vec!["z", "a", "m"]);
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn test_integer_overflow_promotes_to_float() {
        let value = decode_to_value(b"[92233720368547758080]").unwrap();
        match value {
            JsonValue::Array(items) => {
                assert!(matches!(items[0], JsonValue::Float(f) if f > 9.2e18));
            }
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn test_unicode_escape_basic() {
        let value = decode_to_value(b"\"\\u0041\\u00e9\\u4e16\"").unwrap();
        assert_eq!(value.as_str(), Some("Aé世"));
    }

    #[test]
    fn test_surrogate_pair() {
        // U+1F600 encoded as a surrogate pair.
        let value = decode_to_value(b"\"\\ud83d\\ude00\"").unwrap();
        assert_eq!(value.as_str(), Some("\u{1F600}"));
    }

    #[test]
    fn test_lone_trail_surrogate_rejected() {
        assert_eq!(
            decode_to_value(b"\"\\udc00\""),
            Err(JsonError::InvalidCharacter)
        );
    }

    #[test]
    fn test_high_surrogate_without_low_rejected() {
        assert_eq!(
            decode_to_value(b"\"\\ud83d x\""),
            Err(JsonError::InvalidCharacter)
        );
    }

    #[test]
    fn test_truncated_document_incomplete() {
        assert_eq!(decode_to_value(b"{\"a\": [1, 2"), Err(JsonError::Incomplete));
        assert_eq!(decode_to_value(b"\"abc"), Err(JsonError::Incomplete));
        assert_eq!(decode_to_value(b"tru"), Err(JsonError::Incomplete));
    }

    #[test]
    fn test_structural_garbage_rejected() {
        assert_eq!(decode_to_value(b"{a: 1}"), Err(JsonError::InvalidCharacter));
        assert_eq!(
            decode_to_value(b"[1 2]"),
            Err(JsonError::InvalidCharacter)
        );
        assert_eq!(
            decode_to_value(b"{\"a\" 1}"),
            Err(JsonError::InvalidCharacter)
        );
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        assert_eq!(decode_to_value(b"1 x"), Err(JsonError::InvalidCharacter));
    }

    #[test]
    fn test_validate_document() {
        assert!(validate_document(b"  {\"k\": [1, 2, 3]}").is_ok());
        assert!(validate_document(b"not json").is_err());
    }

    #[test]
    fn test_round_trip_equivalence() {
        let mut encoder = JsonEncoder::new(Vec::new());
        encoder.begin_object(None).unwrap();
        encoder.add_string(Some("name"), "wor\"ld\n").unwrap();
        encoder.begin_array(Some("values")).unwrap();
        encoder.add_int(None, 42).unwrap();
        encoder.add_float(None, -0.25).unwrap();
        encoder.add_bool(None, false).unwrap();
        encoder.add_null(None).unwrap();
        encoder.end_container().unwrap();
        encoder.begin_object(Some("nested")).unwrap();
        encoder.add_uint(Some("big"), 7).unwrap();
        encoder.end_container().unwrap();
        encoder.end_container().unwrap();
        let bytes = encoder.into_sink();

        let value = decode_to_value(&bytes).unwrap();
        let expected = JsonValue::Object(vec![
            ("name".into(), JsonValue::String("wor\"ld\n".into())),
            (
                "values".into(),
                JsonValue::Array(vec![
                    JsonValue::Integer(42),
                    JsonValue::Float(-0.25),
                    JsonValue::Boolean(false),
                    JsonValue::Null,
                ]),
            ),
            (
                "nested".into(),
                JsonValue::Object(vec![("big".into(), JsonValue::Integer(7))]),
            ),
        ]);
        assert_eq!(value, expected);
    }

    #[test]
    fn test_escape_safety_property() {
        // Any escapable string encodes with no raw quote, backslash, or
        // control bytes, and decodes back to the original.
        let inputs = ["plain", "with \"quotes\"", "back\\slash", "tabs\tand\nnewlines\r"];
        for input in inputs {
            let mut encoder = JsonEncoder::new(Vec::new());
            encoder.add_string(None, input).unwrap();
            let bytes = encoder.into_sink();
            let interior = &bytes[1..bytes.len() - 1];
            let mut previous_backslash = false;
            for &b in interior {
                assert!(b >= 0x20, "raw control byte in {input:?}");
                if !previous_backslash {
                    assert_ne!(b, b'"', "unescaped quote in {input:?}");
                }
                previous_backslash = b == b'\\' && !previous_backslash;
            }
            let value = decode_to_value(&bytes).unwrap();
            assert_eq!(value.as_str(), Some(input));
        }
    }

    #[test]
    fn test_depth_limit_enforced() {
        let mut doc = Vec::new();
        doc.extend(std::iter::repeat(b'[').take(MAX_ENCODE_DEPTH + 2));
        doc.extend(std::iter::repeat(b']').take(MAX_ENCODE_DEPTH + 2));
        assert_eq!(decode_to_value(&doc), Err(JsonError::InvalidData));
    }
}
