// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Interfaces to the language-runtime helpers that interpret raw memory.
//!
//! The recorder never parses runtime object layouts itself. A host-provided
//! [`ObjectClassifier`] decides whether a pointer names a live interpretable
//! object and extracts short typed views of it; a [`DeallocOracle`] remembers
//! recently-released exception-like objects so use-after-free crashes can
//! name the object involved. Both have inert defaults so the recorder works
//! (with reduced detail) when no runtime helper is wired in.
//!
//! Implementations are called with all other threads suspended and must be
//! async-signal-safe: no allocation, no locks.

/// Total classifier invocations allowed per top-level interpretation pass.
/// Shared across the recursion, not per-branch.
pub const INTROSPECTION_BUDGET: i32 = 15;

/// What a pointer-sized value turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClass<'a> {
    /// The null page.
    NullPointer,
    /// A pointer to a class/type descriptor rather than an instance.
    ClassReference { name: &'a str },
    /// A live string object.
    String { class_name: &'a str },
    /// A live array-like object.
    Array { class_name: &'a str },
    /// A live date object (floating-point epoch value).
    Date { class_name: &'a str },
    /// A live URL object.
    Url { class_name: &'a str },
    /// A live boxed-number object.
    Number { class_name: &'a str },
    /// A live object of a type without a specialized view.
    Object { class_name: &'a str },
    /// Not a recognizable object pointer.
    Unknown,
}

impl ObjectClass<'_> {
    pub fn class_name(&self) -> Option<&str> {
        match self {
            ObjectClass::ClassReference { name } => Some(name),
            ObjectClass::String { class_name }
            | ObjectClass::Array { class_name }
            | ObjectClass::Date { class_name }
            | ObjectClass::Url { class_name }
            | ObjectClass::Number { class_name }
            | ObjectClass::Object { class_name } => Some(class_name),
            _ => None,
        }
    }
}

/// A scalar view of one instance field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Boolean(bool),
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Pointer(u64),
}

pub trait ObjectClassifier: Sync {
    /// Classifies a candidate pointer. Must tolerate arbitrary garbage.
    fn classify(&self, address: u64) -> ObjectClass<'_>;

    /// Copies up to `out.len()` bytes of a string object's UTF-8 contents;
    /// returns the copied length.
    fn copy_string_contents(&self, address: u64, out: &mut [u8]) -> usize;

    /// Copies the target of a URL object, same convention as strings.
    fn copy_url_target(&self, address: u64, out: &mut [u8]) -> usize;

    /// The floating-point value of a date object.
    fn date_value(&self, address: u64) -> f64;

    /// The floating-point value of a boxed number.
    fn number_value(&self, address: u64) -> f64;

    /// The address of an array's first element, if it has one.
    fn array_first_element(&self, address: u64) -> Option<u64>;

    /// Visits each instance field of an object as (name, scalar view).
    fn each_instance_field(&self, address: u64, visit: &mut dyn FnMut(&str, FieldValue));
}

/// Classifier used when runtime introspection is unavailable or disabled:
/// only the null check survives.
pub struct InertClassifier;

pub static INERT_CLASSIFIER: InertClassifier = InertClassifier;

impl ObjectClassifier for InertClassifier {
    fn classify(&self, address: u64) -> ObjectClass<'_> {
        if address == 0 {
            ObjectClass::NullPointer
        } else {
            ObjectClass::Unknown
        }
    }

    fn copy_string_contents(&self, _address: u64, _out: &mut [u8]) -> usize {
        0
    }

    fn copy_url_target(&self, _address: u64, _out: &mut [u8]) -> usize {
        0
    }

    fn date_value(&self, _address: u64) -> f64 {
        0.0
    }

    fn number_value(&self, _address: u64) -> f64 {
        0.0
    }

    fn array_first_element(&self, _address: u64) -> Option<u64> {
        None
    }

    fn each_instance_field(&self, _address: u64, _visit: &mut dyn FnMut(&str, FieldValue)) {}
}

/// A recently-deallocated exception-like object, as remembered by the
/// zombie tracker.
#[derive(Debug, Clone, Copy)]
pub struct DeallocatedException<'a> {
    pub address: u64,
    pub name: &'a str,
    pub reason: &'a str,
    pub backtrace: &'a [usize],
}

pub trait DeallocOracle: Sync {
    /// Class name of a recently-released object at `address`, if the
    /// tracker saw it die.
    fn class_name_of(&self, address: u64) -> Option<&str>;

    /// The most recently released exception-like object.
    fn last_exception(&self) -> Option<DeallocatedException<'_>>;
}

/// Oracle used when zombie tracking is not installed.
pub struct InertOracle;

pub static INERT_ORACLE: InertOracle = InertOracle;

impl DeallocOracle for InertOracle {
    fn class_name_of(&self, _address: u64) -> Option<&str> {
        None
    }

    fn last_exception(&self) -> Option<DeallocatedException<'_>> {
        None
    }
}
