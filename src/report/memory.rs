// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Interpreted-memory sections of the crash report: the raw stack dump
//! around the faulting stack pointer, and the "notable addresses" analysis
//! of register and stack values that turn out to be live objects.

use super::writer::ReportWriter;
use crate::codec::JsonError;
use crate::introspect::{
    DeallocOracle, FieldValue, ObjectClass, ObjectClassifier, INTROSPECTION_BUDGET,
};
use crate::machine::{Machine, RegisterSet};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize};

/// Pointer-sized slots dumped toward stack growth (below the SP) and away
/// from it.
const STACK_SLOTS_TOWARD_GROWTH: u64 = 20;
const STACK_SLOTS_AWAY: u64 = 10;

/// Longest string contents excerpt embedded in a report.
const STRING_EXCERPT_LIMIT: usize = 200;

// The introspection policy snapshot, published by the report preamble
// before any helper runs. Module-scope because the deepest helpers have no
// path back to the configuration; the pointed-to list is owned by the
// (never-freed) recorder configuration.
static POLICY_INTROSPECTION_ENABLED: AtomicBool = AtomicBool::new(false);
static POLICY_RESTRICTED_PTR: AtomicPtr<String> = AtomicPtr::new(ptr::null_mut());
static POLICY_RESTRICTED_LEN: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn publish_policy(enabled: bool, restricted: &[String]) {
    POLICY_INTROSPECTION_ENABLED.store(enabled, SeqCst);
    POLICY_RESTRICTED_PTR.store(restricted.as_ptr() as *mut String, SeqCst);
    POLICY_RESTRICTED_LEN.store(restricted.len(), SeqCst);
}

fn introspection_enabled() -> bool {
    POLICY_INTROSPECTION_ENABLED.load(SeqCst)
}

fn is_restricted_class(name: &str) -> bool {
    let ptr = POLICY_RESTRICTED_PTR.load(SeqCst);
    let len = POLICY_RESTRICTED_LEN.load(SeqCst);
    if ptr.is_null() || len == 0 {
        return false;
    }
    // SAFETY: the slice was published from the live configuration, which
    // outlives every crash-handling window.
    let restricted = unsafe { core::slice::from_raw_parts(ptr, len) };
    restricted.iter().any(|class| class == name)
}

/// Fixed-capacity key formatting ("stack@0x…" and friends).
struct KeyBuf {
    buf: [u8; 40],
    len: usize,
}

impl KeyBuf {
    fn new() -> Self {
        Self {
            buf: [0; 40],
            len: 0,
        }
    }

    fn format(mut self, args: core::fmt::Arguments<'_>) -> Option<Self> {
        core::fmt::write(&mut self, args).ok()?;
        Some(self)
    }

    fn as_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.buf[..self.len]).ok()
    }
}

impl core::fmt::Write for KeyBuf {
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

/// Raw dump of the stack window around the crashed thread's stack pointer.
/// Unreadable memory degrades to an in-place error field.
pub(crate) fn write_stack_dump(
    writer: &mut ReportWriter<'_>,
    machine: &dyn Machine,
    regs: &RegisterSet,
    overflow: bool,
) -> Result<(), JsonError> {
    let word = core::mem::size_of::<usize>() as u64;
    let sp = regs.stack_pointer;
    let dump_start = sp.saturating_sub(word * STACK_SLOTS_TOWARD_GROWTH);
    let dump_end = sp.saturating_add(word * STACK_SLOTS_AWAY);

    writer.begin_object(Some("stack"))?;
    writer.add_string(Some("grow_direction"), "-")?;
    writer.add_uint(Some("dump_start"), dump_start)?;
    writer.add_uint(Some("dump_end"), dump_end)?;
    writer.add_uint(Some("stack_pointer"), sp)?;
    writer.add_bool(Some("overflow"), overflow)?;

    let mut contents = [0u8; ((STACK_SLOTS_TOWARD_GROWTH + STACK_SLOTS_AWAY) * 8) as usize];
    let len = ((dump_end - dump_start) as usize).min(contents.len());
    if machine.safe_copy(dump_start, &mut contents[..len]) {
        writer.add_hex_bytes(Some("contents"), &contents[..len])?;
    } else {
        writer.add_string(Some("error"), "stack memory contents not accessible")?;
    }
    writer.end_container()
}

/// Scans general-purpose registers and the stack window for values the
/// classifier recognizes, and interprets each hit.
pub(crate) fn write_notable_addresses(
    writer: &mut ReportWriter<'_>,
    machine: &dyn Machine,
    classifier: &dyn ObjectClassifier,
    oracle: &dyn DeallocOracle,
    regs: &RegisterSet,
) -> Result<(), JsonError> {
    writer.begin_object(Some("notable_addresses"))?;
    for reg in regs.basic_registers() {
        write_if_notable(writer, machine, classifier, oracle, reg.name, reg.value)?;
    }

    let word = core::mem::size_of::<usize>() as i64;
    let sp = regs.stack_pointer as i64;
    for slot in -(STACK_SLOTS_TOWARD_GROWTH as i64)..STACK_SLOTS_AWAY as i64 {
        let slot_address = sp + slot * word;
        if slot_address <= 0 {
            continue;
        }
        let mut raw = [0u8; 8];
        if !machine.safe_copy(slot_address as u64, &mut raw[..word as usize]) {
            continue;
        }
        let mut value = [0u8; 8];
        value[..word as usize].copy_from_slice(&raw[..word as usize]);
        let value = u64::from_ne_bytes(value);

        let Some(key) = KeyBuf::new().format(format_args!("stack@{slot_address:#x}")) else {
            continue;
        };
        let Some(key) = key.as_str() else { continue };
        write_if_notable(writer, machine, classifier, oracle, key, value)?;
    }
    writer.end_container()
}

fn is_notable(class: &ObjectClass<'_>) -> bool {
    !matches!(class, ObjectClass::Unknown | ObjectClass::NullPointer)
}

fn write_if_notable(
    writer: &mut ReportWriter<'_>,
    machine: &dyn Machine,
    classifier: &dyn ObjectClassifier,
    oracle: &dyn DeallocOracle,
    name: &str,
    value: u64,
) -> Result<(), JsonError> {
    if !introspection_enabled() {
        return Ok(());
    }
    let class = classifier.classify(value);
    if !is_notable(&class) && oracle.class_name_of(value).is_none() {
        return Ok(());
    }
    // The notability probe consumed one classifier call from the budget.
    let mut limit = INTROSPECTION_BUDGET - 1;
    write_classified_contents(
        writer, machine, classifier, oracle, Some(name), value, class, &mut limit,
    )
}

/// Interprets the memory at `address`, recursing through arrays with a
/// shared budget. Each level costs one classifier call; the recursion stops
/// dead when the budget runs out.
pub(crate) fn write_memory_contents(
    writer: &mut ReportWriter<'_>,
    machine: &dyn Machine,
    classifier: &dyn ObjectClassifier,
    oracle: &dyn DeallocOracle,
    name: Option<&str>,
    address: u64,
    limit: &mut i32,
) -> Result<(), JsonError> {
    if *limit <= 0 {
        return Ok(());
    }
    *limit -= 1;
    let class = classifier.classify(address);
    write_classified_contents(writer, machine, classifier, oracle, name, address, class, limit)
}

#[allow(clippy::too_many_arguments)]
fn write_classified_contents(
    writer: &mut ReportWriter<'_>,
    machine: &dyn Machine,
    classifier: &dyn ObjectClassifier,
    oracle: &dyn DeallocOracle,
    name: Option<&str>,
    address: u64,
    class: ObjectClass<'_>,
    limit: &mut i32,
) -> Result<(), JsonError> {
    writer.begin_object(name)?;
    writer.add_uint(Some("address"), address)?;
    if let Some(zombie_class) = oracle.class_name_of(address) {
        writer.add_string(Some("last_deallocated_obj"), zombie_class)?;
    }
    match class {
        ObjectClass::NullPointer => {
            writer.add_string(Some("type"), "null_pointer")?;
        }
        ObjectClass::Unknown => {
            writer.add_string(Some("type"), "unknown")?;
        }
        ObjectClass::ClassReference { name: class_name } => {
            writer.add_string(Some("type"), "objc_class")?;
            writer.add_string(Some("class"), class_name)?;
        }
        ObjectClass::String { class_name } => {
            writer.add_string(Some("type"), "string")?;
            writer.add_string(Some("class"), class_name)?;
            if !is_restricted_class(class_name) {
                let mut excerpt = [0u8; STRING_EXCERPT_LIMIT];
                let len = classifier.copy_string_contents(address, &mut excerpt);
                writer.add_string_bytes(Some("value"), &excerpt[..len])?;
            }
        }
        ObjectClass::Url { class_name } => {
            writer.add_string(Some("type"), "objc_object")?;
            writer.add_string(Some("class"), class_name)?;
            if !is_restricted_class(class_name) {
                let mut target = [0u8; STRING_EXCERPT_LIMIT];
                let len = classifier.copy_url_target(address, &mut target);
                writer.add_string_bytes(Some("value"), &target[..len])?;
            }
        }
        ObjectClass::Date { class_name } => {
            writer.add_string(Some("type"), "objc_object")?;
            writer.add_string(Some("class"), class_name)?;
            if !is_restricted_class(class_name) {
                writer.add_float(Some("value"), classifier.date_value(address))?;
            }
        }
        ObjectClass::Number { class_name } => {
            writer.add_string(Some("type"), "objc_object")?;
            writer.add_string(Some("class"), class_name)?;
            if !is_restricted_class(class_name) {
                writer.add_float(Some("value"), classifier.number_value(address))?;
            }
        }
        ObjectClass::Array { class_name } => {
            writer.add_string(Some("type"), "objc_object")?;
            writer.add_string(Some("class"), class_name)?;
            if !is_restricted_class(class_name) {
                if let Some(first) = classifier.array_first_element(address) {
                    write_memory_contents(
                        writer,
                        machine,
                        classifier,
                        oracle,
                        Some("first_object"),
                        first,
                        limit,
                    )?;
                }
            }
        }
        ObjectClass::Object { class_name } => {
            writer.add_string(Some("type"), "objc_object")?;
            writer.add_string(Some("class"), class_name)?;
            if !is_restricted_class(class_name) {
                write_instance_fields(writer, classifier, address)?;
            }
        }
    }
    writer.end_container()
}

fn write_instance_fields(
    writer: &mut ReportWriter<'_>,
    classifier: &dyn ObjectClassifier,
    address: u64,
) -> Result<(), JsonError> {
    writer.begin_object(Some("ivars"))?;
    let mut first_error: Option<JsonError> = None;
    classifier.each_instance_field(address, &mut |field_name, value| {
        if first_error.is_some() {
            return;
        }
        let result = match value {
            FieldValue::Boolean(v) => writer.add_bool(Some(field_name), v),
            FieldValue::Signed(v) => writer.add_int(Some(field_name), v),
            FieldValue::Unsigned(v) => writer.add_uint(Some(field_name), v),
            FieldValue::Float(v) => writer.add_float(Some(field_name), v),
            FieldValue::Pointer(v) => writer.add_uint(Some(field_name), v),
        };
        if let Err(e) = result {
            first_error = Some(e);
        }
    });
    if let Some(e) = first_error {
        return Err(e);
    }
    writer.end_container()
}
