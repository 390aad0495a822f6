// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The report writer: walks the crashed process and streams a structured
//! post-mortem document.
//!
//! Two flavors exist. The standard report carries the whole process —
//! binary images, every thread, interpreted memory, persisted session
//! statistics. The minimal report carries only the offending thread and
//! the error block; it is what gets written when the recorder itself is
//! the thing that crashed.
//!
//! Everything here runs single-pass with stack-resident scratch. Failures
//! degrade per-field: an unreadable region or a refused section never
//! aborts the document.

pub(crate) mod memory;
pub(crate) mod names;
mod writer;

pub use writer::ReportWriter;

use crate::codec::{AddJsonData, FdSink, JsonError};
use crate::context::{CrashSource, Recorder};
use crate::machine::{Machine, RegisterSet, ThreadHandle, MAX_CAPTURED_FRAMES, MAX_THREADS};
use names::{
    mach_code_name, mach_exception_for_signal, mach_exception_name, signal_code_name,
    signal_for_mach_exception, signal_name, EXC_CRASH,
};
use std::ffi::CStr;
use std::os::unix::io::RawFd;
use symbolic_common::Name;
use symbolic_demangle::{Demangle, DemangleOptions};
use thiserror::Error;

/// Report format version.
const REPORT_VERSION_MAJOR: u64 = 3;
const REPORT_VERSION_MINOR: u64 = 0;

/// Backtraces longer than this mark the thread as overflowed.
pub(crate) const STACK_OVERFLOW_THRESHOLD: usize = 200;

/// Most frames emitted per thread; the excess is trimmed from the top and
/// counted in `skipped`.
pub(crate) const MAX_REPORTED_FRAMES: usize = 150;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report file already exists")]
    AlreadyExists,
    #[error("failed to create report file (errno {0})")]
    Open(i32),
    #[error("failed to encode report: {0}")]
    Encode(#[from] JsonError),
}

/// Closes the report descriptor on every exit path.
struct FdGuard(RawFd);

impl Drop for FdGuard {
    fn drop(&mut self) {
        // SAFETY: we own the descriptor; double-close is prevented by Drop
        // running once.
        unsafe { libc::close(self.0) };
    }
}

fn open_exclusive(path: &CStr) -> Result<FdGuard, ReportError> {
    // SAFETY: path is NUL-terminated; flags are constants.
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL,
            0o644 as libc::c_uint,
        )
    };
    if fd < 0 {
        let err = errno::errno().0;
        return Err(if err == libc::EEXIST {
            ReportError::AlreadyExists
        } else {
            ReportError::Open(err)
        });
    }
    Ok(FdGuard(fd))
}

/// Writes the full report to `path`. The file is created exclusively; a
/// pre-existing file is left untouched.
pub fn write_standard_report(recorder: &Recorder, path: &CStr) -> Result<(), ReportError> {
    prepare(recorder);
    let fd = open_exclusive(path)?;
    let mut sink = FdSink::new(fd.0);
    write_standard_document(recorder, &mut sink)?;
    Ok(())
}

/// Writes the reduced report to `path`, same creation semantics.
pub fn write_minimal_report(recorder: &Recorder, path: &CStr) -> Result<(), ReportError> {
    prepare(recorder);
    let fd = open_exclusive(path)?;
    let mut sink = FdSink::new(fd.0);
    write_minimal_document(recorder, &mut sink, false)?;
    Ok(())
}

/// Recrash flavor: minimal document plus the incomplete marker, written to
/// the dedicated recrash path.
pub(crate) fn write_recrash_report(recorder: &Recorder, path: &CStr) -> Result<(), ReportError> {
    prepare(recorder);
    let fd = open_exclusive(path)?;
    let mut sink = FdSink::new(fd.0);
    write_minimal_document(recorder, &mut sink, true)?;
    Ok(())
}

/// Shared preamble: derive the stack-overflow flag from the offending
/// thread's backtrace, and publish the introspection policy for the
/// memory helpers.
pub(crate) fn prepare(recorder: &Recorder) {
    // SAFETY: called from the handling thread inside the crash window.
    let ctx = unsafe { recorder.context_mut() };
    if ctx.backtrace_len == 0 && ctx.registers_are_valid {
        let offending = ctx.offending_thread;
        let crate::context::SentryContext {
            registers,
            backtrace,
            backtrace_len,
            ..
        } = &mut *ctx;
        *backtrace_len = recorder
            .machine
            .backtrace(offending, Some(registers), backtrace);
    }
    if ctx.backtrace_len > STACK_OVERFLOW_THRESHOLD {
        ctx.is_stack_overflow = true;
    }
    memory::publish_policy(
        recorder.config.introspect_memory(),
        recorder.config.restricted_classes(),
    );
}

pub(crate) fn write_standard_document(
    recorder: &Recorder,
    sink: &mut dyn AddJsonData,
) -> Result<(), JsonError> {
    let mut writer = ReportWriter::new(sink);
    let w = &mut writer;
    w.begin_object(None)?;
    w.begin_object(Some("report"))?;

    write_report_info(recorder, w, "standard", false)?;
    write_binary_images(recorder, w)?;
    write_process_state(recorder, w)?;
    if let Some(system) = recorder.config.system_info_json() {
        w.add_raw_json(Some("system"), system)?;
    }
    write_system_atcrash(recorder, w)?;
    if let Some(user) = recorder.config.user_info_json() {
        w.add_raw_json(Some("user"), user)?;
    }

    w.begin_object(Some("crash"))?;
    write_all_threads(recorder, w)?;
    write_error(recorder, w)?;
    w.end_container()?;

    if let Some(callback) = recorder.config.on_crash_notify() {
        w.begin_object(Some("user_atcrash"))?;
        callback(w);
        w.end_container()?;
    }

    w.end_container()?;
    w.end_container()
}

pub(crate) fn write_minimal_document(
    recorder: &Recorder,
    sink: &mut dyn AddJsonData,
    incomplete: bool,
) -> Result<(), JsonError> {
    let mut writer = ReportWriter::new(sink);
    let w = &mut writer;
    w.begin_object(None)?;
    w.begin_object(Some("report"))?;

    write_report_info(recorder, w, "minimal", incomplete)?;

    w.begin_object(Some("crash"))?;
    // SAFETY: handling window.
    let offending = unsafe { recorder.context() }.offending_thread;
    write_thread(recorder, w, offending, 0, ThreadDetail::Minimal, Some("crashed_thread"))?;
    write_error(recorder, w)?;
    w.end_container()?;

    w.end_container()?;
    w.end_container()
}

fn write_report_info(
    recorder: &Recorder,
    w: &mut ReportWriter<'_>,
    report_type: &str,
    incomplete: bool,
) -> Result<(), JsonError> {
    w.begin_object(Some("report"))?;
    w.begin_object(Some("version"))?;
    w.add_uint(Some("major"), REPORT_VERSION_MAJOR)?;
    w.add_uint(Some("minor"), REPORT_VERSION_MINOR)?;
    w.end_container()?;
    w.add_uuid(Some("id"), &recorder.config.crash_id)?;
    w.add_string(Some("process_name"), &recorder.config.process_name)?;
    // SAFETY: time(2) with a null argument has no preconditions and is
    // async-signal-safe.
    let timestamp = unsafe { libc::time(std::ptr::null_mut()) };
    w.add_int(Some("timestamp"), timestamp as i64)?;
    w.add_string(Some("type"), report_type)?;
    if incomplete {
        w.add_bool(Some("incomplete"), true)?;
    }
    w.end_container()
}

fn write_binary_images(recorder: &Recorder, w: &mut ReportWriter<'_>) -> Result<(), JsonError> {
    w.begin_array(Some("binary_images"))?;
    let mut first_error: Option<JsonError> = None;
    recorder.machine.each_binary_image(&mut |image| {
        if first_error.is_some() {
            return;
        }
        let result = (|| -> Result<(), JsonError> {
            w.begin_object(None)?;
            w.add_uint(Some("image_addr"), image.address)?;
            w.add_uint(Some("image_vmaddr"), image.vm_address)?;
            w.add_uint(Some("image_size"), image.size)?;
            w.add_string(Some("name"), image.name)?;
            if let Some(uuid) = &image.uuid {
                w.add_uuid(Some("uuid"), uuid)?;
            }
            w.add_int(Some("cpu_type"), image.cpu_type as i64)?;
            w.add_int(Some("cpu_subtype"), image.cpu_subtype as i64)?;
            w.end_container()
        })();
        if let Err(e) = result {
            first_error = Some(e);
        }
    });
    if let Some(e) = first_error {
        return Err(e);
    }
    w.end_container()
}

/// The `process` section: the most recently deallocated exception-like
/// object, when the zombie tracker remembers one.
fn write_process_state(recorder: &Recorder, w: &mut ReportWriter<'_>) -> Result<(), JsonError> {
    let Some(exception) = recorder.oracle.last_exception() else {
        return Ok(());
    };
    w.begin_object(Some("process"))?;
    w.begin_object(Some("last_dealloced_nsexception"))?;
    w.add_uint(Some("address"), exception.address)?;
    w.add_string(Some("name"), exception.name)?;
    w.add_string(Some("reason"), exception.reason)?;
    let mut limit = crate::introspect::INTROSPECTION_BUDGET;
    memory::write_memory_contents(
        w,
        recorder.machine,
        recorder.classifier,
        recorder.oracle,
        Some("referenced_object"),
        exception.address,
        &mut limit,
    )?;
    write_backtrace(recorder, w, exception.backtrace)?;
    w.end_container()?;
    w.end_container()
}

fn write_system_atcrash(recorder: &Recorder, w: &mut ReportWriter<'_>) -> Result<(), JsonError> {
    let state = &recorder.state;
    let stats = recorder.machine.memory_stats();
    w.begin_object(Some("system_atcrash"))?;
    w.begin_object(Some("memory"))?;
    w.add_uint(Some("usable"), stats.usable)?;
    w.add_uint(Some("free"), stats.free)?;
    w.end_container()?;
    w.begin_object(Some("application_stats"))?;
    w.add_bool(Some("application_active"), state.application_is_active())?;
    w.add_bool(
        Some("application_in_foreground"),
        state.application_is_in_foreground(),
    )?;
    w.add_uint(
        Some("launches_since_last_crash"),
        state.launches_since_last_crash() as u64,
    )?;
    w.add_uint(
        Some("sessions_since_last_crash"),
        state.sessions_since_last_crash() as u64,
    )?;
    w.add_uint(
        Some("sessions_since_launch"),
        state.sessions_since_launch() as u64,
    )?;
    w.add_float(
        Some("active_time_since_launch"),
        state.active_duration_since_launch(),
    )?;
    w.add_float(
        Some("active_time_since_last_crash"),
        state.active_duration_since_last_crash(),
    )?;
    w.add_float(
        Some("background_time_since_launch"),
        state.background_duration_since_launch(),
    )?;
    w.add_float(
        Some("background_time_since_last_crash"),
        state.background_duration_since_last_crash(),
    )?;
    w.end_container()?;
    w.end_container()
}

#[derive(Clone, Copy, PartialEq)]
enum ThreadDetail {
    /// Names, queue, stack dump, notable addresses.
    Full,
    /// Offending thread and error context only.
    Minimal,
}

fn write_all_threads(recorder: &Recorder, w: &mut ReportWriter<'_>) -> Result<(), JsonError> {
    // SAFETY: handling window.
    let offending = unsafe { recorder.context() }.offending_thread;
    let mut threads = [0 as ThreadHandle; MAX_THREADS];
    let count = recorder.machine.list_threads(&mut threads);

    w.begin_array(Some("threads"))?;
    let mut wrote_offending = false;
    for (index, &thread) in threads[..count].iter().enumerate() {
        wrote_offending |= thread == offending;
        write_thread(recorder, w, thread, index, ThreadDetail::Full, None)?;
    }
    if !wrote_offending {
        write_thread(recorder, w, offending, count, ThreadDetail::Full, None)?;
    }
    w.end_container()
}

fn write_thread(
    recorder: &Recorder,
    w: &mut ReportWriter<'_>,
    thread: ThreadHandle,
    index: usize,
    detail: ThreadDetail,
    name: Option<&str>,
) -> Result<(), JsonError> {
    let machine = recorder.machine;
    // SAFETY: handling window.
    let ctx = unsafe { recorder.context() };
    let crashed = thread == ctx.offending_thread;

    let mut captured = RegisterSet::default();
    let regs: Option<&RegisterSet> = if crashed && ctx.registers_are_valid {
        Some(&ctx.registers)
    } else if machine.thread_registers(thread, &mut captured) {
        Some(&captured)
    } else {
        None
    };

    w.begin_object(name)?;

    let mut scratch = [0usize; MAX_CAPTURED_FRAMES];
    let frames: &[usize] = if crashed && ctx.backtrace_len > 0 {
        &ctx.backtrace[..ctx.backtrace_len]
    } else {
        let n = machine.backtrace(thread, regs, &mut scratch);
        &scratch[..n]
    };
    write_backtrace(recorder, w, frames)?;

    if let Some(regs) = regs {
        write_registers(w, regs, crashed)?;
    }

    w.add_uint(Some("index"), index as u64)?;
    if detail == ThreadDetail::Full {
        if recorder.config.search_thread_names() {
            let mut buf = [0u8; 64];
            let len = machine.thread_name(thread, &mut buf);
            if len > 0 {
                w.add_string_bytes(Some("name"), &buf[..len])?;
            }
        }
        if recorder.config.search_queue_names() {
            let mut buf = [0u8; 64];
            let len = machine.queue_name(thread, &mut buf);
            if len > 0 {
                w.add_string_bytes(Some("dispatch_queue"), &buf[..len])?;
            }
        }
    }
    w.add_bool(Some("crashed"), crashed)?;
    w.add_bool(
        Some("current_thread"),
        thread == machine.current_thread(),
    )?;

    if crashed && detail == ThreadDetail::Full {
        if let Some(regs) = regs {
            memory::write_stack_dump(w, machine, regs, ctx.is_stack_overflow)?;
            memory::write_notable_addresses(
                w,
                machine,
                recorder.classifier,
                recorder.oracle,
                regs,
            )?;
        }
    }
    w.end_container()
}

fn write_backtrace(
    recorder: &Recorder,
    w: &mut ReportWriter<'_>,
    frames: &[usize],
) -> Result<(), JsonError> {
    let skipped = frames.len().saturating_sub(MAX_REPORTED_FRAMES);
    w.begin_object(Some("backtrace"))?;
    w.begin_array(Some("contents"))?;
    for &address in &frames[skipped..] {
        write_frame(recorder, w, address as u64)?;
    }
    w.end_container()?;
    w.add_uint(Some("skipped"), skipped as u64)?;
    w.end_container()
}

/// Demangling allocates, which only non-async sources may do.
fn may_allocate(recorder: &Recorder) -> bool {
    // SAFETY: handling window.
    let source = unsafe { recorder.context() }.source;
    match source {
        Some(source) => !source.crash_type().intersects(crate::CrashType::ASYNC_SAFE),
        None => true,
    }
}

fn write_frame(recorder: &Recorder, w: &mut ReportWriter<'_>, address: u64) -> Result<(), JsonError> {
    w.begin_object(None)?;
    if let Some(symbol) = recorder.machine.symbolicate(address) {
        if let Some(object_name) = symbol.object_name {
            w.add_string(Some("object_name"), basename(object_name))?;
        }
        w.add_uint(Some("object_addr"), symbol.object_address)?;
        match symbol.symbol_name {
            Some(raw_name) => {
                write_symbol_name(recorder, w, raw_name)?;
                w.add_uint(Some("symbol_addr"), symbol.symbol_address)?;
            }
            None => {
                // No symbol: fall back to the image base so the offset in
                // the report stays meaningful.
                w.add_uint(Some("symbol_addr"), symbol.object_address)?;
            }
        }
    }
    w.add_uint(Some("instruction_addr"), address)?;
    w.end_container()
}

fn write_symbol_name(
    recorder: &Recorder,
    w: &mut ReportWriter<'_>,
    raw_name: &str,
) -> Result<(), JsonError> {
    if may_allocate(recorder) {
        if let Some(demangled) = Name::from(raw_name).demangle(DemangleOptions::name_only()) {
            return w.add_string(Some("symbol_name"), &demangled);
        }
    }
    w.add_string(Some("symbol_name"), raw_name)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn write_registers(
    w: &mut ReportWriter<'_>,
    regs: &RegisterSet,
    include_exception: bool,
) -> Result<(), JsonError> {
    w.begin_object(Some("registers"))?;
    w.begin_object(Some("basic"))?;
    for reg in regs.basic_registers() {
        w.add_uint(Some(reg.name), reg.value)?;
    }
    w.end_container()?;
    if include_exception && !regs.exception_registers().is_empty() {
        w.begin_object(Some("exception"))?;
        for reg in regs.exception_registers() {
            w.add_uint(Some(reg.name), reg.value)?;
        }
        w.end_container()?;
    }
    w.end_container()
}

/// The normalized error block: both machine views of the fault plus the
/// source-specific payload.
fn write_error(recorder: &Recorder, w: &mut ReportWriter<'_>) -> Result<(), JsonError> {
    // SAFETY: handling window.
    let ctx = unsafe { recorder.context() };

    let (mach_exception, mach_code, mach_subcode, signum, sigcode) = match ctx.source {
        Some(CrashSource::MachException) => (
            ctx.mach.exception,
            ctx.mach.code,
            ctx.mach.subcode,
            signal_for_mach_exception(ctx.mach.exception, ctx.mach.code),
            0,
        ),
        Some(CrashSource::Signal) => (
            mach_exception_for_signal(ctx.signal.signum),
            0,
            0,
            ctx.signal.signum,
            ctx.signal.code,
        ),
        _ => (EXC_CRASH, 0, 0, libc::SIGABRT, 0),
    };

    w.begin_object(Some("error"))?;

    w.begin_object(Some("mach"))?;
    w.add_int(Some("exception"), mach_exception as i64)?;
    if let Some(name) = mach_exception_name(mach_exception) {
        w.add_string(Some("exception_name"), name)?;
    }
    w.add_int(Some("code"), mach_code)?;
    if let Some(name) = mach_code_name(mach_code) {
        w.add_string(Some("code_name"), name)?;
    }
    w.add_int(Some("subcode"), mach_subcode)?;
    w.end_container()?;

    w.begin_object(Some("signal"))?;
    w.add_int(Some("signal"), signum as i64)?;
    if let Some(name) = signal_name(signum) {
        w.add_string(Some("name"), name)?;
    }
    w.add_int(Some("code"), sigcode as i64)?;
    if let Some(name) = signal_code_name(signum, sigcode) {
        w.add_string(Some("code_name"), name)?;
    }
    w.end_container()?;

    w.add_uint(Some("address"), ctx.fault_address)?;
    // SAFETY: the referents live on the raising frame for the whole window.
    if let Some(reason) = unsafe { ctx.exception.reason.as_str() } {
        w.add_string(Some("reason"), reason)?;
    }
    if let Some(source) = ctx.source {
        w.add_string(Some("type"), source.type_name())?;
        match source {
            CrashSource::RuntimeException => {
                w.begin_object(Some("nsexception"))?;
                // SAFETY: as above.
                if let Some(name) = unsafe { ctx.exception.name.as_str() } {
                    w.add_string(Some("name"), name)?;
                }
                w.end_container()?;
            }
            CrashSource::ForeignException => {
                w.begin_object(Some("cpp_exception"))?;
                // SAFETY: as above.
                if let Some(name) = unsafe { ctx.exception.name.as_str() } {
                    w.add_string(Some("name"), name)?;
                }
                w.end_container()?;
            }
            CrashSource::UserReported => {
                w.begin_object(Some("user_reported"))?;
                // SAFETY: as above.
                if let Some(name) = unsafe { ctx.exception.name.as_str() } {
                    w.add_string(Some("name"), name)?;
                }
                // SAFETY: as above.
                if let Some(line) = unsafe { ctx.exception.line_of_code.as_str() } {
                    w.add_string(Some("line_of_code"), line)?;
                }
                if !ctx.exception.custom_frames.is_empty() {
                    w.begin_array(Some("backtrace"))?;
                    for i in 0..ctx.exception.custom_frames.len() {
                        // SAFETY: as above.
                        if let Some(frame) = unsafe { ctx.exception.custom_frames.get(i) } {
                            w.add_string(None, frame)?;
                        }
                    }
                    w.end_container()?;
                }
                w.end_container()?;
            }
            _ => {}
        }
    }
    w.end_container()
}

/// Human-readable crashed-thread trace on stdout, for development builds.
/// Raw `write(2)` only.
pub(crate) fn print_trace(recorder: &Recorder) {
    // SAFETY: handling window.
    let ctx = unsafe { recorder.context() };

    struct OutBuf {
        buf: [u8; 256],
        len: usize,
    }
    impl core::fmt::Write for OutBuf {
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
    let mut emit = |args: core::fmt::Arguments<'_>| {
        let mut out = OutBuf {
            buf: [0; 256],
            len: 0,
        };
        if core::fmt::write(&mut out, args).is_ok() {
            // SAFETY: live stack buffer of the stated length.
            unsafe { libc::write(1, out.buf.as_ptr() as *const libc::c_void, out.len) };
        }
    };

    emit(format_args!("\ncrashed thread backtrace:\n"));
    let frames = &ctx.backtrace[..ctx.backtrace_len];
    let skipped = frames.len().saturating_sub(MAX_REPORTED_FRAMES);
    for &address in &frames[skipped..] {
        match recorder.machine.symbolicate(address as u64) {
            Some(symbol) => {
                let name = symbol.symbol_name.unwrap_or("<unknown>");
                let object = symbol.object_name.map(basename).unwrap_or("?");
                emit(format_args!("{address:#018x} {name} ({object})\n"));
            }
            None => emit(format_args!("{address:#018x}\n")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CrashSource, ExceptionFault, RawStr, RawStrList};
    use crate::test_support::*;
    use serde_json::Value;

    const WORKER: ThreadHandle = 11;
    const OTHER: ThreadHandle = 12;
    const STACK_BASE: u64 = 0x7000_0000_0000;

    fn machine_for_signal_crash() -> FakeMachine {
        FakeMachine {
            current: OTHER,
            main: OTHER,
            threads: vec![WORKER, OTHER],
            registers: vec![(
                OTHER,
                registers_with(&[("rax", 0), ("rsp", STACK_BASE)], STACK_BASE),
            )],
            backtraces: vec![
                (WORKER, vec![0x1000_1000, 0x1000_2000, 0x1000_3000]),
                (OTHER, vec![0x1000_4000]),
            ],
            thread_names: vec![(WORKER, "worker-thread")],
            memory: vec![(STACK_BASE - 160, vec![0xAB; 4096])],
            symbols: vec![FakeSymbol {
                start: 0x1000_0000,
                end: 0x1001_0000,
                object_name: "/usr/lib/libapp.dylib",
                object_address: 0x1000_0000,
                symbol_name: Some("handle_request"),
                symbol_address: 0x1000_0800,
            }],
            images: vec![FakeImage {
                address: 0x1000_0000,
                vm_address: 0x0,
                size: 0x10000,
                name: "/usr/lib/libapp.dylib",
                uuid: Some([7u8; 16]),
                cpu_type: 0x0100000C,
                cpu_subtype: 0,
            }],
            main_responsive: true,
            ..Default::default()
        }
    }

    fn fill_signal_context(harness: &TestHarness, machine: &FakeMachine) {
        let _ = machine;
        // SAFETY: tests run the handling protocol single-threaded.
        let ctx = unsafe { harness.recorder.context_mut() };
        ctx.source = Some(CrashSource::Signal);
        ctx.offending_thread = WORKER;
        ctx.fault_address = 0xDEAD_BEEF;
        ctx.signal.signum = libc::SIGSEGV;
        ctx.signal.code = 1;
        ctx.registers = registers_with(
            &[("rax", 0x1234), ("rbp", STACK_BASE + 64), ("rsp", STACK_BASE)],
            STACK_BASE,
        );
        ctx.registers_are_valid = true;
    }

    fn standard_report_json(harness: &TestHarness) -> Value {
        // The introspection policy slot is process-global; hold the lock
        // across prepare + write so concurrent tests cannot republish it.
        let _guard = crate::test_support::GLOBAL_TEST_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        prepare(harness.recorder);
        let mut sink = Vec::new();
        write_standard_document(harness.recorder, &mut sink).unwrap();
        serde_json::from_slice(&sink).unwrap()
    }

    #[test]
    fn test_standard_report_signal_crash() {
        let machine = leak(machine_for_signal_crash());
        let classifier = leak(FakeClassifier::default());
        let oracle = leak(FakeOracle::default());
        let harness = build_recorder(machine, classifier, oracle);
        harness.recorder.config.set_search_thread_names(true);
        fill_signal_context(&harness, machine);

        let doc = standard_report_json(&harness);
        let report = &doc["report"];
        assert_eq!(report["report"]["type"], "standard");
        assert_eq!(report["report"]["version"]["major"], 3);
        assert_eq!(report["report"]["version"]["minor"], 0);
        assert_eq!(report["report"]["process_name"], "test-process");
        assert!(report["report"]["timestamp"].as_i64().unwrap() > 0);

        let error = &report["crash"]["error"];
        assert_eq!(error["type"], "signal");
        assert_eq!(error["signal"]["signal"], 11);
        assert_eq!(error["signal"]["name"], "SIGSEGV");
        assert_eq!(error["signal"]["code_name"], "SEGV_MAPERR");
        assert_eq!(error["address"].as_u64().unwrap(), 0xDEAD_BEEF);
        assert_eq!(error["mach"]["exception_name"], "EXC_BAD_ACCESS");

        let threads = report["crash"]["threads"].as_array().unwrap();
        assert_eq!(threads.len(), 2);
        let crashed: Vec<&Value> = threads
            .iter()
            .filter(|t| t["crashed"] == Value::Bool(true))
            .collect();
        assert_eq!(crashed.len(), 1);
        assert_eq!(crashed[0]["name"], "worker-thread");
        assert_eq!(crashed[0]["registers"]["basic"]["rax"].as_u64(), Some(0x1234));
        // The crashed thread's stack window was readable.
        assert_eq!(crashed[0]["stack"]["overflow"], false);
        assert_eq!(crashed[0]["stack"]["grow_direction"], "-");
        assert!(crashed[0]["stack"]["contents"].as_str().unwrap().len() > 0);

        let frame = &crashed[0]["backtrace"]["contents"][0];
        assert_eq!(frame["object_name"], "libapp.dylib");
        assert_eq!(frame["symbol_name"], "handle_request");
        assert_eq!(frame["instruction_addr"].as_u64(), Some(0x1000_1000));

        let images = report["binary_images"].as_array().unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0]["name"], "/usr/lib/libapp.dylib");
        assert_eq!(images[0]["image_size"].as_u64(), Some(0x10000));

        let stats = &report["system_atcrash"]["application_stats"];
        assert_eq!(stats["launches_since_last_crash"], 1);
        assert_eq!(stats["sessions_since_launch"], 1);
    }

    #[test]
    fn test_minimal_report_structure() {
        let machine = leak(machine_for_signal_crash());
        let classifier = leak(FakeClassifier::default());
        let oracle = leak(FakeOracle::default());
        let harness = build_recorder(machine, classifier, oracle);
        fill_signal_context(&harness, machine);

        let _guard = crate::test_support::GLOBAL_TEST_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        prepare(harness.recorder);
        let mut sink = Vec::new();
        write_minimal_document(harness.recorder, &mut sink, false).unwrap();
        let doc: Value = serde_json::from_slice(&sink).unwrap();
        let report = &doc["report"];

        assert_eq!(report["report"]["type"], "minimal");
        assert!(report["report"].get("incomplete").is_none());
        assert!(report.get("binary_images").is_none());
        assert!(report.get("system_atcrash").is_none());
        let crashed = &report["crash"]["crashed_thread"];
        assert_eq!(crashed["crashed"], true);
        assert_eq!(report["crash"]["error"]["type"], "signal");
        // Minimal skips name and queue lookups entirely.
        assert!(crashed.get("name").is_none());
    }

    #[test]
    fn test_recrash_document_carries_incomplete_marker() {
        let machine = leak(machine_for_signal_crash());
        let classifier = leak(FakeClassifier::default());
        let oracle = leak(FakeOracle::default());
        let harness = build_recorder(machine, classifier, oracle);
        fill_signal_context(&harness, machine);

        let _guard = crate::test_support::GLOBAL_TEST_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        prepare(harness.recorder);
        let mut sink = Vec::new();
        write_minimal_document(harness.recorder, &mut sink, true).unwrap();
        let doc: Value = serde_json::from_slice(&sink).unwrap();
        assert_eq!(doc["report"]["report"]["incomplete"], true);
        assert_eq!(doc["report"]["report"]["type"], "minimal");
    }

    #[test]
    fn test_stack_overflow_trimming() {
        let machine = leak(machine_for_signal_crash());
        let classifier = leak(FakeClassifier::default());
        let oracle = leak(FakeOracle::default());
        let harness = build_recorder(machine, classifier, oracle);
        fill_signal_context(&harness, machine);
        {
            // SAFETY: single-threaded test.
            let ctx = unsafe { harness.recorder.context_mut() };
            for i in 0..250 {
                ctx.backtrace[i] = 0x2000_0000 + i * 16;
            }
            ctx.backtrace_len = 250;
        }

        let doc = standard_report_json(&harness);
        // SAFETY: single-threaded test.
        assert!(unsafe { harness.recorder.context() }.is_stack_overflow);

        let threads = doc["report"]["crash"]["threads"].as_array().unwrap();
        let crashed = threads
            .iter()
            .find(|t| t["crashed"] == Value::Bool(true))
            .unwrap();
        assert_eq!(crashed["backtrace"]["skipped"], 100);
        assert_eq!(crashed["backtrace"]["contents"].as_array().unwrap().len(), 150);
        assert_eq!(crashed["stack"]["overflow"], true);
        // Trimming drops the innermost frames: the first emitted frame is
        // the 101st captured one.
        assert_eq!(
            crashed["backtrace"]["contents"][0]["instruction_addr"].as_u64(),
            Some(0x2000_0000 + 100 * 16)
        );
    }

    #[test]
    fn test_restricted_class_suppresses_contents() {
        const SECRET: u64 = 0x5000_0000;
        const WIDGET: u64 = 0x5000_1000;
        let mut machine = machine_for_signal_crash();
        machine.registers = vec![];
        let machine = leak(machine);
        let classifier = leak(FakeClassifier {
            objects: vec![
                (
                    SECRET,
                    FakeObject::Obj {
                        class: "Secret",
                        fields: vec![("token", crate::introspect::FieldValue::Unsigned(42))],
                    },
                ),
                (
                    WIDGET,
                    FakeObject::Obj {
                        class: "Widget",
                        fields: vec![("count", crate::introspect::FieldValue::Signed(-3))],
                    },
                ),
            ],
            ..Default::default()
        });
        let oracle = leak(FakeOracle::default());
        let harness = build_recorder(machine, classifier, oracle);
        harness
            .recorder
            .config
            .set_restricted_classes(vec!["Secret".into()]);
        fill_signal_context(&harness, machine);
        {
            // SAFETY: single-threaded test.
            let ctx = unsafe { harness.recorder.context_mut() };
            ctx.registers = registers_with(
                &[("x0", SECRET), ("x1", WIDGET)],
                STACK_BASE,
            );
        }

        let doc = standard_report_json(&harness);
        let threads = doc["report"]["crash"]["threads"].as_array().unwrap();
        let crashed = threads
            .iter()
            .find(|t| t["crashed"] == Value::Bool(true))
            .unwrap();
        let notable = &crashed["notable_addresses"];

        let secret = &notable["x0"];
        assert_eq!(secret["class"], "Secret");
        assert_eq!(secret["type"], "objc_object");
        assert!(secret.get("ivars").is_none());
        assert!(secret.get("value").is_none());

        let widget = &notable["x1"];
        assert_eq!(widget["class"], "Widget");
        assert_eq!(widget["ivars"]["count"], -3);
    }

    #[test]
    fn test_introspection_disabled_skips_notables() {
        const STR: u64 = 0x5100_0000;
        let machine = leak(machine_for_signal_crash());
        let classifier = leak(FakeClassifier {
            objects: vec![(
                STR,
                FakeObject::Str {
                    class: "StringBuf",
                    contents: "hello",
                },
            )],
            ..Default::default()
        });
        let oracle = leak(FakeOracle::default());
        let harness = build_recorder(machine, classifier, oracle);
        harness.recorder.config.set_introspect_memory(false);
        fill_signal_context(&harness, machine);
        {
            // SAFETY: single-threaded test.
            let ctx = unsafe { harness.recorder.context_mut() };
            ctx.registers = registers_with(&[("x0", STR)], STACK_BASE);
        }

        let doc = standard_report_json(&harness);
        let threads = doc["report"]["crash"]["threads"].as_array().unwrap();
        let crashed = threads
            .iter()
            .find(|t| t["crashed"] == Value::Bool(true))
            .unwrap();
        assert_eq!(
            crashed["notable_addresses"],
            Value::Object(Default::default())
        );
    }

    #[test]
    fn test_introspection_budget_bounds_classifier_calls() {
        // A self-referential array chain deeper than the budget.
        const HEAD: u64 = 0x5200_0000;
        let mut objects = Vec::new();
        for i in 0..30u64 {
            objects.push((
                HEAD + i * 0x10,
                FakeObject::Arr {
                    class: "Chain",
                    first: Some(HEAD + (i + 1) * 0x10),
                },
            ));
        }
        let mut machine = machine_for_signal_crash();
        machine.memory = vec![];
        let machine = leak(machine);
        let classifier = leak(FakeClassifier {
            objects,
            ..Default::default()
        });
        let oracle = leak(FakeOracle::default());
        let harness = build_recorder(machine, classifier, oracle);
        fill_signal_context(&harness, machine);
        {
            // SAFETY: single-threaded test.
            let ctx = unsafe { harness.recorder.context_mut() };
            ctx.registers = registers_with(&[("x0", HEAD)], STACK_BASE);
        }

        let _ = standard_report_json(&harness);
        assert_eq!(
            classifier.calls.load(std::sync::atomic::Ordering::SeqCst),
            crate::introspect::INTROSPECTION_BUDGET as usize
        );
    }

    #[test]
    fn test_process_section_reports_dealloced_exception() {
        let machine = leak(machine_for_signal_crash());
        let classifier = leak(FakeClassifier::default());
        let oracle = leak(FakeOracle {
            exception: Some((0x6000_0000, "StaleError", "object was gone", vec![0x1000_1000])),
            ..Default::default()
        });
        let harness = build_recorder(machine, classifier, oracle);
        fill_signal_context(&harness, machine);

        let doc = standard_report_json(&harness);
        let process = &doc["report"]["process"]["last_dealloced_nsexception"];
        assert_eq!(process["address"].as_u64(), Some(0x6000_0000));
        assert_eq!(process["name"], "StaleError");
        assert_eq!(process["reason"], "object was gone");
        assert_eq!(
            process["backtrace"]["contents"][0]["instruction_addr"].as_u64(),
            Some(0x1000_1000)
        );
    }

    #[test]
    fn test_user_and_system_documents_pass_through() {
        let machine = leak(machine_for_signal_crash());
        let classifier = leak(FakeClassifier::default());
        let oracle = leak(FakeOracle::default());
        let harness = build_recorder(machine, classifier, oracle);
        harness
            .recorder
            .config
            .set_system_info_json(Some("{\"os_version\": \"14.2\"}".into()));
        harness
            .recorder
            .config
            .set_user_info_json(Some("{\"plan\": \"pro\"}".into()));
        fill_signal_context(&harness, machine);

        let doc = standard_report_json(&harness);
        assert_eq!(doc["report"]["system"]["os_version"], "14.2");
        assert_eq!(doc["report"]["user"]["plan"], "pro");
    }

    #[test]
    fn test_user_atcrash_callback_output() {
        let machine = leak(machine_for_signal_crash());
        let classifier = leak(FakeClassifier::default());
        let oracle = leak(FakeOracle::default());
        let harness = build_recorder(machine, classifier, oracle);
        harness
            .recorder
            .config
            .set_on_crash_notify(Some(Box::new(|writer: &mut ReportWriter<'_>| {
                let _ = writer.add_string(Some("breadcrumb"), "checkout");
            })));
        fill_signal_context(&harness, machine);

        let doc = standard_report_json(&harness);
        assert_eq!(doc["report"]["user_atcrash"]["breadcrumb"], "checkout");
    }

    #[test]
    fn test_error_block_user_reported() {
        let machine = leak(machine_for_signal_crash());
        let classifier = leak(FakeClassifier::default());
        let oracle = leak(FakeOracle::default());
        let harness = build_recorder(machine, classifier, oracle);

        let name = "X";
        let reason = "why";
        let line = "file:10";
        let frames = [RawStr::new("frame0"), RawStr::new("frame1")];
        {
            // SAFETY: single-threaded test; referents outlive the write.
            let ctx = unsafe { harness.recorder.context_mut() };
            ctx.source = Some(CrashSource::UserReported);
            ctx.offending_thread = OTHER;
            ctx.exception = ExceptionFault {
                name: RawStr::new(name),
                reason: RawStr::new(reason),
                line_of_code: RawStr::new(line),
                custom_frames: RawStrList::new(&frames),
            };
        }

        let doc = standard_report_json(&harness);
        let error = &doc["report"]["crash"]["error"];
        assert_eq!(error["type"], "user");
        assert_eq!(error["reason"], "why");
        assert_eq!(error["user_reported"]["name"], "X");
        assert_eq!(error["user_reported"]["line_of_code"], "file:10");
        assert_eq!(
            error["user_reported"]["backtrace"],
            serde_json::json!(["frame0", "frame1"])
        );
        // Non-machine sources still carry normalized mach/signal views.
        assert_eq!(error["signal"]["signal"], libc::SIGABRT as i64);
        assert_eq!(error["mach"]["exception"].as_i64(), Some(10));
    }

    #[test]
    fn test_report_file_exclusive_create() {
        let machine = leak(machine_for_signal_crash());
        let classifier = leak(FakeClassifier::default());
        let oracle = leak(FakeOracle::default());
        let harness = build_recorder(machine, classifier, oracle);
        fill_signal_context(&harness, machine);

        let _guard = crate::test_support::GLOBAL_TEST_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let path = harness.crash_path();
        write_standard_report(harness.recorder, &path).unwrap();
        let second = write_standard_report(harness.recorder, &path);
        assert!(matches!(second, Err(ReportError::AlreadyExists)));
        // The original file survives untouched and parses.
        let bytes = std::fs::read(harness.dir.path().join("crash.json")).unwrap();
        let doc: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc["report"]["report"]["type"], "standard");
    }

    #[test]
    fn test_unreadable_stack_degrades_in_place() {
        let mut machine = machine_for_signal_crash();
        machine.memory = vec![];
        let machine = leak(machine);
        let classifier = leak(FakeClassifier::default());
        let oracle = leak(FakeOracle::default());
        let harness = build_recorder(machine, classifier, oracle);
        fill_signal_context(&harness, machine);

        let doc = standard_report_json(&harness);
        let threads = doc["report"]["crash"]["threads"].as_array().unwrap();
        let crashed = threads
            .iter()
            .find(|t| t["crashed"] == Value::Bool(true))
            .unwrap();
        assert_eq!(
            crashed["stack"]["error"],
            "stack memory contents not accessible"
        );
        assert!(crashed["stack"].get("contents").is_none());
    }
}
