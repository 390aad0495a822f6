// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! User-reported exception sentry: the application hands us a crash
//! instead of the OS.
//!
//! This source never runs in async-signal context, so thread suspension is
//! optional (some hosts prefer not to stop the world for an advisory
//! report) and the process keeps running afterwards unless the caller
//! asked for termination.

use super::begin_trap;
use crate::context::{CrashSource, ExceptionFault, RawStr, RawStrList, Recorder};
use crate::machine::Machine;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

/// Bound on the caller-provided symbolic stack trace.
const MAX_CUSTOM_FRAMES: usize = 64;

/// Bound on the native backtrace captured alongside the report.
const NATIVE_BACKTRACE_LIMIT: usize = 100;

static ENABLED: AtomicBool = AtomicBool::new(false);

pub(crate) fn install(_recorder: &'static Recorder) -> anyhow::Result<()> {
    ENABLED.store(true, SeqCst);
    Ok(())
}

pub(crate) fn uninstall() {
    ENABLED.store(false, SeqCst);
}

/// Records a user-reported exception. With `terminate_program` the process
/// aborts after the report; otherwise the context is cleared and the world
/// resumes.
pub(crate) fn report(
    recorder: &Recorder,
    name: &str,
    reason: &str,
    line_of_code: &str,
    stack_trace: &[&str],
    terminate_program: bool,
) {
    if !ENABLED.load(SeqCst) {
        return;
    }
    let suspend = recorder.config.suspend_threads_for_user_reported();
    begin_trap(recorder, suspend);

    let machine = recorder.machine;
    // The borrowed frame list lives on this stack frame, which outlives
    // the whole handling window below.
    let mut frames = [RawStr::EMPTY; MAX_CUSTOM_FRAMES];
    let frame_count = stack_trace.len().min(MAX_CUSTOM_FRAMES);
    for (slot, text) in frames.iter_mut().zip(stack_trace) {
        *slot = RawStr::new(text);
    }

    // SAFETY: exclusive inside the handling window.
    let ctx = unsafe { recorder.context_mut() };
    ctx.source = Some(CrashSource::UserReported);
    ctx.offending_thread = machine.current_thread();
    ctx.registers_are_valid = false;
    ctx.backtrace_len = machine.backtrace(
        ctx.offending_thread,
        None,
        &mut ctx.backtrace[..NATIVE_BACKTRACE_LIMIT],
    );
    ctx.exception = ExceptionFault {
        name: RawStr::new(name),
        reason: RawStr::new(reason),
        line_of_code: RawStr::new(line_of_code),
        custom_frames: RawStrList::new(&frames[..frame_count]),
    };

    (recorder.on_crash)(recorder);

    if terminate_program {
        super::uninstall_all();
        super::resume_all_threads(recorder);
        std::process::abort();
    } else {
        recorder.end_handling_crash();
        super::resume_all_threads(recorder);
    }
}
