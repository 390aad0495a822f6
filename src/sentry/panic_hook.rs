// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Language-runtime exception sentry: the process-wide panic hook.
//!
//! Panics are not delivered in async-signal context, so this trap may
//! format the message and capture its own backtrace with ordinary code
//! before entering the common protocol. It is non-recoverable: once this
//! sentry is enabled, any panic that reaches the hook records a report,
//! chains the previous hook, and aborts the process. Applications that
//! lean on `catch_unwind` for control flow should leave this source
//! disabled.

use super::{begin_trap, finish_trap};
use crate::context::{CrashSource, RawStr};
use crate::machine::Machine;
use crate::CrashType;
use std::panic::{self, PanicHookInfo};
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::SeqCst;

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync>;

static PREVIOUS_HOOK: AtomicPtr<PanicHook> = AtomicPtr::new(ptr::null_mut());

fn format_reason(info: &PanicHookInfo<'_>) -> String {
    let message = if let Some(&s) = info.payload().downcast_ref::<&str>() {
        s
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    };
    match info.location() {
        Some(location) => format!(
            "{message} ({}:{}:{})",
            location.file(),
            location.line(),
            location.column()
        ),
        None => message.to_string(),
    }
}

pub(crate) fn install(_recorder: &'static crate::context::Recorder) -> anyhow::Result<()> {
    // Register only once; the chain stays intact across reinstalls.
    if !PREVIOUS_HOOK.load(SeqCst).is_null() {
        return Ok(());
    }
    let previous = Box::into_raw(Box::new(panic::take_hook()));
    PREVIOUS_HOOK.store(previous, SeqCst);
    panic::set_hook(Box::new(|info| {
        trap(info);
    }));
    Ok(())
}

pub(crate) fn uninstall() {
    let previous = PREVIOUS_HOOK.swap(ptr::null_mut(), SeqCst);
    if !previous.is_null() {
        // SAFETY: the pointer can only come from Box::into_raw in install.
        let previous = unsafe { Box::from_raw(previous) };
        panic::set_hook(*previous);
    }
}

fn call_previous_hook(info: &PanicHookInfo<'_>) {
    let previous = PREVIOUS_HOOK.load(SeqCst);
    if !previous.is_null() {
        // SAFETY: borrowed without taking ownership; install keeps the
        // allocation alive for the process lifetime.
        unsafe { (*previous)(info) };
    }
}

fn trap(info: &PanicHookInfo<'_>) {
    let Some(recorder) = crate::api::installed_recorder() else {
        call_previous_hook(info);
        return;
    };
    if !recorder
        .config
        .enabled_types()
        .contains(CrashType::RUNTIME_EXCEPTION)
    {
        call_previous_hook(info);
        return;
    }

    // Format before suspending anything; this allocates.
    let reason = format_reason(info);

    begin_trap(recorder, true);
    let machine = recorder.machine;
    // SAFETY: exclusive inside the handling window.
    let ctx = unsafe { recorder.context_mut() };
    ctx.source = Some(CrashSource::RuntimeException);
    ctx.offending_thread = machine.current_thread();
    ctx.registers_are_valid = false;
    ctx.exception.name = RawStr::new("panic");
    ctx.exception.reason = RawStr::new(&reason);
    ctx.backtrace_len = machine.backtrace(ctx.offending_thread, None, &mut ctx.backtrace);

    (recorder.on_crash)(recorder);
    super::uninstall_all();
    finish_trap(recorder);

    call_previous_hook(info);
    // Non-recoverable by contract.
    std::process::abort();
}
