// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Foreign-exception sentry.
//!
//! An uncaught C++ exception cannot be observed from Rust directly; the
//! embedding layer installs a small `std::set_terminate` bridge that calls
//! [`report_foreign_exception`] with the exception's type name and message
//! before the runtime kills the process. This module owns the enable gate
//! and the trap routine; like the runtime-exception sentry, the trap is
//! terminal.

use super::{begin_trap, finish_trap};
use crate::context::{CrashSource, RawStr, Recorder};
use crate::machine::Machine;
use std::ffi::{c_char, CStr};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

static ENABLED: AtomicBool = AtomicBool::new(false);

pub(crate) fn install(_recorder: &'static Recorder) -> anyhow::Result<()> {
    ENABLED.store(true, SeqCst);
    Ok(())
}

pub(crate) fn uninstall() {
    ENABLED.store(false, SeqCst);
}

/// Entry point for the embedder's terminate bridge. Never returns: after
/// the report is recorded (or skipped because the source is disabled), the
/// process aborts the way the foreign runtime was about to anyway.
///
/// # Safety
///
/// `name` and `reason` must be NUL-terminated strings or null.
#[no_mangle]
pub unsafe extern "C" fn report_foreign_exception(
    name: *const c_char,
    reason: *const c_char,
) -> ! {
    let name = if name.is_null() {
        ""
    } else {
        CStr::from_ptr(name).to_str().unwrap_or("")
    };
    let reason = if reason.is_null() {
        ""
    } else {
        CStr::from_ptr(reason).to_str().unwrap_or("")
    };
    trap(name, reason);
    std::process::abort();
}

fn trap(name: &str, reason: &str) {
    if !ENABLED.load(SeqCst) {
        return;
    }
    let Some(recorder) = crate::api::installed_recorder() else {
        return;
    };

    begin_trap(recorder, true);
    let machine = recorder.machine;
    // SAFETY: exclusive inside the handling window.
    let ctx = unsafe { recorder.context_mut() };
    ctx.source = Some(CrashSource::ForeignException);
    ctx.offending_thread = machine.current_thread();
    ctx.registers_are_valid = false;
    ctx.exception.name = RawStr::new(name);
    ctx.exception.reason = RawStr::new(reason);
    ctx.backtrace_len = machine.backtrace(ctx.offending_thread, None, &mut ctx.backtrace);

    (recorder.on_crash)(recorder);
    super::uninstall_all();
    finish_trap(recorder);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_gate() {
        uninstall();
        assert!(!ENABLED.load(SeqCst));
        let machine = crate::test_support::leak(crate::test_support::FakeMachine::default());
        let classifier = crate::test_support::leak(crate::test_support::FakeClassifier::default());
        let oracle = crate::test_support::leak(crate::test_support::FakeOracle::default());
        let harness = crate::test_support::build_recorder(machine, classifier, oracle);
        install(harness.recorder).unwrap();
        assert!(ENABLED.load(SeqCst));
        uninstall();
        assert!(!ENABLED.load(SeqCst));
    }
}
