// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fatal-signal sentry.
//!
//! Registers handlers for the fatal set on an alternate stack, records the
//! crash, then restores the original handlers and re-raises so the process
//! dies with the status the signal would have produced anyway.

use super::{begin_trap, finish_trap};
use crate::context::{CrashSource, Recorder};
use crate::machine::{Machine, RegisterSet};
use libc::{
    c_void, mmap, sigaltstack, siginfo_t, ucontext_t, MAP_ANON, MAP_FAILED, MAP_PRIVATE,
    PROT_NONE, PROT_READ, PROT_WRITE, SIGSTKSZ,
};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, Signal};
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

/// The platform's fatal-signal set.
const FATAL_SIGNALS: [Signal; 8] = [
    Signal::SIGABRT,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGPIPE,
    Signal::SIGSEGV,
    Signal::SIGSYS,
    Signal::SIGTRAP,
];

// Highest signal number we store a previous action for.
const MAX_SIGNALS: usize = 65;

struct ActionSlot(UnsafeCell<Option<(Signal, SigAction)>>);

// SAFETY: slots are only written under the INSTALLED transition (install
// and uninstall are not called concurrently with each other by contract),
// and only read by the trap after installation finished.
unsafe impl Sync for ActionSlot {}

static PREVIOUS_ACTIONS: [ActionSlot; MAX_SIGNALS] =
    [const { ActionSlot(UnsafeCell::new(None)) }; MAX_SIGNALS];
static INSTALLED: AtomicBool = AtomicBool::new(false);
static ALT_STACK_READY: AtomicBool = AtomicBool::new(false);

/// Registers the fatal-signal handlers. If any single registration fails,
/// everything registered so far is rolled back and the error reported.
pub(crate) fn install(_recorder: &'static Recorder) -> anyhow::Result<()> {
    if INSTALLED.swap(true, SeqCst) {
        return Ok(());
    }
    if !ALT_STACK_READY.load(SeqCst) {
        // SAFETY: no documented preconditions.
        unsafe { create_alt_stack()? };
        ALT_STACK_READY.store(true, SeqCst);
    }

    let action = SigAction::new(
        SigHandler::SigAction(trap),
        SaFlags::SA_NODEFER | SaFlags::SA_ONSTACK,
        signal::SigSet::empty(),
    );

    for (index, &sig) in FATAL_SIGNALS.iter().enumerate() {
        // SAFETY: handler and flags are valid for the process lifetime.
        match unsafe { signal::sigaction(sig, &action) } {
            Ok(previous) => {
                // SAFETY: see ActionSlot.
                unsafe { *PREVIOUS_ACTIONS[sig as usize].0.get() = Some((sig, previous)) };
            }
            Err(e) => {
                // Roll back what we managed to register.
                for &done in &FATAL_SIGNALS[..index] {
                    restore_action(done);
                }
                INSTALLED.store(false, SeqCst);
                anyhow::bail!("sigaction({sig}) failed: {e}");
            }
        }
    }
    Ok(())
}

/// Restores the original handlers. Async-signal-safe; called both from the
/// control surface and from the crash path.
pub(crate) fn uninstall() {
    if !INSTALLED.swap(false, SeqCst) {
        return;
    }
    for &sig in &FATAL_SIGNALS {
        restore_action(sig);
    }
}

fn restore_action(sig: Signal) {
    // SAFETY: see ActionSlot; taking the slot makes restoration one-shot.
    if let Some((signal, action)) = unsafe { (*PREVIOUS_ACTIONS[sig as usize].0.get()).take() } {
        // SAFETY: the action was produced by a successful sigaction call.
        let _ = unsafe { signal::sigaction(signal, &action) };
    }
}

/// Allocates a guarded alternate signal stack so stack-overflow faults can
/// still run the handler. Sized at the larger of SIGSTKSZ and 16 pages.
unsafe fn create_alt_stack() -> anyhow::Result<()> {
    let page = page_size::get();
    let stack_size = std::cmp::max(SIGSTKSZ, 16 * page);
    let base = mmap(
        ptr::null_mut(),
        stack_size + page,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANON,
        -1,
        0,
    );
    anyhow::ensure!(base != MAP_FAILED, "failed to allocate the alternate stack");
    let guard = libc::mprotect(base, page, PROT_NONE);
    anyhow::ensure!(guard == 0, "failed to protect the alternate stack guard page");

    let stack = libc::stack_t {
        ss_sp: base.add(page),
        ss_flags: 0,
        ss_size: stack_size,
    };
    let rval = sigaltstack(&stack, ptr::null_mut());
    anyhow::ensure!(rval == 0, "sigaltstack failed ({rval})");
    Ok(())
}

/// The fault addresses of these signals are meaningful; others carry
/// garbage in si_addr.
fn signal_faults_address(signum: i32) -> bool {
    matches!(
        signum,
        libc::SIGILL | libc::SIGFPE | libc::SIGSEGV | libc::SIGBUS | libc::SIGTRAP
    )
}

extern "C" fn trap(signum: i32, info: *mut siginfo_t, ucontext: *mut c_void) {
    let Some(recorder) = crate::api::installed_recorder() else {
        return;
    };
    begin_trap(recorder, true);

    // SAFETY: context access is exclusive inside the handling window.
    let ctx = unsafe { recorder.context_mut() };
    ctx.source = Some(CrashSource::Signal);
    ctx.offending_thread = recorder.machine.current_thread();
    ctx.signal.signum = signum;
    if !info.is_null() {
        // SAFETY: the kernel handed us a valid siginfo.
        ctx.signal.code = unsafe { (*info).si_code };
        if signal_faults_address(signum) {
            // SAFETY: as above.
            ctx.fault_address = unsafe { (*info).si_addr() } as u64;
        }
    }
    // SAFETY: ucontext comes straight from the kernel.
    if let Some(registers) = unsafe { RegisterSet::from_ucontext(ucontext as *const ucontext_t) }
    {
        ctx.registers = registers;
        ctx.registers_are_valid = true;
    }

    (recorder.on_crash)(recorder);
    finish_trap(recorder);

    // The original disposition is back in place (finish_trap tore down the
    // async-safe sources); re-raise so the process exits with the right
    // status.
    // SAFETY: raising a fatal signal with default handling restored.
    unsafe { libc::raise(signum) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_set_matches_platform() {
        assert_eq!(FATAL_SIGNALS.len(), 8);
        assert!((Signal::SIGSEGV as usize) < MAX_SIGNALS);
        assert!((Signal::SIGSYS as usize) < MAX_SIGNALS);
    }

    #[test]
    fn test_signal_faults_address() {
        assert!(signal_faults_address(libc::SIGSEGV));
        assert!(signal_faults_address(libc::SIGBUS));
        assert!(!signal_faults_address(libc::SIGABRT));
        assert!(!signal_faults_address(libc::SIGPIPE));
    }

    #[test]
    fn test_install_uninstall_round_trip() {
        // Install and immediately uninstall; the process's dispositions
        // must come back unchanged.
        let machine = crate::test_support::leak(crate::test_support::FakeMachine::default());
        let classifier = crate::test_support::leak(crate::test_support::FakeClassifier::default());
        let oracle = crate::test_support::leak(crate::test_support::FakeOracle::default());
        let harness = crate::test_support::build_recorder(machine, classifier, oracle);

        install(harness.recorder).unwrap();
        assert!(INSTALLED.load(SeqCst));
        // Idempotent double install.
        install(harness.recorder).unwrap();
        uninstall();
        assert!(!INSTALLED.load(SeqCst));
        // Idempotent double uninstall.
        uninstall();

        // After uninstall the previous action slots are drained.
        for &sig in &FATAL_SIGNALS {
            // SAFETY: nothing else touches the slots here.
            assert!(unsafe { (*PREVIOUS_ACTIONS[sig as usize].0.get()).is_none() });
        }
    }
}
