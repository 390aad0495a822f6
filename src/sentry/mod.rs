// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The crash sentries: one listener per crash source, all funneling into
//! the same handling protocol.
//!
//! Every trap routine follows the same opening sequence:
//!
//! 1. snapshot the `handling_crash` guard and claim the context,
//! 2. suspend every other non-reserved thread,
//! 3. if a handler was already running, mark the crash-during-crash state
//!    and tear down the async-safe sources so no third attempt happens,
//! 4. fill the source-specific fault fields, invoke the crash routing,
//!    tear down async-safe sources, resume threads, and let the source
//!    re-raise or reply as appropriate.
//!
//! Installation goes through a fixed table of (type, install, uninstall)
//! entries; there is no dynamic dispatch anywhere near the crash path.

pub mod deadlock;
pub mod foreign_exception;
pub mod mach_exception;
pub mod panic_hook;
pub mod signal;
pub mod user_reported;

use crate::context::Recorder;
use crate::machine::{Machine, ThreadHandle, MAX_THREADS};
use crate::CrashType;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};

pub(crate) struct SentryEntry {
    pub kind: CrashType,
    pub install: fn(&'static Recorder) -> anyhow::Result<()>,
    pub uninstall: fn(),
}

/// Fixed source table, in bit order. Install walks it top to bottom.
pub(crate) static SENTRY_TABLE: [SentryEntry; 6] = [
    SentryEntry {
        kind: CrashType::MACH_EXCEPTION,
        install: mach_exception::install,
        uninstall: mach_exception::uninstall,
    },
    SentryEntry {
        kind: CrashType::SIGNAL,
        install: signal::install,
        uninstall: signal::uninstall,
    },
    SentryEntry {
        kind: CrashType::FOREIGN_EXCEPTION,
        install: foreign_exception::install,
        uninstall: foreign_exception::uninstall,
    },
    SentryEntry {
        kind: CrashType::RUNTIME_EXCEPTION,
        install: panic_hook::install,
        uninstall: panic_hook::uninstall,
    },
    SentryEntry {
        kind: CrashType::MAIN_THREAD_DEADLOCK,
        install: deadlock::install,
        uninstall: deadlock::uninstall,
    },
    SentryEntry {
        kind: CrashType::USER_REPORTED,
        install: user_reported::install,
        uninstall: user_reported::uninstall,
    },
];

/// Installs the selected sources. A debugger masks out the sources that
/// interfere with it. Returns the subset that actually installed.
pub(crate) fn install_with_context(
    recorder: &'static Recorder,
    types: CrashType,
) -> CrashType {
    let mut requested = types;
    if recorder.machine.is_debugger_attached() && requested.intersects(CrashType::DEBUGGER_UNSAFE)
    {
        log::warn!(
            "debugger detected: disabling crash sources {:#04x}",
            (requested & CrashType::DEBUGGER_UNSAFE).bits()
        );
        requested = requested & !CrashType::DEBUGGER_UNSAFE;
    }

    let mut installed = CrashType::NONE;
    for entry in &SENTRY_TABLE {
        if requested.contains(entry.kind) {
            match (entry.install)(recorder) {
                Ok(()) => installed = installed | entry.kind,
                Err(e) => log::warn!("could not install {} sentry: {e:#}", entry.kind.name()),
            }
        } else {
            (entry.uninstall)();
        }
    }
    installed
}

pub(crate) fn uninstall_all() {
    for entry in &SENTRY_TABLE {
        (entry.uninstall)();
    }
}

/// Tears down the sources whose traps run in async-signal context. Called
/// on the crash path, so it must itself be async-signal-safe.
pub(crate) fn uninstall_async_safe() {
    mach_exception::uninstall();
    signal::uninstall();
}

// Thread-suspension state. `THREADS_ARE_RUNNING` makes suspend and resume
// idempotent; the suspended list preserves ordering so resume can run in
// reverse. Reserved handles (the mach handler threads) are never
// suspended and survive context clears.

static THREADS_ARE_RUNNING: AtomicBool = AtomicBool::new(true);

const MAX_RESERVED_THREADS: usize = 4;
static RESERVED_THREADS: [AtomicU64; MAX_RESERVED_THREADS] =
    [const { AtomicU64::new(0) }; MAX_RESERVED_THREADS];
static RESERVED_COUNT: AtomicUsize = AtomicUsize::new(0);

static SUSPENDED_THREADS: [AtomicU64; MAX_THREADS] = [const { AtomicU64::new(0) }; MAX_THREADS];
static SUSPENDED_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Pins a thread handle as never-suspendable. Installer-side only.
pub(crate) fn reserve_thread(thread: ThreadHandle) {
    let index = RESERVED_COUNT.fetch_add(1, SeqCst);
    if index < MAX_RESERVED_THREADS {
        RESERVED_THREADS[index].store(thread, SeqCst);
    }
}

pub(crate) fn clear_reserved_threads() {
    RESERVED_COUNT.store(0, SeqCst);
    for slot in &RESERVED_THREADS {
        slot.store(0, SeqCst);
    }
}

fn is_reserved(thread: ThreadHandle) -> bool {
    let count = RESERVED_COUNT.load(SeqCst).min(MAX_RESERVED_THREADS);
    RESERVED_THREADS[..count]
        .iter()
        .any(|slot| slot.load(SeqCst) == thread)
}

/// Stops every thread except the caller and the reserved set. Idempotent:
/// a second call while already suspended is a no-op.
pub(crate) fn suspend_all_threads(recorder: &Recorder) {
    if !THREADS_ARE_RUNNING.swap(false, SeqCst) {
        return;
    }
    let machine = recorder.machine;
    let current = machine.current_thread();
    let mut threads = [0 as ThreadHandle; MAX_THREADS];
    let count = machine.list_threads(&mut threads);
    let mut suspended = 0usize;
    for &thread in &threads[..count] {
        if thread == current || is_reserved(thread) {
            continue;
        }
        if machine.suspend_thread(thread) {
            SUSPENDED_THREADS[suspended].store(thread, SeqCst);
            suspended += 1;
        }
    }
    SUSPENDED_COUNT.store(suspended, SeqCst);
}

/// Resumes the suspended set in reverse order. Idempotent like suspend.
pub(crate) fn resume_all_threads(recorder: &Recorder) {
    if THREADS_ARE_RUNNING.swap(true, SeqCst) {
        return;
    }
    let count = SUSPENDED_COUNT.swap(0, SeqCst).min(MAX_THREADS);
    for slot in SUSPENDED_THREADS[..count].iter().rev() {
        let thread = slot.swap(0, SeqCst);
        if thread != 0 {
            recorder.machine.resume_thread(thread);
        }
    }
}

/// Protocol steps 1–3. Returns whether a handler was already running.
pub(crate) fn begin_trap(recorder: &Recorder, suspend: bool) -> bool {
    let was_handling = recorder.begin_handling_crash();
    if suspend {
        suspend_all_threads(recorder);
    }
    if was_handling {
        recorder.crashed_during_crash_handling.store(true, SeqCst);
        uninstall_async_safe();
    }
    was_handling
}

/// Protocol tail: tear down async-safe sources and restart the world.
pub(crate) fn finish_trap(recorder: &Recorder) {
    uninstall_async_safe();
    resume_all_threads(recorder);
}
