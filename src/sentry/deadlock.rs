// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Main-thread deadlock watchdog.
//!
//! A monitor thread posts a marker to the main thread through the machine
//! provider's run-on-main primitive, then sleeps for the configured
//! interval. If the marker is still unacknowledged when it wakes, the main
//! thread has not serviced its queue for the whole interval: the watchdog
//! synthesizes a crash on the main thread's handle and runs the common
//! protocol. Deadlock detection is terminal; a process whose main thread
//! is wedged is not coming back.

use super::{begin_trap, finish_trap};
use crate::context::{CrashSource, Recorder};
use crate::machine::Machine;
use std::ffi::c_void;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::time::Duration;

static AWAITING_RESPONSE: AtomicBool = AtomicBool::new(false);
static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static RUNNING: AtomicBool = AtomicBool::new(false);

extern "C" fn acknowledge(_context: *mut c_void) {
    AWAITING_RESPONSE.store(false, SeqCst);
}

pub(crate) fn install(recorder: &'static Recorder) -> anyhow::Result<()> {
    let machine = recorder.machine;
    // Configuring the watchdog from the thread it watches is refused: a
    // wedged configuration call would then look like the deadlock it is
    // supposed to detect.
    anyhow::ensure!(
        machine.current_thread() != machine.main_thread(),
        "deadlock watchdog cannot be configured from the watched main thread"
    );
    if RUNNING.swap(true, SeqCst) {
        return Ok(());
    }
    SHUTDOWN.store(false, SeqCst);
    let spawned = std::thread::Builder::new()
        .name("crash-recorder-watchdog".into())
        .spawn(move || monitor(recorder));
    if spawned.is_err() {
        RUNNING.store(false, SeqCst);
        anyhow::bail!("failed to spawn the watchdog thread");
    }
    Ok(())
}

/// Stops the monitor. The thread notices at its next wakeup; there is no
/// cancellation beyond that.
pub(crate) fn uninstall() {
    SHUTDOWN.store(true, SeqCst);
}

fn monitor(recorder: &'static Recorder) {
    loop {
        if SHUTDOWN.load(SeqCst) {
            RUNNING.store(false, SeqCst);
            return;
        }
        let interval = recorder.config.deadlock_interval();
        if !interval.is_finite() || interval <= 0.0 {
            // Disabled; idle until reconfigured.
            std::thread::sleep(Duration::from_millis(500));
            continue;
        }
        AWAITING_RESPONSE.store(true, SeqCst);
        if !recorder
            .machine
            .post_to_main_thread(acknowledge, std::ptr::null_mut())
        {
            // No main-thread dispatch on this platform.
            RUNNING.store(false, SeqCst);
            return;
        }
        std::thread::sleep(Duration::from_secs_f64(interval));
        if SHUTDOWN.load(SeqCst) {
            RUNNING.store(false, SeqCst);
            return;
        }
        if AWAITING_RESPONSE.load(SeqCst) {
            trap(recorder);
            RUNNING.store(false, SeqCst);
            return;
        }
    }
}

fn trap(recorder: &Recorder) {
    begin_trap(recorder, true);
    let machine = recorder.machine;
    // SAFETY: exclusive inside the handling window.
    let ctx = unsafe { recorder.context_mut() };
    ctx.source = Some(CrashSource::Deadlock);
    ctx.offending_thread = machine.main_thread();
    ctx.registers_are_valid = machine.thread_registers(ctx.offending_thread, &mut ctx.registers);

    (recorder.on_crash)(recorder);
    super::uninstall_all();
    finish_trap(recorder);
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    #[test]
    fn test_install_refused_on_main_thread() {
        let machine = leak(FakeMachine {
            current: 7,
            main: 7,
            ..Default::default()
        });
        let classifier = leak(FakeClassifier::default());
        let oracle = leak(FakeOracle::default());
        let harness = build_recorder(machine, classifier, oracle);
        assert!(install(harness.recorder).is_err());
    }

    #[test]
    fn test_responsive_main_thread_keeps_quiet() {
        let machine = leak(FakeMachine {
            current: 8,
            main: 7,
            main_responsive: true,
            ..Default::default()
        });
        let classifier = leak(FakeClassifier::default());
        let oracle = leak(FakeOracle::default());
        let harness = build_recorder(machine, classifier, oracle);
        harness.recorder.config.set_deadlock_interval(0.05);

        install(harness.recorder).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        uninstall();
        std::thread::sleep(Duration::from_millis(200));
        // The monitor exited without synthesizing a crash (a synthesized
        // one would have aborted the test process).
        assert!(!RUNNING.load(SeqCst));
    }
}
