// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The public control surface: installation, configuration setters,
//! lifecycle notifications, and the user-reported crash entry point.
//!
//! `install` builds the process-wide [`Recorder`], publishes it through a
//! single atomic pointer, and wires the sentries to the internal crash
//! routing. Reinstallation builds a fresh recorder (carrying the runtime
//! settings over) and republishes; the previous one is intentionally
//! leaked, since an in-flight trap may still hold a borrow.

use crate::codec;
use crate::context::{Configuration, OnCrashNotify, Recorder};
use crate::introspect::{DeallocOracle, ObjectClassifier, INERT_CLASSIFIER, INERT_ORACLE};
use crate::machine::{Machine, NATIVE_MACHINE};
use crate::report;
use crate::sentry;
use crate::state::CrashState;
use crate::CrashType;
use anyhow::Context;
use std::ffi::CString;
use std::path::Path;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::SeqCst;
use uuid::Uuid;

static RECORDER: AtomicPtr<Recorder> = AtomicPtr::new(ptr::null_mut());

/// The published recorder, if any. This is the one root the crash path
/// reads; the borrow is 'static because the recorder is never freed.
pub(crate) fn installed_recorder() -> Option<&'static Recorder> {
    let recorder = RECORDER.load(SeqCst);
    if recorder.is_null() {
        None
    } else {
        // SAFETY: published via Box::leak and never dropped.
        Some(unsafe { &*recorder })
    }
}

fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn path_to_cstring(path: &Path) -> anyhow::Result<CString> {
    CString::new(path.as_os_str().as_encoded_bytes())
        .context("path contains an interior NUL byte")
}

/// Internal crash routing, pinned into every recorder at construction.
/// Runs on the handling thread with the rest of the process suspended.
fn handle_crash(recorder: &Recorder) {
    recorder.state.notify_app_crash();
    report::prepare(recorder);
    if recorder.config.print_trace_to_stdout() {
        report::print_trace(recorder);
    }
    if recorder.crashed_during_crash_handling.load(SeqCst) {
        // The recorder itself faulted while recording: keep this attempt
        // minimal and aimed at the recrash path.
        let _ = report::write_recrash_report(recorder, &recorder.config.recrash_report_path);
    } else {
        let _ = report::write_standard_report(recorder, &recorder.config.crash_report_path);
    }
}

/// Installs the recorder. Returns the crash sources actually armed (a
/// debugger or platform limits may shrink the requested set).
///
/// Idempotent: calling again is a re-installation — paths and crash id are
/// replaced, runtime settings carry over, sentries are re-evaluated.
pub fn install(
    crash_report_path: &Path,
    recrash_report_path: &Path,
    state_file_path: &Path,
    crash_id: &str,
) -> anyhow::Result<CrashType> {
    install_with_providers(
        crash_report_path,
        recrash_report_path,
        state_file_path,
        crash_id,
        CrashType::PRODUCTION_SAFE,
        &NATIVE_MACHINE,
        &INERT_CLASSIFIER,
        &INERT_ORACLE,
    )
}

/// Re-installation alias; see [`install`].
pub fn reinstall(
    crash_report_path: &Path,
    recrash_report_path: &Path,
    state_file_path: &Path,
    crash_id: &str,
) -> anyhow::Result<()> {
    install(crash_report_path, recrash_report_path, state_file_path, crash_id).map(|_| ())
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn install_with_providers(
    crash_report_path: &Path,
    recrash_report_path: &Path,
    state_file_path: &Path,
    crash_id: &str,
    types: CrashType,
    machine: &'static dyn Machine,
    classifier: &'static dyn ObjectClassifier,
    oracle: &'static dyn DeallocOracle,
) -> anyhow::Result<CrashType> {
    let crash_id = Uuid::parse_str(crash_id).unwrap_or_else(|_| {
        log::warn!("crash id is not a UUID; generating one");
        Uuid::new_v4()
    });
    let state = CrashState::init(state_file_path)?;
    let config = Configuration::new(
        path_to_cstring(crash_report_path)?,
        path_to_cstring(recrash_report_path)?,
        *crash_id.as_bytes(),
        process_name(),
    );

    let requested = match installed_recorder() {
        Some(previous) => {
            config.adopt_runtime_settings(&previous.config);
            // A previously narrowed set stays narrowed across reinstall.
            previous.config.enabled_types()
        }
        None => types,
    };
    config.set_enabled_types(requested);

    let recorder: &'static Recorder = Box::leak(Box::new(Recorder::new(
        config,
        state,
        machine,
        classifier,
        oracle,
        handle_crash,
    )));
    // Publish before arming any sentry so a trap never sees a stale root.
    // The previous recorder leaks by design.
    RECORDER.store(recorder as *const Recorder as *mut Recorder, SeqCst);

    let installed = sentry::install_with_context(recorder, requested);
    recorder.config.set_enabled_types(installed);
    log::info!(
        "crash recorder installed (sources {:#04x})",
        installed.bits()
    );
    Ok(installed)
}

fn with_recorder<R>(operation: &str, f: impl FnOnce(&'static Recorder) -> R) -> Option<R> {
    match installed_recorder() {
        Some(recorder) => Some(f(recorder)),
        None => {
            log::warn!("{operation} ignored: crash recorder is not installed");
            None
        }
    }
}

/// Re-evaluates the sentry set. Returns the sources now armed.
pub fn set_handling_crash_types(types: CrashType) -> CrashType {
    with_recorder("set_handling_crash_types", |recorder| {
        let installed = sentry::install_with_context(recorder, types);
        recorder.config.set_enabled_types(installed);
        installed
    })
    .unwrap_or(CrashType::NONE)
}

/// Stores the pre-serialized user document embedded verbatim in reports.
/// Invalid JSON is kept (the writer substitutes an error object for it)
/// but flagged here, where the developer can still fix it.
pub fn set_user_info_json(json: Option<&str>) {
    if let Some(text) = json {
        if let Err(e) = codec::validate_document(text.as_bytes()) {
            log::warn!("user info document is not valid JSON ({e}); it will be quoted as-is");
        }
    }
    with_recorder("set_user_info_json", |recorder| {
        recorder
            .config
            .set_user_info_json(json.map(str::to_string));
    });
}

/// Stores the system-info document embedded verbatim in reports.
pub fn set_system_info_json(json: Option<&str>) {
    if let Some(text) = json {
        if let Err(e) = codec::validate_document(text.as_bytes()) {
            log::warn!("system info document is not valid JSON ({e}); it will be quoted as-is");
        }
    }
    with_recorder("set_system_info_json", |recorder| {
        recorder
            .config
            .set_system_info_json(json.map(str::to_string));
    });
}

/// Sizes the zombie cache of the external deallocation tracker. Stored in
/// the configuration for that collaborator to read.
pub fn set_zombie_cache_size(size: usize) {
    with_recorder("set_zombie_cache_size", |recorder| {
        recorder.config.set_zombie_cache_size(size);
    });
}

/// Watchdog probe interval, seconds. Zero or negative disables probing.
pub fn set_deadlock_watchdog_interval(seconds: f64) {
    with_recorder("set_deadlock_watchdog_interval", |recorder| {
        recorder.config.set_deadlock_interval(seconds);
    });
}

pub fn set_print_trace_to_stdout(enabled: bool) {
    with_recorder("set_print_trace_to_stdout", |recorder| {
        recorder.config.set_print_trace_to_stdout(enabled);
    });
}

pub fn set_search_thread_names(enabled: bool) {
    with_recorder("set_search_thread_names", |recorder| {
        recorder.config.set_search_thread_names(enabled);
    });
}

pub fn set_search_queue_names(enabled: bool) {
    with_recorder("set_search_queue_names", |recorder| {
        recorder.config.set_search_queue_names(enabled);
    });
}

pub fn set_introspect_memory(enabled: bool) {
    with_recorder("set_introspect_memory", |recorder| {
        recorder.config.set_introspect_memory(enabled);
    });
}

/// Classes that must never be deeply introspected (their instances appear
/// in reports as a bare class name).
pub fn set_do_not_introspect_classes(class_names: &[&str]) {
    with_recorder("set_do_not_introspect_classes", |recorder| {
        recorder
            .config
            .set_restricted_classes(class_names.iter().map(|s| s.to_string()).collect());
    });
}

pub fn set_suspend_threads_for_user_reported(enabled: bool) {
    with_recorder("set_suspend_threads_for_user_reported", |recorder| {
        recorder.config.set_suspend_threads_for_user_reported(enabled);
    });
}

/// The callback appended to standard reports as `user_atcrash`.
pub fn set_on_crash_notify(callback: Option<OnCrashNotify>) {
    with_recorder("set_on_crash_notify", |recorder| {
        recorder.config.set_on_crash_notify(callback);
    });
}

/// Reports an application-defined exception. See the user-reported sentry
/// for the termination semantics.
pub fn report_user_exception(
    name: &str,
    reason: &str,
    line_of_code: &str,
    stack_trace: &[&str],
    terminate_program: bool,
) {
    with_recorder("report_user_exception", |recorder| {
        sentry::user_reported::report(
            recorder,
            name,
            reason,
            line_of_code,
            stack_trace,
            terminate_program,
        );
    });
}

// Lifecycle hooks, forwarded to the persistent state.

pub fn notify_app_active(active: bool) {
    with_recorder("notify_app_active", |recorder| {
        recorder.state.notify_app_active(active);
    });
}

pub fn notify_app_in_foreground(in_foreground: bool) {
    with_recorder("notify_app_in_foreground", |recorder| {
        recorder.state.notify_app_in_foreground(in_foreground);
    });
}

pub fn notify_app_terminate() {
    with_recorder("notify_app_terminate", |recorder| {
        recorder.state.notify_app_terminate();
    });
}

pub fn notify_app_crash() {
    with_recorder("notify_app_crash", |recorder| {
        recorder.state.notify_app_crash();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CrashSource, RawStr};
    use crate::sentry::{begin_trap, resume_all_threads};
    use crate::test_support::*;
    use serde_json::Value;

    // All of these manipulate the global recorder pointer and the global
    // suspension state.
    use crate::test_support::GLOBAL_TEST_LOCK as TEST_LOCK;

    struct Paths {
        crash: std::path::PathBuf,
        recrash: std::path::PathBuf,
        state: std::path::PathBuf,
    }

    fn install_fake(machine: &'static FakeMachine) -> Paths {
        let dir = leak(tempfile::tempdir().unwrap());
        let paths = Paths {
            crash: dir.path().join("crash.json"),
            recrash: dir.path().join("recrash.json"),
            state: dir.path().join("state.json"),
        };
        let classifier = leak(FakeClassifier::default());
        let oracle = leak(FakeOracle::default());
        install_with_providers(
            &paths.crash,
            &paths.recrash,
            &paths.state,
            "1d6b97cb-968c-40c9-af6e-e4b4d71e8781",
            CrashType::USER_REPORTED,
            machine,
            classifier,
            oracle,
        )
        .unwrap();
        paths
    }

    fn worker_machine() -> FakeMachine {
        FakeMachine {
            current: 21,
            main: 20,
            threads: vec![20, 21],
            backtraces: vec![(21, vec![0x4000_1000, 0x4000_2000])],
            ..Default::default()
        }
    }

    fn fill_signal_fault(recorder: &Recorder) {
        // SAFETY: the test owns the handling window it opened.
        let ctx = unsafe { recorder.context_mut() };
        ctx.source = Some(CrashSource::Signal);
        ctx.offending_thread = 21;
        ctx.signal.signum = libc::SIGSEGV;
        ctx.signal.code = 1;
        ctx.fault_address = 0xDEAD_BEEF;
    }

    #[test]
    fn test_install_returns_enabled_subset() {
        let _guard = TEST_LOCK.lock().unwrap();
        let machine = leak(worker_machine());
        let _paths = install_fake(machine);
        let recorder = installed_recorder().unwrap();
        assert_eq!(recorder.config.enabled_types(), CrashType::USER_REPORTED);
    }

    #[test]
    fn test_user_reported_end_to_end() {
        let _guard = TEST_LOCK.lock().unwrap();
        let machine = leak(worker_machine());
        let paths = install_fake(machine);

        report_user_exception("X", "why", "file:10", &["frame0", "frame1"], false);

        // The process is still here, the guard is released, and the report
        // landed at the configured path.
        let recorder = installed_recorder().unwrap();
        assert!(!recorder.handling_crash.load(SeqCst));
        let doc: Value = serde_json::from_slice(&std::fs::read(&paths.crash).unwrap()).unwrap();
        let error = &doc["report"]["crash"]["error"];
        assert_eq!(error["type"], "user");
        assert_eq!(error["user_reported"]["name"], "X");
        assert_eq!(error["user_reported"]["line_of_code"], "file:10");
        assert_eq!(
            error["user_reported"]["backtrace"],
            serde_json::json!(["frame0", "frame1"])
        );
        assert_eq!(error["reason"], "why");
        // State recorded the crash and persisted it.
        assert!(recorder.state.crashed_this_launch());
    }

    #[test]
    fn test_crash_during_crash_writes_recrash_file() {
        let _guard = TEST_LOCK.lock().unwrap();
        let machine = leak(worker_machine());
        let paths = install_fake(machine);
        let recorder = installed_recorder().unwrap();

        // First crash: the sentry protocol runs the routing normally.
        assert!(!begin_trap(recorder, true));
        fill_signal_fault(recorder);
        (recorder.on_crash)(recorder);

        // The routing (our callback surrogate) faults before finishing:
        // a second trap fires while handling_crash is still set.
        assert!(begin_trap(recorder, true));
        fill_signal_fault(recorder);
        (recorder.on_crash)(recorder);
        recorder.end_handling_crash();
        resume_all_threads(recorder);

        let crash: Value = serde_json::from_slice(&std::fs::read(&paths.crash).unwrap()).unwrap();
        assert_eq!(crash["report"]["report"]["type"], "standard");

        let recrash: Value =
            serde_json::from_slice(&std::fs::read(&paths.recrash).unwrap()).unwrap();
        assert_eq!(recrash["report"]["report"]["type"], "minimal");
        assert_eq!(recrash["report"]["report"]["incomplete"], true);
        // The recrash error reflects the original source.
        assert_eq!(recrash["report"]["crash"]["error"]["type"], "signal");
        assert_eq!(
            recrash["report"]["crash"]["error"]["address"].as_u64(),
            Some(0xDEAD_BEEF)
        );
    }

    #[test]
    fn test_setters_round_trip() {
        let _guard = TEST_LOCK.lock().unwrap();
        let machine = leak(worker_machine());
        let _paths = install_fake(machine);
        let recorder = installed_recorder().unwrap();

        set_print_trace_to_stdout(true);
        assert!(recorder.config.print_trace_to_stdout());
        set_search_thread_names(true);
        assert!(recorder.config.search_thread_names());
        set_search_queue_names(true);
        assert!(recorder.config.search_queue_names());
        set_introspect_memory(false);
        assert!(!recorder.config.introspect_memory());
        set_suspend_threads_for_user_reported(false);
        assert!(!recorder.config.suspend_threads_for_user_reported());
        set_deadlock_watchdog_interval(2.5);
        assert_eq!(recorder.config.deadlock_interval(), 2.5);
        set_zombie_cache_size(16384);
        assert_eq!(recorder.config.zombie_cache_size(), 16384);
        set_do_not_introspect_classes(&["Secret", "Vault"]);
        assert_eq!(recorder.config.restricted_classes(), ["Secret", "Vault"]);
        set_user_info_json(Some("{\"plan\": \"pro\"}"));
        assert_eq!(recorder.config.user_info_json(), Some("{\"plan\": \"pro\"}"));
    }

    #[test]
    fn test_reinstall_carries_runtime_settings() {
        let _guard = TEST_LOCK.lock().unwrap();
        let machine = leak(worker_machine());
        let _paths = install_fake(machine);
        set_print_trace_to_stdout(true);
        set_do_not_introspect_classes(&["Secret"]);
        set_user_info_json(Some("{\"plan\": \"pro\"}"));

        // Reinstall with fresh paths: settings survive, paths replace.
        let paths2 = install_fake(machine);
        let recorder = installed_recorder().unwrap();
        assert!(recorder.config.print_trace_to_stdout());
        assert_eq!(recorder.config.restricted_classes(), ["Secret"]);
        assert_eq!(recorder.config.user_info_json(), Some("{\"plan\": \"pro\"}"));
        assert!(recorder
            .config
            .crash_report_path
            .to_str()
            .unwrap()
            .contains(paths2.crash.parent().unwrap().to_str().unwrap()));
    }

    #[test]
    fn test_lifecycle_hooks_reach_state() {
        let _guard = TEST_LOCK.lock().unwrap();
        let machine = leak(worker_machine());
        let _paths = install_fake(machine);
        let recorder = installed_recorder().unwrap();

        let sessions = recorder.state.sessions_since_launch();
        notify_app_in_foreground(false);
        notify_app_in_foreground(true);
        assert_eq!(recorder.state.sessions_since_launch(), sessions + 1);
        notify_app_active(true);
        assert!(recorder.state.application_is_active());
        notify_app_terminate();
    }

    #[test]
    fn test_user_exception_reason_raw_str() {
        // RawStr round-trips the borrowed payload strings the sentries
        // smuggle across the handler boundary.
        let reason = String::from("detached");
        let raw = RawStr::new(&reason);
        // SAFETY: reason is alive.
        let seen: Option<&str> = unsafe { raw.as_str() };
        assert_eq!(seen, Some("detached"));
    }
}
