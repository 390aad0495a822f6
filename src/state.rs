// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-launch and per-crash-interval session accounting, persisted across
//! launches.
//!
//! Every field is an atomic so the crash path can read and update the state
//! without locks. Loading happens at init time with ordinary file I/O and
//! serde; saving is a fixed-size streaming encode plus a single
//! `open`/`write`/`close`, because the most important save of all runs
//! inside a crash handler.

use crate::codec::{BufferSink, JsonEncoder, JsonError};
use serde::Deserialize;
use std::ffi::CString;
use std::path::Path;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};
use thiserror::Error;

/// On-disk format version.
const STATE_FILE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file path is not a valid C string")]
    BadPath,
    #[error("failed to encode state: {0}")]
    Encode(#[from] JsonError),
    #[error("failed to open state file (errno {0})")]
    Open(i32),
    #[error("failed to write state file (errno {0})")]
    Write(i32),
}

/// Monotonic seconds, async-signal-safe.
///
/// Uses the clock that keeps counting the way the host platform's crash
/// tooling expects: uptime-raw on Darwin, plain monotonic elsewhere.
pub(crate) fn monotonic_seconds() -> f64 {
    #[cfg(target_os = "macos")]
    const CLOCK: libc::clockid_t = libc::CLOCK_UPTIME_RAW;
    #[cfg(not(target_os = "macos"))]
    const CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;

    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer; clock_gettime is async-signal-safe.
    unsafe { libc::clock_gettime(CLOCK, &mut ts) };
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
}

/// Serde view of the state file. Unknown fields are ignored by default and
/// absent fields fall back to zero, so old or partially written files load.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StateFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(rename = "crashedLastLaunch")]
    crashed_last_launch: bool,
    #[serde(rename = "activeDurationSinceLastCrash")]
    active_duration_since_last_crash: f64,
    #[serde(rename = "backgroundDurationSinceLastCrash")]
    background_duration_since_last_crash: f64,
    #[serde(rename = "launchesSinceLastCrash")]
    launches_since_last_crash: u32,
    #[serde(rename = "sessionsSinceLastCrash")]
    sessions_since_last_crash: u32,
}

/// Live session state. All mutation goes through the lifecycle
/// notifications; readers (the report writer) take snapshots through the
/// accessors.
pub struct CrashState {
    path: CString,

    crashed_last_launch: AtomicBool,
    crashed_this_launch: AtomicBool,
    application_is_active: AtomicBool,
    application_is_in_foreground: AtomicBool,

    launches_since_last_crash: AtomicU32,
    sessions_since_last_crash: AtomicU32,
    sessions_since_launch: AtomicU32,

    // f64 seconds stored as bits.
    active_duration_since_launch: AtomicU64,
    active_duration_since_last_crash: AtomicU64,
    background_duration_since_launch: AtomicU64,
    background_duration_since_last_crash: AtomicU64,
    app_state_transition_time: AtomicU64,
    app_launch_time: AtomicU64,
}

fn load_f64(slot: &AtomicU64) -> f64 {
    f64::from_bits(slot.load(SeqCst))
}

fn store_f64(slot: &AtomicU64, value: f64) {
    slot.store(value.to_bits(), SeqCst);
}

fn add_f64(slot: &AtomicU64, delta: f64) {
    store_f64(slot, load_f64(slot) + delta);
}

impl CrashState {
    /// Loads (or initializes) the state from `path` and applies the launch
    /// transition: a fresh session, per-launch counters reset, the
    /// per-crash-interval window reset if the previous launch crashed, and
    /// the launch/session counters bumped. Persists the result.
    pub fn init(path: &Path) -> anyhow::Result<CrashState> {
        let loaded = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice::<StateFile>(&bytes).unwrap_or_else(|e| {
                log::warn!("discarding unreadable crash state file: {e}");
                StateFile::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateFile::default(),
            Err(e) => return Err(e.into()),
        };

        let c_path = CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| StateError::BadPath)?;
        let now = monotonic_seconds();

        let state = CrashState {
            path: c_path,
            crashed_last_launch: AtomicBool::new(loaded.crashed_last_launch),
            crashed_this_launch: AtomicBool::new(false),
            application_is_active: AtomicBool::new(false),
            application_is_in_foreground: AtomicBool::new(true),
            launches_since_last_crash: AtomicU32::new(loaded.launches_since_last_crash),
            sessions_since_last_crash: AtomicU32::new(loaded.sessions_since_last_crash),
            sessions_since_launch: AtomicU32::new(1),
            active_duration_since_launch: AtomicU64::new(0f64.to_bits()),
            active_duration_since_last_crash: AtomicU64::new(
                loaded.active_duration_since_last_crash.to_bits(),
            ),
            background_duration_since_launch: AtomicU64::new(0f64.to_bits()),
            background_duration_since_last_crash: AtomicU64::new(
                loaded.background_duration_since_last_crash.to_bits(),
            ),
            app_state_transition_time: AtomicU64::new(now.to_bits()),
            app_launch_time: AtomicU64::new(now.to_bits()),
        };

        if loaded.crashed_last_launch {
            state.launches_since_last_crash.store(0, SeqCst);
            state.sessions_since_last_crash.store(0, SeqCst);
            store_f64(&state.active_duration_since_last_crash, 0.0);
            store_f64(&state.background_duration_since_last_crash, 0.0);
        }
        state.launches_since_last_crash.fetch_add(1, SeqCst);
        state.sessions_since_last_crash.fetch_add(1, SeqCst);

        state.save()?;
        Ok(state)
    }

    fn elapsed_since_transition(&self) -> f64 {
        let elapsed = monotonic_seconds() - load_f64(&self.app_state_transition_time);
        elapsed.max(0.0)
    }

    fn stamp_transition(&self) {
        store_f64(&self.app_state_transition_time, monotonic_seconds());
    }

    /// Active/inactive transition. Does not persist.
    pub fn notify_app_active(&self, active: bool) {
        if active {
            self.stamp_transition();
        } else {
            let elapsed = self.elapsed_since_transition();
            add_f64(&self.active_duration_since_launch, elapsed);
            add_f64(&self.active_duration_since_last_crash, elapsed);
        }
        self.application_is_active.store(active, SeqCst);
    }

    /// Foreground/background transition. Entering the foreground starts a
    /// new session; leaving it persists so the background interval survives
    /// a later kill.
    pub fn notify_app_in_foreground(&self, in_foreground: bool) {
        if in_foreground {
            let elapsed = self.elapsed_since_transition();
            add_f64(&self.background_duration_since_launch, elapsed);
            add_f64(&self.background_duration_since_last_crash, elapsed);
            self.sessions_since_last_crash.fetch_add(1, SeqCst);
            self.sessions_since_launch.fetch_add(1, SeqCst);
            self.application_is_in_foreground.store(true, SeqCst);
        } else {
            self.application_is_in_foreground.store(false, SeqCst);
            self.stamp_transition();
            if let Err(e) = self.save() {
                log::warn!("failed to persist crash state on backgrounding: {e}");
            }
        }
    }

    /// Orderly termination.
    pub fn notify_app_terminate(&self) {
        let elapsed = self.elapsed_since_transition();
        add_f64(&self.background_duration_since_last_crash, elapsed);
        if let Err(e) = self.save() {
            log::warn!("failed to persist crash state on terminate: {e}");
        }
    }

    /// Crash transition. Runs inside the crash handler: nothing here may
    /// allocate, lock, or touch stdio.
    pub fn notify_app_crash(&self) {
        let elapsed = self.elapsed_since_transition();
        if self.application_is_active.load(SeqCst) {
            add_f64(&self.active_duration_since_launch, elapsed);
            add_f64(&self.active_duration_since_last_crash, elapsed);
        } else if !self.application_is_in_foreground.load(SeqCst) {
            add_f64(&self.background_duration_since_launch, elapsed);
            add_f64(&self.background_duration_since_last_crash, elapsed);
        }
        self.crashed_this_launch.store(true, SeqCst);
        let _ = self.save();
    }

    /// Persists the state. `crashedLastLaunch` is written from the *current*
    /// launch's crash flag, so the next launch loads the truth about this
    /// one. Encodes into a stack buffer, then one open/write/close.
    pub fn save(&self) -> Result<(), StateError> {
        let mut buffer = [0u8; 512];
        let mut encoder = JsonEncoder::new(BufferSink::new(&mut buffer));
        encoder.begin_object(None)?;
        encoder.add_uint(Some("version"), STATE_FILE_VERSION as u64)?;
        encoder.add_bool(
            Some("crashedLastLaunch"),
            self.crashed_this_launch.load(SeqCst),
        )?;
        encoder.add_float(
            Some("activeDurationSinceLastCrash"),
            load_f64(&self.active_duration_since_last_crash),
        )?;
        encoder.add_float(
            Some("backgroundDurationSinceLastCrash"),
            load_f64(&self.background_duration_since_last_crash),
        )?;
        encoder.add_uint(
            Some("launchesSinceLastCrash"),
            self.launches_since_last_crash.load(SeqCst) as u64,
        )?;
        encoder.add_uint(
            Some("sessionsSinceLastCrash"),
            self.sessions_since_last_crash.load(SeqCst) as u64,
        )?;
        encoder.end_container()?;
        let sink = encoder.into_sink();
        let bytes = sink.as_bytes();

        // SAFETY: the path was validated at init; flags are plain constants.
        let fd = unsafe {
            libc::open(
                self.path.as_ptr(),
                libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
                0o644 as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(StateError::Open(errno::errno().0));
        }
        let mut remaining = bytes;
        while !remaining.is_empty() {
            // SAFETY: remaining is a live slice.
            let written = unsafe {
                libc::write(
                    fd,
                    remaining.as_ptr() as *const libc::c_void,
                    remaining.len(),
                )
            };
            if written <= 0 {
                let err = errno::errno().0;
                if err == libc::EINTR {
                    continue;
                }
                // SAFETY: fd came from the open above.
                unsafe { libc::close(fd) };
                return Err(StateError::Write(err));
            }
            remaining = &remaining[written as usize..];
        }
        // SAFETY: fd came from the open above.
        unsafe { libc::close(fd) };
        Ok(())
    }

    // Snapshot accessors for the report writer. Both crash booleans are
    // exposed: `crashed_last_launch` as loaded from disk, and
    // `crashed_this_launch` tracking the live launch.

    pub fn crashed_last_launch(&self) -> bool {
        self.crashed_last_launch.load(SeqCst)
    }

    pub fn crashed_this_launch(&self) -> bool {
        self.crashed_this_launch.load(SeqCst)
    }

    pub fn application_is_active(&self) -> bool {
        self.application_is_active.load(SeqCst)
    }

    pub fn application_is_in_foreground(&self) -> bool {
        self.application_is_in_foreground.load(SeqCst)
    }

    pub fn launches_since_last_crash(&self) -> u32 {
        self.launches_since_last_crash.load(SeqCst)
    }

    pub fn sessions_since_last_crash(&self) -> u32 {
        self.sessions_since_last_crash.load(SeqCst)
    }

    pub fn sessions_since_launch(&self) -> u32 {
        self.sessions_since_launch.load(SeqCst)
    }

    pub fn active_duration_since_launch(&self) -> f64 {
        load_f64(&self.active_duration_since_launch)
    }

    pub fn active_duration_since_last_crash(&self) -> f64 {
        load_f64(&self.active_duration_since_last_crash)
    }

    pub fn background_duration_since_launch(&self) -> f64 {
        load_f64(&self.background_duration_since_launch)
    }

    pub fn background_duration_since_last_crash(&self) -> f64 {
        load_f64(&self.background_duration_since_last_crash)
    }

    pub fn app_launch_time(&self) -> f64 {
        load_f64(&self.app_launch_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("crash_state.json")
    }

    #[test]
    fn test_first_launch_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = CrashState::init(&state_path(&dir)).unwrap();
        assert!(!state.crashed_last_launch());
        assert!(!state.crashed_this_launch());
        assert_eq!(state.launches_since_last_crash(), 1);
        assert_eq!(state.sessions_since_last_crash(), 1);
        assert_eq!(state.sessions_since_launch(), 1);
        assert!(state.application_is_in_foreground());
    }

    #[test]
    fn test_saved_file_reloads_identically() {
        let dir = tempfile::tempdir().unwrap();
        let path = state_path(&dir);
        let state = CrashState::init(&path).unwrap();
        state.save().unwrap();

        let reloaded = CrashState::init(&path).unwrap();
        // Second launch of a non-crashed app.
        assert!(!reloaded.crashed_last_launch());
        assert_eq!(reloaded.launches_since_last_crash(), 2);
        assert_eq!(reloaded.sessions_since_last_crash(), 2);
        assert_eq!(reloaded.sessions_since_launch(), 1);
    }

    #[test]
    fn test_state_file_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = state_path(&dir);
        let state = CrashState::init(&path).unwrap();
        state.save().unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["crashedLastLaunch"], false);
        assert!(value["activeDurationSinceLastCrash"].is_number());
        assert!(value["backgroundDurationSinceLastCrash"].is_number());
        assert_eq!(value["launchesSinceLastCrash"], 1);
        assert_eq!(value["sessionsSinceLastCrash"], 1);
    }

    #[test]
    fn test_crash_resets_interval_on_next_launch() {
        let dir = tempfile::tempdir().unwrap();
        let path = state_path(&dir);
        let state = CrashState::init(&path).unwrap();
        state.notify_app_crash();
        assert!(state.crashed_this_launch());

        let next = CrashState::init(&path).unwrap();
        assert!(next.crashed_last_launch());
        // Interval counters were zeroed, then this launch incremented once.
        assert_eq!(next.launches_since_last_crash(), 1);
        assert_eq!(next.sessions_since_last_crash(), 1);
        assert_eq!(next.active_duration_since_last_crash(), 0.0);
        assert_eq!(next.background_duration_since_last_crash(), 0.0);

        // And a crash-free restart clears the flag again.
        next.save().unwrap();
        let third = CrashState::init(&path).unwrap();
        assert!(!third.crashed_last_launch());
        assert_eq!(third.launches_since_last_crash(), 2);
    }

    #[test]
    fn test_counters_monotonic_without_crash() {
        let dir = tempfile::tempdir().unwrap();
        let state = CrashState::init(&state_path(&dir)).unwrap();
        let mut last_sessions = state.sessions_since_last_crash();
        for _ in 0..3 {
            state.notify_app_active(true);
            state.notify_app_active(false);
            state.notify_app_in_foreground(false);
            state.notify_app_in_foreground(true);
            let sessions = state.sessions_since_last_crash();
            assert!(sessions >= last_sessions);
            last_sessions = sessions;
        }
        assert_eq!(state.sessions_since_launch(), 4);
    }

    #[test]
    fn test_foreground_entry_accumulates_background_time() {
        let dir = tempfile::tempdir().unwrap();
        let state = CrashState::init(&state_path(&dir)).unwrap();
        state.notify_app_in_foreground(false);
        std::thread::sleep(std::time::Duration::from_millis(20));
        state.notify_app_in_foreground(true);
        assert!(state.background_duration_since_launch() > 0.0);
        assert!(state.background_duration_since_last_crash() > 0.0);
    }

    #[test]
    fn test_active_time_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let state = CrashState::init(&state_path(&dir)).unwrap();
        state.notify_app_active(true);
        std::thread::sleep(std::time::Duration::from_millis(20));
        state.notify_app_active(false);
        assert!(state.active_duration_since_launch() > 0.0);
    }

    #[test]
    fn test_crash_while_active_accumulates_active_time() {
        let dir = tempfile::tempdir().unwrap();
        let state = CrashState::init(&state_path(&dir)).unwrap();
        state.notify_app_active(true);
        std::thread::sleep(std::time::Duration::from_millis(20));
        state.notify_app_crash();
        assert!(state.active_duration_since_last_crash() > 0.0);
    }

    #[test]
    fn test_unknown_fields_ignored_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = state_path(&dir);
        std::fs::write(
            &path,
            "{\"version\":1,\"crashedLastLaunch\":true,\"launchesSinceLastCrash\":7,\
             \"sessionsSinceLastCrash\":9,\"activeDurationSinceLastCrash\":1.5,\
             \"backgroundDurationSinceLastCrash\":2.5,\"someFutureField\":\"x\"}",
        )
        .unwrap();
        let state = CrashState::init(&path).unwrap();
        assert!(state.crashed_last_launch());
        // Crashed-last-launch resets the window before incrementing.
        assert_eq!(state.launches_since_last_crash(), 1);
    }

    #[test]
    fn test_corrupt_file_treated_as_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = state_path(&dir);
        std::fs::write(&path, b"not json at all").unwrap();
        let state = CrashState::init(&path).unwrap();
        assert!(!state.crashed_last_launch());
        assert_eq!(state.launches_since_last_crash(), 1);
    }

    #[test]
    fn test_monotonic_seconds_advances() {
        let a = monotonic_seconds();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = monotonic_seconds();
        assert!(b > a);
    }
}
