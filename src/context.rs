// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The process-wide recorder root: configuration, persistent state, and the
//! per-crash fault record.
//!
//! There is exactly one mutable object shared between the normal world and
//! the crash path, and this is it. It is published once through an atomic
//! pointer (see `api`), borrowed raw from handlers, and intentionally never
//! freed. Mutable configuration is individually atomic; the fault record is
//! guarded by the `handling_crash` protocol: it is only written between
//! `begin_handling_crash()` and the end of the on-crash callback, while
//! every other thread is suspended.

use crate::introspect::{DeallocOracle, ObjectClassifier};
use crate::machine::{Machine, RegisterSet, ThreadHandle, MAX_CAPTURED_FRAMES};
use crate::report::ReportWriter;
use crate::state::CrashState;
use crate::CrashType;
use std::cell::UnsafeCell;
use std::ffi::CString;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize};

/// User callback invoked with the report writer to append the
/// `user_atcrash` section.
pub type OnCrashNotify = Box<dyn Fn(&mut ReportWriter<'_>) + Send + Sync>;

/// Internal crash routing installed by the control surface.
pub type OnCrash = fn(&Recorder);

/// Which sentry owned the crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashSource {
    MachException,
    Signal,
    RuntimeException,
    ForeignException,
    Deadlock,
    UserReported,
}

impl CrashSource {
    /// Wire tag in the report's `error.type` field. These names are the
    /// uploader's contract and predate this implementation.
    pub fn type_name(&self) -> &'static str {
        match self {
            CrashSource::MachException => "mach",
            CrashSource::Signal => "signal",
            CrashSource::RuntimeException => "nsexception",
            CrashSource::ForeignException => "cpp_exception",
            CrashSource::Deadlock => "deadlock",
            CrashSource::UserReported => "user",
        }
    }

    pub fn crash_type(&self) -> CrashType {
        match self {
            CrashSource::MachException => CrashType::MACH_EXCEPTION,
            CrashSource::Signal => CrashType::SIGNAL,
            CrashSource::RuntimeException => CrashType::RUNTIME_EXCEPTION,
            CrashSource::ForeignException => CrashType::FOREIGN_EXCEPTION,
            CrashSource::Deadlock => CrashType::MAIN_THREAD_DEADLOCK,
            CrashSource::UserReported => CrashType::USER_REPORTED,
        }
    }
}

/// A borrowed string smuggled across the handler boundary as a raw
/// pointer/length pair. The referent must outlive the crash-handling
/// window; in practice it lives on the frame of whoever raised the crash.
#[derive(Debug, Clone, Copy)]
pub struct RawStr {
    ptr: *const u8,
    len: usize,
}

impl RawStr {
    pub const EMPTY: RawStr = RawStr {
        ptr: ptr::null(),
        len: 0,
    };

    pub fn new(s: &str) -> Self {
        Self {
            ptr: s.as_ptr(),
            len: s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.is_null() || self.len == 0
    }

    /// # Safety
    ///
    /// The referent must still be alive; callers only use this inside the
    /// crash-handling window.
    pub unsafe fn as_str<'a>(&self) -> Option<&'a str> {
        if self.ptr.is_null() {
            return None;
        }
        let bytes = core::slice::from_raw_parts(self.ptr, self.len);
        core::str::from_utf8(bytes).ok()
    }
}

/// A borrowed list of [`RawStr`], same lifetime contract.
#[derive(Debug, Clone, Copy)]
pub struct RawStrList {
    ptr: *const RawStr,
    len: usize,
}

impl RawStrList {
    pub const EMPTY: RawStrList = RawStrList {
        ptr: ptr::null(),
        len: 0,
    };

    pub fn new(list: &[RawStr]) -> Self {
        Self {
            ptr: list.as_ptr(),
            len: list.len(),
        }
    }

    pub fn len(&self) -> usize {
        if self.ptr.is_null() {
            0
        } else {
            self.len
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Safety
    ///
    /// Same contract as [`RawStr::as_str`].
    pub unsafe fn get<'a>(&self, index: usize) -> Option<&'a str> {
        if self.ptr.is_null() || index >= self.len {
            return None;
        }
        (*self.ptr.add(index)).as_str()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MachFault {
    pub exception: i32,
    pub code: i64,
    pub subcode: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SignalFault {
    pub signum: i32,
    pub code: i32,
}

/// Name/reason payload shared by the exception-flavored sources.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionFault {
    pub name: RawStr,
    pub reason: RawStr,
    pub line_of_code: RawStr,
    pub custom_frames: RawStrList,
}

impl Default for ExceptionFault {
    fn default() -> Self {
        Self {
            name: RawStr::EMPTY,
            reason: RawStr::EMPTY,
            line_of_code: RawStr::EMPTY,
            custom_frames: RawStrList::EMPTY,
        }
    }
}

/// The per-crash fault record. Plain data; the cross-thread flags live on
/// [`Recorder`] instead so this can be wiped wholesale.
pub struct SentryContext {
    pub source: Option<CrashSource>,
    pub offending_thread: ThreadHandle,
    pub fault_address: u64,
    pub is_stack_overflow: bool,
    pub registers_are_valid: bool,
    pub registers: RegisterSet,
    pub mach: MachFault,
    pub signal: SignalFault,
    pub exception: ExceptionFault,
    pub backtrace: [usize; MAX_CAPTURED_FRAMES],
    pub backtrace_len: usize,
}

impl SentryContext {
    fn new() -> Self {
        Self {
            source: None,
            offending_thread: 0,
            fault_address: 0,
            is_stack_overflow: false,
            registers_are_valid: false,
            registers: RegisterSet::default(),
            mach: MachFault::default(),
            signal: SignalFault::default(),
            exception: ExceptionFault::default(),
            backtrace: [0; MAX_CAPTURED_FRAMES],
            backtrace_len: 0,
        }
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}

/// Install-time and runtime configuration. Every runtime-mutable knob is
/// individually atomic so setters never contend with the crash path.
pub struct Configuration {
    pub crash_report_path: CString,
    pub recrash_report_path: CString,
    pub crash_id: [u8; 16],
    pub process_name: String,

    enabled_types: AtomicU32,
    print_trace_to_stdout: AtomicBool,
    search_thread_names: AtomicBool,
    search_queue_names: AtomicBool,
    introspect_memory: AtomicBool,
    suspend_threads_for_user_reported: AtomicBool,
    deadlock_interval_bits: AtomicU64,
    zombie_cache_size: AtomicUsize,

    restricted_classes: AtomicPtr<Vec<String>>,
    user_info_json: AtomicPtr<String>,
    system_info_json: AtomicPtr<String>,
    on_crash_notify: AtomicPtr<OnCrashNotify>,
}

/// Default deadlock watchdog interval, seconds.
pub const DEFAULT_DEADLOCK_INTERVAL: f64 = 5.0;

impl Configuration {
    pub fn new(
        crash_report_path: CString,
        recrash_report_path: CString,
        crash_id: [u8; 16],
        process_name: String,
    ) -> Self {
        Self {
            crash_report_path,
            recrash_report_path,
            crash_id,
            process_name,
            enabled_types: AtomicU32::new(0),
            print_trace_to_stdout: AtomicBool::new(false),
            search_thread_names: AtomicBool::new(false),
            search_queue_names: AtomicBool::new(false),
            introspect_memory: AtomicBool::new(true),
            suspend_threads_for_user_reported: AtomicBool::new(true),
            deadlock_interval_bits: AtomicU64::new(DEFAULT_DEADLOCK_INTERVAL.to_bits()),
            zombie_cache_size: AtomicUsize::new(0),
            restricted_classes: AtomicPtr::new(ptr::null_mut()),
            user_info_json: AtomicPtr::new(ptr::null_mut()),
            system_info_json: AtomicPtr::new(ptr::null_mut()),
            on_crash_notify: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn enabled_types(&self) -> CrashType {
        CrashType::from_bits(self.enabled_types.load(SeqCst))
    }

    pub fn set_enabled_types(&self, types: CrashType) {
        self.enabled_types.store(types.bits(), SeqCst);
    }

    pub fn print_trace_to_stdout(&self) -> bool {
        self.print_trace_to_stdout.load(SeqCst)
    }

    pub fn set_print_trace_to_stdout(&self, enabled: bool) {
        self.print_trace_to_stdout.store(enabled, SeqCst);
    }

    pub fn search_thread_names(&self) -> bool {
        self.search_thread_names.load(SeqCst)
    }

    pub fn set_search_thread_names(&self, enabled: bool) {
        self.search_thread_names.store(enabled, SeqCst);
    }

    pub fn search_queue_names(&self) -> bool {
        self.search_queue_names.load(SeqCst)
    }

    pub fn set_search_queue_names(&self, enabled: bool) {
        self.search_queue_names.store(enabled, SeqCst);
    }

    pub fn introspect_memory(&self) -> bool {
        self.introspect_memory.load(SeqCst)
    }

    pub fn set_introspect_memory(&self, enabled: bool) {
        self.introspect_memory.store(enabled, SeqCst);
    }

    pub fn suspend_threads_for_user_reported(&self) -> bool {
        self.suspend_threads_for_user_reported.load(SeqCst)
    }

    pub fn set_suspend_threads_for_user_reported(&self, enabled: bool) {
        self.suspend_threads_for_user_reported.store(enabled, SeqCst);
    }

    pub fn deadlock_interval(&self) -> f64 {
        f64::from_bits(self.deadlock_interval_bits.load(SeqCst))
    }

    pub fn set_deadlock_interval(&self, seconds: f64) {
        self.deadlock_interval_bits.store(seconds.to_bits(), SeqCst);
    }

    pub fn zombie_cache_size(&self) -> usize {
        self.zombie_cache_size.load(SeqCst)
    }

    pub fn set_zombie_cache_size(&self, size: usize) {
        self.zombie_cache_size.store(size, SeqCst);
    }

    /// Publishes a new restricted-class list: allocate, swap the pointer,
    /// release the previous list. Readers that loaded the old pointer
    /// before the swap finish their borrow before any further swap is
    /// expected; the crash path additionally runs with setters' threads
    /// suspended.
    pub fn set_restricted_classes(&self, classes: Vec<String>) {
        let fresh = Box::into_raw(Box::new(classes));
        let old = self.restricted_classes.swap(fresh, SeqCst);
        if !old.is_null() {
            // SAFETY: this pointer can only come from Box::into_raw above.
            unsafe { drop(Box::from_raw(old)) };
        }
    }

    /// Current restricted-class snapshot. Empty when none configured.
    pub fn restricted_classes(&self) -> &[String] {
        let ptr = self.restricted_classes.load(SeqCst);
        if ptr.is_null() {
            return &[];
        }
        // SAFETY: published via Box::into_raw and only released by a later
        // set_restricted_classes (never concurrent with the crash path).
        unsafe { (*ptr).as_slice() }
    }

    pub fn set_user_info_json(&self, json: Option<String>) {
        let fresh = match json {
            Some(json) => Box::into_raw(Box::new(json)),
            None => ptr::null_mut(),
        };
        let old = self.user_info_json.swap(fresh, SeqCst);
        if !old.is_null() {
            // SAFETY: as above.
            unsafe { drop(Box::from_raw(old)) };
        }
    }

    pub fn user_info_json(&self) -> Option<&str> {
        let ptr = self.user_info_json.load(SeqCst);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: as for restricted_classes.
        Some(unsafe { (*ptr).as_str() })
    }

    pub fn set_system_info_json(&self, json: Option<String>) {
        let fresh = match json {
            Some(json) => Box::into_raw(Box::new(json)),
            None => ptr::null_mut(),
        };
        let old = self.system_info_json.swap(fresh, SeqCst);
        if !old.is_null() {
            // SAFETY: as above.
            unsafe { drop(Box::from_raw(old)) };
        }
    }

    pub fn system_info_json(&self) -> Option<&str> {
        let ptr = self.system_info_json.load(SeqCst);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: as for restricted_classes.
        Some(unsafe { (*ptr).as_str() })
    }

    pub fn set_on_crash_notify(&self, callback: Option<OnCrashNotify>) {
        let fresh = match callback {
            Some(callback) => Box::into_raw(Box::new(callback)),
            None => ptr::null_mut(),
        };
        let old = self.on_crash_notify.swap(fresh, SeqCst);
        if !old.is_null() {
            // SAFETY: as above.
            unsafe { drop(Box::from_raw(old)) };
        }
    }

    pub fn on_crash_notify(&self) -> Option<&OnCrashNotify> {
        let ptr = self.on_crash_notify.load(SeqCst);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: as for restricted_classes.
        Some(unsafe { &*ptr })
    }

    /// Removes and returns the user callback (reinstallation moves it to
    /// the successor configuration).
    pub(crate) fn take_on_crash_notify(&self) -> Option<OnCrashNotify> {
        let ptr = self.on_crash_notify.swap(ptr::null_mut(), SeqCst);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: the pointer can only come from Box::into_raw above.
        Some(*unsafe { Box::from_raw(ptr) })
    }

    /// Carries every runtime-mutable setting over from a predecessor
    /// configuration. Paths, crash id, and process name stay as built.
    pub(crate) fn adopt_runtime_settings(&self, old: &Configuration) {
        self.set_print_trace_to_stdout(old.print_trace_to_stdout());
        self.set_search_thread_names(old.search_thread_names());
        self.set_search_queue_names(old.search_queue_names());
        self.set_introspect_memory(old.introspect_memory());
        self.set_suspend_threads_for_user_reported(old.suspend_threads_for_user_reported());
        self.set_deadlock_interval(old.deadlock_interval());
        self.set_zombie_cache_size(old.zombie_cache_size());
        if !old.restricted_classes().is_empty() {
            self.set_restricted_classes(old.restricted_classes().to_vec());
        }
        if let Some(json) = old.user_info_json() {
            self.set_user_info_json(Some(json.to_string()));
        }
        if let Some(json) = old.system_info_json() {
            self.set_system_info_json(Some(json.to_string()));
        }
        self.set_on_crash_notify(old.take_on_crash_notify());
    }
}

/// The root record. Built by `install`, published through an atomic
/// pointer, never freed.
pub struct Recorder {
    pub config: Configuration,
    pub state: CrashState,
    pub machine: &'static dyn Machine,
    pub classifier: &'static dyn ObjectClassifier,
    pub oracle: &'static dyn DeallocOracle,
    pub on_crash: OnCrash,

    /// Recursion guard: true from `begin_handling_crash` until the sentry
    /// finishes. A second entrant sees true and takes the minimal path.
    pub handling_crash: AtomicBool,
    /// Set by the second entrant; routes the report to the recrash file.
    pub crashed_during_crash_handling: AtomicBool,

    context: UnsafeCell<SentryContext>,
}

// SAFETY: the UnsafeCell is only touched under the handling protocol
// (single writer, all other threads suspended); everything else is atomic
// or immutable after construction.
unsafe impl Sync for Recorder {}

impl Recorder {
    pub fn new(
        config: Configuration,
        state: CrashState,
        machine: &'static dyn Machine,
        classifier: &'static dyn ObjectClassifier,
        oracle: &'static dyn DeallocOracle,
        on_crash: OnCrash,
    ) -> Self {
        Self {
            config,
            state,
            machine,
            classifier,
            oracle,
            on_crash,
            handling_crash: AtomicBool::new(false),
            crashed_during_crash_handling: AtomicBool::new(false),
            context: UnsafeCell::new(SentryContext::new()),
        }
    }

    /// Enters the handling state: snapshots the previous guard value,
    /// wipes the fault record, and claims the context. Returns whether a
    /// handler was already running (the crashed-during-crash case).
    pub fn begin_handling_crash(&self) -> bool {
        let was_handling = self.handling_crash.swap(true, SeqCst);
        // SAFETY: we just claimed the guard; on re-entry the prior owner is
        // this same thread (it crashed while recording), so there is no
        // concurrent access.
        unsafe { (*self.context.get()).clear() };
        was_handling
    }

    /// Leaves the handling state and wipes the fault record for the next
    /// sentry.
    pub fn end_handling_crash(&self) {
        // SAFETY: still inside the handling window; see begin.
        unsafe { (*self.context.get()).clear() };
        self.crashed_during_crash_handling.store(false, SeqCst);
        self.handling_crash.store(false, SeqCst);
    }

    /// Read access to the fault record.
    ///
    /// # Safety
    ///
    /// Only valid inside the crash-handling window (or in tests that fake
    /// it); the caller must be the handling thread.
    pub unsafe fn context(&self) -> &SentryContext {
        &*self.context.get()
    }

    /// Write access to the fault record, same contract as [`Self::context`].
    ///
    /// # Safety
    ///
    /// See [`Self::context`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn context_mut(&self) -> &mut SentryContext {
        &mut *self.context.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Configuration {
        Configuration::new(
            CString::new("/tmp/crash.json").unwrap(),
            CString::new("/tmp/recrash.json").unwrap(),
            [0u8; 16],
            "test-process".into(),
        )
    }

    #[test]
    fn test_restricted_classes_swap() {
        let config = test_config();
        assert!(config.restricted_classes().is_empty());
        config.set_restricted_classes(vec!["Secret".into(), "Vault".into()]);
        assert_eq!(config.restricted_classes(), ["Secret", "Vault"]);
        config.set_restricted_classes(vec!["Other".into()]);
        assert_eq!(config.restricted_classes(), ["Other"]);
    }

    #[test]
    fn test_user_info_json_replace_and_clear() {
        let config = test_config();
        assert!(config.user_info_json().is_none());
        config.set_user_info_json(Some("{\"a\":1}".into()));
        assert_eq!(config.user_info_json(), Some("{\"a\":1}"));
        config.set_user_info_json(None);
        assert!(config.user_info_json().is_none());
    }

    #[test]
    fn test_deadlock_interval_default() {
        let config = test_config();
        assert_eq!(config.deadlock_interval(), DEFAULT_DEADLOCK_INTERVAL);
        config.set_deadlock_interval(0.25);
        assert_eq!(config.deadlock_interval(), 0.25);
    }

    #[test]
    fn test_raw_str_round_trip() {
        let original = String::from("a borrowed reason");
        let raw = RawStr::new(&original);
        // SAFETY: original is alive.
        let text: Option<&str> = unsafe { raw.as_str() };
        assert_eq!(text, Some("a borrowed reason"));
        let empty: Option<&str> = unsafe { RawStr::EMPTY.as_str() };
        assert_eq!(empty, None);
    }

    #[test]
    fn test_raw_str_list_indexing() {
        let frames = [RawStr::new("frame0"), RawStr::new("frame1")];
        let list = RawStrList::new(&frames);
        assert_eq!(list.len(), 2);
        // SAFETY: frames is alive.
        unsafe {
            assert_eq!(list.get(0), Some("frame0"));
            assert_eq!(list.get(1), Some("frame1"));
            let missing: Option<&str> = list.get(2);
            assert_eq!(missing, None);
        }
    }

    #[test]
    fn test_crash_source_wire_names() {
        assert_eq!(CrashSource::MachException.type_name(), "mach");
        assert_eq!(CrashSource::Signal.type_name(), "signal");
        assert_eq!(CrashSource::RuntimeException.type_name(), "nsexception");
        assert_eq!(CrashSource::ForeignException.type_name(), "cpp_exception");
        assert_eq!(CrashSource::Deadlock.type_name(), "deadlock");
        assert_eq!(CrashSource::UserReported.type_name(), "user");
    }
}
