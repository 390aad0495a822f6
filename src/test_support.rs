// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scriptable fakes for the provider interfaces, shared by the unit tests.

use crate::context::{Configuration, Recorder};
use crate::introspect::{
    DeallocOracle, DeallocatedException, FieldValue, ObjectClass, ObjectClassifier,
};
use crate::machine::{
    BinaryImage, FrameSymbol, Machine, MemoryStats, RegisterSet, ThreadHandle,
};
use crate::state::CrashState;
use crate::CrashType;
use std::ffi::{c_void, CString};
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// Tests that touch process-global recorder or suspension state take this
/// lock so they cannot interleave.
pub(crate) static GLOBAL_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[derive(Default)]
pub(crate) struct FakeImage {
    pub address: u64,
    pub vm_address: u64,
    pub size: u64,
    pub name: &'static str,
    pub uuid: Option<[u8; 16]>,
    pub cpu_type: i32,
    pub cpu_subtype: i32,
}

pub(crate) struct FakeSymbol {
    pub start: u64,
    pub end: u64,
    pub object_name: &'static str,
    pub object_address: u64,
    pub symbol_name: Option<&'static str>,
    pub symbol_address: u64,
}

#[derive(Default)]
pub(crate) struct FakeMachine {
    pub current: ThreadHandle,
    pub main: ThreadHandle,
    pub threads: Vec<ThreadHandle>,
    pub registers: Vec<(ThreadHandle, RegisterSet)>,
    pub backtraces: Vec<(ThreadHandle, Vec<usize>)>,
    pub thread_names: Vec<(ThreadHandle, &'static str)>,
    pub queue_names: Vec<(ThreadHandle, &'static str)>,
    pub memory: Vec<(u64, Vec<u8>)>,
    pub symbols: Vec<FakeSymbol>,
    pub images: Vec<FakeImage>,
    pub memory_stats: MemoryStats,
    pub debugger: bool,
    /// When true, posted main-thread work runs inline (a responsive main
    /// thread); when false it is dropped (a deadlocked one).
    pub main_responsive: bool,
    pub suspended: AtomicUsize,
    pub resumed: AtomicUsize,
}

impl FakeMachine {
    fn copy_range(&self, address: u64, out: &mut [u8]) -> usize {
        for (base, bytes) in &self.memory {
            let end = base + bytes.len() as u64;
            if address >= *base && address < end {
                let offset = (address - base) as usize;
                let available = bytes.len() - offset;
                let n = available.min(out.len());
                out[..n].copy_from_slice(&bytes[offset..offset + n]);
                return n;
            }
        }
        0
    }
}

impl Machine for FakeMachine {
    fn current_thread(&self) -> ThreadHandle {
        self.current
    }

    fn main_thread(&self) -> ThreadHandle {
        self.main
    }

    fn list_threads(&self, out: &mut [ThreadHandle]) -> usize {
        let n = self.threads.len().min(out.len());
        out[..n].copy_from_slice(&self.threads[..n]);
        n
    }

    fn suspend_thread(&self, _thread: ThreadHandle) -> bool {
        self.suspended.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn resume_thread(&self, _thread: ThreadHandle) -> bool {
        self.resumed.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn thread_registers(&self, thread: ThreadHandle, out: &mut RegisterSet) -> bool {
        for (t, regs) in &self.registers {
            if *t == thread {
                *out = *regs;
                return true;
            }
        }
        false
    }

    fn backtrace(
        &self,
        thread: ThreadHandle,
        _regs: Option<&RegisterSet>,
        out: &mut [usize],
    ) -> usize {
        for (t, frames) in &self.backtraces {
            if *t == thread {
                let n = frames.len().min(out.len());
                out[..n].copy_from_slice(&frames[..n]);
                return n;
            }
        }
        0
    }

    fn thread_name(&self, thread: ThreadHandle, out: &mut [u8]) -> usize {
        for (t, name) in &self.thread_names {
            if *t == thread {
                let n = name.len().min(out.len());
                out[..n].copy_from_slice(&name.as_bytes()[..n]);
                return n;
            }
        }
        0
    }

    fn queue_name(&self, thread: ThreadHandle, out: &mut [u8]) -> usize {
        for (t, name) in &self.queue_names {
            if *t == thread {
                let n = name.len().min(out.len());
                out[..n].copy_from_slice(&name.as_bytes()[..n]);
                return n;
            }
        }
        0
    }

    fn safe_copy(&self, address: u64, out: &mut [u8]) -> bool {
        let len = out.len();
        self.copy_range(address, out) == len
    }

    fn safe_copy_max(&self, address: u64, out: &mut [u8]) -> usize {
        self.copy_range(address, out)
    }

    fn each_binary_image(&self, visit: &mut dyn FnMut(&BinaryImage<'_>)) {
        for image in &self.images {
            visit(&BinaryImage {
                address: image.address,
                vm_address: image.vm_address,
                size: image.size,
                name: image.name,
                uuid: image.uuid,
                cpu_type: image.cpu_type,
                cpu_subtype: image.cpu_subtype,
            });
        }
    }

    fn symbolicate(&self, address: u64) -> Option<FrameSymbol> {
        for symbol in &self.symbols {
            if address >= symbol.start && address < symbol.end {
                return Some(FrameSymbol {
                    object_name: Some(symbol.object_name),
                    object_address: symbol.object_address,
                    symbol_name: symbol.symbol_name,
                    symbol_address: symbol.symbol_address,
                });
            }
        }
        None
    }

    fn memory_stats(&self) -> MemoryStats {
        self.memory_stats
    }

    fn post_to_main_thread(
        &self,
        work: unsafe extern "C" fn(*mut c_void),
        context: *mut c_void,
    ) -> bool {
        if self.main_responsive {
            // SAFETY: the test wired a callback that tolerates inline
            // invocation.
            unsafe { work(context) };
        }
        true
    }

    fn is_debugger_attached(&self) -> bool {
        self.debugger
    }
}

#[derive(Clone)]
pub(crate) enum FakeObject {
    Str {
        class: &'static str,
        contents: &'static str,
    },
    Arr {
        class: &'static str,
        first: Option<u64>,
    },
    Num {
        class: &'static str,
        value: f64,
    },
    Date {
        class: &'static str,
        value: f64,
    },
    Url {
        class: &'static str,
        target: &'static str,
    },
    Obj {
        class: &'static str,
        fields: Vec<(&'static str, FieldValue)>,
    },
    Class {
        name: &'static str,
    },
}

#[derive(Default)]
pub(crate) struct FakeClassifier {
    pub objects: Vec<(u64, FakeObject)>,
    pub calls: AtomicUsize,
}

impl FakeClassifier {
    fn find(&self, address: u64) -> Option<&FakeObject> {
        self.objects
            .iter()
            .find(|(a, _)| *a == address)
            .map(|(_, o)| o)
    }
}

impl ObjectClassifier for FakeClassifier {
    fn classify(&self, address: u64) -> ObjectClass<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if address == 0 {
            return ObjectClass::NullPointer;
        }
        match self.find(address) {
            Some(FakeObject::Str { class, .. }) => ObjectClass::String { class_name: class },
            Some(FakeObject::Arr { class, .. }) => ObjectClass::Array { class_name: class },
            Some(FakeObject::Num { class, .. }) => ObjectClass::Number { class_name: class },
            Some(FakeObject::Date { class, .. }) => ObjectClass::Date { class_name: class },
            Some(FakeObject::Url { class, .. }) => ObjectClass::Url { class_name: class },
            Some(FakeObject::Obj { class, .. }) => ObjectClass::Object { class_name: class },
            Some(FakeObject::Class { name }) => ObjectClass::ClassReference { name },
            None => ObjectClass::Unknown,
        }
    }

    fn copy_string_contents(&self, address: u64, out: &mut [u8]) -> usize {
        match self.find(address) {
            Some(FakeObject::Str { contents, .. }) => {
                let n = contents.len().min(out.len());
                out[..n].copy_from_slice(&contents.as_bytes()[..n]);
                n
            }
            _ => 0,
        }
    }

    fn copy_url_target(&self, address: u64, out: &mut [u8]) -> usize {
        match self.find(address) {
            Some(FakeObject::Url { target, .. }) => {
                let n = target.len().min(out.len());
                out[..n].copy_from_slice(&target.as_bytes()[..n]);
                n
            }
            _ => 0,
        }
    }

    fn date_value(&self, address: u64) -> f64 {
        match self.find(address) {
            Some(FakeObject::Date { value, .. }) => *value,
            _ => 0.0,
        }
    }

    fn number_value(&self, address: u64) -> f64 {
        match self.find(address) {
            Some(FakeObject::Num { value, .. }) => *value,
            _ => 0.0,
        }
    }

    fn array_first_element(&self, address: u64) -> Option<u64> {
        match self.find(address) {
            Some(FakeObject::Arr { first, .. }) => *first,
            _ => None,
        }
    }

    fn each_instance_field(&self, address: u64, visit: &mut dyn FnMut(&str, FieldValue)) {
        if let Some(FakeObject::Obj { fields, .. }) = self.find(address) {
            for (name, value) in fields {
                visit(name, *value);
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeOracle {
    pub zombies: Vec<(u64, &'static str)>,
    pub exception: Option<(u64, &'static str, &'static str, Vec<usize>)>,
}

impl DeallocOracle for FakeOracle {
    fn class_name_of(&self, address: u64) -> Option<&str> {
        self.zombies
            .iter()
            .find(|(a, _)| *a == address)
            .map(|(_, name)| *name)
    }

    fn last_exception(&self) -> Option<DeallocatedException<'_>> {
        self.exception
            .as_ref()
            .map(|(address, name, reason, backtrace)| DeallocatedException {
                address: *address,
                name,
                reason,
                backtrace,
            })
    }
}

pub(crate) struct TestHarness {
    pub recorder: &'static Recorder,
    pub dir: &'static tempfile::TempDir,
}

impl TestHarness {
    pub fn crash_path(&self) -> CString {
        CString::new(
            self.dir
                .path()
                .join("crash.json")
                .to_str()
                .unwrap()
                .as_bytes(),
        )
        .unwrap()
    }
}

pub(crate) fn registers_with(values: &[(&'static str, u64)], sp: u64) -> RegisterSet {
    let mut regs = RegisterSet::default();
    for &(name, value) in values {
        regs.push_basic(name, value);
    }
    regs.stack_pointer = sp;
    regs.instruction_pointer = values.first().map(|(_, v)| *v).unwrap_or(0);
    regs
}

fn noop_on_crash(_recorder: &Recorder) {}

/// Builds a never-freed recorder over the given fakes, with state backed by
/// a temp directory that outlives the test.
pub(crate) fn build_recorder(
    machine: &'static dyn Machine,
    classifier: &'static dyn ObjectClassifier,
    oracle: &'static dyn DeallocOracle,
) -> TestHarness {
    let dir = leak(tempfile::tempdir().unwrap());
    let state = CrashState::init(&dir.path().join("state.json")).unwrap();
    let config = Configuration::new(
        CString::new(dir.path().join("crash.json").to_str().unwrap()).unwrap(),
        CString::new(dir.path().join("recrash.json").to_str().unwrap()).unwrap(),
        *uuid::Uuid::new_v4().as_bytes(),
        "test-process".into(),
    );
    config.set_enabled_types(CrashType::ALL);
    let recorder = leak(Recorder::new(
        config,
        state,
        machine,
        classifier,
        oracle,
        noop_on_crash,
    ));
    TestHarness { recorder, dir }
}
