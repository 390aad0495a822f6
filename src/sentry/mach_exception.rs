// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Kernel-exception sentry.
//!
//! Darwin delivers hardware faults as Mach messages on a task exception
//! port before any signal is synthesized. Listening there catches crashes
//! that never make it to the signal layer and yields the faulting thread's
//! identity directly from the kernel.
//!
//! Two dedicated handler threads share the message loop: a primary that
//! runs, and a secondary that starts suspended. When the primary takes an
//! exception it wakes the secondary first, so a crash inside the handler
//! itself is processed by a fresh thread instead of looping. Every reply
//! is "not handled": recording is this sentry's whole job, and the
//! restored previous ports let default processing kill the process
//! normally.

#[cfg(target_os = "macos")]
pub(crate) use darwin::{install, uninstall};

#[cfg(not(target_os = "macos"))]
pub(crate) fn install(_recorder: &'static crate::context::Recorder) -> anyhow::Result<()> {
    anyhow::bail!("kernel exception handling requires a Mach kernel")
}

#[cfg(not(target_os = "macos"))]
pub(crate) fn uninstall() {}

#[cfg(target_os = "macos")]
mod darwin {
    use crate::context::{CrashSource, MachFault, Recorder};
    use crate::machine::Machine;
    use crate::report::names::EXC_BAD_ACCESS;
    use crate::sentry::{begin_trap, finish_trap};
    use std::cell::UnsafeCell;
    use std::sync::atomic::Ordering::SeqCst;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};

    type MachPort = u32;
    type KernReturn = i32;

    const KERN_SUCCESS: KernReturn = 0;
    const KERN_FAILURE: KernReturn = 5;

    const EXC_TYPES_COUNT: usize = 14;
    const EXC_MASK_BAD_ACCESS: u32 = 1 << 1;
    const EXC_MASK_BAD_INSTRUCTION: u32 = 1 << 2;
    const EXC_MASK_ARITHMETIC: u32 = 1 << 3;
    const EXC_MASK_SOFTWARE: u32 = 1 << 5;
    const EXC_MASK_BREAKPOINT: u32 = 1 << 6;

    const EXCEPTION_DEFAULT: i32 = 1;
    const MACH_EXCEPTION_CODES: i32 = 0x8000_0000u32 as i32;

    #[cfg(target_arch = "x86_64")]
    const THREAD_STATE_NONE: i32 = 13;
    #[cfg(target_arch = "aarch64")]
    const THREAD_STATE_NONE: i32 = 5;

    const MACH_PORT_NULL: MachPort = 0;
    const MACH_PORT_RIGHT_RECEIVE: u32 = 1;
    const MACH_MSG_TYPE_MAKE_SEND: u32 = 20;
    const MACH_SEND_MSG: i32 = 0x0000_0001;
    const MACH_RCV_MSG: i32 = 0x0000_0002;
    const MACH_MSG_TIMEOUT_NONE: u32 = 0;
    const MACH_MSGH_BITS_REMOTE_MASK: u32 = 0x0000_001F;

    // The exception message layouts the kernel fills. Only the fields this
    // sentry reads are named; the padding absorbs the trailer and any
    // future growth.
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct MachMsgHeader {
        msgh_bits: u32,
        msgh_size: u32,
        msgh_remote_port: MachPort,
        msgh_local_port: MachPort,
        msgh_voucher_port: MachPort,
        msgh_id: i32,
    }

    #[repr(C)]
    struct MachMsgBody {
        msgh_descriptor_count: u32,
    }

    #[repr(C)]
    struct MachMsgPortDescriptor {
        name: MachPort,
        pad1: u32,
        pad2: u16,
        disposition: u8,
        descriptor_type: u8,
    }

    #[repr(C)]
    struct ExceptionRequest {
        header: MachMsgHeader,
        body: MachMsgBody,
        thread: MachMsgPortDescriptor,
        task: MachMsgPortDescriptor,
        ndr: [u8; 8],
        exception: i32,
        code_count: u32,
        code: [i64; 2],
        padding: [u8; 512],
    }

    #[repr(C)]
    struct ExceptionReply {
        header: MachMsgHeader,
        ndr: [u8; 8],
        return_code: KernReturn,
    }

    extern "C" {
        fn mach_task_self() -> MachPort;
        fn mach_thread_self() -> MachPort;
        fn mach_port_allocate(task: MachPort, right: u32, name: *mut MachPort) -> KernReturn;
        fn mach_port_insert_right(
            task: MachPort,
            name: MachPort,
            poly: MachPort,
            poly_poly: u32,
        ) -> KernReturn;
        fn mach_port_destroy(task: MachPort, name: MachPort) -> KernReturn;
        fn task_get_exception_ports(
            task: MachPort,
            mask: u32,
            masks: *mut u32,
            count: *mut u32,
            ports: *mut MachPort,
            behaviors: *mut i32,
            flavors: *mut i32,
        ) -> KernReturn;
        fn task_set_exception_ports(
            task: MachPort,
            mask: u32,
            port: MachPort,
            behavior: i32,
            flavor: i32,
        ) -> KernReturn;
        fn mach_msg(
            msg: *mut MachMsgHeader,
            option: i32,
            send_size: u32,
            rcv_size: u32,
            rcv_name: MachPort,
            timeout: u32,
            notify: MachPort,
        ) -> KernReturn;
        fn thread_suspend(thread: MachPort) -> KernReturn;
        fn thread_resume(thread: MachPort) -> KernReturn;
        fn thread_terminate(thread: MachPort) -> KernReturn;
    }

    /// Saved previous exception ports, restored at uninstall so default
    /// handling still works.
    struct PreviousPorts {
        count: UnsafeCell<u32>,
        masks: UnsafeCell<[u32; EXC_TYPES_COUNT]>,
        ports: UnsafeCell<[MachPort; EXC_TYPES_COUNT]>,
        behaviors: UnsafeCell<[i32; EXC_TYPES_COUNT]>,
        flavors: UnsafeCell<[i32; EXC_TYPES_COUNT]>,
    }

    // SAFETY: written only during install, read only during uninstall;
    // both are serialized by the INSTALLED transitions.
    unsafe impl Sync for PreviousPorts {}

    static PREVIOUS: PreviousPorts = PreviousPorts {
        count: UnsafeCell::new(0),
        masks: UnsafeCell::new([0; EXC_TYPES_COUNT]),
        ports: UnsafeCell::new([0; EXC_TYPES_COUNT]),
        behaviors: UnsafeCell::new([0; EXC_TYPES_COUNT]),
        flavors: UnsafeCell::new([0; EXC_TYPES_COUNT]),
    };

    static INSTALLED: AtomicBool = AtomicBool::new(false);
    static EXCEPTION_PORT: AtomicU32 = AtomicU32::new(MACH_PORT_NULL);
    static PRIMARY_THREAD: AtomicU64 = AtomicU64::new(0);
    static SECONDARY_THREAD: AtomicU64 = AtomicU64::new(0);

    const WATCHED_MASK: u32 = EXC_MASK_BAD_ACCESS
        | EXC_MASK_BAD_INSTRUCTION
        | EXC_MASK_ARITHMETIC
        | EXC_MASK_SOFTWARE
        | EXC_MASK_BREAKPOINT;

    pub(crate) fn install(recorder: &'static Recorder) -> anyhow::Result<()> {
        if INSTALLED.swap(true, SeqCst) {
            return Ok(());
        }
        // SAFETY: out-pointers are valid; failures unwind the install.
        unsafe {
            let task = mach_task_self();

            let mut count = EXC_TYPES_COUNT as u32;
            let kr = task_get_exception_ports(
                task,
                WATCHED_MASK,
                (*PREVIOUS.masks.get()).as_mut_ptr(),
                &mut count,
                (*PREVIOUS.ports.get()).as_mut_ptr(),
                (*PREVIOUS.behaviors.get()).as_mut_ptr(),
                (*PREVIOUS.flavors.get()).as_mut_ptr(),
            );
            if kr != KERN_SUCCESS {
                INSTALLED.store(false, SeqCst);
                anyhow::bail!("task_get_exception_ports failed ({kr})");
            }
            *PREVIOUS.count.get() = count;

            let mut port: MachPort = MACH_PORT_NULL;
            let kr = mach_port_allocate(task, MACH_PORT_RIGHT_RECEIVE, &mut port);
            if kr != KERN_SUCCESS {
                INSTALLED.store(false, SeqCst);
                anyhow::bail!("mach_port_allocate failed ({kr})");
            }
            let kr = mach_port_insert_right(task, port, port, MACH_MSG_TYPE_MAKE_SEND);
            if kr != KERN_SUCCESS {
                mach_port_destroy(task, port);
                INSTALLED.store(false, SeqCst);
                anyhow::bail!("mach_port_insert_right failed ({kr})");
            }
            let kr = task_set_exception_ports(
                task,
                WATCHED_MASK,
                port,
                EXCEPTION_DEFAULT | MACH_EXCEPTION_CODES,
                THREAD_STATE_NONE,
            );
            if kr != KERN_SUCCESS {
                mach_port_destroy(task, port);
                INSTALLED.store(false, SeqCst);
                anyhow::bail!("task_set_exception_ports failed ({kr})");
            }
            EXCEPTION_PORT.store(port, SeqCst);
        }

        // Secondary first so it is parked before the primary can trap.
        let secondary = spawn_handler(recorder, "crash-recorder-mach-2")?;
        SECONDARY_THREAD.store(secondary, SeqCst);
        // SAFETY: the handle was just produced by the spawned thread.
        unsafe { thread_suspend(secondary as MachPort) };
        let primary = spawn_handler(recorder, "crash-recorder-mach-1")?;
        PRIMARY_THREAD.store(primary, SeqCst);
        Ok(())
    }

    fn spawn_handler(recorder: &'static Recorder, name: &str) -> anyhow::Result<u64> {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                // SAFETY: no preconditions.
                let self_port = unsafe { mach_thread_self() } as u64;
                let _ = tx.send(self_port);
                message_loop(recorder);
            })
            .map_err(|e| anyhow::anyhow!("failed to spawn exception handler thread: {e}"))?;
        let port = rx
            .recv()
            .map_err(|_| anyhow::anyhow!("exception handler thread died during startup"))?;
        crate::sentry::reserve_thread(port);
        Ok(port)
    }

    fn message_loop(recorder: &'static Recorder) {
        loop {
            let port = EXCEPTION_PORT.load(SeqCst);
            if port == MACH_PORT_NULL {
                return;
            }
            // SAFETY: request is a live out-buffer of the declared size.
            let mut request: ExceptionRequest = unsafe { core::mem::zeroed() };
            let kr = unsafe {
                mach_msg(
                    &mut request.header,
                    MACH_RCV_MSG,
                    0,
                    core::mem::size_of::<ExceptionRequest>() as u32,
                    port,
                    MACH_MSG_TIMEOUT_NONE,
                    MACH_PORT_NULL,
                )
            };
            if kr != KERN_SUCCESS {
                if !INSTALLED.load(SeqCst) {
                    return;
                }
                continue;
            }
            handle_exception(recorder, &request);
        }
    }

    fn handle_exception(recorder: &'static Recorder, request: &ExceptionRequest) {
        // SAFETY: no preconditions.
        let self_port = unsafe { mach_thread_self() } as u64;
        if self_port == PRIMARY_THREAD.load(SeqCst) {
            let secondary = SECONDARY_THREAD.load(SeqCst);
            if secondary != 0 {
                // Wake the spare: if recording below crashes, the kernel
                // hands the next exception to a live handler thread.
                // SAFETY: the handle belongs to our parked thread.
                unsafe { thread_resume(secondary as MachPort) };
            }
        }

        begin_trap(recorder, true);
        // SAFETY: exclusive inside the handling window.
        let ctx = unsafe { recorder.context_mut() };
        ctx.source = Some(CrashSource::MachException);
        ctx.offending_thread = request.thread.name as u64;
        ctx.mach = MachFault {
            exception: request.exception,
            code: if request.code_count > 0 { request.code[0] } else { 0 },
            subcode: if request.code_count > 1 { request.code[1] } else { 0 },
        };
        if request.exception == EXC_BAD_ACCESS {
            ctx.fault_address = ctx.mach.subcode as u64;
        }
        let offending = ctx.offending_thread;
        let crate::context::SentryContext { registers, registers_are_valid, .. } = &mut *ctx;
        *registers_are_valid = recorder.machine.thread_registers(offending, registers);

        (recorder.on_crash)(recorder);
        finish_trap(recorder);

        // finish_trap restored the previous ports; now tell the kernel we
        // did not handle the exception so default processing delivers it.
        let mut reply = ExceptionReply {
            header: request.header,
            ndr: request.ndr,
            return_code: KERN_FAILURE,
        };
        reply.header.msgh_bits = request.header.msgh_bits & MACH_MSGH_BITS_REMOTE_MASK;
        reply.header.msgh_size = core::mem::size_of::<ExceptionReply>() as u32;
        reply.header.msgh_remote_port = request.header.msgh_remote_port;
        reply.header.msgh_local_port = MACH_PORT_NULL;
        reply.header.msgh_id = request.header.msgh_id + 100;
        // SAFETY: reply is fully initialized and self-describing.
        unsafe {
            mach_msg(
                &mut reply.header,
                MACH_SEND_MSG,
                reply.header.msgh_size,
                0,
                MACH_PORT_NULL,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            );
        }
    }

    /// Restores the saved exception ports and tears down the handler
    /// machinery. Async-signal-safe: mach traps only.
    pub(crate) fn uninstall() {
        if !INSTALLED.swap(false, SeqCst) {
            return;
        }
        // SAFETY: PREVIOUS was filled during install; see its Sync note.
        unsafe {
            let task = mach_task_self();
            let count = (*PREVIOUS.count.get()).min(EXC_TYPES_COUNT as u32) as usize;
            let masks = &*PREVIOUS.masks.get();
            let ports = &*PREVIOUS.ports.get();
            let behaviors = &*PREVIOUS.behaviors.get();
            let flavors = &*PREVIOUS.flavors.get();
            for i in 0..count {
                task_set_exception_ports(task, masks[i], ports[i], behaviors[i], flavors[i]);
            }

            let port = EXCEPTION_PORT.swap(MACH_PORT_NULL, SeqCst);
            if port != MACH_PORT_NULL {
                mach_port_destroy(task, port);
            }

            // Tear down the handler threads unless the caller is one of
            // them (a handler tearing itself down exits via its loop).
            let self_port = mach_thread_self() as u64;
            for slot in [&PRIMARY_THREAD, &SECONDARY_THREAD] {
                let thread = slot.swap(0, SeqCst);
                if thread != 0 && thread != self_port {
                    thread_terminate(thread as MachPort);
                }
            }
        }
        crate::sentry::clear_reserved_threads();
    }
}
