// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Machine introspection provider.
//!
//! Everything the recorder needs from the operating system at crash time —
//! thread enumeration and suspension, register capture, stack walking,
//! loaded-image metadata, guarded memory reads — is reached through the
//! [`Machine`] trait so the report writer and the sentries stay portable
//! and testable. The [`NativeMachine`] implementation covers the host OS;
//! on non-Darwin targets some operations degrade (no foreign-thread
//! registers, no thread suspension) and report that honestly through their
//! return values.
//!
//! # Signal Safety
//!
//! Every method on [`Machine`] may be called from a signal or exception
//! handler. Implementations must not allocate, lock, or use stdio.

use std::ffi::c_void;

/// Opaque thread identity. Mach thread port on Darwin, pthread handle
/// elsewhere.
pub type ThreadHandle = u64;

/// Upper bound on threads the recorder will enumerate.
pub const MAX_THREADS: usize = 128;

/// Upper bound on backtrace frames captured per thread.
pub const MAX_CAPTURED_FRAMES: usize = 250;

/// Largest register file we model (aarch64 needs 34 basic slots).
pub const MAX_REGISTERS: usize = 48;

#[derive(Debug, Clone, Copy, Default)]
pub struct Register {
    pub name: &'static str,
    pub value: u64,
}

/// A captured register file. `basic` holds the general-purpose set in the
/// platform's conventional order; `exception` holds the fault-describing
/// set and is only meaningful for the crashed thread.
#[derive(Debug, Clone, Copy)]
pub struct RegisterSet {
    pub basic: [Register; MAX_REGISTERS],
    pub basic_count: usize,
    pub exception: [Register; 8],
    pub exception_count: usize,
    pub instruction_pointer: u64,
    pub stack_pointer: u64,
    pub frame_pointer: u64,
}

impl Default for RegisterSet {
    fn default() -> Self {
        Self {
            basic: [Register::default(); MAX_REGISTERS],
            basic_count: 0,
            exception: [Register::default(); 8],
            exception_count: 0,
            instruction_pointer: 0,
            stack_pointer: 0,
            frame_pointer: 0,
        }
    }
}

impl RegisterSet {
    pub(crate) fn push_basic(&mut self, name: &'static str, value: u64) {
        if self.basic_count < MAX_REGISTERS {
            self.basic[self.basic_count] = Register { name, value };
            self.basic_count += 1;
        }
    }

    pub(crate) fn push_exception(&mut self, name: &'static str, value: u64) {
        if self.exception_count < self.exception.len() {
            self.exception[self.exception_count] = Register { name, value };
            self.exception_count += 1;
        }
    }

    pub fn basic_registers(&self) -> &[Register] {
        &self.basic[..self.basic_count]
    }

    pub fn exception_registers(&self) -> &[Register] {
        &self.exception[..self.exception_count]
    }

    /// Captures the register file out of a signal handler's ucontext.
    ///
    /// # Safety
    ///
    /// `ucontext` must be the pointer a signal handler received, or null
    /// (which yields `None`).
    pub unsafe fn from_ucontext(ucontext: *const libc::ucontext_t) -> Option<Self> {
        if ucontext.is_null() {
            return None;
        }
        let mut regs = RegisterSet::default();

        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        {
            let gregs = &(*ucontext).uc_mcontext.gregs;
            let g = |index: i32| gregs[index as usize] as u64;
            for (name, index) in [
                ("rax", libc::REG_RAX),
                ("rbx", libc::REG_RBX),
                ("rcx", libc::REG_RCX),
                ("rdx", libc::REG_RDX),
                ("rdi", libc::REG_RDI),
                ("rsi", libc::REG_RSI),
                ("rbp", libc::REG_RBP),
                ("rsp", libc::REG_RSP),
                ("r8", libc::REG_R8),
                ("r9", libc::REG_R9),
                ("r10", libc::REG_R10),
                ("r11", libc::REG_R11),
                ("r12", libc::REG_R12),
                ("r13", libc::REG_R13),
                ("r14", libc::REG_R14),
                ("r15", libc::REG_R15),
                ("rip", libc::REG_RIP),
                ("rflags", libc::REG_EFL),
            ] {
                regs.push_basic(name, g(index));
            }
            regs.push_exception("trapno", g(libc::REG_TRAPNO));
            regs.push_exception("err", g(libc::REG_ERR));
            regs.push_exception("faultvaddr", g(libc::REG_CR2));
            regs.instruction_pointer = g(libc::REG_RIP);
            regs.stack_pointer = g(libc::REG_RSP);
            regs.frame_pointer = g(libc::REG_RBP);
        }

        #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
        {
            let mctx = &(*ucontext).uc_mcontext;
            static X_NAMES: [&str; 29] = [
                "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12",
                "x13", "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23",
                "x24", "x25", "x26", "x27", "x28",
            ];
            for (i, name) in X_NAMES.iter().enumerate() {
                regs.push_basic(name, mctx.regs[i]);
            }
            regs.push_basic("fp", mctx.regs[29]);
            regs.push_basic("lr", mctx.regs[30]);
            regs.push_basic("sp", mctx.sp);
            regs.push_basic("pc", mctx.pc);
            regs.push_basic("cpsr", mctx.pstate);
            regs.push_exception("far", mctx.fault_address);
            regs.instruction_pointer = mctx.pc;
            regs.stack_pointer = mctx.sp;
            regs.frame_pointer = mctx.regs[29];
        }

        #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
        {
            let mcontext = (*ucontext).uc_mcontext;
            if mcontext.is_null() {
                return None;
            }
            let ss = &(*mcontext).__ss;
            for (name, value) in [
                ("rax", ss.__rax),
                ("rbx", ss.__rbx),
                ("rcx", ss.__rcx),
                ("rdx", ss.__rdx),
                ("rdi", ss.__rdi),
                ("rsi", ss.__rsi),
                ("rbp", ss.__rbp),
                ("rsp", ss.__rsp),
                ("r8", ss.__r8),
                ("r9", ss.__r9),
                ("r10", ss.__r10),
                ("r11", ss.__r11),
                ("r12", ss.__r12),
                ("r13", ss.__r13),
                ("r14", ss.__r14),
                ("r15", ss.__r15),
                ("rip", ss.__rip),
                ("rflags", ss.__rflags),
                ("cs", ss.__cs),
                ("fs", ss.__fs),
                ("gs", ss.__gs),
            ] {
                regs.push_basic(name, value);
            }
            let es = &(*mcontext).__es;
            regs.push_exception("trapno", es.__trapno as u64);
            regs.push_exception("err", es.__err as u64);
            regs.push_exception("faultvaddr", es.__faultvaddr);
            regs.instruction_pointer = ss.__rip;
            regs.stack_pointer = ss.__rsp;
            regs.frame_pointer = ss.__rbp;
        }

        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            let mcontext = (*ucontext).uc_mcontext;
            if mcontext.is_null() {
                return None;
            }
            let ss = &(*mcontext).__ss;
            static X_NAMES: [&str; 29] = [
                "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12",
                "x13", "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23",
                "x24", "x25", "x26", "x27", "x28",
            ];
            for (i, name) in X_NAMES.iter().enumerate() {
                regs.push_basic(name, ss.__x[i]);
            }
            regs.push_basic("fp", ss.__fp);
            regs.push_basic("lr", ss.__lr);
            regs.push_basic("sp", ss.__sp);
            regs.push_basic("pc", ss.__pc);
            regs.push_basic("cpsr", ss.__cpsr as u64);
            let es = &(*mcontext).__es;
            regs.push_exception("far", es.__far);
            regs.push_exception("esr", es.__esr as u64);
            regs.push_exception("exception", es.__exception as u64);
            regs.instruction_pointer = ss.__pc;
            regs.stack_pointer = ss.__sp;
            regs.frame_pointer = ss.__fp;
        }

        if regs.basic_count == 0 {
            return None;
        }
        Some(regs)
    }
}

/// One loaded binary image, as reported by the dynamic linker.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryImage<'a> {
    pub address: u64,
    pub vm_address: u64,
    pub size: u64,
    pub name: &'a str,
    pub uuid: Option<[u8; 16]>,
    pub cpu_type: i32,
    pub cpu_subtype: i32,
}

/// dladdr-style symbol lookup result. The strings point into linker-owned
/// tables that live as long as the image stays loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameSymbol {
    pub object_name: Option<&'static str>,
    pub object_address: u64,
    pub symbol_name: Option<&'static str>,
    pub symbol_address: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub usable: u64,
    pub free: u64,
}

/// The OS contract the recorder's core consumes. See the module docs for
/// the signal-safety requirements on implementations.
pub trait Machine: Sync {
    fn current_thread(&self) -> ThreadHandle;
    fn main_thread(&self) -> ThreadHandle;

    /// Fills `out` with every thread in the process, current thread
    /// included. Returns the count (0 if enumeration is unavailable).
    fn list_threads(&self, out: &mut [ThreadHandle]) -> usize;

    fn suspend_thread(&self, thread: ThreadHandle) -> bool;
    fn resume_thread(&self, thread: ThreadHandle) -> bool;

    /// Captures the register file of a suspended foreign thread.
    fn thread_registers(&self, thread: ThreadHandle, out: &mut RegisterSet) -> bool;

    /// Walks a thread's stack into `out`, innermost frame first. `regs`
    /// seeds the walk when present (crashed thread); otherwise the thread's
    /// own current state is used.
    fn backtrace(
        &self,
        thread: ThreadHandle,
        regs: Option<&RegisterSet>,
        out: &mut [usize],
    ) -> usize;

    /// Thread name into `out` (unterminated bytes); returns the length,
    /// 0 when the thread has no name or lookup is unsupported.
    fn thread_name(&self, thread: ThreadHandle, out: &mut [u8]) -> usize;

    /// Dispatch queue name serving `thread`, same convention as
    /// [`Machine::thread_name`].
    fn queue_name(&self, thread: ThreadHandle, out: &mut [u8]) -> usize;

    /// Guarded read of exactly `out.len()` bytes at `address`.
    fn safe_copy(&self, address: u64, out: &mut [u8]) -> bool;

    /// Guarded read of as many bytes as the page protections allow,
    /// starting at `address`. Returns the byte count actually copied.
    fn safe_copy_max(&self, address: u64, out: &mut [u8]) -> usize;

    /// Visits every loaded image.
    fn each_binary_image(&self, visit: &mut dyn FnMut(&BinaryImage<'_>));

    /// Symbol lookup for one instruction address.
    fn symbolicate(&self, address: u64) -> Option<FrameSymbol>;

    fn memory_stats(&self) -> MemoryStats;

    /// Schedules `work(context)` on the main thread's run loop / queue.
    /// Returns false when the platform has no such facility.
    fn post_to_main_thread(
        &self,
        work: unsafe extern "C" fn(*mut c_void),
        context: *mut c_void,
    ) -> bool;

    fn is_debugger_attached(&self) -> bool;
}

/// Validity gate for addresses we are about to chase without kernel help.
/// Mirrors the constraints a user-space pointer must satisfy; it does not
/// guarantee readability, which is what the guarded copies are for.
#[inline]
pub(crate) fn is_plausible_address(addr: usize) -> bool {
    if addr < 4096 {
        return false;
    }
    if addr % core::mem::size_of::<usize>() != 0 {
        return false;
    }
    #[cfg(target_pointer_width = "64")]
    {
        if addr > 0x0000_7FFF_FFFF_FFFF {
            return false;
        }
    }
    true
}

/// Walks a frame-pointer chain with guarded reads.
///
/// Each frame record is `[saved fp, return address]` at the frame pointer.
/// The walk stops at the first implausible pointer, zero return address, or
/// non-monotonic frame chain.
pub(crate) fn walk_frame_chain(
    machine: &dyn Machine,
    ip: usize,
    sp: usize,
    fp: usize,
    out: &mut [usize],
) -> usize {
    if out.is_empty() {
        return 0;
    }
    let mut count = 0;
    out[count] = ip;
    count += 1;

    let word = core::mem::size_of::<usize>();
    let mut current_fp = fp;
    let mut current_sp = sp;

    while count < out.len() {
        if !is_plausible_address(current_fp) || current_fp < current_sp {
            break;
        }
        // Frame pointer shouldn't be absurdly far from the stack pointer.
        if current_fp.saturating_sub(current_sp) > 1024 * 1024 {
            break;
        }
        let mut record = [0u8; 16];
        if !machine.safe_copy(current_fp as u64, &mut record) {
            break;
        }
        let saved_fp = usize::from_ne_bytes(record[..word].try_into().unwrap_or_default());
        let return_addr = usize::from_ne_bytes(record[word..].try_into().unwrap_or_default());
        if return_addr == 0 || !is_plausible_address(return_addr & !1) {
            break;
        }
        out[count] = return_addr;
        count += 1;
        if saved_fp != 0 && saved_fp <= current_fp {
            break;
        }
        current_sp = current_fp;
        current_fp = saved_fp;
        if current_fp == 0 {
            break;
        }
    }
    count
}

/// Native provider for the host OS.
pub struct NativeMachine;

pub static NATIVE_MACHINE: NativeMachine = NativeMachine;

#[cfg(target_os = "macos")]
mod darwin {
    use super::*;
    use std::ffi::CStr;

    pub type MachPort = u32;
    type KernReturn = i32;
    const KERN_SUCCESS: KernReturn = 0;

    extern "C" {
        fn mach_task_self() -> MachPort;
        fn mach_thread_self() -> MachPort;
        fn thread_suspend(thread: MachPort) -> KernReturn;
        fn thread_resume(thread: MachPort) -> KernReturn;
        fn task_threads(
            task: MachPort,
            thread_list: *mut *mut MachPort,
            count: *mut u32,
        ) -> KernReturn;
        fn vm_read_overwrite(
            task: MachPort,
            address: usize,
            size: usize,
            data: usize,
            out_size: *mut usize,
        ) -> KernReturn;
        fn thread_get_state(
            thread: MachPort,
            flavor: i32,
            state: *mut u32,
            count: *mut u32,
        ) -> KernReturn;
        fn pthread_from_mach_thread_np(thread: MachPort) -> libc::pthread_t;
        fn pthread_getname_np(
            thread: libc::pthread_t,
            name: *mut libc::c_char,
            len: usize,
        ) -> libc::c_int;

        fn _dyld_image_count() -> u32;
        fn _dyld_get_image_header(index: u32) -> *const MachHeader;
        fn _dyld_get_image_vmaddr_slide(index: u32) -> isize;
        fn _dyld_get_image_name(index: u32) -> *const libc::c_char;

        static _dispatch_main_q: u8;
        fn dispatch_async_f(
            queue: *const u8,
            context: *mut c_void,
            work: unsafe extern "C" fn(*mut c_void),
        );
    }

    // Mach-O constants for walking load commands.
    const LC_SEGMENT_64: u32 = 0x19;
    const LC_UUID: u32 = 0x1b;
    const SEG_TEXT: &[u8] = b"__TEXT\0\0\0\0\0\0\0\0\0\0";

    #[repr(C)]
    pub struct MachHeader {
        magic: u32,
        cputype: i32,
        cpusubtype: i32,
        filetype: u32,
        ncmds: u32,
        sizeofcmds: u32,
        flags: u32,
        reserved: u32,
    }

    #[repr(C)]
    struct LoadCommand {
        cmd: u32,
        cmdsize: u32,
    }

    #[repr(C)]
    struct SegmentCommand64 {
        cmd: u32,
        cmdsize: u32,
        segname: [u8; 16],
        vmaddr: u64,
        vmsize: u64,
        fileoff: u64,
        filesize: u64,
        maxprot: i32,
        minprot: i32,
        nsects: u32,
        flags: u32,
    }

    #[repr(C)]
    struct UuidCommand {
        cmd: u32,
        cmdsize: u32,
        uuid: [u8; 16],
    }

    pub fn suspend(thread: ThreadHandle) -> bool {
        // SAFETY: suspending an invalid port returns an error code.
        unsafe { thread_suspend(thread as MachPort) == KERN_SUCCESS }
    }

    pub fn resume(thread: ThreadHandle) -> bool {
        // SAFETY: as above.
        unsafe { thread_resume(thread as MachPort) == KERN_SUCCESS }
    }

    pub fn self_thread() -> ThreadHandle {
        // SAFETY: no preconditions.
        unsafe { mach_thread_self() as ThreadHandle }
    }

    pub fn list(out: &mut [ThreadHandle]) -> usize {
        let mut list: *mut MachPort = std::ptr::null_mut();
        let mut count: u32 = 0;
        // SAFETY: out-pointers are valid; the kernel allocates the list.
        if unsafe { task_threads(mach_task_self(), &mut list, &mut count) } != KERN_SUCCESS {
            return 0;
        }
        let n = (count as usize).min(out.len());
        for i in 0..n {
            // SAFETY: the kernel returned `count` valid entries.
            out[i] = unsafe { *list.add(i) } as ThreadHandle;
        }
        // The kernel-allocated list is left in place: deallocating it needs
        // vm_deallocate, which is safe here, but the couple of hundred bytes
        // are irrelevant in a crashing process.
        n
    }

    pub fn copy_mem(address: u64, out: &mut [u8]) -> bool {
        let mut copied: usize = 0;
        // SAFETY: destination pointer/length describe a live buffer.
        let kr = unsafe {
            vm_read_overwrite(
                mach_task_self(),
                address as usize,
                out.len(),
                out.as_mut_ptr() as usize,
                &mut copied,
            )
        };
        kr == KERN_SUCCESS && copied == out.len()
    }

    pub fn registers(thread: ThreadHandle, out: &mut RegisterSet) -> bool {
        #[cfg(target_arch = "x86_64")]
        const FLAVOR: i32 = 4; // x86_THREAD_STATE64
        #[cfg(target_arch = "x86_64")]
        const COUNT: u32 = 42;
        #[cfg(target_arch = "aarch64")]
        const FLAVOR: i32 = 6; // ARM_THREAD_STATE64
        #[cfg(target_arch = "aarch64")]
        const COUNT: u32 = 68;

        let mut state = [0u32; 128];
        let mut count = COUNT;
        // SAFETY: state is large enough for either flavor's count.
        let kr = unsafe { thread_get_state(thread as MachPort, FLAVOR, state.as_mut_ptr(), &mut count) };
        if kr != KERN_SUCCESS {
            return false;
        }
        let words: &[u64] =
            // SAFETY: reinterpreting the filled prefix as u64 pairs; the
            // thread state structs are arrays of 64-bit registers.
            unsafe { core::slice::from_raw_parts(state.as_ptr() as *const u64, (count / 2) as usize) };

        #[cfg(target_arch = "x86_64")]
        {
            static NAMES: [&str; 21] = [
                "rax", "rbx", "rcx", "rdx", "rdi", "rsi", "rbp", "rsp", "r8", "r9", "r10", "r11",
                "r12", "r13", "r14", "r15", "rip", "rflags", "cs", "fs", "gs",
            ];
            for (i, name) in NAMES.iter().enumerate() {
                if i < words.len() {
                    out.push_basic(name, words[i]);
                }
            }
            out.instruction_pointer = words.get(16).copied().unwrap_or(0);
            out.stack_pointer = words.get(7).copied().unwrap_or(0);
            out.frame_pointer = words.get(6).copied().unwrap_or(0);
        }
        #[cfg(target_arch = "aarch64")]
        {
            for i in 0..29 {
                static X_NAMES: [&str; 29] = [
                    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11",
                    "x12", "x13", "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22",
                    "x23", "x24", "x25", "x26", "x27", "x28",
                ];
                if i < words.len() {
                    out.push_basic(X_NAMES[i], words[i]);
                }
            }
            out.push_basic("fp", words.get(29).copied().unwrap_or(0));
            out.push_basic("lr", words.get(30).copied().unwrap_or(0));
            out.push_basic("sp", words.get(31).copied().unwrap_or(0));
            out.push_basic("pc", words.get(32).copied().unwrap_or(0));
            out.push_basic("cpsr", words.get(33).copied().unwrap_or(0));
            out.instruction_pointer = words.get(32).copied().unwrap_or(0);
            out.stack_pointer = words.get(31).copied().unwrap_or(0);
            out.frame_pointer = words.get(29).copied().unwrap_or(0);
        }
        out.basic_count > 0
    }

    pub fn name_of(thread: ThreadHandle, out: &mut [u8]) -> usize {
        let mut buf = [0 as libc::c_char; 64];
        // SAFETY: converting a mach port we enumerated; a dead thread
        // yields a null pthread, checked below.
        let pthread = unsafe { pthread_from_mach_thread_np(thread as MachPort) };
        if pthread == 0 as libc::pthread_t {
            return 0;
        }
        // SAFETY: buf is a valid out-buffer of the stated length.
        if unsafe { pthread_getname_np(pthread, buf.as_mut_ptr(), buf.len()) } != 0 {
            return 0;
        }
        // SAFETY: the call NUL-terminates on success.
        let name = unsafe { CStr::from_ptr(buf.as_ptr()) }.to_bytes();
        let n = name.len().min(out.len());
        out[..n].copy_from_slice(&name[..n]);
        n
    }

    pub fn each_image(visit: &mut dyn FnMut(&BinaryImage<'_>)) {
        // SAFETY: dyld calls have no preconditions; indices are re-checked
        // by dyld itself and return null when stale.
        unsafe {
            let count = _dyld_image_count();
            for index in 0..count {
                let header = _dyld_get_image_header(index);
                let name_ptr = _dyld_get_image_name(index);
                if header.is_null() || name_ptr.is_null() {
                    continue;
                }
                let slide = _dyld_get_image_vmaddr_slide(index);
                let name = CStr::from_ptr(name_ptr).to_str().unwrap_or("");

                let mut image = BinaryImage {
                    address: header as u64,
                    name,
                    cpu_type: (*header).cputype,
                    cpu_subtype: (*header).cpusubtype,
                    ..Default::default()
                };

                // Walk the load commands for the TEXT segment and UUID.
                let mut cmd_ptr = (header as *const u8).add(core::mem::size_of::<MachHeader>());
                for _ in 0..(*header).ncmds {
                    let cmd = &*(cmd_ptr as *const LoadCommand);
                    match cmd.cmd {
                        LC_SEGMENT_64 => {
                            let seg = &*(cmd_ptr as *const SegmentCommand64);
                            if &seg.segname[..] == SEG_TEXT {
                                image.vm_address = seg.vmaddr;
                                image.size = seg.vmsize;
                                image.address = seg.vmaddr.wrapping_add(slide as u64);
                            }
                        }
                        LC_UUID => {
                            let uuid_cmd = &*(cmd_ptr as *const UuidCommand);
                            image.uuid = Some(uuid_cmd.uuid);
                        }
                        _ => {}
                    }
                    cmd_ptr = cmd_ptr.add(cmd.cmdsize as usize);
                }
                visit(&image);
            }
        }
    }

    pub fn stats() -> MemoryStats {
        let mut usable: u64 = 0;
        let mut size = core::mem::size_of::<u64>();
        let mut mib = [libc::CTL_HW, libc::HW_MEMSIZE];
        // SAFETY: mib and out-buffer are valid for the stated lengths.
        unsafe {
            libc::sysctl(
                mib.as_mut_ptr(),
                2,
                &mut usable as *mut u64 as *mut c_void,
                &mut size,
                std::ptr::null_mut(),
                0,
            );
        }
        // Free memory needs host_statistics; the uploader recomputes it
        // anyway, so report usable only when the finer call is unavailable.
        MemoryStats { usable, free: 0 }
    }

    pub fn post_main(work: unsafe extern "C" fn(*mut c_void), context: *mut c_void) -> bool {
        // SAFETY: the main queue is a static provided by libdispatch.
        unsafe { dispatch_async_f(&_dispatch_main_q, context, work) };
        true
    }

    pub fn debugger_attached() -> bool {
        #[repr(C)]
        struct KinfoProc {
            padding: [u8; 32],
            p_flag: i32,
            rest: [u8; 600],
        }
        const P_TRACED: i32 = 0x00000800;
        let mut mib = [
            libc::CTL_KERN,
            libc::KERN_PROC,
            libc::KERN_PROC_PID,
            // SAFETY: getpid has no preconditions.
            unsafe { libc::getpid() },
        ];
        let mut info: KinfoProc = KinfoProc {
            padding: [0; 32],
            p_flag: 0,
            rest: [0; 600],
        };
        let mut size = core::mem::size_of::<KinfoProc>();
        // SAFETY: mib/out-buffer are valid for the stated lengths.
        let rc = unsafe {
            libc::sysctl(
                mib.as_mut_ptr(),
                4,
                &mut info as *mut KinfoProc as *mut c_void,
                &mut size,
                std::ptr::null_mut(),
                0,
            )
        };
        rc == 0 && (info.p_flag & P_TRACED) != 0
    }

    pub fn queue_name_of(_thread: ThreadHandle, _out: &mut [u8]) -> usize {
        // Queue discovery needs private libdispatch introspection; report
        // nothing rather than poke at unstable structures.
        0
    }
}

impl Machine for NativeMachine {
    fn current_thread(&self) -> ThreadHandle {
        #[cfg(target_os = "macos")]
        {
            darwin::self_thread()
        }
        #[cfg(not(target_os = "macos"))]
        {
            // SAFETY: no preconditions.
            unsafe { libc::pthread_self() as ThreadHandle }
        }
    }

    fn main_thread(&self) -> ThreadHandle {
        use std::sync::atomic::{AtomicU64, Ordering};
        // First caller wins; install() runs on the main thread by contract,
        // so this pins the right handle.
        static MAIN_THREAD: AtomicU64 = AtomicU64::new(0);
        let current = self.current_thread();
        match MAIN_THREAD.compare_exchange(0, current, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => current,
            Err(existing) => existing,
        }
    }

    fn list_threads(&self, out: &mut [ThreadHandle]) -> usize {
        #[cfg(target_os = "macos")]
        {
            darwin::list(out)
        }
        #[cfg(not(target_os = "macos"))]
        {
            if out.is_empty() {
                return 0;
            }
            out[0] = self.current_thread();
            1
        }
    }

    fn suspend_thread(&self, thread: ThreadHandle) -> bool {
        #[cfg(target_os = "macos")]
        {
            darwin::suspend(thread)
        }
        #[cfg(not(target_os = "macos"))]
        {
            let _ = thread;
            false
        }
    }

    fn resume_thread(&self, thread: ThreadHandle) -> bool {
        #[cfg(target_os = "macos")]
        {
            darwin::resume(thread)
        }
        #[cfg(not(target_os = "macos"))]
        {
            let _ = thread;
            false
        }
    }

    fn thread_registers(&self, thread: ThreadHandle, out: &mut RegisterSet) -> bool {
        #[cfg(target_os = "macos")]
        {
            darwin::registers(thread, out)
        }
        #[cfg(not(target_os = "macos"))]
        {
            let _ = (thread, out);
            false
        }
    }

    fn backtrace(
        &self,
        thread: ThreadHandle,
        regs: Option<&RegisterSet>,
        out: &mut [usize],
    ) -> usize {
        if let Some(regs) = regs {
            return walk_frame_chain(
                self,
                regs.instruction_pointer as usize,
                regs.stack_pointer as usize,
                regs.frame_pointer as usize,
                out,
            );
        }
        if thread == self.current_thread() {
            #[cfg(any(target_os = "macos", all(target_os = "linux", target_env = "gnu")))]
            {
                // SAFETY: out is a live buffer; backtrace writes at most len.
                let n = unsafe {
                    libc::backtrace(out.as_mut_ptr() as *mut *mut c_void, out.len() as libc::c_int)
                };
                return n.max(0) as usize;
            }
            #[cfg(not(any(target_os = "macos", all(target_os = "linux", target_env = "gnu"))))]
            {
                return 0;
            }
        }
        // A foreign thread with no seed registers: capture them first.
        let mut captured = RegisterSet::default();
        if self.thread_registers(thread, &mut captured) {
            return walk_frame_chain(
                self,
                captured.instruction_pointer as usize,
                captured.stack_pointer as usize,
                captured.frame_pointer as usize,
                out,
            );
        }
        0
    }

    fn thread_name(&self, thread: ThreadHandle, out: &mut [u8]) -> usize {
        #[cfg(target_os = "macos")]
        {
            darwin::name_of(thread, out)
        }
        #[cfg(not(target_os = "macos"))]
        {
            if thread != self.current_thread() {
                return 0;
            }
            let mut buf = [0 as libc::c_char; 64];
            // SAFETY: buf is a valid out-buffer of the stated length.
            let rc = unsafe {
                libc::pthread_getname_np(libc::pthread_self(), buf.as_mut_ptr(), buf.len())
            };
            if rc != 0 {
                return 0;
            }
            // SAFETY: pthread_getname_np NUL-terminates on success.
            let name = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) }.to_bytes();
            let n = name.len().min(out.len());
            out[..n].copy_from_slice(&name[..n]);
            n
        }
    }

    fn queue_name(&self, thread: ThreadHandle, out: &mut [u8]) -> usize {
        #[cfg(target_os = "macos")]
        {
            darwin::queue_name_of(thread, out)
        }
        #[cfg(not(target_os = "macos"))]
        {
            let _ = (thread, out);
            0
        }
    }

    fn safe_copy(&self, address: u64, out: &mut [u8]) -> bool {
        #[cfg(target_os = "macos")]
        {
            darwin::copy_mem(address, out)
        }
        #[cfg(not(target_os = "macos"))]
        {
            let local = libc::iovec {
                iov_base: out.as_mut_ptr() as *mut c_void,
                iov_len: out.len(),
            };
            let remote = libc::iovec {
                iov_base: address as usize as *mut c_void,
                iov_len: out.len(),
            };
            // SAFETY: reading our own address space; the kernel validates
            // the remote range and fails with EFAULT instead of faulting us.
            let copied = unsafe {
                libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0)
            };
            copied == out.len() as isize
        }
    }

    fn safe_copy_max(&self, address: u64, out: &mut [u8]) -> usize {
        if self.safe_copy(address, out) {
            return out.len();
        }
        // Retry page by page so a dump that straddles an unmapped page
        // still yields its readable prefix.
        let page = page_size::get() as u64;
        let mut copied = 0usize;
        while copied < out.len() {
            let next_boundary = ((address + copied as u64) / page + 1) * page;
            let chunk_len = ((next_boundary - (address + copied as u64)) as usize)
                .min(out.len() - copied);
            let chunk = &mut out[copied..copied + chunk_len];
            if !self.safe_copy(address + copied as u64, chunk) {
                break;
            }
            copied += chunk_len;
        }
        copied
    }

    fn each_binary_image(&self, visit: &mut dyn FnMut(&BinaryImage<'_>)) {
        #[cfg(target_os = "macos")]
        {
            darwin::each_image(visit)
        }
        #[cfg(not(target_os = "macos"))]
        {
            let _ = visit;
        }
    }

    fn symbolicate(&self, address: u64) -> Option<FrameSymbol> {
        let mut info = libc::Dl_info {
            dli_fname: std::ptr::null(),
            dli_fbase: std::ptr::null_mut(),
            dli_sname: std::ptr::null(),
            dli_saddr: std::ptr::null_mut(),
        };
        // SAFETY: dladdr tolerates arbitrary addresses and fills info only
        // on success.
        if unsafe { libc::dladdr(address as *const c_void, &mut info) } == 0 {
            return None;
        }
        // SAFETY: non-null dladdr strings point into linker tables that are
        // never unloaded for images in the crash set.
        let to_static = |ptr: *const libc::c_char| -> Option<&'static str> {
            if ptr.is_null() {
                return None;
            }
            unsafe { std::ffi::CStr::from_ptr(ptr) }.to_str().ok()
        };
        Some(FrameSymbol {
            object_name: to_static(info.dli_fname),
            object_address: info.dli_fbase as u64,
            symbol_name: to_static(info.dli_sname),
            symbol_address: info.dli_saddr as u64,
        })
    }

    fn memory_stats(&self) -> MemoryStats {
        #[cfg(target_os = "macos")]
        {
            darwin::stats()
        }
        #[cfg(target_os = "linux")]
        {
            let mut info: libc::sysinfo = unsafe { core::mem::zeroed() };
            // SAFETY: info is a valid out-pointer.
            if unsafe { libc::sysinfo(&mut info) } != 0 {
                return MemoryStats::default();
            }
            MemoryStats {
                usable: info.totalram as u64 * info.mem_unit as u64,
                free: info.freeram as u64 * info.mem_unit as u64,
            }
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            MemoryStats::default()
        }
    }

    fn post_to_main_thread(
        &self,
        work: unsafe extern "C" fn(*mut c_void),
        context: *mut c_void,
    ) -> bool {
        #[cfg(target_os = "macos")]
        {
            darwin::post_main(work, context)
        }
        #[cfg(not(target_os = "macos"))]
        {
            let _ = (work, context);
            false
        }
    }

    fn is_debugger_attached(&self) -> bool {
        #[cfg(target_os = "macos")]
        {
            darwin::debugger_attached()
        }
        #[cfg(target_os = "linux")]
        {
            let status = match std::fs::read_to_string("/proc/self/status") {
                Ok(s) => s,
                Err(_) => return false,
            };
            status
                .lines()
                .find_map(|line| line.strip_prefix("TracerPid:"))
                .map(|rest| rest.trim() != "0")
                .unwrap_or(false)
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plausible_address_gate() {
        assert!(!is_plausible_address(0));
        assert!(!is_plausible_address(100));
        assert!(!is_plausible_address(4097));
        assert!(is_plausible_address(0x7FFF_0000_0000));
        #[cfg(target_pointer_width = "64")]
        assert!(!is_plausible_address(0xFFFF_8000_0000_0000));
    }

    #[test]
    fn test_safe_copy_reads_own_memory() {
        let machine = NativeMachine;
        let data: [u8; 16] = *b"recognizable bit";
        let mut out = [0u8; 16];
        assert!(machine.safe_copy(data.as_ptr() as u64, &mut out));
        assert_eq!(out, data);
    }

    #[test]
    fn test_safe_copy_rejects_null_page() {
        let machine = NativeMachine;
        let mut out = [0u8; 8];
        assert!(!machine.safe_copy(16, &mut out));
    }

    #[test]
    fn test_safe_copy_max_partial() {
        let machine = NativeMachine;
        let data = vec![0xAAu8; 64];
        let mut out = [0u8; 64];
        assert_eq!(machine.safe_copy_max(data.as_ptr() as u64, &mut out), 64);
    }

    #[test]
    fn test_symbolicate_known_function() {
        let machine = NativeMachine;
        let symbol = machine.symbolicate(libc::getpid as usize as u64);
        let symbol = symbol.expect("dladdr should resolve a libc function");
        assert!(symbol.object_address != 0);
    }

    #[test]
    fn test_current_thread_stable() {
        let machine = NativeMachine;
        assert_eq!(machine.current_thread(), machine.current_thread());
    }

    #[test]
    fn test_memory_stats_populated() {
        let machine = NativeMachine;
        let stats = machine.memory_stats();
        #[cfg(any(target_os = "macos", target_os = "linux"))]
        assert!(stats.usable > 0);
        let _ = stats;
    }
}
