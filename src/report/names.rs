// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Name and cross-source normalization tables for the report's `error`
//! block.
//!
//! The report always carries both a `mach` and a `signal` view of the
//! fault, whichever side actually delivered it; these tables translate in
//! both directions. The constants are the Mach ABI values and are stable on
//! every Darwin release, so they are spelled here rather than pulled from
//! platform headers (which non-Darwin builds of the portable sentries do
//! not have).

pub const EXC_BAD_ACCESS: i32 = 1;
pub const EXC_BAD_INSTRUCTION: i32 = 2;
pub const EXC_ARITHMETIC: i32 = 3;
pub const EXC_EMULATION: i32 = 4;
pub const EXC_SOFTWARE: i32 = 5;
pub const EXC_BREAKPOINT: i32 = 6;
pub const EXC_CRASH: i32 = 10;

pub const KERN_INVALID_ADDRESS: i64 = 1;
pub const KERN_PROTECTION_FAILURE: i64 = 2;

const EXC_UNIX_BAD_SYSCALL: i64 = 0x10000;
const EXC_UNIX_BAD_PIPE: i64 = 0x10001;
const EXC_UNIX_ABORT: i64 = 0x10002;

pub fn mach_exception_name(exception: i32) -> Option<&'static str> {
    Some(match exception {
        EXC_BAD_ACCESS => "EXC_BAD_ACCESS",
        EXC_BAD_INSTRUCTION => "EXC_BAD_INSTRUCTION",
        EXC_ARITHMETIC => "EXC_ARITHMETIC",
        EXC_EMULATION => "EXC_EMULATION",
        EXC_SOFTWARE => "EXC_SOFTWARE",
        EXC_BREAKPOINT => "EXC_BREAKPOINT",
        EXC_CRASH => "EXC_CRASH",
        _ => return None,
    })
}

pub fn mach_code_name(code: i64) -> Option<&'static str> {
    Some(match code {
        KERN_INVALID_ADDRESS => "KERN_INVALID_ADDRESS",
        KERN_PROTECTION_FAILURE => "KERN_PROTECTION_FAILURE",
        _ => return None,
    })
}

pub fn signal_name(signum: i32) -> Option<&'static str> {
    Some(match signum {
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGILL => "SIGILL",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGSYS => "SIGSYS",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGTERM => "SIGTERM",
        libc::SIGKILL => "SIGKILL",
        _ => return None,
    })
}

/// si_code names for the faulting signals we report.
pub fn signal_code_name(signum: i32, code: i32) -> Option<&'static str> {
    let name = match (signum, code) {
        (libc::SIGSEGV, 1) => "SEGV_MAPERR",
        (libc::SIGSEGV, 2) => "SEGV_ACCERR",
        (libc::SIGBUS, 1) => "BUS_ADRALN",
        (libc::SIGBUS, 2) => "BUS_ADRERR",
        (libc::SIGBUS, 3) => "BUS_OBJERR",
        (libc::SIGILL, 1) => "ILL_ILLOPC",
        (libc::SIGILL, 2) => "ILL_ILLOPN",
        (libc::SIGILL, 4) => "ILL_ILLTRP",
        (libc::SIGFPE, 7) => "FPE_INTDIV",
        (libc::SIGFPE, 1) => "FPE_FLTDIV",
        (libc::SIGTRAP, 1) => "TRAP_BRKPT",
        _ => return None,
    };
    Some(name)
}

/// Mach exception view of a signal-delivered fault.
pub fn mach_exception_for_signal(signum: i32) -> i32 {
    match signum {
        libc::SIGSEGV | libc::SIGBUS => EXC_BAD_ACCESS,
        libc::SIGILL => EXC_BAD_INSTRUCTION,
        libc::SIGFPE => EXC_ARITHMETIC,
        libc::SIGTRAP => EXC_BREAKPOINT,
        libc::SIGSYS | libc::SIGPIPE | libc::SIGABRT => EXC_SOFTWARE,
        _ => EXC_CRASH,
    }
}

/// Signal view of a kernel-delivered exception.
pub fn signal_for_mach_exception(exception: i32, code: i64) -> i32 {
    match exception {
        EXC_BAD_ACCESS => {
            if code == KERN_INVALID_ADDRESS {
                libc::SIGSEGV
            } else {
                libc::SIGBUS
            }
        }
        EXC_BAD_INSTRUCTION => libc::SIGILL,
        EXC_ARITHMETIC => libc::SIGFPE,
        EXC_BREAKPOINT => libc::SIGTRAP,
        EXC_SOFTWARE => match code {
            EXC_UNIX_BAD_SYSCALL => libc::SIGSYS,
            EXC_UNIX_BAD_PIPE => libc::SIGPIPE,
            EXC_UNIX_ABORT => libc::SIGABRT,
            _ => libc::SIGABRT,
        },
        _ => libc::SIGABRT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_to_mach_and_back() {
        assert_eq!(mach_exception_for_signal(libc::SIGSEGV), EXC_BAD_ACCESS);
        assert_eq!(
            signal_for_mach_exception(EXC_BAD_ACCESS, KERN_INVALID_ADDRESS),
            libc::SIGSEGV
        );
        assert_eq!(
            signal_for_mach_exception(EXC_BAD_ACCESS, KERN_PROTECTION_FAILURE),
            libc::SIGBUS
        );
        assert_eq!(signal_for_mach_exception(EXC_ARITHMETIC, 0), libc::SIGFPE);
        assert_eq!(
            signal_for_mach_exception(EXC_SOFTWARE, EXC_UNIX_BAD_PIPE),
            libc::SIGPIPE
        );
    }

    #[test]
    fn test_names() {
        assert_eq!(mach_exception_name(EXC_BAD_ACCESS), Some("EXC_BAD_ACCESS"));
        assert_eq!(mach_exception_name(99), None);
        assert_eq!(signal_name(libc::SIGSEGV), Some("SIGSEGV"));
        assert_eq!(signal_code_name(libc::SIGSEGV, 1), Some("SEGV_MAPERR"));
        assert_eq!(signal_code_name(libc::SIGSEGV, 99), None);
        assert_eq!(mach_code_name(KERN_INVALID_ADDRESS), Some("KERN_INVALID_ADDRESS"));
    }

    #[test]
    fn test_non_machine_sources_normalize_to_abort() {
        assert_eq!(mach_exception_for_signal(libc::SIGABRT), EXC_SOFTWARE);
        assert_eq!(signal_for_mach_exception(EXC_CRASH, 0), libc::SIGABRT);
    }
}
