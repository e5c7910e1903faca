/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Minimal `perf_event_open` plumbing: one retired-branch counter per task that signals
//! the task once a threshold is crossed.

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::sys::signal::Signal;

use crate::types::Tid;

/// Delivered to a task whose counter overflowed. The step loop swallows it.
pub const TIME_SLICE_SIGNAL: Signal = Signal::SIGSTKFLT;

const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
const PERF_ATTR_SIZE_VER0: u32 = 64;
const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

const ATTR_DISABLED: u64 = 1 << 0;
const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
const ATTR_EXCLUDE_HV: u64 = 1 << 6;

// _IO('$', n) and _IOW('$', 4, u64).
const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
const PERF_EVENT_IOC_RESET: libc::c_ulong = 0x2403;
const PERF_EVENT_IOC_PERIOD: libc::c_ulong = 0x4008_2404;

const F_SETSIG: libc::c_int = 10;
const F_SETOWN_EX: libc::c_int = 15;
const F_OWNER_TID: libc::c_int = 0;

/// Period used until the counter is started; the kernel only accepts a later period
/// change on an event that was opened as a sampling event.
const PARKED_PERIOD: u64 = 1 << 62;

/// The first `PERF_ATTR_SIZE_VER0` bytes of `struct perf_event_attr`. The bitfield word
/// is `flags`.
#[repr(C)]
#[derive(Default)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
}

#[repr(C)]
struct FOwnerEx {
    type_: libc::c_int,
    pid: libc::pid_t,
}

fn perf_event_open(attr: &PerfEventAttr, tid: libc::pid_t) -> Result<RawFd, Errno> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            tid,
            -1 as libc::c_int,
            -1 as libc::c_int,
            PERF_FLAG_FD_CLOEXEC,
        )
    };
    Errno::result(ret).map(|fd| fd as RawFd)
}

fn ioctl(fd: RawFd, request: libc::c_ulong, arg: libc::c_ulong) -> Result<(), Errno> {
    Errno::result(unsafe { libc::ioctl(fd, request as _, arg) }).map(drop)
}

fn branch_attr() -> PerfEventAttr {
    PerfEventAttr {
        type_: PERF_TYPE_HARDWARE,
        size: PERF_ATTR_SIZE_VER0,
        config: PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
        sample_period: PARKED_PERIOD,
        flags: ATTR_DISABLED | ATTR_EXCLUDE_KERNEL | ATTR_EXCLUDE_HV,
        ..Default::default()
    }
}

/// Can this process open a branch counter at all?
pub fn is_perf_supported() -> bool {
    match perf_event_open(&branch_attr(), 0) {
        Ok(fd) => {
            let _ = nix::unistd::close(fd);
            true
        }
        Err(_) => false,
    }
}

/// Open a stopped branch counter on `tid` whose overflow is signalled to `tid` itself.
pub(crate) fn open_branch_counter(tid: Tid) -> Result<RawFd, Errno> {
    let fd = perf_event_open(&branch_attr(), tid.as_raw())?;
    let owner = FOwnerEx {
        type_: F_OWNER_TID,
        pid: tid.as_raw(),
    };
    let routed = Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_ASYNC) })
        .and_then(|_| {
            Errno::result(unsafe { libc::fcntl(fd, F_SETOWN_EX, &owner as *const FOwnerEx) })
        })
        .and_then(|_| {
            Errno::result(unsafe { libc::fcntl(fd, F_SETSIG, TIME_SLICE_SIGNAL as libc::c_int) })
        });
    if let Err(e) = routed {
        let _ = nix::unistd::close(fd);
        return Err(e);
    }
    Ok(fd)
}

/// Reset the counter and let it run until `period` more branches retire.
pub(crate) fn arm(fd: RawFd, period: u64) -> Result<(), Errno> {
    Errno::result(unsafe {
        libc::ioctl(fd, PERF_EVENT_IOC_PERIOD as _, &period as *const u64)
    })?;
    ioctl(fd, PERF_EVENT_IOC_RESET, 0)?;
    ioctl(fd, PERF_EVENT_IOC_ENABLE, 0)
}

/// Stop counting and close.
pub(crate) fn disarm_and_close(fd: RawFd) -> Result<(), Errno> {
    let stopped = ioctl(fd, PERF_EVENT_IOC_DISABLE, 0);
    nix::unistd::close(fd)?;
    stopped
}
