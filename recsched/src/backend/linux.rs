/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The backend used against real tracees.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::fcntl::open;
use nix::fcntl::OFlag;
use nix::sys::ptrace;
use nix::sys::signal;
use nix::sys::signal::Signal;
use nix::sys::stat::Mode;
use nix::unistd;
use tracing::debug;
use tracing::trace;

use super::perf;
use super::BlockingWait;
use super::CounterBackend;
use super::ResourceBackend;
use super::WaitBackend;
use crate::task::CounterHandle;
use crate::task::Task;
use crate::types::Tid;

/// Drives tracees with `waitpid`, `ptrace`, `/proc` and `perf_event_open`.
#[derive(Debug)]
pub struct LinuxBackend {
    /// When false, counter calls only record that the task was armed.
    hpc: bool,
    /// Tasks that completed `ptrace_setup` and have not been detached.
    attached: BTreeSet<Tid>,
    /// Initial stops of auto-attached children that a blocking wait reported before the
    /// parent's clone event did. Claimed by `ptrace_setup`.
    early_stops: BTreeMap<Tid, i32>,
}

impl LinuxBackend {
    /// Create a backend, with or without hardware performance counters.
    pub fn new(hpc: bool) -> Self {
        if hpc && !perf::is_perf_supported() {
            tracing::warn!(
                "Performance counters requested but perf_event_open is unavailable; task registration will fail."
            );
        }
        LinuxBackend {
            hpc,
            attached: BTreeSet::new(),
            early_stops: BTreeMap::new(),
        }
    }

    fn waitpid(pid: libc::pid_t, flags: libc::c_int) -> Result<(libc::pid_t, i32), Errno> {
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(pid, &mut status, flags) };
        Errno::result(ret).map(|pid| (pid, status))
    }
}

impl WaitBackend for LinuxBackend {
    fn poll_nonblocking(&mut self, tid: Tid) -> Result<Option<i32>, Errno> {
        match Self::waitpid(tid.as_raw(), libc::WNOHANG | libc::__WALL)? {
            (0, _) => Ok(None),
            (_, status) => Ok(Some(status)),
        }
    }

    fn wait_blocking(&mut self) -> Result<BlockingWait, Errno> {
        loop {
            let (tid, status) = match Self::waitpid(-1, libc::__WALL | libc::WUNTRACED) {
                Ok((pid, status)) => (Tid::from_raw(pid), status),
                Err(Errno::EINTR) => return Ok(BlockingWait::Interrupted),
                Err(e) => return Err(e),
            };
            if self.attached.contains(&tid) {
                return Ok(BlockingWait::Changed(tid, status));
            }
            debug!(
                "tid {} stopped before its parent reported it (status {:#x}), holding",
                tid, status
            );
            self.early_stops.insert(tid, status);
        }
    }
}

impl CounterBackend for LinuxBackend {
    fn init(&mut self, task: &mut Task) -> Result<(), Errno> {
        let fd = if self.hpc {
            Some(perf::open_branch_counter(task.tid)?)
        } else {
            None
        };
        task.hpc = Some(CounterHandle {
            fd,
            threshold: None,
        });
        Ok(())
    }

    fn start(&mut self, task: &mut Task, threshold: u64) -> Result<(), Errno> {
        let hpc = task.hpc.as_mut().ok_or(Errno::EBADF)?;
        if let Some(fd) = hpc.fd {
            perf::arm(fd, threshold)?;
        }
        hpc.threshold = Some(threshold);
        Ok(())
    }

    fn stop_and_release(&mut self, task: &mut Task) {
        if let Some(CounterHandle { fd: Some(fd), .. }) = task.hpc.take() {
            if let Err(e) = perf::disarm_and_close(fd) {
                tracing::warn!("releasing counters of tid {}: {}", task.tid, e);
            }
        }
    }
}

impl ResourceBackend for LinuxBackend {
    fn open_memory_handle(&mut self, tid: Tid) -> Result<RawFd, Errno> {
        let path = format!("/proc/{}/mem", tid);
        open(
            path.as_str(),
            OFlag::O_RDWR | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
    }

    fn close(&mut self, fd: RawFd) -> Result<(), Errno> {
        unistd::close(fd)
    }

    fn ptrace_setup(&mut self, tid: Tid) -> Result<(), Errno> {
        // A new tracee (spawned with PTRACE_TRACEME, or auto-attached on clone) reports a
        // stop before anything else. Consume it so the first status the scheduler sees is
        // from the task actually running.
        let status = match self.early_stops.remove(&tid) {
            Some(status) => status,
            None => Self::waitpid(tid.as_raw(), libc::__WALL)?.1,
        };
        trace!("tid {} initial stop, status {:#x}", tid, status);
        ptrace::setoptions(
            tid.as_pid(),
            ptrace::Options::PTRACE_O_TRACESYSGOOD
                | ptrace::Options::PTRACE_O_TRACECLONE
                | ptrace::Options::PTRACE_O_TRACEFORK
                | ptrace::Options::PTRACE_O_TRACEVFORK
                | ptrace::Options::PTRACE_O_TRACEEXEC
                | ptrace::Options::PTRACE_O_TRACEEXIT,
        )?;
        self.attached.insert(tid);
        Ok(())
    }

    fn detach(&mut self, tid: Tid) -> Result<(), Errno> {
        self.attached.remove(&tid);
        self.early_stops.remove(&tid);
        match ptrace::detach(tid.as_pid(), None::<Signal>) {
            // Already gone: nothing left to detach from.
            Err(Errno::ESRCH) => {
                debug!("tid {} already reaped, skipping detach", tid);
                Ok(())
            }
            r => r,
        }
    }

    fn send_signal(&mut self, tid: Tid, sig: Signal) -> Result<(), Errno> {
        signal::kill(tid.as_pid(), sig)
    }
}
