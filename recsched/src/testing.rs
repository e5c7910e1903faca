/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A deterministic, in-memory backend for exercising the scheduler without tracees.
//!
//! Poll and blocking-wait answers are scripted up front; every call the scheduler makes
//! is appended to a log that tests can assert on. Handles are fake file descriptors that
//! are tracked until closed, so leaks and double-closes are visible.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::sys::signal::Signal;

use crate::backend::BlockingWait;
use crate::backend::CounterBackend;
use crate::backend::ResourceBackend;
use crate::backend::WaitBackend;
use crate::task::CounterHandle;
use crate::task::Task;
use crate::types::Tid;

/// One backend call, as observed by [`ScriptedBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    /// `poll_nonblocking(tid)`
    Poll(Tid),
    /// `wait_blocking()`
    WaitBlocking,
    /// `open_memory_handle(tid)`
    OpenMemory(Tid),
    /// `close(fd)`
    Close(RawFd),
    /// `ptrace_setup(tid)`
    PtraceSetup(Tid),
    /// `init(task)`
    CounterInit(Tid),
    /// `start(task, threshold)`
    CounterStart(Tid, u64),
    /// `stop_and_release(task)` on a task that had counters
    CounterRelease(Tid),
    /// `detach(tid)`
    Detach(Tid),
    /// `send_signal(tid, sig)`
    Signal(Tid, Signal),
}

/// Operations whose failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Op {
    OpenMemory,
    PtraceSetup,
    CounterInit,
    CounterStart,
}

/// See the module docs.
#[derive(Debug)]
pub struct ScriptedBackend {
    polls: HashMap<Tid, VecDeque<Result<Option<i32>, Errno>>>,
    waits: VecDeque<Result<BlockingWait, Errno>>,
    failures: HashMap<Op, Errno>,
    next_fd: RawFd,
    open_fds: BTreeSet<RawFd>,
    calls: Vec<Call>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    /// A backend on which every poll reports "no change" and no blocking wait is expected.
    pub fn new() -> Self {
        ScriptedBackend {
            polls: HashMap::new(),
            waits: VecDeque::new(),
            failures: HashMap::new(),
            next_fd: 100,
            open_fds: BTreeSet::new(),
            calls: Vec::new(),
        }
    }

    /// Queue the answer to the next poll of `tid`. Unscripted polls report no change.
    pub fn script_poll(&mut self, tid: Tid, status: Option<i32>) -> &mut Self {
        self.polls.entry(tid).or_default().push_back(Ok(status));
        self
    }

    /// Make the next poll of `tid` fail.
    pub fn script_poll_error(&mut self, tid: Tid, errno: Errno) -> &mut Self {
        self.polls.entry(tid).or_default().push_back(Err(errno));
        self
    }

    /// Queue the answer to the next blocking wait.
    pub fn script_wait(&mut self, wait: BlockingWait) -> &mut Self {
        self.waits.push_back(Ok(wait));
        self
    }

    /// Make the next blocking wait fail.
    pub fn script_wait_error(&mut self, errno: Errno) -> &mut Self {
        self.waits.push_back(Err(errno));
        self
    }

    /// Make the next `op` fail with `errno`.
    pub fn fail_next(&mut self, op: Op, errno: Errno) -> &mut Self {
        self.failures.insert(op, errno);
        self
    }

    /// Hand out a fresh tracked descriptor, e.g. to stand in for a descheduling notifier.
    pub fn alloc_fd(&mut self) -> RawFd {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.open_fds.insert(fd);
        fd
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    /// Forget the call log.
    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// How many logged calls satisfy `pred`.
    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    /// Descriptors handed out and not yet closed.
    pub fn open_fds(&self) -> &BTreeSet<RawFd> {
        &self.open_fds
    }

    /// Blocking waits still queued.
    pub fn pending_waits(&self) -> usize {
        self.waits.len()
    }

    fn injected(&mut self, op: Op) -> Result<(), Errno> {
        match self.failures.remove(&op) {
            Some(errno) => Err(errno),
            None => Ok(()),
        }
    }

    fn release_fd(&mut self, fd: RawFd) -> Result<(), Errno> {
        if self.open_fds.remove(&fd) {
            Ok(())
        } else {
            Err(Errno::EBADF)
        }
    }
}

impl WaitBackend for ScriptedBackend {
    fn poll_nonblocking(&mut self, tid: Tid) -> Result<Option<i32>, Errno> {
        self.calls.push(Call::Poll(tid));
        self.polls
            .get_mut(&tid)
            .and_then(|q| q.pop_front())
            .unwrap_or(Ok(None))
    }

    fn wait_blocking(&mut self) -> Result<BlockingWait, Errno> {
        self.calls.push(Call::WaitBlocking);
        self.waits
            .pop_front()
            .unwrap_or_else(|| panic!("blocking wait with nothing scripted: every task would hang"))
    }
}

impl CounterBackend for ScriptedBackend {
    fn init(&mut self, task: &mut Task) -> Result<(), Errno> {
        self.calls.push(Call::CounterInit(task.tid));
        self.injected(Op::CounterInit)?;
        let fd = self.alloc_fd();
        task.hpc = Some(CounterHandle {
            fd: Some(fd),
            threshold: None,
        });
        Ok(())
    }

    fn start(&mut self, task: &mut Task, threshold: u64) -> Result<(), Errno> {
        self.calls.push(Call::CounterStart(task.tid, threshold));
        self.injected(Op::CounterStart)?;
        let hpc = task.hpc.as_mut().ok_or(Errno::EBADF)?;
        hpc.threshold = Some(threshold);
        Ok(())
    }

    fn stop_and_release(&mut self, task: &mut Task) {
        if let Some(hpc) = task.hpc.take() {
            self.calls.push(Call::CounterRelease(task.tid));
            if let Some(fd) = hpc.fd {
                self.release_fd(fd)
                    .unwrap_or_else(|_| panic!("counter fd {} released twice", fd));
            }
        }
    }
}

impl ResourceBackend for ScriptedBackend {
    fn open_memory_handle(&mut self, tid: Tid) -> Result<RawFd, Errno> {
        self.calls.push(Call::OpenMemory(tid));
        self.injected(Op::OpenMemory)?;
        Ok(self.alloc_fd())
    }

    fn close(&mut self, fd: RawFd) -> Result<(), Errno> {
        self.calls.push(Call::Close(fd));
        self.release_fd(fd)
    }

    fn ptrace_setup(&mut self, tid: Tid) -> Result<(), Errno> {
        self.calls.push(Call::PtraceSetup(tid));
        self.injected(Op::PtraceSetup)
    }

    fn detach(&mut self, tid: Tid) -> Result<(), Errno> {
        self.calls.push(Call::Detach(tid));
        Ok(())
    }

    fn send_signal(&mut self, tid: Tid, sig: Signal) -> Result<(), Errno> {
        self.calls.push(Call::Signal(tid, sig));
        Ok(())
    }
}
