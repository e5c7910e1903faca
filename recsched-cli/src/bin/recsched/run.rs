/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Error;
use clap::AppSettings;
use clap::Parser;
use colored::Colorize;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal;
use nix::sys::signal::SigHandler;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::execvp;
use nix::unistd::fork;
use nix::unistd::ForkResult;
use recsched::backend::TIME_SLICE_SIGNAL;
use recsched::types::ExecState;
use recsched::types::Tid;
use recsched::Config;
use recsched::LinuxBackend;
use recsched::Scheduler;
use recsched::TaskHandle;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::global_opts::GlobalOpts;

/// Command-line options for the "run" subcommand.
#[derive(Debug, Parser, Clone)]
#[clap(setting = AppSettings::TrailingVarArg)]
pub struct RunOpts {
    /// Program to run.
    #[clap(value_name = "PROGRAM")]
    program: PathBuf,

    /// Arguments for the program.
    #[clap(value_name = "ARGS")]
    args: Vec<String>,

    /// Scheduler configuration.
    #[clap(flatten)]
    config: Config,

    /// Print the scheduler's statistics to stderr, as JSON, before exiting.
    #[clap(long, short = 'u')]
    summary: bool,
}

/// How the root task of a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited normally with this code.
    Exited(i32),
    /// Killed by this signal.
    Signaled(Signal),
}

impl ExitStatus {
    /// Exit the current process the way the root task did: with the same code, or by the
    /// same signal.
    pub fn raise_or_exit(self) -> ! {
        match self {
            ExitStatus::Exited(code) => std::process::exit(code),
            ExitStatus::Signaled(sig) => {
                // SAFETY: restoring the default disposition installs no handler code.
                let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
                let _ = signal::raise(sig);
                // Not every signal is fatal by default; fall back to the shell convention.
                std::process::exit(128 + sig as i32)
            }
        }
    }
}

impl RunOpts {
    pub fn main(&self, global: &GlobalOpts) -> Result<ExitStatus, Error> {
        let _guard = global.init_tracing()?;
        self.config.validate();

        let argv = self.argv()?;
        let root = spawn_traced(&argv)
            .with_context(|| format!("Failed to launch {}", self.program.display()))?;
        info!("Launched {:?} as tid {}", self.program, root);

        let mut sched = Scheduler::new(&self.config, LinuxBackend::new(self.config.hpc));
        let status = sched
            .register(None, root, self.config.max_rbc)
            .with_context(|| format!("Failed to register root task {}", root))
            .and_then(|_| supervise(&mut sched, root, &self.config));

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                warn!("Tearing down {} remaining task(s)", sched.active_count());
                sched.terminate_all();
                return Err(e);
            }
        };

        if self.summary {
            eprintln!(
                "{}",
                " ---------------------- recsched run report ----------------------".bold()
            );
            eprint!("{}", sched.stats());
            eprintln!("{}", serde_json::to_string_pretty(sched.stats())?);
        }
        Ok(status)
    }

    fn argv(&self) -> Result<Vec<CString>, Error> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(
            CString::new(self.program.as_os_str().as_bytes())
                .context("Program path contains a NUL byte")?,
        );
        for arg in &self.args {
            argv.push(
                CString::new(arg.as_str())
                    .with_context(|| format!("Argument {:?} contains a NUL byte", arg))?,
            );
        }
        Ok(argv)
    }
}

/// Fork a child that asks to be traced, stops itself and then execs `argv`. The stop is
/// consumed when the child is registered.
fn spawn_traced(argv: &[CString]) -> Result<Tid, Error> {
    // SAFETY: the child only makes async-signal-safe calls before exec.
    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Parent { child } => Ok(Tid::from(child)),
        ForkResult::Child => {
            let _ = ptrace::traceme();
            let _ = signal::raise(Signal::SIGSTOP);
            let _ = execvp(argv[0].as_c_str(), argv);
            // Only reached if exec failed.
            unsafe { libc::_exit(127) }
        }
    }
}

fn is_spawn_event(event: libc::c_int) -> bool {
    matches!(
        event,
        libc::PTRACE_EVENT_CLONE | libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK
    )
}

/// What to do with a task after looking at its latest wait status.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    /// The task is gone; deregister it.
    Gone(ExitStatus),
    /// The task spawned a new one, whose tid must be fetched with `PTRACE_GETEVENTMSG`.
    Spawned,
    /// Resume it, delivering this signal (if any).
    Resume(Option<Signal>),
}

fn dispose(status: WaitStatus) -> Disposition {
    match status {
        WaitStatus::Exited(_, code) => Disposition::Gone(ExitStatus::Exited(code)),
        WaitStatus::Signaled(_, sig, _) => Disposition::Gone(ExitStatus::Signaled(sig)),
        WaitStatus::PtraceEvent(_, _, event) if is_spawn_event(event) => Disposition::Spawned,
        // Counter overflow: the time slice is over, which is our business, not the tracee's.
        WaitStatus::Stopped(_, sig) if sig == TIME_SLICE_SIGNAL => Disposition::Resume(None),
        WaitStatus::Stopped(_, sig) => Disposition::Resume(Some(sig)),
        _ => Disposition::Resume(None),
    }
}

/// Drive every task until none are left. Returns how the root task ended.
fn supervise(
    sched: &mut Scheduler<LinuxBackend>,
    root: Tid,
    cfg: &Config,
) -> Result<ExitStatus, Error> {
    let mut exit = ExitStatus::Exited(0);
    let mut current: Option<TaskHandle> = None;

    while sched.active_count() > 0 {
        let sel = sched.select_next(current, cfg.max_events)?;
        let h = sel.task;
        let task = sched.task(h).expect("selected task is live");
        let tid = task.tid;

        let disposition = if sel.by_waitpid {
            let status = task
                .wait_status()
                .with_context(|| format!("Undecodable wait status {:#x}", task.status))?;
            trace!("tid {}: {:?}", tid, status);
            dispose(status)
        } else {
            Disposition::Resume(None)
        };

        let deliver = match disposition {
            Disposition::Gone(how) => {
                debug!("tid {} is gone ({:?})", tid, how);
                if tid == root {
                    exit = how;
                }
                sched.deregister(tid);
                current = None;
                continue;
            }
            Disposition::Spawned => {
                let raw = ptrace::getevent(tid.as_pid())
                    .with_context(|| format!("Failed to fetch the new task spawned by {}", tid))?;
                let child = Tid::from_raw(raw as i32);
                sched
                    .register(Some(tid), child, cfg.max_rbc)
                    .with_context(|| format!("Failed to register task {} (parent {})", child, tid))?;
                None
            }
            Disposition::Resume(sig) => sig,
        };

        match ptrace::syscall(tid.as_pid(), deliver) {
            Ok(()) => {}
            // Killed behind our back; the next poll reports how.
            Err(Errno::ESRCH) => debug!("tid {} vanished before it could be resumed", tid),
            Err(e) => return Err(e).with_context(|| format!("Failed to resume tid {}", tid)),
        }
        sched
            .task_mut(h)
            .expect("selected task is live")
            .exec_state = ExecState::ProcessingSyscall;
        current = Some(h);
    }

    Ok(exit)
}
