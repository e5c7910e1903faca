/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use nix::errno::Errno;
use nix::sys::signal::Signal;
use pretty_assertions::assert_eq;
use recsched::task::SyscallbufRegion;
use recsched::testing::Call;
use recsched::testing::Op;
use recsched::testing::ScriptedBackend;
use recsched::Config;
use recsched::Error;
use recsched::Scheduler;

use crate::sched_with;
use crate::tid;
use crate::tid_of;
use crate::MAX_EVENTS;
use crate::MAX_RBC;

fn check_consistent(sched: &Scheduler<ScriptedBackend>) {
    let tids: Vec<i32> = sched.tasks().map(|(_, t)| t.tid.as_raw()).collect();
    assert_eq!(tids.len(), sched.active_count());
    for (h, t) in sched.tasks() {
        assert_eq!(sched.lookup(t.tid), Some(h));
    }
    let mut sorted = tids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), tids.len(), "duplicate tid in {:?}", tids);
}

#[test]
fn register_acquires_everything_in_order() {
    let (sched, hs) = sched_with(&[7]);
    assert_eq!(
        sched.backend().calls(),
        &[
            Call::OpenMemory(tid(7)),
            Call::PtraceSetup(tid(7)),
            Call::CounterInit(tid(7)),
            Call::CounterStart(tid(7), MAX_RBC),
        ]
    );
    let task = sched.task(hs[0]).unwrap();
    assert!(task.mem_fd.is_some());
    assert_eq!(task.hpc.as_ref().and_then(|h| h.threshold), Some(MAX_RBC));
    assert_eq!(task.rec_tid, tid(7));
    assert_eq!(sched.backend().open_fds().len(), 2);
    drop(sched);
}

#[test]
fn ring_and_index_stay_in_step() {
    let (mut sched, _) = sched_with(&[1, 2, 3, 4]);
    check_consistent(&sched);
    sched.deregister(tid(2));
    check_consistent(&sched);
    sched.register(Some(tid(1)), tid(5), MAX_RBC).unwrap();
    check_consistent(&sched);
    let order: Vec<i32> = sched.tasks().map(|(_, t)| t.tid.as_raw()).collect();
    assert_eq!(order, vec![1, 3, 4, 5]);
    assert_eq!(sched.lookup(tid(2)), None);
    sched.terminate_all();
}

#[test]
#[should_panic(expected = "registered twice")]
fn duplicate_tid_is_fatal() {
    let (mut sched, _) = sched_with(&[1]);
    let _ = sched.register(None, tid(1), MAX_RBC);
}

#[test]
#[should_panic(expected = "outside of")]
fn out_of_range_tid_is_fatal() {
    let (mut sched, _) = sched_with(&[]);
    let _ = sched.register(None, tid(0), MAX_RBC);
}

#[test]
#[should_panic(expected = "deregistering unknown tid")]
fn deregistering_a_stranger_is_fatal() {
    let (mut sched, _) = sched_with(&[1]);
    sched.deregister(tid(2));
}

#[test]
fn deregister_releases_each_resource_once() {
    let (mut sched, hs) = sched_with(&[1, 2]);
    let desched = sched.backend_mut().alloc_fd();
    {
        let t = sched.task_mut(hs[0]).unwrap();
        t.desched_fd = Some(desched);
        t.desched_fd_child = Some(5);
    }
    let mem = sched.task(hs[0]).unwrap().mem_fd.unwrap();
    sched.backend_mut().clear_calls();

    sched.deregister(tid(1));
    let calls = sched.backend().calls().to_vec();
    assert_eq!(
        calls,
        vec![
            Call::CounterRelease(tid(1)),
            Call::Close(mem),
            Call::Close(desched),
            Call::Detach(tid(1)),
        ]
    );
    // Only task 2's memory handle and counter remain.
    assert_eq!(sched.backend().open_fds().len(), 2);
    assert!(sched.task(hs[0]).is_none());

    sched.deregister(tid(2));
    assert!(sched.backend().open_fds().is_empty());
    assert_eq!(sched.active_count(), 0);
}

#[test]
fn deregistering_the_current_task_moves_the_cursor_on() {
    let (mut sched, hs) = sched_with(&[1, 2, 3]);
    sched.select_next(None, MAX_EVENTS).unwrap();
    sched.deregister(tid(1));
    assert_eq!(sched.current(), Some(hs[1]));

    let sel = sched.select_next(None, MAX_EVENTS).unwrap();
    assert_eq!(tid_of(&sched, sel.task), 2);
    sched.terminate_all();
}

#[test]
fn deregistering_another_task_leaves_the_cursor_alone() {
    let (mut sched, hs) = sched_with(&[1, 2, 3]);
    sched.select_next(None, MAX_EVENTS).unwrap();
    sched.deregister(tid(3));
    assert_eq!(sched.current(), Some(hs[0]));
    sched.terminate_all();
}

#[test]
fn scheduler_recovers_after_the_last_task_leaves() {
    let (mut sched, hs) = sched_with(&[2]);
    assert_eq!(sched.select_next(None, MAX_EVENTS).unwrap().task, hs[0]);
    sched.deregister(tid(2));
    assert_eq!(sched.active_count(), 0);
    assert_eq!(sched.current(), None);

    let c = sched.register(None, tid(3), MAX_RBC).unwrap();
    let sel = sched.select_next(None, MAX_EVENTS).unwrap();
    assert_eq!(sel.task, c);
    assert_ne!(sel.task, hs[0]);
    sched.terminate_all();
}

#[test]
fn failed_setup_leaves_nothing_behind() {
    let (mut sched, _) = sched_with(&[]);
    sched.backend_mut().fail_next(Op::PtraceSetup, Errno::ESRCH);

    let err = sched.register(None, tid(9), MAX_RBC).unwrap_err();
    assert_eq!(
        err,
        Error::Backend {
            op: "ptrace setup",
            tid: tid(9),
            source: Errno::ESRCH,
        }
    );
    assert_eq!(err.errno(), Errno::ESRCH);
    assert_eq!(sched.active_count(), 0);
    assert_eq!(sched.lookup(tid(9)), None);
    assert!(sched.backend().open_fds().is_empty());
    assert_eq!(sched.stats().registered, 0);

    // The tid is free to be registered again.
    sched.register(None, tid(9), MAX_RBC).unwrap();
    sched.terminate_all();
}

#[test]
fn failed_counter_setup_detaches_the_task() {
    let (mut sched, _) = sched_with(&[]);
    sched.backend_mut().fail_next(Op::CounterInit, Errno::ENOENT);

    let err = sched.register(None, tid(4), MAX_RBC).unwrap_err();
    assert_eq!(err.errno(), Errno::ENOENT);
    assert_eq!(
        sched.backend().calls(),
        &[
            Call::OpenMemory(tid(4)),
            Call::PtraceSetup(tid(4)),
            Call::CounterInit(tid(4)),
            Call::Detach(tid(4)),
            Call::Close(100),
        ]
    );
    assert!(sched.backend().open_fds().is_empty());
}

#[test]
fn failed_memory_open_does_not_detach() {
    let (mut sched, _) = sched_with(&[]);
    sched.backend_mut().fail_next(Op::OpenMemory, Errno::EACCES);
    assert!(sched.register(None, tid(4), MAX_RBC).is_err());
    assert_eq!(sched.backend().count(|c| matches!(c, Call::Detach(_))), 0);
}

#[test]
fn stats_serialize_for_reports() {
    let (mut sched, _) = sched_with(&[1, 2]);
    sched.select_next(None, MAX_EVENTS).unwrap();
    sched.deregister(tid(2));

    let json = serde_json::to_string(sched.stats()).unwrap();
    assert!(json.contains("\"registered\":2"));
    let back: recsched::SchedStats = serde_json::from_str(&json).unwrap();
    assert_eq!(&back, sched.stats());
    assert_eq!(back.deregistered, 1);
    sched.terminate_all();
}

#[test]
fn failed_counter_start_releases_the_counter() {
    let (mut sched, _) = sched_with(&[]);
    sched.backend_mut().fail_next(Op::CounterStart, Errno::EINVAL);
    assert!(sched.register(None, tid(4), MAX_RBC).is_err());
    assert_eq!(
        sched.backend().count(|c| *c == Call::CounterRelease(tid(4))),
        1
    );
    assert!(sched.backend().open_fds().is_empty());
}

#[test]
fn children_inherit_the_syscallbuf_range() {
    let (mut sched, hs) = sched_with(&[1]);
    let region = SyscallbufRegion {
        start: 0x7000_0000,
        end: 0x7000_4000,
    };
    sched.task_mut(hs[0]).unwrap().syscallbuf = region;

    let child = sched.register(Some(tid(1)), tid(2), MAX_RBC).unwrap();
    assert_eq!(sched.task(child).unwrap().syscallbuf, region);

    // An unknown parent is tolerated; the child just starts with nothing.
    let orphan = sched.register(Some(tid(77)), tid(3), MAX_RBC).unwrap();
    assert!(!sched.task(orphan).unwrap().syscallbuf.is_mapped());
    sched.terminate_all();
}

#[test]
fn terminate_all_signals_and_forgets_everyone() {
    let mut cfg = Config::default();
    cfg.terminate_signal = recsched::types::SigWrapper(Signal::SIGKILL);
    let mut sched = Scheduler::new(&cfg, ScriptedBackend::new());
    for id in [1, 2, 3] {
        sched.register(None, tid(id), MAX_RBC).unwrap();
    }
    sched.select_next(None, MAX_EVENTS).unwrap();
    sched.backend_mut().clear_calls();

    sched.terminate_all();
    let signals: Vec<Call> = sched
        .backend()
        .calls()
        .iter()
        .copied()
        .filter(|c| matches!(c, Call::Signal(..)))
        .collect();
    assert_eq!(
        signals,
        vec![
            Call::Signal(tid(1), Signal::SIGKILL),
            Call::Signal(tid(2), Signal::SIGKILL),
            Call::Signal(tid(3), Signal::SIGKILL),
        ]
    );
    assert_eq!(sched.active_count(), 0);
    assert_eq!(sched.current(), None);
    assert_eq!(sched.stats().deregistered, 3);
    assert!(sched.backend().open_fds().is_empty());
}
