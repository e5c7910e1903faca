/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use nix::errno::Errno;
use pretty_assertions::assert_eq;
use recsched::backend::BlockingWait;
use recsched::testing::Call;
use recsched::types::ExecState;
use recsched::Error;

use crate::sched_with;
use crate::tid;
use crate::tid_of;
use crate::MAX_EVENTS;

#[test]
fn fresh_scheduler_starts_at_the_oldest_task() {
    let (mut sched, hs) = sched_with(&[1, 2, 3]);
    let sel = sched.select_next(None, MAX_EVENTS).unwrap();
    assert_eq!(sel.task, hs[0]);
    assert!(!sel.by_waitpid);
    assert_eq!(sched.task(hs[0]).unwrap().switch_budget, MAX_EVENTS);
    assert_eq!(sched.backend().count(|c| matches!(c, Call::Poll(_))), 0);
    sched.terminate_all();
}

#[test]
fn exhausted_budget_hands_over_to_the_next_task() {
    let (mut sched, hs) = sched_with(&[1, 2, 3]);
    assert_eq!(sched.select_next(None, MAX_EVENTS).unwrap().task, hs[0]);
    sched.task_mut(hs[0]).unwrap().switch_budget = -1;

    let sel = sched.select_next(Some(hs[0]), MAX_EVENTS).unwrap();
    assert_eq!(tid_of(&sched, sel.task), 2);
    assert_eq!(sched.task(hs[0]).unwrap().switch_budget, MAX_EVENTS);
    assert_eq!(sched.task(hs[1]).unwrap().switch_budget, MAX_EVENTS);
    assert_eq!(sched.stats().budget_preemptions, 1);
    sched.terminate_all();
}

#[test]
fn reselection_spends_one_unit_per_turn() {
    let (mut sched, hs) = sched_with(&[1, 2]);
    let mut cur = sched.select_next(None, MAX_EVENTS).unwrap().task;
    let mut budgets = Vec::new();
    for _ in 0..3 {
        cur = sched.select_next(Some(cur), MAX_EVENTS).unwrap().task;
        assert_eq!(cur, hs[0]);
        budgets.push(sched.task(cur).unwrap().switch_budget);
    }
    assert_eq!(budgets, vec![9, 8, 7]);
    assert_eq!(sched.stats().same_task_reselections, 3);
    sched.terminate_all();
}

#[test]
fn runnable_tasks_take_turns() {
    let (mut sched, _) = sched_with(&[1, 2, 3]);
    let mut order = Vec::new();
    let mut cur = None;
    // One initial pick plus MAX_EVENTS + 1 reselections drain a budget; the next call
    // moves on. Three full turns should visit every task once, in ring order.
    for _ in 0..3 * (MAX_EVENTS + 2) {
        let sel = sched.select_next(cur, MAX_EVENTS).unwrap();
        let t = tid_of(&sched, sel.task);
        if order.last() != Some(&t) {
            order.push(t);
        }
        cur = Some(sel.task);
    }
    assert_eq!(order, vec![1, 2, 3]);

    // And the fourth turn wraps around.
    let sel = sched.select_next(cur, MAX_EVENTS).unwrap();
    assert_eq!(tid_of(&sched, sel.task), 1);
    sched.terminate_all();
}

#[test]
fn unswitchable_current_is_returned_untouched() {
    let (mut sched, hs) = sched_with(&[1, 2]);
    sched.select_next(None, MAX_EVENTS).unwrap();
    {
        let a = sched.task_mut(hs[0]).unwrap();
        a.switchable = false;
        a.switch_budget = -5;
        a.exec_state = ExecState::ProcessingSyscall;
    }
    sched.backend_mut().clear_calls();

    let sel = sched.select_next(Some(hs[0]), MAX_EVENTS).unwrap();
    assert_eq!(sel.task, hs[0]);
    assert!(!sel.by_waitpid);
    assert_eq!(sched.task(hs[0]).unwrap().switch_budget, -5);
    assert_eq!(sched.current(), Some(hs[0]));
    assert!(sched.backend().calls().is_empty());
    assert_eq!(sched.stats().nonswitchable_returns, 1);
    sched.terminate_all();
}

#[test]
fn blocked_tasks_are_polled_and_skipped() {
    let (mut sched, hs) = sched_with(&[1, 2, 3]);
    sched.task_mut(hs[0]).unwrap().exec_state = ExecState::ProcessingSyscall;
    sched.task_mut(hs[1]).unwrap().exec_state = ExecState::EnteringSyscall;

    let sel = sched.select_next(None, MAX_EVENTS).unwrap();
    assert_eq!(sel.task, hs[1]);
    assert!(!sel.by_waitpid);
    assert_eq!(sched.backend().calls(), &[Call::Poll(tid(1))]);
    sched.terminate_all();
}

#[test]
fn all_blocked_falls_back_to_a_single_blocking_wait() {
    let (mut sched, hs) = sched_with(&[1, 2, 3]);
    for &h in &hs {
        sched.task_mut(h).unwrap().exec_state = ExecState::ProcessingSyscall;
    }
    sched.backend_mut().clear_calls();
    sched
        .backend_mut()
        .script_wait(BlockingWait::Changed(tid(2), 0x137f));

    let sel = sched.select_next(None, MAX_EVENTS).unwrap();
    assert_eq!(sel.task, hs[1]);
    assert!(sel.by_waitpid);
    assert_eq!(sched.task(hs[1]).unwrap().status, 0x137f);
    assert_eq!(
        sched.backend().calls(),
        &[
            Call::Poll(tid(1)),
            Call::Poll(tid(2)),
            Call::Poll(tid(3)),
            Call::WaitBlocking,
        ]
    );
    assert_eq!(sched.backend().pending_waits(), 0);
    assert_eq!(sched.current(), Some(hs[1]));
    sched.terminate_all();
}

#[test]
fn scan_starts_after_the_preempted_task() {
    let (mut sched, hs) = sched_with(&[1, 2, 3]);
    sched.select_next(None, MAX_EVENTS).unwrap();
    sched.task_mut(hs[0]).unwrap().switch_budget = -1;
    sched.task_mut(hs[1]).unwrap().exec_state = ExecState::ProcessingSyscall;
    sched.backend_mut().clear_calls();

    let sel = sched.select_next(Some(hs[0]), MAX_EVENTS).unwrap();
    assert_eq!(sel.task, hs[2]);
    assert_eq!(sched.backend().calls(), &[Call::Poll(tid(2))]);
    sched.terminate_all();
}

#[test]
fn stats_track_selections() {
    let (mut sched, hs) = sched_with(&[1]);
    let cur = sched.select_next(None, MAX_EVENTS).unwrap().task;
    sched.select_next(Some(cur), MAX_EVENTS).unwrap();
    sched.task_mut(hs[0]).unwrap().exec_state = ExecState::ProcessingSyscall;
    sched.backend_mut().script_poll(tid(1), Some(0));
    sched.select_next(Some(cur), MAX_EVENTS).unwrap();

    let stats = sched.stats();
    assert_eq!(stats.selections, 3);
    assert_eq!(stats.same_task_reselections, 2);
    assert_eq!(stats.nonblocking_polls, 1);
    assert_eq!(stats.blocking_waits, 0);
    assert_eq!(stats.registered, 1);
    sched.terminate_all();
}

#[test]
fn failed_poll_is_reported_and_changes_nothing() {
    let (mut sched, hs) = sched_with(&[1, 2]);
    let cur = sched.select_next(None, MAX_EVENTS).unwrap().task;
    sched.task_mut(hs[0]).unwrap().exec_state = ExecState::ProcessingSyscall;
    sched.backend_mut().script_poll_error(tid(1), Errno::ECHILD);

    let err = sched.select_next(Some(cur), MAX_EVENTS).unwrap_err();
    assert_eq!(
        err,
        Error::Poll {
            tid: tid(1),
            source: Errno::ECHILD,
        }
    );
    assert_eq!(sched.current(), Some(hs[0]));
    assert_eq!(sched.task(hs[0]).unwrap().switch_budget, MAX_EVENTS);
    assert_eq!(sched.task(hs[1]).unwrap().switch_budget, 0);
    assert_eq!(sched.stats().selections, 1);
    sched.terminate_all();
}

#[test]
fn scan_wraps_from_the_tail_to_the_head() {
    let (mut sched, hs) = sched_with(&[1, 2, 3]);
    let mut cur = sched.select_next(None, MAX_EVENTS).unwrap().task;
    // Push the cursor to the tail by exhausting budgets.
    for want in [2, 3] {
        sched.task_mut(cur).unwrap().switch_budget = -1;
        cur = sched.select_next(Some(cur), MAX_EVENTS).unwrap().task;
        assert_eq!(tid_of(&sched, cur), want);
    }
    sched.task_mut(hs[2]).unwrap().exec_state = ExecState::ProcessingSyscall;
    sched.backend_mut().clear_calls();

    let sel = sched.select_next(Some(cur), MAX_EVENTS).unwrap();
    assert_eq!(sel.task, hs[0]);
    assert!(!sel.by_waitpid);
    assert_eq!(sched.backend().calls(), &[Call::Poll(tid(3))]);
    assert_eq!(sched.task(hs[0]).unwrap().switch_budget, MAX_EVENTS);
    sched.terminate_all();
}

#[test]
#[should_panic(expected = "does not name a live task")]
fn stale_current_handle_is_fatal() {
    let (mut sched, hs) = sched_with(&[1, 2]);
    sched.select_next(None, MAX_EVENTS).unwrap();
    sched.deregister(tid(1));
    let _ = sched.select_next(Some(hs[0]), MAX_EVENTS);
}
