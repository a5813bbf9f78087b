use std::{cell::RefCell, rc::Rc, time::Duration};

use deferron::{
    EventLoop, Failure, Handling, RecordingObserver, RunnerError, Task, TaskState,
};

fn virtual_loop() -> (EventLoop, RecordingObserver) {
    let recorder = RecordingObserver::new();
    let lp = EventLoop::builder()
        .virtual_clock()
        .observer(recorder.clone())
        .build();
    (lp, recorder)
}

#[test]
fn task_settles_once_with_the_work_outcome() {
    let (lp, _) = virtual_loop();

    let task = lp.schedule_after(Duration::from_millis(10), || Ok::<_, Failure>("done"));
    assert_eq!(task.state(), TaskState::Pending, "Task should start pending");
    assert_eq!(task.peek(), None, "Pending task has no outcome");

    lp.run().unwrap();
    assert_eq!(task.state(), TaskState::Fulfilled);
    assert_eq!(task.peek(), Some(Ok("done")));
}

#[test]
fn task_ids_are_unique() {
    let (lp, _) = virtual_loop();

    let a = lp.resolved(1);
    let b = lp.resolved(1);
    let c = a.clone();
    assert_ne!(a.id(), b.id(), "Every task gets its own id");
    assert_eq!(a.id(), c.id(), "Clones share the id");
}

#[test]
fn continuation_never_runs_inline() {
    let (lp, _) = virtual_loop();
    let log = Rc::new(RefCell::new(Vec::new()));
    let log_cl = Rc::clone(&log);

    let task = lp.resolved(7);
    task.on_settle(move |outcome| log_cl.borrow_mut().push(format!("continuation {outcome:?}")));
    log.borrow_mut().push("sync".to_string());

    assert_eq!(log.borrow().len(), 1, "Continuation must wait for the loop");
    lp.run().unwrap();
    assert_eq!(
        *log.borrow(),
        vec!["sync".to_string(), "continuation Ok(7)".to_string()]
    );
}

#[test]
fn continuations_run_in_registration_order() {
    let (lp, _) = virtual_loop();
    let log = Rc::new(RefCell::new(Vec::new()));

    let task = lp.schedule_after(Duration::from_millis(5), || Ok::<_, Failure>(()));
    for i in 0..4 {
        let log = Rc::clone(&log);
        task.on_settle(move |_| log.borrow_mut().push(i));
    }

    lp.run().unwrap();
    assert_eq!(*log.borrow(), vec![0, 1, 2, 3]);
}

#[test]
fn continuations_added_after_settlement_run_once_in_order() {
    let (lp, _) = virtual_loop();
    let log = Rc::new(RefCell::new(Vec::new()));

    let task = lp.schedule_after(Duration::from_millis(5), || Ok::<_, Failure>("settled"));
    lp.run().unwrap();
    assert!(task.is_settled());

    for i in 0..2 {
        let log = Rc::clone(&log);
        task.on_settle(move |_| log.borrow_mut().push(i));
    }
    assert!(log.borrow().is_empty(), "Late continuations must wait for the loop");

    lp.run().unwrap();
    lp.run().unwrap();
    assert_eq!(*log.borrow(), vec![0, 1], "Each continuation runs exactly once");
}

#[test]
fn then_flattens_returned_task() {
    let (lp, _) = virtual_loop();
    let h = lp.handle();

    let total = lp
        .schedule_after(Duration::from_millis(10), || Ok::<_, Failure>(2))
        .then(
            move |n| h.schedule_after(Duration::from_millis(15), move || Ok::<_, Failure>(n * 21)),
            Err::<i32, _>,
        );

    assert_eq!(lp.run_until(&total).unwrap(), Ok(42));
    assert_eq!(
        lp.now(),
        Duration::from_millis(25),
        "Outer task should settle only after the inner one"
    );
}

#[test]
fn rejection_skips_success_handlers_until_recovered() {
    let (lp, _) = virtual_loop();
    let ran = Rc::new(RefCell::new(false));
    let ran_cl = Rc::clone(&ran);

    let result = lp
        .schedule_after(Duration::from_millis(1), || {
            Err::<i32, _>(Failure::new("Boom", "nothing to see"))
        })
        .and_then(move |n| {
            *ran_cl.borrow_mut() = true;
            Ok::<_, Failure>(n + 1)
        })
        .or_else(|failure| {
            assert_eq!(failure.kind(), "Boom");
            Ok::<_, Failure>(-1)
        });

    assert_eq!(lp.run_until(&result).unwrap(), Ok(-1));
    assert!(!*ran.borrow(), "Success handler must not run on rejection");
}

#[test]
fn map_transforms_value() {
    let (lp, _) = virtual_loop();

    let task = lp.resolved(20).map(|n| n + 1).map(|n| format!("n={n}"));
    assert_eq!(lp.run_until(&task).unwrap(), Ok("n=21".to_string()));
}

#[test]
fn promise_settles_from_executor() {
    let (lp, _) = virtual_loop();
    let h = lp.handle();

    let later = lp.promise(move |settler| {
        h.schedule_after(Duration::from_millis(30), move || {
            settler.resolve("heads");
            Ok::<_, Failure>(())
        });
    });
    let now = lp.promise::<i32, _>(|settler| settler.reject(Failure::new("Coin", "tails")));

    assert_eq!(lp.run_until(&later).unwrap(), Ok("heads"));
    assert_eq!(
        now.peek(),
        Some(Err(Failure::new("Coin", "tails"))),
        "Executor runs right away"
    );
}

#[test]
fn dropped_rejection_is_reported_as_unhandled() {
    let (lp, recorder) = virtual_loop();

    drop(lp.rejected::<i32>(Failure::new("Lost", "nobody listened")));

    let handled = lp.rejected::<i32>(Failure::new("Kept", "someone listened"));
    handled.on_settle(|_| {});
    drop(handled);
    lp.run().unwrap();

    assert_eq!(
        recorder.failures(),
        vec![(Failure::new("Lost", "nobody listened"), Handling::Unhandled)],
        "Only the unobserved rejection should be reported"
    );
}

#[test]
fn rejection_passed_through_chain_is_reported_once() {
    let (lp, recorder) = virtual_loop();

    let source = lp.schedule_after(Duration::from_millis(1), || {
        Err::<i32, _>(Failure::new("Boom", "at the source"))
    });
    let derived = source.map(|n| n * 2);
    drop(source);
    drop(derived);
    lp.run().unwrap();

    let failures = recorder.failures();
    assert_eq!(failures.len(), 1, "Only the end of the chain is unhandled");
    assert_eq!(failures[0].1, Handling::Unhandled);
}

#[test]
fn run_until_reports_stalled_task() {
    let (lp, _) = virtual_loop();

    let (task, _settler) = lp.deferred::<i32>();
    let result = lp.run_until(&task);
    assert!(
        matches!(result, Err(RunnerError::Stalled(id)) if id == task.id()),
        "A task nobody settles should stall the loop"
    );
}

#[test]
fn settler_settles_deferred_task() {
    let (lp, _) = virtual_loop();

    let (task, settler): (Task<u8>, _) = lp.deferred();
    assert_eq!(settler.id(), task.id());
    settler.settle(Ok(3));
    assert_eq!(task.state(), TaskState::Fulfilled, "Settling is immediate");
    assert_eq!(lp.run_until(&task).unwrap(), Ok(3));
}
