use std::{cell::RefCell, rc::Rc, time::Duration};

use deferron::{
    EventLoop, Failure, Handling, IoError, MemoryProvider, RecordingObserver, TaskExt, Workflow,
};

fn virtual_loop() -> (EventLoop, RecordingObserver) {
    let recorder = RecordingObserver::new();
    let lp = EventLoop::builder()
        .virtual_clock()
        .observer(recorder.clone())
        .provider(
            MemoryProvider::new()
                .with_file("greeting.txt", "hello")
                .with_url("http://api.test/user", r#"{"name": "ada"}"#),
        )
        .build();
    (lp, recorder)
}

#[test]
fn workflow_awaits_tasks_in_sequence() {
    let (lp, _) = virtual_loop();
    let h = lp.handle();

    let summary = lp.spawn_workflow(async move {
        let greeting = h.read_to_string("greeting.txt").await?;
        let user = h.get_json("http://api.test/user").await?;
        h.sleep(Duration::from_millis(250)).await?;
        Ok::<_, Failure>(format!("{greeting}, {}", user["name"].as_str().unwrap_or("?")))
    });

    assert_eq!(lp.run_until(&summary).unwrap(), Ok("hello, ada".to_string()));
    assert_eq!(lp.now(), Duration::from_millis(250));
}

#[test]
fn workflow_does_not_start_synchronously() {
    let (lp, _) = virtual_loop();
    let started = Rc::new(RefCell::new(false));
    let started_cl = Rc::clone(&started);

    let task = lp.spawn_workflow(async move {
        *started_cl.borrow_mut() = true;
        Ok::<_, Failure>(())
    });

    assert!(!*started.borrow(), "Workflow body should wait for the loop");
    lp.run_until(&task).unwrap().unwrap();
    assert!(*started.borrow());
}

#[test]
fn awaiting_settled_task_still_yields() {
    let (lp, _) = virtual_loop();
    let h = lp.handle();
    let log = Rc::new(RefCell::new(Vec::new()));
    let log_cl = Rc::clone(&log);

    let task = lp.spawn_workflow(async move {
        log_cl.borrow_mut().push("workflow start");
        let log = Rc::clone(&log_cl);
        h.resolved(()).on_settle(move |_| log.borrow_mut().push("queued job"));
        let value = h.resolved(5).await?;
        log_cl.borrow_mut().push("workflow resumed");
        Ok::<_, Failure>(value)
    });

    assert_eq!(lp.run_until(&task).unwrap(), Ok(5));
    assert_eq!(
        *log.borrow(),
        vec!["workflow start", "queued job", "workflow resumed"]
    );
}

#[test]
fn failure_propagates_with_question_mark() {
    let (lp, _) = virtual_loop();
    let h = lp.handle();
    let reached = Rc::new(RefCell::new(false));
    let reached_cl = Rc::clone(&reached);

    let task = lp.spawn_workflow(async move {
        let text = h.read_to_string("absent.txt").await?;
        *reached_cl.borrow_mut() = true;
        Ok::<_, Failure>(text)
    });

    let failure = lp.run_until(&task).unwrap().unwrap_err();
    assert_eq!(
        failure,
        Failure::Io(IoError::NotFound {
            resource: "absent.txt".to_string()
        })
    );
    assert!(!*reached.borrow(), "Code after a failed await must not run");
}

#[test]
fn step_workflow_stops_at_failing_step() {
    let (lp, _) = virtual_loop();
    let h = lp.handle();
    let ran_third = Rc::new(RefCell::new(false));
    let ran_third_cl = Rc::clone(&ran_third);

    let task = lp.run_workflow(
        Workflow::new(1)
            .step(move |n| h.schedule_after(Duration::from_millis(10), move || Ok::<_, Failure>(n + 1)))
            .step(|_| Err::<i32, _>(Failure::new("Validation", "value too small")))
            .step(move |n| {
                *ran_third_cl.borrow_mut() = true;
                Ok::<_, Failure>(n)
            }),
    );

    let failure = lp.run_until(&task).unwrap().unwrap_err();
    assert_eq!(failure.kind(), "WorkflowFailure");
    assert!(
        matches!(failure, Failure::Workflow { step: 2, .. }),
        "Failure should name step 2, got {failure}"
    );
    assert_eq!(failure.origin(), &Failure::new("Validation", "value too small"));
    assert!(!*ran_third.borrow(), "Steps after the failure must not run");
}

#[test]
fn step_workflow_recovery_decides_outcome() {
    let (lp, recorder) = virtual_loop();
    let h = lp.handle();

    let task = lp.run_workflow(
        Workflow::new(String::new())
            .step(move |_| h.read_to_string("absent.txt"))
            .step(|text| Ok::<_, Failure>(text.to_uppercase()))
            .recover(|failure| Ok::<_, Failure>(format!("fallback after {}", failure.kind()))),
    );

    assert_eq!(
        lp.run_until(&task).unwrap(),
        Ok("fallback after WorkflowFailure".to_string())
    );
    let failures = recorder.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].1, Handling::Recovered);
    assert!(matches!(failures[0].0, Failure::Workflow { step: 1, .. }));
}

#[test]
fn recover_on_awaited_task() {
    let (lp, recorder) = virtual_loop();
    let h = lp.handle();

    let task = lp.spawn_workflow(async move {
        let fallback = h.clone();
        let text = h
            .read_to_string("absent.txt")
            .into_future()
            .recover(&h, move |_| {
                fallback.schedule_after(Duration::from_millis(1), || {
                    Ok::<_, Failure>("default".to_string())
                })
            })
            .await?;
        Ok::<_, Failure>(text)
    });

    assert_eq!(lp.run_until(&task).unwrap(), Ok("default".to_string()));
    assert_eq!(
        recorder.failures(),
        vec![(
            Failure::Io(IoError::NotFound {
                resource: "absent.txt".to_string()
            }),
            Handling::Recovered
        )]
    );
}

#[test]
fn dropped_failing_workflow_is_unhandled() {
    let (lp, recorder) = virtual_loop();

    drop(lp.spawn_workflow(async { Err::<(), _>(Failure::new("Crash", "workflow gave up")) }));
    lp.run().unwrap();

    assert_eq!(
        recorder.failures(),
        vec![(Failure::new("Crash", "workflow gave up"), Handling::Unhandled)]
    );
}
