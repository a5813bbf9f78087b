use std::{cell::RefCell, rc::Rc, time::Duration};

use deferron::{
    EventLoop, Failure, IoError, IoOperation, MemoryProvider, RunnerConfig, SystemProvider,
};

fn memory_loop(provider: MemoryProvider) -> EventLoop {
    EventLoop::builder()
        .virtual_clock()
        .provider(provider)
        .build()
}

#[test]
fn read_fulfills_with_file_contents() {
    let lp = memory_loop(MemoryProvider::new().with_file("notes.txt", "hello"));

    let text = lp.read_to_string("notes.txt");
    assert!(!text.is_settled(), "I/O never settles synchronously");
    assert_eq!(lp.run_until(&text).unwrap(), Ok("hello".to_string()));
}

#[test]
fn missing_file_rejects_with_not_found() {
    let lp = memory_loop(MemoryProvider::new());

    let bytes = lp.read("missing.txt");
    let outcome = lp.run_until(&bytes).unwrap();
    assert_eq!(
        outcome,
        Err(Failure::Io(IoError::NotFound {
            resource: "missing.txt".to_string()
        }))
    );
    assert_eq!(outcome.unwrap_err().kind(), "NotFound");
}

#[test]
fn invalid_utf8_rejects_with_decode_failure() {
    let lp = memory_loop(MemoryProvider::new().with_file("blob.bin", vec![0xff, 0xfe]));

    let text = lp.read_to_string("blob.bin");
    let failure = lp.run_until(&text).unwrap().unwrap_err();
    assert_eq!(failure.kind(), "DecodeFailure");
}

#[test]
fn completions_arrive_in_finishing_order() {
    let lp = memory_loop(
        MemoryProvider::new()
            .with_slow_file("slow.txt", "slow", Duration::from_millis(80))
            .with_file("fast.txt", "fast"),
    );
    let log = Rc::new(RefCell::new(Vec::new()));

    for path in ["slow.txt", "fast.txt"] {
        let log = Rc::clone(&log);
        lp.read_to_string(path)
            .on_settle(move |outcome| log.borrow_mut().push(outcome.unwrap_or_default()));
    }

    let stats = lp.run().unwrap();
    assert_eq!(*log.borrow(), vec!["fast", "slow"]);
    assert_eq!(stats.io_completed, 2);
}

#[test]
fn request_io_runs_given_operation() {
    let lp = memory_loop(MemoryProvider::new().with_url("http://example.test/a", "body"));

    let task = lp.request_io(IoOperation::HttpGet("http://example.test/a".to_string()));
    assert_eq!(lp.run_until(&task).unwrap(), Ok(b"body".to_vec()));
}

#[test]
fn get_json_decodes_body() {
    let lp = memory_loop(
        MemoryProvider::new()
            .with_url("http://prices.test/btc", r#"{"symbol": "BTC", "price": 42.5}"#)
            .with_url("http://prices.test/bad", "not json"),
    );

    let quote = lp.get_json("http://prices.test/btc");
    let quote = lp.run_until(&quote).unwrap().unwrap();
    assert_eq!(quote["price"], 42.5);
    assert_eq!(quote["symbol"], "BTC");

    let bad = lp.get_json("http://prices.test/bad");
    let failure = lp.run_until(&bad).unwrap().unwrap_err();
    assert_eq!(failure.kind(), "DecodeFailure");
}

#[test]
fn io_and_timers_interleave() {
    let lp = memory_loop(MemoryProvider::new().with_file("config.toml", "x = 1"));
    let h = lp.handle();

    let combined = lp.read_to_string("config.toml").and_then(move |text| {
        h.schedule_after(Duration::from_secs(2), move || Ok::<_, Failure>(text.len()))
    });

    assert_eq!(lp.run_until(&combined).unwrap(), Ok(5));
    assert_eq!(lp.now(), Duration::from_secs(2));
}

#[test]
fn system_provider_reads_local_files() {
    let path = std::env::temp_dir().join(format!("deferron-io-{}.txt", std::process::id()));
    std::fs::write(&path, "from disk").unwrap();
    let lp = EventLoop::builder().virtual_clock().build();

    let text = lp.read_to_string(path.clone());
    let missing = lp.read(path.with_extension("absent"));
    assert_eq!(lp.run_until(&text).unwrap(), Ok("from disk".to_string()));
    assert_eq!(lp.run_until(&missing).unwrap().unwrap_err().kind(), "NotFound");

    std::fs::remove_file(path).unwrap();
}

#[test]
fn system_provider_takes_timeout_from_config() {
    let config = RunnerConfig::new().http_timeout(Duration::from_millis(1500));

    let provider = SystemProvider::from_config(&config).unwrap();
    assert_eq!(provider.timeout(), Duration::from_millis(1500));
}
