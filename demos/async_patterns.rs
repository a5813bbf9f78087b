//! A walk through the patterns the runner supports: a delayed callback, a
//! 3-2-1 countdown, an error-first file read, a coin-flip promise, a JSON
//! fetch with `then` chains, and the same file load and fetch as workflows.
//!
//! Run with `RUST_LOG=deferron=debug` to see the loop at work. Set
//! `DEFERRON_CLOCK=virtual` to skip the waiting.

use std::{error::Error, time::Duration};

use deferron::{
    ConsoleObserver, EventLoop, Failure, Handle, RunnerConfig, SystemProvider, Task,
};
use rand::Rng;
use tracing_subscriber::EnvFilter;

const DATA_FILE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/demos/data.txt");
const BTC_URL: &str = "https://api.coincap.io/v2/assets/bitcoin";

fn tick(h: &Handle, n: u32) -> Task<()> {
    let reporter = h.clone();
    h.schedule_after(Duration::from_secs(1), move || {
        reporter.report(n);
        Ok::<_, Failure>(())
    })
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = RunnerConfig::from_env()?;
    let lp = EventLoop::builder()
        .provider(SystemProvider::from_config(&config)?)
        .config(config)
        .observer(ConsoleObserver)
        .build();
    let h = lp.handle();

    // Delayed callback.
    {
        let h = h.clone();
        lp.schedule_after(Duration::from_secs(1), move || {
            h.report("waited for 1 second, then did something");
            Ok::<_, Failure>(())
        });
    }

    // Countdown, chained instead of nested.
    {
        let (h2, h1) = (h.clone(), h.clone());
        tick(&h, 3)
            .and_then(move |()| tick(&h2, 2))
            .and_then(move |()| tick(&h1, 1))
            .on_settle(|_| {});
    }

    // Error-first callback.
    {
        let h = h.clone();
        lp.read_to_string(DATA_FILE).on_settle(move |outcome| match outcome {
            Ok(data) => h.report(format!("success! {}", data.trim_end())),
            Err(failure) => {
                h.report_failure(&failure);
                h.report("oops!, something went wrong");
            }
        });
    }

    // A promise that resolves or rejects on a coin flip.
    {
        let (ok, err) = (h.clone(), h.clone());
        lp.promise(|settler| {
            if rand::thread_rng().gen_range(0..2) == 0 {
                settler.resolve(());
            } else {
                settler.reject(Failure::new("CoinFlip", "tails"));
            }
        })
        .then(
            move |()| {
                ok.report("success! promise resolved");
                Ok::<_, Failure>(())
            },
            move |_| {
                err.report("failure! promise rejected");
                Ok::<_, Failure>(())
            },
        )
        .on_settle(|_| {});
    }

    // Fetch and decode with continuations.
    {
        let (ok, err) = (h.clone(), h.clone());
        lp.get_json(BTC_URL).on_settle(move |outcome| match outcome {
            Ok(data) => ok.report(&data["data"]["priceUsd"]),
            Err(failure) => {
                err.report_failure(&failure);
                err.report(format!("something went wrong: {failure}"));
            }
        });
    }

    // The same file load and fetch, written as workflows.
    {
        let h = h.clone();
        lp.spawn_workflow(async move {
            match h.read_to_string(DATA_FILE).await {
                Ok(data) => h.report(format!("async/await: {}", data.trim_end())),
                Err(failure) => {
                    h.report_failure(&failure);
                    h.report(format!("uh oh... {failure}"));
                }
            }
            Ok::<_, Failure>(())
        });
    }
    {
        let h = h.clone();
        lp.spawn_workflow(async move {
            match h.get_json(BTC_URL).await {
                Ok(data) => h.report(&data["data"]),
                Err(failure) => {
                    h.report_failure(&failure);
                    h.report(format!("always handle your errors: {failure}"));
                }
            }
            Ok::<_, Failure>(())
        });
    }

    let stats = lp.run()?;
    tracing::info!(?stats, elapsed = ?lp.now(), "demo finished");
    Ok(())
}
