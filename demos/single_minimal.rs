//! Minimal single-process setup with a programmatic config.
//!
//! Serves metrics on `http://127.0.0.1:9464/metrics` while generating a
//! little sample traffic.

use promkit::{Config, ScopeTimer};
use std::thread;
use std::time::Duration;

fn main() {
    env_logger::init();

    let mut config = Config::default();
    config.host = "127.0.0.1".into();
    config.prefix = "promkit".into();
    for (key, value) in [("service", "example"), ("component", "demo"), ("env", "dev")] {
        config.labels.insert(key.into(), value.into());
    }

    let endpoint = format!("http://{}:{}{}", config.host, config.port, config.path);
    if !promkit::init(config) {
        eprintln!("metrics init failed");
        std::process::exit(1);
    }

    let ok = promkit::create_counter("orders_processed_total", "Total processed", &[("result", "ok")]);
    let err = promkit::create_counter(
        "orders_processed_total",
        "Total processed",
        &[("result", "error")],
    );
    let backlog = promkit::create_gauge("order_backlog", "Pending queue length", &[]);
    let latency = promkit::create_histogram(
        "order_processing_seconds",
        "Latency",
        &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0],
        &[],
    );

    println!("Serving metrics on {endpoint}");
    for i in 0..20u64 {
        promkit::counter_inc(ok);
        if i % 5 == 0 {
            promkit::counter_inc(err);
        }
        promkit::gauge_set(backlog, (100 - i) as f64);

        {
            let _timer = ScopeTimer::new(latency);
            thread::sleep(Duration::from_millis(5 + i % 7));
        }

        thread::sleep(Duration::from_millis(200));
    }

    promkit::shutdown();
}
