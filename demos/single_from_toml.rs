//! Single-process setup driven by a TOML config file.
//!
//! ```sh
//! cargo run --example single_from_toml -- demos/configs/single.toml
//! ```

use promkit::ScopeTimer;
use std::thread;
use std::time::Duration;

fn main() {
    env_logger::init();

    let Some(config_path) = std::env::args().nth(1) else {
        eprintln!("Usage: single_from_toml <config.toml>");
        std::process::exit(2);
    };

    if !promkit::init_from_toml(&config_path) {
        eprintln!("metrics init failed: {config_path}");
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

    println!("Metrics server started; generating sample data...");
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
