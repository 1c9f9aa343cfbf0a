//! Mock order-management flow: a background thread plays the upstream
//! system sending orders, and each order bumps a counter and times its
//! processing through a scoped histogram observation.
//!
//! ```sh
//! cargo run --example oms_trader -- demos/configs/oms_trader.toml
//! ```

use promkit::{CounterId, HistogramId, ScopeTimer};
use rand::RngExt as _;
use std::thread;
use std::time::Duration;

struct Order {
    #[allow(dead_code)]
    order_no: i64,
    #[allow(dead_code)]
    symbol: String,
}

struct OrderMetrics {
    received: CounterId,
    processing: HistogramId,
}

fn process_order(metrics: &OrderMetrics, _order: &Order) {
    let _timer = ScopeTimer::new(metrics.processing);

    // Random 2-50ms sleep to mimic processing.
    let delay = rand::rng().random_range(2..=50);
    thread::sleep(Duration::from_millis(delay));
}

fn on_order(metrics: &OrderMetrics, order: &Order) {
    promkit::counter_inc(metrics.received);
    process_order(metrics, order);
}

/// Emits orders forever with a random gap between them.
fn run_mock_order_source(metrics: OrderMetrics) {
    let mut order_no = 0i64;

    loop {
        order_no += 1;
        let order = Order {
            order_no,
            symbol: "TEST".into(),
        };
        on_order(&metrics, &order);

        let gap = rand::rng().random_range(10..=60);
        thread::sleep(Duration::from_millis(gap));
    }
}

fn main() {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "demos/configs/oms_trader.toml".to_owned());

    if !promkit::init_from_toml(&config_path) {
        eprintln!("metrics init failed: {config_path}");
        std::process::exit(1);
    }

    // Handle names must match the TOML declarations.
    let metrics = OrderMetrics {
        received: promkit::create_counter("orders_received_total", "Total number of received orders", &[]),
        processing: promkit::create_histogram("order_processing_seconds", "Order processing latency", &[], &[]),
    };

    let source = thread::spawn(move || run_mock_order_source(metrics));

    // Metrics are served at the configured endpoint until Ctrl+C.
    source.join().expect("order source panicked");

    promkit::shutdown();
}
