//! Aggregation across worker processes, simulated with several registries
//! and exposers inside one test process.

use promkit::mux::MuxCollector;
use promkit::registry::MetricRegistry;
use promkit::server::{Collectable, Exposer};
use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

/// A fake worker process: a registry with a `component` label served on an
/// ephemeral loopback port.
fn spawn_worker(component: &str, counter_value: f64) -> (Arc<MetricRegistry>, Exposer) {
    let registry = Arc::new(MetricRegistry::new(
        "",
        labels(&[("component", component), ("k", "v")]),
    ));
    let exposer = Exposer::bind("127.0.0.1:0").unwrap();
    exposer.register_collector("/metrics", Arc::clone(&registry) as _);

    let id = registry.create_counter("c", "", &[]);
    registry.counter_add(id, counter_value);

    (registry, exposer)
}

fn write_descriptor(dir: &Path, name: &str, port: u16, component: &str, pid: u32) {
    std::fs::write(
        dir.join(name),
        format!("endpoint 127.0.0.1:{port}\ncomponent {component}\npid {pid}\npath /metrics\n"),
    )
    .unwrap();
}

#[tokio::test]
async fn aggregates_workers_and_appends_summed_view() {
    let dir = tempfile::tempdir().unwrap();
    let pid = std::process::id();

    let (_registry_a, worker_a) = spawn_worker("alpha", 1.0);
    let (_registry_b, worker_b) = spawn_worker("beta", 2.0);
    write_descriptor(dir.path(), "port.alpha", worker_a.listening_port(), "alpha", pid);
    write_descriptor(dir.path(), "port.beta", worker_b.listening_port(), "beta", pid);

    // The aggregator's own registry joins the merge through the collector.
    let own = Arc::new(MetricRegistry::new(
        "",
        labels(&[("component", "gamma"), ("k", "v")]),
    ));
    let id = own.create_counter("c", "", &[]);
    own.counter_add(id, 4.0);

    let mut collector = MuxCollector::new();
    collector.set_directory(dir.path());
    collector.set_own_registry(&own, "gamma");

    let aggregator = Exposer::bind("127.0.0.1:0").unwrap();
    aggregator.register_collector("/metrics", Arc::new(collector) as _);

    let body = reqwest::get(format!("http://{}/metrics", aggregator.local_addr()))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(
        body.contains(r#"c{component="gamma",k="v"} 4"#),
        "own series missing: {body}"
    );
    assert!(
        body.contains(r#"c{component="alpha",k="v"} 1"#),
        "worker series missing: {body}"
    );
    assert!(
        body.contains(r#"c{component="beta",k="v"} 2"#),
        "worker series missing: {body}"
    );
    assert!(body.contains(r#"c{k="v"} 7"#), "summed series missing: {body}");
}

#[tokio::test]
async fn stale_descriptor_is_pruned_without_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let stale = dir.path().join("port.999999");
    std::fs::write(
        &stale,
        "endpoint 127.0.0.1:59999\ncomponent ghost\npid 999999\npath /metrics\n",
    )
    .unwrap();

    let mut collector = MuxCollector::new();
    collector.set_directory(dir.path());

    let families = collector.collect();
    assert!(families.is_empty());
    assert!(!stale.exists(), "stale descriptor should have been removed");
}

#[tokio::test]
async fn unreachable_worker_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let pid = std::process::id();

    // A port that was live once but has no listener anymore.
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    write_descriptor(dir.path(), "port.zombie", dead_port, "zombie", pid);

    let (_registry, worker) = spawn_worker("alpha", 1.0);
    write_descriptor(dir.path(), "port.alpha", worker.listening_port(), "alpha", pid);

    let mut collector = MuxCollector::new();
    collector.set_directory(dir.path());

    let families = collector.collect();
    assert_eq!(families.len(), 1);

    let series: Vec<_> = families[0]
        .get_metric()
        .iter()
        .flat_map(|m| m.get_label())
        .filter(|l| l.name() == "component")
        .map(|l| l.value().to_owned())
        .collect();
    assert_eq!(series, vec!["alpha"]);

    // The descriptor stays: its pid is alive, only the port is gone.
    assert!(dir.path().join("port.zombie").exists());
}
