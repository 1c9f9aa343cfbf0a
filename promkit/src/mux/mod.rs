//! Single-host multi-process aggregation.
//!
//! When several processes of one logical component run on a host, exactly
//! one of them owns the public scrape port. That process serves a
//! [`MuxCollector`]: on every scrape it discovers its sibling workers
//! through descriptor files, fetches each worker's exposition over
//! loopback, and emits the per-worker series (distinguished by their
//! `component` label) together with a summed aggregate view.

mod descriptor;

pub use descriptor::{MUX_ROOT, WorkerEndpoint};
pub(crate) use descriptor::{mux_dir, scan_dir, write_descriptor};

use crate::registry::MetricRegistry;
use crate::server::Collectable;
use crate::textfmt::parse_text_exposition;
use log::debug;
use prometheus::proto;
use std::collections::BTreeMap;
use std::io::{Read as _, Write as _};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Cap on connect and read time per worker, so one hung worker cannot
/// stall the whole scrape indefinitely.
const WORKER_IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Scrape-time aggregator over co-resident worker processes.
///
/// The collector holds no background state: every [`collect`] call scans
/// the descriptor directory (pruning descriptors of dead pids), scrapes
/// each live worker and merges the results. Workers that cannot be
/// reached or return malformed bodies are skipped for that scrape.
///
/// [`collect`]: Collectable::collect
#[derive(Default)]
pub struct MuxCollector {
    dir: Option<PathBuf>,
    workers: Vec<WorkerEndpoint>,
    own: Option<(Weak<MetricRegistry>, String)>,
}

impl MuxCollector {
    /// Creates a collector with no sources configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the descriptor directory scanned on every scrape.
    pub fn set_directory(&mut self, dir: impl Into<PathBuf>) {
        self.dir = Some(dir.into());
    }

    /// Pins a static worker list instead of scanning the directory.
    pub fn set_workers(&mut self, workers: Vec<WorkerEndpoint>) {
        self.workers = workers;
    }

    /// Includes the aggregator's own registry in the merged view. The
    /// registry's series already carry their `component` label; no label
    /// is injected at scrape time.
    pub fn set_own_registry(&mut self, registry: &Arc<MetricRegistry>, component: impl Into<String>) {
        self.own = Some((Arc::downgrade(registry), component.into()));
    }
}

impl Collectable for MuxCollector {
    fn collect(&self) -> Vec<proto::MetricFamily> {
        let mut workers = self.workers.clone();
        if workers.is_empty() {
            if let Some(dir) = &self.dir {
                workers = scan_dir(dir);
            }
        }

        let mut merged: Vec<proto::MetricFamily> = Vec::new();

        if let Some((own, _)) = &self.own {
            if let Some(registry) = own.upgrade() {
                for family in registry.collect_families() {
                    merge_family(&mut merged, family);
                }
            }
        }

        for worker in &workers {
            let body = match fetch_worker(worker) {
                Ok(body) => body,
                Err(err) => {
                    debug!("skipping worker {}:{}: {err}", worker.host, worker.port);
                    continue;
                }
            };

            for family in parse_text_exposition(&body) {
                merge_family(&mut merged, counterize_untyped(family));
            }
        }

        append_summed_view(&mut merged);

        merged
    }
}

/// Fetches a worker's exposition with a minimal blocking HTTP/1.0 GET.
/// Loopback only; the response headers are stripped off the body.
fn fetch_worker(worker: &WorkerEndpoint) -> anyhow::Result<String> {
    let addr = SocketAddr::from(([127, 0, 0, 1], worker.port));
    let mut stream = TcpStream::connect_timeout(&addr, WORKER_IO_TIMEOUT)?;
    stream.set_read_timeout(Some(WORKER_IO_TIMEOUT))?;
    stream.set_write_timeout(Some(WORKER_IO_TIMEOUT))?;

    let request = format!(
        "GET {} HTTP/1.0\r\nHost: {}\r\nConnection: close\r\n\r\n",
        worker.path, worker.host
    );
    stream.write_all(request.as_bytes())?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let response = String::from_utf8_lossy(&response);

    let body = match response.find("\r\n\r\n") {
        Some(pos) => &response[pos + 4..],
        None => &response[..],
    };

    Ok(body.to_owned())
}

/// Re-types parsed untyped families as counters.
///
/// Worker bodies arrive without TYPE metadata, so their counters parse as
/// untyped; treating them as counters lets them merge and sum with the
/// aggregator's own typed families.
fn counterize_untyped(mut family: proto::MetricFamily) -> proto::MetricFamily {
    if family.get_field_type() != proto::MetricType::UNTYPED {
        return family;
    }

    family.set_field_type(proto::MetricType::COUNTER);
    for metric in family.mut_metric().iter_mut() {
        let mut counter = proto::Counter::default();
        counter.set_value(metric.get_untyped().get_value());
        metric.set_counter(counter);
    }

    family
}

/// Appends `family`'s series into the family with the same name and type,
/// keeping the first non-empty help text.
fn merge_family(merged: &mut Vec<proto::MetricFamily>, family: proto::MetricFamily) {
    let existing = merged
        .iter_mut()
        .find(|f| f.name() == family.name() && f.get_field_type() == family.get_field_type());

    match existing {
        Some(dst) => {
            if dst.help().is_empty() && !family.help().is_empty() {
                dst.set_help(family.help().to_owned());
            }
            for metric in family.get_metric() {
                dst.mut_metric().push(metric.clone());
            }
        }
        None => merged.push(family),
    }
}

struct HistogramSum {
    labels: Vec<proto::LabelPair>,
    count: u64,
    sum: f64,
    buckets: Vec<(f64, u64)>,
}

/// Appends one summed series per `(family, labels \ {component})` group
/// for counter and histogram families. Per-component series stay in
/// place; gauges are left per-component only.
fn append_summed_view(merged: &mut Vec<proto::MetricFamily>) {
    let mut additions: Vec<(String, proto::MetricType, Vec<proto::Metric>)> = Vec::new();

    for family in merged.iter() {
        match family.get_field_type() {
            proto::MetricType::COUNTER => {
                let mut groups: BTreeMap<String, (Vec<proto::LabelPair>, f64)> = BTreeMap::new();

                for metric in family.get_metric() {
                    let labels = labels_without_component(metric.get_label());
                    let entry = groups
                        .entry(group_key(&labels))
                        .or_insert_with(|| (labels, 0.0));
                    entry.1 += metric.get_counter().get_value();
                }

                let metrics = groups
                    .into_values()
                    .map(|(labels, total)| {
                        let mut metric = proto::Metric::default();
                        metric.set_label(labels);
                        let mut counter = proto::Counter::default();
                        counter.set_value(total);
                        metric.set_counter(counter);
                        metric
                    })
                    .collect();

                additions.push((family.name().to_owned(), proto::MetricType::COUNTER, metrics));
            }
            proto::MetricType::HISTOGRAM => {
                let mut groups: BTreeMap<String, HistogramSum> = BTreeMap::new();

                for metric in family.get_metric() {
                    let labels = labels_without_component(metric.get_label());
                    let histogram = metric.get_histogram();
                    let entry = groups.entry(group_key(&labels)).or_insert_with(|| {
                        HistogramSum {
                            labels,
                            count: 0,
                            sum: 0.0,
                            buckets: Vec::new(),
                        }
                    });

                    entry.count += histogram.get_sample_count();
                    entry.sum += histogram.get_sample_sum();

                    for bucket in histogram.get_bucket() {
                        match entry
                            .buckets
                            .iter_mut()
                            .find(|(upper_bound, _)| *upper_bound == bucket.upper_bound())
                        {
                            Some(slot) => slot.1 += bucket.cumulative_count(),
                            None => entry
                                .buckets
                                .push((bucket.upper_bound(), bucket.cumulative_count())),
                        }
                    }
                }

                let metrics = groups
                    .into_values()
                    .map(|mut group| {
                        let mut metric = proto::Metric::default();
                        metric.set_label(group.labels);

                        let mut histogram = proto::Histogram::default();
                        group.buckets.sort_by(|a, b| a.0.total_cmp(&b.0));
                        histogram.set_bucket(
                            group
                                .buckets
                                .into_iter()
                                .map(|(upper_bound, count)| {
                                    let mut bucket = proto::Bucket::default();
                                    bucket.set_upper_bound(upper_bound);
                                    bucket.set_cumulative_count(count);
                                    bucket
                                })
                                .collect(),
                        );
                        histogram.set_sample_count(group.count);
                        histogram.set_sample_sum(group.sum);
                        metric.set_histogram(histogram);
                        metric
                    })
                    .collect();

                additions.push((
                    family.name().to_owned(),
                    proto::MetricType::HISTOGRAM,
                    metrics,
                ));
            }
            _ => {}
        }
    }

    for (name, kind, metrics) in additions {
        if let Some(dst) = merged
            .iter_mut()
            .find(|f| f.name() == name && f.get_field_type() == kind)
        {
            for metric in metrics {
                dst.mut_metric().push(metric);
            }
        }
    }
}

fn labels_without_component(labels: &[proto::LabelPair]) -> Vec<proto::LabelPair> {
    labels
        .iter()
        .filter(|l| l.name() != "component")
        .cloned()
        .collect()
}

fn group_key(labels: &[proto::LabelPair]) -> String {
    let mut sorted: Vec<_> = labels.iter().map(|l| (l.name(), l.value())).collect();
    sorted.sort();

    sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("|")
}
