//! The metric registry: families, time series and declarative specs.
//!
//! Series live in per-type arenas and are addressed by opaque 64-bit
//! handles packing the registry generation and the arena slot. The
//! generation changes whenever a new registry is constructed, so handles
//! issued by a previous registry are inert rather than dangling.
//!
//! Updates touch only lock-free atomic cells; the registry mutex guards
//! creation, resolution and the scrape-time snapshot.

use crate::settings::{MetricKind, Settings};
use crate::{CounterId, GaugeId, HistogramId};
use parking_lot::{Mutex, RwLock};
use prometheus::core::{Atomic as _, AtomicF64, AtomicU64};
use prometheus::proto;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Bucket layout used when a histogram is created without explicit buckets
/// and no profile is configured. Spans 1ms to 2s.
pub const DEFAULT_LATENCY_BUCKETS: &[f64] =
    &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0];

static NEXT_GENERATION: AtomicU32 = AtomicU32::new(1);

#[inline]
fn pack_handle(generation: u32, slot: u32) -> u64 {
    (u64::from(generation) << 32) | u64::from(slot + 1)
}

#[inline]
fn unpack_handle(raw: u64) -> Option<(u32, usize)> {
    let slot = (raw & 0xffff_ffff) as u32;
    if slot == 0 {
        return None;
    }

    Some(((raw >> 32) as u32, slot as usize - 1))
}

pub(crate) fn full_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}_{name}")
    }
}

/// Cache key for a series: `fullname|k=v,k2=v2` with keys in lexicographic
/// order (`BTreeMap` iteration order).
fn series_key(fullname: &str, labels: &BTreeMap<String, String>) -> String {
    let mut key = String::with_capacity(fullname.len() + 16 * labels.len());
    key.push_str(fullname);
    key.push('|');

    for (i, (k, v)) in labels.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }

    key
}

/// Inserts every entry of `incoming` that is not already present.
///
/// First write wins: existing keys keep their value, which makes global
/// labels authoritative over caller-provided duplicates.
fn merge_labels(target: &mut BTreeMap<String, String>, incoming: &BTreeMap<String, String>) {
    for (k, v) in incoming {
        target.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

/// Cartesian product of the dynamic label declaration. A key with an empty
/// value list contributes nothing; no dynamic labels yield one empty
/// combination.
fn label_combinations(
    dynamic: &BTreeMap<String, Vec<String>>,
) -> Vec<BTreeMap<String, String>> {
    let mut combos = vec![BTreeMap::new()];

    for (key, values) in dynamic {
        if values.is_empty() {
            continue;
        }

        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for value in values {
                let mut extended = combo.clone();
                extended.insert(key.clone(), value.clone());
                next.push(extended);
            }
        }
        combos = next;
    }

    combos
}

/// Validation data for a declared metric. Series of a declared metric are
/// fixed at pre-registration time and never created on the fly.
#[derive(Clone, Debug)]
struct MetricSpec {
    const_labels: BTreeMap<String, String>,
    dynamic_labels: BTreeMap<String, Vec<String>>,
}

impl MetricSpec {
    /// A provided label must either match a declared constant label exactly
    /// or be a dynamic key with a value from its allowed list.
    fn allows(&self, provided: &BTreeMap<String, String>) -> bool {
        for (key, value) in provided {
            if let Some(expected) = self.const_labels.get(key) {
                if expected != value {
                    return false;
                }
                continue;
            }

            match self.dynamic_labels.get(key) {
                Some(allowed) if allowed.iter().any(|a| a == value) => {}
                _ => return false,
            }
        }

        true
    }
}

struct CounterSeries {
    labels: BTreeMap<String, String>,
    value: AtomicF64,
}

struct GaugeSeries {
    labels: BTreeMap<String, String>,
    value: AtomicF64,
}

struct HistogramSeries {
    labels: BTreeMap<String, String>,
    upper_bounds: Vec<f64>,
    // Per-bucket counts; cumulated at scrape time.
    bucket_counts: Vec<AtomicU64>,
    count: AtomicU64,
    sum: AtomicF64,
}

impl HistogramSeries {
    fn new(labels: BTreeMap<String, String>, upper_bounds: Vec<f64>) -> Self {
        let bucket_counts = upper_bounds.iter().map(|_| AtomicU64::new(0)).collect();

        Self {
            labels,
            upper_bounds,
            bucket_counts,
            count: AtomicU64::new(0),
            sum: AtomicF64::new(0.0),
        }
    }

    fn observe(&self, value: f64) {
        if let Some(idx) = self.upper_bounds.iter().position(|ub| value <= *ub) {
            self.bucket_counts[idx].inc_by(1);
        }

        self.count.inc_by(1);
        self.sum.inc_by(value);
    }
}

struct FamilyEntry {
    help: String,
    series: Vec<u32>,
}

impl FamilyEntry {
    fn new(help: &str) -> Self {
        Self {
            help: help.to_owned(),
            series: Vec::new(),
        }
    }
}

#[derive(Default)]
struct RegistryCore {
    counter_families: BTreeMap<String, FamilyEntry>,
    gauge_families: BTreeMap<String, FamilyEntry>,
    histogram_families: BTreeMap<String, FamilyEntry>,
    counter_series: BTreeMap<String, u32>,
    gauge_series: BTreeMap<String, u32>,
    histogram_series: BTreeMap<String, u32>,
    specs: BTreeMap<String, MetricSpec>,
}

/// Owns metric families and time series for one running session.
///
/// The registry enforces declared metric specs, injects global labels into
/// every series, and produces the families consumed by the exposer. The
/// process-global API in the crate root is a thin layer over a registry
/// guarded by the lifecycle state machine; hosts can also construct and
/// expose registries directly.
pub struct MetricRegistry {
    prefix: String,
    global_labels: BTreeMap<String, String>,
    generation: u32,
    open: AtomicBool,
    core: Mutex<RegistryCore>,
    counters: RwLock<Vec<Arc<CounterSeries>>>,
    gauges: RwLock<Vec<Arc<GaugeSeries>>>,
    histograms: RwLock<Vec<Arc<HistogramSeries>>>,
}

impl MetricRegistry {
    /// Creates an empty registry. Metric names are prefixed with
    /// `<prefix>_` and `global_labels` are injected into every series.
    pub fn new(prefix: &str, global_labels: BTreeMap<String, String>) -> Self {
        Self {
            prefix: prefix.to_owned(),
            global_labels,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            open: AtomicBool::new(true),
            core: Mutex::new(RegistryCore::default()),
            counters: RwLock::new(Vec::new()),
            gauges: RwLock::new(Vec::new()),
            histograms: RwLock::new(Vec::new()),
        }
    }

    /// Registers the declared metrics of `settings`: records their specs
    /// and eagerly creates one series per dynamic label combination, so
    /// the full declared series set is visible on the first scrape.
    /// Declarations without a name or kind are skipped.
    pub fn pre_register(&self, settings: &Settings) {
        for def in &settings.metrics {
            let Some(kind) = def.kind else { continue };
            if def.name.is_empty() {
                continue;
            }

            let fullname = full_name(&self.prefix, &def.name);
            let buckets = match settings.buckets.get(&def.buckets_profile) {
                Some(profile) if kind == MetricKind::Histogram => profile.clone(),
                _ => DEFAULT_LATENCY_BUCKETS.to_vec(),
            };

            let mut base = self.global_labels.clone();
            merge_labels(&mut base, &def.const_labels);
            let combos = label_combinations(&def.dynamic_labels);

            let mut core = self.core.lock();
            if !self.open.load(Ordering::Relaxed) {
                return;
            }

            core.specs.entry(fullname.clone()).or_insert_with(|| MetricSpec {
                const_labels: def.const_labels.clone(),
                dynamic_labels: def.dynamic_labels.clone(),
            });

            for combo in combos {
                let mut labels = base.clone();
                merge_labels(&mut labels, &combo);

                match kind {
                    MetricKind::Counter => {
                        self.insert_counter(&mut core, &fullname, &def.help, labels);
                    }
                    MetricKind::Gauge => {
                        self.insert_gauge(&mut core, &fullname, &def.help, labels);
                    }
                    MetricKind::Histogram => {
                        self.insert_histogram(
                            &mut core,
                            &fullname,
                            &def.help,
                            labels,
                            buckets.clone(),
                        );
                    }
                }
            }
        }
    }

    /// Resolves or creates a counter series.
    ///
    /// For declared metrics the provided labels are validated against the
    /// declaration and only pre-registered series resolve; anything else
    /// yields the invalid handle. Undeclared metrics get family and series
    /// created on demand (first help string wins). Global labels are
    /// authoritative over provided duplicates.
    pub fn create_counter(
        &self,
        name: &str,
        help: &str,
        const_labels: &[(&str, &str)],
    ) -> CounterId {
        if !self.open.load(Ordering::Acquire) {
            return CounterId::INVALID;
        }

        let (fullname, provided, mut final_labels) = self.resolve_labels(name, const_labels);

        let mut core = self.core.lock();
        if !self.open.load(Ordering::Relaxed) {
            return CounterId::INVALID;
        }

        if let Some(spec) = core.specs.get(&fullname) {
            merge_labels(&mut final_labels, &spec.const_labels);
            if !spec.allows(&provided) {
                return CounterId::INVALID;
            }

            let key = series_key(&fullname, &final_labels);
            return match core.counter_series.get(&key) {
                Some(&slot) => CounterId(pack_handle(self.generation, slot)),
                None => CounterId::INVALID,
            };
        }

        let slot = self.insert_counter(&mut core, &fullname, help, final_labels);
        CounterId(pack_handle(self.generation, slot))
    }

    /// Resolves or creates a gauge series; see [`create_counter`] for the
    /// resolution rules.
    ///
    /// [`create_counter`]: MetricRegistry::create_counter
    pub fn create_gauge(&self, name: &str, help: &str, const_labels: &[(&str, &str)]) -> GaugeId {
        if !self.open.load(Ordering::Acquire) {
            return GaugeId::INVALID;
        }

        let (fullname, provided, mut final_labels) = self.resolve_labels(name, const_labels);

        let mut core = self.core.lock();
        if !self.open.load(Ordering::Relaxed) {
            return GaugeId::INVALID;
        }

        if let Some(spec) = core.specs.get(&fullname) {
            merge_labels(&mut final_labels, &spec.const_labels);
            if !spec.allows(&provided) {
                return GaugeId::INVALID;
            }

            let key = series_key(&fullname, &final_labels);
            return match core.gauge_series.get(&key) {
                Some(&slot) => GaugeId(pack_handle(self.generation, slot)),
                None => GaugeId::INVALID,
            };
        }

        let slot = self.insert_gauge(&mut core, &fullname, help, final_labels);
        GaugeId(pack_handle(self.generation, slot))
    }

    /// Resolves or creates a histogram series; see [`create_counter`] for
    /// the resolution rules. `buckets` applies to undeclared metrics only
    /// (declared histograms use their configured profile); an empty slice
    /// selects [`DEFAULT_LATENCY_BUCKETS`].
    ///
    /// [`create_counter`]: MetricRegistry::create_counter
    pub fn create_histogram(
        &self,
        name: &str,
        help: &str,
        buckets: &[f64],
        const_labels: &[(&str, &str)],
    ) -> HistogramId {
        if !self.open.load(Ordering::Acquire) {
            return HistogramId::INVALID;
        }

        let (fullname, provided, mut final_labels) = self.resolve_labels(name, const_labels);

        let mut core = self.core.lock();
        if !self.open.load(Ordering::Relaxed) {
            return HistogramId::INVALID;
        }

        if let Some(spec) = core.specs.get(&fullname) {
            merge_labels(&mut final_labels, &spec.const_labels);
            if !spec.allows(&provided) {
                return HistogramId::INVALID;
            }

            let key = series_key(&fullname, &final_labels);
            return match core.histogram_series.get(&key) {
                Some(&slot) => HistogramId(pack_handle(self.generation, slot)),
                None => HistogramId::INVALID,
            };
        }

        let used_buckets = if buckets.is_empty() {
            DEFAULT_LATENCY_BUCKETS.to_vec()
        } else {
            buckets.to_vec()
        };

        let slot = self.insert_histogram(&mut core, &fullname, help, final_labels, used_buckets);
        HistogramId(pack_handle(self.generation, slot))
    }

    /// Adds `value` to a counter. Non-positive values are dropped so the
    /// counter never decreases; a stale or invalid handle is a no-op.
    pub fn counter_add(&self, id: CounterId, value: f64) {
        if !(value > 0.0) {
            return;
        }

        if let Some(series) = self.counter_at(id.0) {
            series.value.inc_by(value);
        }
    }

    /// Replaces a gauge value.
    pub fn gauge_set(&self, id: GaugeId, value: f64) {
        if let Some(series) = self.gauge_at(id.0) {
            series.value.set(value);
        }
    }

    /// Moves a gauge by `delta` (up or down).
    pub fn gauge_add(&self, id: GaugeId, delta: f64) {
        if let Some(series) = self.gauge_at(id.0) {
            if delta >= 0.0 {
                series.value.inc_by(delta);
            } else {
                series.value.dec_by(-delta);
            }
        }
    }

    /// Records one observation into a histogram.
    pub fn histogram_observe(&self, id: HistogramId, value: f64) {
        if let Some(series) = self.histogram_at(id.0) {
            series.observe(value);
        }
    }

    /// Snapshots every family for a scrape. Families are ordered counters,
    /// gauges, histograms, each sorted by name; series keep creation order.
    pub fn collect_families(&self) -> Vec<proto::MetricFamily> {
        let core = self.core.lock();
        let mut out = Vec::new();

        let counters = self.counters.read();
        for (name, family) in &core.counter_families {
            let mut mf = proto::MetricFamily::default();
            mf.set_name(name.clone());
            mf.set_help(family.help.clone());
            mf.set_field_type(proto::MetricType::COUNTER);

            for &slot in &family.series {
                let Some(series) = counters.get(slot as usize) else {
                    continue;
                };

                let mut metric = proto::Metric::default();
                metric.set_label(label_pairs(&series.labels));
                let mut counter = proto::Counter::default();
                counter.set_value(series.value.get());
                metric.set_counter(counter);
                mf.mut_metric().push(metric);
            }

            out.push(mf);
        }
        drop(counters);

        let gauges = self.gauges.read();
        for (name, family) in &core.gauge_families {
            let mut mf = proto::MetricFamily::default();
            mf.set_name(name.clone());
            mf.set_help(family.help.clone());
            mf.set_field_type(proto::MetricType::GAUGE);

            for &slot in &family.series {
                let Some(series) = gauges.get(slot as usize) else {
                    continue;
                };

                let mut metric = proto::Metric::default();
                metric.set_label(label_pairs(&series.labels));
                let mut gauge = proto::Gauge::default();
                gauge.set_value(series.value.get());
                metric.set_gauge(gauge);
                mf.mut_metric().push(metric);
            }

            out.push(mf);
        }
        drop(gauges);

        let histograms = self.histograms.read();
        for (name, family) in &core.histogram_families {
            let mut mf = proto::MetricFamily::default();
            mf.set_name(name.clone());
            mf.set_help(family.help.clone());
            mf.set_field_type(proto::MetricType::HISTOGRAM);

            for &slot in &family.series {
                let Some(series) = histograms.get(slot as usize) else {
                    continue;
                };

                let mut metric = proto::Metric::default();
                metric.set_label(label_pairs(&series.labels));
                metric.set_histogram(histogram_proto(series));
                mf.mut_metric().push(metric);
            }

            out.push(mf);
        }

        out
    }

    /// Clears every family, series and declaration and rejects further
    /// creation.
    /// In-flight updates against already-resolved series finish on their
    /// own copies; subsequent lookups miss.
    pub fn close(&self) {
        let mut core = self.core.lock();
        self.open.store(false, Ordering::Release);
        *core = RegistryCore::default();
        self.counters.write().clear();
        self.gauges.write().clear();
        self.histograms.write().clear();
    }

    fn resolve_labels(
        &self,
        name: &str,
        const_labels: &[(&str, &str)],
    ) -> (String, BTreeMap<String, String>, BTreeMap<String, String>) {
        let fullname = full_name(&self.prefix, name);

        let provided: BTreeMap<String, String> = const_labels
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();

        let mut final_labels = self.global_labels.clone();
        merge_labels(&mut final_labels, &provided);

        (fullname, provided, final_labels)
    }

    fn insert_counter(
        &self,
        core: &mut RegistryCore,
        fullname: &str,
        help: &str,
        labels: BTreeMap<String, String>,
    ) -> u32 {
        let key = series_key(fullname, &labels);
        if let Some(&slot) = core.counter_series.get(&key) {
            return slot;
        }

        let slot = {
            let mut arena = self.counters.write();
            arena.push(Arc::new(CounterSeries {
                labels,
                value: AtomicF64::new(0.0),
            }));
            (arena.len() - 1) as u32
        };

        core.counter_families
            .entry(fullname.to_owned())
            .or_insert_with(|| FamilyEntry::new(help))
            .series
            .push(slot);
        core.counter_series.insert(key, slot);

        slot
    }

    fn insert_gauge(
        &self,
        core: &mut RegistryCore,
        fullname: &str,
        help: &str,
        labels: BTreeMap<String, String>,
    ) -> u32 {
        let key = series_key(fullname, &labels);
        if let Some(&slot) = core.gauge_series.get(&key) {
            return slot;
        }

        let slot = {
            let mut arena = self.gauges.write();
            arena.push(Arc::new(GaugeSeries {
                labels,
                value: AtomicF64::new(0.0),
            }));
            (arena.len() - 1) as u32
        };

        core.gauge_families
            .entry(fullname.to_owned())
            .or_insert_with(|| FamilyEntry::new(help))
            .series
            .push(slot);
        core.gauge_series.insert(key, slot);

        slot
    }

    fn insert_histogram(
        &self,
        core: &mut RegistryCore,
        fullname: &str,
        help: &str,
        labels: BTreeMap<String, String>,
        upper_bounds: Vec<f64>,
    ) -> u32 {
        let key = series_key(fullname, &labels);
        if let Some(&slot) = core.histogram_series.get(&key) {
            return slot;
        }

        let slot = {
            let mut arena = self.histograms.write();
            arena.push(Arc::new(HistogramSeries::new(labels, upper_bounds)));
            (arena.len() - 1) as u32
        };

        core.histogram_families
            .entry(fullname.to_owned())
            .or_insert_with(|| FamilyEntry::new(help))
            .series
            .push(slot);
        core.histogram_series.insert(key, slot);

        slot
    }

    fn counter_at(&self, raw: u64) -> Option<Arc<CounterSeries>> {
        let (generation, slot) = unpack_handle(raw)?;
        if generation != self.generation {
            return None;
        }

        self.counters.read().get(slot).cloned()
    }

    fn gauge_at(&self, raw: u64) -> Option<Arc<GaugeSeries>> {
        let (generation, slot) = unpack_handle(raw)?;
        if generation != self.generation {
            return None;
        }

        self.gauges.read().get(slot).cloned()
    }

    fn histogram_at(&self, raw: u64) -> Option<Arc<HistogramSeries>> {
        let (generation, slot) = unpack_handle(raw)?;
        if generation != self.generation {
            return None;
        }

        self.histograms.read().get(slot).cloned()
    }
}

impl crate::server::Collectable for MetricRegistry {
    fn collect(&self) -> Vec<proto::MetricFamily> {
        self.collect_families()
    }
}

fn label_pairs(labels: &BTreeMap<String, String>) -> Vec<proto::LabelPair> {
    labels
        .iter()
        .map(|(k, v)| {
            let mut pair = proto::LabelPair::default();
            pair.set_name(k.clone());
            pair.set_value(v.clone());
            pair
        })
        .collect()
}

fn histogram_proto(series: &HistogramSeries) -> proto::Histogram {
    let mut histogram = proto::Histogram::default();
    let mut cumulative = 0;
    let mut buckets = Vec::with_capacity(series.upper_bounds.len());

    for (i, upper_bound) in series.upper_bounds.iter().enumerate() {
        cumulative += series.bucket_counts[i].get();
        let mut bucket = proto::Bucket::default();
        bucket.set_upper_bound(*upper_bound);
        bucket.set_cumulative_count(cumulative);
        buckets.push(bucket);
    }

    histogram.set_bucket(buckets);
    histogram.set_sample_count(series.count.get());
    histogram.set_sample_sum(series.sum.get());
    histogram
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(prefix: &str, globals: &[(&str, &str)]) -> MetricRegistry {
        let globals = globals
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();

        MetricRegistry::new(prefix, globals)
    }

    fn family<'a>(families: &'a [proto::MetricFamily], name: &str) -> &'a proto::MetricFamily {
        families
            .iter()
            .find(|f| f.name() == name)
            .unwrap_or_else(|| panic!("family {name} not found"))
    }

    #[test]
    fn prefix_and_global_labels() {
        let registry = registry_with("app", &[("service", "example")]);

        let id = registry.create_counter("requests", "Requests", &[("result", "ok")]);
        assert!(id.is_valid());
        registry.counter_add(id, 3.0);
        registry.counter_add(id, 2.0);

        let families = registry.collect_families();
        let fam = family(&families, "app_requests");
        assert_eq!(fam.get_field_type(), proto::MetricType::COUNTER);
        assert_eq!(fam.get_metric().len(), 1);

        let metric = &fam.get_metric()[0];
        let labels: Vec<_> = metric
            .get_label()
            .iter()
            .map(|l| (l.name().to_owned(), l.value().to_owned()))
            .collect();
        assert_eq!(
            labels,
            vec![
                ("result".to_owned(), "ok".to_owned()),
                ("service".to_owned(), "example".to_owned())
            ]
        );
        assert_eq!(metric.get_counter().get_value(), 5.0);
    }

    #[test]
    fn global_labels_win_over_provided() {
        let registry = registry_with("", &[("service", "example")]);

        let plain = registry.create_counter("hits", "", &[]);
        let overridden = registry.create_counter("hits", "", &[("service", "other")]);

        // The provided duplicate is discarded, so both calls resolve the
        // same series.
        assert_eq!(plain, overridden);

        let families = registry.collect_families();
        assert_eq!(family(&families, "hits").get_metric().len(), 1);
    }

    #[test]
    fn counter_never_decreases() {
        let registry = registry_with("", &[]);
        let id = registry.create_counter("c", "", &[]);

        registry.counter_add(id, 4.0);
        registry.counter_add(id, -2.5);
        registry.counter_add(id, 0.0);

        let families = registry.collect_families();
        assert_eq!(family(&families, "c").get_metric()[0].get_counter().get_value(), 4.0);
    }

    #[test]
    fn gauge_moves_both_ways() {
        let registry = registry_with("", &[]);
        let id = registry.create_gauge("q", "", &[]);

        registry.gauge_set(id, 10.0);
        registry.gauge_add(id, -3.0);
        registry.gauge_add(id, 1.0);

        let families = registry.collect_families();
        assert_eq!(family(&families, "q").get_metric()[0].get_gauge().get_value(), 8.0);
    }

    #[test]
    fn histogram_default_buckets() {
        let registry = registry_with("", &[]);
        let id = registry.create_histogram("lat", "", &[], &[]);

        registry.histogram_observe(id, 0.002);
        registry.histogram_observe(id, 0.2);

        let families = registry.collect_families();
        let histogram = family(&families, "lat").get_metric()[0].get_histogram();

        assert_eq!(histogram.get_sample_count(), 2);
        assert!((histogram.get_sample_sum() - 0.202).abs() < 1e-9);

        let by_bound: Vec<_> = histogram
            .get_bucket()
            .iter()
            .map(|b| (b.upper_bound(), b.cumulative_count()))
            .collect();
        assert!(by_bound.contains(&(0.005, 1)));
        assert!(by_bound.contains(&(0.25, 2)));
        assert!(by_bound.contains(&(2.0, 2)));
    }

    #[test]
    fn declared_metric_validation() {
        let settings: Settings = toml::from_str(
            r#"
            [[metrics]]
            name = "m"
            type = "counter"
            dynamic_labels = { code = ["200", "500"] }
            "#,
        )
        .unwrap();

        let registry = registry_with("", &[]);
        registry.pre_register(&settings);

        assert!(!registry.create_counter("m", "", &[("code", "404")]).is_valid());
        assert!(!registry.create_counter("m", "", &[("other", "200")]).is_valid());

        let ok = registry.create_counter("m", "", &[("code", "200")]);
        assert!(ok.is_valid());
        assert_eq!(ok, registry.create_counter("m", "", &[("code", "200")]));

        // Declared metrics never grow series on the fly.
        let families = registry.collect_families();
        assert_eq!(family(&families, "m").get_metric().len(), 2);
    }

    #[test]
    fn declared_const_label_must_match() {
        let settings: Settings = toml::from_str(
            r#"
            [[metrics]]
            name = "m"
            type = "counter"
            const_labels = { kind = "ingress" }
            "#,
        )
        .unwrap();

        let registry = registry_with("", &[]);
        registry.pre_register(&settings);

        assert!(registry.create_counter("m", "", &[]).is_valid());
        assert!(registry.create_counter("m", "", &[("kind", "ingress")]).is_valid());
        assert!(!registry.create_counter("m", "", &[("kind", "egress")]).is_valid());
    }

    #[test]
    fn pre_registration_series_product() {
        let settings: Settings = toml::from_str(
            r#"
            [[metrics]]
            name = "requests"
            type = "counter"
            [metrics.dynamic_labels]
            method = ["get", "put"]
            code = ["200", "404", "500"]
            "#,
        )
        .unwrap();

        let registry = registry_with("svc", &[("service", "x")]);
        registry.pre_register(&settings);

        // The full product exists before any update.
        let families = registry.collect_families();
        let fam = family(&families, "svc_requests");
        assert_eq!(fam.get_metric().len(), 6);

        for metric in fam.get_metric() {
            assert_eq!(metric.get_counter().get_value(), 0.0);
            assert_eq!(metric.get_label().len(), 3);
        }
    }

    #[test]
    fn histogram_profile_from_settings() {
        let settings: Settings = toml::from_str(
            r#"
            [buckets]
            fast = [0.01, 0.1]

            [[metrics]]
            name = "lat"
            type = "histogram"
            buckets_profile = "fast"
            "#,
        )
        .unwrap();

        let registry = registry_with("", &[]);
        registry.pre_register(&settings);

        let id = registry.create_histogram("lat", "", &[], &[]);
        assert!(id.is_valid());
        registry.histogram_observe(id, 0.05);

        let families = registry.collect_families();
        let histogram = family(&families, "lat").get_metric()[0].get_histogram();
        let bounds: Vec<_> = histogram.get_bucket().iter().map(|b| b.upper_bound()).collect();
        assert_eq!(bounds, vec![0.01, 0.1]);
        assert_eq!(histogram.get_bucket()[1].cumulative_count(), 1);
    }

    #[test]
    fn declaration_without_kind_is_dropped() {
        let settings: Settings = toml::from_str(
            r#"
            [[metrics]]
            name = "mystery"
            "#,
        )
        .unwrap();

        let registry = registry_with("", &[]);
        registry.pre_register(&settings);

        // Nothing was declared: the name is creatable ad-hoc.
        assert!(registry.create_counter("mystery", "", &[]).is_valid());
    }

    #[test]
    fn close_makes_everything_inert() {
        let registry = registry_with("", &[]);
        let id = registry.create_counter("c", "", &[]);
        registry.counter_add(id, 1.0);

        registry.close();

        registry.counter_add(id, 1.0);
        assert!(!registry.create_counter("c", "", &[]).is_valid());
        assert!(registry.collect_families().is_empty());
    }

    #[test]
    fn handles_do_not_cross_registries() {
        let first = registry_with("", &[]);
        let second = registry_with("", &[]);

        let id = first.create_counter("c", "", &[]);
        let other = second.create_counter("c", "", &[]);

        // Same slot, different generation: the foreign handle is inert.
        second.counter_add(id, 5.0);

        let families = second.collect_families();
        assert_eq!(family(&families, "c").get_metric()[0].get_counter().get_value(), 0.0);
        second.counter_add(other, 5.0);
        let families = second.collect_families();
        assert_eq!(family(&families, "c").get_metric()[0].get_counter().get_value(), 5.0);
    }

    #[test]
    fn adhoc_help_first_wins() {
        let registry = registry_with("", &[]);
        registry.create_counter("c", "first help", &[("a", "1")]);
        registry.create_counter("c", "second help", &[("a", "2")]);

        let families = registry.collect_families();
        let fam = family(&families, "c");
        assert_eq!(fam.help(), "first help");
        assert_eq!(fam.get_metric().len(), 2);
    }
}
