//! Exporter configuration.
//!
//! The runtime [`Config`] drives [`init`](crate::init) programmatically.
//! [`Settings`] is the file-based model consumed by
//! [`init_from_toml`](crate::init_from_toml); on top of the exporter
//! section it carries global labels, named bucket profiles and metric
//! declarations used for pre-registration.

use crate::BootstrapResult;
use anyhow::Context as _;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Exporter deployment mode.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ExporterMode {
    /// One process owns the scrape endpoint and exposes its own registry.
    #[default]
    Single,
    /// Several processes of the same logical component share one host: the
    /// process that wins the public port aggregates, the rest serve their
    /// metrics on ephemeral loopback ports and advertise them through
    /// descriptor files.
    Mux,
}

/// Runtime configuration for [`init`](crate::init).
#[derive(Clone, Debug)]
pub struct Config {
    /// When `false`, every public API call is inert.
    pub enabled: bool,

    /// Deployment mode.
    pub mode: ExporterMode,

    /// Bind host for the scrape endpoint.
    pub host: String,

    /// Bind port for the scrape endpoint.
    pub port: u16,

    /// URL path serving the text exposition.
    pub path: String,

    /// Metric name prefix: metrics are exposed as `<prefix>_<name>`.
    pub prefix: String,

    /// Labels injected into every series.
    ///
    /// Global labels are authoritative: a label provided at metric creation
    /// time with the same key does not overwrite the global value.
    pub labels: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ExporterMode::Single,
            host: "0.0.0.0".into(),
            port: 9464,
            path: "/metrics".into(),
            prefix: String::new(),
            labels: BTreeMap::new(),
        }
    }
}

impl Config {
    pub(crate) fn metrics_path(&self) -> &str {
        if self.path.is_empty() { "/metrics" } else { &self.path }
    }
}

/// Kind of a declared metric.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonically increasing value.
    Counter,
    /// Value that can go up and down.
    Gauge,
    /// Bucketed distribution of observations.
    Histogram,
}

/// How a declared metric is published in the aggregated view.
///
/// Reserved: the setting is parsed and carried, but only the [`Both`]
/// behavior is currently wired.
///
/// [`Both`]: PublishMode::Both
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// Only the summed series.
    SumOnly,
    /// Only the per-process series.
    PerProc,
    /// Per-process series plus the summed series.
    #[default]
    Both,
}

/// How gauges of a declared metric combine in the aggregated view.
///
/// Reserved: the setting is parsed and carried; gauges are currently always
/// published per-process only.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GaugeAggregation {
    /// Sum across processes.
    #[default]
    Sum,
    /// Last reported value wins.
    Last,
    /// Maximum across processes.
    Max,
}

/// The `[exporter]` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ExporterSettings {
    /// When `false`, every public API call is inert.
    pub enabled: bool,

    /// Deployment mode.
    pub mode: ExporterMode,

    /// Bind host for the scrape endpoint.
    pub host: String,

    /// Bind port for the scrape endpoint.
    pub port: u16,

    /// URL path serving the text exposition.
    pub path: String,

    /// Metric name prefix.
    pub namespace: String,
}

impl Default for ExporterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ExporterMode::Single,
            host: "0.0.0.0".into(),
            port: 9464,
            path: "/metrics".into(),
            namespace: String::new(),
        }
    }
}

/// One `[[metrics]]` declaration.
///
/// Declared metrics are pre-registered on initialization: the full set of
/// series over the dynamic label combinations exists before the first
/// update, and creation calls for the metric only resolve those series.
/// A declaration without a `name` or a `type` is dropped silently.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MetricSettings {
    /// Metric name, without the namespace prefix.
    pub name: String,

    /// Metric kind; the TOML key is `type`.
    #[serde(rename = "type")]
    pub kind: Option<MetricKind>,

    /// Human-readable help text.
    pub help: String,

    /// Unit annotation; recorded but not interpreted.
    pub unit: String,

    /// Labels always present on every series of this metric.
    pub const_labels: BTreeMap<String, String>,

    /// Allowed dynamic labels: key to the finite list of permitted values.
    pub dynamic_labels: BTreeMap<String, Vec<String>>,

    /// Name of a `[buckets]` profile; histograms fall back to the default
    /// latency buckets when empty or unknown.
    pub buckets_profile: String,

    /// Reserved publication mode.
    pub publish: Option<PublishMode>,

    /// Reserved gauge aggregation mode.
    pub gauge_agg: Option<GaugeAggregation>,
}

/// Root of the TOML configuration file.
///
/// Unknown keys are ignored so config files can be shared with other
/// consumers.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// The `[exporter]` section.
    pub exporter: ExporterSettings,

    /// Global labels injected into every series.
    pub labels: BTreeMap<String, String>,

    /// Named histogram bucket profiles.
    pub buckets: BTreeMap<String, Vec<f64>>,

    /// Declared metrics.
    pub metrics: Vec<MetricSettings>,
}

impl Settings {
    /// Reads and parses a TOML configuration file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> BootstrapResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Projects the exporter section into the runtime [`Config`].
    pub fn config(&self) -> Config {
        Config {
            enabled: self.exporter.enabled,
            mode: self.exporter.mode,
            host: self.exporter.host.clone(),
            port: self.exporter.port,
            path: self.exporter.path.clone(),
            prefix: self.exporter.namespace.clone(),
            labels: self.labels.clone(),
        }
    }
}
