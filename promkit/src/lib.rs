//! Embedded Prometheus-style metrics for host processes.
//!
//! promkit lets a host declare counters, gauges and histograms through a
//! narrow handle-based interface, update them on hot paths, and serve the
//! standard text exposition format from a built-in HTTP endpoint. Two
//! deployment modes cover one address space and cooperating processes of
//! the same logical component:
//!
//! * **single** — the process owns the scrape endpoint and exposes its
//!   own registry.
//! * **mux** — several processes share a namespace on one host. Exactly
//!   one wins the public port and aggregates; the others serve ephemeral
//!   loopback ports and advertise themselves through descriptor files.
//!   Every scrape of the aggregator merges the live workers' expositions
//!   into per-worker series (told apart by a `component` label) plus a
//!   summed view.
//!
//! # Usage
//!
//! ```no_run
//! use promkit::Config;
//!
//! let mut config = Config::default();
//! config.host = "127.0.0.1".into();
//! config.labels.insert("service".into(), "example".into());
//! assert!(promkit::init(config));
//!
//! let orders = promkit::create_counter("orders", "Orders received", &[("result", "ok")]);
//! promkit::counter_add(orders, 3.0);
//!
//! let latency = promkit::create_histogram("order_latency_seconds", "", &[], &[]);
//! {
//!     let _timer = promkit::ScopeTimer::new(latency);
//!     // ... process an order ...
//! }
//!
//! promkit::shutdown();
//! ```
//!
//! Metric declarations can also come from a TOML file (see
//! [`init_from_toml`] and [`settings`]); declared metrics are
//! pre-registered with their full dynamic-label series set and creation
//! calls only resolve them.
//!
//! # Failure behavior
//!
//! The API never panics across the public boundary and never terminates
//! the host. Initialization failures yield `false`, creation failures
//! yield invalid handles, and updates through invalid or stale handles
//! are silent no-ops. Handles issued before a [`shutdown`] stay inert
//! forever, including across a re-[`init`].

mod lifecycle;

pub mod mux;
pub mod registry;
pub mod server;
pub mod settings;
pub mod textfmt;

pub use settings::{Config, ExporterMode, Settings};

use std::path::Path;
use std::time::Instant;

/// Error type of fallible bootstrap internals.
pub type BootstrapError = anyhow::Error;

/// Result of fallible bootstrap internals.
pub type BootstrapResult<T> = anyhow::Result<T>;

macro_rules! handle_type {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        ///
        /// Handles are opaque 64-bit tokens. The zero value is reserved as
        /// the invalid handle: creation returns it on any failure and
        /// updates through it do nothing. A valid handle stays usable for
        /// the lifetime of the running session that issued it and becomes
        /// inert after [`shutdown`].
        #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
        pub struct $name(pub(crate) u64);

        impl $name {
            pub(crate) const INVALID: Self = Self(0);

            /// Whether this handle refers to a series.
            pub fn is_valid(self) -> bool {
                self.0 != 0
            }
        }
    };
}

handle_type! {
    /// Handle to a counter series.
    CounterId
}

handle_type! {
    /// Handle to a gauge series.
    GaugeId
}

handle_type! {
    /// Handle to a histogram series.
    HistogramId
}

/// Initializes the exporter from a programmatic [`Config`].
///
/// A running exporter is shut down first, so `init` doubles as re-init;
/// handles from the previous session become inert. With
/// `config.enabled == false` the call succeeds without binding anything
/// and every subsequent API call is inert.
///
/// Returns `false` when initialization fails (unparsable bind address,
/// port bind failure in single mode, descriptor write failure for a mux
/// worker); the exporter is stopped in that case.
pub fn init(config: Config) -> bool {
    lifecycle::init(config)
}

/// Initializes the exporter from a TOML config file and pre-registers the
/// metrics it declares.
pub fn init_from_toml(path: impl AsRef<Path>) -> bool {
    lifecycle::init_from_toml(path.as_ref())
}

/// Stops the exporter: clears the registry, removes the worker descriptor
/// if one was written, and drains the scrape endpoint. Safe to call at
/// any time, from any thread, repeatedly.
pub fn shutdown() {
    lifecycle::shutdown()
}

/// Whether the exporter is enabled and running.
pub fn is_running() -> bool {
    lifecycle::is_running()
}

/// Creates or resolves a counter series.
///
/// Global labels from the config are merged into `const_labels` and win
/// over duplicates provided here. For metrics declared in the config the
/// labels are validated against the declaration and only pre-registered
/// series resolve; undeclared metrics are created on demand.
pub fn create_counter(name: &str, help: &str, const_labels: &[(&str, &str)]) -> CounterId {
    match lifecycle::active() {
        Some(backend) => backend.registry().create_counter(name, help, const_labels),
        None => CounterId::INVALID,
    }
}

/// Adds `value` to a counter. Negative values are dropped; counters never
/// decrease.
pub fn counter_add(id: CounterId, value: f64) {
    if let Some(backend) = lifecycle::active() {
        backend.registry().counter_add(id, value);
    }
}

/// Increments a counter by one.
pub fn counter_inc(id: CounterId) {
    counter_add(id, 1.0);
}

/// Creates or resolves a gauge series; see [`create_counter`] for the
/// label rules.
pub fn create_gauge(name: &str, help: &str, const_labels: &[(&str, &str)]) -> GaugeId {
    match lifecycle::active() {
        Some(backend) => backend.registry().create_gauge(name, help, const_labels),
        None => GaugeId::INVALID,
    }
}

/// Replaces a gauge value.
pub fn gauge_set(id: GaugeId, value: f64) {
    if let Some(backend) = lifecycle::active() {
        backend.registry().gauge_set(id, value);
    }
}

/// Moves a gauge by `delta`; negative deltas decrement.
pub fn gauge_add(id: GaugeId, delta: f64) {
    if let Some(backend) = lifecycle::active() {
        backend.registry().gauge_add(id, delta);
    }
}

/// Creates or resolves a histogram series; see [`create_counter`] for the
/// label rules. An empty `buckets` slice selects the default latency
/// buckets; for metrics declared in the config the configured bucket
/// profile applies instead.
pub fn create_histogram(
    name: &str,
    help: &str,
    buckets: &[f64],
    const_labels: &[(&str, &str)],
) -> HistogramId {
    match lifecycle::active() {
        Some(backend) => backend
            .registry()
            .create_histogram(name, help, buckets, const_labels),
        None => HistogramId::INVALID,
    }
}

/// Records one observation into a histogram.
pub fn histogram_observe(id: HistogramId, value: f64) {
    if let Some(backend) = lifecycle::active() {
        backend.registry().histogram_observe(id, value);
    }
}

/// Records the elapsed wall time, in seconds, into a histogram when
/// dropped.
///
/// A timer created from an invalid handle observes nothing, as does one
/// whose session was shut down in the meantime.
///
/// ```no_run
/// # let latency = promkit::create_histogram("req_seconds", "", &[], &[]);
/// fn handle_request(latency: promkit::HistogramId) {
///     let _timer = promkit::ScopeTimer::new(latency);
///     // ... the duration of this scope is observed on return ...
/// }
/// ```
#[derive(Debug)]
pub struct ScopeTimer {
    id: HistogramId,
    start: Instant,
}

impl ScopeTimer {
    /// Starts timing against the given histogram.
    pub fn new(id: HistogramId) -> Self {
        Self {
            id,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopeTimer {
    fn drop(&mut self) {
        if self.id.is_valid() {
            histogram_observe(self.id, self.start.elapsed().as_secs_f64());
        }
    }
}
