//! Parser for the Prometheus text exposition format.
//!
//! Reads scrape bodies back into metric-family structures so the
//! aggregator can merge them. Comment lines (including `# HELP` and
//! `# TYPE`) are discarded; histograms are reconstructed from the
//! `_bucket`/`_sum`/`_count` sample suffixes and everything else is
//! reported as untyped. Malformed lines are skipped without partial
//! commits.

use prometheus::proto;

#[derive(Default)]
struct SeriesBuilder {
    labels: Vec<(String, String)>,
    untyped: f64,
    buckets: Vec<(f64, u64)>,
    sum: f64,
    count: u64,
}

struct FamilyBuilder {
    name: String,
    histogram: bool,
    series: Vec<SeriesBuilder>,
}

impl FamilyBuilder {
    fn series_mut(&mut self, labels: &[(String, String)]) -> &mut SeriesBuilder {
        if let Some(idx) = self.series.iter().position(|s| s.labels == labels) {
            return &mut self.series[idx];
        }

        self.series.push(SeriesBuilder {
            labels: labels.to_vec(),
            ..Default::default()
        });
        self.series.last_mut().unwrap()
    }
}

/// Parses a text exposition body into metric families.
pub fn parse_text_exposition(text: &str) -> Vec<proto::MetricFamily> {
    let mut families: Vec<FamilyBuilder> = Vec::new();

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((name, mut labels, value)) = parse_sample(line) else {
            continue;
        };

        if let Some(base) = name.strip_suffix("_bucket").filter(|b| !b.is_empty()) {
            let upper_bound = match labels.iter().position(|(k, _)| k == "le") {
                Some(idx) => {
                    let (_, le) = labels.remove(idx);
                    le.parse::<f64>().unwrap_or(f64::INFINITY)
                }
                None => 0.0,
            };

            let family = family_mut(&mut families, base, true);
            family
                .series_mut(&labels)
                .buckets
                .push((upper_bound, value as u64));
        } else if let Some(base) = name.strip_suffix("_sum").filter(|b| !b.is_empty()) {
            let family = family_mut(&mut families, base, true);
            family.series_mut(&labels).sum = value;
        } else if let Some(base) = name.strip_suffix("_count").filter(|b| !b.is_empty()) {
            let family = family_mut(&mut families, base, true);
            family.series_mut(&labels).count = value as u64;
        } else {
            let family = family_mut(&mut families, &name, false);
            family.series.push(SeriesBuilder {
                labels,
                untyped: value,
                ..Default::default()
            });
        }
    }

    families.into_iter().map(into_proto).collect()
}

/// Finds the family named `name`, creating it with the given shape on
/// first sight. The shape is fixed at creation: a plain sample and a
/// histogram suffix sharing one name keep the first shape seen.
fn family_mut<'a>(
    families: &'a mut Vec<FamilyBuilder>,
    name: &str,
    histogram: bool,
) -> &'a mut FamilyBuilder {
    if let Some(idx) = families.iter().position(|f| f.name == name) {
        return &mut families[idx];
    }

    families.push(FamilyBuilder {
        name: name.to_owned(),
        histogram,
        series: Vec::new(),
    });
    families.last_mut().unwrap()
}

/// Splits a sample line into `(name, labels, value)`; the optional
/// trailing timestamp is ignored.
fn parse_sample(line: &str) -> Option<(String, Vec<(String, String)>, f64)> {
    let name_end = line
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == ':'))
        .unwrap_or(line.len());
    if name_end == 0 {
        return None;
    }

    let name = &line[..name_end];
    let mut rest = &line[name_end..];

    let mut labels = Vec::new();
    if rest.starts_with('{') {
        let close = rest.find('}')?;
        labels = parse_labels(&rest[..=close])?;
        rest = &rest[close + 1..];
    }

    let rest = rest.trim_start_matches([' ', '\t']);
    let value_str = rest.split([' ', '\t']).next()?;
    let value = value_str.parse::<f64>().ok()?;

    Some((name.to_owned(), labels, value))
}

/// Parses a `{k="v",k2="v2"}` segment. Values are taken verbatim between
/// the quotes; escape sequences are not processed.
fn parse_labels(segment: &str) -> Option<Vec<(String, String)>> {
    let inner = segment.strip_prefix('{')?.strip_suffix('}')?;
    let mut out = Vec::new();

    for token in inner.split(',') {
        if token.is_empty() {
            continue;
        }

        let Some(eq) = token.find('=') else { break };
        let key = token[..eq].trim();
        let mut value = &token[eq + 1..];
        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value = &value[1..value.len() - 1];
        }

        out.push((key.to_owned(), value.to_owned()));
    }

    Some(out)
}

fn into_proto(builder: FamilyBuilder) -> proto::MetricFamily {
    let mut mf = proto::MetricFamily::default();
    mf.set_name(builder.name);

    if builder.histogram {
        mf.set_field_type(proto::MetricType::HISTOGRAM);

        for series in builder.series {
            let mut metric = proto::Metric::default();
            metric.set_label(label_pairs(series.labels));

            let mut histogram = proto::Histogram::default();
            let mut buckets = series.buckets;
            buckets.sort_by(|a, b| a.0.total_cmp(&b.0));
            histogram.set_bucket(
                buckets
                    .into_iter()
                    .map(|(upper_bound, count)| {
                        let mut bucket = proto::Bucket::default();
                        bucket.set_upper_bound(upper_bound);
                        bucket.set_cumulative_count(count);
                        bucket
                    })
                    .collect(),
            );
            histogram.set_sample_sum(series.sum);
            histogram.set_sample_count(series.count);
            metric.set_histogram(histogram);
            mf.mut_metric().push(metric);
        }
    } else {
        mf.set_field_type(proto::MetricType::UNTYPED);

        for series in builder.series {
            let mut metric = proto::Metric::default();
            metric.set_label(label_pairs(series.labels));
            let mut untyped = proto::Untyped::default();
            untyped.set_value(series.untyped);
            metric.set_untyped(untyped);
            mf.mut_metric().push(metric);
        }
    }

    mf
}

fn label_pairs(labels: Vec<(String, String)>) -> Vec<proto::LabelPair> {
    labels
        .into_iter()
        .map(|(name, value)| {
            let mut pair = proto::LabelPair::default();
            pair.set_name(name);
            pair.set_value(value);
            pair
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels_of(metric: &proto::Metric) -> Vec<(String, String)> {
        metric
            .get_label()
            .iter()
            .map(|l| (l.name().to_owned(), l.value().to_owned()))
            .collect()
    }

    #[test]
    fn plain_samples() {
        let families = parse_text_exposition(
            "# HELP requests Requests.\n\
             # TYPE requests counter\n\
             requests{service=\"a\",code=\"200\"} 5\n\
             requests{service=\"b\",code=\"200\"} 2 1700000000\n\
             queue_depth 3\n",
        );

        assert_eq!(families.len(), 2);

        let requests = &families[0];
        assert_eq!(requests.name(), "requests");
        assert_eq!(requests.get_field_type(), proto::MetricType::UNTYPED);
        assert_eq!(requests.get_metric().len(), 2);
        assert_eq!(requests.get_metric()[0].get_untyped().get_value(), 5.0);
        assert_eq!(
            labels_of(&requests.get_metric()[0]),
            vec![
                ("service".to_owned(), "a".to_owned()),
                ("code".to_owned(), "200".to_owned())
            ]
        );
        assert_eq!(requests.get_metric()[1].get_untyped().get_value(), 2.0);

        assert_eq!(families[1].name(), "queue_depth");
        assert!(families[1].get_metric()[0].get_label().is_empty());
    }

    #[test]
    fn histogram_reconstruction() {
        let families = parse_text_exposition(
            "lat_bucket{r=\"ok\",le=\"0.005\"} 1\n\
             lat_bucket{r=\"ok\",le=\"0.25\"} 2\n\
             lat_bucket{r=\"ok\",le=\"+Inf\"} 2\n\
             lat_sum{r=\"ok\"} 0.202\n\
             lat_count{r=\"ok\"} 2\n",
        );

        assert_eq!(families.len(), 1);
        let family = &families[0];
        assert_eq!(family.name(), "lat");
        assert_eq!(family.get_field_type(), proto::MetricType::HISTOGRAM);
        assert_eq!(family.get_metric().len(), 1);

        let metric = &family.get_metric()[0];
        assert_eq!(labels_of(metric), vec![("r".to_owned(), "ok".to_owned())]);

        let histogram = metric.get_histogram();
        assert_eq!(histogram.get_sample_count(), 2);
        assert_eq!(histogram.get_sample_sum(), 0.202);

        let buckets: Vec<_> = histogram
            .get_bucket()
            .iter()
            .map(|b| (b.upper_bound(), b.cumulative_count()))
            .collect();
        assert_eq!(buckets, vec![(0.005, 1), (0.25, 2), (f64::INFINITY, 2)]);
    }

    #[test]
    fn histogram_series_split_by_labels() {
        let families = parse_text_exposition(
            "lat_bucket{r=\"ok\",le=\"1\"} 1\n\
             lat_bucket{r=\"err\",le=\"1\"} 4\n\
             lat_count{r=\"ok\"} 1\n\
             lat_count{r=\"err\"} 4\n",
        );

        assert_eq!(families[0].get_metric().len(), 2);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let families = parse_text_exposition(
            "good 1\n\
             {no_name} 2\n\
             no_value\n\
             bad_value x\n\
             unclosed{a=\"b\" 3\n\
             good 4\n",
        );

        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_metric().len(), 2);
    }

    #[test]
    fn round_trips_own_exposition() {
        use crate::registry::MetricRegistry;
        use prometheus::{Encoder as _, TextEncoder};

        let registry = MetricRegistry::new("", Default::default());
        let hits = registry.create_counter("hits", "Hits", &[("k", "v")]);
        registry.counter_add(hits, 5.0);
        let lat = registry.create_histogram("lat", "", &[0.1, 1.0], &[]);
        registry.histogram_observe(lat, 0.05);

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.collect_families(), &mut buffer)
            .unwrap();
        let families = parse_text_exposition(std::str::from_utf8(&buffer).unwrap());

        let hits = families.iter().find(|f| f.name() == "hits").unwrap();
        assert_eq!(hits.get_field_type(), proto::MetricType::UNTYPED);
        assert_eq!(hits.get_metric()[0].get_untyped().get_value(), 5.0);
        assert_eq!(labels_of(&hits.get_metric()[0]), vec![("k".to_owned(), "v".to_owned())]);

        let lat = families.iter().find(|f| f.name() == "lat").unwrap();
        assert_eq!(lat.get_field_type(), proto::MetricType::HISTOGRAM);
        let histogram = lat.get_metric()[0].get_histogram();
        assert_eq!(histogram.get_sample_count(), 1);
        assert!((histogram.get_sample_sum() - 0.05).abs() < 1e-9);

        let buckets: Vec<_> = histogram
            .get_bucket()
            .iter()
            .map(|b| (b.upper_bound(), b.cumulative_count()))
            .collect();
        assert_eq!(buckets, vec![(0.1, 1), (1.0, 1), (f64::INFINITY, 1)]);
    }

    #[test]
    fn special_values() {
        let families = parse_text_exposition("up +Inf\ndown -Inf\nnothing NaN\n");

        assert_eq!(families[0].get_metric()[0].get_untyped().get_value(), f64::INFINITY);
        assert_eq!(
            families[1].get_metric()[0].get_untyped().get_value(),
            f64::NEG_INFINITY
        );
        assert!(families[2].get_metric()[0].get_untyped().get_value().is_nan());
    }
}
