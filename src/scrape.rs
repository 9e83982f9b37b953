//! Scrape Prometheus-compatible endpoints on a schedule.

use chrono::{DateTime, Utc};
use color_eyre::eyre::{eyre, Context, Report};
use prometheus_parse::{Sample, Value};
use reqwest::{IntoUrl, Url};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::labels::{Labels, SeriesId};
use crate::store::MetricStore;

/// Scrapes a single Prometheus-exporting endpoint on its own interval and
/// appends everything it sees to the shared store.
pub struct ScrapeTarget {
    /// the prometheus-exporting endpoint to query
    url: Url,
    client: reqwest::Client,
    interval: std::time::Duration,
    /// static labels merged into every scraped series (scraped labels win)
    labels: Labels,
    store: MetricStore,
}

impl ScrapeTarget {
    pub fn new(
        url: impl IntoUrl,
        interval: std::time::Duration,
        labels: Labels,
        store: MetricStore,
    ) -> Result<Self, Report> {
        let url = url.into_url()?;
        let mut labels = labels;
        labels
            .merge_defaults(&[("instance", url.as_str())].into_iter().collect());
        Ok(Self {
            url,
            client: reqwest::Client::builder().build()?,
            interval,
            labels,
            store,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Fetch and ingest once. Returns the number of points appended. A
    /// failure is recorded as `up` = 0 and returned as the error.
    pub async fn scrape_once(&self) -> Result<usize, Report> {
        let now = Utc::now();
        match self.fetch(now).await {
            Ok(scrape) => {
                let appended = self.ingest(scrape);
                self.record_up(now, true);
                debug!(endpoint = %self.url, appended, "scrape ok");
                Ok(appended)
            }
            Err(report) => {
                self.record_up(now, false);
                Err(report)
            }
        }
    }

    /// Samples without an exposition timestamp are stamped with `now`, the
    /// scrape time; an explicit exposition timestamp is kept as-is.
    async fn fetch(&self, now: DateTime<Utc>) -> Result<prometheus_parse::Scrape, Report> {
        let resp = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .wrap_err("network request to metrics endpoint")?;
        let status = resp.status();
        if !status.is_success() {
            return Err(eyre!("metrics endpoint returned {}", status));
        }
        let body = resp
            .text()
            .await
            .wrap_err("reading response from metrics endpoint")?;
        let lines = body.lines().map(|s| Ok(s.to_owned()));

        Ok(prometheus_parse::Scrape::parse_at(lines, now)?)
    }

    fn ingest(&self, scrape: prometheus_parse::Scrape) -> usize {
        let mut appended = 0;
        for sample in scrape.samples {
            for (id, timestamp, value) in flatten_sample(&sample, &self.labels) {
                if self.store.append(id, timestamp, value) {
                    appended += 1;
                }
            }
        }
        appended
    }

    fn record_up(&self, now: DateTime<Utc>, ok: bool) {
        let id = SeriesId::new("up", self.labels.clone());
        self.store.append(id, now, if ok { 1.0 } else { 0.0 });
    }

    /// Run the scrape loop until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(report) = self.scrape_once().await {
                    warn!(endpoint = %self.url, error = %report, "scrape failed");
                }
            }
        })
    }
}

/// Expand one parsed sample into storable points. Counters, gauges, and
/// untyped values map 1:1; histograms expand per bucket (`le` label on a
/// `_bucket` series); summaries expand per `quantile` label. The parser
/// already surfaces `_sum`/`_count` as plain samples.
fn flatten_sample(
    sample: &Sample,
    target_labels: &Labels,
) -> Vec<(SeriesId, DateTime<Utc>, f64)> {
    let mut labels: Labels = sample
        .labels
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    labels.merge_defaults(target_labels);

    // the parser stamps timestamp-less samples with the scrape time we pass
    // to parse_at, so every sample already carries the right timestamp
    let timestamp = sample.timestamp;

    match &sample.value {
        Value::Counter(v) | Value::Gauge(v) | Value::Untyped(v) => {
            vec![(SeriesId::new(sample.metric.clone(), labels), timestamp, *v)]
        }
        Value::Histogram(buckets) => buckets
            .iter()
            .map(|bucket| {
                let mut bucket_labels = labels.clone();
                bucket_labels.insert("le", format_bound(bucket.less_than));
                (
                    SeriesId::new(format!("{}_bucket", sample.metric), bucket_labels),
                    timestamp,
                    bucket.count,
                )
            })
            .collect(),
        Value::Summary(quantiles) => quantiles
            .iter()
            .map(|q| {
                let mut q_labels = labels.clone();
                q_labels.insert("quantile", format_bound(q.quantile));
                (
                    SeriesId::new(sample.metric.clone(), q_labels),
                    timestamp,
                    q.count,
                )
            })
            .collect(),
    }
}

fn format_bound(bound: f64) -> String {
    if bound == f64::INFINITY {
        "+Inf".to_owned()
    } else {
        format!("{}", bound)
    }
}
