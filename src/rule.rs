//! Alerting rules and the evaluation state machine.
//!
//! Rules are threshold conditions over the store. Each matching series gets
//! its own pending/firing state: a condition must hold continuously for the
//! rule's hold duration before the alert fires, and a firing alert emits a
//! resolved event once the condition stops holding.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::labels::Labels;
use crate::store::{MetricStore, Point, Selector};

/// How long an instant query looks back for the newest sample before a
/// series counts as stale.
pub fn staleness_lookback() -> Duration {
    Duration::minutes(5)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Threshold condition evaluated against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// newest sample strictly above the threshold
    Above(f64),
    /// newest sample strictly below the threshold
    Below(f64),
    /// per-second rate over the window strictly above the threshold
    RateAbove { threshold: f64, window: Duration },
    /// per-second rate over the window strictly below the threshold
    RateBelow { threshold: f64, window: Duration },
    /// no matching series has a fresh sample
    Absent,
}

/// Per-second rate of increase over a window, tolerating counter resets:
/// a decrease is treated as a reset, so the new raw value counts as the
/// increment. Needs at least two points spanning a nonzero duration.
fn windowed_rate(points: &[Point]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let elapsed = points[points.len() - 1].timestamp - points[0].timestamp;
    let secs = elapsed.num_milliseconds() as f64 / 1000.0;
    if secs <= 0.0 {
        return None;
    }
    let mut increase = 0.0;
    for pair in points.windows(2) {
        let delta = pair[1].value - pair[0].value;
        increase += if delta >= 0.0 { delta } else { pair[1].value };
    }
    Some(increase / secs)
}

/// One alerting rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub selector: Selector,
    pub condition: Condition,
    /// how long the condition must hold before the alert fires
    pub hold: Duration,
    pub severity: Severity,
    /// static labels merged into every alert from this rule
    pub labels: Labels,
    pub annotations: BTreeMap<String, String>,
}

impl Rule {
    /// Series (by merged labels) for which the condition currently holds,
    /// with the observed value.
    fn breaches(&self, store: &MetricStore, now: DateTime<Utc>) -> Vec<(Labels, f64)> {
        match &self.condition {
            Condition::Above(threshold) => self
                .instant(store, now)
                .into_iter()
                .filter(|(_, v)| v > threshold)
                .collect(),
            Condition::Below(threshold) => self
                .instant(store, now)
                .into_iter()
                .filter(|(_, v)| v < threshold)
                .collect(),
            Condition::RateAbove { threshold, window } => self
                .rates(store, now, *window)
                .into_iter()
                .filter(|(_, v)| v > threshold)
                .collect(),
            Condition::RateBelow { threshold, window } => self
                .rates(store, now, *window)
                .into_iter()
                .filter(|(_, v)| v < threshold)
                .collect(),
            Condition::Absent => {
                if store
                    .latest(&self.selector, now, staleness_lookback())
                    .is_empty()
                {
                    vec![(self.selector.matchers.clone(), 1.0)]
                } else {
                    vec![]
                }
            }
        }
    }

    fn instant(&self, store: &MetricStore, now: DateTime<Utc>) -> Vec<(Labels, f64)> {
        store
            .latest(&self.selector, now, staleness_lookback())
            .into_iter()
            .map(|(id, point)| (id.labels, point.value))
            .collect()
    }

    fn rates(&self, store: &MetricStore, now: DateTime<Utc>, window: Duration) -> Vec<(Labels, f64)> {
        store
            .range(&self.selector, now - window, now)
            .into_iter()
            .filter_map(|(id, points)| Some((id.labels, windowed_rate(&points)?)))
            .collect()
    }

    fn alert_labels(&self, series_labels: &Labels) -> Labels {
        let mut labels = series_labels.clone();
        labels.merge_over(&self.labels);
        labels.insert("alertname", self.name.clone());
        labels
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

/// An alert transition emitted by the evaluator. Firing alerts re-emit every
/// evaluation cycle; the router owns repeat suppression.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub rule: String,
    pub severity: Severity,
    pub status: AlertStatus,
    /// series labels + rule labels + alertname
    pub labels: Labels,
    pub annotations: BTreeMap<String, String>,
    pub value: f64,
    pub started_at: DateTime<Utc>,
}

impl AlertEvent {
    pub fn fingerprint(&self) -> u64 {
        self.labels.fingerprint()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ActiveState {
    Pending,
    Firing,
}

#[derive(Debug, Clone)]
struct Active {
    state: ActiveState,
    since: DateTime<Utc>,
    // kept so a resolved event can still report the alert's labels after the
    // series stops matching
    labels: Labels,
}

/// Evaluates all rules against the store on a fixed cadence.
pub struct RuleEvaluator {
    rules: Vec<Rule>,
    store: MetricStore,
    // (rule index, series fingerprint) -> pending/firing bookkeeping
    active: HashMap<(usize, u64), Active>,
    tx: mpsc::Sender<AlertEvent>,
}

impl RuleEvaluator {
    pub fn new(rules: Vec<Rule>, store: MetricStore, tx: mpsc::Sender<AlertEvent>) -> Self {
        Self {
            rules,
            store,
            active: HashMap::new(),
            tx,
        }
    }

    /// One evaluation pass. Returns the events to dispatch so the loop (and
    /// tests) control delivery.
    pub fn evaluate_all(&mut self, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let mut events = Vec::new();
        for (rule_idx, rule) in self.rules.iter().enumerate() {
            let breaches = rule.breaches(&self.store, now);
            let mut held: HashMap<u64, (Labels, f64)> = HashMap::new();
            for (series_labels, value) in breaches {
                let labels = rule.alert_labels(&series_labels);
                held.insert(labels.fingerprint(), (labels, value));
            }

            for (&fp, (labels, value)) in &held {
                let entry = self
                    .active
                    .entry((rule_idx, fp))
                    .or_insert_with(|| Active {
                        state: ActiveState::Pending,
                        since: now,
                        labels: labels.clone(),
                    });
                let held_for = now - entry.since;
                if entry.state == ActiveState::Pending && held_for >= rule.hold {
                    entry.state = ActiveState::Firing;
                    info!(rule = %rule.name, labels = %labels, "alert firing");
                }
                if entry.state == ActiveState::Firing {
                    events.push(AlertEvent {
                        rule: rule.name.clone(),
                        severity: rule.severity,
                        status: AlertStatus::Firing,
                        labels: labels.clone(),
                        annotations: rule.annotations.clone(),
                        value: *value,
                        started_at: entry.since,
                    });
                } else {
                    debug!(rule = %rule.name, labels = %labels, "alert pending");
                }
            }

            // recovered series: pending entries vanish, firing ones resolve
            let resolved: Vec<(u64, Active)> = self
                .active
                .iter()
                .filter(|((idx, fp), _)| *idx == rule_idx && !held.contains_key(fp))
                .map(|((_, fp), active)| (*fp, active.clone()))
                .collect();
            for (fp, active) in resolved {
                self.active.remove(&(rule_idx, fp));
                if active.state == ActiveState::Firing {
                    info!(rule = %rule.name, labels = %active.labels, "alert resolved");
                    events.push(AlertEvent {
                        rule: rule.name.clone(),
                        severity: rule.severity,
                        status: AlertStatus::Resolved,
                        labels: active.labels,
                        annotations: rule.annotations.clone(),
                        value: f64::NAN,
                        started_at: active.since,
                    });
                }
            }
        }
        events
    }

    /// Run the evaluation loop until aborted, dispatching events to the
    /// router channel.
    pub fn spawn(mut self, interval: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let events = self.evaluate_all(Utc::now());
                for event in events {
                    if self.tx.send(event).await.is_err() {
                        warn!("alert router channel closed; stopping evaluator");
                        return;
                    }
                }
            }
        })
    }
}
