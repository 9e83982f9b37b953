//! Group, deduplicate, and dispatch alerts to receivers.
//!
//! Alerts group by the configured label names. A group waits `group_wait`
//! before its first notification, re-notifies after `group_interval` when its
//! membership changed, and repeats an unchanged group only after
//! `repeat_interval`. Timing runs on `DateTime<Utc>` arguments so tests drive
//! the clock directly.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::labels::Labels;
use crate::notify::{Notification, NotificationAlert, Receiver};
use crate::rule::{AlertEvent, AlertStatus};

/// Routing policy.
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    pub group_by: Vec<String>,
    pub group_wait: Duration,
    pub group_interval: Duration,
    pub repeat_interval: Duration,
}

struct Group {
    // fingerprint -> latest event for that alert
    alerts: HashMap<u64, AlertEvent>,
    /// when the group first became non-empty
    created: DateTime<Utc>,
    /// membership or status changed since the last flush
    changed: bool,
    last_flush: Option<DateTime<Utc>>,
}

impl Group {
    fn new(created: DateTime<Utc>) -> Self {
        Self {
            alerts: HashMap::new(),
            created,
            changed: false,
            last_flush: None,
        }
    }

    fn due(&self, policy: &RoutePolicy, now: DateTime<Utc>) -> bool {
        match self.last_flush {
            None => now - self.created >= policy.group_wait,
            Some(last) if self.changed => now - last >= policy.group_interval,
            Some(last) => now - last >= policy.repeat_interval,
        }
    }
}

/// Fan-in point for evaluator events.
pub struct AlertRouter {
    policy: RoutePolicy,
    receivers: Vec<Receiver>,
    groups: HashMap<Labels, Group>,
}

impl AlertRouter {
    pub fn new(policy: RoutePolicy, receivers: Vec<Receiver>) -> Self {
        Self {
            policy,
            receivers,
            groups: HashMap::new(),
        }
    }

    /// Track one event. Dedup: an event matching the tracked fingerprint and
    /// status only refreshes the stored copy without marking the group
    /// changed.
    pub fn ingest(&mut self, event: AlertEvent, now: DateTime<Utc>) {
        let key = event.labels.project(&self.policy.group_by);
        let fp = event.fingerprint();
        let group = self
            .groups
            .entry(key)
            .or_insert_with(|| Group::new(now));
        let changed = match group.alerts.get(&fp) {
            Some(existing) => existing.status != event.status,
            None => true,
        };
        group.alerts.insert(fp, event);
        if changed {
            group.changed = true;
        }
    }

    /// Notifications for every group whose timer elapsed. Flushed groups
    /// evict their resolved alerts; groups left empty are dropped.
    pub fn flush_due(&mut self, now: DateTime<Utc>) -> Vec<Notification> {
        let mut notifications = Vec::new();
        for (key, group) in self.groups.iter_mut() {
            if group.alerts.is_empty() || !group.due(&self.policy, now) {
                continue;
            }
            let mut alerts: Vec<NotificationAlert> =
                group.alerts.values().map(NotificationAlert::from).collect();
            alerts.sort_by(|a, b| a.labels.cmp(&b.labels));
            notifications.push(Notification::new(key.clone(), alerts));

            group
                .alerts
                .retain(|_, event| event.status == AlertStatus::Firing);
            group.changed = false;
            group.last_flush = Some(now);
        }
        self.groups.retain(|_, group| !group.alerts.is_empty());
        if !notifications.is_empty() {
            debug!(count = notifications.len(), "flushing alert groups");
        }
        notifications
    }

    async fn dispatch(&mut self, notifications: Vec<Notification>, now: DateTime<Utc>) {
        for notification in &notifications {
            for receiver in &mut self.receivers {
                receiver.notify(notification, now).await;
            }
        }
    }

    /// Run the routing loop: ingest events as they arrive and flush due
    /// groups once a second. Stops when the event channel closes.
    pub fn spawn(mut self, mut rx: mpsc::Receiver<AlertEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        match event {
                            Some(event) => self.ingest(event, Utc::now()),
                            None => {
                                debug!("event channel closed; router stopping");
                                return;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        let notifications = self.flush_due(now);
                        self.dispatch(notifications, now).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::Severity;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn policy() -> RoutePolicy {
        RoutePolicy {
            group_by: vec!["alertname".to_owned(), "env".to_owned()],
            group_wait: Duration::seconds(10),
            group_interval: Duration::seconds(60),
            repeat_interval: Duration::seconds(1800),
        }
    }

    fn event(name: &str, env: &str, status: AlertStatus) -> AlertEvent {
        AlertEvent {
            rule: name.to_owned(),
            severity: Severity::Warning,
            status,
            labels: [("alertname", name), ("env", env), ("instance", "a")]
                .into_iter()
                .collect(),
            annotations: BTreeMap::new(),
            value: 1.0,
            started_at: ts(0),
        }
    }

    fn router() -> AlertRouter {
        AlertRouter::new(policy(), vec![])
    }

    #[test]
    fn group_wait_delays_first_notification() {
        let mut r = router();
        r.ingest(event("HighCpu", "prod", AlertStatus::Firing), ts(0));

        assert!(r.flush_due(ts(5)).is_empty());
        let flushed = r.flush_due(ts(10));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].group_labels.get("alertname"), Some("HighCpu"));
        assert_eq!(flushed[0].alerts.len(), 1);
    }

    #[test]
    fn alerts_group_by_configured_labels() {
        let mut r = router();
        r.ingest(event("HighCpu", "prod", AlertStatus::Firing), ts(0));
        r.ingest(event("HighCpu", "dev", AlertStatus::Firing), ts(0));

        let flushed = r.flush_due(ts(10));
        assert_eq!(flushed.len(), 2);
    }

    #[test]
    fn duplicate_event_does_not_mark_group_changed() {
        let mut r = router();
        r.ingest(event("HighCpu", "prod", AlertStatus::Firing), ts(0));
        assert_eq!(r.flush_due(ts(10)).len(), 1);

        // same alert re-emitted each cycle: no change, repeat_interval governs
        r.ingest(event("HighCpu", "prod", AlertStatus::Firing), ts(20));
        assert!(r.flush_due(ts(80)).is_empty());
        // after repeat_interval the unchanged group re-notifies
        r.ingest(event("HighCpu", "prod", AlertStatus::Firing), ts(1810));
        assert_eq!(r.flush_due(ts(1810)).len(), 1);
    }

    #[test]
    fn changed_group_renotifies_after_group_interval() {
        let mut r = router();
        r.ingest(event("HighCpu", "prod", AlertStatus::Firing), ts(0));
        assert_eq!(r.flush_due(ts(10)).len(), 1);

        // a second series joins the same group
        let mut second = event("HighCpu", "prod", AlertStatus::Firing);
        second.labels.insert("instance", "b");
        r.ingest(second, ts(20));

        assert!(r.flush_due(ts(30)).is_empty()); // < group_interval since flush
        let flushed = r.flush_due(ts(70));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].alerts.len(), 2);
    }

    #[test]
    fn resolved_alert_rides_next_flush_then_evicts() {
        let mut r = router();
        r.ingest(event("HighCpu", "prod", AlertStatus::Firing), ts(0));
        assert_eq!(r.flush_due(ts(10)).len(), 1);

        r.ingest(event("HighCpu", "prod", AlertStatus::Resolved), ts(20));
        let flushed = r.flush_due(ts(70));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].status, AlertStatus::Resolved);

        // group is empty now and gone
        r.ingest(event("HighMem", "prod", AlertStatus::Firing), ts(80));
        let flushed = r.flush_due(ts(200));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].group_labels.get("alertname"), Some("HighMem"));
    }

    #[test]
    fn missing_group_label_groups_under_empty_value() {
        let mut r = router();
        let mut e = event("HighCpu", "prod", AlertStatus::Firing);
        e.labels = [("alertname", "HighCpu")].into_iter().collect();
        r.ingest(e, ts(0));

        let flushed = r.flush_due(ts(10));
        assert_eq!(flushed[0].group_labels.get("env"), Some(""));
    }

    #[tokio::test]
    async fn spawn_routes_events_from_channel() {
        let (tx, rx) = mpsc::channel(16);
        let policy = RoutePolicy {
            group_by: vec!["alertname".to_owned()],
            group_wait: Duration::zero(),
            group_interval: Duration::zero(),
            repeat_interval: Duration::zero(),
        };
        let router = AlertRouter::new(policy, vec![Receiver::log("test", Duration::zero())]);
        let handle = router.spawn(rx);

        tx.send(event("HighCpu", "prod", AlertStatus::Firing))
            .await
            .unwrap();
        drop(tx);
        // channel close stops the loop
        handle.await.unwrap();
    }
}
