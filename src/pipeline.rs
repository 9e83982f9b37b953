//! Wires the pipeline together: store, scrapers, evaluator, pruner, router.

use chrono::{Duration, Utc};
use color_eyre::eyre::{eyre, Report};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config_file::Config;
use crate::notify::Receiver;
use crate::route::{AlertRouter, RoutePolicy};
use crate::rule::{Rule, RuleEvaluator};
use crate::scrape::ScrapeTarget;
use crate::store::MetricStore;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The assembled agent. Holds the spawned task handles; dropping them does
/// not stop the tasks, `shutdown` does.
pub struct Agent {
    store: MetricStore,
    handles: Vec<JoinHandle<()>>,
}

impl Agent {
    /// Build and start every component from a parsed config.
    pub fn start(cfg: Config) -> Result<Self, Report> {
        let store = MetricStore::new();
        let mut handles = Vec::new();

        for target_spec in &cfg.targets {
            let target = ScrapeTarget::new(
                target_spec.url.as_str(),
                to_std(target_spec.interval)?,
                target_spec.static_labels(),
                store.clone(),
            )?;
            info!(endpoint = %target.url(), "starting scrape loop");
            handles.push(target.spawn());
        }

        let rules: Vec<Rule> = cfg
            .rules
            .iter()
            .cloned()
            .map(Rule::try_from)
            .collect::<Result<_, _>>()?;
        info!(rules = rules.len(), "starting rule evaluator");

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let evaluator = RuleEvaluator::new(rules, store.clone(), tx);
        handles.push(evaluator.spawn(to_std(cfg.agent.evaluation_interval)?));

        let receivers: Vec<Receiver> = cfg
            .receivers
            .iter()
            .filter(|spec| cfg.route.receivers.contains(&spec.name))
            .cloned()
            .map(Receiver::try_from)
            .collect::<Result<_, _>>()?;
        let policy = RoutePolicy::from(&cfg.route);
        let router = AlertRouter::new(policy, receivers);
        handles.push(router.spawn(rx));

        handles.push(spawn_pruner(store.clone(), cfg.agent.retention)?);

        Ok(Self { store, handles })
    }

    pub fn store(&self) -> &MetricStore {
        &self.store
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

fn spawn_pruner(store: MetricStore, retention: Duration) -> Result<JoinHandle<()>, Report> {
    // prune at a tenth of the retention window, at least once a minute
    let cadence = std::cmp::max(retention / 10, Duration::minutes(1));
    let cadence = to_std(cadence)?;
    Ok(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cadence);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            store.prune(Utc::now(), retention);
        }
    }))
}

fn to_std(duration: Duration) -> Result<std::time::Duration, Report> {
    duration
        .to_std()
        .map_err(|_| eyre!("duration {} must be positive", duration))
}
