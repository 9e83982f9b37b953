//! A TOML config for scrape targets, alerting rules, and alert routing.
//!
//! Format of config file:
//! ```rust
//! let cfg = "
//! [agent]
//! evaluation_interval = \"15s\"
//! retention = \"2h\"
//!
//! [[targets]]
//! url = \"http://localhost:9100/metrics\"
//! interval = \"10s\"
//! labels = { env = \"prod\" }
//!
//! [[rules]]
//! name = \"HighCpu\"
//! metric = \"cpu_usage_percent\"
//! condition = \"above\"
//! threshold = 90.0
//! for = \"2m\"
//! severity = \"critical\"
//! annotations = { summary = \"CPU above 90%\" }
//!
//! [route]
//! group_by = [\"alertname\", \"env\"]
//! group_wait = \"10s\"
//! group_interval = \"1m\"
//! repeat_interval = \"30m\"
//! receivers = [\"ops-log\"]
//!
//! [[receivers]]
//! name = \"ops-log\"
//! kind = \"log\"
//! ";
//! vigil_agent::parse_config_str(cfg).unwrap();
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::Duration;
use color_eyre::{
    eyre::{bail, eyre, Context},
    Report,
};
use serde::Deserialize;

use crate::labels::Labels;
use crate::notify::Receiver;
use crate::route::RoutePolicy;
use crate::rule::{Condition, Rule, Severity};
use crate::store::Selector;

pub fn parse_config(config_file: impl AsRef<Path>) -> Result<Config, Report> {
    let cfg = std::fs::read_to_string(config_file)?;
    parse_config_str(&cfg)
}

pub fn parse_config_str(cfg: &str) -> Result<Config, Report> {
    let config: Config = toml::from_str(cfg)
        .wrap_err("TOML file did not match deserialization struct, or was malformed")?;
    config.validate()?;
    Ok(config)
}

// rust toml uses serde, so we define structs to deserialize into.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub agent: AgentSpec,
    pub targets: Vec<TargetSpec>,
    pub rules: Vec<RuleSpec>,
    pub route: RouteSpec,
    pub receivers: Vec<ReceiverSpec>,
}

impl Config {
    fn validate(&self) -> Result<(), Report> {
        for name in &self.route.receivers {
            if !self.receivers.iter().any(|r| &r.name == name) {
                bail!("route references undeclared receiver {:?}", name);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AgentSpec {
    #[serde(deserialize_with = "duration_str::deserialize_duration_chrono")]
    pub evaluation_interval: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration_chrono")]
    pub retention: Duration,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TargetSpec {
    pub url: String,
    #[serde(deserialize_with = "duration_str::deserialize_duration_chrono")]
    pub interval: Duration,
    pub labels: Option<HashMap<String, String>>,
}

impl TargetSpec {
    pub fn static_labels(&self) -> Labels {
        self.labels
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub metric: String,
    pub match_labels: Option<HashMap<String, String>>,
    pub condition: String,
    pub threshold: Option<f64>,
    #[serde(
        default,
        deserialize_with = "duration_str::deserialize_option_duration_chrono"
    )]
    pub window: Option<Duration>,
    #[serde(
        rename = "for",
        default,
        deserialize_with = "duration_str::deserialize_option_duration_chrono"
    )]
    pub hold: Option<Duration>,
    pub severity: String,
    pub labels: Option<HashMap<String, String>>,
    pub annotations: Option<BTreeMap<String, String>>,
}

impl TryFrom<RuleSpec> for Rule {
    type Error = Report;
    fn try_from(value: RuleSpec) -> Result<Self, Self::Error> {
        let threshold = value
            .threshold
            .ok_or_else(|| eyre!("rule {:?}: condition requires a threshold", value.name));
        let window = value
            .window
            .ok_or_else(|| eyre!("rule {:?}: rate condition requires a window", value.name));
        let condition = match value.condition.to_lowercase().as_str() {
            "above" => Condition::Above(threshold?),
            "below" => Condition::Below(threshold?),
            "rate_above" => Condition::RateAbove {
                threshold: threshold?,
                window: window?,
            },
            "rate_below" => Condition::RateBelow {
                threshold: threshold?,
                window: window?,
            },
            "absent" => Condition::Absent,
            s => bail!("Unsupported condition type {:?}", s),
        };

        let severity = match value.severity.to_lowercase().as_str() {
            "warning" => Severity::Warning,
            "critical" => Severity::Critical,
            s => bail!("Unsupported severity {:?}", s),
        };

        Ok(Rule {
            name: value.name,
            selector: Selector::new(
                value.metric,
                value
                    .match_labels
                    .unwrap_or_default()
                    .into_iter()
                    .collect(),
            ),
            condition,
            hold: value.hold.unwrap_or_else(Duration::zero),
            severity,
            labels: value.labels.unwrap_or_default().into_iter().collect(),
            annotations: value.annotations.unwrap_or_default(),
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RouteSpec {
    pub group_by: Vec<String>,
    #[serde(deserialize_with = "duration_str::deserialize_duration_chrono")]
    pub group_wait: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration_chrono")]
    pub group_interval: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration_chrono")]
    pub repeat_interval: Duration,
    pub receivers: Vec<String>,
}

impl From<&RouteSpec> for RoutePolicy {
    fn from(value: &RouteSpec) -> Self {
        RoutePolicy {
            group_by: value.group_by.clone(),
            group_wait: value.group_wait,
            group_interval: value.group_interval,
            repeat_interval: value.repeat_interval,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReceiverSpec {
    pub name: String,
    pub kind: String,
    pub url: Option<String>,
    #[serde(
        default,
        deserialize_with = "duration_str::deserialize_option_duration_chrono"
    )]
    pub min_interval: Option<Duration>,
}

impl TryFrom<ReceiverSpec> for Receiver {
    type Error = Report;
    fn try_from(value: ReceiverSpec) -> Result<Self, Self::Error> {
        let min_gap = value.min_interval.unwrap_or_else(Duration::zero);
        match value.kind.to_lowercase().as_str() {
            "log" => Ok(Receiver::log(value.name, min_gap)),
            "webhook" => {
                let url = value
                    .url
                    .ok_or_else(|| eyre!("webhook receiver {:?} requires a url", value.name))?;
                Receiver::webhook(value.name, url, min_gap)
            }
            s => bail!("Unsupported receiver kind {:?}", s),
        }
    }
}
