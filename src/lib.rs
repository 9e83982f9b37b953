//! A metrics collection and alerting pipeline: scrape Prometheus-format
//! endpoints on a schedule, keep samples in an in-memory time-series store,
//! evaluate threshold rules with pending/firing tracking, and route alerts
//! to receivers with grouping, dedup, and rate limiting.

pub mod config_file;
pub mod labels;
pub mod notify;
pub mod pipeline;
pub mod route;
pub mod rule;
pub mod scrape;
pub mod store;

pub use config_file::{parse_config, parse_config_str, Config};
pub use labels::{Labels, SeriesId};
pub use notify::{Notification, Receiver};
pub use pipeline::Agent;
pub use route::{AlertRouter, RoutePolicy};
pub use rule::{AlertEvent, AlertStatus, Condition, Rule, RuleEvaluator, Severity};
pub use scrape::ScrapeTarget;
pub use store::{MetricStore, Point, Selector};
