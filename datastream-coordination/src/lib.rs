pub mod assignment_store;
pub mod cluster_view;
pub mod config;
pub mod connector;
pub mod coordinator;
pub mod error;
pub mod keys;
pub mod membership;
pub mod metrics_consts;
pub mod reconciler;
pub mod strategy;
pub mod stream_watcher;
pub mod types;
