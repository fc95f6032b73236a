use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::strategy::{strategy_from_name, AssignmentStrategy};
use crate::types::{StreamDefinition, Task};

/// Strategy used for connector types without an explicit binding.
pub const DEFAULT_STRATEGY: &str = "broadcast";

/// Failure reported by a connector or sink implementation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ConnectorError(pub String);

impl ConnectorError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A record produced by a running task. Opaque to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub stream: String,
    pub partition: u32,
    pub payload: Vec<u8>,
}

/// Downstream destination for records; handed to every started task.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, record: EventRecord) -> std::result::Result<(), ConnectorError>;
}

/// Sink that discards every record.
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn send(&self, record: EventRecord) -> std::result::Result<(), ConnectorError> {
        tracing::trace!(stream = %record.stream, partition = record.partition, "discarding record");
        Ok(())
    }
}

/// A connector plugin: runs tasks of one connector type.
///
/// `start` should return once the task is running; the connector owns any
/// background work it spawns. A `start` future is dropped unfinished when the
/// worker loses its session or shuts down mid-start, and must leave nothing
/// running when that happens. `stop` must release the task. The coordinator
/// bounds how long it waits for `stop` and forgets the task afterwards.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn start(
        &self,
        task: &Task,
        definition: &StreamDefinition,
        sink: Arc<dyn EventSink>,
    ) -> std::result::Result<(), ConnectorError>;

    async fn stop(&self, task: &Task) -> std::result::Result<(), ConnectorError>;
}

/// Connector that only logs, for deployments without real plugins.
pub struct NoopConnector;

#[async_trait]
impl Connector for NoopConnector {
    async fn start(
        &self,
        task: &Task,
        definition: &StreamDefinition,
        _sink: Arc<dyn EventSink>,
    ) -> std::result::Result<(), ConnectorError> {
        tracing::info!(task = %task, source = %definition.source, "noop connector started task");
        Ok(())
    }

    async fn stop(&self, task: &Task) -> std::result::Result<(), ConnectorError> {
        tracing::info!(task = %task, "noop connector stopped task");
        Ok(())
    }
}

pub trait ConnectorFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Connector>;
}

impl<F> ConnectorFactory for F
where
    F: Fn() -> Arc<dyn Connector> + Send + Sync,
{
    fn create(&self) -> Arc<dyn Connector> {
        self()
    }
}

/// Named connector factories, populated when the binary is built.
#[derive(Default)]
pub struct ConnectorRegistry {
    factories: HashMap<String, Arc<dyn ConnectorFactory>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the connectors shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("noop", Arc::new(|| -> Arc<dyn Connector> { Arc::new(NoopConnector) }));
        registry
    }

    pub fn register(&mut self, name: &str, factory: Arc<dyn ConnectorFactory>) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn create(&self, name: &str) -> Result<Arc<dyn Connector>> {
        self.factories
            .get(name)
            .map(|f| f.create())
            .ok_or_else(|| Error::configuration(format!("unknown connector type: {name}")))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}

/// A connector instance plus the strategy its tasks are assigned with. The
/// strategy is fixed for the life of the process.
#[derive(Clone)]
pub struct ConnectorBinding {
    pub connector: Arc<dyn Connector>,
    pub strategy: Arc<dyn AssignmentStrategy>,
}

/// Connector type name to binding.
#[derive(Clone, Default)]
pub struct ConnectorBindings {
    by_type: BTreeMap<String, ConnectorBinding>,
}

impl ConnectorBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(
        mut self,
        connector_type: &str,
        connector: Arc<dyn Connector>,
        strategy: Arc<dyn AssignmentStrategy>,
    ) -> Self {
        self.by_type.insert(
            connector_type.to_string(),
            ConnectorBinding {
                connector,
                strategy,
            },
        );
        self
    }

    /// Instantiate each of `connector_types` from `registry`, bound to the
    /// strategy named in `strategies` or [`DEFAULT_STRATEGY`].
    pub fn from_config(
        registry: &ConnectorRegistry,
        connector_types: &[String],
        strategies: &HashMap<String, String>,
    ) -> Result<Self> {
        if let Some(orphan) = strategies.keys().find(|t| !connector_types.contains(*t)) {
            return Err(Error::configuration(format!(
                "strategy configured for unlisted connector type: {orphan}"
            )));
        }

        let mut bindings = Self::new();
        for connector_type in connector_types {
            let connector = registry.create(connector_type)?;
            let strategy_name = strategies
                .get(connector_type)
                .map(String::as_str)
                .unwrap_or(DEFAULT_STRATEGY);
            let strategy = strategy_from_name(strategy_name)?;
            tracing::info!(
                connector_type = %connector_type,
                strategy = strategy.name(),
                "bound connector"
            );
            bindings = bindings.bind(connector_type, connector, strategy);
        }
        Ok(bindings)
    }

    pub fn get(&self, connector_type: &str) -> Option<&ConnectorBinding> {
        self.by_type.get(connector_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn builtin_registry_has_noop() {
        let registry = ConnectorRegistry::with_builtin();
        assert_eq!(registry.names(), vec!["noop"]);
        assert!(registry.create("noop").is_ok());
    }

    #[test]
    fn unknown_connector_is_a_configuration_error() {
        let registry = ConnectorRegistry::with_builtin();
        let err = registry.create("espresso").err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn bindings_default_to_broadcast() {
        let registry = ConnectorRegistry::with_builtin();
        let bindings = ConnectorBindings::from_config(&registry, &types(&["noop"]), &HashMap::new())
            .unwrap();
        assert_eq!(bindings.get("noop").unwrap().strategy.name(), "broadcast");
    }

    #[test]
    fn bindings_use_configured_strategy() {
        let mut registry = ConnectorRegistry::with_builtin();
        registry.register("kafka", Arc::new(|| -> Arc<dyn Connector> { Arc::new(NoopConnector) }));
        let strategies = HashMap::from([("kafka".to_string(), "balanced-partition".to_string())]);

        let bindings =
            ConnectorBindings::from_config(&registry, &types(&["noop", "kafka"]), &strategies)
                .unwrap();
        assert_eq!(bindings.get("kafka").unwrap().strategy.name(), "balanced-partition");
        assert_eq!(bindings.get("noop").unwrap().strategy.name(), "broadcast");
        assert!(bindings.get("espresso").is_none());
    }

    #[test]
    fn bindings_reject_bad_configuration() {
        let registry = ConnectorRegistry::with_builtin();

        let unknown_strategy = HashMap::from([("noop".to_string(), "random".to_string())]);
        assert!(matches!(
            ConnectorBindings::from_config(&registry, &types(&["noop"]), &unknown_strategy),
            Err(Error::Configuration(_))
        ));

        let orphan = HashMap::from([("kafka".to_string(), "broadcast".to_string())]);
        assert!(matches!(
            ConnectorBindings::from_config(&registry, &types(&["noop"]), &orphan),
            Err(Error::Configuration(_))
        ));
    }
}
