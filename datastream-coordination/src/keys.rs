use crate::types::WorkerId;

/// All key patterns used under a cluster prefix.
pub enum StoreKey<'a> {
    Worker(&'a WorkerId),
    WorkersPrefix,
    Stream(&'a str),
    StreamsPrefix,
    AssignmentEpoch,
    AssignmentTable,
    AssignmentPrefix,
}

impl StoreKey<'_> {
    fn resolve(&self, prefix: &str) -> String {
        match self {
            StoreKey::Worker(id) => format!("{prefix}workers/{id}"),
            StoreKey::WorkersPrefix => format!("{prefix}workers/"),
            StoreKey::Stream(name) => format!("{prefix}streams/{name}"),
            StoreKey::StreamsPrefix => format!("{prefix}streams/"),
            StoreKey::AssignmentEpoch => format!("{prefix}assignment/epoch"),
            StoreKey::AssignmentTable => format!("{prefix}assignment/table"),
            StoreKey::AssignmentPrefix => format!("{prefix}assignment/"),
        }
    }
}

/// Key namespace of one cluster, e.g. `/datastream/prod-east/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key(&self, k: StoreKey<'_>) -> String {
        k.resolve(&self.prefix)
    }
}
