use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, GetOptions, PutOptions, Txn,
    TxnOp, TxnOpResponse, WatchOptions,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    ChangeStream, CoordinationBackend, GuardedPut, KeyValue, Revision, SessionId, Snapshot,
};
use crate::error::{Error, Result};

const WATCH_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    pub connect_timeout: Duration,
}

/// [`CoordinationBackend`] over etcd. Sessions are leases.
///
/// `Client` is `Clone` (wraps an inner `Arc`), so each method clones it cheaply.
#[derive(Clone)]
pub struct EtcdBackend {
    client: Client,
}

impl EtcdBackend {
    pub async fn connect(config: EtcdConfig) -> Result<Self> {
        let options = ConnectOptions::new().with_connect_timeout(config.connect_timeout);
        let client = Client::connect(&config.endpoints, Some(options)).await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CoordinationBackend for EtcdBackend {
    // ── Sessions ─────────────────────────────────────────────────

    async fn grant_session(&self, ttl_secs: i64) -> Result<SessionId> {
        let resp = self.client.clone().lease_grant(ttl_secs, None).await?;
        Ok(resp.id())
    }

    async fn keep_session_alive(
        &self,
        session: SessionId,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (mut keeper, mut stream) = self.client.clone().lease_keep_alive(session).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {
                    keeper.keep_alive().await?;
                    match stream.message().await? {
                        // A zero TTL means the lease already expired server-side
                        Some(resp) if resp.ttl() > 0 => {}
                        _ => return Err(Error::SessionLost),
                    }
                }
            }
        }
    }

    async fn revoke_session(&self, session: SessionId) -> Result<()> {
        self.client.clone().lease_revoke(session).await?;
        Ok(())
    }

    async fn create_ephemeral(
        &self,
        key: &str,
        value: Vec<u8>,
        session: SessionId,
    ) -> Result<bool> {
        let txn = Txn::new()
            .when(vec![Compare::version(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_lease(session)),
            )]);
        let resp = self.client.clone().txn(txn).await?;
        Ok(resp.succeeded())
    }

    // ── Reads ────────────────────────────────────────────────────

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let resp = self.client.clone().get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn snapshot(&self, prefix: &str) -> Result<Snapshot> {
        let options = GetOptions::new().with_prefix();
        let resp = self.client.clone().get(prefix, Some(options)).await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        let entries = resp
            .kvs()
            .iter()
            .map(|kv| {
                let key = std::str::from_utf8(kv.key())
                    .map_err(|e| Error::InvalidState(format!("non-utf8 key: {e}")))?;
                Ok(KeyValue {
                    key: key.to_string(),
                    value: kv.value().to_vec(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Snapshot { revision, entries })
    }

    // ── Writes ───────────────────────────────────────────────────

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.client.clone().put(key, value, None).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let options = DeleteOptions::new().with_prefix();
        self.client.clone().delete(prefix, Some(options)).await?;
        Ok(())
    }

    async fn put_guarded(
        &self,
        guard_key: &str,
        guard: &[u8],
        key: &str,
        value: Vec<u8>,
    ) -> Result<GuardedPut> {
        // A missing guard key fails the comparison, so the write goes through.
        let txn = Txn::new()
            .when(vec![Compare::value(guard_key, CompareOp::Greater, guard)])
            .and_then(vec![TxnOp::get(guard_key, None)])
            .or_else(vec![
                TxnOp::put(guard_key, guard, None),
                TxnOp::put(key, value, None),
            ]);
        let resp = self.client.clone().txn(txn).await?;

        if !resp.succeeded() {
            return Ok(GuardedPut::Applied);
        }

        let current_guard = resp
            .op_responses()
            .into_iter()
            .find_map(|op| match op {
                TxnOpResponse::Get(get) => get.kvs().first().map(|kv| kv.value().to_vec()),
                _ => None,
            })
            .unwrap_or_default();
        Ok(GuardedPut::Rejected { current_guard })
    }

    // ── Watches ──────────────────────────────────────────────────

    async fn watch(&self, prefix: &str) -> Result<ChangeStream> {
        let options = WatchOptions::new().with_prefix();
        let mut stream = self.client.clone().watch(prefix, Some(options)).await?;
        let (tx, rx) = mpsc::channel::<Result<Revision>>(WATCH_CHANNEL_SIZE);

        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = tx.closed() => return,
                    msg = stream.message() => match msg {
                        Ok(Some(resp)) if resp.canceled() => {
                            Err(Error::InvalidState(format!("watch on {prefix} was cancelled")))
                        }
                        Ok(Some(resp)) if resp.events().is_empty() => continue,
                        Ok(Some(resp)) => Ok(resp.header().map(|h| h.revision()).unwrap_or_default()),
                        Ok(None) => return,
                        Err(e) => Err(Error::from(e)),
                    },
                };
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    return;
                }
            }
        });

        Ok(ChangeStream::new(rx))
    }
}
