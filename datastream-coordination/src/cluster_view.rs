use assignment_coordination::backend::CoordinationBackend;

use crate::assignment_store::table_from;
use crate::error::Result;
use crate::keys::Keyspace;
use crate::membership::live_set_from;
use crate::stream_watcher::stream_set_from;
use crate::types::{AssignmentTable, Epoch, LiveSet, StreamSet};

/// Membership, stream definitions, and the stored table as of one store
/// revision.
///
/// Tables are computed from a view and stamped with its epoch, so a table
/// built from older inputs always carries an older epoch than one built from
/// newer inputs, whichever worker computed it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterView {
    pub epoch: Epoch,
    pub live: LiveSet,
    pub streams: StreamSet,
    pub stored: AssignmentTable,
}

impl ClusterView {
    /// Read the whole cluster keyspace with a single range read.
    pub async fn read(backend: &dyn CoordinationBackend, keys: &Keyspace) -> Result<Self> {
        let snapshot = backend.snapshot(keys.prefix()).await?;
        Ok(Self {
            epoch: Epoch::from_revision(snapshot.revision),
            live: live_set_from(&snapshot, keys),
            streams: stream_set_from(&snapshot, keys),
            stored: table_from(&snapshot, keys)?,
        })
    }
}
