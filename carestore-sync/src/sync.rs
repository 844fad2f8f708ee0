//! Synchronization orchestration
//!
//! Drives one exchange with the store's remote according to a
//! [`SynchronizationPolicy`]. Only one synchronization runs per store at a time;
//! a second request while one is running fails with [`SyncError::Busy`].

use crate::error::{SyncError, SyncResult};
use crate::knowledge::KnowledgeVector;
use crate::remote::{RemotePeer, RevisionSink};
use crate::revision::RevisionRecord;
use crate::store::CareStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How device and remote content are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SynchronizationPolicy {
    /// Pull and merge remote changes, then push local changes
    #[default]
    MergeDeviceRecordsWithRemote,
    /// Replace the remote's content with everything on this device
    OverwriteRemoteWithDeviceRecords,
    /// Replace this device's content with everything on the remote
    OverwriteDeviceRecordsWithRemote,
}

impl SynchronizationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SynchronizationPolicy::MergeDeviceRecordsWithRemote => "mergeDeviceRecordsWithRemote",
            SynchronizationPolicy::OverwriteRemoteWithDeviceRecords => {
                "overwriteRemoteWithDeviceRecords"
            }
            SynchronizationPolicy::OverwriteDeviceRecordsWithRemote => {
                "overwriteDeviceRecordsWithRemote"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
}

/// Synchronization statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub pulled_batches: usize,
    pub pulled_entities: usize,
    pub pushed_entities: usize,
}

/// Merges pulled batches into the store and remembers what the remote knows
struct MergeSink<'a> {
    store: &'a CareStore,
    remote: &'a dyn RemotePeer,
    remote_knowledge: KnowledgeVector,
    stats: SyncStats,
    failure: Option<SyncError>,
}

#[async_trait]
impl<'a> RevisionSink for MergeSink<'a> {
    async fn merge(&mut self, record: RevisionRecord) -> SyncResult<()> {
        if let Some(failure) = &self.failure {
            return Err(SyncError::MergeFailed(failure.to_string()));
        }

        self.remote_knowledge.merge(&record.knowledge_vector);
        match self.store.merge_revision(&record, self.remote).await {
            Ok(()) => {
                self.stats.pulled_batches += 1;
                self.stats.pulled_entities += record.len();
                Ok(())
            }
            Err(err) => {
                let reply = SyncError::MergeFailed(err.to_string());
                self.failure = Some(err);
                Err(reply)
            }
        }
    }
}

impl CareStore {
    /// Synchronize with the configured remote
    pub async fn synchronize(&self, policy: SynchronizationPolicy) -> SyncResult<SyncStats> {
        let remote = self.remote().ok_or_else(|| {
            SyncError::Configuration("No remote peer is configured for this store".to_string())
        })?;

        self.begin_synchronization().await?;
        info!(
            device_id = %self.device_id(),
            policy = policy.as_str(),
            "Starting synchronization"
        );

        let result = match policy {
            SynchronizationPolicy::MergeDeviceRecordsWithRemote => {
                self.merge_with_remote(remote.as_ref()).await
            }
            SynchronizationPolicy::OverwriteRemoteWithDeviceRecords => {
                self.overwrite_remote(remote.as_ref()).await
            }
            SynchronizationPolicy::OverwriteDeviceRecordsWithRemote => {
                self.overwrite_device(remote.as_ref()).await
            }
        };

        self.end_synchronization().await;
        match &result {
            Ok(stats) => info!(
                pulled = stats.pulled_entities,
                pushed = stats.pushed_entities,
                "Synchronization completed"
            ),
            Err(err) => warn!(error = %err, "Synchronization failed"),
        }
        result
    }

    pub async fn sync_status(&self) -> SyncStatus {
        self.state.lock().await.sync_status
    }

    async fn begin_synchronization(&self) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        if state.sync_status == SyncStatus::Syncing {
            return Err(SyncError::Busy);
        }
        state.sync_status = SyncStatus::Syncing;
        Ok(())
    }

    async fn end_synchronization(&self) {
        self.state.lock().await.sync_status = SyncStatus::Idle;
    }

    /// Pull everything the device has not seen, then push what the remote has not
    async fn merge_with_remote(&self, remote: &dyn RemotePeer) -> SyncResult<SyncStats> {
        let (mut stats, remote_knowledge) = self
            .pull_and_merge(remote, self.knowledge_vector().await)
            .await?;

        let since = remote_knowledge.clock(self.device_id());
        let delta = self.prepare_outgoing_revision(since).await?;
        let pushed = delta.len();
        match remote.push_revisions(delta, false).await {
            Ok(()) => stats.pushed_entities = pushed,
            Err(err) => warn!(error = %err, "Remote rejected pushed revisions"),
        }

        Ok(stats)
    }

    /// Send every stored version and ask the remote to replace its content
    async fn overwrite_remote(&self, remote: &dyn RemotePeer) -> SyncResult<SyncStats> {
        let revision = self.prepare_outgoing_revision(0).await?;
        let pushed = revision.len();
        remote.push_revisions(revision, true).await?;

        Ok(SyncStats {
            pushed_entities: pushed,
            ..SyncStats::default()
        })
    }

    /// Drop all local content, then pull everything from the remote
    async fn overwrite_device(&self, remote: &dyn RemotePeer) -> SyncResult<SyncStats> {
        self.reset_content().await?;
        let (stats, _) = self.pull_and_merge(remote, KnowledgeVector::new()).await?;
        Ok(stats)
    }

    async fn pull_and_merge(
        &self,
        remote: &dyn RemotePeer,
        since: KnowledgeVector,
    ) -> SyncResult<(SyncStats, KnowledgeVector)> {
        let mut sink = MergeSink {
            store: self,
            remote,
            remote_knowledge: KnowledgeVector::new(),
            stats: SyncStats::default(),
            failure: None,
        };

        let pulled = remote.pull_revisions(&since, &mut sink).await;
        if let Some(failure) = sink.failure {
            return Err(failure);
        }
        pulled?;

        debug!(
            batches = sink.stats.pulled_batches,
            entities = sink.stats.pulled_entities,
            "Pulled revisions from remote"
        );
        Ok((sink.stats, sink.remote_knowledge))
    }

    /// Called when the remote asks this device to synchronize. Runs a merge
    /// synchronization if the store is configured for automatic sync.
    pub async fn remote_did_request_synchronization(&self) {
        if !self.config().automatic_synchronization {
            debug!("Ignoring synchronization request, automatic synchronization is off");
            return;
        }

        if let Err(err) = self
            .synchronize(SynchronizationPolicy::MergeDeviceRecordsWithRemote)
            .await
        {
            error!(error = %err, "Automatic synchronization failed");
        }
    }

    /// Report transfer progress in `0.0..=1.0` to subscribers
    pub fn remote_did_update_progress(&self, progress: f64) {
        let progress = if progress.is_nan() { 0.0 } else { progress.clamp(0.0, 1.0) };
        debug!(progress = progress, "Synchronization progress");
        self.progress.send_replace(progress);
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<f64> {
        self.progress.subscribe()
    }
}
