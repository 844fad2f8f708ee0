//! Message-based peers
//!
//! Connects two stores through an opaque request/reply transport. The
//! requesting side wraps the transport in a [`MessagePeer`], which implements
//! [`RemotePeer`]. The answering side feeds each request into [`reply_to`].
//!
//! Messages are JSON:
//! - `revisionRequest` carries the requester's knowledge vector and is answered
//!   with `revisions`.
//! - `revisionPush` carries a revision and the overwrite flag and is answered
//!   with `accepted` or `rejected`.

use crate::error::{SyncError, SyncResult};
use crate::knowledge::KnowledgeVector;
use crate::remote::{
    ConflictDescriptor, ConflictPolicy, ConflictResolver, LastWriteWins, RemotePeer, RevisionSink,
};
use crate::revision::RevisionRecord;
use crate::store::CareStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Request sent to a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PeerMessage {
    RevisionRequest {
        #[serde(rename = "knowledgeVector")]
        knowledge_vector: KnowledgeVector,
    },
    RevisionPush {
        revision: RevisionRecord,
        overwrite: bool,
    },
}

/// Answer to a [`PeerMessage`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PeerReply {
    Revisions {
        #[serde(rename = "knowledgeVector")]
        knowledge_vector: KnowledgeVector,
        revisions: Vec<RevisionRecord>,
    },
    Accepted,
    Rejected {
        reason: String,
    },
}

impl PeerMessage {
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl PeerReply {
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Carries one encoded message to the other side and returns its reply
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, message: Vec<u8>) -> anyhow::Result<Vec<u8>>;
}

/// A [`RemotePeer`] reached through a [`PeerTransport`]
pub struct MessagePeer<T> {
    transport: T,
    resolver: Arc<dyn ConflictResolver>,
}

impl<T: PeerTransport> MessagePeer<T> {
    /// Conflicts are resolved with [`LastWriteWins`] unless configured otherwise
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            resolver: Arc::new(LastWriteWins),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    async fn exchange(&self, message: &PeerMessage) -> SyncResult<PeerReply> {
        let reply = self
            .transport
            .send(message.encode()?)
            .await
            .map_err(SyncError::Transport)?;
        PeerReply::decode(&reply)
    }
}

#[async_trait]
impl<T: PeerTransport> ConflictResolver for MessagePeer<T> {
    async fn choose_conflict_resolution_policy(
        &self,
        descriptor: &ConflictDescriptor,
    ) -> ConflictPolicy {
        self.resolver.choose_conflict_resolution_policy(descriptor).await
    }
}

#[async_trait]
impl<T: PeerTransport> RemotePeer for MessagePeer<T> {
    async fn pull_revisions(
        &self,
        since: &KnowledgeVector,
        sink: &mut dyn RevisionSink,
    ) -> SyncResult<()> {
        let request = PeerMessage::RevisionRequest {
            knowledge_vector: since.clone(),
        };

        match self.exchange(&request).await? {
            PeerReply::Revisions {
                knowledge_vector,
                revisions,
            } => {
                debug!(batches = revisions.len(), "Received revisions from peer");
                if revisions.is_empty() {
                    return sink.merge(RevisionRecord::knowledge_only(knowledge_vector)).await;
                }
                for revision in revisions {
                    sink.merge(revision).await?;
                }
                Ok(())
            }
            PeerReply::Rejected { reason } => Err(SyncError::Transport(anyhow::anyhow!(
                "peer rejected revision request: {}",
                reason
            ))),
            PeerReply::Accepted => Err(SyncError::Transport(anyhow::anyhow!(
                "peer acknowledged a revision request without revisions"
            ))),
        }
    }

    async fn push_revisions(&self, delta: RevisionRecord, overwrite: bool) -> SyncResult<()> {
        let request = PeerMessage::RevisionPush {
            revision: delta,
            overwrite,
        };

        match self.exchange(&request).await? {
            PeerReply::Accepted => Ok(()),
            PeerReply::Rejected { reason } => Err(SyncError::Transport(anyhow::anyhow!(
                "peer rejected pushed revision: {}",
                reason
            ))),
            PeerReply::Revisions { .. } => Err(SyncError::Transport(anyhow::anyhow!(
                "peer answered a push with revisions"
            ))),
        }
    }
}

/// Answer one encoded request on behalf of `store`.
///
/// A revision request is answered with everything the requester has not seen
/// and advances the local clock. A push is merged, or replaces all content
/// when it carries the overwrite flag; merge failures become a rejection.
pub async fn reply_to<R>(store: &CareStore, request: &[u8], resolver: &R) -> SyncResult<Vec<u8>>
where
    R: ConflictResolver + ?Sized,
{
    let reply = match PeerMessage::decode(request)? {
        PeerMessage::RevisionRequest { knowledge_vector } => {
            let since = knowledge_vector.clock(store.device_id());
            let revision = store.prepare_outgoing_revision(since).await?;
            PeerReply::Revisions {
                knowledge_vector: revision.knowledge_vector.clone(),
                revisions: vec![revision],
            }
        }
        PeerMessage::RevisionPush {
            revision,
            overwrite,
        } => {
            let applied = if overwrite {
                store.replace_with_revision(&revision, resolver).await
            } else {
                store.merge_revision(&revision, resolver).await
            };

            match applied {
                Ok(()) => PeerReply::Accepted,
                Err(err) => {
                    warn!(error = %err, overwrite = overwrite, "Rejecting pushed revision");
                    PeerReply::Rejected {
                        reason: err.to_string(),
                    }
                }
            }
        }
    };

    reply.encode()
}

/// In-process transport that answers with another store
pub struct LoopbackTransport {
    store: Arc<CareStore>,
    resolver: Arc<dyn ConflictResolver>,
}

impl LoopbackTransport {
    pub fn new(store: Arc<CareStore>) -> Self {
        Self {
            store,
            resolver: Arc::new(LastWriteWins),
        }
    }

    /// Resolver the answering store uses when merging pushed revisions
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn send(&self, message: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        Ok(reply_to(&self.store, &message, self.resolver.as_ref()).await?)
    }
}
