// Main uploader module - drives one clip publish end to end
//
// Session acquisition lives in `crate::session`; this module owns the publish
// call, the retry policy and the remote bridge client.

pub mod bridge_client;
pub mod orchestrator;
pub mod retry;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::classifier::RawSignal;
use crate::session::AuthenticatedSession;

pub use bridge_client::BridgeClient;
pub use orchestrator::{AttemptOutcome, AttemptRecord, PublishOutcome, UploadOrchestrator};
pub use retry::RetryPolicy;

/// One piece of content to publish.
#[derive(Debug, Clone)]
pub struct ClipUpload {
    pub video: PathBuf,
    pub caption: String,
    /// Precomputed cover frame. The remote synthesizes one when absent.
    pub cover: Option<PathBuf>,
}

/// A raw success from the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Short code of the new media item, when the remote returned one.
    pub identifier: Option<String>,
}

/// An item from the account's own recent media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentItem {
    pub identifier: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RemotePublishClient: Send + Sync {
    async fn publish(
        &self,
        session: &AuthenticatedSession,
        clip: &ClipUpload,
    ) -> Result<PublishReceipt, RawSignal>;

    /// Most recent items first.
    async fn recent_items(
        &self,
        session: &AuthenticatedSession,
        account: &str,
        limit: usize,
    ) -> Result<Vec<RecentItem>, RawSignal>;
}
