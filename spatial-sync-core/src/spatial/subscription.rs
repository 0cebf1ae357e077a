//! Live transform bindings
//!
//! A subscription waits for readiness, applies the current transform, then
//! re-applies whenever the spatial snapshot changes. Dropping the handle
//! cancels it, so a subscription cannot outlive the scope that owns it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::math::Mat4;
use super::role::AttachmentRole;
use super::transform::{SpatialSnapshot, TransformEngine};

/// Something that can be positioned (an entity, a window, an attachment)
pub trait TransformTarget: Send + Sync + 'static {
    fn apply_transform(&self, transform: Mat4);
}

/// Handle for one live binding between a target and a role
#[must_use = "dropping a TransformSubscription cancels it immediately"]
pub struct TransformSubscription {
    role_id: String,
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TransformSubscription {
    /// Must be called from within a tokio runtime
    pub(crate) fn spawn(
        target: Weak<dyn TransformTarget>,
        role: AttachmentRole,
        engine: TransformEngine,
        snapshots: watch::Receiver<SpatialSnapshot>,
    ) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        let role_id = role.id.clone();
        let task = tokio::spawn(drive(target, role, engine, snapshots, Arc::clone(&cancelled)));

        Self {
            role_id,
            cancelled,
            task,
        }
    }

    /// Stop applying transforms. Idempotent.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.task.abort();
            debug!("Transform subscription for role '{}' cancelled", self.role_id);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// True once the background task has stopped (cancelled or target gone)
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn role_id(&self) -> &str {
        &self.role_id
    }
}

impl Drop for TransformSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn drive(
    target: Weak<dyn TransformTarget>,
    role: AttachmentRole,
    engine: TransformEngine,
    mut snapshots: watch::Receiver<SpatialSnapshot>,
    cancelled: Arc<AtomicBool>,
) {
    loop {
        // Never position against the origin before real data exists
        let snapshot = match snapshots.wait_for(|s| s.ready).await {
            Ok(s) => *s,
            Err(_) => break,
        };

        if cancelled.load(Ordering::Acquire) {
            break;
        }
        let Some(entity) = target.upgrade() else {
            debug!("Target for role '{}' dropped, ending subscription", role.id);
            break;
        };
        entity.apply_transform(engine.compute(&snapshot, &role));
        drop(entity);

        if snapshots.changed().await.is_err() {
            break;
        }
    }
}

/// One handle covering a batch of attachment subscriptions
#[must_use = "dropping AttachmentSubscriptions cancels every subscription in it"]
#[derive(Default)]
pub struct AttachmentSubscriptions {
    subscriptions: Vec<TransformSubscription>,
}

impl AttachmentSubscriptions {
    pub(crate) fn push(&mut self, subscription: TransformSubscription) {
        self.subscriptions.push(subscription);
    }

    /// Cancel every subscription in the batch. Idempotent.
    pub fn cancel(&self) {
        for sub in &self.subscriptions {
            sub.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn role_ids(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(|s| s.role_id())
    }
}
