//! Notification dispatcher
//!
//! Appends one immutable row per notice, invalidates the owner's feed views
//! and publishes the row on the owner's live channel. Domain operations call
//! [`NotificationDispatcher::emit_best_effort`], so a failed emit never fails
//! or rolls back the transition it describes.
//!
//! Rows tagged with an [`ActionRequired`] are only marked read by
//! [`NotificationDispatcher::resolve`], which the confirmation protocol calls
//! when the action is performed.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Context;
use crate::cache::{affected, ViewKey, ViewLayer};
use crate::db::schemas::{ActionRequired, NotificationDoc, NotificationEvent};
use crate::nats::Publisher;
use crate::store::{FulfillmentStore, Page};
use crate::types::{HandoffError, Result};

/// A notification about to be emitted
#[derive(Debug, Clone)]
pub struct Notice {
    pub user_id: String,
    pub title: String,
    pub message: String,
    pub event: NotificationEvent,
    pub action: Option<ActionRequired>,
}

impl Notice {
    pub fn new(
        user_id: &str,
        title: impl Into<String>,
        message: impl Into<String>,
        event: NotificationEvent,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            title: title.into(),
            message: message.into(),
            event,
            action: None,
        }
    }

    /// Tag the notice as pending work for its owner
    pub fn requiring(mut self, action: ActionRequired) -> Self {
        self.action = Some(action);
        self
    }
}

/// Result of `markNotificationRead`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadAck {
    pub notification_id: String,
    pub read: bool,
    /// Set when the row is an unresolved action and was left unread
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_pending: Option<ActionRequired>,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    store: Arc<dyn FulfillmentStore>,
    views: ViewLayer,
    publisher: Publisher,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<dyn FulfillmentStore>, views: ViewLayer, publisher: Publisher) -> Self {
        Self {
            store,
            views,
            publisher,
        }
    }

    /// Append the row, refresh the owner's views, push it live
    pub async fn emit(&self, notice: Notice) -> Result<NotificationDoc> {
        let doc = NotificationDoc::new(
            Context::new_id(),
            notice.user_id,
            notice.title,
            notice.message,
            notice.event,
            notice.action,
        );
        self.store.insert_notification(&doc).await?;
        self.views.invalidate(&affected::feed(&doc.user_id)).await;

        let subject = self.publisher.subjects().user_notifications(&doc.user_id);
        self.publisher.publish_json(&subject, &doc).await;

        debug!(
            notification_id = %doc.id,
            user_id = %doc.user_id,
            kind = doc.kind(),
            action = doc.action_required.map(|a| a.as_str()),
            "Notification emitted"
        );
        Ok(doc)
    }

    /// Emit, logging instead of failing
    pub async fn emit_best_effort(&self, notice: Notice) -> Option<NotificationDoc> {
        let user_id = notice.user_id.clone();
        let kind = notice.event.kind();
        match self.emit(notice).await {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!(user_id = %user_id, kind, error = %e, "Notification dropped");
                None
            }
        }
    }

    /// Emit several notices in order
    pub async fn emit_all(&self, notices: Vec<Notice>) {
        for notice in notices {
            self.emit_best_effort(notice).await;
        }
    }

    /// Feed page, newest first
    pub async fn list(&self, user_id: &str, page: Page) -> Result<Vec<NotificationDoc>> {
        let store = &self.store;
        self.views
            .read_through(
                ViewKey::notifications(user_id, page),
                self.views.user_ttl(),
                || store.list_notifications(user_id, page),
            )
            .await
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<u64> {
        let store = &self.store;
        self.views
            .read_through(ViewKey::unread(user_id), self.views.user_ttl(), || {
                store.count_unread(user_id)
            })
            .await
    }

    /// Mark one notification read.
    ///
    /// Rows carrying an unresolved action are acknowledged but left unread.
    pub async fn mark_read(&self, notification_id: &str, user_id: &str) -> Result<ReadAck> {
        let notification = self
            .store
            .get_notification(notification_id)
            .await?
            .ok_or_else(|| HandoffError::NotFound(format!("notification {}", notification_id)))?;

        if notification.user_id != user_id {
            return Err(HandoffError::Forbidden(format!(
                "notification {} belongs to another user",
                notification_id
            )));
        }

        if notification.read {
            return Ok(ReadAck {
                notification_id: notification.id,
                read: true,
                action_pending: None,
            });
        }

        if let Some(action) = notification.action_required {
            debug!(notification_id, action = action.as_str(), "Action notification left unread");
            return Ok(ReadAck {
                notification_id: notification.id,
                read: false,
                action_pending: Some(action),
            });
        }

        let changed = self
            .store
            .mark_notification_read(notification_id, user_id, Utc::now())
            .await?;
        if changed {
            self.views.invalidate(&affected::feed(user_id)).await;
        }
        Ok(ReadAck {
            notification_id: notification.id,
            read: true,
            action_pending: None,
        })
    }

    /// Mark a user's pending `action` rows for a claim read
    pub async fn resolve(&self, user_id: &str, claim_id: &str, action: ActionRequired) -> Result<u64> {
        let resolved = self
            .store
            .resolve_actions(user_id, claim_id, action, Utc::now())
            .await?;
        if resolved > 0 {
            self.views.invalidate(&affected::feed(user_id)).await;
            info!(user_id, claim_id, action = action.as_str(), resolved, "Actions resolved");
        }
        Ok(resolved)
    }

    /// Resolve, logging instead of failing
    pub async fn resolve_best_effort(&self, user_id: &str, claim_id: &str, action: ActionRequired) {
        if let Err(e) = self.resolve(user_id, claim_id, action).await {
            warn!(user_id, claim_id, action = action.as_str(), error = %e, "Failed to resolve actions");
        }
    }
}
