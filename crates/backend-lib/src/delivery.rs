// ============================
// crates/backend-lib/src/delivery.rs
// ============================
//! Delivery engine: persist, resolve recipients, push.
//!
//! Every delivery persists first. A persistence error aborts the delivery
//! and is returned to the caller; nothing is pushed. Once the message is
//! stored, pushes are best effort: an offline recipient is skipped, and a
//! failed or timed-out push is logged and counted without affecting the
//! other recipients. The message stays visible through history either way.
use crate::config::{LimitSettings, Settings};
use crate::connection::ConnectionHandle;
use crate::directory::IdentityDirectory;
use crate::error::AppError;
use crate::storage::Storage;
use crate::validation;
use chat_relay_common::{MessageDraft, MessageId, PopulatedMessage, ServerToClient, UserId};
use metrics::{counter, histogram};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Outcome of one delivery, counted per resolved recipient slot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub message_id: MessageId,
    /// Pushes that reached a live connection's queue
    pub delivered: usize,
    /// Recipients with no bound connection
    pub offline: usize,
    /// Pushes to a bound connection that failed or timed out
    pub failed: usize,
}

pub struct DeliveryEngine<S> {
    storage: S,
    directory: Arc<IdentityDirectory>,
    push_timeout: Duration,
    dedupe_channel_recipients: bool,
    limits: LimitSettings,
}

impl<S: Storage + Clone + 'static> DeliveryEngine<S> {
    pub fn new(storage: S, directory: Arc<IdentityDirectory>, settings: &Settings) -> Self {
        Self {
            storage,
            directory,
            push_timeout: settings.delivery.push_timeout(),
            dedupe_channel_recipients: settings.delivery.dedupe_channel_recipients,
            limits: settings.limits.clone(),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn directory(&self) -> &Arc<IdentityDirectory> {
        &self.directory
    }

    /// Persist a direct message and push it to sender and receiver
    pub async fn deliver_direct(&self, draft: MessageDraft) -> Result<DeliveryReport, AppError> {
        let Some(receiver) = draft.scope.receiver().map(str::to_string) else {
            return Err(AppError::Internal(
                "channel message submitted for direct delivery".to_string(),
            ));
        };
        let sender = draft.sender.clone();

        let message = self.persist(draft).await?;
        let message_id = message.id.clone();

        let event = ServerToClient::ReceiveMessage { message };
        let recipients = [sender, receiver];
        let report = self.fan_out(message_id, recipients.iter(), event).await;

        tracing::debug!(
            "Direct message {} delivered={} offline={} failed={}",
            report.message_id,
            report.delivered,
            report.offline,
            report.failed
        );
        Ok(report)
    }

    /// Persist a channel message, record it in the channel, and push it to
    /// every member and then every admin
    pub async fn deliver_channel(&self, draft: MessageDraft) -> Result<DeliveryReport, AppError> {
        let Some(channel_id) = draft.scope.channel_id().map(str::to_string) else {
            return Err(AppError::Internal(
                "direct message submitted for channel delivery".to_string(),
            ));
        };

        // Recipients are resolved up front so a failed read cannot follow
        // a committed message
        let members = self
            .storage
            .get_channel_with_members(&channel_id)
            .await
            .inspect_err(|e| self.record_persist_failure(e))?;
        let message = self.persist(draft).await?;

        let message_id = message.id.clone();
        let event = ServerToClient::ReceiveChannelMessage { message };

        let all = members.members.iter().chain(members.admins.iter());
        let report = if self.dedupe_channel_recipients {
            let mut seen = HashSet::new();
            let distinct: Vec<&UserId> = all.filter(|id| seen.insert(id.as_str())).collect();
            self.fan_out(message_id, distinct.into_iter(), event).await
        } else {
            self.fan_out(message_id, all, event).await
        };

        tracing::debug!(
            "Channel message {} on {} delivered={} offline={} failed={}",
            report.message_id,
            channel_id,
            report.delivered,
            report.offline,
            report.failed
        );
        Ok(report)
    }

    /// Direct-message history between `requester` and `peer`
    pub async fn conversation_history(
        &self,
        requester: &str,
        peer: &str,
    ) -> Result<Vec<PopulatedMessage>, AppError> {
        validation::validate_identity(peer, &self.limits)?;
        self.storage.conversation_history(requester, peer).await
    }

    /// Channel history, readable by members and admins only
    pub async fn channel_history(
        &self,
        requester: &str,
        channel_id: &str,
    ) -> Result<Vec<PopulatedMessage>, AppError> {
        validation::validate_channel_id(channel_id, &self.limits)?;
        let channel = self.storage.get_channel(channel_id).await?;
        if !channel.is_participant(requester) {
            return Err(AppError::Forbidden(format!(
                "{requester} is not in channel {channel_id}"
            )));
        }
        self.storage.channel_history(channel_id).await
    }

    // Profiles are read before the message is committed: once the store
    // succeeds nothing else may fail, or the sender would be told the send
    // failed while history still shows the message.
    async fn store(&self, draft: MessageDraft) -> Result<PopulatedMessage, AppError> {
        validation::validate_draft(&draft, &self.limits)?;

        let sender = self.storage.profile_or_placeholder(&draft.sender).await?;
        let receiver = match draft.scope.receiver() {
            Some(receiver) => Some(self.storage.profile_or_placeholder(receiver).await?),
            None => None,
        };

        let stored = self.storage.store_message(draft).await?;
        if let Some(channel_id) = stored.scope.channel_id() {
            // a failed append leaves the message out of the channel's history
            self.storage
                .append_message_to_channel(channel_id, &stored.id)
                .await?;
        }
        Ok(PopulatedMessage::from_stored(stored, sender, receiver))
    }

    async fn persist(&self, draft: MessageDraft) -> Result<PopulatedMessage, AppError> {
        match self.store(draft).await {
            Ok(message) => {
                counter!(crate::metrics::MESSAGE_PERSISTED).increment(1);
                Ok(message)
            },
            Err(e) => {
                self.record_persist_failure(&e);
                Err(e)
            },
        }
    }

    fn record_persist_failure(&self, e: &AppError) {
        counter!(crate::metrics::DELIVERY_PERSIST_FAILED).increment(1);
        match e {
            AppError::Validation(_) | AppError::ChannelNotFound(_) => {
                tracing::info!("Message rejected: {e}");
            },
            _ => tracing::error!("Failed to persist message: {e}"),
        }
    }

    /// Push `event` to the live handle of every identity in `recipients`.
    ///
    /// Identities are resolved in order; a repeated identity is pushed to
    /// again. Pushes run concurrently and all finish before this returns.
    async fn fan_out<'a>(
        &self,
        message_id: MessageId,
        recipients: impl Iterator<Item = &'a UserId>,
        event: ServerToClient,
    ) -> DeliveryReport {
        let mut report = DeliveryReport {
            message_id,
            ..DeliveryReport::default()
        };

        let mut targets: Vec<(UserId, ConnectionHandle)> = Vec::new();
        for identity in recipients {
            match self.directory.lookup(identity) {
                // transport gone, directory not yet caught up
                Some(handle) if handle.is_closed() => {
                    report.failed += 1;
                    tracing::warn!(
                        "Push of message {} to {identity} failed: connection {} is closed",
                        report.message_id,
                        handle.id()
                    );
                },
                Some(handle) => targets.push((identity.clone(), handle)),
                None => report.offline += 1,
            }
        }

        // Sender and receiver resolving to the same connection get one push
        if matches!(event, ServerToClient::ReceiveMessage { .. }) {
            let mut seen = HashSet::new();
            targets.retain(|(_, handle)| seen.insert(handle.id()));
        }

        histogram!(crate::metrics::DELIVERY_FANOUT_SIZE).record(targets.len() as f64);
        counter!(crate::metrics::DELIVERY_OFFLINE).increment(report.offline as u64);

        let mut pushes = JoinSet::new();
        for (identity, handle) in targets {
            let event = event.clone();
            let timeout = self.push_timeout;
            pushes.spawn(async move {
                let result = handle.push(event, timeout).await;
                (identity, result)
            });
        }

        while let Some(joined) = pushes.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.delivered += 1,
                Ok((identity, Err(e))) => {
                    report.failed += 1;
                    tracing::warn!(
                        "Push of message {} to {identity} failed: {e}",
                        report.message_id
                    );
                },
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!("Push task for message {} aborted: {e}", report.message_id);
                },
            }
        }

        counter!(crate::metrics::DELIVERY_PUSHED).increment(report.delivered as u64);
        counter!(crate::metrics::DELIVERY_PUSH_FAILED).increment(report.failed as u64);
        report
    }
}
