//! Subscription bookkeeping: active handlers, in-flight subscribe acks,
//! and the metadata needed to replay subscriptions after a reconnect.

use std::collections::HashMap;

use tokio::sync::oneshot;

use clobfeed_protocol::Channel;

use crate::error::FeedError;

/// Handler for data frames delivered on a channel.
pub(crate) type MessageHandler = Box<dyn Fn(serde_json::Value) + Send + Sync>;
/// Handler for channel-level errors.
pub(crate) type ErrorHandler = Box<dyn Fn(FeedError) + Send + Sync>;
/// Handler invoked exactly once when a subscription ends.
pub(crate) type CompleteHandler = Box<dyn Fn() + Send + Sync>;

/// A live subscription and its handler triple.
///
/// Handlers are created once at `subscribe` time and survive reconnects;
/// only the registry entry is recreated.
pub(crate) struct ActiveSubscription {
    pub(crate) channel: Channel,
    pub(crate) on_message: MessageHandler,
    pub(crate) on_error: ErrorHandler,
    pub(crate) on_complete: CompleteHandler,
}

/// What is needed to replay a `subscribe` after a reconnect.
#[derive(Debug, Clone)]
pub(crate) struct SubscriptionMeta {
    pub(crate) channel: Channel,
    pub(crate) params: Option<serde_json::Value>,
}

pub(crate) type AckSender = oneshot::Sender<Result<(), FeedError>>;

/// In-memory subscription maps, owned exclusively by the connection.
///
/// The active and meta maps hold the same key set at all times, except
/// inside a resubscribe pass where both are drained and repopulated entry
/// by entry.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    active: HashMap<Channel, ActiveSubscription>,
    pending: HashMap<Channel, AckSender>,
    meta: HashMap<Channel, SubscriptionMeta>,
}

impl SubscriptionRegistry {
    pub(crate) fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Whether the channel has an active subscription or an in-flight
    /// subscribe.
    pub(crate) fn is_tracked(&self, channel: Channel) -> bool {
        self.active.contains_key(&channel) || self.pending.contains_key(&channel)
    }

    /// Claims the pending slot for a subscribe request. A channel that is
    /// already pending or active is rejected without touching the maps.
    pub(crate) fn claim_pending(
        &mut self,
        channel: Channel,
        ack: AckSender,
    ) -> Result<(), FeedError> {
        if self.is_tracked(channel) {
            return Err(FeedError::AlreadySubscribed(channel));
        }
        self.pending.insert(channel, ack);
        Ok(())
    }

    pub(crate) fn take_pending(&mut self, channel: Channel) -> Option<AckSender> {
        self.pending.remove(&channel)
    }

    /// Rejects every in-flight subscribe. The error is built fresh per
    /// pending entry.
    pub(crate) fn reject_all_pending(&mut self, mut err: impl FnMut() -> FeedError) {
        for (_, ack) in self.pending.drain() {
            let _ = ack.send(Err(err()));
        }
    }

    /// Promotes an acked subscribe to an active entry plus its
    /// resubscription metadata.
    pub(crate) fn insert_active(&mut self, sub: ActiveSubscription, meta: SubscriptionMeta) {
        let channel = sub.channel;
        self.active.insert(channel, sub);
        self.meta.insert(channel, meta);
    }

    pub(crate) fn get_active(&self, channel: Channel) -> Option<&ActiveSubscription> {
        self.active.get(&channel)
    }

    /// Removes a channel entirely, returning its subscription if present.
    pub(crate) fn remove(&mut self, channel: Channel) -> Option<ActiveSubscription> {
        self.meta.remove(&channel);
        self.active.remove(&channel)
    }

    /// Drains every active entry, e.g. for exhausted-reconnection cleanup.
    pub(crate) fn drain_active(&mut self) -> Vec<ActiveSubscription> {
        self.meta.clear();
        self.active.drain().map(|(_, sub)| sub).collect()
    }

    /// Takes everything needed for a resubscribe pass: each channel's
    /// metadata paired with its original subscription. Both maps are
    /// cleared; entries are re-inserted one by one as their acks arrive.
    pub(crate) fn take_for_resubscribe(&mut self) -> Vec<(SubscriptionMeta, ActiveSubscription)> {
        let mut entries = Vec::with_capacity(self.meta.len());
        for (channel, meta) in self.meta.drain() {
            if let Some(sub) = self.active.remove(&channel) {
                entries.push((meta, sub));
            }
        }
        self.active.clear();
        entries
    }
}
