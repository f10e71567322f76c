//! Subscription bookkeeping shared by every provider.
//!
//! The registry owns the master subscription list and a lazily built cache
//! mapping each channel name ever seen to the subscriptions whose pattern
//! accepts it. Providers consult it from their receive paths to decide
//! whether a message is worth queueing, and the dispatch entry drives the
//! callbacks through it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use regex::Regex;

use error::{SubscribeError, UnsubscribeError};

/// Default bound on the number of messages queued per subscription.
pub const DEFAULT_MAX_QUEUED_MESSAGES: i32 = 30;

/// A received message, as seen by a subscription callback.
pub struct RecvBuf<'a> {
    /// The channel the message arrived on.
    pub channel: &'a str,
    /// The message payload.
    pub data: &'a [u8],
    /// Wall-clock microseconds at which the first datagram of the message
    /// was received.
    pub recv_utime: i64,
}

/// The boxed form every subscription callback is stored as.
pub type Callback = Box<dyn FnMut(&RecvBuf) + Send>;

/// One `(pattern, callback)` binding.
pub(crate) struct SubscriptionRecord {
    /// The pattern as the subscriber wrote it.
    channel: String,
    /// The pattern compiled with implicit `^...$` anchors, so a literal
    /// channel name never matches its own prefixes or extensions.
    regex: Regex,
    callback: Mutex<Callback>,
    max_queued: AtomicI32,
    queued: AtomicI32,
    /// Set while a dispatch pass has this record pinned. An unsubscribe
    /// that lands during the callback only defers the removal.
    callback_in_progress: AtomicBool,
    pending_deletion: AtomicBool,
    registry: Weak<Registry>,
}

/// A handle to a live subscription.
///
/// The handle does not own the subscription; it weakly references state
/// owned by the `Lcm` context, so it can be cloned into callbacks (for
/// example to unsubscribe from inside one) without creating cycles.
#[derive(Clone)]
pub struct Subscription {
    record: Weak<SubscriptionRecord>,
}

impl Subscription {
    /// Adjusts the maximum number of received messages that can be queued
    /// up for this subscription. The default is 30; values of zero or less
    /// remove the bound entirely.
    pub fn set_queue_capacity(&self, num_messages: i32) {
        if let Some(record) = self.record.upgrade() {
            record.max_queued.store(num_messages, Ordering::SeqCst);
        }
    }

    /// Removes this subscription from its registry.
    ///
    /// This is the registry-side half of `Lcm::unsubscribe` and is safe to
    /// call from inside the subscription's own callback; the removal is
    /// then deferred until the callback returns. Unlike `Lcm::unsubscribe`
    /// it does not inform the provider, which only matters for providers
    /// that track per-channel interest remotely.
    pub fn unsubscribe(&self) -> Result<(), UnsubscribeError> {
        self.remove_from_registry().map(|_| ())
    }

    pub(crate) fn remove_from_registry(&self) -> Result<String, UnsubscribeError> {
        let record = self.record.upgrade().ok_or(UnsubscribeError::NotFound)?;
        let registry = record.registry.upgrade().ok_or(UnsubscribeError::NotFound)?;
        registry.unsubscribe_record(&record)
    }
}

struct Inner {
    /// Every live subscription, in registration order.
    all: Vec<Arc<SubscriptionRecord>>,
    /// Channel name to the subscriptions matching it, in registration
    /// order. Entries live for the life of the registry.
    by_channel: HashMap<String, Vec<Arc<SubscriptionRecord>>>,
}

impl Inner {
    /// The cached match list for `channel`, built on first sight.
    fn handlers_for(&mut self, channel: &str) -> &Vec<Arc<SubscriptionRecord>> {
        if !self.by_channel.contains_key(channel) {
            let matching = self
                .all
                .iter()
                .filter(|record| record.regex.is_match(channel))
                .cloned()
                .collect();
            self.by_channel.insert(channel.to_string(), matching);
        }
        &self.by_channel[channel]
    }
}

pub(crate) struct Registry {
    inner: Mutex<Inner>,
    /// Handed to each subscription as its way back here.
    self_ref: Weak<Registry>,
}

impl Registry {
    pub fn new() -> Arc<Registry> {
        Arc::new_cyclic(|self_ref| Registry {
            inner: Mutex::new(Inner {
                all: Vec::new(),
                by_channel: HashMap::new(),
            }),
            self_ref: self_ref.clone(),
        })
    }

    /// Registers a callback for every channel matching `channel`.
    ///
    /// The pattern is a regular expression, implicitly surrounded by '^'
    /// and '$'.
    pub fn subscribe(
        &self,
        channel: &str,
        callback: Callback,
    ) -> Result<Subscription, SubscribeError> {
        let regex = Regex::new(&format!("^{}$", channel))?;

        let record = Arc::new(SubscriptionRecord {
            channel: channel.to_string(),
            regex,
            callback: Mutex::new(callback),
            max_queued: AtomicI32::new(DEFAULT_MAX_QUEUED_MESSAGES),
            queued: AtomicI32::new(0),
            callback_in_progress: AtomicBool::new(false),
            pending_deletion: AtomicBool::new(false),
            registry: self.self_ref.clone(),
        });

        let mut inner = self.inner.lock().unwrap();
        for (name, matching) in inner.by_channel.iter_mut() {
            if record.regex.is_match(name) {
                matching.push(record.clone());
            }
        }
        let subscription = Subscription {
            record: Arc::downgrade(&record),
        };
        inner.all.push(record);

        Ok(subscription)
    }

    /// Removes a subscription from the master list and every cached match
    /// list. If the subscription's callback is currently executing, the
    /// record is only marked; the running dispatch pass finishes the
    /// removal.
    pub(crate) fn unsubscribe_record(
        &self,
        record: &Arc<SubscriptionRecord>,
    ) -> Result<String, UnsubscribeError> {
        let mut inner = self.inner.lock().unwrap();

        let position = inner
            .all
            .iter()
            .position(|other| Arc::ptr_eq(other, record));
        let position = match position {
            Some(p) => p,
            None => return Err(UnsubscribeError::NotFound),
        };

        inner.all.remove(position);
        for matching in inner.by_channel.values_mut() {
            matching.retain(|other| !Arc::ptr_eq(other, record));
        }

        if record.callback_in_progress.load(Ordering::SeqCst) {
            record.pending_deletion.store(true, Ordering::SeqCst);
        }

        Ok(record.channel.clone())
    }

    /// True if any subscription matches `channel`.
    pub fn has_handlers(&self, channel: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        !inner.handlers_for(channel).is_empty()
    }

    /// Offers a message on `channel` to every matching subscription.
    ///
    /// Each subscription with room in its queue accepts the message and
    /// has its queued count bumped; the matching dispatch call later pays
    /// the count back down. Returns true if at least one subscription
    /// accepted.
    pub fn try_enqueue_message(&self, channel: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let mut num_keepers = 0;
        for record in inner.handlers_for(channel) {
            let max_queued = record.max_queued.load(Ordering::SeqCst);
            if record.queued.load(Ordering::SeqCst) < max_queued || max_queued <= 0 {
                record.queued.fetch_add(1, Ordering::SeqCst);
                num_keepers += 1;
            }
        }
        num_keepers > 0
    }

    /// Runs the callbacks subscribed to `channel`.
    ///
    /// The snapshot taken up front is pinned via `callback_in_progress`,
    /// so a concurrent unsubscribe can only defer. The registry lock is
    /// released for the duration of each callback; callbacks are free to
    /// subscribe, unsubscribe, and publish.
    pub fn dispatch(&self, channel: &str, data: &[u8], recv_utime: i64) {
        let mut inner = self.inner.lock().unwrap();

        // Snapshot so that subscriptions added during the callbacks are
        // not iterated over.
        let handlers: Vec<Arc<SubscriptionRecord>> = inner.handlers_for(channel).clone();
        for record in &handlers {
            record.callback_in_progress.store(true, Ordering::SeqCst);
        }

        for record in &handlers {
            if record.pending_deletion.load(Ordering::SeqCst) {
                continue;
            }
            // Publishes that found this queue full were dropped for this
            // subscriber at enqueue time; a zero count here means there is
            // nothing owed to it.
            if record.queued.load(Ordering::SeqCst) <= 0 {
                continue;
            }
            record.queued.fetch_sub(1, Ordering::SeqCst);

            drop(inner);
            {
                let rbuf = RecvBuf {
                    channel,
                    data,
                    recv_utime,
                };
                let mut callback = record.callback.lock().unwrap();
                (&mut *callback)(&rbuf);
            }
            inner = self.inner.lock().unwrap();
        }

        let mut condemned = Vec::new();
        for record in &handlers {
            record.callback_in_progress.store(false, Ordering::SeqCst);
            if record.pending_deletion.load(Ordering::SeqCst) {
                condemned.push(record.clone());
            }
        }
        for record in &condemned {
            inner.all.retain(|other| !Arc::ptr_eq(other, record));
            for matching in inner.by_channel.values_mut() {
                matching.retain(|other| !Arc::ptr_eq(other, record));
            }
        }
    }

    /// Number of live subscriptions.
    #[cfg(test)]
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().unwrap().all.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> Callback {
        let counter = counter.clone();
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn literal_channels_are_anchored() {
        let registry = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.subscribe("POS", counting_callback(&hits)).unwrap();

        assert!(registry.has_handlers("POS"));
        assert!(!registry.has_handlers("POSITION"));
        assert!(!registry.has_handlers("GPS_POS"));
    }

    #[test]
    fn regex_patterns_match_whole_names() {
        let registry = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry
            .subscribe("ROBOT_.*", counting_callback(&hits))
            .unwrap();

        assert!(registry.has_handlers("ROBOT_A"));
        assert!(registry.has_handlers("ROBOT_STATUS"));
        assert!(!registry.has_handlers("OTHER"));
        assert!(!registry.has_handlers("A_ROBOT_B"));
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        let registry = Registry::new();
        let result = registry.subscribe("BAD[", Box::new(|_| {}));
        match result {
            Err(SubscribeError::InvalidRegex(_)) => {}
            _ => panic!("expected an invalid regex error"),
        }
    }

    #[test]
    fn cache_is_updated_on_late_subscribe() {
        let registry = Registry::new();
        // Populate the cache for this channel before anyone matches it.
        assert!(!registry.has_handlers("LATE"));

        let hits = Arc::new(AtomicUsize::new(0));
        registry
            .subscribe("LATE", counting_callback(&hits))
            .unwrap();
        assert!(registry.has_handlers("LATE"));
    }

    #[test]
    fn bounded_queue_refuses_at_capacity() {
        let registry = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let subscription = registry
            .subscribe("FOO", counting_callback(&hits))
            .unwrap();
        subscription.set_queue_capacity(2);

        assert!(registry.try_enqueue_message("FOO"));
        assert!(registry.try_enqueue_message("FOO"));
        // The queue is at capacity; nobody accepts the third message.
        assert!(!registry.try_enqueue_message("FOO"));

        registry.dispatch("FOO", b"x", 0);
        registry.dispatch("FOO", b"x", 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // Both accepted messages were delivered, so there is room again.
        assert!(registry.try_enqueue_message("FOO"));
    }

    #[test]
    fn unbounded_queue_always_accepts() {
        let registry = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let subscription = registry
            .subscribe("FOO", counting_callback(&hits))
            .unwrap();
        subscription.set_queue_capacity(0);

        for _ in 0..100 {
            assert!(registry.try_enqueue_message("FOO"));
        }
    }

    #[test]
    fn dispatch_without_enqueue_is_a_no_op() {
        let registry = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.subscribe("FOO", counting_callback(&hits)).unwrap();

        registry.dispatch("FOO", b"x", 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscribers_fire_in_registration_order() {
        let registry = Registry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let order = order.clone();
            registry
                .subscribe(
                    "SEQ",
                    Box::new(move |_| {
                        order.lock().unwrap().push(id);
                    }),
                )
                .unwrap();
        }

        registry.try_enqueue_message("SEQ");
        registry.dispatch("SEQ", b"x", 0);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn unsubscribe_from_inside_callback_is_deferred() {
        let registry = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let subscription = {
            let hits = hits.clone();
            let slot = slot.clone();
            registry
                .subscribe(
                    "SELF",
                    Box::new(move |_| {
                        hits.fetch_add(1, Ordering::SeqCst);
                        let handle = slot.lock().unwrap().take().unwrap();
                        handle.unsubscribe().unwrap();
                    }),
                )
                .unwrap()
        };
        *slot.lock().unwrap() = Some(subscription.clone());

        registry.try_enqueue_message("SELF");
        registry.dispatch("SELF", b"x", 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.subscription_count(), 0);

        // The subscription is gone; nothing accepts or fires now.
        assert!(!registry.try_enqueue_message("SELF"));
        registry.dispatch("SELF", b"x", 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // A second unsubscribe reports the handle as unknown.
        assert!(subscription.unsubscribe().is_err());
    }

    #[test]
    fn subscribing_from_inside_a_callback_works() {
        let registry = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        {
            let registry_handle = Arc::downgrade(&registry);
            let hits = hits.clone();
            registry
                .subscribe(
                    "TRIGGER",
                    Box::new(move |_| {
                        let registry = registry_handle.upgrade().unwrap();
                        let hits = hits.clone();
                        registry
                            .subscribe(
                                "NESTED",
                                Box::new(move |_| {
                                    hits.fetch_add(1, Ordering::SeqCst);
                                }),
                            )
                            .unwrap();
                    }),
                )
                .unwrap();
        }

        registry.try_enqueue_message("TRIGGER");
        registry.dispatch("TRIGGER", b"x", 0);
        assert_eq!(registry.subscription_count(), 2);

        registry.try_enqueue_message("NESTED");
        registry.dispatch("NESTED", b"x", 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
