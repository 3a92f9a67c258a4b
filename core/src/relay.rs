//! Mutation event relay (spec §4.3): every hashed object lazily exposes an event source keyed
//! by the literal path to each direct subobject. Relays chain parent to child so an observer
//! attached anywhere in the tree sees mutation events bubbling up from any descendant, the same
//! way `meshgraph_stream::FilteredSource` subscribes to its upstream only while it has
//! consumers of its own.
use meshgraph_stream::{AsyncStreamSource, BufferedAsyncStream};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// One mutation notification. `path` is the dot-separated field path from the relay an
/// observer subscribed to down to the subobject that actually emitted it; empty when the event
/// was emitted by the relay's own object rather than cascaded up from a child.
#[derive(Clone, Debug)]
pub struct MutationEvent {
    pub path: String,
    pub description: String,
}

struct ChildLink {
    relay: Arc<MutationEventRelay>,
    subscription: Option<u64>,
}

/// An object's mutation event relay. Own events (`emit`) always go out; a child relay attached
/// via `attach_child` only has its events forwarded (with its field path prepended) while
/// `cascade_mutable_content_events` is set and this relay has at least one subscriber of its
/// own — mirroring `FilteredSource`'s lazy upstream subscription.
pub struct MutationEventRelay {
    own: AsyncStreamSource<MutationEvent>,
    cascade_mutable_content_events: Mutex<bool>,
    children: Mutex<HashMap<String, ChildLink>>,
    /// Whether `subscribe` has ever been called: once true, newly attached children are
    /// subscribed to immediately rather than waiting for the next `subscribe` call, mirroring
    /// `FilteredSource`'s "subscribe upstream on first downstream subscriber" behavior.
    active: Mutex<bool>,
}

impl MutationEventRelay {
    /// A relay retaining at most `max_buffer_size` events, with content-event cascading set to
    /// `cascade_mutable_content_events` initially.
    pub fn new(max_buffer_size: usize, cascade_mutable_content_events: bool) -> Arc<Self> {
        Arc::new(Self {
            own: AsyncStreamSource::new(max_buffer_size),
            cascade_mutable_content_events: Mutex::new(cascade_mutable_content_events),
            children: Mutex::new(HashMap::new()),
            active: Mutex::new(false),
        })
    }

    /// Attaches a new consumer. On the first call, also lazily subscribes to every attached
    /// child relay if cascading is on.
    pub fn subscribe(self: &Arc<Self>) -> BufferedAsyncStream<MutationEvent> {
        *self.active.lock() = true;
        self.ensure_children_subscribed();
        BufferedAsyncStream::new(&self.own)
    }

    /// Call after a consumer obtained from `subscribe` is dropped, so a relay with no
    /// subscribers left can detach from its children.
    pub fn on_consumer_detached(self: &Arc<Self>) {
        self.maybe_unsubscribe_children();
    }

    pub fn subscriber_count(&self) -> usize {
        self.own.subscriber_count()
    }

    /// Emits an event for a mutation of this object itself (`path` left empty).
    pub fn emit(&self, description: impl Into<String>) {
        self.own.push(MutationEvent {
            path: String::new(),
            description: description.into(),
        });
    }

    /// Enables or disables propagation of children's events. Toggling off unsubscribes from
    /// every attached child immediately; toggling on subscribes to them if this relay already
    /// has subscribers.
    pub fn set_cascade_mutable_content_events(self: &Arc<Self>, cascade: bool) {
        *self.cascade_mutable_content_events.lock() = cascade;
        if cascade {
            self.ensure_children_subscribed();
        } else {
            self.unsubscribe_all_children();
        }
    }

    /// Wires `child`'s relay in at `field_path`: once subscribed, every event `child` emits (or
    /// itself cascades up from its own children) reappears here with `field_path` prepended to
    /// its path. Re-attaching the same `field_path` replaces the previous link.
    pub fn attach_child(self: &Arc<Self>, field_path: &str, child: Arc<MutationEventRelay>) {
        self.detach_child(field_path);
        let should_subscribe =
            *self.cascade_mutable_content_events.lock() && *self.active.lock();
        let subscription = if should_subscribe {
            Some(Self::subscribe_to_child(&self.own, field_path, &child))
        } else {
            None
        };
        self.children.lock().insert(
            field_path.to_string(),
            ChildLink {
                relay: child,
                subscription,
            },
        );
    }

    /// Detaches whatever relay is attached at `field_path`, if any.
    pub fn detach_child(&self, field_path: &str) {
        if let Some(link) = self.children.lock().remove(field_path) {
            if let Some(id) = link.subscription {
                link.relay.own.unsubscribe_new_item(id);
            }
        }
    }

    /// Subscribes to `child` as a relay consumer would (not just a raw `AsyncStreamSource`
    /// callback): this recursively marks `child` active and wires up *its* children too, so a
    /// chain of relays with no consumer of their own still forwards all the way to the root
    /// once the root gets its first subscriber.
    fn subscribe_to_child(
        own: &AsyncStreamSource<MutationEvent>,
        field_path: &str,
        child: &Arc<MutationEventRelay>,
    ) -> u64 {
        let parent = own.clone();
        let prefix = field_path.to_string();
        child.subscribe_new_item_as_relay_consumer(move |event: &MutationEvent| {
            let path = if event.path.is_empty() {
                prefix.clone()
            } else {
                format!("{}.{}", prefix, event.path)
            };
            parent.push(MutationEvent {
                path,
                description: event.description.clone(),
            });
        })
    }

    fn subscribe_new_item_as_relay_consumer(
        self: &Arc<Self>,
        cb: impl Fn(&MutationEvent) + Send + Sync + 'static,
    ) -> u64 {
        *self.active.lock() = true;
        self.ensure_children_subscribed();
        self.own.subscribe_new_item(cb)
    }

    fn ensure_children_subscribed(self: &Arc<Self>) {
        if !*self.cascade_mutable_content_events.lock() {
            return;
        }
        let mut children = self.children.lock();
        for (field_path, link) in children.iter_mut() {
            if link.subscription.is_none() {
                link.subscription = Some(Self::subscribe_to_child(&self.own, field_path, &link.relay));
            }
        }
    }

    fn maybe_unsubscribe_children(&self) {
        if self.own.subscriber_count() > 0 {
            return;
        }
        *self.active.lock() = false;
        self.unsubscribe_all_children();
    }

    fn unsubscribe_all_children(&self) {
        let mut children = self.children.lock();
        for link in children.values_mut() {
            if let Some(id) = link.subscription.take() {
                link.relay.own.unsubscribe_new_item(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_sees_own_events() {
        let relay = MutationEventRelay::new(8, true);
        let consumer = relay.subscribe();
        relay.emit("changed");
        assert_eq!(consumer.next_if_available().unwrap().path, "");
    }

    #[test]
    fn child_events_cascade_up_with_prefixed_path() {
        let parent = MutationEventRelay::new(8, true);
        let child = MutationEventRelay::new(8, true);
        parent.attach_child("leaf", child.clone());

        let consumer = parent.subscribe();
        child.emit("leaf changed");

        let event = consumer.next_if_available().unwrap();
        assert_eq!(event.path, "leaf");
        assert_eq!(event.description, "leaf changed");
    }

    #[test]
    fn grandchild_events_carry_the_full_path() {
        let root = MutationEventRelay::new(8, true);
        let mid = MutationEventRelay::new(8, true);
        let leaf = MutationEventRelay::new(8, true);
        mid.attach_child("leaf", leaf.clone());
        root.attach_child("mid", mid.clone());

        let consumer = root.subscribe();
        leaf.emit("deep change");

        let event = consumer.next_if_available().unwrap();
        assert_eq!(event.path, "mid.leaf");
    }

    #[test]
    fn cascade_toggle_off_suppresses_child_events() {
        let parent = MutationEventRelay::new(8, false);
        let child = MutationEventRelay::new(8, true);
        parent.attach_child("leaf", child.clone());

        let consumer = parent.subscribe();
        child.emit("ignored while cascade is off");
        assert!(consumer.next_if_available().is_none());

        parent.set_cascade_mutable_content_events(true);
        child.emit("seen once cascade is on");
        assert_eq!(consumer.next_if_available().unwrap().path, "leaf");
    }

    #[test]
    fn relay_subscribes_to_children_lazily() {
        let parent = MutationEventRelay::new(8, true);
        let child = MutationEventRelay::new(8, true);
        parent.attach_child("leaf", child.clone());
        assert_eq!(child.subscriber_count(), 0);

        let consumer = parent.subscribe();
        assert_eq!(child.subscriber_count(), 1);

        drop(consumer);
        parent.on_consumer_detached();
        assert_eq!(child.subscriber_count(), 0);
    }
}
