// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! A trie keyed by topic-filter levels, supporting the MQTT wildcards `+`
//! (single level) and `#` (multi-level) and transactional mutation so a
//! concurrent publish dispatch never observes a half-applied subscribe.

use std::collections::HashMap;

use mqtt_codec::QoS;

/// A subscriber's callback and opaque user data, released by `cleanup` on
/// overwrite, removal, or tree teardown.
struct Subscription {
    qos: QoS,
    callback: Box<dyn FnMut(&str, &[u8], &mut dyn std::any::Any) + Send>,
    user: Box<dyn std::any::Any + Send>,
    cleanup: Box<dyn FnOnce(&mut dyn std::any::Any) + Send>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // `cleanup` is an `FnOnce`; take a no-op stand-in so `Drop` (which
        // only gets `&mut self`) can still call it exactly once.
        let cleanup = std::mem::replace(&mut self.cleanup, Box::new(|_| {}));
        cleanup(self.user.as_mut());
    }
}

#[derive(Default)]
struct TopicNode {
    children: HashMap<String, TopicNode>,
    subscription: Option<Subscription>,
}

impl TopicNode {
    fn is_empty(&self) -> bool {
        self.subscription.is_none() && self.children.is_empty()
    }
}

/// A pending mutation recorded by [`TopicTree::insert`]/[`TopicTree::remove`]
/// until [`TopicTree::commit`] applies it.
enum PendingAction {
    Insert {
        filter: String,
        qos: QoS,
        callback: Box<dyn FnMut(&str, &[u8], &mut dyn std::any::Any) + Send>,
        user: Box<dyn std::any::Any + Send>,
        cleanup: Box<dyn FnOnce(&mut dyn std::any::Any) + Send>,
    },
    Remove {
        filter: String,
    },
}

/// A started-but-not-yet-applied set of subscribe/unsubscribe actions.
///
/// `begin` returns an empty transaction; `insert`/`remove` append to it
/// without touching the tree; `commit` applies every action atomically from
/// the point of view of a concurrent `publish`; `rollback` simply drops the
/// pending actions.
#[derive(Default)]
pub(crate) struct Transaction {
    actions: Vec<PendingAction>,
}

impl Transaction {
    pub(crate) fn insert(
        &mut self,
        filter: &str,
        qos: QoS,
        callback: Box<dyn FnMut(&str, &[u8], &mut dyn std::any::Any) + Send>,
        user: Box<dyn std::any::Any + Send>,
        cleanup: Box<dyn FnOnce(&mut dyn std::any::Any) + Send>,
    ) {
        self.actions.push(PendingAction::Insert {
            filter: filter.to_string(),
            qos,
            callback,
            user,
            cleanup,
        });
    }

    pub(crate) fn remove(&mut self, filter: &str) {
        self.actions.push(PendingAction::Remove {
            filter: filter.to_string(),
        });
    }
}

/// The subscription routing tree.
#[derive(Default)]
pub(crate) struct TopicTree {
    root: TopicNode,
}

impl TopicTree {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin() -> Transaction {
        Transaction::default()
    }

    /// Applies every action in `txn` atomically: from the perspective of a
    /// concurrent `publish_dispatch`, either all actions are visible or none
    /// are, since both run on the same single-threaded event loop and this
    /// call does not yield between actions.
    pub(crate) fn commit(&mut self, txn: Transaction) {
        for action in txn.actions {
            match action {
                PendingAction::Insert {
                    filter,
                    qos,
                    callback,
                    user,
                    cleanup,
                } => self.apply_insert(&filter, qos, callback, user, cleanup),
                PendingAction::Remove { filter } => self.apply_remove(&filter),
            }
        }
    }

    /// Directly inserts a subscription without a transaction, for callers
    /// that only ever perform one mutation per call (the common case).
    pub(crate) fn insert(
        &mut self,
        filter: &str,
        qos: QoS,
        callback: Box<dyn FnMut(&str, &[u8], &mut dyn std::any::Any) + Send>,
        user: Box<dyn std::any::Any + Send>,
        cleanup: Box<dyn FnOnce(&mut dyn std::any::Any) + Send>,
    ) {
        self.apply_insert(filter, qos, callback, user, cleanup);
    }

    /// Directly removes a subscription without a transaction.
    pub(crate) fn remove(&mut self, filter: &str) {
        self.apply_remove(filter);
    }

    fn apply_insert(
        &mut self,
        filter: &str,
        qos: QoS,
        callback: Box<dyn FnMut(&str, &[u8], &mut dyn std::any::Any) + Send>,
        user: Box<dyn std::any::Any + Send>,
        cleanup: Box<dyn FnOnce(&mut dyn std::any::Any) + Send>,
    ) {
        let mut node = &mut self.root;
        for level in filter.split('/') {
            node = node.children.entry(level.to_string()).or_default();
        }
        // Overwriting an existing subscription runs its cleanup first,
        // releasing the old `user` before the new one takes its place.
        node.subscription = Some(Subscription {
            qos,
            callback,
            user,
            cleanup,
        });
    }

    fn apply_remove(&mut self, filter: &str) {
        Self::remove_recursive(&mut self.root, filter.split('/'));
    }

    /// Descends one level at a time, then unwinds, pruning any node left
    /// with no subscription and no children.
    fn remove_recursive<'a>(node: &mut TopicNode, mut levels: impl Iterator<Item = &'a str>) {
        match levels.next() {
            None => {
                node.subscription = None;
            }
            Some(level) => {
                let mut prune = false;
                if let Some(child) = node.children.get_mut(level) {
                    Self::remove_recursive(child, levels);
                    prune = child.is_empty();
                }
                if prune {
                    node.children.remove(level);
                }
            }
        }
    }

    /// Dispatches a concrete topic (no wildcards) to every matching
    /// subscription, each exactly once.
    ///
    /// At each node visited while walking the topic level-by-level, children
    /// are explored in the order exact segment, `+`, `#`; a `#` child always
    /// fires (it matches zero or more trailing levels, so it is checked
    /// before consuming the rest of the topic, not only at the end of it).
    pub(crate) fn publish(&mut self, topic: &str, payload: &[u8]) {
        let levels: Vec<&str> = topic.split('/').collect();
        Self::publish_at(&mut self.root, &levels, topic, payload);
    }

    fn publish_at(node: &mut TopicNode, levels: &[&str], topic: &str, payload: &[u8]) {
        if let Some(hash_child) = node.children.get_mut("#") {
            Self::fire(hash_child, topic, payload);
        }
        match levels.split_first() {
            None => Self::fire(node, topic, payload),
            Some((level, rest)) => {
                if let Some(child) = node.children.get_mut(*level) {
                    Self::publish_at(child, rest, topic, payload);
                }
                if let Some(child) = node.children.get_mut("+") {
                    Self::publish_at(child, rest, topic, payload);
                }
            }
        }
    }

    fn fire(node: &mut TopicNode, topic: &str, payload: &[u8]) {
        if let Some(sub) = node.subscription.as_mut() {
            (sub.callback)(topic, payload, sub.user.as_mut());
        }
    }

    #[cfg(test)]
    fn subscription_qos(&self, filter: &str) -> Option<QoS> {
        let mut node = &self.root;
        for level in filter.split('/') {
            node = node.children.get(level)?;
        }
        node.subscription.as_ref().map(|s| s.qos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_sub(counter: Arc<AtomicUsize>) -> (
        Box<dyn FnMut(&str, &[u8], &mut dyn std::any::Any) + Send>,
        Box<dyn std::any::Any + Send>,
        Box<dyn FnOnce(&mut dyn std::any::Any) + Send>,
    ) {
        let cb_counter = counter.clone();
        let callback = Box::new(move |_topic: &str, _payload: &[u8], _user: &mut dyn std::any::Any| {
            cb_counter.fetch_add(1, Ordering::SeqCst);
        });
        let user: Box<dyn std::any::Any + Send> = Box::new(());
        let cleanup = Box::new(|_: &mut dyn std::any::Any| {});
        (callback, user, cleanup)
    }

    #[test]
    fn exact_match_dispatches() {
        let mut tree = TopicTree::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let (cb, user, cleanup) = counting_sub(counter.clone());
        tree.insert("a/b", QoS::AtMostOnce, cb, user, cleanup);

        tree.publish("a/b", b"hi");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tree.publish("a/c", b"hi");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn single_level_wildcard_matches_one_level() {
        let mut tree = TopicTree::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let (cb, user, cleanup) = counting_sub(counter.clone());
        tree.insert("sensors/+/temp", QoS::AtMostOnce, cb, user, cleanup);

        tree.publish("sensors/5/temp", b"20");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tree.publish("sensors/5/humid", b"40");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn multi_level_wildcard_matches_all_depths() {
        let mut tree = TopicTree::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let (cb, user, cleanup) = counting_sub(counter.clone());
        tree.insert("a/#", QoS::AtMostOnce, cb, user, cleanup);

        tree.publish("a", b"1");
        tree.publish("a/b", b"2");
        tree.publish("a/b/c", b"3");
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        tree.publish("b", b"4");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn reinserting_same_filter_replaces_subscription() {
        let mut tree = TopicTree::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let (cb1, user1, cleanup1) = counting_sub(counter.clone());
        tree.insert("a/b", QoS::AtMostOnce, cb1, user1, cleanup1);
        let (cb2, user2, cleanup2) = counting_sub(counter.clone());
        tree.insert("a/b", QoS::AtLeastOnce, cb2, user2, cleanup2);

        tree.publish("a/b", b"hi");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(tree.subscription_qos("a/b"), Some(QoS::AtLeastOnce));
    }

    #[test]
    fn balanced_insert_remove_leaves_no_callbacks() {
        let mut tree = TopicTree::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let (cb, user, cleanup) = counting_sub(counter.clone());
        tree.insert("a/b/c", QoS::AtMostOnce, cb, user, cleanup);
        tree.remove("a/b/c");

        tree.publish("a/b/c", b"hi");
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(tree.root.is_empty());
    }

    #[test]
    fn empty_intermediate_segment_is_legal() {
        let mut tree = TopicTree::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let (cb, user, cleanup) = counting_sub(counter.clone());
        tree.insert("a//b", QoS::AtMostOnce, cb, user, cleanup);

        tree.publish("a//b", b"hi");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transaction_is_invisible_until_commit() {
        let mut tree = TopicTree::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let (cb, user, cleanup) = counting_sub(counter.clone());

        let mut txn = TopicTree::begin();
        txn.insert("a/b", QoS::AtMostOnce, cb, user, cleanup);
        tree.publish("a/b", b"hi");
        assert_eq!(counter.load(Ordering::SeqCst), 0, "uncommitted txn must not be visible");

        tree.commit(txn);
        tree.publish("a/b", b"hi");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rollback_discards_pending_actions() {
        let mut tree = TopicTree::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let (cb, user, cleanup) = counting_sub(counter);

        let mut txn = TopicTree::begin();
        txn.insert("a/b", QoS::AtMostOnce, cb, user, cleanup);
        drop(txn); // rollback

        tree.publish("a/b", b"hi");
        assert!(tree.root.is_empty());
    }
}
