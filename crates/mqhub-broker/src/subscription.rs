//! Subscription directory with trie-based topic matching.
//!
//! Every trie node carries its own locks, so writers on unrelated branches
//! never contend and readers only ever hold one node lock at a time:
//! children are cloned out from under a read lock before descending.
//!
//! Nodes left empty by a removal are pruned bottom-up. Pruning marks the node
//! `retired` while holding its locks; an insert that lands on a retired node
//! starts over from the root, so no insert is lost to a concurrent prune.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use mqhub_core::topic::{MULTI_LEVEL_WILDCARD, SEPARATOR, SINGLE_LEVEL_WILDCARD};
use mqhub_core::QoS;
use parking_lot::RwLock;

/// A matched subscriber: one per client, at its highest matching QoS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub client_id: Arc<str>,
    pub qos: QoS,
}

/// One level of a topic filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    SingleLevel,
    MultiLevel,
}

impl<'a> Segment<'a> {
    fn parse(level: &'a str) -> Self {
        match level {
            SINGLE_LEVEL_WILDCARD => Segment::SingleLevel,
            MULTI_LEVEL_WILDCARD => Segment::MultiLevel,
            literal => Segment::Literal(literal),
        }
    }
}

fn segments(filter: &str) -> impl Iterator<Item = Segment<'_>> {
    filter.split(SEPARATOR).map(Segment::parse)
}

#[derive(Default)]
struct Children {
    literal: AHashMap<Box<str>, Arc<TrieNode>>,
    single: Option<Arc<TrieNode>>,
    multi: Option<Arc<TrieNode>>,
}

impl Children {
    fn get(&self, segment: Segment<'_>) -> Option<&Arc<TrieNode>> {
        match segment {
            Segment::Literal(level) => self.literal.get(level),
            Segment::SingleLevel => self.single.as_ref(),
            Segment::MultiLevel => self.multi.as_ref(),
        }
    }

    fn get_or_insert(&mut self, segment: Segment<'_>) -> Arc<TrieNode> {
        let slot = match segment {
            Segment::Literal(level) => {
                return self
                    .literal
                    .entry(Box::from(level))
                    .or_default()
                    .clone();
            }
            Segment::SingleLevel => &mut self.single,
            Segment::MultiLevel => &mut self.multi,
        };
        slot.get_or_insert_with(Default::default).clone()
    }

    fn remove(&mut self, segment: Segment<'_>) {
        match segment {
            Segment::Literal(level) => {
                self.literal.remove(level);
            }
            Segment::SingleLevel => self.single = None,
            Segment::MultiLevel => self.multi = None,
        }
    }

    fn is_empty(&self) -> bool {
        self.literal.is_empty() && self.single.is_none() && self.multi.is_none()
    }
}

#[derive(Default)]
struct TrieNode {
    children: RwLock<Children>,
    /// client id -> granted QoS for the filter ending at this node.
    subscribers: RwLock<AHashMap<Arc<str>, QoS>>,
    /// Set once the node has been unlinked from its parent.
    retired: AtomicBool,
}

impl TrieNode {
    #[inline]
    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn child(&self, segment: Segment<'_>) -> Option<Arc<TrieNode>> {
        self.children.read().get(segment).cloned()
    }

    /// Existing child, or a new one. `None` if this node was retired.
    fn child_or_insert(&self, segment: Segment<'_>) -> Option<Arc<TrieNode>> {
        if let Some(child) = self.child(segment) {
            return Some(child);
        }
        let mut children = self.children.write();
        if self.is_retired() {
            return None;
        }
        Some(children.get_or_insert(segment))
    }

    fn merge_subscribers_into(&self, out: &mut AHashMap<Arc<str>, QoS>) {
        for (client_id, &qos) in self.subscribers.read().iter() {
            out.entry(client_id.clone())
                .and_modify(|best| *best = (*best).max(qos))
                .or_insert(qos);
        }
    }

    fn collect(&self, levels: &[&str], at_root: bool, out: &mut AHashMap<Arc<str>, QoS>) {
        // Wildcards at the first level never match `$` topics.
        let skip_wildcards = at_root && levels.first().is_some_and(|l| l.starts_with('$'));

        let (multi, single, literal) = {
            let children = self.children.read();
            (
                children.multi.clone(),
                children.single.clone(),
                levels
                    .first()
                    .and_then(|level| children.literal.get(*level).cloned()),
            )
        };

        // `#` also matches the parent level.
        if !skip_wildcards {
            if let Some(multi) = multi {
                multi.merge_subscribers_into(out);
            }
        }

        let Some((_, rest)) = levels.split_first() else {
            self.merge_subscribers_into(out);
            return;
        };

        if !skip_wildcards {
            if let Some(single) = single {
                single.collect(rest, false, out);
            }
        }
        if let Some(literal) = literal {
            literal.collect(rest, false, out);
        }
    }
}

/// Concurrent topic-filter → subscriber index.
///
/// Safe for any mix of concurrent [`add`](Self::add), [`remove`](Self::remove)
/// and [`matches`](Self::matches). Filters are assumed to be syntactically
/// valid; callers validate them first.
pub struct SubscriptionDirectory {
    root: Arc<TrieNode>,
    count: AtomicUsize,
}

impl SubscriptionDirectory {
    pub fn new() -> Self {
        Self {
            root: Arc::new(TrieNode::default()),
            count: AtomicUsize::new(0),
        }
    }

    /// Insert or replace the subscription of `client_id` to `filter`.
    ///
    /// Returns `true` if it was new, `false` if an existing QoS was replaced.
    pub fn add(&self, filter: &str, client_id: &str, qos: QoS) -> bool {
        'retry: loop {
            let mut node = self.root.clone();
            for segment in segments(filter) {
                match node.child_or_insert(segment) {
                    Some(child) => node = child,
                    None => continue 'retry,
                }
            }

            let mut subscribers = node.subscribers.write();
            if node.is_retired() {
                continue 'retry;
            }
            let added = subscribers.insert(Arc::from(client_id), qos).is_none();
            if added {
                self.count.fetch_add(1, Ordering::Relaxed);
            }
            return added;
        }
    }

    /// Remove the subscription of `client_id` to `filter`.
    ///
    /// Returns `false` if there was none.
    pub fn remove(&self, filter: &str, client_id: &str) -> bool {
        let mut path: Vec<(Segment<'_>, Arc<TrieNode>)> = Vec::new();
        let mut node = self.root.clone();
        for segment in segments(filter) {
            let Some(child) = node.child(segment) else {
                return false;
            };
            path.push((segment, child.clone()));
            node = child;
        }

        if node.subscribers.write().remove(client_id).is_none() {
            return false;
        }
        self.count.fetch_sub(1, Ordering::Relaxed);

        // Prune empty nodes bottom-up; stop at the first one still in use.
        for i in (0..path.len()).rev() {
            let parent = if i == 0 { &self.root } else { &path[i - 1].1 };
            let (segment, child) = &path[i];
            if !Self::prune(parent, *segment, child) {
                break;
            }
        }
        true
    }

    /// Unlink `child` from `parent` if it holds nothing. Locks top-down.
    fn prune(parent: &TrieNode, segment: Segment<'_>, child: &Arc<TrieNode>) -> bool {
        let mut parent_children = parent.children.write();
        if parent.is_retired() {
            return false;
        }
        match parent_children.get(segment) {
            Some(current) if Arc::ptr_eq(current, child) => {}
            _ => return false,
        }

        let child_children = child.children.read();
        let child_subscribers = child.subscribers.read();
        if !child_children.is_empty() || !child_subscribers.is_empty() {
            return false;
        }
        child.retired.store(true, Ordering::Release);
        drop(child_subscribers);
        drop(child_children);

        parent_children.remove(segment);
        true
    }

    /// Remove a batch of subscriptions held by one client.
    pub fn remove_client<'a, I>(&self, client_id: &str, filters: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        filters
            .into_iter()
            .filter(|filter| self.remove(filter, client_id))
            .count()
    }

    /// Every client with a filter matching `topic`, once each at the highest
    /// QoS among its matching filters.
    pub fn matches(&self, topic: &str) -> Vec<Subscriber> {
        let levels: Vec<&str> = topic.split(SEPARATOR).collect();
        let mut best = AHashMap::new();
        self.root.collect(&levels, true, &mut best);
        best.into_iter()
            .map(|(client_id, qos)| Subscriber { client_id, qos })
            .collect()
    }

    /// Number of `(filter, client)` subscriptions.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the trie holds no nodes below the root.
    #[cfg(test)]
    fn is_pruned(&self) -> bool {
        self.root.children.read().is_empty()
    }
}

impl Default for SubscriptionDirectory {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if a topic name matches a topic filter (which may contain wildcards).
///
/// Same rules as [`SubscriptionDirectory::matches`]; used for delivering
/// retained messages to new subscribers.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topic_levels = topic.split(SEPARATOR);
    for filter_level in filter.split(SEPARATOR) {
        if filter_level == MULTI_LEVEL_WILDCARD {
            return true;
        }
        match topic_levels.next() {
            Some(level) if filter_level == SINGLE_LEVEL_WILDCARD || filter_level == level => {}
            _ => return false,
        }
    }
    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn matched(dir: &SubscriptionDirectory, topic: &str) -> Vec<(String, QoS)> {
        let mut subs: Vec<_> = dir
            .matches(topic)
            .into_iter()
            .map(|s| (s.client_id.to_string(), s.qos))
            .collect();
        subs.sort();
        subs
    }

    #[test]
    fn test_exact_match() {
        let dir = SubscriptionDirectory::new();
        assert!(dir.add("sensors/temp", "c1", QoS::AtMostOnce));

        assert_eq!(matched(&dir, "sensors/temp"), vec![("c1".into(), QoS::AtMostOnce)]);
        assert!(dir.matches("sensors/humidity").is_empty());
        assert!(dir.matches("sensors").is_empty());
        assert!(dir.matches("sensors/temp/x").is_empty());
    }

    #[test]
    fn test_single_wildcard() {
        let dir = SubscriptionDirectory::new();
        dir.add("sensors/+/temp", "c1", QoS::AtMostOnce);

        assert_eq!(dir.matches("sensors/room1/temp").len(), 1);
        assert_eq!(dir.matches("sensors/room2/temp").len(), 1);
        assert!(dir.matches("sensors/room1/humidity").is_empty());
        assert!(dir.matches("sensors/a/b/temp").is_empty());
    }

    #[test]
    fn test_multi_wildcard_matches_parent() {
        let dir = SubscriptionDirectory::new();
        dir.add("sensors/#", "c1", QoS::AtMostOnce);

        assert_eq!(dir.matches("sensors").len(), 1);
        assert_eq!(dir.matches("sensors/temp").len(), 1);
        assert_eq!(dir.matches("sensors/room1/floor2/temp").len(), 1);
        assert!(dir.matches("actuators/light").is_empty());
    }

    #[test]
    fn test_dollar_topics_skip_root_wildcards() {
        let dir = SubscriptionDirectory::new();
        dir.add("#", "all", QoS::AtMostOnce);
        dir.add("+/broker", "plus", QoS::AtMostOnce);
        dir.add("$SYS/#", "sys", QoS::AtMostOnce);

        assert_eq!(matched(&dir, "$SYS/broker"), vec![("sys".into(), QoS::AtMostOnce)]);
        assert_eq!(dir.matches("app/broker").len(), 2);
    }

    #[test]
    fn test_overlapping_filters_yield_max_qos() {
        let dir = SubscriptionDirectory::new();
        dir.add("a/b", "c1", QoS::AtMostOnce);
        dir.add("a/+", "c1", QoS::ExactlyOnce);
        dir.add("a/#", "c1", QoS::AtLeastOnce);
        dir.add("a/#", "c2", QoS::AtLeastOnce);

        assert_eq!(
            matched(&dir, "a/b"),
            vec![
                ("c1".into(), QoS::ExactlyOnce),
                ("c2".into(), QoS::AtLeastOnce)
            ]
        );
    }

    #[test]
    fn test_resubscribe_replaces_qos() {
        let dir = SubscriptionDirectory::new();
        assert!(dir.add("a/b", "c1", QoS::ExactlyOnce));
        assert!(!dir.add("a/b", "c1", QoS::AtMostOnce));

        assert_eq!(dir.len(), 1);
        assert_eq!(matched(&dir, "a/b"), vec![("c1".into(), QoS::AtMostOnce)]);
    }

    #[test]
    fn test_remove_prunes_empty_branches() {
        let dir = SubscriptionDirectory::new();
        dir.add("a/b/c", "c1", QoS::AtMostOnce);
        dir.add("a/b", "c2", QoS::AtMostOnce);

        assert!(dir.remove("a/b/c", "c1"));
        assert!(!dir.remove("a/b/c", "c1"));
        assert_eq!(dir.matches("a/b").len(), 1);
        assert!(!dir.is_pruned());

        assert!(dir.remove("a/b", "c2"));
        assert!(dir.is_empty());
        assert!(dir.is_pruned());
    }

    #[test]
    fn test_remove_client_batch() {
        let dir = SubscriptionDirectory::new();
        dir.add("a/+", "c1", QoS::AtMostOnce);
        dir.add("b/#", "c1", QoS::AtMostOnce);
        dir.add("a/+", "c2", QoS::AtMostOnce);

        assert_eq!(dir.remove_client("c1", ["a/+", "b/#", "never/subscribed"]), 2);
        assert_eq!(matched(&dir, "a/x"), vec![("c2".into(), QoS::AtMostOnce)]);
        assert!(dir.matches("b/x").is_empty());
    }

    #[test]
    fn test_topic_matches_filter() {
        assert!(topic_matches_filter("a/b/c", "a/b/c"));
        assert!(topic_matches_filter("a/b/c", "a/+/c"));
        assert!(topic_matches_filter("a/b/c", "a/#"));
        assert!(topic_matches_filter("a", "a/#"));
        assert!(topic_matches_filter("a/b", "#"));
        assert!(topic_matches_filter("/a", "+/a"));
        assert!(!topic_matches_filter("a/b", "a"));
        assert!(!topic_matches_filter("a", "a/+"));
        assert!(!topic_matches_filter("a/b/c", "a/+"));
        assert!(!topic_matches_filter("$SYS/x", "#"));
        assert!(!topic_matches_filter("$SYS/x", "+/x"));
        assert!(topic_matches_filter("$SYS/x", "$SYS/+"));
    }

    #[test]
    fn test_concurrent_add_remove_match() {
        let dir = Arc::new(SubscriptionDirectory::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let dir = dir.clone();
                thread::spawn(move || {
                    let client = format!("client-{}", t);
                    for i in 0..200 {
                        let filter = format!("load/{}/+", i % 10);
                        dir.add(&filter, &client, QoS::AtLeastOnce);
                        let _ = dir.matches(&format!("load/{}/x", i % 10));
                        if i % 2 == 0 {
                            dir.remove(&filter, &client);
                        }
                    }
                    // Every thread ends subscribed to exactly its odd filters.
                    for i in (1..10).step_by(2) {
                        dir.add(&format!("load/{}/+", i), &client, QoS::AtLeastOnce);
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }

        for i in 0..10 {
            let hits = dir.matches(&format!("load/{}/x", i));
            if i % 2 == 1 {
                assert_eq!(hits.len(), 8, "filter load/{}/+", i);
            } else {
                assert!(hits.is_empty(), "filter load/{}/+", i);
            }
        }
    }

    #[test]
    fn test_concurrent_prune_never_loses_insert() {
        let dir = Arc::new(SubscriptionDirectory::new());
        let churn = {
            let dir = dir.clone();
            thread::spawn(move || {
                for _ in 0..2000 {
                    dir.add("x/y/z", "churn", QoS::AtMostOnce);
                    dir.remove("x/y/z", "churn");
                }
            })
        };
        let adder = {
            let dir = dir.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    dir.add("x/y/z", &format!("keeper-{}", i), QoS::AtMostOnce);
                }
            })
        };
        churn.join().unwrap();
        adder.join().unwrap();

        assert_eq!(dir.matches("x/y/z").len(), 500);
        assert_eq!(dir.len(), 500);
    }
}
