use core::fmt::Debug;
use core::hash::Hash;
use std::collections::HashSet;

use chrono::{DateTime, Utc};

/// Discriminant of an event type within a closed type hierarchy.
///
/// Every kind names its direct ancestor through [`EventKind::parent`]. Kinds
/// whose parent is `None` sit directly below the implicit root event type,
/// which consumers cannot subscribe to.
pub trait EventKind: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Direct ancestor kind, or `None` when the ancestor is the root event type.
    fn parent(self) -> Option<Self>;

    /// Stable name (e.g. "task.completed").
    fn name(self) -> &'static str;

    /// This kind followed by each of its ancestors, most specific first.
    fn lineage(self) -> Lineage<Self> {
        Lineage {
            next: Some(self),
            seen: HashSet::new(),
        }
    }

    /// Whether `self` is `other` or one of its descendants.
    fn is_a(self, other: Self) -> bool {
        self.lineage().any(|k| k == other)
    }
}

/// Iterator over a kind and its ancestors. Stops on a repeated kind.
#[derive(Debug)]
pub struct Lineage<K> {
    next: Option<K>,
    seen: HashSet<K>,
}

impl<K: EventKind> Iterator for Lineage<K> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        let current = self.next.take()?;
        if !self.seen.insert(current) {
            return None;
        }
        self.next = current.parent();
        Some(current)
    }
}

/// An event published through the broker.
///
/// Events are immutable facts; the broker only reads them.
pub trait Event: Debug + Send + Sync + 'static {
    type Kind: EventKind;

    /// Most specific kind of this event instance.
    fn kind(&self) -> Self::Kind;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
