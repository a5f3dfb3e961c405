use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identifier of a scheduled timer. Ids are allocated from a shared counter
/// and never reused, so a stale id can always be distinguished from a live
/// one.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[display(inner)]
pub struct TimerId(u64);

/// Shared allocator for [`TimerId`]s, cloneable across threads so ids can be
/// handed out before the scheduling request reaches the owning loop.
#[derive(Clone, Debug)]
pub struct TimerIdSource(Arc<AtomicU64>);

impl Default for TimerIdSource {
    fn default() -> Self { TimerIdSource(Arc::new(AtomicU64::new(1))) }
}

impl TimerIdSource {
    pub fn next(&self) -> TimerId { TimerId(self.0.fetch_add(1, Ordering::Relaxed)) }
}

/// One-shot timer list.
///
/// Timers fire in deadline order with ties broken by insertion order.
/// Cancellation is best effort: a timer cancelled after its expiry was
/// already collected is caught by the validity check in [`Timers::claim`].
#[derive(Debug)]
pub struct Timers<K> {
    /// Sorted by deadline descending (insertion order breaking ties), so the
    /// nearest deadline sits at the tail ready to be popped.
    pending: Vec<(TimerId, Instant, K)>,
    /// Ids cancelled between expiry collection and dispatch.
    dead: Vec<TimerId>,
    ids: TimerIdSource,
}

impl<K> Timers<K> {
    pub fn new(ids: TimerIdSource) -> Self {
        Self {
            pending: vec![],
            dead: vec![],
            ids,
        }
    }

    pub fn len(&self) -> usize { self.pending.len() }

    pub fn is_empty(&self) -> bool { self.pending.is_empty() }

    /// Schedules a one-shot timer and returns its id.
    pub fn register(&mut self, deadline: Instant, key: K) -> TimerId {
        let id = self.ids.next();
        self.insert(id, deadline, key);
        id
    }

    /// Schedules a timer under an id pre-allocated from the shared
    /// [`TimerIdSource`]. Used when the id must be returned to the caller
    /// before the request reaches the loop thread.
    pub fn insert(&mut self, id: TimerId, deadline: Instant, key: K) {
        self.pending.push((id, deadline, key));
        self.pending
            .sort_by(|(aid, at, _), (bid, bt, _)| (bt, bid).cmp(&(at, aid)));
    }

    /// Cancels a timer. If the expiry was already collected this tick, the
    /// cancellation is recorded so [`Self::claim`] invalidates it.
    pub fn cancel(&mut self, id: TimerId) {
        match self.pending.iter().position(|(tid, _, _)| *tid == id) {
            Some(pos) => {
                self.pending.remove(pos);
            }
            None => self.dead.push(id),
        }
    }

    /// Time to wait until the nearest deadline, zero if it already passed.
    /// `None` when no timers are pending.
    pub fn next_from(&self, now: Instant) -> Option<Duration> {
        self.pending
            .last()
            .map(|(_, t, _)| t.saturating_duration_since(now))
    }

    /// Pops timers expired by `now` into `fired`, nearest first. Returns the
    /// number collected. Stale cancellation records from the previous
    /// dispatch round are cleared on entry.
    pub fn expire(&mut self, now: Instant, fired: &mut Vec<(TimerId, K)>) -> usize {
        self.dead.clear();
        let before = fired.len();
        while let Some((id, t, k)) = self.pending.pop() {
            if t <= now {
                fired.push((id, k));
            } else {
                self.pending.push((id, t, k));
                break;
            }
        }
        fired.len() - before
    }

    /// Validity check for a collected expiry: `false` if the timer was
    /// cancelled after collection. Consumes the cancellation record.
    pub fn claim(&mut self, id: TimerId) -> bool {
        match self.dead.iter().position(|d| *d == id) {
            Some(pos) => {
                self.dead.swap_remove(pos);
                false
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: Instant, ms: u64) -> Instant { base + Duration::from_millis(ms) }

    #[test]
    fn fires_in_deadline_order() {
        let base = Instant::now();
        let mut tm = Timers::new(TimerIdSource::default());

        tm.register(at(base, 8), 0xA);
        tm.register(at(base, 72), 0xD);
        tm.register(at(base, 16), 0xB);
        tm.register(at(base, 64), 0xC);

        let mut fired = Vec::new();
        assert_eq!(tm.expire(base, &mut fired), 0);
        assert_eq!(tm.expire(at(base, 21), &mut fired), 2);
        assert_eq!(
            fired.iter().map(|(_, k)| *k).collect::<Vec<_>>(),
            vec![0xA, 0xB]
        );
        assert_eq!(tm.len(), 2);

        fired.clear();
        assert_eq!(tm.expire(at(base, 100), &mut fired), 2);
        assert_eq!(
            fired.iter().map(|(_, k)| *k).collect::<Vec<_>>(),
            vec![0xC, 0xD]
        );
        assert!(tm.is_empty());
    }

    #[test]
    fn ties_fire_in_insertion_order() {
        let base = Instant::now();
        let mut tm = Timers::new(TimerIdSource::default());
        tm.register(at(base, 5), "first");
        tm.register(at(base, 5), "second");
        tm.register(at(base, 5), "third");

        let mut fired = Vec::new();
        tm.expire(at(base, 5), &mut fired);
        assert_eq!(
            fired.iter().map(|(_, k)| *k).collect::<Vec<_>>(),
            vec!["first", "second", "third"]
        );
    }

    #[test]
    fn next_from_tracks_the_head() {
        let base = Instant::now();
        let mut tm = Timers::new(TimerIdSource::default());
        assert_eq!(tm.next_from(base), None);

        tm.register(at(base, 16), ());
        tm.register(at(base, 8), ());
        assert_eq!(tm.next_from(base), Some(Duration::from_millis(8)));
        assert_eq!(tm.next_from(at(base, 12)), Some(Duration::ZERO));
    }

    #[test]
    fn cancel_removes_pending() {
        let base = Instant::now();
        let mut tm = Timers::new(TimerIdSource::default());
        let a = tm.register(at(base, 5), 'a');
        tm.register(at(base, 6), 'b');
        tm.cancel(a);

        let mut fired = Vec::new();
        tm.expire(at(base, 10), &mut fired);
        assert_eq!(fired.iter().map(|(_, k)| *k).collect::<Vec<_>>(), vec!['b']);
    }

    #[test]
    fn cancel_after_collection_invalidates_claim() {
        let base = Instant::now();
        let mut tm = Timers::new(TimerIdSource::default());
        let a = tm.register(at(base, 1), 'a');
        let b = tm.register(at(base, 2), 'b');

        let mut fired = Vec::new();
        tm.expire(at(base, 5), &mut fired);
        assert_eq!(fired.len(), 2);

        // Dispatch of 'a' cancels 'b' before its turn comes up.
        assert!(tm.claim(a));
        tm.cancel(b);
        assert!(!tm.claim(b));
    }
}
