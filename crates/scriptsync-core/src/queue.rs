//! Change-capture debounce queue.
//!
//! One global timer covers every queued file: each new entry re-arms it to
//! the full settle delay. Pausing remembers how much time was left and
//! resuming re-arms with exactly that. With a zero delay (or monitoring
//! turned off) the queue only tracks entries and never expires by itself.
//!
//! The queue never reads a clock. Callers pass `now` in, which keeps the
//! state machine deterministic under test.

use std::time::{Duration, Instant};
use tracing::debug;

/// Queue state. `Flushing` is not a resting state: [`DebounceQueue::drain`]
/// hands everything to the caller and the queue is `Idle` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    /// Entries present. `deadline` is `None` in monitor-only mode.
    Accumulating { deadline: Option<Instant> },
    /// Entries present, timer suspended.
    Paused { remaining: Option<Duration> },
}

/// Latest content for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub path: String,
    pub content: String,
}

#[derive(Debug)]
pub struct DebounceQueue {
    delay: Duration,
    monitoring: bool,
    entries: Vec<QueueEntry>,
    state: QueueState,
}

impl DebounceQueue {
    pub fn new(delay: Duration, monitoring: bool) -> Self {
        Self {
            delay,
            monitoring,
            entries: Vec::new(),
            state: QueueState::Idle,
        }
    }

    /// True when entries are tracked but never flushed automatically.
    pub fn is_monitor_only(&self) -> bool {
        self.delay.is_zero() || !self.monitoring
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    fn armed_deadline(&self, now: Instant) -> Option<Instant> {
        (!self.is_monitor_only()).then(|| now + self.delay)
    }

    /// Queue (or replace) the content for `path` and re-arm the timer.
    pub fn enqueue(&mut self, path: &str, content: String, now: Instant) {
        match self.entries.iter_mut().find(|e| e.path == path) {
            Some(entry) => entry.content = content,
            None => self.entries.push(QueueEntry {
                path: path.to_string(),
                content,
            }),
        }

        self.state = match self.state {
            QueueState::Paused { .. } => QueueState::Paused {
                remaining: (!self.is_monitor_only()).then_some(self.delay),
            },
            _ => QueueState::Accumulating {
                deadline: self.armed_deadline(now),
            },
        };
        debug!("Queued {} ({} pending)", path, self.entries.len());
    }

    /// Drop `path` from the queue, returning its pending content.
    pub fn remove(&mut self, path: &str) -> Option<String> {
        let index = self.entries.iter().position(|e| e.path == path)?;
        let entry = self.entries.remove(index);
        if self.entries.is_empty() {
            self.state = QueueState::Idle;
        }
        Some(entry.content)
    }

    /// Move a queued entry to a new path (after an accepted rename).
    pub fn rename(&mut self, old: &str, new: &str) -> bool {
        let Some(content) = self.remove_keep_state(old) else {
            return false;
        };
        match self.entries.iter_mut().find(|e| e.path == new) {
            Some(entry) => entry.content = content,
            None => self.entries.push(QueueEntry {
                path: new.to_string(),
                content,
            }),
        }
        true
    }

    fn remove_keep_state(&mut self, path: &str) -> Option<String> {
        let index = self.entries.iter().position(|e| e.path == path)?;
        Some(self.entries.remove(index).content)
    }

    /// Suspend the timer. No-op (returns false) when nothing is queued or the
    /// queue is already paused.
    pub fn pause(&mut self, now: Instant) -> bool {
        match self.state {
            QueueState::Accumulating { deadline } if !self.entries.is_empty() => {
                self.state = QueueState::Paused {
                    remaining: deadline.map(|d| d.saturating_duration_since(now)),
                };
                true
            }
            _ => false,
        }
    }

    /// Re-arm the timer with the time that was left when paused.
    pub fn resume(&mut self, now: Instant) -> bool {
        match self.state {
            QueueState::Paused { remaining } => {
                self.state = QueueState::Accumulating {
                    deadline: remaining.map(|r| now + r),
                };
                true
            }
            _ => false,
        }
    }

    /// Pause because the agent reported an error. Unlike [`pause`](Self::pause)
    /// this reports success when the queue was already paused, so callers can
    /// tell the user their changes are being held.
    pub fn pause_for_error(&mut self, now: Instant) -> bool {
        self.pause(now) || (self.is_paused() && !self.entries.is_empty())
    }

    /// Flip between paused and running. Returns whether the queue is paused
    /// afterwards.
    pub fn toggle_pause(&mut self, now: Instant) -> bool {
        if !self.resume(now) {
            self.pause(now);
        }
        self.is_paused()
    }

    /// True once the armed timer has run out.
    pub fn poll_expired(&self, now: Instant) -> bool {
        matches!(self.state, QueueState::Accumulating { deadline: Some(d) } if now >= d)
    }

    /// Take every entry for dispatch, leaving the queue idle.
    pub fn drain(&mut self) -> Vec<QueueEntry> {
        self.state = QueueState::Idle;
        std::mem::take(&mut self.entries)
    }

    /// Put entries back after a failed dispatch and pause.
    ///
    /// Entries queued since the drain are newer and keep their content.
    pub fn restore_paused(&mut self, failed: Vec<QueueEntry>) {
        let mut merged: Vec<QueueEntry> = failed
            .into_iter()
            .filter(|f| !self.entries.iter().any(|e| e.path == f.path))
            .collect();
        merged.append(&mut self.entries);
        self.entries = merged;
        if !self.entries.is_empty() {
            self.state = QueueState::Paused {
                remaining: (!self.is_monitor_only()).then_some(self.delay),
            };
        }
    }

    /// Discard everything unconditionally. Returns how many entries went.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.state = QueueState::Idle;
        count
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            QueueState::Accumulating { deadline } => deadline,
            _ => None,
        }
    }

    /// Time left before an automatic flush, as shown to the user.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        match self.state {
            QueueState::Accumulating { deadline } => {
                deadline.map(|d| d.saturating_duration_since(now))
            }
            QueueState::Paused { remaining } => remaining,
            QueueState::Idle => None,
        }
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.state, QueueState::Paused { .. })
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.iter().any(|e| e.path == path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_secs(3);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_enqueue_arms_and_rearms_timer() {
        let mut queue = DebounceQueue::new(DELAY, true);
        let t0 = Instant::now();
        assert_eq!(queue.state(), QueueState::Idle);

        queue.enqueue("a", "1".into(), t0);
        assert_eq!(queue.deadline(), Some(t0 + DELAY));

        queue.enqueue("b", "1".into(), t0 + ms(1000));
        assert_eq!(queue.deadline(), Some(t0 + ms(1000) + DELAY));

        assert!(!queue.poll_expired(t0 + DELAY));
        assert!(queue.poll_expired(t0 + ms(1000) + DELAY));
    }

    #[test]
    fn test_latest_content_wins_and_order_is_kept() {
        let mut queue = DebounceQueue::new(DELAY, true);
        let t0 = Instant::now();
        queue.enqueue("a", "1".into(), t0);
        queue.enqueue("b", "1".into(), t0);
        queue.enqueue("a", "2".into(), t0);

        let drained = queue.drain();
        assert_eq!(
            drained,
            vec![
                QueueEntry { path: "a".into(), content: "2".into() },
                QueueEntry { path: "b".into(), content: "1".into() },
            ]
        );
        assert_eq!(queue.state(), QueueState::Idle);
    }

    #[test]
    fn test_pause_resume_keeps_remaining_time() {
        let mut queue = DebounceQueue::new(DELAY, true);
        let t0 = Instant::now();
        queue.enqueue("a", "1".into(), t0);

        // Pause with 2s left.
        assert!(queue.pause(t0 + ms(1000)));
        assert_eq!(queue.remaining(t0 + ms(9000)), Some(ms(2000)));
        assert!(!queue.poll_expired(t0 + ms(60_000)));

        // Resume much later; the flush is exactly 2s after resuming.
        let resumed_at = t0 + ms(10_000);
        assert!(queue.resume(resumed_at));
        assert!(!queue.poll_expired(resumed_at + ms(1999)));
        assert!(queue.poll_expired(resumed_at + ms(2000)));
    }

    #[test]
    fn test_pause_is_noop_when_empty() {
        let mut queue = DebounceQueue::new(DELAY, true);
        assert!(!queue.pause(Instant::now()));
        assert_eq!(queue.state(), QueueState::Idle);
        assert!(!queue.toggle_pause(Instant::now()));
    }

    #[test]
    fn test_toggle_pause() {
        let mut queue = DebounceQueue::new(DELAY, true);
        let t0 = Instant::now();
        queue.enqueue("a", "1".into(), t0);
        assert!(queue.toggle_pause(t0));
        assert!(!queue.toggle_pause(t0));
        assert_eq!(queue.deadline(), Some(t0 + DELAY));
    }

    #[test]
    fn test_enqueue_while_paused_resets_remaining() {
        let mut queue = DebounceQueue::new(DELAY, true);
        let t0 = Instant::now();
        queue.enqueue("a", "1".into(), t0);
        queue.pause(t0 + ms(2500));
        queue.enqueue("b", "1".into(), t0 + ms(2600));

        assert!(queue.is_paused());
        assert_eq!(queue.remaining(t0), Some(DELAY));
    }

    #[test]
    fn test_monitor_only_never_expires() {
        for mut queue in [
            DebounceQueue::new(Duration::ZERO, true),
            DebounceQueue::new(DELAY, false),
        ] {
            let t0 = Instant::now();
            queue.enqueue("a", "1".into(), t0);
            assert!(queue.is_monitor_only());
            assert_eq!(queue.deadline(), None);
            assert!(!queue.poll_expired(t0 + ms(3_600_000)));
            assert_eq!(queue.len(), 1);
            assert_eq!(queue.drain().len(), 1);
        }
    }

    #[test]
    fn test_remove_last_entry_goes_idle() {
        let mut queue = DebounceQueue::new(DELAY, true);
        let t0 = Instant::now();
        queue.enqueue("a", "1".into(), t0);
        assert_eq!(queue.remove("a").as_deref(), Some("1"));
        assert_eq!(queue.remove("a"), None);
        assert_eq!(queue.state(), QueueState::Idle);
    }

    #[test]
    fn test_restore_paused_prefers_newer_entries() {
        let mut queue = DebounceQueue::new(DELAY, true);
        let t0 = Instant::now();
        queue.enqueue("a", "old".into(), t0);
        queue.enqueue("b", "1".into(), t0);
        let failed = queue.drain();

        queue.enqueue("a", "new".into(), t0);
        queue.restore_paused(failed);

        assert!(queue.is_paused());
        let contents: Vec<_> = queue
            .entries()
            .iter()
            .map(|e| (e.path.as_str(), e.content.as_str()))
            .collect();
        assert_eq!(contents, vec![("b", "1"), ("a", "new")]);
    }

    #[test]
    fn test_rename_moves_entry() {
        let mut queue = DebounceQueue::new(DELAY, true);
        let t0 = Instant::now();
        queue.enqueue("old", "1".into(), t0);
        assert!(queue.rename("old", "new"));
        assert!(!queue.contains("old"));
        assert!(queue.contains("new"));
        assert_eq!(queue.deadline(), Some(t0 + DELAY));
    }

    #[test]
    fn test_clear() {
        let mut queue = DebounceQueue::new(DELAY, true);
        let t0 = Instant::now();
        queue.enqueue("a", "1".into(), t0);
        queue.pause(t0);
        assert_eq!(queue.clear(), 1);
        assert_eq!(queue.state(), QueueState::Idle);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pause_for_error() {
        let mut queue = DebounceQueue::new(DELAY, true);
        let t0 = Instant::now();
        assert!(!queue.pause_for_error(t0));

        queue.enqueue("a", "1".into(), t0);
        assert!(queue.pause_for_error(t0 + Duration::from_millis(500)));
        assert_eq!(
            queue.state(),
            QueueState::Paused {
                remaining: Some(DELAY - Duration::from_millis(500))
            }
        );
        // A second error while paused leaves the remaining time alone.
        assert!(queue.pause_for_error(t0 + DELAY));
        assert_eq!(queue.remaining(t0 + DELAY), Some(DELAY - Duration::from_millis(500)));
    }
}
