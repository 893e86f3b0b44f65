//! Disk changes the engine made itself, remembered for a short window so the
//! watcher's report of them is not mistaken for a user edit.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How long a write or rename waits for its watcher echo.
pub const ECHO_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct EchoFilter {
    window: Duration,
    writes: HashMap<String, (String, Instant)>,
    renames: HashMap<(String, String), Instant>,
}

impl Default for EchoFilter {
    fn default() -> Self {
        Self::new(ECHO_WINDOW)
    }
}

impl EchoFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            writes: HashMap::new(),
            renames: HashMap::new(),
        }
    }

    pub fn note_write(&mut self, path: &str, content: String, now: Instant) {
        self.prune(now);
        self.writes.insert(path.to_string(), (content, now));
    }

    /// True when a change to `path` is the echo of our own write. The entry
    /// is consumed either way.
    pub fn take_write(&mut self, path: &str, content: &str, now: Instant) -> bool {
        match self.writes.remove(path) {
            Some((written, at)) => written == content && self.fresh(at, now),
            None => false,
        }
    }

    pub fn forget_write(&mut self, path: &str) {
        self.writes.remove(path);
    }

    pub fn note_rename(&mut self, from: &str, to: &str, now: Instant) {
        self.prune(now);
        self.renames
            .insert((from.to_string(), to.to_string()), now);
    }

    /// True when `from -> to` is a rename we performed ourselves.
    pub fn take_rename(&mut self, from: &str, to: &str, now: Instant) -> bool {
        match self.renames.remove(&(from.to_string(), to.to_string())) {
            Some(at) => self.fresh(at, now),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.writes.len() + self.renames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fresh(&self, at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(at) < self.window
    }

    fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.writes
            .retain(|_, (_, at)| now.saturating_duration_since(*at) < window);
        self.renames
            .retain(|_, at| now.saturating_duration_since(*at) < window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_echo_is_consumed_once() {
        let t0 = Instant::now();
        let mut echoes = EchoFilter::default();
        echoes.note_write("a.script.js", "x".into(), t0);

        assert!(echoes.take_write("a.script.js", "x", t0 + Duration::from_millis(200)));
        assert!(!echoes.take_write("a.script.js", "x", t0 + Duration::from_millis(300)));
    }

    #[test]
    fn test_different_content_is_not_an_echo() {
        let t0 = Instant::now();
        let mut echoes = EchoFilter::default();
        echoes.note_write("a.script.js", "x".into(), t0);
        assert!(!echoes.take_write("a.script.js", "y", t0));
        assert!(echoes.is_empty());
    }

    #[test]
    fn test_rename_echo_matches_direction() {
        let t0 = Instant::now();
        let mut echoes = EchoFilter::default();
        echoes.note_rename("a", "b", t0);

        assert!(!echoes.take_rename("b", "a", t0));
        assert!(echoes.take_rename("a", "b", t0));
        assert!(!echoes.take_rename("a", "b", t0));
    }

    #[test]
    fn test_stale_entries_expire() {
        let t0 = Instant::now();
        let mut echoes = EchoFilter::new(Duration::from_secs(1));
        echoes.note_write("old", "x".into(), t0);
        echoes.note_rename("a", "b", t0);

        assert!(!echoes.take_rename("a", "b", t0 + Duration::from_secs(2)));

        // Unclaimed entries are dropped once newer ones arrive.
        echoes.note_write("new", "y".into(), t0 + Duration::from_secs(3));
        assert_eq!(echoes.len(), 1);
    }
}
