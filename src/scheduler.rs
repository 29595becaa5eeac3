/// Delay between announce re-checks, in seconds.
pub const RETRY_SECS: u64 = 10;

/// Token identifying one scheduled timer. A session holds at most one live
/// handle; a fired entry whose token no longer matches is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

#[derive(Debug)]
struct Entry {
    token: u64,
    session: String,
    at: u64,
}

/// Logical one-shot timers for session re-checks. Pure data structure: time
/// enters as an argument, so the owner stays on a single executor and tests
/// drive it directly. Timers are not persisted; resuming tasks recreates
/// them.
#[derive(Debug, Default)]
pub struct RetryScheduler {
    next_token: u64,
    queue: Vec<Entry>,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Default::default()
    }

    /// Arm a one-shot for `session` at `now + delay` seconds.
    pub fn schedule(&mut self, session: &str, delay: u64, now: u64) -> TimerHandle {
        self.next_token += 1;
        let token = self.next_token;
        self.queue.push(Entry {
            token,
            session: session.into(),
            at: now + delay,
        });
        TimerHandle(token)
    }

    pub fn cancel(&mut self, handle: TimerHandle) {
        self.queue.retain(|e| e.token != handle.0);
    }

    /// Drain every entry due at `now`, in scheduling order.
    pub fn due(&mut self, now: u64) -> Vec<(String, TimerHandle)> {
        let mut fired = Vec::new();
        self.queue.retain(|e| {
            if e.at <= now {
                fired.push((e.session.clone(), TimerHandle(e.token)));
                false
            } else {
                true
            }
        });
        fired
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.iter().map(|e| e.at).min()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once() {
        let mut s = RetryScheduler::new();
        let h = s.schedule("a", RETRY_SECS, 100);
        assert!(s.due(105).is_empty());
        let fired = s.due(110);
        assert_eq!(fired, vec![("a".to_string(), h)]);
        assert!(s.due(200).is_empty());
        assert!(s.is_empty());
    }

    #[test]
    fn cancel_removes_entry() {
        let mut s = RetryScheduler::new();
        let h = s.schedule("a", 10, 0);
        s.cancel(h);
        assert!(s.due(100).is_empty());
    }

    #[test]
    fn handles_are_distinct() {
        let mut s = RetryScheduler::new();
        let h1 = s.schedule("a", 10, 0);
        let h2 = s.schedule("a", 10, 0);
        assert_ne!(h1, h2);
        assert_eq!(s.next_deadline(), Some(10));
    }
}
