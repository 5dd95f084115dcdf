use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::Error;

/// Host callback invoked with the keys still waiting when a `next` times
/// out.
pub type TimeoutFn<K> = Box<dyn Fn(&[K]) + Send + Sync>;

struct DemuxState<V, K> {
    source: Box<dyn FnMut() -> Result<V, Error> + Send>,
    /// Single-slot cache of the value peeked from the source.
    next: Option<V>,
    /// Keys with a blocked `next` call.
    pending: Vec<K>,
    closed: bool,
}

/// A per-key gate over a source of keyed values: each consumer thread pulls
/// only the values bearing its key, in source order, blocking (bounded)
/// until its turn comes around.
pub struct Demux<V, K> {
    state: Mutex<DemuxState<V, K>>,
    waiting: Condvar,
    key_fn: Box<dyn Fn(&V) -> K + Send + Sync>,
    timeout: Duration,
    on_timeout: Option<TimeoutFn<K>>,
}

impl<V, K: PartialEq + Clone> Demux<V, K> {
    pub fn new<S, F>(source: S, key_fn: F, timeout: Duration) -> Demux<V, K>
    where
        S: FnMut() -> Result<V, Error> + Send + 'static,
        F: Fn(&V) -> K + Send + Sync + 'static,
    {
        Demux {
            state: Mutex::new(DemuxState {
                source: Box::new(source),
                next: None,
                pending: Vec::new(),
                closed: false,
            }),
            waiting: Condvar::new(),
            key_fn: Box::new(key_fn),
            timeout,
            on_timeout: None,
        }
    }

    pub fn with_timeout_callback(mut self, on_timeout: TimeoutFn<K>) -> Demux<V, K> {
        self.on_timeout = Some(on_timeout);
        self
    }

    /// Deliver the next source value whose key equals `key`.
    ///
    /// Whoever finds the cache empty refills it by pulling the source under
    /// the demux mutex; a filled cache wakes every waiter to re-check its
    /// key. A waiter whose deadline passes invokes the timeout callback with
    /// the pending keys and fails.
    pub fn next(&self, key: &K) -> Result<V, Error> {
        let mut state = self.state.lock().unwrap();
        let deadline = Instant::now() + self.timeout;
        let mut registered = false;

        let unregister = |state: &mut DemuxState<V, K>, registered: bool| {
            if registered {
                if let Some(at) = state.pending.iter().position(|k| k == key) {
                    state.pending.remove(at);
                }
            }
        };

        loop {
            if state.closed {
                unregister(&mut state, registered);
                return Err(Error::Closed);
            }

            if state.next.is_none() {
                match (state.source)() {
                    Ok(value) => {
                        state.next = Some(value);
                        self.waiting.notify_all();
                    }
                    Err(err) => {
                        state.closed = true;
                        unregister(&mut state, registered);
                        self.waiting.notify_all();
                        return Err(err);
                    }
                }
            }

            if (self.key_fn)(state.next.as_ref().unwrap()) == *key {
                unregister(&mut state, registered);
                let value = state.next.take().unwrap();
                self.waiting.notify_all();
                return Ok(value);
            }

            if !registered {
                state.pending.push(key.clone());
                registered = true;
            }

            let now = Instant::now();
            if now >= deadline {
                // The callback sees the timed-out caller among the pending
                // keys.
                if let Some(on_timeout) = &self.on_timeout {
                    on_timeout(&state.pending);
                }
                unregister(&mut state, true);
                return Err(Error::Timeout(self.timeout));
            }
            let (guard, _) = self.waiting.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn sequenced(items: Vec<(u32, &'static str)>) -> impl FnMut() -> Result<(u32, &'static str), Error> + Send {
        let mut queue = items.into_iter();
        move || queue.next().ok_or(Error::Closed)
    }

    #[test]
    fn keys_filter_the_source_in_order() {
        let demux = Demux::new(
            sequenced(vec![(1, "a"), (2, "b"), (1, "c")]),
            |item: &(u32, &str)| item.0,
            Duration::from_millis(200),
        );
        assert_eq!(demux.next(&1).unwrap().1, "a");
        assert_eq!(demux.next(&2).unwrap().1, "b");
        assert_eq!(demux.next(&1).unwrap().1, "c");
    }

    #[test]
    fn cached_value_returns_without_waiting() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let mut queue = vec![(7u32, "x")].into_iter();
        let demux = Demux::new(
            move || {
                counted.fetch_add(1, Ordering::Relaxed);
                queue.next().ok_or(Error::Closed)
            },
            |item: &(u32, &str)| item.0,
            Duration::from_millis(200),
        );
        assert_eq!(demux.next(&7).unwrap().1, "x");
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn waiters_get_their_values_across_threads() {
        let demux = Arc::new(Demux::new(
            sequenced(vec![(1, "a"), (2, "b"), (1, "c")]),
            |item: &(u32, &str)| item.0,
            Duration::from_secs(5),
        ));

        let other = demux.clone();
        let second = thread::spawn(move || other.next(&2).unwrap().1);

        assert_eq!(demux.next(&1).unwrap().1, "a");
        assert_eq!(second.join().unwrap(), "b");
        assert_eq!(demux.next(&1).unwrap().1, "c");
    }

    #[test]
    fn timeout_reports_the_pending_keys() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let demux = Demux::new(
            sequenced(vec![(1, "a")]),
            |item: &(u32, &str)| item.0,
            Duration::from_millis(25),
        )
        .with_timeout_callback(Box::new(move |pending: &[u32]| {
            sink.lock().unwrap().extend_from_slice(pending);
        }));

        match demux.next(&9) {
            Err(Error::Timeout(_)) => {}
            other => panic!("expected timeout, got {:?}", other.map(|v| v.1)),
        }
        assert_eq!(&*seen.lock().unwrap(), &[9]);
    }

    #[test]
    fn source_errors_close_the_demux_for_everyone() {
        let demux = Demux::new(
            sequenced(vec![(1, "a")]),
            |item: &(u32, &str)| item.0,
            Duration::from_millis(50),
        );
        assert_eq!(demux.next(&1).unwrap().1, "a");
        assert!(matches!(demux.next(&1), Err(Error::Closed)));
        assert!(matches!(demux.next(&2), Err(Error::Closed)));
    }
}
