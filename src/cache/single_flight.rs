//! Collapse concurrent loads of the same key into one.
//!
//! The first caller for a key runs the load; callers arriving while it is in
//! flight block until it finishes and receive a clone of its result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{CoreError, Result};

struct Call<T> {
    result: Mutex<Option<Result<T>>>,
    done: Condvar,
    waiters: AtomicUsize,
}

pub struct SingleFlight<T> {
    inflight: Mutex<HashMap<String, Arc<Call<T>>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

/// Publishes the leader's result, even if the load panicked.
struct Publish<'a, T: Clone> {
    group: &'a SingleFlight<T>,
    key: &'a str,
    call: Arc<Call<T>>,
    result: Option<Result<T>>,
}

impl<T: Clone> Drop for Publish<'_, T> {
    fn drop(&mut self) {
        self.group.inflight.lock().remove(self.key);
        let result = self
            .result
            .take()
            .unwrap_or_else(|| Err(CoreError::persistent("load aborted")));
        *self.call.result.lock() = Some(result);
        self.call.done.notify_all();
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(&self, key: &str, load: impl FnOnce() -> Result<T>) -> Result<T> {
        let (call, leader) = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(call) => (Arc::clone(call), false),
                None => {
                    let call = Arc::new(Call {
                        result: Mutex::new(None),
                        done: Condvar::new(),
                        waiters: AtomicUsize::new(0),
                    });
                    inflight.insert(key.to_string(), Arc::clone(&call));
                    (call, true)
                }
            }
        };

        if leader {
            let mut publish = Publish {
                group: self,
                key,
                call,
                result: None,
            };
            let out = load();
            publish.result = Some(out.clone());
            return out;
        }

        call.waiters.fetch_add(1, Ordering::SeqCst);
        let mut slot = call.result.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            call.done.wait(&mut slot);
        }
    }

    /// Callers currently blocked on the in-flight load for `key`.
    pub fn waiters(&self, key: &str) -> usize {
        self.inflight
            .lock()
            .get(key)
            .map_or(0, |c| c.waiters.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_concurrent_callers_share_one_load() {
        let group = Arc::new(SingleFlight::<u32>::new());
        let loads = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = mpsc::channel();

        let leader = {
            let group = Arc::clone(&group);
            let loads = Arc::clone(&loads);
            thread::spawn(move || {
                let g = Arc::clone(&group);
                group.run("projects:all", move || {
                    loads.fetch_add(1, Ordering::SeqCst);
                    started_tx.send(()).unwrap();
                    let deadline = Instant::now() + Duration::from_secs(5);
                    while g.waiters("projects:all") < 4 && Instant::now() < deadline {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Ok(7)
                })
            })
        };

        started_rx.recv().unwrap();
        let followers: Vec<_> = (0..4)
            .map(|_| {
                let group = Arc::clone(&group);
                let loads = Arc::clone(&loads);
                thread::spawn(move || {
                    group.run("projects:all", || {
                        loads.fetch_add(1, Ordering::SeqCst);
                        Ok(0)
                    })
                })
            })
            .collect();

        assert_eq!(leader.join().unwrap().unwrap(), 7);
        for f in followers {
            assert_eq!(f.join().unwrap().unwrap(), 7);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_errors_are_shared_and_not_sticky() {
        let group = SingleFlight::<u32>::new();
        let err = group
            .run("k", || Err(CoreError::persistent("down")))
            .unwrap_err();
        assert!(matches!(err, CoreError::StoreUnavailable { .. }));
        assert_eq!(group.run("k", || Ok(1)).unwrap(), 1);
    }

    #[test]
    fn test_panicking_load_releases_waiters() {
        let group = Arc::new(SingleFlight::<u32>::new());
        let g = Arc::clone(&group);
        let res = thread::spawn(move || g.run("k", || panic!("boom"))).join();
        assert!(res.is_err());
        // The key is free again.
        assert_eq!(group.run("k", || Ok(3)).unwrap(), 3);
    }
}
