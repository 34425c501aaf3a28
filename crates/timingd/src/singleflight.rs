//! Per-key in-flight coalescing for expensive recomputes.
//!
//! The first caller for a key runs the computation; concurrent callers for
//! the same key block and reuse its result. Prevents thundering-herd curve
//! recomputes for one recipient.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use sf_core::Result;

struct Flight<T> {
    result: Mutex<Option<Result<T>>>,
    done: Condvar,
}

pub struct Singleflight<T: Clone> {
    inflight: Mutex<HashMap<String, Arc<Flight<T>>>>,
}

impl<T: Clone> Default for Singleflight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Singleflight<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn run<F>(&self, key: &str, compute: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let (flight, is_leader) = {
            let mut map = self.inflight.lock().unwrap();
            match map.get(key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let flight = Arc::new(Flight {
                        result: Mutex::new(None),
                        done: Condvar::new(),
                    });
                    map.insert(key.to_string(), flight.clone());
                    (flight, true)
                }
            }
        };

        if is_leader {
            let outcome = compute();
            {
                let mut slot = flight.result.lock().unwrap();
                *slot = Some(outcome.clone());
            }
            flight.done.notify_all();
            self.inflight.lock().unwrap().remove(key);
            outcome
        } else {
            let mut slot = flight.result.lock().unwrap();
            while slot.is_none() {
                slot = flight.done.wait(slot).unwrap();
            }
            slot.as_ref().cloned().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_concurrent_callers_share_one_computation() {
        let flight: Arc<Singleflight<u64>> = Arc::new(Singleflight::new());
        let computes = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let computes = computes.clone();
            handles.push(std::thread::spawn(move || {
                flight.run("user_1", || {
                    computes.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(50));
                    Ok(42)
                })
            }));
        }
        let results: Vec<u64> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        assert!(results.iter().all(|&v| v == 42));
        // Threads that arrived while the leader was computing must not have
        // recomputed; allow stragglers that arrived after completion.
        assert!(computes.load(Ordering::SeqCst) < 8);
    }

    #[test]
    fn test_different_keys_do_not_block_each_other() {
        let flight: Singleflight<&'static str> = Singleflight::new();
        let a = flight.run("a", || Ok("a_result")).unwrap();
        let b = flight.run("b", || Ok("b_result")).unwrap();
        assert_eq!(a, "a_result");
        assert_eq!(b, "b_result");
    }

    #[test]
    fn test_error_is_shared_and_key_released() {
        let flight: Singleflight<u64> = Singleflight::new();
        let err = flight
            .run("k", || Err(sf_core::TimingError::BackendUnavailable("down".into())))
            .unwrap_err();
        assert_eq!(err.code(), "backend_unavailable");
        // Key released: next run computes fresh.
        assert_eq!(flight.run("k", || Ok(7)).unwrap(), 7);
    }
}
