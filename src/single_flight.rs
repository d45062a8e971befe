//! # Single-Flight Gate
//!
//! Collapses concurrent identical requests onto one in-flight producer.
//! The first arrival for a key becomes the leader and runs the producer;
//! every later arrival subscribes to the leader's broadcast and receives
//! the same result, success or error. The entry lives exactly as long as
//! the one generation.

use crate::error::GatewayError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

pub struct SingleFlight<T: Clone> {
    inflight: Mutex<HashMap<String, broadcast::Sender<Result<T, GatewayError>>>>,
}

impl<T: Clone + Send + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Number of keys currently in flight.
    pub fn len(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `producer` for `key`, coalescing with any in-flight run for
    /// the same key. All callers observe the identical result; no caller
    /// observes a partial one.
    pub async fn run<F, Fut>(&self, key: &str, producer: F) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        // Decide leader vs. waiter under the map lock; the lock is never
        // held across an await.
        let waiter = {
            let mut inflight = self.inflight.lock().unwrap();
            match inflight.get(key) {
                Some(sender) => Some(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    inflight.insert(key.to_string(), sender);
                    None
                }
            }
        };

        if let Some(mut receiver) = waiter {
            debug!("joining in-flight generation for {}", &key[..key.len().min(16)]);
            return match receiver.recv().await {
                Ok(result) => result,
                // The leader dropped without broadcasting (panic or
                // cancellation); surface that rather than hanging.
                Err(_) => Err(GatewayError::Internal(
                    "in-flight generation was abandoned".to_string(),
                )),
            };
        }

        let result = producer().await;

        let sender = self.inflight.lock().unwrap().remove(key);
        if let Some(sender) = sender {
            // Ignore the error when no waiter subscribed.
            let _ = sender.send(result.clone());
        }

        result
    }
}

impl<T: Clone + Send + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}
