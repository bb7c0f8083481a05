//! ConnectionRegistry - live subscribers per endpoint
//!
//! Every subscriber owns a bounded queue. Broadcasting never waits: a full
//! queue means the subscriber is too slow, so it is dropped and its close token
//! fired, leaving everyone else on the endpoint untouched.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Frame;

pub type SubscriberId = u64;

/// Receiving side handed to whoever serves the connection
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub endpoint: String,
    pub frames: mpsc::Receiver<Arc<Frame>>,
    /// Fired when the registry drops this subscriber
    pub closed: CancellationToken,
}

#[derive(Debug)]
struct Subscriber {
    sender: mpsc::Sender<Arc<Frame>>,
    closed: CancellationToken,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct Endpoint {
    subscribers: HashMap<SubscriberId, Subscriber>,
    latest: Option<Arc<Frame>>,
    connects: u64,
    disconnects: u64,
    overflows: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub active: usize,
    pub total_connects: u64,
    pub total_disconnects: u64,
    pub overflow_drops: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub total_active: usize,
    pub endpoints: BTreeMap<String, EndpointStats>,
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    queue_capacity: usize,
    next_id: AtomicU64,
    endpoints: Mutex<HashMap<String, Endpoint>>,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(1),
            next_id: AtomicU64::new(1),
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    fn endpoints(&self) -> MutexGuard<'_, HashMap<String, Endpoint>> {
        self.endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a subscriber; the latest cached snapshot is queued immediately
    pub fn register(&self, endpoint: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, frames) = mpsc::channel(self.queue_capacity);
        let closed = CancellationToken::new();

        let active = {
            let mut endpoints = self.endpoints();
            let state = endpoints.entry(endpoint.to_string()).or_default();

            if let Some(latest) = &state.latest {
                // fresh queue, cannot be full
                let _ = sender.try_send(latest.clone());
            }

            state.subscribers.insert(
                id,
                Subscriber {
                    sender,
                    closed: closed.clone(),
                    last_seen: Instant::now(),
                },
            );
            state.connects += 1;
            state.subscribers.len()
        };

        info!("subscriber {id} attached to {endpoint} ({active} active)");

        Subscription {
            id,
            endpoint: endpoint.to_string(),
            frames,
            closed,
        }
    }

    /// Detach a subscriber; returns whether it was still registered
    pub fn unregister(&self, endpoint: &str, id: SubscriberId) -> bool {
        let removed = {
            let mut endpoints = self.endpoints();
            endpoints.get_mut(endpoint).and_then(|state| {
                let subscriber = state.subscribers.remove(&id)?;
                state.disconnects += 1;
                Some(subscriber)
            })
        };

        match removed {
            Some(subscriber) => {
                subscriber.closed.cancel();
                info!("subscriber {id} detached from {endpoint}");
                true
            }
            None => false,
        }
    }

    /// Push a frame to every subscriber of `endpoint`; returns how many accepted it
    pub fn broadcast(
        &self,
        endpoint: &str,
        frame_type: &str,
        data: impl Serialize,
    ) -> usize {
        self.publish(endpoint, Frame::new(frame_type, data), false)
    }

    /// Like [`broadcast`](Self::broadcast), and remember the frame for late subscribers
    pub fn broadcast_snapshot(
        &self,
        endpoint: &str,
        frame_type: &str,
        data: impl Serialize,
    ) -> usize {
        self.publish(endpoint, Frame::new(frame_type, data), true)
    }

    /// Replace the cached snapshot without sending it
    pub fn set_latest(&self, endpoint: &str, frame: Frame) {
        self.endpoints()
            .entry(endpoint.to_string())
            .or_default()
            .latest = Some(Arc::new(frame));
    }

    pub fn latest(&self, endpoint: &str) -> Option<Arc<Frame>> {
        self.endpoints()
            .get(endpoint)
            .and_then(|state| state.latest.clone())
    }

    pub fn publish(&self, endpoint: &str, frame: Frame, cache: bool) -> usize {
        let frame = Arc::new(frame);
        let mut dropped = vec![];

        let delivered = {
            let mut endpoints = self.endpoints();
            let Some(state) = endpoints.get_mut(endpoint) else {
                if cache {
                    endpoints.insert(
                        endpoint.to_string(),
                        Endpoint {
                            latest: Some(frame),
                            ..Default::default()
                        },
                    );
                }
                return 0;
            };

            if cache {
                state.latest = Some(frame.clone());
            }

            let mut delivered = 0;
            state.subscribers.retain(|id, subscriber| {
                match subscriber.sender.try_send(frame.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        warn!("subscriber {id} on {endpoint} is too slow, disconnecting");
                        dropped.push((subscriber.closed.clone(), true));
                        false
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("subscriber {id} on {endpoint} went away");
                        dropped.push((subscriber.closed.clone(), false));
                        false
                    }
                }
            });

            for (_, overflow) in &dropped {
                state.disconnects += 1;
                if *overflow {
                    state.overflows += 1;
                }
            }

            delivered
        };

        for (closed, _) in dropped {
            closed.cancel();
        }

        delivered
    }

    /// Mark a subscriber as alive (pong or any inbound message)
    pub fn touch(&self, endpoint: &str, id: SubscriberId) {
        if let Some(subscriber) = self
            .endpoints()
            .get_mut(endpoint)
            .and_then(|state| state.subscribers.get_mut(&id))
        {
            subscriber.last_seen = Instant::now();
        }
    }

    /// Drop subscribers not seen within `max_silence`; returns how many were reaped
    pub fn reap_stale(&self, max_silence: Duration) -> usize {
        let now = Instant::now();
        let mut reaped = vec![];

        {
            let mut endpoints = self.endpoints();
            for (endpoint, state) in endpoints.iter_mut() {
                let before = state.subscribers.len();
                state.subscribers.retain(|id, subscriber| {
                    let alive = now.saturating_duration_since(subscriber.last_seen) < max_silence;
                    if !alive {
                        warn!("subscriber {id} on {endpoint} missed heartbeats, disconnecting");
                        reaped.push(subscriber.closed.clone());
                    }
                    alive
                });
                state.disconnects += (before - state.subscribers.len()) as u64;
            }
        }

        for closed in &reaped {
            closed.cancel();
        }

        reaped.len()
    }

    pub fn connection_count(&self, endpoint: &str) -> usize {
        self.endpoints()
            .get(endpoint)
            .map_or(0, |state| state.subscribers.len())
    }

    pub fn stats(&self) -> ConnectionStats {
        let endpoints = self.endpoints();

        let endpoints: BTreeMap<String, EndpointStats> = endpoints
            .iter()
            .map(|(name, state)| {
                (
                    name.clone(),
                    EndpointStats {
                        active: state.subscribers.len(),
                        total_connects: state.connects,
                        total_disconnects: state.disconnects,
                        overflow_drops: state.overflows,
                    },
                )
            })
            .collect();

        ConnectionStats {
            total_active: endpoints.values().map(|stats| stats.active).sum(),
            endpoints,
        }
    }

    /// Disconnect everyone
    pub fn close_all(&self) {
        let closed: Vec<CancellationToken> = {
            let mut endpoints = self.endpoints();
            endpoints
                .values_mut()
                .flat_map(|state| {
                    state.disconnects += state.subscribers.len() as u64;
                    state.subscribers.drain().map(|(_, s)| s.closed)
                })
                .collect()
        };

        for token in closed {
            token.cancel();
        }
    }
}
