//! Owned metrics sink.
//!
//! Counters accumulate into the current frame; [`Metrics::rotate`] closes the
//! frame into a bounded history. A flusher task rotates on a fixed period and
//! hands each closed frame to a callback (usually a log line).

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::lock::mutex_lock;

const SOURCE: &str = "metrics";

/// Default flush period (5 seconds).
pub const DEFAULT_FLUSH_PERIOD: Duration = Duration::from_secs(5);

/// Default number of retained frames (15 minutes at the default period).
pub const DEFAULT_FRAME_CAPACITY: usize = 180;

/// Countable events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Total,
    CacheFetch,
    CacheFetchError,
    CacheWrite,
    CacheWriteError,
    CachePurge,
    CachePurgeError,
    FlightCreated,
    WaiterInserted,
    UpstreamFetch,
    UpstreamTimeout,
}

impl Action {
    pub const ALL: [Action; 11] = [
        Action::Total,
        Action::CacheFetch,
        Action::CacheFetchError,
        Action::CacheWrite,
        Action::CacheWriteError,
        Action::CachePurge,
        Action::CachePurgeError,
        Action::FlightCreated,
        Action::WaiterInserted,
        Action::UpstreamFetch,
        Action::UpstreamTimeout,
    ];
}

/// Byte volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Volume {
    CacheFetch,
    CacheWrite,
    UpstreamFetch,
}

impl Volume {
    pub const ALL: [Volume; 3] = [Volume::CacheFetch, Volume::CacheWrite, Volume::UpstreamFetch];
}

/// One closed accounting window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub actions: BTreeMap<Action, u64>,
    pub bytes: BTreeMap<Volume, u64>,
}

impl Frame {
    pub fn action(&self, action: Action) -> u64 {
        self.actions.get(&action).copied().unwrap_or(0)
    }

    pub fn bytes(&self, volume: Volume) -> u64 {
        self.bytes.get(&volume).copied().unwrap_or(0)
    }
}

struct History {
    started_at: DateTime<Utc>,
    frames: VecDeque<Frame>,
}

/// Counter sink owned by the proxy and shared with its collaborators.
pub struct Metrics {
    actions: [AtomicU64; Action::ALL.len()],
    bytes: [AtomicU64; Volume::ALL.len()],
    capacity: usize,
    history: Mutex<History>,
}

impl Metrics {
    pub fn new(capacity: usize) -> Self {
        Self {
            actions: std::array::from_fn(|_| AtomicU64::new(0)),
            bytes: std::array::from_fn(|_| AtomicU64::new(0)),
            capacity: capacity.max(1),
            history: Mutex::new(History { started_at: Utc::now(), frames: VecDeque::new() }),
        }
    }

    pub fn record(&self, action: Action) {
        self.actions[action as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, volume: Volume, amount: usize) {
        self.bytes[volume as usize].fetch_add(amount as u64, Ordering::Relaxed);
    }

    /// Value accumulated in the current, still open frame.
    pub fn current(&self, action: Action) -> u64 {
        self.actions[action as usize].load(Ordering::Relaxed)
    }

    pub fn current_bytes(&self, volume: Volume) -> u64 {
        self.bytes[volume as usize].load(Ordering::Relaxed)
    }

    /// Close the current frame, push it onto the history and return it.
    pub fn rotate(&self) -> Frame {
        let mut history = mutex_lock(&self.history, SOURCE, "rotate");
        let now = Utc::now();
        let frame = Frame {
            started_at: history.started_at,
            ended_at: now,
            actions: Action::ALL
                .iter()
                .map(|&a| (a, self.actions[a as usize].swap(0, Ordering::Relaxed)))
                .collect(),
            bytes: Volume::ALL
                .iter()
                .map(|&v| (v, self.bytes[v as usize].swap(0, Ordering::Relaxed)))
                .collect(),
        };
        history.started_at = now;
        if history.frames.len() == self.capacity {
            history.frames.pop_front();
        }
        history.frames.push_back(frame.clone());
        frame
    }

    /// Closed frames, oldest first.
    pub fn frames(&self) -> Vec<Frame> {
        mutex_lock(&self.history, SOURCE, "frames").frames.iter().cloned().collect()
    }

    /// Rotate every `period` and pass each closed frame to `on_flush`.
    pub fn spawn_flusher<F>(self: &Arc<Self>, period: Duration, mut on_flush: F) -> JoinHandle<()>
    where
        F: FnMut(&Frame) + Send + 'static,
    {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let frame = metrics.rotate();
                on_flush(&frame);
            }
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_CAPACITY)
    }
}
