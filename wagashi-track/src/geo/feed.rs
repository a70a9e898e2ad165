//! Push-driven position source.
//!
//! Bridges whatever location API the host platform has: the platform side
//! keeps a [`Feeder`] and pushes fixes or errors into it; the tracker side
//! watches the matching [`FeedSource`]. Pushes made while nobody watches
//! are dropped, which is also how the platform can tell it may power the
//! receiver down.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use super::{Fix, GeoError, PositionSource, PositionWatch, WatchOptions};
use crate::protocol::Coordinates;

const FEED_CAPACITY: usize = 32;

struct FeedState {
    supported: bool,
    subscriber: Option<mpsc::Sender<Result<Fix, GeoError>>>,
}

type Shared = Arc<Mutex<FeedState>>;

fn lock(shared: &Shared) -> MutexGuard<'_, FeedState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracker-side half.
#[derive(Clone)]
pub struct FeedSource {
    shared: Shared,
}

/// Platform-side half.
#[derive(Clone)]
pub struct Feeder {
    shared: Shared,
}

impl FeedSource {
    pub fn new() -> (Self, Feeder) {
        let shared = Arc::new(Mutex::new(FeedState {
            supported: true,
            subscriber: None,
        }));
        (
            Self {
                shared: shared.clone(),
            },
            Feeder { shared },
        )
    }

    /// A source for a platform without any location capability.
    pub fn unsupported() -> Self {
        Self {
            shared: Arc::new(Mutex::new(FeedState {
                supported: false,
                subscriber: None,
            })),
        }
    }
}

impl PositionSource for FeedSource {
    fn is_supported(&self) -> bool {
        lock(&self.shared).supported
    }

    fn watch(&self, options: &WatchOptions) -> Result<PositionWatch, GeoError> {
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        {
            let mut state = lock(&self.shared);
            if !state.supported {
                return Err(GeoError::Unsupported);
            }
            state.subscriber = Some(tx);
        }
        let shared = self.shared.clone();
        Ok(PositionWatch::new(rx, options, move || {
            lock(&shared).subscriber = None;
        }))
    }
}

impl Feeder {
    /// Deliver a fresh fix. Returns `false` if nobody is watching or the
    /// watcher is too far behind to take it.
    pub fn push(&self, coords: Coordinates) -> bool {
        self.deliver(Ok(Fix::now(coords)))
    }

    /// Deliver a fix taken earlier.
    pub fn push_fix(&self, fix: Fix) -> bool {
        self.deliver(Ok(fix))
    }

    /// Report a failed fix.
    pub fn fail(&self, error: GeoError) -> bool {
        self.deliver(Err(error))
    }

    /// Whether a watcher is currently subscribed.
    pub fn is_watched(&self) -> bool {
        lock(&self.shared).subscriber.is_some()
    }

    fn deliver(&self, item: Result<Fix, GeoError>) -> bool {
        let state = lock(&self.shared);
        match &state.subscriber {
            Some(tx) => tx.try_send(item).is_ok(),
            None => false,
        }
    }
}
