//! Driver-side geolocation.
//!
//! ```text
//!            start() + source supported
//!   Inactive ───────────────────────────► Watching
//!      ▲                                     │
//!      └──────── stop() / drop ◄─────────────┘
//! ```
//!
//! A [`PositionSource`] hands out a [`PositionWatch`] subscription; the
//! subscription is released when the watch is dropped, so leaving the
//! `Watching` state by any path (explicit stop, session teardown, panic
//! unwinding) unsubscribes from the platform.
//!
//! Failed fixes are reported but never end the watch.

pub mod feed;
pub mod route;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::protocol::Coordinates;

pub use feed::{FeedSource, Feeder};
pub use route::{RouteConfig, RouteSimulator};

/// Subscription options, mirroring what location platforms accept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    /// Fixes older than this are discarded.
    pub maximum_age_ms: u64,
    /// Longest wait for the next fix before reporting a timeout.
    pub timeout_ms: u64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            maximum_age_ms: 1_000,
            timeout_ms: 20_000,
        }
    }
}

impl WatchOptions {
    pub fn maximum_age(&self) -> Duration {
        Duration::from_millis(self.maximum_age_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A position reading and when it was taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub coords: Coordinates,
    pub taken_at: Instant,
}

impl Fix {
    pub fn now(coords: Coordinates) -> Self {
        Self {
            coords,
            taken_at: Instant::now(),
        }
    }
}

/// Geolocation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GeoError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("position unavailable")]
    PositionUnavailable,

    #[error("timed out waiting for a position fix")]
    Timeout,

    #[error("geolocation is not supported on this platform")]
    Unsupported,
}

/// Something that can produce a continuous stream of fixes.
pub trait PositionSource {
    /// Whether the platform has a location capability at all.
    fn is_supported(&self) -> bool {
        true
    }

    /// Subscribe to continuous updates.
    fn watch(&self, options: &WatchOptions) -> Result<PositionWatch, GeoError>;
}

/// An active subscription. Dropping it unsubscribes.
pub struct PositionWatch {
    fixes: mpsc::Receiver<Result<Fix, GeoError>>,
    maximum_age: Duration,
    timeout: Duration,
    deadline: Instant,
    on_stop: Option<Box<dyn FnOnce() + Send>>,
}

impl PositionWatch {
    /// Wrap a fix channel. `on_stop` runs exactly once, when the watch is
    /// dropped.
    pub fn new(
        fixes: mpsc::Receiver<Result<Fix, GeoError>>,
        options: &WatchOptions,
        on_stop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            fixes,
            maximum_age: options.maximum_age(),
            timeout: options.timeout(),
            deadline: Instant::now() + options.timeout(),
            on_stop: Some(Box::new(on_stop)),
        }
    }

    /// Next fresh fix, or the reason there isn't one.
    ///
    /// Cancel-safe: the timeout deadline survives being dropped mid-wait.
    /// `None` means the source went away for good.
    pub async fn next_fix(&mut self) -> Option<Result<Coordinates, GeoError>> {
        loop {
            match tokio::time::timeout_at(self.deadline, self.fixes.recv()).await {
                Err(_) => {
                    self.deadline = Instant::now() + self.timeout;
                    return Some(Err(GeoError::Timeout));
                }
                Ok(None) => return None,
                Ok(Some(Ok(fix))) => {
                    if fix.taken_at.elapsed() > self.maximum_age {
                        log::debug!("Discarding stale fix");
                        continue;
                    }
                    self.deadline = Instant::now() + self.timeout;
                    return Some(Ok(fix.coords));
                }
                Ok(Some(Err(e))) => {
                    self.deadline = Instant::now() + self.timeout;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl Drop for PositionWatch {
    fn drop(&mut self) {
        if let Some(stop) = self.on_stop.take() {
            stop();
        }
    }
}

/// Watcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Inactive,
    Watching,
}

/// Owns at most one [`PositionWatch`] at a time.
pub struct GeolocationWatcher<P> {
    source: P,
    options: WatchOptions,
    watch: Option<PositionWatch>,
}

impl<P: PositionSource> GeolocationWatcher<P> {
    pub fn new(source: P, options: WatchOptions) -> Self {
        Self {
            source,
            options,
            watch: None,
        }
    }

    pub fn state(&self) -> WatcherState {
        if self.watch.is_some() {
            WatcherState::Watching
        } else {
            WatcherState::Inactive
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watch.is_some()
    }

    /// Enter `Watching`. No-op if already watching.
    pub fn start(&mut self) -> Result<(), GeoError> {
        if self.watch.is_some() {
            return Ok(());
        }
        if !self.source.is_supported() {
            return Err(GeoError::Unsupported);
        }
        self.watch = Some(self.source.watch(&self.options)?);
        log::info!(
            "Watching position (high accuracy: {}, timeout: {:?})",
            self.options.high_accuracy,
            self.options.timeout()
        );
        Ok(())
    }

    /// Leave `Watching`, releasing the subscription. Idempotent.
    pub fn stop(&mut self) {
        if self.watch.take().is_some() {
            log::info!("Stopped watching position");
        }
    }

    /// Wait for the next fix. Pends forever while inactive; drops back to
    /// `Inactive` if the source disappears.
    pub async fn next_fix(&mut self) -> Option<Result<Coordinates, GeoError>> {
        let Some(watch) = self.watch.as_mut() else {
            return std::future::pending().await;
        };
        let next = watch.next_fix().await;
        if next.is_none() {
            log::warn!("Position source ended");
            self.watch = None;
        }
        next
    }
}
