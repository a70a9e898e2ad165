//! Simulated position source that walks a fixed route.
//!
//! Linear interpolation between consecutive waypoints, one fix per tick.
//! After the last waypoint the driver "waits at the door": the final
//! position keeps being reported until the watch is dropped.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{Fix, GeoError, PositionSource, PositionWatch, WatchOptions};
use crate::protocol::Coordinates;

/// Route description, usually from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub waypoints: Vec<Coordinates>,
    pub tick_ms: u64,
    /// Interpolated fixes between two waypoints.
    pub steps_between: u32,
}

impl Default for RouteConfig {
    fn default() -> Self {
        // Nihonbashi to Tokyo Station.
        Self {
            waypoints: vec![
                Coordinates::new(35.6840, 139.7745),
                Coordinates::new(35.6828, 139.7701),
                Coordinates::new(35.6812, 139.7671),
            ],
            tick_ms: 1_000,
            steps_between: 10,
        }
    }
}

/// Walks a [`RouteConfig`].
#[derive(Debug, Clone)]
pub struct RouteSimulator {
    route: RouteConfig,
}

impl RouteSimulator {
    pub fn new(route: RouteConfig) -> Self {
        Self { route }
    }

    /// Every position the route visits, in order.
    pub fn path(&self) -> Vec<Coordinates> {
        let waypoints = &self.route.waypoints;
        let steps = self.route.steps_between.max(1);
        let mut path = Vec::new();
        for pair in waypoints.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            for step in 0..steps {
                let t = f64::from(step) / f64::from(steps);
                path.push(Coordinates::new(
                    from.latitude + (to.latitude - from.latitude) * t,
                    from.longitude + (to.longitude - from.longitude) * t,
                ));
            }
        }
        if let Some(last) = waypoints.last() {
            path.push(*last);
        }
        path
    }
}

impl PositionSource for RouteSimulator {
    fn watch(&self, options: &WatchOptions) -> Result<PositionWatch, GeoError> {
        let path = self.path();
        let Some(&last) = path.last() else {
            return Err(GeoError::PositionUnavailable);
        };
        let tick = Duration::from_millis(self.route.tick_ms.max(1));
        let (tx, rx) = mpsc::channel(8);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            let mut positions = path.into_iter().chain(std::iter::repeat(last));
            loop {
                interval.tick().await;
                let Some(coords) = positions.next() else { break };
                if tx.send(Ok(Fix::now(coords))).await.is_err() {
                    break;
                }
            }
        });

        Ok(PositionWatch::new(rx, options, move || task.abort()))
    }
}
