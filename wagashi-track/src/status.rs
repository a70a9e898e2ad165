//! Short free-text status lines for the driver's timeline.
//!
//! The text itself comes from a [`StatusGenerator`] (a hosted language
//! model in production, [`PhraseGenerator`] offline). Whatever the
//! generator does, [`compose_status`] always yields something printable:
//! failures and empty answers become the configured fallback line, and long
//! answers are cut to the configured length.

use std::future::Future;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Places the driver might be passing, picked at random per request.
pub const LOCATION_CONTEXTS: [&str; 5] = [
    "cherry-blossom avenue",
    "the shopping arcade",
    "the main road",
    "a quiet residential street",
    "the riverside",
];

/// Inputs for one status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusContext {
    pub weather: String,
    pub location: String,
    pub traffic: String,
}

impl StatusContext {
    /// Fine weather, smooth traffic, random location.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let location = LOCATION_CONTEXTS
            .choose(rng)
            .copied()
            .unwrap_or("the main road");
        Self {
            weather: "sunny".to_string(),
            location: location.to_string(),
            traffic: "smooth".to_string(),
        }
    }
}

/// Bounds applied to generated text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Longest accepted line, in characters.
    pub max_chars: usize,
    /// Used whenever generation fails.
    pub fallback: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            max_chars: 80,
            fallback: "Driving safely on the way to you.".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status generation failed: {0}")]
    Failed(String),

    #[error("generator returned no text")]
    Empty,
}

/// Source of status lines.
pub trait StatusGenerator: Send + Sync + 'static {
    fn generate(&self, context: StatusContext) -> impl Future<Output = Result<String, StatusError>> + Send;
}

/// Offline generator composing a line from the context.
#[derive(Debug, Clone, Default)]
pub struct PhraseGenerator;

impl StatusGenerator for PhraseGenerator {
    fn generate(&self, context: StatusContext) -> impl Future<Output = Result<String, StatusError>> + Send {
        let templates: [fn(&StatusContext) -> String; 3] = [
            |c| format!("Passing {}. Please get the tea ready!", c.location),
            |c| format!("Traffic is {} near {}, sweets are on their way.", c.traffic, c.location),
            |c| format!("A {} day along {}. Almost there.", c.weather, c.location),
        ];
        let pick = rand::thread_rng().gen_range(0..templates.len());
        std::future::ready(Ok(templates[pick](&context)))
    }
}

/// Generate a status line, never failing.
pub async fn compose_status<G: StatusGenerator + ?Sized>(
    generator: &G,
    context: StatusContext,
    config: &StatusConfig,
) -> String {
    let text = match generator.generate(context).await {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => {
            log::warn!("Status generation returned nothing; using fallback");
            return config.fallback.clone();
        }
        Err(e) => {
            log::warn!("Status generation failed: {e}; using fallback");
            return config.fallback.clone();
        }
    };
    text.trim().chars().take(config.max_chars).collect()
}
