//! Routing rules
//!
//! Every intercepted GET is classified by the first matching rule, in fixed
//! priority order:
//!
//! 1. exclusion patterns: never intercepted (API, auth, backend hosts)
//! 2. audio patterns: cache-first with expiration in the `audio` generation
//! 3. external/font patterns: cache-first with expiration in `static`
//! 4. exact pre-warm manifest path: cache-first in `static`
//! 5. anything else: network-first with expiration in `dynamic`
//!
//! Patterns are regular expressions matched anywhere in the full request URL.

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use super::generation::GenerationClass;
use super::strategy::Strategy;
use crate::fetch::FetchRequest;
use crate::types::Result;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Pattern lists and max-ages, as deployed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Never intercepted
    pub exclude: Vec<String>,
    /// Audio files and streaming previews
    pub audio: Vec<String>,
    /// Font and CDN hosts
    pub external: Vec<String>,
    pub audio_max_age_secs: u64,
    pub external_max_age_secs: u64,
    pub dynamic_max_age_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            exclude: vec![
                r"/api/".into(),
                r"supabase".into(),
                r"auth".into(),
                r"localhost:54321".into(),
                r"\.supabase\.co".into(),
            ],
            audio: vec![
                r"\.mp3$".into(),
                r"\.wav$".into(),
                r"\.ogg$".into(),
                r"deezer\.com.*preview".into(),
                r"youtube\.com.*audio".into(),
                r"cdns-preview.*\.mp3".into(),
            ],
            external: vec![
                r"fonts\.googleapis\.com".into(),
                r"fonts\.gstatic\.com".into(),
                r"fontawesome".into(),
                r"cdnjs\.cloudflare\.com".into(),
            ],
            audio_max_age_secs: 7 * DAY_SECS,
            external_max_age_secs: 30 * DAY_SECS,
            dynamic_max_age_secs: 60 * 60,
        }
    }
}

/// Where a request goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Not intercepted; the host performs the fetch itself
    Bypass,
    /// Served through `strategy` against the `class` generation
    Cached {
        strategy: Strategy,
        class: GenerationClass,
    },
}

/// Compiled routing table
#[derive(Debug, Clone)]
pub struct RoutingRules {
    exclude: RegexSet,
    audio: RegexSet,
    external: RegexSet,
    static_paths: HashSet<String>,
    audio_max_age: Duration,
    external_max_age: Duration,
    dynamic_max_age: Duration,
}

impl RoutingRules {
    /// Compile `config`; `static_paths` is the pre-warm manifest
    pub fn new(config: &RoutingConfig, static_paths: &[String]) -> Result<Self> {
        Ok(Self {
            exclude: RegexSet::new(&config.exclude)?,
            audio: RegexSet::new(&config.audio)?,
            external: RegexSet::new(&config.external)?,
            static_paths: static_paths.iter().cloned().collect(),
            audio_max_age: Duration::from_secs(config.audio_max_age_secs),
            external_max_age: Duration::from_secs(config.external_max_age_secs),
            dynamic_max_age: Duration::from_secs(config.dynamic_max_age_secs),
        })
    }

    pub fn is_excluded(&self, request: &FetchRequest) -> bool {
        self.exclude.is_match(request.url.as_str())
    }

    /// Whether `path` is one of the pre-warmed shell paths
    pub fn is_static_path(&self, path: &str) -> bool {
        self.static_paths.contains(path)
    }

    pub fn dynamic_max_age(&self) -> Duration {
        self.dynamic_max_age
    }

    pub fn audio_max_age(&self) -> Duration {
        self.audio_max_age
    }

    pub fn classify(&self, request: &FetchRequest) -> Route {
        if !request.is_get() || self.is_excluded(request) {
            return Route::Bypass;
        }

        let url = request.url.as_str();
        if self.audio.is_match(url) {
            return Route::Cached {
                strategy: Strategy::CacheFirstWithExpiration {
                    max_age: self.audio_max_age,
                },
                class: GenerationClass::Audio,
            };
        }
        if self.external.is_match(url) {
            return Route::Cached {
                strategy: Strategy::CacheFirstWithExpiration {
                    max_age: self.external_max_age,
                },
                class: GenerationClass::Static,
            };
        }
        if self.is_static_path(request.path()) {
            return Route::Cached {
                strategy: Strategy::CacheFirst,
                class: GenerationClass::Static,
            };
        }

        Route::Cached {
            strategy: Strategy::NetworkFirstWithExpiration {
                max_age: self.dynamic_max_age,
            },
            class: GenerationClass::Dynamic,
        }
    }
}
