pub mod broadcast;
pub mod cache;
pub mod engine;
pub mod messages;
pub mod params;
pub mod web;

// internal modules exposed for the binary, not part of the public API
#[doc(hidden)]
pub mod config;

use crate::config::Settings;

/// Options for launching the server.
pub struct RunOptions {
    pub settings: Settings,
    pub port: Option<u16>,
    pub debug: bool,
}

impl RunOptions {
    pub fn new(settings: Settings) -> Self {
        RunOptions {
            settings,
            port: None,
            debug: false,
        }
    }
}
