//! Startup fixtures: the default site and optional newline-delimited JSON
//! events.

use std::io::BufRead;

use anyhow::{Context, Result};

use pulse_core::analytics::SiteConfig;
use pulse_core::event::Event;

pub const DEFAULT_SITE_ID: &str = "site_default";

pub fn default_site() -> SiteConfig {
    SiteConfig {
        id: DEFAULT_SITE_ID.to_string(),
        name: "Default".to_string(),
        timezone: "UTC".to_string(),
        public: false,
    }
}

/// Parse one JSON event per line. Blank lines are skipped.
pub fn read_events(reader: impl BufRead) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line)
            .with_context(|| format!("invalid event on line {}", index + 1))?;
        events.push(event);
    }
    Ok(events)
}

pub fn read_events_file(path: &str) -> Result<Vec<Event>> {
    let file = std::fs::File::open(path).with_context(|| format!("opening {path}"))?;
    read_events(std::io::BufReader::new(file))
}
