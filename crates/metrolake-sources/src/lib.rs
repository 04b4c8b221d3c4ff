//! metrolake-sources: Source adapters for the subway data lake
//!
//! Each adapter lazily fetches raw records for a time window from one
//! upstream feed. The variant is picked from configuration (`kind`).
//!
//! - `stop_events`: GTFS stop-time events with delays (JSON feed per date)
//! - `weather`: Open-Meteo hourly archive
//! - `socrata`: NY open-data APIs (official alerts, permitted events)
//! - `static`: fixed records (tests, replays from a JSON file)

pub mod adapter;
pub mod config;
pub mod socrata;
pub mod static_records;
pub mod stop_events;
pub mod weather;

pub use adapter::{Drained, FetchWindow, RecordStream, SourceAdapter, drain};
pub use config::{SourceConfig, SourceKind, build_source};
pub use socrata::SocrataSource;
pub use static_records::StaticSource;
pub use stop_events::StopEventsSource;
pub use weather::WeatherSource;
