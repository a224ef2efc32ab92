//! Grayscale filter core: exclusion matching, the media-page heuristic, the
//! versioned settings store, schedule and pause alarms, and the effect
//! applicator that paints browser tabs.

pub mod alarms;
pub mod api;
pub mod background;
pub mod backup;
pub mod effect;
pub mod media;
pub mod messages;
pub mod pause;
pub mod schedule;
pub mod settings;
pub mod store;
pub mod tabs;
pub mod url_match;
