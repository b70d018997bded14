//! Logging setup through the public API
//!
//! Parsing is covered by unit tests; these check subscriber installation,
//! which is process-global and so lives in its own test binary.

use simulated_city::observability::{init_logging, parse_level, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse_whitespace() {
    assert_eq!(LogFormat::parse("  json  "), LogFormat::Json);
    assert_eq!(LogFormat::parse("json\n"), LogFormat::Json);
    assert_eq!(LogFormat::parse("\tpretty"), LogFormat::Pretty);
}

#[test]
fn test_parse_level_round_trips_display() {
    for level in [Level::ERROR, Level::WARN, Level::INFO, Level::DEBUG, Level::TRACE] {
        assert_eq!(parse_level(&level.to_string()), level);
    }
}

#[test]
fn test_init_logging_installs_once() {
    // Only one global subscriber per process: the first call may win, the
    // rest must report false instead of panicking
    let first = init_logging(Level::DEBUG, LogFormat::Compact, false);
    let second = init_logging(Level::INFO, LogFormat::Json, true);
    let third = init_logging(Level::TRACE, LogFormat::Pretty, false);

    assert!(!second);
    assert!(!third);
    // Logging macros work whichever subscriber is installed
    tracing::info!(installed = first, "logging initialized");
}
