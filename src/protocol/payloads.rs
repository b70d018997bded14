//! Typed JSON payloads shipped with the template
//!
//! Agents are free to publish any JSON value; these builders exist for the
//! canonical city topics so every agent produces the same shape.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default `source` for weather payloads
pub const DEFAULT_WEATHER_SOURCE: &str = "agent_weather";

/// Payload validation errors
#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("weather_state must be 'sunny' or 'rain', got '{0}'")]
    InvalidWeatherState(String),
    #[error("tick must be >= 0, got {0}")]
    NegativeTick(i64),
}

/// Weather conditions known to the city
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherState {
    Sunny,
    Rain,
}

impl WeatherState {
    /// Parse after trimming and lowercasing
    pub fn parse(raw: &str) -> Result<Self, PayloadError> {
        match raw.trim().to_lowercase().as_str() {
            "sunny" => Ok(Self::Sunny),
            "rain" => Ok(Self::Rain),
            _ => Err(PayloadError::InvalidWeatherState(raw.to_string())),
        }
    }
}

/// Message published on the weather topics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherPayload {
    pub source: String,
    pub weather_state: WeatherState,
    pub tick: u64,
    /// RFC 3339 UTC timestamp with a `Z` suffix
    pub timestamp: String,
}

impl WeatherPayload {
    /// Build a validated weather payload stamped with the current time
    pub fn new(weather_state: &str, tick: i64, source: Option<&str>) -> Result<Self, PayloadError> {
        let weather_state = WeatherState::parse(weather_state)?;
        if tick < 0 {
            return Err(PayloadError::NegativeTick(tick));
        }

        Ok(Self {
            source: source.unwrap_or(DEFAULT_WEATHER_SOURCE).to_string(),
            weather_state,
            tick: tick as u64,
            timestamp: utc_timestamp(),
        })
    }
}

/// Current UTC time, e.g. `2024-05-01T12:00:00.123456Z`
pub fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
