/* distrans - a lightweight relay fanning out conversion events to marketing APIs
 * Copyright (C) 2023 Withings
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>. */

pub mod facebook;
pub mod ga4;
pub mod google_ads;
pub mod http;

use crate::config;
use crate::destinations::facebook::Facebook;
use crate::destinations::ga4::Ga4;
use crate::destinations::google_ads::GoogleAds;
use crate::destinations::http::HttpClient;
use crate::events::Envelope;

use std::sync::Arc;
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;
use async_trait::async_trait;

/// Why a single forward did not go through
///
/// None of these ever leave the destination task: they are logged by the
/// forwarder and that's the end of it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForwardError {
    /// Credentials or IDs absent, the destination is skipped
    #[error("not configured: {0}")]
    ConfigMissing(String),

    /// Malformed, incomplete or stale event, nothing was sent
    #[error("invalid event: {0}")]
    ValidationFailed(String),

    /// The token exchange failed or gave no token
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Network error or non-success status from the destination
    #[error("request failed: {0}")]
    TransportFailed(String),

    /// The destination took longer than allowed, the call was cancelled
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl ForwardError {
    /// True if the destination was actually contacted (or tried to be)
    pub fn is_transport(&self) -> bool {
        matches!(self, ForwardError::TransportFailed(_) | ForwardError::Timeout(_))
    }
}

/// Convenience type: forward result (reply given to the forwarder)
pub type ForwardResult = Result<(), ForwardError>;

/// Errors raised while setting destinations up
#[derive(Error, Debug, Clone)]
pub enum DestinationError {
    #[error("failed to initialise destination: {0}")]
    Initialisation(String),
}

/// The Destination trait, all destinations must implement this
#[async_trait]
pub trait Destination: Display + Send + Sync {
    fn new(settings: &config::Settings, http: HttpClient) -> Result<Arc<Self>, DestinationError> where Self: Sized;

    /// Validates, transforms and sends a single event, exactly once
    async fn forward(&self, envelope: &Envelope) -> ForwardResult;
}

/// Convenience type: destinations array
pub type Destinations = Vec<Arc<dyn Destination>>;

/// Provides an array of destination structs based on the configuration file
pub fn init_destinations(destination_configs: &[config::Destination], http: &HttpClient) -> Result<Destinations, DestinationError> {
    let mut destinations: Destinations = vec!();
    for destination_config in destination_configs.iter() {
        let settings = &destination_config.settings;
        match destination_config.destination_type.as_str() {
            "facebook" => destinations.push(Facebook::new(settings, http.clone())?),
            "ga4" => destinations.push(Ga4::new(settings, http.clone())?),
            "google_ads" => destinations.push(GoogleAds::new(settings, http.clone())?),
            other => return Err(DestinationError::Initialisation(format!("unknown destination type: {}", other)))
        }
    }
    Ok(destinations)
}

/// Reads a scalar setting, falling back to an environment variable
pub fn setting(settings: &config::Settings, key: &str, env_var: Option<&str>) -> Result<Option<String>, DestinationError> {
    let from_file = match settings.get(key) {
        None | Some(serde_yaml::Value::Null) => None,
        Some(serde_yaml::Value::String(s)) => Some(s.trim().to_string()),
        Some(serde_yaml::Value::Number(n)) => Some(n.to_string()),
        Some(_) => return Err(DestinationError::Initialisation(format!("{} parameter should be a string", key))),
    };

    Ok(from_file
        .or_else(|| env_var.and_then(|var| std::env::var(var).ok()))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty()))
}

/// Picks a per-request value from the query string, or the configured one
pub fn query_or<'a>(envelope: &'a Envelope, query_key: &str, configured: &'a Option<String>) -> Option<&'a str> {
    envelope.query_param(query_key).or(configured.as_deref())
}

/// Fails with ConfigMissing when a value is absent
pub fn required<'a>(value: Option<&'a str>, what: &str) -> Result<&'a str, ForwardError> {
    value.ok_or_else(|| ForwardError::ConfigMissing(format!("missing {}", what)))
}
