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

use crate::config::Settings;
use crate::destinations::{Destination, DestinationError, ForwardError, ForwardResult, query_or, required, setting};
use crate::destinations::http::HttpClient;
use crate::events::Envelope;
use crate::events::payload::non_blank;
use crate::events::validation::is_valid_event_time;

use std::sync::Arc;
use std::fmt::Display;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json;
use log;

/// Measurement Protocol collection URL
pub const DEFAULT_ENDPOINT: &str = "https://www.google-analytics.com/mp/collect";
/// Longest event name GA4 accepts
const MAX_EVENT_NAME_LENGTH: usize = 40;

/// GA4 Measurement Protocol destination
pub struct Ga4 {
    http: HttpClient,
    endpoint: String,
    measurement_id: Option<String>,
    api_secret: Option<String>,
}

#[derive(Serialize, Debug)]
struct MeasurementRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<&'a str>,
    timestamp_micros: i64,
    events: Vec<MeasurementEvent<'a>>,
}

#[derive(Serialize, Debug)]
struct MeasurementEvent<'a> {
    name: &'a str,
    params: serde_json::Map<String, serde_json::Value>,
}

/// Letters, digits and underscores, starting with a letter
fn is_valid_event_name(name: &str) -> bool {
    name.len() <= MAX_EVENT_NAME_LENGTH
        && name.chars().next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Ga4 {
    fn build_request<'a>(&'a self, envelope: &'a Envelope) -> Result<MeasurementRequest<'a>, ForwardError> {
        let event = &envelope.payload.event;
        let name = non_blank(&event.ga4_name).or(non_blank(&event.name))
            .ok_or_else(|| ForwardError::ValidationFailed("missing event.ga4_name".into()))?;
        let page_location = non_blank(&event.source_url)
            .ok_or_else(|| ForwardError::ValidationFailed("missing event.source_url".into()))?;
        if !is_valid_event_name(name) {
            return Err(ForwardError::ValidationFailed(format!("invalid event name: {}", name)));
        }

        /* The timestamp is optional here, but has to make sense when given */
        let triggered_at = match &event.triggered_at {
            Some(t) => t.to_datetime()
                .ok_or_else(|| ForwardError::ValidationFailed(format!("unreadable event.triggered_at: {:?}", t)))?,
            None => Utc::now(),
        };
        if !is_valid_event_time(triggered_at.timestamp()) {
            return Err(ForwardError::ValidationFailed(format!("event time out of the accepted window: {}", triggered_at)));
        }

        let client_id = non_blank(&envelope.client.cookies.ga_client_id);
        let user_id = non_blank(&envelope.payload.user.external_id);
        if client_id.is_none() && user_id.is_none() {
            return Err(ForwardError::ValidationFailed("missing client_id and user_id".into()));
        }

        let mut params = serde_json::Map::new();
        params.insert("page_location".into(), page_location.into());
        if let Some(id) = non_blank(&event.id) {
            params.insert("event_id".into(), id.into());
        }
        for (key, value) in &envelope.payload.custom {
            params.insert(key.clone(), value.clone());
        }

        Ok(MeasurementRequest {
            client_id,
            user_id,
            timestamp_micros: triggered_at.timestamp_micros(),
            events: vec![MeasurementEvent { name, params }],
        })
    }
}

#[async_trait]
impl Destination for Ga4 {
    fn new(settings: &Settings, http: HttpClient) -> Result<Arc<Self>, DestinationError> {
        Ok(Arc::new(Self {
            http,
            endpoint: setting(settings, "endpoint", None)?.unwrap_or(String::from(DEFAULT_ENDPOINT)),
            measurement_id: setting(settings, "measurement_id", Some("GA4_MEASUREMENT_ID"))?,
            api_secret: setting(settings, "api_secret", Some("GA4_API_SECRET"))?,
        }))
    }

    async fn forward(&self, envelope: &Envelope) -> ForwardResult {
        let measurement_id = required(query_or(envelope, "ga_measurement_id", &self.measurement_id), "measurement ID")?;
        let api_secret = required(self.api_secret.as_deref(), "API secret")?;
        let body = self.build_request(envelope)?;

        let request = self.http.post(&self.endpoint)
            .query(&[("measurement_id", measurement_id), ("api_secret", api_secret)])
            .json(&body);
        let reply = self.http.send(request).await?;
        log::debug!(rid = envelope.rid(); "measurement API replied {}", reply.status);
        Ok(())
    }
}

impl Display for Ga4 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        f.write_str("ga4")
    }
}
