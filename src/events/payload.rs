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

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json;
use std::collections::HashMap;

/// Convenience type: custom parameters, passed through as-is
pub type CustomParams = HashMap<String, serde_json::Value>;

/// The body of an inbound request
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct InboundPayload {
    #[serde(default)]
    pub event: InboundEvent,
    #[serde(default)]
    pub user: UserIdentity,
    #[serde(default)]
    pub cookie: CookieIds,
    #[serde(default)]
    pub custom: CustomParams,
}

/// The canonical event description
///
/// Every field is optional at this stage: each destination decides which
/// subset it requires, and rejects the event on its own if something is missing.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct InboundEvent {
    #[serde(default)]
    pub name: Option<String>,
    /// Name override for the conversions API
    #[serde(default)]
    pub fb_name: Option<String>,
    /// Name override for the measurement API
    #[serde(default)]
    pub ga4_name: Option<String>,
    /// Name override for the ads conversion upload
    #[serde(default)]
    pub gads_name: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: Option<String>,
    #[serde(default)]
    pub triggered_at: Option<EventTime>,
    /// Where the event happened (website, app, ...)
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
}

/// Optional PII fields
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct UserIdentity {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub phone: Option<String>,
    #[serde(default, rename = "id", alias = "external_id", deserialize_with = "string_or_number")]
    pub external_id: Option<String>,
}

/// First-party cookie identifiers, as sent by the browser-side snippet
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CookieIds {
    #[serde(default)]
    pub fbp: Option<String>,
    #[serde(default)]
    pub fbc: Option<String>,
    #[serde(default)]
    pub ga_client_id: Option<String>,
    #[serde(default)]
    pub gclid: Option<String>,
}

impl CookieIds {
    /// Fills in any missing identifier from another source
    pub fn or(self, fallback: CookieIds) -> CookieIds {
        CookieIds {
            fbp: self.fbp.or(fallback.fbp),
            fbc: self.fbc.or(fallback.fbc),
            ga_client_id: self.ga_client_id.or(fallback.ga_client_id),
            gclid: self.gclid.or(fallback.gclid),
        }
    }
}

/// When the event was triggered: either an RFC 3339 string or UNIX seconds
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum EventTime {
    Seconds(i64),
    FractionalSeconds(f64),
    Text(String),
}

impl EventTime {
    /// Parses the timestamp, None if it makes no sense
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            EventTime::Seconds(s) => Utc.timestamp_opt(*s, 0).single(),
            EventTime::FractionalSeconds(s) if s.is_finite() => Utc.timestamp_millis_opt((s * 1000.0) as i64).single(),
            EventTime::FractionalSeconds(_) => None,
            EventTime::Text(t) => DateTime::parse_from_rfc3339(t.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .ok(),
        }
    }
}

/// Identifiers often come in as JSON numbers
#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(serde_json::Number),
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<StringOrNumber>::deserialize(deserializer)?.map(|value| match value {
        StringOrNumber::String(s) => s,
        StringOrNumber::Number(n) => n.to_string(),
    }))
}

/// Returns the value unless it is empty or blank
pub fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(|v| v.trim()).filter(|v| !v.is_empty())
}
