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
use crate::events::payload::{CustomParams, non_blank};
use crate::events::validation::{is_valid_action_source, is_valid_event_time};
use crate::identity::{PhoneFormat, DEFAULT_COUNTRY_CODE, digits_only, hash};

use std::sync::Arc;
use std::fmt::Display;
use async_trait::async_trait;
use serde::Serialize;
use log;

/// Graph API base URL
pub const DEFAULT_ENDPOINT: &str = "https://graph.facebook.com/v18.0";

/// Facebook Conversions API destination
pub struct Facebook {
    http: HttpClient,
    endpoint: String,
    pixel_id: Option<String>,
    access_token: Option<String>,
    test_event_code: Option<String>,
    phone_format: PhoneFormat,
}

/// Request body for /{pixel_id}/events
#[derive(Serialize, Debug)]
struct EventsRequest<'a> {
    data: Vec<ServerEvent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    test_event_code: Option<&'a str>,
}

#[derive(Serialize, Debug)]
struct ServerEvent<'a> {
    event_name: &'a str,
    event_time: i64,
    event_id: &'a str,
    action_source: &'a str,
    event_source_url: &'a str,
    user_data: UserData<'a>,
    custom_data: &'a CustomParams,
}

/// Customer information parameters, PII hashed
#[derive(Serialize, Debug, Default)]
struct UserData<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    em: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ph: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_ip_address: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_user_agent: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fbp: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fbc: Option<&'a str>,
}

impl UserData<'_> {
    /// The API drops events which cannot be matched to anyone
    fn can_match(&self) -> bool {
        self.em.is_some() || self.ph.is_some() || self.external_id.is_some()
            || self.fbp.is_some() || self.fbc.is_some()
            || (self.client_ip_address.is_some() && self.client_user_agent.is_some())
    }
}

fn missing(field: &str) -> ForwardError {
    ForwardError::ValidationFailed(format!("missing {}", field))
}

impl Facebook {
    /// Pixel ID and access token for this request
    fn credentials<'a>(&'a self, envelope: &'a Envelope) -> Result<(&'a str, &'a str), ForwardError> {
        let pixel_id = required(query_or(envelope, "fb_pixel_id", &self.pixel_id), "pixel ID")?;
        let access_token = required(self.access_token.as_deref(), "access token")?;
        if !pixel_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(ForwardError::ValidationFailed(format!("pixel ID should be numeric: {}", pixel_id)));
        }
        Ok((pixel_id, access_token))
    }

    /// Validates the event and builds the request body, no I/O
    fn build_request<'a>(&'a self, envelope: &'a Envelope) -> Result<EventsRequest<'a>, ForwardError> {
        let event = &envelope.payload.event;
        let event_name = non_blank(&event.fb_name).or(non_blank(&event.name)).ok_or_else(|| missing("event.fb_name"))?;
        let event_id = non_blank(&event.id).ok_or_else(|| missing("event.id"))?;
        let action_source = non_blank(&event.source).ok_or_else(|| missing("event.source"))?;
        let event_source_url = non_blank(&event.source_url).ok_or_else(|| missing("event.source_url"))?;
        let triggered_at = event.triggered_at.as_ref().ok_or_else(|| missing("event.triggered_at"))?;

        let event_time = triggered_at.to_datetime()
            .ok_or_else(|| ForwardError::ValidationFailed(format!("unreadable event.triggered_at: {:?}", triggered_at)))?
            .timestamp();
        if !is_valid_event_time(event_time) {
            return Err(ForwardError::ValidationFailed(format!("event_time out of the accepted window: {}", event_time)));
        }

        if !is_valid_action_source(action_source) {
            return Err(ForwardError::ValidationFailed(format!("invalid action_source: {}", action_source)));
        }

        let user = &envelope.payload.user;
        let client = &envelope.client;
        let user_data = UserData {
            em: non_blank(&user.email).map(hash),
            ph: self.phone_format.normalize(non_blank(&user.phone)).map(|p| hash(digits_only(&p))),
            external_id: non_blank(&user.external_id).map(hash),
            client_ip_address: non_blank(&client.ip),
            client_user_agent: non_blank(&client.user_agent),
            fbp: non_blank(&client.cookies.fbp),
            fbc: non_blank(&client.cookies.fbc),
        };
        if !user_data.can_match() {
            return Err(ForwardError::ValidationFailed("no customer information to match the event with".into()));
        }

        Ok(EventsRequest {
            data: vec![ServerEvent {
                event_name,
                event_time,
                event_id,
                action_source,
                event_source_url,
                user_data,
                custom_data: &envelope.payload.custom,
            }],
            test_event_code: self.test_event_code.as_deref(),
        })
    }
}

#[async_trait]
impl Destination for Facebook {
    /// Reads the pixel, token and endpoint settings, falling back to the environment
    fn new(settings: &Settings, http: HttpClient) -> Result<Arc<Self>, DestinationError> {
        let country_code = setting(settings, "phone_country_code", None)?
            .unwrap_or(String::from(DEFAULT_COUNTRY_CODE));
        Ok(Arc::new(Self {
            http,
            endpoint: setting(settings, "endpoint", None)?.unwrap_or(String::from(DEFAULT_ENDPOINT)),
            pixel_id: setting(settings, "pixel_id", Some("FB_PIXEL_ID"))?,
            access_token: setting(settings, "access_token", Some("FB_ACCESS_TOKEN"))?,
            test_event_code: setting(settings, "test_event_code", Some("FB_TEST_EVENT_CODE"))?,
            phone_format: PhoneFormat::for_country(&country_code),
        }))
    }

    async fn forward(&self, envelope: &Envelope) -> ForwardResult {
        let (pixel_id, access_token) = self.credentials(envelope)?;
        let body = self.build_request(envelope)?;

        let url = format!("{}/{}/events", self.endpoint.trim_end_matches('/'), pixel_id);
        let request = self.http.post(&url)
            .query(&[("access_token", access_token)])
            .json(&body);
        let reply = self.http.send(request).await?;
        log::debug!(rid = envelope.rid(); "conversions API replied {}: {}", reply.status, reply.body);
        Ok(())
    }
}

impl Display for Facebook {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        f.write_str("facebook")
    }
}
