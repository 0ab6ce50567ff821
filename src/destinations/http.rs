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

use crate::destinations::{DestinationError, ForwardError};

use std::time::Duration;
use reqwest::{Client, RequestBuilder};
use tokio;
use log;

/// Default bound on every outbound call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A destination's reply to a successful call
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: String,
}

/// Outbound HTTP client shared by destinations, with a per-call time bound
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self, DestinationError> {
        let client = Client::builder()
            .user_agent(concat!("distrans/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DestinationError::Initialisation(format!("HTTP client: {}", e)))?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.client.post(url)
    }

    /// Sends a request exactly once, response body included in the time bound
    ///
    /// The call is dropped (and thus cancelled) if the bound is exceeded.
    /// Non-2xx responses are errors, carrying the response body.
    pub async fn send(&self, request: RequestBuilder) -> Result<Reply, ForwardError> {
        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Err(_) => Err(ForwardError::Timeout(self.timeout)),
            Ok(Err(e)) => Err(ForwardError::TransportFailed(e.to_string())),
            Ok(Ok((status, body))) => {
                log::trace!("destination replied {}: {}", status, body);
                match status.is_success() {
                    true => Ok(Reply { status: status.as_u16(), body }),
                    false => Err(ForwardError::TransportFailed(format!("HTTP {}: {}", status.as_u16(), body.trim()))),
                }
            }
        }
    }
}
