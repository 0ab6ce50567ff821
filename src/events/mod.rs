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

pub mod context;
pub mod payload;
pub mod validation;

use crate::events::context::ClientContext;
use crate::events::payload::InboundPayload;

use std::collections::HashMap;

/// Convenience type: query parameters of the inbound request
pub type QueryParams = HashMap<String, String>;

/// Everything a destination gets to work with for a single inbound event
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// Request ID, for logging
    pub request_id: Option<String>,
    pub client: ClientContext,
    pub query: QueryParams,
    pub payload: InboundPayload,
}

impl Envelope {
    /// Returns a non-empty query parameter
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    /// Request ID for log lines
    pub fn rid(&self) -> &str {
        self.request_id.as_deref().unwrap_or("-")
    }
}
