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

use crate::events::payload::CookieIds;

use serde::{Deserialize, Serialize};

/// Client context fields, derived from request headers and cookies
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ClientContext {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub cookies: CookieIds,
}

/// Extracts first-party identifiers from a raw Cookie header
pub fn cookie_ids_from_header(cookie_header: &str) -> CookieIds {
    let mut ids = CookieIds::default();
    for pair in cookie_header.split(';') {
        let (name, value) = match pair.split_once('=') {
            Some((n, v)) => (n.trim(), v.trim()),
            None => continue,
        };
        if value.is_empty() {
            continue;
        }

        match name {
            "_fbp" => ids.fbp = Some(value.to_string()),
            "_fbc" => ids.fbc = Some(value.to_string()),
            "_ga" => ids.ga_client_id = ga_client_id(value),
            "_gcl_aw" => ids.gclid = value.splitn(3, '.').nth(2).map(String::from),
            _ => {},
        }
    }
    ids
}

/// Turns a `_ga` cookie value (GA1.1.<random>.<timestamp>) into a client ID
fn ga_client_id(cookie_value: &str) -> Option<String> {
    let parts: Vec<&str> = cookie_value.split('.').collect();
    match parts.len() {
        n if n >= 4 => Some(parts[n - 2..].join(".")),
        _ => None,
    }
}
