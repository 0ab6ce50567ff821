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

use chrono::Utc;

/// Maximum age of an event, in seconds (7 days, inclusive)
pub const MAX_EVENT_AGE: i64 = 60 * 60 * 24 * 7;

/// Action sources accepted by the conversions API
pub const ACTION_SOURCES: [&str; 8] = [
    "website",
    "app",
    "email",
    "phone_call",
    "chat",
    "physical_store",
    "system_generated",
    "other",
];

/// True if the event is neither in the future nor older than 7 days
pub fn is_valid_event_time(timestamp: i64) -> bool {
    is_valid_event_time_at(timestamp, Utc::now().timestamp())
}

/// Same as is_valid_event_time, against an explicit clock
pub fn is_valid_event_time_at(timestamp: i64, now: i64) -> bool {
    match now.checked_sub(timestamp) {
        Some(age) => (0..=MAX_EVENT_AGE).contains(&age),
        None => false,
    }
}

pub fn is_valid_action_source(source: &str) -> bool {
    ACTION_SOURCES.contains(&source)
}
