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

use crate::destinations::Destinations;
use crate::events::{Envelope, QueryParams};
use crate::events::payload::InboundPayload;
use crate::forwarder;
use crate::middleware::{BasicRequestInfo, basic_request_info, compressible_body, content_length_filter, handle_rejection};

use std::sync::Arc;
use byte_unit::Byte as ByteSize;
use serde_json;
use warp;
use warp::Filter;
use warp::http::StatusCode;

/// Event route: parse, hand over to the destinations, answer right away
pub async fn receive_event(
    body: String,
    query: QueryParams,
    request_info: BasicRequestInfo,
    destinations: Arc<Destinations>) -> Result<impl warp::Reply, warp::Rejection> {
    let rid = request_info.request_id.clone().unwrap_or(String::from("-"));

    let payload: InboundPayload = match serde_json::from_str(&body) {
        Ok(p) => p,
        Err(e) => {
            log::debug!(rid = rid; "invalid event payload: {}", e);
            let reply = warp::reply::with_status("KO", StatusCode::BAD_REQUEST);
            return Ok(warp::reply::with_header(reply, "access-control-allow-origin", "*"));
        }
    };

    /* Identifiers sent in the body win over the ones found in cookies */
    let mut client = request_info.client;
    client.cookies = payload.cookie.clone().or(client.cookies);

    let envelope = Envelope {
        request_id: request_info.request_id,
        client,
        query,
        payload,
    };

    /* Fire and forget */
    let _ = forwarder::dispatch(&destinations, envelope);

    let reply = warp::reply::with_status("OK", StatusCode::OK);
    Ok(warp::reply::with_header(reply, "access-control-allow-origin", "*"))
}

/// CORS preflight, on any path
pub fn preflight() -> impl warp::Reply {
    let reply = warp::reply::with_status(warp::reply(), StatusCode::NO_CONTENT);
    let reply = warp::reply::with_header(reply, "access-control-allow-origin", "*");
    let reply = warp::reply::with_header(reply, "access-control-allow-methods", "POST, OPTIONS");
    warp::reply::with_header(reply, "access-control-allow-headers", "Content-Type")
}

fn with_destinations(destinations: Arc<Destinations>) -> impl Filter<Extract = (Arc<Destinations>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || destinations.clone())
}

/// The whole HTTP surface: POST anywhere for events, OPTIONS anywhere for preflights
pub fn api(destinations: Arc<Destinations>, size_limit: ByteSize) -> impl Filter<Extract = (impl warp::Reply,), Error = std::convert::Infallible> + Clone {
    let preflight_route = warp::options().map(preflight);

    let event_route = warp::post()
        .and(content_length_filter(size_limit))
        .and(compressible_body(size_limit))
        .and(warp::query::<QueryParams>())
        .and(basic_request_info())
        .and(with_destinations(destinations))
        .and_then(receive_event);

    preflight_route
        .or(event_route)
        .recover(handle_rejection)
}
