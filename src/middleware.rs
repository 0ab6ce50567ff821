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

use crate::events::context::{ClientContext, cookie_ids_from_header};

use warp;
use warp::Filter;
use warp::http::StatusCode;
use byte_unit::Byte as ByteSize;
use std::convert::Infallible;
use std::io::prelude::*;
use std::net::SocketAddr;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::read::{GzDecoder, DeflateDecoder};
use futures_util::{Stream, StreamExt};


#[derive(Debug)]
pub struct UnsupportedCompression;
impl warp::reject::Reject for UnsupportedCompression {}

#[derive(Debug)]
pub struct DecompressionError;
impl warp::reject::Reject for DecompressionError {}

#[derive(Debug)]
pub struct NonUTF8Payload;
impl warp::reject::Reject for NonUTF8Payload {}

#[derive(Debug)]
pub struct UnreadableBody;
impl warp::reject::Reject for UnreadableBody {}

/// Reads the body, inflating it if needed, never holding more than the limit (0 to disable)
pub fn compressible_body(size_limit: ByteSize) -> impl Filter<Extract = (String, ), Error = warp::Rejection> + Clone {
    warp::header::optional::<String>("content-encoding")
        .and(limited_body(size_limit))
        .and_then(move |encoding: Option<String>, body: Bytes| async move {
            decode_body(encoding.as_deref(), &body, size_limit.as_u64())
        })
}

/// Buffers the body chunk by chunk, whether or not a Content-Length was announced
fn limited_body(size_limit: ByteSize) -> impl Filter<Extract = (Bytes, ), Error = warp::Rejection> + Clone {
    warp::body::stream().and_then(move |stream| collect_body(stream, size_limit.as_u64()))
}

async fn collect_body<S, B>(stream: S, bytes_max: u64) -> Result<Bytes, warp::Rejection>
where
    S: Stream<Item = Result<B, warp::Error>>,
    B: Buf,
{
    let mut stream = Box::pin(stream);
    let mut body = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|_| warp::reject::custom(UnreadableBody))?;
        if bytes_max != 0 && (body.len() + chunk.remaining()) as u64 > bytes_max {
            return Err(warp::reject::custom(PayloadTooLarge));
        }
        body.put(chunk);
    }
    Ok(body.freeze())
}

fn decode_body(encoding: Option<&str>, body: &[u8], bytes_max: u64) -> Result<String, warp::Rejection> {
    let algorithm = encoding.map(|e| e.trim().to_ascii_lowercase()).unwrap_or_default();
    let bytes = match algorithm.as_str() {
        "" | "identity" => body.to_vec(),
        "gzip" => inflate(GzDecoder::new(body), bytes_max)?,
        "deflate" => inflate(DeflateDecoder::new(body), bytes_max)?,
        _ => return Err(warp::reject::custom(UnsupportedCompression)),
    };
    String::from_utf8(bytes).map_err(|_| warp::reject::custom(NonUTF8Payload))
}

/// Decompresses at most one byte past the limit
fn inflate<R: Read>(decoder: R, bytes_max: u64) -> Result<Vec<u8>, warp::Rejection> {
    let cap = match bytes_max {
        0 => u64::MAX,
        max => max.saturating_add(1),
    };
    let mut inflated = vec!();
    decoder.take(cap).read_to_end(&mut inflated).map_err(|_| warp::reject::custom(DecompressionError))?;
    match bytes_max != 0 && inflated.len() as u64 > bytes_max {
        true => Err(warp::reject::custom(PayloadTooLarge)),
        false => Ok(inflated),
    }
}


#[derive(Debug)]
pub struct PayloadTooLarge;
impl warp::reject::Reject for PayloadTooLarge {}

/// Refuses bodies announced as larger than the limit (0 to disable)
pub fn content_length_filter(size_limit: ByteSize) -> impl Filter<Extract = (), Error = warp::Rejection> + Clone {
    warp::header::optional::<u64>("content-length").and_then(move |length: Option<u64>| async move {
        let bytes_max = size_limit.as_u64();
        match length {
            Some(length) if bytes_max != 0 && length > bytes_max => Err(warp::reject::custom(PayloadTooLarge)),
            _ => Ok(())
        }
    }).untuple_one()
}


/// Request-level information, built from headers
pub struct BasicRequestInfo {
    pub client: ClientContext,
    pub request_id: Option<String>,
}

fn infer_client_ip(
    connecting_ip: Option<String>,
    x_forwarded_for: Option<String>,
    x_real_ip: Option<String>,
    remote_addr: Option<SocketAddr>) -> Option<String> {
    connecting_ip
        .or_else(|| x_forwarded_for.and_then(|forwarded_for| forwarded_for.split(',').next().map(|s| s.trim().to_string())))
        .or(x_real_ip)
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .or_else(|| remote_addr.map(|addr| addr.ip().to_string()))
}

pub fn basic_request_info() -> impl Filter<Extract = (BasicRequestInfo,), Error = warp::Rejection> + Clone {
    warp::header::optional::<String>("cf-connecting-ip")
        .and(warp::header::optional::<String>("x-forwarded-for"))
        .and(warp::header::optional::<String>("x-real-ip"))
        .and(warp::addr::remote())
        .and(warp::header::optional::<String>("user-agent"))
        .and(warp::header::optional::<String>("x-request-id"))
        .and(warp::header::optional::<String>("cookie"))
        .map(|connecting_ip: Option<String>,
              forwarded_for: Option<String>,
              real_ip: Option<String>,
              remote_addr: Option<SocketAddr>,
              user_agent: Option<String>,
              request_id: Option<String>,
              cookie: Option<String>| BasicRequestInfo {
            client: ClientContext {
                ip: infer_client_ip(connecting_ip, forwarded_for, real_ip, remote_addr),
                user_agent,
                cookies: cookie.map(|c| cookie_ids_from_header(&c)).unwrap_or_default(),
            },
            request_id,
        })
}


pub fn request_logger(request_info: warp::log::Info) {
    let headers = request_info.request_headers();
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(String::from);
    let request_id = header("x-request-id").unwrap_or(String::from("?"));
    let client_ip = infer_client_ip(
        header("cf-connecting-ip"),
        header("x-forwarded-for"),
        header("x-real-ip"),
        request_info.remote_addr()
    ).unwrap_or(String::from("?"));
    let content_length = header("content-length").unwrap_or(String::from("0"));

    log::info!(
        "[request] [{}] {} {} {:?} from {} length {} status {}",
        request_id,
        request_info.method(),
        request_info.path(),
        request_info.version(),
        client_ip,
        content_length,
        request_info.status().as_u16(),
    );
}


pub async fn handle_rejection(rejection: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
    log::debug!("rejecting request: {:?}", rejection);

    let status = if let Some(PayloadTooLarge) = rejection.find() {
        StatusCode::PAYLOAD_TOO_LARGE
    } else if let Some(UnsupportedCompression) = rejection.find() {
        StatusCode::UNSUPPORTED_MEDIA_TYPE
    } else if let Some(DecompressionError) = rejection.find() {
        StatusCode::BAD_REQUEST
    } else if let Some(NonUTF8Payload) = rejection.find() {
        StatusCode::BAD_REQUEST
    } else if let Some(UnreadableBody) = rejection.find() {
        StatusCode::BAD_REQUEST
    } else if let Some(_) = rejection.find::<warp::reject::LengthRequired>() {
        StatusCode::LENGTH_REQUIRED
    } else if rejection.find::<warp::reject::InvalidQuery>().is_some()
        || rejection.find::<warp::reject::InvalidHeader>().is_some()
        || rejection.find::<warp::reject::MissingHeader>().is_some()
        || rejection.find::<warp::filters::body::BodyDeserializeError>().is_some() {
        /* a POST which went wrong, not the method refused by other routes */
        StatusCode::BAD_REQUEST
    } else if let Some(_) = rejection.find::<warp::reject::MethodNotAllowed>() {
        StatusCode::METHOD_NOT_ALLOWED
    } else if rejection.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::BAD_REQUEST
    };

    Ok(warp::reply::with_status("KO", status))
}
