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
use crate::identity::{PhoneFormat, DEFAULT_COUNTRY_CODE, hash};

use std::sync::Arc;
use std::fmt::Display;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json;
use log;

/// Google Ads REST API base URL
pub const DEFAULT_ENDPOINT: &str = "https://googleads.googleapis.com/v14";
/// OAuth 2.0 token exchange URL
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
/// Currency used when the event does not say
pub const DEFAULT_CURRENCY: &str = "BRL";

/// Google Ads click conversion upload destination
pub struct GoogleAds {
    http: HttpClient,
    endpoint: String,
    token_endpoint: String,
    developer_token: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    refresh_token: Option<String>,
    customer_id: Option<String>,
    login_customer_id: Option<String>,
    currency: String,
    phone_format: PhoneFormat,
}

/// Everything needed to talk to the API for one request
struct Credentials<'a> {
    developer_token: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
    refresh_token: &'a str,
    customer_id: String,
}

#[derive(Deserialize, Debug)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Serialize, Debug)]
struct UploadRequest<'a> {
    conversions: Vec<ClickConversion<'a>>,
    partial_failure: bool,
}

#[derive(Serialize, Debug)]
struct ClickConversion<'a> {
    conversion_action: String,
    conversion_date_time: String,
    conversion_value: f64,
    currency_code: &'a str,
    user_identifiers: Vec<UserIdentifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gclid: Option<&'a str>,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
enum UserIdentifier {
    HashedEmail(String),
    HashedPhoneNumber(String),
}

fn invalid(message: &str) -> ForwardError {
    ForwardError::ValidationFailed(message.to_string())
}

/// Customer IDs are often written 123-456-7890
fn clean_customer_id(raw: &str) -> Result<String, ForwardError> {
    let cleaned: String = raw.chars().filter(|c| *c != '-').collect();
    match !cleaned.is_empty() && cleaned.chars().all(|c| c.is_ascii_digit()) {
        true => Ok(cleaned),
        false => Err(ForwardError::ValidationFailed(format!("customer ID should be numeric: {}", raw))),
    }
}

/// Reads a number which may have been sent as a string
fn as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl GoogleAds {
    fn credentials<'a>(&'a self, envelope: &'a Envelope) -> Result<Credentials<'a>, ForwardError> {
        let customer_id = required(query_or(envelope, "gads_customer_id", &self.customer_id), "customer ID")?;
        Ok(Credentials {
            developer_token: required(self.developer_token.as_deref(), "developer token")?,
            client_id: required(query_or(envelope, "gads_client_id", &self.client_id), "OAuth client ID")?,
            client_secret: required(self.client_secret.as_deref(), "OAuth client secret")?,
            refresh_token: required(self.refresh_token.as_deref(), "OAuth refresh token")?,
            customer_id: clean_customer_id(customer_id)?,
        })
    }

    /// Validates the event and builds the upload body, no I/O
    fn build_upload<'a>(&'a self, envelope: &'a Envelope, customer_id: &str) -> Result<UploadRequest<'a>, ForwardError> {
        let event = &envelope.payload.event;
        let custom = &envelope.payload.custom;

        let name = non_blank(&event.gads_name).or(non_blank(&event.name)).ok_or_else(|| invalid("missing event.gads_name"))?;
        let triggered_at = event.triggered_at.as_ref().ok_or_else(|| invalid("missing event.triggered_at"))?;
        let conversion_action = match custom.get("conversion_action") {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return Err(invalid("missing custom.conversion_action")),
        };
        /* A bare ID is expanded into a resource name */
        let conversion_action = match conversion_action.chars().all(|c| c.is_ascii_digit()) {
            true => format!("customers/{}/conversionActions/{}", customer_id, conversion_action),
            false => conversion_action,
        };

        let triggered_at = triggered_at.to_datetime()
            .ok_or_else(|| ForwardError::ValidationFailed(format!("unreadable event.triggered_at: {:?}", triggered_at)))?;
        if !is_valid_event_time(triggered_at.timestamp()) {
            return Err(ForwardError::ValidationFailed(format!("conversion_date_time out of the accepted window: {}", triggered_at)));
        }

        let user = &envelope.payload.user;
        let email = non_blank(&user.email);
        let phone = non_blank(&user.phone);
        if email.is_none() && phone.is_none() {
            return Err(invalid("missing user.email and user.phone"));
        }

        let mut user_identifiers = vec!();
        if let Some(email) = email {
            user_identifiers.push(UserIdentifier::HashedEmail(hash(email)));
        }
        match self.phone_format.normalize(phone) {
            Some(normalised) => user_identifiers.push(UserIdentifier::HashedPhoneNumber(hash(&normalised))),
            None if phone.is_some() => log::debug!(rid = envelope.rid(); "ignoring phone number which cannot be normalised"),
            None => {},
        }
        if user_identifiers.is_empty() {
            return Err(invalid("no usable user identifier"));
        }

        let conversion_value = match custom.get("value") {
            None | Some(serde_json::Value::Null) => 0.0,
            Some(v) => as_number(v).ok_or_else(|| ForwardError::ValidationFailed(format!("invalid custom.value: {}", v)))?,
        };
        let currency_code = custom.get("currency")
            .and_then(|c| c.as_str())
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .unwrap_or(self.currency.as_str());

        log::debug!(rid = envelope.rid(); "uploading {} as {}", name, conversion_action);
        Ok(UploadRequest {
            conversions: vec![ClickConversion {
                conversion_action,
                conversion_date_time: triggered_at.format("%Y-%m-%d %H:%M:%S%:z").to_string(),
                conversion_value,
                currency_code,
                user_identifiers,
                gclid: non_blank(&envelope.client.cookies.gclid),
            }],
            partial_failure: true,
        })
    }

    /// Exchanges the refresh token for a short-lived access token
    async fn authenticate(&self, credentials: &Credentials<'_>) -> Result<String, ForwardError> {
        let request = self.http.post(&self.token_endpoint)
            .form(&[
                ("client_id", credentials.client_id),
                ("client_secret", credentials.client_secret),
                ("refresh_token", credentials.refresh_token),
                ("grant_type", "refresh_token"),
            ]);

        let reply = self.http.send(request).await.map_err(|e| match e {
            ForwardError::TransportFailed(message) => ForwardError::AuthFailed(message),
            other => other,
        })?;

        let token: TokenResponse = serde_json::from_str(&reply.body)
            .map_err(|e| ForwardError::AuthFailed(format!("unreadable token response: {}", e)))?;
        token.access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ForwardError::AuthFailed("no access token in response".into()))
    }
}

#[async_trait]
impl Destination for GoogleAds {
    fn new(settings: &Settings, http: HttpClient) -> Result<Arc<Self>, DestinationError> {
        let country_code = setting(settings, "phone_country_code", None)?
            .unwrap_or(String::from(DEFAULT_COUNTRY_CODE));
        Ok(Arc::new(Self {
            http,
            endpoint: setting(settings, "endpoint", None)?.unwrap_or(String::from(DEFAULT_ENDPOINT)),
            token_endpoint: setting(settings, "token_endpoint", None)?.unwrap_or(String::from(DEFAULT_TOKEN_ENDPOINT)),
            developer_token: setting(settings, "developer_token", Some("GADS_DEVELOPER_TOKEN"))?,
            client_id: setting(settings, "client_id", Some("GADS_CLIENT_ID"))?,
            client_secret: setting(settings, "client_secret", Some("GADS_CLIENT_SECRET"))?,
            refresh_token: setting(settings, "refresh_token", Some("GADS_REFRESH_TOKEN"))?,
            customer_id: setting(settings, "customer_id", Some("GADS_CUSTOMER_ID"))?,
            login_customer_id: setting(settings, "login_customer_id", Some("GADS_LOGIN_CUSTOMER_ID"))?,
            currency: setting(settings, "currency", None)?.unwrap_or(String::from(DEFAULT_CURRENCY)),
            phone_format: PhoneFormat::for_country(&country_code),
        }))
    }

    async fn forward(&self, envelope: &Envelope) -> ForwardResult {
        let credentials = self.credentials(envelope)?;
        let body = self.build_upload(envelope, &credentials.customer_id)?;
        let access_token = self.authenticate(&credentials).await?;

        let url = format!("{}/customers/{}:uploadClickConversions", self.endpoint.trim_end_matches('/'), credentials.customer_id);
        let mut request = self.http.post(&url)
            .bearer_auth(&access_token)
            .header("developer-token", credentials.developer_token)
            .json(&body);
        if let Some(login_customer_id) = self.login_customer_id.as_deref() {
            request = request.header("login-customer-id", login_customer_id.replace('-', ""));
        }

        let reply = self.http.send(request).await?;

        /* With partial_failure, rejected conversions still come back as 200 */
        let response: serde_json::Value = serde_json::from_str(&reply.body).unwrap_or_default();
        let partial_failure = response.get("partialFailureError").or(response.get("partial_failure_error"));
        if let Some(partial_failure) = partial_failure.filter(|p| !p.is_null()) {
            return Err(ForwardError::TransportFailed(format!("partial failure: {}", partial_failure)));
        }

        log::debug!(rid = envelope.rid(); "ads API replied {}: {}", reply.status, reply.body);
        Ok(())
    }
}

impl Display for GoogleAds {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        f.write_str("google_ads")
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockServer, browser, envelope, seconds_ago};
    use std::time::Duration;
    use serde_json::json;

    const TOKEN_REPLY: &str = "{\"access_token\":\"ya29.token\",\"expires_in\":3599,\"token_type\":\"Bearer\"}";

    fn google_ads(server: &MockServer, timeout: Duration) -> Arc<GoogleAds> {
        let settings: Settings = serde_yaml::from_str(&format!(
            "endpoint: {}\ntoken_endpoint: {}\ndeveloper_token: dev-token\nclient_secret: client-secret\nrefresh_token: refresh-me\nlogin_customer_id: 111-222-3333",
            server.url("/v14"), server.url("/token")
        )).unwrap();
        GoogleAds::new(&settings, HttpClient::new(timeout).unwrap()).unwrap()
    }

    fn lead(triggered_at: &str) -> serde_json::Value {
        json!({
            "event": { "gads_name": "lead", "triggered_at": triggered_at },
            "user": { "email": "Test@Example.com", "phone": "(11) 98765-4321" },
            "cookie": { "gclid": "Cj0KCQ" },
            "custom": { "conversion_action": "987654", "value": "150.5" }
        })
    }

    const QUERY: [(&str, &str); 2] = [("gads_client_id", "client.apps.googleusercontent.com"), ("gads_customer_id", "123-456-7890")];

    #[tokio::test]
    async fn exchanges_token_then_uploads() {
        let server = MockServer::start().await;
        server.respond_on("/token", 200, TOKEN_REPLY);
        let destination = google_ads(&server, Duration::from_secs(5));
        let envelope = envelope(lead(&seconds_ago(3600)), &QUERY, browser());

        destination.forward(&envelope).await.unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 2);

        let form = requests[0].form();
        assert_eq!(requests[0].path, "/token");
        assert_eq!(form.get("client_id").map(String::as_str), Some("client.apps.googleusercontent.com"));
        assert_eq!(form.get("client_secret").map(String::as_str), Some("client-secret"));
        assert_eq!(form.get("refresh_token").map(String::as_str), Some("refresh-me"));
        assert_eq!(form.get("grant_type").map(String::as_str), Some("refresh_token"));

        let upload = &requests[1];
        assert_eq!(upload.path, "/v14/customers/1234567890:uploadClickConversions");
        assert_eq!(upload.headers.get("authorization").map(String::as_str), Some("Bearer ya29.token"));
        assert_eq!(upload.headers.get("developer-token").map(String::as_str), Some("dev-token"));
        assert_eq!(upload.headers.get("login-customer-id").map(String::as_str), Some("1112223333"));

        let body = upload.json();
        assert_eq!(body["partial_failure"], true);
        let conversion = &body["conversions"][0];
        assert_eq!(conversion["conversion_action"], "customers/1234567890/conversionActions/987654");
        assert_eq!(conversion["conversion_value"], 150.5);
        assert_eq!(conversion["currency_code"], "BRL");
        assert_eq!(conversion["gclid"], "Cj0KCQ");
        assert_eq!(conversion["user_identifiers"], json!([
            { "hashed_email": hash("test@example.com") },
            { "hashed_phone_number": hash("+5511987654321") },
        ]));
        let date_time = conversion["conversion_date_time"].as_str().unwrap();
        assert!(date_time.ends_with("+00:00"));
        assert_eq!(date_time.len(), "2024-03-01 12:00:00+00:00".len());
    }

    #[tokio::test]
    async fn unnamed_events_are_rejected_before_authenticating() {
        let server = MockServer::start().await;
        let destination = google_ads(&server, Duration::from_secs(5));
        let mut body = lead(&seconds_ago(60));
        body["event"] = json!({ "triggered_at": seconds_ago(60) });
        let envelope = envelope(body, &QUERY, browser());

        assert_eq!(
            destination.forward(&envelope).await,
            Err(ForwardError::ValidationFailed("missing event.gads_name".into()))
        );
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn failed_token_exchange_skips_upload() {
        let server = MockServer::start().await;
        server.respond_on("/token", 400, "{\"error\":\"invalid_grant\"}");
        let destination = google_ads(&server, Duration::from_secs(5));
        let envelope = envelope(lead(&seconds_ago(60)), &QUERY, browser());

        match destination.forward(&envelope).await {
            Err(ForwardError::AuthFailed(message)) => assert!(message.contains("invalid_grant")),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn token_response_without_token_is_an_auth_failure() {
        let server = MockServer::start().await;
        server.respond_on("/token", 200, "{\"token_type\":\"Bearer\"}");
        let destination = google_ads(&server, Duration::from_secs(5));
        let envelope = envelope(lead(&seconds_ago(60)), &QUERY, browser());

        assert_eq!(
            destination.forward(&envelope).await,
            Err(ForwardError::AuthFailed("no access token in response".into()))
        );
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn partial_failures_are_reported() {
        let server = MockServer::start().await;
        server.respond_on("/token", 200, TOKEN_REPLY);
        server.respond_on("/v14", 200, "{\"partialFailureError\":{\"code\":3,\"message\":\"The imported conversion action is not found\"}}");
        let destination = google_ads(&server, Duration::from_secs(5));
        let envelope = envelope(lead(&seconds_ago(60)), &QUERY, browser());

        match destination.forward(&envelope).await {
            Err(ForwardError::TransportFailed(message)) => assert!(message.contains("not found")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn stale_events_never_reach_the_network() {
        let server = MockServer::start().await;
        let destination = google_ads(&server, Duration::from_secs(5));
        let envelope = envelope(lead(&seconds_ago(8 * 86_400)), &QUERY, browser());

        assert!(matches!(destination.forward(&envelope).await, Err(ForwardError::ValidationFailed(_))));
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn identifiers_are_required() {
        let server = MockServer::start().await;
        let destination = google_ads(&server, Duration::from_secs(5));
        let mut body = lead(&seconds_ago(60));
        body["user"] = json!({ "id": "u-42" });
        let envelope = envelope(body, &QUERY, browser());

        assert_eq!(
            destination.forward(&envelope).await,
            Err(ForwardError::ValidationFailed("missing user.email and user.phone".into()))
        );

        let mut body = lead(&seconds_ago(60));
        body["user"] = json!({ "phone": "123" });
        let envelope = crate::testing::envelope(body, &QUERY, browser());
        assert_eq!(
            destination.forward(&envelope).await,
            Err(ForwardError::ValidationFailed("no usable user identifier".into()))
        );
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn conversion_action_is_required() {
        let server = MockServer::start().await;
        let destination = google_ads(&server, Duration::from_secs(5));
        let mut body = lead(&seconds_ago(60));
        body["custom"] = json!({ "value": 10 });
        let envelope = envelope(body, &QUERY, browser());

        assert_eq!(
            destination.forward(&envelope).await,
            Err(ForwardError::ValidationFailed("missing custom.conversion_action".into()))
        );
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn missing_customer_id_skips_the_destination() {
        let server = MockServer::start().await;
        let destination = google_ads(&server, Duration::from_secs(5));
        let envelope = envelope(lead(&seconds_ago(60)), &[("gads_client_id", "client")], browser());

        assert!(matches!(destination.forward(&envelope).await, Err(ForwardError::ConfigMissing(_))));
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn slow_token_exchange_times_out() {
        let server = MockServer::start().await;
        server.respond_on("/token", 200, TOKEN_REPLY);
        server.delay_by(Duration::from_secs(10));
        let destination = google_ads(&server, Duration::from_millis(200));
        let envelope = envelope(lead(&seconds_ago(60)), &QUERY, browser());

        assert_eq!(destination.forward(&envelope).await, Err(ForwardError::Timeout(Duration::from_millis(200))));
        let paths: Vec<String> = server.requests().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/token"]);
    }

    #[tokio::test]
    async fn slow_upload_times_out_after_authenticating() {
        let server = MockServer::start().await;
        server.respond_on("/token", 200, TOKEN_REPLY);
        server.delay_on("/v14", Duration::from_secs(10));
        let destination = google_ads(&server, Duration::from_millis(200));
        let envelope = envelope(lead(&seconds_ago(60)), &QUERY, browser());

        let started = std::time::Instant::now();
        assert_eq!(destination.forward(&envelope).await, Err(ForwardError::Timeout(Duration::from_millis(200))));
        assert!(started.elapsed() < Duration::from_secs(5));

        let paths: Vec<String> = server.requests().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/token", "/v14/customers/1234567890:uploadClickConversions"]);
    }

    #[test]
    fn customer_ids() {
        assert_eq!(clean_customer_id("123-456-7890").unwrap(), "1234567890");
        assert!(clean_customer_id("../admin").is_err());
        assert!(clean_customer_id("-").is_err());
    }
}
