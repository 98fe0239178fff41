use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::FlumeError;

const CONSUMPTION_REQUEST_ID: &str = "consumption";
const CONSUMPTION_BUCKET: &str = "MIN";
const QUERY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// OAuth credential set, loaded once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
}

/// A bearer token plus the account id extracted from its claims. Replaced
/// wholesale on reauthentication, never partially mutated.
#[derive(Debug, Clone)]
pub struct Token {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    /// Account id decoded from the token's claims without signature
    /// verification. Used only for addressing `/users/{id}/...` requests;
    /// no trust decision depends on it.
    pub subject_id: Option<String>,
}

impl Token {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty() && now < self.expires_at
    }
}

/// One device as reported by the Flume device listing. Immutable snapshot;
/// the cache replaces the full set on refresh.
#[derive(Debug, Clone)]
pub struct Device {
    pub id: String,
    pub product: String,
    pub location_id: String,
    pub kind: Option<i64>,
    pub connected: bool,
}

impl Device {
    /// Display name derived deterministically from the product string. The
    /// rule is fixed so metric series stay comparable across restarts.
    pub fn display_name(&self) -> String {
        let product = self.product.trim();
        let product = if product.is_empty() { "Unknown" } else { product };
        format!("Flume {product}")
    }

    fn from_value(value: &JsonValue) -> Option<Device> {
        let id = value.get("id").and_then(parse_id)?;
        let product = value
            .get("product")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        let location_id = value
            .get("location_id")
            .or_else(|| value.get("location").and_then(|l| l.get("id")))
            .and_then(parse_id)
            .unwrap_or_default();
        let kind = value.get("type").and_then(|v| v.as_i64());
        let connected = value
            .get("connected")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        Some(Device {
            id,
            product,
            location_id,
            kind,
            connected,
        })
    }
}

/// One fixed-width consumption sample from a bucketed query.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumptionBucket {
    pub datetime: String,
    pub value: f64,
}

#[derive(Deserialize)]
struct TokenEnvelope {
    #[serde(default)]
    data: Vec<TokenGrant>,
}

#[derive(Deserialize)]
struct TokenGrant {
    #[serde(default)]
    access_token: String,
    expires_in: i64,
}

#[derive(Deserialize)]
struct DevicesEnvelope {
    #[serde(default)]
    data: Vec<JsonValue>,
}

#[derive(Deserialize)]
struct QueryEnvelope {
    #[serde(default)]
    data: Vec<JsonValue>,
}

#[derive(Deserialize)]
struct ActiveEnvelope {
    #[serde(default)]
    data: Vec<ActiveReading>,
}

#[derive(Deserialize)]
struct ActiveReading {
    gpm: Option<f64>,
}

/// Authenticated client for the Flume cloud API. Owns the OAuth token
/// lifecycle: every call obtains its bearer header through `ensure_token`,
/// so an expired token transparently triggers one reauthentication first.
pub struct FlumeClient {
    http: Client,
    base_url: String,
    credentials: Credentials,
    token: RwLock<Option<Token>>,
}

impl FlumeClient {
    pub fn new(http: Client, base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            credentials,
            token: RwLock::new(None),
        }
    }

    /// Returns the cached token when still valid, otherwise authenticates and
    /// replaces it wholesale. Two tasks racing here would both reauthenticate;
    /// with a single polling task that never happens.
    pub async fn ensure_token(&self) -> Result<Token, FlumeError> {
        {
            let guard = self.token.read().await;
            if let Some(token) = guard.as_ref() {
                if token.is_valid(Utc::now()) {
                    return Ok(token.clone());
                }
            }
        }

        let fresh = self.authenticate().await?;
        *self.token.write().await = Some(fresh.clone());
        Ok(fresh)
    }

    async fn authenticate(&self) -> Result<Token, FlumeError> {
        let url = format!("{}/oauth/token", self.base_url);
        let body = json!({
            "grant_type": "password",
            "client_id": self.credentials.client_id,
            "client_secret": self.credentials.client_secret,
            "username": self.credentials.username,
            "password": self.credentials.password,
        });

        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let envelope: TokenEnvelope = decode_json(response).await?;
        let grant = envelope
            .data
            .into_iter()
            .next()
            .ok_or_else(|| FlumeError::Shape("token response carried no grant".to_string()))?;
        if grant.access_token.is_empty() {
            return Err(FlumeError::Authentication(
                "token response carried an empty access_token".to_string(),
            ));
        }

        let subject_id = decode_subject_id(&grant.access_token);
        if subject_id.is_none() {
            warn!("could not decode subject id from access token; device listing will fail");
        }
        info!("authenticated with Flume API");

        Ok(Token {
            access_token: grant.access_token,
            expires_at: Utc::now() + ChronoDuration::seconds(grant.expires_in),
            subject_id,
        })
    }

    async fn authorized_subject(&self) -> Result<(Token, String), FlumeError> {
        let token = self.ensure_token().await?;
        let subject = token.subject_id.clone().ok_or_else(|| {
            FlumeError::Authentication(
                "subject id unresolved; cannot address user-scoped endpoints".to_string(),
            )
        })?;
        Ok((token, subject))
    }

    /// Lists the account's devices. Entries without an id are skipped.
    pub async fn devices(&self) -> Result<Vec<Device>, FlumeError> {
        let (token, subject) = self.authorized_subject().await?;
        let url = format!("{}/users/{}/devices", self.base_url, subject);
        let response = self
            .http
            .get(url)
            .bearer_auth(&token.access_token)
            .send()
            .await?
            .error_for_status()?;
        let envelope: DevicesEnvelope = decode_json(response).await?;
        Ok(envelope.data.iter().filter_map(Device::from_value).collect())
    }

    /// Queries one-minute consumption buckets between two instants. The server
    /// caps a query at roughly 1440 buckets, so callers keep spans under 24h.
    pub async fn consumption(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ConsumptionBucket>, FlumeError> {
        let (token, subject) = self.authorized_subject().await?;
        let url = format!(
            "{}/users/{}/devices/{}/query",
            self.base_url, subject, device_id
        );
        let body = json!({
            "queries": [{
                "request_id": CONSUMPTION_REQUEST_ID,
                "bucket": CONSUMPTION_BUCKET,
                "since_datetime": since.format(QUERY_TIME_FORMAT).to_string(),
                "until_datetime": until.format(QUERY_TIME_FORMAT).to_string(),
            }],
        });

        let response = self
            .http
            .post(url)
            .bearer_auth(&token.access_token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let envelope: QueryEnvelope = decode_json(response).await?;
        let buckets = envelope
            .data
            .into_iter()
            .next()
            .and_then(|mut entry| {
                entry
                    .get_mut(CONSUMPTION_REQUEST_ID)
                    .map(JsonValue::take)
            })
            .ok_or_else(|| {
                FlumeError::Shape("query response carried no consumption series".to_string())
            })?;
        serde_json::from_value(buckets)
            .map_err(|err| FlumeError::Shape(format!("consumption buckets: {err}")))
    }

    /// Fetches the latest instantaneous flow rate in gallons per minute, or
    /// `None` when the device has no active reading.
    pub async fn current_flow_rate(&self, device_id: &str) -> Result<Option<f64>, FlumeError> {
        let (token, subject) = self.authorized_subject().await?;
        let url = format!(
            "{}/users/{}/devices/{}/query/active",
            self.base_url, subject, device_id
        );
        let response = self
            .http
            .get(url)
            .bearer_auth(&token.access_token)
            .send()
            .await?
            .error_for_status()?;
        let envelope: ActiveEnvelope = decode_json(response).await?;
        Ok(envelope.data.into_iter().next().and_then(|r| r.gpm))
    }
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, FlumeError> {
    response.json::<T>().await.map_err(|err| {
        if err.is_decode() {
            FlumeError::Shape(err.to_string())
        } else {
            FlumeError::Upstream(err)
        }
    })
}

/// Reads the `user_id` (or legacy `user`) claim out of a three-segment signed
/// token without verifying the signature.
fn decode_subject_id(access_token: &str) -> Option<String> {
    let mut segments = access_token.split('.');
    let payload = match (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return None,
    };

    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: JsonValue = serde_json::from_slice(&decoded).ok()?;
    claims
        .get("user_id")
        .or_else(|| claims.get("user"))
        .and_then(parse_id)
}

/// Ids arrive as numbers or strings depending on the endpoint; normalize both
/// forms to a string.
fn parse_id(value: &JsonValue) -> Option<String> {
    if let Some(num) = value.as_i64() {
        return Some(num.to_string());
    }
    if let Some(num) = value.as_u64() {
        return Some(num.to_string());
    }
    value.as_str().map(|s| s.trim().to_string())
}
