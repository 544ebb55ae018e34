//! Authenticated session: login, token refresh, and request dispatch.
//!
//! Every authenticated request fetches its bearer token through
//! [`Session::ensure_access_token`] at dispatch time, so a refresh that
//! happens between two requests is always picked up. Soft logout
//! (`M_UNKNOWN_TOKEN` with `soft_logout: true`) refreshes and signals the
//! retry wrapper; a hard `M_UNKNOWN_TOKEN` clears the tokens.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use weft_core::UserId;

use crate::error::ClientError;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

/// Session state handed to and received from the embedding application.
///
/// The host owns persistence; this record is only its exchange format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginData {
    pub homeserver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Access token expiry as milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
}

impl LoginData {
    pub fn new(homeserver: impl Into<String>) -> Self {
        Self {
            homeserver: homeserver.into(),
            access_token: None,
            refresh_token: None,
            user_id: None,
            device_id: None,
            expires_at_ms: None,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct AuthTokens {
    access_token: Option<String>,
    refresh_token: Option<String>,
    user_id: Option<UserId>,
    device_id: Option<String>,
    expires_at: Option<SystemTime>,
}

#[derive(Debug, Serialize)]
struct LoginIdentifier<'a> {
    #[serde(rename = "type")]
    id_type: &'static str,
    user: &'a str,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    #[serde(rename = "type")]
    login_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    identifier: Option<LoginIdentifier<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
    refresh_token: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    initial_device_display_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    user_id: Option<UserId>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    expires_in_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MatrixErrorBody {
    errcode: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    soft_logout: Option<bool>,
    #[serde(default)]
    retry_after_ms: Option<u64>,
}

enum ResponseError {
    /// `M_UNKNOWN_TOKEN`; the caller decides between refresh and logout.
    UnknownToken { soft_logout: bool },
    Other(ClientError),
}

/// Classify a raw response: success body, Matrix error, or plain HTTP
/// failure.
fn interpret_response(response: HttpResponse) -> Result<Value, ResponseError> {
    if (200..300).contains(&response.status) {
        if response.body.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        return serde_json::from_str(&response.body).map_err(|err| {
            ResponseError::Other(ClientError::decode("response body", err.to_string()))
        });
    }

    let Ok(matrix) = serde_json::from_str::<MatrixErrorBody>(&response.body) else {
        return Err(ResponseError::Other(ClientError::Http {
            status: response.status,
            body: response.body,
        }));
    };

    if matrix.errcode == "M_UNKNOWN_TOKEN" {
        return Err(ResponseError::UnknownToken {
            soft_logout: matrix.soft_logout == Some(true),
        });
    }

    Err(ResponseError::Other(ClientError::MatrixApi {
        errcode: matrix.errcode,
        error: matrix.error.unwrap_or_default(),
        http_status: response.status,
        retry_after_ms: matrix.retry_after_ms,
    }))
}

/// Cheaply cloneable authenticated session against one homeserver.
#[derive(Clone)]
pub struct Session {
    homeserver: Url,
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<Mutex<AuthTokens>>,
    refresh_gate: Arc<tokio::sync::Mutex<()>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("homeserver", &self.homeserver.as_str())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn from_login_data(
        data: &LoginData,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, ClientError> {
        let homeserver = Url::parse(&data.homeserver).map_err(|err| {
            ClientError::InvalidOperation(format!(
                "invalid homeserver url '{}': {err}",
                data.homeserver
            ))
        })?;
        let tokens = AuthTokens {
            access_token: data.access_token.clone(),
            refresh_token: data.refresh_token.clone(),
            user_id: data.user_id.clone(),
            device_id: data.device_id.clone(),
            expires_at: data
                .expires_at_ms
                .map(|ms| UNIX_EPOCH + Duration::from_millis(ms)),
        };
        Ok(Self {
            homeserver,
            transport,
            tokens: Arc::new(Mutex::new(tokens)),
            refresh_gate: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn homeserver(&self) -> &Url {
        &self.homeserver
    }

    /// Export the session for external storage by the host.
    pub fn to_login_data(&self) -> Result<LoginData, ClientError> {
        let tokens = self.lock_tokens()?;
        Ok(LoginData {
            homeserver: self.homeserver.to_string(),
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            user_id: tokens.user_id.clone(),
            device_id: tokens.device_id.clone(),
            expires_at_ms: tokens.expires_at.and_then(|at| {
                at.duration_since(UNIX_EPOCH)
                    .ok()
                    .map(|since| since.as_millis() as u64)
            }),
        })
    }

    pub fn logged_in(&self) -> Result<bool, ClientError> {
        Ok(self.lock_tokens()?.access_token.is_some())
    }

    pub fn user_id(&self) -> Result<Option<UserId>, ClientError> {
        Ok(self.lock_tokens()?.user_id.clone())
    }

    pub fn device_id(&self) -> Result<Option<String>, ClientError> {
        Ok(self.lock_tokens()?.device_id.clone())
    }

    pub fn expired(&self) -> Result<bool, ClientError> {
        self.expired_at(SystemTime::now())
    }

    /// Whether the access token is expired when evaluated at `at`.
    pub fn expired_at(&self, at: SystemTime) -> Result<bool, ClientError> {
        let tokens = self.lock_tokens()?;
        Ok(tokens.access_token.is_some() && tokens.expires_at.is_some_and(|expiry| expiry < at))
    }

    /// Log in with the `m.login.password` flow.
    pub async fn password_login(
        &self,
        user: &str,
        password: &str,
        initial_display_name: Option<&str>,
        device_id: Option<&str>,
    ) -> Result<(), ClientError> {
        let request = LoginRequest {
            login_type: "m.login.password",
            identifier: Some(LoginIdentifier {
                id_type: "m.id.user",
                user,
            }),
            password: Some(password),
            token: None,
            refresh_token: true,
            initial_device_display_name: initial_display_name,
            device_id,
        };
        self.login(&request).await
    }

    /// Log in with the `m.login.token` flow.
    pub async fn token_login(
        &self,
        token: &str,
        initial_display_name: Option<&str>,
        device_id: Option<&str>,
    ) -> Result<(), ClientError> {
        let request = LoginRequest {
            login_type: "m.login.token",
            identifier: None,
            password: None,
            token: Some(token),
            refresh_token: true,
            initial_device_display_name: initial_display_name,
            device_id,
        };
        self.login(&request).await
    }

    async fn login(&self, request: &LoginRequest<'_>) -> Result<(), ClientError> {
        let body = serde_json::to_value(request)
            .map_err(|err| ClientError::decode("login request", err.to_string()))?;
        let value = self
            .dispatch_unauthenticated(Method::POST, &["login"], Some(body))
            .await?;
        let response: LoginResponse = serde_json::from_value(value)
            .map_err(|err| ClientError::decode("/login response", err.to_string()))?;

        let mut tokens = self.lock_tokens()?;
        tokens.access_token = Some(response.access_token);
        tokens.refresh_token = response.refresh_token;
        if response.user_id.is_some() {
            tokens.user_id = response.user_id;
        }
        if response.device_id.is_some() {
            tokens.device_id = response.device_id;
        }
        tokens.expires_at = response
            .expires_in_ms
            .map(|ms| SystemTime::now() + Duration::from_millis(ms));
        debug!(user_id = ?tokens.user_id, "login complete");
        Ok(())
    }

    /// Exchange the refresh token for a new token pair.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        let refresh_token = self
            .lock_tokens()?
            .refresh_token
            .clone()
            .ok_or(ClientError::LoginRequired)?;

        let mut body = Map::new();
        body.insert("refresh_token".to_owned(), Value::from(refresh_token));
        let value = self
            .dispatch_unauthenticated(Method::POST, &["refresh"], Some(Value::Object(body)))
            .await?;
        let response: RefreshResponse = serde_json::from_value(value)
            .map_err(|err| ClientError::decode("/refresh response", err.to_string()))?;

        let mut tokens = self.lock_tokens()?;
        tokens.access_token = Some(response.access_token);
        if response.refresh_token.is_some() {
            tokens.refresh_token = response.refresh_token;
        }
        tokens.expires_at = response
            .expires_in_ms
            .map(|ms| SystemTime::now() + Duration::from_millis(ms));
        debug!("access token refreshed");
        Ok(())
    }

    /// Current access token, refreshing first when it is expired.
    pub async fn ensure_access_token(&self) -> Result<String, ClientError> {
        {
            let tokens = self.lock_tokens()?;
            let Some(token) = tokens.access_token.clone() else {
                return Err(ClientError::LoginRequired);
            };
            if !tokens.expires_at.is_some_and(|expiry| expiry < SystemTime::now()) {
                return Ok(token);
            }
        }

        // Expired: serialize refreshes so concurrent requests do not race
        // each other with a rotated refresh token.
        let _guard = self.refresh_gate.lock().await;
        let already_fresh = {
            let tokens = self.lock_tokens()?;
            tokens.access_token.is_some()
                && !tokens.expires_at.is_some_and(|expiry| expiry < SystemTime::now())
        };
        if !already_fresh {
            self.refresh().await?;
        }
        self.lock_tokens()?
            .access_token
            .clone()
            .ok_or(ClientError::LoginRequired)
    }

    /// Authenticated request with unbounded replay on `RetryRequested`.
    ///
    /// The loop terminates because a retry only follows a successful
    /// refresh; a second `M_UNKNOWN_TOKEN` without `soft_logout` clears the
    /// tokens and fails with `LoginRequired`.
    pub(crate) async fn request(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Value, ClientError> {
        loop {
            match self
                .dispatch_authenticated(method.clone(), segments, query, body.clone())
                .await
            {
                Err(ClientError::RetryRequested) => {
                    debug!(path = ?segments, "replaying request after token refresh");
                }
                other => return other,
            }
        }
    }

    /// Authenticated request decoded into a typed response.
    pub(crate) async fn request_typed<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<Value>,
        context: &'static str,
    ) -> Result<T, ClientError> {
        let value = self.request(method, segments, query, body).await?;
        serde_json::from_value(value).map_err(|err| ClientError::decode(context, err.to_string()))
    }

    /// Dispatch with the bearer token fetched at dispatch time, turning a
    /// soft logout into refresh + `RetryRequested` for the caller's loop.
    async fn dispatch_authenticated(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Value, ClientError> {
        let token = self.ensure_access_token().await?;
        let response = self.send(method, segments, query, Some(token), body).await?;
        match interpret_response(response) {
            Ok(value) => Ok(value),
            Err(ResponseError::UnknownToken { soft_logout: true }) => {
                warn!("access token rejected with soft logout; refreshing");
                self.refresh().await?;
                Err(ClientError::RetryRequested)
            }
            Err(ResponseError::UnknownToken { soft_logout: false }) => {
                warn!("access token rejected; clearing session tokens");
                self.clear_tokens()?;
                Err(ClientError::LoginRequired)
            }
            Err(ResponseError::Other(err)) => Err(err),
        }
    }

    /// Dispatch without a bearer token (`/login`, `/refresh`). A rejected
    /// refresh token is a hard logout.
    async fn dispatch_unauthenticated(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<Value>,
    ) -> Result<Value, ClientError> {
        let response = self.send(method, segments, &[], None, body).await?;
        match interpret_response(response) {
            Ok(value) => Ok(value),
            Err(ResponseError::UnknownToken { .. }) => {
                warn!("refresh token rejected; clearing session tokens");
                self.clear_tokens()?;
                Err(ClientError::LoginRequired)
            }
            Err(ResponseError::Other(err)) => Err(err),
        }
    }

    async fn send(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        bearer: Option<String>,
        body: Option<Value>,
    ) -> Result<HttpResponse, ClientError> {
        let url = self.endpoint(segments, query)?;
        self.transport
            .dispatch(HttpRequest {
                method,
                url,
                bearer,
                body,
            })
            .await
    }

    fn endpoint(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, ClientError> {
        let mut url = self.homeserver.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                ClientError::InvalidOperation("homeserver url cannot be a base".to_owned())
            })?;
            path.pop_if_empty()
                .extend(["_matrix", "client", "v3"])
                .extend(segments);
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    fn clear_tokens(&self) -> Result<(), ClientError> {
        let mut tokens = self.lock_tokens()?;
        tokens.access_token = None;
        tokens.refresh_token = None;
        tokens.expires_at = None;
        Ok(())
    }

    fn lock_tokens(&self) -> Result<std::sync::MutexGuard<'_, AuthTokens>, ClientError> {
        self.tokens
            .lock()
            .map_err(|_| ClientError::internal("session token lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopTransport;

    #[async_trait::async_trait]
    impl HttpTransport for NoopTransport {
        async fn dispatch(&self, request: HttpRequest) -> Result<HttpResponse, ClientError> {
            panic!("unexpected dispatch to {}", request.url);
        }
    }

    fn session(data: &LoginData) -> Session {
        Session::from_login_data(data, Arc::new(NoopTransport)).expect("session should build")
    }

    #[test]
    fn expiry_is_evaluated_against_supplied_instant() {
        let mut data = LoginData::new("https://matrix.example.org");
        data.access_token = Some("A".to_owned());
        data.expires_at_ms = Some(3_600_000);
        let session = session(&data);

        let expiry = UNIX_EPOCH + Duration::from_millis(3_600_000);
        assert!(
            !session
                .expired_at(expiry)
                .expect("expiry check should work"),
            "token expires strictly after its expiry instant"
        );
        assert!(
            session
                .expired_at(expiry + Duration::from_millis(1))
                .expect("expiry check should work")
        );
    }

    #[test]
    fn session_without_token_is_not_expired() {
        let data = LoginData::new("https://matrix.example.org");
        let session = session(&data);
        assert!(!session.logged_in().expect("logged_in should work"));
        assert!(
            !session
                .expired_at(SystemTime::now() + Duration::from_secs(999))
                .expect("expiry check should work")
        );
    }

    #[test]
    fn login_data_round_trips_through_session() {
        let data = LoginData {
            homeserver: "https://matrix.example.org/".to_owned(),
            access_token: Some("A".to_owned()),
            refresh_token: Some("R".to_owned()),
            user_id: Some("@alice:example.org".into()),
            device_id: Some("D".to_owned()),
            expires_at_ms: Some(1_800_000_000_000),
        };
        let restored = session(&data)
            .to_login_data()
            .expect("export should work");
        assert_eq!(restored, data);
    }

    #[test]
    fn endpoint_escapes_path_segments() {
        let data = LoginData::new("https://matrix.example.org");
        let session = session(&data);
        let url = session
            .endpoint(&["rooms", "!room id:h", "messages"], &[("dir", "f")])
            .expect("endpoint should build");
        assert_eq!(
            url.as_str(),
            "https://matrix.example.org/_matrix/client/v3/rooms/!room%20id:h/messages?dir=f"
        );
    }
}
