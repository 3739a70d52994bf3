use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connections::ConnectionProfile;
use crate::remote::{ClientFactory, RemoteClient, RemoteError};

const TOKEN_PATH: &str = "/api/accounts/token/";

/// Token-authenticated JSON client for one remote instance.
///
/// The access token lives behind an `RwLock`: readers share it, and a 401
/// takes the write side once to re-authenticate before the single retry.
pub struct HttpRemoteClient {
    client: reqwest::Client,
    name: String,
    base_url: String,
    username: String,
    password: String,
    token: RwLock<Option<String>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access: String,
}

impl HttpRemoteClient {
    pub fn new(profile: &ConnectionProfile, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            name: profile.name.clone(),
            base_url: profile.base_url.trim_end_matches('/').to_string(),
            username: profile.username.clone(),
            password: profile.password.clone(),
            token: RwLock::new(None),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
        }
    }

    async fn fetch_token(&self) -> Result<String, RemoteError> {
        let resp = self
            .client
            .post(self.url(TOKEN_PATH))
            .json(&serde_json::json!({
                "username": self.username,
                "password": self.password,
            }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(remote = %self.name, status = status.as_u16(), "token request rejected");
            return Err(RemoteError::Auth(format!("{status}: {text}")));
        }
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| RemoteError::Parse(e.to_string()))?;
        Ok(body.access)
    }

    /// Current token, fetching one first if we have none yet.
    async fn current_token(&self) -> Result<String, RemoteError> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }
        let mut slot = self.token.write().await;
        if let Some(token) = slot.as_ref() {
            return Ok(token.clone());
        }
        let token = self.fetch_token().await?;
        *slot = Some(token.clone());
        Ok(token)
    }

    /// Replace `stale` with a fresh token unless another caller already did.
    async fn refresh_token(&self, stale: &str) -> Result<String, RemoteError> {
        let mut slot = self.token.write().await;
        if let Some(token) = slot.as_ref() {
            if token != stale {
                return Ok(token.clone());
            }
        }
        info!(remote = %self.name, "access token rejected; re-authenticating");
        let token = self.fetch_token().await?;
        *slot = Some(token.clone());
        Ok(token)
    }

    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        payload: Option<&Value>,
        token: &str,
    ) -> Result<reqwest::Response, RemoteError> {
        let mut req = self
            .client
            .request(method, self.url(endpoint))
            .bearer_auth(token);
        if let Some(body) = payload {
            req = req.json(body);
        }
        Ok(req.send().await?)
    }

    /// Issue a request, retrying exactly once after re-authentication.
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        payload: Option<&Value>,
    ) -> Result<reqwest::Response, RemoteError> {
        let token = self.current_token().await?;
        let resp = self.send(method.clone(), endpoint, payload, &token).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return check(resp, endpoint).await;
        }

        let token = self.refresh_token(&token).await?;
        let resp = self.send(method, endpoint, payload, &token).await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(RemoteError::Auth(format!(
                "{endpoint} still unauthorized after re-authentication"
            )));
        }
        check(resp, endpoint).await
    }

    async fn request_json(
        &self,
        method: Method,
        endpoint: &str,
        payload: Option<&Value>,
    ) -> Result<Value, RemoteError> {
        debug!(remote = %self.name, %method, endpoint, "remote request");
        let resp = self.request(method, endpoint, payload).await?;
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| RemoteError::Parse(e.to_string()))
    }
}

async fn check(resp: reqwest::Response, endpoint: &str) -> Result<reqwest::Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    debug!(status = status.as_u16(), endpoint, body = %text, "remote API error");
    Err(RemoteError::Api {
        status: status.as_u16(),
        message: text,
    })
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn authenticate(&self) -> Result<(), RemoteError> {
        let token = self.fetch_token().await?;
        *self.token.write().await = Some(token);
        debug!(remote = %self.name, "authenticated");
        Ok(())
    }

    async fn get(&self, endpoint: &str) -> Result<Value, RemoteError> {
        self.request_json(Method::GET, endpoint, None).await
    }

    async fn post(&self, endpoint: &str, payload: &Value) -> Result<Value, RemoteError> {
        self.request_json(Method::POST, endpoint, Some(payload)).await
    }

    async fn put(&self, endpoint: &str, payload: &Value) -> Result<Value, RemoteError> {
        self.request_json(Method::PUT, endpoint, Some(payload)).await
    }

    async fn patch(&self, endpoint: &str, payload: &Value) -> Result<Value, RemoteError> {
        self.request_json(Method::PATCH, endpoint, Some(payload)).await
    }

    async fn delete(&self, endpoint: &str) -> Result<Value, RemoteError> {
        self.request_json(Method::DELETE, endpoint, None).await
    }

    async fn download(&self, endpoint: &str) -> Result<Vec<u8>, RemoteError> {
        let resp = self.request(Method::GET, endpoint, None).await?;
        Ok(resp.bytes().await?.to_vec())
    }
}

/// Builds [`HttpRemoteClient`]s sharing one request timeout.
pub struct HttpClientFactory {
    timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ClientFactory for HttpClientFactory {
    fn client_for(&self, profile: &ConnectionProfile) -> Result<Arc<dyn RemoteClient>, RemoteError> {
        Ok(Arc::new(HttpRemoteClient::new(profile, self.timeout)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{
        extract::State,
        http::{header::AUTHORIZATION, HeaderMap, StatusCode},
        response::{IntoResponse, Response},
        routing::{get, post},
        Json, Router,
    };
    use serde_json::json;

    /// Local remote that issues `tok-1`, `tok-2`, ... and rejects `tok-1`
    /// (or every token when `reject_all` is set).
    #[derive(Default)]
    struct TokenServer {
        reject_all: bool,
        tokens_issued: AtomicUsize,
        item_requests: AtomicUsize,
    }

    async fn issue_token(State(server): State<Arc<TokenServer>>) -> Json<Value> {
        let n = server.tokens_issued.fetch_add(1, Ordering::SeqCst) + 1;
        Json(json!({ "access": format!("tok-{n}") }))
    }

    async fn items(State(server): State<Arc<TokenServer>>, headers: HeaderMap) -> Response {
        server.item_requests.fetch_add(1, Ordering::SeqCst);
        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if server.reject_all || bearer == "Bearer tok-1" {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Json(json!([{ "id": 1, "name": "News" }])).into_response()
    }

    async fn serve(server: Arc<TokenServer>) -> String {
        let app = Router::new()
            .route(TOKEN_PATH, post(issue_token))
            .route("/api/items/", get(items))
            .with_state(server);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn profile(base_url: &str) -> ConnectionProfile {
        ConnectionProfile {
            id: "c1".to_string(),
            name: "primary".to_string(),
            base_url: base_url.to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn urls_join_without_double_slashes() {
        let client = HttpRemoteClient::new(&profile("http://tv.local:9191/"), Duration::from_secs(5)).unwrap();
        assert_eq!(client.url("/api/channels/groups/"), "http://tv.local:9191/api/channels/groups/");
        assert_eq!(client.url("api/core/settings/"), "http://tv.local:9191/api/core/settings/");
    }

    #[test]
    fn absolute_urls_pass_through() {
        let client = HttpRemoteClient::new(&profile("http://tv.local"), Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.url("https://cdn.example.com/logo.png"),
            "https://cdn.example.com/logo.png"
        );
    }

    #[tokio::test]
    async fn rejected_token_is_refreshed_and_request_retried_once() {
        let server = Arc::new(TokenServer::default());
        let base = serve(Arc::clone(&server)).await;
        let client = HttpRemoteClient::new(&profile(&base), Duration::from_secs(5)).unwrap();

        client.authenticate().await.unwrap();
        let items = client.get("/api/items/").await.unwrap();

        assert_eq!(items, json!([{ "id": 1, "name": "News" }]));
        assert_eq!(server.tokens_issued.load(Ordering::SeqCst), 2);
        assert_eq!(server.item_requests.load(Ordering::SeqCst), 2);
        assert_eq!(client.token.read().await.as_deref(), Some("tok-2"));
    }

    #[tokio::test]
    async fn repeated_unauthorized_is_an_auth_error() {
        let server = Arc::new(TokenServer {
            reject_all: true,
            ..TokenServer::default()
        });
        let base = serve(Arc::clone(&server)).await;
        let client = HttpRemoteClient::new(&profile(&base), Duration::from_secs(5)).unwrap();

        let err = client.get("/api/items/").await.unwrap_err();

        assert!(matches!(err, RemoteError::Auth(_)), "got {err:?}");
        assert_eq!(server.tokens_issued.load(Ordering::SeqCst), 2);
        assert_eq!(server.item_requests.load(Ordering::SeqCst), 2);
    }
}
