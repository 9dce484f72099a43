use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::Error;
use crate::types::{
    AccessToken, Credentials, PasswordChange, Profile, RefreshToken, RefreshedToken,
    Registration, TokenPair,
};

/// Base path of the reference auth service.
pub const DEFAULT_AUTH_URL: &str = "http://localhost:8000/users/";

/// Request timeout applied when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Auth service configuration.
///
/// ```rust,ignore
/// use fieldtrack_accounts::AuthConfig;
///
/// let config = AuthConfig::new("https://api.fieldtrack.dev/users/".parse()?)
///     .with_timeout(std::time::Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct AuthConfig {
    pub(crate) base_url: Url,
    pub(crate) timeout: Duration,
}

impl AuthConfig {
    /// Create a configuration rooted at `base_url`.
    ///
    /// Endpoint paths are joined onto the base, so a missing trailing slash is added.
    #[must_use]
    pub fn new(mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Config(format!("invalid endpoint {path}: {e}")))
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new(DEFAULT_AUTH_URL.parse().expect("valid default URL"))
    }
}

/// Remote operations of the auth service.
///
/// [`AuthClient`] is the HTTP implementation; the session controller is generic
/// over this trait so other transports can stand in.
pub trait AuthApi: Send + Sync + 'static {
    /// Create an account. Registration does not log the user in.
    fn register(
        &self,
        registration: &Registration,
    ) -> impl Future<Output = Result<Profile, Error>> + Send;

    /// Exchange credentials for a token pair.
    fn login(&self, credentials: &Credentials)
    -> impl Future<Output = Result<TokenPair, Error>> + Send;

    /// Fetch the profile of the token's owner.
    fn fetch_profile(
        &self,
        access: &AccessToken,
    ) -> impl Future<Output = Result<Profile, Error>> + Send;

    /// Mint a new access token.
    fn refresh_access_token(
        &self,
        refresh: &RefreshToken,
    ) -> impl Future<Output = Result<RefreshedToken, Error>> + Send;

    /// Change the password of the token's owner.
    fn change_password(
        &self,
        access: &AccessToken,
        change: &PasswordChange,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// HTTP client for the field-engineering auth service.
#[derive(Debug, Clone)]
pub struct AuthClient {
    config: AuthConfig,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

impl AuthClient {
    #[must_use]
    pub fn new(config: AuthConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self { config, http }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    async fn post_json<B, T>(
        &self,
        path: &str,
        body: &B,
        operation: &'static str,
        classify: fn(StatusCode, String) -> Option<Error>,
    ) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(self.config.endpoint(path)?)
            .json(body)
            .send()
            .await?;
        let response = Self::ensure_success(response, operation, classify).await?;
        response.json::<T>().await.map_err(Into::into)
    }

    /// Returns the response on success; otherwise lets `classify` pick the
    /// error for the status and falls back to [`Error::Api`].
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
        classify: fn(StatusCode, String) -> Option<Error>,
    ) -> Result<reqwest::Response, Error> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        tracing::debug!(operation, status = status.as_u16(), "Auth service rejected request");
        Err(classify(status, detail.clone()).unwrap_or(Error::Api {
            operation,
            status: status.as_u16(),
            detail,
        }))
    }
}

fn unauthorized_on_401(status: StatusCode, operation: &'static str) -> Option<Error> {
    (status == StatusCode::UNAUTHORIZED).then_some(Error::Unauthorized { operation })
}

impl AuthApi for AuthClient {
    async fn register(&self, registration: &Registration) -> Result<Profile, Error> {
        self.post_json("register/", registration, "register", |status, detail| {
            (status == StatusCode::BAD_REQUEST).then(|| Error::Validation(detail))
        })
        .await
    }

    async fn login(&self, credentials: &Credentials) -> Result<TokenPair, Error> {
        self.post_json("login/", credentials, "login", |status, _| {
            matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED)
                .then_some(Error::InvalidCredentials)
        })
        .await
    }

    async fn fetch_profile(&self, access: &AccessToken) -> Result<Profile, Error> {
        let response = self
            .http
            .get(self.config.endpoint("profile/")?)
            .bearer_auth(access.as_str())
            .send()
            .await?;

        let response = Self::ensure_success(response, "profile", |status, _| {
            unauthorized_on_401(status, "profile")
        })
        .await?;
        response.json::<Profile>().await.map_err(Into::into)
    }

    async fn refresh_access_token(&self, refresh: &RefreshToken) -> Result<RefreshedToken, Error> {
        let body = RefreshRequest {
            refresh: refresh.as_str(),
        };
        self.post_json("token/refresh/", &body, "token refresh", |status, _| {
            unauthorized_on_401(status, "token refresh")
        })
        .await
    }

    async fn change_password(
        &self,
        access: &AccessToken,
        change: &PasswordChange,
    ) -> Result<(), Error> {
        change.validate()?;

        let response = self
            .http
            .put(self.config.endpoint("change-password/")?)
            .bearer_auth(access.as_str())
            .json(change)
            .send()
            .await?;

        // The service answers 404 when the current password is wrong.
        Self::ensure_success(response, "change password", |status, detail| match status {
            StatusCode::UNAUTHORIZED => Some(Error::Unauthorized {
                operation: "change password",
            }),
            StatusCode::NOT_FOUND => Some(Error::InvalidCredentials),
            StatusCode::BAD_REQUEST => Some(Error::Validation(detail)),
            _ => None,
        })
        .await?;
        Ok(())
    }
}
