use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::client::{AuthClient, AuthConfig, DEFAULT_AUTH_URL};
use crate::error::Error;
#[cfg(feature = "relay")]
use crate::relay::{RelayClient, RelayConfig};
use crate::session::SessionController;
use crate::store::FileSessionStore;

/// Application settings for the dashboard client.
///
/// Use [`from_env()`](Settings::from_env) for convention-based setup, or
/// build the parts directly for full control.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Settings {
    pub auth: AuthConfig,
    pub session_file: PathBuf,
    #[cfg(feature = "relay")]
    pub relay: Option<RelayConfig>,
}

impl Settings {
    /// Load settings from environment variables.
    ///
    /// # Optional env vars
    /// - `FIELDTRACK_AUTH_URL`: auth service base (default `http://localhost:8000/users/`)
    /// - `FIELDTRACK_HTTP_TIMEOUT_SECS`: request timeout in seconds
    /// - `FIELDTRACK_SESSION_FILE`: path of the persisted session slot
    /// - `EMAILJS_SERVICE_ID`, `EMAILJS_TEMPLATE_ID`, `EMAILJS_PUBLIC_KEY`:
    ///   relay identifiers; all three or none
    /// - `EMAILJS_API_URL`: override the relay endpoint
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a URL or number is invalid, or if the relay
    /// identifiers are only partially set.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let auth_url = lookup("FIELDTRACK_AUTH_URL").unwrap_or_else(|| DEFAULT_AUTH_URL.into());
        let mut auth = AuthConfig::new(parse_url("FIELDTRACK_AUTH_URL", &auth_url)?);

        let timeout = match lookup("FIELDTRACK_HTTP_TIMEOUT_SECS") {
            Some(secs) => Some(Duration::from_secs(secs.trim().parse().map_err(|e| {
                Error::Config(format!("FIELDTRACK_HTTP_TIMEOUT_SECS: {e}"))
            })?)),
            None => None,
        };
        if let Some(timeout) = timeout {
            auth = auth.with_timeout(timeout);
        }

        let session_file = lookup("FIELDTRACK_SESSION_FILE")
            .map_or_else(FileSessionStore::default_path, PathBuf::from);

        Ok(Self {
            auth,
            session_file,
            #[cfg(feature = "relay")]
            relay: relay_from_lookup(&lookup, timeout)?,
        })
    }

    /// Controller backed by the HTTP client and the session file.
    #[must_use]
    pub fn session_controller(&self) -> SessionController<AuthClient, FileSessionStore> {
        SessionController::new(
            AuthClient::new(self.auth.clone()),
            FileSessionStore::new(&self.session_file),
        )
    }

    /// Report relay client, when the relay is configured.
    #[cfg(feature = "relay")]
    #[must_use]
    pub fn relay_client(&self) -> Option<RelayClient> {
        self.relay.clone().map(RelayClient::new)
    }
}

#[cfg(feature = "relay")]
fn relay_from_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    timeout: Option<Duration>,
) -> Result<Option<RelayConfig>, Error> {
    const IDS: [&str; 3] = ["EMAILJS_SERVICE_ID", "EMAILJS_TEMPLATE_ID", "EMAILJS_PUBLIC_KEY"];

    let [service_id, template_id, public_key] = IDS.map(lookup);
    let (service_id, template_id, public_key) = match (service_id, template_id, public_key) {
        (None, None, None) => return Ok(None),
        (Some(s), Some(t), Some(p)) => (s, t, p),
        _ => {
            return Err(Error::Config(format!(
                "{} must be set together",
                IDS.join(", ")
            )));
        }
    };

    let mut config = RelayConfig::new(service_id, template_id, public_key);
    if let Some(url) = lookup("EMAILJS_API_URL") {
        config = config.with_api_url(parse_url("EMAILJS_API_URL", &url)?);
    }
    if let Some(timeout) = timeout {
        config = config.with_timeout(timeout);
    }
    Ok(Some(config))
}

fn parse_url(var: &str, value: &str) -> Result<Url, Error> {
    value
        .parse()
        .map_err(|e| Error::Config(format!("{var}: {e}")))
}
