//! Field service engineer (F.S.E.) reports sent through an email relay.
//!
//! The relay fills a stored email template from named parameters. It cannot
//! carry file contents: only the attachment's file name reaches the template.

use std::path::Path;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use time::OffsetDateTime;
use time::macros::format_description;
use url::Url;

use crate::error::Error;

/// The relay's template-send endpoint.
pub const DEFAULT_RELAY_URL: &str = "https://api.emailjs.com/api/v1.0/email/send";

/// Placeholder sent as `attachment_name` when nothing is attached.
pub const NO_ATTACHMENT: &str = "None";

/// Relay account identifiers.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RelayConfig {
    pub(crate) service_id: String,
    pub(crate) template_id: String,
    pub(crate) public_key: String,
    pub(crate) api_url: Url,
    pub(crate) timeout: Duration,
}

impl RelayConfig {
    #[must_use]
    pub fn new(
        service_id: impl Into<String>,
        template_id: impl Into<String>,
        public_key: impl Into<String>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            template_id: template_id.into(),
            public_key: public_key.into(),
            api_url: DEFAULT_RELAY_URL.parse().expect("valid default URL"),
            timeout: Duration::from_secs(30),
        }
    }

    /// Override the relay endpoint.
    #[must_use]
    pub fn with_api_url(mut self, url: Url) -> Self {
        self.api_url = url;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    #[must_use]
    pub fn template_id(&self) -> &str {
        &self.template_id
    }

    #[must_use]
    pub fn api_url(&self) -> &Url {
        &self.api_url
    }
}

/// A file the engineer picked. Only the name is ever sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    file_name: String,
}

impl Attachment {
    #[must_use]
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    /// Attachment named after the last component of `path`.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_name()
            .map(|name| Self::new(name.to_string_lossy().into_owned()))
    }

    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

/// Report filled in by a field engineer.
#[derive(Debug, Clone, Default)]
pub struct FieldReport {
    pub title: String,
    pub client: String,
    pub location: String,
    pub description: String,
    pub equipment: String,
    pub actions_taken: String,
    pub recommendations: String,
    pub attachment: Option<Attachment>,
}

impl FieldReport {
    /// Check that every required field has content.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the first empty required field.
    pub fn validate(&self) -> Result<(), Error> {
        let required = [
            ("title", &self.title),
            ("client", &self.client),
            ("location", &self.location),
            ("description", &self.description),
            ("actionsTaken", &self.actions_taken),
        ];
        match required.iter().find(|(_, value)| value.trim().is_empty()) {
            Some((field, _)) => Err(Error::Validation(format!("{field} is required"))),
            None => Ok(()),
        }
    }

    /// Template parameters for a report sent at `sent_at`.
    #[must_use]
    pub fn template_params(&self, sent_at: OffsetDateTime) -> TemplateParams<'_> {
        TemplateParams {
            title: &self.title,
            client: &self.client,
            location: &self.location,
            description: &self.description,
            equipment: &self.equipment,
            actions_taken: &self.actions_taken,
            recommendations: &self.recommendations,
            date: format_date(sent_at),
            attachment_name: self
                .attachment
                .as_ref()
                .map_or(NO_ATTACHMENT, Attachment::file_name),
        }
    }
}

/// Named fields the relay substitutes into the email template.
#[derive(Debug, Serialize)]
pub struct TemplateParams<'a> {
    pub title: &'a str,
    pub client: &'a str,
    pub location: &'a str,
    pub description: &'a str,
    pub equipment: &'a str,
    #[serde(rename = "actionsTaken")]
    pub actions_taken: &'a str,
    pub recommendations: &'a str,
    pub date: String,
    pub attachment_name: &'a str,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    service_id: &'a str,
    template_id: &'a str,
    user_id: &'a str,
    template_params: TemplateParams<'a>,
}

/// Client for the email relay.
#[derive(Debug, Clone)]
pub struct RelayClient {
    config: RelayConfig,
    http: reqwest::Client,
}

impl RelayClient {
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
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

    /// Send `report`, stamped with the current local time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a report missing required fields,
    /// [`Error::Network`] on transport failure, or [`Error::Relay`] if the
    /// relay answers anything but `200 OK`.
    pub async fn send(&self, report: &FieldReport) -> Result<StatusCode, Error> {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        self.send_at(report, now).await
    }

    /// Send `report` with an explicit timestamp.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_at(
        &self,
        report: &FieldReport,
        sent_at: OffsetDateTime,
    ) -> Result<StatusCode, Error> {
        report.validate()?;

        let body = SendRequest {
            service_id: &self.config.service_id,
            template_id: &self.config.template_id,
            user_id: &self.config.public_key,
            template_params: report.template_params(sent_at),
        };

        let response = self
            .http
            .post(self.config.api_url.clone())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let detail = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), detail = %detail, "Report relay failed");
            return Err(Error::Relay {
                status: status.as_u16(),
                detail,
            });
        }

        tracing::info!(title = %report.title, client = %report.client, "Report sent");
        Ok(status)
    }
}

fn format_date(at: OffsetDateTime) -> String {
    let format = format_description!("[month]/[day]/[year], [hour]:[minute]:[second]");
    at.format(&format).unwrap_or_else(|_| at.to_string())
}
