use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::Error;

/// Keys owned by the session record itself; profile data never overwrites them.
const RESERVED_KEYS: [&str; 2] = ["access", "refresh"];

/// Short-lived bearer credential returned by login and refresh.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
#[serde(transparent)]
pub struct AccessToken(pub String);

/// Long-lived credential used to mint new access tokens.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
#[serde(transparent)]
pub struct RefreshToken(pub String);

macro_rules! token_impls {
    ($name:ident) => {
        impl $name {
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        // Tokens end up in tracing fields via `?record`; keep them out of logs.
        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "(<{} bytes>)"), self.0.len())
            }
        }
    };
}

token_impls!(AccessToken);
token_impls!(RefreshToken);

/// Engineer profile as returned by the profile endpoint.
///
/// The service owns the schema, so the profile is kept as an open JSON object
/// with accessors for the fields the dashboard reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Profile(Map<String, JsonValue>);

impl Profile {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, returning the updated profile.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_map(&self) -> &Map<String, JsonValue> {
        &self.0
    }

    #[must_use]
    pub fn id(&self) -> Option<i64> {
        self.0.get("id").and_then(JsonValue::as_i64)
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.str_field("username")
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.str_field("email")
    }

    /// `Junior`, `Mid` or `Senior` on the reference backend.
    #[must_use]
    pub fn expertise_level(&self) -> Option<&str> {
        self.str_field("expertise_level")
    }

    /// Merge `other` onto this profile. Fields in `other` win; fields only
    /// present here are kept. Token keys are never taken from `other`.
    pub fn merge(&mut self, other: Profile) {
        for (key, value) in other.0 {
            if RESERVED_KEYS.contains(&key.as_str()) {
                tracing::warn!(field = %key, "Ignoring reserved key in profile response");
                continue;
            }
            self.0.insert(key, value);
        }
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(JsonValue::as_str)
    }
}

/// The persisted authentication record.
///
/// Serialized flat, as `{"access": .., "refresh": .., <profile fields>..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub access: AccessToken,
    /// Empty when the slot was written without one; such a session cannot be refreshed.
    #[serde(default)]
    pub refresh: RefreshToken,
    #[serde(flatten)]
    pub profile: Profile,
}

impl SessionRecord {
    /// Record for a freshly issued token pair, before profile hydration.
    #[must_use]
    pub fn new(tokens: TokenPair) -> Self {
        Self {
            access: tokens.access,
            refresh: tokens.refresh,
            profile: Profile::new(),
        }
    }

    /// Profile fields, or `None` if the record has not been hydrated yet.
    #[must_use]
    pub fn profile(&self) -> Option<&Profile> {
        (!self.profile.is_empty()).then_some(&self.profile)
    }

    /// Return this record with `profile` merged onto its current fields.
    #[must_use]
    pub fn hydrated(mut self, profile: Profile) -> Self {
        self.profile.merge(profile);
        self
    }
}

/// Login request body.
#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Registration request body.
///
/// Fields beyond the common ones go through `extra` unchanged.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Registration {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            email: None,
            first_name: None,
            last_name: None,
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = Some(first.into());
        self.last_name = Some(last.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Token pair issued by the login endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenPair {
    pub access: AccessToken,
    pub refresh: RefreshToken,
}

/// Refresh endpoint response. `refresh` is only present when the server rotates it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RefreshedToken {
    pub access: AccessToken,
    #[serde(default)]
    pub refresh: Option<RefreshToken>,
}

/// Minimum password length accepted by the change-password endpoint.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Change-password request body.
#[derive(Debug, Clone, Serialize)]
pub struct PasswordChange {
    pub password: String,
    pub new_password: String,
    pub confirm_password: String,
}

impl PasswordChange {
    #[must_use]
    pub fn new(
        current: impl Into<String>,
        new_password: impl Into<String>,
        confirm_password: impl Into<String>,
    ) -> Self {
        Self {
            password: current.into(),
            new_password: new_password.into(),
            confirm_password: confirm_password.into(),
        }
    }

    /// Check the rules the server enforces, without a round trip.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the confirmation differs or the new
    /// password is shorter than [`MIN_PASSWORD_LEN`].
    pub fn validate(&self) -> Result<(), Error> {
        if self.new_password != self.confirm_password {
            return Err(Error::Validation(
                "new password and confirmation do not match".into(),
            ));
        }
        if self.new_password.chars().count() < MIN_PASSWORD_LEN {
            return Err(Error::Validation(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        Ok(())
    }
}
