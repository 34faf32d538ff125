use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

pub const DEFAULT_MEMORY_MB: i32 = 128;
pub const DEFAULT_TIMEOUT_SEC: i32 = 30;

pub const MIN_MEMORY_MB: i32 = 64;
pub const MAX_MEMORY_MB: i32 = 4096;
pub const MIN_TIMEOUT_SEC: i32 = 1;
pub const MAX_TIMEOUT_SEC: i32 = 900;

/// Language runtimes the guest images ship an agent for.
#[derive(
    Deserialize,
    Serialize,
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Hash,
    EnumString,
    Display,
    ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Runtime {
    Nodejs18,
    Nodejs20,
    Python311,
    Python312,
    Dotnet7,
    Dotnet8,
}

impl Runtime {
    pub const ALL: [Runtime; 6] = [
        Runtime::Nodejs18,
        Runtime::Nodejs20,
        Runtime::Python311,
        Runtime::Python312,
        Runtime::Dotnet7,
        Runtime::Dotnet8,
    ];
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct Function {
    pub id: Uuid,
    pub name: String,
    pub runtime: Runtime,
    pub handler: String,

    /// Convenience echo of the stored blob. The blob addressed by
    /// `code_path` is the source of truth; `List` leaves this empty.
    #[serde(default)]
    pub code: String,

    pub memory_mb: i32,
    pub timeout_sec: i32,

    #[serde(default)]
    pub environment: HashMap<String, String>,

    pub code_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Validate, ToSchema)]
pub struct CreateFunctionRequest {
    #[validate(length(min = 1, max = 64), custom = "validate_name_chars")]
    pub name: String,

    /// One of the `Runtime` values, e.g. "nodejs20".
    pub runtime: String,

    #[validate(length(min = 1))]
    pub handler: String,

    #[validate(length(min = 1))]
    pub code: String,

    #[validate(range(min = 64, max = 4096))]
    pub memory_mb: Option<i32>,

    #[validate(range(min = 1, max = 900))]
    pub timeout_sec: Option<i32>,

    #[serde(default)]
    pub environment: Option<HashMap<String, String>>,
}

/// Patch for an existing function. Every field is three-valued: absent
/// leaves the stored value untouched, `null` clears (back to the default
/// where one exists), and a value replaces.
#[derive(Serialize, Deserialize, Debug, Clone, Default, ToSchema)]
pub struct UpdateFunctionRequest {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub runtime: Option<Option<String>>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub handler: Option<Option<String>>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub code: Option<Option<String>>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub memory_mb: Option<Option<i32>>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub timeout_sec: Option<Option<i32>>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub environment: Option<Option<HashMap<String, String>>>,
}

impl UpdateFunctionRequest {
    pub fn is_empty(&self) -> bool {
        self.runtime.is_none()
            && self.handler.is_none()
            && self.code.is_none()
            && self.memory_mb.is_none()
            && self.timeout_sec.is_none()
            && self.environment.is_none()
    }
}

fn validate_name_chars(name: &str) -> Result<(), ValidationError> {
    if name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        Ok(())
    } else {
        Err(ValidationError::new("name_chars"))
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn request(name: &str) -> CreateFunctionRequest {
        CreateFunctionRequest {
            name: name.to_string(),
            runtime: "nodejs20".to_string(),
            handler: "index.handler".to_string(),
            code: "exports.handler = async () => ({});".to_string(),
            memory_mb: None,
            timeout_sec: None,
            environment: None,
        }
    }

    #[test]
    fn runtime_round_trips_through_strings() {
        for runtime in Runtime::ALL {
            let parsed = Runtime::from_str(&runtime.to_string()).unwrap();
            assert_eq!(parsed, runtime);
        }
        assert!(Runtime::from_str("nodejs16").is_err());
    }

    #[test]
    fn create_request_rejects_bad_names() {
        assert!(request("").validate().is_err());
        assert!(request("Hello").validate().is_err());
        assert!(request("has space").validate().is_err());
        assert!(request(&"a".repeat(65)).validate().is_err());
        assert!(request("hello-world-2").validate().is_ok());
    }

    #[test]
    fn create_request_bounds_memory_and_timeout() {
        let mut r = request("hello");
        r.memory_mb = Some(32);
        assert!(r.validate().is_err());
        r.memory_mb = Some(4096);
        r.timeout_sec = Some(901);
        assert!(r.validate().is_err());
        r.timeout_sec = Some(900);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn patch_distinguishes_absent_from_null() {
        let patch: UpdateFunctionRequest = serde_json::from_str("{}").unwrap();
        assert!(patch.is_empty());

        let patch: UpdateFunctionRequest =
            serde_json::from_str(r#"{"environment": null, "memory_mb": 256}"#).unwrap();
        assert_eq!(patch.environment, Some(None));
        assert_eq!(patch.memory_mb, Some(Some(256)));
        assert!(patch.timeout_sec.is_none());
    }
}
