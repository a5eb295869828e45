pub mod admin;
pub mod auth;
pub mod user;

use serde::{Deserialize, Deserializer, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    #[schema(example = "Invalid credentials")]
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse {
    #[schema(example = "Logged out")]
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Distinguishes an absent field (`None`) from an explicit `null`
/// (`Some(None)`) on partial updates.
pub(crate) fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::user::UpdateOwnProfileRequest;

    #[test]
    fn test_null_and_absent_fields_differ() {
        let absent: UpdateOwnProfileRequest = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(absent.discord_id, None);

        let cleared: UpdateOwnProfileRequest =
            serde_json::from_str(r#"{"discordId": null}"#).unwrap();
        assert_eq!(cleared.discord_id, Some(None));

        let set: UpdateOwnProfileRequest =
            serde_json::from_str(r#"{"discordId": "1234"}"#).unwrap();
        assert_eq!(set.discord_id, Some(Some("1234".to_string())));
    }
}
