//! Registration intake for unknown devices

use serde::Deserialize;

/// Request to onboard an unknown device as a pending identity.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationRequest {
    pub given_name: String,
    pub family_name: String,
    pub device_id: String,
}

/// Derive a login handle from a person's name: both parts lowercased
/// with whitespace stripped, joined with a dot.
pub fn derive_handle(given_name: &str, family_name: &str) -> String {
    fn squash(s: &str) -> String {
        s.chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase()
    }
    format!("{}.{}", squash(given_name), squash(family_name))
}
