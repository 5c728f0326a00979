use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CollectorError, Result};

/// Chrome Web Store identifiers are 32 characters drawn from `a`..=`p`.
static STORE_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-p]{32}$").expect("store id pattern is valid")
});

/// Identifier of a single extension listing.
#[derive(
    Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ExtensionId(String);

impl ExtensionId {
    /// Accepts any non-blank identifier. Store-shaped ids can be checked with
    /// [`ExtensionId::is_store_id`].
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CollectorError::InvalidJob(
                "extension id must not be empty".into(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn is_store_id(&self) -> bool {
        STORE_ID.is_match(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for ExtensionId {
    type Error = CollectorError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}
