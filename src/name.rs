use crate::error::{AppvisorError, Result};
use serde::Serialize;
use std::fmt;

pub const MAX_NAME_LEN: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct AppName(String);

impl AppName {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| AppvisorError::InvalidName {
            name: input.to_string(),
            reason: reason.to_string(),
        };
        if input.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if input.chars().count() > MAX_NAME_LEN {
            return Err(invalid(&format!(
                "maximum {MAX_NAME_LEN} characters allowed"
            )));
        }
        if !input
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
        {
            return Err(invalid(
                "only letters, numbers, underscores, and dashes are allowed",
            ));
        }
        Ok(Self(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AppName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
