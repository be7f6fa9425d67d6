// Caller identity
// Every request, connection and event carries one of these

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{LiveStateError, Result};

/// Kind of identity behind a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerType {
    Guest,
    User,
    System,
}

impl CallerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallerType::Guest => "guest",
            CallerType::User => "user",
            CallerType::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "guest" => Some(CallerType::Guest),
            "user" => Some(CallerType::User),
            "system" => Some(CallerType::System),
            _ => None,
        }
    }
}

impl fmt::Display for CallerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authenticated identity (guest/user/system) behind a request or connection.
///
/// Callers are only ever built from a verified token subject or from a record
/// the host made while handling a verified token. They are never read from
/// unsigned request data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Caller {
    pub id: String,
    #[serde(rename = "type")]
    pub caller_type: CallerType,
}

impl Caller {
    pub fn new(id: impl Into<String>, caller_type: CallerType) -> Self {
        Self {
            id: id.into(),
            caller_type,
        }
    }

    pub fn guest(id: impl Into<String>) -> Self {
        Self::new(id, CallerType::Guest)
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(id, CallerType::User)
    }

    pub fn system(id: impl Into<String>) -> Self {
        Self::new(id, CallerType::System)
    }

    /// Token subject in the form `"{callerType}-{callerId}"`
    pub fn subject(&self) -> String {
        format!("{}-{}", self.caller_type, self.id)
    }

    /// Parse a token subject back into a caller.
    ///
    /// Only the first `-` separates type from id, so ids such as UUIDs that
    /// contain dashes survive the round trip.
    pub fn from_subject(subject: &str) -> Result<Self> {
        let (kind, id) = subject
            .split_once('-')
            .ok_or_else(|| LiveStateError::Unauthorized(format!("malformed subject: {}", subject)))?;

        let caller_type = CallerType::parse(kind)
            .ok_or_else(|| LiveStateError::Unauthorized(format!("unknown caller type: {}", kind)))?;

        if id.is_empty() {
            return Err(LiveStateError::Unauthorized(
                "subject is missing a caller id".to_string(),
            ));
        }

        Ok(Self::new(id, caller_type))
    }

    pub fn is_system(&self) -> bool {
        self.caller_type == CallerType::System
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_round_trip_with_dashed_id() {
        let caller = Caller::user("3f1c-77aa-90");
        let parsed = Caller::from_subject(&caller.subject()).unwrap();
        assert_eq!(parsed, caller);
        assert_eq!(caller.subject(), "user-3f1c-77aa-90");
    }

    #[test]
    fn test_subject_rejects_unknown_type() {
        assert!(Caller::from_subject("admin-1").is_err());
        assert!(Caller::from_subject("user-").is_err());
        assert!(Caller::from_subject("user").is_err());
    }

    #[test]
    fn test_caller_serializes_type_field() {
        let value = serde_json::to_value(Caller::guest("g1")).unwrap();
        assert_eq!(value, serde_json::json!({"id": "g1", "type": "guest"}));
    }
}
