//! Common identifier types.
//!
//! - [`UserId`]: authenticated account identifier, as issued by the auth boundary
//! - [`RequestId`]: per-request identifier used in logs and reconciliation events
//!
//! [`abbrev_uuid`] shortens UUIDs for log lines.

use uuid::Uuid;

pub type UserId = Uuid;
pub type RequestId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abbrev_uuid() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(abbrev_uuid(&id), "550e8400");
    }
}
