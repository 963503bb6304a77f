//! Identifier helpers.
//!
//! User and audit row IDs are UUIDv7 so they sort by creation time. Token
//! identifiers (`jti`) are UUIDv4: fully random, so nothing about issuance
//! order leaks through them.

use uuid::Uuid;

/// Generate a new UUIDv7 (timestamp-sortable).
pub fn uuidv7() -> Uuid {
    Uuid::now_v7()
}

/// Generate a fresh random token identifier.
pub fn token_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuidv7_is_valid() {
        let id = uuidv7();
        assert_eq!(id.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn token_ids_are_random_and_distinct() {
        let a = token_id();
        let b = token_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        let parsed = Uuid::parse_str(&a).unwrap();
        assert_eq!(parsed.get_version(), Some(uuid::Version::Random));
    }
}
