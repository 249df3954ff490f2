//! Persisted key layout
//!
//! - `player:{id}` hash: `properties` (JSON), `created_at` (ms), `indices`
//!   (JSON list of index keys the player was added to) and the connection
//!   string field once assigned.
//! - `index:{attribute}` sorted set: player ids scored by attribute value, or
//!   by creation time for tag attributes.
//! - `requests:all` sorted set: every indexed player scored by creation time.
//! - `ignorelist:{name}` sorted set: player ids scored by insertion time.

pub const PROPERTIES_FIELD: &str = "properties";
pub const CREATED_AT_FIELD: &str = "created_at";
pub const INDICES_FIELD: &str = "indices";
pub const ASSIGNED_AT_FIELD: &str = "assigned_at";

pub const ALL_REQUESTS_INDEX: &str = "requests:all";

pub fn player(id: &str) -> String {
    format!("player:{}", id)
}

pub fn index(attribute: &str) -> String {
    format!("index:{}", attribute)
}

pub fn ignore_list(name: &str) -> String {
    format!("ignorelist:{}", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaces_do_not_collide() {
        assert_ne!(player("region.eu-west1"), index("region.eu-west1"));
        assert_eq!(ignore_list("proposed"), "ignorelist:proposed");
        assert_ne!(ALL_REQUESTS_INDEX, index("all"));
    }
}
