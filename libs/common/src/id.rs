use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = switchboard_common::id::prefixed_ulid("con");
/// assert!(id.starts_with("con_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Marker trait for types that are identified by a prefixed ID.
pub trait PrefixedId {
    const PREFIX: &'static str;

    fn generate_id() -> String {
        prefixed_ulid(Self::PREFIX)
    }
}

/// Well-known ID prefixes.
pub mod prefix {
    /// One physical transport-level link.
    pub const CONNECTION: &str = "con";
    /// An authenticated (session, resource) pair.
    pub const ENDPOINT: &str = "ep";
    /// A negotiating client (probe cache key).
    pub const CLIENT: &str = "cli";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_ulid_format() {
        let id = prefixed_ulid(prefix::CONNECTION);
        assert!(id.starts_with("con_"));
        // ULID is 26 chars, plus prefix + underscore
        assert_eq!(id.len(), 4 + 26);
    }

    #[test]
    fn test_uniqueness() {
        let a = prefixed_ulid(prefix::ENDPOINT);
        let b = prefixed_ulid(prefix::ENDPOINT);
        assert_ne!(a, b);
    }

    #[test]
    fn test_trait_uses_prefix() {
        struct Client;
        impl PrefixedId for Client {
            const PREFIX: &'static str = prefix::CLIENT;
        }
        assert!(Client::generate_id().starts_with("cli_"));
    }
}
