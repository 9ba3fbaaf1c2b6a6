//! Ticket constants.
//!
//! Wire-level values shared between the codec, the registry and callers.

/// Ticket ID prefixes. Callers may dispatch on these without decoding.
pub mod prefixes {
    /// Ticket-granting ticket.
    pub const TICKET_GRANTING: &str = "TGT";

    /// Service ticket.
    pub const SERVICE: &str = "ST";

    /// Proxy-granting ticket.
    pub const PROXY_GRANTING: &str = "PGT";

    /// Proxy ticket.
    pub const PROXY: &str = "PT";

    /// OAuth authorization code.
    pub const OAUTH_CODE: &str = "OC";

    /// OAuth access token.
    pub const ACCESS_TOKEN: &str = "AT";

    /// OAuth refresh token.
    pub const REFRESH_TOKEN: &str = "RT";
}

/// Authentication attribute names the engine interprets.
pub mod attributes {
    /// Set to `"true"` when the user asked to be remembered at login.
    pub const REMEMBER_ME: &str = "rememberMe";
}

/// Storage key namespaces used by the registry.
pub mod keys {
    /// Prefix of keys holding encoded tickets.
    pub const TICKET: &str = "ticket:";

    /// Prefix of markers left behind by consumed single-use tickets.
    pub const CONSUMED: &str = "consumed:";
}

/// Minimum entropy of the random portion of a ticket ID, in bytes (128 bits).
pub const MIN_RANDOM_BYTES: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_namespaces_do_not_overlap() {
        assert!(!keys::TICKET.starts_with(keys::CONSUMED));
        assert!(!keys::CONSUMED.starts_with(keys::TICKET));
    }
}
