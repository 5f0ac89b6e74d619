//! Machine-readable error codes surfaced in reply payloads.
//!
//! Codes are grouped by prefix. Every auth failure shares the `AUTH_` prefix
//! so clients can recognize the whole family and suppress auto-rejoin.

/// Prefix shared by every authentication/authorization failure.
pub const AUTH_PREFIX: &str = "AUTH_";

pub mod code {
    // Auth
    pub const AUTH_MISSING: &str = "AUTH_MISSING";
    pub const AUTH_INVALID: &str = "AUTH_INVALID";
    pub const AUTH_EXPIRED: &str = "AUTH_EXPIRED";
    pub const AUTH_REVOKED: &str = "AUTH_REVOKED";
    pub const AUTH_SIGNATURE: &str = "AUTH_SIGNATURE";
    pub const AUTH_FORBIDDEN: &str = "AUTH_FORBIDDEN";

    // Channel
    pub const CHANNEL_NOT_FOUND: &str = "CHANNEL_NOT_FOUND";
    pub const CHANNEL_FULL: &str = "CHANNEL_FULL";
    pub const CHANNEL_FORBIDDEN: &str = "CHANNEL_FORBIDDEN";
    pub const CHANNEL_ALREADY_JOINED: &str = "CHANNEL_ALREADY_JOINED";

    // Message
    pub const MESSAGE_TOO_LARGE: &str = "MESSAGE_TOO_LARGE";
    pub const MESSAGE_MALFORMED: &str = "MESSAGE_MALFORMED";
    pub const MESSAGE_RATE_LIMITED: &str = "MESSAGE_RATE_LIMITED";

    // System
    pub const SYSTEM_OVERLOAD: &str = "SYSTEM_OVERLOAD";
    pub const SYSTEM_MAINTENANCE: &str = "SYSTEM_MAINTENANCE";
    pub const SYSTEM_INTERNAL: &str = "SYSTEM_INTERNAL";

    // Presence
    pub const PRESENCE_DISABLED: &str = "PRESENCE_DISABLED";
    pub const PRESENCE_TOO_LARGE: &str = "PRESENCE_TOO_LARGE";
    pub const PRESENCE_KEY_CONFLICT: &str = "PRESENCE_KEY_CONFLICT";
}

/// True when `code` belongs to the auth family. Clients use this to decide
/// whether a failed join may auto-rejoin.
pub fn is_auth_code(code: &str) -> bool {
    code.starts_with(AUTH_PREFIX)
}
