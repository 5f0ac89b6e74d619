//! Observable protocol limits. All caps are enforced server-side except the
//! client send buffers, which bound memory during disconnection.

use std::time::Duration;

/// Largest inbound wire frame accepted, in bytes.
pub const MAX_MESSAGE_BYTES: usize = 100 * 1024;

/// Largest presence meta accepted on track, in serialized bytes.
pub const MAX_PRESENCE_META_BYTES: usize = 10 * 1024;

/// Longest accepted topic name.
pub const MAX_TOPIC_LEN: usize = 255;

/// Longest accepted broadcast event name.
pub const MAX_EVENT_NAME_LEN: usize = 128;

/// Channels one connection may be joined to at once.
pub const MAX_SUBSCRIPTIONS_PER_CONN: usize = 100;

/// Members one channel may hold on a single instance.
pub const MAX_MEMBERS_PER_CHANNEL: usize = 10_000;

/// Presence keys one channel may hold.
pub const MAX_PRESENCE_ENTRIES_PER_CHANNEL: usize = 1_000;

/// Outbound frames buffered client-side while the link is down.
pub const SEND_BUFFER_CAP: usize = 1_000;

/// Requests buffered per channel before it reaches `joined`.
pub const PREJOIN_BUFFER_CAP: usize = 100;

/// Deadline for a request awaiting its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence of client liveness probes.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
