//! Client mirror of the protocol: one socket per server, any number of
//! channels multiplexed over it.

pub mod backoff;
pub mod channel;
pub mod heartbeat;
pub mod presence;
pub mod sequence;
pub mod socket;

pub use backoff::{ReconnectSchedule, default_schedule};
pub use channel::{
    Channel, ChannelState, RemoveStatus, SendResult, SendStatus, SubscribeStatus,
};
pub use heartbeat::{HeartbeatHook, HeartbeatStatus, RttStats};
pub use presence::{PresenceMeta, PresenceState};
pub use socket::{LinkState, Socket, SocketOptions, TokenProvider};
