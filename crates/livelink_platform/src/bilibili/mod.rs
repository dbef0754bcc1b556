#![forbid(unsafe_code)]

pub mod client;
pub mod events;
pub mod session;


pub use client::{BilibiliClient, BilibiliClientConfig};
pub use events::decode_event;
pub use session::{ConnectionSession, IngestPipeline, SessionConfig, SessionState};

/// Default danmaku socket endpoint.
pub const DEFAULT_WS_URL: &str = "wss://broadcastlv.chat.bilibili.com/sub";

/// Default live API base (room init / danmu conf).
pub const DEFAULT_LIVE_API_BASE_URL: &str = "https://api.live.bilibili.com";

/// Default main API base (user profiles).
pub const DEFAULT_API_BASE_URL: &str = "https://api.bilibili.com";

/// Client version reported in the auth body.
pub const DEFAULT_CLIENT_VERSION: &str = "1.10.6";
