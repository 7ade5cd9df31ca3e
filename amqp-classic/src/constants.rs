//! Protocol constants

use std::time::Duration;

/// Default broker port
pub const DEFAULT_PORT: u16 = 5672;

/// Channel 0 carries connection-level methods
pub const CONNECTION_CHANNEL: u16 = 0;

/// Lowest channel id a session may use
pub const MIN_USABLE_CHANNEL_NUM: u16 = 1;

/// Channel max used when the broker sends zero
pub const DEFAULT_CHANNEL_MAX: u16 = u16::MAX;

/// Smallest max frame size any version accepts during tuning
pub const MIN_MAX_FRAME_SIZE: u32 = 4096;

/// Default max frame size offered by the client for 0-8, 0-9 and 0-9-1
pub const DEFAULT_LEGACY_MAX_FRAME_SIZE: u32 = 131_072;

/// Default and largest max frame size for 0-10 segmented framing
pub const DEFAULT_SEGMENTED_MAX_FRAME_SIZE: u32 = u16::MAX as u32;

/// End marker of every 0-8, 0-9 and 0-9-1 frame
pub const FRAME_END: u8 = 0xCE;

/// Default timeout for request/response exchanges
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout while waiting for a connection state
pub const DEFAULT_STATE_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// How many heartbeat periods may pass without traffic before the
/// connection is considered dead
pub const DEFAULT_HEARTBEAT_TIMEOUT_FACTOR: f32 = 2.0;

/// Default prefetch high water mark
pub const DEFAULT_PREFETCH_HIGH: u16 = 500;

/// Default prefetch low water mark
pub const DEFAULT_PREFETCH_LOW: u16 = 250;

/* ------------------------------- Reply codes ------------------------------ */

/// Success
pub const REPLY_SUCCESS: u16 = 200;

/// Content too large
pub const CONTENT_TOO_LARGE: u16 = 311;

/// No route for a mandatory message
pub const NO_ROUTE: u16 = 312;

/// No consumers for an immediate message
pub const NO_CONSUMERS: u16 = 313;

/// Broker forced the connection closed, usually on shutdown
pub const CONNECTION_FORCED: u16 = 320;

/// Invalid path
pub const INVALID_PATH: u16 = 402;

/// Access refused
pub const ACCESS_REFUSED: u16 = 403;

/// Not found
pub const NOT_FOUND: u16 = 404;

/// Resource locked
pub const RESOURCE_LOCKED: u16 = 405;

/// Precondition failed
pub const PRECONDITION_FAILED: u16 = 406;

/// Frame error
pub const FRAME_ERROR: u16 = 501;

/// Syntax error
pub const SYNTAX_ERROR: u16 = 502;

/// Command invalid
pub const COMMAND_INVALID: u16 = 503;

/// Channel error
pub const CHANNEL_ERROR: u16 = 504;

/// Unexpected frame
pub const UNEXPECTED_FRAME: u16 = 505;

/// Resource error
pub const RESOURCE_ERROR: u16 = 506;

/// Not allowed
pub const NOT_ALLOWED: u16 = 530;

/// Not implemented
pub const NOT_IMPLEMENTED: u16 = 540;

/// Internal error
pub const INTERNAL_ERROR: u16 = 541;
