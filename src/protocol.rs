//! Shared protocol constants for the driftsync framed control channel

// Frame header constants
pub const MAGIC: &[u8; 4] = b"DSNC";
pub const VERSION: u16 = 1;

// Maximum frame payload size (64MB) - prevents DoS via memory exhaustion
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

// Default control-channel port for drift:// URLs
pub const DEFAULT_PORT: u16 = 8105;

// ApiType tags (keep numeric stable: shared contract with the file server)
pub mod api {
    pub const UNKNOWN: i32 = 0;
    pub const AUTH: i32 = 1;
    pub const INFO: i32 = 2;
    pub const SYNC_MESSAGE: i32 = 3;
}

// Status codes: zero is success, errors are negative
pub mod code {
    pub const SUCCESS: i32 = 0;
    pub const FAIL: i32 = -1;
    pub const UNAUTHORIZED: i32 = -401;
    pub const NOT_FOUND: i32 = -404;
    pub const SERVER_ERROR: i32 = -500;

    // File-list endpoint errors
    pub const BAD_PREFIX: i32 = -501;
    pub const INVALID_PATH: i32 = -502;
    pub const OPEN_ERROR: i32 = -503;
    pub const STAT_ERROR: i32 = -504;
    pub const READ_DIR_ERROR: i32 = -505;
}

// HTTP routes on the file server origin
pub mod route {
    pub const SIGN_IN: &str = "/signin";
    pub const SOURCE_PREFIX: &str = "source";
    pub const DEST_PREFIX: &str = "dest";
}

// Centralized timeout constants so both peers agree on handshake pacing
pub mod timeouts {
    use std::time::Duration;

    // Auth and Info handshake replies
    pub const HANDSHAKE: Duration = Duration::from_secs(180);

    // Processor poll interval when the message queue is empty
    pub const IDLE_QUEUE_POLL: Duration = Duration::from_secs(1);

    // Server closes unauthorized connections after this window
    pub const AUTH_CHECK_WINDOW: Duration = Duration::from_secs(60);

    // Consecutive receive errors before the adaptive sleep kicks in;
    // sleep is min(err_count / threshold, threshold) seconds
    pub const READ_ERR_THRESHOLD: u64 = 20;

    pub fn adaptive_read_sleep(err_count: u64) -> Duration {
        let secs = (err_count / READ_ERR_THRESHOLD).min(READ_ERR_THRESHOLD);
        Duration::from_secs(secs)
    }
}
