pub mod network {
    pub const SSH_DEFAULT_PORT: u16 = 22;
    pub const AGENT_DEFAULT_PORT: u16 = 1337;
    pub const AGENT_LOOPBACK_HOST: &str = "127.0.0.1";
    pub const TIMEOUT_CONNECT_MS: u64 = 10_000;
    pub const TIMEOUT_EXEC_DEFAULT_MS: u64 = 45_000;
    pub const EXEC_POLL_INTERVAL_MS: u64 = 20;
    /// Socket timeout slice between abort checks on agent streams.
    pub const ABORT_POLL_INTERVAL_MS: u64 = 200;
}

pub mod limits {
    pub const DEFAULT_CONCURRENCY: usize = 100;
    pub const MAX_CONCURRENCY: usize = 10_000;
    pub const MAX_CAPTURE_BYTES: usize = 256 * 1024;
    pub const MAX_AGENT_FRAME_BYTES: usize = 64 * 1024 * 1024;
}

pub mod retry {
    pub const AUTH_MAX_ATTEMPTS: usize = 10;
    pub const AUTH_BASE_DELAY_MS: u64 = 500;
    pub const AUTH_MAX_DELAY_MS: u64 = 5_000;
    pub const CONFLICT_MAX_ATTEMPTS: usize = 5;
    pub const CONFLICT_BASE_DELAY_MS: u64 = 250;
    pub const CONFLICT_MAX_DELAY_MS: u64 = 2_000;
    pub const JITTER: f64 = 0.2;
}

pub mod metadata {
    pub const SSH_KEYS_ITEM: &str = "ssh-keys";
    pub const DEFAULT_KEY_COMMENT: &str = "fleetrun";
    pub const LOCK_WAIT_MS: u64 = 5_000;
    pub const LOCK_POLL_MS: u64 = 25;
}
