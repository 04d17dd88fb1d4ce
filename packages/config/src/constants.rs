// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Mockbox

// API Server Configuration
pub const MOCKBOX_API_HOST: &str = "MOCKBOX_API_HOST";
pub const MOCKBOX_API_PORT: &str = "MOCKBOX_API_PORT";
pub const PORT: &str = "PORT"; // Legacy
pub const MOCKBOX_PUBLIC_BASE_URL: &str = "MOCKBOX_PUBLIC_BASE_URL";

// CORS Configuration
pub const MOCKBOX_CORS_ORIGIN: &str = "MOCKBOX_CORS_ORIGIN";

// Port Pool
pub const MOCKBOX_PORT_RANGE_START: &str = "MOCKBOX_PORT_RANGE_START";
pub const MOCKBOX_PORT_RANGE_END: &str = "MOCKBOX_PORT_RANGE_END";

// Sandbox Lifetime
pub const MOCKBOX_DEFAULT_TTL_MINUTES: &str = "MOCKBOX_DEFAULT_TTL_MINUTES";
pub const MOCKBOX_MAX_TTL_MINUTES: &str = "MOCKBOX_MAX_TTL_MINUTES";
pub const MOCKBOX_REFRESH_TTL_ON_ACCESS: &str = "MOCKBOX_REFRESH_TTL_ON_ACCESS";
pub const MOCKBOX_MAX_SANDBOXES_PER_OWNER: &str = "MOCKBOX_MAX_SANDBOXES_PER_OWNER";

// Service Launching
pub const MOCKBOX_LAUNCHER: &str = "MOCKBOX_LAUNCHER";
pub const MOCKBOX_MOCK_BINARY: &str = "MOCKBOX_MOCK_BINARY";
pub const MOCKBOX_READINESS_TIMEOUT_MS: &str = "MOCKBOX_READINESS_TIMEOUT_MS";
pub const MOCKBOX_STOP_GRACE_PERIOD_MS: &str = "MOCKBOX_STOP_GRACE_PERIOD_MS";

// Reaper
pub const MOCKBOX_REAPER_INTERVAL_SECS: &str = "MOCKBOX_REAPER_INTERVAL_SECS";

// Proxy
pub const MOCKBOX_PROXY_TIMEOUT_SECS: &str = "MOCKBOX_PROXY_TIMEOUT_SECS";

// Persistence
pub const MOCKBOX_DATABASE_PATH: &str = "MOCKBOX_DATABASE_PATH";
pub const MOCKBOX_STATE_DIR: &str = "MOCKBOX_STATE_DIR";

// Authorization
pub const MOCKBOX_ALLOWED_OWNERS: &str = "MOCKBOX_ALLOWED_OWNERS";

// Logging
pub const RUST_LOG: &str = "RUST_LOG";
pub const MOCKBOX_LOG_JSON: &str = "MOCKBOX_LOG_JSON";

// System Environment Variables
pub const HOME: &str = "HOME";
