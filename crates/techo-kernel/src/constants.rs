//! Session defaults.
//!
//! Centralizes hardcoded values so configuration and documentation agree.

/// Broadcast channel capacity for session events.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Deleted cells and sections kept in the bin before the oldest is dropped.
pub const DEFAULT_BIN_LIMIT: usize = 64;

/// Command queue depth between session handles and the session task.
pub const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Backend event queue depth.
pub const BACKEND_CHANNEL_CAPACITY: usize = 256;

/// Smallest autosave interval honoured, in seconds.
pub const MIN_AUTOSAVE_INTERVAL_SECS: u64 = 1;
