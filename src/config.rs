//! Construction-time configuration the distilled spec leaves as bare
//! literals: timeouts and the extended-advertising handle capacity (§10).
use std::time::Duration;

use crate::command_channel::DEFAULT_COMMAND_TIMEOUT;
use crate::scanner::DEFAULT_SCAN_RESPONSE_TIMEOUT;

/// Gathered constructor parameters for [`crate::transport::Transport`] and
/// the components built on top of it.
#[derive(Debug, Clone, Copy)]
pub struct HciConfig {
    pub command_timeout: Duration,
    pub scan_response_timeout: Duration,
    /// Capacity passed to `AdvertisingHandleMap`. The default of 1 supports
    /// legacy advertising only; raise it to use `ExtendedAdvertiser` with
    /// more than one concurrent set.
    pub advertising_handle_capacity: usize,
}

impl Default for HciConfig {
    fn default() -> Self {
        HciConfig {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            scan_response_timeout: DEFAULT_SCAN_RESPONSE_TIMEOUT,
            advertising_handle_capacity: 1,
        }
    }
}
