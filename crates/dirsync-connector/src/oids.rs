//! LDAP control OIDs used by the change feeds.

/// Persistent search request control.
pub const PERSISTENT_SEARCH: &str = "2.16.840.1.113730.3.4.3";

/// Entry change notification response control.
pub const ENTRY_CHANGE_NOTIFICATION: &str = "2.16.840.1.113730.3.4.7";

/// Content synchronization request control (RFC 4533).
pub const SYNC_REQUEST: &str = "1.3.6.1.4.1.4203.1.9.1.1";

/// Content synchronization state control (RFC 4533).
pub const SYNC_STATE: &str = "1.3.6.1.4.1.4203.1.9.1.2";

/// Content synchronization done control (RFC 4533).
pub const SYNC_DONE: &str = "1.3.6.1.4.1.4203.1.9.1.3";

/// Content synchronization info intermediate response (RFC 4533).
pub const SYNC_INFO: &str = "1.3.6.1.4.1.4203.1.9.1.4";

/// Simple paged results control (RFC 2696).
pub const PAGED_RESULTS: &str = "1.2.840.113556.1.4.319";
