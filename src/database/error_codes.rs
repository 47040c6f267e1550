//! MySQL Client Error Codes
//!
//! Constants for the client error numbers a backend reports when its connection
//! drops, so lost-connection classification does not rely on magic numbers.
//!
//! ## Reference
//!
//! Full list: <https://dev.mysql.com/doc/mysql-errors/8.0/en/client-error-reference.html>
//!
//! ## Usage
//!
//! ```rust
//! use dbmgr_core::database::error_codes::MysqlErrorCode;
//!
//! assert!(MysqlErrorCode::is_lost_connection(2013));
//! assert!(!MysqlErrorCode::is_lost_connection(1062));
//! ```

/// MySQL client error codes
///
/// Only codes the fault detector acts on are included; add more as needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MysqlErrorCode;

impl MysqlErrorCode {
    // =========================================================================
    // Connection establishment
    // =========================================================================

    /// Can't connect to local server through socket - Code 2002
    pub const CONNECTION_ERROR: u32 = 2002;

    /// Can't connect to server on host - Code 2003
    pub const CONN_HOST_ERROR: u32 = 2003;

    // =========================================================================
    // Established connection dropped
    // =========================================================================

    /// Server has gone away - Code 2006
    ///
    /// The server closed the connection, typically after `wait_timeout` or a restart.
    pub const SERVER_GONE_ERROR: u32 = 2006;

    /// Lost connection to server during query - Code 2013
    pub const SERVER_LOST: u32 = 2013;

    /// Lost connection to server at a protocol stage - Code 2055
    pub const SERVER_LOST_EXTENDED: u32 = 2055;

    // =========================================================================
    // Server side, logical
    // =========================================================================

    /// Duplicate entry for key - Code 1062
    pub const DUPLICATE_ENTRY: u32 = 1062;

    // =========================================================================
    // Helper Methods
    // =========================================================================

    /// Check if the error code means the connection is unusable
    #[inline]
    pub fn is_lost_connection(code: u32) -> bool {
        matches!(
            code,
            Self::CONNECTION_ERROR
                | Self::CONN_HOST_ERROR
                | Self::SERVER_GONE_ERROR
                | Self::SERVER_LOST
                | Self::SERVER_LOST_EXTENDED
        )
    }

    /// Check if the error code is a unique key violation
    #[inline]
    pub fn is_duplicate_entry(code: u32) -> bool {
        code == Self::DUPLICATE_ENTRY
    }
}
