//! Error types for instrument communication and the scope driver.

use scope_core::error::PvError;
use thiserror::Error;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Failures of the SCPI transport.
#[derive(Error, Debug)]
pub enum ScpiError {
    /// No complete reply within the I/O timeout.
    #[error("Timeout waiting for response to '{0}'")]
    Timeout(String),

    /// The instrument closed the connection.
    #[error("Connection closed by instrument")]
    ConnectionClosed,

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The reply does not follow the expected framing.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ScpiError {
    /// Short label used for counting repeated failures and in status lines.
    pub fn label(&self) -> &'static str {
        match self {
            ScpiError::Timeout(_) => "VI_ERROR_TMO",
            ScpiError::ConnectionClosed => "VI_ERROR_CONN_LOST",
            ScpiError::Io(_) => "VI_ERROR_IO",
            ScpiError::Protocol(_) => "VI_ERROR_PROTOCOL",
        }
    }

    /// True for failures after which the connection cannot be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScpiError::ConnectionClosed | ScpiError::Io(_))
    }
}

/// Errors raised by the RIGOL driver.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Instrument communication failed.
    #[error(transparent)]
    Scpi(#[from] ScpiError),

    /// A PV operation failed.
    #[error(transparent)]
    Pv(#[from] PvError),

    /// The resource string cannot be used.
    #[error("Invalid resource '{resource}': {reason}")]
    Resource {
        /// The string as given.
        resource: String,
        /// What is wrong with it.
        reason: String,
    },

    /// `*IDN?` did not identify a RIGOL instrument.
    #[error("Instrument is not RIGOL: {0}")]
    NotRigol(String),

    /// The instrument does not answer a mnemonic bound to a PV.
    #[error("Invalid SCPI in PV {pv}: {scpi}? : {source}")]
    InvalidScpi {
        /// PV bound to the mnemonic.
        pv: String,
        /// Short mnemonic that was queried.
        scpi: String,
        /// Transport failure of the query.
        #[source]
        source: ScpiError,
    },

    /// The combined settings query returned the wrong number of fields.
    #[error("Reading settings failed for PV {first_missing}: expected {expected} values, got {got}")]
    SettingsMismatch {
        /// Number of SCPI-bound PVs.
        expected: usize,
        /// Number of values in the reply.
        got: usize,
        /// First PV without a value.
        first_missing: String,
    },

    /// A setting reply cannot be converted to the PV kind.
    #[error("Cannot convert '{reply}' for PV {pv}: {source}")]
    Conversion {
        /// PV being adopted.
        pv: String,
        /// Reply of the scope.
        reply: String,
        /// Why the reply does not fit the PV.
        #[source]
        source: PvError,
    },

    /// A reply has an unexpected shape.
    #[error("Malformed reply to '{query}': '{reply}'")]
    Reply {
        /// Query sent.
        query: String,
        /// Reply received.
        reply: String,
    },
}

impl DriverError {
    /// True if this is a transport timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DriverError::Scpi(ScpiError::Timeout(_))
                | DriverError::InvalidScpi {
                    source: ScpiError::Timeout(_),
                    ..
                }
        )
    }

    /// True if the instrument connection is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::Scpi(e) if e.is_fatal())
    }

    /// True if the error comes from the transport rather than from parsing.
    pub fn is_transport(&self) -> bool {
        matches!(self, DriverError::Scpi(_) | DriverError::InvalidScpi { .. })
    }
}
