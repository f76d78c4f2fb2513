//! Network gateway for the PV registry.
//!
//! Clients connect over TCP and exchange newline-delimited JSON:
//!
//! ```text
//! -> {"op":"get","pv":"rigol0:acqCount"}
//! <- {"ok":true,"pv":"rigol0:acqCount","sample":{"value":12,...}}
//! -> {"op":"put","pv":"rigol0:server","value":"Stop"}
//! <- {"ok":true,"pv":"rigol0:server"}
//! ```

pub mod gateway;
pub mod protocol;

pub use gateway::Gateway;
pub use protocol::{Request, Response};
