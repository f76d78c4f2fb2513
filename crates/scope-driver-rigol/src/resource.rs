//! VISA-style resource strings.
//!
//! Two TCP/IP forms are understood:
//!
//! - `TCPIP[board]::<host>[::<device>]::INSTR`
//! - `TCPIP[board]::<host>::<port>::SOCKET`
//!
//! RIGOL scopes expose a raw SCPI socket on port 5555. `INSTR` resources are
//! served over that socket because the VXI-11 RPC layer is not implemented.

use crate::error::{DriverError, Result};
use std::fmt;
use std::str::FromStr;

/// Raw SCPI socket port of RIGOL instruments.
pub const RIGOL_SCPI_PORT: u16 = 5555;

/// How the resource was addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// `::INSTR`, mapped to the raw SCPI socket.
    Instr,
    /// `::SOCKET` with an explicit port.
    Socket,
}

/// A parsed resource string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Addressing form.
    pub kind: ResourceKind,
}

impl Resource {
    /// `host:port` for socket connection.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ResourceKind::Instr => write!(f, "TCPIP::{}::INSTR", self.host),
            ResourceKind::Socket => write!(f, "TCPIP::{}::{}::SOCKET", self.host, self.port),
        }
    }
}

fn invalid(resource: &str, reason: impl Into<String>) -> DriverError {
    DriverError::Resource {
        resource: resource.to_string(),
        reason: reason.into(),
    }
}

impl FromStr for Resource {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_uppercase();
        let parts: Vec<&str> = upper.split("::").collect();

        let interface = parts.first().copied().unwrap_or_default();
        let board = interface.strip_prefix("TCPIP").ok_or_else(|| {
            invalid(s, format!("interface '{}' is not supported, use TCPIP", interface))
        })?;
        if !board.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid(s, format!("bad board number in '{}'", interface)));
        }

        let host = parts.get(1).copied().unwrap_or_default();
        if host.is_empty() {
            return Err(invalid(s, "missing host"));
        }

        match (parts.len(), parts.last().copied()) {
            (3 | 4, Some("INSTR")) => Ok(Resource {
                host: host.to_string(),
                port: RIGOL_SCPI_PORT,
                kind: ResourceKind::Instr,
            }),
            (4, Some("SOCKET")) => {
                let port = parts[2]
                    .parse::<u16>()
                    .map_err(|_| invalid(s, format!("bad port '{}'", parts[2])))?;
                Ok(Resource {
                    host: host.to_string(),
                    port,
                    kind: ResourceKind::Socket,
                })
            }
            (_, Some("HISLIP0" | "HISLIP")) => Err(invalid(s, "HiSLIP is not supported")),
            _ => Err(invalid(s, "expected ::INSTR or ::<port>::SOCKET")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_instr_maps_to_scpi_socket() {
        let r: Resource = "TCPIP::192.168.27.31::INSTR".parse().unwrap();
        assert_eq!(r.host, "192.168.27.31");
        assert_eq!(r.port, RIGOL_SCPI_PORT);
        assert_eq!(r.kind, ResourceKind::Instr);
        assert_eq!(r.address(), "192.168.27.31:5555");
    }

    #[test]
    fn test_socket_and_board_number() {
        let r: Resource = "tcpip0::scope.lab::5025::socket".parse().unwrap();
        assert_eq!(r.host, "SCOPE.LAB");
        assert_eq!(r.port, 5025);
        assert_eq!(r.kind, ResourceKind::Socket);
        assert_eq!(r.to_string(), "TCPIP::SCOPE.LAB::5025::SOCKET");

        let r: Resource = "TCPIP0::10.0.0.2::inst0::INSTR".parse().unwrap();
        assert_eq!(r.kind, ResourceKind::Instr);
    }

    #[test]
    fn test_rejected_resources() {
        for bad in [
            "USB0::0x1AB1::0x04CE::DS1ZA1::INSTR",
            "TCPIP::::INSTR",
            "TCPIP::10.0.0.2::notaport::SOCKET",
            "TCPIP::10.0.0.2::hislip0::INSTR::X",
            "TCPIPX::10.0.0.2::INSTR",
            "10.0.0.2",
        ] {
            assert!(
                matches!(bad.parse::<Resource>(), Err(DriverError::Resource { .. })),
                "{} should be rejected",
                bad
            );
        }
    }
}
