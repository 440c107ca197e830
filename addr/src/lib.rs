//! Virtual addressing primitives.
//!
//! A [`VirtualIp`] identifies a host or router on the virtual fabric; it carries no notion of a
//! real network address and is opaque outside of equality and display. A [`VirtualAddress`] pairs
//! a `VirtualIp` with a [`Port`] to name one transport endpoint.
#![deny(missing_docs)]
#![deny(warnings)]
use failure::Fail;
use std::fmt;
use std::str::FromStr;

/// Opaque identifier for a host or router on the virtual fabric.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct VirtualIp(String);

/// Error parsing a [`VirtualIp`] or [`Port`] from a string.
#[derive(Debug, Fail)]
pub enum AddrParseError {
    /// The virtual IP label was empty.
    #[fail(display = "virtual ip label must not be empty")]
    EmptyVip,
    /// The port could not be parsed as an integer.
    #[fail(display = "{}", _0)]
    Port(std::num::ParseIntError),
}

impl From<std::num::ParseIntError> for AddrParseError {
    fn from(err: std::num::ParseIntError) -> Self {
        Self::Port(err)
    }
}

impl VirtualIp {
    /// Creates a virtual IP from any label.
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// Returns the label backing this virtual IP.
    pub fn label(&self) -> &str {
        &self.0
    }
}

impl FromStr for VirtualIp {
    type Err = AddrParseError;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        if label.is_empty() {
            return Err(AddrParseError::EmptyVip);
        }
        Ok(Self(label.to_string()))
    }
}

impl fmt::Display for VirtualIp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VirtualIp {
    fn from(label: &str) -> Self {
        Self(label.to_string())
    }
}

impl From<String> for VirtualIp {
    fn from(label: String) -> Self {
        Self(label)
    }
}

/// A 16-bit transport port.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Port(pub u16);

impl Port {
    /// Returns the raw port number.
    pub fn number(self) -> u16 {
        self.0
    }
}

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Self(port)
    }
}

impl FromStr for Port {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(u16::from_str(s)?))
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A virtual address: a `(vip, port)` pair naming one transport endpoint.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct VirtualAddress {
    /// The virtual IP of the endpoint.
    pub vip: VirtualIp,
    /// The port of the endpoint.
    pub port: Port,
}

impl VirtualAddress {
    /// Creates a new virtual address.
    pub fn new(vip: impl Into<VirtualIp>, port: impl Into<Port>) -> Self {
        Self {
            vip: vip.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.vip, self.port)
    }
}
