//! Connection name grammar: `comms:<self|app>:<id>`.
//!
//! The name is the only thing the host learns about a connection before the
//! handshake, so it carries the protocol prefix (to share one transport
//! runtime with unrelated protocols) and the privilege class.

use std::fmt;
use std::str::FromStr;

/// Protocol prefix every channel connection name starts with.
pub const PROTOCOL: &str = "comms";

/// Error returned when parsing a [`ConnectionName`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    /// The name belongs to some other protocol sharing the transport.
    #[error("foreign protocol `{0}`")]
    ForeignProtocol(String),
    /// The middle segment is not a known [`ConnectionType`].
    #[error("invalid connection type `{0}`")]
    InvalidType(String),
    /// The name is missing a segment or its id is empty.
    #[error("malformed connection name `{0}`")]
    Malformed(String),
}

/// Privilege class of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// `self`: a context of the host's own origin. The host authenticates it.
    Privileged,
    /// `app`: any other context.
    App,
}

impl ConnectionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Privileged => "self",
            Self::App => "app",
        }
    }
}

impl FromStr for ConnectionType {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "self" => Ok(Self::Privileged),
            "app" => Ok(Self::App),
            other => Err(NameError::InvalidType(other.to_owned())),
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed `comms:<type>:<id>` connection name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionName {
    pub connection_type: ConnectionType,
    /// Per-client unique id, a v4 UUID for names minted by the client channel.
    pub id: String,
}

impl ConnectionName {
    #[must_use]
    pub fn new(connection_type: ConnectionType, id: impl Into<String>) -> Self {
        Self { connection_type, id: id.into() }
    }

    /// Parse a raw transport name.
    ///
    /// # Errors
    ///
    /// [`NameError::ForeignProtocol`] when the prefix is not [`PROTOCOL`];
    /// the other variants for names that claim the protocol but are invalid.
    pub fn parse(raw: &str) -> Result<Self, NameError> {
        let mut parts = raw.splitn(3, ':');
        let protocol = parts.next().unwrap_or_default();
        if protocol != PROTOCOL {
            return Err(NameError::ForeignProtocol(protocol.to_owned()));
        }

        let (Some(kind), Some(id)) = (parts.next(), parts.next()) else {
            return Err(NameError::Malformed(raw.to_owned()));
        };
        if id.is_empty() {
            return Err(NameError::Malformed(raw.to_owned()));
        }

        Ok(Self { connection_type: kind.parse()?, id: id.to_owned() })
    }

    #[must_use]
    pub fn is_privileged(&self) -> bool {
        self.connection_type == ConnectionType::Privileged
    }
}

impl FromStr for ConnectionName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PROTOCOL}:{}:{}", self.connection_type, self.id)
    }
}
