use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scheme prefix on encoded invites. Optional on parse so a pasted
/// `host:port/secret` still works.
pub const INVITE_SCHEME: &str = "partyline://";

/// Errors from [`Invite::parse`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InviteError {
    #[error("invite must look like {INVITE_SCHEME}host:port/secret")]
    MissingSecret,
    #[error("invite is missing a host:port address")]
    MissingAddress,
    #[error("invalid port in invite: {0}")]
    InvalidPort(String),
}

/// Everything a peer needs to join a party: where to connect and the
/// shared secret. Immutable for the lifetime of a session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Invite {
    pub host: String,
    pub port: u16,
    pub secret: String,
}

impl Invite {
    pub fn new(host: impl Into<String>, port: u16, secret: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            secret: secret.into(),
        }
    }

    /// Render the shareable invite string.
    pub fn encode(&self) -> String {
        format!("{INVITE_SCHEME}{}:{}/{}", self.host, self.port, self.secret)
    }

    /// Parse an invite string. The scheme prefix is stripped when present;
    /// the secret is everything after the first `/`.
    pub fn parse(input: &str) -> Result<Self, InviteError> {
        let trimmed = input.trim();
        let rest = trimmed.strip_prefix(INVITE_SCHEME).unwrap_or(trimmed);
        let (addr, secret) = rest.split_once('/').ok_or(InviteError::MissingSecret)?;
        if secret.is_empty() {
            return Err(InviteError::MissingSecret);
        }
        // rsplit keeps IPv6-style hosts with embedded colons intact
        let (host, port) = addr.rsplit_once(':').ok_or(InviteError::MissingAddress)?;
        if host.is_empty() {
            return Err(InviteError::MissingAddress);
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| InviteError::InvalidPort(port.to_string()))?;
        Ok(Self {
            host: host.to_string(),
            port,
            secret: secret.to_string(),
        })
    }
}
