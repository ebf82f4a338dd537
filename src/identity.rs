//! Endpoint identity resolution
//!
//! Both parties derive their identifiers from the same short code, so each
//! side can compute the other's identifier without any lookup.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Session role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Captures and streams; dials the counterpart
    Initiator,
    /// Receives the stream; waits for the counterpart
    Responder,
}

impl Role {
    pub fn opposite(self) -> Self {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "initiator" => Ok(Role::Initiator),
            "responder" => Ok(Role::Responder),
            other => Err(SessionError::Config(format!("unknown role: {}", other))),
        }
    }
}

/// Identifier of one endpoint on the rendezvous service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    fn new(code: &str, role: Role) -> Self {
        Self(format!("{}-{}", code, role))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Derive `(own, target)` identifiers for `role` under `code`
///
/// The code is used verbatim, whitespace included; only an empty code is
/// rejected so nothing tries to connect without one.
pub fn resolve(role: Role, code: &str) -> Result<(EndpointId, EndpointId)> {
    if code.is_empty() {
        return Err(SessionError::MissingCode);
    }

    Ok((
        EndpointId::new(code, role),
        EndpointId::new(code, role.opposite()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_scenario() {
        let (init_own, init_target) = resolve(Role::Initiator, "ABCD").unwrap();
        let (resp_own, resp_target) = resolve(Role::Responder, "ABCD").unwrap();

        assert_eq!(init_own.as_str(), "ABCD-initiator");
        assert_eq!(init_target.as_str(), "ABCD-responder");
        assert_eq!(init_target, resp_own);
        assert_eq!(resp_target, init_own);
    }

    #[test]
    fn test_resolve_is_symmetric() {
        for code in ["A", "room-42", "ÜBER", "  padded  ", "x y"] {
            let (i_own, i_target) = resolve(Role::Initiator, code).unwrap();
            let (r_own, r_target) = resolve(Role::Responder, code).unwrap();
            assert_eq!(i_target, r_own, "code {:?}", code);
            assert_eq!(r_target, i_own, "code {:?}", code);
            assert_ne!(i_own, r_own);
        }
    }

    #[test]
    fn test_resolve_rejects_empty_code() {
        assert_eq!(resolve(Role::Initiator, ""), Err(SessionError::MissingCode));
        assert_eq!(resolve(Role::Responder, ""), Err(SessionError::MissingCode));
    }

    #[test]
    fn test_resolve_keeps_whitespace() {
        let (own, target) = resolve(Role::Initiator, " AB ").unwrap();
        assert_eq!(own.as_str(), " AB -initiator");
        assert_eq!(target.as_str(), " AB -responder");

        let (blank, _) = resolve(Role::Responder, "   ").unwrap();
        assert_eq!(blank.as_str(), "   -responder");
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Initiator".parse::<Role>().unwrap(), Role::Initiator);
        assert_eq!("responder".parse::<Role>().unwrap(), Role::Responder);
        assert!("reviewer".parse::<Role>().is_err());
        assert_eq!(Role::Initiator.opposite(), Role::Responder);
    }
}
