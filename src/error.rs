//! Error types returned by handlespace, peer list and registrar operations.
//!
//! Every recoverable failure maps to the numeric RSerPool error code carried in ASAP and ENRP
//! error parameters, see [`RegistrarError::code`]. A violated internal invariant is reported
//! through [`RegistrarError::InternalConsistency`], which callers must treat as fatal.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = RegistrarError> = std::result::Result<T, E>;

/// RSerPool error code for success.
pub const RSPERR_OKAY: u16 = 0x0000;

/// Error returned by registrar core operations.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Error)]
pub enum RegistrarError {
    /// The element's policy does not match the policy of its pool.
    #[error("incompatible pool policy")]
    IncompatiblePoolPolicy,
    /// A capacity limit was reached.
    #[error("out of resources")]
    OutOfResources,
    /// The control channel flag does not match the pool's.
    #[error("wrong control channel handling")]
    WrongControlChannelHandling,
    /// The requested pool, element or peer does not exist.
    #[error("not found")]
    NotFound,
    /// The transport protocol does not match the pool's.
    #[error("wrong protocol")]
    WrongProtocol,
    /// The policy is known but not supported here.
    #[error("unsupported pool policy")]
    UnsupportedPoolPolicy,
    /// Identifier is zero, or has the wrong form for the requested entry kind.
    #[error("invalid ID")]
    InvalidId,
    /// Identifier equals the registrar's own identifier.
    #[error("own ID")]
    OwnId,
    /// Identifier already exists.
    #[error("duplicate ID")]
    DuplicateId,
    /// Unknown policy type or out-of-range policy settings.
    #[error("invalid pool policy")]
    InvalidPoolPolicy,
    /// Pool handle is empty or longer than the maximum.
    #[error("invalid pool handle")]
    InvalidPoolHandle,
    /// Transport address block is unusable.
    #[error("invalid addresses")]
    InvalidAddresses,
    /// Registrator transport is unusable.
    #[error("invalid registrator")]
    InvalidRegistrator,
    /// No ASAP address left after filtering.
    #[error("no usable ASAP addresses")]
    NoUsableAsapAddresses,
    /// No user address left after filtering.
    #[error("no usable user addresses")]
    NoUsableUserAddresses,
    /// Handle resolution selected no element.
    #[error("no pool elements")]
    NoElements,
    /// An internal index invariant was violated.
    #[error("internal consistency violation: {0}")]
    InternalConsistency(String),
}

impl RegistrarError {
    /// Returns the RSerPool error code.
    ///
    /// [`InternalConsistency`](RegistrarError::InternalConsistency) has no wire representation
    /// and maps to `0xffff`.
    pub fn code(&self) -> u16 {
        match self {
            RegistrarError::IncompatiblePoolPolicy => 0x0005,
            RegistrarError::OutOfResources => 0x0006,
            RegistrarError::WrongControlChannelHandling => 0x0008,
            RegistrarError::NotFound => 0x0009,
            RegistrarError::WrongProtocol => 0x100a,
            RegistrarError::UnsupportedPoolPolicy => 0x100b,
            RegistrarError::InvalidId => 0xf000,
            RegistrarError::OwnId => 0xf001,
            RegistrarError::DuplicateId => 0xf002,
            RegistrarError::InvalidPoolPolicy => 0xf003,
            RegistrarError::InvalidPoolHandle => 0xf004,
            RegistrarError::InvalidAddresses => 0xf005,
            RegistrarError::InvalidRegistrator => 0xf006,
            RegistrarError::NoUsableAsapAddresses => 0xf007,
            RegistrarError::NoUsableUserAddresses => 0xf008,
            RegistrarError::NoElements => 0xf009,
            RegistrarError::InternalConsistency(_) => 0xffff,
        }
    }

    /// Maps an RSerPool error code back to an error.
    ///
    /// Returns `None` for [`RSPERR_OKAY`] and for unknown codes.
    pub fn from_code(code: u16) -> Option<Self> {
        let err = match code {
            0x0005 => RegistrarError::IncompatiblePoolPolicy,
            0x0006 => RegistrarError::OutOfResources,
            0x0008 => RegistrarError::WrongControlChannelHandling,
            0x0009 => RegistrarError::NotFound,
            0x100a => RegistrarError::WrongProtocol,
            0x100b => RegistrarError::UnsupportedPoolPolicy,
            0xf000 => RegistrarError::InvalidId,
            0xf001 => RegistrarError::OwnId,
            0xf002 => RegistrarError::DuplicateId,
            0xf003 => RegistrarError::InvalidPoolPolicy,
            0xf004 => RegistrarError::InvalidPoolHandle,
            0xf005 => RegistrarError::InvalidAddresses,
            0xf006 => RegistrarError::InvalidRegistrator,
            0xf007 => RegistrarError::NoUsableAsapAddresses,
            0xf008 => RegistrarError::NoUsableUserAddresses,
            0xf009 => RegistrarError::NoElements,
            _ => return None,
        };
        Some(err)
    }

    /// Returns `true` if the error signals a broken internal invariant.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RegistrarError::InternalConsistency(_))
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(%msg, "internal consistency violation");
        RegistrarError::InternalConsistency(msg)
    }
}

/// Error returned when talking to a running registrar through a
/// [`RegistrarRef`](crate::service::RegistrarRef).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The registrar task isn't running.
    #[error("registrar not running")]
    RegistrarNotRunning,
    /// The registrar task stopped before a reply could be received.
    #[error("registrar stopped")]
    RegistrarStopped,
    /// The request itself failed.
    #[error(transparent)]
    Registrar(#[from] RegistrarError),
}

impl ServiceError {
    /// Returns the RSerPool error code of a failed request, if the request reached the
    /// registrar.
    pub fn code(&self) -> Option<u16> {
        match self {
            ServiceError::Registrar(err) => Some(err.code()),
            _ => None,
        }
    }
}

/// Returns the RSerPool error code of a result, [`RSPERR_OKAY`] on success.
pub fn result_code<T>(res: &Result<T>) -> u16 {
    match res {
        Ok(_) => RSPERR_OKAY,
        Err(err) => err.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_rserpool_values() {
        assert_eq!(RegistrarError::NotFound.code(), 0x9);
        assert_eq!(RegistrarError::DuplicateId.code(), 0xf002);
        assert_eq!(RegistrarError::WrongProtocol.code(), 0x100a);
        assert_eq!(result_code(&Ok::<_, RegistrarError>(())), RSPERR_OKAY);
    }

    #[test]
    fn from_code_inverts_code() {
        let all = [
            RegistrarError::IncompatiblePoolPolicy,
            RegistrarError::OutOfResources,
            RegistrarError::WrongControlChannelHandling,
            RegistrarError::NotFound,
            RegistrarError::WrongProtocol,
            RegistrarError::UnsupportedPoolPolicy,
            RegistrarError::InvalidId,
            RegistrarError::OwnId,
            RegistrarError::DuplicateId,
            RegistrarError::InvalidPoolPolicy,
            RegistrarError::InvalidPoolHandle,
            RegistrarError::InvalidAddresses,
            RegistrarError::InvalidRegistrator,
            RegistrarError::NoUsableAsapAddresses,
            RegistrarError::NoUsableUserAddresses,
            RegistrarError::NoElements,
        ];
        for err in all {
            assert_eq!(RegistrarError::from_code(err.code()), Some(err));
        }
        assert_eq!(RegistrarError::from_code(RSPERR_OKAY), None);
    }

    #[test]
    fn internal_consistency_is_fatal() {
        let err = RegistrarError::InternalConsistency("timer index".into());
        assert!(err.is_fatal());
        assert!(!RegistrarError::NotFound.is_fatal());
        assert_eq!(err.to_string(), "internal consistency violation: timer index");
    }

    #[test]
    fn service_error_wraps_registrar_error() {
        let err = ServiceError::from(RegistrarError::OwnId);
        assert_eq!(err.code(), Some(0xf001));
        assert_eq!(err.to_string(), "own ID");
        assert_eq!(ServiceError::RegistrarStopped.code(), None);
    }
}
