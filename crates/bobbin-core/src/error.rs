use thiserror::Error;

use crate::app::{BuildError, ConfigError, ResultError};
use crate::ports::{BrokerError, StoreError};
use crate::typed::{CodecError, RegistryError};

/// Crate-level error. Task outcomes are never reported through this type;
/// see `domain::TaskFailure`.
#[derive(Debug, Error)]
pub enum BobbinError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Result(#[from] ResultError),
}

impl BobbinError {
    /// Infrastructure outages that callers back off from and retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BobbinError::Broker(BrokerError::Unavailable(_))
                | BobbinError::Store(StoreError::Unavailable(_))
                | BobbinError::Store(StoreError::Contention { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_outages_are_transient() {
        assert!(BobbinError::from(BrokerError::Unavailable("down".into())).is_transient());
        assert!(BobbinError::from(StoreError::Unavailable("down".into())).is_transient());
        assert!(!BobbinError::from(RegistryError::NotFound("x".into())).is_transient());
    }
}
