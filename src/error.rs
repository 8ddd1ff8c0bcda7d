use std::fmt;

use rusqlite::ErrorCode;
use thiserror::Error;

/// The two record kinds kept by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Pet,
    Microchip,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Pet => f.write_str("pet"),
            Entity::Microchip => f.write_str("microchip"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("A microchip with code '{0}' already exists")]
    DuplicateCode(String),

    #[error("Microchip {microchip_id} does not belong to pet {pet_id}")]
    OwnershipMismatch { pet_id: i64, microchip_id: i64 },

    #[error("No active {entity} with id {id}")]
    NotFound { entity: Entity, id: i64 },

    #[error("Store assigned no identity to the new {0}")]
    MissingIdentity(Entity),

    #[error("Store failure while trying to {context}")]
    Store {
        context: String,
        #[source]
        source: rusqlite::Error,
    },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

impl RegistryError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn not_found(entity: Entity, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    /// True when the store rejected a write because the microchip code is
    /// already taken by an active row.
    pub fn is_duplicate_code(&self) -> bool {
        match self {
            Self::DuplicateCode(_) => true,
            Self::Store { source, .. } => violates_code_uniqueness(source),
            _ => false,
        }
    }

    /// Folds a store-level code collision into the same kind the service
    /// reports from its own pre-check.
    pub(crate) fn classify_code_conflict(self, code: &str) -> Self {
        if self.is_duplicate_code() {
            Self::DuplicateCode(code.trim().to_string())
        } else {
            self
        }
    }
}

/// Attach operation context to a raw store error.
pub(crate) trait StoreContext<T> {
    fn store_context<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> StoreContext<T> for std::result::Result<T, rusqlite::Error> {
    fn store_context<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| RegistryError::Store {
            context: context().into(),
            source,
        })
    }
}

fn violates_code_uniqueness(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, Some(message)) => {
            failure.code == ErrorCode::ConstraintViolation
                && failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                && message.contains("microchips.code")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_failure(message: &str) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE),
            Some(message.to_string()),
        )
    }

    #[test]
    fn code_collision_from_store_maps_to_duplicate_code() {
        let err = RegistryError::Store {
            context: "insert microchip".into(),
            source: unique_failure("UNIQUE constraint failed: microchips.code"),
        };
        match err.classify_code_conflict(" CHIP-A ") {
            RegistryError::DuplicateCode(code) => assert_eq!(code, "CHIP-A"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn other_unique_violations_stay_store_failures() {
        let err = RegistryError::Store {
            context: "insert pet".into(),
            source: unique_failure("UNIQUE constraint failed: pets.microchip_id"),
        };
        assert!(matches!(
            err.classify_code_conflict("CHIP-A"),
            RegistryError::Store { .. }
        ));
    }

    #[test]
    fn store_message_names_the_operation_not_the_driver_text() {
        let err = RegistryError::Store {
            context: "update pet 7".into(),
            source: unique_failure("UNIQUE constraint failed: pets.microchip_id"),
        };
        assert_eq!(err.to_string(), "Store failure while trying to update pet 7");
    }
}
