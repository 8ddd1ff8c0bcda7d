//! Pet and microchip registry on SQLite.
//!
//! # Intention
//!
//! - Keep every pet's microchip reference pointing at an active microchip,
//!   with at most one pet per microchip.
//! - Never remove rows: deletion flips a flag and every read skips flagged rows.
//! - Make multi-record writes all-or-nothing through [`TransactionScope`].
//!
//! # Architectural Boundaries
//!
//! - [`sqlite`] declares the store schema and opens connections.
//! - [`gateway`] reads and writes one record kind, either on its own
//!   connection or on a caller's transaction scope.
//! - [`RegistryService`] is the only place that coordinates both kinds.
//! - Prompts, listing formats and credentials belong to the caller.

pub mod error;
pub mod gateway;
pub mod model;
pub mod service;
pub mod sqlite;
pub mod transaction;

pub use error::{Entity, RegistryError, Result};
pub use gateway::{MicrochipGateway, PetGateway, SqliteMicrochipGateway, SqlitePetGateway};
pub use model::{Enrollment, Microchip, Pet};
pub use service::RegistryService;
pub use sqlite::{registry_schema, SqliteConfig, Store};
pub use transaction::TransactionScope;
