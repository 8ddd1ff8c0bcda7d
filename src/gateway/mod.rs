//! Single-entity record gateways.
//!
//! Every write comes in two explicit forms: an autonomous one that opens,
//! auto-commits and releases its own connection, and a `_within` form that
//! runs on the connection of a caller-owned [`TransactionScope`] and never
//! commits or rolls back. Reads only ever see active rows.

mod microchip;
mod pet;

pub use microchip::SqliteMicrochipGateway;
pub use pet::SqlitePetGateway;

use crate::error::Result;
use crate::model::{Enrollment, Microchip, Pet};
use crate::transaction::TransactionScope;

pub trait MicrochipGateway {
    /// Insert and fill in the store-assigned id.
    fn insert(&self, microchip: &mut Microchip) -> Result<()>;
    fn insert_within(&self, microchip: &mut Microchip, scope: &TransactionScope) -> Result<()>;

    fn update(&self, microchip: &Microchip) -> Result<()>;
    fn update_within(&self, microchip: &Microchip, scope: &TransactionScope) -> Result<()>;

    /// Flip the deleted flag. An absent or already deleted row is `NotFound`.
    fn soft_delete(&self, id: i64) -> Result<()>;
    fn soft_delete_within(&self, id: i64, scope: &TransactionScope) -> Result<()>;

    fn get_by_id(&self, id: i64) -> Result<Option<Microchip>>;
    fn get_by_id_within(&self, id: i64, scope: &TransactionScope) -> Result<Option<Microchip>>;

    fn list_active(&self) -> Result<Vec<Microchip>>;

    /// Exact match on the trimmed code.
    fn find_by_code(&self, code: &str) -> Result<Option<Microchip>>;
    fn find_by_code_within(&self, code: &str, scope: &TransactionScope)
        -> Result<Option<Microchip>>;
}

pub trait PetGateway {
    fn insert(&self, pet: &mut Pet) -> Result<()>;
    fn insert_within(&self, pet: &mut Pet, scope: &TransactionScope) -> Result<()>;

    fn update(&self, pet: &Pet) -> Result<()>;
    fn update_within(&self, pet: &Pet, scope: &TransactionScope) -> Result<()>;

    fn soft_delete(&self, id: i64) -> Result<()>;
    fn soft_delete_within(&self, id: i64, scope: &TransactionScope) -> Result<()>;

    fn get_by_id(&self, id: i64) -> Result<Option<Pet>>;
    fn get_by_id_within(&self, id: i64, scope: &TransactionScope) -> Result<Option<Pet>>;

    fn list_active(&self) -> Result<Vec<Pet>>;

    /// Case-insensitive substring match on name or owner.
    fn search_by_name_or_owner(&self, filter: &str) -> Result<Vec<Pet>>;

    /// Reads that load each pet together with the active microchip it
    /// references. A reference to a deleted microchip loads `None`.
    fn get_enrollment(&self, id: i64) -> Result<Option<Enrollment>>;
    fn list_enrollments(&self) -> Result<Vec<Enrollment>>;
    fn search_enrollments(&self, filter: &str) -> Result<Vec<Enrollment>>;
}
