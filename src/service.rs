//! Coordination of pet and microchip writes.
//!
//! This is the only layer that knows both record kinds, and it owns every
//! rule that spans them:
//!
//! - a microchip is written before the pet that references it, so the pet's
//!   reference always resolves to an existing identity;
//! - a pet's reference is cleared before the microchip it pointed at is
//!   deleted, so no active pet ever references a deleted microchip;
//! - multi-record writes share one [`TransactionScope`], and any failure
//!   rolls the whole scope back before the error is returned.
//!
//! The store's reassignment guard is not re-checked here. Repointing a set
//! reference without clearing it first surfaces as a store failure.

use tracing::{info, warn};

use crate::error::{Entity, RegistryError, Result};
use crate::gateway::{MicrochipGateway, PetGateway, SqliteMicrochipGateway, SqlitePetGateway};
use crate::model::{require_id, Enrollment, Microchip, Pet};
use crate::sqlite::Store;
use crate::transaction::TransactionScope;

pub struct RegistryService<P = SqlitePetGateway, M = SqliteMicrochipGateway> {
    store: Store,
    pets: P,
    microchips: M,
}

impl RegistryService {
    /// Service over the SQLite gateways of `store`.
    pub fn new(store: Store) -> Self {
        let pets = SqlitePetGateway::new(store.clone());
        let microchips = SqliteMicrochipGateway::new(store.clone());
        Self::with_gateways(store, pets, microchips)
    }
}

impl<P: PetGateway, M: MicrochipGateway> RegistryService<P, M> {
    pub fn with_gateways(store: Store, pets: P, microchips: M) -> Self {
        Self {
            store,
            pets,
            microchips,
        }
    }

    pub fn pets(&self) -> &P {
        &self.pets
    }

    pub fn microchips(&self) -> &M {
        &self.microchips
    }

    /// Register a pet, optionally together with its microchip.
    ///
    /// Pet fields are validated before the store is touched. A microchip
    /// without an id is validated, checked for a free code and inserted; one
    /// that already has an id is updated and attached. The pet is inserted
    /// last with its reference set to the resolved microchip id. A pet that
    /// already names a different microchip is rejected. All writes share one
    /// transaction.
    pub fn create_pet(&self, mut pet: Pet, microchip: Option<Microchip>) -> Result<Enrollment> {
        pet.validate()?;
        if let Some(id) = pet.microchip_id {
            require_id(id, "microchip")?;
        }
        if let Some(chip) = &microchip {
            chip.validate()?;
            if let Some(id) = chip.id {
                require_id(id, "microchip")?;
            }
            if pet.microchip_id.is_some() && pet.microchip_id != chip.id {
                return Err(RegistryError::validation(format!(
                    "pet references microchip {:?} but microchip {:?} was supplied",
                    pet.microchip_id, chip.id
                )));
            }
        }

        let code = microchip.as_ref().map(|chip| chip.code.clone());
        let enrollment = self
            .store
            .in_transaction(|scope| {
                let microchip = match microchip {
                    Some(mut chip) => {
                        self.save_microchip_within(&mut chip, scope)?;
                        pet.microchip_id = chip.id;
                        Some(chip)
                    }
                    None => {
                        if let Some(id) = pet.microchip_id {
                            self.active_microchip_within(id, scope)?;
                        }
                        None
                    }
                };
                self.pets.insert_within(&mut pet, scope)?;
                Ok(Enrollment {
                    pet: pet.clone(),
                    microchip,
                })
            })
            .map_err(|err| match &code {
                Some(code) => err.classify_code_conflict(code),
                None => err,
            })?;

        info!(
            "registered pet {:?} with microchip {:?}",
            enrollment.pet.id, enrollment.pet.microchip_id
        );
        Ok(enrollment)
    }

    /// Detach `microchip_id` from `pet_id` and soft-delete it.
    ///
    /// Fails with `OwnershipMismatch` when the pet does not currently
    /// reference that microchip; nothing is written in that case.
    pub fn detach_and_delete_microchip(&self, pet_id: i64, microchip_id: i64) -> Result<Pet> {
        require_id(pet_id, "pet")?;
        require_id(microchip_id, "microchip")?;

        let pet = self.store.in_transaction(|scope| {
            let mut pet = self
                .pets
                .get_by_id_within(pet_id, scope)?
                .ok_or_else(|| RegistryError::not_found(Entity::Pet, pet_id))?;
            if pet.microchip_id != Some(microchip_id) {
                return Err(RegistryError::OwnershipMismatch {
                    pet_id,
                    microchip_id,
                });
            }
            pet.microchip_id = None;
            self.pets.update_within(&pet, scope)?;
            self.microchips.soft_delete_within(microchip_id, scope)?;
            Ok(pet)
        })?;

        info!("detached and deleted microchip {} from pet {}", microchip_id, pet_id);
        Ok(pet)
    }

    /// Soft-delete a microchip without looking for a pet that references it.
    ///
    /// Meant for cleaning up microchips that were never assigned. Used on an
    /// assigned microchip it leaves that pet pointing at a deleted record;
    /// prefer [`detach_and_delete_microchip`](Self::detach_and_delete_microchip).
    pub fn delete_microchip_unchecked(&self, microchip_id: i64) -> Result<()> {
        require_id(microchip_id, "microchip")?;
        warn!("deleting microchip {} without an ownership check", microchip_id);
        self.microchips.soft_delete(microchip_id)
    }

    /// Insert a microchip and then a pet in one transaction, skipping all
    /// field validation. Whatever the store rejects rolls back both writes.
    pub fn create_pet_unvalidated(
        &self,
        mut pet: Pet,
        mut microchip: Microchip,
    ) -> Result<Enrollment> {
        let scope = TransactionScope::begin(&self.store)?;
        let outcome = self
            .microchips
            .insert_within(&mut microchip, &scope)
            .and_then(|()| {
                pet.microchip_id = microchip.id;
                self.pets.insert_within(&mut pet, &scope)
            });

        match outcome {
            Ok(()) => {
                scope.commit()?;
                info!(
                    "registered pet {:?} with microchip {:?} without validation",
                    pet.id, microchip.id
                );
                Ok(Enrollment {
                    pet,
                    microchip: Some(microchip),
                })
            }
            Err(err) => {
                warn!("unvalidated registration failed, rolling back: {}", err);
                if let Err(rollback_err) = scope.rollback() {
                    warn!("rollback after failed registration also failed: {}", rollback_err);
                }
                Err(err.classify_code_conflict(&microchip.code))
            }
        }
    }

    /// Create a standalone microchip.
    pub fn register_microchip(&self, mut microchip: Microchip) -> Result<Microchip> {
        microchip.validate()?;
        self.ensure_code_free(&microchip.code, None)?;
        let code = microchip.code.clone();
        self.microchips
            .insert(&mut microchip)
            .map_err(|err| err.classify_code_conflict(&code))?;
        info!("registered microchip {:?} '{}'", microchip.id, microchip.code);
        Ok(microchip)
    }

    pub fn update_microchip(&self, microchip: Microchip) -> Result<Microchip> {
        microchip.validate()?;
        let id = require_id(microchip.id.unwrap_or(0), "microchip")?;
        self.ensure_code_free(&microchip.code, Some(id))?;
        self.microchips
            .update(&microchip)
            .map_err(|err| err.classify_code_conflict(&microchip.code))?;
        self.microchip(id)
    }

    /// Update a pet's fields. Changing a set microchip reference to another
    /// microchip is rejected by the store; use
    /// [`reassign_microchip`](Self::reassign_microchip) instead.
    pub fn update_pet(&self, pet: Pet) -> Result<Pet> {
        pet.validate()?;
        let id = require_id(pet.id.unwrap_or(0), "pet")?;
        if let Some(microchip_id) = pet.microchip_id {
            require_id(microchip_id, "microchip")?;
        }

        self.store.in_transaction(|scope| {
            let current = self
                .pets
                .get_by_id_within(id, scope)?
                .ok_or_else(|| RegistryError::not_found(Entity::Pet, id))?;
            if let Some(microchip_id) = pet.microchip_id {
                if current.microchip_id != Some(microchip_id) {
                    self.active_microchip_within(microchip_id, scope)?;
                }
            }
            self.pets.update_within(&pet, scope)
        })?;
        self.pet(id)
    }

    /// Point a pet at a different microchip, or at none.
    ///
    /// The old reference is cleared and persisted before the new one is set,
    /// in a single transaction.
    pub fn reassign_microchip(&self, pet_id: i64, microchip_id: Option<i64>) -> Result<Pet> {
        require_id(pet_id, "pet")?;
        if let Some(id) = microchip_id {
            require_id(id, "microchip")?;
        }

        let pet = self.store.in_transaction(|scope| {
            let mut pet = self
                .pets
                .get_by_id_within(pet_id, scope)?
                .ok_or_else(|| RegistryError::not_found(Entity::Pet, pet_id))?;
            if pet.microchip_id == microchip_id {
                return Ok(pet);
            }
            if pet.microchip_id.is_some() {
                pet.microchip_id = None;
                self.pets.update_within(&pet, scope)?;
            }
            if let Some(id) = microchip_id {
                self.active_microchip_within(id, scope)?;
                pet.microchip_id = Some(id);
                self.pets.update_within(&pet, scope)?;
            }
            Ok(pet)
        })?;

        info!("pet {} now references microchip {:?}", pet_id, microchip_id);
        Ok(pet)
    }

    /// Soft-delete a pet. Its microchip reference is cleared in the same
    /// transaction, so the microchip stays free to attach to another pet.
    pub fn delete_pet(&self, pet_id: i64) -> Result<()> {
        require_id(pet_id, "pet")?;
        self.store.in_transaction(|scope| {
            let mut pet = self
                .pets
                .get_by_id_within(pet_id, scope)?
                .ok_or_else(|| RegistryError::not_found(Entity::Pet, pet_id))?;
            if pet.microchip_id.is_some() {
                pet.microchip_id = None;
                self.pets.update_within(&pet, scope)?;
            }
            self.pets.soft_delete_within(pet_id, scope)
        })?;
        info!("deleted pet {}", pet_id);
        Ok(())
    }

    pub fn pet(&self, pet_id: i64) -> Result<Pet> {
        require_id(pet_id, "pet")?;
        self.pets
            .get_by_id(pet_id)?
            .ok_or_else(|| RegistryError::not_found(Entity::Pet, pet_id))
    }

    pub fn microchip(&self, microchip_id: i64) -> Result<Microchip> {
        require_id(microchip_id, "microchip")?;
        self.microchips
            .get_by_id(microchip_id)?
            .ok_or_else(|| RegistryError::not_found(Entity::Microchip, microchip_id))
    }

    pub fn microchip_by_code(&self, code: &str) -> Result<Option<Microchip>> {
        if code.trim().is_empty() {
            return Err(RegistryError::validation("microchip code must not be blank"));
        }
        self.microchips.find_by_code(code)
    }

    pub fn list_pets(&self) -> Result<Vec<Pet>> {
        self.pets.list_active()
    }

    pub fn list_microchips(&self) -> Result<Vec<Microchip>> {
        self.microchips.list_active()
    }

    pub fn search_pets(&self, filter: &str) -> Result<Vec<Pet>> {
        require_filter(filter)?;
        self.pets.search_by_name_or_owner(filter)
    }

    /// Load a pet together with the active microchip it references.
    pub fn pet_with_microchip(&self, pet_id: i64) -> Result<Enrollment> {
        require_id(pet_id, "pet")?;
        self.pets
            .get_enrollment(pet_id)?
            .ok_or_else(|| RegistryError::not_found(Entity::Pet, pet_id))
    }

    pub fn list_pets_with_microchips(&self) -> Result<Vec<Enrollment>> {
        self.pets.list_enrollments()
    }

    pub fn search_pets_with_microchips(&self, filter: &str) -> Result<Vec<Enrollment>> {
        require_filter(filter)?;
        self.pets.search_enrollments(filter)
    }

    /// Insert a new microchip or update an existing one inside `scope`.
    fn save_microchip_within(&self, chip: &mut Microchip, scope: &TransactionScope) -> Result<()> {
        if let Some(existing) = self.microchips.find_by_code_within(&chip.code, scope)? {
            if existing.id != chip.id {
                return Err(RegistryError::DuplicateCode(chip.code.trim().to_string()));
            }
        }
        if chip.id.is_none() {
            return self.microchips.insert_within(chip, scope);
        }
        self.microchips.update_within(chip, scope)?;
        chip.code = chip.code.trim().to_string();
        chip.deleted = false;
        Ok(())
    }

    fn active_microchip_within(&self, id: i64, scope: &TransactionScope) -> Result<Microchip> {
        self.microchips
            .get_by_id_within(id, scope)?
            .ok_or_else(|| RegistryError::not_found(Entity::Microchip, id))
    }

    fn ensure_code_free(&self, code: &str, own_id: Option<i64>) -> Result<()> {
        match self.microchips.find_by_code(code)? {
            Some(existing) if existing.id != own_id => {
                Err(RegistryError::DuplicateCode(code.trim().to_string()))
            }
            _ => Ok(()),
        }
    }
}

fn require_filter(filter: &str) -> Result<()> {
    if filter.trim().is_empty() {
        return Err(RegistryError::validation("search filter must not be blank"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteConfig;

    // Ends the scope's transaction behind its back, then fails the insert.
    struct AbortingPets(SqlitePetGateway);

    impl PetGateway for AbortingPets {
        fn insert(&self, pet: &mut Pet) -> Result<()> {
            self.0.insert(pet)
        }
        fn insert_within(&self, _pet: &mut Pet, scope: &TransactionScope) -> Result<()> {
            scope.connection().execute_batch("ROLLBACK").unwrap();
            Err(RegistryError::validation("pet rejected"))
        }
        fn update(&self, pet: &Pet) -> Result<()> {
            self.0.update(pet)
        }
        fn update_within(&self, pet: &Pet, scope: &TransactionScope) -> Result<()> {
            self.0.update_within(pet, scope)
        }
        fn soft_delete(&self, id: i64) -> Result<()> {
            self.0.soft_delete(id)
        }
        fn soft_delete_within(&self, id: i64, scope: &TransactionScope) -> Result<()> {
            self.0.soft_delete_within(id, scope)
        }
        fn get_by_id(&self, id: i64) -> Result<Option<Pet>> {
            self.0.get_by_id(id)
        }
        fn get_by_id_within(&self, id: i64, scope: &TransactionScope) -> Result<Option<Pet>> {
            self.0.get_by_id_within(id, scope)
        }
        fn list_active(&self) -> Result<Vec<Pet>> {
            self.0.list_active()
        }
        fn search_by_name_or_owner(&self, filter: &str) -> Result<Vec<Pet>> {
            self.0.search_by_name_or_owner(filter)
        }
        fn get_enrollment(&self, id: i64) -> Result<Option<Enrollment>> {
            self.0.get_enrollment(id)
        }
        fn list_enrollments(&self) -> Result<Vec<Enrollment>> {
            self.0.list_enrollments()
        }
        fn search_enrollments(&self, filter: &str) -> Result<Vec<Enrollment>> {
            self.0.search_enrollments(filter)
        }
    }

    #[test]
    fn failed_rollback_keeps_the_registration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.db");
        let store = Store::open(SqliteConfig::registry(path.to_string_lossy())).unwrap();
        let service = RegistryService::with_gateways(
            store.clone(),
            AbortingPets(SqlitePetGateway::new(store.clone())),
            SqliteMicrochipGateway::new(store),
        );

        let err = service
            .create_pet_unvalidated(Pet::new("Rex", "Dog", "Ana"), Microchip::new("MC-1"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(ref msg) if msg == "pet rejected"));
        assert_eq!(service.microchip_by_code("MC-1").unwrap(), None);
    }
}
