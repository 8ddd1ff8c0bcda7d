use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::PetGateway;
use crate::error::{Entity, RegistryError, Result, StoreContext};
use crate::model::{Enrollment, Microchip, Pet};
use crate::sqlite::{Store, PET_COLUMNS};
use crate::transaction::TransactionScope;

const INSERT_SQL: &str = "INSERT INTO pets (name, species, breed, birth_date, owner, microchip_id) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)";
const UPDATE_SQL: &str = "UPDATE pets SET name = ?1, species = ?2, breed = ?3, birth_date = ?4, \
     owner = ?5, microchip_id = ?6 WHERE id IN (SELECT id FROM active_pets WHERE id = ?7)";
const SOFT_DELETE_SQL: &str =
    "UPDATE pets SET deleted = 1 WHERE id IN (SELECT id FROM active_pets WHERE id = ?1)";
const NAME_OR_OWNER_FILTER: &str =
    "instr(lower(p.name), lower(?1)) > 0 OR instr(lower(p.owner), lower(?1)) > 0";
// A reference to a deleted microchip joins to nothing.
const ENROLLMENT_SELECT: &str = "SELECT p.id AS id, p.name AS name, p.species AS species, \
     p.breed AS breed, p.birth_date AS birth_date, p.owner AS owner, \
     p.microchip_id AS microchip_id, p.deleted AS deleted, \
     c.id AS chip_id, c.code AS chip_code, c.implant_date AS chip_implant_date, \
     c.clinic AS chip_clinic, c.notes AS chip_notes \
     FROM active_pets p LEFT JOIN active_microchips c ON c.id = p.microchip_id";

#[derive(Debug, Clone)]
pub struct SqlitePetGateway {
    store: Store,
}

impl SqlitePetGateway {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn query<T>(
        &self,
        sql: &str,
        filter: Option<&str>,
        map: fn(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        let conn = self.store.connect()?;
        let mut stmt = conn.prepare(sql).store_context(|| "list pets")?;
        let rows = match filter {
            Some(filter) => stmt.query_map(params![filter], map),
            None => stmt.query_map([], map),
        }
        .store_context(|| "list pets")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .store_context(|| "read pet rows")
    }
}

impl PetGateway for SqlitePetGateway {
    fn insert(&self, pet: &mut Pet) -> Result<()> {
        insert_on(&self.store.connect()?, pet)
    }

    fn insert_within(&self, pet: &mut Pet, scope: &TransactionScope) -> Result<()> {
        insert_on(scope.connection(), pet)
    }

    fn update(&self, pet: &Pet) -> Result<()> {
        update_on(&self.store.connect()?, pet)
    }

    fn update_within(&self, pet: &Pet, scope: &TransactionScope) -> Result<()> {
        update_on(scope.connection(), pet)
    }

    fn soft_delete(&self, id: i64) -> Result<()> {
        soft_delete_on(&self.store.connect()?, id)
    }

    fn soft_delete_within(&self, id: i64, scope: &TransactionScope) -> Result<()> {
        soft_delete_on(scope.connection(), id)
    }

    fn get_by_id(&self, id: i64) -> Result<Option<Pet>> {
        get_by_id_on(&self.store.connect()?, id)
    }

    fn get_by_id_within(&self, id: i64, scope: &TransactionScope) -> Result<Option<Pet>> {
        get_by_id_on(scope.connection(), id)
    }

    fn list_active(&self) -> Result<Vec<Pet>> {
        self.query(
            &format!("SELECT {PET_COLUMNS} FROM active_pets ORDER BY id"),
            None,
            map_pet,
        )
    }

    fn search_by_name_or_owner(&self, filter: &str) -> Result<Vec<Pet>> {
        self.query(
            &format!(
                "SELECT {PET_COLUMNS} FROM active_pets p WHERE {NAME_OR_OWNER_FILTER} ORDER BY id"
            ),
            Some(filter.trim()),
            map_pet,
        )
    }

    fn get_enrollment(&self, id: i64) -> Result<Option<Enrollment>> {
        let conn = self.store.connect()?;
        conn.query_row(
            &format!("{ENROLLMENT_SELECT} WHERE p.id = ?1"),
            params![id],
            map_enrollment,
        )
        .optional()
        .store_context(|| format!("load pet {id} with its microchip"))
    }

    fn list_enrollments(&self) -> Result<Vec<Enrollment>> {
        self.query(
            &format!("{ENROLLMENT_SELECT} ORDER BY p.id"),
            None,
            map_enrollment,
        )
    }

    fn search_enrollments(&self, filter: &str) -> Result<Vec<Enrollment>> {
        self.query(
            &format!("{ENROLLMENT_SELECT} WHERE {NAME_OR_OWNER_FILTER} ORDER BY p.id"),
            Some(filter.trim()),
            map_enrollment,
        )
    }
}

fn insert_on(conn: &Connection, pet: &mut Pet) -> Result<()> {
    let inserted = conn
        .execute(
            INSERT_SQL,
            params![
                pet.name,
                pet.species,
                pet.breed,
                pet.birth_date,
                pet.owner,
                pet.microchip_id
            ],
        )
        .store_context(|| format!("insert pet '{}'", pet.name))?;
    let id = conn.last_insert_rowid();
    if inserted != 1 || id <= 0 {
        return Err(RegistryError::MissingIdentity(Entity::Pet));
    }
    debug!("inserted pet {} referencing microchip {:?}", id, pet.microchip_id);
    pet.id = Some(id);
    pet.deleted = false;
    Ok(())
}

fn update_on(conn: &Connection, pet: &Pet) -> Result<()> {
    let id = pet
        .id
        .ok_or_else(|| RegistryError::validation("cannot update a pet that has no id"))?;
    let updated = conn
        .execute(
            UPDATE_SQL,
            params![
                pet.name,
                pet.species,
                pet.breed,
                pet.birth_date,
                pet.owner,
                pet.microchip_id,
                id
            ],
        )
        .store_context(|| format!("update pet {id}"))?;
    if updated == 0 {
        return Err(RegistryError::not_found(Entity::Pet, id));
    }
    debug!("updated pet {} (microchip {:?})", id, pet.microchip_id);
    Ok(())
}

fn soft_delete_on(conn: &Connection, id: i64) -> Result<()> {
    let deleted = conn
        .execute(SOFT_DELETE_SQL, params![id])
        .store_context(|| format!("delete pet {id}"))?;
    if deleted == 0 {
        return Err(RegistryError::not_found(Entity::Pet, id));
    }
    debug!("soft-deleted pet {}", id);
    Ok(())
}

fn get_by_id_on(conn: &Connection, id: i64) -> Result<Option<Pet>> {
    conn.query_row(
        &format!("SELECT {PET_COLUMNS} FROM active_pets WHERE id = ?1"),
        params![id],
        map_pet,
    )
    .optional()
    .store_context(|| format!("load pet {id}"))
}

fn map_pet(row: &Row<'_>) -> rusqlite::Result<Pet> {
    Ok(Pet {
        id: Some(row.get("id")?),
        name: row.get("name")?,
        species: row.get("species")?,
        breed: row.get("breed")?,
        birth_date: row.get("birth_date")?,
        owner: row.get("owner")?,
        microchip_id: row.get("microchip_id")?,
        deleted: row.get("deleted")?,
    })
}

fn map_enrollment(row: &Row<'_>) -> rusqlite::Result<Enrollment> {
    let microchip = match row.get::<_, Option<i64>>("chip_id")? {
        Some(chip_id) => Some(Microchip {
            id: Some(chip_id),
            code: row.get("chip_code")?,
            implant_date: row.get("chip_implant_date")?,
            clinic: row.get("chip_clinic")?,
            notes: row.get("chip_notes")?,
            deleted: false,
        }),
        None => None,
    };
    Ok(Enrollment {
        pet: map_pet(row)?,
        microchip,
    })
}
