use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::MicrochipGateway;
use crate::error::{Entity, RegistryError, Result, StoreContext};
use crate::model::Microchip;
use crate::sqlite::{Store, MICROCHIP_COLUMNS};
use crate::transaction::TransactionScope;

const INSERT_SQL: &str =
    "INSERT INTO microchips (code, implant_date, clinic, notes) VALUES (?1, ?2, ?3, ?4)";
// Writes target rows through the active view so the soft-delete predicate
// lives in one place.
const UPDATE_SQL: &str = "UPDATE microchips \
     SET code = ?1, implant_date = ?2, clinic = ?3, notes = ?4 \
     WHERE id IN (SELECT id FROM active_microchips WHERE id = ?5)";
const SOFT_DELETE_SQL: &str = "UPDATE microchips SET deleted = 1 \
     WHERE id IN (SELECT id FROM active_microchips WHERE id = ?1)";

#[derive(Debug, Clone)]
pub struct SqliteMicrochipGateway {
    store: Store,
}

impl SqliteMicrochipGateway {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl MicrochipGateway for SqliteMicrochipGateway {
    fn insert(&self, microchip: &mut Microchip) -> Result<()> {
        insert_on(&self.store.connect()?, microchip)
    }

    fn insert_within(&self, microchip: &mut Microchip, scope: &TransactionScope) -> Result<()> {
        insert_on(scope.connection(), microchip)
    }

    fn update(&self, microchip: &Microchip) -> Result<()> {
        update_on(&self.store.connect()?, microchip)
    }

    fn update_within(&self, microchip: &Microchip, scope: &TransactionScope) -> Result<()> {
        update_on(scope.connection(), microchip)
    }

    fn soft_delete(&self, id: i64) -> Result<()> {
        soft_delete_on(&self.store.connect()?, id)
    }

    fn soft_delete_within(&self, id: i64, scope: &TransactionScope) -> Result<()> {
        soft_delete_on(scope.connection(), id)
    }

    fn get_by_id(&self, id: i64) -> Result<Option<Microchip>> {
        get_by_id_on(&self.store.connect()?, id)
    }

    fn get_by_id_within(&self, id: i64, scope: &TransactionScope) -> Result<Option<Microchip>> {
        get_by_id_on(scope.connection(), id)
    }

    fn list_active(&self) -> Result<Vec<Microchip>> {
        let conn = self.store.connect()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MICROCHIP_COLUMNS} FROM active_microchips ORDER BY id"
            ))
            .store_context(|| "list microchips")?;
        let rows = stmt
            .query_map([], map_microchip)
            .store_context(|| "list microchips")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .store_context(|| "read microchip rows")
    }

    fn find_by_code(&self, code: &str) -> Result<Option<Microchip>> {
        find_by_code_on(&self.store.connect()?, code)
    }

    fn find_by_code_within(
        &self,
        code: &str,
        scope: &TransactionScope,
    ) -> Result<Option<Microchip>> {
        find_by_code_on(scope.connection(), code)
    }
}

fn insert_on(conn: &Connection, microchip: &mut Microchip) -> Result<()> {
    let code = microchip.code.trim().to_string();
    let inserted = conn
        .execute(
            INSERT_SQL,
            params![code, microchip.implant_date, microchip.clinic, microchip.notes],
        )
        .store_context(|| format!("insert microchip '{code}'"))?;
    let id = conn.last_insert_rowid();
    if inserted != 1 || id <= 0 {
        return Err(RegistryError::MissingIdentity(Entity::Microchip));
    }
    debug!("inserted microchip {} with code '{}'", id, code);
    microchip.id = Some(id);
    microchip.code = code;
    microchip.deleted = false;
    Ok(())
}

fn update_on(conn: &Connection, microchip: &Microchip) -> Result<()> {
    let id = microchip
        .id
        .ok_or_else(|| RegistryError::validation("cannot update a microchip that has no id"))?;
    let updated = conn
        .execute(
            UPDATE_SQL,
            params![
                microchip.code.trim(),
                microchip.implant_date,
                microchip.clinic,
                microchip.notes,
                id
            ],
        )
        .store_context(|| format!("update microchip {id}"))?;
    if updated == 0 {
        return Err(RegistryError::not_found(Entity::Microchip, id));
    }
    debug!("updated microchip {}", id);
    Ok(())
}

fn soft_delete_on(conn: &Connection, id: i64) -> Result<()> {
    let deleted = conn
        .execute(SOFT_DELETE_SQL, params![id])
        .store_context(|| format!("delete microchip {id}"))?;
    if deleted == 0 {
        return Err(RegistryError::not_found(Entity::Microchip, id));
    }
    debug!("soft-deleted microchip {}", id);
    Ok(())
}

fn get_by_id_on(conn: &Connection, id: i64) -> Result<Option<Microchip>> {
    conn.query_row(
        &format!("SELECT {MICROCHIP_COLUMNS} FROM active_microchips WHERE id = ?1"),
        params![id],
        map_microchip,
    )
    .optional()
    .store_context(|| format!("load microchip {id}"))
}

fn find_by_code_on(conn: &Connection, code: &str) -> Result<Option<Microchip>> {
    let code = code.trim();
    conn.query_row(
        &format!("SELECT {MICROCHIP_COLUMNS} FROM active_microchips WHERE code = ?1"),
        params![code],
        map_microchip,
    )
    .optional()
    .store_context(|| format!("look up microchip code '{code}'"))
}

fn map_microchip(row: &Row<'_>) -> rusqlite::Result<Microchip> {
    Ok(Microchip {
        id: Some(row.get("id")?),
        code: row.get("code")?,
        implant_date: row.get("implant_date")?,
        clinic: row.get("clinic")?,
        notes: row.get("notes")?,
        deleted: row.get("deleted")?,
    })
}
