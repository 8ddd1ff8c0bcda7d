//! Plain records exchanged with the presentation layer.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};

/// An implanted identification chip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Microchip {
    /// Assigned by the store on insert.
    pub id: Option<i64>,
    pub code: String,
    pub implant_date: Option<NaiveDate>,
    pub clinic: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl Microchip {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }

    pub fn with_implant_date(mut self, date: NaiveDate) -> Self {
        self.implant_date = Some(date);
        self
    }

    pub fn with_clinic(mut self, clinic: impl Into<String>) -> Self {
        self.clinic = Some(clinic.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.code.trim().is_empty() {
            return Err(RegistryError::validation("microchip code must not be blank"));
        }
        Ok(())
    }
}

/// A registered pet, optionally referencing one microchip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pet {
    pub id: Option<i64>,
    pub name: String,
    pub species: String,
    pub breed: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub owner: String,
    pub microchip_id: Option<i64>,
    #[serde(default)]
    pub deleted: bool,
}

impl Pet {
    pub fn new(
        name: impl Into<String>,
        species: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            species: species.into(),
            owner: owner.into(),
            ..Self::default()
        }
    }

    pub fn with_breed(mut self, breed: impl Into<String>) -> Self {
        self.breed = Some(breed.into());
        self
    }

    pub fn with_birth_date(mut self, date: NaiveDate) -> Self {
        self.birth_date = Some(date);
        self
    }

    pub fn with_microchip_id(mut self, microchip_id: i64) -> Self {
        self.microchip_id = Some(microchip_id);
        self
    }

    /// Name, species and owner are required and may not be blank.
    pub(crate) fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("name", &self.name),
            ("species", &self.species),
            ("owner", &self.owner),
        ] {
            if value.trim().is_empty() {
                return Err(RegistryError::validation(format!(
                    "pet {field} must not be blank"
                )));
            }
        }
        Ok(())
    }
}

/// A pet together with the microchip it was registered with, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub pet: Pet,
    pub microchip: Option<Microchip>,
}

/// Rejects ids that cannot name a persisted record.
pub(crate) fn require_id(id: i64, what: &str) -> Result<i64> {
    if id <= 0 {
        return Err(RegistryError::validation(format!(
            "{what} id must be greater than 0, got {id}"
        )));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_owner_is_rejected() {
        let pet = Pet::new("Rex", "Dog", "   ");
        let err = pet.validate().unwrap_err();
        assert_eq!(err.to_string(), "Validation failed: pet owner must not be blank");
    }

    #[test]
    fn first_missing_field_is_reported() {
        let err = Pet::new("", "", "Ana").validate().unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn blank_code_is_rejected() {
        assert!(Microchip::new(" \t").validate().is_err());
        assert!(Microchip::new("CHIP-A").validate().is_ok());
    }

    #[test]
    fn non_positive_ids_are_rejected() {
        assert!(require_id(0, "pet").is_err());
        assert!(require_id(-3, "pet").is_err());
        assert_eq!(require_id(4, "pet").unwrap(), 4);
    }
}
