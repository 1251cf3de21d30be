use crate::{
    error::{ProfileSyncError, MAX_CHARACTERS_PER_ACCOUNT},
    scanner::CharacterFile,
    store,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    path::PathBuf,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    #[serde(rename = "userId")]
    pub account_id: String,
    #[serde(rename = "charId")]
    pub character_id: String,
    /// Captured when the association is made and never refreshed.
    #[serde(rename = "charName")]
    pub display_name: String,
}

/// Account → character links in creation order, flushed on every change.
#[derive(Debug)]
pub struct AssociationTable {
    path: PathBuf,
    entries: Vec<Association>,
}

impl AssociationTable {
    pub fn from_entries(path: PathBuf, entries: Vec<Association>) -> Self {
        Self { path, entries }
    }

    pub fn entries(&self) -> &[Association] {
        &self.entries
    }

    pub fn for_account<'a>(&'a self, account_id: &'a str) -> impl Iterator<Item = &'a Association> {
        self.entries
            .iter()
            .filter(move |entry| entry.account_id == account_id)
    }

    pub fn associated_account(&self, character_id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.character_id == character_id)
            .map(|entry| entry.account_id.as_str())
    }

    /// Fails when adding the pair would break an invariant of the table.
    pub fn check(&self, account_id: &str, character_id: &str) -> Result<(), ProfileSyncError> {
        if self.for_account(account_id).count() >= MAX_CHARACTERS_PER_ACCOUNT {
            return Err(ProfileSyncError::CapacityExceeded {
                account_id: account_id.to_string(),
                limit: MAX_CHARACTERS_PER_ACCOUNT,
            });
        }
        if let Some(owner) = self.associated_account(character_id) {
            return Err(ProfileSyncError::AlreadyAssociated {
                character_id: character_id.to_string(),
                account_id: owner.to_string(),
            });
        }
        Ok(())
    }

    pub fn associate(
        &mut self,
        account_id: &str,
        character_id: &str,
        display_name: &str,
    ) -> Result<Association> {
        self.check(account_id, character_id)?;
        let association = Association {
            account_id: account_id.to_string(),
            character_id: character_id.to_string(),
            display_name: display_name.to_string(),
        };
        self.entries.push(association.clone());
        self.save()?;
        Ok(association)
    }

    pub fn unassociate(&mut self, account_id: &str, character_id: &str) -> Result<Association> {
        let Some(index) = self
            .entries
            .iter()
            .position(|entry| entry.account_id == account_id && entry.character_id == character_id)
        else {
            return Err(ProfileSyncError::NotFound(format!(
                "Association between User ID {account_id} and Character ID {character_id} not found."
            ))
            .into());
        };
        let removed = self.entries.remove(index);
        self.save()?;
        Ok(removed)
    }

    /// Characters that no account has claimed yet.
    pub fn filter_available(&self, characters: Vec<CharacterFile>) -> Vec<CharacterFile> {
        let taken: HashSet<&str> = self
            .entries
            .iter()
            .map(|entry| entry.character_id.as_str())
            .collect();
        characters
            .into_iter()
            .filter(|character| !taken.contains(character.character_id.as_str()))
            .collect()
    }

    pub fn save(&self) -> Result<()> {
        store::write_json(&self.path, &self.entries)
    }
}
