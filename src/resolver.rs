use crate::{error::ProfileSyncError, store::CacheStore};
use serde::Deserialize;
use std::{path::Path, time::Duration};

const ESI_CHARACTER_URL: &str = "https://esi.evetech.net/latest/characters";
const ESI_DATASOURCE: &str = "tranquility";
const USER_AGENT: &str = concat!("profilesync/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("character not found")]
    NotFound,
    #[error("request failed: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Remote character id → name service.
pub trait NameLookup {
    fn lookup(&self, character_id: &str) -> Result<String, LookupError>;
}

/// EVE Swagger Interface public character endpoint.
pub struct EsiLookup {
    agent: ureq::Agent,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct CharacterInfo {
    name: String,
}

impl EsiLookup {
    pub fn new() -> Self {
        Self::with_base_url(ESI_CHARACTER_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(10))
            .timeout_write(Duration::from_secs(10))
            .build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl Default for EsiLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl NameLookup for EsiLookup {
    fn lookup(&self, character_id: &str) -> Result<String, LookupError> {
        let url = format!("{}/{character_id}/", self.base_url);
        let response = self
            .agent
            .get(&url)
            .query("datasource", ESI_DATASOURCE)
            .set("User-Agent", USER_AGENT)
            .call()
            .map_err(|err| match err {
                ureq::Error::Status(404, _) => LookupError::NotFound,
                ureq::Error::Status(code, _) => LookupError::Transport(format!("HTTP {code}")),
                ureq::Error::Transport(transport) => LookupError::Transport(transport.to_string()),
            })?;
        let info: CharacterInfo = response
            .into_json()
            .map_err(|err| LookupError::Decode(err.to_string()))?;
        Ok(info.name)
    }
}

/// Resolves character ids to names with at most one remote attempt per
/// unresolved id. A failure is memoized against the file path, not the id.
pub struct NameResolver {
    lookup: Box<dyn NameLookup>,
    failed_requests: usize,
    warnings: Vec<String>,
}

impl NameResolver {
    pub fn new(lookup: Box<dyn NameLookup>) -> Self {
        Self {
            lookup,
            failed_requests: 0,
            warnings: Vec::new(),
        }
    }

    pub fn resolve(
        &mut self,
        cache: &mut CacheStore,
        character_id: &str,
        full_path: &Path,
    ) -> Option<String> {
        if cache.is_failed(full_path) {
            return None;
        }
        if let Some(name) = cache.cached_name(character_id) {
            return Some(name.to_string());
        }

        match self.lookup.lookup(character_id) {
            Ok(name) => {
                if let Err(err) = cache.record_name(character_id, &name) {
                    self.warnings.push(format!("{err:#}"));
                }
                Some(name)
            }
            Err(source) => {
                let failure = ProfileSyncError::LookupFailed {
                    character_id: character_id.to_string(),
                    path: full_path.to_path_buf(),
                    source,
                };
                self.warnings.push(failure.to_string());
                self.failed_requests += 1;
                if let Err(err) = cache.record_failure(full_path) {
                    self.warnings.push(format!("{err:#}"));
                }
                None
            }
        }
    }

    /// Failed remote lookups since the last call.
    pub fn take_failed_requests(&mut self) -> usize {
        std::mem::take(&mut self.failed_requests)
    }

    pub fn drain_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }
}
