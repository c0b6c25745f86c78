//! Flat-file storage for race documents.
//!
//! The race is kept in three JSON documents that are always read and
//! replaced whole:
//!
//! | File             | Content                      |
//! |------------------|------------------------------|
//! | `entrants.json`  | `Vec<Entrant>` with runs     |
//! | `race.json`      | [`Race`] state and heats     |
//! | `settings.json`  | [`RaceSettings`]             |
//!
//! A missing file reads as the default document. Writes go to a temporary
//! file first and are renamed into place, so a crash never leaves half a
//! document behind.

use derby_core::{Entrant, Race, RaceSettings};
use log::{debug, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENTRANTS_FILE: &str = "entrants.json";
pub const RACE_FILE: &str = "race.json";
pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Get/save access to the race documents.
pub trait RaceStore: Send {
    fn entrants(&self) -> Result<Vec<Entrant>, StorageError>;
    fn save_entrants(&mut self, entrants: &[Entrant]) -> Result<(), StorageError>;
    fn race(&self) -> Result<Race, StorageError>;
    fn save_race(&mut self, race: &Race) -> Result<(), StorageError>;
    fn settings(&self) -> Result<RaceSettings, StorageError>;
    fn save_settings(&mut self, settings: &RaceSettings) -> Result<(), StorageError>;
}

/// JSON documents in one directory.
pub struct JsonFileStore {
    base_dir: PathBuf,
}

impl JsonFileStore {
    /// Open (and create if needed) the data directory.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).map_err(|source| StorageError::Io {
            path: base_dir.clone(),
            source,
        })?;
        debug!("Race data directory: {}", base_dir.display());
        Ok(JsonFileStore { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn read_document<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T, StorageError> {
        let path = self.base_dir.join(name);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} not found, using defaults", path.display());
                return Ok(T::default());
            }
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        serde_json::from_reader(BufReader::new(file)).map_err(|source| {
            warn!("Failed to parse {}: {}", path.display(), source);
            StorageError::Json { path, source }
        })
    }

    fn write_document<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), StorageError> {
        let path = self.base_dir.join(name);
        let tmp_path = self.base_dir.join(format!("{}.tmp", name));
        let io_err = |source: std::io::Error| StorageError::Io {
            path: tmp_path.clone(),
            source,
        };

        let file = fs::File::create(&tmp_path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value).map_err(|source| StorageError::Json {
            path: tmp_path.clone(),
            source,
        })?;
        writer.write_all(b"\n").map_err(io_err)?;
        writer.flush().map_err(io_err)?;
        drop(writer);

        fs::rename(&tmp_path, &path).map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })?;
        info!("Stored {}", path.display());
        Ok(())
    }
}

impl RaceStore for JsonFileStore {
    fn entrants(&self) -> Result<Vec<Entrant>, StorageError> {
        self.read_document(ENTRANTS_FILE)
    }

    fn save_entrants(&mut self, entrants: &[Entrant]) -> Result<(), StorageError> {
        self.write_document(ENTRANTS_FILE, entrants)
    }

    fn race(&self) -> Result<Race, StorageError> {
        self.read_document(RACE_FILE)
    }

    fn save_race(&mut self, race: &Race) -> Result<(), StorageError> {
        self.write_document(RACE_FILE, race)
    }

    fn settings(&self) -> Result<RaceSettings, StorageError> {
        self.read_document(SETTINGS_FILE)
    }

    fn save_settings(&mut self, settings: &RaceSettings) -> Result<(), StorageError> {
        self.write_document(SETTINGS_FILE, settings)
    }
}

/// Documents held in memory, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    pub entrants: Vec<Entrant>,
    pub race: Race,
    pub settings: RaceSettings,
}

impl RaceStore for MemoryStore {
    fn entrants(&self) -> Result<Vec<Entrant>, StorageError> {
        Ok(self.entrants.clone())
    }

    fn save_entrants(&mut self, entrants: &[Entrant]) -> Result<(), StorageError> {
        self.entrants = entrants.to_vec();
        Ok(())
    }

    fn race(&self) -> Result<Race, StorageError> {
        Ok(self.race.clone())
    }

    fn save_race(&mut self, race: &Race) -> Result<(), StorageError> {
        self.race = race.clone();
        Ok(())
    }

    fn settings(&self) -> Result<RaceSettings, StorageError> {
        Ok(self.settings.clone())
    }

    fn save_settings(&mut self, settings: &RaceSettings) -> Result<(), StorageError> {
        self.settings = settings.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use derby_core::{EntrantStatus, Heat, RaceState, RunSource};
    use tempfile::TempDir;

    fn create_test_store() -> (JsonFileStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(temp_dir.path().join("race-data")).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_missing_files_read_as_defaults() {
        let (store, _temp) = create_test_store();
        assert!(store.entrants().unwrap().is_empty());
        assert_eq!(store.race().unwrap(), Race::default());
        assert_eq!(store.settings().unwrap(), RaceSettings::default());
    }

    #[test]
    fn test_round_trip() {
        let (mut store, _temp) = create_test_store();

        let mut entrant = Entrant::new(12, "Pat", "Comet", "Wolves").with_status(EntrantStatus::Registered);
        entrant.record_run(3.141, 2, Some(RunSource::scheduled(1, 1)), Utc::now());
        store.save_entrants(&[entrant.clone()]).unwrap();

        let mut race = Race::new();
        race.override_state(RaceState::Racing);
        race.replace_heats(vec![Heat::new(1, 4)]);
        store.save_race(&race).unwrap();

        let mut settings = RaceSettings::default();
        settings.lane_count = 3;
        settings.controller_address = Some("pi.local:8000".to_string());
        store.save_settings(&settings).unwrap();

        assert_eq!(store.entrants().unwrap(), vec![entrant]);
        assert_eq!(store.race().unwrap(), race);
        assert_eq!(store.settings().unwrap(), settings);
        assert!(!store.base_dir().join("race.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_document_is_an_error() {
        let (store, _temp) = create_test_store();
        fs::write(store.base_dir().join(RACE_FILE), "{ not json").unwrap();
        assert!(matches!(store.race(), Err(StorageError::Json { .. })));
    }

    #[test]
    fn test_reads_documents_written_elsewhere() {
        let (store, _temp) = create_test_store();
        fs::write(
            store.base_dir().join(ENTRANTS_FILE),
            r#"[{"id": 4, "owner_name": "Jo", "entry_name": "Dart", "status": "COURTESY",
                 "runs": [{"time": 3.5, "lane": 1, "timestamp": "2024-05-01T10:00:00Z", "is_included": false}]}]"#,
        )
        .unwrap();
        let entrants = store.entrants().unwrap();
        assert_eq!(entrants[0].status, EntrantStatus::Courtesy);
        assert_eq!(entrants[0].runs[0].heat_id, None);
        assert_eq!(entrants[0].division, "");
    }
}
