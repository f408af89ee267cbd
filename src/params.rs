//! Symbolic parameter access
//!
//! Name-based reads and writes over the register transactor, with width
//! routing for 32-bit parameters, a short-lived name cache, and a modified
//! set tracking writes that have not been persisted to EEPROM.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Result, ServoError};
use crate::protocol::RegisterTransactor;
use crate::registers::{self, Parameter, RegisterWidth, PARAMETERS};

/// Lifetime of a cached parameter value
const CACHE_TTL: Duration = Duration::from_millis(100);

struct CacheEntry {
    value: i32,
    at: Instant,
}

/// Name-based parameter manager.
///
/// All cache and modified-set state is owned by the instance; two managers
/// over different drives never share state.
pub struct ParameterManager {
    transactor: Arc<dyn RegisterTransactor>,
    cache: Mutex<HashMap<&'static str, CacheEntry>>,
    modified: Mutex<HashSet<&'static str>>,
}

impl ParameterManager {
    pub fn new(transactor: Arc<dyn RegisterTransactor>) -> Self {
        Self {
            transactor,
            cache: Mutex::new(HashMap::new()),
            modified: Mutex::new(HashSet::new()),
        }
    }

    fn resolve(name: &str) -> Result<&'static Parameter> {
        registers::lookup(name).ok_or_else(|| ServoError::InvalidParameter(name.to_string()))
    }

    /// Read a parameter by name.
    ///
    /// An unknown name is a hard error. With `use_cache` a value read or
    /// written within the last 100ms is returned without wire traffic.
    pub fn read(&self, name: &str, use_cache: bool) -> Result<i32> {
        let param = Self::resolve(name)?;

        if use_cache {
            if let Some(value) = self.cached(param.name) {
                return Ok(value);
            }
        }

        let value = match param.width {
            RegisterWidth::Word => i32::from(self.transactor.read_register(param.address, false)?),
            RegisterWidth::DoubleWord => self.transactor.read_u32(param.address)?,
        };

        self.store_cached(param.name, value);
        Ok(value)
    }

    /// Write a parameter by name.
    ///
    /// Word-width parameters must fit in an unsigned 16-bit register. A
    /// successful write refreshes the cache entry and marks the name as
    /// modified until the next EEPROM persist.
    pub fn write(&self, name: &str, value: i32) -> Result<()> {
        let param = Self::resolve(name)?;

        match param.width {
            RegisterWidth::Word => {
                let raw = u16::try_from(value).map_err(|_| ServoError::ParameterOutOfRange {
                    name: name.to_string(),
                    value,
                    min: 0,
                    max: i32::from(u16::MAX),
                })?;
                self.transactor.write_register(param.address, raw)?;
            }
            RegisterWidth::DoubleWord => self.transactor.write_u32(param.address, value)?,
        }

        self.store_cached(param.name, value);
        if let Ok(mut modified) = self.modified.lock() {
            modified.insert(param.name);
        }
        debug!("Parameter {name} set to {value}");
        Ok(())
    }

    /// Read several parameters, best effort. A failed read is logged and
    /// reported as `None` rather than aborting the batch.
    pub fn read_multiple(&self, names: &[&str]) -> HashMap<String, Option<i32>> {
        let mut values = HashMap::with_capacity(names.len());
        for &name in names {
            match self.read(name, false) {
                Ok(value) => {
                    values.insert(name.to_string(), Some(value));
                }
                Err(e) => {
                    warn!("Failed to read {name}: {e}");
                    values.insert(name.to_string(), None);
                }
            }
        }
        values
    }

    /// Write several parameters, best effort, reporting per-name outcomes.
    pub fn write_multiple(&self, parameters: &BTreeMap<String, i32>) -> HashMap<String, bool> {
        let mut results = HashMap::with_capacity(parameters.len());
        for (name, &value) in parameters {
            match self.write(name, value) {
                Ok(()) => {
                    results.insert(name.clone(), true);
                }
                Err(e) => {
                    warn!("Failed to write {name}: {e}");
                    results.insert(name.clone(), false);
                }
            }
        }
        results
    }

    /// Persist modified parameters to drive EEPROM.
    ///
    /// The persist command register is not documented for this firmware
    /// revision, so this fails rather than silently claiming success. The
    /// modified set is kept so a later revision can persist exactly what
    /// changed.
    pub fn save_to_eeprom(&self) -> Result<()> {
        Err(ServoError::NotSupported(
            "EEPROM persist command is not documented for this firmware".to_string(),
        ))
    }

    /// Restore factory defaults on the drive.
    ///
    /// Same situation as [`save_to_eeprom`](Self::save_to_eeprom).
    pub fn restore_defaults(&self) -> Result<()> {
        Err(ServoError::NotSupported(
            "factory reset command is not documented for this firmware".to_string(),
        ))
    }

    /// Read every mapped parameter and export the values as JSON.
    ///
    /// Parameters that fail to read are skipped with a warning so a drive
    /// with a partially responsive register map can still be exported.
    pub fn export_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut values = BTreeMap::new();
        for param in PARAMETERS {
            match self.read(param.name, false) {
                Ok(value) => {
                    values.insert(param.name.to_string(), value);
                }
                Err(e) => warn!("Skipping {} during export: {e}", param.name),
            }
        }

        let json = serde_json::to_string_pretty(&values)?;
        std::fs::write(path.as_ref(), json)?;
        info!(
            "Exported {} parameters to {}",
            values.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Import parameter values from a JSON file written by
    /// [`export_to_file`](Self::export_to_file).
    ///
    /// Unknown names in the file are skipped with a warning; a write failure
    /// on a known name aborts the import.
    pub fn import_from_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let values: BTreeMap<String, i32> = serde_json::from_str(&json)?;

        let mut written = 0;
        for (name, value) in &values {
            if registers::lookup(name).is_none() {
                warn!("Unknown parameter in file: {name}");
                continue;
            }
            self.write(name, *value)?;
            written += 1;
        }

        info!(
            "Imported {written} parameters from {}",
            path.as_ref().display()
        );
        Ok(())
    }

    /// Names written since construction or the last cache clear.
    pub fn modified(&self) -> HashSet<&'static str> {
        self.modified
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Drop all cached values.
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    fn cached(&self, name: &'static str) -> Option<i32> {
        let cache = self.cache.lock().ok()?;
        let entry = cache.get(name)?;
        (entry.at.elapsed() < CACHE_TTL).then_some(entry.value)
    }

    fn store_cached(&self, name: &'static str, value: i32) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                name,
                CacheEntry {
                    value,
                    at: Instant::now(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockTransactor;

    fn manager() -> (ParameterManager, Arc<MockTransactor>) {
        let mock = Arc::new(MockTransactor::new());
        (ParameterManager::new(mock.clone()), mock)
    }

    #[test]
    fn test_unknown_name_is_hard_error() {
        let (params, mock) = manager();
        let err = params.read("no_such_parameter", false).unwrap_err();
        assert!(matches!(err, ServoError::InvalidParameter(_)));
        let err = params.write("no_such_parameter", 1).unwrap_err();
        assert!(matches!(err, ServoError::InvalidParameter(_)));
        assert_eq!(mock.write_count(), 0);
    }

    #[test]
    fn test_word_read_write() {
        let (params, mock) = manager();
        params.write("rigidity_level", 20).unwrap();
        assert_eq!(mock.register(0x0100), Some(20));
        assert_eq!(params.read("rigidity_level", false).unwrap(), 20);
    }

    #[test]
    fn test_dword_sign_extension() {
        let (params, mock) = manager();
        mock.set_register(0x0B1C, 0xFFFF);
        mock.set_register(0x0B1D, 0xFFFF);
        assert_eq!(params.read("encoder_position", false).unwrap(), -1);
    }

    #[test]
    fn test_dword_write_word_order() {
        let (params, mock) = manager();
        params.write("pr_home_offset", -2).unwrap();
        // Low word at 0x080C, high at 0x080D
        assert_eq!(mock.register(0x080C), Some(0xFFFE));
        assert_eq!(mock.register(0x080D), Some(0xFFFF));
    }

    #[test]
    fn test_word_write_rejects_out_of_register_range() {
        let (params, mock) = manager();
        let err = params.write("rigidity_level", 0x10000).unwrap_err();
        assert!(matches!(err, ServoError::ParameterOutOfRange { .. }));
        let err = params.write("rigidity_level", -1).unwrap_err();
        assert!(matches!(err, ServoError::ParameterOutOfRange { .. }));
        assert_eq!(mock.write_count(), 0);
    }

    #[test]
    fn test_cache_serves_recent_write() {
        let (params, mock) = manager();
        params.write("rigidity_level", 15).unwrap();
        // Device value diverges; cached read still sees the written value
        mock.set_register(0x0100, 99);
        assert_eq!(params.read("rigidity_level", true).unwrap(), 15);
        // Bypassing the cache reads the device
        assert_eq!(params.read("rigidity_level", false).unwrap(), 99);
    }

    #[test]
    fn test_modified_set_tracks_writes() {
        let (params, _mock) = manager();
        assert!(params.modified().is_empty());
        params.write("rigidity_level", 10).unwrap();
        params.write("speed_command_1", 100).unwrap();
        let modified = params.modified();
        assert!(modified.contains("rigidity_level"));
        assert!(modified.contains("speed_command_1"));
        assert_eq!(modified.len(), 2);
    }

    #[test]
    fn test_read_multiple_best_effort() {
        let (params, mock) = manager();
        mock.set_register(0x0100, 12);
        mock.fail_address(0x0B06);
        let values = params.read_multiple(&["rigidity_level", "motor_speed"]);
        assert_eq!(values["rigidity_level"], Some(12));
        assert_eq!(values["motor_speed"], None);
    }

    #[test]
    fn test_write_multiple_reports_per_name() {
        let (params, mock) = manager();
        mock.fail_address(0x0301);
        let mut batch = BTreeMap::new();
        batch.insert("rigidity_level".to_string(), 8);
        batch.insert("speed_command_1".to_string(), 500);
        let results = params.write_multiple(&batch);
        assert_eq!(results["rigidity_level"], true);
        assert_eq!(results["speed_command_1"], false);
    }

    #[test]
    fn test_eeprom_operations_fail_loudly() {
        let (params, _mock) = manager();
        assert!(matches!(
            params.save_to_eeprom(),
            Err(ServoError::NotSupported(_))
        ));
        assert!(matches!(
            params.restore_defaults(),
            Err(ServoError::NotSupported(_))
        ));
    }

    #[test]
    fn test_export_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("params.json");

        let (params, mock) = manager();
        mock.fill_all_mapped(0);
        mock.set_register(0x0100, 20);
        params.export_to_file(&file).unwrap();

        let (restored, mock2) = manager();
        mock2.fill_all_mapped(0);
        restored.import_from_file(&file).unwrap();
        assert_eq!(mock2.register(0x0100), Some(20));
    }

    #[test]
    fn test_import_skips_unknown_names() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("params.json");
        std::fs::write(&file, r#"{"rigidity_level": 7, "bogus_name": 1}"#).unwrap();

        let (params, mock) = manager();
        params.import_from_file(&file).unwrap();
        assert_eq!(mock.register(0x0100), Some(7));
        assert_eq!(mock.write_count(), 1);
    }
}
