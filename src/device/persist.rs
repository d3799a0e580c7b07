//! Opt-in XML persistence of device configurations.
//!
//! A device with `archive = true` running on a server that has a
//! `persist_dir` writes its writable configuration to
//! `<persist_dir>/<deviceId>.xml` after every reconfiguration and at
//! shutdown. On the next instantiation the stored values are used wherever
//! the start configuration does not name a key.
//!
//! The lock holder (`lockedBy`) is never stored: a restarted device always
//! comes up unlocked.

use std::path::{Path, PathBuf};

use karabo_core::xml::{self, XmlOptions};
use karabo_core::{AccessMode, Assignment, Element, Hash, Schema, Value};

use crate::error::KaraboResult;

const NOT_PERSISTED: &[&str] = &["lockedBy"];

/// File holding the configuration of `device_id`.
pub fn path_for(dir: &Path, device_id: &str) -> PathBuf {
    let file: String = device_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    dir.join(format!("{file}.xml"))
}

/// Stored configuration of `device_id`, if any. Keys the current `schema`
/// no longer knows, or no longer lets a user set, are dropped.
pub fn load(dir: &Path, device_id: &str, schema: &Schema) -> KaraboResult<Option<Hash>> {
    let path = path_for(dir, device_id);
    match std::fs::read_to_string(&path) {
        Ok(text) => Ok(Some(persistable(schema, &xml::from_xml(&text)?))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write the persistable part of `values`.
pub fn save(dir: &Path, device_id: &str, schema: &Schema, values: &Hash) -> KaraboResult<()> {
    std::fs::create_dir_all(dir)?;
    let path = path_for(dir, device_id);
    let text = xml::to_xml(&persistable(schema, values), &XmlOptions::default())?;
    let tmp = path.with_extension("xml.tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, &path)?;
    tracing::debug!(device_id, path = %path.display(), "configuration persisted");
    Ok(())
}

/// Reconfigurable and init-only leaves, without timestamps.
fn persistable(schema: &Schema, values: &Hash) -> Hash {
    let mut out = Hash::new();
    collect(schema.elements(), values, "", &mut out);
    out
}

fn collect(elements: &[Element], values: &Hash, prefix: &str, out: &mut Hash) {
    for element in elements {
        let path = if prefix.is_empty() {
            element.key().to_string()
        } else {
            format!("{prefix}.{}", element.key())
        };
        if element.is_node() {
            collect(element.children(), values, &path, out);
            continue;
        }
        if element.is_slot()
            || element.assignment() == Assignment::Internal
            || element.access_mode() == AccessMode::ReadOnly
            || NOT_PERSISTED.contains(&path.as_str())
        {
            continue;
        }
        if let Ok(value) = values.get_value(&path) {
            if !matches!(value, Value::None) {
                out.set(&path, value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karabo_core::hash;

    fn schema() -> Schema {
        let mut s = Schema::new("Test");
        s.add(Element::string("lockedBy").reconfigurable().default_value("")).unwrap();
        s.add(Element::string("_serverId_").init_only().assignment_internal()).unwrap();
        s.add(Element::int32("speed").reconfigurable()).unwrap();
        s.add(Element::int32("counter").read_only()).unwrap();
        s.add(Element::node("motor")).unwrap();
        s.add(Element::string("motor.port").init_only()).unwrap();
        s
    }

    #[test]
    fn writable_leaves_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let values = hash! {
            "lockedBy" => "someone",
            "_serverId_" => "srv",
            "speed" => 7i32,
            "counter" => 99i32,
            "motor.port" => "/dev/ttyS0",
        };
        save(dir.path(), "SA1/MOTOR/1", &schema(), &values).unwrap();
        assert!(dir.path().join("SA1_MOTOR_1.xml").exists());

        let loaded = load(dir.path(), "SA1/MOTOR/1", &schema()).unwrap().unwrap();
        assert_eq!(loaded.get::<i32>("speed").unwrap(), 7);
        assert_eq!(loaded.get::<String>("motor.port").unwrap(), "/dev/ttyS0");
        assert!(!loaded.has("lockedBy"));
        assert!(!loaded.has("counter"));
        assert!(!loaded.has("_serverId_"));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path(), "nobody", &schema()).unwrap().is_none());
    }

    #[test]
    fn stale_keys_are_dropped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut old = schema();
        old.add(Element::int32("retired").reconfigurable()).unwrap();
        save(dir.path(), "dev", &old, &hash! { "speed" => 1i32, "retired" => 2i32 }).unwrap();

        let loaded = load(dir.path(), "dev", &schema()).unwrap().unwrap();
        assert_eq!(loaded.get::<i32>("speed").unwrap(), 1);
        assert!(!loaded.has("retired"));
    }
}
