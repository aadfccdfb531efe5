//! Registry document validation.
//!
//! Required sections are `metadata`, `categories` and `presets`. The only
//! accepted migration is the legacy 1.x layout, which kept `version` and
//! `generated_at` at the top level; everything else with an unexpected
//! version is rejected.

use super::{Alert, Category, PresetDescriptor, Registry, RegistryMetadata};
use crate::error::{PresetError, Result};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};

/// Major schema version this build understands
pub const SUPPORTED_MAJOR: u32 = 2;

#[derive(Deserialize)]
struct RawRegistry {
    metadata: Option<RegistryMetadata>,
    // Legacy 1.x header fields
    version: Option<String>,
    generated_at: Option<String>,
    categories: Option<BTreeMap<String, Category>>,
    #[serde(default, deserialize_with = "unique_presets")]
    presets: Option<BTreeMap<String, PresetDescriptor>>,
    #[serde(default)]
    alerts: Vec<Alert>,
}

/// Deserialize the preset map, rejecting duplicate ids
fn unique_presets<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<BTreeMap<String, PresetDescriptor>>, D::Error>
where
    D: Deserializer<'de>,
{
    struct UniquePresets;

    impl<'de> Visitor<'de> for UniquePresets {
        type Value = BTreeMap<String, PresetDescriptor>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of preset id to preset descriptor")
        }

        fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut presets = BTreeMap::new();
            while let Some((id, preset)) = map.next_entry::<String, PresetDescriptor>()? {
                if presets.contains_key(&id) {
                    return Err(de::Error::custom(format!("duplicate preset id '{id}'")));
                }
                presets.insert(id, preset);
            }
            Ok(presets)
        }
    }

    deserializer.deserialize_map(UniquePresets).map(Some)
}

fn invalid(msg: impl Into<String>) -> PresetError {
    PresetError::RegistryInvalid(msg.into())
}

/// Parse and validate a registry document
pub fn parse(text: &str) -> Result<Registry> {
    let raw: RawRegistry = serde_json::from_str(text)
        .map_err(|e| invalid(format!("failed to parse registry document: {e}")))?;

    let mut missing = Vec::new();
    if raw.metadata.is_none() && raw.version.is_none() {
        missing.push("metadata");
    }
    if raw.categories.is_none() {
        missing.push("categories");
    }
    if raw.presets.is_none() {
        missing.push("presets");
    }
    if !missing.is_empty() {
        return Err(invalid(format!(
            "missing required sections: {}",
            missing.join(", ")
        )));
    }

    let metadata = match raw.metadata {
        Some(metadata) => metadata,
        None => migrate_legacy_header(raw.version, raw.generated_at)?,
    };
    check_version(&metadata.version)?;

    let categories = raw.categories.unwrap_or_default();
    let mut presets = raw.presets.unwrap_or_default();

    for (key, preset) in &mut presets {
        if preset.id.is_empty() {
            preset.id.clone_from(key);
        } else if preset.id != *key {
            return Err(invalid(format!(
                "preset '{key}' declares mismatching id '{}'",
                preset.id
            )));
        }
        validate_files(preset)?;

        if !categories.contains_key(&preset.category) {
            tracing::warn!(
                "Preset '{key}' uses undeclared category '{}'",
                preset.category
            );
        }
    }

    for preset in presets.values() {
        for dep in &preset.depends_on {
            if !presets.contains_key(dep) {
                tracing::warn!("Preset '{}' depends on unknown preset '{dep}'", preset.id);
            }
        }
    }

    Ok(Registry {
        metadata,
        categories,
        presets,
        alerts: raw.alerts,
    })
}

/// Lift legacy top-level header fields into `metadata`
fn migrate_legacy_header(
    version: Option<String>,
    generated_at: Option<String>,
) -> Result<RegistryMetadata> {
    let version = version.unwrap_or_default();
    if major_version(&version) != Some(1) {
        return Err(invalid(format!(
            "registry has no metadata section and unrecognized version '{version}'"
        )));
    }

    tracing::warn!("Migrating legacy registry schema {version} to {SUPPORTED_MAJOR}.0");
    Ok(RegistryMetadata {
        version: format!("{SUPPORTED_MAJOR}.0"),
        generated_at: generated_at.unwrap_or_default(),
    })
}

fn major_version(version: &str) -> Option<u32> {
    version.trim().split('.').next()?.parse().ok()
}

fn check_version(version: &str) -> Result<()> {
    match major_version(version) {
        Some(SUPPORTED_MAJOR) => Ok(()),
        _ => Err(invalid(format!(
            "unsupported registry schema version '{version}' (supported: {SUPPORTED_MAJOR}.x)"
        ))),
    }
}

fn validate_files(preset: &mut PresetDescriptor) -> Result<()> {
    let id = preset.id.clone();
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();

    for (idx, file) in preset.files.iter_mut().enumerate() {
        file.path = validate_relative_path(&file.path)
            .map_err(|e| invalid(format!("preset '{id}' file '{}': {e}", file.path)))?;

        if file.url.trim().is_empty() {
            return Err(invalid(format!(
                "preset '{id}' file '{}' has no url",
                file.path
            )));
        }

        if let Some(checksum) = &mut file.checksum {
            let value = checksum.value.trim().to_ascii_lowercase();
            if value.len() != checksum.algorithm.hex_len()
                || !value.chars().all(|c| c.is_ascii_hexdigit())
            {
                return Err(invalid(format!(
                    "preset '{id}' file '{}' has a malformed {} checksum",
                    file.path, checksum.algorithm
                )));
            }
            checksum.value = value;
        }

        if let Some(prev) = seen.insert(file.path.clone(), idx) {
            return Err(invalid(format!(
                "preset '{id}' lists '{}' twice (entries {prev} and {idx})",
                file.path
            )));
        }
    }

    Ok(())
}

/// Target paths must stay inside the target root.
/// Returns the canonical spelling: `/`-joined normal components, so that
/// `vae/./shared.bin` and `vae//shared.bin` both become `vae/shared.bin`.
pub fn validate_relative_path(path: &str) -> std::result::Result<String, String> {
    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => return Err("path is not valid UTF-8".to_string()),
            },
            Component::CurDir => {}
            Component::ParentDir => return Err("path escapes the target root".to_string()),
            Component::RootDir | Component::Prefix(_) => {
                return Err("path must be relative".to_string())
            }
        }
    }

    if parts.iter().all(|p| p.trim().is_empty()) {
        return Err("empty path".to_string());
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::SAMPLE;

    #[test]
    fn test_parse_sample() {
        let registry = parse(SAMPLE).unwrap();
        assert_eq!(registry.metadata.version, "2.1");
        assert_eq!(registry.presets.len(), 2);
        assert_eq!(registry.presets["wan-t2v"].id, "wan-t2v");
        assert_eq!(registry.alerts.len(), 1);
    }

    #[test]
    fn test_missing_sections_reported_together() {
        let err = parse(r#"{"alerts": []}"#).unwrap_err().to_string();
        assert!(err.contains("metadata"));
        assert!(err.contains("categories"));
        assert!(err.contains("presets"));
    }

    #[test]
    fn test_duplicate_preset_ids_rejected() {
        let doc = r#"{
            "metadata": {"version": "2.0"},
            "categories": {},
            "presets": {
                "a": {"name": "A", "category": "x", "size": "1", "update_available": false},
                "a": {"name": "A2", "category": "x", "size": "1", "update_available": false}
            }
        }"#;
        let err = parse(doc).unwrap_err().to_string();
        assert!(err.contains("duplicate preset id 'a'"), "{err}");
    }

    #[test]
    fn test_summary_fields_required() {
        // update_available missing
        let doc = r#"{
            "metadata": {"version": "2.0"},
            "categories": {},
            "presets": {"a": {"name": "A", "category": "x", "size": "1"}}
        }"#;
        let err = parse(doc).unwrap_err().to_string();
        assert!(err.contains("update_available"), "{err}");
    }

    #[test]
    fn test_mismatching_id_rejected() {
        let doc = r#"{
            "metadata": {"version": "2.0"},
            "categories": {},
            "presets": {"a": {"id": "b", "name": "A", "category": "x", "size": "1", "update_available": false}}
        }"#;
        assert!(parse(doc).is_err());
    }

    #[test]
    fn test_legacy_header_migrated() {
        let doc = r#"{
            "version": "1.4",
            "generated_at": "2025-06-01T00:00:00Z",
            "categories": {},
            "presets": {}
        }"#;
        let registry = parse(doc).unwrap();
        assert_eq!(registry.metadata.version, "2.0");
        assert_eq!(registry.metadata.generated_at, "2025-06-01T00:00:00Z");
    }

    #[test]
    fn test_unknown_version_rejected() {
        let doc = r#"{"metadata": {"version": "3.0"}, "categories": {}, "presets": {}}"#;
        let err = parse(doc).unwrap_err().to_string();
        assert!(err.contains("unsupported registry schema version"));

        let doc = r#"{"version": "7", "categories": {}, "presets": {}}"#;
        assert!(parse(doc).is_err());
    }

    #[test]
    fn test_checksum_normalized_and_checked() {
        let upper = "AB".repeat(32);
        let doc = format!(
            r#"{{"metadata": {{"version": "2.0"}}, "categories": {{}}, "presets": {{"a": {{
                "name": "A", "category": "x", "size": "1", "update_available": false,
                "files": [{{"path": "a.bin", "url": "https://x.invalid/a", "size": 1,
                            "checksum": {{"algorithm": "sha256", "value": "{upper}"}}}}]
            }}}}}}"#
        );
        let registry = parse(&doc).unwrap();
        let checksum = registry.presets["a"].files[0].checksum.as_ref().unwrap();
        assert_eq!(checksum.value, "ab".repeat(32));

        let short = doc.replace(&upper, "abcd");
        assert!(parse(&short).is_err());
    }

    #[test]
    fn test_unsafe_paths_rejected() {
        assert!(validate_relative_path("models/a.bin").is_ok());
        assert!(validate_relative_path("./a.bin").is_ok());
        assert!(validate_relative_path("../etc/passwd").is_err());
        assert!(validate_relative_path("a/../../etc/passwd").is_err());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("").is_err());
        assert!(validate_relative_path("./.").is_err());
    }

    #[test]
    fn test_paths_stored_in_canonical_spelling() {
        assert_eq!(validate_relative_path("vae/./shared.bin").unwrap(), "vae/shared.bin");
        assert_eq!(validate_relative_path("./vae//shared.bin").unwrap(), "vae/shared.bin");
        assert_eq!(validate_relative_path("vae/shared.bin/").unwrap(), "vae/shared.bin");

        let doc = r#"{"metadata": {"version": "2.0"}, "categories": {}, "presets": {"a": {
            "name": "A", "category": "x", "size": "1", "update_available": false,
            "files": [{"path": "vae/./shared.bin", "url": "https://x.invalid/1"}]}}}"#;
        let registry = parse(doc).unwrap();
        assert_eq!(registry.presets["a"].files[0].path, "vae/shared.bin");
    }

    #[test]
    fn test_alternate_spelling_within_preset_rejected() {
        let doc = r#"{"metadata": {"version": "2.0"}, "categories": {}, "presets": {"a": {
            "name": "A", "category": "x", "size": "1", "update_available": false,
            "files": [
                {"path": "vae/shared.bin", "url": "https://x.invalid/1"},
                {"path": "vae/./shared.bin", "url": "https://x.invalid/2"}
            ]}}}"#;
        let err = parse(doc).unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn test_duplicate_path_within_preset_rejected() {
        let doc = r#"{"metadata": {"version": "2.0"}, "categories": {}, "presets": {"a": {
            "name": "A", "category": "x", "size": "1", "update_available": false,
            "files": [
                {"path": "a.bin", "url": "https://x.invalid/1"},
                {"path": "a.bin", "url": "https://x.invalid/2"}
            ]}}}"#;
        assert!(parse(doc).is_err());
    }
}
