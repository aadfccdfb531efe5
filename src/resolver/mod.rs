//! Preset expansion into a deduplicated file manifest.
//!
//! Unknown ids never abort resolution; they come back as warnings. A dependency
//! cycle only drops the requested preset it was found under. Two presets that
//! disagree about the artifact at one target path fail the whole resolution.

pub mod selection;

pub use selection::parse_selection;

use crate::error::ResolveError;
use crate::registry::{FileSpec, PresetDescriptor, Registry};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// A requested or depended-on id missing from the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnknownPresetWarning {
    pub id: String,
    /// Set when the id came from another preset's `depends_on`
    pub required_by: Option<String>,
    pub suggestion: Option<String>,
}

impl fmt::Display for UnknownPresetWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown preset '{}'", self.id)?;
        if let Some(parent) = &self.required_by {
            write!(f, " (required by '{parent}')")?;
        }
        if let Some(suggestion) = &self.suggestion {
            write!(f, ", did you mean '{suggestion}'?")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyCycle {
    pub requested: String,
    /// Ids along the cycle, first and last equal
    pub cycle: Vec<String>,
}

impl fmt::Display for DependencyCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dependency cycle in '{}': {}",
            self.requested,
            self.cycle.join(" -> ")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    /// First preset that declared this path
    pub preset_id: String,
    pub required_by: Vec<String>,
    pub spec: FileSpec,
}

/// Deduplicated files for one invocation, in first-seen order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    #[must_use]
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn find(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.spec.path == path)
    }

    /// Sum of declared sizes
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.spec.size).sum()
    }
}

impl FromIterator<ManifestEntry> for Manifest {
    fn from_iter<I: IntoIterator<Item = ManifestEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub manifest: Manifest,
    /// Presets included in the manifest, dependencies first
    pub presets: Vec<String>,
    pub unknown: Vec<UnknownPresetWarning>,
    pub cycles: Vec<DependencyCycle>,
}

/// Expand preset ids into a manifest
pub fn resolve<S: AsRef<str>>(ids: &[S], registry: &Registry) -> Result<Resolution, ResolveError> {
    let mut expansion = Expansion {
        registry,
        ordered: Vec::new(),
        seen: HashSet::new(),
        unknown: Vec::new(),
        cycles: Vec::new(),
    };

    for id in ids {
        expansion.request(id.as_ref());
    }

    let manifest = merge(&expansion.ordered)?;
    tracing::debug!(
        "Resolved {} presets into {} files",
        expansion.ordered.len(),
        manifest.len()
    );

    Ok(Resolution {
        manifest,
        presets: expansion.ordered.iter().map(|p| p.id.clone()).collect(),
        unknown: expansion.unknown,
        cycles: expansion.cycles,
    })
}

struct Expansion<'r> {
    registry: &'r Registry,
    ordered: Vec<&'r PresetDescriptor>,
    seen: HashSet<&'r str>,
    unknown: Vec<UnknownPresetWarning>,
    cycles: Vec<DependencyCycle>,
}

impl<'r> Expansion<'r> {
    fn request(&mut self, id: &str) {
        let registry = self.registry;
        let Some(preset) = registry.find(id) else {
            self.warn_unknown(id, None);
            return;
        };

        let mut stack = Vec::new();
        let mut local = Vec::new();
        match self.visit(preset, &mut stack, &mut local) {
            Ok(()) => {
                for preset in local {
                    if self.seen.insert(preset.id.as_str()) {
                        self.ordered.push(preset);
                    }
                }
            }
            Err(cycle) => {
                let cycle = DependencyCycle {
                    requested: id.to_string(),
                    cycle,
                };
                tracing::error!("Skipping preset: {cycle}");
                self.cycles.push(cycle);
            }
        }
    }

    /// Depth-first, dependencies before the preset itself
    fn visit(
        &mut self,
        preset: &'r PresetDescriptor,
        stack: &mut Vec<&'r str>,
        local: &mut Vec<&'r PresetDescriptor>,
    ) -> Result<(), Vec<String>> {
        let id = preset.id.as_str();

        if let Some(pos) = stack.iter().position(|s| *s == id) {
            let mut cycle: Vec<String> = stack[pos..].iter().map(ToString::to_string).collect();
            cycle.push(id.to_string());
            return Err(cycle);
        }
        if self.seen.contains(id) || local.iter().any(|p| p.id == id) {
            return Ok(());
        }

        stack.push(id);
        let registry = self.registry;
        for dep in &preset.depends_on {
            match registry.find(dep) {
                Some(dep_preset) => self.visit(dep_preset, stack, local)?,
                None => self.warn_unknown(dep, Some(id)),
            }
        }
        stack.pop();

        local.push(preset);
        Ok(())
    }

    fn warn_unknown(&mut self, id: &str, required_by: Option<&str>) {
        if self.unknown.iter().any(|w| w.id == id) {
            return;
        }

        let warning = UnknownPresetWarning {
            id: id.to_string(),
            required_by: required_by.map(ToString::to_string),
            suggestion: self.registry.suggest(id).map(ToString::to_string),
        };
        tracing::warn!("{warning}");
        self.unknown.push(warning);
    }
}

/// Merge file lists keyed by target path
fn merge(presets: &[&PresetDescriptor]) -> Result<Manifest, ResolveError> {
    let mut entries: Vec<ManifestEntry> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for preset in presets {
        for spec in &preset.files {
            if let Some(&i) = index.get(spec.path.as_str()) {
                let entry = &mut entries[i];
                if !entry.spec.same_artifact(spec) {
                    return Err(ResolveError::ManifestConflict {
                        path: spec.path.clone(),
                        first_preset: entry.preset_id.clone(),
                        second_preset: preset.id.clone(),
                    });
                }
                if !entry.required_by.contains(&preset.id) {
                    entry.required_by.push(preset.id.clone());
                }
                continue;
            }

            index.insert(spec.path.as_str(), entries.len());
            entries.push(ManifestEntry {
                preset_id: preset.id.clone(),
                required_by: vec![preset.id.clone()],
                spec: spec.clone(),
            });
        }
    }

    Ok(Manifest { entries })
}
