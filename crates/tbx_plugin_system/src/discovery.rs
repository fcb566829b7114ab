//! Finding plugins on disk and ordering them for loading.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::Path;
use tracing::{debug, error, warn};

use crate::error::ServerError;
use crate::manifest::PluginManifest;

/// Reads the manifest of every plugin directory directly below `directory`.
///
/// Children without a manifest are not plugins and are ignored. Manifests
/// that fail to parse are skipped with a warning. A missing directory yields
/// no plugins. The result is sorted by plugin name.
pub fn discover(directory: &Path) -> Result<Vec<PluginManifest>, ServerError> {
    if !directory.exists() {
        warn!("Plugin directory {} does not exist", directory.display());
        return Ok(Vec::new());
    }

    let entries = std::fs::read_dir(directory).map_err(|source| ServerError::Io {
        path: directory.to_path_buf(),
        source,
    })?;

    let mut manifests: Vec<PluginManifest> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ServerError::Io {
            path: directory.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let Some(manifest_path) = PluginManifest::path_in(&path) else {
            continue;
        };
        if !manifest_path.is_file() {
            debug!("Skipping {}: no manifest", path.display());
            continue;
        }

        match PluginManifest::load(&manifest_path) {
            Ok(manifest) => {
                if manifests.iter().any(|m| same_name(&m.name, &manifest.name)) {
                    warn!(
                        "Skipping {}: a plugin named '{}' was already discovered",
                        manifest_path.display(),
                        manifest.name
                    );
                    continue;
                }
                debug!("Discovered plugin {} in {}", manifest.name, path.display());
                manifests.push(manifest);
            }
            Err(e) => warn!("Skipping plugin in {}: {}", path.display(), e),
        }
    }

    manifests.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(manifests)
}

/// Keeps the plugins named in `whitelist` plus everything they depend on.
///
/// Whitelist entries and dependencies match plugin names or type tags. An
/// empty whitelist keeps every plugin. Requested names that match nothing
/// are logged as errors.
pub fn filter_requested(manifests: Vec<PluginManifest>, whitelist: &[String]) -> Vec<PluginManifest> {
    if whitelist.is_empty() {
        return manifests;
    }

    let providers = |token: &str| -> Vec<usize> {
        manifests
            .iter()
            .enumerate()
            .filter(|(_, m)| m.provides(token))
            .map(|(index, _)| index)
            .collect()
    };

    let mut selected = HashSet::new();
    let mut pending = VecDeque::new();
    for requested in whitelist {
        let matches = providers(requested);
        if matches.is_empty() {
            error!("Requested plugin '{}' was not found", requested);
        }
        for index in matches {
            if selected.insert(index) {
                pending.push_back(index);
            }
        }
    }

    while let Some(index) = pending.pop_front() {
        for dependency in &manifests[index].dependencies {
            for dep in providers(dependency) {
                if selected.insert(dep) {
                    pending.push_back(dep);
                }
            }
        }
    }

    manifests
        .into_iter()
        .enumerate()
        .filter_map(|(index, manifest)| selected.contains(&index).then_some(manifest))
        .collect()
}

/// Load order computed from dependencies and priorities.
#[derive(Debug, Default)]
pub struct LoadPlan {
    /// Plugins in the order they should be loaded
    pub ordered: Vec<PluginManifest>,
    /// Plugins that cannot be loaded, with the dependencies holding them back
    pub unresolved: Vec<(PluginManifest, Vec<String>)>,
}

/// Orders `manifests` so every plugin comes after its dependencies.
///
/// A dependency on a type tag waits for every plugin carrying that tag.
/// Among plugins whose dependencies are all loaded, loggers go first, then
/// the lowest priority, then the name. Plugins with unknown dependencies,
/// plugins caught in a cycle and plugins depending on either end up in
/// [`LoadPlan::unresolved`].
pub fn plan_load_order(manifests: Vec<PluginManifest>) -> LoadPlan {
    let unknown: Vec<Vec<String>> = manifests
        .iter()
        .map(|manifest| {
            manifest
                .dependencies
                .iter()
                .filter(|dep| {
                    !manifests
                        .iter()
                        .any(|other| !same_name(&other.name, &manifest.name) && other.provides(dep))
                })
                .cloned()
                .collect()
        })
        .collect();

    let mut remaining: BTreeMap<(u32, String), (PluginManifest, Vec<String>)> = manifests
        .into_iter()
        .zip(unknown)
        .map(|(manifest, unknown)| ((manifest.priority, manifest.name.clone()), (manifest, unknown)))
        .collect();

    let mut plan = LoadPlan::default();
    loop {
        let is_ready = |(manifest, unknown): &(PluginManifest, Vec<String>)| {
            unknown.is_empty() && !remaining.values().any(|(other, _)| manifest.depends_on(other))
        };

        let mut first = None;
        let mut logger = None;
        for (key, entry) in &remaining {
            if !is_ready(entry) {
                continue;
            }
            if entry.0.is_logger_type() {
                logger = Some(key.clone());
                break;
            }
            if first.is_none() {
                first = Some(key.clone());
            }
        }

        let Some(key) = logger.or(first) else { break };
        if let Some((manifest, _)) = remaining.remove(&key) {
            plan.ordered.push(manifest);
        }
    }

    let leftovers: Vec<(PluginManifest, Vec<String>)> = remaining.into_values().collect();
    for (manifest, unknown) in &leftovers {
        let missing = manifest
            .dependencies
            .iter()
            .filter(|dep| {
                unknown.contains(dep)
                    || leftovers
                        .iter()
                        .any(|(other, _)| !same_name(&other.name, &manifest.name) && other.provides(dep))
            })
            .cloned()
            .collect();
        plan.unresolved.push((manifest.clone(), missing));
    }

    plan
}

/// Moves loggers as far forward as their dependencies allow, keeping the
/// planned order otherwise.
///
/// `planned` must already list every plugin after its dependencies, as
/// [`plan_load_order`] does. Used once plugin objects exist, since a plugin
/// can be a logger without a `logger` type tag.
pub fn prefer_loggers<T>(
    planned: Vec<T>,
    manifest: impl Fn(&T) -> &PluginManifest,
    is_logger: impl Fn(&T) -> bool,
) -> Vec<T> {
    let mut remaining = planned;
    let mut ordered = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        // The first remaining entry is always ready: everything it depends
        // on came before it in the plan.
        let index = remaining
            .iter()
            .position(|item| {
                is_logger(item)
                    && !remaining
                        .iter()
                        .any(|other| manifest(item).depends_on(manifest(other)))
            })
            .unwrap_or(0);
        ordered.push(remaining.remove(index));
    }
    ordered
}

/// Plugin names are matched case-insensitively.
pub(crate) fn same_name(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}
