//! Execution Scope
//!
//! The fixed table of names a script can use, and the layer lookup helpers
//! exposed in it. A runtime renders the table into its own binding form;
//! the helpers are also available natively for host-side lookups.

use std::collections::BTreeMap;

use query_gis_core::{HostProject, LayerInfo};

use crate::error::{SandboxError, SandboxResult};

/// Default length used by [`shorten_layer_name`].
pub const MAX_LAYER_NAME_LEN: usize = 50;

/// Layer lookup helpers available in every scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerHelper {
    FindByKeyword,
    GetSafe,
    ShortenName,
}

/// What a scope name is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// A whole module (`qgis`, `os`).
    Module { module: &'static str },
    /// A symbol imported from a host module (`QgsProject`, `iface`).
    Symbol {
        module: &'static str,
        symbol: &'static str,
    },
    /// The long-running operation runner, wrapped for progress reporting.
    ProcessingRunner,
    /// Feedback object forwarding percentages and info lines to the UI.
    ProgressFeedback,
    LayerHelper(LayerHelper),
}

const HOST_SYMBOLS: &[(&str, &str)] = &[
    ("qgis.core", "QgsProject"),
    ("qgis.core", "QgsMapLayer"),
    ("qgis.core", "QgsVectorLayer"),
    ("qgis.core", "QgsRasterLayer"),
    ("qgis.core", "QgsApplication"),
    ("qgis.core", "QgsProcessingFeatureSourceDefinition"),
    ("qgis.core", "QgsFeatureSink"),
    ("qgis.PyQt.QtCore", "QVariant"),
    ("qgis.utils", "iface"),
];

/// Name-to-capability table plus the layer list it was built from.
#[derive(Debug, Clone, Default)]
pub struct ExecutionScope {
    entries: BTreeMap<String, Capability>,
    layers: Vec<LayerInfo>,
}

impl ExecutionScope {
    /// The standard scope over the host's current layers.
    pub fn standard(project: &dyn HostProject) -> Self {
        let mut scope = Self {
            entries: BTreeMap::new(),
            layers: project.layers(),
        };
        scope.bind("qgis", Capability::Module { module: "qgis" });
        scope.bind("os", Capability::Module { module: "os" });
        scope.bind("tempfile", Capability::Module { module: "tempfile" });
        for &(module, symbol) in HOST_SYMBOLS {
            scope.bind(symbol, Capability::Symbol { module, symbol });
        }
        scope.bind("processing", Capability::ProcessingRunner);
        scope.bind("processing_feedback", Capability::ProgressFeedback);
        scope.bind(
            "find_layer_by_keyword",
            Capability::LayerHelper(LayerHelper::FindByKeyword),
        );
        scope.bind("get_layer_safe", Capability::LayerHelper(LayerHelper::GetSafe));
        scope.bind(
            "shorten_layer_name",
            Capability::LayerHelper(LayerHelper::ShortenName),
        );
        scope
    }

    pub fn bind(&mut self, name: impl Into<String>, capability: Capability) {
        self.entries.insert(name.into(), capability);
    }

    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Capability)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Layers visible to the script when the scope was built.
    pub fn layers(&self) -> &[LayerInfo] {
        &self.layers
    }

    pub fn find_layer_by_keyword(&self, keyword: &str) -> Option<&LayerInfo> {
        find_layer_by_keyword(&self.layers, keyword)
    }

    pub fn get_layer_safe(&self, name: &str) -> SandboxResult<&LayerInfo> {
        get_layer_safe(&self.layers, name)
    }
}

/// Exact name match first, then case-insensitive substring.
pub fn find_layer_by_keyword<'a>(layers: &'a [LayerInfo], keyword: &str) -> Option<&'a LayerInfo> {
    if let Some(exact) = layers.iter().find(|l| l.name == keyword) {
        return Some(exact);
    }
    let needle = keyword.to_lowercase();
    layers
        .iter()
        .find(|l| l.name.to_lowercase().contains(&needle))
}

/// Exact name, then the name without its file extension, then keyword
/// search. The error lists the available layer names.
pub fn get_layer_safe<'a>(layers: &'a [LayerInfo], name: &str) -> SandboxResult<&'a LayerInfo> {
    if let Some(layer) = layers.iter().find(|l| l.name == name) {
        return Ok(layer);
    }
    let base = strip_extension(name);
    if let Some(layer) = layers.iter().find(|l| l.name == base) {
        return Ok(layer);
    }
    find_layer_by_keyword(layers, name).ok_or_else(|| SandboxError::LayerNotFound {
        name: name.to_string(),
        available: layers.iter().map(|l| l.name.clone()).collect(),
    })
}

fn strip_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(dot) if dot > 0 && !name[dot + 1..].contains(['/', '\\']) => &name[..dot],
        _ => name,
    }
}

/// Truncate to `max_len` characters, ending with `...` when shortened.
pub fn shorten_layer_name(name: &str, max_len: usize) -> String {
    if name.chars().count() <= max_len {
        return name.to_string();
    }
    let kept: String = name.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", kept)
}
