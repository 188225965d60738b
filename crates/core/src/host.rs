//! Host Project Capability Interface
//!
//! The operations the orchestration core needs from the desktop GIS host:
//! layer enumeration, feature sampling, layer removal (for rollback) and the
//! host message log. Nothing here is open-ended reflection; a host exposes
//! exactly these capabilities.
//!
//! `InMemoryProject` is a self-contained implementation backed by a
//! `ProjectSnapshot`, used by the console shell and the test suites.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};

/// One attribute row of a vector layer.
pub type FeatureRow = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Vector,
    Raster,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

/// Descriptive metadata of a map layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub id: String,
    pub name: String,
    pub kind: LayerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldInfo>,
    /// xmin, ymin, xmax, ymax in the layer CRS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extent: Option<[f64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl LayerInfo {
    /// Minimal vector layer description.
    pub fn vector(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: LayerKind::Vector,
            crs: None,
            geometry_type: None,
            feature_count: None,
            fields: Vec::new(),
            extent: None,
            source: None,
        }
    }

    /// Minimal raster layer description.
    pub fn raster(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: LayerKind::Raster,
            ..Self::vector(id, name)
        }
    }

    pub fn with_crs(mut self, crs: impl Into<String>) -> Self {
        self.crs = Some(crs.into());
        self
    }

    pub fn with_geometry(mut self, geometry_type: impl Into<String>) -> Self {
        self.geometry_type = Some(geometry_type.into());
        self
    }

    pub fn with_feature_count(mut self, count: u64) -> Self {
        self.feature_count = Some(count);
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.fields.push(FieldInfo {
            name: name.into(),
            type_name: type_name.into(),
        });
        self
    }

    pub fn with_extent(mut self, extent: [f64; 4]) -> Self {
        self.extent = Some(extent);
        self
    }
}

/// Capabilities the host application provides to the core.
pub trait HostProject: Send + Sync {
    /// Project title, empty when unsaved.
    fn title(&self) -> String {
        String::new()
    }

    /// Project CRS authority id (e.g. `EPSG:5186`).
    fn crs(&self) -> Option<String> {
        None
    }

    /// All map layers in registry order.
    fn layers(&self) -> Vec<LayerInfo>;

    /// The layer currently selected in the layer tree.
    fn active_layer(&self) -> Option<LayerInfo>;

    /// Up to `limit` attribute rows of a layer.
    fn sample_features(&self, layer_id: &str, limit: usize) -> Vec<FeatureRow>;

    /// Remove a layer from the project.
    fn remove_layer(&self, layer_id: &str) -> CoreResult<()>;

    /// Recent lines of the host's own message log (providers, GDAL, ...).
    fn message_log(&self) -> Vec<String> {
        Vec::new()
    }

    /// Layers whose name matches exactly.
    fn layers_by_name(&self, name: &str) -> Vec<LayerInfo> {
        self.layers().into_iter().filter(|l| l.name == name).collect()
    }

    fn layer_ids(&self) -> Vec<String> {
        self.layers().into_iter().map(|l| l.id).collect()
    }
}

/// Serializable description of a whole project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_layer: Option<String>,
    #[serde(default)]
    pub layers: Vec<LayerInfo>,
    /// Feature rows keyed by layer id.
    #[serde(default)]
    pub features: HashMap<String, Vec<FeatureRow>>,
    #[serde(default)]
    pub messages: Vec<String>,
}

/// `HostProject` backed by an in-memory snapshot.
#[derive(Debug, Default)]
pub struct InMemoryProject {
    state: RwLock<ProjectSnapshot>,
}

impl InMemoryProject {
    pub fn new(title: impl Into<String>) -> Self {
        Self::from_snapshot(ProjectSnapshot {
            title: title.into(),
            ..Default::default()
        })
    }

    pub fn from_snapshot(snapshot: ProjectSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
        }
    }

    /// Load a project description written as JSON.
    pub fn from_json_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let snapshot: ProjectSnapshot = serde_json::from_str(&content)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn snapshot(&self) -> ProjectSnapshot {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_crs(&self, crs: impl Into<String>) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).crs = Some(crs.into());
    }

    /// Add a layer; the first layer added becomes the active one.
    pub fn add_layer(&self, layer: LayerInfo) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.active_layer.is_none() {
            state.active_layer = Some(layer.id.clone());
        }
        state.layers.push(layer);
    }

    pub fn set_active(&self, layer_id: &str) -> CoreResult<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if !state.layers.iter().any(|l| l.id == layer_id) {
            return Err(CoreError::not_found(format!("layer '{}'", layer_id)));
        }
        state.active_layer = Some(layer_id.to_string());
        Ok(())
    }

    pub fn add_features(&self, layer_id: &str, rows: Vec<FeatureRow>) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .features
            .entry(layer_id.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn push_message(&self, line: impl Into<String>) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .messages
            .push(line.into());
    }
}

impl HostProject for InMemoryProject {
    fn title(&self) -> String {
        self.state.read().unwrap_or_else(|e| e.into_inner()).title.clone()
    }

    fn crs(&self) -> Option<String> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).crs.clone()
    }

    fn layers(&self) -> Vec<LayerInfo> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).layers.clone()
    }

    fn active_layer(&self) -> Option<LayerInfo> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let active = state.active_layer.as_deref()?;
        state.layers.iter().find(|l| l.id == active).cloned()
    }

    fn sample_features(&self, layer_id: &str, limit: usize) -> Vec<FeatureRow> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .features
            .get(layer_id)
            .map(|rows| rows.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    fn remove_layer(&self, layer_id: &str) -> CoreResult<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let before = state.layers.len();
        state.layers.retain(|l| l.id != layer_id);
        if state.layers.len() == before {
            return Err(CoreError::not_found(format!("layer '{}'", layer_id)));
        }
        state.features.remove(layer_id);
        if state.active_layer.as_deref() == Some(layer_id) {
            state.active_layer = state.layers.first().map(|l| l.id.clone());
        }
        Ok(())
    }

    fn message_log(&self) -> Vec<String> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).messages.clone()
    }
}
