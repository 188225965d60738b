//! Context Collector
//!
//! Serializes host project state into the bounded text sent with backend
//! requests, and answers the context facets a tool request asks for.
//!
//! - `light` - project header plus the active layer (attempt 1)
//! - `full` - the light block followed by every layer with fields and
//!   sample rows (escalated attempt)
//! - `snapshot` - small layer listing for fix requests

use std::fmt::Write as _;

use serde_json::{json, Map, Value};

use query_gis_core::{HostProject, LayerInfo, LayerKind};
use query_gis_llm::ToolRequest;

/// Facets a tool request may name.
pub const SUPPORTED_FACETS: &[&str] = &[
    "layers",
    "active_layer",
    "fields",
    "samples",
    "crs",
    "extent",
    "messages",
];

/// Sample rows included per vector layer.
const SAMPLE_ROWS: usize = 3;

/// Sample rows per vector layer in the fix snapshot.
const SNAPSHOT_SAMPLE_ROWS: usize = 2;

/// Host log lines returned for the `messages` facet.
const MESSAGE_TAIL: usize = 20;

const TRUNCATION_MARKER: &str = "\n... (context truncated)";

#[derive(Debug, Clone)]
pub struct ContextCollector {
    char_budget: usize,
}

impl ContextCollector {
    pub fn new(char_budget: usize) -> Self {
        Self { char_budget }
    }

    pub fn char_budget(&self) -> usize {
        self.char_budget
    }

    /// Project header and the active layer only.
    pub fn light(&self, host: &dyn HostProject) -> String {
        truncate_to_budget(&light_block(host), self.char_budget)
    }

    /// Full project scan. Always contains the light block, so it is never
    /// poorer than `light` for the same project.
    pub fn full(&self, host: &dyn HostProject) -> String {
        let mut out = light_block(host);
        let layers = host.layers();
        let _ = write!(out, "\nLayers ({}):", layers.len());
        for layer in &layers {
            out.push('\n');
            out.push_str(&describe_layer(layer));
            for field in &layer.fields {
                let _ = write!(out, "\n    - {} ({})", field.name, field.type_name);
            }
            if layer.kind == LayerKind::Vector {
                for row in host.sample_features(&layer.id, SAMPLE_ROWS) {
                    let _ = write!(out, "\n    sample: {}", Value::Object(row));
                }
            }
        }
        truncate_to_budget(&out, self.char_budget)
    }

    /// Small snapshot for fix requests: header, one line per layer and a
    /// couple of feature rows per vector layer.
    pub fn snapshot(&self, host: &dyn HostProject) -> String {
        let mut out = project_header(host);
        for layer in host.layers() {
            out.push('\n');
            out.push_str(&describe_layer(&layer));
            if layer.kind == LayerKind::Vector {
                for row in host.sample_features(&layer.id, SNAPSHOT_SAMPLE_ROWS) {
                    let _ = write!(out, "\n    sample: {}", Value::Object(row));
                }
            }
        }
        truncate_to_budget(&out, (self.char_budget / 4).max(256))
    }

    /// Facet list advertised with every chat request.
    pub fn tool_info(&self) -> String {
        SUPPORTED_FACETS.join(",")
    }

    /// Answer a tool request. Facets this collector does not know are
    /// listed under `unsupported`.
    pub fn collect_facets(&self, host: &dyn HostProject, request: &ToolRequest) -> Value {
        let mut data = Map::new();
        let mut unsupported = Vec::new();
        let layers = host.layers();

        for facet in &request.facets {
            let value = match facet.as_str() {
                "layers" => json!(layers
                    .iter()
                    .map(|l| json!({
                        "id": l.id,
                        "name": l.name,
                        "kind": l.kind,
                        "geometry_type": l.geometry_type,
                        "feature_count": l.feature_count,
                    }))
                    .collect::<Vec<_>>()),
                "active_layer" => json!(host.active_layer()),
                "fields" => Value::Object(
                    layers
                        .iter()
                        .map(|l| (l.name.clone(), json!(l.fields)))
                        .collect(),
                ),
                "samples" => Value::Object(
                    layers
                        .iter()
                        .filter(|l| l.kind == LayerKind::Vector)
                        .map(|l| (l.name.clone(), json!(host.sample_features(&l.id, SAMPLE_ROWS))))
                        .collect(),
                ),
                "crs" => json!({
                    "project": host.crs(),
                    "layers": layers
                        .iter()
                        .map(|l| (l.name.clone(), json!(l.crs)))
                        .collect::<Map<String, Value>>(),
                }),
                "extent" => Value::Object(
                    layers
                        .iter()
                        .filter_map(|l| l.extent.map(|e| (l.name.clone(), json!(e))))
                        .collect(),
                ),
                "messages" => {
                    let log = host.message_log();
                    let start = log.len().saturating_sub(MESSAGE_TAIL);
                    json!(log[start..])
                }
                _ => {
                    unsupported.push(facet.clone());
                    continue;
                }
            };
            data.insert(facet.clone(), value);
        }

        if !unsupported.is_empty() {
            tracing::debug!("[Context] unsupported facets requested: {:?}", unsupported);
            data.insert("unsupported".to_string(), json!(unsupported));
        }
        Value::Object(data)
    }
}

fn project_header(host: &dyn HostProject) -> String {
    let title = host.title();
    format!(
        "Project: {}\nProject CRS: {}",
        if title.is_empty() { "(unsaved)" } else { title.as_str() },
        host.crs().unwrap_or_else(|| "unknown".to_string())
    )
}

fn light_block(host: &dyn HostProject) -> String {
    let mut out = project_header(host);
    match host.active_layer() {
        Some(layer) => {
            out.push_str("\nActive layer:\n");
            out.push_str(&describe_layer(&layer));
            if !layer.fields.is_empty() {
                let names: Vec<&str> = layer.fields.iter().map(|f| f.name.as_str()).collect();
                let _ = write!(out, "\n    fields: {}", names.join(", "));
            }
        }
        None => out.push_str("\nActive layer: none"),
    }
    out
}

/// `  - roads [vector, LineString, 3 features, EPSG:5186]`
fn describe_layer(layer: &LayerInfo) -> String {
    let mut parts = vec![match layer.kind {
        LayerKind::Vector => "vector".to_string(),
        LayerKind::Raster => "raster".to_string(),
        LayerKind::Other => "other".to_string(),
    }];
    if let Some(geometry) = &layer.geometry_type {
        parts.push(geometry.clone());
    }
    if let Some(count) = layer.feature_count {
        parts.push(format!("{} features", count));
    }
    if let Some(crs) = &layer.crs {
        parts.push(crs.clone());
    }
    format!("  - {} [{}]", layer.name, parts.join(", "))
}

/// Cut `text` to at most `budget` characters, marking the cut.
fn truncate_to_budget(text: &str, budget: usize) -> String {
    if text.chars().count() <= budget {
        return text.to_string();
    }
    let keep = budget.saturating_sub(TRUNCATION_MARKER.chars().count());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}
