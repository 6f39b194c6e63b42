//! Diagram Renderer: static layouts and executed-path overlays.

use crate::authoring::export_bpmn::xml_escape;
use crate::engine_client::EngineClient;
use crate::error::OrchestratorError;
use crate::history::HistoryReader;
use crate::types::*;
use std::collections::BTreeSet;
use std::fmt::Write;
use std::sync::Arc;

type Result<T> = std::result::Result<T, OrchestratorError>;

/// Pure function from layout plus highlighted node ids to image bytes.
pub trait DiagramEncoder: Send + Sync {
    fn content_type(&self) -> &'static str;

    /// Geometry must be preserved; only styling of highlighted nodes changes.
    fn encode(&self, layout: &DiagramLayout, highlighted: &BTreeSet<String>) -> anyhow::Result<Vec<u8>>;
}

// ── SVG encoder ──

const MARGIN: f64 = 20.0;
const STROKE: &str = "#404040";
const FILL: &str = "#ffffff";
const HIGHLIGHT_STROKE: &str = "#2e7d32";
const HIGHLIGHT_FILL: &str = "#e8f5e9";

#[derive(Debug, Default, Clone, Copy)]
pub struct SvgDiagramEncoder;

impl SvgDiagramEncoder {
    fn node_shape(out: &mut String, node: &LayoutNode, b: &Bounds, lit: bool) -> std::fmt::Result {
        let (stroke, fill, width) = if lit {
            (HIGHLIGHT_STROKE, HIGHLIGHT_FILL, 3.0)
        } else {
            (STROKE, FILL, 1.5)
        };
        let class = if lit { "node executed" } else { "node" };
        let c = b.center();
        let id = xml_escape(&node.id);

        if node.kind.is_event() {
            let r = b.width.min(b.height) / 2.0;
            let width = if node.kind == NodeKind::EndEvent { width + 1.5 } else { width };
            writeln!(
                out,
                r#"  <circle class="{class}" data-id="{id}" cx="{}" cy="{}" r="{r}" stroke="{stroke}" fill="{fill}" stroke-width="{width}"/>"#,
                c.x, c.y
            )?;
        } else if node.kind.is_gateway() {
            let points = format!(
                "{},{} {},{} {},{} {},{}",
                c.x, b.y,
                b.x + b.width, c.y,
                c.x, b.y + b.height,
                b.x, c.y
            );
            writeln!(
                out,
                r#"  <polygon class="{class}" data-id="{id}" points="{points}" stroke="{stroke}" fill="{fill}" stroke-width="{width}"/>"#
            )?;
            let mark = if node.kind == NodeKind::ParallelGateway { "+" } else { "×" };
            writeln!(
                out,
                r#"  <text x="{}" y="{}" text-anchor="middle" font-size="18">{mark}</text>"#,
                c.x,
                c.y + 6.0
            )?;
        } else {
            writeln!(
                out,
                r#"  <rect class="{class}" data-id="{id}" x="{}" y="{}" width="{}" height="{}" rx="10" stroke="{stroke}" fill="{fill}" stroke-width="{width}"/>"#,
                b.x, b.y, b.width, b.height
            )?;
        }

        if let Some(name) = node.name.as_deref().filter(|n| !n.is_empty()) {
            // Events and gateways carry their label underneath.
            let y = if node.kind == NodeKind::StartEvent
                || node.kind == NodeKind::EndEvent
                || node.kind.is_gateway()
            {
                b.y + b.height + 14.0
            } else {
                c.y + 4.0
            };
            writeln!(
                out,
                r#"  <text x="{}" y="{y}" text-anchor="middle" font-size="12">{}</text>"#,
                c.x,
                xml_escape(name)
            )?;
        }
        Ok(())
    }

    fn edge_points(layout: &DiagramLayout, edge: &LayoutEdge) -> Vec<Point> {
        if edge.waypoints.len() >= 2 {
            return edge.waypoints.clone();
        }
        let center = |id: &str| layout.node(id).and_then(|n| n.bounds).map(|b| b.center());
        match (center(&edge.source), center(&edge.target)) {
            (Some(a), Some(b)) => vec![a, b],
            _ => Vec::new(),
        }
    }
}

impl DiagramEncoder for SvgDiagramEncoder {
    fn content_type(&self) -> &'static str {
        "image/svg+xml"
    }

    fn encode(&self, layout: &DiagramLayout, highlighted: &BTreeSet<String>) -> anyhow::Result<Vec<u8>> {
        let (mut max_x, mut max_y) = (0.0_f64, 0.0_f64);
        for b in layout.nodes.iter().filter_map(|n| n.bounds) {
            max_x = max_x.max(b.x + b.width);
            max_y = max_y.max(b.y + b.height);
        }
        for p in layout.edges.iter().flat_map(|e| e.waypoints.iter()) {
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        let (width, height) = (max_x + MARGIN * 2.0, max_y + MARGIN * 2.0);

        let mut out = String::new();
        writeln!(
            out,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}">"#
        )?;
        writeln!(out, r#"  <defs><marker id="arrow" markerWidth="10" markerHeight="10" refX="9" refY="3" orient="auto"><path d="M0,0 L0,6 L9,3 z" fill="{STROKE}"/></marker></defs>"#)?;
        writeln!(out, r#"  <g transform="translate({MARGIN},{MARGIN})">"#)?;

        for edge in &layout.edges {
            let points = Self::edge_points(layout, edge);
            if points.is_empty() {
                continue;
            }
            let coords: Vec<String> = points.iter().map(|p| format!("{},{}", p.x, p.y)).collect();
            writeln!(
                out,
                r#"  <polyline class="edge" data-id="{}" points="{}" fill="none" stroke="{STROKE}" stroke-width="1.5" marker-end="url(#arrow)"/>"#,
                xml_escape(&edge.id),
                coords.join(" ")
            )?;
        }

        for node in &layout.nodes {
            if let Some(b) = &node.bounds {
                Self::node_shape(&mut out, node, b, highlighted.contains(&node.id))?;
            }
        }

        writeln!(out, "  </g>")?;
        writeln!(out, "</svg>")?;
        Ok(out.into_bytes())
    }
}

// ── Renderer ──

pub struct DiagramRenderer {
    engine: EngineClient,
    history: HistoryReader,
    encoder: Arc<dyn DiagramEncoder>,
}

impl DiagramRenderer {
    pub fn new(engine: EngineClient, history: HistoryReader, encoder: Arc<dyn DiagramEncoder>) -> Self {
        Self {
            engine,
            history,
            encoder,
        }
    }

    pub fn content_type(&self) -> &'static str {
        self.encoder.content_type()
    }

    fn encode(&self, layout: &DiagramLayout, highlighted: &BTreeSet<String>) -> Result<Vec<u8>> {
        // No stored positions: an intentionally empty image.
        if !layout.has_geometry() {
            tracing::debug!(definition_id = %layout.definition_id, "Layout has no geometry");
            return Ok(Vec::new());
        }
        Ok(self.encoder.encode(layout, highlighted)?)
    }

    /// The definition's layout with no overlay.
    pub async fn render_definition(&self, definition_id: &str) -> Result<Vec<u8>> {
        let definition = self.engine.get_definition(definition_id).await?;
        let layout = self.engine.get_layout(&definition.id).await?;
        self.encode(&layout, &BTreeSet::new())
    }

    /// The instance's definition layout with exactly its executed activities highlighted.
    pub async fn render_trace(&self, instance_id: &str) -> Result<Vec<u8>> {
        let historic = self.history.historic_instance(instance_id).await?;
        let layout = self.engine.get_layout(&historic.definition_id).await?;
        let executed: BTreeSet<String> = self
            .history
            .activities_for_instance(instance_id)
            .await?
            .into_iter()
            .collect();
        tracing::debug!(
            process_instance_id = instance_id,
            executed = executed.len(),
            "Rendering trace"
        );
        self.encode(&layout, &executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(with_geometry: bool) -> DiagramLayout {
        let bounds = |x: f64| {
            with_geometry.then_some(Bounds {
                x,
                y: 40.0,
                width: 100.0,
                height: 80.0,
            })
        };
        DiagramLayout {
            definition_id: "d:1:x".into(),
            nodes: vec![
                LayoutNode {
                    id: "start".into(),
                    name: None,
                    kind: NodeKind::StartEvent,
                    bounds: bounds(0.0),
                },
                LayoutNode {
                    id: "approve".into(),
                    name: Some("Approve <fast>".into()),
                    kind: NodeKind::UserTask,
                    bounds: bounds(200.0),
                },
            ],
            edges: vec![LayoutEdge {
                id: "f1".into(),
                source: "start".into(),
                target: "approve".into(),
                waypoints: Vec::new(),
            }],
        }
    }

    #[test]
    fn test_svg_highlights_only_requested_nodes() {
        let highlighted: BTreeSet<String> = ["start".to_string()].into();
        let bytes = SvgDiagramEncoder.encode(&layout(true), &highlighted).unwrap();
        let svg = String::from_utf8(bytes).unwrap();
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains(r#"class="node executed" data-id="start""#));
        assert!(svg.contains(r#"class="node" data-id="approve""#));
        assert!(svg.contains("Approve &lt;fast&gt;"));
        assert_eq!(svg.matches("<polyline").count(), 1);
    }

    #[test]
    fn test_geometry_is_identical_with_and_without_overlay() {
        let plain = String::from_utf8(SvgDiagramEncoder.encode(&layout(true), &BTreeSet::new()).unwrap()).unwrap();
        let lit = String::from_utf8(
            SvgDiagramEncoder
                .encode(&layout(true), &["approve".to_string()].into())
                .unwrap(),
        )
        .unwrap();
        assert!(plain.contains(r#"x="200" y="40" width="100" height="80""#));
        assert!(lit.contains(r#"x="200" y="40" width="100" height="80""#));
        assert_ne!(plain, lit);
    }

    #[test]
    fn test_layout_without_geometry() {
        assert!(!layout(false).has_geometry());
    }
}
