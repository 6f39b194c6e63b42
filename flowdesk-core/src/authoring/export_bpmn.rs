use super::dto::*;
use anyhow::Result;
use petgraph::algo::{dijkstra, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write;

const RANK_SPACING: f64 = 180.0;
const ROW_SPACING: f64 = 120.0;
const MARGIN: f64 = 40.0;
/// Every shape is centred on its row's midline.
const ROW_HEIGHT: f64 = 80.0;

/// Encode bytes as lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut acc, b| {
        let _ = write!(acc, "{:02x}", b);
        acc
    })
}

/// Export an editor graph to BPMN 2.0 XML with diagram interchange.
///
/// Node ids are used verbatim as element ids (validation guarantees they are
/// NCNames), so executed-activity ids reported by the engine match the editor.
/// Assignment attributes use the `activiti:` extension namespace.
///
/// ## XOR default
/// `<exclusiveGateway default="...">` comes ONLY from edges with `isDefault=true`.
pub fn graph_to_bpmn_xml(graph: &EditorGraph, process_key: &str, process_name: &str) -> Result<String> {
    let process_id = sanitize_ncname(process_key);
    let flow_ids = compute_flow_ids(graph);

    let mut xor_defaults: HashMap<&str, &str> = HashMap::new();
    for (i, edge) in graph.edges.iter().enumerate() {
        if edge.is_default {
            xor_defaults.insert(edge.from.as_str(), flow_ids[i].as_str());
        }
    }

    let positions = layered_layout(graph);

    let mut xml = String::new();

    // ── Header ──
    writeln!(xml, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
    writeln!(
        xml,
        r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL""#
    )?;
    writeln!(xml, r#"             xmlns:activiti="http://activiti.org/bpmn""#)?;
    writeln!(
        xml,
        r#"             xmlns:bpmndi="http://www.omg.org/spec/BPMN/20100524/DI""#
    )?;
    writeln!(
        xml,
        r#"             xmlns:omgdc="http://www.omg.org/spec/DD/20100524/DC""#
    )?;
    writeln!(
        xml,
        r#"             xmlns:omgdi="http://www.omg.org/spec/DD/20100524/DI""#
    )?;
    writeln!(
        xml,
        r#"             targetNamespace="http://flowdesk.local/processdef">"#
    )?;
    writeln!(
        xml,
        r#"  <process id="{}" name="{}" isExecutable="true">"#,
        process_id,
        xml_escape(process_name)
    )?;

    // ── Elements ──
    for node in &graph.nodes {
        let id = node.id();
        let name_attr = node
            .name()
            .map(|n| format!(r#" name="{}""#, xml_escape(n)))
            .unwrap_or_default();
        match node {
            EditorNode::StartEvent { .. } => {
                writeln!(xml, r#"    <startEvent id="{}"{} />"#, id, name_attr)?;
            }
            EditorNode::EndEvent { .. } => {
                writeln!(xml, r#"    <endEvent id="{}"{} />"#, id, name_attr)?;
            }
            EditorNode::UserTask {
                assignee,
                candidate_users,
                candidate_groups,
                ..
            } => {
                let mut attrs = name_attr;
                if let Some(a) = assignee {
                    write!(attrs, r#" activiti:assignee="{}""#, xml_escape(a))?;
                }
                if !candidate_users.is_empty() {
                    write!(
                        attrs,
                        r#" activiti:candidateUsers="{}""#,
                        xml_escape(&candidate_users.join(","))
                    )?;
                }
                if !candidate_groups.is_empty() {
                    write!(
                        attrs,
                        r#" activiti:candidateGroups="{}""#,
                        xml_escape(&candidate_groups.join(","))
                    )?;
                }
                writeln!(xml, r#"    <userTask id="{}"{} />"#, id, attrs)?;
            }
            EditorNode::ServiceTask { .. } => {
                writeln!(xml, r#"    <serviceTask id="{}"{} />"#, id, name_attr)?;
            }
            EditorNode::ExclusiveGateway { .. } => {
                let default_attr = xor_defaults
                    .get(id)
                    .map(|fid| format!(r#" default="{}""#, fid))
                    .unwrap_or_default();
                writeln!(
                    xml,
                    r#"    <exclusiveGateway id="{}"{}{} />"#,
                    id, name_attr, default_attr
                )?;
            }
            EditorNode::ParallelGateway { .. } => {
                writeln!(xml, r#"    <parallelGateway id="{}"{} />"#, id, name_attr)?;
            }
        }
    }

    // ── Sequence flows ──
    for (edge, flow_id) in graph.edges.iter().zip(&flow_ids) {
        if let Some(cond) = &edge.condition {
            writeln!(
                xml,
                r#"    <sequenceFlow id="{}" sourceRef="{}" targetRef="{}">
      <conditionExpression><![CDATA[{}]]></conditionExpression>
    </sequenceFlow>"#,
                flow_id, edge.from, edge.to, cond
            )?;
        } else {
            writeln!(
                xml,
                r#"    <sequenceFlow id="{}" sourceRef="{}" targetRef="{}" />"#,
                flow_id, edge.from, edge.to
            )?;
        }
    }

    writeln!(xml, r#"  </process>"#)?;

    // ── BPMN DI ──
    writeln!(
        xml,
        r#"  <bpmndi:BPMNDiagram id="BPMNDiagram_{}">"#,
        process_id
    )?;
    writeln!(
        xml,
        r#"    <bpmndi:BPMNPlane id="BPMNPlane_{}" bpmnElement="{}">"#,
        process_id, process_id
    )?;

    let mut boxes: HashMap<&str, (f64, f64, f64, f64)> = HashMap::new();
    for node in &graph.nodes {
        let (x, y) = positions.get(node.id()).copied().unwrap_or((MARGIN, MARGIN));
        let (w, h) = shape_size(node);
        let y = y + (ROW_HEIGHT - h) / 2.0;
        boxes.insert(node.id(), (x, y, w, h));
        writeln!(
            xml,
            r#"      <bpmndi:BPMNShape id="{}_di" bpmnElement="{}">
        <omgdc:Bounds x="{:.0}" y="{:.0}" width="{:.0}" height="{:.0}" />
      </bpmndi:BPMNShape>"#,
            node.id(),
            node.id(),
            x,
            y,
            w,
            h
        )?;
    }

    // Edges: right-middle of source to left-middle of target
    for (edge, flow_id) in graph.edges.iter().zip(&flow_ids) {
        let (Some(&(x1, y1, w1, h1)), Some(&(x2, y2, _, h2))) =
            (boxes.get(edge.from.as_str()), boxes.get(edge.to.as_str()))
        else {
            continue;
        };
        writeln!(
            xml,
            r#"      <bpmndi:BPMNEdge id="{}_di" bpmnElement="{}">
        <omgdi:waypoint x="{:.0}" y="{:.0}" />
        <omgdi:waypoint x="{:.0}" y="{:.0}" />
      </bpmndi:BPMNEdge>"#,
            flow_id,
            flow_id,
            x1 + w1,
            y1 + h1 / 2.0,
            x2,
            y2 + h2 / 2.0
        )?;
    }

    writeln!(xml, r#"    </bpmndi:BPMNPlane>"#)?;
    writeln!(xml, r#"  </bpmndi:BPMNDiagram>"#)?;
    writeln!(xml, r#"</definitions>"#)?;

    Ok(xml)
}

// ── Internal helpers ──

/// `flow_<from>_to_<to>`; a short hash disambiguates ids that would collide
/// after sanitizing.
fn compute_flow_ids(graph: &EditorGraph) -> Vec<String> {
    let mut used: HashMap<String, usize> = HashMap::new();
    graph
        .edges
        .iter()
        .map(|edge| {
            let base = format!(
                "flow_{}_to_{}",
                sanitize_ncname(&edge.from),
                sanitize_ncname(&edge.to)
            );
            let n = used.entry(base.clone()).or_insert(0);
            *n += 1;
            if *n == 1 {
                base
            } else {
                format!("{}_{}", base, short_hash(&format!("{}#{}", base, n)))
            }
        })
        .collect()
}

/// Sanitize a string to be a valid XML NCName: start with letter or underscore,
/// then alphanumeric, underscore, hyphen, or period.
fn sanitize_ncname(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for (i, ch) in s.chars().enumerate() {
        if i == 0 {
            if ch.is_ascii_alphabetic() || ch == '_' {
                result.push(ch);
            } else {
                result.push('_');
                if ch.is_ascii_alphanumeric() {
                    result.push(ch);
                }
            }
        } else if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '.' {
            result.push(ch);
        } else {
            result.push('_');
        }
    }
    if result.is_empty() {
        result.push_str("_id");
    }
    result
}

/// First 4 bytes (8 hex chars) of the SHA-256 hash.
fn short_hash(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    let result = hasher.finalize();
    hex_encode(&result[..4])
}

pub(crate) fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Left-to-right layered layout.
///
/// Acyclic graphs use longest-path ranks over a topological order; graphs with
/// loops (rework edges) fall back to shortest distance from the start event.
/// Within a rank, nodes keep their declaration order top to bottom.
fn layered_layout(graph: &EditorGraph) -> HashMap<String, (f64, f64)> {
    let mut g: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for node in &graph.nodes {
        index.entry(node.id()).or_insert_with(|| g.add_node(node.id()));
    }
    for edge in &graph.edges {
        if let (Some(&a), Some(&b)) = (index.get(edge.from.as_str()), index.get(edge.to.as_str())) {
            g.add_edge(a, b, ());
        }
    }

    let mut rank: HashMap<NodeIndex, usize> = HashMap::new();
    match toposort(&g, None) {
        Ok(order) => {
            for n in order {
                let r = rank.get(&n).copied().unwrap_or(0);
                rank.entry(n).or_insert(r);
                for succ in g.neighbors(n) {
                    let entry = rank.entry(succ).or_insert(0);
                    *entry = (*entry).max(r + 1);
                }
            }
        }
        Err(_) => {
            let start = graph
                .nodes
                .iter()
                .find(|n| matches!(n, EditorNode::StartEvent { .. }))
                .and_then(|n| index.get(n.id()).copied());
            if let Some(start) = start {
                for (n, d) in dijkstra(&g, start, None, |_| 1usize) {
                    rank.insert(n, d);
                }
            }
        }
    }

    // Unreachable nodes go one column past the rest.
    let overflow = rank.values().copied().max().map_or(0, |m| m + 1);
    let mut rows: HashMap<usize, usize> = HashMap::new();
    let mut positions = HashMap::new();
    for node in &graph.nodes {
        let Some(&idx) = index.get(node.id()) else {
            continue;
        };
        if positions.contains_key(node.id()) {
            continue;
        }
        let r = rank.get(&idx).copied().unwrap_or(overflow);
        let row = rows.entry(r).or_insert(0);
        let x = MARGIN + (r as f64) * RANK_SPACING;
        let y = MARGIN + (*row as f64) * ROW_SPACING;
        *row += 1;
        positions.insert(node.id().to_string(), (x, y));
    }
    positions
}

fn shape_size(node: &EditorNode) -> (f64, f64) {
    match node {
        EditorNode::StartEvent { .. } | EditorNode::EndEvent { .. } => (36.0, 36.0),
        EditorNode::ExclusiveGateway { .. } | EditorNode::ParallelGateway { .. } => (50.0, 50.0),
        _ => (100.0, 80.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpmn_xml::parse_definitions;
    use crate::types::NodeKind;

    fn leave_graph() -> EditorGraph {
        serde_json::from_str(
            r#"{"nodes":[
                {"kind":"StartEvent","id":"start"},
                {"kind":"UserTask","id":"fill_form","name":"Fill in request","assignee":"${initiator}"},
                {"kind":"ExclusiveGateway","id":"long_leave"},
                {"kind":"UserTask","id":"approve","name":"Manager approval","candidateGroups":["managers","hr"]},
                {"kind":"EndEvent","id":"end"}],
               "edges":[
                {"from":"start","to":"fill_form"},
                {"from":"fill_form","to":"long_leave"},
                {"from":"long_leave","to":"approve","condition":"${form.days > 1}"},
                {"from":"long_leave","to":"end","isDefault":true},
                {"from":"approve","to":"end"}]}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_export_parses_back() {
        let xml = graph_to_bpmn_xml(&leave_graph(), "leave-request", "Leave & Travel").unwrap();
        assert!(xml.contains(r#"name="Leave &amp; Travel""#));
        assert!(xml.contains(r#"activiti:candidateGroups="managers,hr""#));
        assert!(xml.contains(r#"default="flow_long_leave_to_end""#));

        let defs = parse_definitions(&xml).unwrap();
        let p = &defs.processes[0];
        assert_eq!(p.key, "leave-request");
        assert_eq!(p.node("fill_form").unwrap().kind, NodeKind::UserTask);
        assert_eq!(
            p.node("fill_form").unwrap().assignee.as_deref(),
            Some("${initiator}")
        );
        assert_eq!(
            p.node("long_leave").unwrap().default_flow.as_deref(),
            Some("flow_long_leave_to_end")
        );
        assert!(p
            .flows
            .iter()
            .any(|f| f.id == "flow_long_leave_to_approve" && f.condition.is_some()));

        let layout = defs.layout_for(p, "leave-request:1:x");
        assert!(layout.nodes.iter().all(|n| n.bounds.is_some()));
        assert!(layout.edges.iter().all(|e| e.waypoints.len() == 2));
    }

    #[test]
    fn test_layout_ranks_left_to_right() {
        let positions = layered_layout(&leave_graph());
        let x = |id: &str| positions[id].0;
        assert!(x("start") < x("fill_form"));
        assert!(x("fill_form") < x("long_leave"));
        assert!(x("long_leave") < x("approve"));
        // Longest path puts the end after the approval, not beside it.
        assert!(x("approve") < x("end"));
    }

    #[test]
    fn test_layout_handles_loops() {
        let g: EditorGraph = serde_json::from_str(
            r#"{"nodes":[
                {"kind":"StartEvent","id":"s"},
                {"kind":"UserTask","id":"work"},
                {"kind":"ExclusiveGateway","id":"ok"},
                {"kind":"EndEvent","id":"e"}],
               "edges":[
                {"from":"s","to":"work"},
                {"from":"work","to":"ok"},
                {"from":"ok","to":"work","condition":"${!done}"},
                {"from":"ok","to":"e","isDefault":true}]}"#,
        )
        .unwrap();
        let positions = layered_layout(&g);
        assert_eq!(positions.len(), 4);
        assert!(positions["s"].0 < positions["work"].0);
        assert!(positions["ok"].0 < positions["e"].0);
    }

    #[test]
    fn test_sanitize_ncname() {
        assert_eq!(sanitize_ncname("leave-request"), "leave-request");
        assert_eq!(sanitize_ncname("1st key"), "_1st_key");
        assert_eq!(sanitize_ncname(""), "_id");
    }
}
