use super::dto::*;
use crate::expr::Condition;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

fn error(rule: &str, message: String) -> ValidationError {
    ValidationError {
        rule: rule.to_string(),
        message,
    }
}

/// Valid XML NCName restricted to ASCII; node ids become BPMN element ids verbatim.
fn is_ncname(id: &str) -> bool {
    let mut chars = id.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Validate an editor graph before conversion. Returns all errors found.
pub fn validate_graph(graph: &EditorGraph) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let mut node_map: HashMap<&str, &EditorNode> = HashMap::new();
    let mut outgoing: HashMap<&str, Vec<&EditorEdge>> = HashMap::new();

    // V1: Node ids must be unique
    for node in &graph.nodes {
        let id = node.id();
        if node_map.insert(id, node).is_some() {
            errors.push(error("V1", format!("Duplicate node id: {}", id)));
        }
    }

    // V2: Node ids must be usable as BPMN element ids
    for node in &graph.nodes {
        if !is_ncname(node.id()) {
            errors.push(error("V2", format!("Node id is not a valid XML name: '{}'", node.id())));
        }
    }

    // V3: Edges reference existing nodes
    for edge in &graph.edges {
        for (end, label) in [(&edge.from, "from"), (&edge.to, "to")] {
            if !node_map.contains_key(end.as_str()) {
                errors.push(error(
                    "V3",
                    format!("Edge {}→{}: '{}' node '{}' does not exist", edge.from, edge.to, label, end),
                ));
            }
        }
        outgoing.entry(edge.from.as_str()).or_default().push(edge);
    }

    // V4: No duplicate edges (flow ids are derived from the endpoints)
    let mut seen = HashSet::new();
    for edge in &graph.edges {
        if !seen.insert((edge.from.as_str(), edge.to.as_str())) {
            errors.push(error("V4", format!("Duplicate edge {}→{}", edge.from, edge.to)));
        }
    }

    // V5: Exactly one start event
    let start_count = graph
        .nodes
        .iter()
        .filter(|n| matches!(n, EditorNode::StartEvent { .. }))
        .count();
    if start_count != 1 {
        errors.push(error(
            "V5",
            format!("Expected exactly one StartEvent, found {}", start_count),
        ));
    }

    // V6: At least one end event
    if !graph
        .nodes
        .iter()
        .any(|n| matches!(n, EditorNode::EndEvent { .. }))
    {
        errors.push(error("V6", "No EndEvent found".to_string()));
    }

    // V7: Every non-end node has an outgoing edge
    for node in &graph.nodes {
        if !matches!(node, EditorNode::EndEvent { .. }) && !outgoing.contains_key(node.id()) {
            errors.push(error("V7", format!("Node {} has no outgoing edge", node.id())));
        }
    }

    // V8: Exclusive gateway has at most one default edge
    for node in &graph.nodes {
        if let EditorNode::ExclusiveGateway { id, .. } = node {
            let defaults = outgoing
                .get(id.as_str())
                .map(|edges| edges.iter().filter(|e| e.is_default).count())
                .unwrap_or(0);
            if defaults > 1 {
                errors.push(error(
                    "V8",
                    format!("ExclusiveGateway {}: {} default edges, at most one allowed", id, defaults),
                ));
            }
        }
    }

    // V9: Default flag only on exclusive gateway edges, never with a condition
    for edge in &graph.edges {
        if !edge.is_default {
            continue;
        }
        if edge.condition.is_some() {
            errors.push(error(
                "V9",
                format!("Edge {}→{}: condition and isDefault are mutually exclusive", edge.from, edge.to),
            ));
        }
        if !matches!(
            node_map.get(edge.from.as_str()),
            Some(EditorNode::ExclusiveGateway { .. }) | None
        ) {
            errors.push(error(
                "V9",
                format!("Edge {}→{}: isDefault is only valid on an ExclusiveGateway", edge.from, edge.to),
            ));
        }
    }

    // V10: Conditions parse
    for edge in &graph.edges {
        if let Some(cond) = &edge.condition {
            if let Err(e) = Condition::parse(cond) {
                errors.push(error("V10", format!("Edge {}→{}: {}", edge.from, edge.to, e)));
            }
        }
    }

    // V11: Start event has no incoming edge
    for edge in &graph.edges {
        if matches!(
            node_map.get(edge.to.as_str()),
            Some(EditorNode::StartEvent { .. })
        ) {
            errors.push(error(
                "V11",
                format!("Edge {}→{}: StartEvent cannot have incoming edges", edge.from, edge.to),
            ));
        }
    }

    errors
}
