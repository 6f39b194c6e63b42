//! BPMN 2.0 XML reader for the in-memory engine.
//!
//! Reads the executable subset (events, user/pass-through tasks, exclusive
//! and parallel gateways, sequence flows) plus BPMN DI geometry. Assignment
//! attributes are matched by local name so `activiti:`, `flowable:` and
//! `camunda:` prefixes all work.

use crate::expr::Condition;
use crate::types::{Bounds, DiagramLayout, LayoutEdge, LayoutNode, NodeKind, Point};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::{HashMap, HashSet};

/// Element names we recognise but refuse to execute.
const UNSUPPORTED: &[&str] = &[
    "subProcess",
    "adHocSubProcess",
    "transaction",
    "callActivity",
    "boundaryEvent",
    "intermediateCatchEvent",
    "intermediateThrowEvent",
    "inclusiveGateway",
    "eventBasedGateway",
    "complexGateway",
];

#[derive(Debug, Clone)]
pub struct FlowNode {
    pub id: String,
    pub name: Option<String>,
    pub kind: NodeKind,
    pub assignee: Option<String>,
    pub candidate_users: Option<String>,
    pub candidate_groups: Option<String>,
    /// Exclusive gateway default flow id.
    pub default_flow: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone)]
pub struct ParsedProcess {
    pub key: String,
    pub name: Option<String>,
    pub nodes: Vec<FlowNode>,
    pub flows: Vec<SequenceFlow>,
}

impl ParsedProcess {
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_event(&self) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.kind == NodeKind::StartEvent)
    }

    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a SequenceFlow> + 'a {
        self.flows.iter().filter(move |f| f.source == node_id)
    }

    pub fn incoming_count(&self, node_id: &str) -> usize {
        self.flows.iter().filter(|f| f.target == node_id).count()
    }

    fn check(&self) -> Result<(), String> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(format!("process '{}': duplicate element id '{}'", self.key, node.id));
            }
        }
        if self.start_event().is_none() {
            return Err(format!("process '{}' has no start event", self.key));
        }
        for flow in &self.flows {
            for end in [&flow.source, &flow.target] {
                if !ids.contains(end.as_str()) {
                    return Err(format!(
                        "process '{}': sequence flow '{}' references unknown element '{}'",
                        self.key, flow.id, end
                    ));
                }
            }
        }
        for node in &self.nodes {
            if let Some(default) = &node.default_flow {
                if !self.outgoing(&node.id).any(|f| &f.id == default) {
                    return Err(format!(
                        "process '{}': default flow '{}' is not an outgoing flow of '{}'",
                        self.key, default, node.id
                    ));
                }
            }
        }
        Ok(())
    }
}

/// All processes and diagram geometry found in one resource.
#[derive(Debug, Default)]
pub struct ParsedDefinitions {
    pub processes: Vec<ParsedProcess>,
    shapes: HashMap<String, Bounds>,
    edges: HashMap<String, Vec<Point>>,
}

impl ParsedDefinitions {
    pub fn layout_for(&self, process: &ParsedProcess, definition_id: &str) -> DiagramLayout {
        DiagramLayout {
            definition_id: definition_id.to_string(),
            nodes: process
                .nodes
                .iter()
                .map(|n| LayoutNode {
                    id: n.id.clone(),
                    name: n.name.clone(),
                    kind: n.kind,
                    bounds: self.shapes.get(&n.id).copied(),
                })
                .collect(),
            edges: process
                .flows
                .iter()
                .map(|f| LayoutEdge {
                    id: f.id.clone(),
                    source: f.source.clone(),
                    target: f.target.clone(),
                    waypoints: self.edges.get(&f.id).cloned().unwrap_or_default(),
                })
                .collect(),
        }
    }
}

fn node_kind(local_name: &str) -> Option<NodeKind> {
    Some(match local_name {
        "startEvent" => NodeKind::StartEvent,
        "endEvent" => NodeKind::EndEvent,
        "userTask" => NodeKind::UserTask,
        "serviceTask" | "sendTask" | "businessRuleTask" => NodeKind::ServiceTask,
        "scriptTask" => NodeKind::ScriptTask,
        "task" | "manualTask" | "receiveTask" => NodeKind::ManualTask,
        "exclusiveGateway" => NodeKind::ExclusiveGateway,
        "parallelGateway" => NodeKind::ParallelGateway,
        _ => return None,
    })
}

fn attributes(e: &BytesStart<'_>) -> Result<HashMap<String, String>, String> {
    let mut out = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| format!("malformed attribute: {err}"))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| format!("malformed attribute value: {err}"))?
            .into_owned();
        out.insert(key, value);
    }
    Ok(out)
}

fn required(attrs: &HashMap<String, String>, element: &str, name: &str) -> Result<String, String> {
    attrs
        .get(name)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| format!("<{element}> is missing attribute '{name}'"))
}

fn coord(attrs: &HashMap<String, String>, name: &str) -> Result<f64, String> {
    attrs
        .get(name)
        .ok_or_else(|| format!("diagram element is missing '{name}'"))?
        .parse::<f64>()
        .map_err(|err| format!("diagram attribute '{name}': {err}"))
}

/// Parse a BPMN 2.0 XML document.
pub fn parse_definitions(xml: &str) -> Result<ParsedDefinitions, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut out = ParsedDefinitions::default();
    let mut process: Option<ParsedProcess> = None;
    let mut flow_idx: Option<usize> = None;
    let mut condition: Option<String> = None;
    let mut shape: Option<String> = None;
    let mut edge: Option<String> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|err| format!("XML error at byte {}: {err}", reader.buffer_position()))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_open = matches!(event, Event::Start(_));
                let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                let attrs = attributes(e)?;

                match local.as_str() {
                    "process" => {
                        let p = ParsedProcess {
                            key: required(&attrs, "process", "id")?,
                            name: attrs.get("name").cloned(),
                            nodes: Vec::new(),
                            flows: Vec::new(),
                        };
                        if is_open {
                            process = Some(p);
                        } else {
                            out.processes.push(p);
                        }
                    }
                    "sequenceFlow" => {
                        if let Some(p) = process.as_mut() {
                            p.flows.push(SequenceFlow {
                                id: required(&attrs, "sequenceFlow", "id")?,
                                source: required(&attrs, "sequenceFlow", "sourceRef")?,
                                target: required(&attrs, "sequenceFlow", "targetRef")?,
                                condition: None,
                            });
                            flow_idx = is_open.then(|| p.flows.len() - 1);
                        }
                    }
                    "conditionExpression" if flow_idx.is_some() && is_open => {
                        condition = Some(String::new());
                    }
                    "BPMNShape" => {
                        let id = required(&attrs, "BPMNShape", "bpmnElement")?;
                        shape = is_open.then_some(id);
                    }
                    "Bounds" => {
                        if let Some(id) = &shape {
                            let bounds = Bounds {
                                x: coord(&attrs, "x")?,
                                y: coord(&attrs, "y")?,
                                width: coord(&attrs, "width")?,
                                height: coord(&attrs, "height")?,
                            };
                            out.shapes.insert(id.clone(), bounds);
                        }
                    }
                    "BPMNEdge" => {
                        let id = required(&attrs, "BPMNEdge", "bpmnElement")?;
                        out.edges.insert(id.clone(), Vec::new());
                        edge = is_open.then_some(id);
                    }
                    "waypoint" => {
                        if let Some(points) = edge.as_ref().and_then(|id| out.edges.get_mut(id)) {
                            points.push(Point {
                                x: coord(&attrs, "x")?,
                                y: coord(&attrs, "y")?,
                            });
                        }
                    }
                    name if process.is_some() && UNSUPPORTED.contains(&name) => {
                        return Err(format!("unsupported BPMN element <{name}>"));
                    }
                    name => {
                        if let (Some(kind), Some(p)) = (node_kind(name), process.as_mut()) {
                            p.nodes.push(FlowNode {
                                id: required(&attrs, name, "id")?,
                                name: attrs.get("name").cloned(),
                                kind,
                                assignee: attrs.get("assignee").cloned(),
                                candidate_users: attrs.get("candidateUsers").cloned(),
                                candidate_groups: attrs.get("candidateGroups").cloned(),
                                default_flow: attrs.get("default").cloned(),
                            });
                        }
                    }
                }
            }
            Event::Text(t) => {
                if let Some(buf) = condition.as_mut() {
                    let text = t
                        .unescape()
                        .map_err(|err| format!("malformed condition text: {err}"))?;
                    buf.push_str(&text);
                }
            }
            Event::CData(c) => {
                if let Some(buf) = condition.as_mut() {
                    buf.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"process" => {
                    if let Some(p) = process.take() {
                        out.processes.push(p);
                    }
                }
                b"sequenceFlow" => flow_idx = None,
                b"conditionExpression" => {
                    if let (Some(raw), Some(idx), Some(p)) =
                        (condition.take(), flow_idx, process.as_mut())
                    {
                        let raw = raw.trim();
                        if !raw.is_empty() {
                            let parsed = Condition::parse(raw).map_err(|err| {
                                format!("sequence flow '{}': {err}", p.flows[idx].id)
                            })?;
                            p.flows[idx].condition = Some(parsed);
                        }
                    }
                }
                b"BPMNShape" => shape = None,
                b"BPMNEdge" => edge = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if out.processes.is_empty() {
        return Err("no process definitions found".to_string());
    }
    for p in &out.processes {
        p.check()?;
    }
    Ok(out)
}
