//! Model authoring: the editor graph a model is saved as, its validation
//! rules, and conversion to deployable BPMN 2.0 XML.

pub mod dto;
pub mod export_bpmn;
pub mod validate;

pub use dto::{EditorEdge, EditorGraph, EditorNode};
pub use export_bpmn::graph_to_bpmn_xml;
pub use validate::{validate_graph, ValidationError};
