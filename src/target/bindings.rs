//! Fixed hardware bindings of inputs and outputs per program kind.
//!
//! Tagged values claim the slot of their semantic. Untagged values take the
//! next free slot of the first binding that accepts generic values.

use crate::graph::{ProgramKind, SemanticKind};

/// One family of bindings, e.g. the eight texture coordinate sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingSpec {
    pub semantic: SemanticKind,
    pub name: &'static str,
    pub slots: u8,
    /// Untagged values may be placed here.
    pub generic: bool,
}

const fn spec(semantic: SemanticKind, name: &'static str, slots: u8, generic: bool) -> BindingSpec {
    BindingSpec {
        semantic,
        name,
        slots,
        generic,
    }
}

static VERTEX_INPUTS: [BindingSpec; 5] = [
    spec(SemanticKind::Position, "vertex.position", 1, false),
    spec(SemanticKind::Normal, "vertex.normal", 1, false),
    spec(SemanticKind::Color, "vertex.color", 1, false),
    spec(SemanticKind::TexCoord, "vertex.texcoord", 8, true),
    spec(SemanticKind::Fog, "vertex.fogcoord", 1, true),
];

static FRAGMENT_INPUTS: [BindingSpec; 4] = [
    spec(SemanticKind::Position, "fragment.position", 1, false),
    spec(SemanticKind::Color, "fragment.color", 1, false),
    spec(SemanticKind::TexCoord, "fragment.texcoord", 8, true),
    spec(SemanticKind::Fog, "fragment.fogcoord", 1, true),
];

static VERTEX_OUTPUTS: [BindingSpec; 5] = [
    spec(SemanticKind::Position, "result.position", 1, false),
    spec(SemanticKind::Color, "result.color", 1, false),
    spec(SemanticKind::TexCoord, "result.texcoord", 8, true),
    spec(SemanticKind::Fog, "result.fogcoord", 1, true),
    spec(SemanticKind::PointSize, "result.pointsize", 1, true),
];

static FRAGMENT_OUTPUTS: [BindingSpec; 2] = [
    spec(SemanticKind::Color, "result.color", 1, true),
    spec(SemanticKind::Depth, "result.depth", 1, false),
];

pub fn input_bindings(kind: ProgramKind) -> &'static [BindingSpec] {
    match kind {
        ProgramKind::Vertex => &VERTEX_INPUTS,
        ProgramKind::Fragment => &FRAGMENT_INPUTS,
    }
}

pub fn output_bindings(kind: ProgramKind) -> &'static [BindingSpec] {
    match kind {
        ProgramKind::Vertex => &VERTEX_OUTPUTS,
        ProgramKind::Fragment => &FRAGMENT_OUTPUTS,
    }
}

/// Binding text for slot `slot` of `spec`.
pub fn binding_name(spec: &BindingSpec, slot: u8) -> String {
    if spec.slots > 1 {
        format!("{}[{}]", spec.name, slot)
    } else {
        spec.name.to_string()
    }
}
