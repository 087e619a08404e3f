//! Human-readable views of a generated program's interface.

use std::fmt;

use crate::core::{AsmReg, RegClass};
use crate::graph::{ProgramGraph, ValueKind};

/// One bound register of the program interface.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingEntry {
    pub reg: AsmReg,
    /// Fixed-function binding or storage text, e.g. `fragment.texcoord[0]`.
    pub binding: String,
    /// Values bound to this register, first the owner, then aliases.
    pub names: Vec<String>,
}

/// Per-class register usage against the profile's capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassUsage {
    pub class: RegClass,
    pub used: usize,
    pub capacity: usize,
}

/// Binding report: which value ended up in which register.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingReport {
    pub inputs: Vec<BindingEntry>,
    pub outputs: Vec<BindingEntry>,
    pub params: Vec<BindingEntry>,
    pub constants: Vec<BindingEntry>,
    pub textures: Vec<BindingEntry>,
    pub usage: Vec<ClassUsage>,
}

impl BindingReport {
    pub fn entries(&self) -> impl Iterator<Item = &BindingEntry> {
        self.inputs
            .iter()
            .chain(&self.outputs)
            .chain(&self.params)
            .chain(&self.constants)
            .chain(&self.textures)
    }

    /// Register bound to the value named `name`.
    pub fn register_of(&self, name: &str) -> Option<AsmReg> {
        self.entries()
            .find(|e| e.names.iter().any(|n| n == name))
            .map(|e| e.reg)
    }

    pub fn usage_of(&self, class: RegClass) -> Option<ClassUsage> {
        self.usage.iter().find(|u| u.class == class).copied()
    }
}

impl fmt::Display for BindingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sections = [
            ("inputs", &self.inputs),
            ("outputs", &self.outputs),
            ("params", &self.params),
            ("constants", &self.constants),
            ("textures", &self.textures),
        ];
        for (title, entries) in sections {
            if entries.is_empty() {
                continue;
            }
            writeln!(f, "{}:", title)?;
            for entry in entries {
                write!(f, "  {} = {}", entry.reg, entry.binding)?;
                if !entry.names.is_empty() {
                    write!(f, " ({})", entry.names.join(", "))?;
                }
                writeln!(f)?;
            }
        }
        writeln!(f, "usage:")?;
        for u in &self.usage {
            if u.used > 0 || u.capacity > 0 {
                writeln!(f, "  {}: {}/{}", u.class, u.used, u.capacity)?;
            }
        }
        Ok(())
    }
}

/// The declared interface of a program, one value per line.
pub fn describe_interface(graph: &ProgramGraph) -> String {
    let mut out = format!("program {}\n", graph.kind.name());
    for kind in [
        ValueKind::Input,
        ValueKind::Output,
        ValueKind::Param,
        ValueKind::Const,
        ValueKind::Texture,
    ] {
        for (_, value) in graph.values().of_kind(kind) {
            out.push_str(&format!("{} {} : {}", kind.name(), value.name, value.size));
            if let Some(sem) = value.semantic {
                out.push_str(&format!(" @{}", sem));
            }
            if let Some(data) = &value.data {
                let items: Vec<String> = data.iter().map(|v| v.to_string()).collect();
                out.push_str(&format!(" = [{}]", items.join(", ")));
            }
            if let Some(tex) = value.texture {
                out.push_str(&format!(" {} x{}", tex.dims.target_name(), tex.channels));
            }
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ProgramKind, Semantic, SemanticKind, Value};

    #[test]
    fn test_describe_interface() {
        let mut graph = ProgramGraph::new(ProgramKind::Fragment);
        graph.values_mut().add(
            Value::input("uv", 2).with_semantic(Semantic::indexed(SemanticKind::TexCoord, 0)),
        );
        graph.values_mut().add(Value::output("color", 4));
        graph.values_mut().add(Value::param("scale", &[2.0]));
        graph.values_mut().add(Value::temp("t", 4));
        let text = describe_interface(&graph);
        assert_eq!(
            text,
            "program fragment\ninput uv : 2 @texcoord0\noutput color : 4\nparam scale : 1 = [2]\n"
        );
    }

    #[test]
    fn test_report_lookup_and_display() {
        let report = BindingReport {
            inputs: vec![BindingEntry {
                reg: AsmReg::new(RegClass::Input, 0),
                binding: "fragment.color".into(),
                names: vec!["a".into(), "b".into()],
            }],
            usage: vec![ClassUsage {
                class: RegClass::Temp,
                used: 2,
                capacity: 32,
            }],
            ..Default::default()
        };
        assert_eq!(report.register_of("b"), Some(AsmReg::new(RegClass::Input, 0)));
        assert_eq!(report.register_of("c"), None);
        let text = report.to_string();
        assert!(text.contains("i0 = fragment.color (a, b)"));
        assert!(text.contains("temp: 2/32"));
    }
}
