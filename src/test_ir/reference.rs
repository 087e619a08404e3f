// This module evaluates a program graph directly, without generating code, so lowering and
// control-flow emission can be checked against an independent oracle. Every value is a
// four-wide slot; operands read through their swizzle and sign and results land in the
// destination's mask components in order. Control flow follows the graph's edges: the
// first conditional successor whose scalar is positive wins, otherwise the follower. The
// same inputs can be pushed through a generated program on the virtual machine, with the
// binding report translating value names to hardware bindings and texture units, so tests
// compare two outcomes keyed by value name.

//! Reference evaluator for program graphs.

use hashbrown::HashMap;

use crate::codegen::GeneratedProgram;
use crate::graph::{NodeId, Op, Operand, ProgramGraph, ResultShape, Statement, TextureDims, ValueKind};

use super::machine::{lit, MachineInputs, MachineProgram, STEP_LIMIT};

/// Values fed to an evaluation, keyed by value name.
pub struct RefInputs<'a> {
    pub values: HashMap<String, Vec<f32>>,
    /// Texture name and coordinate to expanded RGBA. Coordinates are
    /// normalized except for RECT textures, which take texel units.
    pub sampler: &'a dyn Fn(&str, [f32; 4]) -> [f32; 4],
}

fn no_texture(_name: &str, _coord: [f32; 4]) -> [f32; 4] {
    [0.0; 4]
}

impl Default for RefInputs<'_> {
    fn default() -> Self {
        Self {
            values: HashMap::new(),
            sampler: &no_texture,
        }
    }
}

impl<'a> RefInputs<'a> {
    pub fn with(mut self, name: &str, data: &[f32]) -> Self {
        self.values.insert(name.to_string(), data.to_vec());
        self
    }
}

/// Outputs of one evaluation, keyed by value name and trimmed to the value's size.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefOutcome {
    pub outputs: HashMap<String, Vec<f32>>,
    pub killed: bool,
}

impl RefOutcome {
    pub fn output(&self, name: &str) -> Option<&[f32]> {
        self.outputs.get(name).map(Vec::as_slice)
    }

    /// Largest component difference against `other`; kill status must agree.
    pub fn max_difference(&self, other: &RefOutcome) -> Result<f32, String> {
        if self.killed != other.killed {
            return Err(format!("kill mismatch: {} vs {}", self.killed, other.killed));
        }
        if self.killed {
            return Ok(0.0);
        }
        let mut worst = 0.0f32;
        for (name, mine) in &self.outputs {
            let theirs = other
                .outputs
                .get(name)
                .ok_or_else(|| format!("output {} missing", name))?;
            for (a, b) in mine.iter().zip(theirs) {
                worst = worst.max((a - b).abs());
            }
        }
        Ok(worst)
    }
}

/// Channel layout of a lookup result over the expanded RGBA.
fn channel_layout(channels: u8) -> &'static [usize] {
    match channels {
        1 => &[0],
        2 => &[0, 3],
        3 => &[0, 1, 2],
        _ => &[0, 1, 2, 3],
    }
}

fn comparison(b: bool) -> f32 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn linear(op: Op, s: &[f32]) -> f32 {
    let a = s[0];
    match op {
        Op::Asn => a,
        Op::Neg => -a,
        Op::Add => a + s[1],
        Op::Mul => a * s[1],
        Op::Div => a / s[1],
        Op::Slt => comparison(a < s[1]),
        Op::Sle => comparison(a <= s[1]),
        Op::Sgt => comparison(a > s[1]),
        Op::Sge => comparison(a >= s[1]),
        Op::Seq => comparison(a == s[1]),
        Op::Sne => comparison(a != s[1]),
        Op::Abs => a.abs(),
        Op::Acos => a.acos(),
        Op::Asin => a.asin(),
        Op::Atan => a.atan(),
        Op::Atan2 => a.atan2(s[1]),
        Op::Ceil => a.ceil(),
        Op::Cos => a.cos(),
        Op::Dx | Op::Dy => 0.0,
        Op::Exp => a.exp(),
        Op::Exp2 => a.exp2(),
        Op::Exp10 => 10f32.powf(a),
        Op::Flr => a.floor(),
        Op::Frac => a - a.floor(),
        Op::Log => a.ln(),
        Op::Log2 => a.log2(),
        Op::Log10 => a.log10(),
        Op::Lrp => a * s[1] + (1.0 - a) * s[2],
        Op::Mad => a * s[1] + s[2],
        Op::Max => a.max(s[1]),
        Op::Min => a.min(s[1]),
        Op::Mod => a - s[1] * (a / s[1]).trunc(),
        Op::Pow => a.powf(s[1]),
        Op::Rcp => 1.0 / a,
        Op::Rnd => (a + 0.5).floor(),
        Op::Rsq => 1.0 / a.sqrt(),
        Op::Sin => a.sin(),
        Op::Sgn => comparison(a > 0.0) - comparison(a < 0.0),
        Op::Sqrt => a.sqrt(),
        Op::Tan => a.tan(),
        Op::Cond => {
            if a > 0.0 {
                s[1]
            } else {
                s[2]
            }
        }
        _ => 0.0,
    }
}

struct Evaluator<'g, 'i> {
    graph: &'g ProgramGraph,
    inputs: &'g RefInputs<'i>,
    store: Vec<[f32; 4]>,
}

impl Evaluator<'_, '_> {
    fn read(&self, operand: &Operand) -> Vec<f32> {
        let slot = self.store[operand.value.index()];
        operand
            .swizzle
            .comps()
            .iter()
            .map(|c| {
                let v = slot[*c as usize];
                if operand.neg {
                    -v
                } else {
                    v
                }
            })
            .collect()
    }

    fn sample(&self, stmt: &Statement) -> Result<Vec<f32>, String> {
        let texture = self.graph.values().get(stmt.src[0].value);
        let info = texture
            .texture
            .ok_or_else(|| format!("{} samples non-texture {}", stmt.op, texture.name))?;
        let mut coord = [0.0; 4];
        for (i, v) in self.read(&stmt.src[1]).into_iter().enumerate().take(4) {
            coord[i] = v;
        }
        let rect = info.dims == TextureDims::Rect;
        let texel = stmt.op == Op::Texi;
        if rect != texel {
            for i in 0..2 {
                let extent = info.extent[i].max(1) as f32;
                coord[i] = if rect { coord[i] * extent } else { coord[i] / extent };
            }
        }
        let expanded = (self.inputs.sampler)(&texture.name, coord);
        Ok(channel_layout(info.channels)
            .iter()
            .map(|c| expanded[*c])
            .collect())
    }

    /// Result components of `stmt`, in destination mask order.
    fn compute(&self, stmt: &Statement, width: usize) -> Result<Vec<f32>, String> {
        let srcs: Vec<Vec<f32>> = stmt.src.iter().map(|s| self.read(s)).collect();
        let at = |s: &Vec<f32>, j: usize| if s.len() == 1 { s[0] } else { s[j.min(s.len() - 1)] };
        Ok(match stmt.op.info().shape {
            ResultShape::Linear => (0..width)
                .map(|j| {
                    let args: Vec<f32> = srcs.iter().map(|s| at(s, j)).collect();
                    linear(stmt.op, &args)
                })
                .collect(),
            ResultShape::Collecting => {
                let a = &srcs[0];
                let v = match stmt.op {
                    Op::Dot => {
                        let n = a.len().max(srcs[1].len());
                        (0..n).map(|j| at(a, j) * at(&srcs[1], j)).sum()
                    }
                    Op::Csum => a.iter().sum(),
                    _ => a.iter().product(),
                };
                vec![v]
            }
            ResultShape::Whole => {
                let a = &srcs[0];
                match stmt.op {
                    Op::Lit => {
                        let mut v = [0.0; 4];
                        for (i, c) in a.iter().enumerate().take(4) {
                            v[i] = *c;
                        }
                        lit(v).to_vec()
                    }
                    Op::Xpd => {
                        let b = &srcs[1];
                        vec![
                            a[1] * b[2] - a[2] * b[1],
                            a[2] * b[0] - a[0] * b[2],
                            a[0] * b[1] - a[1] * b[0],
                        ]
                    }
                    _ => {
                        let len = a.iter().map(|c| c * c).sum::<f32>().sqrt();
                        a.iter().map(|c| c / len).collect()
                    }
                }
            }
            ResultShape::Sample => self.sample(stmt)?,
            ResultShape::NoResult => Vec::new(),
        })
    }

    /// Execute one statement; returns true when the program was killed.
    fn execute(&mut self, stmt: &Statement) -> Result<bool, String> {
        if stmt.op == Op::Kil {
            return Ok(self.read(&stmt.src[0]).iter().any(|v| *v > 0.0));
        }
        let Some(dest) = &stmt.dest else {
            return Ok(false);
        };
        let mask = dest.swizzle.comps();
        let result = self.compute(stmt, mask.len())?;
        let slot = &mut self.store[dest.value.index()];
        for (j, comp) in mask.iter().enumerate() {
            if let Some(v) = result.get(j) {
                slot[*comp as usize] = *v;
            }
        }
        Ok(false)
    }

    fn next(&self, id: NodeId) -> Option<NodeId> {
        let node = self.graph.node(id);
        for edge in &node.succs {
            if self.read(&edge.cond).first().map_or(false, |v| *v > 0.0) {
                return Some(edge.target);
            }
        }
        node.follower
    }
}

/// Run `graph` from entry to exit.
pub fn evaluate(graph: &ProgramGraph, inputs: &RefInputs<'_>) -> Result<RefOutcome, String> {
    let mut store = vec![[0.0f32; 4]; graph.values().len()];
    for (id, value) in graph.values().iter() {
        let data = match value.kind {
            ValueKind::Input => inputs.values.get(&value.name).cloned(),
            ValueKind::Param | ValueKind::Const => value.data.clone(),
            _ => None,
        };
        if let Some(data) = data {
            for (i, v) in data.iter().enumerate().take(4) {
                store[id.index()][i] = *v;
            }
        }
    }
    let mut eval = Evaluator {
        graph,
        inputs,
        store,
    };

    let mut outcome = RefOutcome::default();
    let mut node = graph.entry();
    let mut steps = 0;
    loop {
        for stmt in graph.node(node).statements() {
            steps += 1;
            if eval.execute(stmt)? {
                outcome.killed = true;
                return Ok(outcome);
            }
        }
        if node == graph.exit() {
            break;
        }
        steps += 1;
        if steps > STEP_LIMIT {
            return Err(format!("step limit exceeded in {}", graph.node_name(node)));
        }
        node = eval
            .next(node)
            .ok_or_else(|| format!("{} has no successor", graph.node_name(node)))?;
    }

    for (id, value) in graph.values().of_kind(ValueKind::Output) {
        let slot = eval.store[id.index()];
        outcome
            .outputs
            .insert(value.name.clone(), slot[..value.size as usize].to_vec());
    }
    Ok(outcome)
}

/// Run a generated program on the virtual machine with the same inputs,
/// translating bindings back to value names.
pub fn run_generated(
    program: &GeneratedProgram,
    graph: &ProgramGraph,
    inputs: &RefInputs<'_>,
) -> Result<RefOutcome, String> {
    let machine = MachineProgram::parse(program.text())?;
    let report = program.report();

    let mut attribs = HashMap::new();
    for entry in &report.inputs {
        let value = entry.names.iter().find_map(|n| inputs.values.get(n));
        if let Some(data) = value {
            let mut padded = [0.0; 4];
            for (i, v) in data.iter().enumerate().take(4) {
                padded[i] = *v;
            }
            attribs.insert(entry.binding.clone(), padded);
        }
    }
    let units: HashMap<usize, String> = report
        .textures
        .iter()
        .filter_map(|e| Some((e.reg.index as usize, e.names.first()?.clone())))
        .collect();
    let sampler = |unit: usize, coord: [f32; 4]| match units.get(&unit) {
        Some(name) => (inputs.sampler)(name, coord),
        None => [0.0; 4],
    };
    let machine_inputs = MachineInputs {
        attribs,
        locals: program.constants(),
        sampler: &sampler,
    };
    let result = machine.run(&machine_inputs)?;

    let mut outcome = RefOutcome {
        outputs: HashMap::new(),
        killed: result.killed,
    };
    for entry in &report.outputs {
        let Some(reg) = result.output(&entry.binding) else {
            continue;
        };
        for name in &entry.names {
            let id = graph
                .values()
                .lookup(name)
                .ok_or_else(|| format!("report names unknown value {}", name))?;
            let size = graph.values().get(id).size as usize;
            let data = if entry.binding == "result.depth" {
                vec![reg[2]]
            } else {
                reg[..size].to_vec()
            };
            outcome.outputs.insert(name.clone(), data);
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_ir::parse_program;

    #[test]
    fn test_branch_selects_path() {
        let graph = parse_program(
            "program fragment
input %x : 4 @texcoord0
output %o : 4 @color
entry:
  %c = sgt %x.x, 0
  brc %c, ^pos
neg:
  %o = mov -%x
  br ^exit
pos:
  %o = mov %x
",
        )
        .unwrap();
        let out = evaluate(&graph, &RefInputs::default().with("x", &[1.0, 2.0, 3.0, 4.0])).unwrap();
        assert_eq!(out.output("o"), Some(&[1.0, 2.0, 3.0, 4.0][..]));
        let out = evaluate(&graph, &RefInputs::default().with("x", &[-1.0, 2.0, 3.0, 4.0])).unwrap();
        assert_eq!(out.output("o"), Some(&[1.0, -2.0, -3.0, -4.0][..]));
    }

    #[test]
    fn test_masks_and_kill() {
        let graph = parse_program(
            "program fragment
input %x : 4 @texcoord0
output %o : 4 @color
entry:
  %o = mov [0, 0, 0, 0]
  %o.yw = mov %x.zx
  %d = dot %x.xy, %x.xy
  %o.z = mov %d
  kil %x.w
",
        )
        .unwrap();
        let out = evaluate(&graph, &RefInputs::default().with("x", &[2.0, 3.0, 5.0, -1.0])).unwrap();
        assert!(!out.killed);
        assert_eq!(out.output("o"), Some(&[0.0, 5.0, 13.0, 2.0][..]));
        let out = evaluate(&graph, &RefInputs::default().with("x", &[2.0, 3.0, 5.0, 1.0])).unwrap();
        assert!(out.killed);
    }

    #[test]
    fn test_mod_truncates() {
        assert_eq!(linear(Op::Mod, &[-7.0, 3.0]), -1.0);
        assert_eq!(linear(Op::Mod, &[7.0, 3.0]), 1.0);
        assert_eq!(linear(Op::Rnd, &[2.5]), 3.0);
        assert_eq!(linear(Op::Sgn, &[0.0]), 0.0);
    }
}
