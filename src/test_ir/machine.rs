// This module implements a small virtual device for generated assembly. MachineProgram
// parses program text the way a driver would (header, declarations, instructions, labels),
// matching IF/ELSE/ENDIF and REP/BRK/ENDREP brackets and resolving labels up front.
// Execution follows the target's positional semantics: every source is swizzled to four
// components, the opcode computes four results and the write mask (and an optional
// condition-code test) decides which land. Condition codes are tracked per component;
// KIL stops the program. A step budget turns runaway loops into errors. VirtualDevice
// implements the Uploader seam on top of it so life-cycle tests can upload programs,
// update parameters and run them.

//! Interpreter for generated assembly text.

use hashbrown::HashMap;
use log::trace;

use crate::codegen::{ProgramHandle, UploadError, Uploader};
use crate::graph::TextureDims;

/// Instructions executed before a run is declared runaway.
pub const STEP_LIMIT: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Rel {
    Gt,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CcTest {
    rel: Rel,
    comp: Option<usize>,
}

impl CcTest {
    fn holds(&self, cc: &[f32; 4], position: usize) -> bool {
        let v = cc[self.comp.unwrap_or(position)];
        match self.rel {
            Rel::Gt => v > 0.0,
            Rel::Le => v <= 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct SrcOp {
    reg: usize,
    sel: [usize; 4],
    neg: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct DstOp {
    reg: usize,
    mask: [bool; 4],
}

#[derive(Debug, Clone, PartialEq)]
struct MInst {
    op: String,
    update_cc: bool,
    dest: Option<DstOp>,
    cc: Option<CcTest>,
    srcs: Vec<SrcOp>,
    texture: Option<(usize, TextureDims)>,
    jump: usize,
    label: Option<String>,
}

/// Parsed program text.
#[derive(Debug, Clone)]
pub struct MachineProgram {
    pub header: String,
    pub option: Option<String>,
    registers: HashMap<String, usize>,
    /// Register slot and binding text of each ATTRIB.
    attribs: Vec<(usize, String)>,
    outputs: Vec<(usize, String)>,
    locals: Vec<(usize, usize)>,
    constants: Vec<(usize, [f32; 4])>,
    code: Vec<MInst>,
}

/// Result of one program run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    /// Output binding (e.g. `result.color`) to value.
    pub outputs: HashMap<String, [f32; 4]>,
    pub killed: bool,
    pub steps: usize,
}

impl Outcome {
    pub fn output(&self, binding: &str) -> Option<[f32; 4]> {
        self.outputs.get(binding).copied()
    }
}

/// Values fed to a run.
pub struct MachineInputs<'a> {
    /// Attribute binding text (e.g. `fragment.texcoord[0]`) to value.
    pub attribs: HashMap<String, [f32; 4]>,
    pub locals: Vec<[f32; 4]>,
    /// Texture unit and coordinate to expanded RGBA.
    pub sampler: &'a dyn Fn(usize, [f32; 4]) -> [f32; 4],
}

fn no_texture(_unit: usize, _coord: [f32; 4]) -> [f32; 4] {
    [0.0; 4]
}

impl Default for MachineInputs<'_> {
    fn default() -> Self {
        Self {
            attribs: HashMap::new(),
            locals: Vec::new(),
            sampler: &no_texture,
        }
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(i) => &line[..i],
        None => line,
    }
    .trim()
}

fn component(c: char) -> Result<usize, String> {
    match c {
        'x' => Ok(0),
        'y' => Ok(1),
        'z' => Ok(2),
        'w' => Ok(3),
        _ => Err(format!("bad component '{}'", c)),
    }
}

fn arity(op: &str) -> Option<usize> {
    Some(match op {
        "ABS" | "COS" | "EX2" | "FLR" | "FRC" | "LG2" | "LIT" | "MOV" | "RCP" | "RSQ" | "SIN"
        | "SSG" | "DDX" | "DDY" | "NRM" | "TEX" => 1,
        "ADD" | "DP2" | "DP3" | "DP4" | "MAX" | "MIN" | "MUL" | "POW" | "SGE" | "SLT" | "SUB"
        | "XPD" | "SEQ" | "SGT" | "SLE" | "SNE" => 2,
        "CMP" | "LRP" | "MAD" => 3,
        _ => return None,
    })
}

fn parse_cc(text: &str) -> Result<CcTest, String> {
    let (rel, comp) = match text.split_once('.') {
        Some((rel, comp)) => (rel, Some(comp)),
        None => (text, None),
    };
    let rel = match rel {
        "GT" => Rel::Gt,
        "LE" => Rel::Le,
        other => return Err(format!("unknown condition '{}'", other)),
    };
    let comp = match comp {
        Some(c) => Some(component(c.chars().next().ok_or("empty condition component")?)?),
        None => None,
    };
    Ok(CcTest { rel, comp })
}

fn parse_float_list(text: &str) -> Result<[f32; 4], String> {
    let inner = text
        .trim()
        .strip_prefix('{')
        .and_then(|t| t.strip_suffix('}'))
        .ok_or_else(|| format!("bad constant '{}'", text))?;
    let mut out = [0.0; 4];
    for (i, item) in inner.split(',').enumerate() {
        if i >= 4 {
            return Err(format!("constant '{}' has too many components", text));
        }
        out[i] = item
            .trim()
            .parse()
            .map_err(|e| format!("bad number '{}': {}", item.trim(), e))?;
    }
    Ok(out)
}

impl MachineProgram {
    /// Parse program text, as an uploader would before accepting it.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut lines = text.lines().map(strip_comment).filter(|l| !l.is_empty());
        let header = lines.next().ok_or("empty program")?.to_string();
        if header != "!!ARBfp1.0" && header != "!!ARBvp1.0" {
            return Err(format!("unknown header '{}'", header));
        }
        let mut program = MachineProgram {
            header,
            option: None,
            registers: HashMap::new(),
            attribs: Vec::new(),
            outputs: Vec::new(),
            locals: Vec::new(),
            constants: Vec::new(),
            code: Vec::new(),
        };
        let mut labels: HashMap<String, usize> = HashMap::new();
        let mut ended = false;

        for line in lines {
            if ended {
                return Err(format!("text after END: '{}'", line));
            }
            if line == "END" {
                ended = true;
                continue;
            }
            if let Some(label) = line.strip_suffix(':') {
                labels.insert(label.to_string(), program.code.len());
                continue;
            }
            let body = line
                .strip_suffix(';')
                .ok_or_else(|| format!("missing ';' in '{}'", line))?;
            let (word, rest) = body.split_once(' ').unwrap_or((body, ""));
            match word {
                "OPTION" => program.option = Some(rest.trim().to_string()),
                "ATTRIB" | "OUTPUT" | "PARAM" => program.declare(word, rest)?,
                "TEMP" => program.declare_temps(rest)?,
                "SHORT" => {
                    let names = rest
                        .strip_prefix("TEMP ")
                        .ok_or_else(|| format!("bad declaration '{}'", line))?;
                    program.declare_temps(names)?;
                }
                _ => {
                    let inst = program.parse_instruction(word, rest)?;
                    program.code.push(inst);
                }
            }
        }
        if !ended {
            return Err("missing END".to_string());
        }
        program.resolve(&labels)?;
        Ok(program)
    }

    fn new_register(&mut self, name: &str) -> Result<usize, String> {
        if self.registers.contains_key(name) {
            return Err(format!("register {} declared twice", name));
        }
        let slot = self.registers.len();
        self.registers.insert(name.to_string(), slot);
        Ok(slot)
    }

    fn declare(&mut self, word: &str, rest: &str) -> Result<(), String> {
        let (name, binding) = rest
            .split_once('=')
            .ok_or_else(|| format!("bad declaration '{} {}'", word, rest))?;
        let slot = self.new_register(name.trim())?;
        let binding = binding.trim().to_string();
        match word {
            "ATTRIB" => self.attribs.push((slot, binding)),
            "OUTPUT" => self.outputs.push((slot, binding)),
            _ => {
                if let Some(index) = binding
                    .strip_prefix("program.local[")
                    .and_then(|b| b.strip_suffix(']'))
                {
                    let index = index
                        .parse()
                        .map_err(|e| format!("bad local index '{}': {}", index, e))?;
                    self.locals.push((slot, index));
                } else {
                    self.constants.push((slot, parse_float_list(&binding)?));
                }
            }
        }
        Ok(())
    }

    fn declare_temps(&mut self, names: &str) -> Result<(), String> {
        for name in names.split(',') {
            self.new_register(name.trim())?;
        }
        Ok(())
    }

    fn register(&self, name: &str) -> Result<usize, String> {
        self.registers
            .get(name)
            .copied()
            .ok_or_else(|| format!("undeclared register '{}'", name))
    }

    fn parse_src(&self, text: &str) -> Result<SrcOp, String> {
        let text = text.trim();
        let (neg, text) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let (name, swz) = text.split_once('.').unwrap_or((text, "xyzw"));
        let comps: Vec<usize> = swz.chars().map(component).collect::<Result<_, _>>()?;
        let sel = match comps.len() {
            1 => [comps[0]; 4],
            4 => [comps[0], comps[1], comps[2], comps[3]],
            n => return Err(format!("swizzle of {} components in '{}'", n, text)),
        };
        Ok(SrcOp {
            reg: self.register(name)?,
            sel,
            neg,
        })
    }

    fn parse_dst(&self, text: &str) -> Result<(DstOp, Option<CcTest>), String> {
        let text = text.trim();
        let (target, cc) = match text.split_once('(') {
            Some((target, cond)) => {
                let cond = cond
                    .strip_suffix(')')
                    .ok_or_else(|| format!("bad condition in '{}'", text))?;
                (target.trim(), Some(parse_cc(cond)?))
            }
            None => (text, None),
        };
        let (name, mask_text) = target.split_once('.').unwrap_or((target, "xyzw"));
        let mut mask = [false; 4];
        for c in mask_text.chars() {
            mask[component(c)?] = true;
        }
        Ok((
            DstOp {
                reg: self.register(name)?,
                mask,
            },
            cc,
        ))
    }

    fn parse_instruction(&self, word: &str, rest: &str) -> Result<MInst, String> {
        let mut inst = MInst {
            op: word.to_string(),
            update_cc: false,
            dest: None,
            cc: None,
            srcs: Vec::new(),
            texture: None,
            jump: usize::MAX,
            label: None,
        };
        let rest = rest.trim();
        let bracketed = |text: &str| -> Result<Option<CcTest>, String> {
            match text.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
                Some(cond) => Ok(Some(parse_cc(cond)?)),
                None if text.is_empty() => Ok(None),
                None => Err(format!("unexpected '{}'", text)),
            }
        };
        match word {
            "IF" => inst.cc = Some(parse_cc(rest)?),
            "ELSE" | "ENDIF" | "ENDREP" => {}
            "REP" => inst.srcs.push(self.parse_src(rest)?),
            "BRK" => inst.cc = bracketed(rest)?,
            "BRA" => {
                let (label, cond) = rest.split_once(' ').unwrap_or((rest, ""));
                inst.label = Some(label.to_string());
                inst.cc = bracketed(cond.trim())?;
            }
            "KIL" => inst.srcs.push(self.parse_src(rest)?),
            _ => {
                let (op, update_cc) = match word.strip_suffix('C') {
                    Some(op) if arity(word).is_none() => (op, true),
                    _ => (word, false),
                };
                inst.op = op.to_string();
                inst.update_cc = update_cc;
                let mut operands = rest.split(',');
                let (dest, cc) = self.parse_dst(operands.next().unwrap_or(""))?;
                inst.dest = Some(dest);
                inst.cc = cc;
                let operands: Vec<&str> = operands.map(str::trim).collect();
                if op == "TEX" {
                    if operands.len() != 3 {
                        return Err(format!("TEX needs coordinate, unit and target: '{}'", rest));
                    }
                    inst.srcs.push(self.parse_src(operands[0])?);
                    let unit = operands[1]
                        .strip_prefix("texture[")
                        .and_then(|u| u.strip_suffix(']'))
                        .and_then(|u| u.parse().ok())
                        .ok_or_else(|| format!("bad texture unit '{}'", operands[1]))?;
                    let dims = TextureDims::from_name(operands[2])
                        .ok_or_else(|| format!("bad texture target '{}'", operands[2]))?;
                    inst.texture = Some((unit, dims));
                } else {
                    for src in operands {
                        inst.srcs.push(self.parse_src(src)?);
                    }
                }
                let arity =
                    arity(&inst.op).ok_or_else(|| format!("unknown opcode '{}'", inst.op))?;
                if inst.srcs.len() != arity {
                    return Err(format!("{} takes {} sources", inst.op, arity));
                }
            }
        }
        Ok(inst)
    }

    fn resolve(&mut self, labels: &HashMap<String, usize>) -> Result<(), String> {
        let mut ifs: Vec<usize> = Vec::new();
        let mut reps: Vec<(usize, Vec<usize>)> = Vec::new();
        for i in 0..self.code.len() {
            match self.code[i].op.as_str() {
                "IF" => ifs.push(i),
                "ELSE" => {
                    let open = ifs.pop().ok_or("ELSE without IF")?;
                    self.code[open].jump = i + 1;
                    ifs.push(i);
                }
                "ENDIF" => {
                    let open = ifs.pop().ok_or("ENDIF without IF")?;
                    self.code[open].jump = i + 1;
                }
                "REP" => reps.push((i, Vec::new())),
                "BRK" => reps.last_mut().ok_or("BRK outside REP")?.1.push(i),
                "ENDREP" => {
                    let (open, breaks) = reps.pop().ok_or("ENDREP without REP")?;
                    self.code[open].jump = i + 1;
                    self.code[i].jump = open + 1;
                    for b in breaks {
                        self.code[b].jump = i + 1;
                    }
                }
                "BRA" => {
                    let label = self.code[i].label.clone().unwrap_or_default();
                    self.code[i].jump = *labels
                        .get(&label)
                        .ok_or_else(|| format!("undefined label '{}'", label))?;
                }
                _ => {}
            }
        }
        if !ifs.is_empty() || !reps.is_empty() {
            return Err("unterminated IF or REP".to_string());
        }
        Ok(())
    }

    pub fn instruction_count(&self) -> usize {
        self.code.len()
    }

    /// Execute the program once.
    pub fn run(&self, inputs: &MachineInputs<'_>) -> Result<Outcome, String> {
        let mut regs = vec![[0.0f32; 4]; self.registers.len()];
        for (slot, binding) in &self.attribs {
            regs[*slot] = inputs.attribs.get(binding).copied().unwrap_or([0.0; 4]);
        }
        for (slot, index) in &self.locals {
            regs[*slot] = inputs.locals.get(*index).copied().unwrap_or([0.0; 4]);
        }
        for (slot, value) in &self.constants {
            regs[*slot] = *value;
        }

        let mut cc = [0.0f32; 4];
        let mut counters: Vec<i64> = Vec::new();
        let mut outcome = Outcome::default();
        let mut pc = 0;
        while pc < self.code.len() {
            outcome.steps += 1;
            if outcome.steps > STEP_LIMIT {
                return Err(format!("step limit exceeded at instruction {}", pc));
            }
            let inst = &self.code[pc];
            trace!("{:4} {}", pc, inst.op);
            let fetch = |s: &SrcOp| -> [f32; 4] {
                let r = regs[s.reg];
                let mut v = [r[s.sel[0]], r[s.sel[1]], r[s.sel[2]], r[s.sel[3]]];
                if s.neg {
                    for c in &mut v {
                        *c = -*c;
                    }
                }
                v
            };
            let taken = |cc_test: Option<CcTest>| cc_test.map_or(true, |t| t.holds(&cc, 0));
            pc += 1;
            match inst.op.as_str() {
                "IF" => {
                    if !taken(inst.cc) {
                        pc = inst.jump;
                    }
                }
                // Only reached from the end of the taken arm.
                "ELSE" => pc = inst.jump,
                "ENDIF" => {}
                "REP" => {
                    let count = fetch(&inst.srcs[0])[0] as i64;
                    if count <= 0 {
                        pc = inst.jump;
                    } else {
                        counters.push(count);
                    }
                }
                "ENDREP" => {
                    let counter = counters.last_mut().ok_or("ENDREP without counter")?;
                    *counter -= 1;
                    if *counter > 0 {
                        pc = inst.jump;
                    } else {
                        counters.pop();
                    }
                }
                "BRK" => {
                    if taken(inst.cc) {
                        counters.pop();
                        pc = inst.jump;
                    }
                }
                "BRA" => {
                    if taken(inst.cc) {
                        pc = inst.jump;
                    }
                }
                "KIL" => {
                    if fetch(&inst.srcs[0]).iter().any(|v| *v < 0.0) {
                        outcome.killed = true;
                        break;
                    }
                }
                op => {
                    let srcs: Vec<[f32; 4]> = inst.srcs.iter().map(fetch).collect();
                    let result = match inst.texture {
                        Some((unit, _)) => (inputs.sampler)(unit, srcs[0]),
                        None => evaluate(op, &srcs)?,
                    };
                    let dest = inst.dest.ok_or("instruction without destination")?;
                    for p in 0..4 {
                        if !dest.mask[p] {
                            continue;
                        }
                        if let Some(test) = inst.cc {
                            if !test.holds(&cc, p) {
                                continue;
                            }
                        }
                        regs[dest.reg][p] = result[p];
                        if inst.update_cc {
                            cc[p] = result[p];
                        }
                    }
                }
            }
        }

        for (slot, binding) in &self.outputs {
            outcome.outputs.insert(binding.clone(), regs[*slot]);
        }
        Ok(outcome)
    }
}

fn splat(v: f32) -> [f32; 4] {
    [v; 4]
}

fn zip(a: [f32; 4], b: [f32; 4], f: impl Fn(f32, f32) -> f32) -> [f32; 4] {
    [f(a[0], b[0]), f(a[1], b[1]), f(a[2], b[2]), f(a[3], b[3])]
}

fn flag(b: bool) -> f32 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn evaluate(op: &str, s: &[[f32; 4]]) -> Result<[f32; 4], String> {
    let a = s[0];
    Ok(match op {
        "ABS" => a.map(f32::abs),
        "ADD" => zip(a, s[1], |x, y| x + y),
        "SUB" => zip(a, s[1], |x, y| x - y),
        "MUL" => zip(a, s[1], |x, y| x * y),
        "MAX" => zip(a, s[1], f32::max),
        "MIN" => zip(a, s[1], f32::min),
        "SGE" => zip(a, s[1], |x, y| flag(x >= y)),
        "SLT" => zip(a, s[1], |x, y| flag(x < y)),
        "SEQ" => zip(a, s[1], |x, y| flag(x == y)),
        "SNE" => zip(a, s[1], |x, y| flag(x != y)),
        "SGT" => zip(a, s[1], |x, y| flag(x > y)),
        "SLE" => zip(a, s[1], |x, y| flag(x <= y)),
        "MAD" => {
            let p = zip(a, s[1], |x, y| x * y);
            zip(p, s[2], |x, y| x + y)
        }
        "LRP" => {
            let mut out = [0.0; 4];
            for i in 0..4 {
                out[i] = a[i] * s[1][i] + (1.0 - a[i]) * s[2][i];
            }
            out
        }
        "CMP" => {
            let mut out = [0.0; 4];
            for i in 0..4 {
                out[i] = if a[i] < 0.0 { s[1][i] } else { s[2][i] };
            }
            out
        }
        "MOV" => a,
        "FLR" => a.map(f32::floor),
        "FRC" => a.map(|x| x - x.floor()),
        "SSG" => a.map(|x| flag(x > 0.0) - flag(x < 0.0)),
        "DDX" | "DDY" => splat(0.0),
        "COS" => splat(a[0].cos()),
        "SIN" => splat(a[0].sin()),
        "EX2" => splat(a[0].exp2()),
        "LG2" => splat(a[0].abs().log2()),
        "RCP" => splat(1.0 / a[0]),
        "RSQ" => splat(1.0 / a[0].abs().sqrt()),
        "POW" => splat(a[0].powf(s[1][0])),
        "DP2" => splat(a[0] * s[1][0] + a[1] * s[1][1]),
        "DP3" => splat(a[0] * s[1][0] + a[1] * s[1][1] + a[2] * s[1][2]),
        "DP4" => splat(a[0] * s[1][0] + a[1] * s[1][1] + a[2] * s[1][2] + a[3] * s[1][3]),
        "XPD" => {
            let b = s[1];
            [
                a[1] * b[2] - a[2] * b[1],
                a[2] * b[0] - a[0] * b[2],
                a[0] * b[1] - a[1] * b[0],
                0.0,
            ]
        }
        "NRM" => {
            let len = (a[0] * a[0] + a[1] * a[1] + a[2] * a[2]).sqrt();
            [a[0] / len, a[1] / len, a[2] / len, 0.0]
        }
        "LIT" => lit(a),
        other => return Err(format!("cannot execute {}", other)),
    })
}

/// Lighting coefficients as the target computes them.
pub fn lit(a: [f32; 4]) -> [f32; 4] {
    let diffuse = a[0].max(0.0);
    let specular = if a[0] > 0.0 {
        let exponent = a[3].clamp(-128.0, 128.0);
        a[1].max(0.0).powf(exponent)
    } else {
        0.0
    };
    [1.0, diffuse, specular, 1.0]
}

struct DeviceProgram {
    program: MachineProgram,
    locals: Vec<[f32; 4]>,
}

/// In-memory device that accepts uploads and runs them.
#[derive(Default)]
pub struct VirtualDevice {
    programs: Vec<DeviceProgram>,
    /// Number of successful `update_param` calls.
    pub param_updates: usize,
    /// Reject every upload with this message.
    pub reject: Option<String>,
}

impl VirtualDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    fn get(&self, handle: ProgramHandle) -> Result<&DeviceProgram, String> {
        self.programs
            .get(handle.0 as usize)
            .ok_or_else(|| format!("unknown program handle {}", handle.0))
    }

    pub fn locals(&self, handle: ProgramHandle) -> Result<&[[f32; 4]], String> {
        Ok(&self.get(handle)?.locals)
    }

    /// Run an uploaded program with its current parameter values.
    pub fn run(
        &self,
        handle: ProgramHandle,
        attribs: HashMap<String, [f32; 4]>,
        sampler: &dyn Fn(usize, [f32; 4]) -> [f32; 4],
    ) -> Result<Outcome, String> {
        let entry = self.get(handle)?;
        let inputs = MachineInputs {
            attribs,
            locals: entry.locals.clone(),
            sampler,
        };
        entry.program.run(&inputs)
    }
}

impl Uploader for VirtualDevice {
    fn upload(&mut self, text: &str, constants: &[[f32; 4]]) -> Result<ProgramHandle, UploadError> {
        if let Some(reason) = &self.reject {
            return Err(reason.clone().into());
        }
        let program = MachineProgram::parse(text)?;
        self.programs.push(DeviceProgram {
            program,
            locals: constants.to_vec(),
        });
        Ok(ProgramHandle(self.programs.len() as u64 - 1))
    }

    fn update_param(
        &mut self,
        handle: ProgramHandle,
        index: usize,
        value: [f32; 4],
    ) -> Result<(), UploadError> {
        let entry = self
            .programs
            .get_mut(handle.0 as usize)
            .ok_or_else(|| format!("unknown program handle {}", handle.0))?;
        let slot = entry
            .locals
            .get_mut(index)
            .ok_or_else(|| format!("program.local[{}] out of range", index))?;
        *slot = value;
        self.param_updates += 1;
        Ok(())
    }
}
