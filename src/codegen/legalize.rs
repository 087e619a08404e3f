//! Post-emission fix-ups.
//!
//! [`legalize`] shadows registers the target cannot use the way the program
//! does: outputs that are read get a temporary copied out at the end, and
//! inputs, parameters and constants that are written get a temporary copied
//! in at the start. [`resolve_labels`] drops branches to the next
//! instruction and turns labels and bracket pairs into instruction indices.

use log::debug;

use crate::core::{CompileError, CompileResult, RegClass};
use crate::graph::Swizzle;

use super::emitter::Emitted;
use super::inst::{ArbOp, Dst, Instruction, LabelId, Src, VReg, VRegInfo};

fn rename(code: &mut [Instruction], from: VReg, to: VReg) {
    for inst in code {
        for src in &mut inst.srcs {
            if src.reg == from {
                src.reg = to;
            }
        }
        if let Some(dest) = &mut inst.dest {
            if dest.reg == from {
                dest.reg = to;
            }
        }
    }
}

fn shadow_of(vregs: &mut Vec<VRegInfo>, reg: VReg) -> VReg {
    let info = &vregs[reg.index()];
    let shadow = VRegInfo {
        class: RegClass::Temp,
        size: info.size,
        value: info.value,
        name: info.name.clone(),
        data: None,
        texture: None,
    };
    vregs.push(shadow);
    VReg(vregs.len() as u32 - 1)
}

fn full_copy(dest: VReg, src: VReg, size: u8) -> Instruction {
    let full = Swizzle::identity(size);
    Instruction::new(ArbOp::Mov, Some(Dst::new(dest, full)), vec![Src::new(src, full)])
}

/// Shadow read outputs and written read-only registers. Returns the number
/// of registers shadowed.
pub fn legalize(emitted: &mut Emitted) -> usize {
    let mut read_outputs = Vec::new();
    let mut written_inputs = Vec::new();
    for inst in &emitted.code {
        for reg in inst.reads() {
            if emitted.vregs[reg.index()].class == RegClass::Output && !read_outputs.contains(&reg) {
                read_outputs.push(reg);
            }
        }
        if let Some(dest) = &inst.dest {
            let class = emitted.vregs[dest.reg.index()].class;
            let read_only = matches!(class, RegClass::Input | RegClass::Param | RegClass::Const);
            if read_only && !written_inputs.contains(&dest.reg) {
                written_inputs.push(dest.reg);
            }
        }
    }

    for &out in &read_outputs {
        let shadow = shadow_of(&mut emitted.vregs, out);
        rename(&mut emitted.code, out, shadow);
        let size = emitted.vregs[out.index()].size;
        emitted.code.push(full_copy(out, shadow, size));
        debug!("legalize: output {} is read, shadowed", emitted.vregs[out.index()].name);
    }

    let mut prologue = Vec::with_capacity(written_inputs.len());
    for &reg in &written_inputs {
        let shadow = shadow_of(&mut emitted.vregs, reg);
        rename(&mut emitted.code, reg, shadow);
        prologue.push(full_copy(shadow, reg, emitted.vregs[reg.index()].size));
        debug!("legalize: {} is written, shadowed", emitted.vregs[reg.index()].name);
    }
    if !prologue.is_empty() {
        let shift = prologue.len();
        prologue.append(&mut emitted.code);
        emitted.code = prologue;
        for pos in emitted.labels.iter_mut().flatten() {
            *pos += shift;
        }
    }
    read_outputs.len() + written_inputs.len()
}

/// Final instruction order with every jump resolved.
#[derive(Debug, Clone)]
pub struct Layout {
    pub code: Vec<Instruction>,
    /// Referenced labels and the index they stand before, in order.
    pub labels: Vec<(usize, LabelId)>,
}

fn label_position(labels: &[Option<usize>], label: LabelId) -> CompileResult<usize> {
    labels
        .get(label.0 as usize)
        .copied()
        .flatten()
        .ok_or_else(|| CompileError::invariant(format!("unresolved label L{}", label.0)))
}

/// Drop branches to the next instruction and resolve every jump.
pub fn resolve_labels(code: Vec<Instruction>, labels: &[Option<usize>]) -> CompileResult<Layout> {
    let mut keep = vec![true; code.len()];
    for (i, inst) in code.iter().enumerate() {
        if let (ArbOp::Bra, Some(target)) = (inst.op, inst.target) {
            if label_position(labels, target)? == i + 1 {
                keep[i] = false;
            }
        }
    }
    let mut new_pos = Vec::with_capacity(code.len() + 1);
    let mut count = 0;
    for k in &keep {
        new_pos.push(count);
        if *k {
            count += 1;
        }
    }
    new_pos.push(count);
    let labels: Vec<Option<usize>> = labels.iter().map(|p| p.map(|p| new_pos[p])).collect();
    let mut code: Vec<Instruction> = code
        .into_iter()
        .zip(keep)
        .filter_map(|(inst, k)| k.then_some(inst))
        .collect();

    let mut referenced = Vec::new();
    let mut brackets: Vec<usize> = Vec::new();
    let mut loops: Vec<(usize, Vec<usize>)> = Vec::new();
    for i in 0..code.len() {
        match code[i].op {
            ArbOp::Bra => {
                let target = code[i]
                    .target
                    .ok_or_else(|| CompileError::invariant("branch without a label"))?;
                let pos = label_position(&labels, target)?;
                code[i].jump = Some(pos);
                if !referenced.contains(&(pos, target)) {
                    referenced.push((pos, target));
                }
            }
            ArbOp::If => brackets.push(i),
            ArbOp::Else => {
                let open = brackets
                    .pop()
                    .filter(|&j| code[j].op == ArbOp::If)
                    .ok_or_else(|| CompileError::invariant("ELSE without IF"))?;
                code[open].jump = Some(i);
                brackets.push(i);
            }
            ArbOp::EndIf => {
                let open = brackets
                    .pop()
                    .ok_or_else(|| CompileError::invariant("ENDIF without IF"))?;
                code[open].jump = Some(i);
            }
            ArbOp::Rep => loops.push((i, Vec::new())),
            ArbOp::Brk => loops
                .last_mut()
                .ok_or_else(|| CompileError::invariant("BRK outside a loop"))?
                .1
                .push(i),
            ArbOp::EndRep => {
                let (open, breaks) = loops
                    .pop()
                    .ok_or_else(|| CompileError::invariant("ENDREP without REP"))?;
                code[open].jump = Some(i);
                code[i].jump = Some(open);
                for b in breaks {
                    code[b].jump = Some(i);
                }
            }
            _ => {}
        }
    }
    if !brackets.is_empty() || !loops.is_empty() {
        return Err(CompileError::invariant("unterminated IF or REP"));
    }
    referenced.sort();
    Ok(Layout {
        code,
        labels: referenced,
    })
}
