//! Assembly text output.
//!
//! The program text is the profile header, the optional `OPTION` line,
//! declarations of every bound register, the instructions with referenced
//! labels placed before their targets, and `END`.

use std::fmt::Write as _;

use crate::core::{AsmReg, CompileError, CompileResult, RegClass};
use crate::graph::{ProgramGraph, SemanticKind, Swizzle};
use crate::target::Profile;

use super::alloc::Allocation;
use super::inst::{source_selection, ArbOp, Dst, Instruction, Src, VReg, VRegInfo};
use super::legalize::Layout;
use super::report::BindingEntry;

const LETTERS: [char; 4] = ['x', 'y', 'z', 'w'];

/// Suffix of a four-wide positional selection: one letter when every
/// position reads the same component, nothing for `xyzw`.
pub fn selection_suffix(sel: [u8; 4]) -> String {
    if sel.iter().all(|c| *c == sel[0]) {
        return format!(".{}", LETTERS[sel[0] as usize]);
    }
    if sel == [0, 1, 2, 3] {
        return String::new();
    }
    let mut out = String::from(".");
    out.extend(sel.iter().map(|c| LETTERS[*c as usize]));
    out
}

/// Suffix of a write mask, components in register order.
pub fn mask_suffix(mask: &Swizzle) -> String {
    let mut comps = mask.comps().to_vec();
    comps.sort_unstable();
    comps.dedup();
    if comps == [0, 1, 2, 3] {
        return String::new();
    }
    let mut out = String::from(".");
    out.extend(comps.iter().map(|c| LETTERS[*c as usize]));
    out
}

struct Printer<'a> {
    vregs: &'a [VRegInfo],
    alloc: &'a Allocation,
    /// Registers bound to `result.depth`, which lives in the z component.
    depth: Vec<bool>,
}

impl Printer<'_> {
    fn reg(&self, vreg: VReg) -> CompileResult<AsmReg> {
        self.alloc.reg(vreg).ok_or_else(|| {
            CompileError::invariant(format!(
                "virtual register {} ({}) has no physical register",
                vreg.0,
                self.vregs[vreg.index()].name
            ))
        })
    }

    fn dst(&self, dst: &Dst) -> CompileResult<String> {
        let reg = self.reg(dst.reg)?;
        if self.depth[dst.reg.index()] {
            return Ok(format!("{}.z", reg));
        }
        Ok(format!("{}{}", reg, mask_suffix(&dst.mask)))
    }

    fn src(&self, op: ArbOp, src: &Src, mask: Option<&Swizzle>) -> CompileResult<String> {
        let reg = self.reg(src.reg)?;
        let sign = if src.neg { "-" } else { "" };
        let sel = source_selection(op, &src.swizzle, mask);
        Ok(format!("{}{}{}", sign, reg, selection_suffix(sel)))
    }

    fn instruction(&self, inst: &Instruction) -> CompileResult<String> {
        let cc = inst.cc.map(|c| format!(" ({})", c)).unwrap_or_default();
        let text = match inst.op {
            ArbOp::If => format!("IF {};", inst.cc.map(|c| c.to_string()).unwrap_or_default()),
            ArbOp::Else | ArbOp::EndIf | ArbOp::EndRep => format!("{};", inst.op),
            ArbOp::Rep => {
                let count = inst
                    .srcs
                    .first()
                    .ok_or_else(|| CompileError::invariant("REP without a count"))?;
                format!("REP {};", self.src(inst.op, count, None)?)
            }
            ArbOp::Brk => format!("BRK{};", cc),
            ArbOp::Bra => {
                let target = inst
                    .target
                    .ok_or_else(|| CompileError::invariant("branch without a label"))?;
                format!("BRA L{}{};", target.0, cc)
            }
            op => {
                let mut operands = Vec::with_capacity(inst.srcs.len() + 3);
                let mask = inst.dest.as_ref().map(|d| &d.mask);
                if let Some(dest) = &inst.dest {
                    operands.push(format!("{}{}", self.dst(dest)?, cc));
                }
                for src in &inst.srcs {
                    operands.push(self.src(op, src, mask)?);
                }
                if let Some(tex) = &inst.texture {
                    operands.push(self.reg(tex.reg)?.to_string());
                    operands.push(tex.dims.target_name().to_string());
                }
                let suffix = if inst.update_cc { "C" } else { "" };
                format!("{}{} {};", op, suffix, operands.join(", "))
            }
        };
        let mut notes = Vec::new();
        if let Some(origin) = inst.origin {
            notes.push(origin.to_string());
        }
        if let Some(comment) = &inst.comment {
            notes.push(comment.clone());
        }
        if notes.is_empty() {
            Ok(text)
        } else {
            Ok(format!("{} # {}", text, notes.join(" ")))
        }
    }
}

fn declare(out: &mut String, keyword: &str, entries: &[BindingEntry]) {
    for entry in entries {
        let _ = write!(out, "{} {} = {};", keyword, entry.reg, entry.binding);
        if !entry.names.is_empty() {
            let _ = write!(out, " # {}", entry.names.join(", "));
        }
        out.push('\n');
    }
}

fn declare_temps(out: &mut String, keyword: &str, class: RegClass, count: usize) {
    if count == 0 {
        return;
    }
    let names: Vec<String> = (0..count)
        .map(|i| AsmReg::new(class, i as u16).to_string())
        .collect();
    let _ = writeln!(out, "{} {};", keyword, names.join(", "));
}

/// Render a resolved, allocated program as assembly text.
pub fn print_program(
    profile: &Profile,
    graph: &ProgramGraph,
    layout: &Layout,
    vregs: &[VRegInfo],
    alloc: &Allocation,
) -> CompileResult<String> {
    let depth = vregs
        .iter()
        .map(|info| {
            info.class == RegClass::Output
                && info
                    .value
                    .and_then(|v| graph.values().get(v).semantic)
                    .map_or(false, |s| s.kind == SemanticKind::Depth)
        })
        .collect();
    let printer = Printer {
        vregs,
        alloc,
        depth,
    };

    let mut out = String::new();
    out.push_str(profile.header);
    out.push('\n');
    if let Some(option) = profile.option {
        let _ = writeln!(out, "OPTION {};", option);
    }
    let report = &alloc.report;
    declare(&mut out, "ATTRIB", &report.inputs);
    declare(&mut out, "OUTPUT", &report.outputs);
    declare(&mut out, "PARAM", &report.params);
    declare(&mut out, "PARAM", &report.constants);
    let used = |class| report.usage_of(class).map_or(0, |u| u.used);
    declare_temps(&mut out, "TEMP", RegClass::Temp, used(RegClass::Temp));
    declare_temps(&mut out, "SHORT TEMP", RegClass::Half, used(RegClass::Half));

    let mut labels = layout.labels.iter().peekable();
    for (i, inst) in layout.code.iter().enumerate() {
        while let Some((_, label)) = labels.next_if(|(pos, _)| *pos == i) {
            let _ = writeln!(out, "L{}:", label.0);
        }
        let _ = writeln!(out, "  {}", printer.instruction(inst)?);
    }
    for (_, label) in labels {
        let _ = writeln!(out, "L{}:", label.0);
    }
    out.push_str("END\n");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::inst::{CcRel, CcTest, LabelId};
    use crate::codegen::report::{BindingReport, ClassUsage};

    #[test]
    fn test_selection_suffix() {
        assert_eq!(selection_suffix([0, 1, 2, 3]), "");
        assert_eq!(selection_suffix([2, 2, 2, 2]), ".z");
        assert_eq!(selection_suffix([0, 2, 2, 1]), ".xzzy");
    }

    #[test]
    fn test_mask_suffix_is_sorted() {
        assert_eq!(mask_suffix(&Swizzle::parse("yx").unwrap()), ".xy");
        assert_eq!(mask_suffix(&Swizzle::identity(4)), "");
    }

    fn temp(size: u8) -> VRegInfo {
        VRegInfo {
            class: RegClass::Temp,
            size,
            value: None,
            name: String::new(),
            data: None,
            texture: None,
        }
    }

    #[test]
    fn test_instruction_text() {
        let vregs = vec![temp(4), temp(4)];
        let alloc = Allocation {
            regs: vec![
                Some(AsmReg::new(RegClass::Temp, 0)),
                Some(AsmReg::new(RegClass::Temp, 1)),
            ],
            report: BindingReport::default(),
        };
        let printer = Printer {
            vregs: &vregs,
            alloc: &alloc,
            depth: vec![false; 2],
        };
        let mut mov = Instruction::new(
            ArbOp::Mov,
            Some(Dst::new(VReg(0), Swizzle::parse("yw").unwrap())),
            vec![Src::new(VReg(1), Swizzle::parse("zx").unwrap()).negated()],
        )
        .with_cc(CcTest::x(CcRel::Gt));
        mov.origin = Some(4);
        assert_eq!(
            printer.instruction(&mov).unwrap(),
            "MOV r0.yw (GT.x), -r1.xzzx; # 4"
        );

        let bra = Instruction::branch(LabelId(3), Some(CcTest::x(CcRel::Le)));
        assert_eq!(printer.instruction(&bra).unwrap(), "BRA L3 (LE.x);");
        let setcc = Instruction::new(
            ArbOp::Mov,
            Some(Dst::new(VReg(0), Swizzle::identity(1))),
            vec![Src::new(VReg(1), Swizzle::parse("w").unwrap())],
        )
        .setting_cc();
        assert_eq!(printer.instruction(&setcc).unwrap(), "MOVC r0.x, r1.w;");
    }

    #[test]
    fn test_program_layout() {
        let vregs = vec![temp(4)];
        let alloc = Allocation {
            regs: vec![Some(AsmReg::new(RegClass::Temp, 0))],
            report: BindingReport {
                usage: vec![ClassUsage {
                    class: RegClass::Temp,
                    used: 1,
                    capacity: 32,
                }],
                ..Default::default()
            },
        };
        let layout = Layout {
            code: vec![Instruction::new(
                ArbOp::Mov,
                Some(Dst::new(VReg(0), Swizzle::identity(4))),
                vec![Src::new(VReg(0), Swizzle::identity(4))],
            )],
            labels: vec![(0, LabelId(1)), (1, LabelId(2))],
        };
        let profile = crate::target::profile_by_name("nvfp2").unwrap();
        let graph = ProgramGraph::new(crate::graph::ProgramKind::Fragment);
        let text = print_program(profile, &graph, &layout, &vregs, &alloc).unwrap();
        assert_eq!(
            text,
            "!!ARBfp1.0\nOPTION NV_fragment_program2;\nTEMP r0;\nL1:\n  MOV r0, r0;\nL2:\nEND\n"
        );
    }
}
