//! Statement lowering.
//!
//! [`Builder`] owns the instruction stream and the virtual register table
//! while a program is generated. [`Builder::lower`] looks a statement up in the
//! lowering table, applies the rule's transforms and either emits the native
//! opcode or runs a macro expansion. Expansions are written in terms of other
//! intermediate opcodes where that is natural, so they go through the table
//! again and pick up the best form for the profile.

use std::f32::consts::{FRAC_PI_2, PI, TAU};

use hashbrown::HashMap;
use log::trace;

use crate::core::{CompilationSession, CompileError, CompileResult, RegClass};
use crate::graph::{Op, Swizzle, TextureDims, TextureInfo};
use crate::target::{Profile, Selectors};

use super::inst::{
    ArbKind, ArbOp, CcRel, CcTest, Dst, Instruction, LabelId, Src, TexOperand, VReg, VRegInfo,
};
use super::table::{select, Expansion, Lowering};

/// A statement over virtual registers, ready for lowering.
#[derive(Debug, Clone, PartialEq)]
pub struct LStmt {
    pub op: Op,
    pub dest: Option<Dst>,
    pub srcs: Vec<Src>,
    pub texture: Option<TexOperand>,
}

impl LStmt {
    pub fn new(op: Op, dest: Option<Dst>, srcs: Vec<Src>) -> Self {
        Self {
            op,
            dest,
            srcs,
            texture: None,
        }
    }

    /// Width used to pick a vector-length specific rule.
    fn width(&self) -> u8 {
        self.srcs
            .iter()
            .map(Src::size)
            .max()
            .or_else(|| self.dest.map(|d| d.size()))
            .unwrap_or(1)
    }
}

/// Whether writing `dest` one component at a time overwrites a component of
/// `srcs` that a later component still reads.
fn clobbers_sources(dest: Dst, srcs: &[Src]) -> bool {
    let n = dest.size() as usize;
    (0..n).any(|j| {
        let written = dest.mask.get(j);
        srcs.iter()
            .filter(|s| s.reg == dest.reg)
            .any(|s| (j + 1..n).any(|k| s.component(k).swizzle.get(0) == written))
    })
}

// Taylor coefficients of sin(x)/x as a polynomial in x^2, highest first.
const SIN_COEFFS: [f32; 8] = [
    -1.0 / 1_307_674_368_000.0,
    1.0 / 6_227_020_800.0,
    -1.0 / 39_916_800.0,
    1.0 / 362_880.0,
    -1.0 / 5040.0,
    1.0 / 120.0,
    -1.0 / 6.0,
    1.0,
];

// Abramowitz & Stegun 4.4.45: acos(x) ~ sqrt(1 - x) * poly(x) on [0, 1].
const ACOS_COEFFS: [f32; 4] = [-0.018_729_3, 0.074_261_0, -0.212_114_4, 1.570_728_8];

/// Instruction stream and register table under construction.
pub struct Builder<'s, 'arena> {
    pub profile: &'static Profile,
    session: &'s CompilationSession<'arena>,
    pub vregs: Vec<VRegInfo>,
    pub code: Vec<Instruction>,
    /// Label positions as instruction indices.
    pub labels: Vec<Option<usize>>,
    consts: HashMap<Vec<u32>, VReg>,
    /// Origin stamped on emitted instructions.
    pub origin: Option<usize>,
    /// Where the statement being lowered comes from, for diagnostics.
    pub context: String,
}

impl<'s, 'arena> Builder<'s, 'arena> {
    pub fn new(profile: &'static Profile, session: &'s CompilationSession<'arena>) -> Self {
        Self {
            profile,
            session,
            vregs: Vec::new(),
            code: Vec::new(),
            labels: Vec::new(),
            consts: HashMap::new(),
            origin: None,
            context: String::new(),
        }
    }

    pub fn session(&self) -> &'s CompilationSession<'arena> {
        self.session
    }

    pub fn add_vreg(&mut self, info: VRegInfo) -> VReg {
        let reg = VReg(self.vregs.len() as u32);
        self.vregs.push(info);
        reg
    }

    pub fn vreg(&self, reg: VReg) -> &VRegInfo {
        &self.vregs[reg.index()]
    }

    /// Fresh anonymous temporary of class `class`.
    pub fn temp_of(&mut self, class: RegClass, size: u8) -> VReg {
        self.add_vreg(VRegInfo {
            class,
            size,
            value: None,
            name: String::new(),
            data: None,
            texture: None,
        })
    }

    pub fn temp(&mut self, size: u8) -> VReg {
        self.temp_of(RegClass::Temp, size)
    }

    /// Fresh temporary written in full.
    pub fn scratch(&mut self, size: u8) -> Dst {
        Dst::new(self.temp(size), Swizzle::identity(size))
    }

    /// Constant register holding `data`; equal constants share a register.
    pub fn constant(&mut self, data: &[f32]) -> VReg {
        let key: Vec<u32> = data.iter().map(|v| v.to_bits()).collect();
        if let Some(reg) = self.consts.get(&key) {
            return *reg;
        }
        let mut padded = [0.0; 4];
        padded[..data.len()].copy_from_slice(data);
        let reg = self.add_vreg(VRegInfo {
            class: RegClass::Const,
            size: data.len() as u8,
            value: None,
            name: String::new(),
            data: Some(padded),
            texture: None,
        });
        self.consts.insert(key, reg);
        reg
    }

    pub fn literal(&mut self, data: &[f32]) -> Src {
        let reg = self.constant(data);
        Src::new(reg, Swizzle::identity(data.len() as u8))
    }

    pub fn scalar(&mut self, value: f32) -> Src {
        self.literal(&[value])
    }

    pub fn push(&mut self, mut inst: Instruction) {
        if inst.origin.is_none() {
            inst.origin = self.origin;
        }
        self.session.record_instruction_emitted(inst.op.name());
        self.code.push(inst);
    }

    pub fn emit(&mut self, op: ArbOp, dest: Dst, srcs: Vec<Src>) {
        self.push(Instruction::new(op, Some(dest), srcs));
    }

    /// Copy a scalar into a scratch register and set the condition codes
    /// from it. Tests against the result use component x.
    pub fn set_cc(&mut self, cond: Src) {
        let dummy = Dst::new(self.temp(1), Swizzle::identity(1));
        self.push(Instruction::new(ArbOp::Mov, Some(dummy), vec![cond]).setting_cc());
    }

    pub fn new_label(&mut self) -> LabelId {
        self.labels.push(None);
        LabelId(self.labels.len() as u32 - 1)
    }

    pub fn place_label(&mut self, label: LabelId) {
        self.labels[label.0 as usize] = Some(self.code.len());
    }

    pub fn branch(&mut self, target: LabelId, cc: Option<CcTest>) {
        self.push(Instruction::branch(target, cc));
    }

    fn unsupported(&self, op: Op) -> CompileError {
        CompileError::UnsupportedOperation {
            op: op.name(),
            profile: self.profile.name,
            context: self.context.clone(),
        }
    }

    /// Lower one statement through the table.
    pub fn lower(&mut self, stmt: &LStmt) -> CompileResult<()> {
        let env = self.profile.selectors | Selectors::vec(stmt.width());
        let rule = select(stmt.op, env).ok_or_else(|| self.unsupported(stmt.op))?;
        trace!("lowering {} with {:?}", stmt.op, rule.lowering);

        let mut stmt = stmt.clone();
        if rule.transforms.swap {
            stmt.srcs.swap(0, 1);
        }
        if rule.transforms.negate_first {
            stmt.srcs[0] = stmt.srcs[0].negated();
        }
        match stmt.dest {
            Some(dest) if rule.transforms.scalarize && dest.size() > 1 => {
                let staged =
                    clobbers_sources(dest, &stmt.srcs).then(|| self.scratch(dest.size()));
                let target = staged.unwrap_or(dest);
                for j in 0..dest.size() as usize {
                    let piece = LStmt {
                        op: stmt.op,
                        dest: Some(target.component(j)),
                        srcs: stmt.srcs.iter().map(|s| s.component(j)).collect(),
                        texture: stmt.texture,
                    };
                    self.apply(rule.lowering, &piece)?;
                }
                self.unstage(staged, dest);
                Ok(())
            }
            _ => self.apply(rule.lowering, &stmt),
        }
    }

    fn apply(&mut self, lowering: Lowering, stmt: &LStmt) -> CompileResult<()> {
        match lowering {
            Lowering::Native(op) => {
                self.native(op, stmt);
                Ok(())
            }
            Lowering::Macro(expansion) => {
                self.session.record_macro_expanded();
                self.expand(expansion, stmt)
            }
        }
    }

    fn native(&mut self, op: ArbOp, stmt: &LStmt) {
        let Some(dest) = stmt.dest else {
            self.push(Instruction::new(op, None, stmt.srcs.clone()));
            return;
        };
        let n = dest.size();
        if op.info().kind == ArbKind::Positional && !dest.mask.is_identity(n) {
            let t = self.temp(4);
            self.emit(op, Dst::new(t, Swizzle::identity(n)), stmt.srcs.clone());
            self.emit(ArbOp::Mov, dest, vec![Src::new(t, Swizzle::identity(n))]);
            return;
        }
        self.emit(op, dest, stmt.srcs.clone());
    }

    /// Copy a staged result into its real destination.
    fn unstage(&mut self, staged: Option<Dst>, dest: Dst) {
        if let Some(t) = staged {
            trace!("staged {} through a scratch register", dest.reg.0);
            self.emit(ArbOp::Mov, dest, vec![t.as_src()]);
        }
    }

    fn sub(&mut self, op: Op, dest: Dst, srcs: Vec<Src>) -> CompileResult<()> {
        self.lower(&LStmt::new(op, Some(dest), srcs))
    }

    fn expand(&mut self, expansion: Expansion, stmt: &LStmt) -> CompileResult<()> {
        let d = stmt
            .dest
            .ok_or_else(|| CompileError::invariant(format!("{} without destination", stmt.op)))?;
        let n = d.size();
        let src = |i: usize| stmt.srcs[i];

        match expansion {
            Expansion::Div => {
                let b = src(1);
                if b.size() == 1 {
                    let t = self.scratch(1);
                    self.emit(ArbOp::Rcp, t, vec![b]);
                    self.emit(ArbOp::Mul, d, vec![src(0), t.as_src()]);
                } else {
                    let t = self.temp(n);
                    for j in 0..n as usize {
                        let tj = Dst::new(t, Swizzle::new(&[j as u8]));
                        self.emit(ArbOp::Rcp, tj, vec![b.component(j)]);
                    }
                    self.emit(ArbOp::Mul, d, vec![src(0), Src::new(t, Swizzle::identity(n))]);
                }
            }
            Expansion::Sqrt => {
                let t = self.scratch(1);
                self.emit(ArbOp::Rsq, t, vec![src(0)]);
                self.emit(ArbOp::Rcp, d, vec![t.as_src()]);
            }
            Expansion::Ceil => {
                self.emit(ArbOp::Flr, d, vec![src(0).negated()]);
                self.emit(ArbOp::Mov, d, vec![d.as_src().negated()]);
            }
            Expansion::Mod => {
                let q = self.scratch(n);
                self.sub(Op::Div, q, vec![src(0), src(1)])?;
                let t = self.scratch(n);
                self.emit(ArbOp::Abs, t, vec![q.as_src()]);
                self.emit(ArbOp::Flr, t, vec![t.as_src()]);
                let s = self.scratch(n);
                self.sub(Op::Sgn, s, vec![q.as_src()])?;
                self.emit(ArbOp::Mul, t, vec![t.as_src(), s.as_src()]);
                self.emit(ArbOp::Mul, t, vec![t.as_src(), src(1)]);
                self.emit(ArbOp::Add, d, vec![src(0), t.as_src().negated()]);
            }
            Expansion::Sgn => {
                let zero = self.scalar(0.0);
                let pos = self.scratch(n);
                self.emit(ArbOp::Slt, pos, vec![zero, src(0)]);
                let neg = self.scratch(n);
                self.emit(ArbOp::Slt, neg, vec![src(0), zero]);
                self.emit(ArbOp::Add, d, vec![pos.as_src(), neg.as_src().negated()]);
            }
            Expansion::Rnd => {
                let half = self.scalar(0.5);
                let t = self.scratch(n);
                self.emit(ArbOp::Add, t, vec![src(0), half]);
                self.emit(ArbOp::Flr, d, vec![t.as_src()]);
            }
            Expansion::Trig { cos } => self.polynomial_sine(d, src(0), cos),
            Expansion::Tan => {
                let c = self.scratch(n);
                self.sub(Op::Cos, c, vec![src(0)])?;
                let s = self.scratch(n);
                self.sub(Op::Sin, s, vec![src(0)])?;
                self.sub(Op::Div, d, vec![s.as_src(), c.as_src()])?;
            }
            Expansion::Asin | Expansion::Acos => {
                let x = src(0);
                let ax = self.scratch(n);
                self.emit(ArbOp::Abs, ax, vec![x]);
                let r = self.scratch(n);
                let c0 = self.scalar(ACOS_COEFFS[0]);
                let c1 = self.scalar(ACOS_COEFFS[1]);
                self.emit(ArbOp::Mad, r, vec![ax.as_src(), c0, c1]);
                for coeff in &ACOS_COEFFS[2..] {
                    let c = self.scalar(*coeff);
                    self.emit(ArbOp::Mad, r, vec![r.as_src(), ax.as_src(), c]);
                }
                let one = self.scalar(1.0);
                let s = self.scratch(n);
                self.emit(ArbOp::Add, s, vec![one, ax.as_src().negated()]);
                self.sub(Op::Sqrt, s, vec![s.as_src()])?;
                self.emit(ArbOp::Mul, r, vec![r.as_src(), s.as_src()]);

                // k = 1 - 2 * (x < 0) restores the sign.
                let zero = self.scalar(0.0);
                let below = self.scratch(n);
                self.emit(ArbOp::Slt, below, vec![x, zero]);
                let k = self.scratch(n);
                let minus_two = self.scalar(-2.0);
                self.emit(ArbOp::Mad, k, vec![below.as_src(), minus_two, one]);
                if expansion == Expansion::Acos {
                    let pi = self.scalar(PI);
                    let p = self.scratch(n);
                    self.emit(ArbOp::Mul, p, vec![below.as_src(), pi]);
                    self.emit(ArbOp::Mad, d, vec![r.as_src(), k.as_src(), p.as_src()]);
                } else {
                    let half_pi = self.scalar(FRAC_PI_2);
                    self.emit(ArbOp::Add, r, vec![half_pi, r.as_src().negated()]);
                    self.emit(ArbOp::Mul, d, vec![r.as_src(), k.as_src()]);
                }
            }
            Expansion::ExpBase(base) => {
                let b = self.scalar(base);
                let staged = clobbers_sources(d, &stmt.srcs).then(|| self.scratch(n));
                let target = staged.unwrap_or(d);
                for j in 0..n as usize {
                    self.emit(ArbOp::Pow, target.component(j), vec![b, src(0).component(j)]);
                }
                self.unstage(staged, d);
            }
            Expansion::LogScaled(factor) => {
                let t = self.temp(n);
                for j in 0..n as usize {
                    let tj = Dst::new(t, Swizzle::new(&[j as u8]));
                    self.emit(ArbOp::Lg2, tj, vec![src(0).component(j)]);
                }
                let f = self.scalar(factor);
                self.emit(ArbOp::Mul, d, vec![Src::new(t, Swizzle::identity(n)), f]);
            }
            Expansion::Norm => {
                let len = self.scratch(1);
                self.sub(Op::Dot, len, vec![src(0), src(0)])?;
                self.emit(ArbOp::Rsq, len, vec![len.as_src()]);
                self.emit(ArbOp::Mul, d, vec![src(0), len.as_src()]);
            }
            Expansion::Dot2 => {
                let t = self.scratch(2);
                self.emit(ArbOp::Mul, t, vec![src(0), src(1)]);
                let t = t.as_src();
                self.emit(ArbOp::Add, d, vec![t.component(0), t.component(1)]);
            }
            Expansion::Csum => {
                let a = src(0);
                if a.size() == 1 {
                    self.emit(ArbOp::Mov, d, vec![a]);
                } else {
                    let ones = self.literal(&[1.0; 4][..a.size() as usize]);
                    self.sub(Op::Dot, d, vec![a, ones])?;
                }
            }
            Expansion::Cmul => {
                let a = src(0);
                let w = a.size() as usize;
                if w == 1 {
                    self.emit(ArbOp::Mov, d, vec![a]);
                } else {
                    let t = self.scratch(1);
                    let mut acc = a.component(0);
                    for j in 1..w {
                        let target = if j + 1 == w { d } else { t };
                        self.emit(ArbOp::Mul, target, vec![acc, a.component(j)]);
                        acc = t.as_src();
                    }
                }
            }
            Expansion::Lerp => {
                let t = self.scratch(n);
                self.emit(ArbOp::Add, t, vec![src(1), src(2).negated()]);
                self.emit(ArbOp::Mad, d, vec![src(0), t.as_src(), src(2)]);
            }
            Expansion::SetEqual | Expansion::SetNotEqual => {
                let (cmp, combine) = if expansion == Expansion::SetEqual {
                    (ArbOp::Sge, ArbOp::Mul)
                } else {
                    (ArbOp::Slt, ArbOp::Add)
                };
                let t1 = self.scratch(n);
                self.emit(cmp, t1, vec![src(0), src(1)]);
                let t2 = self.scratch(n);
                self.emit(cmp, t2, vec![src(1), src(0)]);
                self.emit(combine, d, vec![t1.as_src(), t2.as_src()]);
            }
            Expansion::SelectCmp => {
                self.emit(ArbOp::Cmp, d, vec![src(0).negated(), src(1), src(2)]);
            }
            Expansion::SelectCc => {
                // The second move reads its source after the first one wrote.
                let late = src(2);
                let staged =
                    (late.reg == d.reg && late.swizzle != d.mask).then(|| self.scratch(n));
                let target = staged.unwrap_or(d);
                let dummy = Dst::new(self.temp(4), target.mask);
                self.push(Instruction::new(ArbOp::Mov, Some(dummy), vec![src(0)]).setting_cc());
                self.push(
                    Instruction::new(ArbOp::Mov, Some(target), vec![src(1)])
                        .with_cc(CcTest::all(CcRel::Gt)),
                );
                self.push(
                    Instruction::new(ArbOp::Mov, Some(target), vec![late])
                        .with_cc(CcTest::all(CcRel::Le)),
                );
                self.unstage(staged, d);
            }
            Expansion::SelectBlend => {
                let zero = self.scalar(0.0);
                let one = self.scalar(1.0);
                let m = self.scratch(n);
                self.emit(ArbOp::Slt, m, vec![zero, src(0)]);
                let inv = self.scratch(n);
                self.emit(ArbOp::Add, inv, vec![one, m.as_src().negated()]);
                let t = self.scratch(n);
                self.emit(ArbOp::Mul, t, vec![src(1), m.as_src()]);
                self.emit(ArbOp::Mad, d, vec![src(2), inv.as_src(), t.as_src()]);
            }
            Expansion::Sample | Expansion::SampleTexel => {
                let tex = stmt
                    .texture
                    .ok_or_else(|| CompileError::invariant("texture lookup without texture"))?;
                let info = self
                    .vreg(tex.reg)
                    .texture
                    .unwrap_or_else(|| TextureInfo::new(tex.dims, 4));
                let rect = tex.dims == TextureDims::Rect;
                let texel = expansion == Expansion::SampleTexel;
                let mut coord = src(0);
                if rect != texel {
                    let [w, h] = info.extent.map(|e| e.max(1) as f32);
                    let scale = if rect { [w, h, 1.0, 1.0] } else { [1.0 / w, 1.0 / h, 1.0, 1.0] };
                    let size = coord.size();
                    let k = self.literal(&scale[..size as usize]);
                    let t = self.scratch(size);
                    self.emit(ArbOp::Mul, t, vec![coord, k]);
                    coord = t.as_src();
                }
                self.sample(d, coord, tex, info.channels);
            }
        }
        Ok(())
    }

    /// Range-reduce to [-pi, pi) and evaluate a Taylor polynomial.
    fn polynomial_sine(&mut self, d: Dst, x: Src, cos: bool) {
        let n = d.size();
        let inv_tau = self.scalar(1.0 / TAU);
        let bias = self.scalar(if cos { 0.75 } else { 0.5 });
        let t = self.scratch(n);
        self.emit(ArbOp::Mad, t, vec![x, inv_tau, bias]);
        self.emit(ArbOp::Frc, t, vec![t.as_src()]);
        let tau = self.scalar(TAU);
        let minus_pi = self.scalar(-PI);
        self.emit(ArbOp::Mad, t, vec![t.as_src(), tau, minus_pi]);

        let x2 = self.scratch(n);
        self.emit(ArbOp::Mul, x2, vec![t.as_src(), t.as_src()]);
        let acc = self.scratch(n);
        let hi = self.scalar(SIN_COEFFS[0]);
        let next = self.scalar(SIN_COEFFS[1]);
        self.emit(ArbOp::Mad, acc, vec![x2.as_src(), hi, next]);
        for coeff in &SIN_COEFFS[2..] {
            let c = self.scalar(*coeff);
            self.emit(ArbOp::Mad, acc, vec![acc.as_src(), x2.as_src(), c]);
        }
        self.emit(ArbOp::Mul, d, vec![acc.as_src(), t.as_src()]);
    }

    /// Emit a lookup, routing through a temporary when the result cannot be
    /// written in place.
    fn sample(&mut self, d: Dst, coord: Src, tex: TexOperand, channels: u8) {
        let layout: &[u8] = match channels {
            1 => &[0],
            2 => &[0, 3],
            3 => &[0, 1, 2],
            _ => &[0, 1, 2, 3],
        };
        let n = d.size();
        let direct = channels != 2 && d.mask.is_identity(n);
        let target = if direct {
            d
        } else {
            Dst::new(self.temp(4), Swizzle::identity(4))
        };
        let mut inst = Instruction::new(ArbOp::Tex, Some(target), vec![coord]);
        inst.texture = Some(tex);
        self.push(inst);
        if !direct {
            let comps: Vec<u8> = (0..n as usize)
                .map(|j| layout.get(j).copied().unwrap_or(j as u8))
                .collect();
            self.emit(ArbOp::Mov, d, vec![Src::new(target.reg, Swizzle::new(&comps))]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::profile_by_name;
    use bumpalo::Bump;

    fn input(b: &mut Builder<'_, '_>, size: u8) -> Src {
        let reg = b.add_vreg(VRegInfo {
            class: RegClass::Input,
            size,
            value: None,
            name: "in".into(),
            data: None,
            texture: None,
        });
        Src::new(reg, Swizzle::identity(size))
    }

    fn ops(b: &Builder<'_, '_>) -> Vec<&'static str> {
        b.code.iter().map(|i| i.op.name()).collect()
    }

    #[test]
    fn test_swap_transform() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut b = Builder::new(profile_by_name("arbfp1").unwrap(), &session);
        let x = input(&mut b, 4);
        let y = input(&mut b, 4);
        let d = b.scratch(4);
        b.lower(&LStmt::new(Op::Sgt, Some(d), vec![x, y])).unwrap();
        assert_eq!(ops(&b), vec!["SLT"]);
        assert_eq!(b.code[0].srcs, vec![y, x]);
    }

    #[test]
    fn test_scalarized_rcp() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut b = Builder::new(profile_by_name("arbvp1").unwrap(), &session);
        let x = input(&mut b, 3);
        let d = b.scratch(3);
        b.lower(&LStmt::new(Op::Rcp, Some(d), vec![x])).unwrap();
        assert_eq!(ops(&b), vec!["RCP", "RCP", "RCP"]);
        assert_eq!(b.code[2].srcs[0].swizzle.to_string(), "z");
        assert_eq!(b.code[2].dest.unwrap().mask.to_string(), "z");
    }

    #[test]
    fn test_constants_are_shared() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut b = Builder::new(profile_by_name("arbfp1").unwrap(), &session);
        let a = b.scalar(0.5);
        let c = b.scalar(0.5);
        let e = b.literal(&[0.5, 1.0]);
        assert_eq!(a.reg, c.reg);
        assert_ne!(a.reg, e.reg);
        assert_eq!(b.vreg(e.reg).data, Some([0.5, 1.0, 0.0, 0.0]));
    }

    #[test]
    fn test_unsupported_operation_names_op_and_profile() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut b = Builder::new(profile_by_name("arbfp1").unwrap(), &session);
        b.context = "statement 0".into();
        let x = input(&mut b, 1);
        let d = b.scratch(1);
        let err = b.lower(&LStmt::new(Op::Dx, Some(d), vec![x])).unwrap_err();
        match err {
            CompileError::UnsupportedOperation { op, profile, .. } => {
                assert_eq!(op, "DX");
                assert_eq!(profile, "arbfp1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_texture_delay_for_luminance_alpha() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut b = Builder::new(profile_by_name("arbfp1").unwrap(), &session);
        let tex = b.add_vreg(VRegInfo {
            class: RegClass::Texture,
            size: 2,
            value: None,
            name: "t".into(),
            data: None,
            texture: Some(TextureInfo::new(TextureDims::D2, 2)),
        });
        let coord = input(&mut b, 2);
        let d = b.scratch(2);
        let mut stmt = LStmt::new(Op::Tex, Some(d), vec![coord]);
        stmt.texture = Some(TexOperand {
            reg: tex,
            dims: TextureDims::D2,
        });
        b.lower(&stmt).unwrap();
        assert_eq!(ops(&b), vec!["TEX", "MOV"]);
        assert_eq!(b.code[1].srcs[0].swizzle.to_string(), "xw");
    }

    #[test]
    fn test_reordered_in_place_write_is_staged() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut b = Builder::new(profile_by_name("arbfp1").unwrap(), &session);
        let t = b.temp(4);
        let d = Dst::new(t, Swizzle::identity(4));
        let reversed = Src::new(t, Swizzle::parse("wzyx").unwrap());
        b.lower(&LStmt::new(Op::Rcp, Some(d), vec![reversed])).unwrap();
        assert_eq!(ops(&b), vec!["RCP", "RCP", "RCP", "RCP", "MOV"]);
        assert!(b.code[..4].iter().all(|i| i.dest.unwrap().reg != t));
        assert_eq!(b.code[4].dest, Some(d));

        // Same register, same order: every component reads itself first.
        let mut b = Builder::new(profile_by_name("arbfp1").unwrap(), &session);
        let t = b.temp(4);
        let d = Dst::new(t, Swizzle::identity(4));
        b.lower(&LStmt::new(Op::Rcp, Some(d), vec![d.as_src()])).unwrap();
        assert_eq!(ops(&b), vec!["RCP", "RCP", "RCP", "RCP"]);
    }

    #[test]
    fn test_clobber_detection() {
        let t = VReg(0);
        let d = Dst::new(t, Swizzle::parse("zx").unwrap());
        assert!(clobbers_sources(d, &[Src::new(t, Swizzle::parse("xz").unwrap())]));
        assert!(!clobbers_sources(d, &[Src::new(t, Swizzle::parse("zx").unwrap())]));
        assert!(!clobbers_sources(d, &[Src::new(VReg(1), Swizzle::parse("xz").unwrap())]));
        assert!(clobbers_sources(d, &[Src::new(t, Swizzle::parse("z").unwrap())]));
    }

    #[test]
    fn test_exp_base_in_place_is_staged() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut b = Builder::new(profile_by_name("arbvp1").unwrap(), &session);
        let t = b.temp(4);
        let d = Dst::new(t, Swizzle::identity(4));
        let reversed = Src::new(t, Swizzle::parse("wzyx").unwrap());
        b.lower(&LStmt::new(Op::Exp10, Some(d), vec![reversed])).unwrap();
        assert_eq!(ops(&b), vec!["POW", "POW", "POW", "POW", "MOV"]);
        assert_eq!(b.code[4].srcs[0].reg, b.code[0].dest.unwrap().reg);
    }

    #[test]
    fn test_select_reading_its_destination_is_staged() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut b = Builder::new(profile_by_name("nvfp").unwrap(), &session);
        let c = input(&mut b, 4);
        let x = input(&mut b, 4);
        let t = b.temp(4);
        let d = Dst::new(t, Swizzle::identity(4));
        let reversed = Src::new(t, Swizzle::parse("wzyx").unwrap());
        b.lower(&LStmt::new(Op::Cond, Some(d), vec![c, x, reversed])).unwrap();
        assert_eq!(ops(&b), vec!["MOV", "MOV", "MOV", "MOV"]);
        assert_ne!(b.code[1].dest.unwrap().reg, t);
        assert_eq!(b.code[3].dest, Some(d));
        assert!(b.code[3].cc.is_none());
    }

    #[test]
    fn test_condition_codes_select() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut b = Builder::new(profile_by_name("nvfp").unwrap(), &session);
        let c = input(&mut b, 1);
        let x = input(&mut b, 2);
        let y = input(&mut b, 2);
        let d = b.scratch(2);
        b.lower(&LStmt::new(Op::Cond, Some(d), vec![c, x, y])).unwrap();
        assert_eq!(ops(&b), vec!["MOV", "MOV", "MOV"]);
        assert!(b.code[0].update_cc);
        assert_eq!(b.code[1].cc, Some(CcTest::all(CcRel::Gt)));
        assert_eq!(b.code[2].cc, Some(CcTest::all(CcRel::Le)));
    }
}
