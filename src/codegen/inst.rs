//! Target instructions over virtual registers.
//!
//! The generator emits [`Instruction`]s that reference [`VReg`]s; allocation
//! later maps every virtual register to a physical [`AsmReg`]. Operand
//! selections keep the statement-level meaning: result component `j` goes to
//! destination component `mask[j]`, and a source contributes component
//! `swizzle[j]` (or its only component, broadcast). [`source_selection`]
//! turns that into the four-wide positional swizzle the target reads.
//!
//! [`AsmReg`]: crate::core::AsmReg

use std::fmt;

use crate::core::RegClass;
use crate::graph::{Swizzle, TextureDims, TextureInfo, ValueId};

/// How a target opcode consumes its sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbKind {
    /// Component-wise.
    Linear,
    /// Reads one component, result replicated.
    Scalar,
    /// Reduces whole vectors to one value, result replicated.
    Collecting,
    /// Result component `p` depends on source positions, not on the mask.
    Positional,
    /// Control flow.
    Flow,
}

#[derive(Debug, Clone, Copy)]
pub struct ArbOpInfo {
    pub name: &'static str,
    pub arity: usize,
    pub kind: ArbKind,
    pub has_dest: bool,
}

macro_rules! arb_ops {
    ($($variant:ident => ($name:literal, $arity:literal, $kind:ident, $dest:literal)),* $(,)?) => {
        /// Target opcodes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ArbOp {
            $($variant),*
        }

        impl ArbOp {
            pub const ALL: &'static [ArbOp] = &[$(ArbOp::$variant),*];

            pub const fn info(self) -> ArbOpInfo {
                match self {
                    $(ArbOp::$variant => ArbOpInfo {
                        name: $name,
                        arity: $arity,
                        kind: ArbKind::$kind,
                        has_dest: $dest,
                    }),*
                }
            }
        }
    };
}

arb_ops! {
    Abs => ("ABS", 1, Linear, true),
    Add => ("ADD", 2, Linear, true),
    Cmp => ("CMP", 3, Linear, true),
    Cos => ("COS", 1, Scalar, true),
    Dp2 => ("DP2", 2, Collecting, true),
    Dp3 => ("DP3", 2, Collecting, true),
    Dp4 => ("DP4", 2, Collecting, true),
    Ex2 => ("EX2", 1, Scalar, true),
    Flr => ("FLR", 1, Linear, true),
    Frc => ("FRC", 1, Linear, true),
    Kil => ("KIL", 1, Positional, false),
    Lg2 => ("LG2", 1, Scalar, true),
    Lit => ("LIT", 1, Positional, true),
    Lrp => ("LRP", 3, Linear, true),
    Mad => ("MAD", 3, Linear, true),
    Max => ("MAX", 2, Linear, true),
    Min => ("MIN", 2, Linear, true),
    Mov => ("MOV", 1, Linear, true),
    Mul => ("MUL", 2, Linear, true),
    Pow => ("POW", 2, Scalar, true),
    Rcp => ("RCP", 1, Scalar, true),
    Rsq => ("RSQ", 1, Scalar, true),
    Sge => ("SGE", 2, Linear, true),
    Sin => ("SIN", 1, Scalar, true),
    Slt => ("SLT", 2, Linear, true),
    Sub => ("SUB", 2, Linear, true),
    Tex => ("TEX", 1, Positional, true),
    Xpd => ("XPD", 2, Positional, true),
    Seq => ("SEQ", 2, Linear, true),
    Sgt => ("SGT", 2, Linear, true),
    Sle => ("SLE", 2, Linear, true),
    Sne => ("SNE", 2, Linear, true),
    Ssg => ("SSG", 1, Linear, true),
    Ddx => ("DDX", 1, Linear, true),
    Ddy => ("DDY", 1, Linear, true),
    Nrm => ("NRM", 1, Positional, true),
    If => ("IF", 0, Flow, false),
    Else => ("ELSE", 0, Flow, false),
    EndIf => ("ENDIF", 0, Flow, false),
    Rep => ("REP", 1, Flow, false),
    EndRep => ("ENDREP", 0, Flow, false),
    Brk => ("BRK", 0, Flow, false),
    Bra => ("BRA", 0, Flow, false),
}

impl ArbOp {
    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn is_flow(self) -> bool {
        self.info().kind == ArbKind::Flow
    }
}

/// Check that target opcode names are unique.
pub fn validate_arb_table() -> Result<(), String> {
    for (i, a) in ArbOp::ALL.iter().enumerate() {
        if *a as usize != i {
            return Err(format!("{:?} listed at position {}", a, i));
        }
        for b in &ArbOp::ALL[..i] {
            if a.name() == b.name() {
                return Err(format!("{:?} and {:?} share the name {}", a, b, a.name()));
            }
        }
    }
    Ok(())
}

impl fmt::Display for ArbOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Virtual register handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(pub u32);

impl VReg {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a virtual register stands for.
#[derive(Debug, Clone, PartialEq)]
pub struct VRegInfo {
    pub class: RegClass,
    pub size: u8,
    /// The named value it holds, if any.
    pub value: Option<ValueId>,
    pub name: String,
    /// Contents of constants and initial contents of parameters.
    pub data: Option<[f32; 4]>,
    pub texture: Option<TextureInfo>,
}

/// Source operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Src {
    pub reg: VReg,
    pub swizzle: Swizzle,
    pub neg: bool,
}

impl Src {
    pub fn new(reg: VReg, swizzle: Swizzle) -> Self {
        Self {
            reg,
            swizzle,
            neg: false,
        }
    }

    pub fn size(&self) -> u8 {
        self.swizzle.len() as u8
    }

    pub fn negated(mut self) -> Self {
        self.neg = !self.neg;
        self
    }

    /// Component `j` of this operand; a scalar is its own component.
    pub fn component(&self, j: usize) -> Src {
        if self.swizzle.len() == 1 {
            return *self;
        }
        Src {
            swizzle: Swizzle::new(&[self.swizzle.get(j)]),
            ..*self
        }
    }

    /// Further select components of this operand.
    pub fn select(&self, comps: &[u8]) -> Src {
        Src {
            swizzle: Swizzle::new(comps).compose(&self.swizzle),
            ..*self
        }
    }
}

/// Destination operand: register and write mask.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dst {
    pub reg: VReg,
    pub mask: Swizzle,
}

impl Dst {
    pub fn new(reg: VReg, mask: Swizzle) -> Self {
        Self { reg, mask }
    }

    pub fn size(&self) -> u8 {
        self.mask.len() as u8
    }

    /// Component `j` of the mask alone.
    pub fn component(&self, j: usize) -> Dst {
        Dst::new(self.reg, Swizzle::new(&[self.mask.get(j)]))
    }

    /// Read back what this destination wrote, in result order.
    pub fn as_src(&self) -> Src {
        Src::new(self.reg, self.mask)
    }
}

/// Condition-code relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcRel {
    Gt,
    Le,
}

impl CcRel {
    pub fn name(self) -> &'static str {
        match self {
            CcRel::Gt => "GT",
            CcRel::Le => "LE",
        }
    }

    pub fn inverse(self) -> CcRel {
        match self {
            CcRel::Gt => CcRel::Le,
            CcRel::Le => CcRel::Gt,
        }
    }

    pub fn holds(self, v: f32) -> bool {
        match self {
            CcRel::Gt => v > 0.0,
            CcRel::Le => v <= 0.0,
        }
    }
}

/// A condition-code test, optionally restricted to one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcTest {
    pub rel: CcRel,
    pub comp: Option<u8>,
}

impl CcTest {
    pub fn x(rel: CcRel) -> Self {
        Self { rel, comp: Some(0) }
    }

    /// Per-component test, matched positionally against the write mask.
    pub fn all(rel: CcRel) -> Self {
        Self { rel, comp: None }
    }
}

impl fmt::Display for CcTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rel.name())?;
        if let Some(c) = self.comp {
            write!(f, ".{}", ["x", "y", "z", "w"][c as usize])?;
        }
        Ok(())
    }
}

/// Branch label handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(pub u32);

/// A texture operand of a sampling instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TexOperand {
    pub reg: VReg,
    pub dims: TextureDims,
}

/// One target instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: ArbOp,
    pub dest: Option<Dst>,
    pub srcs: Vec<Src>,
    pub texture: Option<TexOperand>,
    /// Update the condition codes from the result.
    pub update_cc: bool,
    /// Conditional write or branch condition.
    pub cc: Option<CcTest>,
    pub target: Option<LabelId>,
    /// Resolved jump index, set by label fix-up.
    pub jump: Option<usize>,
    pub origin: Option<usize>,
    pub comment: Option<String>,
}

impl Instruction {
    pub fn new(op: ArbOp, dest: Option<Dst>, srcs: Vec<Src>) -> Self {
        debug_assert!(op.is_flow() || srcs.len() == op.info().arity, "{} arity", op);
        debug_assert_eq!(dest.is_some(), op.info().has_dest, "{} destination", op);
        Self {
            op,
            dest,
            srcs,
            texture: None,
            update_cc: false,
            cc: None,
            target: None,
            jump: None,
            origin: None,
            comment: None,
        }
    }

    pub fn flow(op: ArbOp) -> Self {
        Self::new(op, None, Vec::new())
    }

    pub fn branch(target: LabelId, cc: Option<CcTest>) -> Self {
        let mut inst = Self::flow(ArbOp::Bra);
        inst.target = Some(target);
        inst.cc = cc;
        inst
    }

    pub fn with_cc(mut self, cc: CcTest) -> Self {
        self.cc = Some(cc);
        self
    }

    pub fn setting_cc(mut self) -> Self {
        self.update_cc = true;
        self
    }

    /// Registers read by this instruction.
    pub fn reads(&self) -> impl Iterator<Item = VReg> + '_ {
        self.srcs.iter().map(|s| s.reg)
    }

    /// The write leaves some components of the destination untouched.
    pub fn is_partial_write(&self, size: u8) -> bool {
        match &self.dest {
            Some(d) => self.cc.is_some() || !covers(&d.mask, size),
            None => false,
        }
    }
}

fn covers(mask: &Swizzle, size: u8) -> bool {
    (0..size).all(|c| mask.comps().contains(&c))
}

/// Positional four-wide swizzle a source is read with.
///
/// Component-wise opcodes place source component `j` at destination position
/// `mask[j]`. Scalar opcodes and single-component sources replicate.
/// Collecting and positional opcodes read the selection as written, padded
/// with the identity.
pub fn source_selection(op: ArbOp, src: &Swizzle, mask: Option<&Swizzle>) -> [u8; 4] {
    if src.len() == 1 || op.info().kind == ArbKind::Scalar {
        return [src.get(0); 4];
    }
    let mut out = [0, 1, 2, 3];
    match (op.info().kind, mask) {
        (ArbKind::Linear, Some(mask)) => {
            for (j, w) in mask.comps().iter().enumerate() {
                if j < src.len() {
                    out[*w as usize] = src.get(j);
                }
            }
        }
        _ => {
            for (j, c) in src.comps().iter().enumerate() {
                out[j] = *c;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arb_table_is_consistent() {
        validate_arb_table().unwrap();
        assert!(ArbOp::Rcp.info().kind == ArbKind::Scalar);
        assert!(!ArbOp::Kil.info().has_dest);
    }

    #[test]
    fn test_source_selection_follows_mask() {
        let src = Swizzle::parse("zy").unwrap();
        let mask = Swizzle::parse("yw").unwrap();
        assert_eq!(source_selection(ArbOp::Add, &src, Some(&mask)), [0, 2, 2, 1]);

        let scalar = Swizzle::parse("w").unwrap();
        assert_eq!(source_selection(ArbOp::Mul, &scalar, Some(&mask)), [3; 4]);
        assert_eq!(source_selection(ArbOp::Rcp, &src, None), [2; 4]);
        assert_eq!(source_selection(ArbOp::Dp3, &src, Some(&mask)), [2, 1, 2, 3]);
    }

    #[test]
    fn test_partial_write_detection() {
        let full = Instruction::new(
            ArbOp::Mov,
            Some(Dst::new(VReg(0), Swizzle::identity(3))),
            vec![Src::new(VReg(1), Swizzle::identity(3))],
        );
        assert!(!full.is_partial_write(3));
        assert!(full.is_partial_write(4));
        let cond = full.clone().with_cc(CcTest::all(CcRel::Gt));
        assert!(cond.is_partial_write(3));
    }

    #[test]
    fn test_src_component_and_select() {
        let src = Src::new(VReg(2), Swizzle::parse("wzy").unwrap());
        assert_eq!(src.component(1).swizzle.to_string(), "z");
        assert_eq!(src.select(&[2, 0]).swizzle.to_string(), "yw");
        let scalar = Src::new(VReg(2), Swizzle::parse("y").unwrap());
        assert_eq!(scalar.component(3).swizzle.to_string(), "y");
    }
}
