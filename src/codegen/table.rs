//! The lowering table.
//!
//! Each intermediate opcode maps to an ordered list of rules. A rule applies
//! when every selector bit it requires is present in the environment: the
//! profile's selectors plus the vector-length bit of the widest source. The
//! first applicable rule wins. Rules either name a native target opcode or a
//! macro expansion, and may ask for the statement to be split per component,
//! for its first two sources to be swapped, or for its first source to be
//! negated first.

use crate::graph::Op;
use crate::target::Selectors;

use super::inst::ArbOp;

/// Multi-instruction expansions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Expansion {
    Div,
    Sqrt,
    Ceil,
    Mod,
    Sgn,
    Rnd,
    /// Polynomial sine or cosine for profiles without native trigonometry.
    Trig { cos: bool },
    Tan,
    Asin,
    Acos,
    /// `base ^ x` per component.
    ExpBase(f32),
    /// `log2(x) * factor` per component.
    LogScaled(f32),
    Norm,
    Dot2,
    Csum,
    Cmul,
    Lerp,
    SetEqual,
    SetNotEqual,
    /// Selection through CMP.
    SelectCmp,
    /// Selection through two conditional moves.
    SelectCc,
    /// Selection through a 0/1 blend.
    SelectBlend,
    Sample,
    SampleTexel,
}

/// What a rule produces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lowering {
    Native(ArbOp),
    Macro(Expansion),
}

/// Rewrites applied before the lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transforms {
    /// Lower once per destination component.
    pub scalarize: bool,
    /// Exchange the first two sources.
    pub swap: bool,
    /// Negate the first source.
    pub negate_first: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoweringRule {
    pub op: Op,
    /// Selector bits that must all be present.
    pub filters: Selectors,
    pub lowering: Lowering,
    pub transforms: Transforms,
}

const NO_TRANSFORMS: Transforms = Transforms {
    scalarize: false,
    swap: false,
    negate_first: false,
};

const fn native(op: Op, filters: Selectors, arb: ArbOp) -> LoweringRule {
    LoweringRule {
        op,
        filters,
        lowering: Lowering::Native(arb),
        transforms: NO_TRANSFORMS,
    }
}

const fn expand(op: Op, filters: Selectors, expansion: Expansion) -> LoweringRule {
    LoweringRule {
        op,
        filters,
        lowering: Lowering::Macro(expansion),
        transforms: NO_TRANSFORMS,
    }
}

impl LoweringRule {
    const fn scalarized(mut self) -> Self {
        self.transforms.scalarize = true;
        self
    }

    const fn swapped(mut self) -> Self {
        self.transforms.swap = true;
        self
    }

    const fn negated(mut self) -> Self {
        self.transforms.negate_first = true;
        self
    }
}

const ANY: Selectors = Selectors::NONE;
const VP: Selectors = Selectors::VP;
const FP: Selectors = Selectors::FP;
const NVVP2: Selectors = Selectors::NVVP2;
const NVFP: Selectors = Selectors::NVFP;
const NVFP2_VEC2: Selectors = Selectors::NVFP2.union(Selectors::VEC2);
const NVFP2_VEC3: Selectors = Selectors::NVFP2.union(Selectors::VEC3);

static LOWERING_TABLE: &[LoweringRule] = &[
    native(Op::Asn, ANY, ArbOp::Mov),
    native(Op::Neg, ANY, ArbOp::Mov).negated(),
    native(Op::Add, ANY, ArbOp::Add),
    native(Op::Mul, ANY, ArbOp::Mul),
    expand(Op::Div, ANY, Expansion::Div),
    native(Op::Slt, ANY, ArbOp::Slt),
    native(Op::Sge, ANY, ArbOp::Sge),
    native(Op::Sle, NVVP2, ArbOp::Sle),
    native(Op::Sle, NVFP, ArbOp::Sle),
    native(Op::Sle, ANY, ArbOp::Sge).swapped(),
    native(Op::Sgt, NVVP2, ArbOp::Sgt),
    native(Op::Sgt, NVFP, ArbOp::Sgt),
    native(Op::Sgt, ANY, ArbOp::Slt).swapped(),
    native(Op::Seq, NVVP2, ArbOp::Seq),
    native(Op::Seq, NVFP, ArbOp::Seq),
    expand(Op::Seq, ANY, Expansion::SetEqual),
    native(Op::Sne, NVVP2, ArbOp::Sne),
    native(Op::Sne, NVFP, ArbOp::Sne),
    expand(Op::Sne, ANY, Expansion::SetNotEqual),
    native(Op::Abs, ANY, ArbOp::Abs),
    expand(Op::Acos, ANY, Expansion::Acos),
    expand(Op::Asin, ANY, Expansion::Asin),
    expand(Op::Ceil, ANY, Expansion::Ceil),
    native(Op::Cos, FP, ArbOp::Cos).scalarized(),
    expand(Op::Cos, VP, Expansion::Trig { cos: true }),
    expand(Op::Cmul, ANY, Expansion::Cmul),
    expand(Op::Csum, ANY, Expansion::Csum),
    native(Op::Dot, Selectors::VEC1, ArbOp::Mul),
    native(Op::Dot, NVFP2_VEC2, ArbOp::Dp2),
    expand(Op::Dot, Selectors::VEC2, Expansion::Dot2),
    native(Op::Dot, Selectors::VEC3, ArbOp::Dp3),
    native(Op::Dot, Selectors::VEC4, ArbOp::Dp4),
    native(Op::Dx, NVFP, ArbOp::Ddx),
    native(Op::Dy, NVFP, ArbOp::Ddy),
    expand(Op::Exp, ANY, Expansion::ExpBase(std::f32::consts::E)),
    native(Op::Exp2, ANY, ArbOp::Ex2).scalarized(),
    expand(Op::Exp10, ANY, Expansion::ExpBase(10.0)),
    native(Op::Flr, ANY, ArbOp::Flr),
    native(Op::Frac, ANY, ArbOp::Frc),
    native(Op::Lit, ANY, ArbOp::Lit),
    expand(Op::Log, ANY, Expansion::LogScaled(std::f32::consts::LN_2)),
    native(Op::Log2, ANY, ArbOp::Lg2).scalarized(),
    expand(Op::Log10, ANY, Expansion::LogScaled(std::f32::consts::LOG10_2)),
    native(Op::Lrp, FP, ArbOp::Lrp),
    expand(Op::Lrp, ANY, Expansion::Lerp),
    native(Op::Mad, ANY, ArbOp::Mad),
    native(Op::Max, ANY, ArbOp::Max),
    native(Op::Min, ANY, ArbOp::Min),
    expand(Op::Mod, ANY, Expansion::Mod),
    native(Op::Pow, ANY, ArbOp::Pow).scalarized(),
    native(Op::Rcp, ANY, ArbOp::Rcp).scalarized(),
    expand(Op::Rnd, ANY, Expansion::Rnd),
    native(Op::Rsq, ANY, ArbOp::Rsq).scalarized(),
    native(Op::Sin, FP, ArbOp::Sin).scalarized(),
    expand(Op::Sin, VP, Expansion::Trig { cos: false }),
    native(Op::Sgn, NVVP2, ArbOp::Ssg),
    expand(Op::Sgn, ANY, Expansion::Sgn),
    expand(Op::Sqrt, ANY, Expansion::Sqrt).scalarized(),
    expand(Op::Tan, ANY, Expansion::Tan),
    native(Op::Norm, NVFP2_VEC3, ArbOp::Nrm),
    expand(Op::Norm, ANY, Expansion::Norm),
    native(Op::Xpd, Selectors::VEC3, ArbOp::Xpd),
    expand(Op::Tex, NVVP2, Expansion::Sample),
    expand(Op::Tex, FP, Expansion::Sample),
    expand(Op::Texi, NVVP2, Expansion::SampleTexel),
    expand(Op::Texi, FP, Expansion::SampleTexel),
    expand(Op::Cond, NVFP, Expansion::SelectCc),
    expand(Op::Cond, NVVP2, Expansion::SelectCc),
    expand(Op::Cond, FP, Expansion::SelectCmp),
    expand(Op::Cond, ANY, Expansion::SelectBlend),
    native(Op::Kil, FP, ArbOp::Kil).negated(),
];

/// Opcodes deliberately left without any lowering.
pub const UNLOWERED: &[Op] = &[Op::Atan, Op::Atan2];

/// Every rule, in priority order.
pub fn lowering_table() -> &'static [LoweringRule] {
    LOWERING_TABLE
}

/// First rule for `op` whose filters `env` satisfies.
pub fn select(op: Op, env: Selectors) -> Option<&'static LoweringRule> {
    LOWERING_TABLE
        .iter()
        .find(|rule| rule.op == op && env.satisfies(rule.filters))
}

/// Check the table against the opcode definitions.
pub fn validate_lowering_table() -> Result<(), String> {
    for rule in LOWERING_TABLE {
        let arity = rule.op.info().arity;
        if matches!(rule.op, Op::StartSec | Op::EndSec) {
            return Err(format!("{} is a marker and must not be lowered", rule.op));
        }
        if UNLOWERED.contains(&rule.op) {
            return Err(format!("{} is listed as unlowered but has a rule", rule.op));
        }
        if let Lowering::Native(arb) = rule.lowering {
            if arb.info().arity != arity {
                return Err(format!(
                    "{} lowers to {} with {} sources instead of {}",
                    rule.op,
                    arb,
                    arb.info().arity,
                    arity
                ));
            }
            if arb.is_flow() {
                return Err(format!("{} lowers to control-flow opcode {}", rule.op, arb));
            }
        }
        if rule.transforms.swap && arity < 2 {
            return Err(format!("{} swaps sources but takes {}", rule.op, arity));
        }
        if rule.transforms.negate_first && arity < 1 {
            return Err(format!("{} negates a source it does not have", rule.op));
        }
    }
    for op in Op::ALL {
        if matches!(op, Op::StartSec | Op::EndSec) || UNLOWERED.contains(op) {
            continue;
        }
        if !LOWERING_TABLE.iter().any(|r| r.op == *op) {
            return Err(format!("{} has no lowering rule", op));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::profile_by_name;

    fn env(profile: &str, width: u8) -> Selectors {
        profile_by_name(profile).unwrap().selectors | Selectors::vec(width)
    }

    #[test]
    fn test_table_is_consistent() {
        validate_lowering_table().unwrap();
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let rule = select(Op::Sle, env("nvfp", 4)).unwrap();
        assert_eq!(rule.lowering, Lowering::Native(ArbOp::Sle));
        let rule = select(Op::Sle, env("arbfp1", 4)).unwrap();
        assert_eq!(rule.lowering, Lowering::Native(ArbOp::Sge));
        assert!(rule.transforms.swap);
    }

    #[test]
    fn test_vector_length_selects_dot_product() {
        let dp = |p, w| select(Op::Dot, env(p, w)).unwrap().lowering;
        assert_eq!(dp("arbfp1", 1), Lowering::Native(ArbOp::Mul));
        assert_eq!(dp("arbfp1", 2), Lowering::Macro(Expansion::Dot2));
        assert_eq!(dp("nvfp2", 2), Lowering::Native(ArbOp::Dp2));
        assert_eq!(dp("arbvp1", 3), Lowering::Native(ArbOp::Dp3));
        assert_eq!(dp("nvfp", 4), Lowering::Native(ArbOp::Dp4));
    }

    #[test]
    fn test_missing_lowerings() {
        assert!(select(Op::Atan, env("nvfp2", 4)).is_none());
        assert!(select(Op::Dx, env("arbfp1", 4)).is_none());
        assert!(select(Op::Kil, env("nvvp2", 4)).is_none());
        assert!(select(Op::Tex, env("arbvp1", 2)).is_none());
        assert!(select(Op::Dx, env("nvfp", 4)).is_some());
    }

    #[test]
    fn test_condition_selection_by_capability() {
        let cond = |p| select(Op::Cond, env(p, 4)).unwrap().lowering;
        assert_eq!(cond("nvfp2"), Lowering::Macro(Expansion::SelectCc));
        assert_eq!(cond("nvvp2"), Lowering::Macro(Expansion::SelectCc));
        assert_eq!(cond("arbfp1"), Lowering::Macro(Expansion::SelectCmp));
        assert_eq!(cond("arbvp1"), Lowering::Macro(Expansion::SelectBlend));
    }
}
