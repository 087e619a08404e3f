//! Intermediate statements and the static opcode table.
//!
//! `Op::info()` is the single source of truth for a statement's arity and
//! result shape. The table is checked for unique names and complete coverage
//! the first time it is indexed by name.

use std::fmt;
use std::sync::OnceLock;

use hashbrown::HashMap;

use super::value::Operand;

/// How a statement's result relates to its sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// Component-wise: result has as many components as the widest source.
    Linear,
    /// Combines all source components into a single component.
    Collecting,
    /// Operates on whole vectors with a fixed result width.
    Whole,
    /// Texture lookup; width follows the texture.
    Sample,
    /// No destination.
    NoResult,
}

/// Static description of an intermediate opcode.
#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    pub arity: usize,
    pub shape: ResultShape,
}

macro_rules! ops {
    ($($variant:ident => ($name:literal, $arity:literal, $shape:ident)),* $(,)?) => {
        /// Intermediate opcodes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Op {
            $($variant),*
        }

        impl Op {
            /// Every opcode, in declaration order.
            pub const ALL: &'static [Op] = &[$(Op::$variant),*];

            pub const fn info(self) -> OpInfo {
                match self {
                    $(Op::$variant => OpInfo {
                        name: $name,
                        arity: $arity,
                        shape: ResultShape::$shape,
                    }),*
                }
            }
        }
    };
}

ops! {
    Asn => ("ASN", 1, Linear),
    Neg => ("NEG", 1, Linear),
    Add => ("ADD", 2, Linear),
    Mul => ("MUL", 2, Linear),
    Div => ("DIV", 2, Linear),
    Slt => ("SLT", 2, Linear),
    Sle => ("SLE", 2, Linear),
    Sgt => ("SGT", 2, Linear),
    Sge => ("SGE", 2, Linear),
    Seq => ("SEQ", 2, Linear),
    Sne => ("SNE", 2, Linear),
    Abs => ("ABS", 1, Linear),
    Acos => ("ACOS", 1, Linear),
    Asin => ("ASIN", 1, Linear),
    Atan => ("ATAN", 1, Linear),
    Atan2 => ("ATAN2", 2, Linear),
    Ceil => ("CEIL", 1, Linear),
    Cos => ("COS", 1, Linear),
    Cmul => ("CMUL", 1, Collecting),
    Csum => ("CSUM", 1, Collecting),
    Dot => ("DOT", 2, Collecting),
    Dx => ("DX", 1, Linear),
    Dy => ("DY", 1, Linear),
    Exp => ("EXP", 1, Linear),
    Exp2 => ("EXP2", 1, Linear),
    Exp10 => ("EXP10", 1, Linear),
    Flr => ("FLR", 1, Linear),
    Frac => ("FRAC", 1, Linear),
    Lit => ("LIT", 1, Whole),
    Log => ("LOG", 1, Linear),
    Log2 => ("LOG2", 1, Linear),
    Log10 => ("LOG10", 1, Linear),
    Lrp => ("LRP", 3, Linear),
    Mad => ("MAD", 3, Linear),
    Max => ("MAX", 2, Linear),
    Min => ("MIN", 2, Linear),
    Mod => ("MOD", 2, Linear),
    Pow => ("POW", 2, Linear),
    Rcp => ("RCP", 1, Linear),
    Rnd => ("RND", 1, Linear),
    Rsq => ("RSQ", 1, Linear),
    Sin => ("SIN", 1, Linear),
    Sgn => ("SGN", 1, Linear),
    Sqrt => ("SQRT", 1, Linear),
    Tan => ("TAN", 1, Linear),
    Norm => ("NORM", 1, Whole),
    Xpd => ("XPD", 2, Whole),
    Tex => ("TEX", 2, Sample),
    Texi => ("TEXI", 2, Sample),
    Cond => ("COND", 3, Linear),
    Kil => ("KIL", 1, NoResult),
    StartSec => ("STARTSEC", 0, NoResult),
    EndSec => ("ENDSEC", 0, NoResult),
}

fn name_index() -> &'static HashMap<&'static str, Op> {
    static INDEX: OnceLock<HashMap<&'static str, Op>> = OnceLock::new();
    INDEX.get_or_init(|| {
        if let Err(msg) = validate_op_table() {
            panic!("opcode table is inconsistent: {}", msg);
        }
        Op::ALL.iter().map(|op| (op.info().name, *op)).collect()
    })
}

/// Check that every opcode appears once in `Op::ALL` under a unique name.
pub fn validate_op_table() -> Result<(), String> {
    let mut seen: HashMap<&'static str, Op> = HashMap::new();
    for (pos, op) in Op::ALL.iter().enumerate() {
        if *op as usize != pos {
            return Err(format!("{:?} listed at position {}", op, pos));
        }
        let info = op.info();
        if let Some(prev) = seen.insert(info.name, *op) {
            return Err(format!("{:?} and {:?} share the name {}", prev, op, info.name));
        }
        if info.shape == ResultShape::NoResult && info.arity > 1 {
            return Err(format!("{} has no result but {} sources", info.name, info.arity));
        }
    }
    Ok(())
}

impl Op {
    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Look up an opcode by mnemonic, ignoring case.
    pub fn from_name(name: &str) -> Option<Op> {
        name_index().get(name.to_ascii_uppercase().as_str()).copied()
    }

    pub fn has_result(self) -> bool {
        self.info().shape != ResultShape::NoResult
    }

    /// Width of the result given the source widths, or `None` when it
    /// depends on a texture.
    pub fn result_size(self, src_sizes: &[u8]) -> Option<u8> {
        let widest = src_sizes.iter().copied().max().unwrap_or(1);
        match self.info().shape {
            ResultShape::Linear => Some(match self {
                Op::Cond => src_sizes.iter().skip(1).copied().max().unwrap_or(1),
                _ => widest,
            }),
            ResultShape::Collecting => Some(1),
            ResultShape::Whole => Some(match self {
                Op::Lit => 4,
                Op::Xpd => 3,
                _ => widest,
            }),
            ResultShape::Sample => None,
            ResultShape::NoResult => Some(0),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Side information attached to a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtInfo {
    Comment(String),
    /// Index of the front-end statement this came from.
    Origin(usize),
    /// Name carried by a section marker.
    SectionName(String),
}

/// A three-address statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub op: Op,
    pub dest: Option<Operand>,
    pub src: Vec<Operand>,
    pub info: Vec<StmtInfo>,
}

impl Statement {
    pub fn new(op: Op, dest: Option<Operand>, src: Vec<Operand>) -> Self {
        assert_eq!(
            src.len(),
            op.info().arity,
            "{} takes {} sources",
            op,
            op.info().arity
        );
        assert_eq!(
            dest.is_some(),
            op.has_result(),
            "{} destination mismatch",
            op
        );
        Self {
            op,
            dest,
            src,
            info: Vec::new(),
        }
    }

    /// Section start or end marker.
    pub fn marker(op: Op, name: Option<&str>) -> Self {
        assert!(matches!(op, Op::StartSec | Op::EndSec));
        let mut stmt = Self::new(op, None, Vec::new());
        if let Some(name) = name {
            stmt.info.push(StmtInfo::SectionName(name.to_string()));
        }
        stmt
    }

    pub fn with_info(mut self, info: StmtInfo) -> Self {
        self.info.push(info);
        self
    }

    pub fn origin(&self) -> Option<usize> {
        self.info.iter().find_map(|i| match i {
            StmtInfo::Origin(n) => Some(*n),
            _ => None,
        })
    }

    pub fn comment(&self) -> Option<&str> {
        self.info.iter().find_map(|i| match i {
            StmtInfo::Comment(c) => Some(c.as_str()),
            _ => None,
        })
    }

    pub fn section_name(&self) -> Option<&str> {
        self.info.iter().find_map(|i| match i {
            StmtInfo::SectionName(s) => Some(s.as_str()),
            _ => None,
        })
    }
}
