// This module is the Register & Capability Model: a static catalogue of target variants
// of the ARB program family. Each Profile names its program kind, the assembly header and
// OPTION line it prints, the selector bits the lowering table filters on, the optional
// capabilities the control-flow emitter checks (structured IF/REP brackets, labeled
// branches, condition codes, half-precision temporaries) and a hard capacity per register
// class. The catalogue is read-only; the generator only ever borrows a &'static Profile.

//! Target variants and their capabilities.

pub mod bindings;

use std::fmt;
use std::ops::BitOr;

use crate::core::{CompileError, CompileResult, RegClass};
use crate::graph::ProgramKind;

pub use bindings::{binding_name, input_bindings, output_bindings, BindingSpec};

/// Bits the lowering table matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Selectors(u32);

impl Selectors {
    pub const NONE: Selectors = Selectors(0);
    /// Any vertex profile.
    pub const VP: Selectors = Selectors(1 << 0);
    /// Any fragment profile.
    pub const FP: Selectors = Selectors(1 << 1);
    pub const NVVP2: Selectors = Selectors(1 << 2);
    pub const NVFP: Selectors = Selectors(1 << 3);
    pub const NVFP2: Selectors = Selectors(1 << 4);
    pub const VEC1: Selectors = Selectors(1 << 8);
    pub const VEC2: Selectors = Selectors(1 << 9);
    pub const VEC3: Selectors = Selectors(1 << 10);
    pub const VEC4: Selectors = Selectors(1 << 11);

    pub const fn union(self, other: Selectors) -> Selectors {
        Selectors(self.0 | other.0)
    }

    /// True if every bit of `required` is set in `self`.
    pub const fn satisfies(self, required: Selectors) -> bool {
        self.0 & required.0 == required.0
    }

    /// Vector-length bit for an operand width.
    pub fn vec(size: u8) -> Selectors {
        match size {
            1 => Selectors::VEC1,
            2 => Selectors::VEC2,
            3 => Selectors::VEC3,
            _ => Selectors::VEC4,
        }
    }
}

impl BitOr for Selectors {
    type Output = Selectors;

    fn bitor(self, rhs: Selectors) -> Selectors {
        self.union(rhs)
    }
}

/// Optional features of a target variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// IF/ELSE/ENDIF brackets.
    pub structured_branching: bool,
    /// REP/ENDREP/BRK brackets.
    pub repeat_loops: bool,
    /// BRA to labels.
    pub labeled_branches: bool,
    /// Condition-code register, conditional writes.
    pub condition_codes: bool,
    /// Half-precision temporaries.
    pub half_precision: bool,
    pub max_vector_length: u8,
    /// Iteration cap of a REP loop.
    pub max_loop_count: u32,
}

impl Capabilities {
    const BASE: Capabilities = Capabilities {
        structured_branching: false,
        repeat_loops: false,
        labeled_branches: false,
        condition_codes: false,
        half_precision: false,
        max_vector_length: 4,
        max_loop_count: 255,
    };

    /// Any form of native branching.
    pub fn branching(&self) -> bool {
        self.structured_branching || self.labeled_branches
    }
}

/// A target variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub name: &'static str,
    pub kind: ProgramKind,
    pub header: &'static str,
    pub option: Option<&'static str>,
    pub selectors: Selectors,
    pub caps: Capabilities,
    limits: [usize; RegClass::COUNT],
}

impl Profile {
    /// Capacity of a register class.
    pub fn limit(&self, class: RegClass) -> usize {
        self.limits[class.index()]
    }

    pub fn limits(&self) -> [usize; RegClass::COUNT] {
        self.limits
    }

    pub fn has(&self, selector: Selectors) -> bool {
        self.selectors.satisfies(selector)
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind.name())?;
        let caps = &self.caps;
        let mut features = Vec::new();
        if caps.structured_branching {
            features.push("if");
        }
        if caps.repeat_loops {
            features.push("rep");
        }
        if caps.labeled_branches {
            features.push("bra");
        }
        if caps.condition_codes {
            features.push("cc");
        }
        if caps.half_precision {
            features.push("half");
        }
        if !features.is_empty() {
            write!(f, " [{}]", features.join(", "))?;
        }
        write!(
            f,
            " temps={} params={} consts={} textures={}",
            self.limit(RegClass::Temp),
            self.limit(RegClass::Param),
            self.limit(RegClass::Const),
            self.limit(RegClass::Texture)
        )
    }
}

// Temp, Half, Input, Output, Param, Address, Const, Texture
const ARBVP1_LIMITS: [usize; RegClass::COUNT] = [12, 0, 16, 16, 96, 1, 96, 0];
const NVVP2_LIMITS: [usize; RegClass::COUNT] = [16, 0, 16, 16, 256, 2, 256, 4];
const FP_LIMITS: [usize; RegClass::COUNT] = [32, 0, 10, 2, 64, 0, 64, 16];
const NVFP_LIMITS: [usize; RegClass::COUNT] = [32, 64, 10, 2, 64, 0, 64, 16];

static PROFILES: [Profile; 5] = [
    Profile {
        name: "arbvp1",
        kind: ProgramKind::Vertex,
        header: "!!ARBvp1.0",
        option: None,
        selectors: Selectors::VP,
        caps: Capabilities::BASE,
        limits: ARBVP1_LIMITS,
    },
    Profile {
        name: "nvvp2",
        kind: ProgramKind::Vertex,
        header: "!!ARBvp1.0",
        option: Some("NV_vertex_program2"),
        selectors: Selectors::VP.union(Selectors::NVVP2),
        caps: Capabilities {
            labeled_branches: true,
            condition_codes: true,
            ..Capabilities::BASE
        },
        limits: NVVP2_LIMITS,
    },
    Profile {
        name: "arbfp1",
        kind: ProgramKind::Fragment,
        header: "!!ARBfp1.0",
        option: None,
        selectors: Selectors::FP,
        caps: Capabilities::BASE,
        limits: FP_LIMITS,
    },
    Profile {
        name: "nvfp",
        kind: ProgramKind::Fragment,
        header: "!!ARBfp1.0",
        option: Some("NV_fragment_program"),
        selectors: Selectors::FP.union(Selectors::NVFP),
        caps: Capabilities {
            condition_codes: true,
            half_precision: true,
            ..Capabilities::BASE
        },
        limits: NVFP_LIMITS,
    },
    Profile {
        name: "nvfp2",
        kind: ProgramKind::Fragment,
        header: "!!ARBfp1.0",
        option: Some("NV_fragment_program2"),
        selectors: Selectors::FP
            .union(Selectors::NVFP)
            .union(Selectors::NVFP2),
        caps: Capabilities {
            structured_branching: true,
            repeat_loops: true,
            condition_codes: true,
            half_precision: true,
            ..Capabilities::BASE
        },
        limits: NVFP_LIMITS,
    },
];

/// Every known profile.
pub fn profiles() -> &'static [Profile] {
    &PROFILES
}

/// Look up a profile by name.
pub fn profile_by_name(name: &str) -> CompileResult<&'static Profile> {
    PROFILES
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| CompileError::UnknownProfile {
            name: name.to_string(),
        })
}

/// The baseline profile for a program kind.
pub fn default_profile(kind: ProgramKind) -> &'static Profile {
    match kind {
        ProgramKind::Vertex => &PROFILES[0],
        ProgramKind::Fragment => &PROFILES[2],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert_eq!(profile_by_name("NVFP2").unwrap().name, "nvfp2");
        assert!(matches!(
            profile_by_name("ps_3_0"),
            Err(CompileError::UnknownProfile { .. })
        ));
        assert_eq!(default_profile(ProgramKind::Vertex).name, "arbvp1");
    }

    #[test]
    fn test_selectors_follow_kind() {
        for profile in profiles() {
            let vp = profile.has(Selectors::VP);
            assert_eq!(vp, profile.kind == ProgramKind::Vertex, "{}", profile.name);
            assert_ne!(vp, profile.has(Selectors::FP));
        }
        let nvfp2 = profile_by_name("nvfp2").unwrap();
        assert!(nvfp2.has(Selectors::NVFP | Selectors::FP));
        assert!(!nvfp2.has(Selectors::NVVP2));
    }

    #[test]
    fn test_capabilities() {
        let arbfp1 = profile_by_name("arbfp1").unwrap();
        assert!(!arbfp1.caps.branching());
        assert_eq!(arbfp1.limit(RegClass::Temp), 32);
        assert_eq!(arbfp1.limit(RegClass::Half), 0);

        let nvvp2 = profile_by_name("nvvp2").unwrap();
        assert!(nvvp2.caps.labeled_branches && !nvvp2.caps.repeat_loops);
        assert_eq!(nvvp2.limit(RegClass::Address), 2);

        for profile in profiles() {
            assert!(profile.caps.max_vector_length <= 4);
            assert!(!(profile.caps.repeat_loops && profile.caps.labeled_branches));
        }
    }

    #[test]
    fn test_display() {
        let text = profile_by_name("nvfp2").unwrap().to_string();
        assert!(text.starts_with("nvfp2 (fragment) [if, rep, cc, half]"));
    }
}
