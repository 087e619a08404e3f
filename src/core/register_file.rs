//! Register classes and per-class occupancy tracking.
//!
//! The target has no memory to spill to: every class has a hard capacity set
//! by the active profile. [`RegisterFile`] hands out the lowest free index in a
//! class, remembers the high-water mark, and reports an overflow once demand is
//! known to exceed the capacity.

use std::fmt;

use thiserror::Error;

use super::error::CompileError;

/// Register class tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegClass {
    Temp,
    Half,
    Input,
    Output,
    Param,
    Address,
    Const,
    Texture,
}

impl RegClass {
    pub const ALL: [RegClass; 8] = [
        RegClass::Temp,
        RegClass::Half,
        RegClass::Input,
        RegClass::Output,
        RegClass::Param,
        RegClass::Address,
        RegClass::Const,
        RegClass::Texture,
    ];

    /// Number of register classes.
    pub const COUNT: usize = 8;

    pub const fn index(self) -> usize {
        match self {
            RegClass::Temp => 0,
            RegClass::Half => 1,
            RegClass::Input => 2,
            RegClass::Output => 3,
            RegClass::Param => 4,
            RegClass::Address => 5,
            RegClass::Const => 6,
            RegClass::Texture => 7,
        }
    }

    /// Class name used in diagnostics and overflow errors.
    pub const fn name(self) -> &'static str {
        match self {
            RegClass::Temp => "temp",
            RegClass::Half => "half",
            RegClass::Input => "input",
            RegClass::Output => "output",
            RegClass::Param => "param",
            RegClass::Address => "address",
            RegClass::Const => "const",
            RegClass::Texture => "texture",
        }
    }

    /// Prefix of the register names printed in assembly.
    pub const fn prefix(self) -> &'static str {
        match self {
            RegClass::Temp => "r",
            RegClass::Half => "h",
            RegClass::Input => "i",
            RegClass::Output => "o",
            RegClass::Param => "u",
            RegClass::Address => "a",
            RegClass::Const => "c",
            RegClass::Texture => "texture",
        }
    }

    /// Temporaries are the only classes whose indices are reused.
    pub const fn is_temporary(self) -> bool {
        matches!(self, RegClass::Temp | RegClass::Half)
    }
}

impl fmt::Display for RegClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A physical register: class plus index within the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsmReg {
    pub class: RegClass,
    pub index: u16,
}

impl AsmReg {
    pub const fn new(class: RegClass, index: u16) -> Self {
        Self { class, index }
    }
}

impl fmt::Display for AsmReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class {
            RegClass::Texture => write!(f, "texture[{}]", self.index),
            class => write!(f, "{}{}", class.prefix(), self.index),
        }
    }
}

/// Growable bit set over register indices of one class.
#[derive(Debug, Clone, Default)]
pub struct RegBitSet {
    words: Vec<u64>,
}

impl RegBitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, idx: usize) -> bool {
        self.words
            .get(idx / 64)
            .is_some_and(|w| w & (1u64 << (idx % 64)) != 0)
    }

    pub fn set(&mut self, idx: usize) {
        let word = idx / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (idx % 64);
    }

    pub fn clear(&mut self, idx: usize) {
        if let Some(w) = self.words.get_mut(idx / 64) {
            *w &= !(1u64 << (idx % 64));
        }
    }

    /// Lowest index that is not set.
    pub fn first_clear(&self) -> usize {
        for (i, w) in self.words.iter().enumerate() {
            if *w != u64::MAX {
                return i * 64 + (!w).trailing_zeros() as usize;
            }
        }
        self.words.len() * 64
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Register allocation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegAllocError {
    /// More registers of a class were needed than the profile offers.
    #[error("out of {class} registers: requested {requested}, available {available}")]
    ClassExhausted {
        class: RegClass,
        requested: usize,
        available: usize,
    },
    /// Tried to free a register that is not allocated.
    #[error("register {0} not allocated")]
    NotAllocated(AsmReg),
}

impl From<RegAllocError> for CompileError {
    fn from(err: RegAllocError) -> Self {
        match err {
            RegAllocError::ClassExhausted {
                class,
                requested,
                available,
            } => CompileError::RegisterOverflow {
                class: class.name(),
                requested,
                available,
            },
            RegAllocError::NotAllocated(reg) => {
                CompileError::invariant(format!("register {} freed twice", reg))
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ClassState {
    used: RegBitSet,
    capacity: usize,
    high_water: usize,
}

/// Occupancy of every register class for one program.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    classes: [ClassState; RegClass::COUNT],
}

impl RegisterFile {
    /// Create a register file with the given capacity per class.
    pub fn new(capacities: [usize; RegClass::COUNT]) -> Self {
        let mut classes: [ClassState; RegClass::COUNT] = Default::default();
        for (state, cap) in classes.iter_mut().zip(capacities) {
            state.capacity = cap;
        }
        Self { classes }
    }

    pub fn capacity(&self, class: RegClass) -> usize {
        self.classes[class.index()].capacity
    }

    /// Allocate the lowest free index of `class`.
    ///
    /// Allocation beyond the capacity still succeeds so the caller can learn
    /// the full demand; [`RegisterFile::check_capacity`] reports the overflow.
    pub fn allocate(&mut self, class: RegClass) -> AsmReg {
        let state = &mut self.classes[class.index()];
        let idx = state.used.first_clear();
        state.used.set(idx);
        state.high_water = state.high_water.max(idx + 1);
        AsmReg::new(class, idx as u16)
    }

    /// Release a register so its index can be reused.
    pub fn free(&mut self, reg: AsmReg) -> Result<(), RegAllocError> {
        let state = &mut self.classes[reg.class.index()];
        if !state.used.contains(reg.index as usize) {
            return Err(RegAllocError::NotAllocated(reg));
        }
        state.used.clear(reg.index as usize);
        Ok(())
    }

    /// Registers of `class` currently in use.
    pub fn in_use(&self, class: RegClass) -> usize {
        self.classes[class.index()].used.count()
    }

    /// Number of distinct indices of `class` ever handed out.
    pub fn high_water(&self, class: RegClass) -> usize {
        self.classes[class.index()].high_water
    }

    /// Fail if the demand for `class` exceeded its capacity.
    pub fn check_capacity(&self, class: RegClass) -> Result<(), RegAllocError> {
        let state = &self.classes[class.index()];
        if state.high_water > state.capacity {
            return Err(RegAllocError::ClassExhausted {
                class,
                requested: state.high_water,
                available: state.capacity,
            });
        }
        Ok(())
    }
}
