// This module gathers the infrastructure every stage of the backend shares: the error type
// all stages propagate, the arena-backed compilation session with its statistics, the
// register classes and per-class occupancy tracking, and the live-range analyzer the
// temporary allocator runs over the finished instruction stream.

//! Shared backend infrastructure.
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based memory allocation using `bumpalo`
//! - Generation statistics
//!
//! ## Register Tracking (`register_file`)
//! - Register classes and physical register names
//! - Occupancy bitsets with high-water marks and capacity checks
//!
//! ## Liveness (`analyzer`)
//! - Live ranges of virtual registers, extended over loops

pub mod analyzer;
pub mod error;
pub mod register_file;
pub mod session;

pub use analyzer::{Analyzer, LiveRange};
pub use error::{CompileError, CompileResult};
pub use register_file::{AsmReg, RegAllocError, RegBitSet, RegClass, RegisterFile};
pub use session::{CompilationSession, SessionStats};
