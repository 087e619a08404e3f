//! Shader IR (SIR) text format and test tooling.
//!
//! This module provides a small textual format for writing compiler tests
//! without building graphs by hand, a FileCheck-style runner for `.sir`
//! files, a virtual machine that executes generated assembly, and a
//! reference evaluator that runs the graph itself.
//!
//! # SIR Format
//!
//! ```text
//! ; Comments start with semicolon
//! program fragment
//! input %x : 4 @texcoord0
//! output %o : 4 @color
//! entry:
//!     %c = sgt %x.x, 0
//!     brc %c, ^pos
//! neg:
//!     %o = mov -%x
//!     br ^exit
//! pos:
//!     %o = mov %x
//! ```

pub mod check;
pub mod machine;
pub mod parser;
pub mod reference;

pub use check::{run_filecheck, CheckDirective, RunDirective, TestRunner, TestSpec};
pub use machine::{MachineInputs, MachineProgram, Outcome, VirtualDevice};
pub use parser::parse_program;
pub use reference::{evaluate, run_generated, RefInputs, RefOutcome};
