//! arbgen - shader code generation for the ARB program family.
//!
//! arbgen lowers a control-flow graph of typed three-address statements into
//! register-allocated assembly for ARB vertex and fragment programs and their
//! NV capability extensions. Control flow is recovered structurally and
//! emitted as IF/REP brackets, labeled branches or flattened selects,
//! depending on what the target profile supports.
//!
//! # Primary Usage
//!
//! ```ignore
//! use arbgen::codegen::compile;
//! use arbgen::core::CompilationSession;
//! use arbgen::target::profile_by_name;
//! use arbgen::test_ir::parse_program;
//! use bumpalo::Bump;
//!
//! let graph = parse_program(source)?;
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let program = compile(&graph, profile_by_name("nvfp2")?, &session)?;
//! println!("{}", program.text());
//! ```
//!
//! # Architecture
//!
//! - [`graph`] - Program graph arena: nodes, edges, values and statements
//! - [`structural`] - Structural analysis into nested regions
//! - [`core`] - Shared infrastructure (session, errors, registers, liveness)
//! - [`target`] - Profiles, capabilities and hardware bindings
//! - [`codegen`] - Lowering, emission, allocation, printing and upload
//! - [`test_ir`] - Textual IR, FileCheck runner, virtual machine and reference evaluator

pub mod codegen;
pub mod core;
pub mod graph;
pub mod structural;
pub mod target;
pub mod test_ir;

pub use codegen::{
    compile, GeneratedProgram, ProgramHandle, ProgramState, ShaderProgram, UploadError, Uploader,
};
pub use core::{CompilationSession, CompileError, CompileResult, SessionStats};
pub use graph::{Op, ProgramGraph, ProgramKind};
pub use structural::{RegionKind, StructuralTree};
pub use target::{profile_by_name, Profile};
