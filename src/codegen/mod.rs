// This module is the Code Generator. Given a frozen program graph, its structural tree and
// a capability profile it produces target assembly text: statements are lowered through a
// priority-ordered table to native instructions or macro expansions, structured regions are
// emitted as IF/REP brackets, labeled branches or flattened selects depending on what the
// profile supports, and the resulting stream is legalized, label-resolved, register
// allocated and printed. The program module drives these stages and holds the life-cycle
// state machine and the Uploader seam.

//! Target code generation.

pub mod alloc;
pub mod emitter;
pub mod inst;
pub mod legalize;
pub mod lower;
pub mod printer;
pub mod program;
pub mod report;
pub mod table;

pub use alloc::{allocate, Allocation};
pub use inst::{
    source_selection, validate_arb_table, ArbKind, ArbOp, ArbOpInfo, CcRel, CcTest, Dst,
    Instruction, LabelId, Src, TexOperand, VReg, VRegInfo,
};
pub use legalize::Layout;
pub use program::{
    compile, GeneratedProgram, ParamBinding, ProgramHandle, ProgramState, ShaderProgram,
    UploadError, Uploader,
};
pub use report::{describe_interface, BindingEntry, BindingReport, ClassUsage};
pub use table::{lowering_table, validate_lowering_table, Expansion, Lowering, LoweringRule};
