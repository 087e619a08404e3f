// This module ties the generator stages together and owns the life cycle of a compiled
// program. `compile` runs the whole pipeline on a frozen graph: validation, structural
// analysis, region-by-region emission, legalization, label fix-up, register allocation and
// printing. Any failure discards the partial result. ShaderProgram wraps a graph and a
// profile in the state machine UNCOMPILED -> GENERATING -> GENERATED -> UPLOADED -> STALE:
// code is frozen once generated, handed to an Uploader collaborator, and marked stale when
// the graph or the shape of a parameter changes. A parameter update that keeps its shape
// goes straight to the uploaded program without regeneration.

//! Program generation pipeline, life cycle and upload.

use std::fmt;

use log::{debug, info, warn};

use crate::core::{CompilationSession, CompileError, CompileResult, RegClass};
use crate::graph::{ProgramGraph, ValueKind};
use crate::structural::StructuralTree;
use crate::target::Profile;

use super::alloc::{allocate, Allocation};
use super::emitter::Emitter;
use super::inst::{Instruction, VRegInfo};
use super::legalize::{legalize, resolve_labels, Layout};
use super::printer::print_program;
use super::report::{describe_interface, BindingReport};

/// One `program.local` slot handed to the uploader.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamBinding {
    pub name: String,
    pub index: usize,
    pub size: u8,
    pub value: [f32; 4],
}

/// Frozen output of a successful generation.
#[derive(Debug, Clone)]
pub struct GeneratedProgram {
    profile: &'static Profile,
    text: String,
    layout: Layout,
    vregs: Vec<VRegInfo>,
    allocation: Allocation,
    params: Vec<ParamBinding>,
    interface: String,
}

impl GeneratedProgram {
    pub fn profile(&self) -> &'static Profile {
        self.profile
    }

    /// Assembly text.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.layout.code
    }

    pub fn report(&self) -> &BindingReport {
        &self.allocation.report
    }

    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    pub fn vregs(&self) -> &[VRegInfo] {
        &self.vregs
    }

    pub fn params(&self) -> &[ParamBinding] {
        &self.params
    }

    /// Parameter values indexed by `program.local` slot.
    pub fn constants(&self) -> Vec<[f32; 4]> {
        let mut out = vec![[0.0; 4]; self.params.len()];
        for p in &self.params {
            out[p.index] = p.value;
        }
        out
    }

    /// Physical register name of a bound value.
    pub fn register_of(&self, name: &str) -> Option<String> {
        self.allocation.report.register_of(name).map(|r| r.to_string())
    }

    pub fn temps_used(&self) -> usize {
        self.allocation
            .report
            .usage_of(RegClass::Temp)
            .map_or(0, |u| u.used)
    }

    /// Physical registers, their bindings and register usage.
    pub fn describe_bindings(&self) -> String {
        self.allocation.report.to_string()
    }

    /// Declared interface of the graph this program was generated from.
    pub fn describe_interface(&self) -> &str {
        &self.interface
    }
}

fn generate(
    graph: &ProgramGraph,
    profile: &'static Profile,
    session: &CompilationSession<'_>,
) -> CompileResult<GeneratedProgram> {
    if graph.kind != profile.kind {
        return Err(CompileError::invariant(format!(
            "profile {} targets {} programs, got a {} program",
            profile.name,
            profile.kind.name(),
            graph.kind.name()
        )));
    }
    graph.validate()?;
    let tree = StructuralTree::analyze(graph);
    debug!("structure:\n{}", tree.describe(graph));

    let mut emitted = Emitter::new(graph, &tree, profile, session).run()?;
    let shadowed = legalize(&mut emitted);
    if shadowed > 0 {
        debug!("{} registers shadowed", shadowed);
    }
    let layout = resolve_labels(emitted.code, &emitted.labels)?;
    let allocation = allocate(session, graph, profile, &layout.code, &emitted.vregs)?;
    let text = print_program(profile, graph, &layout, &emitted.vregs, &allocation)?;

    let mut params = Vec::new();
    for (i, info) in emitted.vregs.iter().enumerate() {
        if info.class != RegClass::Param {
            continue;
        }
        if let Some(reg) = allocation.regs[i] {
            params.push(ParamBinding {
                name: info.name.clone(),
                index: reg.index as usize,
                size: info.size,
                value: info.data.unwrap_or_default(),
            });
        }
    }

    Ok(GeneratedProgram {
        profile,
        text,
        layout,
        vregs: emitted.vregs,
        allocation,
        params,
        interface: describe_interface(graph),
    })
}

/// Generate assembly for `graph` under `profile`.
pub fn compile(
    graph: &ProgramGraph,
    profile: &'static Profile,
    session: &CompilationSession<'_>,
) -> CompileResult<GeneratedProgram> {
    match generate(graph, profile, session) {
        Ok(program) => {
            session.record_program_compiled(program.instructions().len(), program.temps_used());
            info!(
                "compiled {} program for {}: {} instructions, {} temps",
                graph.kind.name(),
                profile.name,
                program.instructions().len(),
                program.temps_used()
            );
            Ok(program)
        }
        Err(err) => {
            session.record_program_failed();
            warn!("generation for {} failed: {}", profile.name, err);
            Err(err)
        }
    }
}

/// Error type uploaders report; surfaced unchanged as [`CompileError::Upload`].
pub type UploadError = Box<dyn std::error::Error + Send + Sync>;

/// Opaque handle of a program accepted by an uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub u64);

/// The device-binding collaborator that takes finished assembly.
pub trait Uploader {
    /// Submit program text with its `program.local` values.
    fn upload(&mut self, text: &str, constants: &[[f32; 4]]) -> Result<ProgramHandle, UploadError>;

    /// Change one `program.local` value of an uploaded program.
    fn update_param(
        &mut self,
        handle: ProgramHandle,
        index: usize,
        value: [f32; 4],
    ) -> Result<(), UploadError>;
}

/// Life-cycle state of a [`ShaderProgram`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramState {
    Uncompiled,
    Generating,
    Generated,
    Uploaded,
    Stale,
}

impl ProgramState {
    pub fn name(self) -> &'static str {
        match self {
            ProgramState::Uncompiled => "UNCOMPILED",
            ProgramState::Generating => "GENERATING",
            ProgramState::Generated => "GENERATED",
            ProgramState::Uploaded => "UPLOADED",
            ProgramState::Stale => "STALE",
        }
    }
}

impl fmt::Display for ProgramState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A graph, the profile it targets and whatever has been generated from it.
pub struct ShaderProgram {
    graph: ProgramGraph,
    profile: &'static Profile,
    state: ProgramState,
    generated: Option<GeneratedProgram>,
    handle: Option<ProgramHandle>,
}

impl ShaderProgram {
    pub fn new(graph: ProgramGraph, profile: &'static Profile) -> Self {
        Self {
            graph,
            profile,
            state: ProgramState::Uncompiled,
            generated: None,
            handle: None,
        }
    }

    pub fn state(&self) -> ProgramState {
        self.state
    }

    pub fn graph(&self) -> &ProgramGraph {
        &self.graph
    }

    /// Mutable access to the graph; existing code becomes stale.
    pub fn graph_mut(&mut self) -> &mut ProgramGraph {
        self.mark_stale();
        &mut self.graph
    }

    pub fn profile(&self) -> &'static Profile {
        self.profile
    }

    pub fn generated(&self) -> Option<&GeneratedProgram> {
        self.generated.as_ref()
    }

    pub fn handle(&self) -> Option<ProgramHandle> {
        self.handle
    }

    fn invalid(&self, action: &'static str) -> CompileError {
        CompileError::InvalidState {
            state: self.state.name(),
            action,
        }
    }

    /// Run the generator. Only valid before the first generation or once
    /// the previous code went stale; the previous code is discarded.
    pub fn generate(&mut self, session: &CompilationSession<'_>) -> CompileResult<&GeneratedProgram> {
        if !matches!(self.state, ProgramState::Uncompiled | ProgramState::Stale) {
            return Err(self.invalid("generate"));
        }
        self.generated = None;
        self.handle = None;
        self.state = ProgramState::Generating;
        match compile(&self.graph, self.profile, session) {
            Ok(program) => {
                self.state = ProgramState::Generated;
                let program: &GeneratedProgram = self.generated.insert(program);
                Ok(program)
            }
            Err(err) => {
                self.state = ProgramState::Uncompiled;
                Err(err)
            }
        }
    }

    /// Hand generated code to `uploader`.
    pub fn upload(&mut self, uploader: &mut dyn Uploader) -> CompileResult<ProgramHandle> {
        let program = match (&self.generated, self.state) {
            (Some(program), ProgramState::Generated) => program,
            _ => return Err(self.invalid("upload")),
        };
        let handle = uploader
            .upload(program.text(), &program.constants())
            .map_err(CompileError::Upload)?;
        debug!("uploaded as {:?}", handle);
        self.handle = Some(handle);
        self.state = ProgramState::Uploaded;
        Ok(handle)
    }

    /// Code generated earlier no longer matches the graph.
    pub fn mark_stale(&mut self) {
        if matches!(self.state, ProgramState::Generated | ProgramState::Uploaded) {
            debug!("program marked stale");
            self.state = ProgramState::Stale;
        }
    }

    /// Set the value of parameter `name`. A value of the same size updates
    /// an uploaded program in place; a different size makes the code stale.
    pub fn set_param(
        &mut self,
        name: &str,
        data: &[f32],
        uploader: &mut dyn Uploader,
    ) -> CompileResult<()> {
        if data.is_empty() || data.len() > 4 {
            return Err(CompileError::invariant(format!(
                "parameter {} set to {} components",
                name,
                data.len()
            )));
        }
        let id = self
            .graph
            .values()
            .lookup(name)
            .filter(|id| self.graph.values().get(*id).kind == ValueKind::Param)
            .ok_or_else(|| CompileError::UnknownParameter {
                name: name.to_string(),
            })?;

        let value = self.graph.values_mut().get_mut(id);
        let reshaped = value.size as usize != data.len();
        value.size = data.len() as u8;
        value.data = Some(data.to_vec());
        if reshaped {
            self.mark_stale();
            return Ok(());
        }

        let mut padded = [0.0; 4];
        padded[..data.len()].copy_from_slice(data);
        let Some(program) = self.generated.as_mut() else {
            return Ok(());
        };
        let Some(param) = program.params.iter_mut().find(|p| p.name == name) else {
            return Ok(());
        };
        param.value = padded;
        if let (ProgramState::Uploaded, Some(handle)) = (self.state, self.handle) {
            uploader
                .update_param(handle, param.index, padded)
                .map_err(CompileError::Upload)?;
        }
        Ok(())
    }

    /// Interface and binding dumps.
    pub fn describe(&self) -> String {
        match &self.generated {
            Some(program) => format!(
                "{}{}",
                program.describe_interface(),
                program.describe_bindings()
            ),
            None => describe_interface(&self.graph),
        }
    }
}
