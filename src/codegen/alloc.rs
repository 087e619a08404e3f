// This module implements register allocation for generated programs. Inputs and outputs are
// bound through the fixed binding tables of the program kind: tagged values claim the slot
// of their semantic (an explicit slot that is already taken, or a second use of a one-slot
// semantic, makes the input an alias of the existing register), untagged values take the
// next free generic slot. Parameters map to program.local slots in declaration order,
// literal constants (already deduplicated by value) and textures are numbered in order of
// creation. Temporaries and half-precision temporaries are assigned by a linear scan over
// live ranges, so registers whose ranges do not overlap share a physical index. Every class
// is then checked against the profile's capacity.

//! Register allocation and interface binding.

use hashbrown::HashMap;
use log::debug;

use crate::core::{
    Analyzer, AsmReg, CompilationSession, CompileError, CompileResult, RegClass, RegisterFile,
};
use crate::graph::{ProgramGraph, Semantic};
use crate::target::{binding_name, input_bindings, output_bindings, BindingSpec, Profile};

use super::inst::{Instruction, VReg, VRegInfo};
use super::report::{BindingEntry, BindingReport, ClassUsage};

/// Physical registers of every virtual register plus the interface report.
#[derive(Debug, Clone)]
pub struct Allocation {
    /// `None` for temporaries the final code never references.
    pub regs: Vec<Option<AsmReg>>,
    pub report: BindingReport,
}

impl Allocation {
    pub fn reg(&self, vreg: VReg) -> Option<AsmReg> {
        self.regs.get(vreg.index()).copied().flatten()
    }
}

fn format_vector(data: &[f32; 4]) -> String {
    let items: Vec<String> = data.iter().map(|v| v.to_string()).collect();
    format!("{{{}}}", items.join(", "))
}

struct InterfaceBinder<'a> {
    class: RegClass,
    specs: &'static [BindingSpec],
    /// Outputs cannot share a register.
    allow_alias: bool,
    regfile: &'a mut RegisterFile,
    taken: HashMap<(usize, u8), usize>,
    entries: Vec<BindingEntry>,
}

impl InterfaceBinder<'_> {
    fn claim(&mut self, spec: usize, slot: u8, name: &str) -> CompileResult<AsmReg> {
        if let Some(&entry) = self.taken.get(&(spec, slot)) {
            let existing = &mut self.entries[entry];
            if !self.allow_alias {
                return Err(CompileError::invariant(format!(
                    "{} and {} are both bound to {}",
                    existing.names[0], name, existing.binding
                )));
            }
            existing.names.push(name.to_string());
            debug!("alloc: {} aliases {}", name, existing.names[0]);
            return Ok(existing.reg);
        }
        let reg = self.regfile.allocate(self.class);
        self.taken.insert((spec, slot), self.entries.len());
        self.entries.push(BindingEntry {
            reg,
            binding: binding_name(&self.specs[spec], slot),
            names: vec![name.to_string()],
        });
        Ok(reg)
    }

    fn free_slot(&self, spec: usize) -> Option<u8> {
        (0..self.specs[spec].slots).find(|s| !self.taken.contains_key(&(spec, *s)))
    }

    fn bind_tagged(&mut self, semantic: Semantic, name: &str) -> CompileResult<AsmReg> {
        let spec = self
            .specs
            .iter()
            .position(|s| s.semantic == semantic.kind)
            .ok_or_else(|| {
                CompileError::invariant(format!(
                    "{} has semantic {} which has no {} binding",
                    name,
                    semantic,
                    self.class
                ))
            })?;
        let slots = self.specs[spec].slots;
        let slot = match semantic.index {
            Some(i) if i >= slots => {
                return Err(CompileError::invariant(format!(
                    "{} asks for slot {} of {} which has {}",
                    name, i, self.specs[spec].name, slots
                )))
            }
            Some(i) => i,
            None => match self.free_slot(spec) {
                Some(s) => s,
                None if slots == 1 => 0,
                None => {
                    return Err(CompileError::RegisterOverflow {
                        class: self.class.name(),
                        requested: slots as usize + 1,
                        available: slots as usize,
                    })
                }
            },
        };
        self.claim(spec, slot, name)
    }

    fn bind_generic(&mut self, name: &str, pending: usize) -> CompileResult<AsmReg> {
        for spec in 0..self.specs.len() {
            if !self.specs[spec].generic {
                continue;
            }
            if let Some(slot) = self.free_slot(spec) {
                return self.claim(spec, slot, name);
            }
        }
        Err(CompileError::RegisterOverflow {
            class: self.class.name(),
            requested: self.entries.len() + pending,
            available: self.entries.len(),
        })
    }
}

fn bind_interface(
    vregs: &[VRegInfo],
    graph: &ProgramGraph,
    class: RegClass,
    specs: &'static [BindingSpec],
    regfile: &mut RegisterFile,
    regs: &mut [Option<AsmReg>],
) -> CompileResult<Vec<BindingEntry>> {
    let mut binder = InterfaceBinder {
        class,
        specs,
        allow_alias: class == RegClass::Input,
        regfile,
        taken: HashMap::new(),
        entries: Vec::new(),
    };
    let members: Vec<(usize, &VRegInfo)> = vregs
        .iter()
        .enumerate()
        .filter(|(_, info)| info.class == class)
        .collect();

    let mut untagged = Vec::new();
    for &(i, info) in &members {
        let semantic = info.value.and_then(|v| graph.values().get(v).semantic);
        match semantic {
            Some(sem) => regs[i] = Some(binder.bind_tagged(sem, &info.name)?),
            None => untagged.push((i, info)),
        }
    }
    let total = untagged.len();
    for (k, (i, info)) in untagged.into_iter().enumerate() {
        regs[i] = Some(binder.bind_generic(&info.name, total - k)?);
    }
    Ok(binder.entries)
}

/// Allocate every register of a finished program.
pub fn allocate<'arena>(
    session: &CompilationSession<'arena>,
    graph: &ProgramGraph,
    profile: &Profile,
    code: &[Instruction],
    vregs: &[VRegInfo],
) -> CompileResult<Allocation> {
    let mut regfile = RegisterFile::new(profile.limits());
    let mut regs: Vec<Option<AsmReg>> = vec![None; vregs.len()];
    let mut report = BindingReport {
        inputs: bind_interface(
            vregs,
            graph,
            RegClass::Input,
            input_bindings(graph.kind),
            &mut regfile,
            &mut regs,
        )?,
        outputs: bind_interface(
            vregs,
            graph,
            RegClass::Output,
            output_bindings(graph.kind),
            &mut regfile,
            &mut regs,
        )?,
        ..BindingReport::default()
    };

    for (i, info) in vregs.iter().enumerate() {
        let reg = match info.class {
            RegClass::Param | RegClass::Const | RegClass::Texture => regfile.allocate(info.class),
            _ => continue,
        };
        regs[i] = Some(reg);
        let names = if info.name.is_empty() {
            Vec::new()
        } else {
            vec![info.name.clone()]
        };
        let data = info.data.unwrap_or_default();
        let entry = |binding: String| BindingEntry {
            reg,
            binding,
            names,
        };
        match info.class {
            RegClass::Param => report
                .params
                .push(entry(format!("program.local[{}]", reg.index))),
            RegClass::Const => report.constants.push(entry(format_vector(&data))),
            _ => report.textures.push(entry(reg.to_string())),
        }
    }

    let analyzer = Analyzer::analyze(session, code, vregs);
    let mut order: Vec<VReg> = (0..vregs.len())
        .map(|i| VReg(i as u32))
        .filter(|v| vregs[v.index()].class.is_temporary() && analyzer.range(*v).used)
        .collect();
    order.sort_by_key(|v| (analyzer.range(*v).start, *v));

    let mut active: Vec<(usize, AsmReg)> = Vec::new();
    for v in order {
        let range = analyzer.range(v);
        let mut k = 0;
        while k < active.len() {
            if active[k].0 < range.start {
                regfile.free(active[k].1)?;
                active.swap_remove(k);
            } else {
                k += 1;
            }
        }
        let reg = regfile.allocate(vregs[v.index()].class);
        regs[v.index()] = Some(reg);
        active.push((range.end, reg));
    }

    for class in RegClass::ALL {
        regfile.check_capacity(class)?;
        report.usage.push(ClassUsage {
            class,
            used: regfile.high_water(class),
            capacity: regfile.capacity(class),
        });
    }
    debug!(
        "alloc: {} temps, {} half, {} consts",
        regfile.high_water(RegClass::Temp),
        regfile.high_water(RegClass::Half),
        regfile.high_water(RegClass::Const)
    );
    Ok(Allocation { regs, report })
}
