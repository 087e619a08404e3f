// This module implements the control-flow half of the Code Generator. It walks the
// structural tree recursively; every region emits its code and hands back the control
// edges still to be taken once its code has run (its exits). A sequence connects each
// member's exits to the next member: falling through when they all lead there, otherwise
// branching to labels when the profile has them. Conditionals use IF/ELSE/ENDIF brackets,
// labeled branches, or, with neither, are flattened: both arms execute, writes inside an
// arm go to fresh renamed registers, and after the arms one select per written value picks
// the taken arm's result; a discard inside a flattened arm is predicated on the arm being
// taken. Loops use REP/BRK/ENDREP or labeled branches and are rejected otherwise, as are
// irreducible regions without labels.

//! Region-by-region emission.

use hashbrown::HashMap;
use log::debug;

use crate::core::{CompilationSession, CompileError, CompileResult, RegClass};
use crate::graph::{
    NodeId, Op, Operand, ProgramGraph, Statement, StatementNumbering, Swizzle, ValueId,
    ValueKind, WrittenValues,
};
use crate::structural::{RegionKind, SId, StructuralTree};
use crate::target::Profile;

use super::inst::{ArbOp, CcRel, CcTest, Dst, Instruction, LabelId, Src, TexOperand, VReg, VRegInfo};
use super::lower::{Builder, LStmt};

/// A control edge still to be taken after a region's code: to `target`
/// when `cond` is positive, or unconditionally.
#[derive(Debug, Clone, Copy)]
pub struct Exit {
    pub cond: Option<Src>,
    pub target: NodeId,
}

/// Renames in effect while one arm of a flattened conditional is emitted.
struct ArmScope {
    renames: HashMap<ValueId, VReg>,
    cond: Src,
    /// The arm runs when `cond` satisfies this relation.
    taken: CcRel,
    pred: Option<Src>,
}

/// Output of emission, before legalization and label fix-up.
pub struct Emitted {
    pub vregs: Vec<VRegInfo>,
    pub code: Vec<Instruction>,
    pub labels: Vec<Option<usize>>,
}

pub struct Emitter<'g, 's, 'arena> {
    graph: &'g ProgramGraph,
    tree: &'g StructuralTree,
    b: Builder<'s, 'arena>,
    numbering: StatementNumbering,
    value_regs: HashMap<ValueId, VReg>,
    scopes: Vec<ArmScope>,
    node_labels: HashMap<NodeId, LabelId>,
}

impl<'g, 's, 'arena> Emitter<'g, 's, 'arena> {
    pub fn new(
        graph: &'g ProgramGraph,
        tree: &'g StructuralTree,
        profile: &'static Profile,
        session: &'s CompilationSession<'arena>,
    ) -> Self {
        let mut numbering = StatementNumbering::new();
        graph.walk(&mut numbering);
        let mut emitter = Self {
            graph,
            tree,
            b: Builder::new(profile, session),
            numbering,
            value_regs: HashMap::new(),
            scopes: Vec::new(),
            node_labels: HashMap::new(),
        };
        // The interface is bound even where the code never touches it.
        for (id, value) in graph.values().iter() {
            if matches!(
                value.kind,
                ValueKind::Input | ValueKind::Output | ValueKind::Param | ValueKind::Texture
            ) {
                emitter.value_reg(id);
            }
        }
        emitter
    }

    fn profile(&self) -> &'static Profile {
        self.b.profile
    }

    /// Emit the whole program.
    pub fn run(mut self) -> CompileResult<Emitted> {
        let exits = self.emit(self.tree.root())?;
        if !exits.is_empty() {
            return Err(CompileError::invariant(
                "control reaches the end of the program outside the exit node",
            ));
        }
        Ok(Emitted {
            vregs: self.b.vregs,
            code: self.b.code,
            labels: self.b.labels,
        })
    }

    fn value_reg(&mut self, id: ValueId) -> VReg {
        if let Some(reg) = self.value_regs.get(&id) {
            return *reg;
        }
        let value = self.graph.values().get(id);
        let reg = if value.kind == ValueKind::Const {
            let reg = self.b.constant(value.data.as_deref().unwrap_or(&[0.0]));
            let info = &mut self.b.vregs[reg.index()];
            if info.name.is_empty() {
                info.name = value.name.clone();
                info.value = Some(id);
            }
            reg
        } else {
            let class = match value.kind {
                ValueKind::Temp if value.half && self.profile().caps.half_precision => RegClass::Half,
                ValueKind::Temp | ValueKind::Const => RegClass::Temp,
                ValueKind::Input => RegClass::Input,
                ValueKind::Output => RegClass::Output,
                ValueKind::Param => RegClass::Param,
                ValueKind::Texture => RegClass::Texture,
            };
            let data = value.data.as_ref().map(|d| {
                let mut padded = [0.0; 4];
                for (slot, v) in padded.iter_mut().zip(d) {
                    *slot = *v;
                }
                padded
            });
            self.b.add_vreg(VRegInfo {
                class,
                size: value.size,
                value: Some(id),
                name: value.name.clone(),
                data,
                texture: value.texture,
            })
        };
        self.value_regs.insert(id, reg);
        reg
    }

    /// Register currently holding `id`, honoring arm renames.
    fn current_reg(&mut self, id: ValueId) -> VReg {
        for scope in self.scopes.iter().rev() {
            if let Some(reg) = scope.renames.get(&id) {
                return *reg;
            }
        }
        self.value_reg(id)
    }

    fn src_of(&mut self, operand: &Operand) -> Src {
        Src {
            reg: self.current_reg(operand.value),
            swizzle: operand.swizzle,
            neg: operand.neg,
        }
    }

    fn dst_of(&mut self, operand: &Operand) -> Dst {
        let id = operand.value;
        let Some(top) = self.scopes.last() else {
            return Dst::new(self.value_reg(id), operand.swizzle);
        };
        if let Some(reg) = top.renames.get(&id) {
            return Dst::new(*reg, operand.swizzle);
        }
        let previous = self.current_reg(id);
        let (size, class) = {
            let info = self.b.vreg(previous);
            let class = if info.class == RegClass::Half {
                RegClass::Half
            } else {
                RegClass::Temp
            };
            (info.size, class)
        };
        let fresh = self.b.temp_of(class, size);
        self.b.vregs[fresh.index()].value = Some(id);
        let full = Swizzle::identity(size);
        let partial = !(0..size).all(|c| operand.swizzle.comps().contains(&c));
        if partial {
            self.b.emit(
                ArbOp::Mov,
                Dst::new(fresh, full),
                vec![Src::new(previous, full)],
            );
        }
        if let Some(top) = self.scopes.last_mut() {
            top.renames.insert(id, fresh);
        }
        Dst::new(fresh, operand.swizzle)
    }

    fn node_label(&mut self, node: NodeId) -> LabelId {
        if let Some(label) = self.node_labels.get(&node) {
            return *label;
        }
        let label = self.b.new_label();
        self.node_labels.insert(node, label);
        label
    }

    fn emit(&mut self, id: SId) -> CompileResult<Vec<Exit>> {
        let kind = self.tree.kind(id);
        debug!("emitting {} region {}", kind.name(), id.0);
        match kind {
            RegionKind::Leaf => {
                let cfg = self
                    .tree
                    .node(id)
                    .cfg
                    .ok_or_else(|| CompileError::invariant("leaf region without a node"))?;
                self.emit_leaf(cfg)
            }
            RegionKind::Block | RegionKind::Section => {
                let start = self.b.code.len();
                let exits = self.emit_sequence(id)?;
                if kind == RegionKind::Section {
                    if let Some(name) = &self.tree.node(id).section_name {
                        if let Some(first) = self.b.code.get_mut(start) {
                            first.comment = Some(format!("section {}", name));
                        }
                    }
                }
                Ok(exits)
            }
            RegionKind::If | RegionKind::IfElse => self.emit_conditional(id),
            RegionKind::SelfLoop | RegionKind::WhileLoop => self.emit_loop(id),
            RegionKind::Irreducible => self.emit_unstructured(id),
        }
    }

    fn emit_leaf(&mut self, cfg: NodeId) -> CompileResult<Vec<Exit>> {
        let label = self.node_label(cfg);
        self.b.place_label(label);
        let graph = self.graph;
        let node = graph.node(cfg);
        for (i, stmt) in node.statements().iter().enumerate() {
            self.emit_statement(cfg, i, stmt)?;
        }
        let mut exits = Vec::with_capacity(node.succs.len() + 1);
        for edge in &node.succs {
            exits.push(Exit {
                cond: Some(self.src_of(&edge.cond)),
                target: edge.target,
            });
        }
        if let Some(follower) = node.follower {
            exits.push(Exit {
                cond: None,
                target: follower,
            });
        }
        Ok(exits)
    }

    fn emit_statement(&mut self, node: NodeId, index: usize, stmt: &Statement) -> CompileResult<()> {
        if matches!(stmt.op, Op::StartSec | Op::EndSec) {
            return Ok(());
        }
        let origin = self.numbering.number(node, index);
        self.b.origin = origin;
        self.b.context = format!(
            "statement {} in {}",
            origin.map_or_else(|| "?".to_string(), |n| n.to_string()),
            self.graph.node_name(node)
        );

        if stmt.op == Op::Kil && !self.scopes.is_empty() {
            let src = self.src_of(&stmt.src[0]);
            let pred = self.predicate(self.scopes.len() - 1);
            let t = self.b.scratch(src.size());
            self.b.emit(ArbOp::Mul, t, vec![src, pred]);
            return self.b.lower(&LStmt::new(Op::Kil, None, vec![t.as_src()]));
        }

        let mut lowered = if matches!(stmt.op, Op::Tex | Op::Texi) {
            let tex_value = stmt.src[0].value;
            let dims = self
                .graph
                .values()
                .get(tex_value)
                .texture
                .ok_or_else(|| {
                    CompileError::invariant(format!("{} samples a non-texture value", stmt.op))
                })?
                .dims;
            let reg = self.value_reg(tex_value);
            let coord = self.src_of(&stmt.src[1]);
            let mut l = LStmt::new(stmt.op, None, vec![coord]);
            l.texture = Some(TexOperand { reg, dims });
            l
        } else {
            let srcs = stmt.src.iter().map(|s| self.src_of(s)).collect();
            LStmt::new(stmt.op, None, srcs)
        };
        // Sources are resolved first so a renamed destination still reads
        // the previous register.
        lowered.dest = stmt.dest.as_ref().map(|d| self.dst_of(d));
        self.b.lower(&lowered)
    }

    /// 1.0 when the arm at `level` and every enclosing arm are taken, else 0.0.
    fn predicate(&mut self, level: usize) -> Src {
        if let Some(pred) = self.scopes[level].pred {
            return pred;
        }
        let (cond, taken) = (self.scopes[level].cond, self.scopes[level].taken);
        let zero = self.b.scalar(0.0);
        let m = self.b.scratch(1);
        let op = match taken {
            CcRel::Gt => ArbOp::Slt,
            CcRel::Le => ArbOp::Sge,
        };
        self.b.emit(op, m, vec![zero, cond]);
        if level > 0 {
            let outer = self.predicate(level - 1);
            self.b.emit(ArbOp::Mul, m, vec![m.as_src(), outer]);
        }
        let pred = m.as_src();
        self.scopes[level].pred = Some(pred);
        pred
    }

    /// Continue at `next`: fall through when every exit leads there.
    fn connect(&mut self, exits: Vec<Exit>, next: NodeId) -> CompileResult<()> {
        if exits.iter().all(|e| e.target == next) {
            return Ok(());
        }
        if !self.profile().caps.labeled_branches {
            return Err(self.unsupported("unstructured branch"));
        }
        self.branch_exits(exits, Some(next));
        Ok(())
    }

    /// Branch to every exit in order, leaving out a final jump to `fallthrough`.
    fn branch_exits(&mut self, exits: Vec<Exit>, fallthrough: Option<NodeId>) {
        let uncond = exits.iter().find(|e| e.cond.is_none()).map(|e| e.target);
        let mut conds: Vec<(Src, NodeId)> = exits
            .iter()
            .filter_map(|e| e.cond.map(|c| (c, e.target)))
            .collect();
        while conds.last().is_some_and(|(_, t)| Some(*t) == uncond) {
            conds.pop();
        }
        for (cond, target) in conds {
            let label = self.node_label(target);
            self.b.set_cc(cond);
            self.b.branch(label, Some(CcTest::x(CcRel::Gt)));
        }
        if let Some(target) = uncond {
            if Some(target) != fallthrough {
                let label = self.node_label(target);
                self.b.branch(label, None);
            }
        }
    }

    fn unsupported(&self, shape: &'static str) -> CompileError {
        CompileError::UnsupportedControlFlow {
            shape,
            profile: self.profile().name,
        }
    }

    fn emit_sequence(&mut self, id: SId) -> CompileResult<Vec<Exit>> {
        let members = self.tree.members(id).to_vec();
        let mut exits = Vec::new();
        for (i, m) in members.iter().enumerate() {
            if i > 0 {
                let pending = std::mem::take(&mut exits);
                self.connect(pending, self.tree.entry(*m))?;
            }
            exits = self.emit(*m)?;
        }
        Ok(exits)
    }

    /// Split exits into a single test: `(cond, target when positive, otherwise)`.
    fn two_way(exits: &[Exit]) -> Option<(Src, NodeId, NodeId)> {
        match exits {
            [Exit {
                cond: Some(c),
                target: t,
            }, Exit {
                cond: None,
                target: f,
            }] if t != f => Some((*c, *t, *f)),
            _ => None,
        }
    }

    fn emit_conditional(&mut self, id: SId) -> CompileResult<Vec<Exit>> {
        let kind = self.tree.kind(id);
        let members = self.tree.members(id).to_vec();
        let exits = self.emit(members[0])?;
        let arms = &members[1..];

        // (cond, [(arm, relation under which it runs)], join)
        let shape = match (kind, Self::two_way(&exits)) {
            (RegionKind::If, Some((cond, on_true, on_false))) => {
                let entry = self.tree.entry(arms[0]);
                if entry == on_true {
                    Some((cond, vec![(arms[0], CcRel::Gt)], on_false))
                } else if entry == on_false {
                    Some((cond, vec![(arms[0], CcRel::Le)], on_true))
                } else {
                    None
                }
            }
            (RegionKind::IfElse, Some((cond, on_true, on_false))) => {
                let (e0, e1) = (self.tree.entry(arms[0]), self.tree.entry(arms[1]));
                let join = self
                    .tree
                    .node(arms[0])
                    .succs()
                    .first()
                    .map(|e| self.tree.entry(e.node));
                match join {
                    Some(join) if (e0, e1) == (on_true, on_false) => Some((
                        cond,
                        vec![(arms[0], CcRel::Gt), (arms[1], CcRel::Le)],
                        join,
                    )),
                    Some(join) if (e1, e0) == (on_true, on_false) => Some((
                        cond,
                        vec![(arms[1], CcRel::Gt), (arms[0], CcRel::Le)],
                        join,
                    )),
                    _ => None,
                }
            }
            _ => None,
        };
        let Some((cond, arms, join)) = shape else {
            return self.continue_unstructured(exits, &members[1..], "conditional");
        };

        let caps = self.profile().caps;
        if caps.structured_branching {
            self.b.set_cc(cond);
            self.b
                .push(Instruction::flow(ArbOp::If).with_cc(CcTest::x(arms[0].1)));
            let exits = self.emit(arms[0].0)?;
            self.expect_join(&exits, join)?;
            if let Some((arm, _)) = arms.get(1) {
                self.b.push(Instruction::flow(ArbOp::Else));
                let exits = self.emit(*arm)?;
                self.expect_join(&exits, join)?;
            }
            self.b.push(Instruction::flow(ArbOp::EndIf));
            Ok(vec![Exit {
                cond: None,
                target: join,
            }])
        } else if caps.labeled_branches {
            self.b.set_cc(cond);
            let skip_to = match arms.get(1) {
                Some((arm, _)) => self.tree.entry(*arm),
                None => join,
            };
            let label = self.node_label(skip_to);
            self.b
                .branch(label, Some(CcTest::x(arms[0].1.inverse())));
            let exits = self.emit(arms[0].0)?;
            match arms.get(1) {
                Some((arm, _)) => {
                    self.connect(exits, skip_to)?;
                    self.emit(*arm)
                }
                None => Ok(exits),
            }
        } else {
            self.flatten(cond, &arms, join)
        }
    }

    fn expect_join(&self, exits: &[Exit], join: NodeId) -> CompileResult<()> {
        if exits.iter().all(|e| e.target == join) {
            Ok(())
        } else {
            Err(self.unsupported("branch out of a conditional arm"))
        }
    }

    /// Execute every arm and select the results.
    fn flatten(
        &mut self,
        cond: Src,
        arms: &[(SId, CcRel)],
        join: NodeId,
    ) -> CompileResult<Vec<Exit>> {
        let mut written = WrittenValues::new();
        for (arm, _) in arms {
            for cfg in self.tree.leaves(*arm) {
                self.graph.walk_node(cfg, &mut written);
            }
        }
        let cond = match self.b.vreg(cond.reg).value {
            Some(v) if written.contains(v) => {
                let snapshot = self.b.scratch(1);
                self.b.emit(ArbOp::Mov, snapshot, vec![cond]);
                snapshot.as_src()
            }
            _ => cond,
        };

        let mut results = Vec::with_capacity(arms.len());
        for (arm, taken) in arms {
            self.scopes.push(ArmScope {
                renames: HashMap::new(),
                cond,
                taken: *taken,
                pred: None,
            });
            let exits = self.emit(*arm);
            let scope = self.scopes.pop();
            self.expect_join(&exits?, join)?;
            results.push(scope.map(|s| s.renames).unwrap_or_default());
        }

        let mut values: Vec<ValueId> = results.iter().flat_map(|r| r.keys().copied()).collect();
        values.sort();
        values.dedup();
        self.b.context = "conditional select".to_string();
        for v in values {
            let size = self.graph.values().get(v).size;
            let full = Swizzle::identity(size);
            let outer = Src::new(self.current_reg(v), full);
            let pick = |i: usize| {
                results
                    .get(i)
                    .and_then(|r| r.get(&v))
                    .map_or(outer, |reg| Src::new(*reg, full))
            };
            let (on_true, on_false) = match arms {
                [(_, CcRel::Gt)] => (pick(0), outer),
                [(_, CcRel::Le)] => (outer, pick(0)),
                _ => (pick(0), pick(1)),
            };
            let dest = self.dst_of(&Operand::new(v, full));
            self.b
                .lower(&LStmt::new(Op::Cond, Some(dest), vec![cond, on_true, on_false]))?;
        }
        Ok(vec![Exit {
            cond: None,
            target: join,
        }])
    }

    fn emit_loop(&mut self, id: SId) -> CompileResult<Vec<Exit>> {
        let kind = self.tree.kind(id);
        let members = self.tree.members(id).to_vec();
        let caps = self.profile().caps;
        if !caps.repeat_loops && !caps.labeled_branches {
            return Err(self.unsupported("loop"));
        }
        let head = members[0];
        let head_entry = self.tree.entry(head);

        if caps.repeat_loops {
            let count = self.b.scalar(caps.max_loop_count as f32);
            let mut rep = Instruction::flow(ArbOp::Rep);
            rep.srcs.push(count);
            self.b.push(rep);
        }

        let exits = self.emit(head)?;
        // Where the loop continues after the head's code, and where it leaves.
        let stay = match kind {
            RegionKind::WhileLoop => self.tree.entry(members[1]),
            _ => head_entry,
        };
        let shape = Self::two_way(&exits).and_then(|(cond, on_true, on_false)| {
            if on_true == stay {
                Some((cond, CcRel::Le, on_false))
            } else if on_false == stay {
                Some((cond, CcRel::Gt, on_true))
            } else {
                None
            }
        });
        let Some((cond, leave_when, out)) = shape else {
            if caps.repeat_loops {
                return Err(self.unsupported("loop with several exits"));
            }
            return self.continue_unstructured(exits, &members[1..], "loop");
        };

        if caps.repeat_loops {
            self.b.set_cc(cond);
            self.b
                .push(Instruction::flow(ArbOp::Brk).with_cc(CcTest::x(leave_when)));
            if kind == RegionKind::WhileLoop {
                let exits = self.emit(members[1])?;
                if !exits.iter().all(|e| e.target == head_entry) {
                    return Err(self.unsupported("loop with several exits"));
                }
            }
            self.b.push(Instruction::flow(ArbOp::EndRep));
        } else if kind == RegionKind::WhileLoop {
            self.b.set_cc(cond);
            let label = self.node_label(out);
            self.b.branch(label, Some(CcTest::x(leave_when)));
            let exits = self.emit(members[1])?;
            self.branch_exits(exits, None);
        } else {
            self.b.set_cc(cond);
            let label = self.node_label(head_entry);
            self.b
                .branch(label, Some(CcTest::x(leave_when.inverse())));
        }
        Ok(vec![Exit {
            cond: None,
            target: out,
        }])
    }

    fn emit_unstructured(&mut self, id: SId) -> CompileResult<Vec<Exit>> {
        if !self.profile().caps.labeled_branches {
            return Err(self.unsupported("irreducible region"));
        }
        let mut members = self.tree.members(id).to_vec();
        // The program ends by falling off the last instruction.
        let exit = self.graph.exit();
        if let Some(pos) = members
            .iter()
            .position(|m| self.tree.contains_cfg(*m, exit))
        {
            let m = members.remove(pos);
            members.push(m);
        }
        let exits = self.emit(members[0])?;
        self.continue_unstructured(exits, &members[1..], "irreducible region")
    }

    /// Emit `rest` in order with explicit branches between them.
    fn continue_unstructured(
        &mut self,
        mut pending: Vec<Exit>,
        rest: &[SId],
        shape: &'static str,
    ) -> CompileResult<Vec<Exit>> {
        if !self.profile().caps.labeled_branches {
            return Err(self.unsupported(shape));
        }
        debug!("emitting {} with explicit branches", shape);
        for m in rest {
            let next = self.tree.entry(*m);
            self.branch_exits(pending, Some(next));
            pending = self.emit(*m)?;
        }
        Ok(pending)
    }
}
