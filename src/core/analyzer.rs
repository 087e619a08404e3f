// This module implements the Analyzer that computes live ranges of temporaries over the
// final, linear instruction stream of a generated program. Each virtual register gets the
// span from its first to its last reference. Back edges (ENDREP to REP, and any BRA to an
// earlier index) form loop spans; a value that is live into a loop, or that is read inside
// it before being fully written, is extended over the whole span so the register allocator
// never hands its index to another value while the loop can still come back for it. The
// extension runs to a fixpoint so nested loops propagate outward. Ranges are allocated in
// the session arena and share its lifetime.

//! Live-range analysis over a generated instruction stream.

use bumpalo::collections::Vec as BumpVec;

use super::session::CompilationSession;
use crate::codegen::inst::{ArbOp, Instruction, VReg, VRegInfo};

/// Inclusive instruction span during which a register holds a needed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LiveRange {
    pub start: usize,
    pub end: usize,
    /// The first reference reads (or partially writes) the register.
    pub read_first: bool,
    /// Whether the register is referenced at all.
    pub used: bool,
}

impl LiveRange {
    pub fn overlaps(&self, other: &LiveRange) -> bool {
        self.used && other.used && self.start <= other.end && other.start <= self.end
    }
}

/// Live ranges of every virtual register, indexed by [`VReg`].
pub struct Analyzer<'arena> {
    ranges: &'arena [LiveRange],
    loops: &'arena [(usize, usize)],
}

impl<'arena> Analyzer<'arena> {
    /// Compute live ranges for `code`. Jumps must already be resolved.
    pub fn analyze(
        session: &CompilationSession<'arena>,
        code: &[Instruction],
        vregs: &[VRegInfo],
    ) -> Self {
        let mut ranges = vec![LiveRange::default(); vregs.len()];

        let mut touch = |reg: VReg, at: usize, reading: bool| {
            let range = &mut ranges[reg.index()];
            if !range.used {
                *range = LiveRange {
                    start: at,
                    end: at,
                    read_first: reading,
                    used: true,
                };
            } else {
                range.end = range.end.max(at);
            }
        };

        for (i, inst) in code.iter().enumerate() {
            for reg in inst.reads() {
                touch(reg, i, true);
            }
            if let Some(dest) = &inst.dest {
                let size = vregs[dest.reg.index()].size;
                touch(dest.reg, i, inst.is_partial_write(size));
            }
        }

        let mut loops = BumpVec::new_in(session.arena());
        for (i, inst) in code.iter().enumerate() {
            let back = match inst.op {
                ArbOp::EndRep | ArbOp::Bra => inst.jump.filter(|&j| j <= i),
                _ => None,
            };
            if let Some(head) = back {
                loops.push((head, i));
            }
        }

        let mut changed = true;
        while changed {
            changed = false;
            for &(head, tail) in loops.iter() {
                for range in ranges.iter_mut().filter(|r| r.used) {
                    let live_in = range.start < head && range.end >= head;
                    let carried = range.start >= head && range.start <= tail && range.read_first;
                    if live_in && range.end < tail {
                        range.end = tail;
                        changed = true;
                    }
                    if carried && (range.start > head || range.end < tail) {
                        range.start = head;
                        range.end = range.end.max(tail);
                        changed = true;
                    }
                }
            }
        }

        let mut arena_ranges = BumpVec::with_capacity_in(ranges.len(), session.arena());
        arena_ranges.extend(ranges);
        Self {
            ranges: arena_ranges.into_bump_slice(),
            loops: loops.into_bump_slice(),
        }
    }

    pub fn range(&self, reg: VReg) -> &LiveRange {
        &self.ranges[reg.index()]
    }

    /// Loop spans as `(head, tail)` instruction indices.
    pub fn loops(&self) -> &'arena [(usize, usize)] {
        self.loops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::inst::{Dst, Src};
    use crate::core::RegClass;
    use crate::graph::Swizzle;
    use bumpalo::Bump;

    fn temp(size: u8) -> VRegInfo {
        VRegInfo {
            class: RegClass::Temp,
            size,
            value: None,
            name: String::new(),
            data: None,
            texture: None,
        }
    }

    fn mov(dest: u32, src: u32) -> Instruction {
        Instruction::new(
            ArbOp::Mov,
            Some(Dst::new(VReg(dest), Swizzle::identity(4))),
            vec![Src::new(VReg(src), Swizzle::identity(4))],
        )
    }

    #[test]
    fn test_straight_line_ranges() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let vregs = vec![temp(4), temp(4), temp(4)];
        let code = vec![mov(0, 2), mov(1, 0), mov(2, 1)];
        let analyzer = Analyzer::analyze(&session, &code, &vregs);

        assert_eq!(analyzer.range(VReg(0)).start, 0);
        assert_eq!(analyzer.range(VReg(0)).end, 1);
        assert!(!analyzer.range(VReg(0)).read_first);
        assert!(analyzer.range(VReg(2)).read_first);
        assert!(analyzer.range(VReg(0)).overlaps(analyzer.range(VReg(1))));
        assert_eq!(analyzer.range(VReg(2)).end, 2);
        assert!(analyzer.loops().is_empty());
    }

    #[test]
    fn test_loop_extends_carried_values() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let vregs = vec![temp(4), temp(4), temp(4), temp(4)];
        let mut rep = Instruction::flow(ArbOp::Rep);
        rep.srcs.push(Src::new(VReg(3), Swizzle::identity(1)));
        let mut endrep = Instruction::flow(ArbOp::EndRep);
        endrep.jump = Some(1);
        let code = vec![
            mov(0, 3), // 0: r0 defined before the loop
            rep,       // 1
            mov(1, 0), // 2: r1 written fresh, r0 read
            mov(2, 2), // 3: r2 read before written: carried
            mov(0, 1), // 4
            endrep,    // 5
        ];
        let analyzer = Analyzer::analyze(&session, &code, &vregs);

        assert_eq!(analyzer.loops(), &[(1, 5)]);
        assert_eq!(analyzer.range(VReg(0)).end, 5);
        assert_eq!(analyzer.range(VReg(1)).start, 2);
        assert_eq!(analyzer.range(VReg(1)).end, 4);
        assert_eq!(analyzer.range(VReg(2)).start, 1);
        assert_eq!(analyzer.range(VReg(2)).end, 5);
    }
}
