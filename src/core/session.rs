// This module provides arena-based compilation session management using the bumpalo crate.
// CompilationSession owns a reference to the arena every per-program analysis result is
// allocated in (live ranges, instruction order, interned register names), so analysis
// slices share a single lifetime instead of threading owners through the generator. The
// session also accumulates SessionStats across every program generated with it: programs
// compiled and failed, instructions emitted per target opcode, macro expansions and the
// peak number of general temporaries any program needed.

//! Arena-based compilation session management.
//!
//! All analysis data produced while generating a program is allocated in the
//! session arena and lives as long as the session.

use bumpalo::Bump;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::fmt;

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for compilation objects.
    arena: &'arena Bump,

    /// Session statistics.
    stats: RefCell<SessionStats>,

    /// String interning for register and label names.
    interned_strings: RefCell<HashMap<String, &'arena str>>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            interned_strings: RefCell::new(HashMap::new()),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Allocate a slice in the session arena.
    pub fn alloc_slice<T>(&self, slice: &[T]) -> &'arena [T]
    where
        T: Copy,
    {
        self.arena.alloc_slice_copy(slice)
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned = self.arena.alloc_str(s);
        strings.insert(s.to_string(), interned);
        interned
    }

    /// Record a successfully generated program.
    pub fn record_program_compiled(&self, instructions: usize, temps: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.programs_compiled += 1;
        stats.total_instructions += instructions;
        if temps > stats.peak_temps {
            stats.peak_temps = temps;
        }
    }

    /// Record a generation that ended in an error.
    pub fn record_program_failed(&self) {
        self.stats.borrow_mut().programs_failed += 1;
    }

    /// Record an emitted target instruction.
    pub fn record_instruction_emitted(&self, opcode: &'static str) {
        let mut stats = self.stats.borrow_mut();
        stats.instructions_emitted += 1;
        *stats.instruction_counts.entry(opcode).or_insert(0) += 1;
    }

    /// Record a macro expansion.
    pub fn record_macro_expanded(&self) {
        self.stats.borrow_mut().macro_expansions += 1;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of programs generated successfully.
    pub programs_compiled: usize,

    /// Number of generations that failed.
    pub programs_failed: usize,

    /// Instructions emitted by the lowering stage, before legalization.
    pub instructions_emitted: usize,

    /// Final instruction count summed over compiled programs.
    pub total_instructions: usize,

    /// Count of each target opcode emitted.
    pub instruction_counts: HashMap<&'static str, usize>,

    /// Statements lowered through a macro expansion.
    pub macro_expansions: usize,

    /// Highest number of general temporaries needed by one program.
    pub peak_temps: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Programs compiled: {}", self.programs_compiled)?;
        writeln!(f, "  Programs failed: {}", self.programs_failed)?;
        writeln!(f, "  Instructions emitted: {}", self.instructions_emitted)?;
        writeln!(f, "  Final instructions: {}", self.total_instructions)?;
        writeln!(f, "  Macro expansions: {}", self.macro_expansions)?;
        writeln!(f, "  Peak temps: {}", self.peak_temps)?;

        if !self.instruction_counts.is_empty() {
            writeln!(f, "  Instruction breakdown:")?;
            let mut sorted: Vec<_> = self.instruction_counts.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));

            for (opcode, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", opcode, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compilation_session_creation() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let stats = session.stats();
        assert_eq!(stats.programs_compiled, 0);
        assert_eq!(stats.instructions_emitted, 0);
    }

    #[test]
    fn test_string_interning() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let s1 = session.intern_str("r0");
        let s2 = session.intern_str("r0");
        let s3 = session.intern_str("r1");

        assert_eq!(s1.as_ptr(), s2.as_ptr());
        assert_ne!(s1.as_ptr(), s3.as_ptr());
    }

    #[test]
    fn test_session_statistics() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.record_instruction_emitted("MUL");
        session.record_instruction_emitted("ADD");
        session.record_instruction_emitted("MUL");
        session.record_macro_expanded();
        session.record_program_compiled(3, 2);
        session.record_program_compiled(5, 1);
        session.record_program_failed();

        let stats = session.stats();
        assert_eq!(stats.programs_compiled, 2);
        assert_eq!(stats.programs_failed, 1);
        assert_eq!(stats.instructions_emitted, 3);
        assert_eq!(stats.total_instructions, 8);
        assert_eq!(stats.instruction_counts["MUL"], 2);
        assert_eq!(stats.peak_temps, 2);

        let output = format!("{}", stats);
        assert!(output.contains("Programs compiled: 2"));
        assert!(output.contains("MUL: 2"));
    }
}
