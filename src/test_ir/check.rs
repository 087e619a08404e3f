//! FileCheck-style test validation for shader IR files.
//!
//! This module parses RUN and CHECK directives from `.sir` files, compiles
//! the program with the flags a RUN line names, and validates the output
//! against the expected patterns, similar to LLVM's FileCheck tool but
//! implemented in a Rust-native way.

use bumpalo::Bump;

use super::parser::parse_program;
use crate::codegen::{compile, describe_interface};
use crate::core::CompilationSession;
use crate::structural::StructuralTree;
use crate::target::{default_profile, profile_by_name};

/// A CHECK directive extracted from a test file
#[derive(Debug, Clone, PartialEq)]
pub enum CheckDirective {
    /// CHECK: pattern - Match pattern on some later line
    Check(String),
    /// CHECK-LABEL: pattern - Label for a section
    CheckLabel(String),
    /// CHECK-NEXT: pattern - Match on the next line
    CheckNext(String),
    /// CHECK-NOT: pattern - Must not occur before the next match
    CheckNot(String),
    /// CHECK-EMPTY - Match empty line
    CheckEmpty,
    /// COM: comment - Comment, ignored
    Comment(String),
}

/// A RUN directive specifying how to execute the test
#[derive(Debug, Clone)]
pub struct RunDirective {
    pub command: String,
    pub args: Vec<String>,
}

/// Test specification extracted from a test file
#[derive(Debug)]
pub struct TestSpec {
    pub run_directives: Vec<RunDirective>,
    pub check_directives: Vec<CheckDirective>,
    pub ir_content: String,
}

impl TestSpec {
    /// Parse a test file to extract test specifications
    pub fn parse(content: &str) -> Result<Self, String> {
        let mut run_directives = Vec::new();
        let mut check_directives = Vec::new();
        let mut ir_lines = Vec::new();

        for line in content.lines() {
            let trimmed = line.trim();

            if let Some(run_cmd) = trimmed.strip_prefix("; RUN:") {
                let parts: Vec<&str> = run_cmd.split_whitespace().collect();
                if !parts.is_empty() {
                    run_directives.push(RunDirective {
                        command: parts[0].to_string(),
                        args: parts[1..].iter().map(|s| s.to_string()).collect(),
                    });
                }
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK-LABEL:") {
                check_directives.push(CheckDirective::CheckLabel(pattern.trim().to_string()));
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK-NEXT:") {
                check_directives.push(CheckDirective::CheckNext(pattern.trim().to_string()));
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK-NOT:") {
                check_directives.push(CheckDirective::CheckNot(pattern.trim().to_string()));
            } else if trimmed.starts_with("; CHECK-EMPTY") {
                check_directives.push(CheckDirective::CheckEmpty);
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK:") {
                check_directives.push(CheckDirective::Check(pattern.trim().to_string()));
            } else if let Some(comment) = trimmed.strip_prefix("; COM:") {
                check_directives.push(CheckDirective::Comment(comment.trim().to_string()));
            } else {
                // Regular program text
                ir_lines.push(line);
            }
        }

        if run_directives.is_empty() {
            return Err("test has no RUN line".to_string());
        }

        Ok(TestSpec {
            run_directives,
            check_directives,
            ir_content: ir_lines.join("\n"),
        })
    }
}

/// Test runner that executes shader IR tests
pub struct TestRunner {
    verbose: bool,
}

impl TestRunner {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Run a test and validate output
    pub fn run_test(&self, spec: &TestSpec) -> Result<(), String> {
        for run_dir in &spec.run_directives {
            let output = self.execute_command(&spec.ir_content, run_dir)?;
            if self.verbose {
                println!("--- output of {} ---\n{}", run_dir.command, output);
            }
            self.validate_output(&output, &spec.check_directives)?;
        }
        Ok(())
    }

    /// Execute a test command and return the output
    pub fn execute_command(&self, content: &str, run_dir: &RunDirective) -> Result<String, String> {
        let mut profile_name = None;
        let mut print_asm = false;
        let mut print_bindings = false;
        let mut print_structure = false;
        let mut print_interface = false;
        let mut expect_error = false;

        let mut args = run_dir.args.iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--profile" => profile_name = args.next().cloned(),
                "--print-asm" => print_asm = true,
                "--print-bindings" => print_bindings = true,
                "--print-structure" => print_structure = true,
                "--print-interface" => print_interface = true,
                "--expect-error" => expect_error = true,
                _ => {}
            }
        }
        if !(print_bindings || print_structure || print_interface) {
            print_asm = true;
        }

        let graph = parse_program(content)?;
        let profile = match &profile_name {
            Some(name) => profile_by_name(name).map_err(|e| e.to_string())?,
            None => default_profile(graph.kind),
        };

        let mut output = Vec::new();
        if print_interface {
            output.push(describe_interface(&graph));
        }
        if print_structure {
            let tree = StructuralTree::analyze(&graph);
            output.push(tree.describe(&graph));
        }

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        match compile(&graph, profile, &session) {
            Ok(program) if !expect_error => {
                if print_asm {
                    output.push(program.text().to_string());
                }
                if print_bindings {
                    output.push(program.describe_bindings());
                }
            }
            Ok(_) => {
                return Err(format!(
                    "expected compilation under {} to fail, but it succeeded",
                    profile.name
                ))
            }
            Err(err) if expect_error => output.push(format!("error: {}", err)),
            Err(err) => return Err(format!("compilation under {} failed: {}", profile.name, err)),
        }

        Ok(output.join("\n"))
    }

    fn check_not(
        lines: &[&str],
        pending: &mut Vec<&String>,
        range: std::ops::Range<usize>,
    ) -> Result<(), String> {
        for pattern in pending.drain(..) {
            if let Some(line) = lines[range.clone()].iter().find(|l| l.contains(pattern.as_str())) {
                return Err(format!("CHECK-NOT: pattern '{}' found in '{}'", pattern, line));
            }
        }
        Ok(())
    }

    /// Validate output against CHECK directives
    pub fn validate_output(
        &self,
        output: &str,
        directives: &[CheckDirective],
    ) -> Result<(), String> {
        let output_lines: Vec<&str> = output.lines().collect();
        let mut line_idx = 0;
        let mut pending_not: Vec<&String> = Vec::new();

        for directive in directives {
            match directive {
                CheckDirective::Comment(_) => continue,

                CheckDirective::CheckNot(pattern) => pending_not.push(pattern),

                CheckDirective::Check(pattern) | CheckDirective::CheckLabel(pattern) => {
                    let found = output_lines
                        .iter()
                        .skip(line_idx)
                        .position(|line| line.contains(pattern.as_str()));

                    match found {
                        Some(idx) => {
                            Self::check_not(
                                &output_lines,
                                &mut pending_not,
                                line_idx..line_idx + idx,
                            )?;
                            line_idx += idx + 1;
                            if self.verbose {
                                println!("CHECK: '{}' found at line {}", pattern, line_idx - 1);
                            }
                        }
                        None => {
                            return Err(format!(
                                "CHECK: pattern '{}' not found in output:\n{}",
                                pattern, output
                            ));
                        }
                    }
                }

                CheckDirective::CheckNext(pattern) => {
                    if line_idx >= output_lines.len() {
                        return Err(format!("CHECK-NEXT: no more lines, expected '{}'", pattern));
                    }

                    let line = output_lines[line_idx];
                    if !line.contains(pattern.as_str()) {
                        return Err(format!(
                            "CHECK-NEXT: expected '{}' but got '{}'",
                            pattern, line
                        ));
                    }
                    Self::check_not(&output_lines, &mut pending_not, line_idx..line_idx)?;

                    if self.verbose {
                        println!("CHECK-NEXT: '{}' matches at line {}", pattern, line_idx);
                    }
                    line_idx += 1;
                }

                CheckDirective::CheckEmpty => {
                    if line_idx >= output_lines.len() {
                        continue; // End of output counts as empty
                    }

                    let line = output_lines[line_idx];
                    if !line.trim().is_empty() {
                        return Err(format!(
                            "CHECK-EMPTY: expected empty line but got '{}'",
                            line
                        ));
                    }
                    line_idx += 1;
                }
            }
        }

        let end = output_lines.len();
        Self::check_not(&output_lines, &mut pending_not, line_idx.min(end)..end)
    }
}

/// Parse and run one test file's contents.
pub fn run_filecheck(content: &str, verbose: bool) -> Result<(), String> {
    let spec = TestSpec::parse(content)?;
    TestRunner::new(verbose).run_test(&spec)
}
