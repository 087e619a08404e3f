//! Lowering checks: every operation is compiled for each profile of its
//! program kind, executed on the virtual machine and compared with the
//! reference evaluator.

use arbgen::codegen::compile;
use arbgen::core::CompilationSession;
use arbgen::graph::ProgramKind;
use arbgen::target::profiles;
use arbgen::test_ir::{evaluate, parse_program, run_generated, RefInputs, RefOutcome};
use bumpalo::Bump;

type Case = [[f32; 4]; 3];

const GENERAL: Case = [
    [0.5, -1.25, 2.0, 3.5],
    [1.5, 0.75, -2.0, 0.25],
    [-0.5, 2.0, 1.0, -3.0],
];
const POSITIVE: Case = [
    [0.5, 1.25, 2.0, 3.5],
    [1.5, 0.75, 2.0, 0.25],
    [0.5, 2.0, 1.0, 3.0],
];
const UNIT: Case = [
    [0.5, -0.25, 0.9, -0.75],
    [0.25, 0.75, 0.0, 1.0],
    [-0.5, 2.0, 1.0, -3.0],
];
const EQUAL: Case = [
    [1.0, 2.0, 3.0, 4.0],
    [1.0, 0.0, 3.0, 5.0],
    [0.0, 0.0, 0.0, 0.0],
];

fn close(expected: &RefOutcome, actual: &RefOutcome) -> Result<(), String> {
    if expected.killed != actual.killed {
        return Err(format!("kill: expected {}, got {}", expected.killed, actual.killed));
    }
    if expected.killed {
        return Ok(());
    }
    for (name, want) in &expected.outputs {
        let got = actual
            .output(name)
            .ok_or_else(|| format!("missing output {}", name))?;
        for (w, g) in want.iter().zip(got) {
            if (w - g).abs() > 2e-3 * w.abs().max(1.0) {
                return Err(format!("{}: expected {:?}, got {:?}", name, want, got));
            }
        }
    }
    Ok(())
}

/// Compile `body` for every profile of `kind` and compare against the reference.
fn check(kind: ProgramKind, out_size: u8, body: &str, cases: &[Case]) {
    let source = format!(
        "program {}
input %a : 4 @texcoord0
input %b : 4 @texcoord1
input %c : 4 @texcoord2
output %o : {} @color
entry:
{}
",
        kind.name(),
        out_size,
        body
    );
    let graph = parse_program(&source).unwrap_or_else(|e| panic!("{}\n{}", e, source));
    for profile in profiles().iter().filter(|p| p.kind == kind) {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let program = compile(&graph, profile, &session)
            .unwrap_or_else(|e| panic!("{} under {}: {}", body.trim(), profile.name, e));
        for case in cases {
            let inputs = RefInputs::default()
                .with("a", &case[0])
                .with("b", &case[1])
                .with("c", &case[2]);
            let expected = evaluate(&graph, &inputs).unwrap();
            let actual = run_generated(&program, &graph, &inputs).unwrap();
            if let Err(msg) = close(&expected, &actual) {
                panic!(
                    "{} under {}: {}\n{}",
                    body.trim(),
                    profile.name,
                    msg,
                    program.text()
                );
            }
        }
    }
}

fn check_both(out_size: u8, body: &str, cases: &[Case]) {
    check(ProgramKind::Fragment, out_size, body, cases);
    check(ProgramKind::Vertex, out_size, body, cases);
}

#[test]
fn test_arithmetic() {
    for op in ["add", "mul", "max", "min"] {
        check_both(4, &format!("  %o = {} %a, %b", op), &[GENERAL, POSITIVE]);
    }
    check_both(4, "  %o = mov -%a", &[GENERAL]);
    check_both(4, "  %o = neg %a", &[GENERAL]);
    check_both(4, "  %o = abs %a", &[GENERAL]);
    check_both(4, "  %o = mad %a, %b, %c", &[GENERAL]);
    check_both(4, "  %o = lrp %a, %b, %c", &[UNIT]);
    check_both(4, "  %o = div %a, %b", &[GENERAL, POSITIVE]);
    check_both(4, "  %o = div %a, %b.y", &[GENERAL]);
    check_both(4, "  %o = rcp %a", &[GENERAL]);
}

#[test]
fn test_comparisons_and_selection() {
    for op in ["slt", "sle", "sgt", "sge", "seq", "sne"] {
        check_both(4, &format!("  %o = {} %a, %b", op), &[GENERAL, EQUAL]);
    }
    check_both(4, "  %o = sgn %a", &[GENERAL, EQUAL]);
    check_both(4, "  %o = cond %a, %b, %c", &[GENERAL, UNIT]);
    check_both(4, "  %o = cond %a.x, %b, %c", &[GENERAL, UNIT]);
}

#[test]
fn test_rounding() {
    let halves: Case = [
        [2.5, -2.5, 0.49, -7.0],
        [3.0, 3.0, 2.0, 2.0],
        [0.0; 4],
    ];
    for op in ["flr", "ceil", "frac", "rnd"] {
        check_both(4, &format!("  %o = {} %a", op), &[GENERAL, halves]);
    }
    let mods: Case = [
        [7.0, -7.0, 5.5, -5.5],
        [3.0, 3.0, 2.0, 2.0],
        [0.0; 4],
    ];
    check_both(4, "  %o = mod %a, %b", &[mods]);
}

#[test]
fn test_transcendentals() {
    for op in ["sin", "cos", "tan"] {
        check_both(4, &format!("  %o = {} %a", op), &[GENERAL, UNIT]);
    }
    for op in ["asin", "acos"] {
        check_both(4, &format!("  %o = {} %a", op), &[UNIT]);
    }
    for op in ["exp", "exp2", "exp10"] {
        check_both(4, &format!("  %o = {} %a", op), &[UNIT]);
    }
    for op in ["log", "log2", "log10", "sqrt", "rsq"] {
        check_both(4, &format!("  %o = {} %a", op), &[POSITIVE]);
    }
    check_both(4, "  %o = pow %a, %b", &[POSITIVE]);
}

#[test]
fn test_reductions() {
    for sel in ["x", "xy", "xyz", "xyzw"] {
        check_both(
            4,
            &format!("  %r = dot %a.{0}, %b.{0}\n  %o = mov %r", sel),
            &[GENERAL, POSITIVE],
        );
        check_both(
            4,
            &format!("  %r = csum %a.{0}\n  %o = mov %r", sel),
            &[GENERAL],
        );
        check_both(
            4,
            &format!("  %r = cmul %a.{0}\n  %o = mov %r", sel),
            &[GENERAL],
        );
    }
}

#[test]
fn test_vector_operations() {
    check_both(3, "  %o = xpd %a.xyz, %b.xyz", &[GENERAL, POSITIVE]);
    check_both(3, "  %o = norm %a.xyz", &[GENERAL, POSITIVE]);
    check_both(4, "  %o = norm %a", &[GENERAL, POSITIVE]);
    let lit: Case = [
        [0.5, 0.8, 0.0, 2.0],
        [-0.5, 0.8, 0.0, 2.0],
        [0.25, 0.5, 0.0, 3.0],
    ];
    check_both(4, "  %o = lit %a", &[lit]);
}

#[test]
fn test_masks_and_swizzles() {
    check_both(
        4,
        "  %o = mov [0, 0, 0, 0]\n  %o.yw = add %a.zx, %b.wy",
        &[GENERAL],
    );
    check_both(
        4,
        "  %t = mov %a\n  %t.zx = mul %t.xz, %b.yy\n  %o = mov %t.wzyx",
        &[GENERAL],
    );
    check_both(
        4,
        "  %o = mov 1\n  %o.z = sin %a.w",
        &[GENERAL],
    );
    // The same value read and written by one statement.
    check_both(4, "  %t = mov %a\n  %t = add %t.wzyx, %t\n  %o = mov %t", &[GENERAL]);
}

#[test]
fn test_kill() {
    check(ProgramKind::Fragment, 4, "  kil %a\n  %o = mov %b", &[GENERAL, EQUAL]);
    let negative: Case = [[-1.0; 4], [1.0; 4], [0.0; 4]];
    check(ProgramKind::Fragment, 4, "  kil %a\n  %o = mov %b", &[negative]);
}

#[test]
fn test_kill_inside_conditional() {
    let body = "  %s = sgt %a.x, 0
  brc %s, ^k
skip:
  %o = mov %b
  br ^exit
k:
  kil %b
  %o = mov %a";
    let cases: [Case; 3] = [
        [[1.0; 4], [1.0; 4], [0.0; 4]],
        [[-1.0; 4], [1.0; 4], [0.0; 4]],
        [[1.0; 4], [-1.0; 4], [0.0; 4]],
    ];
    check(ProgramKind::Fragment, 4, body, &cases);
}

#[test]
fn test_in_place_reordered_source() {
    let body = |op: &str| format!("  %t = mov %a\n  %t = {} %t.wzyx\n  %o = mov %t", op);
    for op in ["rcp", "sin", "cos"] {
        check_both(4, &body(op), &[GENERAL, UNIT]);
    }
    for op in ["exp", "exp2", "exp10"] {
        check_both(4, &body(op), &[UNIT]);
    }
    for op in ["log", "log2", "log10", "sqrt", "rsq"] {
        check_both(4, &body(op), &[POSITIVE]);
    }
    check_both(
        4,
        "  %t = mov %a\n  %t = pow %t.wzyx, %t\n  %o = mov %t",
        &[POSITIVE],
    );
    check_both(
        4,
        "  %t = mov %a\n  %t = div %b, %t.wzyx\n  %o = mov %t",
        &[GENERAL, POSITIVE],
    );
    // A broadcast component written first and read by every later one.
    check_both(4, "  %t = mov %a\n  %t = rcp %t.x\n  %o = mov %t", &[GENERAL]);
    check_both(
        4,
        "  %t = mov [0, 0, 0, 0]\n  %t.zx = exp2 %a.xz\n  %t.zx = rcp %t.xz\n  %o = mov %t",
        &[UNIT],
    );
}

#[test]
fn test_in_place_select() {
    check_both(
        4,
        "  %t = mov %a\n  %t = cond %b, %c, %t.wzyx\n  %o = mov %t",
        &[GENERAL, UNIT],
    );
    check_both(
        4,
        "  %t = mov %a\n  %t = cond %b, %t.yxwz, %t.wzyx\n  %o = mov %t",
        &[GENERAL, EQUAL],
    );
}
