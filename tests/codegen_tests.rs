//! End-to-end generator tests: textual IR in, assembly and bindings out.

use arbgen::codegen::{compile, GeneratedProgram, ProgramState, ShaderProgram, VReg};
use arbgen::core::{CompilationSession, CompileError, RegClass};
use arbgen::graph::ProgramGraph;
use arbgen::target::profile_by_name;
use arbgen::test_ir::{evaluate, parse_program, run_generated, RefInputs, VirtualDevice};
use bumpalo::Bump;
use hashbrown::HashMap;

fn generate(source: &str, profile: &str) -> Result<GeneratedProgram, CompileError> {
    let graph = parse_program(source).unwrap();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    compile(&graph, profile_by_name(profile).unwrap(), &session)
}

fn vreg_named(program: &GeneratedProgram, name: &str) -> VReg {
    let index = program
        .vregs()
        .iter()
        .position(|v| v.name == name)
        .unwrap_or_else(|| panic!("no virtual register for {}", name));
    VReg(index as u32)
}

const SELECT: &str = "program fragment
input %x : 4 @texcoord0
output %o : 4 @color
entry:
  %c = sgt %x.x, 0
  brc %c, ^pos
neg:
  %o = mov -%x
  br ^exit
pos:
  %o = mov %x
";

fn check_select(graph: &ProgramGraph, program: &GeneratedProgram) {
    for x in [[1.0, 2.0, 3.0, 4.0], [-1.0, 2.0, 3.0, 4.0], [0.0, 5.0, -6.0, 7.0]] {
        let inputs = RefInputs::default().with("x", &x);
        let expected = evaluate(graph, &inputs).unwrap();
        let actual = run_generated(program, graph, &inputs).unwrap();
        assert_eq!(expected, actual, "input {:?}\n{}", x, program.text());
    }
}

#[test]
fn test_conditional_select_is_flattened_without_branching() {
    let graph = parse_program(SELECT).unwrap();
    let program = generate(SELECT, "arbfp1").unwrap();
    assert!(!program.text().contains("IF"), "{}", program.text());
    assert!(!program.text().contains("BRA"), "{}", program.text());
    assert!(program.text().contains("CMP"), "{}", program.text());
    check_select(&graph, &program);
}

#[test]
fn test_conditional_select_uses_if_when_available() {
    let graph = parse_program(SELECT).unwrap();
    let program = generate(SELECT, "nvfp2").unwrap();
    let text = program.text();
    assert!(text.starts_with("!!ARBfp1.0\nOPTION NV_fragment_program2;\n"));
    assert!(text.contains("IF GT.x;"), "{}", text);
    assert!(text.contains("ELSE;"), "{}", text);
    assert!(text.contains("ENDIF;"), "{}", text);
    check_select(&graph, &program);
}

#[test]
fn test_conditional_select_uses_condition_codes_on_nvfp() {
    let graph = parse_program(SELECT).unwrap();
    let program = generate(SELECT, "nvfp").unwrap();
    let text = program.text();
    assert!(!text.contains("IF"), "{}", text);
    assert!(!text.contains("BRA"), "{}", text);
    assert!(text.contains("MOVC"), "{}", text);
    assert!(text.contains("(GT)"), "{}", text);
    check_select(&graph, &program);
}

#[test]
fn test_vertex_select_uses_labels_on_nvvp2() {
    let source = SELECT.replace("program fragment", "program vertex");
    let graph = parse_program(&source).unwrap();
    let program = generate(&source, "nvvp2").unwrap();
    let text = program.text();
    assert!(text.contains("BRA L"), "{}", text);
    assert!(!text.contains("IF"), "{}", text);
    check_select(&graph, &program);

    let flat = generate(&source, "arbvp1").unwrap();
    assert!(!flat.text().contains("BRA"), "{}", flat.text());
    check_select(&graph, &flat);
}

#[test]
fn test_disjoint_temps_share_a_register() {
    let source = "program fragment
input %x : 4 @texcoord0
output %o : 4 @color
entry:
  %a = mul %x, %x
  %t = add %a, %x
  %b = mul %t, %t
  %o = add %b, %x
";
    let program = generate(source, "arbfp1").unwrap();
    let alloc = program.allocation();
    let (a, t, b) = (
        vreg_named(&program, "a"),
        vreg_named(&program, "t"),
        vreg_named(&program, "b"),
    );
    assert_eq!(alloc.reg(a), alloc.reg(b));
    assert_ne!(alloc.reg(a), alloc.reg(t));
    assert_eq!(program.temps_used(), 2);
    assert!(program.text().contains("TEMP r0, r1;"));
}

#[test]
fn test_simultaneously_live_temps_never_share() {
    let source = "program fragment
input %x : 4 @texcoord0
input %y : 4 @texcoord1
output %o : 4 @color
entry:
  %a = mul %x, %y
  %b = add %x, %y
  %c = mul %a, %b
  %d = add %c, %a
  %o = mad %d, %b, %c
";
    let program = generate(source, "arbfp1").unwrap();
    let alloc = program.allocation();
    let regs: Vec<_> = ["a", "b", "c", "d"]
        .iter()
        .map(|n| alloc.reg(vreg_named(&program, n)).unwrap())
        .collect();
    // a, b and c are all live when d is defined.
    for i in 0..3 {
        for j in i + 1..4 {
            if (i, j) == (0, 3) {
                continue;
            }
            assert_ne!(regs[i], regs[j], "{} and {} share", i, j);
        }
    }
}

#[test]
fn test_temp_overflow_is_reported() {
    let mut source = String::from(
        "program fragment\ninput %x : 4 @texcoord0\noutput %o : 4 @color\nentry:\n",
    );
    for i in 0..33 {
        source.push_str(&format!("  %t{} = add %x, %x\n", i));
    }
    // All 33 are live once %t32 is defined; folding frees one per step.
    for i in 1..33 {
        source.push_str(&format!("  %t0 = add %t0, %t{}\n", i));
    }
    source.push_str("  %o = mov %t0\n");

    let err = generate(&source, "arbfp1").unwrap_err();
    match err {
        CompileError::RegisterOverflow {
            class,
            requested,
            available,
        } => {
            assert_eq!(class, RegClass::Temp.name());
            assert_eq!(requested, 33);
            assert_eq!(available, 32);
        }
        other => panic!("unexpected error {}", other),
    }
    let err = generate(&source, "arbfp1").unwrap_err();
    assert_eq!(err.to_string(), "out of temp registers: requested 33, available 32");
}

#[test]
fn test_unsupported_operations() {
    let atan = "program fragment
input %x : 4 @texcoord0
output %o : 4 @color
entry:
  %o = atan %x
";
    let err = generate(atan, "nvfp2").unwrap_err();
    assert!(
        matches!(err, CompileError::UnsupportedOperation { op: "ATAN", .. }),
        "{}",
        err
    );

    let dx = "program fragment
input %x : 4 @texcoord0
output %o : 4 @color
entry:
  %o = dx %x
";
    assert!(matches!(
        generate(dx, "arbfp1").unwrap_err(),
        CompileError::UnsupportedOperation { op: "DX", profile: "arbfp1", .. }
    ));
    assert!(generate(dx, "nvfp").unwrap().text().contains("DDX"));
}

const COUNTING_LOOP: &str = "program fragment
input %x : 4 @texcoord0
output %o : 4 @color
entry:
  %i = mov %x.x
  %o = mov 0
loop:
  %o = add %o, 1
  %i = add %i, -1
  %c = sgt %i, 0
  brc %c, ^loop
";

fn check_counting_loop(source: &str, profile: &str) -> GeneratedProgram {
    let graph = parse_program(source).unwrap();
    let program = generate(source, profile).unwrap();
    let inputs = RefInputs::default().with("x", &[3.0, 0.0, 0.0, 0.0]);
    let expected = evaluate(&graph, &inputs).unwrap();
    assert_eq!(expected.output("o"), Some(&[3.0, 3.0, 3.0, 3.0][..]));
    assert_eq!(
        run_generated(&program, &graph, &inputs).unwrap(),
        expected,
        "{}",
        program.text()
    );
    program
}

#[test]
fn test_loops_need_native_control_flow() {
    for profile in ["arbfp1", "nvfp"] {
        let err = generate(COUNTING_LOOP, profile).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedControlFlow { .. }), "{}", err);
    }
    let program = check_counting_loop(COUNTING_LOOP, "nvfp2");
    assert!(program.text().contains("REP c"), "{}", program.text());
    assert!(program.text().contains("BRK (LE.x);"), "{}", program.text());
    assert!(program.text().contains("ENDREP;"), "{}", program.text());

    let vertex = COUNTING_LOOP.replace("program fragment", "program vertex");
    assert!(generate(&vertex, "arbvp1").is_err());
    let program = check_counting_loop(&vertex, "nvvp2");
    assert!(program.text().contains("BRA L"), "{}", program.text());
}

#[test]
fn test_profile_kind_mismatch() {
    let source = "program vertex
input %p : 4 @position
output %o : 4 @position
entry:
  %o = mov %p
";
    let err = generate(source, "arbfp1").unwrap_err();
    assert!(matches!(err, CompileError::GraphInvariant { .. }));
    let program = generate(source, "arbvp1").unwrap();
    assert!(program.text().starts_with("!!ARBvp1.0\n"));
    assert!(program.text().contains("ATTRIB i0 = vertex.position;"));
    assert!(program.text().contains("OUTPUT o0 = result.position;"));
}

#[test]
fn test_params_and_constants_are_declared() {
    let source = "program fragment
input %x : 4 @texcoord0
output %o : 4 @color
param %tint : 4 = [1, 0.5, 0.25, 1]
param %bias = [0.125]
entry:
  %t = mul %x, %tint
  %o = add %t, %bias
";
    let program = generate(source, "arbfp1").unwrap();
    let text = program.text();
    assert!(text.contains("PARAM u0 = program.local[0]; # tint"), "{}", text);
    assert!(text.contains("PARAM u1 = program.local[1]; # bias"), "{}", text);
    assert_eq!(program.register_of("tint").as_deref(), Some("u0"));
    assert_eq!(
        program.constants(),
        vec![[1.0, 0.5, 0.25, 1.0], [0.125, 0.0, 0.0, 0.0]]
    );
}

fn attribs(x: [f32; 4]) -> HashMap<String, [f32; 4]> {
    let mut map = HashMap::new();
    map.insert("fragment.texcoord[0]".to_string(), x);
    map
}

const TINTED: &str = "program fragment
input %x : 4 @texcoord0
output %o : 4 @color
param %tint : 4 = [2, 2, 2, 2]
entry:
  %o = mul %x, %tint
";

#[test]
fn test_life_cycle_and_parameter_updates() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut device = VirtualDevice::new();
    let graph = parse_program(TINTED).unwrap();
    let mut program = ShaderProgram::new(graph, profile_by_name("arbfp1").unwrap());
    assert_eq!(program.state(), ProgramState::Uncompiled);

    let err = program.upload(&mut device).unwrap_err();
    assert!(matches!(err, CompileError::InvalidState { state: "UNCOMPILED", .. }));

    program.generate(&session).unwrap();
    assert_eq!(program.state(), ProgramState::Generated);
    assert!(matches!(
        program.generate(&session).unwrap_err(),
        CompileError::InvalidState { action: "generate", .. }
    ));

    let handle = program.upload(&mut device).unwrap();
    assert_eq!(program.state(), ProgramState::Uploaded);
    let out = device.run(handle, attribs([1.0; 4]), &|_, _| [0.0; 4]).unwrap();
    assert_eq!(out.output("result.color"), Some([2.0; 4]));

    // Same shape: straight to the device.
    program.set_param("tint", &[3.0, 3.0, 3.0, 3.0], &mut device).unwrap();
    assert_eq!(program.state(), ProgramState::Uploaded);
    assert_eq!(device.param_updates, 1);
    let out = device.run(handle, attribs([1.0; 4]), &|_, _| [0.0; 4]).unwrap();
    assert_eq!(out.output("result.color"), Some([3.0; 4]));

    // New shape: the code is stale.
    program.set_param("tint", &[0.5], &mut device).unwrap();
    assert_eq!(program.state(), ProgramState::Stale);
    assert!(program.upload(&mut device).is_err());
    assert!(matches!(
        program.set_param("missing", &[1.0], &mut device).unwrap_err(),
        CompileError::UnknownParameter { .. }
    ));

    program.set_param("tint", &[0.5, 0.5, 0.5, 0.5], &mut device).unwrap();
    assert_eq!(program.state(), ProgramState::Stale);

    program.generate(&session).unwrap();
    let handle = program.upload(&mut device).unwrap();
    let out = device.run(handle, attribs([4.0; 4]), &|_, _| [0.0; 4]).unwrap();
    assert_eq!(out.output("result.color"), Some([2.0; 4]));
    assert_eq!(session.stats().programs_compiled, 2);
}

#[test]
fn test_rejected_upload_keeps_generated_code() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut device = VirtualDevice::new();
    device.reject = Some("device lost".to_string());
    let mut program = ShaderProgram::new(
        parse_program(TINTED).unwrap(),
        profile_by_name("arbfp1").unwrap(),
    );
    program.generate(&session).unwrap();
    let err = program.upload(&mut device).unwrap_err();
    assert!(matches!(err, CompileError::Upload(_)));
    assert!(err.to_string().contains("device lost"));
    assert_eq!(program.state(), ProgramState::Generated);

    device.reject = None;
    program.upload(&mut device).unwrap();
    assert_eq!(program.state(), ProgramState::Uploaded);
    program.graph_mut();
    assert_eq!(program.state(), ProgramState::Stale);
}

#[test]
fn test_failed_generation_returns_to_uncompiled() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let source = "program fragment
input %x : 4 @texcoord0
output %o : 4 @color
entry:
  %o = atan %x
";
    let mut program =
        ShaderProgram::new(parse_program(source).unwrap(), profile_by_name("nvfp2").unwrap());
    assert!(program.generate(&session).is_err());
    assert_eq!(program.state(), ProgramState::Uncompiled);
    assert!(program.generated().is_none());
    assert_eq!(session.stats().programs_failed, 1);
}
