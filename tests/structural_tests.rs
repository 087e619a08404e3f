//! Structural analysis of programs written in the textual IR.

use arbgen::codegen::compile;
use arbgen::core::{CompilationSession, CompileError};
use arbgen::graph::ProgramGraph;
use arbgen::structural::{RegionKind, StructuralTree};
use arbgen::target::profile_by_name;
use arbgen::test_ir::parse_program;
use bumpalo::Bump;
use hashbrown::HashSet;

const HEADER: &str = "program fragment
input %x : 4 @texcoord0
output %o : 4 @color
";

fn program(body: &str) -> ProgramGraph {
    let source = format!("{}{}", HEADER, body);
    parse_program(&source).unwrap_or_else(|e| panic!("{}\n{}", e, source))
}

/// Every reachable node is exactly one leaf of the tree.
fn assert_partition(tree: &StructuralTree, graph: &ProgramGraph) {
    let leaves = tree.leaves(tree.root());
    let unique: HashSet<_> = leaves.iter().copied().collect();
    assert_eq!(unique.len(), leaves.len(), "leaf listed twice");
    let reachable: HashSet<_> = graph.rpo().into_iter().collect();
    assert_eq!(unique, reachable);
}

const SELECT: &str = "entry:
  %c = sgt %x.x, 0
  brc %c, ^pos
neg:
  %o = mov -%x
  br ^exit
pos:
  %o = mov %x
";

#[test]
fn test_if_else_from_text() {
    let graph = program(SELECT);
    let tree = StructuralTree::analyze(&graph);
    assert_eq!(
        tree.signature(&graph),
        "BLOCK(IFELSE(LEAF(entry),LEAF(pos),LEAF(neg)),LEAF(exit))"
    );
    assert_eq!(tree.kind(tree.root()), RegionKind::Block);
    assert_partition(&tree, &graph);
}

#[test]
fn test_removing_an_arm_leaves_an_if() {
    let mut graph = program(SELECT);
    let neg = graph
        .node_ids()
        .find(|id| graph.node_name(*id) == "neg")
        .unwrap();
    graph.remove_node(neg);
    assert!(!graph.contains(neg));
    assert_eq!(graph.node(graph.entry()).follower, Some(graph.exit()));

    let tree = StructuralTree::analyze(&graph);
    assert_eq!(
        tree.signature(&graph),
        "BLOCK(IF(LEAF(entry),LEAF(pos)),LEAF(exit))"
    );
    assert_partition(&tree, &graph);
}

#[test]
fn test_self_loop_from_text() {
    let graph = program(
        "entry:
  %i = mov %x.x
loop:
  %i = add %i, -1
  %c = sgt %i, 0
  brc %c, ^loop
",
    );
    let tree = StructuralTree::analyze(&graph);
    assert_eq!(
        tree.signature(&graph),
        "BLOCK(LEAF(entry),SELFLOOP(LEAF(loop)),LEAF(exit))"
    );
    assert_partition(&tree, &graph);
}

#[test]
fn test_while_loop_from_text() {
    let graph = program(
        "entry:
  %i = mov %x.x
head:
  %c = sgt %i, 0
  brc %c, ^body
  br ^exit
body:
  %i = add %i, -1
  br ^head
",
    );
    let tree = StructuralTree::analyze(&graph);
    assert_eq!(
        tree.signature(&graph),
        "BLOCK(LEAF(entry),WHILELOOP(LEAF(head),LEAF(body)),LEAF(exit))"
    );
    let describe = tree.describe(&graph);
    assert!(describe.starts_with("BLOCK\n  LEAF entry\n  WHILELOOP\n    LEAF head\n"));
}

#[test]
fn test_section_from_text() {
    let graph = program(
        "entry:
  %o = mov 1
  startsec \"shade\"
  %o = mul %x, %x
  endsec
  %o = add %o, 1
",
    );
    let tree = StructuralTree::analyze(&graph);
    assert_eq!(
        tree.signature(&graph),
        "BLOCK(LEAF(entry),SECTION(LEAF(entry.1)),LEAF(entry.2),LEAF(exit))"
    );
    assert!(tree.describe(&graph).contains("  SECTION \"shade\"\n    LEAF entry.1\n"));
}

const TWO_ENTRY_CYCLE: &str = "entry:
  %c = sgt %x.x, 0
  brc %c, ^b
a:
  %o = add %x, 1
  brc %c, ^exit
  br ^b
b:
  %o = add %x, 2
  brc %c, ^exit
  br ^a
";

#[test]
fn test_irreducible_from_text() {
    let graph = program(TWO_ENTRY_CYCLE);
    let tree = StructuralTree::analyze(&graph);
    let sig = tree.signature(&graph);
    assert!(sig.contains("IRREDUCIBLE"), "{}", sig);
    assert_partition(&tree, &graph);
}

#[test]
fn test_irreducible_needs_labels() {
    let graph = program(TWO_ENTRY_CYCLE);
    for name in ["arbfp1", "nvfp", "nvfp2"] {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let profile = profile_by_name(name).unwrap();
        let err = compile(&graph, profile, &session).unwrap_err();
        assert!(
            matches!(err, CompileError::UnsupportedControlFlow { .. }),
            "{}: {}",
            name,
            err
        );
    }
}

#[test]
fn test_nested_regions_are_stable() {
    let graph = program(
        "entry:
  %i = mov %x.x
head:
  %c = sgt %i, 0
  brc %c, ^body
  br ^exit
body:
  %d = sgt %i, 2
  brc %d, ^big
small:
  %i = add %i, -1
  br ^join
big:
  %i = add %i, -2
join:
  br ^head
",
    );
    let first = StructuralTree::analyze(&graph);
    let second = StructuralTree::analyze(&graph);
    assert_eq!(first.signature(&graph), second.signature(&graph));
    assert_partition(&first, &graph);

    let sig = first.signature(&graph);
    assert!(sig.contains("IFELSE(LEAF(body),LEAF(big),LEAF(small))"), "{}", sig);
    assert!(sig.contains("WHILELOOP(LEAF(head),BLOCK("), "{}", sig);
    assert!(first.to_dot(&graph).starts_with("digraph structural {"));
}
