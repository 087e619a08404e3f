//! One traversal skeleton, many passes.
//!
//! [`ProgramGraph::walk`] visits reachable nodes in depth-first pre-order and
//! calls back into a [`GraphVisitor`] on entering a node, for every statement,
//! and on leaving it. Each analysis is a small stateful visitor.

use hashbrown::{HashMap, HashSet};

use super::{Node, NodeId, ProgramGraph, Statement, ValueId};

/// Callbacks invoked by [`ProgramGraph::walk`].
pub trait GraphVisitor {
    fn enter_node(&mut self, _id: NodeId, _node: &Node) {}
    fn statement(&mut self, _id: NodeId, _index: usize, _stmt: &Statement) {}
    fn leave_node(&mut self, _id: NodeId, _node: &Node) {}
}

impl ProgramGraph {
    /// Drive `visitor` over every reachable node.
    pub fn walk<V: GraphVisitor + ?Sized>(&self, visitor: &mut V) {
        for id in self.dfs_order() {
            self.walk_node(id, visitor);
        }
    }

    /// Drive `visitor` over a single node.
    pub fn walk_node<V: GraphVisitor + ?Sized>(&self, id: NodeId, visitor: &mut V) {
        let node = self.node(id);
        visitor.enter_node(id, node);
        for (i, stmt) in node.statements().iter().enumerate() {
            visitor.statement(id, i, stmt);
        }
        visitor.leave_node(id, node);
    }
}

/// Values read and written by the program, in order of first reference.
#[derive(Debug, Default)]
pub struct ValueUses {
    pub order: Vec<ValueId>,
    pub reads: HashSet<ValueId>,
    pub writes: HashSet<ValueId>,
    seen: HashSet<ValueId>,
}

impl ValueUses {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(&mut self, value: ValueId) {
        if self.seen.insert(value) {
            self.order.push(value);
        }
    }

    pub fn is_used(&self, value: ValueId) -> bool {
        self.seen.contains(&value)
    }
}

impl GraphVisitor for ValueUses {
    fn enter_node(&mut self, _id: NodeId, node: &Node) {
        for edge in &node.succs {
            self.touch(edge.cond.value);
            self.reads.insert(edge.cond.value);
        }
    }

    fn statement(&mut self, _id: NodeId, _index: usize, stmt: &Statement) {
        for src in &stmt.src {
            self.touch(src.value);
            self.reads.insert(src.value);
        }
        if let Some(dest) = &stmt.dest {
            self.touch(dest.value);
            self.writes.insert(dest.value);
        }
    }
}

/// Assigns every statement a sequential index in traversal order. Statements
/// that already carry an origin keep it.
#[derive(Debug, Default)]
pub struct StatementNumbering {
    next: usize,
    pub numbers: HashMap<(NodeId, usize), usize>,
}

impl StatementNumbering {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn number(&self, node: NodeId, index: usize) -> Option<usize> {
        self.numbers.get(&(node, index)).copied()
    }
}

impl GraphVisitor for StatementNumbering {
    fn statement(&mut self, id: NodeId, index: usize, stmt: &Statement) {
        let n = stmt.origin().unwrap_or(self.next);
        self.numbers.insert((id, index), n);
        self.next = self.next.max(n) + 1;
    }
}

/// Values written inside a fixed set of nodes.
#[derive(Debug, Default)]
pub struct WrittenValues {
    pub values: Vec<ValueId>,
    seen: HashSet<ValueId>,
}

impl WrittenValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, value: ValueId) -> bool {
        self.seen.contains(&value)
    }
}

impl GraphVisitor for WrittenValues {
    fn statement(&mut self, _id: NodeId, _index: usize, stmt: &Statement) {
        if let Some(dest) = &stmt.dest {
            if self.seen.insert(dest.value) {
                self.values.push(dest.value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Op, ProgramKind, Value};

    #[test]
    fn test_value_uses_and_numbering() {
        let mut graph = ProgramGraph::new(ProgramKind::Fragment);
        let a = graph.values_mut().add(Value::input("a", 4));
        let t = graph.values_mut().add(Value::temp("t", 4));
        let o = graph.values_mut().add(Value::output("o", 4));
        let unused = graph.values_mut().add(Value::param("p", &[1.0]));
        let (ao, to, oo) = (
            graph.values().operand(a),
            graph.values().operand(t),
            graph.values().operand(o),
        );
        let entry = graph.entry();
        let exit = graph.exit();
        graph.push_statement(entry, Statement::new(Op::Add, Some(to), vec![ao, ao]));
        graph.push_statement(entry, Statement::new(Op::Asn, Some(oo), vec![to]));
        graph.append(entry, exit);

        let mut uses = ValueUses::new();
        graph.walk(&mut uses);
        assert_eq!(uses.order, vec![a, t, o]);
        assert!(uses.reads.contains(&t) && uses.writes.contains(&t));
        assert!(!uses.is_used(unused));

        let mut numbering = StatementNumbering::new();
        graph.walk(&mut numbering);
        assert_eq!(numbering.number(entry, 1), Some(1));

        let mut written = WrittenValues::new();
        graph.walk_node(entry, &mut written);
        assert_eq!(written.values, vec![t, o]);
    }
}
