use std::fmt::Write;

use crate::operators::{OperatorCategory, OperatorKind};
use crate::span::Position;

use super::lexer::{Token, TokenKind};

/// Kind of an interior tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Module,
    Statement,
    BinOp,
    UnaryOp,
    BoolOp,
    Compare,
    IfExp,
    Lambda,
    Parameters,
    NamedExpr,
    Starred,
    Await,
    Yield,
    Call,
    Arguments,
    Keyword,
    Attribute,
    Subscript,
    Slice,
    /// Parenthesized expression, tuple, list, set or dict display.
    Group,
    Comprehension,
    Atom,
    /// Tokens kept verbatim (imports, `global`, soft-keyword headers).
    Opaque,
}

impl NodeKind {
    /// Category of the operators this node carries, if it carries any.
    pub fn operator_category(self) -> Option<OperatorCategory> {
        match self {
            NodeKind::UnaryOp => Some(OperatorCategory::Unary),
            NodeKind::BinOp => Some(OperatorCategory::Binary),
            NodeKind::BoolOp => Some(OperatorCategory::Boolean),
            NodeKind::Compare => Some(OperatorCategory::Comparison),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    Node(Node),
    Token(Token),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub kind: NodeKind,
    pub children: Vec<Element>,
    depth: usize,
}

impl Node {
    pub fn new(kind: NodeKind, children: Vec<Element>) -> Self {
        let depth = 1 + children
            .iter()
            .map(|child| match child {
                Element::Node(n) => n.depth,
                Element::Token(_) => 0,
            })
            .max()
            .unwrap_or(0);

        Self {
            kind,
            children,
            depth,
        }
    }

    /// Nesting depth of the subtree rooted here (a node without child nodes
    /// has depth 1). Computed at construction; rewrites only touch tokens.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Operator tokens owned directly by this node, in source order.
    ///
    /// Chained comparisons and boolean chains own several; their index in
    /// this sequence is the chain index.
    pub fn operator_tokens(&self) -> impl Iterator<Item = &Token> {
        self.children.iter().filter_map(|child| match child {
            Element::Token(t) if matches!(t.kind, TokenKind::Operator(_)) => Some(t),
            _ => None,
        })
    }
}

/// One operator occurrence found in a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorOccurrence {
    pub category: OperatorCategory,
    pub kind: OperatorKind,
    pub position: Position,
    pub chain_index: usize,
}

/// Parsed Python module.
///
/// `Clone` is a full deep copy: mutants never share nodes with the tree they
/// were derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxTree {
    root: Node,
}

impl SyntaxTree {
    pub fn new(root: Node) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Every mutable operator in the tree, ordered by position.
    pub fn operators(&self) -> Vec<OperatorOccurrence> {
        let mut found = Vec::new();
        collect_operators(&self.root, &mut found);
        found.sort_by_key(|o| (o.position, o.chain_index));
        found
    }

    /// Visit operator tokens bottom-up: a node's children are rewritten
    /// before the node's own operators are offered to `f`.
    ///
    /// `f` receives the owning node kind, the chain index and the token.
    pub fn rewrite_operators<F>(&mut self, f: &mut F)
    where
        F: FnMut(NodeKind, usize, &mut Token),
    {
        rewrite_node(&mut self.root, f);
    }

    /// Recompute every token position from the token texts.
    ///
    /// Needed after a rewrite changed the width of an operator.
    pub fn fix_positions(&mut self) {
        let mut cursor = Position::start();
        fix_node(&mut self.root, &mut cursor);
    }

    /// Indented outline of the tree, one node per line.
    ///
    /// Atoms and opaque nodes show their tokens; operator leaves show kind,
    /// spelling and position. Other tokens are left out.
    pub fn outline(&self) -> String {
        let mut out = String::new();
        outline_node(&self.root, 0, &mut out);
        out
    }

    /// Maximum node nesting depth (the root counts as 1).
    pub fn depth(&self) -> usize {
        self.root.depth()
    }
}

fn collect_operators(node: &Node, found: &mut Vec<OperatorOccurrence>) {
    if let Some(category) = node.kind.operator_category() {
        for (chain_index, token) in node.operator_tokens().enumerate() {
            if let TokenKind::Operator(kind) = token.kind {
                found.push(OperatorOccurrence {
                    category,
                    kind,
                    position: token.pos,
                    chain_index,
                });
            }
        }
    }

    for child in &node.children {
        if let Element::Node(n) = child {
            collect_operators(n, found);
        }
    }
}

fn rewrite_node<F>(node: &mut Node, f: &mut F)
where
    F: FnMut(NodeKind, usize, &mut Token),
{
    for child in node.children.iter_mut() {
        if let Element::Node(n) = child {
            rewrite_node(n, f);
        }
    }

    if node.kind.operator_category().is_none() {
        return;
    }

    let kind = node.kind;
    let mut chain_index = 0;
    for child in node.children.iter_mut() {
        if let Element::Token(t) = child {
            if matches!(t.kind, TokenKind::Operator(_)) {
                f(kind, chain_index, t);
                chain_index += 1;
            }
        }
    }
}

fn fix_node(node: &mut Node, cursor: &mut Position) {
    for child in node.children.iter_mut() {
        match child {
            Element::Token(t) => {
                t.pos = *cursor;
                *cursor = cursor.advance(&t.text);
            }
            Element::Node(n) => fix_node(n, cursor),
        }
    }
}

fn outline_node(node: &Node, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);

    if matches!(node.kind, NodeKind::Atom | NodeKind::Opaque) {
        let text: Vec<&str> = node
            .children
            .iter()
            .filter_map(|child| match child {
                Element::Token(t) if !t.kind.is_trivia() => Some(t.text.as_str()),
                _ => None,
            })
            .collect();
        let _ = writeln!(out, "{pad}{:?} {:?}", node.kind, text.join(" "));
        return;
    }

    let _ = writeln!(out, "{pad}{:?}", node.kind);
    for child in &node.children {
        match child {
            Element::Node(n) => outline_node(n, indent + 1, out),
            Element::Token(t) => {
                if let TokenKind::Operator(kind) = t.kind {
                    let _ = writeln!(out, "{pad}  {kind} {:?} {}", t.text, t.pos);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::parse;

    #[test]
    fn operators_are_sorted_by_position() {
        let tree = parse("x = a * b + c\n").unwrap();
        let kinds: Vec<OperatorKind> = tree.operators().iter().map(|o| o.kind).collect();
        assert_eq!(kinds, vec![OperatorKind::Mult, OperatorKind::Add]);
    }

    #[test]
    fn chained_comparison_has_chain_indices() {
        let tree = parse("ok = a < b <= c\n").unwrap();
        let ops = tree.operators();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].chain_index, 0);
        assert_eq!(ops[1].chain_index, 1);
        assert_eq!(ops[1].kind, OperatorKind::LtE);
        assert_eq!(ops[1].position, Position::new(1, 11));
    }

    #[test]
    fn rewrite_visits_children_before_parents() {
        let mut tree = parse("r = (a + b) * c\n").unwrap();
        let mut seen = Vec::new();
        tree.rewrite_operators(&mut |_, _, t| seen.push(t.text.clone()));
        assert_eq!(seen, vec!["+", "*"]);
    }

    #[test]
    fn fix_positions_after_width_change() {
        let mut tree = parse("if a<b and c<d: pass\n").unwrap();
        tree.rewrite_operators(&mut |_, _, t| {
            if t.text == "<" && t.pos.column == 4 {
                t.text = " is not ".to_string();
            }
        });
        tree.fix_positions();

        let last_lt = tree
            .operators()
            .into_iter()
            .filter(|o| o.kind == OperatorKind::Lt)
            .last()
            .unwrap();
        assert_eq!(last_lt.position, Position::new(1, 19));
    }

    #[test]
    fn outline_shows_nodes_and_operator_leaves() {
        let tree = parse("import os\nif a < b <= c:\n    x = -a + 'b c'\n").unwrap();
        assert_eq!(
            tree.outline(),
            r#"Module
  Statement
    Opaque "import os"
  Statement
    Compare
      Atom "a"
      Lt "<" 2:5
      Atom "b"
      LtE "<=" 2:9
      Atom "c"
  Statement
    Atom "x"
    BinOp
      UnaryOp
        USub "-" 3:8
        Atom "a"
      Add "+" 3:11
      Atom "'b c'"
"#
        );
    }

    #[test]
    fn clone_is_independent() {
        let original = parse("y = a - b\n").unwrap();
        let mut copy = original.clone();
        copy.rewrite_operators(&mut |_, _, t| t.text = "+".to_string());
        assert_ne!(original, copy);
        assert_eq!(original.operators()[0].kind, OperatorKind::Sub);
    }
}
