use thiserror::Error;

use crate::span::Position;

use super::lexer::TokenKind;
use super::tree::{Element, Node, SyntaxTree};

/// Deepest node nesting the serializer will walk.
pub const MAX_DEPTH: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializeError {
    #[error("syntax tree is nested deeper than {limit} levels")]
    TooDeep { limit: usize },

    #[error("operator at {0} has no text")]
    EmptyOperator(Position),
}

/// Render a tree back to source text.
///
/// For a tree that was never rewritten this is exactly the parsed input.
pub fn serialize(tree: &SyntaxTree) -> Result<String, SerializeError> {
    if tree.depth() > MAX_DEPTH {
        return Err(SerializeError::TooDeep { limit: MAX_DEPTH });
    }

    let mut out = String::new();
    write_node(tree.root(), &mut out)?;
    Ok(out)
}

fn write_node(node: &Node, out: &mut String) -> Result<(), SerializeError> {
    for child in &node.children {
        match child {
            Element::Token(t) => {
                if matches!(t.kind, TokenKind::Operator(_)) && t.text.trim().is_empty() {
                    return Err(SerializeError::EmptyOperator(t.pos));
                }
                out.push_str(&t.text);
            }
            Element::Node(n) => write_node(n, out)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::parse;

    #[test]
    fn unmodified_tree_is_byte_identical() {
        let src = "def f(a,b):\n\treturn (a  +\n  b)  # sum\r\n\n\n";
        let tree = parse(src).unwrap();
        assert_eq!(serialize(&tree).unwrap(), src);
    }

    #[test]
    fn long_left_leaning_chain_is_too_deep() {
        let terms = vec!["a"; MAX_DEPTH + 100].join("+");
        let tree = parse(&format!("x = {terms}\n")).unwrap();
        assert!(tree.depth() > MAX_DEPTH);
        assert_eq!(
            serialize(&tree),
            Err(SerializeError::TooDeep { limit: MAX_DEPTH })
        );
    }

    #[test]
    fn blank_operator_is_rejected() {
        let mut tree = parse("y = a - b\n").unwrap();
        tree.rewrite_operators(&mut |_, _, t| t.text.clear());
        assert_eq!(
            serialize(&tree),
            Err(SerializeError::EmptyOperator(Position::new(1, 6)))
        );
    }
}
