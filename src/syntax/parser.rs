use crate::operators::OperatorKind;
use crate::span::Position;

use super::ParseError;
use super::lexer::{AUGMENTED_ASSIGNMENTS, Token, TokenKind, is_keyword, tokenize};
use super::tree::{Element, Node, NodeKind, SyntaxTree};

/// Recursion limit for nested expressions.
const MAX_NESTING: usize = 100;

/// Deepest syntax tree the parser builds. Long flat chains such as
/// `a + a + ... + a` nest one node per operator.
pub const MAX_TREE_DEPTH: usize = 1500;

/// Keywords that open a compound statement header ending in `:`.
const COMPOUND_KEYWORDS: &[&str] = &[
    "def", "class", "if", "elif", "while", "for", "with", "try", "except", "finally", "else",
    "async",
];

/// Infix operator levels from loosest to tightest binding.
const BINARY_LEVELS: &[&[(&str, OperatorKind)]] = &[
    &[("|", OperatorKind::BitOr)],
    &[("^", OperatorKind::BitXor)],
    &[("&", OperatorKind::BitAnd)],
    &[("<<", OperatorKind::LShift), (">>", OperatorKind::RShift)],
    &[("+", OperatorKind::Add), ("-", OperatorKind::Sub)],
    &[
        ("*", OperatorKind::Mult),
        ("/", OperatorKind::Div),
        ("//", OperatorKind::FloorDiv),
        ("%", OperatorKind::Mod),
        ("@", OperatorKind::MatMult),
    ],
];

type PResult<T> = Result<T, ParseError>;

/// Parse a Python module into a lossless syntax tree.
pub fn parse(source: &str) -> PResult<SyntaxTree> {
    let tokens = tokenize(source)?;
    Parser::new(tokens).parse_module()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    end: Position,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        let end = tokens
            .last()
            .map(|t| t.pos.advance(&t.text))
            .unwrap_or_else(Position::start);

        Self {
            tokens,
            pos: 0,
            depth: 0,
            end,
        }
    }

    // ---- token cursor ----

    fn significant_index(&self, n: usize) -> Option<usize> {
        (self.pos..self.tokens.len())
            .filter(|&i| !self.tokens[i].kind.is_trivia())
            .nth(n)
    }

    fn peek_nth(&self, n: usize) -> Option<&Token> {
        self.significant_index(n).map(|i| &self.tokens[i])
    }

    fn peek(&self) -> Option<&Token> {
        self.peek_nth(0)
    }

    fn at_punct(&self, p: &str) -> bool {
        self.peek().is_some_and(|t| t.is_punct(p))
    }

    fn at_keyword(&self, kw: &str) -> bool {
        self.peek().is_some_and(|t| t.is_keyword(kw))
    }

    fn at_end_of_line(&self) -> bool {
        self.peek().is_none_or(|t| t.kind == TokenKind::Newline)
    }

    fn at_simple_end(&self) -> bool {
        self.at_end_of_line() || self.at_punct(";")
    }

    fn at_augmented_assignment(&self) -> bool {
        self.peek()
            .is_some_and(|t| t.kind == TokenKind::Punct && AUGMENTED_ASSIGNMENTS.contains(&t.text.as_str()))
    }

    fn at_comprehension(&self) -> bool {
        self.at_keyword("for")
            || (self.at_keyword("async") && self.peek_nth(1).is_some_and(|t| t.is_keyword("for")))
    }

    fn at_name(&self) -> bool {
        self.peek()
            .is_some_and(|t| t.kind == TokenKind::Name && !is_keyword(&t.text))
    }

    /// Can the next token begin an expression?
    fn starts_expression(&self) -> bool {
        let Some(t) = self.peek() else {
            return false;
        };

        match t.kind {
            TokenKind::Name => {
                !is_keyword(&t.text)
                    || matches!(
                        t.text.as_str(),
                        "None" | "True" | "False" | "lambda" | "not" | "await"
                    )
            }
            TokenKind::Number | TokenKind::Str => true,
            TokenKind::Punct => matches!(
                t.text.as_str(),
                "(" | "[" | "{" | "-" | "+" | "~" | "*" | "..."
            ),
            _ => false,
        }
    }

    fn error(&self, message: &str) -> ParseError {
        match self.peek() {
            Some(t) if t.kind == TokenKind::Newline => {
                ParseError::new(t.pos, format!("{message}, found end of line"))
            }
            Some(t) => ParseError::new(t.pos, format!("{message}, found '{}'", t.text)),
            None => ParseError::new(self.end, format!("{message}, found end of file")),
        }
    }

    /// Move the next significant token (and the trivia before it) into `out`.
    fn bump(&mut self, out: &mut Vec<Element>) -> PResult<()> {
        let Some(idx) = self.significant_index(0) else {
            return Err(self.error("unexpected end of input"));
        };

        out.extend(
            self.tokens[self.pos..=idx]
                .iter()
                .cloned()
                .map(Element::Token),
        );
        self.pos = idx + 1;
        Ok(())
    }

    /// Move an operator into `out`, merging `width` significant tokens
    /// (`not in`, `is not`) into one operator leaf.
    fn bump_operator(&mut self, out: &mut Vec<Element>, kind: OperatorKind, width: usize) -> PResult<()> {
        let (Some(first), Some(last)) = (self.significant_index(0), self.significant_index(width - 1))
        else {
            return Err(self.error("unexpected end of input"));
        };

        out.extend(
            self.tokens[self.pos..first]
                .iter()
                .cloned()
                .map(Element::Token),
        );

        let text: String = self.tokens[first..=last]
            .iter()
            .map(|t| t.text.as_str())
            .collect();

        out.push(Element::Token(Token {
            kind: TokenKind::Operator(kind),
            text,
            pos: self.tokens[first].pos,
        }));

        self.pos = last + 1;
        Ok(())
    }

    fn expect_punct(&mut self, p: &str, out: &mut Vec<Element>) -> PResult<()> {
        if self.at_punct(p) {
            self.bump(out)
        } else {
            Err(self.error(&format!("expected '{p}'")))
        }
    }

    fn expect_keyword(&mut self, kw: &str, out: &mut Vec<Element>) -> PResult<()> {
        if self.at_keyword(kw) {
            self.bump(out)
        } else {
            Err(self.error(&format!("expected '{kw}'")))
        }
    }

    fn expect_name(&mut self, out: &mut Vec<Element>) -> PResult<()> {
        if self.at_name() {
            self.bump(out)
        } else {
            Err(self.error("expected a name"))
        }
    }

    fn node(&self, kind: NodeKind, children: Vec<Element>) -> PResult<Element> {
        let node = Node::new(kind, children);
        if node.depth() > MAX_TREE_DEPTH {
            return Err(self.error("expression is nested too deeply"));
        }
        Ok(Element::Node(node))
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("expression is nested too deeply"));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    // ---- statements ----

    fn parse_module(mut self) -> PResult<SyntaxTree> {
        let mut children = Vec::new();

        while self.peek().is_some() {
            let stmt = self.parse_statement()?;
            children.push(Element::Node(stmt));
        }

        // Trailing trivia (final comments, blank lines).
        children.extend(self.tokens.drain(self.pos..).map(Element::Token));

        Ok(SyntaxTree::new(Node::new(NodeKind::Module, children)))
    }

    /// One logical line.
    fn parse_statement(&mut self) -> PResult<Node> {
        let mut out = Vec::new();

        if self.at_end_of_line() {
            self.bump(&mut out)?;
        } else if self.at_punct("@") {
            self.bump(&mut out)?;
            out.push(self.parse_named()?);
            self.end_line(&mut out)?;
        } else if self.at_soft_keyword_header() {
            self.parse_opaque_header(&mut out)?;
            self.parse_body(&mut out)?;
        } else if self
            .peek()
            .is_some_and(|t| t.kind == TokenKind::Name && COMPOUND_KEYWORDS.contains(&t.text.as_str()))
        {
            self.parse_compound_header(&mut out)?;
            self.parse_body(&mut out)?;
        } else {
            self.parse_simple_statements(&mut out)?;
        }

        Ok(Node::new(NodeKind::Statement, out))
    }

    fn end_line(&mut self, out: &mut Vec<Element>) -> PResult<()> {
        match self.peek() {
            None => Ok(()),
            Some(t) if t.kind == TokenKind::Newline => self.bump(out),
            Some(_) => Err(self.error("expected end of line")),
        }
    }

    /// Whatever follows a header's `:`: either the end of the line (an
    /// indented block follows) or simple statements on the same line.
    fn parse_body(&mut self, out: &mut Vec<Element>) -> PResult<()> {
        if self.at_end_of_line() {
            self.end_line(out)
        } else {
            self.parse_simple_statements(out)
        }
    }

    fn parse_simple_statements(&mut self, out: &mut Vec<Element>) -> PResult<()> {
        loop {
            self.parse_simple(out)?;
            if !self.at_punct(";") {
                break;
            }
            self.bump(out)?;
            if self.at_end_of_line() {
                break;
            }
        }
        self.end_line(out)
    }

    fn parse_compound_header(&mut self, out: &mut Vec<Element>) -> PResult<()> {
        let keyword = self.peek().map(|t| t.text.clone()).unwrap_or_default();
        self.bump(out)?;

        match keyword.as_str() {
            "async" => {
                if ["def", "for", "with"].iter().any(|kw| self.at_keyword(kw)) {
                    return self.parse_compound_header(out);
                }
                return Err(self.error("expected 'def', 'for' or 'with' after 'async'"));
            }
            "def" => {
                self.expect_name(out)?;
                if self.at_punct("[") {
                    self.parse_type_params(out)?;
                }
                self.expect_punct("(", out)?;
                out.push(self.parse_parameters(")", true)?);
                self.expect_punct(")", out)?;
                if self.at_punct("->") {
                    self.bump(out)?;
                    out.push(self.parse_expr()?);
                }
            }
            "class" => {
                self.expect_name(out)?;
                if self.at_punct("[") {
                    self.parse_type_params(out)?;
                }
                if self.at_punct("(") {
                    out.push(self.parse_call_arguments()?);
                }
            }
            "if" | "elif" | "while" => out.push(self.parse_named()?),
            "except" => {
                if self.at_punct("*") {
                    self.bump(out)?;
                }
                if !self.at_punct(":") {
                    out.push(self.parse_expr()?);
                    if self.at_keyword("as") {
                        self.bump(out)?;
                        self.expect_name(out)?;
                    }
                }
            }
            "for" => {
                self.parse_target_list(out)?;
                self.expect_keyword("in", out)?;
                self.parse_expr_list(out, Self::parse_star_or_expr)?;
            }
            "with" => loop {
                out.push(self.parse_expr()?);
                if self.at_keyword("as") {
                    self.bump(out)?;
                    out.push(self.parse_star_target()?);
                }
                if !self.at_punct(",") {
                    break;
                }
                self.bump(out)?;
            },
            // else, try, finally
            _ => {}
        }

        self.expect_punct(":", out)
    }

    /// `match` / `case` used as soft keywords: the line is a header whose
    /// first top-level `:` ends it.
    fn at_soft_keyword_header(&self) -> bool {
        let Some(first) = self.peek() else {
            return false;
        };
        if !(first.is_keyword("match") || first.is_keyword("case")) {
            return false;
        }

        let Some(second) = self.peek_nth(1) else {
            return false;
        };
        if second.kind == TokenKind::Newline
            || (second.kind == TokenKind::Punct
                && (matches!(
                    second.text.as_str(),
                    "=" | "." | ":" | "," | ")" | "]" | "}" | ";"
                ) || AUGMENTED_ASSIGNMENTS.contains(&second.text.as_str())))
        {
            return false;
        }

        let mut depth = 0i32;
        for t in self.tokens[self.pos..].iter().filter(|t| !t.kind.is_trivia()) {
            match (t.kind, t.text.as_str()) {
                (TokenKind::Newline, _) => return false,
                (TokenKind::Punct, "(" | "[" | "{") => depth += 1,
                (TokenKind::Punct, ")" | "]" | "}") => depth -= 1,
                (TokenKind::Punct, ":") if depth == 0 => return true,
                _ => {}
            }
        }
        false
    }

    fn parse_opaque_header(&mut self, out: &mut Vec<Element>) -> PResult<()> {
        let mut inner = Vec::new();
        let mut depth = 0i32;

        loop {
            let Some(t) = self.peek() else {
                return Err(self.error("expected ':'"));
            };
            let closes = t.is_punct(":") && depth == 0;
            if t.kind == TokenKind::Punct {
                match t.text.as_str() {
                    "(" | "[" | "{" => depth += 1,
                    ")" | "]" | "}" => depth -= 1,
                    _ => {}
                }
            }
            self.bump(&mut inner)?;
            if closes {
                break;
            }
        }

        out.push(self.node(NodeKind::Opaque, inner)?);
        Ok(())
    }

    /// `[T, *Ts, **P]` after a `def` or `class` name, kept verbatim.
    fn parse_type_params(&mut self, out: &mut Vec<Element>) -> PResult<()> {
        let mut inner = Vec::new();
        let mut depth = 0i32;

        loop {
            let Some(t) = self.peek() else {
                return Err(self.error("expected ']'"));
            };
            if t.kind == TokenKind::Punct {
                match t.text.as_str() {
                    "(" | "[" | "{" => depth += 1,
                    ")" | "]" | "}" => depth -= 1,
                    _ => {}
                }
            }
            self.bump(&mut inner)?;
            if depth == 0 {
                break;
            }
        }

        out.push(self.node(NodeKind::Opaque, inner)?);
        Ok(())
    }

    fn parse_opaque_statement(&mut self, out: &mut Vec<Element>) -> PResult<()> {
        let mut inner = Vec::new();
        while !self.at_simple_end() {
            self.bump(&mut inner)?;
        }
        out.push(self.node(NodeKind::Opaque, inner)?);
        Ok(())
    }

    fn at_type_alias(&self) -> bool {
        self.at_keyword("type")
            && self
                .peek_nth(1)
                .is_some_and(|t| t.kind == TokenKind::Name && !is_keyword(&t.text))
            && self
                .peek_nth(2)
                .is_some_and(|t| t.is_punct("=") || t.is_punct("["))
    }

    fn parse_simple(&mut self, out: &mut Vec<Element>) -> PResult<()> {
        let Some(first) = self.peek() else {
            return Err(self.error("expected a statement"));
        };
        let keyword = if first.kind == TokenKind::Name {
            first.text.clone()
        } else {
            String::new()
        };

        match keyword.as_str() {
            "pass" | "break" | "continue" => return self.bump(out),
            "return" => {
                self.bump(out)?;
                if !self.at_simple_end() {
                    self.parse_expr_list(out, Self::parse_star_or_expr)?;
                }
                return Ok(());
            }
            "raise" => {
                self.bump(out)?;
                if !self.at_simple_end() {
                    out.push(self.parse_expr()?);
                    if self.at_keyword("from") {
                        self.bump(out)?;
                        out.push(self.parse_expr()?);
                    }
                }
                return Ok(());
            }
            "global" | "nonlocal" | "import" | "from" => return self.parse_opaque_statement(out),
            "del" => {
                self.bump(out)?;
                return self.parse_expr_list(out, Self::parse_star_or_expr);
            }
            "assert" => {
                self.bump(out)?;
                out.push(self.parse_expr()?);
                if self.at_punct(",") {
                    self.bump(out)?;
                    out.push(self.parse_expr()?);
                }
                return Ok(());
            }
            "type" if self.at_type_alias() => return self.parse_opaque_statement(out),
            _ => {}
        }

        self.parse_exprs_or_yield(out)?;

        if self.at_punct("=") {
            while self.at_punct("=") {
                self.bump(out)?;
                self.parse_exprs_or_yield(out)?;
            }
        } else if self.at_augmented_assignment() {
            self.bump(out)?;
            self.parse_exprs_or_yield(out)?;
        } else if self.at_punct(":") {
            self.bump(out)?;
            out.push(self.parse_expr()?);
            if self.at_punct("=") {
                self.bump(out)?;
                self.parse_exprs_or_yield(out)?;
            }
        }

        Ok(())
    }

    fn parse_exprs_or_yield(&mut self, out: &mut Vec<Element>) -> PResult<()> {
        if self.at_keyword("yield") {
            out.push(self.parse_yield()?);
            Ok(())
        } else {
            self.parse_expr_list(out, Self::parse_star_or_named)
        }
    }

    /// Comma-separated items, trailing comma allowed.
    fn parse_expr_list(
        &mut self,
        out: &mut Vec<Element>,
        item: fn(&mut Self) -> PResult<Element>,
    ) -> PResult<()> {
        loop {
            out.push(item(self)?);
            if !self.at_punct(",") {
                return Ok(());
            }
            self.bump(out)?;
            if !self.starts_expression() {
                return Ok(());
            }
        }
    }

    /// Assignment targets of `for` loops and comprehensions. Parsed below
    /// the comparison level so the following `in` is not consumed.
    fn parse_target_list(&mut self, out: &mut Vec<Element>) -> PResult<()> {
        loop {
            out.push(self.parse_star_target()?);
            if !self.at_punct(",") {
                return Ok(());
            }
            self.bump(out)?;
            if self.at_keyword("in") || !self.starts_expression() {
                return Ok(());
            }
        }
    }

    fn parse_star_target(&mut self) -> PResult<Element> {
        if self.at_punct("*") {
            let mut out = Vec::new();
            self.bump(&mut out)?;
            out.push(self.parse_bitor()?);
            self.node(NodeKind::Starred, out)
        } else {
            self.parse_bitor()
        }
    }

    /// Parameters of `def` (annotated) or `lambda` up to `close`.
    fn parse_parameters(&mut self, close: &str, annotated: bool) -> PResult<Element> {
        let mut out = Vec::new();

        while !self.at_punct(close) {
            if self.at_punct("/") {
                self.bump(&mut out)?;
            } else if self.at_punct("*") || self.at_punct("**") {
                self.bump(&mut out)?;
                if self.at_name() {
                    self.parse_parameter(&mut out, annotated)?;
                }
            } else {
                self.parse_parameter(&mut out, annotated)?;
            }

            if !self.at_punct(",") {
                break;
            }
            self.bump(&mut out)?;
        }

        self.node(NodeKind::Parameters, out)
    }

    fn parse_parameter(&mut self, out: &mut Vec<Element>, annotated: bool) -> PResult<()> {
        self.expect_name(out)?;
        if annotated && self.at_punct(":") {
            self.bump(out)?;
            out.push(self.parse_star_or_expr()?);
        }
        if self.at_punct("=") {
            self.bump(out)?;
            out.push(self.parse_expr()?);
        }
        Ok(())
    }

    // ---- expressions ----

    fn parse_yield(&mut self) -> PResult<Element> {
        let mut out = Vec::new();
        self.expect_keyword("yield", &mut out)?;

        if self.at_keyword("from") {
            self.bump(&mut out)?;
            out.push(self.parse_expr()?);
        } else if self.starts_expression() {
            self.parse_expr_list(&mut out, Self::parse_star_or_expr)?;
        }

        self.node(NodeKind::Yield, out)
    }

    fn parse_starred(&mut self) -> PResult<Element> {
        let mut out = Vec::new();
        self.bump(&mut out)?;
        out.push(self.parse_bitor()?);
        self.node(NodeKind::Starred, out)
    }

    fn parse_star_or_expr(&mut self) -> PResult<Element> {
        if self.at_punct("*") {
            self.parse_starred()
        } else {
            self.parse_expr()
        }
    }

    fn parse_star_or_named(&mut self) -> PResult<Element> {
        if self.at_punct("*") {
            self.parse_starred()
        } else {
            self.parse_named()
        }
    }

    fn parse_named(&mut self) -> PResult<Element> {
        let target = self.parse_expr()?;
        if !self.at_punct(":=") {
            return Ok(target);
        }

        let mut out = vec![target];
        self.bump(&mut out)?;
        out.push(self.parse_expr()?);
        self.node(NodeKind::NamedExpr, out)
    }

    /// Conditional expression or lambda.
    fn parse_expr(&mut self) -> PResult<Element> {
        self.nested(|p| {
            if p.at_keyword("lambda") {
                return p.parse_lambda();
            }

            let body = p.parse_disjunction()?;
            if !p.at_keyword("if") {
                return Ok(body);
            }

            let mut out = vec![body];
            p.bump(&mut out)?;
            out.push(p.parse_disjunction()?);
            p.expect_keyword("else", &mut out)?;
            out.push(p.parse_expr()?);
            p.node(NodeKind::IfExp, out)
        })
    }

    fn parse_lambda(&mut self) -> PResult<Element> {
        let mut out = Vec::new();
        self.bump(&mut out)?;
        if !self.at_punct(":") {
            out.push(self.parse_parameters(":", false)?);
        }
        self.expect_punct(":", &mut out)?;
        out.push(self.parse_expr()?);
        self.node(NodeKind::Lambda, out)
    }

    fn parse_disjunction(&mut self) -> PResult<Element> {
        self.parse_boolean("or", OperatorKind::Or, Self::parse_conjunction)
    }

    fn parse_conjunction(&mut self) -> PResult<Element> {
        self.parse_boolean("and", OperatorKind::And, Self::parse_inversion)
    }

    /// `a and b and c` is one node owning two operators.
    fn parse_boolean(
        &mut self,
        keyword: &str,
        kind: OperatorKind,
        operand: fn(&mut Self) -> PResult<Element>,
    ) -> PResult<Element> {
        let first = operand(self)?;
        if !self.at_keyword(keyword) {
            return Ok(first);
        }

        let mut out = vec![first];
        while self.at_keyword(keyword) {
            self.bump_operator(&mut out, kind, 1)?;
            out.push(operand(self)?);
        }
        self.node(NodeKind::BoolOp, out)
    }

    fn parse_inversion(&mut self) -> PResult<Element> {
        if !self.at_keyword("not") {
            return self.parse_comparison();
        }

        self.nested(|p| {
            let mut out = Vec::new();
            p.bump_operator(&mut out, OperatorKind::Not, 1)?;
            out.push(p.parse_inversion()?);
            p.node(NodeKind::UnaryOp, out)
        })
    }

    /// Comparison operator at the cursor and how many tokens spell it.
    fn comparison_operator(&self) -> Option<(OperatorKind, usize)> {
        let t = self.peek()?;
        let next_is = |kw: &str| self.peek_nth(1).is_some_and(|n| n.is_keyword(kw));

        match t.kind {
            TokenKind::Punct => {
                let kind = match t.text.as_str() {
                    "==" => OperatorKind::Eq,
                    "!=" => OperatorKind::NotEq,
                    "<" => OperatorKind::Lt,
                    "<=" => OperatorKind::LtE,
                    ">" => OperatorKind::Gt,
                    ">=" => OperatorKind::GtE,
                    _ => return None,
                };
                Some((kind, 1))
            }
            TokenKind::Name => match t.text.as_str() {
                "in" => Some((OperatorKind::In, 1)),
                "not" if next_is("in") => Some((OperatorKind::NotIn, 2)),
                "is" if next_is("not") => Some((OperatorKind::IsNot, 2)),
                "is" => Some((OperatorKind::Is, 1)),
                _ => None,
            },
            _ => None,
        }
    }

    /// `a < b < c` is one node owning two operators.
    fn parse_comparison(&mut self) -> PResult<Element> {
        let first = self.parse_bitor()?;
        if self.comparison_operator().is_none() {
            return Ok(first);
        }

        let mut out = vec![first];
        while let Some((kind, width)) = self.comparison_operator() {
            self.bump_operator(&mut out, kind, width)?;
            out.push(self.parse_bitor()?);
        }
        self.node(NodeKind::Compare, out)
    }

    fn parse_bitor(&mut self) -> PResult<Element> {
        self.parse_binary(0)
    }

    fn binary_operator(&self, ops: &[(&str, OperatorKind)]) -> Option<OperatorKind> {
        let t = self.peek()?;
        if t.kind != TokenKind::Punct {
            return None;
        }
        ops.iter()
            .find(|(spelling, _)| *spelling == t.text)
            .map(|(_, kind)| *kind)
    }

    /// Left-associative infix levels.
    fn parse_binary(&mut self, level: usize) -> PResult<Element> {
        let Some(ops) = BINARY_LEVELS.get(level) else {
            return self.parse_factor();
        };

        let mut left = self.parse_binary(level + 1)?;
        while let Some(kind) = self.binary_operator(ops) {
            let mut out = vec![left];
            self.bump_operator(&mut out, kind, 1)?;
            out.push(self.parse_binary(level + 1)?);
            left = self.node(NodeKind::BinOp, out)?;
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> PResult<Element> {
        let kind = match self.peek() {
            Some(t) if t.kind == TokenKind::Punct => match t.text.as_str() {
                "+" => Some(OperatorKind::UAdd),
                "-" => Some(OperatorKind::USub),
                "~" => Some(OperatorKind::Invert),
                _ => None,
            },
            _ => None,
        };

        let Some(kind) = kind else {
            return self.parse_power();
        };

        self.nested(|p| {
            let mut out = Vec::new();
            p.bump_operator(&mut out, kind, 1)?;
            out.push(p.parse_factor()?);
            p.node(NodeKind::UnaryOp, out)
        })
    }

    /// `**` binds tighter than unary minus on its left and is right-associative.
    fn parse_power(&mut self) -> PResult<Element> {
        let base = if self.at_keyword("await") {
            let mut out = Vec::new();
            self.bump(&mut out)?;
            out.push(self.parse_primary()?);
            self.node(NodeKind::Await, out)?
        } else {
            self.parse_primary()?
        };

        if !self.at_punct("**") {
            return Ok(base);
        }

        let mut out = vec![base];
        self.bump_operator(&mut out, OperatorKind::Pow, 1)?;
        out.push(self.nested(Self::parse_factor)?);
        self.node(NodeKind::BinOp, out)
    }

    fn parse_primary(&mut self) -> PResult<Element> {
        let mut expr = self.parse_atom()?;

        loop {
            if self.at_punct(".") {
                let mut out = vec![expr];
                self.bump(&mut out)?;
                if !self.peek().is_some_and(|t| t.kind == TokenKind::Name) {
                    return Err(self.error("expected an attribute name"));
                }
                self.bump(&mut out)?;
                expr = self.node(NodeKind::Attribute, out)?;
            } else if self.at_punct("(") {
                let args = self.parse_call_arguments()?;
                expr = self.node(NodeKind::Call, vec![expr, args])?;
            } else if self.at_punct("[") {
                let slice = self.parse_subscript()?;
                expr = self.node(NodeKind::Subscript, vec![expr, slice])?;
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_atom(&mut self) -> PResult<Element> {
        let Some(t) = self.peek() else {
            return Err(self.error("expected an expression"));
        };
        let kind = t.kind;
        let text = t.text.clone();
        let mut out = Vec::new();

        match kind {
            TokenKind::Name
                if !is_keyword(&text) || matches!(text.as_str(), "None" | "True" | "False") =>
            {
                self.bump(&mut out)?;
                self.node(NodeKind::Atom, out)
            }
            TokenKind::Number => {
                self.bump(&mut out)?;
                self.node(NodeKind::Atom, out)
            }
            // Implicit concatenation: `"a" "b"` is one atom.
            TokenKind::Str => {
                while self.peek().is_some_and(|t| t.kind == TokenKind::Str) {
                    self.bump(&mut out)?;
                }
                self.node(NodeKind::Atom, out)
            }
            TokenKind::Punct => match text.as_str() {
                "(" => self.parse_display(")"),
                "[" => self.parse_display("]"),
                "{" => self.parse_display("}"),
                "..." => {
                    self.bump(&mut out)?;
                    self.node(NodeKind::Atom, out)
                }
                _ => Err(self.error("expected an expression")),
            },
            _ => Err(self.error("expected an expression")),
        }
    }

    /// Parenthesized expression, tuple, list, set or dict, including
    /// comprehensions.
    fn parse_display(&mut self, close: &str) -> PResult<Element> {
        let mut out = Vec::new();
        self.bump(&mut out)?;

        if self.at_punct(close) {
            self.bump(&mut out)?;
            return self.node(NodeKind::Group, out);
        }

        if close == ")" && self.at_keyword("yield") {
            out.push(self.parse_yield()?);
            self.expect_punct(")", &mut out)?;
            return self.node(NodeKind::Group, out);
        }

        self.parse_display_item(&mut out, close)?;

        if self.at_comprehension() {
            out.push(self.parse_comprehension()?);
        } else {
            while self.at_punct(",") {
                self.bump(&mut out)?;
                if self.at_punct(close) {
                    break;
                }
                self.parse_display_item(&mut out, close)?;
            }
        }

        self.expect_punct(close, &mut out)?;
        self.node(NodeKind::Group, out)
    }

    fn parse_display_item(&mut self, out: &mut Vec<Element>, close: &str) -> PResult<()> {
        if close == "}" && self.at_punct("**") {
            out.push(self.parse_starred()?);
            return Ok(());
        }

        out.push(self.parse_star_or_named()?);

        if close == "}" && self.at_punct(":") {
            self.bump(out)?;
            out.push(self.parse_expr()?);
        }
        // Parenthesized context managers: `with (open(a) as f, ...):`
        if close == ")" && self.at_keyword("as") {
            self.bump(out)?;
            out.push(self.parse_star_target()?);
        }
        Ok(())
    }

    fn parse_comprehension(&mut self) -> PResult<Element> {
        let mut out = Vec::new();

        while self.at_comprehension() {
            if self.at_keyword("async") {
                self.bump(&mut out)?;
            }
            self.expect_keyword("for", &mut out)?;
            self.parse_target_list(&mut out)?;
            self.expect_keyword("in", &mut out)?;
            out.push(self.parse_disjunction()?);

            while self.at_keyword("if") {
                self.bump(&mut out)?;
                out.push(self.parse_disjunction()?);
            }
        }

        self.node(NodeKind::Comprehension, out)
    }

    fn parse_call_arguments(&mut self) -> PResult<Element> {
        let mut out = Vec::new();
        self.expect_punct("(", &mut out)?;

        while !self.at_punct(")") {
            self.parse_argument(&mut out)?;
            if self.at_comprehension() {
                out.push(self.parse_comprehension()?);
            }
            if !self.at_punct(",") {
                break;
            }
            self.bump(&mut out)?;
        }

        self.expect_punct(")", &mut out)?;
        self.node(NodeKind::Arguments, out)
    }

    fn parse_argument(&mut self, out: &mut Vec<Element>) -> PResult<()> {
        if self.at_punct("*") || self.at_punct("**") {
            let mut inner = Vec::new();
            self.bump(&mut inner)?;
            inner.push(self.parse_expr()?);
            out.push(self.node(NodeKind::Starred, inner)?);
            return Ok(());
        }

        if self.at_name() && self.peek_nth(1).is_some_and(|t| t.is_punct("=")) {
            let mut inner = Vec::new();
            self.bump(&mut inner)?;
            self.bump(&mut inner)?;
            inner.push(self.parse_expr()?);
            out.push(self.node(NodeKind::Keyword, inner)?);
            return Ok(());
        }

        out.push(self.parse_named()?);
        Ok(())
    }

    fn parse_subscript(&mut self) -> PResult<Element> {
        let mut out = Vec::new();
        self.expect_punct("[", &mut out)?;

        loop {
            self.parse_slice_item(&mut out)?;
            if !self.at_punct(",") {
                break;
            }
            self.bump(&mut out)?;
            if self.at_punct("]") {
                break;
            }
        }

        self.expect_punct("]", &mut out)?;
        self.node(NodeKind::Slice, out)
    }

    fn parse_slice_item(&mut self, out: &mut Vec<Element>) -> PResult<()> {
        if !self.at_punct(":") {
            out.push(self.parse_star_or_named()?);
        }

        for _ in 0..2 {
            if !self.at_punct(":") {
                break;
            }
            self.bump(out)?;
            if self.starts_expression() {
                out.push(self.parse_expr()?);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::serialize;

    fn roundtrip(src: &str) {
        let tree = parse(src).unwrap_or_else(|e| panic!("failed to parse {src:?}: {e}"));
        assert_eq!(serialize(&tree).unwrap(), src);
    }

    fn kinds(src: &str) -> Vec<OperatorKind> {
        parse(src)
            .unwrap()
            .operators()
            .into_iter()
            .map(|o| o.kind)
            .collect()
    }

    #[test]
    fn parses_a_realistic_module_losslessly() {
        roundtrip(
            r#"#!/usr/bin/env python3
"""Module docstring."""
from __future__ import annotations

import os, sys
from .util import (helper,
                   other)


@dataclass(frozen=True)
class Point(Base, metaclass=Meta):
    x: int = 0
    y: int = 0

    def dist(self, other: "Point", *, squared=False) -> float:
        dx = self.x - other.x
        dy = self.y - other.y
        d = dx ** 2 + dy ** 2
        return d if squared else d ** 0.5


async def fetch(urls, /, *args, **kwargs):
    async with session() as s, lock:
        async for u in urls:
            data = await s.get(u)
            yield data
    results = [x async for x in aiter()]


def main(argv=None):
    global VERBOSE
    items = {k: v for k, v in zip("ab", (1, 2)) if v >= 1 and k not in {"z"}}
    nums = [n % 3 for n in range(10) if not n & 1]
    total = sum(i * 2 for i in nums)
    total += -1; total //= 2
    sl = argv[1:], argv[::2], argv[..., 0]
    f = lambda a, b=1, *c: a << b >> c[0]
    if (n := len(items)) > 10 or total is not None:
        pass
    elif 0 < n <= 5 != 6:
        print(f"{n!r}", end="", **{"sep": " "})
    else:
        raise ValueError("bad") from None
    try:
        x = yield from gen()
    except* (KeyError, IndexError) as exc:
        del x
    finally:
        assert total @ m, "matmul"
    while True: break
    for i, *rest in pairs: continue
    with (open("a") as fa, open("b") as fb):
        ...
    match command.split():
        case [action, obj] if action in VERBS:
            return ~obj | +1 ^ 2
        case _:
            return not action
    return \
        1


if __name__ == "__main__":
    main()
"#,
        );
    }

    #[test]
    fn crlf_and_missing_final_newline_roundtrip() {
        roundtrip("a = 1\r\nb = a + 2\r\n");
        roundtrip("x = 1 + 2");
        roundtrip("");
        roundtrip("# only a comment\n\n");
    }

    #[test]
    fn binary_precedence_and_assoc() {
        assert_eq!(
            kinds("r = a - b * c ** -d\n"),
            vec![
                OperatorKind::Sub,
                OperatorKind::Mult,
                OperatorKind::Pow,
                OperatorKind::USub
            ]
        );
    }

    #[test]
    fn unary_and_binary_minus_are_distinguished() {
        assert_eq!(
            kinds("r = -a - -b\n"),
            vec![OperatorKind::USub, OperatorKind::Sub, OperatorKind::USub]
        );
    }

    #[test]
    fn composite_comparison_operators_are_single_leaves() {
        let tree = parse("ok = a not  in b is not c\n").unwrap();
        let ops = tree.operators();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].kind, OperatorKind::NotIn);
        assert_eq!(ops[1].kind, OperatorKind::IsNot);
        assert_eq!(ops[1].chain_index, 1);
    }

    #[test]
    fn for_targets_do_not_become_comparisons() {
        assert_eq!(kinds("for x in xs:\n    pass\n"), vec![]);
        assert_eq!(
            kinds("ys = [x for x in xs if x in seen]\n"),
            vec![OperatorKind::In]
        );
    }

    #[test]
    fn boolean_chain_is_one_node() {
        let tree = parse("ok = a and b and c or d\n").unwrap();
        let ops = tree.operators();
        let summary: Vec<(OperatorKind, usize)> =
            ops.iter().map(|o| (o.kind, o.chain_index)).collect();
        assert_eq!(
            summary,
            vec![
                (OperatorKind::And, 0),
                (OperatorKind::And, 1),
                (OperatorKind::Or, 0)
            ]
        );
    }

    #[test]
    fn operators_in_strings_and_comments_are_ignored() {
        assert_eq!(kinds("s = 'a + b'  # c - d\n"), vec![]);
    }

    #[test]
    fn imports_and_decorators_are_not_mutable() {
        assert_eq!(kinds("from . import a\n@x.y\ndef f(): pass\n"), vec![]);
    }

    #[test]
    fn syntax_errors_are_reported_with_position() {
        let err = parse("x = = 1\n").unwrap_err();
        assert_eq!(err.position, Position::new(1, 4));

        let err = parse("print 'hello'\n").unwrap_err();
        assert!(err.message.starts_with("expected end of line"), "{err}");

        let err = parse("def f(:\n    pass\n").unwrap_err();
        assert!(err.message.contains("expected a name"), "{err}");

        let err = parse("if x\n    pass\n").unwrap_err();
        assert!(err.message.contains("expected ':'"), "{err}");
    }

    #[test]
    fn generic_definitions_keep_type_parameters_opaque() {
        roundtrip("def f[T](x: T) -> T: return x\n");
        roundtrip("class A[T]: pass\n");
        roundtrip("class B[K: (int, str), *Ts, **P](Base[K]):\n    pass\n");
        roundtrip("async def g[T = int](a: T = 1 + 2): pass\n");

        assert_eq!(
            kinds("def f[T: int | str](x: T) -> T: return x + 1\n"),
            vec![OperatorKind::Add]
        );
    }

    #[test]
    fn fstrings_with_nested_quotes_are_single_atoms() {
        roundtrip("print(f\"{d[\"k\"]}\")\n");
        roundtrip("msg = f\"{', '.join(f'{x!r:>{w}}' for x in xs)}\" + tail\n");
        assert_eq!(
            kinds("s = f\"{a + b}\" + f'{c - d}'\n"),
            vec![OperatorKind::Add]
        );
    }

    #[test]
    fn long_flat_chains_stop_at_the_tree_depth_limit() {
        let chain = |n: usize, op: &str| format!("x = {}\n", vec!["a"; n].join(op));

        let tree = parse(&chain(MAX_TREE_DEPTH / 2, " + ")).unwrap();
        assert!(tree.depth() > MAX_TREE_DEPTH / 2);

        let err = parse(&chain(100_000, "+")).unwrap_err();
        assert!(err.message.contains("nested too deeply"), "{err}");

        let err = parse(&chain(100_000, "**")).unwrap_err();
        assert!(err.message.contains("nested too deeply"), "{err}");

        let attributes = format!("x = a{}\n", ".b".repeat(100_000));
        let err = parse(&attributes).unwrap_err();
        assert!(err.message.contains("nested too deeply"), "{err}");
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let src = format!("x = {}1\n", "-".repeat(MAX_NESTING + 10));
        let err = parse(&src).unwrap_err();
        assert!(err.message.contains("nested too deeply"), "{err}");
    }
}
