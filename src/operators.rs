//! Operator catalog: mutable categories, their member kinds, spellings and
//! the fixed complement table used by deterministic mutation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Category of a mutable operator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperatorCategory {
    /// Prefix operators (`+x`, `-x`, `~x`, `not x`).
    Unary,

    /// Arithmetic and bitwise infix operators (`a + b`, `a << b`).
    Binary,

    /// Boolean connectives (`a and b`, `a or b`).
    Boolean,

    /// Comparison operators, possibly chained (`a < b <= c`).
    Comparison,
}

impl OperatorCategory {
    pub const ALL: [OperatorCategory; 4] = [
        OperatorCategory::Unary,
        OperatorCategory::Binary,
        OperatorCategory::Boolean,
        OperatorCategory::Comparison,
    ];

    /// Every operator kind that belongs to this category, in catalog order.
    pub fn kinds(self) -> &'static [OperatorKind] {
        use OperatorKind::*;

        match self {
            OperatorCategory::Unary => &[UAdd, USub, Invert, Not],
            OperatorCategory::Binary => &[
                Add, Sub, Mult, Div, FloorDiv, Mod, Pow, LShift, RShift, BitOr, BitXor, BitAnd,
                MatMult,
            ],
            OperatorCategory::Boolean => &[And, Or],
            OperatorCategory::Comparison => &[Eq, NotEq, Lt, LtE, Gt, GtE, Is, IsNot, In, NotIn],
        }
    }

    /// Lowercase label used in config files and CLI flags.
    pub fn label(self) -> &'static str {
        match self {
            OperatorCategory::Unary => "unary",
            OperatorCategory::Binary => "binary",
            OperatorCategory::Boolean => "boolean",
            OperatorCategory::Comparison => "comparison",
        }
    }
}

impl fmt::Display for OperatorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Concrete Python operator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperatorKind {
    UAdd,
    USub,
    Invert,
    Not,
    Add,
    Sub,
    Mult,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitOr,
    BitXor,
    BitAnd,
    MatMult,
    And,
    Or,
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}

/// Fixed pairwise complements. Lookups are symmetric.
static COMPLEMENTS: &[(OperatorCategory, OperatorKind, OperatorKind)] = {
    use OperatorCategory::*;
    use OperatorKind::*;

    &[
        (Binary, Add, Sub),
        (Binary, Mult, Div),
        (Binary, LShift, RShift),
        (Unary, UAdd, USub),
        (Boolean, And, Or),
        (Comparison, Eq, NotEq),
        (Comparison, Lt, Gt),
        (Comparison, LtE, GtE),
        (Comparison, Is, IsNot),
        (Comparison, In, NotIn),
    ]
};

/// Look up the fixed complement of `kind` within `category`.
pub fn complement(category: OperatorCategory, kind: OperatorKind) -> Option<OperatorKind> {
    COMPLEMENTS.iter().find_map(|&(cat, a, b)| {
        if cat != category {
            None
        } else if a == kind {
            Some(b)
        } else if b == kind {
            Some(a)
        } else {
            None
        }
    })
}

impl OperatorKind {
    pub fn category(self) -> OperatorCategory {
        use OperatorKind::*;

        match self {
            UAdd | USub | Invert | Not => OperatorCategory::Unary,
            Add | Sub | Mult | Div | FloorDiv | Mod | Pow | LShift | RShift | BitOr | BitXor
            | BitAnd | MatMult => OperatorCategory::Binary,
            And | Or => OperatorCategory::Boolean,
            Eq | NotEq | Lt | LtE | Gt | GtE | Is | IsNot | In | NotIn => {
                OperatorCategory::Comparison
            }
        }
    }

    /// Python source spelling.
    pub fn spelling(self) -> &'static str {
        use OperatorKind::*;

        match self {
            UAdd | Add => "+",
            USub | Sub => "-",
            Invert => "~",
            Not => "not",
            Mult => "*",
            Div => "/",
            FloorDiv => "//",
            Mod => "%",
            Pow => "**",
            LShift => "<<",
            RShift => ">>",
            BitOr => "|",
            BitXor => "^",
            BitAnd => "&",
            MatMult => "@",
            And => "and",
            Or => "or",
            Eq => "==",
            NotEq => "!=",
            Lt => "<",
            LtE => "<=",
            Gt => ">",
            GtE => ">=",
            Is => "is",
            IsNot => "is not",
            In => "in",
            NotIn => "not in",
        }
    }

    /// Keyword operators need surrounding whitespace to stay tokenizable.
    pub fn is_word(self) -> bool {
        self.spelling().starts_with(|c: char| c.is_ascii_alphabetic())
    }

    pub fn complement(self) -> Option<OperatorKind> {
        complement(self.category(), self)
    }

    /// Resolve a catalog name (`"Add"`, `"lte"`, `"NotIn"`) case-insensitively.
    pub fn from_name(name: &str) -> Option<OperatorKind> {
        OperatorCategory::ALL
            .iter()
            .flat_map(|c| c.kinds().iter().copied())
            .find(|k| format!("{k:?}").eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// User-approved operator kinds per category.
///
/// Passed explicitly to the analyzer, selector and applicator; nothing reads
/// an ambient default table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperatorSets {
    pub unary: Vec<OperatorKind>,
    pub binary: Vec<OperatorKind>,
    pub boolean: Vec<OperatorKind>,
    pub comparison: Vec<OperatorKind>,
}

impl Default for OperatorSets {
    /// Every kind that has a complement.
    fn default() -> Self {
        let complementable = |category: OperatorCategory| -> Vec<OperatorKind> {
            category
                .kinds()
                .iter()
                .copied()
                .filter(|k| k.complement().is_some())
                .collect()
        };

        Self {
            unary: complementable(OperatorCategory::Unary),
            binary: complementable(OperatorCategory::Binary),
            boolean: complementable(OperatorCategory::Boolean),
            comparison: complementable(OperatorCategory::Comparison),
        }
    }
}

impl OperatorSets {
    pub fn approved(&self, category: OperatorCategory) -> &[OperatorKind] {
        match category {
            OperatorCategory::Unary => &self.unary,
            OperatorCategory::Binary => &self.binary,
            OperatorCategory::Boolean => &self.boolean,
            OperatorCategory::Comparison => &self.comparison,
        }
    }

    pub fn allows(&self, kind: OperatorKind) -> bool {
        self.approved(kind.category()).contains(&kind)
    }

    /// Replace the approved set of one category.
    ///
    /// Every kind must belong to `category`.
    pub fn set(
        &mut self,
        category: OperatorCategory,
        kinds: Vec<OperatorKind>,
    ) -> Result<(), ConfigError> {
        if let Some(stray) = kinds.iter().find(|k| k.category() != category) {
            return Err(ConfigError::WrongCategory {
                category,
                kind: *stray,
            });
        }

        let mut kinds = kinds;
        kinds.sort();
        kinds.dedup();

        match category {
            OperatorCategory::Unary => self.unary = kinds,
            OperatorCategory::Binary => self.binary = kinds,
            OperatorCategory::Boolean => self.boolean = kinds,
            OperatorCategory::Comparison => self.comparison = kinds,
        }

        Ok(())
    }

    /// Check that every configured kind sits in the right category.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for category in OperatorCategory::ALL {
            if let Some(stray) = self
                .approved(category)
                .iter()
                .find(|k| k.category() != category)
            {
                return Err(ConfigError::WrongCategory {
                    category,
                    kind: *stray,
                });
            }
        }
        Ok(())
    }
}

/// Parse operator names given on the command line for one category.
pub fn parse_kinds(
    category: OperatorCategory,
    names: &[String],
) -> Result<Vec<OperatorKind>, ConfigError> {
    names
        .iter()
        .map(|name| {
            let kind = OperatorKind::from_name(name).ok_or_else(|| ConfigError::UnknownOperator {
                category,
                name: name.clone(),
            })?;
            if kind.category() != category {
                return Err(ConfigError::WrongCategory { category, kind });
            }
            Ok(kind)
        })
        .collect()
}
