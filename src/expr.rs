//! Source expressions, as produced by the reader and consumed by the compiler.
use core::fmt;

use arbitrary::Arbitrary;

/// Self-evaluating data that can appear in source position.
#[derive(Debug, Clone, PartialEq, Eq, Arbitrary)]
pub enum Literal {
    Boolean(bool),
    Integer(i64),
    String(Box<str>),
}

/// An expression tree.
///
/// Every variant knows how to compile itself, see [`crate::compiler::Compile`].
#[derive(Debug, Clone, PartialEq, Eq, Arbitrary)]
pub enum Expr {
    Literal(Literal),
    Name(Box<str>),
    /// `(head args...)`, either a special form or a call.
    /// An empty form is the empty list when quoted.
    Form(Vec<Expr>),
}

impl Expr {
    pub fn name(name: impl AsRef<str>) -> Self {
        Self::Name(Box::from(name.as_ref()))
    }

    pub fn integer(value: i64) -> Self {
        Self::Literal(Literal::Integer(value))
    }

    pub fn boolean(value: bool) -> Self {
        Self::Literal(Literal::Boolean(value))
    }

    pub fn string(value: impl AsRef<str>) -> Self {
        Self::Literal(Literal::String(Box::from(value.as_ref())))
    }

    pub fn form(items: impl IntoIterator<Item = Expr>) -> Self {
        Self::Form(items.into_iter().collect())
    }

    /// `(quote expr)`
    pub fn quote(expr: Expr) -> Self {
        Self::Form(vec![Self::name("quote"), expr])
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Name(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_form(&self) -> Option<&[Expr]> {
        match self {
            Self::Form(items) => Some(items),
            _ => None,
        }
    }

    /// What kind of expression this is, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Literal(Literal::Boolean(_)) => "boolean",
            Self::Literal(Literal::Integer(_)) => "integer",
            Self::Literal(Literal::String(_)) => "string",
            Self::Name(_) => "name",
            Self::Form(_) => "list",
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(true) => write!(f, "#t"),
            Self::Boolean(false) => write!(f, "#f"),
            Self::Integer(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(lit) => write!(f, "{lit}"),
            Self::Name(name) => write!(f, "{name}"),
            Self::Form(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}
