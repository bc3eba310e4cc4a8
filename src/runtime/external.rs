use core::fmt;

use crate::expr::{Expr, Literal};

/// An owned copy of a value that can leave the arena.
///
/// Results of evaluation are handed to the host in this form, and the host
/// passes arguments in this form when it calls into the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum External {
    Boolean(bool),
    Integer(i64),
    String(Box<str>),
    Symbol(Box<str>),
    // the empty list is nil
    List(Vec<External>),
    Procedure(ProcedureInfo),
}

/// What can be said about a procedure once it is out of the arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureInfo {
    pub name: Option<Box<str>>,
    pub native: bool,
}

impl External {
    pub fn nil() -> Self {
        Self::List(vec![])
    }
}

impl From<&Expr> for External {
    fn from(expr: &Expr) -> Self {
        match expr {
            Expr::Literal(Literal::Boolean(b)) => Self::Boolean(*b),
            Expr::Literal(Literal::Integer(n)) => Self::Integer(*n),
            Expr::Literal(Literal::String(s)) => Self::String(s.clone()),
            Expr::Name(name) => Self::Symbol(name.clone()),
            Expr::Form(items) => Self::List(items.iter().map(Self::from).collect()),
        }
    }
}

macro_rules! external_from {
    ($ty:ty as $variant:ident) => {
        impl From<$ty> for External {
            fn from(value: $ty) -> Self {
                Self::$variant(value.into())
            }
        }
    };
}

external_from!(bool as Boolean);
external_from!(i8 as Integer);
external_from!(i16 as Integer);
external_from!(i32 as Integer);
external_from!(i64 as Integer);
external_from!(u8 as Integer);
external_from!(u16 as Integer);
external_from!(u32 as Integer);
external_from!(&str as String);

// nil is an empty list
impl From<()> for External {
    fn from(_: ()) -> Self {
        Self::nil()
    }
}

impl<T: Into<External>> From<Vec<T>> for External {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

fn is_plain_symbol(sym: &str) -> bool {
    let peculiar = matches!(sym, "+" | "-");
    let mut chars = sym.chars();
    let ordinary = chars
        .next()
        .is_some_and(|chr| chr.is_ascii_alphabetic() || "!$%&*/:<=>?^_~".contains(chr))
        && chars.all(|chr| chr.is_ascii_alphanumeric() || "!$%&*/:<=>?^_~+-.@".contains(chr));
    peculiar || ordinary
}

impl fmt::Display for ProcedureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.native { "native" } else { "procedure" };
        match &self.name {
            Some(name) => write!(f, "#<{kind} {name}>"),
            None => write!(f, "#<{kind}>"),
        }
    }
}

// This is a quick and dirty way to print an external representation
impl fmt::Display for External {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(true) => write!(f, "#t"),
            Self::Boolean(false) => write!(f, "#f"),
            Self::Integer(n) => write!(f, "{n}"),
            Self::String(strg) => write!(f, "{strg:?}"),
            Self::Symbol(sym) if is_plain_symbol(sym) => write!(f, "{sym}"),
            Self::Symbol(sym) => write!(f, "|{}|", sym.replace('|', "\\|")),
            Self::List(lst) => {
                write!(
                    f,
                    "({})",
                    lst.iter()
                        .map(|ext| ext.to_string())
                        .collect::<Vec<_>>()
                        .join(" ")
                )
            }
            Self::Procedure(info) => write!(f, "{info}"),
        }
    }
}
