//! Representation of runtime values
use core::fmt;

use gc_arena::{Collect, Gc, Mutation, RefLock};
use lasso::{Rodeo, Spur};

use crate::{
    expr::{Expr, Literal},
    runtime::{external::External, Procedure, RuntimeError},
};

/// A shared, mutable storage location.
///
/// Locals that get captured by a closure are promoted to one of these, so
/// the defining frame and every closure over it see the same variable.
pub type Cell<'gc> = Gc<'gc, RefLock<Value<'gc>>>;

/// An interned name.
#[derive(Collect, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[collect(require_static)]
pub struct Symbol(pub Spur);

// Type that stores all possible values!
#[derive(Collect, Clone, Copy, Default, Debug)]
#[collect(no_drop)]
pub enum Value<'gc> {
    // This is the value written as ()
    #[default]
    Nil,
    Bool(bool),
    Integer(i64),
    String(Gc<'gc, String>),
    Symbol(Symbol),
    // never empty, the empty list is Nil
    List(Gc<'gc, Vec<Value<'gc>>>),
    Procedure(Procedure<'gc>),
}

impl<'gc> Value<'gc> {
    /// Builds the value a quoted expression stands for.
    pub fn from_expr(mc: &Mutation<'gc>, rodeo: &mut Rodeo, expr: &Expr) -> Self {
        match expr {
            Expr::Literal(lit) => Self::from_literal(mc, lit),
            Expr::Name(name) => Self::Symbol(Symbol(rodeo.get_or_intern(name))),
            Expr::Form(items) if items.is_empty() => Self::Nil,
            Expr::Form(items) => Self::List(Gc::new(
                mc,
                items
                    .iter()
                    .map(|item| Self::from_expr(mc, rodeo, item))
                    .collect(),
            )),
        }
    }

    /// Brings a host value into the arena. Procedures only travel outward.
    pub fn from_external(
        mc: &Mutation<'gc>,
        rodeo: &mut Rodeo,
        external: &External,
    ) -> Result<Self, RuntimeError> {
        Ok(match external {
            External::Boolean(b) => Self::Bool(*b),
            External::Integer(n) => Self::Integer(*n),
            External::String(s) => Self::String(Gc::new(mc, String::from(s.as_ref()))),
            External::Symbol(sym) => Self::Symbol(Symbol(rodeo.get_or_intern(sym))),
            External::List(items) => Self::list(
                mc,
                items
                    .iter()
                    .map(|item| Self::from_external(mc, rodeo, item))
                    .collect::<Result<_, _>>()?,
            ),
            External::Procedure(info) => {
                return Err(RuntimeError::Opaque(info.to_string().into_boxed_str()))
            }
        })
    }

    pub fn from_literal(mc: &Mutation<'gc>, lit: &Literal) -> Self {
        match lit {
            Literal::Boolean(b) => Self::Bool(*b),
            Literal::Integer(n) => Self::Integer(*n),
            Literal::String(s) => Self::String(Gc::new(mc, String::from(s.as_ref()))),
        }
    }

    pub fn list(mc: &Mutation<'gc>, items: Vec<Value<'gc>>) -> Self {
        if items.is_empty() {
            Self::Nil
        } else {
            Self::List(Gc::new(mc, items))
        }
    }

    /// Only `false` and the empty list are false.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::Bool(false))
    }

    /// Structural equality for data, identity for procedures.
    pub fn equals(&self, other: &Value<'gc>) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::String(a), Self::String(b)) => a.as_str() == b.as_str(),
            (Self::Symbol(a), Self::Symbol(b)) => a == b,
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(a, b)| a.equals(b))
            }
            (Self::Procedure(a), Self::Procedure(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Bool(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::String(_) => "string",
            Self::Symbol(_) => "symbol",
            Self::List(_) => "list",
            Self::Procedure(_) => "procedure",
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(int) => Some(*int),
            _ => None,
        }
    }

    /// The elements of a proper list, `Nil` being the empty one.
    pub fn as_list(&self) -> Option<&[Value<'gc>]> {
        match self {
            Self::Nil => Some(&[]),
            Self::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Converts into a representation that can leave the arena.
    pub fn to_external(&self, rodeo: &Rodeo) -> External {
        match self {
            Self::Nil => External::List(vec![]),
            Self::Bool(b) => External::Boolean(*b),
            Self::Integer(n) => External::Integer(*n),
            Self::String(s) => External::String(Box::from(s.as_str())),
            Self::Symbol(sym) => External::Symbol(Box::from(rodeo.resolve(&sym.0))),
            Self::List(items) => {
                External::List(items.iter().map(|item| item.to_external(rodeo)).collect())
            }
            Self::Procedure(proc) => External::Procedure(proc.describe(rodeo)),
        }
    }

    pub fn display<'a>(&'a self, rodeo: &'a Rodeo) -> impl fmt::Display + use<'a, 'gc> {
        DisplayValue { value: self, rodeo }
    }
}

struct DisplayValue<'a, 'gc> {
    value: &'a Value<'gc>,
    rodeo: &'a Rodeo,
}

impl fmt::Display for DisplayValue<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Value::Nil => write!(f, "()"),
            Value::Bool(true) => write!(f, "#t"),
            Value::Bool(false) => write!(f, "#f"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{:?}", s.as_str()),
            Value::Symbol(sym) => write!(f, "{}", self.rodeo.resolve(&sym.0)),
            Value::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item.display(self.rodeo))?;
                }
                write!(f, ")")
            }
            Value::Procedure(proc) => write!(f, "{}", proc.describe(self.rodeo)),
        }
    }
}
