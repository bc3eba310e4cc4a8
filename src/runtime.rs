//! Procedures, and the machinery that runs them.
use core::fmt;
use std::rc::Rc;

use gc_arena::{Collect, Gc};
use lasso::Rodeo;

use crate::world::value::{Cell, Symbol, Value};

pub mod builtins;
pub mod external;
pub mod interpreter;

use external::ProcedureInfo;
use interpreter::Context;

/// Failures that abort an evaluation.
///
/// The evaluation and call stacks are unwound before one of these reaches
/// the host, so the machine stays usable.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("{name} expects {expected} argument(s), got {got}")]
    Arity {
        name: Box<str>,
        expected: Arity,
        got: usize,
    },
    #[error("not a procedure: {kind}")]
    NotCallable { kind: &'static str },
    #[error("{name}: {message}")]
    Native { name: Box<str>, message: Box<str> },
    #[error("call depth exceeded {0}")]
    CallDepthExceeded(usize),
    #[error("native calls nested deeper than {0}")]
    NativeDepthExceeded(usize),
    #[error("ran out of fuel")]
    OutOfFuel,
    #[error("no global named {0}")]
    Unbound(Box<str>),
    #[error("{0} cannot be passed in from the host")]
    Opaque(Box<str>),
}

impl RuntimeError {
    /// A failure reported by native code.
    pub fn native(name: impl AsRef<str>, message: impl fmt::Display) -> Self {
        Self::Native {
            name: Box::from(name.as_ref()),
            message: message.to_string().into_boxed_str(),
        }
    }
}

#[derive(Collect, Debug, Clone, Copy)]
#[collect(no_drop)]
pub enum Procedure<'gc> {
    Code(Gc<'gc, Lambda<'gc>>),
    Native(Gc<'gc, NativeProcedure>),
}

impl<'gc> Procedure<'gc> {
    pub fn arity(&self) -> Arity {
        match self {
            Self::Code(code) => Arity::Exact(code.template.params),
            Self::Native(nat) => nat.arity,
        }
    }

    pub fn ptr_eq(&self, other: &Procedure<'gc>) -> bool {
        match (self, other) {
            (Self::Code(a), Self::Code(b)) => Gc::ptr_eq(*a, *b),
            (Self::Native(a), Self::Native(b)) => Gc::ptr_eq(*a, *b),
            _ => false,
        }
    }

    pub fn describe(&self, rodeo: &Rodeo) -> ProcedureInfo {
        match self {
            Self::Code(code) => ProcedureInfo {
                name: code
                    .template
                    .name
                    .map(|name| Box::from(rodeo.resolve(&name.0))),
                native: false,
            },
            Self::Native(nat) => ProcedureInfo {
                name: Some(nat.name.clone()),
                native: true,
            },
        }
    }
}

/// Where a closure takes a captured cell from when it is instantiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capture {
    /// a local slot of the frame running the CLOSURE instruction
    Local(usize),
    /// a cell the running function has itself captured
    Foreign(usize),
}

/// A compile-time description of one captured variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignSlot {
    /// function boundaries between the capturing function and the owner
    pub distance: usize,
    /// the variable's local slot in the owning function
    pub owner_slot: usize,
    pub source: Capture,
}

/// Everything about a compiled function that does not change per closure.
#[derive(Collect, Debug, Clone)]
#[collect(require_static)]
pub struct Template {
    pub name: Option<Symbol>,
    pub params: usize,
    /// parameters included
    pub locals: usize,
    /// start of the body in the code segment
    pub offset: usize,
    pub foreigns: Vec<ForeignSlot>,
}

/// A bytecode function.
///
/// The constant a `function` form compiles to holds one of these with no
/// cells; instantiating it with CLOSURE fills in one cell per foreign slot.
#[derive(Collect)]
#[collect(no_drop)]
pub struct Lambda<'gc> {
    pub template: Gc<'gc, Template>,
    pub cells: Vec<Cell<'gc>>,
}

impl<'gc> Lambda<'gc> {
    pub fn is_instantiated(&self) -> bool {
        self.cells.len() == self.template.foreigns.len()
    }
}

impl fmt::Debug for Lambda<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lambda")
            .field("template", &*self.template)
            .field("cells", &self.cells.len())
            .finish()
    }
}

/// A host function callable from bytecode.
#[derive(Collect, Clone)]
#[collect(require_static)]
pub struct NativeProcedure {
    pub name: Box<str>,
    pub arity: Arity,
    pub callback: Rc<dyn Callback>,
}

impl NativeProcedure {
    pub fn new(name: impl AsRef<str>, arity: Arity, callback: impl Callback + 'static) -> Self {
        Self {
            name: Box::from(name.as_ref()),
            arity,
            callback: Rc::new(callback),
        }
    }
}

impl fmt::Debug for NativeProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<native {} {:p}>", self.name, self.callback)
    }
}

/// Procedure arity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Collect)]
#[collect(require_static)]
pub enum Arity {
    Exact(usize),
    Min(usize),
}

impl Arity {
    pub fn is_satisfied(&self, len: usize) -> bool {
        match self {
            Self::Exact(e) => *e == len,
            Self::Min(m) => *m <= len,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(e) => write!(f, "{e}"),
            Self::Min(m) => write!(f, "at least {m}"),
        }
    }
}

/// A native callback.
///
/// Its `argc` arguments sit on top of the evaluation stack when it is
/// invoked (see [`Context::arguments`]); it returns exactly one value. The
/// context can call back into the evaluator with [`Context::call`].
pub trait Callback {
    fn call<'gc>(
        &self,
        ctx: &mut Context<'_, 'gc>,
        argc: usize,
    ) -> Result<Value<'gc>, RuntimeError>;
}

impl<F> Callback for F
where
    F: for<'a, 'gc> Fn(&mut Context<'a, 'gc>, usize) -> Result<Value<'gc>, RuntimeError>,
{
    fn call<'gc>(
        &self,
        ctx: &mut Context<'_, 'gc>,
        argc: usize,
    ) -> Result<Value<'gc>, RuntimeError> {
        self(ctx, argc)
    }
}
