//! A small embeddable language: a reader, a compiler to a compact bytecode,
//! and a stack machine with closures and native procedures.
//!
//! ```
//! use mote::{External, Vm};
//!
//! let mut vm = Vm::default();
//! let value = vm.load_source("(with (x 1 y 2) (+ x y))").unwrap();
//! assert_eq!(value, External::Integer(3));
//! ```

pub mod compiler;
pub mod expr;
pub mod lexer;
pub mod reader;
pub mod runtime;
pub mod world;

pub use compiler::{bytecode::Code, CompileError, Compiler, SpecialForm};
pub use expr::{Expr, Literal};
pub use reader::{read, ReadError};
pub use runtime::{
    external::{External, ProcedureInfo},
    interpreter::Context,
    Arity, Callback, RuntimeError,
};
pub use world::{fuel::Fuel, value, Config, Vm};

/// Anything that can go wrong between source text and a value.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
