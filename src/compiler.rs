//! Compile expressions into bytecode.
//!
//! For example, at module scope
//!
//! ```text
//! (with (x 1) (function (y) (+ x y)))
//! ```
//!
//! compiles to
//!
//! ```text
//! == function, params: 1, locals: 1 ==
//! GLOBAL x
//! LOCAL 0
//! GLOBAL +
//! CALL 2
//! RET
//! == top level ==
//! GLOBAL <1>
//! SET_GLOBAL x
//! CLOSURE <template>
//! RET
//! ```
//!
//! `x` lives in a global slot because the `with` is not inside a function.
//! Had it been, `x` would be a local of the enclosing function and the
//! inner function would reach it through its foreign table instead.

pub mod bytecode;
pub mod environment;
pub mod special_forms;

use std::collections::HashMap;

use gc_arena::{Gc, Mutation};
use lasso::{Rodeo, Spur};

use crate::{
    expr::{Expr, Literal},
    runtime::{Capture, ForeignSlot, Lambda, Procedure, Template},
    world::value::{Symbol, Value},
};

use bytecode::{Code, EncodeError, Opcode};
use environment::{Access, Scope, Storage};

/// Generates code for a special form, given the unevaluated arguments
/// (everything after the head).
pub type SpecialForm =
    for<'a, 'gc> fn(&mut Compiler<'a, 'gc>, &[Expr]) -> Result<(), CompileError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("unbound name: {0}")]
    Unbound(Box<str>),
    #[error("cannot evaluate an empty form")]
    EmptyForm,
    #[error("{form}: too few arguments")]
    TooFew { form: &'static str },
    #[error("{form}: too many arguments")]
    TooMany { form: &'static str },
    #[error("{form}: expected {expected}, got {got}")]
    Expected {
        form: &'static str,
        expected: &'static str,
        got: &'static str,
    },
    #[error("{form}: {name} is bound twice")]
    Duplicate { form: &'static str, name: Box<str> },
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl CompileError {
    /// Checks that a special form got between `min` and `max` arguments.
    pub fn check_args(
        form: &'static str,
        args: &[Expr],
        min: usize,
        max: Option<usize>,
    ) -> Result<(), Self> {
        if args.len() < min {
            Err(Self::TooFew { form })
        } else if max.is_some_and(|max| args.len() > max) {
            Err(Self::TooMany { form })
        } else {
            Ok(())
        }
    }
}

/// Anything that knows how to emit code for itself.
pub trait Compile {
    fn compile(&self, compiler: &mut Compiler<'_, '_>) -> Result<(), CompileError>;
}

impl Compile for Literal {
    fn compile(&self, compiler: &mut Compiler<'_, '_>) -> Result<(), CompileError> {
        let value = Value::from_literal(compiler.mc, self);
        compiler.emit_constant(value)
    }
}

impl Compile for Expr {
    fn compile(&self, compiler: &mut Compiler<'_, '_>) -> Result<(), CompileError> {
        match self {
            Expr::Literal(lit) => lit.compile(compiler),
            Expr::Name(name) => {
                let access = compiler.resolve(name)?;
                compiler.load(access)
            }
            Expr::Form(items) => {
                let [head, args @ ..] = items.as_slice() else {
                    return Err(CompileError::EmptyForm);
                };
                match head.as_name().and_then(|name| compiler.special(name)) {
                    Some(special) => special(compiler, args),
                    None => compiler.compile_call(head, args),
                }
            }
        }
    }
}

/// A function whose body is being compiled.
#[derive(Debug, Default)]
struct FunctionBuilder {
    name: Option<Symbol>,
    params: usize,
    locals: usize,
    foreigns: Vec<ForeignSlot>,
    code: Code,
}

/// The result of compiling one top-level expression.
#[derive(Debug)]
pub struct Compiled {
    /// top-level code, ending in RET
    pub code: Code,
    /// the module bindings after the expression
    pub module: HashMap<Spur, usize>,
}

pub struct Compiler<'a, 'gc> {
    pub mc: &'a Mutation<'gc>,
    pub rodeo: &'a mut Rodeo,
    globals: &'a mut Vec<Value<'gc>>,
    segment: &'a mut Code,
    specials: &'a HashMap<Spur, SpecialForm>,
    scopes: Vec<Scope>,
    functions: Vec<FunctionBuilder>,
    toplevel: Code,
}

impl<'a, 'gc> Compiler<'a, 'gc> {
    pub fn new(
        mc: &'a Mutation<'gc>,
        rodeo: &'a mut Rodeo,
        globals: &'a mut Vec<Value<'gc>>,
        segment: &'a mut Code,
        specials: &'a HashMap<Spur, SpecialForm>,
        module: HashMap<Spur, usize>,
    ) -> Self {
        Self {
            mc,
            rodeo,
            globals,
            segment,
            specials,
            scopes: vec![Scope::module(module)],
            functions: vec![],
            toplevel: Code::new(),
        }
    }

    /// Compiles one expression at module scope.
    ///
    /// On failure, the code segment is cut back to where it was and every
    /// global slot allocated along the way is cleared. The slots themselves
    /// are not handed out again.
    pub fn compile_toplevel(mut self, expr: &Expr) -> Result<Compiled, CompileError> {
        let (globals_len, segment_len) = (self.globals.len(), self.segment.len());
        let result = expr.compile(&mut self).and_then(|()| {
            self.toplevel.emit(Opcode::Ret, 0)?;
            Ok(())
        });
        match result {
            Ok(()) => {
                let Some(module) = self.scopes.into_iter().next() else {
                    unreachable!("module scope popped");
                };
                Ok(Compiled {
                    code: self.toplevel,
                    module: module.into_names(),
                })
            }
            Err(error) => {
                tracing::debug!(%error, "compilation failed");
                self.globals[globals_len..].fill(Value::Nil);
                self.segment.truncate(segment_len);
                Err(error)
            }
        }
    }

    fn special(&self, name: &str) -> Option<SpecialForm> {
        self.specials.get(&self.rodeo.get(name)?).copied()
    }

    pub fn intern(&mut self, name: &str) -> Spur {
        self.rodeo.get_or_intern(name)
    }

    fn current_scope(&self) -> usize {
        self.scopes.len() - 1
    }

    /// The buffer code is currently emitted into.
    pub fn code(&mut self) -> &mut Code {
        match self.scopes[self.current_scope()].function() {
            Some(function) => &mut self.functions[function].code,
            None => &mut self.toplevel,
        }
    }

    pub fn emit(&mut self, op: Opcode, arg: usize) -> Result<usize, CompileError> {
        Ok(self.code().emit(op, arg)?)
    }

    /// Installs `value` in a fresh global slot and returns the slot.
    pub fn constant(&mut self, value: Value<'gc>) -> usize {
        self.globals.push(value);
        self.globals.len() - 1
    }

    pub fn emit_constant(&mut self, value: Value<'gc>) -> Result<(), CompileError> {
        let slot = self.constant(value);
        self.emit(Opcode::Global, slot)?;
        Ok(())
    }

    pub fn compile(&mut self, expr: &Expr) -> Result<(), CompileError> {
        expr.compile(self)
    }

    /// Compiles a sequence, dropping every value but the last.
    pub fn compile_block(&mut self, form: &'static str, body: &[Expr]) -> Result<(), CompileError> {
        let Some((last, init)) = body.split_last() else {
            return Err(CompileError::TooFew { form });
        };
        for expr in init {
            expr.compile(self)?;
            self.emit(Opcode::Drop, 0)?;
        }
        last.compile(self)
    }

    fn compile_call(&mut self, head: &Expr, args: &[Expr]) -> Result<(), CompileError> {
        for arg in args {
            arg.compile(self)?;
        }
        head.compile(self)?;
        self.emit(Opcode::Call, args.len())?;
        Ok(())
    }

    /// Runs `body` in a fresh scope nested in the current one.
    pub fn scoped<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, CompileError>,
    ) -> Result<T, CompileError> {
        let parent = self.current_scope();
        let function = self.scopes[parent].function();
        self.scopes.push(Scope::child(parent, function));
        let result = body(self);
        self.scopes.pop();
        result
    }

    /// Allocates a slot for a new binding in the current scope: a local
    /// inside a function, a global otherwise.
    pub fn allocate(&mut self) -> Storage {
        let scope = &self.scopes[self.current_scope()];
        match scope.function() {
            Some(function) => {
                let builder = &mut self.functions[function];
                builder.locals += 1;
                Storage::Local(builder.locals - 1)
            }
            None => Storage::Global(self.constant(Value::Nil)),
        }
    }

    /// Allocates a slot and binds `name` to it in the current scope.
    pub fn declare(&mut self, name: Spur) -> Storage {
        let storage = self.allocate();
        let slot = match storage {
            Storage::Global(slot) | Storage::Local(slot) => slot,
        };
        let current = self.current_scope();
        self.scopes[current].define(name, slot);
        storage
    }

    /// Finds how the current code reaches `name`.
    pub fn resolve(&mut self, name: &str) -> Result<Access, CompileError> {
        let unbound = || CompileError::Unbound(Box::from(name));
        let name = self.rodeo.get(name).ok_or_else(unbound)?;

        let current = self.scopes[self.current_scope()].function();
        let mut scope = Some(self.current_scope());
        while let Some(index) = scope {
            let found = &self.scopes[index];
            if let Some(slot) = found.get(name) {
                return Ok(match (found.function(), current) {
                    (None, _) => Access::Global(slot),
                    (Some(owner), Some(current)) if owner == current => Access::Local(slot),
                    (Some(owner), Some(current)) => {
                        Access::Foreign(self.capture(owner, slot, current))
                    }
                    (Some(_), None) => unreachable!("module scope nested in a function"),
                });
            }
            scope = found.parent();
        }
        Err(unbound())
    }

    /// Gets the foreign index through which function `current` reaches
    /// local `slot` of function `owner`, threading the capture through
    /// every function in between.
    fn capture(&mut self, owner: usize, slot: usize, current: usize) -> usize {
        let distance = current - owner;
        let existing = self.functions[current]
            .foreigns
            .iter()
            .position(|foreign| foreign.distance == distance && foreign.owner_slot == slot);
        if let Some(index) = existing {
            return index;
        }

        let source = if distance == 1 {
            Capture::Local(slot)
        } else {
            Capture::Foreign(self.capture(owner, slot, current - 1))
        };
        let foreigns = &mut self.functions[current].foreigns;
        foreigns.push(ForeignSlot {
            distance,
            owner_slot: slot,
            source,
        });
        foreigns.len() - 1
    }

    pub fn load(&mut self, access: Access) -> Result<(), CompileError> {
        match access {
            Access::Global(slot) => self.emit(Opcode::Global, slot)?,
            Access::Local(slot) => self.emit(Opcode::Local, slot)?,
            Access::Foreign(index) => self.emit(Opcode::Foreign, index)?,
        };
        Ok(())
    }

    pub fn store(&mut self, access: Access) -> Result<(), CompileError> {
        match access {
            Access::Global(slot) => self.emit(Opcode::SetGlobal, slot)?,
            Access::Local(slot) => self.emit(Opcode::SetLocal, slot)?,
            Access::Foreign(index) => self.emit(Opcode::SetForeign, index)?,
        };
        Ok(())
    }

    /// Compiles a function body and emits the CLOSURE that builds it.
    ///
    /// Parameters take local slots from zero up, in order.
    pub fn compile_function(
        &mut self,
        name: Option<Spur>,
        params: &[Spur],
        body: &[Expr],
    ) -> Result<(), CompileError> {
        let parent = self.current_scope();
        self.functions.push(FunctionBuilder {
            name: name.map(Symbol),
            params: params.len(),
            locals: params.len(),
            ..Default::default()
        });
        let mut scope = Scope::child(parent, Some(self.functions.len() - 1));
        for (slot, param) in params.iter().enumerate() {
            scope.define(*param, slot);
        }
        self.scopes.push(scope);

        let result = self.compile_block("function", body);
        self.scopes.pop();
        let Some(mut builder) = self.functions.pop() else {
            unreachable!("function builder popped early");
        };
        result?;

        builder.code.emit(Opcode::Ret, 0)?;
        let offset = self.segment.append(builder.code);
        tracing::debug!(
            offset,
            params = builder.params,
            locals = builder.locals,
            foreigns = builder.foreigns.len(),
            "compiled function"
        );

        let template = Gc::new(
            self.mc,
            Template {
                name: builder.name,
                params: builder.params,
                locals: builder.locals,
                offset,
                foreigns: builder.foreigns,
            },
        );
        let lambda = Gc::new(
            self.mc,
            Lambda {
                template,
                cells: vec![],
            },
        );
        let constant = self.constant(Value::Procedure(Procedure::Code(lambda)));
        self.emit(Opcode::Closure, constant)?;
        Ok(())
    }
}
