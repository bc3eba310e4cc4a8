//! A [`Vm`] owns everything a program can reach: the global slot table, the
//! shared code segment, the special-form table and the module bindings.

use std::collections::HashMap;

use gc_arena::{Arena, Gc, Mutation, Rootable};
use lasso::{Rodeo, Spur};

use crate::{
    compiler::{bytecode::Code, special_forms, Compiler, SpecialForm},
    expr::Expr,
    reader,
    runtime::{
        builtins,
        external::External,
        interpreter::{Context, Limits, State},
        Arity, Callback, NativeProcedure, Procedure, RuntimeError,
    },
    Error,
};

pub mod fuel;
pub mod value;

use fuel::Fuel;
use value::Value;

type Root = Rootable![State<'_>];

/// Sizing and limits of a [`Vm`].
#[derive(Debug, Clone)]
pub struct Config {
    pub stack_capacity: usize,
    pub call_capacity: usize,
    pub global_capacity: usize,
    pub code_capacity: usize,
    /// Most bytecode frames on the call stack at once. Unbounded if None.
    pub max_call_depth: Option<usize>,
    /// Most calls from native code back into the evaluator in progress at
    /// once. These recurse on the host stack, so keep this small. Unbounded
    /// if None.
    pub max_native_depth: Option<usize>,
    /// Instructions a single evaluation may run. Unbounded if None.
    pub fuel: Option<i32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_capacity: 1024,
            call_capacity: 64,
            global_capacity: 256,
            code_capacity: 1024,
            max_call_depth: Some(10_000),
            max_native_depth: Some(128),
            fuel: None,
        }
    }
}

impl Config {
    fn limits(&self) -> Limits {
        Limits {
            fuel: self.fuel.map(Fuel::with),
            max_call_depth: self.max_call_depth,
            max_native_depth: self.max_native_depth,
        }
    }
}

/// Names bound at module scope, mapped to their global slots.
#[derive(Debug, Clone, Default)]
pub struct Module {
    bindings: HashMap<Spur, usize>,
}

impl Module {
    pub fn get(&self, name: Spur) -> Option<usize> {
        self.bindings.get(&name).copied()
    }
}

pub struct Vm {
    arena: Arena<Root>,
    /// interner
    rodeo: Rodeo,
    segment: Code,
    specials: HashMap<Spur, SpecialForm>,
    main: Module,
    config: Config,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Vm {
    /// A machine with the built-in special forms and procedures.
    pub fn new(config: Config) -> Self {
        let arena = Arena::<Root>::new(|_| {
            State::with_capacity(
                config.global_capacity,
                config.stack_capacity,
                config.call_capacity,
            )
        });
        let mut rodeo = Rodeo::default();
        let specials = special_forms::table(&mut rodeo);
        let mut vm = Self {
            arena,
            rodeo,
            segment: Code::with_capacity(config.code_capacity),
            specials,
            main: Module::default(),
            config,
        };
        builtins::install(&mut vm);
        vm
    }

    /// The shared code segment every compiled function lives in.
    pub fn segment(&self) -> &Code {
        &self.segment
    }

    pub fn stack_height(&self) -> usize {
        self.arena.mutate(|_, state| state.stack.len())
    }

    pub fn call_depth(&self) -> usize {
        self.arena.mutate(|_, state| state.calls.len())
    }

    /// Compiles and runs one expression at module scope.
    ///
    /// Bindings it makes at module scope are kept only if it compiles.
    pub fn eval(&mut self, expr: &Expr) -> Result<External, Error> {
        let Self {
            arena,
            rodeo,
            segment,
            specials,
            main,
            config,
        } = self;

        let result = arena.mutate_root(|mc, state| -> Result<External, Error> {
            let compiled = Compiler::new(
                mc,
                rodeo,
                &mut state.globals,
                segment,
                specials,
                main.bindings.clone(),
            )
            .compile_toplevel(expr)?;
            main.bindings = compiled.module;

            let mut ctx = Context::new(mc, rodeo, state, segment, &compiled.code, config.limits());
            let value = ctx.execute()?;
            drop(ctx);
            state.stack.pop();
            Ok(value.to_external(rodeo))
        });

        if let Err(error) = &result {
            tracing::debug!(%error, %expr, "evaluation failed");
        }
        self.arena.collect_debt();
        result
    }

    /// Reads every expression in `source` and evaluates them in order,
    /// stopping at the first failure. Returns the last value, nil if there
    /// was nothing to evaluate.
    pub fn load_source(&mut self, source: &str) -> Result<External, Error> {
        let exprs = reader::read(source)?;
        let mut last = External::nil();
        for expr in &exprs {
            last = self.eval(expr)?;
        }
        Ok(last)
    }

    /// Calls the procedure bound to `name` at module scope.
    pub fn call(&mut self, name: &str, args: &[External]) -> Result<External, Error> {
        let slot = self
            .rodeo
            .get(name)
            .and_then(|name| self.main.get(name))
            .ok_or_else(|| RuntimeError::Unbound(Box::from(name)))?;
        let Self {
            arena,
            rodeo,
            segment,
            config,
            ..
        } = self;

        let result = arena.mutate_root(|mc, state| -> Result<External, Error> {
            let args = args
                .iter()
                .map(|arg| Value::from_external(mc, rodeo, arg))
                .collect::<Result<Vec<_>, _>>()?;
            let callee = state.globals[slot];
            let toplevel = Code::new();
            let mut ctx = Context::new(mc, rodeo, state, segment, &toplevel, config.limits());
            let value = ctx.call(callee, &args)?;
            Ok(value.to_external(rodeo))
        });
        self.arena.collect_debt();
        result
    }

    /// The value bound to `name` at module scope.
    pub fn lookup(&self, name: &str) -> Option<External> {
        let slot = self.main.get(self.rodeo.get(name)?)?;
        let rodeo = &self.rodeo;
        Some(
            self.arena
                .mutate(|_, state| state.globals[slot].to_external(rodeo)),
        )
    }

    /// Binds `name` at module scope to a fresh global slot holding what
    /// `make` builds, and returns the slot.
    pub(crate) fn bind<F>(&mut self, name: &str, make: F) -> usize
    where
        F: for<'gc> FnOnce(&Mutation<'gc>) -> Value<'gc>,
    {
        let slot = self.arena.mutate_root(|mc, state| {
            state.globals.push(make(mc));
            state.globals.len() - 1
        });
        let name = self.rodeo.get_or_intern(name);
        self.main.bindings.insert(name, slot);
        slot
    }

    /// Binds `name` at module scope to a copy of `value`.
    pub fn define_shared(&mut self, name: &str, value: &External) -> Result<usize, Error> {
        let Self { arena, rodeo, .. } = self;
        let slot = arena.mutate_root(|mc, state| {
            state.globals.push(Value::from_external(mc, rodeo, value)?);
            Ok::<_, RuntimeError>(state.globals.len() - 1)
        })?;
        let name = self.rodeo.get_or_intern(name);
        self.main.bindings.insert(name, slot);
        Ok(slot)
    }

    /// Exposes a host function as a procedure bound to `name`.
    pub fn define_native(
        &mut self,
        name: &str,
        arity: Arity,
        callback: impl Callback + 'static,
    ) -> usize {
        let native = NativeProcedure::new(name, arity, callback);
        self.bind(name, move |mc| {
            Value::Procedure(Procedure::Native(Gc::new(mc, native)))
        })
    }

    /// Registers a special form, replacing any previous one of that name.
    ///
    /// Special forms take precedence over bindings of the same name.
    pub fn define_special(&mut self, name: &str, form: SpecialForm) {
        let name = self.rodeo.get_or_intern(name);
        self.specials.insert(name, form);
    }
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};

    use super::{Config, Vm};
    use crate::{
        compiler::{
            bytecode::{EncodeError, Opcode, MAX_OPERAND},
            CompileError, Compiler,
        },
        expr::Expr,
        runtime::{external::External, interpreter::Context, Arity, RuntimeError},
        world::value::Value,
        Error,
    };

    fn eval(source: &str) -> Result<External, Error> {
        Vm::default().load_source(source)
    }

    #[test]
    fn with_yields_its_last_body_value() {
        check!(eval("(with (x 1 y 2) (block x y))") == Ok(External::Integer(2)));
    }

    #[test]
    fn functions_return_their_argument() {
        check!(eval("((function (n) (with (x n) x)) 42)") == Ok(External::Integer(42)));
    }

    #[test]
    fn quoted_data_comes_back_unchanged() {
        check!(
            eval("'(a (1 \"two\") #t ())")
                == Ok(External::List(vec![
                    External::Symbol("a".into()),
                    External::from(vec![External::Integer(1), External::String("two".into())]),
                    External::Boolean(true),
                    External::nil(),
                ]))
        );
    }

    #[test]
    fn quote_of_anything_is_itself() {
        arbtest::arbtest(|u| {
            let datum: Expr = u.arbitrary()?;
            let mut vm = Vm::default();
            check!(vm.eval(&Expr::quote(datum.clone())) == Ok(External::from(&datum)));
            Ok(())
        });
    }

    #[test]
    fn closures_share_captured_variables() {
        let source = "
            (variable make
              (function (start)
                (with (get (function () start)
                       bump (function (by) (set start (+ start by))))
                  (list get bump))))
            (variable pair (make 10))
            (variable get (apply (function (g b) g) pair))
            (variable bump (apply (function (g b) b) pair))
            (bump 5)
            (get)";
        check!(eval(source) == Ok(External::Integer(15)));
    }

    #[test]
    fn closures_outlive_their_frame() {
        let source = "
            (variable counter
              (function ()
                (with (n 0)
                  (function () (set n (+ n 1))))))
            (variable a (counter))
            (variable b (counter))
            (a) (a) (b)
            (list (a) (b))";
        check!(eval(source) == Ok(External::from(vec![3, 2])));
    }

    #[test]
    fn captures_reach_through_several_functions() {
        check!(eval("((((function (x) (function () (function () x))) 5)))") == Ok(External::Integer(5)));
        // instantiated away from its lexical parent
        let source = "
            (variable outer
              (function (x)
                (function (f) (f (function () x)))))
            ((outer 7) (function (g) (g)))";
        check!(eval(source) == Ok(External::Integer(7)));
    }

    fn mul<'gc>(ctx: &mut Context<'_, 'gc>, argc: usize) -> Result<Value<'gc>, RuntimeError> {
        let args = ctx.arguments(argc);
        match (args[0].as_integer(), args[1].as_integer()) {
            (Some(a), Some(b)) => Ok(Value::Integer(a * b)),
            _ => Err(RuntimeError::native("mul", "expected integers")),
        }
    }

    #[test]
    fn named_functions_recurse() {
        let source = "
            (function fact (n)
              (if (< n 2) 1 (mul n (fact (- n 1)))))
            (fact 5)";
        let mut vm = Vm::default();
        vm.define_native("mul", Arity::Exact(2), mul);
        check!(vm.load_source(source) == Ok(External::Integer(120)));
        check!(vm.call("fact", &[External::Integer(6)]) == Ok(External::Integer(720)));
    }

    #[test]
    fn loops_and_assignment() {
        let source = "
            (variable i 0)
            (variable total 0)
            (while (< i 5)
              (set total (+ total i))
              (set i (+ i 1)))
            total";
        check!(eval(source) == Ok(External::Integer(10)));
        check!(eval("(while #f 1)") == Ok(External::nil()));
        check!(eval("(if nil 1)") == Ok(External::nil()));
    }

    #[test]
    fn failures_leave_the_machine_usable() {
        let mut vm = Vm::default();
        let_assert!(
            Err(Error::Runtime(RuntimeError::Arity { expected, got, .. })) =
                vm.load_source("((function (a b) a) 1)")
        );
        check!(expected == Arity::Exact(2));
        check!(got == 1);
        check!(vm.stack_height() == 0);
        check!(vm.call_depth() == 0);

        let_assert!(
            Err(Error::Runtime(RuntimeError::Arity { .. })) =
                vm.load_source("(variable f (function (a) a)) ((function () (f)))")
        );
        check!(vm.stack_height() == 0);
        check!(vm.call_depth() == 0);

        check!(vm.load_source("(+ 1 2)") == Ok(External::Integer(3)));
        check!(vm.stack_height() == 0);
    }

    #[test]
    fn failed_compiles_do_not_bind() {
        let mut vm = Vm::default();
        let_assert!(
            Err(Error::Compile(CompileError::Unbound(_))) = vm.load_source("(variable x nope)")
        );
        check!(vm.lookup("x").is_none());
        let_assert!(
            Err(Error::Compile(CompileError::Unbound(_))) =
                vm.load_source("(variable f (function () (g)))")
        );
        check!(vm.lookup("f").is_none());
        check!(vm.segment().is_empty());
    }

    #[test]
    fn host_calls_and_shared_values() {
        let mut vm = Vm::default();
        let_assert!(Ok(_) = vm.define_shared("limit", &External::Integer(3)));
        let_assert!(Ok(_) = vm.load_source("(function below (n) (< n limit))"));
        check!(vm.call("below", &[External::Integer(2)]) == Ok(External::Boolean(true)));
        check!(vm.call("below", &[External::Integer(4)]) == Ok(External::Boolean(false)));
        let_assert!(Err(Error::Runtime(RuntimeError::Unbound(_))) = vm.call("nowhere", &[]));
        check!(vm.lookup("limit") == Some(External::Integer(3)));
    }

    #[test]
    fn custom_special_forms() {
        // (unless test body) as (if test nil body)
        fn unless(compiler: &mut Compiler<'_, '_>, args: &[Expr]) -> Result<(), CompileError> {
            CompileError::check_args("unless", args, 2, Some(2))?;
            let rewritten = Expr::form([
                Expr::name("if"),
                args[0].clone(),
                Expr::name("nil"),
                args[1].clone(),
            ]);
            compiler.compile(&rewritten)
        }

        let mut vm = Vm::default();
        vm.define_special("unless", unless);
        check!(vm.load_source("(unless #f 4)") == Ok(External::Integer(4)));
        check!(vm.load_source("(unless #t 4)") == Ok(External::nil()));
    }

    #[test]
    fn unencodable_operands_fail_compilation() {
        fn far(compiler: &mut Compiler<'_, '_>, args: &[Expr]) -> Result<(), CompileError> {
            CompileError::check_args("far", args, 0, Some(0))?;
            compiler.emit(Opcode::Global, MAX_OPERAND as usize + 1)?;
            Ok(())
        }

        let mut vm = Vm::default();
        vm.define_special("far", far);
        let_assert!(
            Err(Error::Compile(CompileError::Encode(EncodeError::OperandTooLarge { .. }))) =
                vm.load_source("(variable f (function () (far)))")
        );
        check!(vm.lookup("f").is_none());
        check!(vm.segment().is_empty());
        check!(vm.load_source("(+ 1 2)") == Ok(External::Integer(3)));
    }

    #[test]
    fn limits() {
        let mut vm = Vm::new(Config {
            fuel: Some(1_000),
            ..Config::default()
        });
        let_assert!(Err(Error::Runtime(RuntimeError::OutOfFuel)) = vm.load_source("(while #t 1)"));
        check!(vm.stack_height() == 0);
        // fuel is per evaluation
        check!(vm.load_source("(+ 1 1)") == Ok(External::Integer(2)));

        let mut vm = Vm::new(Config {
            max_call_depth: Some(50),
            ..Config::default()
        });
        let_assert!(
            Err(Error::Runtime(RuntimeError::CallDepthExceeded(50))) =
                vm.load_source("(function down (n) (down n)) (down 1)")
        );
        check!(vm.call_depth() == 0);
        let_assert!(
            Err(Error::Runtime(RuntimeError::CallDepthExceeded(50))) =
                vm.load_source("(function again (f) (apply again (list f))) (again 1)")
        );
        check!(vm.stack_height() == 0);
    }

    #[test]
    fn native_reentry_is_bounded_by_default() {
        // the size of a main thread's stack
        let worker = std::thread::Builder::new()
            .stack_size(8 << 20)
            .spawn(|| {
                let mut vm = Vm::default();
                let result =
                    vm.load_source("(function again (f) (apply again (list f))) (again 1)");
                (result, vm.stack_height(), vm.call_depth())
            });
        let_assert!(Ok(worker) = worker);
        let_assert!(Ok((result, stack_height, call_depth)) = worker.join());
        check!(result == Err(Error::Runtime(RuntimeError::NativeDepthExceeded(128))));
        check!(stack_height == 0);
        check!(call_depth == 0);
    }
}
