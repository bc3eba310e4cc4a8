//! Native procedures every machine starts with.
use crate::{
    runtime::{interpreter::Context, Arity, Procedure, RuntimeError},
    world::{value::Value, Vm},
};

pub(crate) fn install(vm: &mut Vm) {
    vm.bind("true", |_| Value::Bool(true));
    vm.bind("false", |_| Value::Bool(false));
    vm.bind("nil", |_| Value::Nil);

    vm.define_native("+", Arity::Min(0), add);
    vm.define_native("-", Arity::Min(1), sub);
    vm.define_native("<", Arity::Exact(2), less);
    vm.define_native("=", Arity::Exact(2), equal);
    vm.define_native("list", Arity::Min(0), list);
    vm.define_native("apply", Arity::Exact(2), apply);
    vm.define_native("print", Arity::Min(0), print);
    vm.define_native("ddump", Arity::Exact(1), ddump);
}

fn integers(name: &str, args: &[Value<'_>]) -> Result<Vec<i64>, RuntimeError> {
    args.iter()
        .map(|arg| {
            arg.as_integer().ok_or_else(|| {
                RuntimeError::native(name, format!("expected integer, got {}", arg.type_name()))
            })
        })
        .collect()
}

fn overflow(name: &'static str) -> RuntimeError {
    RuntimeError::native(name, "integer overflow")
}

fn add<'gc>(ctx: &mut Context<'_, 'gc>, argc: usize) -> Result<Value<'gc>, RuntimeError> {
    let sum = integers("+", &ctx.arguments(argc))?
        .into_iter()
        .try_fold(0i64, i64::checked_add)
        .ok_or_else(|| overflow("+"))?;
    Ok(Value::Integer(sum))
}

fn sub<'gc>(ctx: &mut Context<'_, 'gc>, argc: usize) -> Result<Value<'gc>, RuntimeError> {
    let args = integers("-", &ctx.arguments(argc))?;
    let result = match args.as_slice() {
        [n] => n.checked_neg(),
        [first, rest @ ..] => rest.iter().try_fold(*first, |acc, n| acc.checked_sub(*n)),
        [] => unreachable!("arity checked before the call"),
    };
    result.map(Value::Integer).ok_or_else(|| overflow("-"))
}

fn less<'gc>(ctx: &mut Context<'_, 'gc>, argc: usize) -> Result<Value<'gc>, RuntimeError> {
    let args = integers("<", &ctx.arguments(argc))?;
    Ok(Value::Bool(args[0] < args[1]))
}

fn equal<'gc>(ctx: &mut Context<'_, 'gc>, argc: usize) -> Result<Value<'gc>, RuntimeError> {
    let args = ctx.arguments(argc);
    Ok(Value::Bool(args[0].equals(&args[1])))
}

fn list<'gc>(ctx: &mut Context<'_, 'gc>, argc: usize) -> Result<Value<'gc>, RuntimeError> {
    let args = ctx.arguments(argc);
    Ok(Value::list(ctx.mc, args))
}

/// `(apply procedure list)`, calls back into the evaluator.
fn apply<'gc>(ctx: &mut Context<'_, 'gc>, argc: usize) -> Result<Value<'gc>, RuntimeError> {
    let args = ctx.arguments(argc);
    let Some(list) = args[1].as_list() else {
        return Err(RuntimeError::native(
            "apply",
            format!("expected list, got {}", args[1].type_name()),
        ));
    };
    let list = list.to_vec();
    ctx.call(args[0], &list)
}

fn print<'gc>(ctx: &mut Context<'_, 'gc>, argc: usize) -> Result<Value<'gc>, RuntimeError> {
    let line = ctx
        .arguments(argc)
        .iter()
        .map(|arg| arg.display(ctx.rodeo).to_string())
        .collect::<Vec<_>>()
        .join(" ");
    println!("{line}");
    Ok(Value::Nil)
}

/// The instructions of a bytecode procedure's body, one per line.
pub(crate) fn disassemble<'gc>(
    ctx: &Context<'_, 'gc>,
    value: Value<'gc>,
) -> Result<String, RuntimeError> {
    match value {
        Value::Procedure(Procedure::Code(lambda)) => Ok(ctx
            .segment()
            .function_listing(lambda.template.offset)
            .to_string()),
        Value::Procedure(Procedure::Native(_)) => Err(RuntimeError::native(
            "ddump",
            "expected a bytecode procedure, got a native one",
        )),
        other => Err(RuntimeError::native(
            "ddump",
            format!("expected a bytecode procedure, got {}", other.type_name()),
        )),
    }
}

/// `(ddump procedure)` prints the disassembly of `procedure`.
fn ddump<'gc>(ctx: &mut Context<'_, 'gc>, argc: usize) -> Result<Value<'gc>, RuntimeError> {
    let args = ctx.arguments(argc);
    print!("{}", disassemble(ctx, args[0])?);
    Ok(Value::Nil)
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};

    use gc_arena::Gc;

    use super::disassemble;
    use crate::{
        runtime::{external::External, interpreter::Context, Arity, RuntimeError},
        world::{value::Value, Vm},
        Error,
    };

    fn eval(source: &str) -> Result<External, Error> {
        Vm::default().load_source(source)
    }

    #[test]
    fn arithmetic() {
        check!(eval("(+ 1 2 3)") == Ok(External::Integer(6)));
        check!(eval("(+)") == Ok(External::Integer(0)));
        check!(eval("(- 5)") == Ok(External::Integer(-5)));
        check!(eval("(- 10 1 2)") == Ok(External::Integer(7)));
        check!(eval("(< 1 2)") == Ok(External::Boolean(true)));
        check!(eval("(= (list 1 'a) (list 1 'a))") == Ok(External::Boolean(true)));
    }

    #[test]
    fn natives_report_failures() {
        let_assert!(Err(Error::Runtime(RuntimeError::Native { name, .. })) = eval("(+ 1 #t)"));
        check!(&*name == "+");
        let_assert!(
            Err(Error::Runtime(RuntimeError::Native { message, .. })) =
                eval("(+ 9223372036854775807 1)")
        );
        check!(&*message == "integer overflow");
        let_assert!(Err(Error::Runtime(RuntimeError::Arity { .. })) = eval("(<)"));
    }

    #[test]
    fn apply_calls_closures() {
        check!(eval("(apply (function (a b) (- a b)) (list 5 3))") == Ok(External::Integer(2)));
        check!(eval("(apply + '(1 2 3))") == Ok(External::Integer(6)));
        let_assert!(
            Err(Error::Runtime(RuntimeError::Arity { got: 1, .. })) =
                eval("(apply (function (a b) a) '(1))")
        );
    }

    fn listing<'gc>(ctx: &mut Context<'_, 'gc>, argc: usize) -> Result<Value<'gc>, RuntimeError> {
        let args = ctx.arguments(argc);
        let text = disassemble(ctx, args[0])?;
        Ok(Value::String(Gc::new(ctx.mc, text)))
    }

    #[test]
    fn ddump_lists_one_function_body() {
        let mut vm = Vm::default();
        vm.define_native("listing", Arity::Exact(1), listing);
        let source = "
            (function id (x) x)
            (function f (x y) (if x y x))";
        let_assert!(Ok(_) = vm.load_source(source));
        check!(vm.load_source("(listing id)") == Ok(External::String("0000 LOCAL 0\n0001 RET\n".into())));
        check!(
            vm.load_source("(listing f)")
                == Ok(External::String(
                    "0002 LOCAL 0\n\
                     0003 BRANCH_IF_FALSE +3 ; -> 0006\n\
                     0004 LOCAL 1\n\
                     0005 BRANCH +2 ; -> 0007\n\
                     0006 LOCAL 0\n\
                     0007 RET\n"
                        .into()
                ))
        );
        check!(vm.load_source("(ddump f)") == Ok(External::nil()));
    }

    #[test]
    fn ddump_needs_bytecode() {
        let_assert!(Err(Error::Runtime(RuntimeError::Native { name, message })) = eval("(ddump +)"));
        check!(&*name == "ddump");
        check!(&*message == "expected a bytecode procedure, got a native one");
        let_assert!(Err(Error::Runtime(RuntimeError::Native { message, .. })) = eval("(ddump 1)"));
        check!(&*message == "expected a bytecode procedure, got integer");
    }
}
