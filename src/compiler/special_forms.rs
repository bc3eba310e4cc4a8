//! The built-in special forms.
use std::collections::HashMap;

use lasso::{Rodeo, Spur};

use super::{bytecode::Opcode, CompileError, Compiler, SpecialForm};
use crate::{expr::Expr, world::value::Value};

/// Every built-in special form, keyed by its interned name.
pub fn table(rodeo: &mut Rodeo) -> HashMap<Spur, SpecialForm> {
    let forms: [(&str, SpecialForm); 8] = [
        ("quote", quote),
        ("block", block),
        ("with", with),
        ("variable", variable),
        ("function", function),
        ("set", set),
        ("if", if_),
        ("while", while_),
    ];
    forms
        .into_iter()
        .map(|(name, form)| (rodeo.get_or_intern(name), form))
        .collect()
}

fn expect_name<'e>(form: &'static str, expr: &'e Expr) -> Result<&'e str, CompileError> {
    expr.as_name().ok_or(CompileError::Expected {
        form,
        expected: "name",
        got: expr.kind(),
    })
}

/// `(quote datum)`
fn quote(compiler: &mut Compiler<'_, '_>, args: &[Expr]) -> Result<(), CompileError> {
    CompileError::check_args("quote", args, 1, Some(1))?;
    let value = Value::from_expr(compiler.mc, compiler.rodeo, &args[0]);
    compiler.emit_constant(value)
}

/// `(block expr+)`
fn block(compiler: &mut Compiler<'_, '_>, args: &[Expr]) -> Result<(), CompileError> {
    compiler.compile_block("block", args)
}

/// `(with (name init ...) body+)`
///
/// Each initializer sees the bindings before it, but not its own.
fn with(compiler: &mut Compiler<'_, '_>, args: &[Expr]) -> Result<(), CompileError> {
    CompileError::check_args("with", args, 2, None)?;
    let bindings = args[0].as_form().ok_or(CompileError::Expected {
        form: "with",
        expected: "binding list",
        got: args[0].kind(),
    })?;
    if bindings.len() % 2 != 0 {
        return Err(CompileError::Expected {
            form: "with",
            expected: "name and initializer pairs",
            got: "an unpaired name",
        });
    }

    compiler.scoped(|compiler| {
        for pair in bindings.chunks(2) {
            let name = expect_name("with", &pair[0])?;
            compiler.compile(&pair[1])?;
            let name = compiler.intern(name);
            let storage = compiler.declare(name);
            compiler.store(storage.into())?;
        }
        compiler.compile_block("with", &args[1..])
    })
}

/// `(variable name init)`
fn variable(compiler: &mut Compiler<'_, '_>, args: &[Expr]) -> Result<(), CompileError> {
    CompileError::check_args("variable", args, 2, Some(2))?;
    let name = expect_name("variable", &args[0])?;
    compiler.compile(&args[1])?;
    let name = compiler.intern(name);
    let storage = compiler.declare(name);
    compiler.store(storage.into())?;
    compiler.load(storage.into())
}

/// `(function [name] (param ...) body+)`
///
/// The name is bound in the enclosing scope before the body is compiled,
/// so the body can refer to the function itself.
fn function(compiler: &mut Compiler<'_, '_>, args: &[Expr]) -> Result<(), CompileError> {
    let (name, rest) = match args.split_first() {
        Some((Expr::Name(name), rest)) => (Some(name), rest),
        _ => (None, args),
    };
    CompileError::check_args("function", rest, 2, None)?;
    let param_list = rest[0].as_form().ok_or(CompileError::Expected {
        form: "function",
        expected: "parameter list",
        got: rest[0].kind(),
    })?;

    let mut params = Vec::with_capacity(param_list.len());
    for param in param_list {
        let param_name = expect_name("function", param)?;
        let param = compiler.intern(param_name);
        if params.contains(&param) {
            return Err(CompileError::Duplicate {
                form: "function",
                name: Box::from(param_name),
            });
        }
        params.push(param);
    }

    let name = name.map(|name| compiler.intern(name));
    let binding = name.map(|name| compiler.declare(name));
    compiler.compile_function(name, &params, &rest[1..])?;
    if let Some(storage) = binding {
        compiler.store(storage.into())?;
        compiler.load(storage.into())?;
    }
    Ok(())
}

/// `(set name expr)`
fn set(compiler: &mut Compiler<'_, '_>, args: &[Expr]) -> Result<(), CompileError> {
    CompileError::check_args("set", args, 2, Some(2))?;
    let access = compiler.resolve(expect_name("set", &args[0])?)?;
    compiler.compile(&args[1])?;
    compiler.store(access)?;
    compiler.load(access)
}

/// `(if test then [else])`
fn if_(compiler: &mut Compiler<'_, '_>, args: &[Expr]) -> Result<(), CompileError> {
    CompileError::check_args("if", args, 2, Some(3))?;
    compiler.compile(&args[0])?;
    let otherwise = compiler.code().emit_forward_branch(Opcode::BranchIfFalse);
    compiler.compile(&args[1])?;
    let done = compiler.code().emit_forward_branch(Opcode::Branch);
    compiler.code().patch_branch(otherwise)?;
    match args.get(2) {
        Some(alternative) => compiler.compile(alternative)?,
        None => compiler.emit_constant(Value::Nil)?,
    }
    compiler.code().patch_branch(done)?;
    Ok(())
}

/// `(while test body+)`, always nil
fn while_(compiler: &mut Compiler<'_, '_>, args: &[Expr]) -> Result<(), CompileError> {
    CompileError::check_args("while", args, 2, None)?;
    let start = compiler.code().len();
    compiler.compile(&args[0])?;
    let exit = compiler.code().emit_forward_branch(Opcode::BranchIfFalse);
    compiler.compile_block("while", &args[1..])?;
    compiler.emit(Opcode::Drop, 0)?;
    compiler.code().emit_branch_to(Opcode::Branch, start)?;
    compiler.code().patch_branch(exit)?;
    compiler.emit_constant(Value::Nil)
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};

    use crate::compiler::{bytecode::Opcode, tests::compile, CompileError};

    #[test]
    fn block_drops_all_but_the_last_value() {
        for k in 1..=4 {
            let source = format!("(block {})", vec!["1"; k].join(" "));
            let_assert!(Ok((code, _)) = compile(&source));
            check!(code.count(Opcode::Drop) == k - 1);
        }
        let_assert!(Err(CompileError::TooFew { form: "block" }) = compile("(block)"));
    }

    #[test]
    fn with_initializers_see_earlier_bindings_only() {
        check!(compile("(with (a 1 b (+ a 1)) b)").is_ok());
        let_assert!(Err(CompileError::Unbound(name)) = compile("(with (a (+ a 1)) a)"));
        check!(&*name == "a");
        let_assert!(Err(CompileError::Unbound(_)) = compile("(with (a b b 1) a)"));
    }

    #[test]
    fn with_bindings_do_not_escape() {
        let_assert!(Err(CompileError::Unbound(_)) = compile("(with (a 1) a) a"));
    }

    #[test]
    fn with_shapes() {
        let_assert!(Err(CompileError::TooFew { form: "with" }) = compile("(with (a 1))"));
        let_assert!(Err(CompileError::Expected { .. }) = compile("(with (a) a)"));
        let_assert!(Err(CompileError::Expected { got: "integer", .. }) = compile("(with (1 1) 1)"));
    }

    #[test]
    fn quote_does_not_compile_its_argument() {
        let_assert!(Ok((code, _)) = compile("(quote (nowhere to be found))"));
        check!(code.to_string() == "0000 GLOBAL 1\n0001 RET\n");
        let_assert!(Err(CompileError::TooMany { form: "quote" }) = compile("(quote a b)"));
    }

    #[test]
    fn variable_yields_the_bound_value() {
        let_assert!(Ok((code, _)) = compile("(variable x 5)"));
        check!(code.to_string() == "0000 GLOBAL 1\n0001 SET_GLOBAL 2\n0002 GLOBAL 2\n0003 RET\n");
        let_assert!(Ok((_, segment)) = compile("(function () (variable x 5))"));
        check!(segment.to_string().contains("SET_LOCAL 0\n0002 LOCAL 0"));
    }

    #[test]
    fn recursion_in_the_defining_scope_is_direct() {
        let_assert!(Ok((code, segment)) = compile("(function f (n) (f n))"));
        check!(segment.count(Opcode::Foreign) == 0);
        check!(segment.count(Opcode::Global) == 1);
        check!(code.count(Opcode::SetGlobal) == 1);

        // inside another function the body reaches `f` as a foreign, but
        // the defining body calls it through a local
        let_assert!(Ok((_, segment)) = compile("(function () (block (function f (n) (f n)) (f 1)))"));
        check!(segment.count(Opcode::Foreign) == 1);
        check!(segment.to_string().contains("0009 LOCAL 0\n0010 CALL 1"));
    }

    #[test]
    fn function_shapes() {
        let_assert!(
            Err(CompileError::Duplicate { name, .. }) = compile("(function (a a) a)")
        );
        check!(&*name == "a");
        let_assert!(Err(CompileError::TooFew { form: "function" }) = compile("(function f (a))"));
        let_assert!(
            Err(CompileError::Expected { expected: "parameter list", .. }) = compile("(function f 1 2)")
        );
    }

    #[test]
    fn set_needs_a_binding() {
        let_assert!(Err(CompileError::Unbound(_)) = compile("(set nope 1)"));
        let_assert!(Ok((code, _)) = compile("(variable x 1) (set x 2)"));
        check!(code.count(Opcode::SetGlobal) == 1);
    }

    #[test]
    fn if_branches_past_the_consequent() {
        let_assert!(Ok((code, _)) = compile("(if 1 2 3)"));
        check!(
            code.to_string()
                == "0000 GLOBAL 1\n\
                    0001 BRANCH_IF_FALSE +3 ; -> 0004\n\
                    0002 GLOBAL 2\n\
                    0003 BRANCH +2 ; -> 0005\n\
                    0004 GLOBAL 3\n\
                    0005 RET\n"
        );
    }

    #[test]
    fn while_loops_back_to_the_test() {
        let_assert!(Ok((code, _)) = compile("(while 1 2)"));
        check!(
            code.to_string()
                == "0000 GLOBAL 1\n\
                    0001 BRANCH_IF_FALSE +4 ; -> 0005\n\
                    0002 GLOBAL 2\n\
                    0003 DROP\n\
                    0004 BRANCH -4 ; -> 0000\n\
                    0005 GLOBAL 3\n\
                    0006 RET\n"
        );
    }
}
