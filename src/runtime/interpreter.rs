//! The bytecode evaluator.
//!
//! One evaluation stack holds the arguments, locals and temporaries of every
//! active frame. Frames only exist as the `(pc, base, function)` triples
//! saved on the call stack when a bytecode function is entered.

use gc_arena::{Collect, Gc, Mutation, RefLock};
use lasso::Rodeo;

use crate::{
    compiler::bytecode::{decode_offset, Code, Opcode},
    world::{
        fuel::Fuel,
        value::{Cell, Value},
    },
};

use super::{Capture, Lambda, Procedure, RuntimeError};

/// A slot of the evaluation stack.
///
/// Locals start out direct and get promoted to a shared cell the first
/// time a closure captures them.
#[derive(Collect, Clone, Copy)]
#[collect(no_drop)]
pub enum Slot<'gc> {
    Direct(Value<'gc>),
    Captured(Cell<'gc>),
}

impl<'gc> Slot<'gc> {
    pub fn get(&self) -> Value<'gc> {
        match self {
            Self::Direct(value) => *value,
            Self::Captured(cell) => *cell.borrow(),
        }
    }

    pub fn set(&mut self, mc: &Mutation<'gc>, value: Value<'gc>) {
        match self {
            Self::Direct(slot) => *slot = value,
            Self::Captured(cell) => *cell.borrow_mut(mc) = value,
        }
    }
}

/// A caller's registers, saved while a callee runs.
#[derive(Collect, Clone, Copy)]
#[collect(no_drop)]
pub struct Frame<'gc> {
    pub pc: usize,
    pub base: usize,
    // None while running top-level code
    pub function: Option<Gc<'gc, Lambda<'gc>>>,
}

/// Machine state that can reach values, rooted in the arena.
#[derive(Collect, Default)]
#[collect(no_drop)]
pub struct State<'gc> {
    /// append-only, shared by the compiler for constants and module bindings
    pub globals: Vec<Value<'gc>>,
    pub stack: Vec<Slot<'gc>>,
    pub calls: Vec<Frame<'gc>>,
}

impl<'gc> State<'gc> {
    pub fn with_capacity(globals: usize, stack: usize, calls: usize) -> Self {
        Self {
            globals: Vec::with_capacity(globals),
            stack: Vec::with_capacity(stack),
            calls: Vec::with_capacity(calls),
        }
    }
}

/// Bounds on a single evaluation.
#[derive(Debug, Clone, Default)]
pub struct Limits {
    pub fuel: Option<Fuel>,
    /// bytecode frames on the call stack
    pub max_call_depth: Option<usize>,
    /// direct calls from native code, each of which recurses on the host
    /// stack
    pub max_native_depth: Option<usize>,
}

/// What entering a procedure produced.
enum Entry<'gc> {
    /// a native procedure already ran
    Returned(Value<'gc>),
    /// a bytecode frame is set up and waiting to run
    Frame {
        offset: usize,
        base: usize,
        lambda: Gc<'gc, Lambda<'gc>>,
    },
}

/// Everything the evaluator (and native code it calls) works with during
/// one mutation of the arena.
pub struct Context<'a, 'gc> {
    pub mc: &'a Mutation<'gc>,
    pub rodeo: &'a mut Rodeo,
    state: &'a mut State<'gc>,
    segment: &'a Code,
    toplevel: &'a Code,
    limits: Limits,
    // direct calls currently running on the host stack
    nested: usize,
}

impl<'a, 'gc> Context<'a, 'gc> {
    pub fn new(
        mc: &'a Mutation<'gc>,
        rodeo: &'a mut Rodeo,
        state: &'a mut State<'gc>,
        segment: &'a Code,
        toplevel: &'a Code,
        limits: Limits,
    ) -> Self {
        Self {
            mc,
            rodeo,
            state,
            segment,
            toplevel,
            limits,
            nested: 0,
        }
    }

    pub fn stack_height(&self) -> usize {
        self.state.stack.len()
    }

    pub fn call_depth(&self) -> usize {
        self.state.calls.len()
    }

    /// The shared code segment bytecode functions run from.
    pub fn segment(&self) -> &Code {
        self.segment
    }

    /// The `argc` arguments of the running native procedure, in order.
    pub fn arguments(&self, argc: usize) -> Vec<Value<'gc>> {
        let start = self.state.stack.len() - argc;
        self.state.stack[start..].iter().map(Slot::get).collect()
    }

    /// Runs the top-level code to completion.
    ///
    /// On success the result is also left on the evaluation stack, one slot
    /// above where it was on entry. On failure both stacks are unwound to
    /// their heights on entry.
    pub fn execute(&mut self) -> Result<Value<'gc>, RuntimeError> {
        let (stack_height, call_height) = (self.state.stack.len(), self.state.calls.len());
        let result = self.run(0, stack_height, None);
        if let Err(error) = &result {
            tracing::debug!(%error, stack_height, call_height, "evaluation failed, unwinding");
            self.unwind(stack_height, call_height);
        }
        result
    }

    /// Calls any procedure with the given arguments and runs it to
    /// completion. This is how native code calls back into the evaluator.
    ///
    /// Whatever happens, both stacks are back at their heights on entry
    /// when this returns.
    pub fn call(
        &mut self,
        callee: Value<'gc>,
        args: &[Value<'gc>],
    ) -> Result<Value<'gc>, RuntimeError> {
        let (stack_height, call_height) = (self.state.stack.len(), self.state.calls.len());
        self.state
            .stack
            .extend(args.iter().copied().map(Slot::Direct));

        self.nested += 1;
        let entry = self
            .check_native_depth()
            .and_then(|()| self.enter(callee, args.len()));
        let result = match entry {
            Ok(Entry::Returned(value)) => Ok(value),
            Ok(Entry::Frame {
                offset,
                base,
                lambda,
            }) => self.run(offset, base, Some(lambda)),
            Err(error) => Err(error),
        };
        self.nested -= 1;

        if let Err(error) = &result {
            tracing::debug!(%error, "direct call failed, unwinding");
            self.unwind(stack_height, call_height);
        } else {
            self.state.stack.truncate(stack_height);
        }
        result
    }

    fn unwind(&mut self, stack_height: usize, call_height: usize) {
        self.state.stack.truncate(stack_height);
        self.state.calls.truncate(call_height);
    }

    fn push(&mut self, value: Value<'gc>) {
        self.state.stack.push(Slot::Direct(value));
    }

    fn pop(&mut self) -> Value<'gc> {
        match self.state.stack.pop() {
            Some(slot) => slot.get(),
            None => panic!("evaluation stack underflow"),
        }
    }

    fn tick(&mut self) -> Result<(), RuntimeError> {
        if let Some(fuel) = &mut self.limits.fuel {
            if !fuel.should_continue() {
                return Err(RuntimeError::OutOfFuel);
            }
            fuel.consume(1);
        }
        Ok(())
    }

    fn check_depth(&self) -> Result<(), RuntimeError> {
        match self.limits.max_call_depth {
            Some(max) if self.state.calls.len() >= max => Err(RuntimeError::CallDepthExceeded(max)),
            _ => Ok(()),
        }
    }

    fn check_native_depth(&self) -> Result<(), RuntimeError> {
        match self.limits.max_native_depth {
            Some(max) if self.nested > max => Err(RuntimeError::NativeDepthExceeded(max)),
            _ => Ok(()),
        }
    }

    /// Dispatches a call of `callee` with `argc` arguments on the stack.
    fn enter(&mut self, callee: Value<'gc>, argc: usize) -> Result<Entry<'gc>, RuntimeError> {
        let Value::Procedure(procedure) = callee else {
            return Err(RuntimeError::NotCallable {
                kind: callee.type_name(),
            });
        };

        match procedure {
            Procedure::Native(native) => {
                if !native.arity.is_satisfied(argc) {
                    return Err(RuntimeError::Arity {
                        name: native.name.clone(),
                        expected: native.arity,
                        got: argc,
                    });
                }
                let start = self.state.stack.len() - argc;
                let callback = native.callback.clone();
                let value = callback.call(self, argc)?;
                self.state.stack.truncate(start);
                Ok(Entry::Returned(value))
            }
            Procedure::Code(lambda) => {
                self.check_depth()?;
                let template = lambda.template;
                assert!(lambda.is_instantiated(), "calling an uninstantiated template");
                if template.params != argc {
                    return Err(RuntimeError::Arity {
                        name: match template.name {
                            Some(name) => Box::from(self.rodeo.resolve(&name.0)),
                            None => Box::from("#<procedure>"),
                        },
                        expected: procedure.arity(),
                        got: argc,
                    });
                }
                let extra = template.locals - template.params;
                self.state
                    .stack
                    .extend(std::iter::repeat(Slot::Direct(Value::Nil)).take(extra));
                let base = self.state.stack.len() - template.locals;
                Ok(Entry::Frame {
                    offset: template.offset,
                    base,
                    lambda,
                })
            }
        }
    }

    /// Gets (or makes) the cell behind the stack slot at `index`.
    fn capture(&mut self, index: usize) -> Cell<'gc> {
        let slot = &mut self.state.stack[index];
        match *slot {
            Slot::Captured(cell) => cell,
            Slot::Direct(value) => {
                let cell = Gc::new(self.mc, RefLock::new(value));
                *slot = Slot::Captured(cell);
                cell
            }
        }
    }

    fn instantiate(
        &mut self,
        base: usize,
        function: Option<Gc<'gc, Lambda<'gc>>>,
        constant: usize,
    ) -> Value<'gc> {
        let Value::Procedure(Procedure::Code(template)) = self.state.globals[constant] else {
            panic!("CLOSURE over global {constant}, which is not a function template");
        };
        let foreigns = &template.template.foreigns;
        if foreigns.is_empty() {
            return Value::Procedure(Procedure::Code(template));
        }

        let mut cells = Vec::with_capacity(foreigns.len());
        for foreign in foreigns {
            cells.push(match foreign.source {
                Capture::Local(slot) => self.capture(base + slot),
                Capture::Foreign(index) => match function {
                    Some(function) => function.cells[index],
                    None => unreachable!("top-level code has no foreign cells"),
                },
            });
        }
        tracing::debug!(
            offset = template.template.offset,
            cells = cells.len(),
            "instantiated closure"
        );
        Value::Procedure(Procedure::Code(Gc::new(
            self.mc,
            Lambda {
                template: template.template,
                cells,
            },
        )))
    }

    fn foreign(function: Option<Gc<'gc, Lambda<'gc>>>, index: usize) -> Cell<'gc> {
        match function {
            Some(function) => function.cells[index],
            None => unreachable!("top-level code has no foreign cells"),
        }
    }

    /// The evaluator loop. Runs until the frame it was started in returns.
    fn run(
        &mut self,
        mut pc: usize,
        mut base: usize,
        mut function: Option<Gc<'gc, Lambda<'gc>>>,
    ) -> Result<Value<'gc>, RuntimeError> {
        let floor = self.state.calls.len();
        let mc = self.mc;

        loop {
            self.tick()?;
            let code = match function {
                Some(_) => self.segment,
                None => self.toplevel,
            };
            let (op, arg) = code.fetch(pc);
            let op = op.unwrap_or_else(|raw| panic!("unknown opcode {raw} at {pc}"));
            tracing::trace!(pc, base, %op, arg);

            let here = pc;
            pc += 1;
            let slot = arg as usize;

            match op {
                Opcode::Drop => {
                    self.pop();
                }
                Opcode::Local => {
                    let value = self.state.stack[base + slot].get();
                    self.push(value);
                }
                Opcode::SetLocal => {
                    let value = self.pop();
                    self.state.stack[base + slot].set(mc, value);
                }
                Opcode::Foreign => {
                    let value = *Self::foreign(function, slot).borrow();
                    self.push(value);
                }
                Opcode::SetForeign => {
                    let value = self.pop();
                    *Self::foreign(function, slot).borrow_mut(mc) = value;
                }
                Opcode::Global => {
                    let value = self.state.globals[slot];
                    self.push(value);
                }
                Opcode::SetGlobal => {
                    let value = self.pop();
                    self.state.globals[slot] = value;
                }
                Opcode::Closure => {
                    let value = self.instantiate(base, function, slot);
                    self.push(value);
                }
                Opcode::Call => {
                    let callee = self.pop();
                    match self.enter(callee, slot)? {
                        Entry::Returned(value) => self.push(value),
                        Entry::Frame {
                            offset,
                            base: callee_base,
                            lambda,
                        } => {
                            self.state.calls.push(Frame { pc, base, function });
                            pc = offset;
                            base = callee_base;
                            function = Some(lambda);
                        }
                    }
                }
                Opcode::Ret => {
                    let locals = function.map_or(0, |function| function.template.locals);
                    let height = self.state.stack.len() - base;
                    assert_eq!(
                        height,
                        locals + 1,
                        "unbalanced stack on return at {here}"
                    );
                    let value = self.pop();
                    self.state.stack.truncate(base);
                    self.push(value);

                    if self.state.calls.len() == floor {
                        return Ok(value);
                    }
                    let Some(frame) = self.state.calls.pop() else {
                        unreachable!("call stack below its floor");
                    };
                    pc = frame.pc;
                    base = frame.base;
                    function = frame.function;
                }
                Opcode::Branch => {
                    pc = jump(here, arg);
                }
                Opcode::BranchIfFalse => {
                    if !self.pop().is_truthy() {
                        pc = jump(here, arg);
                    }
                }
            }
        }
    }
}

fn jump(from: usize, arg: u32) -> usize {
    from.checked_add_signed(decode_offset(arg) as isize)
        .unwrap_or_else(|| panic!("branch at {from} jumps out of the code"))
}
