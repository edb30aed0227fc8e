mod frame;
pub(crate) mod natives;
mod stack;

use std::{cell::RefCell, io::Write, rc::Rc, time::Instant};

use rustc_hash::FxHashMap;

use crate::{
    bytecode::{OpCode, OpCodeFromU8Error, NO_ADDRESS},
    compiler::{self, CompileError},
    config::Config,
    object::{
        BoundMethod, Class, Closure, Enum, Function, Instance, NativeFunction, Operator, Str,
        Strings, Upvalue, Value, FALSE, NIL, TRUE,
    },
    source::SourceFile,
};

use self::{frame::CallFrame, natives::NativeFn, stack::Stack};

pub const FRAMES_MAX: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum InterpretError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("{error}\n{trace}")]
    Runtime { error: RuntimeError, trace: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Stack overflow.")]
    StackOverflow,
    #[error("Failed to read instruction: {0}")]
    InvalidOpCode(#[from] OpCodeFromU8Error),
    #[error("Unknown operator {0}.")]
    UnknownOperator(u8),
    #[error("Expected {expected} arguments but got {got}.")]
    ArityMismatch { expected: usize, got: usize },
    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(Str),
    #[error("Operands must be numbers.")]
    OperandsMustBeNumbers,
    #[error("Operand must be a number.")]
    OperandMustBeNumber,
    #[error("Operands must be integers.")]
    OperandsMustBeIntegers,
    #[error("Can only call functions and classes, not {0}.")]
    NotCallable(&'static str),
    #[error("Only instances have properties.")]
    OnlyInstancesHaveProperties,
    #[error("Only instances have fields.")]
    OnlyInstancesHaveFields,
    #[error("Only instances have methods.")]
    OnlyInstancesHaveMethods,
    #[error("Undefined property '{0}'.")]
    UndefinedProperty(Str),
    #[error("Superclass must be a class.")]
    SuperclassMustBeClass,
    #[error("Cannot inherit from final class '{0}'.")]
    FinalSuperclass(Str),
    #[error("Right operand of 'is' must be a class.")]
    IsRequiresClass,
    #[error("Uncaught {0}")]
    Uncaught(String),
    #[error("{0}")]
    AssertionFailed(String),
    #[error("{name}: {message}")]
    NativeArgument { name: &'static str, message: String },
    #[error("Failed to write output")]
    Io(#[from] std::io::Error),
}

/// An installed `try` block.
#[derive(Debug)]
struct ExceptionHandler {
    frame_count: usize,
    stack_len: usize,
    /// Type name matched by the `catch` clause and where the clause starts.
    catch: Option<(Str, usize)>,
    finally: Option<usize>,
}

pub struct Vm {
    config: Config,
    stack: Stack,
    frames: Vec<CallFrame>,
    globals: FxHashMap<Str, Value>,
    strings: Strings,
    /// Upvalues still pointing into the stack, ordered by slot.
    open_upvalues: Vec<(usize, Rc<RefCell<Upvalue>>)>,
    handlers: Vec<ExceptionHandler>,
    stdout: Rc<RefCell<dyn Write>>,
    init_string: Str,
    started: Instant,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(Rc::new(RefCell::new(std::io::stdout())))
    }
}

impl Vm {
    pub fn new(stdout: Rc<RefCell<dyn Write>>) -> Self {
        let mut strings = Strings::new();
        let init_string = strings.intern("init");
        let mut vm = Self {
            config: Config::default(),
            stack: Stack::new(),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: FxHashMap::default(),
            strings,
            open_upvalues: Vec::new(),
            handlers: Vec::new(),
            stdout,
            init_string,
            started: Instant::now(),
        };
        natives::install(&mut vm);
        vm
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The intern table shared by everything this VM compiles and runs.
    pub fn strings_mut(&mut self) -> &mut Strings {
        &mut self.strings
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn interpret(&mut self, source: &SourceFile) -> Result<(), InterpretError> {
        let function = compiler::compile(source, &mut self.strings)?;
        if self.config.print_code {
            print!("{}", function.disassemble_all());
        }
        self.execute(function)
    }

    /// Runs an already compiled top-level function.
    pub fn execute(&mut self, function: Rc<Function>) -> Result<(), InterpretError> {
        self.reset();
        log::debug!("Running {}", function.origin);

        let result = self.start(Rc::new(Closure::new(function.clone())));

        if self.config.profile {
            print!("{}", function.profile_all());
        }

        match result {
            Ok(()) => {
                log::debug!("Finished {}", function.origin);
                Ok(())
            }
            Err(error) => {
                log::debug!("Halted {}: {}", function.origin, error);
                Err(InterpretError::Runtime {
                    error,
                    trace: self.stack_trace(),
                })
            }
        }
    }

    fn start(&mut self, script: Rc<Closure>) -> Result<(), RuntimeError> {
        self.stack.push(Value::Closure(script.clone()))?;
        self.call(script, 0)?;
        self.run()
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.handlers.clear();
    }

    pub(crate) fn define_native(&mut self, name: &'static str, arity: Option<usize>, function: NativeFn) {
        let native = NativeFunction {
            name,
            arity,
            function,
        };
        let name = self.strings.intern(name);
        self.globals.insert(name, Value::Native(Rc::new(native)));
    }

    fn stack_trace(&self) -> String {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let function = &frame.closure.function;
                format!(
                    "{}:{} - {}()",
                    function.origin,
                    frame.line(),
                    function.display_name()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn frame(&self) -> &CallFrame {
        self.frames
            .last()
            .expect("VM should always have a frame while running")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames
            .last_mut()
            .expect("VM should always have a frame while running")
    }

    fn read_byte(&mut self) -> u8 {
        self.frame_mut().read_byte()
    }

    fn read_short(&mut self) -> u16 {
        self.frame_mut().read_short()
    }

    fn read_constant(&mut self) -> Value {
        self.frame_mut().read_constant()
    }

    fn read_string(&mut self) -> Str {
        match self.read_constant() {
            Value::String(name) => name,
            other => unreachable!("Expected a string constant, found {}", other),
        }
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.config.trace_execution {
                println!("{}", self.stack);
                let frame = self.frame();
                let mut instruction = String::new();
                frame.chunk().disassemble_instruction(frame.ip, &mut instruction);
                print!("{}", instruction);
            }
            if self.config.profile {
                let frame = self.frame();
                frame.chunk().record_execution(frame.ip);
            }

            match OpCode::try_from(self.read_byte())? {
                OpCode::Constant => {
                    let constant = self.read_constant();
                    self.stack.push(constant)?;
                }
                OpCode::Nil => self.stack.push(NIL)?,
                OpCode::True => self.stack.push(TRUE)?,
                OpCode::False => self.stack.push(FALSE)?,
                OpCode::Pop => {
                    self.stack.pop();
                }
                OpCode::DupTop => {
                    let value = self.stack.peek(0).clone();
                    self.stack.push(value)?;
                }
                OpCode::GetLocal => {
                    let index = self.read_byte() as usize;
                    let slot = self.frame().slots + index;
                    let value = self.stack.get(slot).clone();
                    self.stack.push(value)?;
                }
                OpCode::SetLocal => {
                    let index = self.read_byte() as usize;
                    let slot = self.frame().slots + index;
                    let value = self.stack.peek(0).clone();
                    self.stack.set(slot, value);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let Some(value) = self.globals.get(&name).cloned() else {
                        return Err(RuntimeError::UndefinedVariable(name));
                    };
                    self.stack.push(value)?;
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.stack.pop();
                    self.globals.insert(name, value);
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    if !self.globals.contains_key(&name) {
                        return Err(RuntimeError::UndefinedVariable(name));
                    }
                    let value = self.stack.peek(0).clone();
                    self.globals.insert(name, value);
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.frame().closure.upvalues[index].clone();
                    let value = match &*upvalue.borrow() {
                        Upvalue::Open(slot) => self.stack.get(*slot).clone(),
                        Upvalue::Closed(value) => value.clone(),
                    };
                    self.stack.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.frame().closure.upvalues[index].clone();
                    let value = self.stack.peek(0).clone();
                    let mut state = upvalue.borrow_mut();
                    match &mut *state {
                        Upvalue::Open(slot) => self.stack.set(*slot, value),
                        Upvalue::Closed(closed) => *closed = value,
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    self.get_property(name)?;
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let Value::Instance(instance) = self.stack.peek(1).clone() else {
                        return Err(RuntimeError::OnlyInstancesHaveFields);
                    };
                    let value = self.stack.pop();
                    instance.fields.borrow_mut().insert(name, value.clone());
                    self.stack.pop();
                    self.stack.push(value)?;
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop_class();
                    self.bind_method(&superclass, name)?;
                }
                OpCode::Equal => self.equality()?,
                OpCode::Greater => self.comparison(Operator::Greater, |a, b| a > b)?,
                OpCode::GreaterEqual => self.comparison(Operator::GreaterEqual, |a, b| a >= b)?,
                OpCode::Less => self.comparison(Operator::Less, |a, b| a < b)?,
                OpCode::LessEqual => self.comparison(Operator::LessEqual, |a, b| a <= b)?,
                OpCode::Add => {
                    if let (Value::String(a), Value::String(b)) =
                        (self.stack.peek(1), self.stack.peek(0))
                    {
                        let joined = self.strings.intern(&format!("{}{}", a, b));
                        self.stack.pop();
                        self.stack.pop();
                        self.stack.push(Value::String(joined))?;
                    } else {
                        self.arithmetic(Operator::Add, |a, b| a + b)?;
                    }
                }
                OpCode::Subtract => self.arithmetic(Operator::Subtract, |a, b| a - b)?,
                OpCode::Multiply => self.arithmetic(Operator::Multiply, |a, b| a * b)?,
                OpCode::Divide => self.arithmetic(Operator::Divide, |a, b| a / b)?,
                OpCode::Modulo => self.arithmetic(Operator::Modulo, |a, b| a % b)?,
                OpCode::Not => {
                    let value = self.stack.pop();
                    self.stack.push(Value::Boolean(value.is_falsey()))?;
                }
                OpCode::Negate => match self.stack.pop() {
                    Value::Number(n) => self.stack.push(Value::Number(-n))?,
                    _ => return Err(RuntimeError::OperandMustBeNumber),
                },
                OpCode::BitwiseNot => match self.stack.pop() {
                    Value::Number(n) if n.fract() == 0.0 => {
                        self.stack.push(Value::Number(!(n as i64) as f64))?
                    }
                    _ => return Err(RuntimeError::OperandsMustBeIntegers),
                },
                OpCode::BitwiseAnd => binary_integer_op(&mut self.stack, |a, b| a & b)?,
                OpCode::BitwiseOr => binary_integer_op(&mut self.stack, |a, b| a | b)?,
                OpCode::BitwiseXor => binary_integer_op(&mut self.stack, |a, b| a ^ b)?,
                OpCode::BitShiftLeft => {
                    binary_integer_op(&mut self.stack, |a, b| a.wrapping_shl(b as u32))?
                }
                OpCode::BitShiftRight => {
                    binary_integer_op(&mut self.stack, |a, b| a.wrapping_shr(b as u32))?
                }
                OpCode::Is => {
                    let Value::Class(class) = self.stack.pop() else {
                        return Err(RuntimeError::IsRequiresClass);
                    };
                    let value = self.stack.pop();
                    self.stack.push(Value::Boolean(value.is_instance_of(&class)))?;
                }
                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    if self.stack.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.stack.peek(arg_count).clone();
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    let superclass = self.pop_class();
                    self.invoke_from_class(&superclass, name, arg_count)?;
                }
                OpCode::Closure => {
                    let Value::Function(function) = self.read_constant() else {
                        unreachable!("Closure operand should be a function constant");
                    };
                    let mut upvalues = Vec::with_capacity(function.upvalues.len());
                    for _ in 0..function.upvalues.len() {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let slot = self.frame().slots + index;
                            self.capture_upvalue(slot)
                        } else {
                            self.frame().closure.upvalues[index].clone()
                        };
                        upvalues.push(upvalue);
                    }
                    self.stack
                        .push(Value::Closure(Rc::new(Closure { function, upvalues })))?;
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.stack.pop();
                }
                OpCode::Return => {
                    let result = self.stack.pop();
                    let frame = self
                        .frames
                        .pop()
                        .expect("VM should always have a frame while running");
                    self.close_upvalues(frame.slots);
                    while self
                        .handlers
                        .last()
                        .is_some_and(|handler| handler.frame_count > self.frames.len())
                    {
                        self.handlers.pop();
                    }
                    self.stack.truncate(frame.slots);
                    log::trace!(
                        "Returned from {} to depth {}",
                        frame.closure.function,
                        self.frames.len()
                    );

                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.stack.push(result)?;
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let is_final = self.read_byte() != 0;
                    self.stack
                        .push(Value::Class(Rc::new(Class::new(name, is_final))))?;
                }
                OpCode::Inherit => {
                    let Value::Class(superclass) = self.stack.peek(1).clone() else {
                        return Err(RuntimeError::SuperclassMustBeClass);
                    };
                    if superclass.is_final {
                        return Err(RuntimeError::FinalSuperclass(superclass.name.clone()));
                    }
                    let subclass = self.pop_class();
                    subclass.inherit(&superclass);
                }
                OpCode::Method => {
                    let name = self.read_string();
                    self.define_method(name, false);
                }
                OpCode::StaticMethod => {
                    let name = self.read_string();
                    self.define_method(name, true);
                }
                OpCode::DefineOperator => {
                    let operator = Operator::try_from(self.read_byte())?;
                    let method = self.pop_closure();
                    let Value::Class(class) = self.stack.peek(0) else {
                        unreachable!("Operators should be defined on a class");
                    };
                    class.operators.borrow_mut().insert(operator, method);
                }
                OpCode::Enum => {
                    let name = self.read_string();
                    self.stack.push(Value::Enum(Rc::new(Enum::new(name))))?;
                }
                OpCode::EnumValue => {
                    let name = self.read_string();
                    let value = self.stack.pop();
                    let Value::Enum(e) = self.stack.peek(0) else {
                        unreachable!("Enum values should be defined on an enum");
                    };
                    e.values.borrow_mut().insert(name, value);
                }
                OpCode::Throw => {
                    let exception = self.stack.pop();
                    self.throw(exception)?;
                }
                OpCode::PushExceptionHandler => {
                    let type_constant = self.read_byte();
                    let catch_address = self.read_short();
                    let finally_address = self.read_short();

                    let catch = if catch_address == NO_ADDRESS {
                        None
                    } else {
                        let Value::String(type_name) =
                            self.frame().chunk().get_constant(type_constant)
                        else {
                            unreachable!("Catch type should be a string constant");
                        };
                        Some((type_name, catch_address as usize))
                    };
                    let finally = (finally_address != NO_ADDRESS).then_some(finally_address as usize);

                    self.handlers.push(ExceptionHandler {
                        frame_count: self.frames.len(),
                        stack_len: self.stack.len(),
                        catch,
                        finally,
                    });
                }
                OpCode::PopExceptionHandler => {
                    self.handlers.pop();
                }
                OpCode::PropagateException => {
                    let rethrow = self.stack.pop();
                    let exception = self.stack.pop();
                    if !rethrow.is_falsey() {
                        self.throw(exception)?;
                    }
                }
                OpCode::Sentinel => unreachable!("Sentinel should be constructed in VM bytecode"),
            }
        }
    }

    fn pop_class(&mut self) -> Rc<Class> {
        match self.stack.pop() {
            Value::Class(class) => class,
            other => unreachable!("Expected a class on the stack, found {}", other),
        }
    }

    fn pop_closure(&mut self) -> Rc<Closure> {
        match self.stack.pop() {
            Value::Closure(closure) => closure,
            other => unreachable!("Expected a closure on the stack, found {}", other),
        }
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        match callee {
            Value::Closure(closure) => self.call(closure, arg_count),
            Value::BoundMethod(bound) => {
                self.stack.set_from_top(arg_count, bound.receiver.clone());
                self.call(bound.method.clone(), arg_count)
            }
            Value::Class(class) => {
                let instance = Value::Instance(Rc::new(Instance::new(class.clone())));
                self.stack.set_from_top(arg_count, instance);
                match class.find_method(&self.init_string) {
                    Some(initializer) => self.call(initializer, arg_count),
                    None if arg_count != 0 => Err(RuntimeError::ArityMismatch {
                        expected: 0,
                        got: arg_count,
                    }),
                    None => Ok(()),
                }
            }
            Value::Native(native) => {
                if let Some(arity) = native.arity {
                    if arity != arg_count {
                        return Err(RuntimeError::ArityMismatch {
                            expected: arity,
                            got: arg_count,
                        });
                    }
                }
                let args = self.stack.top(arg_count).to_vec();
                let result = (native.function)(self, &args)?;
                self.stack.truncate(self.stack.len() - arg_count - 1);
                self.stack.push(result)
            }
            other => Err(RuntimeError::NotCallable(other.type_name())),
        }
    }

    fn call(&mut self, closure: Rc<Closure>, arg_count: usize) -> Result<(), RuntimeError> {
        let arity = closure.function.arity as usize;
        if arg_count != arity {
            return Err(RuntimeError::ArityMismatch {
                expected: arity,
                got: arg_count,
            });
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(RuntimeError::StackOverflow);
        }

        log::trace!("Calling {} at depth {}", closure.function, self.frames.len());
        let slots = self.stack.len() - arg_count - 1;
        self.frames.push(CallFrame::new(closure, slots));
        Ok(())
    }

    fn invoke(&mut self, name: Str, arg_count: usize) -> Result<(), RuntimeError> {
        match self.stack.peek(arg_count).clone() {
            Value::Instance(instance) => {
                let field = instance.fields.borrow().get(&name).cloned();
                if let Some(value) = field {
                    self.stack.set_from_top(arg_count, value.clone());
                    return self.call_value(value, arg_count);
                }
                self.invoke_from_class(&instance.class, name, arg_count)
            }
            Value::Class(class) => match class.find_static_method(&name) {
                Some(method) => self.call(method, arg_count),
                None => Err(RuntimeError::UndefinedProperty(name)),
            },
            Value::Enum(e) => {
                let Some(value) = e.values.borrow().get(&name).cloned() else {
                    return Err(RuntimeError::UndefinedProperty(name));
                };
                self.stack.set_from_top(arg_count, value.clone());
                self.call_value(value, arg_count)
            }
            _ => Err(RuntimeError::OnlyInstancesHaveMethods),
        }
    }

    fn invoke_from_class(
        &mut self,
        class: &Class,
        name: Str,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        match class.find_method(&name) {
            Some(method) => self.call(method, arg_count),
            None => Err(RuntimeError::UndefinedProperty(name)),
        }
    }

    fn get_property(&mut self, name: Str) -> Result<(), RuntimeError> {
        let value = match self.stack.peek(0).clone() {
            Value::Instance(instance) => {
                let field = instance.fields.borrow().get(&name).cloned();
                match field {
                    Some(value) => value,
                    None => return self.bind_method(&instance.class, name),
                }
            }
            Value::Class(class) => match class.find_static_method(&name) {
                Some(method) => Value::BoundMethod(Rc::new(BoundMethod {
                    receiver: Value::Class(class),
                    method,
                })),
                None => return Err(RuntimeError::UndefinedProperty(name)),
            },
            Value::Enum(e) => match e.values.borrow().get(&name).cloned() {
                Some(value) => value,
                None => return Err(RuntimeError::UndefinedProperty(name)),
            },
            _ => return Err(RuntimeError::OnlyInstancesHaveProperties),
        };
        self.stack.pop();
        self.stack.push(value)
    }

    /// Replaces the receiver on top of the stack with `name` bound to it.
    fn bind_method(&mut self, class: &Class, name: Str) -> Result<(), RuntimeError> {
        let Some(method) = class.find_method(&name) else {
            return Err(RuntimeError::UndefinedProperty(name));
        };
        let receiver = self.stack.pop();
        self.stack
            .push(Value::BoundMethod(Rc::new(BoundMethod { receiver, method })))
    }

    fn define_method(&mut self, name: Str, is_static: bool) {
        let method = self.pop_closure();
        let Value::Class(class) = self.stack.peek(0) else {
            unreachable!("Methods should be defined on a class");
        };
        let table = if is_static {
            &class.static_methods
        } else {
            &class.methods
        };
        table.borrow_mut().insert(name, method);
    }

    /// Calls the left operand's overload of `operator`, if it has one.
    fn call_operator(&mut self, operator: Operator) -> Result<bool, RuntimeError> {
        let Value::Instance(instance) = self.stack.peek(1) else {
            return Ok(false);
        };
        let Some(method) = instance.class.find_operator(operator) else {
            return Ok(false);
        };
        self.call(method, 1)?;
        Ok(true)
    }

    fn number_operands(&self) -> Option<(f64, f64)> {
        match (self.stack.peek(1), self.stack.peek(0)) {
            (Value::Number(a), Value::Number(b)) => Some((*a, *b)),
            _ => None,
        }
    }

    fn arithmetic(&mut self, operator: Operator, op: fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        if let Some((a, b)) = self.number_operands() {
            self.stack.pop();
            self.stack.pop();
            return self.stack.push(Value::Number(op(a, b)));
        }
        if self.call_operator(operator)? {
            return Ok(());
        }
        Err(RuntimeError::OperandsMustBeNumbers)
    }

    fn comparison(&mut self, operator: Operator, op: fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        if let Some((a, b)) = self.number_operands() {
            self.stack.pop();
            self.stack.pop();
            return self.stack.push(Value::Boolean(op(a, b)));
        }
        if self.call_operator(operator)? {
            return Ok(());
        }
        Err(RuntimeError::OperandsMustBeNumbers)
    }

    fn equality(&mut self) -> Result<(), RuntimeError> {
        if self.call_operator(Operator::Equal)? {
            return Ok(());
        }
        let b = self.stack.pop();
        let a = self.stack.pop();
        self.stack.push(Value::Boolean(a == b))
    }

    fn capture_upvalue(&mut self, slot: usize) -> Rc<RefCell<Upvalue>> {
        match self
            .open_upvalues
            .binary_search_by_key(&slot, |(open, _)| *open)
        {
            Ok(index) => self.open_upvalues[index].1.clone(),
            Err(index) => {
                let upvalue = Rc::new(RefCell::new(Upvalue::Open(slot)));
                self.open_upvalues.insert(index, (slot, upvalue.clone()));
                upvalue
            }
        }
    }

    /// Closes every open upvalue at or above `last`.
    fn close_upvalues(&mut self, last: usize) {
        while let Some((slot, _)) = self.open_upvalues.last() {
            if *slot < last {
                break;
            }
            let Some((slot, upvalue)) = self.open_upvalues.pop() else {
                break;
            };
            log::trace!("Closing upvalue for slot {}", slot);
            *upvalue.borrow_mut() = Upvalue::Closed(self.stack.get(slot).clone());
        }
    }

    /// Transfers control to the innermost handler able to deal with
    /// `exception`, running `finally` blocks on the way out.
    fn throw(&mut self, exception: Value) -> Result<(), RuntimeError> {
        while let Some(handler) = self.handlers.pop() {
            let catch = handler
                .catch
                .as_ref()
                .filter(|(type_name, _)| exception_matches(&exception, type_name))
                .map(|(_, address)| *address);

            let (address, values) = match (catch, handler.finally) {
                (Some(address), finally) => {
                    // Keeps the finally block reachable if the catch body throws.
                    self.handlers.push(ExceptionHandler {
                        frame_count: handler.frame_count,
                        stack_len: handler.stack_len,
                        catch: None,
                        finally,
                    });
                    (address, vec![exception])
                }
                (None, Some(address)) => (address, vec![exception, TRUE]),
                (None, None) => continue,
            };

            self.close_upvalues(handler.stack_len);
            self.frames.truncate(handler.frame_count);
            self.stack.truncate(handler.stack_len);
            for value in values {
                self.stack.push(value)?;
            }
            self.frame_mut().ip = address;
            return Ok(());
        }

        Err(RuntimeError::Uncaught(describe_exception(&exception)))
    }
}

fn binary_integer_op(stack: &mut Stack, op: fn(i64, i64) -> i64) -> Result<(), RuntimeError> {
    let (Value::Number(a), Value::Number(b)) = (stack.peek(1), stack.peek(0)) else {
        return Err(RuntimeError::OperandsMustBeIntegers);
    };
    if a.fract() != 0.0 || b.fract() != 0.0 {
        return Err(RuntimeError::OperandsMustBeIntegers);
    }
    let result = op(*a as i64, *b as i64);
    stack.pop();
    stack.pop();
    stack.push(Value::Number(result as f64))
}

/// Whether a `catch (type_name)` clause handles `exception`.
fn exception_matches(exception: &Value, type_name: &str) -> bool {
    match exception {
        Value::Instance(instance) => {
            type_name == exception.type_name()
                || instance
                    .class
                    .ancestors()
                    .any(|class| &*class.name == type_name)
        }
        other => other.type_name() == type_name,
    }
}

fn describe_exception(exception: &Value) -> String {
    let Value::Instance(instance) = exception else {
        return exception.to_string();
    };
    match instance.fields.borrow().get("message") {
        Some(message) => format!("{}: {}", instance.class.name, message),
        None => instance.class.name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Chunk;

    fn run(source: &str) -> (Vm, Result<(), InterpretError>, String) {
        let output = Rc::new(RefCell::new(Vec::new()));
        let mut vm = Vm::new(output.clone());
        let result = vm.interpret(&SourceFile::new("test.cmt", source));
        let output = String::from_utf8(output.take()).unwrap();
        (vm, result, output)
    }

    fn runtime_error(result: Result<(), InterpretError>) -> RuntimeError {
        match result {
            Err(InterpretError::Runtime { error, .. }) => error,
            other => panic!("expected a runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_arithmetic() {
        let (_, result, output) = run("print(1 + 2 * 3 - 4 / 2)\nprint(7 % 3, ' ', -(2))");
        result.unwrap();
        assert_eq!(output, "5\n1 -2\n");
    }

    #[test]
    fn test_globals_survive_the_run() {
        let (vm, result, _) = run("var answer = 6 * 7");
        result.unwrap();
        assert_eq!(vm.global("answer"), Some(&Value::Number(42.0)));
        assert_eq!(vm.stack_depth(), 0);
        assert_eq!(vm.frame_count(), 0);
    }

    #[test]
    fn test_string_concatenation_is_interned() {
        let (mut vm, result, _) = run("var a = 'con' + 'cat'\nvar b = 'concat'");
        result.unwrap();
        let (Some(Value::String(a)), Some(Value::String(b))) = (vm.global("a"), vm.global("b"))
        else {
            panic!("both globals should be strings");
        };
        assert!(Rc::ptr_eq(a, b));
        let interned = vm.strings_mut().intern("concat");
        assert_eq!(vm.global("a"), Some(&Value::String(interned)));
    }

    #[test]
    fn test_bitwise() {
        let (_, result, output) = run("print(6 & 3, ' ', 6 | 3, ' ', 6 ^ 3, ' ', 1 << 4, ' ', 256 >> 2, ' ', ~0)");
        result.unwrap();
        assert_eq!(output, "2 7 5 16 64 -1\n");

        let (_, result, _) = run("print(1.5 & 1)");
        assert!(matches!(
            runtime_error(result),
            RuntimeError::OperandsMustBeIntegers
        ));
    }

    #[test]
    fn test_runtime_type_errors() {
        let (_, result, _) = run("1 + nil");
        assert!(matches!(runtime_error(result), RuntimeError::OperandsMustBeNumbers));

        let (_, result, _) = run("-'a'");
        assert!(matches!(runtime_error(result), RuntimeError::OperandMustBeNumber));

        let (_, result, _) = run("missing");
        assert!(matches!(runtime_error(result), RuntimeError::UndefinedVariable(name) if &*name == "missing"));

        let (_, result, _) = run("missing = 1");
        assert!(matches!(runtime_error(result), RuntimeError::UndefinedVariable(_)));

        let (_, result, _) = run("3()");
        assert!(matches!(runtime_error(result), RuntimeError::NotCallable("Number")));

        let (_, result, _) = run("function f(a) {\n}\nf(1, 2)");
        assert!(matches!(
            runtime_error(result),
            RuntimeError::ArityMismatch {
                expected: 1,
                got: 2
            }
        ));
    }

    #[test]
    fn test_stack_overflow_leaves_state_inspectable() {
        let (vm, result, _) = run("function f(n) {\n f(n + 1)\n}\nf(0)");
        assert!(matches!(runtime_error(result), RuntimeError::StackOverflow));
        assert_eq!(vm.frame_count(), FRAMES_MAX);
        // Script closure, two slots per frame of `f`, and the pending call.
        assert_eq!(vm.stack_depth(), 1 + 2 * (FRAMES_MAX - 1) + 2);
    }

    #[test]
    fn test_invalid_opcode() {
        let mut strings = Strings::new();
        let mut chunk = Chunk::new();
        chunk.add_bytecode(0xEEu8, 1);
        let function = Rc::new(Function::new(
            None,
            0,
            chunk,
            Vec::new(),
            strings.intern("bytes"),
        ));

        let mut vm = Vm::new(Rc::new(RefCell::new(Vec::new())));
        let error = runtime_error(vm.execute(function));
        assert!(matches!(
            error,
            RuntimeError::InvalidOpCode(OpCodeFromU8Error(0xEE))
        ));
    }

    #[test]
    fn test_runtime_error_trace() {
        let source = "function inner() {\nreturn nil + 1\n}\nfunction outer() {\ninner()\n}\nouter()";
        let (_, result, _) = run(source);
        let Err(InterpretError::Runtime { error, trace }) = result else {
            panic!("expected a runtime error");
        };
        assert!(matches!(error, RuntimeError::OperandsMustBeNumbers));
        assert_eq!(
            trace,
            "test.cmt:2 - inner()\ntest.cmt:5 - outer()\ntest.cmt:7 - script()"
        );
    }

    #[test]
    fn test_next_interpret_resets_after_error() {
        let output = Rc::new(RefCell::new(Vec::new()));
        let mut vm = Vm::new(output.clone());
        assert!(vm.interpret(&SourceFile::new("a", "var x = 1\nx()")).is_err());
        assert!(vm.stack_depth() > 0);

        vm.interpret(&SourceFile::new("b", "print(x)")).unwrap();
        assert_eq!(vm.stack_depth(), 0);
        assert_eq!(String::from_utf8(output.take()).unwrap(), "1\n");
    }

    #[test]
    fn test_natives() {
        let (_, result, output) = run("print(callable?(print), callable?(1))\nassert(clock() >= 0)");
        result.unwrap();
        assert_eq!(output, "truefalse\n");

        let (_, result, _) = run("assert(1 == 2, 'numbers differ')");
        assert!(matches!(
            runtime_error(result),
            RuntimeError::AssertionFailed(message) if message == "numbers differ"
        ));
    }

    #[test]
    fn test_uncaught_exception() {
        let (_, result, _) = run("class Oops {\n}\nthrow Oops()");
        assert!(matches!(
            runtime_error(result),
            RuntimeError::Uncaught(description) if description == "Oops"
        ));
    }

    #[test]
    fn test_exception_matches() {
        let mut strings = Strings::new();
        let base = Rc::new(Class::new(strings.intern("Error"), false));
        let derived = Rc::new(Class::new(strings.intern("IoError"), false));
        derived.inherit(&base);
        let exception = Value::Instance(Rc::new(Instance::new(derived)));

        assert!(exception_matches(&exception, "IoError"));
        assert!(exception_matches(&exception, "Error"));
        assert!(!exception_matches(&exception, "String"));
        assert!(exception_matches(&exception, "Instance"));
        assert!(exception_matches(&Value::String(strings.intern("x")), "String"));
        assert!(exception_matches(&Value::Number(1.0), "Number"));
    }
}
