use std::{
    cell::RefCell,
    fmt::{Debug, Display},
    rc::Rc,
};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    bytecode::Chunk,
    vm::{natives::NativeFn, RuntimeError},
};

/// An interned string. Two `Str`s with the same content produced by the same
/// [`Strings`] table are the same allocation.
pub type Str = Rc<str>;

#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Boolean(bool),
    Number(f64),
    String(Str),
    Function(Rc<Function>),
    Closure(Rc<Closure>),
    Native(Rc<NativeFunction>),
    Class(Rc<Class>),
    Instance(Rc<Instance>),
    BoundMethod(Rc<BoundMethod>),
    Enum(Rc<Enum>),
}

pub const NIL: Value = Value::Nil;
pub const TRUE: Value = Value::Boolean(true);
pub const FALSE: Value = Value::Boolean(false);

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::BoundMethod(a), Value::BoundMethod(b)) => Rc::ptr_eq(a, b),
            (Value::Enum(a), Value::Enum(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Value {
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Boolean(false))
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Closure(_) | Value::Native(_) | Value::Class(_) | Value::BoundMethod(_)
        )
    }

    /// Name of the built-in type, as matched by `catch` clauses.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "Nil",
            Value::Boolean(_) => "Boolean",
            Value::Number(_) => "Number",
            Value::String(_) => "String",
            Value::Function(_)
            | Value::Closure(_)
            | Value::Native(_)
            | Value::BoundMethod(_) => "Function",
            Value::Class(_) => "Class",
            Value::Instance(_) => "Instance",
            Value::Enum(_) => "Enum",
        }
    }

    /// Whether this value is an instance of `class` or of one of its subclasses.
    pub fn is_instance_of(&self, class: &Class) -> bool {
        match self {
            Value::Instance(instance) => instance
                .class
                .ancestors()
                .any(|ancestor| std::ptr::eq(ancestor.as_ref(), class)),
            _ => false,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Function(function) => write!(f, "{}", function),
            Value::Closure(closure) => write!(f, "{}", closure.function),
            Value::Native(native) => write!(f, "<native fn {}>", native.name),
            Value::Class(class) => write!(f, "{}", class.name),
            Value::Instance(instance) => write!(f, "<{} instance>", instance.class.name),
            Value::BoundMethod(bound) => write!(f, "{}", bound.method.function),
            Value::Enum(e) => write!(f, "<enum {}>", e.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueDescriptor {
    pub is_local: bool,
    pub index: u8,
}

pub struct Function {
    pub name: Option<Str>,
    pub arity: u8,
    pub chunk: Chunk,
    pub upvalues: Vec<UpvalueDescriptor>,
    pub origin: Str,
}

impl Function {
    pub fn new(
        name: Option<Str>,
        arity: u8,
        chunk: Chunk,
        upvalues: Vec<UpvalueDescriptor>,
        origin: Str,
    ) -> Self {
        Self {
            name,
            arity,
            chunk,
            upvalues,
            origin,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("script")
    }

    /// Disassembles this function and every function nested in its constants.
    pub fn disassemble_all(&self) -> String {
        let mut out = self.chunk.disassemble(self.display_name());
        for constant in self.chunk.constants() {
            if let Value::Function(nested) = constant {
                out.push_str(&nested.disassemble_all());
            }
        }
        out
    }

    /// Instruction execution counts for this function and its nested ones.
    pub fn profile_all(&self) -> String {
        let mut out = self.chunk.profile(self.display_name());
        for constant in self.chunk.constants() {
            if let Value::Function(nested) = constant {
                out.push_str(&nested.profile_all());
            }
        }
        out
    }
}

impl Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("upvalues", &self.upvalues)
            .field("code_len", &self.chunk.len())
            .finish()
    }
}

impl Display for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "<fn {}>", name),
            None => write!(f, "<script>"),
        }
    }
}

#[derive(Debug)]
pub enum Upvalue {
    /// Still lives on the operand stack at this slot.
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct Closure {
    pub function: Rc<Function>,
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
}

impl Closure {
    pub fn new(function: Rc<Function>) -> Self {
        Self {
            function,
            upvalues: Vec::new(),
        }
    }
}

pub struct NativeFunction {
    pub name: &'static str,
    /// `None` for natives that validate their own argument count.
    pub arity: Option<usize>,
    pub function: NativeFn,
}

impl Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// Operators a class may overload with an `operator` declaration.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl TryFrom<u8> for Operator {
    type Error = RuntimeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        const OPERATORS: [Operator; 10] = [
            Operator::Add,
            Operator::Subtract,
            Operator::Multiply,
            Operator::Divide,
            Operator::Modulo,
            Operator::Equal,
            Operator::Less,
            Operator::LessEqual,
            Operator::Greater,
            Operator::GreaterEqual,
        ];
        OPERATORS
            .get(value as usize)
            .copied()
            .ok_or(RuntimeError::UnknownOperator(value))
    }
}

pub struct Class {
    pub name: Str,
    pub is_final: bool,
    pub superclass: RefCell<Option<Rc<Class>>>,
    pub methods: RefCell<FxHashMap<Str, Rc<Closure>>>,
    pub static_methods: RefCell<FxHashMap<Str, Rc<Closure>>>,
    pub operators: RefCell<FxHashMap<Operator, Rc<Closure>>>,
}

impl Class {
    pub fn new(name: Str, is_final: bool) -> Self {
        Self {
            name,
            is_final,
            superclass: RefCell::new(None),
            methods: RefCell::default(),
            static_methods: RefCell::default(),
            operators: RefCell::default(),
        }
    }

    pub fn find_method(&self, name: &str) -> Option<Rc<Closure>> {
        self.methods.borrow().get(name).cloned()
    }

    pub fn find_static_method(&self, name: &str) -> Option<Rc<Closure>> {
        self.static_methods.borrow().get(name).cloned()
    }

    pub fn find_operator(&self, operator: Operator) -> Option<Rc<Closure>> {
        self.operators.borrow().get(&operator).cloned()
    }

    /// Copies the superclass's methods down so lookups never walk the chain.
    pub fn inherit(&self, superclass: &Rc<Class>) {
        self.methods.borrow_mut().extend(
            superclass
                .methods
                .borrow()
                .iter()
                .map(|(name, method)| (name.clone(), method.clone())),
        );
        self.static_methods.borrow_mut().extend(
            superclass
                .static_methods
                .borrow()
                .iter()
                .map(|(name, method)| (name.clone(), method.clone())),
        );
        self.operators.borrow_mut().extend(
            superclass
                .operators
                .borrow()
                .iter()
                .map(|(operator, method)| (*operator, method.clone())),
        );
        *self.superclass.borrow_mut() = Some(superclass.clone());
    }

    /// This class followed by each of its superclasses.
    pub fn ancestors(self: &Rc<Self>) -> impl Iterator<Item = Rc<Class>> {
        std::iter::successors(Some(self.clone()), |class| {
            class.superclass.borrow().clone()
        })
    }
}

impl Debug for Class {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field(
                "superclass",
                &self.superclass.borrow().as_ref().map(|c| c.name.clone()),
            )
            .field(
                "methods",
                &self.methods.borrow().keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

pub struct Instance {
    pub class: Rc<Class>,
    pub fields: RefCell<FxHashMap<Str, Value>>,
}

impl Instance {
    pub fn new(class: Rc<Class>) -> Self {
        Self {
            class,
            fields: RefCell::default(),
        }
    }
}

impl Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("class", &self.class.name)
            .field("fields", &self.fields)
            .finish()
    }
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Rc<Closure>,
}

#[derive(Debug)]
pub struct Enum {
    pub name: Str,
    pub values: RefCell<FxHashMap<Str, Value>>,
}

impl Enum {
    pub fn new(name: Str) -> Self {
        Self {
            name,
            values: RefCell::default(),
        }
    }
}

/// The string intern table. It only ever grows: strings stay interned for
/// as long as the table lives.
#[derive(Debug, Default)]
pub struct Strings {
    table: FxHashSet<Str>,
}

impl Strings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, s: &str) -> Str {
        if let Some(existing) = self.table.get(s) {
            return existing.clone();
        }
        let interned: Str = Rc::from(s);
        self.table.insert(interned.clone());
        interned
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
