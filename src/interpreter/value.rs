//! Runtime values of the KnitScript interpreter.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;

use indexmap::IndexMap;

use super::builtins::BuiltinFn;
use super::scope::FrameRef;
use crate::dsl::ast::Stmt;
use crate::error::KnitError;
use crate::knit_graph::LoopId;
use crate::knitout::{format_number, NeedleOp};
use crate::machine::{Bed, CarrierSet, Direction, Needle, SheetIdentifier};
use crate::settings::{MachinePosition, MachineType};

pub type ListRef = Rc<RefCell<Vec<Value>>>;
pub type DictRef = Rc<RefCell<IndexMap<Key, Value>>>;

/// Source text a function or statement came from, used to turn spans into
/// line numbers.
#[derive(Debug)]
pub struct Source {
    pub name: String,
    pub text: String,
    /// Directory searched first by `import`.
    pub dir: Option<PathBuf>,
}

impl Source {
    pub fn new(name: impl Into<String>, text: impl Into<String>, dir: Option<PathBuf>) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            text: text.into(),
            dir,
        })
    }

    pub fn line_of(&self, offset: usize) -> usize {
        crate::dsl::error::offset_to_line_col(&self.text, offset).0
    }
}

#[derive(Debug)]
pub struct Function {
    pub name: String,
    /// Parameter names with defaults evaluated at definition time.
    pub params: Vec<(String, Option<Value>)>,
    pub body: Rc<[Stmt]>,
    pub closure: FrameRef,
    pub source: Rc<Source>,
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub name: String,
}

#[derive(Debug)]
pub enum ModuleAttrs {
    Native(IndexMap<String, Value>),
    /// Globals of an imported `.ks` file.
    Script(FrameRef),
}

#[derive(Debug)]
pub struct Module {
    pub name: String,
    pub attrs: ModuleAttrs,
}

impl Module {
    pub fn get(&self, name: &str) -> Option<Value> {
        match &self.attrs {
            ModuleAttrs::Native(map) => map.get(name).cloned(),
            ModuleAttrs::Script(frame) => frame.borrow().get_own(name),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    /// Lists and tuples.
    List(ListRef),
    Dict(DictRef),
    Needle(Needle),
    Carrier(u32),
    CarrierSet(CarrierSet),
    Sheet(SheetIdentifier),
    Bed(Bed),
    Direction(Direction),
    Instruction(NeedleOp),
    Loop(LoopId),
    Machine,
    MachineType(MachineType),
    MachinePosition(MachinePosition),
    Function(Rc<Function>),
    Builtin(&'static BuiltinFn),
    Method(Rc<BoundMethod>),
    Module(Rc<Module>),
    Error(Rc<KnitError>),
}

/// Hashable form of a value, used for dict keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    None,
    Bool(bool),
    Int(i64),
    /// Bit pattern of a non-integral float.
    Float(u64),
    Str(Rc<str>),
    Needle(Needle),
    Carrier(u32),
    CarrierSet(CarrierSet),
    Sheet(SheetIdentifier),
    Bed(Bed),
    Direction(Direction),
    Loop(LoopId),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn dict(entries: IndexMap<Key, Value>) -> Value {
        Value::Dict(Rc::new(RefCell::new(entries)))
    }

    pub fn needles(needles: impl IntoIterator<Item = Needle>) -> Value {
        Value::list(needles.into_iter().map(Value::Needle).collect())
    }

    /// Name reported by `type()` and in type errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Needle(_) => "Needle",
            Value::Carrier(_) => "Carrier",
            Value::CarrierSet(_) => "Carrier_Set",
            Value::Sheet(_) => "Sheet_Identifier",
            Value::Bed(_) => "Bed",
            Value::Direction(_) => "Direction",
            Value::Instruction(_) => "Instruction",
            Value::Loop(_) => "Loop",
            Value::Machine => "Machine",
            Value::MachineType(_) => "Machine_Type",
            Value::MachinePosition(_) => "Machine_Position",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin",
            Value::Method(_) => "method",
            Value::Module(_) => "module",
            Value::Error(_) => "Exception",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            Value::Dict(d) => !d.borrow().is_empty(),
            Value::CarrierSet(c) => !c.is_empty(),
            _ => true,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_) | Value::Bool(_))
    }

    pub fn as_f64(&self) -> Result<f64, KnitError> {
        match self {
            Value::Int(i) => Ok(*i as f64),
            Value::Float(f) => Ok(*f),
            Value::Bool(b) => Ok(f64::from(u8::from(*b))),
            other => Err(KnitError::type_error(format!(
                "expected a number, got {} {}",
                other.type_name(),
                other.repr()
            ))),
        }
    }

    /// Integer value; integral floats are accepted.
    pub fn as_int(&self) -> Result<i64, KnitError> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Bool(b) => Ok(i64::from(*b)),
            Value::Float(f) if f.fract() == 0.0 => Ok(*f as i64),
            other => Err(KnitError::type_error(format!(
                "expected an integer, got {} {}",
                other.type_name(),
                other.repr()
            ))),
        }
    }

    pub fn as_i32(&self) -> Result<i32, KnitError> {
        let v = self.as_int()?;
        i32::try_from(v).map_err(|_| KnitError::value(format!("{v} is out of range")))
    }

    pub fn as_str(&self) -> Result<Rc<str>, KnitError> {
        match self {
            Value::Str(s) => Ok(s.clone()),
            other => Err(KnitError::type_error(format!(
                "expected a string, got {}",
                other.type_name()
            ))),
        }
    }

    /// Values a `for` loop or comprehension walks over. Lists are
    /// snapshotted so the body may mutate them.
    pub fn iterate(&self) -> Result<Vec<Value>, KnitError> {
        match self {
            Value::List(l) => Ok(l.borrow().clone()),
            Value::Dict(d) => Ok(d.borrow().keys().cloned().map(Value::from_key).collect()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
            Value::CarrierSet(c) => Ok(c.ids().iter().map(|id| Value::Carrier(*id)).collect()),
            other => Err(KnitError::type_error(format!(
                "cannot iterate over {} {}",
                other.type_name(),
                other.repr()
            ))),
        }
    }

    pub fn to_key(&self) -> Result<Key, KnitError> {
        Ok(match self {
            Value::None => Key::None,
            Value::Bool(b) => Key::Bool(*b),
            Value::Int(i) => Key::Int(*i),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Key::Int(*f as i64),
            Value::Float(f) => Key::Float(f.to_bits()),
            Value::Str(s) => Key::Str(s.clone()),
            Value::Needle(n) => Key::Needle(*n),
            Value::Carrier(c) => Key::Carrier(*c),
            Value::CarrierSet(c) => Key::CarrierSet(c.clone()),
            Value::Sheet(s) => Key::Sheet(*s),
            Value::Bed(b) => Key::Bed(*b),
            Value::Direction(d) => Key::Direction(*d),
            Value::Loop(l) => Key::Loop(*l),
            other => {
                return Err(KnitError::type_error(format!(
                    "unhashable type: {}",
                    other.type_name()
                )))
            }
        })
    }

    pub fn from_key(key: Key) -> Value {
        match key {
            Key::None => Value::None,
            Key::Bool(b) => Value::Bool(b),
            Key::Int(i) => Value::Int(i),
            Key::Float(bits) => Value::Float(f64::from_bits(bits)),
            Key::Str(s) => Value::Str(s),
            Key::Needle(n) => Value::Needle(n),
            Key::Carrier(c) => Value::Carrier(c),
            Key::CarrierSet(c) => Value::CarrierSet(c),
            Key::Sheet(s) => Value::Sheet(s),
            Key::Bed(b) => Value::Bed(b),
            Key::Direction(d) => Value::Direction(d),
            Key::Loop(l) => Value::Loop(l),
        }
    }

    /// Quoted form used inside containers.
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => format!("'{s}'"),
            other => other.to_string(),
        }
    }

    /// Structural equality with numeric coercion (`1 == 1.0 == True`).
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_numeric() && b.is_numeric() => match (a, b) {
                (Value::Int(x), Value::Int(y)) => x == y,
                _ => a.as_f64().ok() == b.as_f64().ok(),
            },
            (Value::None, Value::None) | (Value::Machine, Value::Machine) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                Rc::ptr_eq(a, b) || {
                    let (a, b) = (a.borrow(), b.borrow());
                    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(y))
                }
            }
            (Value::Dict(a), Value::Dict(b)) => {
                Rc::ptr_eq(a, b) || {
                    let (a, b) = (a.borrow(), b.borrow());
                    a.len() == b.len()
                        && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| v.equals(w)))
                }
            }
            (Value::Needle(a), Value::Needle(b)) => a == b,
            (Value::Carrier(a), Value::Carrier(b)) => a == b,
            (Value::CarrierSet(a), Value::CarrierSet(b)) => a == b,
            (Value::Carrier(a), Value::CarrierSet(b)) | (Value::CarrierSet(b), Value::Carrier(a)) => {
                b.ids() == [*a]
            }
            (Value::Sheet(a), Value::Sheet(b)) => a == b,
            (Value::Bed(a), Value::Bed(b)) => a == b,
            (Value::Direction(a), Value::Direction(b)) => a == b,
            (Value::Instruction(a), Value::Instruction(b)) => a == b,
            (Value::Loop(a), Value::Loop(b)) => a == b,
            (Value::MachineType(a), Value::MachineType(b)) => a == b,
            (Value::MachinePosition(a), Value::MachinePosition(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => std::ptr::eq(*a, *b),
            (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
            (Value::Error(a), Value::Error(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Identity for `is`: same object for containers, equality otherwise.
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::None, Value::None) => true,
            (Value::None, _) | (_, Value::None) => false,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Bool(_), _) | (_, Value::Bool(_)) => false,
            _ => self.equals(other),
        }
    }

    /// Ordering for `<`, `sorted`, `min` and `max`.
    pub fn compare(&self, other: &Value) -> Result<Ordering, KnitError> {
        match (self, other) {
            (a, b) if a.is_numeric() && b.is_numeric() => {
                if let (Value::Int(x), Value::Int(y)) = (a, b) {
                    return Ok(x.cmp(y));
                }
                let (x, y) = (a.as_f64()?, b.as_f64()?);
                x.partial_cmp(&y)
                    .ok_or_else(|| KnitError::value("cannot order NaN"))
            }
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (Value::Needle(a), Value::Needle(b)) => Ok(a
                .position
                .cmp(&b.position)
                .then(a.bed.cmp(&b.bed))
                .then(a.is_slider.cmp(&b.is_slider))),
            (Value::Carrier(a), Value::Carrier(b)) => Ok(a.cmp(b)),
            (Value::Sheet(a), Value::Sheet(b)) => Ok(a.sheet.cmp(&b.sheet)),
            (Value::Loop(a), Value::Loop(b)) => Ok(a.cmp(b)),
            (Value::List(a), Value::List(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.compare(y)?;
                    if ord != Ordering::Equal {
                        return Ok(ord);
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            (a, b) => Err(KnitError::type_error(format!(
                "cannot compare {} with {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }
}

fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format_number(f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => f.write_str(&format_float(*x)),
            Value::Str(s) => f.write_str(s),
            Value::List(items) => {
                let parts: Vec<String> = items.borrow().iter().map(Value::repr).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Value::Dict(entries) => {
                let parts: Vec<String> = entries
                    .borrow()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", Value::from_key(k.clone()).repr(), v.repr()))
                    .collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            Value::Needle(n) => write!(f, "{n}"),
            Value::Carrier(c) => write!(f, "c{c}"),
            Value::CarrierSet(c) => write!(f, "{c}"),
            Value::Sheet(s) => write!(f, "{s}"),
            Value::Bed(b) => write!(f, "{b}"),
            Value::Direction(d) => write!(f, "{d}"),
            Value::Instruction(op) => write!(f, "{op}"),
            Value::Loop(l) => write!(f, "{l}"),
            Value::Machine => f.write_str("<machine>"),
            Value::MachineType(t) => write!(f, "{t}"),
            Value::MachinePosition(p) => write!(f, "{p}"),
            Value::Function(func) => write!(f, "<function {}>", func.name),
            Value::Builtin(b) => write!(f, "<builtin {}>", b.name),
            Value::Method(m) => write!(f, "<method {} of {}>", m.name, m.receiver.type_name()),
            Value::Module(m) => write!(f, "<module {}>", m.name),
            Value::Error(e) => write!(f, "{}: {}", e.kind, e.message),
        }
    }
}
