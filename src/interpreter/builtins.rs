use std::cmp::Ordering;
use std::rc::Rc;

use indexmap::IndexMap;

use super::context::Context;
use super::value::{BoundMethod, Key, Value};
use crate::dsl::ast::BinOp;
use crate::error::KnitError;
use crate::knitout::cut_all_yarns;
use crate::machine::{Bed, Needle, SheetIdentifier};

/// What a builtin does when called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinOp {
    Print,
    Len,
    Range,
    Abs,
    Min,
    Max,
    Sum,
    Sorted,
    Reversed,
    Enumerate,
    Zip,
    Type,
    Str,
    Int,
    Float,
    Bool,
    List,
    Dict,
    Round,
    Isinstance,
    Any,
    All,
    Needle,
    Carrier,
    Sqrt,
    Floor,
    Ceil,
    Sin,
    Cos,
    Pow,
    Log,
    NeedleAt,
    DirectionSortedNeedles,
    LoopsToCurrentNeedles,
    CarrierById,
    CutActiveCarriers,
}

/// Built-in function: name, parameters and behavior in one entry.
///
/// Parameter names ending in `?` are optional; a leading `*` collects the
/// remaining positional arguments.
#[derive(Debug, Clone)]
pub struct BuiltinFn {
    pub name: &'static str,
    pub params: &'static [&'static str],
    pub op: BuiltinOp,
    pub category: &'static str,
    pub description: &'static str,
}

/// All built-in functions. `core` entries are global names; the rest are
/// reached through `import math`, `import needles` and `import carriers`.
pub static BUILTINS: &[BuiltinFn] = &[
    // ── Core ────────────────────────────────────────────────────
    BuiltinFn {
        name: "print", params: &["*values"],
        op: BuiltinOp::Print, category: "core", description: "Log values and leave them as a knitout comment",
    },
    BuiltinFn {
        name: "len", params: &["value"],
        op: BuiltinOp::Len, category: "core", description: "Number of items",
    },
    BuiltinFn {
        name: "range", params: &["start", "stop?", "step?"],
        op: BuiltinOp::Range, category: "core", description: "List of integers",
    },
    BuiltinFn {
        name: "abs", params: &["x"],
        op: BuiltinOp::Abs, category: "core", description: "Absolute value",
    },
    BuiltinFn {
        name: "min", params: &["*values"],
        op: BuiltinOp::Min, category: "core", description: "Smallest argument or item",
    },
    BuiltinFn {
        name: "max", params: &["*values"],
        op: BuiltinOp::Max, category: "core", description: "Largest argument or item",
    },
    BuiltinFn {
        name: "sum", params: &["iterable", "start?"],
        op: BuiltinOp::Sum, category: "core", description: "Sum of items",
    },
    BuiltinFn {
        name: "sorted", params: &["iterable", "key?", "reverse?"],
        op: BuiltinOp::Sorted, category: "core", description: "Sorted copy",
    },
    BuiltinFn {
        name: "reversed", params: &["iterable"],
        op: BuiltinOp::Reversed, category: "core", description: "Reversed copy",
    },
    BuiltinFn {
        name: "enumerate", params: &["iterable", "start?"],
        op: BuiltinOp::Enumerate, category: "core", description: "Index and item pairs",
    },
    BuiltinFn {
        name: "zip", params: &["*iterables"],
        op: BuiltinOp::Zip, category: "core", description: "Items paired across iterables",
    },
    BuiltinFn {
        name: "type", params: &["value"],
        op: BuiltinOp::Type, category: "core", description: "Type name of a value",
    },
    BuiltinFn {
        name: "str", params: &["value?"],
        op: BuiltinOp::Str, category: "core", description: "String conversion",
    },
    BuiltinFn {
        name: "int", params: &["value?"],
        op: BuiltinOp::Int, category: "core", description: "Integer conversion",
    },
    BuiltinFn {
        name: "float", params: &["value?"],
        op: BuiltinOp::Float, category: "core", description: "Float conversion",
    },
    BuiltinFn {
        name: "bool", params: &["value?"],
        op: BuiltinOp::Bool, category: "core", description: "Truth value",
    },
    BuiltinFn {
        name: "list", params: &["iterable?"],
        op: BuiltinOp::List, category: "core", description: "List of items",
    },
    BuiltinFn {
        name: "dict", params: &["entries?"],
        op: BuiltinOp::Dict, category: "core", description: "Dictionary from a dict or key-value pairs",
    },
    BuiltinFn {
        name: "round", params: &["x", "ndigits?"],
        op: BuiltinOp::Round, category: "core", description: "Round half to even",
    },
    BuiltinFn {
        name: "isinstance", params: &["value", "types"],
        op: BuiltinOp::Isinstance, category: "core", description: "Type test",
    },
    BuiltinFn {
        name: "any", params: &["iterable"],
        op: BuiltinOp::Any, category: "core", description: "True if any item is truthy",
    },
    BuiltinFn {
        name: "all", params: &["iterable"],
        op: BuiltinOp::All, category: "core", description: "True if every item is truthy",
    },
    BuiltinFn {
        name: "Needle", params: &["is_front", "position"],
        op: BuiltinOp::Needle, category: "core", description: "Needle at a position of the active sheet",
    },
    BuiltinFn {
        name: "Carrier", params: &["carrier_id"],
        op: BuiltinOp::Carrier, category: "core", description: "Carrier by id",
    },
    // ── math ────────────────────────────────────────────────────
    BuiltinFn {
        name: "sqrt", params: &["x"],
        op: BuiltinOp::Sqrt, category: "math", description: "Square root",
    },
    BuiltinFn {
        name: "floor", params: &["x"],
        op: BuiltinOp::Floor, category: "math", description: "Round down to an integer",
    },
    BuiltinFn {
        name: "ceil", params: &["x"],
        op: BuiltinOp::Ceil, category: "math", description: "Round up to an integer",
    },
    BuiltinFn {
        name: "sin", params: &["x"],
        op: BuiltinOp::Sin, category: "math", description: "Sine",
    },
    BuiltinFn {
        name: "cos", params: &["x"],
        op: BuiltinOp::Cos, category: "math", description: "Cosine",
    },
    BuiltinFn {
        name: "pow", params: &["base", "exp"],
        op: BuiltinOp::Pow, category: "math", description: "Power",
    },
    BuiltinFn {
        name: "log", params: &["x", "base?"],
        op: BuiltinOp::Log, category: "math", description: "Logarithm, natural by default",
    },
    // ── needles ─────────────────────────────────────────────────
    BuiltinFn {
        name: "needle", params: &["is_front", "index"],
        op: BuiltinOp::NeedleAt, category: "needles", description: "Needle at a physical position",
    },
    BuiltinFn {
        name: "direction_sorted_needles", params: &["needles", "direction", "racking?"],
        op: BuiltinOp::DirectionSortedNeedles, category: "needles",
        description: "Needles in the order a pass in the direction visits them",
    },
    BuiltinFn {
        name: "loops_to_current_needles", params: &[],
        op: BuiltinOp::LoopsToCurrentNeedles, category: "needles",
        description: "Dictionary from each held loop to the needle holding it",
    },
    // ── carriers ────────────────────────────────────────────────
    BuiltinFn {
        name: "carrier", params: &["carrier_id"],
        op: BuiltinOp::CarrierById, category: "carriers", description: "Carrier by id",
    },
    BuiltinFn {
        name: "cut_active_carriers", params: &[],
        op: BuiltinOp::CutActiveCarriers, category: "carriers",
        description: "Release the hook and cut every active carrier",
    },
];

/// Global builtin by name.
pub fn lookup_builtin(name: &str) -> Option<&'static BuiltinFn> {
    BUILTINS.iter().find(|b| b.category == "core" && b.name == name)
}

/// Builtins of a native module.
pub fn module_builtins(category: &str) -> impl Iterator<Item = &'static BuiltinFn> + '_ {
    BUILTINS.iter().filter(move |b| b.category == category)
}

const LIST_METHODS: &[&str] = &[
    "append", "extend", "pop", "insert", "index", "count", "remove", "reverse", "sort", "copy",
];
const DICT_METHODS: &[&str] = &["keys", "values", "items", "get", "pop", "update", "copy"];
const STR_METHODS: &[&str] = &[
    "upper", "lower", "split", "join", "strip", "startswith", "endswith", "format", "replace",
];
const NEEDLE_METHODS: &[&str] = &["offset"];

/// Arguments matched against a builtin's parameter list.
struct Bound {
    name: &'static str,
    slots: Vec<Option<Value>>,
    rest: Vec<Value>,
}

impl Bound {
    fn new(
        b: &'static BuiltinFn,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Self, KnitError> {
        let fixed: Vec<&str> = b
            .params
            .iter()
            .filter(|p| !p.starts_with('*'))
            .map(|p| p.trim_end_matches('?'))
            .collect();
        let variadic = b.params.iter().any(|p| p.starts_with('*'));
        let mut slots: Vec<Option<Value>> = vec![None; fixed.len()];
        let mut rest = Vec::new();
        for (i, v) in args.into_iter().enumerate() {
            match slots.get_mut(i) {
                Some(slot) => *slot = Some(v),
                None if variadic => rest.push(v),
                None => {
                    return Err(KnitError::type_error(format!(
                        "{}() takes at most {} arguments",
                        b.name,
                        fixed.len()
                    )))
                }
            }
        }
        for (k, v) in kwargs {
            let slot = fixed
                .iter()
                .position(|p| *p == k)
                .and_then(|i| slots.get_mut(i))
                .ok_or_else(|| {
                    KnitError::type_error(format!("{}() got an unexpected keyword argument {k}", b.name))
                })?;
            if slot.is_some() {
                return Err(KnitError::type_error(format!(
                    "{}() got multiple values for argument {k}",
                    b.name
                )));
            }
            *slot = Some(v);
        }
        let required = b.params.iter().filter(|p| !p.starts_with('*'));
        for (param, slot) in required.zip(&slots) {
            if slot.is_none() && !param.ends_with('?') {
                return Err(KnitError::type_error(format!(
                    "{}() missing required argument {param}",
                    b.name
                )));
            }
        }
        Ok(Self {
            name: b.name,
            slots,
            rest,
        })
    }

    fn req(&mut self, i: usize) -> Result<Value, KnitError> {
        self.opt(i)
            .ok_or_else(|| KnitError::type_error(format!("{}() missing an argument", self.name)))
    }

    fn opt(&mut self, i: usize) -> Option<Value> {
        self.slots.get_mut(i).and_then(Option::take)
    }
}

/// Positional arguments of a method call, checked against an arity range.
fn method_args(
    name: &str,
    args: Vec<Value>,
    kwargs: &[(String, Value)],
    min: usize,
    max: usize,
) -> Result<Vec<Value>, KnitError> {
    if let Some((k, _)) = kwargs.first() {
        return Err(KnitError::type_error(format!("{name}() got an unexpected keyword argument {k}")));
    }
    if args.len() < min || args.len() > max {
        return Err(KnitError::type_error(format!(
            "{name}() takes {} arguments but {} were given",
            if min == max { min.to_string() } else { format!("{min} to {max}") },
            args.len()
        )));
    }
    Ok(args)
}

fn first(args: Vec<Value>) -> Value {
    args.into_iter().next().unwrap_or(Value::None)
}

/// Sort with a fallible comparison, reporting the first failure.
fn sort_values(items: &mut [(Value, Value)], reverse: bool) -> Result<(), KnitError> {
    let mut failure = None;
    items.sort_by(|a, b| match a.0.compare(&b.0) {
        Ok(o) if reverse => o.reverse(),
        Ok(o) => o,
        Err(e) => {
            failure.get_or_insert(e);
            Ordering::Equal
        }
    });
    failure.map_or(Ok(()), Err)
}

fn extreme(values: Vec<Value>, want: Ordering, name: &str) -> Result<Value, KnitError> {
    let mut iter = values.into_iter();
    let mut best = iter
        .next()
        .ok_or_else(|| KnitError::value(format!("{name}() arg is an empty sequence")))?;
    for v in iter {
        if v.compare(&best)? == want {
            best = v;
        }
    }
    Ok(best)
}

fn parse_int(text: &str) -> Result<i64, KnitError> {
    text.trim()
        .parse()
        .map_err(|_| KnitError::value(format!("invalid literal for int(): '{text}'")))
}

fn to_carrier_id(v: &Value) -> Result<u32, KnitError> {
    match v {
        Value::Carrier(c) => Ok(*c),
        other => {
            let raw = other.as_int()?;
            u32::try_from(raw).map_err(|_| KnitError::value(format!("{raw} is not a carrier id")))
        }
    }
}

fn to_bed(v: &Value) -> Result<Bed, KnitError> {
    Ok(match v {
        Value::Bed(b) => *b,
        other if other.truthy() => Bed::Front,
        _ => Bed::Back,
    })
}

fn matches_type(value: &Value, ty: &Value) -> Result<bool, KnitError> {
    let name: Rc<str> = match ty {
        Value::Builtin(b) => Rc::from(b.name),
        Value::Str(s) => s.clone(),
        Value::List(items) => {
            for t in items.borrow().iter() {
                if matches_type(value, t)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        other => {
            return Err(KnitError::type_error(format!(
                "isinstance() arg 2 must be a type, got {}",
                other.type_name()
            )))
        }
    };
    let actual = value.type_name();
    Ok(actual == name.as_ref()
        || (name.as_ref() == "int" && actual == "bool")
        || (name.as_ref() == "Carrier" && actual == "Carrier_Set"))
}

fn format_string(template: &str, args: &[Value]) -> Result<String, KnitError> {
    let mut out = String::with_capacity(template.len());
    let mut next = 0usize;
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut field = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    field.push(c);
                }
                let index = if field.is_empty() {
                    next += 1;
                    next - 1
                } else {
                    field
                        .parse()
                        .map_err(|_| KnitError::key(format!("format field {{{field}}} is not positional")))?
                };
                let v = args
                    .get(index)
                    .ok_or_else(|| KnitError::index(format!("format index {index} is out of range")))?;
                out.push_str(&v.to_string());
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

impl Context {
    pub fn call_builtin(
        &mut self,
        b: &'static BuiltinFn,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, KnitError> {
        let mut a = Bound::new(b, args, kwargs)?;
        match b.op {
            BuiltinOp::Print => {
                let text: Vec<String> = a.rest.iter().map(ToString::to_string).collect();
                self.print_text(&text.join(" "));
                Ok(Value::None)
            }
            BuiltinOp::Len => {
                let v = a.req(0)?;
                let n = match &v {
                    Value::List(l) => l.borrow().len(),
                    Value::Dict(d) => d.borrow().len(),
                    Value::Str(s) => s.chars().count(),
                    Value::CarrierSet(c) => c.len(),
                    other => {
                        return Err(KnitError::type_error(format!(
                            "object of type '{}' has no len()",
                            other.type_name()
                        )))
                    }
                };
                Ok(Value::Int(i64::try_from(n).unwrap_or(i64::MAX)))
            }
            BuiltinOp::Range => {
                let first = a.req(0)?.as_int()?;
                let (start, stop) = match a.opt(1) {
                    Some(stop) => (first, stop.as_int()?),
                    None => (0, first),
                };
                let step = a.opt(2).map(|s| s.as_int()).transpose()?.unwrap_or(1);
                if step == 0 {
                    return Err(KnitError::value("range() arg 3 must not be zero"));
                }
                let mut out = Vec::new();
                let mut i = start;
                while (step > 0 && i < stop) || (step < 0 && i > stop) {
                    out.push(Value::Int(i));
                    i = match i.checked_add(step) {
                        Some(n) => n,
                        None => break,
                    };
                }
                Ok(Value::list(out))
            }
            BuiltinOp::Abs => match a.req(0)? {
                Value::Int(i) => Ok(Value::Int(
                    i.checked_abs().ok_or_else(|| KnitError::value("integer overflow"))?,
                )),
                Value::Bool(b) => Ok(Value::Int(i64::from(b))),
                other => Ok(Value::Float(other.as_f64()?.abs())),
            },
            BuiltinOp::Min | BuiltinOp::Max => {
                let values = if a.rest.len() == 1 {
                    first(std::mem::take(&mut a.rest)).iterate()?
                } else {
                    std::mem::take(&mut a.rest)
                };
                if b.op == BuiltinOp::Min {
                    extreme(values, Ordering::Less, b.name)
                } else {
                    extreme(values, Ordering::Greater, b.name)
                }
            }
            BuiltinOp::Sum => {
                let mut total = a.opt(1).unwrap_or(Value::Int(0));
                for v in a.req(0)?.iterate()? {
                    total = self.apply_binary(BinOp::Add, &total, &v)?;
                }
                Ok(total)
            }
            BuiltinOp::Sorted => {
                let items = a.req(0)?.iterate()?;
                let key = a.opt(1).filter(|k| !matches!(k, Value::None));
                let reverse = a.opt(2).is_some_and(|r| r.truthy());
                let mut pairs = Vec::with_capacity(items.len());
                for item in items {
                    let k = match &key {
                        Some(f) => self.call_value(f, vec![item.clone()], Vec::new())?,
                        None => item.clone(),
                    };
                    pairs.push((k, item));
                }
                sort_values(&mut pairs, reverse)?;
                Ok(Value::list(pairs.into_iter().map(|(_, v)| v).collect()))
            }
            BuiltinOp::Reversed => {
                let mut items = a.req(0)?.iterate()?;
                items.reverse();
                Ok(Value::list(items))
            }
            BuiltinOp::Enumerate => {
                let items = a.req(0)?.iterate()?;
                let start = a.opt(1).map(|s| s.as_int()).transpose()?.unwrap_or(0);
                Ok(Value::list(
                    (start..)
                        .zip(items)
                        .map(|(i, v)| Value::list(vec![Value::Int(i), v]))
                        .collect(),
                ))
            }
            BuiltinOp::Zip => {
                let columns = a
                    .rest
                    .iter()
                    .map(Value::iterate)
                    .collect::<Result<Vec<_>, _>>()?;
                let len = columns.iter().map(Vec::len).min().unwrap_or(0);
                let rows = (0..len)
                    .map(|i| Value::list(columns.iter().filter_map(|c| c.get(i).cloned()).collect()))
                    .collect();
                Ok(Value::list(rows))
            }
            BuiltinOp::Type => Ok(Value::str(a.req(0)?.type_name())),
            BuiltinOp::Str => Ok(Value::str(a.opt(0).map(|v| v.to_string()).unwrap_or_default())),
            BuiltinOp::Int => match a.opt(0) {
                None => Ok(Value::Int(0)),
                Some(Value::Float(f)) => {
                    if !f.is_finite() {
                        return Err(KnitError::value(format!("cannot convert {f} to integer")));
                    }
                    Ok(Value::Int(f.trunc() as i64))
                }
                Some(Value::Str(s)) => Ok(Value::Int(parse_int(&s)?)),
                Some(Value::Carrier(c)) => Ok(Value::Int(i64::from(c))),
                Some(v) => Ok(Value::Int(v.as_int()?)),
            },
            BuiltinOp::Float => match a.opt(0) {
                None => Ok(Value::Float(0.0)),
                Some(Value::Str(s)) => s
                    .trim()
                    .parse()
                    .map(Value::Float)
                    .map_err(|_| KnitError::value(format!("could not convert string to float: '{s}'"))),
                Some(v) => Ok(Value::Float(v.as_f64()?)),
            },
            BuiltinOp::Bool => Ok(Value::Bool(a.opt(0).is_some_and(|v| v.truthy()))),
            BuiltinOp::List => match a.opt(0) {
                None => Ok(Value::list(Vec::new())),
                Some(v) => Ok(Value::list(v.iterate()?)),
            },
            BuiltinOp::Dict => match a.opt(0) {
                None => Ok(Value::dict(IndexMap::new())),
                Some(Value::Dict(d)) => Ok(Value::dict(d.borrow().clone())),
                Some(v) => {
                    let mut map = IndexMap::new();
                    for pair in v.iterate()? {
                        let parts = pair.iterate()?;
                        let [k, v] = <[Value; 2]>::try_from(parts).map_err(|_| {
                            KnitError::value("dictionary update sequence element must have length 2")
                        })?;
                        map.insert(k.to_key()?, v);
                    }
                    Ok(Value::dict(map))
                }
            },
            BuiltinOp::Round => {
                let x = a.req(0)?;
                match a.opt(1).filter(|n| !matches!(n, Value::None)) {
                    None => {
                        if let Value::Int(i) = x {
                            return Ok(Value::Int(i));
                        }
                        let r = x.as_f64()?.round_ties_even();
                        if !r.is_finite() {
                            return Err(KnitError::value(format!("cannot round {r} to an integer")));
                        }
                        Ok(Value::Int(r as i64))
                    }
                    Some(n) => {
                        let scale = 10f64.powi(n.as_i32()?);
                        Ok(Value::Float((x.as_f64()? * scale).round_ties_even() / scale))
                    }
                }
            }
            BuiltinOp::Isinstance => {
                let v = a.req(0)?;
                let ty = a.req(1)?;
                Ok(Value::Bool(matches_type(&v, &ty)?))
            }
            BuiltinOp::Any => Ok(Value::Bool(a.req(0)?.iterate()?.iter().any(Value::truthy))),
            BuiltinOp::All => Ok(Value::Bool(a.req(0)?.iterate()?.iter().all(Value::truthy))),
            BuiltinOp::Needle => {
                let bed = to_bed(&a.req(0)?)?;
                let pos = a.req(1)?.as_i32()?;
                Ok(Value::Needle(self.sheet_needle(bed, pos, false)?))
            }
            BuiltinOp::Carrier | BuiltinOp::CarrierById => {
                let id = to_carrier_id(&a.req(0)?)?;
                self.machine.carrier_system.get(id)?;
                Ok(Value::Carrier(id))
            }
            BuiltinOp::Sqrt => {
                let x = a.req(0)?.as_f64()?;
                if x < 0.0 {
                    return Err(KnitError::value("math domain error"));
                }
                Ok(Value::Float(x.sqrt()))
            }
            BuiltinOp::Floor => Ok(Value::Int(a.req(0)?.as_f64()?.floor() as i64)),
            BuiltinOp::Ceil => Ok(Value::Int(a.req(0)?.as_f64()?.ceil() as i64)),
            BuiltinOp::Sin => Ok(Value::Float(a.req(0)?.as_f64()?.sin())),
            BuiltinOp::Cos => Ok(Value::Float(a.req(0)?.as_f64()?.cos())),
            BuiltinOp::Pow => {
                let base = a.req(0)?.as_f64()?;
                Ok(Value::Float(base.powf(a.req(1)?.as_f64()?)))
            }
            BuiltinOp::Log => {
                let x = a.req(0)?.as_f64()?;
                if x <= 0.0 {
                    return Err(KnitError::value("math domain error"));
                }
                match a.opt(1) {
                    Some(base) => Ok(Value::Float(x.ln() / base.as_f64()?.ln())),
                    None => Ok(Value::Float(x.ln())),
                }
            }
            BuiltinOp::NeedleAt => {
                let bed = to_bed(&a.req(0)?)?;
                let pos = a.req(1)?.as_i32()?;
                Ok(Value::Needle(Needle::new(bed, pos)))
            }
            BuiltinOp::DirectionSortedNeedles => {
                let needles = a
                    .req(0)?
                    .iterate()?
                    .into_iter()
                    .map(|v| match v {
                        Value::Needle(n) => Ok(n),
                        other => Err(KnitError::type_error(format!(
                            "expected needles but got {}",
                            other.repr()
                        ))),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let direction = match a.req(1)? {
                    Value::Direction(d) => d,
                    other => {
                        return Err(KnitError::type_error(format!(
                            "expected a direction but got {}",
                            other.repr()
                        )))
                    }
                };
                let rack = match a.opt(2) {
                    Some(r) => r.as_i32()?,
                    None => self.machine.rack(),
                };
                Ok(Value::needles(direction.sorted_needles(needles, rack)))
            }
            BuiltinOp::LoopsToCurrentNeedles => {
                let mut map = IndexMap::new();
                let mut needles = self.machine.all_loops();
                needles.extend(self.machine.all_slider_loops());
                for n in needles {
                    for l in self.machine.loops(&n) {
                        map.insert(Key::Loop(*l), Value::Needle(n));
                    }
                }
                Ok(Value::dict(map))
            }
            BuiltinOp::CutActiveCarriers => {
                let lines = cut_all_yarns(&mut self.machine)?;
                self.knitout.extend(lines);
                self.machine_scope
                    .set_carrier(&mut self.machine, &mut self.knitout, None)?;
                Ok(Value::None)
            }
        }
    }

    /// `receiver.name(args)`
    pub fn call_method(
        &mut self,
        receiver: &Value,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, KnitError> {
        match (receiver, name) {
            (Value::List(list), _) if LIST_METHODS.contains(&name) => {
                self.list_method(list, name, args, kwargs)
            }
            (Value::Dict(dict), _) if DICT_METHODS.contains(&name) => {
                let args = method_args(name, args, &kwargs, 0, 2)?;
                dict_method(dict, name, args)
            }
            (Value::Str(s), _) if STR_METHODS.contains(&name) => {
                let args = method_args(name, args, &kwargs, 0, usize::MAX)?;
                str_method(s, name, &args)
            }
            (Value::Needle(_), "offset") => {
                let n = first(method_args(name, args, &kwargs, 1, 1)?);
                self.apply_binary(BinOp::Add, receiver, &n)
            }
            _ => {
                let attr = self.get_attribute(receiver, name)?;
                if !matches!(
                    attr,
                    Value::Function(_) | Value::Builtin(_) | Value::Method(_)
                ) && args.is_empty()
                    && kwargs.is_empty()
                {
                    // Zero-argument accessors such as `n.opposite()`.
                    return Ok(attr);
                }
                self.call_value(&attr, args, kwargs)
            }
        }
    }

    fn list_method(
        &mut self,
        list: &super::value::ListRef,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, KnitError> {
        if name == "sort" {
            let mut key = None;
            let mut reverse = false;
            for (k, v) in kwargs {
                match k.as_str() {
                    "key" => key = Some(v).filter(|v| !matches!(v, Value::None)),
                    "reverse" => reverse = v.truthy(),
                    other => {
                        return Err(KnitError::type_error(format!(
                            "sort() got an unexpected keyword argument {other}"
                        )))
                    }
                }
            }
            method_args(name, args, &[], 0, 0)?;
            let items = list.borrow().clone();
            let mut pairs = Vec::with_capacity(items.len());
            for item in items {
                let k = match &key {
                    Some(f) => self.call_value(f, vec![item.clone()], Vec::new())?,
                    None => item.clone(),
                };
                pairs.push((k, item));
            }
            sort_values(&mut pairs, reverse)?;
            *list.borrow_mut() = pairs.into_iter().map(|(_, v)| v).collect();
            return Ok(Value::None);
        }
        let (min, max) = match name {
            "append" | "extend" | "index" | "count" | "remove" => (1, 1),
            "insert" => (2, 2),
            "pop" => (0, 1),
            _ => (0, 0),
        };
        let mut args = method_args(name, args, &kwargs, min, max)?.into_iter();
        let mut arg = || args.next().unwrap_or(Value::None);
        match name {
            "append" => {
                list.borrow_mut().push(arg());
                Ok(Value::None)
            }
            "extend" => {
                let items = arg().iterate()?;
                list.borrow_mut().extend(items);
                Ok(Value::None)
            }
            "pop" => {
                let mut items = list.borrow_mut();
                let index = match arg() {
                    Value::None => -1,
                    v => v.as_int()?,
                };
                if items.is_empty() {
                    return Err(KnitError::index("pop from empty list"));
                }
                let i = super::eval::sequence_index(index, items.len())?;
                Ok(items.remove(i))
            }
            "insert" => {
                let index = arg().as_int()?;
                let value = arg();
                let mut items = list.borrow_mut();
                let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
                let i = if index < 0 { (index + len).max(0) } else { index.min(len) };
                items.insert(usize::try_from(i).unwrap_or(0), value);
                Ok(Value::None)
            }
            "index" => {
                let target = arg();
                list.borrow()
                    .iter()
                    .position(|v| v.equals(&target))
                    .map(|i| Value::Int(i64::try_from(i).unwrap_or(i64::MAX)))
                    .ok_or_else(|| KnitError::value(format!("{} is not in list", target.repr())))
            }
            "count" => {
                let target = arg();
                let n = list.borrow().iter().filter(|v| v.equals(&target)).count();
                Ok(Value::Int(i64::try_from(n).unwrap_or(i64::MAX)))
            }
            "remove" => {
                let target = arg();
                let mut items = list.borrow_mut();
                let i = items
                    .iter()
                    .position(|v| v.equals(&target))
                    .ok_or_else(|| KnitError::value(format!("{} is not in list", target.repr())))?;
                items.remove(i);
                Ok(Value::None)
            }
            "reverse" => {
                list.borrow_mut().reverse();
                Ok(Value::None)
            }
            _ => Ok(Value::list(list.borrow().clone())),
        }
    }

    /// `obj.name`
    pub fn get_attribute(&self, obj: &Value, name: &str) -> Result<Value, KnitError> {
        let found = match obj {
            Value::Needle(n) => self.needle_attribute(n, name),
            Value::Carrier(id) => {
                let carrier = self.machine.carrier_system.get(*id)?;
                match name {
                    "carrier_id" | "id" => Some(Value::Int(i64::from(*id))),
                    "is_active" => Some(Value::Bool(carrier.is_active())),
                    "is_hooked" => Some(Value::Bool(carrier.is_hooked())),
                    "position" => Some(carrier.position.map_or(Value::None, |p| Value::Int(i64::from(p)))),
                    _ => None,
                }
            }
            Value::CarrierSet(cs) => match name {
                "carrier_ids" => Some(Value::list(
                    cs.ids().iter().map(|c| Value::Int(i64::from(*c))).collect(),
                )),
                _ => None,
            },
            Value::Machine => self.machine_attribute(name),
            Value::Sheet(s) => self.sheet_attribute(*s, name),
            Value::Loop(id) => {
                let l = self.machine.knit_graph.get(*id);
                match name {
                    "id" | "loop_id" => Some(Value::Int(i64::try_from(id.0).unwrap_or(i64::MAX))),
                    "yarn" => l
                        .and_then(|l| self.machine.knit_graph.yarn(l.yarn))
                        .map(|y| Value::Carrier(y.carrier)),
                    "parents" => l.map(|l| Value::list(l.parents.iter().map(|p| Value::Loop(*p)).collect())),
                    _ => None,
                }
            }
            Value::Error(e) => match name {
                "message" => Some(Value::str(&e.message)),
                "kind" => Some(Value::str(e.kind.family_name())),
                "line" => Some(e.line.map_or(Value::None, |l| {
                    Value::Int(i64::try_from(l).unwrap_or(i64::MAX))
                })),
                _ => None,
            },
            Value::Module(m) => m.get(name),
            Value::Bed(b) => match name {
                "is_front" => Some(Value::Bool(b.is_front())),
                "opposite" => Some(Value::Bed(b.opposite())),
                _ => None,
            },
            Value::Direction(d) => match name {
                "opposite" => Some(Value::Direction(d.opposite())),
                _ => None,
            },
            _ => None,
        };
        if let Some(v) = found {
            return Ok(v);
        }
        let is_method = match obj {
            Value::List(_) => LIST_METHODS.contains(&name),
            Value::Dict(_) => DICT_METHODS.contains(&name),
            Value::Str(_) => STR_METHODS.contains(&name),
            Value::Needle(_) => NEEDLE_METHODS.contains(&name),
            _ => false,
        };
        if is_method {
            return Ok(Value::Method(Rc::new(BoundMethod {
                receiver: obj.clone(),
                name: name.to_string(),
            })));
        }
        Err(KnitError::attribute(format!(
            "'{}' object has no attribute '{name}'",
            obj.type_name()
        )))
    }

    fn needle_attribute(&self, n: &Needle, name: &str) -> Option<Value> {
        let gauge = self.machine_scope.gauge();
        let int = |v: i32| Value::Int(i64::from(v));
        Some(match name {
            "position" => int(n.position),
            "sheet_position" => int(n.position.div_euclid(gauge)),
            "sheet" => int(n.position.rem_euclid(gauge)),
            "is_front" => Value::Bool(n.is_front()),
            "is_back" => Value::Bool(n.is_back()),
            "is_slider" => Value::Bool(n.is_slider),
            "bed" => Value::Bed(n.bed),
            "opposite" => Value::Needle(n.opposite()),
            "slider" => Value::Needle(n.with_slider(true)),
            "main_needle" => Value::Needle(n.main_needle()),
            "held_loops" | "loops" => {
                Value::list(self.machine.loops(n).iter().map(|l| Value::Loop(*l)).collect())
            }
            "has_loops" => Value::Bool(self.machine.has_loops(n)),
            _ => return None,
        })
    }

    fn machine_attribute(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.machine_scope.get_variable(name) {
            return Some(v);
        }
        let m = &self.machine;
        Some(match name {
            "width" | "needle_count" => Value::Int(i64::from(m.width())),
            "rack" => Value::Int(i64::from(m.rack())),
            "hook_position" => m
                .carrier_system
                .hook_position
                .map_or(Value::None, |p| Value::Int(i64::from(p))),
            "active_carriers" => Value::CarrierSet(m.carrier_system.active_carriers()),
            "hooked_carriers" => m
                .carrier_system
                .hooked_carriers()
                .cloned()
                .map_or(Value::None, Value::CarrierSet),
            "front_needles" => Value::needles(m.needles(Bed::Front, false)),
            "back_needles" => Value::needles(m.needles(Bed::Back, false)),
            "front_sliders" => Value::needles(m.needles(Bed::Front, true)),
            "back_sliders" => Value::needles(m.needles(Bed::Back, true)),
            "front_loops" => Value::needles(m.loaded_needles(Bed::Front, false)),
            "back_loops" => Value::needles(m.loaded_needles(Bed::Back, false)),
            "all_loops" => Value::needles(m.all_loops()),
            "all_slider_loops" => Value::needles(m.all_slider_loops()),
            _ => return None,
        })
    }

    fn sheet_attribute(&self, s: SheetIdentifier, name: &str) -> Option<Value> {
        let m = &self.machine;
        let on_sheet = |bed: Bed, slider: bool, loaded: bool| {
            let needles = if loaded {
                m.loaded_needles(bed, slider)
            } else {
                m.needles(bed, slider)
            };
            needles
                .into_iter()
                .filter(|n| n.position.rem_euclid(s.gauge) == s.sheet)
                .collect::<Vec<_>>()
        };
        let both = |slider: bool, loaded: bool| {
            let mut out = on_sheet(Bed::Front, slider, loaded);
            out.extend(on_sheet(Bed::Back, slider, loaded));
            out
        };
        Some(match name {
            "sheet" => Value::Int(i64::from(s.sheet)),
            "gauge" => Value::Int(i64::from(s.gauge)),
            "Needles" => Value::needles(both(false, false)),
            "Front_Needles" => Value::needles(on_sheet(Bed::Front, false, false)),
            "Back_Needles" => Value::needles(on_sheet(Bed::Back, false, false)),
            "Sliders" => Value::needles(both(true, false)),
            "Front_Sliders" => Value::needles(on_sheet(Bed::Front, true, false)),
            "Back_Sliders" => Value::needles(on_sheet(Bed::Back, true, false)),
            "Loops" => Value::needles(both(false, true)),
            "Front_Loops" => Value::needles(on_sheet(Bed::Front, false, true)),
            "Back_Loops" => Value::needles(on_sheet(Bed::Back, false, true)),
            _ => return None,
        })
    }

    /// Log a line of user output and keep it as a knitout comment.
    pub fn print_text(&mut self, text: &str) {
        tracing::info!(target: "knit_script::print", "{text}");
        for line in text.lines() {
            self.knitout
                .push(crate::knitout::KnitoutLine::comment(format!("print: {line}")));
        }
        if text.is_empty() {
            self.knitout.push(crate::knitout::KnitoutLine::comment("print: "));
        }
    }
}

fn dict_method(dict: &super::value::DictRef, name: &str, args: Vec<Value>) -> Result<Value, KnitError> {
    let mut args = args.into_iter();
    let key = args.next();
    let default = args.next();
    match name {
        "keys" => Ok(Value::list(
            dict.borrow().keys().cloned().map(Value::from_key).collect(),
        )),
        "values" => Ok(Value::list(dict.borrow().values().cloned().collect())),
        "items" => Ok(Value::list(
            dict.borrow()
                .iter()
                .map(|(k, v)| Value::list(vec![Value::from_key(k.clone()), v.clone()]))
                .collect(),
        )),
        "get" => {
            let key = key.ok_or_else(|| KnitError::type_error("get() takes a key"))?;
            let k = key.to_key()?;
            Ok(dict.borrow().get(&k).cloned().or(default).unwrap_or(Value::None))
        }
        "pop" => {
            let key = key.ok_or_else(|| KnitError::type_error("pop() takes a key"))?;
            let k = key.to_key()?;
            let removed = dict.borrow_mut().shift_remove(&k);
            removed
                .or(default)
                .ok_or_else(|| KnitError::key(format!("{} is not a key", key.repr())))
        }
        "update" => {
            let other = key.ok_or_else(|| KnitError::type_error("update() takes a dict"))?;
            let Value::Dict(other) = other else {
                return Err(KnitError::type_error("update() takes a dict"));
            };
            let entries = other.borrow().clone();
            dict.borrow_mut().extend(entries);
            Ok(Value::None)
        }
        _ => Ok(Value::dict(dict.borrow().clone())),
    }
}

fn str_method(s: &Rc<str>, name: &str, args: &[Value]) -> Result<Value, KnitError> {
    let text = |i: usize| -> Result<Rc<str>, KnitError> {
        args.get(i)
            .ok_or_else(|| KnitError::type_error(format!("{name}() is missing an argument")))?
            .as_str()
    };
    Ok(match name {
        "upper" => Value::str(s.to_uppercase()),
        "lower" => Value::str(s.to_lowercase()),
        "strip" => Value::str(s.trim()),
        "split" => {
            let parts: Vec<Value> = match args.first() {
                Some(Value::Str(sep)) if !sep.is_empty() => s.split(&**sep).map(Value::str).collect(),
                _ => s.split_whitespace().map(Value::str).collect(),
            };
            Value::list(parts)
        }
        "join" => {
            let items = args
                .first()
                .ok_or_else(|| KnitError::type_error("join() takes an iterable"))?
                .iterate()?;
            let parts = items
                .iter()
                .map(|v| v.as_str().map(|t| t.to_string()))
                .collect::<Result<Vec<_>, _>>()?;
            Value::str(parts.join(&**s))
        }
        "startswith" => Value::Bool(s.starts_with(&*text(0)?)),
        "endswith" => Value::Bool(s.ends_with(&*text(0)?)),
        "replace" => Value::str(s.replace(&*text(0)?, &*text(1)?)),
        _ => Value::str(format_string(s, args)?),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_name_is_unique() {
        for (i, a) in BUILTINS.iter().enumerate() {
            for b in BUILTINS.iter().skip(i + 1) {
                assert!(a.name != b.name, "duplicate builtin {}", a.name);
            }
        }
    }

    #[test]
    fn core_lookup_skips_module_functions() {
        assert!(lookup_builtin("len").is_some());
        assert!(lookup_builtin("sqrt").is_none());
        assert_eq!(module_builtins("math").count(), 7);
    }

    #[test]
    fn format_fills_positional_fields() {
        let args = [Value::Int(1), Value::str("x")];
        assert_eq!(format_string("{} and {}", &args).unwrap(), "1 and x");
        assert_eq!(format_string("{1}{0} {{}}", &args).unwrap(), "x1 {}");
        assert!(format_string("{} {} {}", &args).is_err());
    }

    #[test]
    fn isinstance_accepts_names_and_lists() {
        let int_ty = Value::Builtin(lookup_builtin("int").unwrap());
        assert!(matches_type(&Value::Int(3), &int_ty).unwrap());
        assert!(matches_type(&Value::Bool(true), &int_ty).unwrap());
        assert!(!matches_type(&Value::str("3"), &int_ty).unwrap());
        let either = Value::list(vec![Value::str("float"), Value::str("str")]);
        assert!(matches_type(&Value::str("3"), &either).unwrap());
    }
}
