//! Expression evaluation.

use std::rc::Rc;

use indexmap::IndexMap;

use super::builtins::lookup_builtin;
use super::context::Context;
use super::exec::Flow;
use super::scope::{self, is_machine_variable, Frame, FrameKind};
use super::value::{Function, Key, Value};
use crate::dsl::ast::{Arg, BinOp, Comprehension, DirectionWord, Expr, ExprKind, FStringPart, UnaryOp};
use crate::error::{ErrorKind, KnitError, KnitWarning};
use crate::knitout::NeedleOp;
use crate::machine::{Bed, Needle, SheetIdentifier};
use crate::settings::{MachinePosition, MachineType};

/// Deepest function-call nesting before a run is aborted.
const MAX_CALL_DEPTH: usize = 100;

/// Values of the fixed identifier vocabulary.
fn keyword_value(name: &str) -> Option<Value> {
    Some(match name {
        "Front" | "Front_Bed" => Value::Bed(Bed::Front),
        "Back" | "Back_Bed" => Value::Bed(Bed::Back),
        "SWG091N2" => Value::MachineType(MachineType::SWG091N2),
        "machine" => Value::Machine,
        _ => {
            if let Some(p) = MachinePosition::from_name(name) {
                return Some(Value::MachinePosition(p));
            }
            return NeedleOp::from_name(name).map(Value::Instruction);
        }
    })
}

fn unsupported(op: BinOp, l: &Value, r: &Value) -> KnitError {
    KnitError::type_error(format!(
        "unsupported operand types for {}: '{}' and '{}'",
        op.symbol(),
        l.type_name(),
        r.type_name()
    ))
}

fn overflow() -> KnitError {
    KnitError::value("integer overflow")
}

fn is_int_like(v: &Value) -> bool {
    matches!(v, Value::Int(_) | Value::Bool(_))
}

/// Modulo with the sign of the divisor.
fn int_mod(a: i64, b: i64) -> Result<i64, KnitError> {
    if b == 0 {
        return Err(KnitError::new(ErrorKind::ZeroDivision, "integer modulo by zero"));
    }
    let r = a.checked_rem(b).ok_or_else(overflow)?;
    Ok(if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
}

fn float_mod(a: f64, b: f64) -> Result<f64, KnitError> {
    if b == 0.0 {
        return Err(KnitError::new(ErrorKind::ZeroDivision, "float modulo by zero"));
    }
    let r = a % b;
    Ok(if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r })
}

/// Arithmetic on two numbers.
fn arithmetic(op: BinOp, l: &Value, r: &Value) -> Result<Value, KnitError> {
    if is_int_like(l) && is_int_like(r) && op != BinOp::Div {
        let (a, b) = (l.as_int()?, r.as_int()?);
        return Ok(match op {
            BinOp::Add => Value::Int(a.checked_add(b).ok_or_else(overflow)?),
            BinOp::Sub => Value::Int(a.checked_sub(b).ok_or_else(overflow)?),
            BinOp::Mul => Value::Int(a.checked_mul(b).ok_or_else(overflow)?),
            BinOp::Mod => Value::Int(int_mod(a, b)?),
            BinOp::Pow => match u32::try_from(b) {
                Ok(e) => Value::Int(a.checked_pow(e).ok_or_else(overflow)?),
                Err(_) => Value::Float((a as f64).powf(b as f64)),
            },
            _ => return Err(unsupported(op, l, r)),
        });
    }
    let (a, b) = (l.as_f64()?, r.as_f64()?);
    Ok(Value::Float(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(KnitError::new(ErrorKind::ZeroDivision, "division by zero"));
            }
            a / b
        }
        BinOp::Mod => float_mod(a, b)?,
        BinOp::Pow => a.powf(b),
        _ => return Err(unsupported(op, l, r)),
    }))
}

/// Largest list or string a `*` repetition may build.
const MAX_REPEAT_LEN: usize = 1 << 24;

/// Length of `len` items repeated `times` times, bounded by `MAX_REPEAT_LEN`.
fn repeat_len(len: usize, times: i64) -> Result<usize, KnitError> {
    let times = usize::try_from(times).unwrap_or(0);
    len.checked_mul(times)
        .filter(|&n| n <= MAX_REPEAT_LEN)
        .map(|n| if n == 0 { 0 } else { times })
        .ok_or_else(|| KnitError::value(format!("repetition of {len} items by {times} is too large")))
}

fn repeat<T: Clone>(items: &[T], times: i64) -> Result<Vec<T>, KnitError> {
    let times = repeat_len(items.len(), times)?;
    let mut out = Vec::with_capacity(items.len() * times);
    for _ in 0..times {
        out.extend_from_slice(items);
    }
    Ok(out)
}

/// Move `n` by `steps` sheet-local positions.
fn shift_needle(n: &Needle, steps: i32, gauge: i32) -> Result<Value, KnitError> {
    steps
        .checked_mul(gauge)
        .and_then(|delta| n.offset(delta))
        .map(Value::Needle)
        .ok_or_else(|| KnitError::value(format!("needle {n} offset by {steps} is out of range")))
}

/// `item in container`.
pub fn contains(container: &Value, item: &Value) -> Result<bool, KnitError> {
    match container {
        Value::List(items) => Ok(items.borrow().iter().any(|v| v.equals(item))),
        Value::Dict(entries) => Ok(item
            .to_key()
            .is_ok_and(|k| entries.borrow().contains_key(&k))),
        Value::Str(s) => Ok(s.contains(&*item.as_str()?)),
        Value::CarrierSet(cs) => Ok(match item {
            Value::Carrier(c) => cs.contains(*c),
            Value::Int(i) => u32::try_from(*i).is_ok_and(|c| cs.contains(c)),
            _ => false,
        }),
        other => Err(KnitError::type_error(format!(
            "argument of type '{}' is not a container",
            other.type_name()
        ))),
    }
}

/// Indices selected by `[start:stop:step]` on a sequence of `len` items.
pub fn slice_indices(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: i64,
) -> Result<Vec<usize>, KnitError> {
    if step == 0 {
        return Err(KnitError::value("slice step cannot be zero"));
    }
    let len = i64::try_from(len).map_err(|_| overflow())?;
    let norm = |i: i64, lo: i64, hi: i64| {
        let i = if i < 0 { i + len } else { i };
        i.clamp(lo, hi)
    };
    let mut out = Vec::new();
    if step > 0 {
        let mut i = start.map_or(0, |s| norm(s, 0, len));
        let end = stop.map_or(len, |s| norm(s, 0, len));
        while i < end {
            out.push(i as usize);
            i += step;
        }
    } else {
        let mut i = start.map_or(len - 1, |s| norm(s, -1, len - 1));
        let end = stop.map_or(-1, |s| norm(s, -1, len - 1));
        while i > end {
            out.push(i as usize);
            i += step;
        }
    }
    Ok(out)
}

/// Position of `index` in a sequence of `len`, counting negatives from the end.
pub fn sequence_index(index: i64, len: usize) -> Result<usize, KnitError> {
    let len_i = i64::try_from(len).map_err(|_| overflow())?;
    let i = if index < 0 { index + len_i } else { index };
    if (0..len_i).contains(&i) {
        Ok(i as usize)
    } else {
        Err(KnitError::index(format!("index {index} is out of range for length {len}")))
    }
}

impl Context {
    pub fn eval(&mut self, expr: &Expr) -> Result<Value, KnitError> {
        self.eval_kind(expr).map_err(|e| self.locate(e, expr.span))
    }

    fn eval_kind(&mut self, expr: &Expr) -> Result<Value, KnitError> {
        match &expr.kind {
            ExprKind::None => Ok(Value::None),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Int(i) => Ok(Value::Int(*i)),
            ExprKind::Float(f) => Ok(Value::Float(*f)),
            ExprKind::Str(s) => Ok(Value::str(s)),
            ExprKind::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FStringPart::Text(t) => out.push_str(t),
                        FStringPart::Hole(e) => out.push_str(&self.eval(e)?.to_string()),
                    }
                }
                Ok(Value::str(out))
            }
            ExprKind::Needle(text) => {
                let n = Needle::parse(text)
                    .ok_or_else(|| KnitError::value(format!("{text} is not a needle")))?;
                Ok(Value::Needle(self.sheet_needle(n.bed, n.position, n.is_slider)?))
            }
            ExprKind::Carrier(id) => Ok(Value::Carrier(*id)),
            ExprKind::Sheet { sheet, gauge } => Ok(Value::Sheet(SheetIdentifier::new(
                *sheet,
                gauge.unwrap_or_else(|| self.machine_scope.gauge()),
            ))),
            ExprKind::Direction(word) => {
                let current = self.machine_scope.direction();
                Ok(Value::Direction(match word {
                    DirectionWord::Leftward => crate::machine::Direction::Leftward,
                    DirectionWord::Rightward => crate::machine::Direction::Rightward,
                    DirectionWord::Current => current,
                    DirectionWord::Opposite => current.opposite(),
                }))
            }
            ExprKind::Ident(name) => self.lookup(name),
            ExprKind::List(items) => Ok(Value::list(self.eval_items(items)?)),
            ExprKind::Dict(pairs) => {
                let mut map = IndexMap::new();
                for (k, v) in pairs {
                    let key = self.eval(k)?.to_key()?;
                    let value = self.eval(v)?;
                    map.insert(key, value);
                }
                Ok(Value::dict(map))
            }
            ExprKind::ListComp { element, comp } => {
                let mut out = Vec::new();
                self.comprehension(comp, |ctx| {
                    out.push(ctx.eval(element)?);
                    Ok(())
                })?;
                Ok(Value::list(out))
            }
            ExprKind::DictComp { key, value, comp } => {
                let mut out = IndexMap::new();
                self.comprehension(comp, |ctx| {
                    let k = ctx.eval(key)?.to_key()?;
                    let v = ctx.eval(value)?;
                    out.insert(k, v);
                    Ok(())
                })?;
                Ok(Value::dict(out))
            }
            ExprKind::Unpack(_) => Err(KnitError::type_error(
                "unpacking with * is only allowed in lists and call arguments",
            )),
            ExprKind::BinOp { op, left, right } => self.binary(*op, left, right),
            ExprKind::UnaryOp { op, operand } => {
                let v = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!v.truthy())),
                    UnaryOp::Neg => match v {
                        Value::Int(i) => Ok(Value::Int(i.checked_neg().ok_or_else(overflow)?)),
                        Value::Bool(b) => Ok(Value::Int(-i64::from(b))),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(KnitError::type_error(format!(
                            "bad operand type for unary -: '{}'",
                            other.type_name()
                        ))),
                    },
                }
            }
            ExprKind::Call { callee, args } => self.eval_call(callee, args),
            ExprKind::Attribute { object, name } => {
                let obj = self.eval(object)?;
                self.get_attribute(&obj, name)
            }
            ExprKind::Index { object, index } => {
                let obj = self.eval(object)?;
                let idx = self.eval(index)?;
                index_value(&obj, &idx)
            }
            ExprKind::Slice {
                object,
                start,
                stop,
                step,
            } => {
                let obj = self.eval(object)?;
                let mut bound = |e: &Option<Box<Expr>>| -> Result<Option<i64>, KnitError> {
                    match e {
                        Some(e) => match self.eval(e)? {
                            Value::None => Ok(None),
                            v => v.as_int().map(Some),
                        },
                        None => Ok(None),
                    }
                };
                let start = bound(start)?;
                let stop = bound(stop)?;
                let step = bound(step)?.unwrap_or(1);
                slice_value(&obj, start, stop, step)
            }
            ExprKind::Gauge { sheet, gauge } => {
                let sheet = match self.eval(sheet)? {
                    Value::None => self.machine_scope.sheet().sheet,
                    Value::Sheet(s) => s.sheet,
                    v => v.as_i32()?,
                };
                let gauge = match self.eval(gauge)? {
                    Value::None => self.machine_scope.gauge(),
                    v => v.as_i32()?,
                };
                if sheet >= gauge {
                    KnitWarning::SheetBeyondGauge {
                        sheet: i64::from(sheet),
                        gauge: i64::from(gauge),
                    }
                    .emit();
                    return Ok(Value::Sheet(SheetIdentifier::new(gauge - 1, gauge)));
                }
                Ok(Value::Sheet(SheetIdentifier::new(sheet, gauge)))
            }
        }
    }

    /// Resolve a name: machine variables, needle sets, bound variables, the
    /// fixed vocabulary, then builtins.
    pub fn lookup(&self, name: &str) -> Result<Value, KnitError> {
        if let Some(v) = self.machine_scope.get_variable(name) {
            return Ok(v);
        }
        if let Some(v) = self.needle_set(name) {
            return Ok(v);
        }
        if let Some(v) = scope::lookup(&self.frame, name) {
            return Ok(v);
        }
        if let Some(v) = keyword_value(name) {
            return Ok(v);
        }
        if let Some(b) = lookup_builtin(name) {
            return Ok(Value::Builtin(b));
        }
        Err(KnitError::name(format!("Variable {name} is not in scope")))
    }

    /// Evaluate list items, expanding `*e`.
    pub fn eval_items(&mut self, items: &[Expr]) -> Result<Vec<Value>, KnitError> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if let ExprKind::Unpack(inner) = &item.kind {
                out.extend(self.eval(inner)?.iterate()?);
            } else {
                out.push(self.eval(item)?);
            }
        }
        Ok(out)
    }

    /// Bind loop or comprehension variables, unpacking when there are several.
    pub fn bind_targets(&mut self, names: &[String], value: Value, rebind: bool) -> Result<(), KnitError> {
        let mut set = |ctx: &mut Self, name: &str, v: Value| {
            if rebind {
                ctx.assign(name, v)
            } else {
                ctx.define(name, v)
            }
        };
        if let [name] = names {
            return set(self, name, value);
        }
        let parts = value.iterate()?;
        if parts.len() != names.len() {
            let which = if parts.len() > names.len() { "many" } else { "few" };
            return Err(KnitError::value(format!(
                "too {which} values to unpack: expected {} but got {}",
                names.len(),
                parts.len()
            )));
        }
        for (name, v) in names.iter().zip(parts) {
            set(self, name, v)?;
        }
        Ok(())
    }

    fn comprehension(
        &mut self,
        comp: &Comprehension,
        mut each: impl FnMut(&mut Self) -> Result<(), KnitError>,
    ) -> Result<(), KnitError> {
        let items = self.eval(&comp.iterable)?.iterate()?;
        let frame = Frame::child(&self.frame, FrameKind::Block);
        self.with_frame(frame, |ctx| {
            for item in items {
                ctx.bind_targets(&comp.variables, item, false)?;
                if let Some(cond) = &comp.condition {
                    if !ctx.eval(cond)?.truthy() {
                        continue;
                    }
                }
                each(ctx)?;
            }
            Ok(())
        })
    }

    fn binary(&mut self, op: BinOp, left: &Expr, right: &Expr) -> Result<Value, KnitError> {
        match op {
            BinOp::And => {
                let l = self.eval(left)?;
                if !l.truthy() {
                    return Ok(l);
                }
                self.eval(right)
            }
            BinOp::Or => {
                let l = self.eval(left)?;
                if l.truthy() {
                    return Ok(l);
                }
                self.eval(right)
            }
            _ => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                self.apply_binary(op, &l, &r)
            }
        }
    }

    /// Apply a non-short-circuit operator to two values.
    pub fn apply_binary(&self, op: BinOp, l: &Value, r: &Value) -> Result<Value, KnitError> {
        let gauge = self.machine_scope.gauge();
        match op {
            BinOp::Add => match (l, r) {
                (Value::Str(a), Value::Str(b)) => Ok(Value::str(format!("{a}{b}"))),
                (Value::List(a), Value::List(b)) => {
                    let mut items = a.borrow().clone();
                    items.extend(b.borrow().iter().cloned());
                    Ok(Value::list(items))
                }
                (Value::Needle(n), k) | (k, Value::Needle(n)) if is_int_like(k) => {
                    shift_needle(n, k.as_i32()?, gauge)
                }
                (a, b) if a.is_numeric() && b.is_numeric() => arithmetic(op, a, b),
                _ => Err(unsupported(op, l, r)),
            },
            BinOp::Sub => match (l, r) {
                (Value::Needle(n), k) if is_int_like(k) => {
                    let steps = k.as_i32()?.checked_neg().ok_or_else(overflow)?;
                    shift_needle(n, steps, gauge)
                }
                (Value::Needle(a), Value::Needle(b)) => {
                    Ok(Value::Int((i64::from(a.position) - i64::from(b.position)) / i64::from(gauge)))
                }
                (a, b) if a.is_numeric() && b.is_numeric() => arithmetic(op, a, b),
                _ => Err(unsupported(op, l, r)),
            },
            BinOp::Mul => match (l, r) {
                (Value::Str(s), k) | (k, Value::Str(s)) if is_int_like(k) => {
                    let times = repeat_len(s.len(), k.as_int()?)?;
                    Ok(Value::str(s.repeat(times)))
                }
                (Value::List(items), k) | (k, Value::List(items)) if is_int_like(k) => {
                    Ok(Value::list(repeat(&items.borrow(), k.as_int()?)?))
                }
                (a, b) if a.is_numeric() && b.is_numeric() => arithmetic(op, a, b),
                _ => Err(unsupported(op, l, r)),
            },
            BinOp::Div | BinOp::Mod | BinOp::Pow => {
                if l.is_numeric() && r.is_numeric() {
                    arithmetic(op, l, r)
                } else {
                    Err(unsupported(op, l, r))
                }
            }
            BinOp::Lt => Ok(Value::Bool(l.compare(r)?.is_lt())),
            BinOp::Gt => Ok(Value::Bool(l.compare(r)?.is_gt())),
            BinOp::Le => Ok(Value::Bool(l.compare(r)?.is_le())),
            BinOp::Ge => Ok(Value::Bool(l.compare(r)?.is_ge())),
            BinOp::Eq => Ok(Value::Bool(l.equals(r))),
            BinOp::Ne => Ok(Value::Bool(!l.equals(r))),
            BinOp::Is => Ok(Value::Bool(l.is_same(r))),
            BinOp::IsNot => Ok(Value::Bool(!l.is_same(r))),
            BinOp::In => Ok(Value::Bool(contains(r, l)?)),
            BinOp::NotIn => Ok(Value::Bool(!contains(r, l)?)),
            BinOp::And | BinOp::Or => Err(unsupported(op, l, r)),
        }
    }

    fn eval_args(&mut self, args: &[Arg]) -> Result<(Vec<Value>, Vec<(String, Value)>), KnitError> {
        let mut positional = Vec::new();
        let mut keywords: Vec<(String, Value)> = Vec::new();
        for arg in args {
            match arg {
                Arg::Positional(e) => {
                    if let ExprKind::Unpack(inner) = &e.kind {
                        positional.extend(self.eval(inner)?.iterate()?);
                    } else {
                        positional.push(self.eval(e)?);
                    }
                }
                Arg::Keyword(name, e) => {
                    if keywords.iter().any(|(k, _)| k == name) {
                        return Err(KnitError::type_error(format!(
                            "keyword argument {name} repeated"
                        )));
                    }
                    let v = self.eval(e)?;
                    keywords.push((name.clone(), v));
                }
            }
        }
        Ok((positional, keywords))
    }

    fn eval_call(&mut self, callee: &Expr, args: &[Arg]) -> Result<Value, KnitError> {
        match &callee.kind {
            ExprKind::Attribute { object, name } => {
                let receiver = self.eval(object)?;
                let (positional, keywords) = self.eval_args(args)?;
                self.call_method(&receiver, name, positional, keywords)
            }
            // `Carrier(2)` calls the constructor rather than the machine variable.
            ExprKind::Ident(name) if is_machine_variable(name) && lookup_builtin(name).is_some() => {
                let (positional, keywords) = self.eval_args(args)?;
                match lookup_builtin(name) {
                    Some(b) => self.call_builtin(b, positional, keywords),
                    None => Err(KnitError::name(format!("{name} is not callable"))),
                }
            }
            _ => {
                let f = self.eval(callee)?;
                let (positional, keywords) = self.eval_args(args)?;
                self.call_value(&f, positional, keywords)
            }
        }
    }

    pub fn call_value(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, KnitError> {
        match callee {
            Value::Function(f) => self.call_function(f, args, kwargs),
            Value::Builtin(b) => self.call_builtin(b, args, kwargs),
            Value::Method(m) => {
                let receiver = m.receiver.clone();
                self.call_method(&receiver, &m.name, args, kwargs)
            }
            other => Err(KnitError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    /// Call a KnitScript function in a fresh frame over its closure.
    pub fn call_function(
        &mut self,
        func: &Rc<Function>,
        args: Vec<Value>,
        mut kwargs: Vec<(String, Value)>,
    ) -> Result<Value, KnitError> {
        if args.len() > func.params.len() {
            return Err(KnitError::type_error(format!(
                "{}() takes {} arguments but {} were given",
                func.name,
                func.params.len(),
                args.len()
            )));
        }
        let frame = Frame::child(&func.closure, FrameKind::Function);
        let mut args = args.into_iter();
        for (name, default) in &func.params {
            let keyword = kwargs
                .iter()
                .position(|(k, _)| k == name)
                .map(|i| kwargs.remove(i).1);
            let value = match (args.next(), keyword) {
                (Some(_), Some(_)) => {
                    return Err(KnitError::type_error(format!(
                        "{}() got multiple values for argument {name}",
                        func.name
                    )))
                }
                (Some(v), None) | (None, Some(v)) => v,
                (None, None) => default.clone().ok_or_else(|| {
                    KnitError::type_error(format!(
                        "{}() missing required argument {name}",
                        func.name
                    ))
                })?,
            };
            frame.borrow_mut().set_own(name.as_str(), value);
        }
        if let Some((k, _)) = kwargs.first() {
            return Err(KnitError::type_error(format!(
                "{}() got an unexpected keyword argument {k}",
                func.name
            )));
        }
        if self.call_depth >= MAX_CALL_DEPTH {
            return Err(KnitError::new(
                ErrorKind::Value,
                format!("maximum call depth of {MAX_CALL_DEPTH} exceeded in {}", func.name),
            ));
        }
        self.call_depth += 1;
        let body = Rc::clone(&func.body);
        let result = self.with_source(Rc::clone(&func.source), |ctx| {
            ctx.with_frame(frame, |ctx| ctx.exec_block(&body))
        });
        self.call_depth -= 1;
        match result? {
            Flow::Return(v) => Ok(v),
            Flow::Normal => Ok(Value::None),
        }
    }
}

/// `obj[idx]`
pub fn index_value(obj: &Value, idx: &Value) -> Result<Value, KnitError> {
    match obj {
        Value::List(items) => {
            let items = items.borrow();
            let i = sequence_index(idx.as_int()?, items.len())?;
            items
                .get(i)
                .cloned()
                .ok_or_else(|| KnitError::index(format!("index {i} is out of range")))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let i = sequence_index(idx.as_int()?, chars.len())?;
            chars
                .get(i)
                .map(|c| Value::str(c.to_string()))
                .ok_or_else(|| KnitError::index(format!("index {i} is out of range")))
        }
        Value::Dict(entries) => {
            let key = idx.to_key()?;
            entries
                .borrow()
                .get(&key)
                .cloned()
                .ok_or_else(|| KnitError::key(format!("{} is not a key", idx.repr())))
        }
        Value::CarrierSet(cs) => {
            let i = sequence_index(idx.as_int()?, cs.len())?;
            cs.ids()
                .get(i)
                .map(|c| Value::Carrier(*c))
                .ok_or_else(|| KnitError::index(format!("index {i} is out of range")))
        }
        other => Err(KnitError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

/// `obj[start:stop:step]`
pub fn slice_value(obj: &Value, start: Option<i64>, stop: Option<i64>, step: i64) -> Result<Value, KnitError> {
    match obj {
        Value::List(items) => {
            let items = items.borrow();
            let picked = slice_indices(items.len(), start, stop, step)?
                .into_iter()
                .filter_map(|i| items.get(i).cloned())
                .collect();
            Ok(Value::list(picked))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let picked: String = slice_indices(chars.len(), start, stop, step)?
                .into_iter()
                .filter_map(|i| chars.get(i))
                .collect();
            Ok(Value::str(picked))
        }
        other => Err(KnitError::type_error(format!(
            "'{}' object cannot be sliced",
            other.type_name()
        ))),
    }
}

/// `obj[idx] = value`
pub fn set_index(obj: &Value, idx: &Value, value: Value) -> Result<(), KnitError> {
    match obj {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = sequence_index(idx.as_int()?, items.len())?;
            if let Some(slot) = items.get_mut(i) {
                *slot = value;
            }
            Ok(())
        }
        Value::Dict(entries) => {
            let key: Key = idx.to_key()?;
            entries.borrow_mut().insert(key, value);
            Ok(())
        }
        other => Err(KnitError::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn python_style_slices() {
        assert_eq!(slice_indices(5, None, None, 1).unwrap(), [0, 1, 2, 3, 4]);
        assert_eq!(slice_indices(5, Some(1), None, 2).unwrap(), [1, 3]);
        assert_eq!(slice_indices(5, None, None, -1).unwrap(), [4, 3, 2, 1, 0]);
        assert_eq!(slice_indices(5, Some(-2), None, 1).unwrap(), [3, 4]);
        assert_eq!(slice_indices(5, Some(10), None, 1).unwrap(), Vec::<usize>::new());
        assert!(slice_indices(5, None, None, 0).is_err());
    }

    #[test]
    fn modulo_follows_divisor_sign() {
        assert_eq!(int_mod(-3, 2).unwrap(), 1);
        assert_eq!(int_mod(3, -2).unwrap(), -1);
        assert!(int_mod(1, 0).is_err());
        assert!((float_mod(-1.5, 1.0).unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn arithmetic_promotes() {
        let v = arithmetic(BinOp::Div, &Value::Int(3), &Value::Int(2)).unwrap();
        assert!(v.equals(&Value::Float(1.5)));
        let v = arithmetic(BinOp::Pow, &Value::Int(2), &Value::Int(10)).unwrap();
        assert!(matches!(v, Value::Int(1024)));
        assert_eq!(
            arithmetic(BinOp::Div, &Value::Int(1), &Value::Int(0)).unwrap_err().kind,
            ErrorKind::ZeroDivision
        );
    }

    #[test]
    fn negative_indices() {
        assert_eq!(sequence_index(-1, 3).unwrap(), 2);
        assert!(sequence_index(3, 3).is_err());
        let list = Value::list(vec![Value::Int(1), Value::Int(2)]);
        assert!(index_value(&list, &Value::Int(-1)).unwrap().equals(&Value::Int(2)));
    }

    #[test]
    fn repetition_is_bounded() {
        assert_eq!(repeat(&[1, 2], 3).unwrap(), [1, 2, 1, 2, 1, 2]);
        assert!(repeat(&[1, 2], -4).unwrap().is_empty());
        assert!(repeat::<i32>(&[], i64::MAX).unwrap().is_empty());
        assert_eq!(repeat(&[1, 2], i64::MAX).unwrap_err().kind, ErrorKind::Value);
        assert_eq!(repeat_len(3, 1 << 30).unwrap_err().kind, ErrorKind::Value);
    }

    #[test]
    fn needle_shifts_stay_in_range() {
        let n = Needle::front(1);
        assert!(matches!(shift_needle(&n, 3, 2).unwrap(), Value::Needle(m) if m.position == 7));
        assert_eq!(shift_needle(&n, 2_000_000_000, 2).unwrap_err().kind, ErrorKind::Value);
        assert!(shift_needle(&Needle::front(i32::MAX), 1, 1).is_err());
    }
}
