//! Statement execution.

use std::path::PathBuf;
use std::rc::Rc;

use indexmap::IndexMap;

use super::context::Context;
use super::eval::set_index;
use super::modules::{native_module, package};
use super::scope::{self, is_machine_variable, Frame, FrameKind};
use super::value::{Function, Module, ModuleAttrs, Source, Value};
use crate::carriage_pass::{CarriagePass, PassResult};
use crate::dsl::ast::{
    AssignTarget, CatchType, Expr, InstructionAssignment, PushTarget, Stmt, StmtKind, SwapKind, XferRack,
};
use crate::error::{ErrorKind, KnitError};
use crate::knitout::{Instruction, NeedleOp};
use crate::machine::{Bed, CarrierSet, Direction, Needle};
use crate::paths;
use crate::settings::MachinePosition;
use crate::sheet::LayerRule;

/// How a statement finished.
#[derive(Debug, Clone)]
pub enum Flow {
    Normal,
    Return(Value),
}

/// Sign of an `N to Left|Right` xfer offset.
fn side_sign(side: &Value) -> Result<i32, KnitError> {
    match side {
        Value::MachinePosition(MachinePosition::Left) | Value::Direction(Direction::Leftward) => Ok(1),
        Value::MachinePosition(MachinePosition::Right) | Value::Direction(Direction::Rightward) => Ok(-1),
        other => Err(KnitError::type_error(format!(
            "xfer offset must be to Left or Right but got {}",
            other.repr()
        ))),
    }
}

fn collect_carrier_ids(value: &Value, out: &mut Vec<u32>) -> Result<(), KnitError> {
    match value {
        Value::Carrier(c) => out.push(*c),
        Value::CarrierSet(cs) => out.extend_from_slice(cs.ids()),
        Value::List(items) => {
            for item in items.borrow().iter() {
                collect_carrier_ids(item, out)?;
            }
        }
        Value::None => {}
        other => {
            let raw = other.as_int()?;
            out.push(u32::try_from(raw).map_err(|_| KnitError::value(format!("{raw} is not a carrier id")))?);
        }
    }
    Ok(())
}

fn flatten_needles(value: Value, out: &mut Vec<Needle>) -> Result<(), KnitError> {
    match value {
        Value::Needle(n) => out.push(n),
        Value::List(items) => {
            let items = items.borrow().clone();
            for item in items {
                flatten_needles(item, out)?;
            }
        }
        Value::Dict(entries) => {
            let keys: Vec<Value> = entries.borrow().keys().cloned().map(Value::from_key).collect();
            for key in keys {
                flatten_needles(key, out)?;
            }
        }
        other => {
            return Err(KnitError::type_error(format!(
                "expected needles but got {} {}",
                other.type_name(),
                other.repr()
            )))
        }
    }
    Ok(())
}

/// First parse failure as a runtime error.
pub(crate) fn parse_program(text: &str) -> Result<crate::dsl::ast::Program, KnitError> {
    crate::dsl::parse_source(text).map_err(|errors| {
        errors
            .into_iter()
            .next()
            .map(|e| e.into_knit_error(text))
            .unwrap_or_else(|| KnitError::new(ErrorKind::Parsing, "could not parse source"))
    })
}

impl Context {
    pub fn exec_block(&mut self, stmts: &[Stmt]) -> Result<Flow, KnitError> {
        for stmt in stmts {
            if let Flow::Return(v) = self.exec(stmt)? {
                return Ok(Flow::Return(v));
            }
        }
        Ok(Flow::Normal)
    }

    /// Run `stmts` in a fresh block frame.
    fn exec_scoped(&mut self, stmts: &[Stmt]) -> Result<Flow, KnitError> {
        let frame = Frame::child(&self.frame, FrameKind::Block);
        self.with_frame(frame, |ctx| ctx.exec_block(stmts))
    }

    pub fn exec(&mut self, stmt: &Stmt) -> Result<Flow, KnitError> {
        self.exec_kind(&stmt.kind).map_err(|e| self.locate(e, stmt.span))
    }

    fn exec_kind(&mut self, kind: &StmtKind) -> Result<Flow, KnitError> {
        match kind {
            StmtKind::Assign { target, value } => {
                let v = self.eval(value)?;
                match target {
                    AssignTarget::Name(name) => self.assign(name, v)?,
                    AssignTarget::Index { object, index } => {
                        let obj = self.eval(object)?;
                        let idx = self.eval(index)?;
                        set_index(&obj, &idx, v)?;
                    }
                }
            }
            StmtKind::Global { name, value } => {
                let v = self.eval(value)?;
                self.assign_global(name, v)?;
            }
            StmtKind::Expr(e) => {
                self.eval(e)?;
            }
            StmtKind::Block(body) => return self.exec_scoped(body),
            StmtKind::If { arms, else_body } => {
                for (condition, body) in arms {
                    if self.eval(condition)?.truthy() {
                        return self.exec_scoped(body);
                    }
                }
                if let Some(body) = else_body {
                    return self.exec_scoped(body);
                }
            }
            StmtKind::While { condition, body } => {
                while self.eval(condition)?.truthy() {
                    if let Flow::Return(v) = self.exec_scoped(body)? {
                        return Ok(Flow::Return(v));
                    }
                }
            }
            StmtKind::For {
                variables,
                iterables,
                body,
            } => return self.exec_for(variables, iterables, body),
            StmtKind::With { bindings, body } => return self.exec_with(bindings, body),
            StmtKind::Try {
                body,
                catches,
                handler,
            } => return self.exec_try(body, catches, handler),
            StmtKind::Assert { condition, message } => {
                if !self.eval(condition)?.truthy() {
                    let text = match message {
                        Some(m) => self.eval(m)?.to_string(),
                        None => "Assertion failed".to_string(),
                    };
                    return Err(KnitError::new(ErrorKind::Assertion, text));
                }
            }
            StmtKind::Print(e) => {
                let text = self.eval(e)?.to_string();
                self.print_text(&text);
            }
            StmtKind::Pause => self.emit(Instruction::Pause, None)?,
            StmtKind::Return(value) => {
                let v = match value {
                    Some(e) => self.eval(e)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(v));
            }
            StmtKind::FunctionDef { name, params, body } => {
                let mut bound = Vec::with_capacity(params.len());
                for p in params {
                    let default = p.default.as_ref().map(|d| self.eval(d)).transpose()?;
                    bound.push((p.name.clone(), default));
                }
                let func = Function {
                    name: name.clone(),
                    params: bound,
                    body: Rc::clone(body),
                    closure: Rc::clone(&self.frame),
                    source: Rc::clone(&self.source),
                };
                self.assign(name, Value::Function(Rc::new(func)))?;
            }
            StmtKind::Import { path, alias } => self.exec_import(path, alias.as_deref())?,
            StmtKind::CarriagePass {
                direction,
                instructions,
            } => self.exec_carriage_pass(direction, instructions)?,
            StmtKind::Xfer {
                needles,
                rack,
                bed,
                sliders,
            } => self.exec_xfer(needles, rack, bed.as_ref(), *sliders)?,
            StmtKind::Drop(needles) => {
                let drops: IndexMap<Needle, NeedleOp> = self
                    .eval_needles(needles)?
                    .into_iter()
                    .map(|n| (n, NeedleOp::Drop))
                    .collect();
                let pass = CarriagePass::new(drops, Some(self.machine_scope.direction()))?;
                self.last_pass = self.write_pass(&pass)?;
            }
            StmtKind::Cut(carriers) => self.exec_cut(carriers, true)?,
            StmtKind::Remove(carriers) => self.exec_cut(carriers, false)?,
            StmtKind::Releasehook => {
                if let Some(hooked) = self.machine.carrier_system.hooked_carriers().cloned() {
                    self.emit(Instruction::Releasehook(hooked), None)?;
                } else {
                    tracing::debug!("releasehook with nothing on the hook");
                }
            }
            StmtKind::Push { needles, target } => self.exec_push(needles, target)?,
            StmtKind::Swap { needles, kind, value } => self.exec_swap(needles, *kind, value)?,
        }
        Ok(Flow::Normal)
    }

    fn exec_for(&mut self, variables: &[String], iterables: &[Expr], body: &[Stmt]) -> Result<Flow, KnitError> {
        let items = match iterables {
            [single] => self.eval(single)?.iterate()?,
            many => self.eval_items(many)?,
        };
        let frame = Frame::child(&self.frame, FrameKind::Block);
        self.with_frame(frame, |ctx| {
            for item in items {
                ctx.bind_targets(variables, item, true)?;
                if let Flow::Return(v) = ctx.exec_scoped(body)? {
                    return Ok(Flow::Return(v));
                }
            }
            Ok(Flow::Normal)
        })
    }

    /// Machine variables are set for the block and restored afterwards,
    /// newest first, whether or not the block fails.
    fn exec_with(&mut self, bindings: &[(String, Expr)], body: &[Stmt]) -> Result<Flow, KnitError> {
        let frame = Frame::child(&self.frame, FrameKind::Block);
        let mut saved: Vec<(String, Value)> = Vec::new();
        let entered = self.enter_with(bindings, &frame, &mut saved);
        let result = match entered {
            Ok(()) => self.with_frame(frame, |ctx| ctx.exec_block(body)),
            Err(e) => Err(e),
        };
        let mut restore_error = None;
        for (name, old) in saved.into_iter().rev() {
            if let Err(e) = self.set_machine_variable(&name, &old) {
                restore_error.get_or_insert(e);
            }
        }
        match (result, restore_error) {
            (Err(e), _) | (Ok(_), Some(e)) => Err(e),
            (Ok(flow), None) => Ok(flow),
        }
    }

    fn enter_with(
        &mut self,
        bindings: &[(String, Expr)],
        frame: &scope::FrameRef,
        saved: &mut Vec<(String, Value)>,
    ) -> Result<(), KnitError> {
        for (name, expr) in bindings {
            let value = self.eval(expr)?;
            if is_machine_variable(name) {
                let old = self.machine_scope.get_variable(name).unwrap_or(Value::None);
                self.set_machine_variable(name, &value)?;
                saved.push((name.clone(), old));
            } else {
                frame.borrow_mut().set_own(name.as_str(), value);
            }
        }
        Ok(())
    }

    fn exec_try(&mut self, body: &[Stmt], catches: &[CatchType], handler: &[Stmt]) -> Result<Flow, KnitError> {
        let err = match self.exec_scoped(body) {
            Ok(flow) => return Ok(flow),
            Err(e) => e,
        };
        if let Some(unknown) = catches.iter().find(|c| !ErrorKind::is_family(&c.family)) {
            return Err(KnitError::name(format!(
                "{} is not an exception type",
                unknown.family
            )));
        }
        let binding = if catches.is_empty() {
            None
        } else {
            match catches.iter().find(|c| err.kind.is_a(&c.family)) {
                Some(c) => c.binding.clone(),
                None => return Err(err),
            }
        };
        tracing::debug!(kind = %err.kind, "caught error");
        let frame = Frame::child(&self.frame, FrameKind::Block);
        if let Some(name) = binding {
            frame.borrow_mut().set_own(name, Value::Error(Rc::new(err)));
        }
        self.with_frame(frame, |ctx| ctx.exec_block(handler))
    }

    /// Evaluate needle expressions, flattening lists and dict keys.
    fn eval_needles(&mut self, exprs: &[Expr]) -> Result<Vec<Needle>, KnitError> {
        let mut out = Vec::new();
        for e in exprs {
            let v = self.eval(e)?;
            flatten_needles(v, &mut out).map_err(|err| self.locate(err, e.span))?;
        }
        Ok(out)
    }

    fn write_pass(&mut self, pass: &CarriagePass) -> Result<PassResult, KnitError> {
        pass.write_knitout(&mut self.machine_scope, &mut self.machine, &mut self.knitout)
    }

    fn exec_carriage_pass(&mut self, direction: &Expr, instructions: &[InstructionAssignment]) -> Result<(), KnitError> {
        let dir = match self.eval(direction)? {
            Value::Direction(d) => d,
            other => {
                return Err(KnitError::type_error(format!(
                    "carriage pass direction must be a direction but got {}",
                    other.repr()
                )))
            }
        };
        let mut needle_to_op = IndexMap::new();
        for assignment in instructions {
            let op = match self.eval(&assignment.instruction)? {
                Value::Instruction(op) => op,
                other => {
                    let err = KnitError::type_error(format!("expected an instruction but got {}", other.repr()));
                    return Err(self.locate(err, assignment.span));
                }
            };
            let needles = self
                .eval_needles(&assignment.needles)
                .map_err(|e| self.locate(e, assignment.span))?;
            for n in needles {
                needle_to_op.insert(n, op);
            }
        }
        let pass = CarriagePass::new(needle_to_op, Some(dir))?;
        self.last_pass = self.write_pass(&pass)?;
        Ok(())
    }

    fn exec_xfer(&mut self, needles: &[Expr], rack: &XferRack, bed: Option<&Expr>, sliders: bool) -> Result<(), KnitError> {
        let needles = self.eval_needles(needles)?;
        let offset = match rack {
            XferRack::Across => 0,
            XferRack::Offset { distance, side } => {
                let distance = self.eval(distance)?.as_i32()?;
                let side = self.eval(side)?;
                distance * side_sign(&side)?
            }
        };
        let target = match bed.map(|e| self.eval(e)).transpose()? {
            None | Some(Value::None) => None,
            Some(Value::Bed(b)) => Some(b),
            Some(other) => {
                return Err(KnitError::type_error(format!(
                    "xfer target must be Front or Back bed but got {}",
                    other.repr()
                )))
            }
        };
        let build = |needles: Vec<Needle>, racking: i32| -> Result<CarriagePass, KnitError> {
            let map = needles.into_iter().map(|n| (n, NeedleOp::Xfer)).collect();
            Ok(CarriagePass::new(map, None)?
                .with_target_bed(target)
                .with_racking(f64::from(racking))
                .to_sliders(sliders))
        };
        let passes = if offset == 0 {
            vec![build(needles, 0)?]
        } else {
            let (front, back): (Vec<Needle>, Vec<Needle>) = needles.into_iter().partition(|n| n.bed == Bed::Front);
            vec![build(front, offset)?, build(back, -offset)?]
        };
        let mut merged = PassResult::new();
        for pass in passes.iter().filter(|p| !p.is_empty()) {
            merged.extend(self.write_pass(pass)?);
        }
        self.last_pass = merged;
        Ok(())
    }

    /// `cut` outhooks each carrier; `remove` takes it out to the grippers.
    fn exec_cut(&mut self, carriers: &[Expr], cut: bool) -> Result<(), KnitError> {
        let mut ids = Vec::new();
        if carriers.is_empty() {
            if let Some(working) = self.machine_scope.carrier() {
                ids.extend_from_slice(working.ids());
            }
        }
        for e in carriers {
            let v = self.eval(e)?;
            collect_carrier_ids(&v, &mut ids)?;
        }
        for &id in &ids {
            let set = CarrierSet::single(id);
            let instruction = if cut { Instruction::Outhook(set) } else { Instruction::Out(set) };
            self.emit(instruction, None)?;
        }
        let working_gone = self
            .machine_scope
            .carrier()
            .is_some_and(|w| ids.iter().any(|id| w.contains(*id)));
        if working_gone {
            self.machine_scope
                .set_carrier(&mut self.machine, &mut self.knitout, None)?;
        }
        Ok(())
    }

    /// Physical positions named by needles or sheet-relative integers.
    fn eval_positions(&mut self, exprs: &[Expr]) -> Result<Vec<i32>, KnitError> {
        let mut out = Vec::new();
        for e in exprs {
            let mut values = Vec::new();
            match self.eval(e)? {
                Value::List(items) => values.extend(items.borrow().iter().cloned()),
                v => values.push(v),
            }
            for v in values {
                let pos = match v {
                    Value::Needle(n) => n.position,
                    other => self.sheet_needle(Bed::Front, other.as_i32()?, false)?.position,
                };
                out.push(pos);
            }
        }
        Ok(out)
    }

    /// Send the active sheet's loops back where its layers now put them.
    fn reset_active_sheet(&mut self) -> Result<(), KnitError> {
        let sheet = self.machine_scope.sheet().sheet;
        let lines = self
            .machine_scope
            .sheet_record()
            .reset_to_sheet(&mut self.machine, sheet)?;
        self.knitout.extend(lines);
        Ok(())
    }

    fn exec_push(&mut self, needles: &[Expr], target: &PushTarget) -> Result<(), KnitError> {
        #[derive(Clone, Copy)]
        enum Move {
            Front,
            Back,
            Layer(i32),
            Forward(i32),
            Backward(i32),
        }
        let positions = self.eval_positions(needles)?;
        let amount = |ctx: &mut Self, e: &Option<Expr>| -> Result<i32, KnitError> {
            e.as_ref().map_or(Ok(1), |e| ctx.eval(e)?.as_i32())
        };
        let mv = match target {
            PushTarget::Front => Move::Front,
            PushTarget::Back => Move::Back,
            PushTarget::Layer(e) => Move::Layer(self.eval(e)?.as_i32()?),
            PushTarget::Forward(n) => Move::Forward(amount(self, n)?),
            PushTarget::Backward(n) => Move::Backward(amount(self, n)?),
        };
        let record = self.machine_scope.sheet_record_mut();
        for pos in positions {
            match mv {
                Move::Front => record.set_layer_to_front(pos, LayerRule::default())?,
                Move::Back => record.set_layer_to_back(pos, LayerRule::default())?,
                Move::Layer(layer) => record.set_layer_position(pos, layer, LayerRule::default())?,
                Move::Forward(n) => record.push_layer_forward(pos, n)?,
                Move::Backward(n) => record.push_layer_backward(pos, n)?,
            }
        }
        self.reset_active_sheet()
    }

    fn exec_swap(&mut self, needles: &[Expr], kind: SwapKind, value: &Expr) -> Result<(), KnitError> {
        let positions = self.eval_positions(needles)?;
        let target = match self.eval(value)? {
            Value::Sheet(s) => s.sheet,
            v => v.as_i32()?,
        };
        let current = self.machine_scope.sheet().sheet;
        let gauge = self.machine_scope.gauge();
        let record = self.machine_scope.sheet_record_mut();
        for pos in positions {
            match kind {
                SwapKind::Sheet => {
                    if !(0..gauge).contains(&target) {
                        return Err(KnitError::new(
                            ErrorKind::SheetValue,
                            format!("Sheet must be between 0 and gauge {gauge} but got {target}"),
                        ));
                    }
                    record.swap_layer_at_positions(pos, pos + (target - current))?;
                }
                SwapKind::Layer => {
                    for s in (0..gauge).filter(|s| *s != current) {
                        let other = pos + (s - current);
                        if record.get_layer_at_position(other)? == target {
                            record.swap_layer_at_positions(pos, other)?;
                            break;
                        }
                    }
                }
            }
        }
        self.reset_active_sheet()
    }

    fn exec_import(&mut self, path: &[String], alias: Option<&str>) -> Result<(), KnitError> {
        let module = self.load_module(path)?;
        let value = Value::Module(module);
        if let Some(alias) = alias {
            return self.assign(alias, value);
        }
        let Some((head, tail)) = path.split_first() else {
            return Err(KnitError::new(ErrorKind::Import, "empty import path"));
        };
        if tail.is_empty() {
            return self.assign(head, value);
        }
        // `import a.b.c` binds `a` with `b.c` reachable through it.
        let mut inner = value;
        for i in (1..path.len()).rev() {
            let (parents, rest) = path.split_at(i);
            let (Some(pkg), Some(child)) = (parents.last(), rest.first()) else {
                continue;
            };
            let existing = if i == 1 {
                match scope::lookup(&self.frame, head) {
                    Some(Value::Module(m)) => Some(m),
                    _ => None,
                }
            } else {
                None
            };
            inner = Value::Module(package(pkg, existing.as_deref(), child, inner));
        }
        self.assign(head, inner)
    }

    fn load_module(&mut self, path: &[String]) -> Result<Rc<Module>, KnitError> {
        let dotted = path.join(".");
        let mut dirs: Vec<PathBuf> = self.source.dir.iter().cloned().collect();
        dirs.extend(self.import_paths.iter().cloned());
        if let Some(file) = paths::module_candidates(&dirs, path)
            .into_iter()
            .find(|p| p.is_file())
        {
            return self.load_script_module(file, &dotted);
        }
        if let [name] = path {
            if let Some(m) = native_module(name) {
                return Ok(m);
            }
        }
        Err(KnitError::new(ErrorKind::Import, format!("No module named {dotted}")))
    }

    fn load_script_module(&mut self, file: PathBuf, name: &str) -> Result<Rc<Module>, KnitError> {
        let key = file.canonicalize().unwrap_or_else(|_| file.clone());
        if let Some(m) = self.modules.get(&key) {
            return Ok(Rc::clone(m));
        }
        if self.importing.contains(&key) {
            return Err(KnitError::new(
                ErrorKind::Import,
                format!("circular import of {name}"),
            ));
        }
        tracing::debug!(module = name, path = %file.display(), "importing");
        let text = std::fs::read_to_string(&file).map_err(|e| {
            KnitError::new(ErrorKind::Io, format!("cannot read {}: {e}", file.display()))
        })?;
        let program = parse_program(&text)?;
        let source = Source::new(file.display().to_string(), text, file.parent().map(PathBuf::from));
        let frame = Frame::child(&scope::root_of(&self.frame), FrameKind::Module);
        self.importing.push(key.clone());
        let result = self.with_source(source, |ctx| {
            ctx.with_frame(Rc::clone(&frame), |ctx| ctx.exec_block(&program.statements))
        });
        self.importing.pop();
        result?;
        let module = Rc::new(Module {
            name: name.to_string(),
            attrs: ModuleAttrs::Script(frame),
        });
        self.modules.insert(key, Rc::clone(&module));
        Ok(module)
    }
}
