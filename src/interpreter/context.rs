//! Everything one interpreter run mutates: the machine, the knitout
//! buffer, the machine variables and the frame chain.

use std::path::PathBuf;
use std::rc::Rc;

use indexmap::IndexMap;

use super::scope::{self, is_machine_variable, Frame, FrameRef, MachineScope};
use super::value::{Module, Source, Value};
use crate::carriage_pass::PassResult;
use crate::dsl::ast::Span;
use crate::error::KnitError;
use crate::knitout::{Instruction, KnitoutLine};
use crate::machine::{Bed, KnittingMachine, Needle};
use crate::settings::MachineSpec;

/// Needle-set vocabulary evaluated against the active sheet.
pub const NEEDLE_SETS: [&str; 13] = [
    "Needles",
    "Front_Needles",
    "Back_Needles",
    "Sliders",
    "Front_Sliders",
    "Back_Sliders",
    "Loops",
    "Front_Loops",
    "Back_Loops",
    "Slider_Loops",
    "Front_Slider_Loops",
    "Back_Slider_Loops",
    "Last_Pass",
];

pub struct Context {
    pub machine: KnittingMachine,
    pub knitout: Vec<KnitoutLine>,
    pub machine_scope: MachineScope,
    pub frame: FrameRef,
    pub last_pass: PassResult,
    pub source: Rc<Source>,
    pub import_paths: Vec<PathBuf>,
    pub(crate) modules: IndexMap<PathBuf, Rc<Module>>,
    pub(crate) importing: Vec<PathBuf>,
    /// Value of a top-level `return`.
    pub exit_value: Option<Value>,
    pub(crate) call_depth: usize,
}

impl Context {
    pub fn new(spec: MachineSpec, import_paths: Vec<PathBuf>, source: Rc<Source>) -> Result<Self, KnitError> {
        let machine = KnittingMachine::new(spec);
        let machine_scope = MachineScope::new(&machine)?;
        Ok(Self {
            machine,
            knitout: Vec::new(),
            machine_scope,
            frame: Frame::root(),
            last_pass: PassResult::new(),
            source,
            import_paths,
            modules: IndexMap::new(),
            importing: Vec::new(),
            exit_value: None,
            call_depth: 0,
        })
    }

    /// Attach the location of `span` in the current source.
    pub fn locate(&self, err: KnitError, span: Span) -> KnitError {
        if err.span.is_some() {
            return err;
        }
        let line = self.source.line_of(span.start);
        err.at(span, line)
    }

    /// Run `f` with `frame` as the current frame, restoring the previous
    /// frame on every exit.
    pub fn with_frame<T>(
        &mut self,
        frame: FrameRef,
        f: impl FnOnce(&mut Self) -> Result<T, KnitError>,
    ) -> Result<T, KnitError> {
        let saved = std::mem::replace(&mut self.frame, frame);
        let result = f(self);
        self.frame = saved;
        result
    }

    pub fn with_source<T>(
        &mut self,
        source: Rc<Source>,
        f: impl FnOnce(&mut Self) -> Result<T, KnitError>,
    ) -> Result<T, KnitError> {
        let saved = std::mem::replace(&mut self.source, source);
        let result = f(self);
        self.source = saved;
        result
    }

    /// `name = value` with machine-variable setters and frame rebinding.
    pub fn assign(&mut self, name: &str, value: Value) -> Result<(), KnitError> {
        if self.set_machine_variable(name, &value)? {
            return Ok(());
        }
        check_assignable(name)?;
        scope::assign(&self.frame, name, value);
        Ok(())
    }

    /// Bind in the current frame only, as for loop variables and `with`.
    pub fn define(&mut self, name: &str, value: Value) -> Result<(), KnitError> {
        if self.set_machine_variable(name, &value)? {
            return Ok(());
        }
        check_assignable(name)?;
        scope::define_local(&self.frame, name, value);
        Ok(())
    }

    /// `global name = value`
    pub fn assign_global(&mut self, name: &str, value: Value) -> Result<(), KnitError> {
        if self.set_machine_variable(name, &value)? {
            return Ok(());
        }
        check_assignable(name)?;
        scope::assign_global(&self.frame, name, value);
        Ok(())
    }

    pub fn set_machine_variable(&mut self, name: &str, value: &Value) -> Result<bool, KnitError> {
        if !is_machine_variable(name) {
            return Ok(false);
        }
        self.machine_scope
            .set_variable(&mut self.machine, &mut self.knitout, name, value)
    }

    /// Needle at sheet-local position `pos` of the active sheet.
    pub fn sheet_needle(&self, bed: Bed, pos: i32, is_slider: bool) -> Result<Needle, KnitError> {
        let sheet = self.machine_scope.sheet();
        sheet
            .get_needle(bed, pos, is_slider)
            .ok_or_else(|| KnitError::value(format!("sheet position {pos} on {sheet} is out of range")))
    }

    /// Execute an instruction and append it to the output.
    pub fn emit(&mut self, instruction: Instruction, comment: Option<String>) -> Result<(), KnitError> {
        let line = KnitoutLine::executed(instruction, &mut self.machine, comment)?;
        self.knitout.push(line);
        Ok(())
    }

    /// Value of a needle-set name on the active sheet.
    pub fn needle_set(&self, name: &str) -> Option<Value> {
        if name == "Last_Pass" {
            let entries = self
                .last_pass
                .iter()
                .map(|(n, n2)| {
                    (
                        super::value::Key::Needle(*n),
                        n2.map_or(Value::None, Value::Needle),
                    )
                })
                .collect();
            return Some(Value::dict(entries));
        }
        let sheet = self.machine_scope.sheet().sheet;
        let record = self.machine_scope.sheet_record();
        let m = &self.machine;
        let both = |f: &dyn Fn(Bed) -> Vec<Needle>| {
            let mut out = f(Bed::Front);
            out.extend(f(Bed::Back));
            out
        };
        let needles = match name {
            "Needles" => both(&|b| record.needles(m, sheet, b, false)),
            "Front_Needles" => record.needles(m, sheet, Bed::Front, false),
            "Back_Needles" => record.needles(m, sheet, Bed::Back, false),
            "Sliders" => both(&|b| record.needles(m, sheet, b, true)),
            "Front_Sliders" => record.needles(m, sheet, Bed::Front, true),
            "Back_Sliders" => record.needles(m, sheet, Bed::Back, true),
            "Loops" => both(&|b| record.loops(m, sheet, b, false)),
            "Front_Loops" => record.loops(m, sheet, Bed::Front, false),
            "Back_Loops" => record.loops(m, sheet, Bed::Back, false),
            "Slider_Loops" => both(&|b| record.loops(m, sheet, b, true)),
            "Front_Slider_Loops" => record.loops(m, sheet, Bed::Front, true),
            "Back_Slider_Loops" => record.loops(m, sheet, Bed::Back, true),
            _ => return None,
        };
        Some(Value::needles(needles))
    }
}

fn check_assignable(name: &str) -> Result<(), KnitError> {
    if NEEDLE_SETS.contains(&name) || name == "machine" {
        return Err(KnitError::name(format!("{name} is reserved and cannot be assigned")));
    }
    Ok(())
}
