//! Variable frames and the machine-state variables (`Direction`, `Carrier`,
//! `Racking`, `Gauge`, `Sheet`) whose assignment drives the machine.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use super::value::Value;
use crate::error::{ErrorKind, KnitError, KnitWarning};
use crate::knitout::{format_number, Instruction, KnitoutLine};
use crate::machine::{CarrierSet, Direction, KnittingMachine, SheetIdentifier};
use crate::sheet::GaugedSheetRecord;

/// Names whose assignment runs a machine setter instead of a binding.
pub const MACHINE_VARIABLES: [&str; 5] = ["Direction", "Carrier", "Racking", "Sheet", "Gauge"];

pub fn is_machine_variable(name: &str) -> bool {
    MACHINE_VARIABLES.contains(&name)
}

// ── Machine scope ────────────────────────────────────────────────

/// Working machine settings shared by every frame of one run.
#[derive(Debug, Clone)]
pub struct MachineScope {
    direction: Direction,
    carrier: Option<CarrierSet>,
    racking: f64,
    gauge: i32,
    sheet: SheetIdentifier,
    sheet_record: GaugedSheetRecord,
}

impl MachineScope {
    pub fn new(machine: &KnittingMachine) -> Result<Self, KnitError> {
        Ok(Self {
            direction: Direction::Leftward,
            carrier: None,
            racking: 0.0,
            gauge: 1,
            sheet: SheetIdentifier::new(0, 1),
            sheet_record: GaugedSheetRecord::new(1, machine)?,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    pub fn carrier(&self) -> Option<&CarrierSet> {
        self.carrier.as_ref()
    }

    /// Change the working carrier set. Inactive carriers are brought in:
    /// loose yarns through the inserting hook (releasing whatever holds it),
    /// attached yarns from the grippers.
    pub fn set_carrier(
        &mut self,
        machine: &mut KnittingMachine,
        knitout: &mut Vec<KnitoutLine>,
        carrier: Option<CarrierSet>,
    ) -> Result<(), KnitError> {
        if self.carrier == carrier {
            return Ok(());
        }
        self.carrier = carrier;
        let Some(set) = self.carrier.clone() else {
            return Ok(());
        };
        if machine.carrier_system.is_active(&set) {
            return Ok(());
        }
        for &id in set.ids() {
            if machine.carrier_system.get(id)?.is_active() {
                continue;
            }
            if machine.yarn_is_loose(id) {
                if let Some(hooked) = machine.carrier_system.hooked_carriers().cloned() {
                    knitout.push(KnitoutLine::executed(
                        Instruction::Releasehook(hooked.clone()),
                        machine,
                        Some(format!("Release {hooked} to activate carrier {id}")),
                    )?);
                }
                knitout.push(KnitoutLine::executed(
                    Instruction::Inhook(CarrierSet::single(id)),
                    machine,
                    Some(format!("Activating carrier {id}")),
                )?);
            } else {
                knitout.push(KnitoutLine::executed(
                    Instruction::In(CarrierSet::single(id)),
                    machine,
                    Some(format!("Bring in {id} from grippers")),
                )?);
            }
        }
        Ok(())
    }

    /// Racking in sheet units.
    pub fn racking(&self) -> f64 {
        self.racking
    }

    /// Rack to `racking` sheet units, which is `racking · gauge` needles.
    pub fn set_racking(
        &mut self,
        machine: &mut KnittingMachine,
        knitout: &mut Vec<KnitoutLine>,
        racking: f64,
    ) -> Result<(), KnitError> {
        if (self.racking - racking).abs() < f64::EPSILON {
            return Ok(());
        }
        let physical = f64::from(self.gauge) * racking;
        knitout.push(KnitoutLine::executed(
            Instruction::Rack(physical),
            machine,
            Some(format!(
                "Rack to {} at {} gauge",
                format_number(racking),
                self.gauge
            )),
        )?);
        self.racking = racking;
        Ok(())
    }

    pub fn gauge(&self) -> i32 {
        self.gauge
    }

    /// A new gauge starts a fresh sheet record. A sheet past the new gauge
    /// is clipped to the last sheet.
    pub fn set_gauge(
        &mut self,
        machine: &mut KnittingMachine,
        knitout: &mut Vec<KnitoutLine>,
        gauge: i32,
    ) -> Result<(), KnitError> {
        if gauge == self.gauge {
            return Ok(());
        }
        self.sheet_record = GaugedSheetRecord::new(gauge, machine)?;
        self.gauge = gauge;
        if self.sheet.sheet >= gauge {
            KnitWarning::SheetBeyondGauge {
                sheet: i64::from(self.sheet.sheet),
                gauge: i64::from(gauge),
            }
            .emit();
            self.set_sheet(machine, knitout, SheetIdentifier::new(gauge - 1, gauge))
        } else {
            self.set_sheet(machine, knitout, SheetIdentifier::new(self.sheet.sheet, gauge))
        }
    }

    pub fn sheet(&self) -> SheetIdentifier {
        self.sheet
    }

    /// Switch the active sheet and return its loops to their recorded beds.
    pub fn set_sheet(
        &mut self,
        machine: &mut KnittingMachine,
        knitout: &mut Vec<KnitoutLine>,
        sheet: SheetIdentifier,
    ) -> Result<(), KnitError> {
        if sheet.sheet < 0 {
            return Err(KnitError::new(
                ErrorKind::SheetValue,
                format!("Sheet must be between 0 and gauge {} but got {}", sheet.gauge, sheet.sheet),
            ));
        }
        if sheet.gauge != self.gauge {
            self.set_gauge(machine, knitout, sheet.gauge)?;
        }
        let mut sheet = SheetIdentifier::new(sheet.sheet, self.gauge);
        if sheet.sheet >= self.gauge {
            KnitWarning::SheetBeyondGauge {
                sheet: i64::from(sheet.sheet),
                gauge: i64::from(self.gauge),
            }
            .emit();
            sheet = SheetIdentifier::new(self.gauge - 1, self.gauge);
        }
        if sheet == self.sheet {
            return Ok(());
        }
        tracing::debug!(sheet = sheet.sheet, gauge = self.gauge, "resetting to sheet");
        self.sheet = sheet;
        knitout.push(KnitoutLine::comment(format!(
            "Resetting to sheet {} of {}",
            sheet.sheet, self.gauge
        )));
        knitout.extend(self.sheet_record.reset_to_sheet(machine, sheet.sheet)?);
        Ok(())
    }

    pub fn sheet_record(&self) -> &GaugedSheetRecord {
        &self.sheet_record
    }

    pub fn sheet_record_mut(&mut self) -> &mut GaugedSheetRecord {
        &mut self.sheet_record
    }

    /// Current value of a machine variable.
    pub fn get_variable(&self, name: &str) -> Option<Value> {
        Some(match name {
            "Direction" => Value::Direction(self.direction),
            "Carrier" => self.carrier.clone().map_or(Value::None, Value::CarrierSet),
            "Racking" => Value::Float(self.racking),
            "Gauge" => Value::Int(i64::from(self.gauge)),
            "Sheet" => Value::Sheet(self.sheet),
            _ => return None,
        })
    }

    /// Assign a machine variable, coercing the value. Returns false when
    /// `name` is not a machine variable.
    pub fn set_variable(
        &mut self,
        machine: &mut KnittingMachine,
        knitout: &mut Vec<KnitoutLine>,
        name: &str,
        value: &Value,
    ) -> Result<bool, KnitError> {
        match name {
            "Direction" => match value {
                Value::Direction(d) => self.set_direction(*d),
                other => {
                    return Err(KnitError::type_error(format!(
                        "Direction cannot be set to non-direction {}",
                        other.repr()
                    )))
                }
            },
            "Carrier" => {
                let carrier = coerce_carrier(value)?;
                self.set_carrier(machine, knitout, carrier)?;
            }
            "Racking" => self.set_racking(machine, knitout, value.as_f64()?)?,
            "Gauge" => {
                let gauge = match value {
                    Value::None => 1,
                    other => other.as_i32()?,
                };
                if !(1..=crate::sheet::MAX_GAUGE).contains(&gauge) {
                    return Err(KnitError::new(
                        ErrorKind::GaugeValue,
                        format!(
                            "Gauge must be between 1 and {} but got {gauge}",
                            crate::sheet::MAX_GAUGE
                        ),
                    ));
                }
                self.set_gauge(machine, knitout, gauge)?;
            }
            "Sheet" => {
                let sheet = match value {
                    Value::None => SheetIdentifier::new(0, self.gauge),
                    Value::Sheet(s) => *s,
                    other => SheetIdentifier::new(other.as_i32()?, self.gauge),
                };
                self.set_sheet(machine, knitout, sheet)?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Interpret a value as a working carrier set.
pub fn coerce_carrier(value: &Value) -> Result<Option<CarrierSet>, KnitError> {
    let id = |v: &Value| -> Result<u32, KnitError> {
        match v {
            Value::Carrier(c) => Ok(*c),
            other => {
                let raw = match other {
                    Value::Float(f) => f.trunc() as i64,
                    _ => other.as_int()?,
                };
                u32::try_from(raw)
                    .map_err(|_| KnitError::value(format!("{raw} is not a carrier id")))
            }
        }
    };
    Ok(match value {
        Value::None => None,
        Value::CarrierSet(cs) => Some(cs.clone()),
        Value::List(items) => Some(CarrierSet::new(
            items.borrow().iter().map(id).collect::<Result<Vec<_>, _>>()?,
        )),
        Value::Int(_) | Value::Float(_) | Value::Carrier(_) => Some(CarrierSet::single(id(value)?)),
        other => {
            return Err(KnitError::type_error(format!(
                "expected carrier to be set by int, list of ints, carrier or carrier set but got {}",
                other.repr()
            )))
        }
    })
}

// ── Variable frames ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Root,
    Module,
    Function,
    Block,
}

pub type FrameRef = Rc<RefCell<Frame>>;

#[derive(Debug)]
pub struct Frame {
    pub kind: FrameKind,
    vars: IndexMap<String, Value>,
    parent: Option<FrameRef>,
}

impl Frame {
    pub fn root() -> FrameRef {
        Rc::new(RefCell::new(Frame {
            kind: FrameKind::Root,
            vars: IndexMap::new(),
            parent: None,
        }))
    }

    pub fn child(parent: &FrameRef, kind: FrameKind) -> FrameRef {
        Rc::new(RefCell::new(Frame {
            kind,
            vars: IndexMap::new(),
            parent: Some(Rc::clone(parent)),
        }))
    }

    pub fn get_own(&self, name: &str) -> Option<Value> {
        self.vars.get(name).cloned()
    }

    pub fn has_own(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn set_own(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn remove_own(&mut self, name: &str) -> Option<Value> {
        self.vars.shift_remove(name)
    }

    pub fn parent(&self) -> Option<FrameRef> {
        self.parent.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.vars.keys().cloned().collect()
    }
}

/// Read a name, walking outward through every enclosing frame.
pub fn lookup(frame: &FrameRef, name: &str) -> Option<Value> {
    let mut current = Some(Rc::clone(frame));
    while let Some(f) = current {
        let f = f.borrow();
        if let Some(v) = f.get_own(name) {
            return Some(v);
        }
        current = f.parent();
    }
    None
}

/// Frame that already binds `name`, searching outward but not past the
/// nearest function or module frame.
fn binding_frame(frame: &FrameRef, name: &str) -> Option<FrameRef> {
    let mut current = Some(Rc::clone(frame));
    while let Some(f) = current {
        let (found, stop, parent) = {
            let b = f.borrow();
            (
                b.has_own(name),
                matches!(b.kind, FrameKind::Function | FrameKind::Module),
                b.parent(),
            )
        };
        if found {
            return Some(f);
        }
        if stop {
            return None;
        }
        current = parent;
    }
    None
}

/// Rebind `name` where it is already bound, or bind it in `frame`.
/// A new binding hiding an outer one warns.
pub fn assign(frame: &FrameRef, name: &str, value: Value) {
    if let Some(owner) = binding_frame(frame, name) {
        owner.borrow_mut().set_own(name, value);
        return;
    }
    define_local(frame, name, value);
}

/// Bind `name` in `frame` itself.
pub fn define_local(frame: &FrameRef, name: &str, value: Value) {
    let shadows = {
        let f = frame.borrow();
        !f.has_own(name) && f.parent().is_some_and(|p| lookup(&p, name).is_some())
    };
    if shadows {
        KnitWarning::ShadowVariable {
            name: name.to_string(),
        }
        .emit();
    }
    frame.borrow_mut().set_own(name, value);
}

pub fn root_of(frame: &FrameRef) -> FrameRef {
    let mut current = Rc::clone(frame);
    loop {
        let parent = current.borrow().parent();
        match parent {
            Some(p) => current = p,
            None => return current,
        }
    }
}

/// Bind `name` in the outermost frame.
pub fn assign_global(frame: &FrameRef, name: &str, value: Value) {
    root_of(frame).borrow_mut().set_own(name, value);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::machine::Needle;
    use crate::settings::MachineSpec;

    fn rig() -> (MachineScope, KnittingMachine, Vec<KnitoutLine>) {
        let machine = KnittingMachine::new(MachineSpec {
            width: 12,
            ..MachineSpec::default()
        });
        let scope = MachineScope::new(&machine).unwrap();
        (scope, machine, Vec::new())
    }

    fn text(lines: &[KnitoutLine]) -> Vec<String> {
        lines.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn second_loose_carrier_releases_the_hook() {
        let (mut scope, mut machine, mut out) = rig();
        scope
            .set_variable(&mut machine, &mut out, "Carrier", &Value::Int(1))
            .unwrap();
        scope
            .set_variable(&mut machine, &mut out, "Carrier", &Value::Carrier(2))
            .unwrap();
        assert_eq!(
            text(&out),
            [
                "inhook 1 ;Activating carrier 1",
                "releasehook 1 ;Release 1 to activate carrier 2",
                "inhook 2 ;Activating carrier 2"
            ]
        );
    }

    #[test]
    fn unchanged_carrier_emits_nothing() {
        let (mut scope, mut machine, mut out) = rig();
        scope
            .set_carrier(&mut machine, &mut out, Some(CarrierSet::single(3)))
            .unwrap();
        out.clear();
        scope
            .set_variable(&mut machine, &mut out, "Carrier", &Value::list(vec![Value::Int(3)]))
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn racking_scales_with_gauge() {
        let (mut scope, mut machine, mut out) = rig();
        scope
            .set_variable(&mut machine, &mut out, "Gauge", &Value::Int(2))
            .unwrap();
        out.clear();
        scope
            .set_variable(&mut machine, &mut out, "Racking", &Value::Int(1))
            .unwrap();
        assert_eq!(text(&out), ["rack 2 ;Rack to 1 at 2 gauge"]);
        assert_eq!(machine.racking(), 2.0);
    }

    #[test]
    fn gauge_out_of_range() {
        let (mut scope, mut machine, mut out) = rig();
        let err = scope
            .set_variable(&mut machine, &mut out, "Gauge", &Value::Int(10))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::GaugeValue);
    }

    #[test]
    fn sheet_beyond_gauge_clips() {
        let (mut scope, mut machine, mut out) = rig();
        scope
            .set_variable(&mut machine, &mut out, "Gauge", &Value::Int(3))
            .unwrap();
        scope
            .set_variable(&mut machine, &mut out, "Sheet", &Value::Int(5))
            .unwrap();
        assert_eq!(scope.sheet(), SheetIdentifier::new(2, 3));
        let err = scope
            .set_variable(&mut machine, &mut out, "Sheet", &Value::Int(-1))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SheetValue);
    }

    #[test]
    fn lowering_gauge_clips_sheet() {
        let (mut scope, mut machine, mut out) = rig();
        scope
            .set_variable(&mut machine, &mut out, "Sheet", &Value::Sheet(SheetIdentifier::new(2, 3)))
            .unwrap();
        assert_eq!(scope.gauge(), 3);
        scope
            .set_variable(&mut machine, &mut out, "Gauge", &Value::Int(2))
            .unwrap();
        assert_eq!(scope.sheet(), SheetIdentifier::new(1, 2));
    }

    #[test]
    fn sheet_switch_peels_loops() {
        let (mut scope, mut machine, mut out) = rig();
        scope
            .set_carrier(&mut machine, &mut out, Some(CarrierSet::single(1)))
            .unwrap();
        scope
            .set_variable(&mut machine, &mut out, "Gauge", &Value::Int(2))
            .unwrap();
        machine
            .tuck(&Needle::front(0), &CarrierSet::single(1), "tuck - f0 1")
            .unwrap();
        scope.sheet_record_mut().record_needle(&machine, &Needle::front(0));
        scope.sheet_record_mut().swap_layer_at_positions(0, 1).unwrap();
        out.clear();
        scope
            .set_variable(&mut machine, &mut out, "Sheet", &Value::Int(1))
            .unwrap();
        assert_eq!(out.first().map(ToString::to_string).unwrap(), ";Resetting to sheet 1 of 2");
        assert!(machine.has_loops(&Needle::back(0)));
        assert!(!machine.has_loops(&Needle::front(0)));
        scope
            .set_variable(&mut machine, &mut out, "Sheet", &Value::Int(0))
            .unwrap();
        assert!(machine.has_loops(&Needle::front(0)));
        assert!(!machine.has_loops(&Needle::back(0)));
    }

    #[test]
    fn direction_rejects_other_types() {
        let (mut scope, mut machine, mut out) = rig();
        assert!(scope
            .set_variable(&mut machine, &mut out, "Direction", &Value::Int(1))
            .is_err());
        assert!(!scope
            .set_variable(&mut machine, &mut out, "width", &Value::Int(1))
            .unwrap());
    }

    #[test]
    fn assignment_rebinds_outer_block_binding() {
        let root = Frame::root();
        define_local(&root, "x", Value::Int(1));
        let block = Frame::child(&root, FrameKind::Block);
        assign(&block, "x", Value::Int(2));
        assert!(!block.borrow().has_own("x"));
        assert!(lookup(&root, "x").unwrap().equals(&Value::Int(2)));
    }

    #[test]
    fn function_frames_bind_locally() {
        let root = Frame::root();
        define_local(&root, "x", Value::Int(1));
        let func = Frame::child(&root, FrameKind::Function);
        assign(&func, "x", Value::Int(2));
        assert!(func.borrow().has_own("x"));
        assert!(lookup(&root, "x").unwrap().equals(&Value::Int(1)));
        assign_global(&func, "y", Value::Int(3));
        assert!(root.borrow().has_own("y"));
    }
}
