//! Batches needle operations into one directional carriage pass: checks
//! that the operations can share the pass, orders them by racked position,
//! switches to all-needle racking when front and back needles align, and
//! emits the knitout.

use indexmap::IndexMap;

use crate::error::{ErrorKind, KnitError};
use crate::interpreter::scope::MachineScope;
use crate::knitout::{format_number, Instruction, KnitoutLine, NeedleInstruction, NeedleOp};
use crate::machine::{Bed, Direction, KnittingMachine, Needle};

/// Needle → second needle (for xfer and split) of every emitted operation.
pub type PassResult = IndexMap<Needle, Option<Needle>>;

#[derive(Debug, Clone)]
pub struct CarriagePass {
    needle_to_op: IndexMap<Needle, NeedleOp>,
    direction: Option<Direction>,
    target_bed: Option<Bed>,
    racking: Option<f64>,
    to_sliders: bool,
    drop_pass: Option<Box<CarriagePass>>,
}

impl CarriagePass {
    /// Drops mixed with other operations move to a drop-only sub-pass.
    pub fn new(
        needle_to_op: IndexMap<Needle, NeedleOp>,
        direction: Option<Direction>,
    ) -> Result<Self, KnitError> {
        let (drops, ops): (IndexMap<Needle, NeedleOp>, IndexMap<Needle, NeedleOp>) = needle_to_op
            .into_iter()
            .partition(|(_, op)| *op == NeedleOp::Drop);
        if ops.is_empty() {
            return Ok(Self::plain(drops, direction));
        }
        let mut ops_iter = ops.iter();
        if let Some((first_needle, first)) = ops_iter.next() {
            for (needle, op) in ops_iter {
                if !first.compatible_with(*op) {
                    return Err(KnitError::new(
                        ErrorKind::IncompatibleInCarriagePass,
                        format!(
                            "{op} on {needle} cannot share a carriage pass with {first} on {first_needle}"
                        ),
                    ));
                }
            }
        }
        if direction.is_none() {
            if let Some((needle, op)) = ops.iter().find(|(_, op)| op.directed()) {
                return Err(KnitError::new(
                    ErrorKind::RequiredDirection,
                    format!("{op} on {needle} requires a pass direction"),
                ));
            }
        }
        let mut pass = Self::plain(ops, direction);
        if !drops.is_empty() {
            pass.drop_pass = Some(Box::new(Self::plain(drops, direction)));
        }
        Ok(pass)
    }

    fn plain(needle_to_op: IndexMap<Needle, NeedleOp>, direction: Option<Direction>) -> Self {
        Self {
            needle_to_op,
            direction,
            target_bed: None,
            racking: None,
            to_sliders: false,
            drop_pass: None,
        }
    }

    /// Only needles that can move toward `bed` take part: front needles for
    /// a back-bed target and back needles for a front-bed target.
    pub fn with_target_bed(mut self, bed: Option<Bed>) -> Self {
        self.target_bed = bed;
        self
    }

    /// Racking (in sheet units) the pass runs at. The previous racking is
    /// restored afterwards.
    pub fn with_racking(mut self, racking: f64) -> Self {
        self.racking = Some(racking);
        self
    }

    pub fn to_sliders(mut self, to_sliders: bool) -> Self {
        self.to_sliders = to_sliders;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.needle_to_op.is_empty() && self.drop_pass.is_none()
    }

    pub fn has_second_needles(&self) -> bool {
        self.needle_to_op.values().any(|op| op.requires_second_needle())
    }

    fn keep_target_bed_needles(&self) -> Vec<Needle> {
        self.needle_to_op
            .keys()
            .filter(|n| match self.target_bed {
                Some(Bed::Back) => n.is_front(),
                Some(Bed::Front) => n.is_back(),
                None => true,
            })
            .copied()
            .collect()
    }

    pub fn write_knitout(
        &self,
        scope: &mut MachineScope,
        machine: &mut KnittingMachine,
        knitout: &mut Vec<KnitoutLine>,
    ) -> Result<PassResult, KnitError> {
        let mut results = PassResult::new();
        let mut drops_written = false;
        let direction = match self.direction {
            None => scope.direction().opposite(),
            Some(declared) => {
                if let Some(drops) = &self.drop_pass {
                    if scope.direction() == Direction::Leftward && declared == Direction::Leftward {
                        results.extend(drops.write_knitout(scope, machine, knitout)?);
                        drops_written = true;
                    }
                }
                scope.set_direction(declared);
                declared
            }
        };

        let cur_rack = scope.racking();
        if let Some(r) = self.racking {
            scope.set_racking(machine, knitout, r)?;
        }
        let rack = machine.rack();
        let needles = direction.sorted_needles(self.keep_target_bed_needles(), rack);

        let mut all_needle = false;
        for pair in needles.windows(2) {
            let [n, m] = pair else { continue };
            if n.racked_position_on_front(rack) != m.racked_position_on_front(rack) {
                continue;
            }
            if n.is_front() == m.is_front() {
                return Err(KnitError::new(
                    ErrorKind::RepeatedNeedle,
                    format!("needle {n} is used twice in one carriage pass"),
                ));
            }
            let op = self.op_at(n)?;
            if !op.all_needle_capable() {
                return Err(KnitError::new(
                    ErrorKind::AllNeedleOperation,
                    format!("{op} on {n} and {m} at racking {rack} would need all-needle racking"),
                ));
            }
            all_needle = true;
        }

        let physical = machine.racking();
        if all_needle {
            knitout.push(KnitoutLine::executed(
                Instruction::Rack(physical + 0.25),
                machine,
                Some(format!("All Needle racking {}", format_number(physical))),
            )?);
        }

        for needle in needles {
            let op = self.op_at(&needle)?;
            let needle_2 = op
                .requires_second_needle()
                .then(|| machine.aligned_needle(&needle, self.to_sliders));
            let carriers = if op.directed() {
                match scope.carrier() {
                    Some(cs) => Some(cs.clone()),
                    None => {
                        return Err(KnitError::new(
                            ErrorKind::NoDeclaredCarrier,
                            format!("{op} on {needle} needs a working carrier; set Carrier first"),
                        ))
                    }
                }
            } else {
                None
            };
            let instruction = Instruction::Needle(NeedleInstruction {
                op,
                direction: op.directed().then_some(direction),
                needle,
                needle_2,
                carriers,
            });
            let line = KnitoutLine::executed(instruction, machine, None)?;
            scope.sheet_record_mut().record_needle(machine, &needle);
            if let Some(n2) = needle_2 {
                if n2.position != needle.position {
                    scope.sheet_record_mut().record_needle(machine, &n2);
                }
            }
            knitout.push(line);
            results.insert(needle, needle_2);
        }

        if all_needle {
            knitout.push(KnitoutLine::executed(
                Instruction::Rack(physical),
                machine,
                Some("Reset rack from all_needle".to_string()),
            )?);
        }
        scope.set_racking(machine, knitout, cur_rack)?;

        if let (Some(drops), false) = (&self.drop_pass, drops_written) {
            results.extend(drops.write_knitout(scope, machine, knitout)?);
        }
        Ok(results)
    }

    fn op_at(&self, needle: &Needle) -> Result<NeedleOp, KnitError> {
        self.needle_to_op
            .get(needle)
            .copied()
            .ok_or_else(|| KnitError::knitting(format!("no operation recorded for {needle}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::machine::CarrierSet;
    use crate::settings::MachineSpec;

    struct Rig {
        scope: MachineScope,
        machine: KnittingMachine,
        knitout: Vec<KnitoutLine>,
    }

    impl Rig {
        fn new() -> Self {
            let mut machine = KnittingMachine::new(MachineSpec {
                width: 20,
                ..MachineSpec::default()
            });
            let mut knitout = Vec::new();
            let mut scope = MachineScope::new(&machine).unwrap();
            scope
                .set_carrier(&mut machine, &mut knitout, Some(CarrierSet::single(1)))
                .unwrap();
            knitout.clear();
            Self {
                scope,
                machine,
                knitout,
            }
        }

        fn run(&mut self, pass: &CarriagePass) -> Result<PassResult, KnitError> {
            pass.write_knitout(&mut self.scope, &mut self.machine, &mut self.knitout)
        }

        fn lines(&self) -> Vec<String> {
            self.knitout
                .iter()
                .filter_map(|l| l.instruction.as_ref().map(ToString::to_string))
                .collect()
        }
    }

    fn ops(pairs: &[(Needle, NeedleOp)]) -> IndexMap<Needle, NeedleOp> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn leftward_pass_orders_descending() {
        let mut rig = Rig::new();
        let pass = CarriagePass::new(
            ops(&[
                (Needle::front(1), NeedleOp::Tuck),
                (Needle::front(3), NeedleOp::Tuck),
            ]),
            Some(Direction::Leftward),
        )
        .unwrap();
        rig.run(&pass).unwrap();
        assert_eq!(rig.lines(), ["tuck - f3 1", "tuck - f1 1"]);
        assert_eq!(rig.scope.direction(), Direction::Leftward);
    }

    #[test]
    fn all_needle_pass_racks_and_resets() {
        let mut rig = Rig::new();
        let pass = CarriagePass::new(
            ops(&[
                (Needle::front(5), NeedleOp::Knit),
                (Needle::back(5), NeedleOp::Knit),
            ]),
            Some(Direction::Rightward),
        )
        .unwrap();
        rig.run(&pass).unwrap();
        assert_eq!(rig.lines(), ["rack 0.25", "knit + f5 1", "knit + b5 1", "rack 0"]);
        assert_eq!(rig.machine.racking(), 0.0);
    }

    #[test]
    fn racked_pair_is_not_all_needle() {
        let mut rig = Rig::new();
        rig.scope
            .set_racking(&mut rig.machine, &mut rig.knitout, 1.0)
            .unwrap();
        rig.knitout.clear();
        let pass = CarriagePass::new(
            ops(&[
                (Needle::front(5), NeedleOp::Knit),
                (Needle::back(5), NeedleOp::Knit),
            ]),
            Some(Direction::Rightward),
        )
        .unwrap();
        rig.run(&pass).unwrap();
        assert_eq!(rig.lines(), ["knit + f5 1", "knit + b5 1"]);
    }

    #[test]
    fn xfer_pass_cannot_go_all_needle() {
        let mut rig = Rig::new();
        let pass = CarriagePass::new(
            ops(&[
                (Needle::front(2), NeedleOp::Xfer),
                (Needle::back(2), NeedleOp::Xfer),
            ]),
            None,
        )
        .unwrap();
        assert_eq!(rig.run(&pass).unwrap_err().kind, ErrorKind::AllNeedleOperation);
    }

    #[test]
    fn construction_errors() {
        let mixed = CarriagePass::new(
            ops(&[
                (Needle::front(1), NeedleOp::Knit),
                (Needle::front(2), NeedleOp::Xfer),
            ]),
            Some(Direction::Leftward),
        );
        assert_eq!(mixed.unwrap_err().kind, ErrorKind::IncompatibleInCarriagePass);
        let undirected = CarriagePass::new(ops(&[(Needle::front(1), NeedleOp::Knit)]), None);
        assert_eq!(undirected.unwrap_err().kind, ErrorKind::RequiredDirection);
        assert!(CarriagePass::new(
            ops(&[
                (Needle::front(1), NeedleOp::Knit),
                (Needle::front(2), NeedleOp::Tuck),
            ]),
            Some(Direction::Leftward),
        )
        .is_ok());
    }

    #[test]
    fn knit_without_carrier_fails() {
        let mut machine = KnittingMachine::new(MachineSpec::default());
        let mut scope = MachineScope::new(&machine).unwrap();
        let mut knitout = Vec::new();
        let pass = CarriagePass::new(ops(&[(Needle::front(1), NeedleOp::Knit)]), Some(Direction::Leftward))
            .unwrap();
        let err = pass.write_knitout(&mut scope, &mut machine, &mut knitout).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoDeclaredCarrier);
    }

    #[test]
    fn undeclared_direction_runs_opposite_without_updating() {
        let mut rig = Rig::new();
        rig.scope.set_direction(Direction::Leftward);
        let tuck = CarriagePass::new(
            ops(&[(Needle::front(0), NeedleOp::Tuck), (Needle::front(1), NeedleOp::Tuck)]),
            Some(Direction::Leftward),
        )
        .unwrap();
        rig.run(&tuck).unwrap();
        rig.knitout.clear();
        let xfers = CarriagePass::new(
            ops(&[(Needle::front(0), NeedleOp::Xfer), (Needle::front(1), NeedleOp::Xfer)]),
            None,
        )
        .unwrap();
        let result = rig.run(&xfers).unwrap();
        assert_eq!(rig.lines(), ["xfer f0 b0", "xfer f1 b1"]);
        assert_eq!(result.get(&Needle::front(0)), Some(&Some(Needle::back(0))));
        assert_eq!(rig.scope.direction(), Direction::Leftward);
    }

    #[test]
    fn leftward_drops_follow_in_same_sweep() {
        let mut rig = Rig::new();
        let tuck = CarriagePass::new(
            ops(&[(Needle::front(0), NeedleOp::Tuck), (Needle::front(2), NeedleOp::Tuck)]),
            Some(Direction::Leftward),
        )
        .unwrap();
        rig.run(&tuck).unwrap();
        rig.knitout.clear();
        let pass = CarriagePass::new(
            ops(&[
                (Needle::front(0), NeedleOp::Drop),
                (Needle::front(1), NeedleOp::Knit),
                (Needle::front(2), NeedleOp::Drop),
            ]),
            Some(Direction::Leftward),
        )
        .unwrap();
        rig.run(&pass).unwrap();
        assert_eq!(rig.lines(), ["drop f2", "drop f0", "knit - f1 1"]);
    }

    #[test]
    fn target_bed_filters_needles() {
        let mut rig = Rig::new();
        let pass = CarriagePass::new(
            ops(&[(Needle::front(3), NeedleOp::Xfer), (Needle::back(4), NeedleOp::Xfer)]),
            None,
        )
        .unwrap()
        .with_target_bed(Some(Bed::Back));
        rig.run(&pass).unwrap();
        assert_eq!(rig.lines(), ["xfer f3 b3"]);
    }

    #[test]
    fn pass_racking_is_restored() {
        let mut rig = Rig::new();
        let pass = CarriagePass::new(ops(&[(Needle::front(3), NeedleOp::Xfer)]), None)
            .unwrap()
            .with_racking(-1.0);
        rig.run(&pass).unwrap();
        assert_eq!(rig.lines(), ["rack -1", "xfer f3 b4", "rack 0"]);
    }
}
