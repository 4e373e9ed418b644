//! Gauged sheets: several virtual layers knitted on one bed pair.
//!
//! Sheet `s` of gauge `g` owns physical positions `p` with `p % g == s`.
//! Each position also has a layer (0 is frontmost). Switching the active
//! sheet peels other sheets' loops out of its working plane and returns the
//! new sheet's loops to the beds they were recorded on.

use indexmap::IndexMap;

use crate::error::{ErrorKind, KnitError};
use crate::knit_graph::LoopId;
use crate::knitout::{Instruction, KnitoutLine, NeedleInstruction, NeedleOp};
use crate::machine::{Bed, KnittingMachine, Needle, SheetNeedle};

/// Largest gauge a pattern may request.
pub const MAX_GAUGE: i32 = 9;

/// How `set_layer_position` makes room for the new layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayerRule {
    #[default]
    PushForward,
    PushBackward,
    Swap,
}

/// Loop presence recorded for one sheet, keyed by physical position.
#[derive(Debug, Clone)]
struct SheetRecord {
    loop_record: IndexMap<i32, (bool, bool)>,
}

#[derive(Debug, Clone)]
pub struct GaugedSheetRecord {
    gauge: i32,
    sheets: Vec<SheetRecord>,
    needle_pos_to_layer: Vec<i32>,
}

fn sheet_positions(machine: &KnittingMachine, sheet: i32, gauge: i32) -> impl Iterator<Item = i32> {
    (0..machine.width()).filter(move |p| p.rem_euclid(gauge) == sheet)
}

fn presence(machine: &KnittingMachine, position: i32) -> (bool, bool) {
    (
        machine.has_loops(&Needle::front(position)),
        machine.has_loops(&Needle::back(position)),
    )
}

fn loop_list(loops: &[LoopId]) -> String {
    let names: Vec<String> = loops.iter().map(ToString::to_string).collect();
    format!("[{}]", names.join(", "))
}

/// Execute an xfer and return its knitout line.
pub(crate) fn xfer_line(
    machine: &mut KnittingMachine,
    from: Needle,
    to: Needle,
    comment: Option<String>,
) -> Result<KnitoutLine, KnitError> {
    let instruction = Instruction::Needle(NeedleInstruction {
        needle_2: Some(to),
        ..NeedleInstruction::new(NeedleOp::Xfer, from)
    });
    KnitoutLine::executed(instruction, machine, comment)
}

impl GaugedSheetRecord {
    pub fn new(gauge: i32, machine: &KnittingMachine) -> Result<Self, KnitError> {
        if !(1..=MAX_GAUGE).contains(&gauge) {
            return Err(KnitError::new(
                ErrorKind::GaugeValue,
                format!("Gauge must be between 1 and {MAX_GAUGE} but got {gauge}"),
            ));
        }
        let sheets = (0..gauge)
            .map(|s| SheetRecord {
                loop_record: sheet_positions(machine, s, gauge)
                    .map(|p| (p, presence(machine, p)))
                    .collect(),
            })
            .collect();
        let needle_pos_to_layer = (0..machine.width()).map(|p| p % gauge).collect();
        Ok(Self {
            gauge,
            sheets,
            needle_pos_to_layer,
        })
    }

    pub fn gauge(&self) -> i32 {
        self.gauge
    }

    fn check_sheet(&self, sheet: i32) -> Result<usize, KnitError> {
        usize::try_from(sheet)
            .ok()
            .filter(|s| *s < self.sheets.len())
            .ok_or_else(|| {
                KnitError::new(
                    ErrorKind::SheetValue,
                    format!("Sheet must be between 0 and gauge {} but got {sheet}", self.gauge),
                )
            })
    }

    /// Snapshot loop presence at a needle's position into its sheet's record.
    pub fn record_needle(&mut self, machine: &KnittingMachine, needle: &Needle) {
        let sheet = needle.position.rem_euclid(self.gauge);
        let has = presence(machine, needle.position);
        if let Some(record) = usize::try_from(sheet).ok().and_then(|s| self.sheets.get_mut(s)) {
            record.loop_record.insert(needle.position, has);
        }
    }

    /// Re-record every position of one sheet.
    pub fn record_sheet(&mut self, machine: &KnittingMachine, sheet: i32) -> Result<(), KnitError> {
        let index = self.check_sheet(sheet)?;
        let fresh: IndexMap<i32, (bool, bool)> = sheet_positions(machine, sheet, self.gauge)
            .map(|p| (p, presence(machine, p)))
            .collect();
        if let Some(record) = self.sheets.get_mut(index) {
            record.loop_record = fresh;
        }
        Ok(())
    }

    /// Move other sheets' loops out of the active sheet's plane: loops in a
    /// layer in front of the active one go to the front bed, loops behind go
    /// to the back bed. Returns the executed xfers and the positions whose
    /// layer equals the active sheet's layer.
    pub fn peel_sheet_relative_to_active_sheet(
        &self,
        machine: &mut KnittingMachine,
        active_sheet: i32,
    ) -> Result<(Vec<KnitoutLine>, Vec<i32>), KnitError> {
        self.check_sheet(active_sheet)?;
        let mut peel_order: Vec<Vec<Needle>> = vec![Vec::new(); self.sheets.len()];
        let mut same_layer = Vec::new();
        for (pos, layer) in self.needle_pos_to_layer.iter().enumerate() {
            let pos = pos as i32;
            let (front_has, back_has) = presence(machine, pos);
            if !(front_has || back_has) {
                continue;
            }
            let sn = SheetNeedle::from_needle(Needle::back(pos), self.gauge);
            if sn.sheet == active_sheet {
                continue;
            }
            let active_layer = self.get_layer_at_position(sn.on_sheet(active_sheet).position())?;
            if active_layer == *layer {
                same_layer.push(pos);
            }
            let peel = if *layer < active_layer && back_has {
                Some(Needle::back(pos))
            } else if *layer > active_layer && front_has {
                Some(Needle::front(pos))
            } else {
                None
            };
            if let (Some(needle), Some(bucket)) = (peel, peel_order.get_mut(sn.sheet as usize)) {
                bucket.push(needle);
            }
        }
        let mut lines = Vec::new();
        for (sheet, needles) in peel_order.into_iter().enumerate() {
            if needles.is_empty() {
                continue;
            }
            tracing::debug!(sheet, active_sheet, count = needles.len(), "peeling sheet");
            lines.push(KnitoutLine::comment(format!(
                "Peel sheet {sheet} relative to {active_sheet}"
            )));
            for needle in needles {
                lines.push(xfer_line(machine, needle, needle.opposite(), None)?);
            }
        }
        Ok((lines, same_layer))
    }

    /// Peel relative to `sheet`, then return its loops to the beds recorded
    /// for it.
    pub fn reset_to_sheet(
        &self,
        machine: &mut KnittingMachine,
        sheet: i32,
    ) -> Result<Vec<KnitoutLine>, KnitError> {
        let index = self.check_sheet(sheet)?;
        let (mut lines, _) = self.peel_sheet_relative_to_active_sheet(machine, sheet)?;
        let Some(record) = self.sheets.get(index) else {
            return Ok(lines);
        };
        for (&pos, &(front_had, back_had)) in &record.loop_record {
            let f = Needle::front(pos);
            let b = Needle::back(pos);
            let (front_has, back_has) = presence(machine, pos);
            if (front_had || back_had) && !(front_has || back_has) {
                let lost = if front_had { f } else { b };
                return Err(KnitError::new(
                    ErrorKind::LostSheetLoops,
                    format!("Lost loops recorded on {lost}. Sheet cannot be reset."),
                ));
            }
            if front_had && back_had {
                if !(front_has && back_has) {
                    return Err(KnitError::new(
                        ErrorKind::SheetPeelingStackedLoops,
                        format!(
                            "Loops recorded on {f} and {b}, but peeled loops cannot be returned to a separated state"
                        ),
                    ));
                }
            } else if front_had || back_had {
                let (home, away) = if front_had { (f, b) } else { (b, f) };
                let home_has = machine.has_loops(&home);
                let away_has = machine.has_loops(&away);
                if home_has && away_has {
                    return Err(KnitError::new(
                        ErrorKind::SheetPeelingBlockedLoops,
                        format!("Cannot return loops from {home} because loops are held on {away}"),
                    ));
                }
                if !home_has {
                    let comment = format!("return loops {}", loop_list(machine.loops(&away)));
                    lines.push(xfer_line(machine, away, home, Some(comment))?);
                }
            }
        }
        Ok(lines)
    }

    // ── Layers ───────────────────────────────────────────────────

    pub fn get_layer_at_position(&self, position: i32) -> Result<i32, KnitError> {
        usize::try_from(position)
            .ok()
            .and_then(|p| self.needle_pos_to_layer.get(p))
            .copied()
            .ok_or_else(|| KnitError::index(format!("no needle position {position} on this machine")))
    }

    fn set_layer(&mut self, position: i32, layer: i32) -> Result<(), KnitError> {
        let slot = usize::try_from(position)
            .ok()
            .and_then(|p| self.needle_pos_to_layer.get_mut(p))
            .ok_or_else(|| KnitError::index(format!("no needle position {position} on this machine")))?;
        *slot = layer;
        Ok(())
    }

    /// The needle at the same sheet position on every sheet, in sheet order.
    pub fn sheet_needles_at_needle_position(&self, needle: &Needle) -> Vec<SheetNeedle> {
        let sn = SheetNeedle::from_needle(*needle, self.gauge);
        (0..self.gauge).map(|s| sn.on_sheet(s)).collect()
    }

    pub fn swap_layer_at_positions(&mut self, a: i32, b: i32) -> Result<(), KnitError> {
        let a_layer = self.get_layer_at_position(a)?;
        let b_layer = self.get_layer_at_position(b)?;
        self.set_layer(a, b_layer)?;
        self.set_layer(b, a_layer)
    }

    /// Rotate the layers at a sheet position: the layer of sheet `s` moves to
    /// sheet `(s + pushed) % gauge`.
    pub fn push_layer_backward(&mut self, position: i32, pushed: i32) -> Result<(), KnitError> {
        if pushed == 0 {
            return Ok(());
        }
        let needles = self.sheet_needles_at_needle_position(&Needle::front(position));
        let current: Vec<i32> = needles
            .iter()
            .map(|sn| self.get_layer_at_position(sn.position()))
            .collect::<Result<_, _>>()?;
        for (sn, layer) in needles.iter().zip(current) {
            let rotated = (sn.sheet + pushed).rem_euclid(self.gauge);
            if let Some(target) = needles.get(rotated as usize) {
                self.set_layer(target.position(), layer)?;
            }
        }
        Ok(())
    }

    pub fn push_layer_forward(&mut self, position: i32, pushed: i32) -> Result<(), KnitError> {
        self.push_layer_backward(position, -pushed)
    }

    pub fn set_layer_position(
        &mut self,
        position: i32,
        layer: i32,
        rule: LayerRule,
    ) -> Result<(), KnitError> {
        if self.get_layer_at_position(position)? == layer {
            return Ok(());
        }
        let own = SheetNeedle::from_needle(Needle::front(position), self.gauge);
        let mut holder = None;
        for sn in self.sheet_needles_at_needle_position(&Needle::front(position)) {
            if self.get_layer_at_position(sn.position())? == layer {
                holder = Some(sn);
                break;
            }
        }
        let holder = holder.ok_or_else(|| {
            KnitError::value(format!(
                "could not find a needle with layer {layer} at position {position}"
            ))
        })?;
        match rule {
            LayerRule::Swap => self.swap_layer_at_positions(own.position(), holder.position()),
            // Both rotations bring the holder's layer onto this position.
            LayerRule::PushForward => self.push_layer_forward(position, holder.sheet - own.sheet),
            LayerRule::PushBackward => self.push_layer_backward(position, own.sheet - holder.sheet),
        }
    }

    pub fn set_layer_to_front(&mut self, position: i32, rule: LayerRule) -> Result<(), KnitError> {
        self.set_layer_position(position, 0, rule)
    }

    pub fn set_layer_to_back(&mut self, position: i32, rule: LayerRule) -> Result<(), KnitError> {
        self.set_layer_position(position, self.gauge - 1, rule)
    }

    // ── Sheet needle sets ────────────────────────────────────────

    /// Needles of one bed on a sheet, in ascending position.
    pub fn needles(&self, machine: &KnittingMachine, sheet: i32, bed: Bed, is_slider: bool) -> Vec<Needle> {
        sheet_positions(machine, sheet, self.gauge)
            .map(|p| Needle {
                bed,
                position: p,
                is_slider,
            })
            .collect()
    }

    /// Needles of one bed on a sheet that hold loops.
    pub fn loops(&self, machine: &KnittingMachine, sheet: i32, bed: Bed, is_slider: bool) -> Vec<Needle> {
        self.needles(machine, sheet, bed, is_slider)
            .into_iter()
            .filter(|n| machine.has_loops(n))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::machine::CarrierSet;
    use crate::settings::MachineSpec;

    fn machine() -> KnittingMachine {
        let mut m = KnittingMachine::new(MachineSpec {
            width: 12,
            ..MachineSpec::default()
        });
        m.inhook(&CarrierSet::single(1)).unwrap();
        m
    }

    fn tuck(m: &mut KnittingMachine, needle: Needle) {
        m.tuck(&needle, &CarrierSet::single(1), "tuck").unwrap();
    }

    fn xfers(lines: &[KnitoutLine]) -> Vec<String> {
        lines
            .iter()
            .filter_map(|l| l.instruction.as_ref().map(ToString::to_string))
            .collect()
    }

    #[test]
    fn gauge_bounds() {
        let m = machine();
        assert!(GaugedSheetRecord::new(0, &m).is_err());
        assert_eq!(GaugedSheetRecord::new(10, &m).unwrap_err().kind, ErrorKind::GaugeValue);
        assert!(GaugedSheetRecord::new(9, &m).is_ok());
    }

    #[test]
    fn initial_layers_follow_sheets() {
        let m = machine();
        let record = GaugedSheetRecord::new(3, &m).unwrap();
        assert_eq!(record.get_layer_at_position(7).unwrap(), 1);
        assert_eq!(record.get_layer_at_position(9).unwrap(), 0);
        assert_eq!(
            record.needles(&m, 1, Bed::Front, false),
            vec![Needle::front(1), Needle::front(4), Needle::front(7), Needle::front(10)]
        );
    }

    #[test]
    fn switching_sheets_peels_and_returns() {
        let mut m = machine();
        let mut record = GaugedSheetRecord::new(2, &m).unwrap();
        for p in [0, 2, 4] {
            tuck(&mut m, Needle::front(p));
            record.record_needle(&m, &Needle::front(p));
        }
        // Sheet 0 is in front of sheet 1, so its loops stay on the front bed.
        let lines = record.reset_to_sheet(&mut m, 1).unwrap();
        assert!(xfers(&lines).is_empty());

        // Put sheet 1 in front at position 0 and its neighbours.
        for p in [1, 3, 5] {
            record.set_layer_to_front(p, LayerRule::Swap).unwrap();
        }
        let lines = record.reset_to_sheet(&mut m, 1).unwrap();
        assert_eq!(xfers(&lines), ["xfer f0 b0", "xfer f2 b2", "xfer f4 b4"]);
        assert_eq!(
            lines.first().unwrap().comment.as_deref(),
            Some("Peel sheet 0 relative to 1")
        );

        let lines = record.reset_to_sheet(&mut m, 0).unwrap();
        assert_eq!(xfers(&lines), ["xfer b0 f0", "xfer b2 f2", "xfer b4 f4"]);
        for p in [0, 2, 4] {
            assert!(m.has_loops(&Needle::front(p)));
            assert!(!m.has_loops(&Needle::back(p)));
        }
    }

    #[test]
    fn lost_loops_fail_reset() {
        let mut m = machine();
        let mut record = GaugedSheetRecord::new(2, &m).unwrap();
        tuck(&mut m, Needle::front(2));
        record.record_needle(&m, &Needle::front(2));
        m.drop(&Needle::front(2)).unwrap();
        let err = record.reset_to_sheet(&mut m, 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::LostSheetLoops);
    }

    #[test]
    fn blocked_loops_fail_reset() {
        let mut m = machine();
        let mut record = GaugedSheetRecord::new(2, &m).unwrap();
        tuck(&mut m, Needle::front(2));
        record.record_needle(&m, &Needle::front(2));
        tuck(&mut m, Needle::back(2));
        let err = record.reset_to_sheet(&mut m, 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SheetPeelingBlockedLoops);
    }

    #[test]
    fn stacked_loops_fail_reset() {
        let mut m = machine();
        let mut record = GaugedSheetRecord::new(2, &m).unwrap();
        tuck(&mut m, Needle::front(2));
        tuck(&mut m, Needle::back(2));
        record.record_needle(&m, &Needle::front(2));
        m.xfer(&Needle::back(2), &Needle::front(2), "xfer").unwrap();
        let err = record.reset_to_sheet(&mut m, 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SheetPeelingStackedLoops);
    }

    #[test]
    fn layer_rotation_is_a_permutation() {
        let m = machine();
        let mut record = GaugedSheetRecord::new(3, &m).unwrap();
        record.push_layer_backward(0, 1).unwrap();
        let layers: Vec<i32> = (0..3).map(|p| record.get_layer_at_position(p).unwrap()).collect();
        assert_eq!(layers, [2, 0, 1]);
        record.push_layer_forward(0, 1).unwrap();
        let layers: Vec<i32> = (0..3).map(|p| record.get_layer_at_position(p).unwrap()).collect();
        assert_eq!(layers, [0, 1, 2]);

        record.set_layer_to_back(3, LayerRule::PushBackward).unwrap();
        let mut layers: Vec<i32> = (3..6).map(|p| record.get_layer_at_position(p).unwrap()).collect();
        assert_eq!(layers.first(), Some(&2));
        layers.sort_unstable();
        assert_eq!(layers, [0, 1, 2]);
    }

    #[test]
    fn bad_sheet_is_sheet_value() {
        let mut m = machine();
        let record = GaugedSheetRecord::new(2, &m).unwrap();
        assert_eq!(record.reset_to_sheet(&mut m, 2).unwrap_err().kind, ErrorKind::SheetValue);
    }
}
