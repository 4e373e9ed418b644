//! Virtual V-bed knitting machine: needle beds holding loop stacks, carriers
//! and the inserting hook, plus the knit graph the loops live in.

pub mod carrier;
pub mod direction;
pub mod needle;

pub use carrier::{Carrier, CarrierSet, CarrierState, CarrierSystem};
pub use direction::Direction;
pub use needle::{Bed, Needle, SheetIdentifier, SheetNeedle};

use crate::error::{KnitError, KnitWarning};
use crate::knit_graph::{KnitGraph, LoopId, PullDirection};
use crate::settings::{MachineSpec, XferPolicy};

#[derive(Debug, Clone, Default)]
struct Beds {
    front: Vec<Vec<LoopId>>,
    back: Vec<Vec<LoopId>>,
    front_sliders: Vec<Vec<LoopId>>,
    back_sliders: Vec<Vec<LoopId>>,
}

impl Beds {
    fn new(width: usize) -> Self {
        Self {
            front: vec![Vec::new(); width],
            back: vec![Vec::new(); width],
            front_sliders: vec![Vec::new(); width],
            back_sliders: vec![Vec::new(); width],
        }
    }

    fn bed(&self, needle: &Needle) -> &Vec<Vec<LoopId>> {
        match (needle.bed, needle.is_slider) {
            (Bed::Front, false) => &self.front,
            (Bed::Back, false) => &self.back,
            (Bed::Front, true) => &self.front_sliders,
            (Bed::Back, true) => &self.back_sliders,
        }
    }

    fn bed_mut(&mut self, needle: &Needle) -> &mut Vec<Vec<LoopId>> {
        match (needle.bed, needle.is_slider) {
            (Bed::Front, false) => &mut self.front,
            (Bed::Back, false) => &mut self.back,
            (Bed::Front, true) => &mut self.front_sliders,
            (Bed::Back, true) => &mut self.back_sliders,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KnittingMachine {
    spec: MachineSpec,
    racking: f64,
    beds: Beds,
    pub carrier_system: CarrierSystem,
    pub knit_graph: KnitGraph,
}

impl KnittingMachine {
    pub fn new(spec: MachineSpec) -> Self {
        let width = usize::try_from(spec.width.max(0)).unwrap_or(0);
        let mut knit_graph = KnitGraph::new();
        let yarns = (1..=spec.carrier_count)
            .map(|cid| new_yarn(&mut knit_graph, &spec, cid))
            .collect();
        let carrier_system = CarrierSystem::new(yarns, spec.hook_size);
        Self {
            spec,
            racking: 0.0,
            beds: Beds::new(width),
            carrier_system,
            knit_graph,
        }
    }

    pub fn spec(&self) -> &MachineSpec {
        &self.spec
    }

    pub fn width(&self) -> i32 {
        self.spec.width
    }

    pub fn xfer_policy(&self) -> XferPolicy {
        self.spec.xfer_policy
    }

    // ── Racking ──────────────────────────────────────────────────

    pub fn racking(&self) -> f64 {
        self.racking
    }

    /// Integer part of the racking, used for needle alignment.
    pub fn rack(&self) -> i32 {
        self.racking.floor() as i32
    }

    pub fn is_all_needle_rack(&self) -> bool {
        self.racking.fract() != 0.0
    }

    pub fn set_racking(&mut self, racking: f64) -> Result<(), KnitError> {
        if racking.abs() > self.spec.max_rack {
            return Err(KnitError::knitting(format!(
                "racking {racking} exceeds the machine's maximum of {}",
                self.spec.max_rack
            )));
        }
        self.racking = racking;
        Ok(())
    }

    // ── Needle access ────────────────────────────────────────────

    pub fn check_needle(&self, needle: &Needle) -> Result<(), KnitError> {
        if needle.position < 0 || needle.position >= self.spec.width {
            Err(KnitError::knitting(format!(
                "needle {needle} is outside the bed (0..{})",
                self.spec.width
            )))
        } else {
            Ok(())
        }
    }

    /// Loops held by a needle, bottom to top. Needles off the bed hold nothing.
    pub fn loops(&self, needle: &Needle) -> &[LoopId] {
        usize::try_from(needle.position)
            .ok()
            .and_then(|i| self.beds.bed(needle).get(i))
            .map_or(&[], Vec::as_slice)
    }

    pub fn has_loops(&self, needle: &Needle) -> bool {
        !self.loops(needle).is_empty()
    }

    fn slot_mut(&mut self, needle: &Needle) -> Result<&mut Vec<LoopId>, KnitError> {
        self.check_needle(needle)?;
        let i = usize::try_from(needle.position)
            .map_err(|_| KnitError::knitting(format!("needle {needle} is outside the bed")))?;
        self.beds
            .bed_mut(needle)
            .get_mut(i)
            .ok_or_else(|| KnitError::knitting(format!("needle {needle} is outside the bed")))
    }

    /// All needles of one bed, in ascending position.
    pub fn needles(&self, bed: Bed, is_slider: bool) -> Vec<Needle> {
        (0..self.spec.width)
            .map(|p| Needle {
                bed,
                position: p,
                is_slider,
            })
            .collect()
    }

    /// Needles of one bed that hold loops.
    pub fn loaded_needles(&self, bed: Bed, is_slider: bool) -> Vec<Needle> {
        let slots = self.beds.bed(&Needle {
            bed,
            position: 0,
            is_slider,
        });
        slots
            .iter()
            .enumerate()
            .filter(|(_, loops)| !loops.is_empty())
            .map(|(p, _)| Needle {
                bed,
                position: p as i32,
                is_slider,
            })
            .collect()
    }

    /// Front needles with loops followed by back needles with loops.
    pub fn all_loops(&self) -> Vec<Needle> {
        let mut out = self.loaded_needles(Bed::Front, false);
        out.extend(self.loaded_needles(Bed::Back, false));
        out
    }

    pub fn all_slider_loops(&self) -> Vec<Needle> {
        let mut out = self.loaded_needles(Bed::Front, true);
        out.extend(self.loaded_needles(Bed::Back, true));
        out
    }

    /// Needle facing `needle` on the opposite bed at the current racking.
    pub fn aligned_needle(&self, needle: &Needle, aligned_slider: bool) -> Needle {
        let rack = self.rack();
        let position = match needle.bed {
            Bed::Front => needle.position - rack,
            Bed::Back => needle.position + rack,
        };
        Needle {
            bed: needle.bed.opposite(),
            position,
            is_slider: aligned_slider,
        }
    }

    /// Front position minus back position must equal the racking.
    pub fn valid_rack(&self, front_pos: i32, back_pos: i32) -> bool {
        !self.is_all_needle_rack() && front_pos - back_pos == self.rack()
    }

    // ── Loop-forming operations ──────────────────────────────────

    fn make_loops(
        &mut self,
        carriers: &CarrierSet,
        needle: &Needle,
        instruction: &str,
    ) -> Result<Vec<LoopId>, KnitError> {
        let mut made = Vec::with_capacity(carriers.len());
        for id in carriers.ids() {
            let yarn = self.carrier_system.get(*id)?.yarn;
            let l = self.knit_graph.add_loop(yarn)?;
            self.knit_graph.set_creating_instruction(l, instruction);
            made.push(l);
        }
        self.carrier_system.note_loop_made(needle.position);
        self.carrier_system.position_carriers(carriers, needle.position)?;
        Ok(made)
    }

    fn check_carriers(&self, carriers: &CarrierSet) -> Result<(), KnitError> {
        if carriers.is_empty() {
            return Err(KnitError::knitting("operation needs at least one carrier"));
        }
        self.carrier_system.check_active(carriers)
    }

    /// Pull new loops through the held loops and replace them.
    pub fn knit(
        &mut self,
        needle: &Needle,
        carriers: &CarrierSet,
        instruction: &str,
    ) -> Result<Vec<LoopId>, KnitError> {
        self.check_needle(needle)?;
        self.check_carriers(carriers)?;
        let parents = std::mem::take(self.slot_mut(needle)?);
        if parents.is_empty() {
            KnitWarning::KnitOnEmptyNeedle {
                needle: needle.to_string(),
            }
            .emit();
        }
        let children = self.make_loops(carriers, needle, instruction)?;
        let pull = if needle.is_front() {
            PullDirection::BtF
        } else {
            PullDirection::FtB
        };
        for parent in &parents {
            self.knit_graph.touch(*parent, instruction);
            for child in &children {
                self.knit_graph.connect_loops(*parent, *child, pull, None, 0, 0)?;
            }
        }
        self.slot_mut(needle)?.extend(children.iter().copied());
        Ok(children)
    }

    /// Make new loops on top of whatever the needle holds.
    pub fn tuck(
        &mut self,
        needle: &Needle,
        carriers: &CarrierSet,
        instruction: &str,
    ) -> Result<Vec<LoopId>, KnitError> {
        self.check_needle(needle)?;
        self.check_carriers(carriers)?;
        let made = self.make_loops(carriers, needle, instruction)?;
        self.slot_mut(needle)?.extend(made.iter().copied());
        Ok(made)
    }

    /// Move the held loops of `from` to `to`, then pull new loops through
    /// them onto `from`. With no carriers this is an xfer.
    pub fn split(
        &mut self,
        from: &Needle,
        to: &Needle,
        carriers: &CarrierSet,
        instruction: &str,
    ) -> Result<Vec<LoopId>, KnitError> {
        if !self.has_loops(from) {
            KnitWarning::SplitOnEmptyNeedle {
                needle: from.to_string(),
            }
            .emit();
        }
        let parents = self.loops(from).to_vec();
        self.xfer(from, to, instruction)?;
        if carriers.is_empty() {
            return Ok(Vec::new());
        }
        self.check_carriers(carriers)?;
        let children = self.make_loops(carriers, from, instruction)?;
        let pull = if from.is_front() {
            PullDirection::BtF
        } else {
            PullDirection::FtB
        };
        for parent in &parents {
            for child in &children {
                self.knit_graph.connect_loops(*parent, *child, pull, None, 0, 0)?;
            }
        }
        self.slot_mut(from)?.extend(children.iter().copied());
        Ok(children)
    }

    /// Move the whole loop stack. Returns false when the policy skipped it.
    pub fn xfer(&mut self, from: &Needle, to: &Needle, instruction: &str) -> Result<bool, KnitError> {
        self.check_needle(from)?;
        self.check_needle(to)?;
        if from.bed == to.bed {
            return Err(KnitError::knitting(format!(
                "cannot transfer {from} to {to} on the same bed"
            )));
        }
        let (front, back) = if from.is_front() { (from, to) } else { (to, from) };
        if !self.valid_rack(front.position, back.position) {
            return Err(KnitError::knitting(format!(
                "cannot transfer {from} to {to} at racking {}",
                crate::knitout::format_number(self.racking)
            )));
        }
        if self.has_loops(to) && self.has_loops(from) {
            match self.spec.xfer_policy {
                XferPolicy::Stack => {
                    tracing::debug!(%from, %to, "stacking transferred loops");
                }
                XferPolicy::Skip => {
                    tracing::debug!(%from, %to, "skipping xfer onto occupied needle");
                    return Ok(false);
                }
                XferPolicy::Error => {
                    return Err(KnitError::knitting(format!(
                        "cannot transfer {from} onto occupied needle {to}"
                    )));
                }
            }
        }
        let moved = std::mem::take(self.slot_mut(from)?);
        for l in &moved {
            self.knit_graph.touch(*l, instruction);
        }
        self.slot_mut(to)?.extend(moved);
        Ok(true)
    }

    /// Clear the stack. Dropped loops stay in the knit graph.
    pub fn drop(&mut self, needle: &Needle) -> Result<Vec<LoopId>, KnitError> {
        Ok(std::mem::take(self.slot_mut(needle)?))
    }

    pub fn miss(&mut self, needle: &Needle, carriers: &CarrierSet) -> Result<(), KnitError> {
        self.check_needle(needle)?;
        self.check_carriers(carriers)?;
        self.carrier_system.position_carriers(carriers, needle.position)
    }

    // ── Carrier operations ───────────────────────────────────────

    pub fn bring_in(&mut self, carriers: &CarrierSet) -> Result<(), KnitError> {
        for id in carriers.ids() {
            let yarn = self.carrier_system.get(*id)?.yarn;
            if !self.knit_graph.yarn_has_loops(yarn) {
                KnitWarning::LooseYarn { carrier: *id }.emit();
            }
        }
        self.carrier_system.bring_in(carriers)
    }

    pub fn inhook(&mut self, carriers: &CarrierSet) -> Result<(), KnitError> {
        self.carrier_system.inhook(carriers)
    }

    pub fn releasehook(&mut self, carriers: &CarrierSet) -> Result<(), KnitError> {
        self.carrier_system.releasehook(carriers)
    }

    pub fn out(&mut self, carriers: &CarrierSet) -> Result<(), KnitError> {
        self.carrier_system.out(carriers)
    }

    /// Cut the yarn: carriers go inactive and get a fresh yarn.
    pub fn outhook(&mut self, carriers: &CarrierSet) -> Result<(), KnitError> {
        self.carrier_system.outhook(carriers)?;
        for id in carriers.ids() {
            let yarn = self.carrier_system.get(*id)?.yarn;
            if self.knit_graph.yarn_has_loops(yarn) {
                let fresh = new_yarn(&mut self.knit_graph, &self.spec, *id);
                self.carrier_system.set_yarn(*id, fresh)?;
            }
        }
        Ok(())
    }

    /// A carrier's yarn is loose when it is not hooked and has made no loops.
    pub fn yarn_is_loose(&self, carrier: u32) -> bool {
        self.carrier_system
            .get(carrier)
            .is_ok_and(|c| !c.is_hooked() && !self.knit_graph.yarn_has_loops(c.yarn))
    }
}

fn new_yarn(graph: &mut KnitGraph, spec: &MachineSpec, carrier: u32) -> crate::knit_graph::YarnId {
    let id = graph.add_yarn(carrier);
    if let (Some(y), Some(ys)) = (
        graph.yarn_mut(id),
        spec.yarns.iter().find(|y| y.carrier == carrier),
    ) {
        y.size = Some(ys.size);
        y.plies = Some(ys.plies);
        y.color = Some(ys.color.clone());
    }
    id
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn machine() -> KnittingMachine {
        KnittingMachine::new(MachineSpec {
            width: 20,
            ..MachineSpec::default()
        })
    }

    fn active(m: &mut KnittingMachine, id: u32) -> CarrierSet {
        let cs = CarrierSet::single(id);
        m.inhook(&cs).unwrap();
        cs
    }

    #[test]
    fn knit_replaces_loops_and_links_parents() {
        let mut m = machine();
        let cs = active(&mut m, 1);
        let f0 = Needle::front(0);
        let first = m.tuck(&f0, &cs, "tuck + f0 1").unwrap();
        let second = m.knit(&f0, &cs, "knit + f0 1").unwrap();
        assert_eq!(m.loops(&f0), second.as_slice());
        let child = m.knit_graph.get(second[0]).unwrap();
        assert_eq!(child.parents, first);
        let edge = m.knit_graph.stitch_edge(first[0], second[0]).unwrap();
        assert_eq!(edge.pull_direction, PullDirection::BtF);
    }

    #[test]
    fn back_bed_knit_is_purl() {
        let mut m = machine();
        let cs = active(&mut m, 1);
        let b2 = Needle::back(2);
        let first = m.tuck(&b2, &cs, "tuck").unwrap();
        let second = m.knit(&b2, &cs, "knit").unwrap();
        let edge = m.knit_graph.stitch_edge(first[0], second[0]).unwrap();
        assert_eq!(edge.pull_direction, PullDirection::FtB);
    }

    #[test]
    fn plaited_carrier_set_makes_parallel_loops() {
        let mut m = machine();
        let cs = CarrierSet::new([1, 2]);
        m.inhook(&cs).unwrap();
        let made = m.tuck(&Needle::front(3), &cs, "tuck").unwrap();
        assert_eq!(made.len(), 2);
        assert_ne!(
            m.knit_graph.get(made[0]).unwrap().yarn,
            m.knit_graph.get(made[1]).unwrap().yarn
        );
    }

    #[test]
    fn knit_with_inactive_carrier_fails() {
        let mut m = machine();
        assert!(m
            .knit(&Needle::front(0), &CarrierSet::single(1), "knit")
            .is_err());
    }

    #[test]
    fn xfer_conserves_loops() {
        let mut m = machine();
        let cs = active(&mut m, 1);
        m.tuck(&Needle::front(4), &cs, "tuck").unwrap();
        m.tuck(&Needle::front(4), &cs, "tuck").unwrap();
        assert!(m.xfer(&Needle::front(4), &Needle::back(4), "xfer").unwrap());
        assert_eq!(m.loops(&Needle::back(4)).len(), 2);
        assert!(!m.has_loops(&Needle::front(4)));
    }

    #[test]
    fn xfer_checks_racking_and_beds() {
        let mut m = machine();
        assert!(m.xfer(&Needle::front(4), &Needle::back(5), "xfer").is_err());
        assert!(m.xfer(&Needle::front(4), &Needle::front(5), "xfer").is_err());
        m.set_racking(-1.0).unwrap();
        assert!(m.xfer(&Needle::front(4), &Needle::back(5), "xfer").is_ok());
        assert_eq!(m.aligned_needle(&Needle::front(4), false), Needle::back(5));
        assert_eq!(m.aligned_needle(&Needle::back(5), false), Needle::front(4));
    }

    #[test]
    fn xfer_policy_on_occupied_target() {
        for (policy, expect_ok, expect_moved) in [
            (XferPolicy::Stack, true, true),
            (XferPolicy::Skip, true, false),
            (XferPolicy::Error, false, false),
        ] {
            let mut m = KnittingMachine::new(MachineSpec {
                width: 10,
                xfer_policy: policy,
                ..MachineSpec::default()
            });
            let cs = active(&mut m, 1);
            m.tuck(&Needle::front(1), &cs, "tuck").unwrap();
            m.tuck(&Needle::back(1), &cs, "tuck").unwrap();
            let result = m.xfer(&Needle::front(1), &Needle::back(1), "xfer");
            assert_eq!(result.is_ok(), expect_ok);
            if expect_ok {
                assert_eq!(result.unwrap(), expect_moved);
            }
            let back = m.loops(&Needle::back(1)).len();
            assert_eq!(back, if expect_moved { 2 } else { 1 });
        }
    }

    #[test]
    fn split_moves_then_knits() {
        let mut m = machine();
        let cs = active(&mut m, 1);
        let held = m.tuck(&Needle::front(2), &cs, "tuck").unwrap();
        let made = m
            .split(&Needle::front(2), &Needle::back(2), &cs, "split")
            .unwrap();
        assert_eq!(m.loops(&Needle::back(2)), held.as_slice());
        assert_eq!(m.loops(&Needle::front(2)), made.as_slice());
    }

    #[test]
    fn drop_clears_but_keeps_graph() {
        let mut m = machine();
        let cs = active(&mut m, 1);
        m.tuck(&Needle::front(0), &cs, "tuck").unwrap();
        let dropped = m.drop(&Needle::front(0)).unwrap();
        assert_eq!(dropped.len(), 1);
        assert!(!m.has_loops(&Needle::front(0)));
        assert_eq!(m.knit_graph.loop_count(), 1);
    }

    #[test]
    fn outhook_gives_carrier_a_fresh_yarn() {
        let mut m = machine();
        let cs = active(&mut m, 1);
        m.tuck(&Needle::front(0), &cs, "tuck").unwrap();
        m.releasehook(&cs).unwrap();
        assert!(!m.yarn_is_loose(1));
        m.outhook(&cs).unwrap();
        assert!(m.yarn_is_loose(1));
    }

    #[test]
    fn racking_is_bounded() {
        let mut m = machine();
        assert!(m.set_racking(4.25).is_ok());
        assert!(m.set_racking(5.0).is_err());
        m.set_racking(0.25).unwrap();
        assert!(m.is_all_needle_rack());
        assert_eq!(m.rack(), 0);
    }

    #[test]
    fn needles_off_the_bed_are_rejected() {
        let mut m = machine();
        let cs = active(&mut m, 1);
        assert!(m.tuck(&Needle::front(20), &cs, "tuck").is_err());
        assert!(m.tuck(&Needle::front(-1), &cs, "tuck").is_err());
        assert!(m.loops(&Needle::front(-1)).is_empty());
    }
}
