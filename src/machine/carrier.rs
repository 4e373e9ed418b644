use std::fmt;

use crate::error::{KnitError, KnitWarning};
use crate::knit_graph::YarnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CarrierState {
    Inactive,
    Active,
    HookedActive,
}

/// A yarn carrier and the yarn it presents to the needles.
#[derive(Debug, Clone, PartialEq)]
pub struct Carrier {
    pub id: u32,
    pub state: CarrierState,
    /// Last needle position visited while active.
    pub position: Option<i32>,
    pub yarn: YarnId,
}

impl Carrier {
    pub fn is_active(&self) -> bool {
        self.state != CarrierState::Inactive
    }

    pub fn is_hooked(&self) -> bool {
        self.state == CarrierState::HookedActive
    }
}

/// Ordered set of carrier ids used together for plaited loops.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CarrierSet(Vec<u32>);

impl CarrierSet {
    /// Build a set, dropping repeated ids while keeping first-seen order.
    pub fn new(ids: impl IntoIterator<Item = u32>) -> Self {
        let mut out: Vec<u32> = Vec::new();
        for id in ids {
            if !out.contains(&id) {
                out.push(id);
            }
        }
        CarrierSet(out)
    }

    pub fn single(id: u32) -> Self {
        CarrierSet(vec![id])
    }

    pub fn ids(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.0.contains(&id)
    }

    /// Parse whitespace-separated ids (`1 2 3`).
    pub fn parse(text: &str) -> Option<Self> {
        let ids: Option<Vec<u32>> = text.split_whitespace().map(|t| t.parse().ok()).collect();
        let ids = ids?;
        if ids.is_empty() {
            None
        } else {
            Some(CarrierSet::new(ids))
        }
    }
}

impl fmt::Display for CarrierSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for id in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{id}")?;
            first = false;
        }
        Ok(())
    }
}

/// Carriers plus the single yarn-inserting hook.
#[derive(Debug, Clone)]
pub struct CarrierSystem {
    carriers: Vec<Carrier>,
    hooked: Option<CarrierSet>,
    /// Needle position of the first loop made after the last inhook.
    pub hook_position: Option<i32>,
    searching_for_position: bool,
    pub hook_size: u32,
}

impl CarrierSystem {
    /// `yarns[i]` is the yarn loaded on carrier `i + 1`.
    pub fn new(yarns: Vec<YarnId>, hook_size: u32) -> Self {
        let carriers = yarns
            .into_iter()
            .enumerate()
            .map(|(i, yarn)| Carrier {
                id: i as u32 + 1,
                state: CarrierState::Inactive,
                position: None,
                yarn,
            })
            .collect();
        Self {
            carriers,
            hooked: None,
            hook_position: None,
            searching_for_position: false,
            hook_size,
        }
    }

    pub fn carrier_count(&self) -> u32 {
        self.carriers.len() as u32
    }

    pub fn get(&self, id: u32) -> Result<&Carrier, KnitError> {
        id.checked_sub(1)
            .and_then(|i| self.carriers.get(i as usize))
            .ok_or_else(|| KnitError::knitting(format!("no carrier {id} on this machine")))
    }

    fn get_mut(&mut self, id: u32) -> Result<&mut Carrier, KnitError> {
        id.checked_sub(1)
            .and_then(|i| self.carriers.get_mut(i as usize))
            .ok_or_else(|| KnitError::knitting(format!("no carrier {id} on this machine")))
    }

    pub fn carriers(&self) -> impl Iterator<Item = &Carrier> {
        self.carriers.iter()
    }

    pub fn hooked_carriers(&self) -> Option<&CarrierSet> {
        self.hooked.as_ref()
    }

    pub fn hook_available(&self) -> bool {
        self.hooked.is_none()
    }

    pub fn active_carriers(&self) -> CarrierSet {
        CarrierSet::new(self.carriers.iter().filter(|c| c.is_active()).map(|c| c.id))
    }

    /// True when every carrier of the set is active.
    pub fn is_active(&self, set: &CarrierSet) -> bool {
        set.ids()
            .iter()
            .all(|id| self.get(*id).is_ok_and(Carrier::is_active))
    }

    pub fn check_active(&self, set: &CarrierSet) -> Result<(), KnitError> {
        for id in set.ids() {
            if !self.get(*id)?.is_active() {
                return Err(KnitError::knitting(format!(
                    "carrier {id} is not active; bring it in before using it"
                )));
            }
        }
        Ok(())
    }

    pub fn bring_in(&mut self, set: &CarrierSet) -> Result<(), KnitError> {
        for id in set.ids() {
            let carrier = self.get_mut(*id)?;
            if carrier.is_active() {
                KnitWarning::InActiveCarrier { carrier: *id }.emit();
            } else {
                carrier.state = CarrierState::Active;
            }
        }
        Ok(())
    }

    pub fn inhook(&mut self, set: &CarrierSet) -> Result<(), KnitError> {
        if !self.hook_available() {
            return Err(KnitError::knitting(
                "cannot use yarn inserting hook because it is already in use",
            ));
        }
        for id in set.ids() {
            let carrier = self.get_mut(*id)?;
            if carrier.is_active() {
                KnitWarning::InActiveCarrier { carrier: *id }.emit();
            }
            carrier.state = CarrierState::HookedActive;
        }
        self.hooked = Some(set.clone());
        self.hook_position = None;
        self.searching_for_position = true;
        Ok(())
    }

    /// Release the hook. Carriers named that are not on the hook only warn.
    pub fn releasehook(&mut self, set: &CarrierSet) -> Result<(), KnitError> {
        let Some(hooked) = self.hooked.clone() else {
            KnitWarning::ReleasehookUnhooked {
                carriers: set.to_string(),
            }
            .emit();
            return Ok(());
        };
        if set.ids().iter().any(|id| !hooked.contains(*id)) {
            KnitWarning::ReleasehookUnhooked {
                carriers: set.to_string(),
            }
            .emit();
        }
        for id in hooked.ids() {
            let carrier = self.get_mut(*id)?;
            if carrier.is_hooked() {
                carrier.state = CarrierState::Active;
            }
        }
        self.hooked = None;
        self.hook_position = None;
        self.searching_for_position = false;
        Ok(())
    }

    pub fn out(&mut self, set: &CarrierSet) -> Result<(), KnitError> {
        for id in set.ids() {
            let carrier = self.get_mut(*id)?;
            if carrier.is_hooked() {
                return Err(KnitError::knitting(format!(
                    "cannot take {id} out because it is on the yarn inserting hook"
                )));
            }
            if !carrier.is_active() {
                KnitWarning::OutInactiveCarrier { carrier: *id }.emit();
            }
            carrier.state = CarrierState::Inactive;
            carrier.position = None;
        }
        Ok(())
    }

    /// Take carriers out with the hook. The caller replaces their yarns.
    pub fn outhook(&mut self, set: &CarrierSet) -> Result<(), KnitError> {
        for id in set.ids() {
            let carrier = self.get(*id)?;
            if carrier.is_hooked() {
                return Err(KnitError::knitting(format!(
                    "cannot cut {id} because it is on the yarn inserting hook"
                )));
            }
            if !carrier.is_active() {
                KnitWarning::OutInactiveCarrier { carrier: *id }.emit();
            }
        }
        for id in set.ids() {
            let carrier = self.get_mut(*id)?;
            carrier.state = CarrierState::Inactive;
            carrier.position = None;
        }
        Ok(())
    }

    pub fn set_yarn(&mut self, id: u32, yarn: YarnId) -> Result<(), KnitError> {
        self.get_mut(id)?.yarn = yarn;
        Ok(())
    }

    pub fn position_carriers(&mut self, set: &CarrierSet, position: i32) -> Result<(), KnitError> {
        for id in set.ids() {
            self.get_mut(*id)?.position = Some(position);
        }
        Ok(())
    }

    /// Record the hook position at the first loop made after an inhook.
    pub fn note_loop_made(&mut self, position: i32) {
        if self.searching_for_position {
            self.hook_position = Some(position);
            self.searching_for_position = false;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn system() -> CarrierSystem {
        CarrierSystem::new((0..3).map(YarnId).collect(), 5)
    }

    #[test]
    fn carrier_set_display_and_dedup() {
        let set = CarrierSet::new([3, 1, 3]);
        assert_eq!(set.to_string(), "3 1");
        assert_eq!(CarrierSet::parse("1 2"), Some(CarrierSet::new([1, 2])));
        assert_eq!(CarrierSet::parse(""), None);
    }

    #[test]
    fn hook_is_exclusive() {
        let mut cs = system();
        cs.inhook(&CarrierSet::single(1)).unwrap();
        assert!(cs.get(1).unwrap().is_hooked());
        assert!(cs.inhook(&CarrierSet::single(2)).is_err());
        cs.releasehook(&CarrierSet::single(1)).unwrap();
        assert!(cs.hook_available());
        assert!(cs.get(1).unwrap().is_active());
        cs.inhook(&CarrierSet::single(2)).unwrap();
    }

    #[test]
    fn out_of_hooked_carrier_fails() {
        let mut cs = system();
        cs.inhook(&CarrierSet::single(1)).unwrap();
        assert!(cs.out(&CarrierSet::single(1)).is_err());
        assert!(cs.outhook(&CarrierSet::single(1)).is_err());
        cs.releasehook(&CarrierSet::single(1)).unwrap();
        cs.outhook(&CarrierSet::single(1)).unwrap();
        assert!(!cs.get(1).unwrap().is_active());
    }

    #[test]
    fn hook_position_is_first_loop() {
        let mut cs = system();
        cs.inhook(&CarrierSet::single(1)).unwrap();
        cs.note_loop_made(7);
        cs.note_loop_made(3);
        assert_eq!(cs.hook_position, Some(7));
    }

    #[test]
    fn unknown_carrier_is_error() {
        let cs = system();
        assert!(cs.get(0).is_err());
        assert!(cs.get(4).is_err());
        assert!(cs.check_active(&CarrierSet::single(1)).is_err());
    }
}
