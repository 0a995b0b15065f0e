use crate::{
    AncestorKey, AncestorRef, ConditionSet, ControllerName, InvalidCondition, InvalidControllerName,
};
use ahash::AHashMap as HashMap;
use gke_policy_controller_k8s_api::policy::PolicyAncestorStatus;

/// The maximum number of ancestor entries a policy status may hold.
pub const MAX_ANCESTORS: usize = 16;

/// The ordered ancestor entries of a single policy's status.
///
/// Entries keep their insertion position for as long as they exist, so
/// updating an entry never reorders the serialized list.
#[derive(Clone, Debug, Default)]
pub struct StatusRegister {
    slots: Vec<Slot>,
    positions: HashMap<AncestorKey, usize>,
}

/// One entry of a policy's ancestor status.
#[derive(Clone, Debug, PartialEq)]
pub enum Slot {
    Known(AncestorKey, ConditionSet),

    /// An entry written by another controller that does not parse under
    /// local rules. It is carried through verbatim.
    Opaque(PolicyAncestorStatus),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Updated,
    Unchanged,
}

/// Returned when a new ancestor cannot be recorded because the status
/// already holds [`MAX_ANCESTORS`] entries.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("policy status already holds 16 ancestors; cannot record {}", .key.ancestor)]
pub struct CapacityExceeded {
    pub key: AncestorKey,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("duplicate ancestor entry for {} from {}", .0.ancestor, .0.controller)]
    DuplicateKey(AncestorKey),

    #[error(transparent)]
    Capacity(#[from] CapacityExceeded),

    #[error("status holds {0} ancestors, more than 16")]
    TooManyEntries(usize),

    #[error("invalid controller name: {0}")]
    ControllerName(#[from] InvalidControllerName),

    #[error("invalid condition: {0}")]
    Condition(#[from] InvalidCondition),
}

// === impl Slot ===

impl Slot {
    pub fn key(&self) -> Option<&AncestorKey> {
        match self {
            Self::Known(key, _) => Some(key),
            Self::Opaque(_) => None,
        }
    }

    fn is_foreign(&self, ours: &ControllerName) -> bool {
        match self {
            Self::Known(key, _) => !key.is_owned_by(ours),
            Self::Opaque(entry) => entry.controller_name != ours.as_str(),
        }
    }

    /// Whether both slots describe the same ancestor for the same writer.
    fn same_entry(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Known(a, _), Self::Known(b, _)) => a == b,
            (Self::Opaque(a), Self::Opaque(b)) => {
                a.controller_name == b.controller_name && a.ancestor_ref == b.ancestor_ref
            }
            _ => false,
        }
    }
}

// === impl StatusRegister ===

impl StatusRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a register from entries read back from a stored status,
    /// preserving their order.
    pub fn from_entries(slots: impl IntoIterator<Item = Slot>) -> Result<Self, RegisterError> {
        let mut register = Self::new();
        for slot in slots {
            if let Some(key) = slot.key() {
                if register.positions.contains_key(key) {
                    return Err(RegisterError::DuplicateKey(key.clone()));
                }
                register.positions.insert(key.clone(), register.slots.len());
            }
            register.slots.push(slot);
        }
        if register.slots.len() > MAX_ANCESTORS {
            return Err(RegisterError::TooManyEntries(register.slots.len()));
        }
        Ok(register)
    }

    /// Inserts or replaces the conditions recorded for `key`.
    pub fn upsert(
        &mut self,
        key: AncestorKey,
        conditions: ConditionSet,
    ) -> Result<Applied, CapacityExceeded> {
        if let Some(&idx) = self.positions.get(&key) {
            if let Slot::Known(_, existing) = &mut self.slots[idx] {
                if *existing == conditions {
                    return Ok(Applied::Unchanged);
                }
                *existing = conditions;
                return Ok(Applied::Updated);
            }
        }

        if self.is_full() {
            return Err(CapacityExceeded { key });
        }
        self.positions.insert(key.clone(), self.slots.len());
        self.slots.push(Slot::Known(key, conditions));
        Ok(Applied::Inserted)
    }

    /// Removes the entry for `key`, shifting later entries up by one.
    pub fn remove(&mut self, key: &AncestorKey) -> Option<ConditionSet> {
        let idx = *self.positions.get(key)?;
        match self.remove_at(idx) {
            Slot::Known(_, conditions) => Some(conditions),
            Slot::Opaque(_) => None,
        }
    }

    fn remove_at(&mut self, idx: usize) -> Slot {
        let slot = self.slots.remove(idx);
        if let Some(key) = slot.key() {
            self.positions.remove(key);
        }
        for pos in self.positions.values_mut() {
            if *pos > idx {
                *pos -= 1;
            }
        }
        slot
    }

    pub fn get(&self, key: &AncestorKey) -> Option<&ConditionSet> {
        let idx = *self.positions.get(key)?;
        match &self.slots[idx] {
            Slot::Known(_, conditions) => Some(conditions),
            Slot::Opaque(_) => None,
        }
    }

    /// Every entry, opaque ones included, in status order.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// The parsed entries in status order.
    pub fn entries(&self) -> impl Iterator<Item = (&AncestorKey, &ConditionSet)> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Known(key, conditions) => Some((key, conditions)),
            Slot::Opaque(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= MAX_ANCESTORS
    }

    pub fn ancestors_for<'r>(
        &'r self,
        controller: &'r ControllerName,
    ) -> impl Iterator<Item = &'r AncestorRef> + 'r {
        self.entries()
            .filter(move |(key, _)| key.is_owned_by(controller))
            .map(|(key, _)| &key.ancestor)
    }

    /// Reconciles the entries owned by other controllers with `foreign`,
    /// as observed on the stored status. Our own entries are untouched.
    ///
    /// Entries present on both sides keep their position, stale ones are
    /// removed, and new ones are appended while there is room.
    pub fn sync_foreign(
        &mut self,
        ours: &ControllerName,
        foreign: impl IntoIterator<Item = Slot>,
    ) -> bool {
        let foreign = foreign
            .into_iter()
            .filter(|slot| slot.is_foreign(ours))
            .collect::<Vec<_>>();

        let mut changed = false;
        let mut idx = 0;
        while idx < self.slots.len() {
            let slot = &self.slots[idx];
            if slot.is_foreign(ours) && !foreign.iter().any(|f| f.same_entry(slot)) {
                self.remove_at(idx);
                changed = true;
            } else {
                idx += 1;
            }
        }

        for slot in foreign {
            match slot {
                Slot::Known(key, conditions) => match self.upsert(key, conditions) {
                    Ok(Applied::Unchanged) => {}
                    Ok(_) => changed = true,
                    Err(error) => tracing::warn!(%error, "Dropping foreign ancestor status"),
                },
                Slot::Opaque(entry) => {
                    let slot = Slot::Opaque(entry);
                    match self.slots.iter().position(|s| s.same_entry(&slot)) {
                        Some(idx) if self.slots[idx] == slot => {}
                        Some(idx) => {
                            self.slots[idx] = slot;
                            changed = true;
                        }
                        None if self.is_full() => {
                            tracing::warn!("Dropping foreign ancestor status; status is full");
                        }
                        None => {
                            self.slots.push(slot);
                            changed = true;
                        }
                    }
                }
            }
        }
        changed
    }
}

impl PartialEq for StatusRegister {
    fn eq(&self, other: &Self) -> bool {
        self.slots == other.slots
    }
}
