use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    ActivityKind, ActorId, Participant, Preference, Recruitment, RecruitmentId, RosterError, Slot,
    TimeSlot,
};

const SHORT_LIST_WEIGHT: f64 = 10.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentMode {
    /// Rendered while sign-ups are open; never written back.
    Preview,
    /// Authoritative run at close.
    Final,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct VoteTally {
    pub tengen: f64,
    #[serde(rename = "lucizero")]
    pub luci_zero: f64,
}

impl VoteTally {
    fn count(participants: &[Participant]) -> Self {
        let mut tally = Self { tengen: 0.0, luci_zero: 0.0 };
        for participant in participants {
            match participant.preference {
                Preference::Tengen => tally.tengen += 1.0,
                Preference::LuciZero => tally.luci_zero += 1.0,
                Preference::Either => {
                    tally.tengen += 0.5;
                    tally.luci_zero += 0.5;
                }
            }
        }
        tally
    }

    /// Higher tally wins; a tie goes to [`ActivityKind::DEFAULT_VARIANT`].
    #[must_use]
    pub fn winner(&self) -> ActivityKind {
        match self.luci_zero.partial_cmp(&self.tengen) {
            Some(Ordering::Greater) => ActivityKind::LuciZero,
            Some(Ordering::Less) => ActivityKind::Tengen,
            Some(Ordering::Equal) | None => ActivityKind::DEFAULT_VARIANT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedParticipant {
    pub actor_id: ActorId,
    pub join_index: usize,
    pub score: f64,
    pub assigned_slot: Option<Slot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentOutcome {
    pub recruitment_id: RecruitmentId,
    pub mode: AssignmentMode,
    pub final_activity_kind: ActivityKind,
    pub final_time: TimeSlot,
    pub tally: Option<VoteTally>,
    pub demand: BTreeMap<Slot, usize>,
    /// Eligible participants in claim priority order.
    pub ranking: Vec<RankedParticipant>,
    pub assignments: BTreeMap<Slot, ActorId>,
    pub vacant_slots: Vec<Slot>,
    pub unassigned: Vec<ActorId>,
    pub ineligible: Vec<ActorId>,
}

impl AssignmentOutcome {
    #[must_use]
    pub fn slot_for(&self, actor_id: &ActorId) -> Option<Slot> {
        self.assignments.iter().find(|(_, holder)| *holder == actor_id).map(|(slot, _)| *slot)
    }

    /// No eligible participants: the recruitment closes with nobody assigned.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.ranking.is_empty()
    }

    /// Re-check the outcome against the participant records it was computed from.
    ///
    /// # Errors
    /// Returns [`RosterError::AssignmentFailure`] when a slot is held twice, a holder did not
    /// choose the slot, or a holder is not eligible for the final variant.
    pub fn verify(&self, participants: &[Participant]) -> Result<(), RosterError> {
        let failure = |reason: String| RosterError::AssignmentFailure { id: self.recruitment_id, reason };

        if !self.final_activity_kind.is_concrete() {
            return Err(failure("final variant is still the vote placeholder".to_string()));
        }

        let mut holders = BTreeSet::new();
        for (slot, actor_id) in &self.assignments {
            if !holders.insert(actor_id) {
                return Err(failure(format!("actor {actor_id} holds more than one slot")));
            }
            let Some(participant) =
                participants.iter().find(|participant| &participant.actor_id == actor_id)
            else {
                return Err(failure(format!("slot {slot} went to unknown actor {actor_id}")));
            };
            if !participant.slot_choices.contains(slot) {
                return Err(failure(format!("actor {actor_id} did not choose slot {slot}")));
            }
            if !participant.preference.accepts(self.final_activity_kind) {
                return Err(failure(format!(
                    "actor {actor_id} is not eligible for {}",
                    self.final_activity_kind
                )));
            }
        }
        Ok(())
    }
}

fn ratio(numerator: f64, count: usize) -> f64 {
    let denominator = u32::try_from(count.max(1)).unwrap_or(u32::MAX);
    numerator / f64::from(denominator)
}

fn priority_score(participant: &Participant, demand: &BTreeMap<Slot, usize>) -> f64 {
    let breadth = ratio(SHORT_LIST_WEIGHT, participant.slot_choices.len());
    let rarity = participant
        .slot_choices
        .iter()
        .map(|slot| ratio(1.0, demand.get(slot).copied().unwrap_or(0)))
        .fold(0.0_f64, f64::max);
    breadth + rarity
}

/// Run the greedy slot assignment over a recruitment's current participants.
///
/// The result is a pure function of the participant list and its order; nothing on the
/// recruitment is modified. Callers apply a final outcome with
/// [`Recruitment::record_assignment`].
///
/// # Errors
/// Returns [`RosterError::AssignmentFailure`] when a participant record is invalid or the
/// computed outcome fails verification.
pub fn compute_assignment(
    recruitment: &Recruitment,
    mode: AssignmentMode,
) -> Result<AssignmentOutcome, RosterError> {
    for participant in &recruitment.participants {
        participant.validate().map_err(|err| RosterError::AssignmentFailure {
            id: recruitment.id,
            reason: err.to_string(),
        })?;
    }

    let (final_activity_kind, tally) = if recruitment.activity_kind.is_concrete() {
        (recruitment.activity_kind, None)
    } else {
        let tally = VoteTally::count(&recruitment.participants);
        (tally.winner(), Some(tally))
    };

    let (eligible, ineligible): (Vec<_>, Vec<_>) = recruitment
        .participants
        .iter()
        .enumerate()
        .partition(|(_, participant)| participant.preference.accepts(final_activity_kind));

    let final_time = eligible
        .iter()
        .map(|(_, participant)| participant.earliest_available)
        .max()
        .unwrap_or(recruitment.proposed_time);

    let mut demand = Slot::ALL.into_iter().map(|slot| (slot, 0_usize)).collect::<BTreeMap<_, _>>();
    for (_, participant) in &eligible {
        for slot in &participant.slot_choices {
            if let Some(count) = demand.get_mut(slot) {
                *count += 1;
            }
        }
    }

    let mut ranked = eligible
        .iter()
        .map(|(join_index, participant)| (*join_index, *participant, priority_score(participant, &demand)))
        .collect::<Vec<_>>();
    // Stable sort keeps join order among equal scores.
    ranked.sort_by(|left, right| right.2.partial_cmp(&left.2).unwrap_or(Ordering::Equal));

    let mut assignments = BTreeMap::new();
    let mut taken = vec![false; ranked.len()];
    let mut vacant_slots = Vec::new();
    for slot in Slot::ALL {
        let candidate = ranked
            .iter()
            .enumerate()
            .find(|(position, (_, participant, _))| {
                !taken[*position] && participant.slot_choices.contains(&slot)
            })
            .map(|(position, (_, participant, _))| (position, participant.actor_id.clone()));

        match candidate {
            Some((position, actor_id)) => {
                taken[position] = true;
                assignments.insert(slot, actor_id);
            }
            None => vacant_slots.push(slot),
        }
    }

    let ranking = ranked
        .iter()
        .map(|(join_index, participant, score)| RankedParticipant {
            actor_id: participant.actor_id.clone(),
            join_index: *join_index,
            score: *score,
            assigned_slot: assignments
                .iter()
                .find(|(_, holder)| **holder == participant.actor_id)
                .map(|(slot, _)| *slot),
        })
        .collect::<Vec<_>>();

    let unassigned = ranking
        .iter()
        .filter(|entry| entry.assigned_slot.is_none())
        .map(|entry| entry.actor_id.clone())
        .collect();

    let outcome = AssignmentOutcome {
        recruitment_id: recruitment.id,
        mode,
        final_activity_kind,
        final_time,
        tally,
        demand,
        ranking,
        assignments,
        vacant_slots,
        unassigned,
        ineligible: ineligible.iter().map(|(_, participant)| participant.actor_id.clone()).collect(),
    };
    outcome.verify(&recruitment.participants)?;
    Ok(outcome)
}
