//! Rotation scheduling.
//!
//! Pure functions over in-memory rosters; nothing here touches the store.
//! A schedule is computed once at game start, persisted inside the shared
//! game state, and never reshuffled mid-game. Only the round cursor moves.

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::{CoordError, Result};
use crate::model::{GroupId, Uid};

/// Immutable schedule persisted with the game state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RotationSchedule {
    /// One shared resource rotating through every participant.
    Single {
        order: Vec<Uid>,
        rounds_total: usize,
    },
    /// Ordered (acting, target) group pairs.
    Paired { rounds: Vec<PairedRound> },
}

/// One round of a paired schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedRound {
    pub acting: GroupId,
    pub target: GroupId,
    /// Which question of the acting group this round consumes.
    pub question_index: usize,
}

/// Who acts in a given round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundAssignment {
    Actor(Uid),
    Pair { acting: GroupId, target: GroupId },
}

impl RotationSchedule {
    /// Total number of rounds before the schedule is exhausted.
    pub fn len(&self) -> usize {
        match self {
            Self::Single { rounds_total, .. } => *rounds_total,
            Self::Paired { rounds } => rounds.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Assignment for round `round`, or `None` past the end.
    pub fn assignment(&self, round: usize) -> Option<RoundAssignment> {
        if round >= self.len() {
            return None;
        }
        match self {
            Self::Single { order, .. } => {
                order.get(round % order.len()).cloned().map(RoundAssignment::Actor)
            }
            Self::Paired { rounds } => rounds.get(round).map(|r| RoundAssignment::Pair {
                acting: r.acting.clone(),
                target: r.target.clone(),
            }),
        }
    }
}

/// Build a single-resource rotation: shuffled actor order, one full pass
/// per actor times `rounds_per_actor`.
pub fn single_rotation(
    actors: &[Uid],
    rounds_per_actor: usize,
    rng: &mut impl Rng,
) -> Result<RotationSchedule> {
    if actors.len() < 2 {
        return Err(CoordError::NotEnoughActors {
            needed: 2,
            got: actors.len(),
        });
    }
    let mut order = actors.to_vec();
    order.shuffle(rng);
    let rounds_total = order.len() * rounds_per_actor.max(1);
    Ok(RotationSchedule::Single { order, rounds_total })
}

/// Build a paired rotation covering every ordered pair of distinct groups
/// exactly once per question multiplier.
///
/// With N groups each multiplier contributes N·(N−1) rounds; a group is
/// never paired with itself.
pub fn paired_rounds(
    groups: &[GroupId],
    questions_per_group: usize,
    rng: &mut impl Rng,
) -> Result<RotationSchedule> {
    if groups.len() < 2 {
        return Err(CoordError::NotEnoughGroups {
            needed: 2,
            got: groups.len(),
        });
    }
    let mut order = groups.to_vec();
    order.shuffle(rng);

    let n = order.len();
    let qpg = questions_per_group.max(1);
    let mut rounds = Vec::with_capacity(qpg * n * (n - 1));
    for q in 0..qpg {
        for offset in 1..n {
            for i in 0..n {
                rounds.push(PairedRound {
                    acting: order[i].clone(),
                    target: order[(i + offset) % n].clone(),
                    question_index: q,
                });
            }
        }
    }
    Ok(RotationSchedule::Paired { rounds })
}

/// Re-validate a schedule read back from the store.
pub fn validate(schedule: &RotationSchedule) -> Result<()> {
    match schedule {
        RotationSchedule::Single { order, .. } => {
            if order.len() < 2 {
                return Err(CoordError::InvalidSchedule(format!(
                    "single rotation with {} actors",
                    order.len()
                )));
            }
        }
        RotationSchedule::Paired { rounds } => {
            if let Some(bad) = rounds.iter().find(|r| r.acting == r.target) {
                return Err(CoordError::InvalidSchedule(format!(
                    "group {} paired with itself",
                    bad.acting
                )));
            }
        }
    }
    Ok(())
}
