use std::collections::HashMap;

use rand::Rng;

use crate::error::{Error, Result};
use crate::model::Character;

pub const INITIATIVE_DIE: i64 = 20;

/// Characters ordered by initiative, highest first. Ties keep input order.
pub fn compute_queue(characters: &[Character]) -> Vec<&Character> {
    let mut queue: Vec<&Character> = characters.iter().collect();
    // `sort_by` is stable.
    queue.sort_by(|a, b| b.initiative.cmp(&a.initiative));
    queue
}

/// Index after `index`, wrapping to 0 past the end. An empty queue stays at 0.
pub fn advance_turn(queue_len: usize, index: usize) -> usize {
    if queue_len == 0 {
        return 0;
    }
    (index + 1) % queue_len
}

/// Clamps a (possibly stale) index into the queue range.
pub fn normalize_turn_index(queue_len: usize, index: usize) -> usize {
    if queue_len == 0 {
        0
    } else {
        index % queue_len
    }
}

pub fn current_entry<'a>(queue: &[&'a Character], turn_index: usize) -> Option<&'a Character> {
    queue
        .get(normalize_turn_index(queue.len(), turn_index))
        .copied()
}

pub fn is_turn_of(queue: &[&Character], turn_index: usize, user_id: &str) -> bool {
    current_entry(queue, turn_index).is_some_and(|c| c.controller_id == user_id)
}

/// d20 plus dexterity modifier for every character.
pub fn roll_initiative<R: Rng + ?Sized>(
    characters: &[Character],
    rng: &mut R,
) -> Result<HashMap<String, i64>> {
    if characters.is_empty() {
        return Err(Error::Data("no characters to roll initiative for".to_string()));
    }
    Ok(characters
        .iter()
        .map(|c| {
            let roll = rng.gen_range(1..=INITIATIVE_DIE);
            (c.id.clone(), roll + c.dex_modifier)
        })
        .collect())
}
