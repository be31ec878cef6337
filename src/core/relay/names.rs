//! Generated display names: an animal followed by a fruit, e.g. `otterpapaya`.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::core::config::{DISPLAY_NAME_MAX_ATTEMPTS, DISPLAY_NAME_MAX_LEN, DISPLAY_NAME_MIN_LEN};

const ANIMALS: [&str; 14] = [
    "tiger", "zebra", "panda", "otter", "koala", "falcon", "rabbit", "badger", "beaver",
    "walrus", "gecko", "bison", "heron", "lynx",
];

const FRUITS: [&str; 14] = [
    "mango", "lemon", "peach", "guava", "papaya", "cherry", "banana", "durian", "lychee",
    "apple", "melon", "grape", "plum", "kiwi",
];

/// Every animal+fruit compound within the length bounds.
fn combinations() -> Vec<String> {
    ANIMALS
        .iter()
        .flat_map(|a| FRUITS.iter().map(move |f| format!("{a}{f}")))
        .filter(|n| (DISPLAY_NAME_MIN_LEN..=DISPLAY_NAME_MAX_LEN).contains(&n.len()))
        .collect()
}

/// A display name for which `taken` is false.
///
/// Draws at random first, then scans every compound, and once all of them
/// are in use appends the smallest free number to a random compound.
pub fn generate<R: Rng>(rng: &mut R, taken: impl Fn(&str) -> bool) -> String {
    let names = combinations();
    for _ in 0..DISPLAY_NAME_MAX_ATTEMPTS {
        if let Some(name) = names.choose(&mut *rng) {
            if !taken(name.as_str()) {
                return name.clone();
            }
        }
    }
    if let Some(name) = names.iter().find(|n| !taken(n.as_str())) {
        return name.clone();
    }
    let base = names.choose(&mut *rng).cloned().unwrap_or_else(|| "peer".into());
    (2u64..)
        .map(|n| format!("{base}{n}"))
        .find(|n| !taken(n.as_str()))
        .unwrap_or(base)
}
