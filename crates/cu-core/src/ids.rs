//! Environment id generation and deterministic edit match ids.

use rand::seq::IndexedRandom;
use sha2::{Digest, Sha256};

/// Adjectives used to build a human-memorable environment id.
const ADJECTIVES: &[&str] = &[
    "fancy", "quiet", "brave", "swift", "amber", "crimson", "gentle", "hidden", "lucky", "mellow",
    "nimble", "proud", "rusty", "silent", "tidy", "vivid", "wobbly", "zesty", "bold", "calm",
];

/// Nouns used to build a human-memorable environment id.
const NOUNS: &[&str] = &[
    "mallard", "otter", "falcon", "badger", "heron", "marmot", "cricket", "lynx", "tapir", "gecko",
    "walrus", "pelican", "weasel", "ibis", "puffin", "mantis", "newt", "jackal", "toucan", "moth",
];

/// Generate a new `adjective-noun` environment id, e.g. `fancy-mallard`.
///
/// Not guaranteed unique on its own; callers must retry against the fork's
/// existing branch list on collision (collisions are rare but not
/// impossible with a word list this size).
#[must_use]
pub fn generate_environment_id() -> String {
    let mut rng = rand::rng();
    let adj = ADJECTIVES.choose(&mut rng).unwrap_or(&"fancy");
    let noun = NOUNS.choose(&mut rng).unwrap_or(&"mallard");
    format!("{adj}-{noun}")
}

/// Compute the deterministic match id for one occurrence of `search` inside
/// `path`, used to disambiguate an [`crate::error::Error::AmbiguousEdit`].
///
/// The id is a short hash over `(path, search, replace, index)` so that the
/// same ambiguous edit produces the same candidate ids across runs — a
/// caller can compute an id offline and pass it back without round-tripping
/// through a prior error.
#[must_use]
pub fn edit_match_id(path: &str, search: &str, replace: &str, index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(search.as_bytes());
    hasher.update([0u8]);
    hasher.update(replace.as_bytes());
    hasher.update([0u8]);
    hasher.update(index.to_le_bytes());
    let digest = hasher.finalize();
    format!("ed-{:x}", digest[0..4].iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}
