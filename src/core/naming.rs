//! Logical id allocation for construct paths.
//!
//! A top-level construct keeps its own name. Nested constructs get a human
//! readable prefix built from their path plus an 8-character digest of the
//! full path, so two distinct paths never share an id even when their
//! alphanumeric projections collide (`a-b/c` vs `ab/c`).

use crate::assets::hasher;

const HASH_LEN: usize = 8;
const MAX_HUMAN_LEN: usize = 240;
const MAX_ID_LEN: usize = 255;

/// Path component dropped from both the digest and the human part.
const HIDDEN_ID: &str = "Default";
/// Path component dropped from the human part only.
const HIDDEN_FROM_HUMAN_ID: &str = "Resource";

/// Allocate the CloudFormation logical id for a construct path.
pub fn logical_id(path: &[&str]) -> String {
    let components: Vec<&str> = path
        .iter()
        .copied()
        .filter(|c| !c.is_empty() && *c != HIDDEN_ID)
        .collect();

    if components.len() == 1 {
        let candidate = remove_non_alphanumeric(components[0]);
        if !candidate.is_empty() && candidate.len() <= MAX_ID_LEN {
            return candidate;
        }
    }

    let digest = path_digest(&components);
    let human = human_part(&components);
    format!("{}{}", human, digest)
}

fn path_digest(components: &[&str]) -> String {
    let hash = hasher::hash_string(&components.join("/"));
    hasher::hex_digest(&hash)[..HASH_LEN].to_uppercase()
}

fn human_part(components: &[&str]) -> String {
    let mut kept: Vec<&str> = Vec::new();
    for c in components {
        if *c == HIDDEN_FROM_HUMAN_ID {
            continue;
        }
        // Consecutive duplicates read as noise (`Service/Service`)
        if kept.last() == Some(c) {
            continue;
        }
        kept.push(c);
    }
    let mut human: String = kept.iter().map(|c| remove_non_alphanumeric(c)).collect();
    human.truncate(MAX_HUMAN_LEN);
    human
}

fn remove_non_alphanumeric(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}
