use std::collections::BTreeSet;

use rand::Rng;

use crate::domain::CredentialId;

/// Draws uniformly over the id range until the draw is unused.
pub fn generate(existing: &BTreeSet<CredentialId>) -> CredentialId {
    let mut rng = rand::rng();
    loop {
        let candidate: CredentialId = rng.random();
        if !existing.contains(&candidate) {
            return candidate;
        }
    }
}

/// Deterministic variant: the lowest id not in use.
pub fn lowest_unused(existing: &BTreeSet<CredentialId>) -> CredentialId {
    let mut next = 0;
    for &id in existing {
        if id != next {
            break;
        }
        next += 1;
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn lowest_unused_fills_gaps() {
        assert_eq!(lowest_unused(&BTreeSet::new()), 0);
        assert_eq!(lowest_unused(&BTreeSet::from([0, 1, 3])), 2);
        assert_eq!(lowest_unused(&BTreeSet::from([1, 2])), 0);
        assert_eq!(lowest_unused(&BTreeSet::from([0, 1, 2])), 3);
    }

    #[test]
    fn repeated_generation_never_repeats() {
        let mut used = BTreeSet::new();
        for _ in 0..2_000 {
            let id = generate(&used);
            assert!(used.insert(id), "duplicate id {id}");
        }
    }

    proptest! {
        #[test]
        fn generated_id_is_fresh(used in proptest::collection::btree_set(any::<u32>(), 0..200)) {
            prop_assert!(!used.contains(&generate(&used)));
            prop_assert!(!used.contains(&lowest_unused(&used)));
        }
    }
}
