use std::collections::HashSet;

use crate::domain::UserRecord;

/// Splits two user generations into `(deleted, added)`.
///
/// Records are compared structurally. A record present in both generations shows up in
/// neither output, so a user whose password changed comes back as one deletion plus one
/// addition sharing the same uid. Duplicates collapse; output follows input order.
pub fn diff_users(old: &[UserRecord], new: &[UserRecord]) -> (Vec<UserRecord>, Vec<UserRecord>) {
    let old_set: HashSet<&UserRecord> = old.iter().collect();
    let new_set: HashSet<&UserRecord> = new.iter().collect();

    let mut seen = HashSet::new();
    let deleted = old
        .iter()
        .filter(|u| !new_set.contains(u) && seen.insert(*u))
        .cloned()
        .collect();

    let mut seen = HashSet::new();
    let added = new
        .iter()
        .filter(|u| !old_set.contains(u) && seen.insert(*u))
        .cloned()
        .collect();

    (deleted, added)
}
