//! Keyed list reconciliation
//!
//! Managed lists (load-balancer ACLs, security-group rules) are stored remotely as
//! individually addressable items carrying a position key. Desired items get keys
//! `first_key, first_key + 1, ...` in declared order; existing items are matched by key.

/// One step of a list reconciliation
#[derive(Debug, Clone, PartialEq)]
pub enum ListChange<'a, E, D> {
    Keep { existing: &'a E, desired: &'a D },
    Update { existing: &'a E, desired: &'a D, key: i64 },
    Delete { existing: &'a E },
    Create { desired: &'a D, key: i64 },
}

/// Diff `existing` against `desired`.
///
/// Changes come out deletes first, then in-place updates, then creations with
/// increasing keys, which is the order the APIs accept them in.
pub fn diff_keyed<'a, E, D, K, S>(
    existing: &'a [E],
    desired: &'a [D],
    first_key: i64,
    key_of: K,
    same: S,
) -> Vec<ListChange<'a, E, D>>
where
    K: Fn(&E) -> i64,
    S: Fn(&E, &D) -> bool,
{
    let mut deletes = Vec::new();
    let mut updates = Vec::new();
    let mut creates = Vec::new();
    let mut claimed = vec![false; existing.len()];

    for (position, wanted) in desired.iter().enumerate() {
        let key = first_key + position as i64;
        let found = existing.iter().position(|e| key_of(e) == key);
        match found {
            Some(index) => {
                claimed[index] = true;
                let current = &existing[index];
                if same(current, wanted) {
                    updates.push(ListChange::Keep {
                        existing: current,
                        desired: wanted,
                    });
                } else {
                    updates.push(ListChange::Update {
                        existing: current,
                        desired: wanted,
                        key,
                    });
                }
            }
            None => creates.push(ListChange::Create { desired: wanted, key }),
        }
    }

    // Out-of-range keys and second holders of an already matched key
    for (item, claimed) in existing.iter().zip(claimed) {
        if !claimed {
            deletes.push(ListChange::Delete { existing: item });
        }
    }

    deletes.extend(updates);
    deletes.extend(creates);
    deletes
}

/// Whether a diff changes anything
pub fn is_noop<E, D>(changes: &[ListChange<'_, E, D>]) -> bool {
    changes
        .iter()
        .all(|c| matches!(c, ListChange::Keep { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Acl {
        index: i64,
        action: &'static str,
    }

    fn acl(index: i64, action: &'static str) -> Acl {
        Acl { index, action }
    }

    fn diff<'a>(existing: &'a [Acl], desired: &'a [&'static str]) -> Vec<ListChange<'a, Acl, &'static str>> {
        diff_keyed(existing, desired, 1, |e| e.index, |e, d| e.action == *d)
    }

    #[test]
    fn test_keep_update_delete_create() {
        let existing = vec![acl(1, "allow"), acl(2, "deny"), acl(5, "allow")];
        let desired = vec!["allow", "allow", "deny"];
        let changes = diff(&existing, &desired);

        assert!(matches!(changes[0], ListChange::Delete { existing } if existing.index == 5));
        assert!(matches!(changes[1], ListChange::Keep { existing, .. } if existing.index == 1));
        assert!(matches!(changes[2], ListChange::Update { key: 2, .. }));
        assert!(matches!(changes[3], ListChange::Create { key: 3, .. }));
        assert_eq!(changes.len(), 4);
    }

    #[test]
    fn test_duplicate_keys_are_deleted() {
        let existing = vec![acl(1, "allow"), acl(1, "deny")];
        let changes = diff(&existing, &["allow"]);

        assert_eq!(changes.len(), 2);
        assert!(matches!(changes[0], ListChange::Delete { existing } if existing.action == "deny"));
        assert!(matches!(changes[1], ListChange::Keep { existing, .. } if existing.action == "allow"));
    }

    #[test]
    fn test_creates_use_increasing_keys() {
        let desired = vec!["a", "b", "c"];
        let keys: Vec<i64> = diff(&[], &desired)
            .into_iter()
            .filter_map(|c| match c {
                ListChange::Create { key, .. } => Some(key),
                _ => None,
            })
            .collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn test_unchanged_list_is_noop() {
        let existing = vec![acl(1, "allow")];
        assert!(is_noop(&diff(&existing, &["allow"])));
        assert!(!is_noop(&diff(&existing, &[])));
    }
}
