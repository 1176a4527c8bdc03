//! Replication reorganization planning.
//!
//! When replicator membership changes, leaders of some gids change too. For
//! every gid a node holds heads of, the planner compares the current leaders
//! with the leaders recorded on the previous pass and decides:
//! - which new leaders must receive the gid's heads
//! - which heads to drop because this node no longer leads the gid
//!
//! Planning is pure. The node executes the returned [`ReorgPlan`].

use mdrl_log::Hash;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// What the planner needs to know about one head.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadInfo {
    pub hash: Hash,
    pub created_locally: bool,
    /// The program's sync filter wants to keep it.
    pub retained: bool,
}

/// Heads of one store grouped by gid.
#[derive(Clone, Debug, Default)]
pub struct StoreHeads {
    pub store_index: u32,
    pub groups: BTreeMap<String, Vec<HeadInfo>>,
}

/// Heads of one gid to send to its new leaders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendHeads {
    pub store_index: u32,
    pub gid: String,
    pub to: Vec<String>,
    pub heads: Vec<Hash>,
}

/// Heads to remove recursively from a store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PruneHeads {
    pub store_index: u32,
    pub gid: String,
    pub heads: Vec<Hash>,
}

/// Effects of one reorganization pass over a program.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReorgPlan {
    pub sends: Vec<SendHeads>,
    pub prunes: Vec<PruneHeads>,
    /// Leaders per gid after this pass.
    pub history: BTreeMap<String, BTreeSet<String>>,
    /// Stores that gained a leader and should be trimmed once.
    pub changed_stores: BTreeSet<u32>,
}

impl ReorgPlan {
    /// True iff some gid gained a leader other than this node.
    pub fn changed(&self) -> bool {
        !self.changed_stores.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.prunes.is_empty() && !self.changed()
    }
}

/// Plans one pass. `leaders` maps a gid to its current leaders; `history`
/// holds the leaders of each gid from earlier passes.
pub fn plan(
    me: &str,
    stores: &[StoreHeads],
    leaders: impl Fn(&str) -> Vec<String>,
    history: &HashMap<String, BTreeSet<String>>,
) -> ReorgPlan {
    let mut out = ReorgPlan::default();
    for store in stores {
        for (gid, heads) in &store.groups {
            if heads.is_empty() {
                continue;
            }
            let current = leaders(gid);
            let previous = out.history.get(gid).or_else(|| history.get(gid));
            let new_leaders: Vec<String> = current
                .iter()
                .filter(|peer| peer.as_str() != me && previous.map_or(true, |prev| !prev.contains(*peer)))
                .cloned()
                .collect();

            if !new_leaders.is_empty() {
                out.changed_stores.insert(store.store_index);
                out.sends.push(SendHeads {
                    store_index: store.store_index,
                    gid: gid.clone(),
                    to: new_leaders,
                    heads: heads.iter().map(|h| h.hash).collect(),
                });
            }

            if !current.iter().any(|peer| peer == me) {
                let doomed: Vec<Hash> = heads
                    .iter()
                    .filter(|h| !h.created_locally && !h.retained)
                    .map(|h| h.hash)
                    .collect();
                if !doomed.is_empty() {
                    out.prunes.push(PruneHeads {
                        store_index: store.store_index,
                        gid: gid.clone(),
                        heads: doomed,
                    });
                }
            }

            out.history.insert(gid.clone(), current.into_iter().collect());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaders::find_leaders;

    fn head(seed: &str, created_locally: bool) -> HeadInfo {
        HeadInfo {
            hash: Hash::digest(seed.as_bytes()),
            created_locally,
            retained: false,
        }
    }

    fn store(groups: Vec<(&str, Vec<HeadInfo>)>) -> StoreHeads {
        StoreHeads {
            store_index: 0,
            groups: groups.into_iter().map(|(g, h)| (g.to_string(), h)).collect(),
        }
    }

    fn fixed(leaders: &'static [&'static str]) -> impl Fn(&str) -> Vec<String> {
        move |_: &str| leaders.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_new_leader_receives_heads() {
        let stores = vec![store(vec![("g", vec![head("1", true)])])];
        let plan = plan("me", &stores, fixed(&["me", "peer"]), &HashMap::new());
        assert_eq!(plan.sends.len(), 1);
        assert_eq!(plan.sends[0].to, vec!["peer".to_string()]);
        assert!(plan.prunes.is_empty());
        assert!(plan.changed());
    }

    #[test]
    fn test_second_pass_is_noop() {
        let stores = vec![store(vec![("g", vec![head("1", false)])])];
        let first = plan("me", &stores, fixed(&["me", "peer"]), &HashMap::new());
        let history: HashMap<_, _> = first.history.into_iter().collect();
        let second = plan("me", &stores, fixed(&["me", "peer"]), &history);
        assert!(second.sends.is_empty());
        assert!(!second.changed());
        assert!(second.prunes.is_empty());
    }

    #[test]
    fn test_losing_leadership_prunes_foreign_heads() {
        let stores = vec![store(vec![(
            "g",
            vec![head("local", true), head("remote", false), {
                let mut kept = head("kept", false);
                kept.retained = true;
                kept
            }],
        )])];
        let history: HashMap<String, BTreeSet<String>> =
            [("g".to_string(), ["me", "a"].iter().map(|s| s.to_string()).collect())].into();
        let plan = plan("me", &stores, fixed(&["a", "b"]), &history);
        assert_eq!(plan.prunes.len(), 1);
        assert_eq!(plan.prunes[0].heads, vec![Hash::digest(b"remote")]);
        assert_eq!(plan.sends[0].to, vec!["b".to_string()]);
    }

    #[test]
    fn test_history_updates_within_a_pass() {
        let stores = vec![
            store(vec![("g", vec![head("1", true)])]),
            StoreHeads {
                store_index: 1,
                ..store(vec![("g", vec![head("2", true)])])
            },
        ];
        let plan = plan("me", &stores, fixed(&["me", "peer"]), &HashMap::new());
        assert_eq!(plan.sends.len(), 1);
        assert_eq!(plan.changed_stores, [0].into_iter().collect());
    }

    #[test]
    fn test_with_rendezvous_leaders() {
        let peers: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let groups: Vec<(String, Vec<HeadInfo>)> = (0..20)
            .map(|i| (format!("gid-{}", i), vec![head(&i.to_string(), false)]))
            .collect();
        let stores = vec![StoreHeads {
            store_index: 0,
            groups: groups.into_iter().collect(),
        }];
        let plan = plan("a", &stores, |gid| find_leaders(&peers, gid, 2), &HashMap::new());
        for prune in &plan.prunes {
            assert!(!find_leaders(&peers, &prune.gid, 2).contains(&"a".to_string()));
        }
        for send in &plan.sends {
            assert!(!send.to.contains(&"a".to_string()));
        }
        assert_eq!(plan.history.len(), 20);
    }

    #[test]
    fn test_empty_groups_are_skipped() {
        let stores = vec![store(vec![("g", vec![])])];
        let plan = plan("me", &stores, fixed(&["peer"]), &HashMap::new());
        assert!(plan.is_empty());
        assert!(plan.history.is_empty());
    }
}
