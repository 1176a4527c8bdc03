//! Peer link graph.
//!
//! Nodes are peer ids and edges are direct transport links. Each edge
//! remembers the origin that reported it. The graph is always walked as
//! undirected. Removing a link drops the component that can no longer be
//! reached from the origin, so no unreachable peers are left behind.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, trace};

/// A direct link between two peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Peer that reported the link.
    pub origin: String,
}

/// Undirected graph of peer links.
#[derive(Clone, Debug, Default)]
pub struct Routes {
    me: String,
    graph: BTreeMap<String, BTreeMap<String, Link>>,
}

impl Routes {
    /// Empty graph owned by peer `me`. `me` is the default origin.
    pub fn new(me: impl Into<String>) -> Self {
        Routes {
            me: me.into(),
            graph: BTreeMap::new(),
        }
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    /// Adds an undirected link. Returns the peers on the far side that just
    /// became reachable from `origin`, in BFS order.
    pub fn add_link(&mut self, from: &str, to: &str, origin: Option<&str>) -> Vec<String> {
        if from == to {
            debug!(peer = %from, "Ignoring self link");
            return Vec::new();
        }
        if self.get_link(from, to).is_some() {
            return Vec::new();
        }
        let origin = origin.unwrap_or(&self.me).to_string();
        let mut before = self.reachable(&origin);
        before.insert(origin.clone());

        let link = Link { origin };
        self.graph
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string(), link.clone());
        self.graph.entry(to.to_string()).or_default().insert(from.to_string(), link);

        let far = match (before.contains(from), before.contains(to)) {
            (true, false) => to,
            (false, true) => from,
            _ => return Vec::new(),
        };
        let reachable = self.walk(far, &before);
        trace!(from = %from, to = %to, new = reachable.len(), "Added link");
        reachable
    }

    /// Removes a link. Returns the peers no longer reachable from `origin`;
    /// they are dropped from the graph together with their links.
    pub fn delete_link(&mut self, from: &str, to: &str, origin: Option<&str>) -> Vec<String> {
        let removed = self.unlink(from, to) | self.unlink(to, from);
        if !removed {
            return Vec::new();
        }
        self.prune_isolated(from);
        self.prune_isolated(to);

        let origin = origin.unwrap_or(&self.me).to_string();
        let mut reachable = self.reachable(&origin);
        reachable.insert(origin);

        let lost = match (reachable.contains(from), reachable.contains(to)) {
            (true, false) => to,
            (false, true) => from,
            _ => return Vec::new(),
        };
        let component = self.walk(lost, &HashSet::new());
        for node in &component {
            self.remove_node(node);
        }
        debug!(from = %from, to = %to, unreachable = component.len(), "Deleted link");
        component
    }

    /// Drops a peer and every link touching it.
    pub fn remove_node(&mut self, node: &str) {
        if let Some(neighbours) = self.graph.remove(node) {
            for neighbour in neighbours.keys() {
                self.unlink(neighbour, node);
                self.prune_isolated(neighbour);
            }
        }
    }

    /// Shortest path by hop count, endpoints included. Empty when either end
    /// is unknown or unreachable.
    pub fn get_path(&self, from: &str, to: &str) -> Vec<String> {
        if !self.graph.contains_key(from) || !self.graph.contains_key(to) {
            return Vec::new();
        }
        if from == to {
            return vec![from.to_string()];
        }
        let mut parents: HashMap<&str, &str> = HashMap::new();
        let mut queue: VecDeque<&str> = VecDeque::from([from]);
        let mut visited: HashSet<&str> = HashSet::from([from]);
        while let Some(node) = queue.pop_front() {
            for neighbour in self.neighbour_ids(node) {
                if !visited.insert(neighbour) {
                    continue;
                }
                parents.insert(neighbour, node);
                if neighbour == to {
                    let mut path = vec![to.to_string()];
                    let mut current = to;
                    while let Some(parent) = parents.get(current) {
                        path.push(parent.to_string());
                        current = parent;
                    }
                    path.reverse();
                    return path;
                }
                queue.push_back(neighbour);
            }
        }
        Vec::new()
    }

    /// Symmetric link lookup.
    pub fn get_link(&self, a: &str, b: &str) -> Option<&Link> {
        self.graph.get(a).and_then(|n| n.get(b))
    }

    /// Number of undirected links.
    pub fn links_count(&self) -> usize {
        self.graph.values().map(|n| n.len()).sum::<usize>() / 2
    }

    pub fn has_node(&self, node: &str) -> bool {
        self.graph.contains_key(node)
    }

    pub fn nodes(&self) -> Vec<String> {
        self.graph.keys().cloned().collect()
    }

    pub fn neighbours(&self, node: &str) -> Vec<String> {
        self.neighbour_ids(node).map(str::to_string).collect()
    }

    /// Peers reachable from `origin`, `origin` included when present.
    pub fn reachable(&self, origin: &str) -> HashSet<String> {
        if !self.graph.contains_key(origin) {
            return HashSet::new();
        }
        self.walk(origin, &HashSet::new()).into_iter().collect()
    }

    fn neighbour_ids<'a>(&'a self, node: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.graph
            .get(node)
            .into_iter()
            .flat_map(|n| n.keys().map(String::as_str))
    }

    /// BFS from `start` that never enters `exclude`.
    fn walk(&self, start: &str, exclude: &HashSet<String>) -> Vec<String> {
        let mut order = vec![start.to_string()];
        let mut visited: HashSet<&str> = HashSet::from([start]);
        let mut queue: VecDeque<&str> = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for neighbour in self.neighbour_ids(node) {
                if exclude.contains(neighbour) || !visited.insert(neighbour) {
                    continue;
                }
                order.push(neighbour.to_string());
                queue.push_back(neighbour);
            }
        }
        order
    }

    fn unlink(&mut self, from: &str, to: &str) -> bool {
        self.graph
            .get_mut(from)
            .map_or(false, |n| n.remove(to).is_some())
    }

    fn prune_isolated(&mut self, node: &str) {
        if self.graph.get(node).map_or(false, |n| n.is_empty()) {
            self.graph.remove(node);
        }
    }
}
