//! Annotated directed graph merging
//!
//! An ADG stores its nodes in an arena and refers to them by index, so
//! cycles pose no ownership problem. `merge` absorbs another graph so that
//! the result is the minimal ADG containing every absorbed input as an
//! annotation-preserving subdigraph.
//!
//! Cycles make this iterative: a source node may equal an existing node
//! only once its own out-edges resolve, so each unfinished source node
//! carries a tentative set of still-feasible targets. Passes shrink those
//! sets until a fixed point; at quiescence every surviving tentative must
//! be a singleton, which is then firmed up. Fresh nodes created before
//! their edges resolve carry `Unresolved` edge targets that are fixed up
//! at the end.

use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::fmt::Debug;
use tracing::{debug, trace};

/// Target of an out-edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeTarget {
    /// A settled node index in this graph
    Node(usize),
    /// Still points at a node index of the source graph being absorbed
    Unresolved(usize),
}

/// One graph node: an annotation and an ordered out-edge list
#[derive(Debug, Clone)]
pub struct Node<A> {
    /// The node's annotation; equality-decidable
    pub anno: A,
    /// Ordered out-edges
    pub outs: Vec<EdgeTarget>,
}

/// An annotated directed graph
#[derive(Debug, Clone)]
pub struct Adg<A> {
    /// Arena of nodes; indices are stable and insertion-ordered
    pub nodes: Vec<Node<A>>,
}

/// Mapping state of one source node during a merge
#[derive(Debug, Clone, PartialEq)]
enum Mapping {
    Unvisited,
    Tentative(BTreeSet<usize>),
    Done(usize),
}

impl<A> Default for Adg<A> {
    fn default() -> Self {
        Adg { nodes: Vec::new() }
    }
}

impl<A: Clone + PartialEq + Debug> Adg<A> {
    /// Create an empty graph
    pub fn new() -> Adg<A> {
        Adg::default()
    }

    /// Append a node with no edges, returning its index
    pub fn add_node(&mut self, anno: A) -> usize {
        self.nodes.push(Node {
            anno,
            outs: Vec::new(),
        });
        self.nodes.len() - 1
    }

    /// Append an out-edge from `from` to `to`
    pub fn link(&mut self, from: usize, to: usize) {
        self.nodes[from].outs.push(EdgeTarget::Node(to));
    }

    /// Replace any `Unresolved` edges of node `ui` whose source reference
    /// has since become definite.
    fn maybe_resolve(&mut self, ui: usize, id_map: &[Mapping]) {
        for out in &mut self.nodes[ui].outs {
            if let EdgeTarget::Unresolved(src_ref) = *out {
                if let Some(Mapping::Done(target)) = id_map.get(src_ref) {
                    *out = EdgeTarget::Node(*target);
                }
            }
        }
    }

    /// Absorb `other` into this graph, returning for each source node the
    /// index of its image.
    pub fn merge(&mut self, other: &Adg<A>) -> Result<Vec<usize>> {
        let n_src = other.nodes.len();
        let mut id_map = vec![Mapping::Unvisited; n_src];
        let mut pass = 0usize;
        while id_map.iter().any(|m| !matches!(m, Mapping::Done(_))) {
            pass += 1;
            debug!(pass, "merge pass");
            let mut changes = false;
            for i in 0..n_src {
                if matches!(id_map[i], Mapping::Done(_)) {
                    continue;
                }
                let src = &other.nodes[i];
                let src_outs = src
                    .outs
                    .iter()
                    .map(|e| match e {
                        EdgeTarget::Node(t) => Ok(*t),
                        EdgeTarget::Unresolved(_) => Err(Error::internal(
                            "source graph contains unresolved edges".to_string(),
                        )),
                    })
                    .collect::<Result<Vec<usize>>>()?;
                let all_done = src_outs
                    .iter()
                    .all(|&r| matches!(id_map[r], Mapping::Done(_)));
                if all_done {
                    // Dependencies exist; match against the arena or append.
                    let new_edges: Vec<usize> = src_outs
                        .iter()
                        .map(|&r| match id_map[r] {
                            Mapping::Done(t) => t,
                            _ => unreachable!(),
                        })
                        .collect();
                    let mut found = None;
                    for ui in 0..self.nodes.len() {
                        if self.nodes[ui].anno != src.anno {
                            continue;
                        }
                        self.maybe_resolve(ui, &id_map);
                        let u = &self.nodes[ui];
                        let same = u.outs.len() == new_edges.len()
                            && u.outs
                                .iter()
                                .zip(&new_edges)
                                .all(|(e, &t)| *e == EdgeTarget::Node(t));
                        if same {
                            found = Some(ui);
                            break;
                        }
                    }
                    match found {
                        Some(ui) => {
                            trace!(src = i, dst = ui, "matched existing node");
                            id_map[i] = Mapping::Done(ui);
                        }
                        None => {
                            let idx = self.nodes.len();
                            self.nodes.push(Node {
                                anno: src.anno.clone(),
                                outs: new_edges.into_iter().map(EdgeTarget::Node).collect(),
                            });
                            trace!(src = i, dst = idx, "appended node");
                            id_map[i] = Mapping::Done(idx);
                        }
                    }
                    changes = true;
                } else {
                    // Some dependency is still unsettled: collect the set of
                    // arena nodes this source node remains compatible with.
                    let mut tents = BTreeSet::new();
                    for ui in 0..self.nodes.len() {
                        if self.nodes[ui].anno != src.anno {
                            continue;
                        }
                        self.maybe_resolve(ui, &id_map);
                        let u = &self.nodes[ui];
                        if u.outs.len() != src_outs.len() {
                            continue;
                        }
                        let mut ok = true;
                        for (j, &r) in src_outs.iter().enumerate() {
                            match (&id_map[r], &u.outs[j]) {
                                (Mapping::Tentative(set), EdgeTarget::Node(k)) => {
                                    if !set.contains(k) {
                                        ok = false;
                                        break;
                                    }
                                }
                                (Mapping::Done(d), EdgeTarget::Node(k)) => {
                                    if k != d {
                                        ok = false;
                                        break;
                                    }
                                }
                                // An unresolved position can still become
                                // anything; an unvisited ref constrains
                                // nothing yet.
                                (_, EdgeTarget::Unresolved(_)) => {}
                                (Mapping::Unvisited, _) => {}
                            }
                        }
                        if ok {
                            tents.insert(ui);
                        }
                    }
                    trace!(src = i, ?tents, "tentative candidates");
                    if !tents.is_empty() {
                        let update = match &id_map[i] {
                            Mapping::Tentative(old) => *old != tents,
                            _ => true,
                        };
                        if update {
                            id_map[i] = Mapping::Tentative(tents);
                            changes = true;
                        }
                    } else {
                        // No candidate exists; append a fresh node whose
                        // edges stay unresolved until the fix-up below.
                        let idx = self.nodes.len();
                        self.nodes.push(Node {
                            anno: src.anno.clone(),
                            outs: src_outs
                                .iter()
                                .map(|&r| EdgeTarget::Unresolved(r))
                                .collect(),
                        });
                        trace!(src = i, dst = idx, "appended unresolved node");
                        id_map[i] = Mapping::Done(idx);
                        changes = true;
                    }
                }
            }
            if !changes {
                debug!("firming up tentatives");
                for i in 0..n_src {
                    match &id_map[i] {
                        Mapping::Done(_) => {}
                        Mapping::Tentative(tents) => {
                            if tents.len() != 1 {
                                return Err(Error::internal(format!(
                                    "ambiguous tentative for source node {}: {:?}",
                                    i, tents
                                )));
                            }
                            let ui = *tents.iter().next().unwrap();
                            if self.nodes[ui].anno != other.nodes[i].anno {
                                return Err(Error::internal(format!(
                                    "firmed-up annotation mismatch for source node {}",
                                    i
                                )));
                            }
                            trace!(src = i, dst = ui, "firmed up");
                            id_map[i] = Mapping::Done(ui);
                        }
                        Mapping::Unvisited => {
                            return Err(Error::internal(format!(
                                "source node {} never visited",
                                i
                            )));
                        }
                    }
                }
            }
        }
        // Fix up edges that still reference source-node indices.
        for node in &mut self.nodes {
            for out in &mut node.outs {
                if let EdgeTarget::Unresolved(src_ref) = *out {
                    match id_map.get(src_ref) {
                        Some(Mapping::Done(target)) => *out = EdgeTarget::Node(*target),
                        _ => {
                            return Err(Error::internal(format!(
                                "unresolved edge to source node {} after merge",
                                src_ref
                            )))
                        }
                    }
                }
            }
        }
        debug!(passes = pass, "merge complete");
        Ok(id_map
            .into_iter()
            .map(|m| match m {
                Mapping::Done(i) => i,
                _ => unreachable!(),
            })
            .collect())
    }

    /// The out-edge targets of a node, which must all be settled
    pub fn outs_of(&self, index: usize) -> Result<Vec<usize>> {
        self.nodes[index]
            .outs
            .iter()
            .map(|e| match e {
                EdgeTarget::Node(t) => Ok(*t),
                EdgeTarget::Unresolved(r) => Err(Error::internal(format!(
                    "edge of node {} unresolved (source ref {})",
                    index, r
                ))),
            })
            .collect()
    }
}
