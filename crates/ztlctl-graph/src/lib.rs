#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ztlctl-graph** – Knowledge-graph engine for the ztlctl vault.
//!
//! The graph is derived state: it is constructed lazily from the edges table
//! on first access per invocation and invalidated on any write. Observers
//! therefore see a snapshot as of the start of the invocation or, after a
//! write, the post-commit state on next access.
//!
//! Node attributes `(kind, title)` are loaded alongside the topology so
//! results can be rendered without a second round-trip.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::debug;

use ztlctl_store::{queries, Store};
use ztlctl_types::ContentKind;

pub mod algo;

use algo::Adjacency;

/// Node attributes carried in the snapshot.
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// Node identifier.
    pub id: String,
    /// Content kind.
    pub kind: ContentKind,
    /// Human title.
    pub title: String,
}

/// Materialized metrics for one node, written back onto the nodes table.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeMetrics {
    /// Node identifier.
    pub id: String,
    /// Incoming edge count.
    pub in_degree: i64,
    /// Outgoing edge count.
    pub out_degree: i64,
    /// PageRank score.
    pub pagerank: f64,
    /// Community id from the configured detection algorithm.
    pub cluster: Option<i64>,
    /// Betweenness centrality.
    pub betweenness: f64,
}

/// An immutable graph snapshot for one invocation.
#[derive(Debug)]
pub struct GraphSnapshot {
    graph: DiGraph<GraphNode, f64>,
    index: HashMap<String, NodeIndex>,
}

impl GraphSnapshot {
    /// Build a snapshot from node attributes and directed edges.
    pub fn build(nodes: Vec<GraphNode>, edges: Vec<(String, String, f64)>) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for node in nodes {
            let id = node.id.clone();
            let ix = graph.add_node(node);
            index.insert(id, ix);
        }
        for (source, target, weight) in edges {
            if let (Some(&s), Some(&t)) = (index.get(&source), index.get(&target)) {
                graph.add_edge(s, t, weight);
            }
        }
        Self { graph, index }
    }

    /// Number of nodes in the snapshot.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of directed edges in the snapshot.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Whether an id is present.
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    fn attrs(&self, ix: NodeIndex) -> &GraphNode {
        &self.graph[ix]
    }

    /// Undirected weighted projection as adjacency lists.
    fn undirected(&self) -> Adjacency {
        let mut adj: Adjacency = vec![Vec::new(); self.graph.node_count()];
        for edge in self.graph.edge_indices() {
            if let Some((a, b)) = self.graph.edge_endpoints(edge) {
                let w = self.graph[edge];
                adj[a.index()].push((b.index(), w));
                adj[b.index()].push((a.index(), w));
            }
        }
        adj
    }

    /// Spreading activation from `seed` with decay 0.5 per hop, capped at
    /// `max_depth`, over the undirected projection.
    pub fn related(&self, seed: &str, max_depth: usize) -> Option<Vec<(GraphNode, f64)>> {
        let &seed_ix = self.index.get(seed)?;
        let adj = self.undirected();
        let hits = algo::spread_activation(&adj, seed_ix.index(), 0.5, max_depth);
        Some(
            hits.into_iter()
                .map(|(v, score)| (self.attrs(NodeIndex::new(v)).clone(), score))
                .collect(),
        )
    }

    /// Community detection.
    ///
    /// `requested` names the algorithm from configuration; only Louvain is
    /// available, so a `leiden` request degrades with a surfaced warning.
    pub fn themes(&self, requested: &str) -> (Vec<Vec<GraphNode>>, Option<String>) {
        let warning = match requested {
            "louvain" => None,
            other => Some(format!(
                "community algorithm '{}' unavailable, falling back to louvain",
                other
            )),
        };
        let communities = algo::louvain(&self.undirected());
        let count = communities.iter().copied().max().map_or(0, |m| m + 1);
        let mut grouped: Vec<Vec<GraphNode>> = vec![Vec::new(); count];
        for (v, &c) in communities.iter().enumerate() {
            grouped[c].push(self.attrs(NodeIndex::new(v)).clone());
        }
        grouped.retain(|g| !g.is_empty());
        grouped.sort_by_key(|g| std::cmp::Reverse(g.len()));
        (grouped, warning)
    }

    /// PageRank with damping 0.85, strongest first.
    pub fn rank(&self) -> Vec<(GraphNode, f64)> {
        let scores = self.pagerank_scores();
        let mut out: Vec<(GraphNode, f64)> = scores
            .into_iter()
            .enumerate()
            .map(|(v, s)| (self.attrs(NodeIndex::new(v)).clone(), s))
            .collect();
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    fn pagerank_scores(&self) -> Vec<f64> {
        let out_edges: Vec<Vec<usize>> = self
            .graph
            .node_indices()
            .map(|ix| {
                self.graph
                    .neighbors_directed(ix, Direction::Outgoing)
                    .map(|n| n.index())
                    .collect()
            })
            .collect();
        algo::pagerank(&out_edges, 0.85, 100, 1e-9)
    }

    /// Shortest path between two ids in the undirected projection.
    pub fn path(&self, from: &str, to: &str) -> Option<Vec<GraphNode>> {
        let &from_ix = self.index.get(from)?;
        let &to_ix = self.index.get(to)?;
        let adj = self.undirected();
        let path = algo::shortest_path(&adj, from_ix.index(), to_ix.index())?;
        Some(path.into_iter().map(|v| self.attrs(NodeIndex::new(v)).clone()).collect())
    }

    /// Hop distance between two ids, `None` when unreachable or unknown.
    pub fn distance(&self, from: &str, to: &str) -> Option<usize> {
        let &from_ix = self.index.get(from)?;
        let &to_ix = self.index.get(to)?;
        algo::distance(&self.undirected(), from_ix.index(), to_ix.index())
    }

    /// Structural holes: nodes with the lowest Burt constraint, top-k.
    pub fn gaps(&self, top_k: usize) -> Vec<(GraphNode, f64)> {
        let scores = algo::constraint(&self.undirected());
        let mut out: Vec<(GraphNode, f64)> = scores
            .into_iter()
            .enumerate()
            .filter_map(|(v, c)| c.map(|c| (self.attrs(NodeIndex::new(v)).clone(), c)))
            .collect();
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        out.truncate(top_k);
        out
    }

    /// Bridges: highest betweenness centrality, top-k.
    pub fn bridges(&self, top_k: usize) -> Vec<(GraphNode, f64)> {
        let scores = algo::betweenness(&self.undirected());
        let mut out: Vec<(GraphNode, f64)> = scores
            .into_iter()
            .enumerate()
            .map(|(v, s)| (self.attrs(NodeIndex::new(v)).clone(), s))
            .collect();
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        out.truncate(top_k);
        out
    }

    /// Compute every materialized metric in one pass.
    ///
    /// `community_algorithm` comes from configuration; the Leiden fallback
    /// warning is folded into the returned option.
    pub fn materialize_metrics(
        &self,
        community_algorithm: &str,
    ) -> (Vec<NodeMetrics>, Option<String>) {
        let pagerank = self.pagerank_scores();
        let betweenness = algo::betweenness(&self.undirected());
        let warning = match community_algorithm {
            "louvain" => None,
            other => Some(format!(
                "community algorithm '{}' unavailable, falling back to louvain",
                other
            )),
        };
        let communities = algo::louvain(&self.undirected());
        let metrics = self
            .graph
            .node_indices()
            .map(|ix| {
                let v = ix.index();
                NodeMetrics {
                    id: self.attrs(ix).id.clone(),
                    in_degree: self.graph.neighbors_directed(ix, Direction::Incoming).count() as i64,
                    out_degree: self.graph.neighbors_directed(ix, Direction::Outgoing).count() as i64,
                    pagerank: pagerank.get(v).copied().unwrap_or(0.0),
                    cluster: communities.get(v).map(|&c| c as i64),
                    betweenness: betweenness.get(v).copied().unwrap_or(0.0),
                }
            })
            .collect();
        (metrics, warning)
    }
}

/// Lazy, invalidatable access to the vault's graph snapshot.
///
/// Mutating services call [`GraphEngine::invalidate`] on every transaction
/// commit *and* abort; the next access rebuilds from the committed edges.
#[derive(Debug, Clone)]
pub struct GraphEngine {
    store: Store,
    cache: Arc<Mutex<Option<Arc<GraphSnapshot>>>>,
}

impl GraphEngine {
    /// Create an engine over one vault's store.
    pub fn new(store: Store) -> Self {
        Self { store, cache: Arc::new(Mutex::new(None)) }
    }

    /// The current snapshot, building it on first access.
    pub async fn snapshot(&self) -> Result<Arc<GraphSnapshot>, ztlctl_store::StoreError> {
        if let Some(snapshot) = self.cache.lock().expect("graph cache lock").clone() {
            return Ok(snapshot);
        }
        let mut conn = self.store.pool().acquire().await?;
        let nodes = queries::all_nodes(&mut conn)
            .await?
            .into_iter()
            .map(|n| GraphNode { id: n.id, kind: n.kind, title: n.title })
            .collect();
        let edges = queries::all_edges(&mut conn)
            .await?
            .into_iter()
            .map(|e| (e.source_id, e.target_id, e.weight))
            .collect();
        let snapshot = Arc::new(GraphSnapshot::build(nodes, edges));
        debug!(
            nodes = snapshot.node_count(),
            edges = snapshot.edge_count(),
            "graph snapshot built"
        );
        *self.cache.lock().expect("graph cache lock") = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Drop the cached snapshot; the next access rebuilds it.
    pub fn invalidate(&self) {
        *self.cache.lock().expect("graph cache lock") = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> GraphSnapshot {
        let nodes = ["a", "b", "c", "d"]
            .iter()
            .map(|id| GraphNode {
                id: id.to_string(),
                kind: ContentKind::Note,
                title: id.to_uppercase(),
            })
            .collect();
        let edges = vec![
            ("a".into(), "b".into(), 1.0),
            ("b".into(), "c".into(), 1.0),
            ("c".into(), "d".into(), 1.0),
        ];
        GraphSnapshot::build(nodes, edges)
    }

    #[test]
    fn test_related_decays_over_undirected_projection() {
        let snap = snapshot();
        let hits = snap.related("c", 3).unwrap();
        // b and d are both one hop away in the undirected projection.
        let scores: HashMap<String, f64> =
            hits.into_iter().map(|(n, s)| (n.id, s)).collect();
        assert_eq!(scores["b"], 0.5);
        assert_eq!(scores["d"], 0.5);
        assert_eq!(scores["a"], 0.25);
    }

    #[test]
    fn test_unknown_seed_is_none() {
        assert!(snapshot().related("nope", 2).is_none());
    }

    #[test]
    fn test_themes_warns_on_leiden_request() {
        let (_, warning) = snapshot().themes("leiden");
        assert!(warning.unwrap().contains("louvain"));
        let (_, none) = snapshot().themes("louvain");
        assert!(none.is_none());
    }

    #[test]
    fn test_path_crosses_edge_direction() {
        let snap = snapshot();
        let path = snap.path("d", "a").unwrap();
        let ids: Vec<&str> = path.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "c", "b", "a"]);
    }

    #[test]
    fn test_materialize_metrics_covers_every_node() {
        let snap = snapshot();
        let (metrics, warning) = snap.materialize_metrics("leiden");
        assert!(warning.is_some());
        assert_eq!(metrics.len(), 4);
        let a = metrics.iter().find(|m| m.id == "a").unwrap();
        assert_eq!((a.in_degree, a.out_degree), (0, 1));
        let total_pr: f64 = metrics.iter().map(|m| m.pagerank).sum();
        assert!((total_pr - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_edges_to_unknown_nodes_are_skipped() {
        let nodes = vec![GraphNode { id: "a".into(), kind: ContentKind::Note, title: "A".into() }];
        let snap = GraphSnapshot::build(nodes, vec![("a".into(), "ghost".into(), 1.0)]);
        assert_eq!(snap.edge_count(), 0);
    }
}
