//! Plan graph
//!
//! The plan is an append-only DAG of operation nodes. During planning the
//! script extends a `PlanBuilder`; `freeze` validates the graph and produces
//! the immutable `Plan` the executor consumes.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::node::{Node, NodeId, NodeKind, SourceSpan};
use crate::value::Value;

/// Mutable plan under construction.
#[derive(Debug, Default)]
pub struct PlanBuilder {
    nodes: Vec<Node>,
    roots: IndexSet<NodeId>,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize)
    }

    /// Append a node and hand back the deferred handle for its result.
    ///
    /// Data dependencies are collected from every `Deferred` nested in the
    /// kind's arguments plus the explicitly listed nodes of composition
    /// kinds, deduplicated in encounter order. Cost is linear in the size of
    /// the argument bundle.
    pub fn push(&mut self, kind: NodeKind, span: Option<SourceSpan>) -> Value {
        let id = NodeId(self.nodes.len() as u64);

        let mut refs = Vec::new();
        for value in kind.embedded_values() {
            value.collect_deferred(&mut refs);
        }
        refs.extend(kind.listed_nodes());

        let mut data_deps: IndexSet<NodeId> = IndexSet::new();
        for dep in refs {
            data_deps.insert(dep);
        }

        let rooted = kind.has_observable_effects();
        self.nodes.push(Node {
            id,
            kind,
            data_deps: data_deps.into_iter().collect(),
            order_deps: Vec::new(),
            span,
        });
        if rooted {
            self.roots.insert(id);
        }

        Value::Deferred(id)
    }

    /// Add an ordering edge: `target` must not start until `predecessor` has
    /// succeeded. Only `after`/`sequence` construction calls this.
    pub fn add_order_edge(
        &mut self,
        target: NodeId,
        predecessor: NodeId,
    ) -> Result<(), PlanError> {
        if target == predecessor {
            return Err(PlanError::SelfEdge { node: target });
        }
        if self.get(predecessor).is_none() {
            return Err(PlanError::UnknownNode { node: predecessor });
        }
        let node = self
            .nodes
            .get_mut(target.0 as usize)
            .ok_or(PlanError::UnknownNode { node: target })?;
        if !node.order_deps.contains(&predecessor) {
            node.order_deps.push(predecessor);
        }
        Ok(())
    }

    /// Mark every node referenced by `value` as a root the executor must
    /// wait for.
    pub fn mark_root(&mut self, value: &Value) {
        let mut refs = Vec::new();
        value.collect_deferred(&mut refs);
        for id in refs {
            self.roots.insert(id);
        }
    }

    /// Validate the graph and seal it. Unknown references and cycles (which
    /// crossed ordering edges can produce) are rejected here rather than at
    /// execution time.
    pub fn freeze(self) -> Result<Plan, PlanError> {
        let len = self.nodes.len() as u64;
        for node in &self.nodes {
            for dep in node.data_deps.iter().chain(node.order_deps.iter()) {
                if dep.0 >= len {
                    return Err(PlanError::UnknownNode { node: *dep });
                }
            }
        }

        let plan = Plan {
            nodes: self.nodes,
            roots: self.roots.into_iter().collect(),
        };
        plan.levels()?;
        Ok(plan)
    }
}

/// Frozen plan: the executor borrows this read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    nodes: Vec<Node>,
    roots: Vec<NodeId>,
}

impl Plan {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize)
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Topological levels over `data_deps ∪ order_deps`; nodes in one level
    /// have no edges between them. Fails if the graph has a cycle.
    pub fn levels(&self) -> Result<Vec<Vec<NodeId>>, PlanError> {
        let mut in_degree = vec![0usize; self.nodes.len()];
        let mut dependents: Vec<Vec<NodeId>> = vec![Vec::new(); self.nodes.len()];

        for node in &self.nodes {
            for dep in node.data_deps.iter().chain(node.order_deps.iter()) {
                in_degree[node.id.0 as usize] += 1;
                dependents[dep.0 as usize].push(node.id);
            }
        }

        let mut levels = Vec::new();
        let mut current: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| in_degree[n.id.0 as usize] == 0)
            .map(|n| n.id)
            .collect();
        let mut seen = 0usize;

        while !current.is_empty() {
            current.sort();
            seen += current.len();
            let mut next = Vec::new();
            for id in &current {
                for dep in &dependents[id.0 as usize] {
                    let degree = &mut in_degree[dep.0 as usize];
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(*dep);
                    }
                }
            }
            levels.push(std::mem::replace(&mut current, next));
        }

        if seen != self.nodes.len() {
            let stuck: Vec<NodeId> = self
                .nodes
                .iter()
                .filter(|n| in_degree[n.id.0 as usize] > 0)
                .map(|n| n.id)
                .collect();
            return Err(PlanError::Cycle { nodes: stuck });
        }
        Ok(levels)
    }

    /// Text listing of the node list, one record per node with its
    /// dependencies as trailing comments. This is what `schema` prints.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(".plan\n\n");

        for node in &self.nodes {
            let mut notes = Vec::new();
            if !node.data_deps.is_empty() {
                let deps: Vec<String> = node.data_deps.iter().map(|d| d.to_string()).collect();
                notes.push(format!("reads {}", deps.join(", ")));
            }
            if !node.order_deps.is_empty() {
                let deps: Vec<String> = node.order_deps.iter().map(|d| d.to_string()).collect();
                notes.push(format!("after {}", deps.join(", ")));
            }
            if self.roots.contains(&node.id) {
                notes.push("root".to_string());
            }
            let comment = if notes.is_empty() {
                String::new()
            } else {
                format!("  ; {}", notes.join(" "))
            };

            out.push_str(&format!("{}: {}{}\n", node.id, node.kind.name(), comment));
            for (key, value) in node.kind.summary_fields() {
                out.push_str(&format!("    {:10} = {}\n", key, value));
            }
            out.push('\n');
        }

        out.push_str(&format!("total_nodes = {}\n", self.nodes.len()));
        out
    }

    /// Graphviz export; data edges are solid, ordering edges dashed.
    pub fn render_dot(&self) -> String {
        let mut out = String::from("digraph plan {\n");
        out.push_str("  rankdir=TB;\n");
        out.push_str("  node [shape=box, style=rounded];\n\n");

        for node in &self.nodes {
            out.push_str(&format!(
                "  n{} [label=\"{} {}\"];\n",
                node.id.0,
                node.id,
                node.kind.name()
            ));
        }
        out.push('\n');
        for node in &self.nodes {
            for dep in &node.data_deps {
                out.push_str(&format!("  n{} -> n{};\n", dep.0, node.id.0));
            }
            for dep in &node.order_deps {
                out.push_str(&format!("  n{} -> n{} [style=dashed];\n", dep.0, node.id.0));
            }
        }
        out.push_str("}\n");
        out
    }
}
