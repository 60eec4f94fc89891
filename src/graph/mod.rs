//! Dependency graph construction
//!
//! Walks backward from the requested values through their producers. Every
//! registration appears at most once as a node, however many paths reach it,
//! so shared dependencies are built and executed once per dispatch.

pub mod execute;

pub use execute::DispatchReport;

use crate::action::Registration;
use crate::error::{KilnError, KilnResult};
use crate::value::Value;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

/// Index of a node inside its [`WorkGraph`]
pub type NodeId = usize;

/// One action in the graph, with the nodes producing its inputs
#[derive(Debug)]
pub struct Node {
    pub registration: Arc<Registration>,
    pub dependencies: Vec<NodeId>,
}

/// Forest of nodes reachable from a set of requested values
#[derive(Debug)]
pub struct WorkGraph {
    nodes: Vec<Node>,
    roots: Vec<NodeId>,
    requested: HashSet<Value>,
}

struct Builder<'a> {
    provided: &'a HashSet<Value>,
    registrations: &'a [Arc<Registration>],
    nodes: Vec<Node>,
    by_registration: HashMap<usize, NodeId>,
    in_progress: HashSet<usize>,
}

impl WorkGraph {
    /// Build the graph for `requested`.
    ///
    /// Fails before anything runs if a needed value has no producer or more
    /// than one, or if producers depend on each other in a cycle.
    pub fn build(
        provided: &HashSet<Value>,
        registrations: &[Arc<Registration>],
        requested: &[Value],
    ) -> KilnResult<Self> {
        let mut builder = Builder {
            provided,
            registrations,
            nodes: Vec::new(),
            by_registration: HashMap::new(),
            in_progress: HashSet::new(),
        };
        let roots = builder.build_nodes(requested)?;

        let graph = Self {
            nodes: builder.nodes,
            roots,
            requested: requested.iter().cloned().collect(),
        };
        debug!("Work graph:\n{}", graph.render_tree());
        Ok(graph)
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// A root produces at least one of the requested values
    pub fn is_root(&self, id: NodeId) -> bool {
        self.nodes[id]
            .registration
            .outputs
            .iter()
            .any(|out| self.requested.contains(out))
    }

    /// Indented tree of action names, one line per visit
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        for &root in &self.roots {
            self.render_node(root, 0, &mut out);
        }
        out
    }

    fn render_node(&self, id: NodeId, depth: usize, out: &mut String) {
        let _ = writeln!(out, "{}{}", "  ".repeat(depth), self.nodes[id].registration.name);
        for &dep in &self.nodes[id].dependencies {
            self.render_node(dep, depth + 1, out);
        }
    }
}

impl Builder<'_> {
    fn build_nodes(&mut self, requested: &[Value]) -> KilnResult<Vec<NodeId>> {
        let mut ids = Vec::new();
        for value in requested {
            if self.provided.contains(value) {
                continue;
            }
            let index = self.producer_of(value)?;
            let id = match self.by_registration.get(&index) {
                Some(&id) => id,
                None => self.build_node(index)?,
            };
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn build_node(&mut self, index: usize) -> KilnResult<NodeId> {
        let registration = self.registrations[index].clone();
        if !self.in_progress.insert(index) {
            return Err(KilnError::DependencyCycle(registration.name.clone()));
        }
        let dependencies = self.build_nodes(&registration.inputs)?;
        self.in_progress.remove(&index);

        let id = self.nodes.len();
        self.nodes.push(Node {
            registration,
            dependencies,
        });
        self.by_registration.insert(index, id);
        Ok(id)
    }

    fn producer_of(&self, value: &Value) -> KilnResult<usize> {
        let producers: Vec<usize> = self
            .registrations
            .iter()
            .enumerate()
            .filter(|(_, reg)| reg.produces(value))
            .map(|(i, _)| i)
            .collect();

        match producers.as_slice() {
            [] => Err(KilnError::NoProducer(value.to_string())),
            [single] => Ok(*single),
            many => Err(KilnError::MultipleProducers {
                value: value.to_string(),
                producers: many
                    .iter()
                    .map(|&i| self.registrations[i].name.clone())
                    .collect(),
            }),
        }
    }
}
