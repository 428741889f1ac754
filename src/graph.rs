//! Compiled multi-output evaluation plans.
//!
//! A [`Program`] lowers a set of named expressions into one arena of [`Node`]s
//! addressed by [`NodeId`]. Structurally equal subexpressions, including ones coming
//! from different outputs, are merged into a single node, and nodes are grouped into
//! layers by depth so that one bottom-up sweep evaluates every output.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use log::{debug, trace};

use crate::error::{Result, SymfieldError};
use crate::expr::{Expr, NodeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn new(id: usize) -> Self {
        NodeId(id)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub inputs: Vec<NodeId>,
    /// Longest path to a leaf; leaves are depth 1.
    pub depth: usize,
    value: Cell<f64>,
}

impl Node {
    /// Value written by the most recent evaluation sweep.
    pub fn cached_value(&self) -> f64 {
        self.value.get()
    }
}

/// Compilation switches for [`Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    /// Simplify each output before lowering.
    pub optimize: bool,
    /// Merge structurally equal nodes across all outputs.
    pub deduplicate: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            optimize: true,
            deduplicate: true,
        }
    }
}

impl CompileOptions {
    /// Lower the expressions exactly as written.
    pub fn raw() -> Self {
        CompileOptions {
            optimize: false,
            deduplicate: false,
        }
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_deduplicate(mut self, deduplicate: bool) -> Self {
        self.deduplicate = deduplicate;
        self
    }
}

/// A compiled, depth-layered evaluation plan over named outputs.
///
/// Structure is fixed at construction; evaluation only writes each node's value
/// slot. Those slots are shared by every call, so a `Program` is not
/// `Sync`: concurrent callers need their own copy (it is `Clone`) or a lock.
#[derive(Debug, Clone)]
pub struct Program {
    options: CompileOptions,
    expressions: BTreeMap<String, Expr>,
    nodes: Vec<Node>,
    outputs: BTreeMap<String, NodeId>,
    free_variables: BTreeMap<String, NodeId>,
    layers: Vec<Vec<NodeId>>,
}

impl Program {
    pub fn new<I, S>(outputs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Expr)>,
        S: Into<String>,
    {
        Program::with_options(outputs, CompileOptions::default())
    }

    pub fn with_options<I, S>(outputs: I, options: CompileOptions) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Expr)>,
        S: Into<String>,
    {
        let expressions: BTreeMap<String, Expr> = outputs
            .into_iter()
            .map(|(name, expr)| {
                let expr = if options.optimize { expr.optimized() } else { expr };
                (name.into(), expr)
            })
            .collect();

        for (name, expr) in &expressions {
            check_zero_operands(name, expr)?;
        }

        let mut lowering = Lowering::default();
        let roots: BTreeMap<String, NodeId> = expressions
            .iter()
            .map(|(name, expr)| (name.clone(), lowering.lower(expr)))
            .collect();
        let lowered = lowering.nodes;
        let lowered_count = lowered.len();

        let (canonical, roots) = if options.deduplicate {
            deduplicate(&lowered, &roots)
        } else {
            ((0..lowered.len()).map(NodeId).collect(), roots)
        };

        let (nodes, outputs) = schedule(&lowered, &canonical, &roots);
        let layers = group_layers(&nodes);
        let free_variables = nodes
            .iter()
            .filter_map(|n| match &n.kind {
                NodeKind::Variable(name) => Some((name.clone(), n.id)),
                _ => None,
            })
            .collect();

        debug!(
            "compiled {} output(s): {} node(s) lowered, {} after merging, {} layer(s)",
            outputs.len(),
            lowered_count,
            nodes.len(),
            layers.len()
        );

        Ok(Program {
            options,
            expressions,
            nodes,
            outputs,
            free_variables,
            layers,
        })
    }

    pub fn options(&self) -> CompileOptions {
        self.options
    }

    /// Output expressions as compiled (simplified when optimization is on).
    pub fn expressions(&self) -> &BTreeMap<String, Expr> {
        &self.expressions
    }

    pub fn expression(&self, output: &str) -> Option<&Expr> {
        self.expressions.get(output)
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }

    pub fn root(&self, output: &str) -> Option<NodeId> {
        self.outputs.get(output).copied()
    }

    pub fn free_variables(&self) -> &BTreeMap<String, NodeId> {
        &self.free_variables
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    /// Layer `k` holds every node of depth `k + 1`.
    pub fn layers(&self) -> &[Vec<NodeId>] {
        &self.layers
    }

    /// Evaluates every output.
    ///
    /// Each binding sets the variable of that name; names the program does not use
    /// are ignored. Fails when a free variable is left unbound, there is no default.
    pub fn call<I, K>(&self, bindings: I) -> Result<BTreeMap<String, f64>>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        let mut bound = BTreeSet::new();
        for (name, value) in bindings {
            let name = name.as_ref();
            match self.free_variables.get(name) {
                Some(id) => {
                    self.nodes[id.index()].value.set(value);
                    bound.insert(*id);
                }
                None => trace!("ignoring binding for unused variable '{}'", name),
            }
        }
        if let Some((name, _)) = self.free_variables.iter().find(|(_, id)| !bound.contains(*id)) {
            return Err(SymfieldError::unbound(name.as_str()));
        }

        self.run();
        Ok(self
            .outputs
            .iter()
            .map(|(name, id)| (name.clone(), self.nodes[id.index()].value.get()))
            .collect())
    }

    fn run(&self) {
        let mut args = Vec::new();
        for layer in &self.layers {
            for id in layer {
                let node = &self.nodes[id.index()];
                args.clear();
                args.extend(node.inputs.iter().map(|i| self.nodes[i.index()].value.get()));
                if let Some(value) = node.kind.apply(&args) {
                    node.value.set(value);
                }
            }
        }
        trace!("evaluated {} node(s) in {} layer(s)", self.nodes.len(), self.layers.len());
    }
}

/// Rejects operators applied to a literal zero where a non-zero operand is required.
fn check_zero_operands(output: &str, expr: &Expr) -> Result<()> {
    let mut stack = vec![expr.clone()];
    let mut seen = HashSet::new();
    while let Some(e) = stack.pop() {
        if !seen.insert(e.addr()) {
            continue;
        }
        // an empty sum is the eliminated zero
        let zero_operand = e.operands().first().map_or(false, |o| {
            o.is_constant(0.0) || (*o.kind() == NodeKind::Add && o.operands().is_empty())
        });
        match e.kind() {
            NodeKind::Reciprocal if zero_operand => {
                return Err(SymfieldError::malformed(format!(
                    "output '{}' takes the reciprocal of zero",
                    output
                )));
            }
            NodeKind::Power(n) if *n < 0 && zero_operand => {
                return Err(SymfieldError::malformed(format!(
                    "output '{}' raises zero to the negative power {}",
                    output, n
                )));
            }
            _ => {}
        }
        stack.extend(e.operands().iter().cloned());
    }
    Ok(())
}

/// A lowered node before scheduling: kind plus operand slots.
#[derive(Debug, Clone)]
struct RawNode {
    kind: NodeKind,
    inputs: Vec<NodeId>,
}

/// Turns expression trees into arena nodes, keeping handles that are already
/// shared as a single node. A variable name always maps to one node.
#[derive(Default)]
struct Lowering {
    nodes: Vec<RawNode>,
    memo: HashMap<*const (), NodeId>,
    variables: HashMap<String, NodeId>,
}

impl Lowering {
    fn lower(&mut self, expr: &Expr) -> NodeId {
        if let Some(&id) = self.memo.get(&expr.addr()) {
            return id;
        }
        if let Some(name) = expr.variable_name() {
            if let Some(&id) = self.variables.get(name) {
                self.memo.insert(expr.addr(), id);
                return id;
            }
        }
        let inputs = expr.operands().iter().map(|o| self.lower(o)).collect();
        let id = NodeId(self.nodes.len());
        self.nodes.push(RawNode {
            kind: expr.kind().clone(),
            inputs,
        });
        self.memo.insert(expr.addr(), id);
        if let Some(name) = expr.variable_name() {
            self.variables.insert(name.to_string(), id);
        }
        id
    }
}

/// Hashable stand-in for structural identity once operands are canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum NodeKey {
    Variable(String),
    Constant(u64),
    Add(Vec<NodeId>),
    Multiply(Vec<NodeId>),
    Negate(NodeId),
    Reciprocal(NodeId),
    Sigmoid(NodeId),
    Power(i32, NodeId),
}

fn node_key(kind: &NodeKind, inputs: &[NodeId]) -> NodeKey {
    let only = inputs.first().copied().unwrap_or(NodeId(usize::MAX));
    match kind {
        NodeKind::Variable(name) => NodeKey::Variable(name.clone()),
        // -0.0 and 0.0 are the same constant
        NodeKind::Constant(v) => NodeKey::Constant(if *v == 0.0 { 0 } else { v.to_bits() }),
        NodeKind::Add => NodeKey::Add(inputs.to_vec()),
        NodeKind::Multiply => NodeKey::Multiply(inputs.to_vec()),
        NodeKind::Negate => NodeKey::Negate(only),
        NodeKind::Reciprocal => NodeKey::Reciprocal(only),
        NodeKind::Sigmoid => NodeKey::Sigmoid(only),
        NodeKind::Power(n) => NodeKey::Power(*n, only),
    }
}

/// Computes the depth of every node reachable from `roots`.
///
/// Panics on a cycle: graphs built by composing expressions cannot have one.
fn depths(nodes: &[RawNode], canonical: &[NodeId], roots: impl Iterator<Item = NodeId>) -> Vec<Option<usize>> {
    fn visit(id: NodeId, nodes: &[RawNode], canonical: &[NodeId], depth: &mut [Option<usize>], active: &mut [bool]) -> usize {
        if let Some(d) = depth[id.0] {
            return d;
        }
        if active[id.0] {
            panic!("expression graph contains a cycle through node {}", id);
        }
        active[id.0] = true;
        let d = 1 + nodes[id.0]
            .inputs
            .iter()
            .map(|i| visit(canonical[i.0], nodes, canonical, depth, active))
            .max()
            .unwrap_or(0);
        active[id.0] = false;
        depth[id.0] = Some(d);
        d
    }

    let mut depth = vec![None; nodes.len()];
    let mut active = vec![false; nodes.len()];
    for root in roots {
        visit(canonical[root.0], nodes, canonical, &mut depth, &mut active);
    }
    depth
}

/// Walks the lowered nodes layer by layer from the leaves up and maps every node to
/// the first structurally equal node seen. Returns the mapping and remapped roots.
fn deduplicate(nodes: &[RawNode], roots: &BTreeMap<String, NodeId>) -> (Vec<NodeId>, BTreeMap<String, NodeId>) {
    let identity: Vec<NodeId> = (0..nodes.len()).map(NodeId).collect();
    let depth = depths(nodes, &identity, roots.values().copied());

    let mut order: Vec<NodeId> = identity.iter().copied().filter(|id| depth[id.0].is_some()).collect();
    order.sort_by_key(|id| (depth[id.0], id.0));

    let mut canonical = identity;
    let mut seen: HashMap<NodeKey, NodeId> = HashMap::new();
    for id in order {
        // operands sit in shallower layers, so they are already canonical
        let inputs: Vec<NodeId> = nodes[id.0].inputs.iter().map(|i| canonical[i.0]).collect();
        let key = node_key(&nodes[id.0].kind, &inputs);
        canonical[id.0] = *seen.entry(key).or_insert(id);
    }

    let roots = roots.iter().map(|(name, id)| (name.clone(), canonical[id.0])).collect();
    (canonical, roots)
}

/// Builds the final arena: only nodes reachable from the roots, operand slots
/// rewritten to canonical nodes, depths recomputed and ids assigned in layer order.
fn schedule(
    lowered: &[RawNode],
    canonical: &[NodeId],
    roots: &BTreeMap<String, NodeId>,
) -> (Vec<Node>, BTreeMap<String, NodeId>) {
    let depth = depths(lowered, canonical, roots.values().copied());

    let mut order: Vec<NodeId> = (0..lowered.len())
        .map(NodeId)
        .filter(|id| canonical[id.0] == *id && depth[id.0].is_some())
        .collect();
    order.sort_by_key(|id| (depth[id.0], id.0));

    let mut renumber = vec![None; lowered.len()];
    for (new, old) in order.iter().enumerate() {
        renumber[old.0] = Some(NodeId(new));
    }
    let translate = |old: NodeId| -> NodeId {
        match renumber[canonical[old.0].0] {
            Some(id) => id,
            None => unreachable!("node {} is reachable but was not scheduled", old),
        }
    };

    let nodes = order
        .iter()
        .map(|old| {
            let raw = &lowered[old.0];
            let id = translate(*old);
            let value = match raw.kind {
                NodeKind::Constant(v) => v,
                _ => 0.0,
            };
            Node {
                id,
                kind: raw.kind.clone(),
                inputs: raw.inputs.iter().map(|i| translate(*i)).collect(),
                depth: depth[old.0].unwrap_or(1),
                value: Cell::new(value),
            }
        })
        .collect();
    let outputs = roots.iter().map(|(name, id)| (name.clone(), translate(*id))).collect();
    (nodes, outputs)
}

fn group_layers(nodes: &[Node]) -> Vec<Vec<NodeId>> {
    let height = nodes.iter().map(|n| n.depth).max().unwrap_or(0);
    let mut layers = vec![Vec::new(); height];
    for node in nodes {
        layers[node.depth - 1].push(node.id);
    }
    layers
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, layer) in self.layers.iter().enumerate() {
            write!(f, "layer {}:", k + 1)?;
            for (i, id) in layer.iter().enumerate() {
                let node = &self.nodes[id.index()];
                write!(f, "{} {} = ", if i == 0 { "" } else { "," }, id)?;
                match &node.kind {
                    NodeKind::Variable(name) => write!(f, "{}", name)?,
                    NodeKind::Constant(v) => write!(f, "{}", v)?,
                    kind => {
                        let op = match kind {
                            NodeKind::Add => "add".to_string(),
                            NodeKind::Multiply => "mul".to_string(),
                            NodeKind::Negate => "neg".to_string(),
                            NodeKind::Reciprocal => "recip".to_string(),
                            NodeKind::Sigmoid => "sigmoid".to_string(),
                            NodeKind::Power(n) => format!("pow{}", n),
                            NodeKind::Variable(_) | NodeKind::Constant(_) => String::new(),
                        };
                        let args: Vec<String> = node.inputs.iter().map(|i| i.to_string()).collect();
                        write!(f, "{}({})", op, args.join(", "))?;
                    }
                }
            }
            writeln!(f)?;
        }
        for (name, id) in &self.outputs {
            writeln!(f, "{} <- {}", name, id)?;
        }
        Ok(())
    }
}
