//! Node Registry and Connection Table
//!
//! The [`Graph`] owns every live node, the directed edges between them, and a
//! render plan compiled from the two. Nodes are stored in a slotmap and looked
//! up by their string [`NodeId`]; edges are kept as a flat list of logical
//! pairs so duplicates survive exactly as they were connected.
//!
//! The render plan is throwaway state. Any topology change invalidates it and
//! the next rendered frame recompiles it:
//!
//! - routes are the distinct audio-carrying source -> target pairs
//! - the execution order is a topological sort of those routes
//! - cycles are broken at the oldest node still unplaced, and every route that
//!   points backwards in the order reads its source's previous sample
//! - the Output node is only chosen to break a cycle when nothing else can be

use crate::error::EngineError;
use crate::node::{NodeId, NodeKind, NodeParams, NodeSnapshot, ParamChange, ParamPatch};
use crate::unit::Unit;
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SecondaryMap, SlotMap};
use std::collections::{HashMap, HashSet, VecDeque};

/// Peak level the sequencer fires its targets' envelopes at
pub const SEQUENCER_TRIGGER_LEVEL: f64 = 0.5;

new_key_type! {
    struct NodeKey;
}

/// A directed routing connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
}

impl Edge {
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

#[derive(Debug)]
struct Node {
    id: NodeId,
    seq: u64,
    params: NodeParams,
    unit: Unit,
}

#[derive(Debug, Default)]
struct RenderPlan {
    steps: Vec<RenderStep>,
}

#[derive(Debug)]
struct RenderStep {
    node: NodeKey,
    inputs: Vec<NodeKey>,
}

/// The live signal graph
#[derive(Debug)]
pub struct Graph {
    nodes: SlotMap<NodeKey, Node>,
    index: HashMap<NodeId, NodeKey>,
    edges: Vec<Edge>,
    output: NodeKey,
    next_seq: u64,

    // Render state
    plan: Option<RenderPlan>,
    outputs: SecondaryMap<NodeKey, f64>,
    sample_rate: f64,
}

impl Graph {
    /// Create a graph holding only the Output node
    pub fn new(sample_rate: f64) -> Self {
        let mut nodes = SlotMap::with_key();
        let params = NodeParams::Output;
        let output = nodes.insert(Node {
            id: NodeId::output(),
            seq: 0,
            unit: Unit::instantiate(&params, sample_rate),
            params,
        });

        let mut index = HashMap::new();
        index.insert(NodeId::output(), output);

        Self {
            nodes,
            index,
            edges: Vec::new(),
            output,
            next_seq: 1,
            plan: None,
            outputs: SecondaryMap::new(),
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        if sample_rate == self.sample_rate {
            return;
        }
        self.sample_rate = sample_rate;
        for node in self.nodes.values_mut() {
            node.unit.set_sample_rate(sample_rate);
        }
    }

    /// Create a node of `kind`, merging `initial` over the kind's defaults
    ///
    /// The unit starts running immediately, connected or not.
    pub fn create_node(
        &mut self,
        kind: NodeKind,
        initial: &ParamPatch,
    ) -> Result<NodeId, EngineError> {
        if kind == NodeKind::Output {
            return Err(EngineError::invalid_parameter(
                "kind",
                "the output node is created with the engine",
            ));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let id = NodeId::new(format!("{}-{}", kind, seq));

        let mut params = NodeParams::defaults(kind);
        params.merge(initial);
        let unit = Unit::instantiate(&params, self.sample_rate);

        let key = self.nodes.insert(Node {
            id: id.clone(),
            seq,
            params,
            unit,
        });
        self.index.insert(id.clone(), key);
        self.invalidate();

        tracing::debug!(node = %id, %kind, "node created");
        Ok(id)
    }

    /// Merge a partial update and forward each changed field to the unit
    ///
    /// Continuous changes start ramping at audio time `now`.
    pub fn update_params(
        &mut self,
        id: &NodeId,
        patch: &ParamPatch,
        now: f64,
    ) -> Result<Vec<ParamChange>, EngineError> {
        let key = self.key(id)?;
        let node = &mut self.nodes[key];
        let changes = node.params.merge(patch);
        for change in &changes {
            node.unit.apply_param(change, now);
        }
        tracing::debug!(node = %id, changes = changes.len(), "params updated");
        Ok(changes)
    }

    /// Flip one step of a sequencer's pattern, returning its new state
    pub fn toggle_step(&mut self, id: &NodeId, step: usize) -> Result<bool, EngineError> {
        let key = self.key(id)?;
        let pattern = self.nodes[key].params.pattern_mut().ok_or_else(|| {
            EngineError::invalid_parameter("step", format!("node {id} is not a sequencer"))
        })?;
        pattern.toggle(step)
    }

    /// Dispose a node and erase every edge touching it
    pub fn remove_node(&mut self, id: &NodeId) -> Result<(), EngineError> {
        if id.is_output() {
            return Err(EngineError::ProtectedNode(id.clone()));
        }
        let key = self.key(id)?;

        if let Some(mut node) = self.nodes.remove(key) {
            node.unit.dispose();
        }
        self.index.remove(id);
        self.outputs.remove(key);

        let before = self.edges.len();
        self.edges
            .retain(|edge| &edge.source != id && &edge.target != id);
        self.invalidate();

        tracing::debug!(node = %id, edges = before - self.edges.len(), "node removed");
        Ok(())
    }

    /// Add an edge. Self-loops and cycles are allowed.
    pub fn connect(&mut self, source: &NodeId, target: &NodeId) -> Result<(), EngineError> {
        self.key(source)?;
        self.key(target)?;

        self.edges.push(Edge::new(source, target));
        self.invalidate();

        tracing::debug!(%source, %target, "connected");
        Ok(())
    }

    /// Remove the most recently added matching edge
    ///
    /// Returns false, changing nothing, when no edge matches. The route stays
    /// in place while a duplicate of the pair remains.
    pub fn disconnect(&mut self, source: &NodeId, target: &NodeId) -> Result<bool, EngineError> {
        self.key(source)?;
        self.key(target)?;

        let Some(pos) = self
            .edges
            .iter()
            .rposition(|edge| &edge.source == source && &edge.target == target)
        else {
            return Ok(false);
        };

        self.edges.remove(pos);
        self.invalidate();

        tracing::debug!(%source, %target, "disconnected");
        Ok(true)
    }

    /// Targets of every edge leaving `source`, in connection order
    pub fn edges_from(&self, source: &NodeId) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|edge| &edge.source == source)
            .map(|edge| edge.target.clone())
            .collect()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn params(&self, id: &NodeId) -> Option<&NodeParams> {
        self.index.get(id).map(|&key| &self.nodes[key].params)
    }

    /// The processing unit behind a node
    pub fn unit(&self, id: &NodeId) -> Option<&Unit> {
        self.index.get(id).map(|&key| &self.nodes[key].unit)
    }

    pub fn node(&self, id: &NodeId) -> Option<NodeSnapshot> {
        self.index.get(id).map(|&key| snapshot(&self.nodes[key]))
    }

    /// All nodes in creation order, Output first
    pub fn nodes(&self) -> Vec<NodeSnapshot> {
        self.by_creation()
            .into_iter()
            .map(|key| snapshot(&self.nodes[key]))
            .collect()
    }

    /// Fire the envelope of a Gain node at audio time `now`
    ///
    /// Returns false, doing nothing, if the node has no gain stage.
    pub fn trigger(&mut self, id: &NodeId, peak: f64, now: f64) -> Result<bool, EngineError> {
        let key = self.key(id)?;
        let fired = self.nodes[key].unit.trigger(peak, now);
        if !fired {
            tracing::debug!(node = %id, "trigger ignored by non-gain node");
        }
        Ok(fired)
    }

    /// Run the sequencer driver for one tick
    ///
    /// Every sequencer whose pattern has `step` set fires the envelopes of its
    /// downstream Gain nodes, and every sequencer's display position moves to
    /// `step`. Happens in one `&mut self` call so the caller's lock gives the
    /// tick a consistent view of patterns and edges. Returns the triggered nodes.
    pub fn dispatch_step(&mut self, step: usize, now: f64) -> Vec<NodeId> {
        let mut targets = Vec::new();
        for key in self.by_creation() {
            let node = &mut self.nodes[key];
            let Some(pattern) = node.params.pattern_mut() else {
                continue;
            };
            pattern.set_current_step(step);
            if !pattern.is_active(step) {
                continue;
            }
            let source = node.id.clone();
            targets.extend(self.edges_from(&source));
        }

        let mut triggered = Vec::new();
        for target in targets {
            let Some(&key) = self.index.get(&target) else {
                continue;
            };
            if self.nodes[key].unit.trigger(SEQUENCER_TRIGGER_LEVEL, now) {
                triggered.push(target);
            }
        }
        triggered
    }

    /// Mirror the transport's tempo and play state into every sequencer
    pub fn sync_sequencers(&mut self, bpm: f64, playing: bool) {
        for node in self.nodes.values_mut() {
            if let NodeParams::Sequencer(params) = &mut node.params {
                params.bpm = bpm;
                params.is_playing = playing;
            }
        }
    }

    /// Node ids in render order
    pub fn execution_order(&mut self) -> Vec<NodeId> {
        let plan = self.plan.take().unwrap_or_else(|| self.compile());
        let order = plan
            .steps
            .iter()
            .map(|step| self.nodes[step.node].id.clone())
            .collect();
        self.plan = Some(plan);
        order
    }

    /// Compute one sample of the Output node at audio time `time`
    pub fn render_frame(&mut self, time: f64) -> f64 {
        let plan = self.plan.take().unwrap_or_else(|| self.compile());
        let sample = self.process_frame(&plan, time);
        self.plan = Some(plan);
        sample
    }

    /// Render interleaved frames starting at audio time `start_time`
    ///
    /// The Output node's signal is written to every channel.
    pub fn render(&mut self, out: &mut [f32], channels: usize, start_time: f64) {
        let channels = channels.max(1);
        let dt = 1.0 / self.sample_rate;
        let plan = self.plan.take().unwrap_or_else(|| self.compile());

        let mut frames = 0;
        for frame in out.chunks_mut(channels) {
            let sample = self.process_frame(&plan, start_time + frames as f64 * dt);
            frame.fill(sample as f32);
            frames += 1;
        }

        self.plan = Some(plan);
        self.prune(start_time + frames as f64 * dt);
    }

    /// Fold automation that ended before `time`
    pub fn prune(&mut self, time: f64) {
        for node in self.nodes.values_mut() {
            node.unit.prune(time);
        }
    }

    fn process_frame(&mut self, plan: &RenderPlan, time: f64) -> f64 {
        let sample_rate = self.sample_rate;
        for step in &plan.steps {
            let input: f64 = step
                .inputs
                .iter()
                .map(|&source| self.outputs.get(source).copied().unwrap_or(0.0))
                .sum();
            let Some(node) = self.nodes.get_mut(step.node) else {
                continue;
            };
            let value = node.unit.process(input, time, sample_rate);
            self.outputs.insert(step.node, value);
        }
        self.outputs.get(self.output).copied().unwrap_or(0.0)
    }

    fn key(&self, id: &NodeId) -> Result<NodeKey, EngineError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| EngineError::UnknownNode(id.clone()))
    }

    fn by_creation(&self) -> Vec<NodeKey> {
        let mut keys: Vec<NodeKey> = self.nodes.keys().collect();
        keys.sort_by_key(|&key| self.nodes[key].seq);
        keys
    }

    fn invalidate(&mut self) {
        self.plan = None;
    }

    fn compile(&self) -> RenderPlan {
        let mut routes: Vec<(NodeKey, NodeKey)> = Vec::new();
        for edge in &self.edges {
            let (Some(&source), Some(&target)) =
                (self.index.get(&edge.source), self.index.get(&edge.target))
            else {
                continue;
            };
            if self.nodes[source].unit.carries_audio() && !routes.contains(&(source, target)) {
                routes.push((source, target));
            }
        }

        let steps = self
            .topological_sort(&routes)
            .into_iter()
            .map(|node| RenderStep {
                node,
                inputs: routes
                    .iter()
                    .filter(|&&(_, target)| target == node)
                    .map(|&(source, _)| source)
                    .collect(),
            })
            .collect();

        RenderPlan { steps }
    }

    fn topological_sort(&self, routes: &[(NodeKey, NodeKey)]) -> Vec<NodeKey> {
        let by_creation = self.by_creation();
        let mut in_degree: HashMap<NodeKey, usize> =
            by_creation.iter().map(|&key| (key, 0)).collect();
        let mut successors: HashMap<NodeKey, Vec<NodeKey>> = HashMap::new();

        for &(source, target) in routes {
            *in_degree.entry(target).or_insert(0) += 1;
            successors.entry(source).or_default().push(target);
        }

        // Kahn's algorithm, seeded in creation order
        let mut queue: VecDeque<NodeKey> = by_creation
            .iter()
            .copied()
            .filter(|key| in_degree.get(key) == Some(&0))
            .collect();
        let mut placed: HashSet<NodeKey> = HashSet::with_capacity(by_creation.len());
        let mut order = Vec::with_capacity(by_creation.len());

        while order.len() < by_creation.len() {
            let node = match queue.pop_front() {
                Some(node) => node,
                // Only cycles remain: break at the oldest unplaced node
                None => match by_creation
                    .iter()
                    .find(|&&key| key != self.output && !placed.contains(&key))
                    .or_else(|| by_creation.iter().find(|&&key| !placed.contains(&key)))
                {
                    Some(&key) => key,
                    None => break,
                },
            };
            if !placed.insert(node) {
                continue;
            }
            order.push(node);

            for succ in successors.get(&node).into_iter().flatten() {
                if let Some(deg) = in_degree.get_mut(succ) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 && !placed.contains(succ) {
                        queue.push_back(*succ);
                    }
                }
            }
        }

        order
    }
}

fn snapshot(node: &Node) -> NodeSnapshot {
    NodeSnapshot {
        id: node.id.clone(),
        kind: node.params.kind(),
        params: node.params,
    }
}
