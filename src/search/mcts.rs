// src/search/mcts.rs - Monte-Carlo tree search over closure sequences
//
// Nodes live in an arena and refer to each other by index. A node's legal
// actions are fetched from the oracle the first time it is expanded. The
// reward of a rollout is the improvement of its terminal configuration over
// the baseline objective.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use super::space::Configuration;
use super::{rng_from_seed, SearchContext, SearchOutcome, SearchStrategy};
use crate::evaluator::FitnessTransform;
use crate::infra::config::{MctsConfig, SearchBudget};
use crate::infra::errors::SearchError;
use crate::oracle::Session;

pub type NodeId = usize;

#[derive(Debug, Clone)]
pub struct Node {
    configuration: Configuration,
    parent: Option<NodeId>,
    action: Option<usize>,
    children: Vec<NodeId>,
    /// `None` until the legal actions have been queried.
    untried: Option<Vec<usize>>,
    depth: usize,
    visits: u32,
    total_reward: f64,
    terminal: bool,
}

impl Node {
    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Segment closed to reach this node from its parent.
    pub fn action(&self) -> Option<usize> {
        self.action
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn visits(&self) -> u32 {
        self.visits
    }

    pub fn total_reward(&self) -> f64 {
        self.total_reward
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn is_fully_expanded(&self) -> bool {
        matches!(self.untried, Some(ref actions) if actions.is_empty())
    }
}

/// Upper confidence bound of a child; unvisited children come first.
pub fn uct(total_reward: f64, visits: u32, parent_visits: u32, exploration: f64) -> f64 {
    if visits == 0 {
        return f64::INFINITY;
    }
    let n = f64::from(visits);
    total_reward / n + exploration * (f64::from(parent_visits.max(1)).ln() / n).sqrt()
}

#[derive(Debug, Clone)]
pub struct SearchTree {
    nodes: Vec<Node>,
    max_closures: usize,
}

impl SearchTree {
    pub fn new(root: Configuration, max_closures: usize) -> Self {
        Self {
            nodes: vec![Node {
                configuration: root,
                parent: None,
                action: None,
                children: Vec::new(),
                untried: None,
                depth: 0,
                visits: 0,
                total_reward: 0.0,
                terminal: max_closures == 0,
            }],
            max_closures,
        }
    }

    pub fn root(&self) -> NodeId {
        0
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

    pub fn child_for(&self, parent: NodeId, action: usize) -> Option<NodeId> {
        self.nodes[parent]
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes[c].action == Some(action))
    }

    /// Record the legal actions of a node; none means a dead end.
    pub fn set_untried(&mut self, id: NodeId, actions: Vec<usize>) {
        let node = &mut self.nodes[id];
        if actions.is_empty() {
            node.terminal = true;
        }
        node.untried = Some(actions);
    }

    /// Materialize one untried action of `parent` as a new child.
    pub fn add_child<R: Rng>(&mut self, parent: NodeId, rng: &mut R) -> Result<NodeId, SearchError> {
        let closed = self.nodes[parent].configuration.len();
        let untried = self.nodes[parent].untried.as_mut().ok_or_else(|| {
            SearchError::Invariant(format!("node {parent} expanded before its actions were queried"))
        })?;
        if untried.is_empty() {
            return Err(SearchError::NoLegalActions { closed });
        }
        let action = untried.swap_remove(rng.gen_range(0..untried.len()));

        let depth = self.nodes[parent].depth + 1;
        let child = Node {
            configuration: self.nodes[parent].configuration.with(action),
            parent: Some(parent),
            action: Some(action),
            children: Vec::new(),
            untried: None,
            depth,
            visits: 0,
            total_reward: 0.0,
            terminal: depth >= self.max_closures,
        };
        let id = self.nodes.len();
        self.nodes.push(child);
        self.nodes[parent].children.push(id);
        Ok(id)
    }

    /// Child with the highest UCT score; ties go to the earliest child.
    pub fn select_child(&self, id: NodeId, exploration: f64) -> Option<NodeId> {
        let parent_visits = self.nodes[id].visits;
        let mut best: Option<(NodeId, f64)> = None;
        for &c in &self.nodes[id].children {
            let node = &self.nodes[c];
            let score = uct(node.total_reward, node.visits, parent_visits, exploration);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((c, score));
            }
        }
        best.map(|(c, _)| c)
    }

    /// Add `reward` to every node from `id` up to the root.
    pub fn backpropagate(&mut self, id: NodeId, reward: f64) {
        let mut cursor = Some(id);
        while let Some(n) = cursor {
            let node = &mut self.nodes[n];
            node.visits += 1;
            node.total_reward += reward;
            cursor = node.parent;
        }
    }

    /// Most visited child of `id`, ties broken uniformly at random.
    pub fn robust_child<R: Rng>(&self, id: NodeId, rng: &mut R) -> Option<NodeId> {
        let children = &self.nodes[id].children;
        let most = children.iter().map(|&c| self.nodes[c].visits).max()?;
        let tied: Vec<NodeId> = children
            .iter()
            .copied()
            .filter(|&c| self.nodes[c].visits == most)
            .collect();
        tied.choose(rng).copied()
    }
}

/// Monte-Carlo tree search with UCT selection and random rollouts.
pub struct MctsSearch {
    exploration: f64,
    budget: SearchBudget,
    max_closures: usize,
    rng: StdRng,
    tree: Option<SearchTree>,
    best_rollout: Option<(Configuration, f64)>,
}

impl MctsSearch {
    pub fn new(config: &MctsConfig, seed: Option<u64>) -> Self {
        Self {
            exploration: config.exploration,
            budget: config.budget,
            max_closures: config.max_closures,
            rng: rng_from_seed(seed),
            tree: None,
            best_rollout: None,
        }
    }

    /// The tree of the last completed search.
    pub fn tree(&self) -> Option<&SearchTree> {
        self.tree.as_ref()
    }

    /// Lowest-objective terminal configuration seen during rollouts.
    pub fn best_rollout(&self) -> Option<&(Configuration, f64)> {
        self.best_rollout.as_ref()
    }

    fn within_budget(&self, iterations: u32, started: Instant) -> bool {
        match self.budget {
            SearchBudget::Iterations(n) => iterations < n,
            SearchBudget::TimeLimitSecs(secs) => started.elapsed() < Duration::from_secs(secs),
        }
    }

    fn select(&self, tree: &SearchTree) -> NodeId {
        let mut id = tree.root();
        loop {
            let node = tree.node(id);
            if node.is_terminal() || !node.is_fully_expanded() {
                return id;
            }
            match tree.select_child(id, self.exploration) {
                Some(child) => id = child,
                None => return id,
            }
        }
    }

    async fn expand(
        &mut self,
        ctx: &SearchContext<'_>,
        session: &Session,
        tree: &mut SearchTree,
        id: NodeId,
    ) -> Result<NodeId, SearchError> {
        if tree.node(id).is_terminal() {
            return Ok(id);
        }
        if tree.node(id).untried.is_none() {
            let actions = ctx
                .evaluator
                .adjacent(session, tree.node(id).configuration(), ctx.space)
                .await?;
            tree.set_untried(id, actions);
            if tree.node(id).is_terminal() {
                return Ok(id);
            }
        }
        tree.add_child(id, &mut self.rng)
    }

    /// Close random adjacent segments until the closure budget or a dead end.
    async fn rollout(
        &mut self,
        ctx: &SearchContext<'_>,
        session: &Session,
        tree: &SearchTree,
        id: NodeId,
    ) -> Result<Configuration, SearchError> {
        let node = tree.node(id);
        let mut config = node.configuration().clone();
        if node.untried.as_ref().is_some_and(|a| a.is_empty()) && node.children.is_empty() {
            return Ok(config);
        }

        let mut depth = node.depth;
        while depth < self.max_closures {
            let actions = ctx.evaluator.adjacent(session, &config, ctx.space).await?;
            let Some(&action) = actions.choose(&mut self.rng) else {
                break;
            };
            config = config.with(action);
            depth += 1;
        }
        Ok(config)
    }
}

#[async_trait]
impl SearchStrategy for MctsSearch {
    fn name(&self) -> &'static str {
        "mcts"
    }

    async fn search(&mut self, ctx: &SearchContext<'_>) -> Result<SearchOutcome, SearchError> {
        let session = ctx.primary()?;
        let evaluations_before = ctx.evaluator.evaluations();

        let root = ctx.space.root();
        let baseline = ctx
            .evaluator
            .evaluate(session, &root, FitnessTransform::Reciprocal)
            .await?
            .objective;
        let transform = FitnessTransform::Improvement { baseline };
        tracing::info!(baseline, "MCTS baseline objective");

        let mut tree = SearchTree::new(root.clone(), self.max_closures);
        self.best_rollout = None;
        let started = Instant::now();
        let mut iterations = 0u32;

        while self.within_budget(iterations, started) {
            let leaf = self.select(&tree);
            let node = self.expand(ctx, session, &mut tree, leaf).await?;
            let terminal = self.rollout(ctx, session, &tree, node).await?;
            let evaluation = ctx.evaluator.score(session, &terminal, transform).await?;

            if self
                .best_rollout
                .as_ref()
                .map_or(true, |(_, o)| evaluation.objective < *o)
            {
                self.best_rollout = Some((terminal, evaluation.objective));
            }
            tree.backpropagate(node, evaluation.fitness);
            iterations += 1;
            tracing::debug!(iteration = iterations, reward = evaluation.fitness, nodes = tree.len(), "MCTS iteration");
        }

        let (configuration, objective) = match tree.robust_child(tree.root(), &mut self.rng) {
            Some(child) => {
                let config = tree.node(child).configuration().clone();
                let objective = ctx
                    .evaluator
                    .score(session, &config, FitnessTransform::Reciprocal)
                    .await?
                    .objective;
                (config, objective)
            }
            None => (root, baseline),
        };
        tracing::info!(
            iterations,
            objective,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "MCTS finished"
        );
        if let Some((ref config, best)) = self.best_rollout {
            tracing::info!(objective = best, closed = config.len(), "Best rollout: {}", config);
        }

        self.tree = Some(tree);
        Ok(SearchOutcome {
            strategy: self.name(),
            configuration,
            objective,
            iterations: iterations as usize,
            evaluations: ctx.evaluator.evaluations() - evaluations_before,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn tree_with_actions(actions: Vec<usize>, max_closures: usize) -> SearchTree {
        let mut tree = SearchTree::new(Configuration::from_segments([0]), max_closures);
        tree.set_untried(0, actions);
        tree
    }

    #[test]
    fn test_uct_unvisited_is_infinite() {
        assert!(uct(0.0, 0, 10, 1.4).is_infinite());
        let exploit = uct(10.0, 2, 4, 0.0);
        assert!((exploit - 5.0).abs() < 1e-12);
        assert!(uct(10.0, 2, 4, 1.4) > exploit);
    }

    #[test]
    fn test_add_child_consumes_untried() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut tree = tree_with_actions(vec![3, 5], 4);
        let a = tree.add_child(0, &mut rng).unwrap();
        let b = tree.add_child(0, &mut rng).unwrap();
        assert!(matches!(
            tree.add_child(0, &mut rng),
            Err(SearchError::NoLegalActions { closed: 1 })
        ));
        assert!(tree.node(0).is_fully_expanded());

        let mut actions = vec![tree.node(a).action().unwrap(), tree.node(b).action().unwrap()];
        actions.sort();
        assert_eq!(actions, vec![3, 5]);
        assert!(tree.node(a).configuration().contains(0));
        assert_eq!(tree.child_for(0, 5).map(|c| tree.node(c).action()), Some(Some(5)));
    }

    #[test]
    fn test_child_terminal_at_closure_budget() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut tree = tree_with_actions(vec![3], 1);
        let child = tree.add_child(0, &mut rng).unwrap();
        assert!(tree.node(child).is_terminal());
        assert!(SearchTree::new(Configuration::default(), 0).node(0).is_terminal());
    }

    #[test]
    fn test_no_actions_marks_terminal() {
        let tree = tree_with_actions(vec![], 5);
        assert!(tree.node(0).is_terminal());
    }

    #[test]
    fn test_expanding_unqueried_node_is_an_invariant_error() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut tree = SearchTree::new(Configuration::default(), 5);
        assert!(matches!(tree.add_child(0, &mut rng), Err(SearchError::Invariant(_))));
    }

    #[test]
    fn test_backpropagate_reaches_root() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut tree = tree_with_actions(vec![1], 3);
        let child = tree.add_child(0, &mut rng).unwrap();
        tree.set_untried(child, vec![2]);
        let grandchild = tree.add_child(child, &mut rng).unwrap();

        tree.backpropagate(grandchild, 4.0);
        tree.backpropagate(child, -1.0);

        assert_eq!(tree.node(grandchild).visits(), 1);
        assert_eq!(tree.node(child).visits(), 2);
        assert_eq!(tree.node(0).visits(), 2);
        assert!((tree.node(0).total_reward() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_select_prefers_unvisited_then_best() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut tree = tree_with_actions(vec![1, 2], 3);
        let a = tree.add_child(0, &mut rng).unwrap();
        let b = tree.add_child(0, &mut rng).unwrap();

        tree.backpropagate(a, 1.0);
        assert_eq!(tree.select_child(0, 1.4), Some(b));

        tree.backpropagate(b, 5.0);
        assert_eq!(tree.select_child(0, 0.0), Some(b));
    }

    #[test]
    fn test_robust_child_picks_most_visited() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut tree = tree_with_actions(vec![1, 2], 3);
        let a = tree.add_child(0, &mut rng).unwrap();
        let b = tree.add_child(0, &mut rng).unwrap();
        tree.backpropagate(a, 0.0);
        tree.backpropagate(b, 9.0);
        tree.backpropagate(a, 0.0);
        assert_eq!(tree.robust_child(0, &mut rng), Some(a));
        assert_eq!(SearchTree::new(Configuration::default(), 3).robust_child(0, &mut rng), None);
    }

    #[test]
    fn test_iteration_budget() {
        let config = MctsConfig {
            budget: SearchBudget::Iterations(2),
            ..MctsConfig::default()
        };
        let search = MctsSearch::new(&config, Some(0));
        let now = Instant::now();
        assert!(search.within_budget(1, now));
        assert!(!search.within_budget(2, now));
    }

    #[test]
    fn test_time_limit_budget_ignores_iterations() {
        let config = MctsConfig {
            budget: SearchBudget::TimeLimitSecs(2),
            ..MctsConfig::default()
        };
        let search = MctsSearch::new(&config, Some(0));
        assert!(search.within_budget(u32::MAX, Instant::now()));

        let long_ago = Instant::now()
            .checked_sub(Duration::from_secs(3))
            .unwrap();
        assert!(!search.within_budget(0, long_ago));
    }
}
