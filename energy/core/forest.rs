//! Bagged ensemble of CART regression trees.

use ndarray::{ArrayView1, ArrayView2};
use rand::{seq::index, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Number of candidate features examined at each split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxFeatures {
    /// Every feature.
    All,
    /// `ceil(sqrt(width))` features.
    Sqrt,
    /// A fraction of the features, at least one.
    Fraction(f64),
}

impl MaxFeatures {
    fn resolve(self, width: usize) -> usize {
        let count = match self {
            Self::All => width,
            Self::Sqrt => (width as f64).sqrt().ceil() as usize,
            Self::Fraction(share) => (share * width as f64).ceil() as usize,
        };
        count.clamp(1, width.max(1))
    }
}

/// Hyperparameters of the forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    /// Number of trees.
    pub n_estimators: usize,
    /// Base seed; tree `i` uses `seed + i`.
    pub seed: u64,
    /// Maximum depth, unbounded when `None`.
    pub max_depth: Option<usize>,
    /// Minimum rows required to split a node.
    pub min_samples_split: usize,
    /// Minimum rows on each side of a split.
    pub min_samples_leaf: usize,
    /// Features considered per split.
    pub max_features: MaxFeatures,
    /// Draw a bootstrap sample per tree.
    pub bootstrap: bool,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            seed: 42,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: MaxFeatures::All,
            bootstrap: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    feature: usize,
    threshold: f64,
    score: f64,
}

/// Single regression tree stored as a flat node arena; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    fn grow(
        features: ArrayView2<'_, f64>,
        targets: &[f64],
        sample: Vec<usize>,
        params: &ForestParams,
        rng: &mut ChaCha8Rng,
    ) -> Self {
        let candidates = params.max_features.resolve(features.ncols());
        let mut nodes = vec![Node::Leaf { value: 0.0 }];
        let mut pending = vec![(0_usize, sample, 0_usize)];
        while let Some((slot, rows, depth)) = pending.pop() {
            let split = if params.max_depth.is_some_and(|limit| depth >= limit) {
                None
            } else {
                best_split(features, targets, &rows, candidates, params, rng)
            };
            let Some(split) = split else {
                nodes[slot] = Node::Leaf {
                    value: mean(targets, &rows),
                };
                continue;
            };
            let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
                .iter()
                .copied()
                .partition(|row| features[[*row, split.feature]] <= split.threshold);
            let left = nodes.len();
            let right = left + 1;
            nodes.push(Node::Leaf { value: 0.0 });
            nodes.push(Node::Leaf { value: 0.0 });
            nodes[slot] = Node::Split {
                feature: split.feature,
                threshold: split.threshold,
                left,
                right,
            };
            pending.push((right, right_rows, depth + 1));
            pending.push((left, left_rows, depth + 1));
        }
        Self { nodes }
    }

    /// Predicts one row.
    #[must_use]
    pub fn predict_row(&self, row: ArrayView1<'_, f64>) -> f64 {
        let mut cursor = 0;
        loop {
            match &self.nodes[cursor] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    cursor = if row[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    /// Number of nodes, leaves included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of leaves.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| matches!(node, Node::Leaf { .. }))
            .count()
    }

    /// Checks that every split reads a column below `width` and points at
    /// later nodes inside the arena, so traversal always terminates.
    pub fn check(&self, width: usize) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no nodes".into());
        }
        for (slot, node) in self.nodes.iter().enumerate() {
            if let Node::Split {
                feature,
                left,
                right,
                ..
            } = node
            {
                if *feature >= width {
                    return Err(format!(
                        "node {slot} splits on column {feature}, width is {width}"
                    ));
                }
                for child in [*left, *right] {
                    if child <= slot || child >= self.nodes.len() {
                        return Err(format!("node {slot} points at node {child}"));
                    }
                }
            }
        }
        Ok(())
    }
}

fn mean(targets: &[f64], rows: &[usize]) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    rows.iter().map(|row| targets[*row]).sum::<f64>() / rows.len() as f64
}

/// Finds the split maximising `sum_l^2 / n_l + sum_r^2 / n_r`, which is the
/// split with the lowest summed squared error.
fn best_split(
    features: ArrayView2<'_, f64>,
    targets: &[f64],
    rows: &[usize],
    candidates: usize,
    params: &ForestParams,
    rng: &mut ChaCha8Rng,
) -> Option<SplitCandidate> {
    let count = rows.len();
    if count < params.min_samples_split.max(2) || count < 2 * params.min_samples_leaf {
        return None;
    }
    let first = targets[rows[0]];
    if rows.iter().all(|row| targets[*row] == first) {
        return None;
    }

    let width = features.ncols();
    let feature_order: Vec<usize> = if candidates >= width {
        (0..width).collect()
    } else {
        index::sample(rng, width, candidates).into_vec()
    };

    let total: f64 = rows.iter().map(|row| targets[*row]).sum();
    let parent_score = total * total / count as f64;
    let mut best: Option<SplitCandidate> = None;
    let mut sorted = rows.to_vec();

    for feature in feature_order {
        sorted.sort_by(|a, b| features[[*a, feature]].total_cmp(&features[[*b, feature]]));
        let mut left_sum = 0.0;
        for position in 0..count - 1 {
            left_sum += targets[sorted[position]];
            let here = features[[sorted[position], feature]];
            let next = features[[sorted[position + 1], feature]];
            if here == next {
                continue;
            }
            let left_count = position + 1;
            let right_count = count - left_count;
            if left_count < params.min_samples_leaf || right_count < params.min_samples_leaf {
                continue;
            }
            let right_sum = total - left_sum;
            let score = left_sum * left_sum / left_count as f64
                + right_sum * right_sum / right_count as f64;
            if score <= parent_score + f64::EPSILON * parent_score.abs() {
                continue;
            }
            if best.map_or(true, |current| score > current.score) {
                let midpoint = here + (next - here) / 2.0;
                let threshold = if midpoint < next { midpoint } else { here };
                best = Some(SplitCandidate {
                    feature,
                    threshold,
                    score,
                });
            }
        }
    }
    best
}

/// Random forest regressor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    params: ForestParams,
    width: usize,
    trees: Vec<RegressionTree>,
}

impl RandomForest {
    /// Fits `params.n_estimators` trees. Callers guarantee
    /// `features.nrows() == targets.len()`.
    #[must_use]
    pub fn fit(features: ArrayView2<'_, f64>, targets: &[f64], params: &ForestParams) -> Self {
        let rows = features.nrows();
        let trees = (0..params.n_estimators.max(1))
            .map(|tree| {
                let mut rng = ChaCha8Rng::seed_from_u64(params.seed.wrapping_add(tree as u64));
                let sample = if params.bootstrap && rows > 0 {
                    (0..rows).map(|_| rng.gen_range(0..rows)).collect()
                } else {
                    (0..rows).collect()
                };
                RegressionTree::grow(features, targets, sample, params, &mut rng)
            })
            .collect();
        Self {
            params: params.clone(),
            width: features.ncols(),
            trees,
        }
    }

    /// Mean of the tree predictions for one row.
    #[must_use]
    pub fn predict_row(&self, row: ArrayView1<'_, f64>) -> f64 {
        let total: f64 = self.trees.iter().map(|tree| tree.predict_row(row)).sum();
        total / self.trees.len().max(1) as f64
    }

    /// Predicts every row.
    #[must_use]
    pub fn predict(&self, features: ArrayView2<'_, f64>) -> Vec<f64> {
        features
            .rows()
            .into_iter()
            .map(|row| self.predict_row(row))
            .collect()
    }

    /// Hyperparameters used at fit time.
    #[must_use]
    pub const fn params(&self) -> &ForestParams {
        &self.params
    }

    /// Column count seen at fit time.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Fitted trees.
    #[must_use]
    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    /// Checks a deserialized forest before it serves rows of `width` columns.
    pub fn check(&self, width: usize) -> Result<(), String> {
        if self.width != width {
            return Err(format!(
                "forest was fitted on {} columns, expected {width}",
                self.width
            ));
        }
        if self.trees.is_empty() {
            return Err("forest has no trees".into());
        }
        for (index, tree) in self.trees.iter().enumerate() {
            tree.check(width)
                .map_err(|defect| format!("tree {index}: {defect}"))?;
        }
        Ok(())
    }
}
