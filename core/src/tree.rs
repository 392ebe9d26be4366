//! Shallow CART classifier, the alternative to logistic regression.
//!
//! Binary classification trees with Gini-impurity splits, grown on dense
//! rows. Depth and split size are capped so the trees stay interpretable;
//! leaves keep their class counts so prediction returns a probability.

use serde::{Deserialize, Serialize};

use crate::error::{SluError, SluResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeNode {
    Leaf {
        n_neg: usize,
        n_pos: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    root: TreeNode,
    n_features: usize,
}

#[derive(Debug, Clone)]
pub struct TreeOptions {
    pub max_depth: usize,
    pub min_samples_split: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            max_depth: 4,
            min_samples_split: 5,
        }
    }
}

impl DecisionTree {
    pub fn fit(rows: &[Vec<f64>], y: &[u8], opts: &TreeOptions) -> SluResult<Self> {
        if rows.is_empty() || rows.len() != y.len() {
            return Err(SluError::Fit(format!(
                "bad training shape: {} rows, {} labels",
                rows.len(),
                y.len()
            )));
        }
        let n_features = rows[0].len();
        let idxs: Vec<usize> = (0..rows.len()).collect();
        let root = grow(rows, y, &idxs, opts, 0);
        Ok(Self { root, n_features })
    }

    /// `P(y = 1 | x)` from the class counts of the matched leaf.
    pub fn predict_prob(&self, feat_vec: &[f64]) -> f64 {
        let mut node = &self.root;
        loop {
            match node {
                TreeNode::Leaf { n_neg, n_pos } => {
                    let total = n_neg + n_pos;
                    return if total == 0 {
                        0.5
                    } else {
                        *n_pos as f64 / total as f64
                    };
                }
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let value = feat_vec.get(*feature).copied().unwrap_or(0.0);
                    node = if value <= *threshold { left } else { right };
                }
            }
        }
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Total node count, reported as the tree's size diagnostic.
    pub fn node_count(&self) -> usize {
        fn count(node: &TreeNode) -> usize {
            match node {
                TreeNode::Leaf { .. } => 1,
                TreeNode::Split { left, right, .. } => 1 + count(left) + count(right),
            }
        }
        count(&self.root)
    }

    /// Features used by split nodes.
    pub fn split_features(&self) -> Vec<usize> {
        fn walk(node: &TreeNode, out: &mut Vec<usize>) {
            if let TreeNode::Split {
                feature,
                left,
                right,
                ..
            } = node
            {
                out.push(*feature);
                walk(left, out);
                walk(right, out);
            }
        }
        let mut out = Vec::new();
        walk(&self.root, &mut out);
        out.sort_unstable();
        out.dedup();
        out
    }
}

fn class_counts(y: &[u8], idxs: &[usize]) -> (usize, usize) {
    let n_pos = idxs.iter().filter(|&&i| y[i] == 1).count();
    (idxs.len() - n_pos, n_pos)
}

fn gini(n_neg: usize, n_pos: usize) -> f64 {
    let total = (n_neg + n_pos) as f64;
    if total == 0.0 {
        return 0.0;
    }
    let p_neg = n_neg as f64 / total;
    let p_pos = n_pos as f64 / total;
    1.0 - p_neg * p_neg - p_pos * p_pos
}

fn grow(
    rows: &[Vec<f64>],
    y: &[u8],
    idxs: &[usize],
    opts: &TreeOptions,
    depth: usize,
) -> TreeNode {
    let (n_neg, n_pos) = class_counts(y, idxs);
    if depth >= opts.max_depth
        || idxs.len() < opts.min_samples_split
        || n_neg == 0
        || n_pos == 0
    {
        return TreeNode::Leaf { n_neg, n_pos };
    }

    let parent_gini = gini(n_neg, n_pos);
    let mut best: Option<(f64, usize, f64)> = None; // (impurity, feature, threshold)
    let n_features = rows[idxs[0]].len();

    for feature in 0..n_features {
        let mut values: Vec<f64> = idxs.iter().map(|&i| rows[i][feature]).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        values.dedup();
        for pair in values.windows(2) {
            let threshold = 0.5 * (pair[0] + pair[1]);
            let left: Vec<usize> = idxs
                .iter()
                .copied()
                .filter(|&i| rows[i][feature] <= threshold)
                .collect();
            if left.is_empty() || left.len() == idxs.len() {
                continue;
            }
            let right_len = idxs.len() - left.len();
            let (ln, lp) = class_counts(y, &left);
            let (rn, rp) = (n_neg - ln, n_pos - lp);
            let impurity = (left.len() as f64 * gini(ln, lp)
                + right_len as f64 * gini(rn, rp))
                / idxs.len() as f64;
            if best.map_or(impurity < parent_gini, |(b, _, _)| impurity < b) {
                best = Some((impurity, feature, threshold));
            }
        }
    }

    match best {
        Some((_, feature, threshold)) => {
            let (left_idxs, right_idxs): (Vec<usize>, Vec<usize>) = idxs
                .iter()
                .copied()
                .partition(|&i| rows[i][feature] <= threshold);
            TreeNode::Split {
                feature,
                threshold,
                left: Box::new(grow(rows, y, &left_idxs, opts, depth + 1)),
                right: Box::new(grow(rows, y, &right_idxs, opts, depth + 1)),
            }
        }
        None => TreeNode::Leaf { n_neg, n_pos },
    }
}
