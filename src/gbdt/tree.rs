use serde::{Deserialize, Serialize};

/// Flat-array regression tree. Node 0 is the root; a row goes left when its
/// feature value is `<= threshold` (NaN goes right).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

impl RegressionTree {
    pub fn predict(&self, features: &[f64]) -> f64 {
        let mut idx = 0usize;
        loop {
            match self.nodes.get(idx) {
                Some(Node::Leaf { value }) => return *value,
                Some(Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let v = features.get(*feature).copied().unwrap_or(f64::NAN);
                    idx = if v <= *threshold { *left } else { *right };
                }
                None => return 0.0,
            }
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match nodes.get(idx) {
                Some(Node::Split { left, right, .. }) => {
                    1 + walk(nodes, *left).max(walk(nodes, *right))
                }
                _ => 0,
            }
        }
        walk(&self.nodes, 0)
    }
}

/// Growth limits for a single tree.
#[derive(Debug, Clone, Copy)]
pub struct TreeGrowth {
    pub max_depth: usize,
    pub reg_lambda: f64,
    pub min_child_weight: f64,
    pub learning_rate: f64,
}

/// Per-fit data shared by every tree: row-major features and, for each
/// feature, row indices sorted by that feature's value.
pub struct TrainingData<'a> {
    rows: &'a [Vec<f64>],
    sorted: Vec<Vec<usize>>,
}

impl<'a> TrainingData<'a> {
    pub fn new(rows: &'a [Vec<f64>], n_features: usize) -> Self {
        let sorted = (0..n_features)
            .map(|f| {
                let mut idx: Vec<usize> = (0..rows.len()).collect();
                idx.sort_by(|&a, &b| rows[a][f].total_cmp(&rows[b][f]).then(a.cmp(&b)));
                idx
            })
            .collect();
        Self { rows, sorted }
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.rows[i]
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    grad: f64,
    hess: f64,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    gain: f64,
    feature: usize,
    threshold: f64,
    left_grad: f64,
    left_hess: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct ScanState {
    grad: f64,
    hess: f64,
    last: Option<f64>,
}

enum BuildNode {
    Pending(Pending),
    Done(Node),
}

fn score(grad: f64, hess: f64, lambda: f64) -> f64 {
    grad * grad / (hess + lambda)
}

fn leaf_value(p: Pending, growth: &TreeGrowth) -> f64 {
    -p.grad / (p.hess + growth.reg_lambda) * growth.learning_rate
}

/// Grows one tree level by level with exact greedy splits on squared-error
/// gradients. `in_sample[i]` marks rows drawn for this tree; `features` are
/// the columns it may split on.
pub fn fit_tree(
    data: &TrainingData<'_>,
    grad: &[f64],
    hess: &[f64],
    in_sample: &[bool],
    features: &[usize],
    growth: &TreeGrowth,
) -> RegressionTree {
    let n = data.n_rows();
    let mut node_of: Vec<Option<usize>> = (0..n).map(|i| in_sample[i].then_some(0)).collect();

    let root = (0..n).filter(|&i| in_sample[i]).fold(
        Pending {
            grad: 0.0,
            hess: 0.0,
        },
        |acc, i| Pending {
            grad: acc.grad + grad[i],
            hess: acc.hess + hess[i],
        },
    );
    let mut nodes = vec![BuildNode::Pending(root)];
    let mut frontier = vec![0usize];

    for _depth in 0..growth.max_depth {
        if frontier.is_empty() {
            break;
        }
        let mut best: Vec<Option<Candidate>> = vec![None; nodes.len()];

        for &f in features {
            let mut scan: Vec<ScanState> = vec![ScanState::default(); nodes.len()];
            for &i in &data.sorted[f] {
                let Some(nid) = node_of[i] else {
                    continue;
                };
                let BuildNode::Pending(total) = nodes[nid] else {
                    continue;
                };
                let x = data.row(i)[f];
                let st = &mut scan[nid];
                if let Some(prev) = st.last {
                    if x > prev
                        && st.hess >= growth.min_child_weight
                        && total.hess - st.hess >= growth.min_child_weight
                    {
                        let gain = score(st.grad, st.hess, growth.reg_lambda)
                            + score(total.grad - st.grad, total.hess - st.hess, growth.reg_lambda)
                            - score(total.grad, total.hess, growth.reg_lambda);
                        let better = best[nid].map_or(gain > 0.0, |b| gain > b.gain);
                        if better && gain.is_finite() {
                            best[nid] = Some(Candidate {
                                gain,
                                feature: f,
                                threshold: prev + (x - prev) / 2.0,
                                left_grad: st.grad,
                                left_hess: st.hess,
                            });
                        }
                    }
                }
                st.grad += grad[i];
                st.hess += hess[i];
                st.last = Some(x);
            }
        }

        let mut next_frontier = Vec::new();
        let mut children: Vec<Option<(usize, usize, Candidate)>> = vec![None; nodes.len()];
        for &nid in &frontier {
            let BuildNode::Pending(total) = nodes[nid] else {
                continue;
            };
            match best[nid] {
                Some(c) => {
                    let left = nodes.len();
                    nodes.push(BuildNode::Pending(Pending {
                        grad: c.left_grad,
                        hess: c.left_hess,
                    }));
                    let right = nodes.len();
                    nodes.push(BuildNode::Pending(Pending {
                        grad: total.grad - c.left_grad,
                        hess: total.hess - c.left_hess,
                    }));
                    nodes[nid] = BuildNode::Done(Node::Split {
                        feature: c.feature,
                        threshold: c.threshold,
                        left,
                        right,
                    });
                    children[nid] = Some((left, right, c));
                    next_frontier.push(left);
                    next_frontier.push(right);
                }
                None => {
                    nodes[nid] = BuildNode::Done(Node::Leaf {
                        value: leaf_value(total, growth),
                    });
                }
            }
        }

        for (i, slot) in node_of.iter_mut().enumerate() {
            let Some(nid) = *slot else {
                continue;
            };
            *slot = match children.get(nid).copied().flatten() {
                Some((left, right, c)) => {
                    if data.row(i)[c.feature] <= c.threshold {
                        Some(left)
                    } else {
                        Some(right)
                    }
                }
                None => None,
            };
        }
        frontier = next_frontier;
    }

    let nodes = nodes
        .into_iter()
        .map(|n| match n {
            BuildNode::Done(node) => node,
            BuildNode::Pending(p) => Node::Leaf {
                value: leaf_value(p, growth),
            },
        })
        .collect();
    RegressionTree { nodes }
}
