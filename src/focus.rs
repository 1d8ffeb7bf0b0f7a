//! Locally essential (focused) octree.
//!
//! Each rank keeps a private overlay tree that is fully resolved inside its
//! focus, the SFC key interval of its assignment, and coarsened outside.
//! Outside the focus, resolution is governed by a multipole acceptance
//! criterion: a distant cell that is small compared to its distance from
//! the focus can be represented in aggregate. Counts for leaves outside the
//! focus come from peer ranks via the focus-count exchange.
//!
//! Merge and split decisions about a cell must consult the criterion of
//! that same cell, or the fixed point oscillates: a sibling group merges
//! when the flag of its parent (the cell the merge would create) is clear,
//! and a leaf splits only when its own flag is set.

use rayon::prelude::*;

use crate::constants::{MAX_REBALANCE_ITERATIONS, NUM_SIBLINGS};
use crate::geometry::SimulationBox;
use crate::sfc::SfcKey;
use crate::tree::{
    compute_node_counts, make_root_node_tree, n_nodes, rebalance_tree, sibling_and_level,
    span_sfc_range,
};

/// Multipole acceptance flags of a focused tree, true meaning the cell must
/// stay resolved.
///
/// `leaf[i]` is evaluated on leaf `i`'s own cell and gates splits;
/// `parent[i]` is evaluated on the cell containing leaf `i` one level up
/// and gates merges of `i`'s sibling group.
#[derive(Clone, Debug, Default)]
pub struct MacFlags {
    /// Flag of each leaf's own cell.
    pub leaf: Vec<bool>,
    /// Flag of each leaf's parent cell.
    pub parent: Vec<bool>,
}

/// Rebalance opcode for one leaf of a focused tree.
///
/// Inside the focus `[first_focus_node, last_focus_node)`, particle counts
/// rule exactly as in the global tree. Outside, a sibling group merges only
/// when the parent's flag is clear, no single sibling's count exceeds the
/// bucket size (such a count defers the merge), and no sibling lies inside
/// the focus; a split additionally requires the leaf's own flag.
fn essential_node_op<K: SfcKey>(
    tree: &[K],
    idx: usize,
    counts: &[u32],
    macs: &MacFlags,
    first_focus_node: usize,
    last_focus_node: usize,
    bucket_size: u32,
) -> usize {
    let (sibling, level) = sibling_and_level(tree, idx);

    if sibling > 0 {
        let group = idx - sibling as usize;
        let group_counts = &counts[group..group + NUM_SIBLINGS];
        let count_merge =
            group_counts.iter().map(|&c| c as u64).sum::<u64>() <= bucket_size as u64;
        let mac_merge = !macs.parent[group];
        let count_stay = group_counts.iter().any(|&c| c > bucket_size);
        let in_fringe = group + NUM_SIBLINGS > first_focus_node && group < last_focus_node;

        if count_merge || (mac_merge && !count_stay && !in_fringe) {
            return 0;
        }
    }

    let in_focus = idx >= first_focus_node && idx < last_focus_node;
    if counts[idx] > bucket_size && level < K::MAX_LEVEL && (macs.leaf[idx] || in_focus) {
        return NUM_SIBLINGS;
    }
    1
}

/// Combined count/MAC rebalance decision for a focused tree.
///
/// Same contract as the plain decision: one opcode per leaf, one trailing
/// zero slot, true when every opcode is "keep".
pub fn rebalance_decision_essential<K: SfcKey>(
    tree: &[K],
    counts: &[u32],
    macs: &MacFlags,
    first_focus_node: usize,
    last_focus_node: usize,
    bucket_size: u32,
    ops: &mut [usize],
) -> bool {
    let num_nodes = n_nodes(tree);
    assert_eq!(counts.len(), num_nodes);
    assert_eq!(macs.leaf.len(), num_nodes);
    assert_eq!(macs.parent.len(), num_nodes);
    assert_eq!(ops.len(), num_nodes + 1);

    ops[..num_nodes]
        .par_iter_mut()
        .enumerate()
        .for_each(|(i, op)| {
            *op = essential_node_op(
                tree,
                i,
                counts,
                macs,
                first_focus_node,
                last_focus_node,
                bucket_size,
            );
        });
    ops[num_nodes] = 0;

    ops[..num_nodes].par_iter().all(|&op| op == 1)
}

/// Minimum distance between two integer ranges on an axis, optionally on a
/// periodic circle of circumference `r`.
fn axis_gap(a: (i64, i64), b: (i64, i64), r: i64, pbc: bool) -> i64 {
    let direct = (b.0 - a.1).max(a.0 - b.1).max(0);
    if !pbc {
        return direct;
    }
    let shifted_up = ((b.0 + r) - a.1).max(a.0 - (b.1 + r)).max(0);
    let shifted_down = ((b.0 - r) - a.1).max(a.0 - (b.1 - r)).max(0);
    direct.min(shifted_up).min(shifted_down)
}

fn cell_ranges<K: SfcKey>(start: K, span: u64) -> [(i64, i64); 3] {
    let [x, y, z] = start.decode();
    debug_assert!(span.is_power_of_two() && span.trailing_zeros() % 3 == 0);
    let side = 1i64 << (span.trailing_zeros() / 3);
    [
        (x as i64, x as i64 + side),
        (y as i64, y as i64 + side),
        (z as i64, z as i64 + side),
    ]
}

/// Evaluate the multipole acceptance criterion for every leaf and every
/// leaf's parent cell.
///
/// A cell overlapping `[focus_start, focus_end)` always keeps its flag.
/// Elsewhere the flag stays set while `edge >= theta * distance`, with
/// `edge` the cell's largest physical edge length and `distance` the
/// minimum (periodic minimum-image) distance between the cell and the focus
/// region; such cells are too close or too large to be aggregated.
pub fn mark_macs<K: SfcKey>(
    tree: &[K],
    bounds: &SimulationBox,
    focus_start: K,
    focus_end: K,
    theta: f64,
) -> MacFlags {
    let r = K::max_coord() as i64;
    let [lx, ly, lz] = bounds.lengths();
    let cell_size = [
        lx / K::max_coord() as f64,
        ly / K::max_coord() as f64,
        lz / K::max_coord() as f64,
    ];
    let pbc = [bounds.pbc_x(), bounds.pbc_y(), bounds.pbc_z()];

    // the focus region as the boxes of its coarsest covering nodes
    let mut focus_nodes = Vec::new();
    span_sfc_range(focus_start, focus_end, &mut focus_nodes);
    focus_nodes.push(focus_end);
    let focus_boxes: Vec<[(i64, i64); 3]> = focus_nodes
        .windows(2)
        .map(|pair| cell_ranges(pair[0], pair[1].to_u64() - pair[0].to_u64()))
        .collect();

    let needs_resolution = |start: u64, span: u64| {
        let end = start + span;
        // cells overlapping the focus interval always stay resolved
        if start < focus_end.to_u64() && focus_start.to_u64() < end {
            return true;
        }
        let ranges = cell_ranges(K::from_u64(start), span);
        let edge = (0..3)
            .map(|axis| (ranges[axis].1 - ranges[axis].0) as f64 * cell_size[axis])
            .fold(0.0f64, f64::max);
        let distance = focus_boxes
            .iter()
            .map(|focus| {
                let mut squared = 0.0;
                for axis in 0..3 {
                    let gap =
                        axis_gap(ranges[axis], focus[axis], r, pbc[axis]) as f64 * cell_size[axis];
                    squared += gap * gap;
                }
                squared.sqrt()
            })
            .fold(f64::INFINITY, f64::min);
        distance == 0.0 || edge >= theta * distance
    };

    let flags: Vec<(bool, bool)> = (0..n_nodes(tree))
        .into_par_iter()
        .map(|i| {
            let start = tree[i].to_u64();
            let span = tree[i + 1].to_u64() - start;
            let leaf_flag = needs_resolution(start, span);
            // the root has no parent; it always stays resolved
            let parent_flag = if span == K::node_range(0).to_u64() {
                true
            } else {
                let parent_span = span * NUM_SIBLINGS as u64;
                needs_resolution(start & !(parent_span - 1), parent_span)
            };
            (leaf_flag, parent_flag)
        })
        .collect();

    MacFlags {
        leaf: flags.iter().map(|&(leaf, _)| leaf).collect(),
        parent: flags.iter().map(|&(_, parent)| parent).collect(),
    }
}

/// Per-rank octree, fully resolved inside the focus key interval and
/// MAC-coarsened elsewhere.
pub struct FocusedTree<K> {
    tree: Vec<K>,
    counts: Vec<u32>,
    macs: MacFlags,
    focus_start: K,
    focus_end: K,
    bucket_size: u32,
    theta: f64,
}

impl<K: SfcKey> FocusedTree<K> {
    /// Start from the root-only tree with the whole key range in focus.
    pub fn new(bucket_size: u32, theta: f64) -> Self {
        assert!(theta > 0.0);
        Self {
            tree: make_root_node_tree(),
            counts: vec![0; 1],
            macs: MacFlags {
                leaf: vec![true; 1],
                parent: vec![true; 1],
            },
            focus_start: K::zero(),
            focus_end: K::node_range(0),
            bucket_size,
            theta,
        }
    }

    /// Leaf keys including the sentinel.
    pub fn tree_leaves(&self) -> &[K] {
        &self.tree
    }

    /// Particle count per leaf.
    pub fn leaf_counts(&self) -> &[u32] {
        &self.counts
    }

    /// Writable particle counts, for injecting peer counts of leaves
    /// outside the focus.
    pub fn leaf_counts_mut(&mut self) -> &mut [u32] {
        &mut self.counts
    }

    /// Current multipole acceptance flags.
    pub fn macs(&self) -> &MacFlags {
        &self.macs
    }

    /// Current focus bounds.
    pub fn focus(&self) -> (K, K) {
        (self.focus_start, self.focus_end)
    }

    /// Leaf index range `[first, last)` covered by the focus.
    pub fn focus_node_range(&self) -> (usize, usize) {
        let first = self.tree.partition_point(|&k| k < self.focus_start);
        let last = self.tree.partition_point(|&k| k < self.focus_end);
        (first, last.min(n_nodes(&self.tree)))
    }

    /// One counting/marking/rebalance step towards the fixed point for the
    /// given focus interval.
    ///
    /// Returns true when the tree is converged for this focus; the caller
    /// re-invokes until then. `keys` are the rank's sorted particle keys;
    /// counts of leaves outside the focus may afterwards be overwritten
    /// with peer counts through [`leaf_counts_mut`](Self::leaf_counts_mut).
    pub fn update(
        &mut self,
        bounds: &SimulationBox,
        keys: &[K],
        focus_start: K,
        focus_end: K,
    ) -> bool {
        assert!(focus_start < focus_end);
        let focus_moved = focus_start != self.focus_start || focus_end != self.focus_end;
        self.focus_start = focus_start;
        self.focus_end = focus_end;

        compute_node_counts(&self.tree, &mut self.counts, keys, u32::MAX);
        self.macs = mark_macs(&self.tree, bounds, focus_start, focus_end, self.theta);

        let (first, last) = self.focus_node_range();
        let mut ops = vec![0; n_nodes(&self.tree) + 1];
        let converged = rebalance_decision_essential(
            &self.tree,
            &self.counts,
            &self.macs,
            first,
            last,
            self.bucket_size,
            &mut ops,
        );
        if converged && !focus_moved {
            return true;
        }
        if !converged {
            self.tree = rebalance_tree(&self.tree, &mut ops);
            self.counts.resize(n_nodes(&self.tree), 0);
            compute_node_counts(&self.tree, &mut self.counts, keys, u32::MAX);
            self.macs = mark_macs(&self.tree, bounds, focus_start, focus_end, self.theta);
        }
        false
    }

    /// Drive [`update`](Self::update) to its fixed point.
    pub fn converge(&mut self, bounds: &SimulationBox, keys: &[K], focus_start: K, focus_end: K) {
        for _ in 0..MAX_REBALANCE_ITERATIONS {
            if self.update(bounds, keys, focus_start, focus_end) {
                return;
            }
        }
        panic!("focused tree did not converge");
    }
}
