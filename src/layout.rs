//! Particle buffer layout for assigned and halo nodes.
//!
//! After domain decomposition and halo discovery, a rank stores particle
//! data for its assigned leaves plus incoming halo leaves, packed into one
//! array per scalar attribute in SFC order. [`ArrayLayout`] records, per
//! present leaf, the offset range that its particles occupy; the same
//! offsets apply identically to every attribute buffer.

use std::collections::HashMap;

use crate::domain::{IndexRanges, SpaceCurveAssignment};
use crate::sfc::SfcKey;

/// Offsets into the particle buffers for all leaves present on a rank.
#[derive(Clone, Debug)]
pub struct ArrayLayout {
    /// Sorted global leaf indices present on this rank.
    node_list: Vec<usize>,
    /// Buffer offset per present leaf; the last entry is the total size.
    offsets: Vec<usize>,
    /// Global leaf index to position in `node_list`/`offsets`.
    global_to_local: HashMap<usize, usize>,
    /// Offset ranges that belong to the rank's assignment (not halos).
    local_ranges: IndexRanges,
}

impl ArrayLayout {
    /// Construct from a sorted node list and matching offsets.
    pub fn new(node_list: Vec<usize>, offsets: Vec<usize>) -> Self {
        assert_eq!(offsets.len(), node_list.len() + 1);
        debug_assert!(node_list.windows(2).all(|w| w[0] < w[1]));
        debug_assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
        let global_to_local = node_list
            .iter()
            .enumerate()
            .map(|(local, &global)| (global, local))
            .collect();
        Self {
            node_list,
            offsets,
            global_to_local,
            local_ranges: IndexRanges::new(),
        }
    }

    /// Mark `[lower_node, upper_node)` (global leaf indices) as part of the
    /// rank assignment.
    ///
    /// All leaves of the range must be present in the layout.
    pub fn add_local_range(&mut self, lower_node: usize, upper_node: usize) {
        let n = upper_node - lower_node;
        let local = self.global_to_local[&lower_node];
        let lower_offset = self.offsets[local];
        let upper_offset = self.offsets[local + n];
        self.local_ranges.add_range(lower_offset, upper_offset);
    }

    /// Number of assigned (non-halo) offset ranges.
    pub fn n_local_ranges(&self) -> usize {
        self.local_ranges.n_ranges()
    }

    /// Buffer position where assigned range `i` starts.
    pub fn local_range_position(&self, i: usize) -> usize {
        self.local_ranges.range_start(i)
    }

    /// Number of particles in assigned range `i`.
    pub fn local_range_count(&self, i: usize) -> usize {
        self.local_ranges.count(i)
    }

    /// Number of particles over all assigned ranges.
    pub fn local_count(&self) -> usize {
        self.local_ranges.total_count()
    }

    /// Buffer offset of the global leaf `global_node`.
    ///
    /// The leaf must be present in the layout.
    pub fn node_position(&self, global_node: usize) -> usize {
        self.offsets[self.global_to_local[&global_node]]
    }

    /// Number of particles of the global leaf `global_node`.
    pub fn node_count(&self, global_node: usize) -> usize {
        let local = self.global_to_local[&global_node];
        self.offsets[local + 1] - self.offsets[local]
    }

    /// True iff the global leaf is present on this rank.
    pub fn contains(&self, global_node: usize) -> bool {
        self.global_to_local.contains_key(&global_node)
    }

    /// Sorted global leaf indices present on this rank.
    pub fn node_list(&self) -> &[usize] {
        &self.node_list
    }

    /// Total buffer size: assigned plus halo particles.
    pub fn total_size(&self) -> usize {
        *self.offsets.last().unwrap()
    }
}

/// Find the node index ranges of the global tree assigned to `rank`.
pub fn compute_local_node_ranges<K: SfcKey>(
    tree: &[K],
    assignment: &SpaceCurveAssignment<K>,
    rank: usize,
) -> IndexRanges {
    let mut ranges = IndexRanges::new();
    for sfc_range in assignment.ranges(rank) {
        let first = tree.partition_point(|&k| k < sfc_range.start);
        let second = tree.partition_point(|&k| k < sfc_range.end);
        ranges.add_range(first, second);
    }
    ranges
}

/// Flatten grouped per-rank node lists into one list.
pub fn flatten_node_list(grouped_nodes: &[Vec<usize>]) -> Vec<usize> {
    let mut node_list = Vec::with_capacity(grouped_nodes.iter().map(Vec::len).sum());
    for group in grouped_nodes {
        node_list.extend_from_slice(group);
    }
    node_list
}

/// Compute the buffer layout of the executing rank.
///
/// `local_nodes` are the node index ranges assigned to the rank,
/// `halo_nodes` the incoming halo node indices, and `global_counts` the
/// particle counts per node of the global tree. The node lists are merged,
/// deduplicated and sorted; offsets follow from an exclusive scan of the
/// per-node counts.
pub fn compute_layout(
    local_nodes: &IndexRanges,
    halo_nodes: Vec<usize>,
    global_counts: &[u32],
) -> ArrayLayout {
    let mut node_list = halo_nodes;
    for (lower, upper) in local_nodes.iter() {
        node_list.extend(lower..upper);
    }
    node_list.sort_unstable();
    node_list.dedup();

    let mut offsets = Vec::with_capacity(node_list.len() + 1);
    let mut offset = 0;
    for &node in &node_list {
        offsets.push(offset);
        offset += global_counts[node] as usize;
    }
    offsets.push(offset);

    let mut layout = ArrayLayout::new(node_list, offsets);
    for (lower, upper) in local_nodes.iter() {
        layout.add_local_range(lower, upper);
    }
    layout
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout_offsets_and_positions() {
        // assigned nodes [2, 5), halos {0, 6}
        let mut local_nodes = IndexRanges::new();
        local_nodes.add_range(2, 5);
        let halo_nodes = vec![6, 0];
        let global_counts = vec![4u32, 1, 3, 0, 2, 1, 5, 2];

        let layout = compute_layout(&local_nodes, halo_nodes, &global_counts);

        assert_eq!(layout.node_list(), &[0, 2, 3, 4, 6]);
        assert_eq!(layout.total_size(), 4 + 3 + 0 + 2 + 5);

        // per-node positions and counts
        assert_eq!(layout.node_position(0), 0);
        assert_eq!(layout.node_count(0), 4);
        assert_eq!(layout.node_position(2), 4);
        assert_eq!(layout.node_count(2), 3);
        assert_eq!(layout.node_position(3), 7);
        assert_eq!(layout.node_count(3), 0);
        assert_eq!(layout.node_position(4), 7);
        assert_eq!(layout.node_count(4), 2);
        assert_eq!(layout.node_position(6), 9);
        assert_eq!(layout.node_count(6), 5);

        assert!(!layout.contains(1));
        assert!(!layout.contains(5));

        // adjacent present leaves: position advances by the count
        for pair in [[2usize, 3], [3, 4]] {
            assert_eq!(
                layout.node_position(pair[1]),
                layout.node_position(pair[0]) + layout.node_count(pair[0])
            );
        }

        // the assigned region is one contiguous offset range
        assert_eq!(layout.n_local_ranges(), 1);
        assert_eq!(layout.local_range_position(0), 4);
        assert_eq!(layout.local_range_count(0), 3 + 0 + 2);
        assert_eq!(layout.local_count(), 5);
    }

    #[test]
    fn layout_deduplicates_nodes() {
        let mut local_nodes = IndexRanges::new();
        local_nodes.add_range(0, 2);
        // halo list accidentally repeats an assigned node
        let layout = compute_layout(&local_nodes, vec![1, 2], &[1, 1, 1]);
        assert_eq!(layout.node_list(), &[0, 1, 2]);
        assert_eq!(layout.total_size(), 3);
    }

    #[test]
    fn local_node_ranges_from_assignment() {
        use crate::tree::OctreeMaker;

        let tree: Vec<u64> = OctreeMaker::new().divide(&[]).make();
        let mut assignment = SpaceCurveAssignment::new(2);
        assignment.add_range(0, tree[0], tree[3], 3);
        assignment.add_range(1, tree[3], u64::node_range(0), 5);

        let ranges0 = compute_local_node_ranges(&tree, &assignment, 0);
        assert_eq!(ranges0.n_ranges(), 1);
        assert_eq!((ranges0.range_start(0), ranges0.range_end(0)), (0, 3));

        let ranges1 = compute_local_node_ranges(&tree, &assignment, 1);
        assert_eq!((ranges1.range_start(0), ranges1.range_end(0)), (3, 8));
    }

    #[test]
    fn flatten_preserves_group_order() {
        let grouped = vec![vec![3, 4], vec![], vec![7, 1]];
        assert_eq!(flatten_node_list(&grouped), vec![3, 4, 7, 1]);
    }
}
