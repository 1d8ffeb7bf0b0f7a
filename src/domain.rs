//! Domain decomposition along the space-filling curve.
//!
//! The global cornerstone tree orders all leaves along the SFC; assigning
//! each rank one contiguous run of leaves balances particle counts while
//! keeping every rank's domain geometrically compact. The assignment is
//! expressed in SFC keys so it stays valid when the tree is rebuilt.

use crate::sfc::SfcKey;
use crate::tree::n_nodes;

/// A set of half-open index ranges with element counts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexRanges {
    ranges: Vec<(usize, usize)>,
}

impl IndexRanges {
    /// Empty range set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the range `[start, end)`.
    pub fn add_range(&mut self, start: usize, end: usize) {
        assert!(start <= end);
        self.ranges.push((start, end));
    }

    /// Number of ranges.
    pub fn n_ranges(&self) -> usize {
        self.ranges.len()
    }

    /// Start of range `i`.
    pub fn range_start(&self, i: usize) -> usize {
        self.ranges[i].0
    }

    /// One-past-the-end of range `i`.
    pub fn range_end(&self, i: usize) -> usize {
        self.ranges[i].1
    }

    /// Number of elements in range `i`.
    pub fn count(&self, i: usize) -> usize {
        self.ranges[i].1 - self.ranges[i].0
    }

    /// Number of elements over all ranges.
    pub fn total_count(&self) -> usize {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    /// Iterate over the ranges.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.ranges.iter().copied()
    }
}

/// Per-destination-rank index ranges into the local particle arrays.
///
/// Indices refer to positions after the caller's SFC ordering has been
/// applied, see the particle exchange.
#[derive(Clone, Debug, Default)]
pub struct SendList {
    manifests: Vec<IndexRanges>,
}

impl SendList {
    /// One empty manifest per rank.
    pub fn new(n_ranks: usize) -> Self {
        Self {
            manifests: vec![IndexRanges::new(); n_ranks],
        }
    }

    /// Number of ranks.
    pub fn n_ranks(&self) -> usize {
        self.manifests.len()
    }

    /// Manifest for `rank`.
    pub fn manifest(&self, rank: usize) -> &IndexRanges {
        &self.manifests[rank]
    }

    /// Mutable manifest for `rank`.
    pub fn manifest_mut(&mut self, rank: usize) -> &mut IndexRanges {
        &mut self.manifests[rank]
    }

    /// Total number of elements sent to `rank`.
    pub fn count(&self, rank: usize) -> usize {
        self.manifests[rank].total_count()
    }
}

/// One contiguous SFC key range assigned to a rank, with its particle count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SfcRange<K> {
    /// First key of the range.
    pub start: K,
    /// One-past-the-last key of the range.
    pub end: K,
    /// Global number of particles inside the range.
    pub count: usize,
}

/// Assignment of SFC key ranges to ranks.
///
/// The union of all ranges covers the whole key space without gaps or
/// overlaps, and each rank's ranges are contiguous in SFC order. The split
/// produces a single range per rank; the representation allows several to
/// keep downstream code uniform.
#[derive(Clone, Debug)]
pub struct SpaceCurveAssignment<K> {
    ranges: Vec<Vec<SfcRange<K>>>,
}

impl<K: SfcKey> SpaceCurveAssignment<K> {
    /// Empty assignment for `n_ranks` ranks.
    pub fn new(n_ranks: usize) -> Self {
        Self {
            ranges: vec![Vec::new(); n_ranks],
        }
    }

    /// Append a key range for `rank`.
    pub fn add_range(&mut self, rank: usize, start: K, end: K, count: usize) {
        assert!(start <= end);
        self.ranges[rank].push(SfcRange { start, end, count });
    }

    /// Number of ranks.
    pub fn n_ranks(&self) -> usize {
        self.ranges.len()
    }

    /// Number of ranges assigned to `rank`.
    pub fn n_ranges(&self, rank: usize) -> usize {
        self.ranges[rank].len()
    }

    /// Key ranges of `rank`.
    pub fn ranges(&self, rank: usize) -> &[SfcRange<K>] {
        &self.ranges[rank]
    }

    /// Total particle count assigned to `rank`.
    pub fn count(&self, rank: usize) -> usize {
        self.ranges[rank].iter().map(|r| r.count).sum()
    }

    /// True iff `key` lies in one of `rank`'s ranges.
    pub fn contains(&self, rank: usize, key: K) -> bool {
        self.ranges[rank]
            .iter()
            .any(|r| r.start <= key && key < r.end)
    }

    /// The rank whose assignment contains `key`.
    pub fn find_rank(&self, key: K) -> usize {
        for (rank, ranges) in self.ranges.iter().enumerate() {
            if ranges.iter().any(|r| r.start <= key && key < r.end) {
                return rank;
            }
        }
        panic!("key not covered by assignment");
    }
}

/// Split the leaves of the global tree into one contiguous, leaf-aligned
/// SFC range per rank with balanced particle counts.
///
/// Each rank receives leaves until its cumulative count reaches the global
/// average; the last rank absorbs the remainder.
pub fn single_range_sfc_split<K: SfcKey>(
    tree: &[K],
    counts: &[u32],
    n_ranks: usize,
) -> SpaceCurveAssignment<K> {
    assert_eq!(counts.len(), n_nodes(tree));
    assert!(n_ranks > 0);

    let global_count: usize = counts.iter().map(|&c| c as usize).sum();
    let count_per_split = global_count / n_ranks;

    let mut assignment = SpaceCurveAssignment::new(n_ranks);
    let mut leaves_done = 0;
    for split in 0..n_ranks {
        let mut split_count = 0;
        let mut j = leaves_done;
        if split == n_ranks - 1 {
            // the last rank absorbs the remainder, including trailing
            // empty leaves
            j = n_nodes(tree);
            split_count = counts[leaves_done..j].iter().map(|&c| c as usize).sum();
        } else {
            while split_count < count_per_split && j < n_nodes(tree) {
                split_count += counts[j] as usize;
                j += 1;
            }
        }

        assignment.add_range(split, tree[leaves_done], tree[j], split_count);
        leaves_done = j;
    }

    assignment
}

/// Build the send list for the assignment exchange.
///
/// For every rank, the particle index ranges are found by binary searching
/// the rank's SFC range bounds in the sorted key array. Indices refer to
/// SFC-sorted positions.
pub fn create_send_list<K: SfcKey>(
    assignment: &SpaceCurveAssignment<K>,
    keys: &[K],
) -> SendList {
    debug_assert!(keys.windows(2).all(|w| w[0] <= w[1]));

    let mut send_list = SendList::new(assignment.n_ranks());
    for rank in 0..assignment.n_ranks() {
        let manifest = send_list.manifest_mut(rank);
        for range in assignment.ranges(rank) {
            let lower = keys.partition_point(|&k| k < range.start);
            let upper = keys.partition_point(|&k| k < range.end);
            manifest.add_range(lower, upper);
        }
    }
    send_list
}
