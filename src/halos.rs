//! Halo discovery: which remote leaves must be mirrored locally.
//!
//! Every assigned leaf is expanded by its interaction radius into a halo
//! box; the leaves of the global tree that overlap the box but belong to
//! another rank form the incoming halo set. Because the tree, counts and
//! radii are globally replicated, each rank can also run the discovery from
//! a peer's perspective to derive what it must send.

use rayon::prelude::*;

use crate::btree::{create_internal_tree, find_collisions, BinaryNode};
use crate::domain::{SendList, SpaceCurveAssignment};
use crate::geometry::{contained_in, make_halo_box, SimulationBox};
use crate::layout::{compute_local_node_ranges, ArrayLayout};
use crate::sfc::SfcKey;
use crate::tree::n_nodes;

/// Aggregate per-leaf interaction radii from particle smoothing lengths.
///
/// For each leaf of `tree`, the radius is twice the maximum smoothing
/// length of the particles inside, the compact support of the SPH kernel.
/// `ordering` maps sorted key positions to positions in `h`; empty leaves
/// get a zero radius.
pub fn compute_halo_radii<K, T>(tree: &[K], keys: &[K], ordering: &[usize], h: &[T], out: &mut [T])
where
    K: SfcKey,
    T: Copy + Default + PartialOrd + std::ops::Add<Output = T> + Send + Sync,
{
    assert_eq!(keys.len(), ordering.len());
    assert_eq!(out.len(), n_nodes(tree));

    out.par_iter_mut().enumerate().for_each(|(i, radius)| {
        let start = keys.partition_point(|&k| k < tree[i]);
        let end = keys.partition_point(|&k| k < tree[i + 1]);

        let mut h_max: Option<T> = None;
        for position in start..end {
            let h_i = h[ordering[position]];
            if h_max.map_or(true, |m| h_i > m) {
                h_max = Some(h_i);
            }
        }
        *radius = h_max.map_or_else(T::default, |m| m + m);
    });
}

/// Find all (assigned leaf, overlapping remote leaf) pairs for `rank`.
///
/// For every leaf assigned to `rank`, the leaf's halo box is traversed
/// through the internal view; overlapping leaves outside the rank's
/// assignment are reported. Leaves whose halo box stays inside the rank's
/// own key range are skipped without traversal.
pub fn find_halos<K: SfcKey>(
    tree: &[K],
    internal: &[BinaryNode<K>],
    radii: &[f64],
    bounds: &SimulationBox,
    assignment: &SpaceCurveAssignment<K>,
    rank: usize,
) -> Vec<(usize, usize)> {
    assert_eq!(radii.len(), n_nodes(tree));

    let node_ranges = compute_local_node_ranges(tree, assignment, rank);
    let lowest = tree[node_ranges.range_start(0)];
    let highest = tree[node_ranges.range_end(node_ranges.n_ranges() - 1)];

    let assigned: Vec<usize> = node_ranges.iter().flat_map(|(lo, hi)| lo..hi).collect();

    assigned
        .par_iter()
        .map(|&leaf| {
            let halo_box = make_halo_box(tree[leaf], tree[leaf + 1], radii[leaf], bounds);
            if contained_in(lowest, highest, &halo_box) {
                return Vec::new();
            }
            let mut collisions = Vec::new();
            find_collisions(internal, tree, &mut collisions, &halo_box);
            collisions
                .into_iter()
                .filter(|&c| !assignment.contains(rank, tree[c]))
                .map(|c| (leaf, c))
                .collect()
        })
        .flatten()
        .collect()
}

/// Sorted, unique remote leaf indices out of halo pairs: the incoming halo
/// node set.
pub fn incoming_halo_nodes(halo_pairs: &[(usize, usize)]) -> Vec<usize> {
    let mut nodes: Vec<usize> = halo_pairs.iter().map(|&(_, remote)| remote).collect();
    nodes.sort_unstable();
    nodes.dedup();
    nodes
}

/// Build the halo send list of `this_rank`: per peer, the local buffer
/// index ranges holding the particles the peer needs as halos.
///
/// What a peer needs is what its own halo discovery finds inside this
/// rank's assignment; running the discovery from the peer's perspective on
/// the replicated global data yields exactly that. Ranges are expressed in
/// `layout` offsets and coalesced where adjacent.
pub fn create_halo_send_list<K: SfcKey>(
    tree: &[K],
    radii: &[f64],
    bounds: &SimulationBox,
    assignment: &SpaceCurveAssignment<K>,
    layout: &ArrayLayout,
    this_rank: usize,
) -> SendList {
    let internal = create_internal_tree(tree);
    let mut send_list = SendList::new(assignment.n_ranks());

    for peer in 0..assignment.n_ranks() {
        if peer == this_rank {
            continue;
        }
        let pairs = find_halos(tree, &internal, radii, bounds, assignment, peer);
        let mut nodes: Vec<usize> = pairs
            .iter()
            .map(|&(_, remote)| remote)
            .filter(|&node| assignment.contains(this_rank, tree[node]))
            .collect();
        nodes.sort_unstable();
        nodes.dedup();

        let manifest = send_list.manifest_mut(peer);
        let mut run: Option<(usize, usize)> = None;
        for node in nodes {
            let start = layout.node_position(node);
            let end = start + layout.node_count(node);
            match run {
                Some((lo, hi)) if hi == start => run = Some((lo, end)),
                Some((lo, hi)) => {
                    manifest.add_range(lo, hi);
                    run = Some((start, end));
                }
                None => run = Some((start, end)),
            }
        }
        if let Some((lo, hi)) = run {
            manifest.add_range(lo, hi);
        }
    }
    send_list
}
