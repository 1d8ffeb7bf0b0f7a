//! Internal binary radix view of a cornerstone tree.
//!
//! The cornerstone format stores leaves only. For halo search we overlay a
//! binary radix tree built from the longest common prefixes of the sorted
//! leaf start keys, one internal node per leaf minus one. The overlay
//! borrows the cornerstone keys and is rebuilt whenever the tree changes.
//!
//! Every node, internal or leaf, corresponds to a key prefix and therefore
//! to an axis-aligned cell of the integer grid, so a depth-first traversal
//! can prune whole subtrees against a halo box in `O(log n)`.

use crate::geometry::{overlap, overlap_prefix, IBox};
use crate::sfc::SfcKey;

/// Link to a child of a binary radix node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryChild {
    /// Index of another internal node.
    Internal(usize),
    /// Index of a cornerstone leaf.
    Leaf(usize),
}

/// One node of the binary radix overlay.
#[derive(Clone, Copy, Debug)]
pub struct BinaryNode<K> {
    /// Common key prefix of all leaves below this node, padded with zeros.
    pub prefix: K,
    /// Number of significant bits in `prefix`.
    pub prefix_bits: u32,
    /// Subtree covering the lower key range.
    pub left: BinaryChild,
    /// Subtree covering the upper key range.
    pub right: BinaryChild,
}

/// Longest common prefix of the keys at `i` and `j`, or -1 if `j` is out of
/// range. This is the delta function of the radix tree construction.
fn delta<K: SfcKey>(codes: &[K], i: usize, j: i64) -> i64 {
    if j < 0 || j >= codes.len() as i64 {
        return -1;
    }
    K::common_prefix(codes[i], codes[j as usize]) as i64
}

/// Construct one internal node; standard radix-tree-from-sorted-keys
/// construction.
fn construct_internal_node<K: SfcKey>(codes: &[K], idx: usize) -> BinaryNode<K> {
    let i = idx as i64;

    // direction of the node's key range: towards the neighbour with the
    // longer common prefix
    let d: i64 = if idx == 0 || delta(codes, idx, i + 1) > delta(codes, idx, i - 1) {
        1
    } else {
        -1
    };
    let delta_min = delta(codes, idx, i - d);

    // exponential search for the range length upper bound
    let mut length_max = 2i64;
    while delta(codes, idx, i + length_max * d) > delta_min {
        length_max *= 2;
    }

    // binary search the exact range length
    let mut length = 0i64;
    let mut t = length_max / 2;
    while t >= 1 {
        if delta(codes, idx, i + (length + t) * d) > delta_min {
            length += t;
        }
        t /= 2;
    }
    let j = i + length * d;
    let delta_node = delta(codes, idx, j);

    // binary search the split position
    let mut s = 0i64;
    let mut t = length;
    while t > 1 {
        t = (t + 1) / 2;
        if delta(codes, idx, i + (s + t) * d) > delta_node {
            s += t;
        }
    }
    let gamma = i + s * d + d.min(0);

    let lower = i.min(j);
    let upper = i.max(j);
    let left = if lower == gamma {
        BinaryChild::Leaf(gamma as usize)
    } else {
        BinaryChild::Internal(gamma as usize)
    };
    let right = if upper == gamma + 1 {
        BinaryChild::Leaf((gamma + 1) as usize)
    } else {
        BinaryChild::Internal((gamma + 1) as usize)
    };

    let prefix_bits = delta_node as u32;
    let mask = if prefix_bits == 0 {
        0
    } else {
        !0u64 << (64 - prefix_bits - (64 - 3 * K::MAX_LEVEL))
    };
    BinaryNode {
        prefix: K::from_u64(codes[idx].to_u64() & mask),
        prefix_bits,
        left,
        right,
    }
}

/// Build the internal view over a cornerstone tree.
///
/// `tree` is the full key sequence including the sentinel; the overlay is
/// constructed over the leaf start keys and has `n_nodes - 1` entries, with
/// the root at index 0. A root-only tree yields an empty overlay.
pub fn create_internal_tree<K: SfcKey>(tree: &[K]) -> Vec<BinaryNode<K>> {
    let codes = &tree[..tree.len() - 1];
    if codes.len() < 2 {
        return Vec::new();
    }
    (0..codes.len() - 1)
        .map(|idx| construct_internal_node(codes, idx))
        .collect()
}

fn leaf_overlap<K: SfcKey>(leaf: usize, tree: &[K], halo_box: &IBox) -> bool {
    overlap(tree[leaf], tree[leaf + 1], halo_box)
}

fn traverse<K: SfcKey>(
    internal: &[BinaryNode<K>],
    tree: &[K],
    node: usize,
    collisions: &mut Vec<usize>,
    halo_box: &IBox,
) {
    let entry = &internal[node];
    if !overlap_prefix(entry.prefix, entry.prefix_bits, halo_box) {
        return;
    }
    for child in [entry.left, entry.right] {
        match child {
            BinaryChild::Leaf(leaf) => {
                if leaf_overlap(leaf, tree, halo_box) {
                    collisions.push(leaf);
                }
            }
            BinaryChild::Internal(next) => {
                traverse(internal, tree, next, collisions, halo_box);
            }
        }
    }
}

/// Append the indices of all leaves of `tree` that overlap `halo_box`.
///
/// `internal` must be the overlay of `tree` from [`create_internal_tree`].
pub fn find_collisions<K: SfcKey>(
    internal: &[BinaryNode<K>],
    tree: &[K],
    collisions: &mut Vec<usize>,
    halo_box: &IBox,
) {
    if internal.is_empty() {
        if leaf_overlap(0, tree, halo_box) {
            collisions.push(0);
        }
        return;
    }
    traverse(internal, tree, 0, collisions, halo_box);
}

/// Exponentially expanding bracket around `guess` for a lower-bound search
/// of `target` in sorted `keys`.
///
/// Returns `(lo, hi)` with `keys[lo] < target` (unless `lo` is 0) and the
/// lower-bound position of `target` inside `[lo, hi]`, so a subsequent
/// binary search only touches the bracket. Out-of-range guesses are
/// clamped. Cheap when the guess is close to the target's position.
pub fn find_search_bounds<K: SfcKey>(guess: i64, target: K, keys: &[K]) -> (usize, usize) {
    if keys.is_empty() {
        return (0, 0);
    }
    let n = keys.len();
    let guess = guess.clamp(0, n as i64 - 1) as usize;

    if keys[guess] < target {
        // search upward for an upper bracket; the guess is the lower one
        let mut step = 1;
        loop {
            let probe = guess + step;
            if probe >= n {
                return (guess, n);
            }
            if keys[probe] <= target {
                step *= 2;
            } else {
                return (guess, probe);
            }
        }
    }

    // keys[guess] >= target: search downward; an exact hit at the guess
    // must stay inside the bracket
    let anchor = if keys[guess] == target { guess + 1 } else { guess };
    let mut step = 1;
    loop {
        if step >= anchor {
            return (0, anchor);
        }
        let probe = anchor - step;
        if keys[probe] >= target {
            step *= 2;
        } else {
            return (probe, anchor);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sfc::SfcKey;
    use crate::tree::{n_nodes, OctreeMaker};

    #[test]
    fn search_bounds_brackets() {
        //                      0   1   2   3   4   5   6   7   8   9
        let keys: Vec<u32> = vec![3, 10, 11, 14, 16, 16, 16, 18, 19, 21];

        // upward search direction, guess distance from target: 0
        assert_eq!(find_search_bounds(3, 14, &keys), (2, 4));
        // upward search direction, guess distance from target: 1
        assert_eq!(find_search_bounds(3, 15, &keys), (3, 4));
        assert_eq!(find_search_bounds(3, 16, &keys), (3, 7));
        // upward search direction, guess distance from target: 6
        assert_eq!(find_search_bounds(0, 17, &keys), (0, 8));
        // downward search direction
        assert_eq!(find_search_bounds(4, 12, &keys), (2, 4));
        assert_eq!(find_search_bounds(4, 11, &keys), (0, 4));
        assert_eq!(find_search_bounds(4, 10, &keys), (0, 4));
        assert_eq!(find_search_bounds(8, 16, &keys), (0, 8));
        assert_eq!(find_search_bounds(6, 16, &keys), (3, 7));
        // direct hit on the last element
        assert_eq!(find_search_bounds(9, 21, &keys), (8, 10));
        // must tolerate an out-of-bounds guess
        assert_eq!(find_search_bounds(12, 16, &keys), (1, 9));
    }

    #[test]
    fn search_bounds_contain_lower_bound() {
        let keys: Vec<u64> = vec![3, 10, 11, 14, 16, 16, 16, 18, 19, 21];
        for guess in 0..keys.len() as i64 {
            for target in 0..25u64 {
                let (lo, hi) = find_search_bounds(guess, target, &keys);
                let reference = keys.partition_point(|&k| k < target);
                let probe = lo + keys[lo..hi].partition_point(|&k| k < target);
                assert_eq!(probe, reference, "guess {guess} target {target}");
            }
        }
    }

    fn radix_tree_structure<K: SfcKey>() {
        let tree: Vec<K> = OctreeMaker::new().divide(&[]).make();
        let internal = create_internal_tree(&tree);
        assert_eq!(internal.len(), n_nodes(&tree) - 1);

        // the root covers the whole key range with an empty prefix
        assert_eq!(internal[0].prefix_bits, 0);
        assert_eq!(internal[0].prefix, K::zero());

        // each leaf is referenced exactly once
        let mut seen = vec![0usize; n_nodes(&tree)];
        for node in &internal {
            for child in [node.left, node.right] {
                if let BinaryChild::Leaf(leaf) = child {
                    seen[leaf] += 1;
                }
            }
        }
        assert!(seen.iter().all(|&s| s == 1));
    }

    #[test]
    fn radix_tree_structure_32() {
        radix_tree_structure::<u32>();
    }

    #[test]
    fn radix_tree_structure_64() {
        radix_tree_structure::<u64>();
    }

    /// A halo box extending one cell in +x from a level-1 node collides with
    /// the expected level-1, level-2 and level-3 leaves.
    fn collisions_level1_halo<K: SfcKey>() {
        let tree: Vec<K> = OctreeMaker::new()
            .divide(&[])
            .divide(&[0])
            .divide(&[0, 7])
            .make();
        let internal = create_internal_tree(&tree);

        let r = 1i64 << (K::MAX_LEVEL - 1);
        let halo_box = IBox::new(r - 1, 2 * r, 0, r, 0, r);

        let mut collisions = Vec::new();
        find_collisions(&internal, &tree, &mut collisions, &halo_box);

        let mut colliding_keys: Vec<K> = collisions.iter().map(|&i| tree[i]).collect();
        colliding_keys.sort_unstable();

        let reference: Vec<K> = vec![
            K::pad(K::from_u64(0o004), 6),
            K::pad(K::from_u64(0o005), 6),
            K::pad(K::from_u64(0o006), 6),
            K::pad(K::from_u64(0o0074), 9),
            K::pad(K::from_u64(0o0075), 9),
            K::pad(K::from_u64(0o0076), 9),
            K::pad(K::from_u64(0o0077), 9),
            K::pad(K::from_u64(0o4), 3),
        ];
        assert_eq!(colliding_keys, reference);
    }

    #[test]
    fn collisions_level1_halo_32() {
        collisions_level1_halo::<u32>();
    }

    #[test]
    fn collisions_level1_halo_64() {
        collisions_level1_halo::<u64>();
    }

    /// An anisotropic halo box reaching two cells in +x hits leaves beyond
    /// the immediate neighbour.
    fn collisions_anisotropic<K: SfcKey>() {
        // uniform tree with 64 level-2 leaves
        let mut maker = OctreeMaker::<K>::new().divide(&[]);
        for octant in 0..8 {
            maker = maker.divide(&[octant]);
        }
        let tree = maker.make();
        assert_eq!(n_nodes(&tree), 64);
        let internal = create_internal_tree(&tree);

        let r = 1i64 << (K::MAX_LEVEL - 2);
        let query = 7;
        let halo_box =
            crate::geometry::make_halo_box_grid(tree[query], tree[query + 1], 2 * r, 0, 0);

        let mut collisions = Vec::new();
        find_collisions(&internal, &tree, &mut collisions, &halo_box);
        collisions.sort_unstable();

        assert_eq!(collisions, vec![3, 7, 35, 39]);
    }

    #[test]
    fn collisions_anisotropic_32() {
        collisions_anisotropic::<u32>();
    }

    #[test]
    fn collisions_anisotropic_64() {
        collisions_anisotropic::<u64>();
    }

    #[test]
    fn collisions_root_only_tree() {
        let tree: Vec<u64> = crate::tree::make_root_node_tree();
        let internal = create_internal_tree(&tree);
        assert!(internal.is_empty());

        let mut collisions = Vec::new();
        find_collisions(&internal, &tree, &mut collisions, &IBox::new(0, 1, 0, 1, 0, 1));
        assert_eq!(collisions, vec![0]);
    }
}
