//! Peer count exchange for focused trees.
//!
//! A rank cannot count particles for focus-tree leaves outside its own
//! assignment. Instead it sends, per peer, the sub-sequence of its focus
//! tree keys covering that peer's domain (tag 0); the peer counts particles
//! for every requested node from its own leaf counts and replies with the
//! per-node counts (tag 1). The requested node structure never exceeds the
//! resolution of the peer's own tree as long as all ranks use the same
//! bucket size, so the counts are exact.

use mpi::traits::{Communicator, CommunicatorCollectives, Destination, Source};
use rayon::prelude::*;

use crate::constants::{TAG_REPLY, TAG_REQUEST};
use crate::sfc::SfcKey;

/// Count particles per requested node from local leaf counts.
///
/// `leaves` and `counts` describe the local tree (keys with sentinel,
/// counts per leaf); `request_leaves` holds `request_counts.len() + 1`
/// keys, one node per adjacent pair. Requested nodes must align with local
/// leaf boundaries.
pub fn count_focus_particles<K: SfcKey>(
    leaves: &[K],
    counts: &[u32],
    request_leaves: &[K],
    request_counts: &mut [u32],
) {
    assert_eq!(request_leaves.len(), request_counts.len() + 1);

    request_counts
        .par_iter_mut()
        .enumerate()
        .for_each(|(i, request_count)| {
            let start = leaves.partition_point(|&k| k < request_leaves[i]);
            let end = leaves.partition_point(|&k| k < request_leaves[i + 1]);
            *request_count = counts[start..end.min(counts.len())].iter().sum();
        });
}

/// One round of the focus-count exchange.
///
/// `peer_ranks` are the ranks whose domains intersect leaves of the local
/// focus tree outside the focus; `exchange_indices[i]` is the half-open
/// leaf index range of the focus tree covered by peer `i`'s domain. The
/// counts of those leaves are overwritten with the peers' replies; all
/// other entries of `focus_counts` are left alone.
///
/// Collective over the whole communicator: every rank must enter with
/// mutually consistent peer lists. A barrier closes the round.
pub fn exchange_focus_counts<K, C>(
    comm: &C,
    peer_ranks: &[usize],
    exchange_indices: &[(usize, usize)],
    focus_leaves: &[K],
    focus_counts: &mut [u32],
) where
    K: SfcKey,
    C: CommunicatorCollectives,
{
    assert_eq!(peer_ranks.len(), exchange_indices.len());

    mpi::request::scope(|scope| {
        let mut requests = Vec::new();
        for (&peer, &(start, end)) in peer_ranks.iter().zip(exchange_indices) {
            // one extra key bounds the last node of the request
            requests.push(
                comm.process_at_rank(peer as i32)
                    .immediate_send_with_tag(scope, &focus_leaves[start..=end], TAG_REQUEST),
            );
        }

        // answer the node structures the peers request from us
        for _ in 0..peer_ranks.len() {
            let (message, status) = comm.any_process().matched_probe_with_tag(TAG_REQUEST);
            let (request_leaves, _): (Vec<K>, _) = message.matched_receive_vec();

            let mut reply = vec![0u32; request_leaves.len() - 1];
            count_focus_particles(focus_leaves, focus_counts, &request_leaves, &mut reply);
            comm.process_at_rank(status.source_rank())
                .send_with_tag(&reply[..], TAG_REPLY);
        }

        // collect the answers to our own requests
        for _ in 0..peer_ranks.len() {
            let (message, status) = comm.any_process().matched_probe_with_tag(TAG_REPLY);
            let (reply, _): (Vec<u32>, _) = message.matched_receive_vec();

            let peer_index = peer_ranks
                .iter()
                .position(|&p| p == status.source_rank() as usize)
                .expect("reply from a rank that was not asked");
            let (start, end) = exchange_indices[peer_index];
            assert_eq!(reply.len(), end - start, "reply does not match the request");
            focus_counts[start..end].copy_from_slice(&reply);
        }

        for request in requests {
            request.wait();
        }
    });
    comm.barrier();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::{n_nodes, OctreeMaker};

    #[test]
    fn count_requested_nodes() {
        // local tree fully resolved at level 2 under octant 0
        let leaves: Vec<u64> = OctreeMaker::new().divide(&[]).divide(&[0]).make();
        let counts: Vec<u32> = (0..n_nodes(&leaves) as u32).collect();

        // the peer sees octant 0 as a single node and octants 1-2 resolved
        let request_leaves: Vec<u64> = vec![
            0,
            u64::pad(1, 3),
            u64::pad(2, 3),
            u64::pad(3, 3),
        ];
        let mut request_counts = vec![0u32; 3];
        count_focus_particles(&leaves, &counts, &request_leaves, &mut request_counts);

        // octant 0 aggregates its eight level-2 children
        assert_eq!(request_counts[0], (0..8).sum::<u32>());
        assert_eq!(request_counts[1], 8);
        assert_eq!(request_counts[2], 9);
    }

    #[test]
    fn count_whole_range() {
        let leaves: Vec<u64> = OctreeMaker::new().divide(&[]).make();
        let counts = vec![3u32; 8];

        let request_leaves: Vec<u64> = vec![0, u64::node_range(0)];
        let mut request_counts = vec![0u32];
        count_focus_particles(&leaves, &counts, &request_leaves, &mut request_counts);
        assert_eq!(request_counts[0], 24);
    }
}
