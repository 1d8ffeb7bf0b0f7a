//! Peer-to-peer particle exchange.
//!
//! After a new assignment, every rank sends the particles that now belong
//! to other ranks and receives its own from wherever they currently live.
//! Outgoing elements are gathered through a caller-supplied ordering (the
//! permutation that sorts the arrays by SFC key), so the index ranges of
//! the send list always refer to SFC-sorted positions regardless of the
//! physical array order.
//!
//! All sends are posted asynchronously up front; receives are matched by
//! probing, so no size negotiation round is needed. Within one peer's
//! contribution the element order is preserved; the order across peers is
//! unspecified.

use mpi::traits::{Communicator, CommunicatorCollectives, Destination, Equivalence, Source};
use tracing::debug;

use crate::constants::TAG_REQUEST;
use crate::domain::SendList;

/// Exchange particles according to `send_list`, without buffer offsets.
///
/// See [`exchange_particles_with_offsets`].
pub fn exchange_particles<T, C>(
    comm: &C,
    send_list: &SendList,
    this_rank: usize,
    total_after: usize,
    ordering: &[usize],
    buffers: &mut [&mut [T]],
) where
    T: Equivalence + Copy,
    C: CommunicatorCollectives,
{
    exchange_particles_with_offsets(comm, send_list, this_rank, total_after, 0, 0, ordering, buffers);
}

/// Exchange particles according to `send_list`.
///
/// For every peer rank, the elements at positions `input_offset +
/// ordering[idx]` for each `idx` in the peer's ranges are gathered and
/// sent; the kept local elements (this rank's own ranges) are placed at the
/// start of the output region, followed by all received contributions. The
/// output region is `[output_offset, output_offset + total_after)` in every
/// buffer; positions outside it are left untouched.
///
/// Every buffer participates identically; callers pass one call per scalar
/// type. `total_after` must equal the kept count plus the sum of all
/// incoming counts; a mismatch indicates an inconsistent layout and is
/// fatal.
#[allow(clippy::too_many_arguments)]
pub fn exchange_particles_with_offsets<T, C>(
    comm: &C,
    send_list: &SendList,
    this_rank: usize,
    total_after: usize,
    input_offset: usize,
    output_offset: usize,
    ordering: &[usize],
    buffers: &mut [&mut [T]],
) where
    T: Equivalence + Copy,
    C: CommunicatorCollectives,
{
    let n_buffers = buffers.len();
    assert!(n_buffers > 0);
    let n_ranks = send_list.n_ranks();
    assert_eq!(n_ranks, comm.size() as usize);

    // gather all outgoing payloads before anything is overwritten; one
    // message per peer, the columns of all buffers concatenated
    let mut send_buffers: Vec<Vec<T>> = vec![Vec::new(); n_ranks];
    for (peer, payload) in send_buffers.iter_mut().enumerate() {
        if peer == this_rank {
            continue;
        }
        let count = send_list.count(peer);
        if count == 0 {
            continue;
        }
        payload.reserve(count * n_buffers);
        for buffer in buffers.iter() {
            for (lo, hi) in send_list.manifest(peer).iter() {
                for idx in lo..hi {
                    payload.push(buffer[input_offset + ordering[idx]]);
                }
            }
        }
    }

    // gather the kept elements, one column per buffer
    let keep = send_list.manifest(this_rank);
    let kept_count = keep.total_count();
    assert!(kept_count <= total_after);
    let kept: Vec<Vec<T>> = buffers
        .iter()
        .map(|buffer| {
            keep.iter()
                .flat_map(|(lo, hi)| lo..hi)
                .map(|idx| buffer[input_offset + ordering[idx]])
                .collect()
        })
        .collect();

    mpi::request::scope(|scope| {
        let mut requests = Vec::new();
        for (peer, payload) in send_buffers.iter().enumerate() {
            if payload.is_empty() {
                continue;
            }
            debug!(peer, count = payload.len() / n_buffers, "sending particles");
            requests.push(
                comm.process_at_rank(peer as i32)
                    .immediate_send_with_tag(scope, &payload[..], TAG_REQUEST),
            );
        }

        // kept elements go first in the output region
        for (buffer, column) in buffers.iter_mut().zip(&kept) {
            buffer[output_offset..output_offset + kept_count].copy_from_slice(column);
        }

        // append peer contributions as they arrive until the assigned
        // count is reached
        let mut filled = kept_count;
        while filled < total_after {
            let (message, status) = comm.any_process().matched_probe_with_tag(TAG_REQUEST);
            let (payload, _): (Vec<T>, _) = message.matched_receive_vec();
            assert_eq!(
                payload.len() % n_buffers,
                0,
                "payload size does not match the buffer count"
            );
            let count = payload.len() / n_buffers;
            assert!(
                filled + count <= total_after,
                "received more particles than the layout has room for"
            );
            debug!(
                peer = status.source_rank(),
                count, "received particles"
            );
            for (b, buffer) in buffers.iter_mut().enumerate() {
                buffer[output_offset + filled..output_offset + filled + count]
                    .copy_from_slice(&payload[b * count..(b + 1) * count]);
            }
            filled += count;
        }

        for request in requests {
            request.wait();
        }
    });
    comm.barrier();
}
