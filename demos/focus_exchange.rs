//! Focus-count exchange: every rank owns a slice of a uniform level-2 tree
//! and requests per-node particle counts for the other slices from their
//! owners. Run with a rank count that divides 64.

use mpi::traits::Communicator;

use cornerstone::focus_exchange::exchange_focus_counts;
use cornerstone::tree::{n_nodes, OctreeMaker};

fn main() {
    tracing_subscriber::fmt::init();

    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let rank = world.rank() as usize;
    let n_ranks = world.size() as usize;

    // every rank resolves the same uniform tree, so request node
    // structures always align with the counting rank's leaves
    let mut maker = OctreeMaker::<u64>::new().divide(&[]);
    for octant in 0..8 {
        maker = maker.divide(&[octant]);
    }
    let focus_leaves = maker.make();
    let num_leaves = n_nodes(&focus_leaves);
    assert!(
        num_leaves % n_ranks == 0,
        "run with a rank count that divides {num_leaves}"
    );

    let chunk = num_leaves / n_ranks;
    let own_range = (rank * chunk, (rank + 1) * chunk);

    // rank r holds r + 1 particles in each of its own leaves
    let mut focus_counts = vec![0u32; num_leaves];
    for count in &mut focus_counts[own_range.0..own_range.1] {
        *count = rank as u32 + 1;
    }

    let peer_ranks: Vec<usize> = (0..n_ranks).filter(|&p| p != rank).collect();
    let exchange_indices: Vec<(usize, usize)> = peer_ranks
        .iter()
        .map(|&p| (p * chunk, (p + 1) * chunk))
        .collect();

    exchange_focus_counts(
        &world,
        &peer_ranks,
        &exchange_indices,
        &focus_leaves,
        &mut focus_counts,
    );

    // every leaf now carries its owner's count
    for (leaf, &count) in focus_counts.iter().enumerate() {
        let owner = leaf / chunk;
        assert_eq!(count, owner as u32 + 1, "leaf {leaf} has the wrong count");
    }
    let expected_total: u32 = (1..=n_ranks as u32).map(|c| c * chunk as u32).sum();
    assert_eq!(focus_counts.iter().sum::<u32>(), expected_total);

    if rank == 0 {
        println!("focus count exchange passed on {n_ranks} ranks");
    }
}
