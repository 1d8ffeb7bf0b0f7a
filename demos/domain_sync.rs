//! Full domain synchronization step across all ranks: global tree build,
//! SFC assignment, particle exchange, halo discovery, buffer layout and
//! focused tree, with consistency checks at every stage. Run with any
//! number of ranks.

use mpi::traits::Communicator;

use cornerstone::btree::create_internal_tree;
use cornerstone::domain::single_range_sfc_split;
use cornerstone::exchange::exchange_particles;
use cornerstone::focus::FocusedTree;
use cornerstone::geometry::SimulationBox;
use cornerstone::halos::{create_halo_send_list, find_halos, incoming_halo_nodes};
use cornerstone::layout::{compute_layout, compute_local_node_ranges};
use cornerstone::tools::{gather_to_all, generate_gaussian_keys, seeded_rng};
use cornerstone::tree::{check_octree_invariants, compute_octree_global, n_nodes};

type Key = u64;

const BUCKET_SIZE: u32 = 64;
const PARTICLES_PER_RANK: usize = 20_000;

fn main() {
    tracing_subscriber::fmt::init();

    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let rank = world.rank() as usize;
    let n_ranks = world.size() as usize;

    let bounds = SimulationBox::cube(0.0, 1.0, false);
    let mut rng = seeded_rng(rank as u64);
    let mut keys: Vec<Key> = generate_gaussian_keys(PARTICLES_PER_RANK, &mut rng);

    // globally consistent tree and counts
    let (tree, counts) = compute_octree_global(&keys, BUCKET_SIZE, &world);
    assert!(check_octree_invariants(&tree));
    let global_count: usize = counts.iter().map(|&c| c as usize).sum();
    assert_eq!(global_count, PARTICLES_PER_RANK * n_ranks);

    // balanced single-range assignment
    let assignment = single_range_sfc_split(&tree, &counts, n_ranks);
    let assigned_total: usize = (0..n_ranks).map(|r| assignment.count(r)).sum();
    assert_eq!(assigned_total, global_count);

    // move every particle to its owner; the keys themselves are the payload
    let send_list = cornerstone::domain::create_send_list(&assignment, &keys);
    let total_after = assignment.count(rank);
    let ordering: Vec<usize> = (0..keys.len()).collect();
    keys.resize(total_after.max(keys.len()), 0);
    exchange_particles(
        &world,
        &send_list,
        rank,
        total_after,
        &ordering,
        &mut [&mut keys[..]],
    );
    keys.truncate(total_after);
    keys.sort_unstable();

    // every particle now lies in the rank's own SFC range
    let own = assignment.ranges(rank)[0];
    assert!(keys.iter().all(|&k| own.start <= k && k < own.end));

    // halo discovery against a uniform interaction radius
    let radius = 2.0 * 0.02;
    let radii = vec![radius; n_nodes(&tree)];
    let internal = create_internal_tree(&tree);
    let halo_pairs = find_halos(&tree, &internal, &radii, &bounds, &assignment, rank);
    let halo_nodes = incoming_halo_nodes(&halo_pairs);
    for &node in &halo_nodes {
        assert!(!assignment.contains(rank, tree[node]));
    }

    // buffer layout: assigned leaves plus incoming halos
    let local_nodes = compute_local_node_ranges(&tree, &assignment, rank);
    let layout = compute_layout(&local_nodes, halo_nodes.clone(), &counts);
    assert_eq!(layout.local_count(), total_after);
    let halo_particle_count: usize = halo_nodes
        .iter()
        .map(|&node| counts[node] as usize)
        .sum();
    assert_eq!(layout.total_size(), total_after + halo_particle_count);

    // what this rank sends to each peer must equal what the peer expects
    // to receive from this rank
    let halo_send_list = create_halo_send_list(&tree, &radii, &bounds, &assignment, &layout, rank);
    let send_counts: Vec<i32> = (0..n_ranks).map(|p| halo_send_list.count(p) as i32).collect();
    let all_send_counts = gather_to_all(&send_counts, &world);
    for peer in 0..n_ranks {
        if peer == rank {
            continue;
        }
        let expected_from_peer: usize = halo_nodes
            .iter()
            .filter(|&&node| assignment.contains(peer, tree[node]))
            .map(|&node| counts[node] as usize)
            .sum();
        assert_eq!(
            all_send_counts[peer * n_ranks + rank] as usize,
            expected_from_peer,
            "peer {peer} sends a different count than rank {rank} expects"
        );
    }

    // the focused tree resolves the rank's own domain exactly like the
    // global tree; counts must be globally correct for the comparison, so
    // converge it against the gathered key set
    let mut all_keys = gather_to_all(&keys, &world);
    all_keys.sort_unstable();
    let mut focused = FocusedTree::<Key>::new(BUCKET_SIZE, 1.0);
    focused.converge(&bounds, &all_keys, own.start, own.end);
    assert!(check_octree_invariants(focused.tree_leaves()));

    let global_first = tree.partition_point(|&k| k < own.start);
    let global_last = tree.partition_point(|&k| k < own.end);
    let (focus_first, focus_last) = focused.focus_node_range();
    assert_eq!(
        &tree[global_first..global_last],
        &focused.tree_leaves()[focus_first..focus_last],
        "focused tree deviates from the global tree inside the focus"
    );

    if rank == 0 {
        println!(
            "domain sync passed on {n_ranks} ranks: {} tree leaves, {} focus leaves",
            n_nodes(&tree),
            n_nodes(focused.tree_leaves()),
        );
    }
}
