//! All-to-all particle exchange: every rank keeps one segment of its
//! elements and sends one segment to each other rank, through a nontrivial
//! ordering. Run with any number of ranks.

use std::fmt::Debug;

use mpi::traits::{Communicator, CommunicatorCollectives, Equivalence};

use cornerstone::domain::SendList;
use cornerstone::exchange::exchange_particles;

trait FromIndex: Copy {
    fn from_index(i: i64) -> Self;
}

impl FromIndex for f64 {
    fn from_index(i: i64) -> Self {
        i as f64
    }
}

impl FromIndex for f32 {
    fn from_index(i: i64) -> Self {
        i as f32
    }
}

impl FromIndex for i32 {
    fn from_index(i: i64) -> Self {
        i as i32
    }
}

fn exchange_all_to_all<T, C>(comm: &C, this_rank: usize, n_ranks: usize)
where
    T: FromIndex + Equivalence + Copy + PartialEq + PartialOrd + Debug,
    C: CommunicatorCollectives,
{
    let grid_size = 64i64;

    let mut x: Vec<T> = (0..grid_size).map(T::from_index).collect();
    // unique element id across all ranks
    let mut y: Vec<T> = (0..grid_size)
        .map(|i| T::from_index(i + grid_size * this_rank as i64))
        .collect();
    let mut ordering: Vec<usize> = (0..grid_size as usize).collect();

    // A simple but nontrivial ordering: the coordinate arrays are not
    // sorted in the order for which the send list index ranges are valid.
    x.swap(0, grid_size as usize - 1);
    y.swap(0, grid_size as usize - 1);
    ordering.swap(0, grid_size as usize - 1);

    let segment_size = grid_size as usize / n_ranks;
    let mut send_list = SendList::new(n_ranks);
    for peer in 0..n_ranks {
        let lower = peer * segment_size;
        let mut upper = lower + segment_size;
        if peer == n_ranks - 1 {
            upper += grid_size as usize % n_ranks;
        }
        send_list.manifest_mut(peer).add_range(lower, upper);
    }

    // there is only one range per peer
    let segment_size = send_list.count(this_rank);
    let n_particles_this_rank = segment_size * n_ranks;

    x.resize(n_particles_this_rank.max(x.len()), T::from_index(0));
    y.resize(n_particles_this_rank.max(y.len()), T::from_index(0));
    exchange_particles(
        comm,
        &send_list,
        this_rank,
        n_particles_this_rank,
        &ordering,
        &mut [&mut x[..], &mut y[..]],
    );
    x.truncate(n_particles_this_rank);
    y.truncate(n_particles_this_rank);

    // every peer contributes the same x segment
    let own_start = send_list.manifest(this_rank).range_start(0) as i64;
    let mut ref_x = Vec::with_capacity(n_particles_this_rank);
    for _ in 0..n_ranks {
        ref_x.extend((own_start..own_start + segment_size as i64).map(T::from_index));
    }

    // the y ids of this rank's segment as held by each sender
    let mut ref_y = Vec::with_capacity(n_particles_this_rank);
    for sender in 0..n_ranks as i64 {
        let seq_start = sender * grid_size + (grid_size / n_ranks as i64) * this_rank as i64;
        ref_y.extend((seq_start..seq_start + segment_size as i64).map(T::from_index));
    }

    // received particles arrive in indeterminate order across peers
    y.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap());

    assert_eq!(x, ref_x);
    assert_eq!(y, ref_y);
}

fn main() {
    tracing_subscriber::fmt::init();

    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let rank = world.rank() as usize;
    let n_ranks = world.size() as usize;

    exchange_all_to_all::<f64, _>(&world, rank, n_ranks);
    exchange_all_to_all::<f32, _>(&world, rank, n_ranks);
    exchange_all_to_all::<i32, _>(&world, rank, n_ranks);

    if rank == 0 {
        println!("all-to-all exchange passed on {n_ranks} ranks");
    }
}
