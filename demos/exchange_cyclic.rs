//! Cyclic neighbour exchange: every rank keeps most of its elements and
//! sends the tail to the next rank, with and without buffer offsets. Run
//! with any number of ranks.

use std::fmt::Debug;

use mpi::traits::{Communicator, CommunicatorCollectives, Equivalence};

use cornerstone::domain::SendList;
use cornerstone::exchange::{exchange_particles, exchange_particles_with_offsets};

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

fn exchange_cyclic_neighbors<T, C>(comm: &C, this_rank: usize, n_ranks: usize)
where
    T: FromIndex + Equivalence + Copy + PartialEq + Debug,
    C: CommunicatorCollectives,
{
    let grid_size = 64;
    let nex = 10;

    // x and y are filled with one value that is different on each rank
    let mut x = vec![T::from_index(this_rank as i64); grid_size];
    let mut y = vec![T::from_index(-(this_rank as i64)); grid_size];
    let ordering: Vec<usize> = (0..grid_size).collect();

    let next_rank = (this_rank + 1) % n_ranks;
    let mut send_list = SendList::new(n_ranks);
    // keep all but the last nex elements
    send_list.manifest_mut(this_rank).add_range(0, grid_size - nex);
    // send the last nex to the next rank
    send_list
        .manifest_mut(next_rank)
        .add_range(grid_size - nex, grid_size);

    exchange_particles(
        comm,
        &send_list,
        this_rank,
        grid_size,
        &ordering,
        &mut [&mut x[..], &mut y[..]],
    );

    let incoming_rank = ((this_rank + n_ranks - 1) % n_ranks) as i64;
    let mut ref_x = vec![T::from_index(this_rank as i64); grid_size];
    let mut ref_y = vec![T::from_index(-(this_rank as i64)); grid_size];
    for i in grid_size - nex..grid_size {
        ref_x[i] = T::from_index(incoming_rank);
        ref_y[i] = T::from_index(-incoming_rank);
    }

    assert_eq!(x, ref_x);
    assert_eq!(y, ref_y);
}

/// Offset variant: the input region starts one element in, the output
/// region two elements in, and the buffer tail stays untouched.
fn exchange_cyclic_neighbors_offsets<T, C>(comm: &C, this_rank: usize, n_ranks: usize)
where
    T: FromIndex + Equivalence + Copy + PartialEq + Debug,
    C: CommunicatorCollectives,
{
    let original_size = 65;
    let assigned_size = 64;
    let final_size = 70;

    let input_offset = 1;
    let output_offset = 2;

    let pollution = T::from_index(1_412_842_341);
    let filler = T::from_index(-7_777);

    let mut x = vec![T::from_index(this_rank as i64); original_size];
    let mut y = vec![T::from_index(-(this_rank as i64)); original_size];
    x[0] = pollution;
    y[0] = pollution;

    let ordering: Vec<usize> = (0..assigned_size).collect();

    let nex = 10;
    let next_rank = (this_rank + 1) % n_ranks;

    // send list indices count from the input offset, not the array start
    let mut send_list = SendList::new(n_ranks);
    send_list
        .manifest_mut(this_rank)
        .add_range(0, assigned_size - nex);
    send_list
        .manifest_mut(next_rank)
        .add_range(assigned_size - nex, assigned_size);

    x.resize(final_size, filler);
    y.resize(final_size, filler);
    exchange_particles_with_offsets(
        comm,
        &send_list,
        this_rank,
        assigned_size,
        input_offset,
        output_offset,
        &ordering,
        &mut [&mut x[..], &mut y[..]],
    );

    // the reference covers only the assigned range
    let incoming_rank = ((this_rank + n_ranks - 1) % n_ranks) as i64;
    let mut ref_x = vec![T::from_index(this_rank as i64); assigned_size];
    let mut ref_y = vec![T::from_index(-(this_rank as i64)); assigned_size];
    for i in assigned_size - nex..assigned_size {
        ref_x[i] = T::from_index(incoming_rank);
        ref_y[i] = T::from_index(-incoming_rank);
    }

    assert_eq!(x.len(), final_size);
    assert_eq!(y.len(), final_size);

    // positions before the output offset are untouched
    assert_eq!(x[0], pollution);
    assert_eq!(y[0], pollution);
    assert_eq!(x[1], T::from_index(this_rank as i64));

    for i in 0..assigned_size {
        assert_eq!(x[i + output_offset], ref_x[i]);
        assert_eq!(y[i + output_offset], ref_y[i]);
    }

    // positions past the output region are untouched
    for i in output_offset + assigned_size..final_size {
        assert_eq!(x[i], filler);
        assert_eq!(y[i], filler);
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let rank = world.rank() as usize;
    let n_ranks = world.size() as usize;

    exchange_cyclic_neighbors::<f64, _>(&world, rank, n_ranks);
    exchange_cyclic_neighbors::<f32, _>(&world, rank, n_ranks);
    exchange_cyclic_neighbors::<i32, _>(&world, rank, n_ranks);

    exchange_cyclic_neighbors_offsets::<f64, _>(&world, rank, n_ranks);
    exchange_cyclic_neighbors_offsets::<f32, _>(&world, rank, n_ranks);
    exchange_cyclic_neighbors_offsets::<i32, _>(&world, rank, n_ranks);

    if rank == 0 {
        println!("cyclic neighbour exchange passed on {n_ranks} ranks");
    }
}
