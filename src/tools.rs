//! Utility routines: seeded randomness for tests and demos, and small MPI
//! gather helpers used to verify distributed results.

use mpi::collective::SystemOperation;
use mpi::datatype::PartitionMut;
use mpi::traits::{CommunicatorCollectives, Equivalence, Root};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::geometry::SimulationBox;
use crate::sfc::{key_from_position, SfcKey};

/// Cubic bounding box of a point set distributed across all ranks.
///
/// The box is centered on the points and padded by one deepest-level cell
/// diameter so that no particle sits exactly on the upper faces.
pub fn global_bounding_box<K: SfcKey, C: CommunicatorCollectives>(
    points: &[[f64; 3]],
    comm: &C,
) -> SimulationBox {
    let mut local_min = [f64::MAX; 3];
    let mut local_max = [f64::MIN; 3];
    for point in points {
        for axis in 0..3 {
            local_min[axis] = f64::min(local_min[axis], point[axis]);
            local_max[axis] = f64::max(local_max[axis], point[axis]);
        }
    }

    let mut global_min = [0.0; 3];
    let mut global_max = [0.0; 3];
    comm.all_reduce_into(&local_min[..], &mut global_min[..], SystemOperation::min());
    comm.all_reduce_into(&local_max[..], &mut global_max[..], SystemOperation::max());

    let deepest_cell_diam = 1.0 / (1u64 << K::MAX_LEVEL) as f64;
    let max_diam = (0..3)
        .map(|axis| global_max[axis] - global_min[axis])
        .fold(f64::MIN, f64::max)
        * (1.0 + deepest_cell_diam);

    let center = [
        0.5 * (global_min[0] + global_max[0]),
        0.5 * (global_min[1] + global_max[1]),
        0.5 * (global_min[2] + global_max[2]),
    ];

    SimulationBox::new(
        center[0] - 0.5 * max_diam,
        center[0] + 0.5 * max_diam,
        center[1] - 0.5 * max_diam,
        center[1] + 0.5 * max_diam,
        center[2] - 0.5 * max_diam,
        center[2] + 0.5 * max_diam,
        false,
        false,
        false,
    )
}

/// A reproducible random number generator.
pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// `n` sorted keys drawn uniformly from the whole key range.
pub fn generate_random_keys<K: SfcKey, R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<K> {
    let mut keys: Vec<K> = (0..n)
        .map(|_| K::from_u64(rng.gen_range(0..K::node_range(0).to_u64())))
        .collect();
    keys.sort_unstable();
    keys
}

/// `n` sorted keys of positions drawn from a Gaussian cloud in the unit
/// cube, clamped to the box.
pub fn generate_gaussian_keys<K: SfcKey, R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<K> {
    let bounds = SimulationBox::cube(0.0, 1.0, false);
    let normal = Normal::new(0.5, 0.15).unwrap();
    let mut keys: Vec<K> = (0..n)
        .map(|_| {
            let coord = |rng: &mut R| normal.sample(rng).clamp(0.0, 1.0);
            key_from_position([coord(rng), coord(rng), coord(rng)], &bounds)
        })
        .collect();
    keys.sort_unstable();
    keys
}

/// Compute displacements from a vector of counts.
///
/// For counts `[3, 4, 5]` the displacements are `[0, 3, 7]`; the last count
/// is ignored. Used for MPI varcount operations.
pub fn displacements(counts: &[i32]) -> Vec<i32> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect()
}

/// Gather an array to all processes.
pub fn gather_to_all<T, C>(arr: &[T], comm: &C) -> Vec<T>
where
    T: Equivalence + Default + Clone,
    C: CommunicatorCollectives,
{
    let size = comm.size();

    let local_len = arr.len() as i32;
    let mut sizes = vec![0i32; size as usize];
    comm.all_gather_into(&local_len, &mut sizes);

    let recv_len = sizes.iter().sum::<i32>() as usize;
    let mut recvbuffer = vec![T::default(); recv_len];

    let recv_displs = displacements(&sizes);
    let mut partition = PartitionMut::new(&mut recvbuffer[..], sizes, &recv_displs[..]);
    comm.all_gather_varcount_into(arr, &mut partition);

    recvbuffer
}

/// Gather a distributed array to the root rank.
///
/// The result is `Some` on root and `None` on all other ranks.
pub fn gather_to_root<T, C>(arr: &[T], comm: &C) -> Option<Vec<T>>
where
    T: Equivalence + Default + Clone,
    C: CommunicatorCollectives,
{
    let n = arr.len() as i32;
    let rank = comm.rank();
    let size = comm.size();
    let root_process = comm.process_at_rank(0);

    if rank == 0 {
        let mut counts = vec![0i32; size as usize];
        root_process.gather_into_root(&n, &mut counts);

        let n_elements = counts.iter().sum::<i32>() as usize;
        let mut gathered = vec![T::default(); n_elements];

        let displs = displacements(&counts);
        let mut partition = PartitionMut::new(&mut gathered[..], counts, &displs[..]);
        root_process.gather_varcount_into_root(arr, &mut partition);

        Some(gathered)
    } else {
        root_process.gather_into(&n);
        root_process.gather_varcount_into(arr);
        None
    }
}
