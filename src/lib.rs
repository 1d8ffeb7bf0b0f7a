//! Distributed cornerstone octree and domain decomposition for particle
//! simulations.
//!
//! This library keeps a globally consistent adaptive octree across the
//! ranks of an MPI job and uses it to decompose an N-body or SPH particle
//! population along a Morton space-filling curve. The octree is stored in
//! the cornerstone format: a sorted sequence of leaf start keys plus a
//! sentinel, in which every adjacent key pair delimits one leaf. On top of
//! it the library derives, per simulation step,
//!
//! * a balanced assignment of one contiguous SFC range per rank,
//! * the halo leaves every rank must mirror locally so that each particle
//!   sees all neighbours within its interaction radius,
//! * the per-peer send lists and particle buffer layout that realize the
//!   assignment and halos, and
//! * a locally essential (focused) tree per rank, full resolution inside
//!   the rank's own domain and coarsened by a multipole acceptance
//!   criterion elsewhere.
//!
//! Keys come in two widths, 30-bit `u32` and 63-bit `u64`, selected at
//! compile time through the [`SfcKey`](crate::sfc::SfcKey) trait; all tree
//! code is monomorphic over the choice. Within a rank, leaf loops are
//! parallelized with rayon; across ranks, communication uses asynchronous
//! sends matched by probing receives, so message sizes never need to be
//! negotiated.
//!
//! ## Building a tree
//!
//! ```no_run
//! use cornerstone::sfc::keys_from_coordinates;
//! use cornerstone::geometry::SimulationBox;
//! use cornerstone::tree::compute_octree;
//!
//! let bounds = SimulationBox::cube(0.0, 1.0, false);
//! // flat xyz triples, one particle per triple
//! let coordinates = vec![0.1, 0.2, 0.3, 0.7, 0.8, 0.9];
//! let mut keys: Vec<u64> = keys_from_coordinates(&coordinates, &bounds);
//! keys.sort_unstable();
//!
//! let (tree, counts) = compute_octree(&keys, 64);
//! assert_eq!(counts.iter().sum::<u32>() as usize, keys.len());
//! ```
//!
//! The distributed path is the same loop built from the collective pieces:
//! [`compute_octree_global`](crate::tree::compute_octree_global) for the
//! replicated tree, [`single_range_sfc_split`](crate::domain::single_range_sfc_split)
//! for the assignment, [`find_halos`](crate::halos::find_halos) for halo
//! discovery, [`compute_layout`](crate::layout::compute_layout) for the
//! buffer layout and [`exchange_particles`](crate::exchange::exchange_particles)
//! to move the data.
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod btree;
pub mod constants;
pub mod domain;
pub mod exchange;
pub mod focus;
pub mod focus_exchange;
pub mod geometry;
pub mod halos;
pub mod layout;
pub mod sfc;
pub mod tools;
pub mod tree;

pub use crate::domain::{SendList, SpaceCurveAssignment};
pub use crate::exchange::{exchange_particles, exchange_particles_with_offsets};
pub use crate::focus::FocusedTree;
pub use crate::geometry::{IBox, SimulationBox};
pub use crate::layout::ArrayLayout;
pub use crate::sfc::SfcKey;
pub use crate::tree::{compute_octree, compute_octree_global, update_octree};
