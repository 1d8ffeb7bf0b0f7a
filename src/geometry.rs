//! Geometry primitives: bounding boxes and overlap predicates.
//!
//! The floating-point [`SimulationBox`] describes the global simulation
//! volume together with per-axis periodicity flags. Tree and halo logic
//! never works on floating-point coordinates directly; positions are
//! normalized into the `[0, 2^L)^3` integer grid of the key codec, and all
//! overlap tests happen on integer [`IBox`] ranges. A halo box may extend
//! below zero or beyond the grid on a periodic axis to express wrap-around
//! intent.

use crate::sfc::SfcKey;

/// Normalize a spatial length with respect to a min/max range.
pub fn normalize(d: f64, min: f64, max: f64) -> f64 {
    (d - min) / (max - min)
}

/// Global simulation volume with optional periodic boundaries.
///
/// Equality includes the periodicity flags.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimulationBox {
    limits: [f64; 6],
    pbc: [bool; 3],
}

impl SimulationBox {
    /// Create a box from per-axis bounds and periodicity flags.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        xmin: f64,
        xmax: f64,
        ymin: f64,
        ymax: f64,
        zmin: f64,
        zmax: f64,
        pbc_x: bool,
        pbc_y: bool,
        pbc_z: bool,
    ) -> Self {
        assert!(xmin < xmax && ymin < ymax && zmin < zmax);
        Self {
            limits: [xmin, xmax, ymin, ymax, zmin, zmax],
            pbc: [pbc_x, pbc_y, pbc_z],
        }
    }

    /// Create a cubic box with identical bounds and periodicity on all axes.
    pub fn cube(min: f64, max: f64, pbc: bool) -> Self {
        Self::new(min, max, min, max, min, max, pbc, pbc, pbc)
    }

    /// Lower bound on the x axis.
    pub fn xmin(&self) -> f64 {
        self.limits[0]
    }

    /// Upper bound on the x axis.
    pub fn xmax(&self) -> f64 {
        self.limits[1]
    }

    /// Lower bound on the y axis.
    pub fn ymin(&self) -> f64 {
        self.limits[2]
    }

    /// Upper bound on the y axis.
    pub fn ymax(&self) -> f64 {
        self.limits[3]
    }

    /// Lower bound on the z axis.
    pub fn zmin(&self) -> f64 {
        self.limits[4]
    }

    /// Upper bound on the z axis.
    pub fn zmax(&self) -> f64 {
        self.limits[5]
    }

    /// Periodicity flag of the x axis.
    pub fn pbc_x(&self) -> bool {
        self.pbc[0]
    }

    /// Periodicity flag of the y axis.
    pub fn pbc_y(&self) -> bool {
        self.pbc[1]
    }

    /// Periodicity flag of the z axis.
    pub fn pbc_z(&self) -> bool {
        self.pbc[2]
    }

    /// Edge lengths per axis.
    pub fn lengths(&self) -> [f64; 3] {
        [
            self.limits[1] - self.limits[0],
            self.limits[3] - self.limits[2],
            self.limits[5] - self.limits[4],
        ]
    }

    /// Map a position into the reference cube `[0, 1)^3`.
    pub fn normalize_position(&self, position: [f64; 3]) -> [f64; 3] {
        [
            normalize(position[0], self.limits[0], self.limits[1]),
            normalize(position[1], self.limits[2], self.limits[3]),
            normalize(position[2], self.limits[4], self.limits[5]),
        ]
    }
}

/// Axis-aligned box on the `[0, 2^L)^3` integer grid.
///
/// Bounds are half-open per axis. Halo boxes may carry negative or
/// over-range bounds to represent periodic wrap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IBox {
    /// Lower x bound (inclusive).
    pub xmin: i64,
    /// Upper x bound (exclusive).
    pub xmax: i64,
    /// Lower y bound (inclusive).
    pub ymin: i64,
    /// Upper y bound (exclusive).
    pub ymax: i64,
    /// Lower z bound (inclusive).
    pub zmin: i64,
    /// Upper z bound (exclusive).
    pub zmax: i64,
}

impl IBox {
    /// Create a box from per-axis half-open bounds.
    pub fn new(xmin: i64, xmax: i64, ymin: i64, ymax: i64, zmin: i64, zmax: i64) -> Self {
        Self {
            xmin,
            xmax,
            ymin,
            ymax,
            zmin,
            zmax,
        }
    }
}

/// Fold a coordinate into `[0, r)` on a periodic axis of circumference `r`.
pub fn pbc_adjust(x: i64, r: i64) -> i64 {
    x.rem_euclid(r)
}

fn overlap_two_ranges(a: i64, b: i64, c: i64, d: i64) -> bool {
    b > c && d > a
}

/// True iff the half-open interval `[a, b)` intersects `[c, d)` on a
/// periodic circle of circumference `r`.
///
/// Either interval may extend below zero or beyond `r` by at most one
/// period to express wrap-around.
pub fn overlap_range(a: i64, b: i64, c: i64, d: i64, r: i64) -> bool {
    overlap_two_ranges(a, b, c, d)
        || overlap_two_ranges(a + r, b + r, c, d)
        || overlap_two_ranges(a, b, c + r, d + r)
}

/// Per-axis half-open coordinate ranges of the cell addressed by the leading
/// `prefix_bits` bits of `prefix`.
///
/// Works for arbitrary bit counts, not only multiples of three, so binary
/// radix tree nodes can be tested directly.
fn coordinate_ranges<K: SfcKey>(prefix: K, prefix_bits: u32) -> [(i64, i64); 3] {
    debug_assert!(prefix_bits <= 3 * K::MAX_LEVEL);
    let [x, y, z] = prefix.decode();
    // a prefix of n bits holds ceil(n/3) x bits, then y, then z
    let x_bits = (prefix_bits + 2) / 3;
    let y_bits = (prefix_bits + 1) / 3;
    let z_bits = prefix_bits / 3;
    let span = |coord: u64, bits: u32| {
        let side = 1i64 << (K::MAX_LEVEL - bits);
        (coord as i64, coord as i64 + side)
    };
    [span(x, x_bits), span(y, y_bits), span(z, z_bits)]
}

/// True iff the cell addressed by the leading `prefix_bits` bits of `prefix`
/// intersects `halo_box`, wrapping every axis periodically.
///
/// The periodic test is harmless on non-periodic axes because halo boxes are
/// clamped into the grid there, so the shifted range copies can never match.
pub fn overlap_prefix<K: SfcKey>(prefix: K, prefix_bits: u32, halo_box: &IBox) -> bool {
    let r = K::max_coord() as i64;
    let [xr, yr, zr] = coordinate_ranges(prefix, prefix_bits);
    overlap_range(xr.0, xr.1, halo_box.xmin, halo_box.xmax, r)
        && overlap_range(yr.0, yr.1, halo_box.ymin, halo_box.ymax, r)
        && overlap_range(zr.0, zr.1, halo_box.zmin, halo_box.zmax, r)
}

/// True iff the octree node `[start, end)` intersects `halo_box`.
pub fn overlap<K: SfcKey>(start: K, end: K, halo_box: &IBox) -> bool {
    let span = K::from_u64(end.to_u64() - start.to_u64());
    overlap_prefix(start, 3 * K::tree_level(span), halo_box)
}

/// True iff `halo_box` lies entirely within the key span `[start, end)`.
///
/// A box that wraps around a periodic boundary is only contained in the
/// root. Used to prove that a halo search cannot leave a key range, so the
/// range's nodes need not be enumerated.
pub fn contained_in<K: SfcKey>(start: K, end: K, halo_box: &IBox) -> bool {
    debug_assert!(
        halo_box.xmin < halo_box.xmax
            && halo_box.ymin < halo_box.ymax
            && halo_box.zmin < halo_box.zmax
    );
    let r = K::max_coord() as i64;
    let wraps = halo_box.xmin.min(halo_box.ymin).min(halo_box.zmin) < 0
        || halo_box.xmax.max(halo_box.ymax).max(halo_box.zmax) > r;
    if wraps {
        return start == K::zero() && end == K::node_range(0);
    }
    let low = K::encode(
        halo_box.xmin as u64,
        halo_box.ymin as u64,
        halo_box.zmin as u64,
        K::MAX_LEVEL,
    );
    // the upper corner is exclusive; the largest encodable coordinate is 2^L - 1
    let high = K::encode(
        (halo_box.xmax - 1) as u64,
        (halo_box.ymax - 1) as u64,
        (halo_box.zmax - 1) as u64,
        K::MAX_LEVEL,
    );
    low.to_u64() >= start.to_u64() && high.to_u64() + 1 <= end.to_u64()
}

/// Expand the node `[start, end)` by integer grid displacements per axis,
/// clamped into the grid (no periodic wrap).
pub fn make_halo_box_grid<K: SfcKey>(start: K, end: K, dx: i64, dy: i64, dz: i64) -> IBox {
    let span = K::from_u64(end.to_u64() - start.to_u64());
    let level = K::tree_level(span);
    let r = K::max_coord() as i64;
    let [xr, yr, zr] = coordinate_ranges(start, 3 * level);
    IBox::new(
        (xr.0 - dx).max(0),
        (xr.1 + dx).min(r),
        (yr.0 - dy).max(0),
        (yr.1 + dy).min(r),
        (zr.0 - dz).max(0),
        (zr.1 + dz).min(r),
    )
}

/// Expand the node `[start, end)` by a physical halo radius.
///
/// The radius is converted to integer grid extents per axis with respect to
/// `bounds` and rounded up. Axes flagged periodic in `bounds` are left
/// unclamped; bounds below zero or beyond the grid signal wrap-around to
/// [`overlap_range`]. Non-periodic axes are clamped into the grid.
pub fn make_halo_box<K: SfcKey>(start: K, end: K, radius: f64, bounds: &SimulationBox) -> IBox {
    let span = K::from_u64(end.to_u64() - start.to_u64());
    let level = K::tree_level(span);
    let r = K::max_coord() as i64;
    let [lx, ly, lz] = bounds.lengths();
    let cells = |length: f64| (normalize(radius, 0.0, length) * K::max_coord() as f64).ceil() as i64;
    let (dx, dy, dz) = (cells(lx), cells(ly), cells(lz));
    let [xr, yr, zr] = coordinate_ranges(start, 3 * level);
    let expand = |(lo, hi): (i64, i64), d: i64, pbc: bool| {
        if pbc {
            (lo - d, hi + d)
        } else {
            ((lo - d).max(0), (hi + d).min(r))
        }
    };
    let x = expand(xr, dx, bounds.pbc_x());
    let y = expand(yr, dy, bounds.pbc_y());
    let z = expand(zr, dz, bounds.pbc_z());
    IBox::new(x.0, x.1, y.0, y.1, z.0, z.1)
}
