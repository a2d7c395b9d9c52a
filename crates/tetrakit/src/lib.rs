//! # tetrakit: parallel metric-driven mesh adaptation core
//!
//! The crate transforms a three-dimensional volume mesh (vertices plus
//! tetrahedra, pyramids, prisms, hexahedra, boundary triangles and
//! quadrilaterals, and optionally geometry-associated edges) so that local
//! operators can make it uniform under a Riemannian metric field: a
//! symmetric positive-definite 3x3 tensor carried at every vertex.
//!
//! Three subsystems do the hard work:
//!
//! - the **metric model** ([`metric`], [`recon`], [`matrix`]): log-space
//!   interpolation, gradation limiting, complexity-driven global scaling,
//!   metric intersection, and construction from scalar fields via Hessian
//!   recovery;
//! - the **interpolator** ([`interp`], [`agent`], [`search`]): a hybrid of
//!   a bounding-sphere tree and a walking barycentric locator, driven by a
//!   pool of agents that migrate across partition boundaries;
//! - the **partitioned I/O and migration layer** ([`part`], [`migrate`],
//!   [`comm`]): chunked streaming reads with implicit partitioning, and
//!   redistribution with one-layer ghosts after adaptation.
//!
//! Everything operates on an explicit mesh context, [`grid::Grid`]: node
//! and cell tables, geometry association, and this partition's endpoint in
//! the message-passing fabric. There is no process-wide state; one rank is
//! one worker, and the collectives in [`comm`] are the only blocking
//! points.
//!
//! ## Data model
//!
//! Vertices ([`node::NodeTable`]) carry position, a monotone global id, an
//! owning part, and the metric stored as the log of the tensor, which keeps
//! arithmetic averages positive definite. Cells ([`cell::CellTable`]) are
//! per-kind structure-of-arrays tables with a chained node-to-cell index.
//! Ghost copies are read-only replicas refreshed from their owners after
//! every phase that mutates owned state.

pub mod adj;
pub mod agent;
pub mod cell;
pub mod comm;
pub mod edge;
pub mod error;
pub mod geom;
pub mod grid;
pub mod interp;
pub mod math;
pub mod matrix;
pub mod metric;
pub mod migrate;
pub mod node;
pub mod part;
pub mod recon;
pub mod search;
pub mod validate;

pub mod prelude {
    pub use crate::cell::{CellKind, CellTable};
    pub use crate::comm::Comm;
    pub use crate::error::{Error, Result};
    pub use crate::geom::{GeomKind, GeomTable};
    pub use crate::grid::Grid;
    pub use crate::interp::Interp;
    pub use crate::matrix::SymMat;
    pub use crate::node::NodeTable;
    pub use crate::recon::Reconstruction;
}
