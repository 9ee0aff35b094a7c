#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! A concurrent $N \times N \times N$ Rubik's-cube data structure.
//!
//! The interesting part of this crate is not the cube geometry (`src/geometry.rs`,
//! a pure, unsynchronized transformation of cells) but the admission
//! controller (`src/controller.rs`) that lets many threads request layer
//! rotations and full-state snapshots concurrently while guaranteeing:
//!
//! - mutually non-conflicting rotations (same direction, distinct planes)
//!   run in parallel;
//! - a snapshot is fully serialized against every rotation;
//! - no conflict group starves under adversarial arrival patterns
//!   (bounded-bypass fairness);
//! - cancellation of a blocked or just-woken requester never corrupts
//!   controller state or leaks a wake-up pulse.
//!
//! See `DESIGN.md` for where each piece of this crate is grounded.

mod controller;
mod error;
mod facade;
mod geometry;

pub use controller::CancelToken;
pub use error::CubeError;
pub use facade::{Cube, CubeBuilder};
