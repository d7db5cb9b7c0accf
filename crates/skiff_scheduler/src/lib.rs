//! Distributed execution scheduling for skiff queries.
//!
//! Given a tree of plan fragments produced by the planner, this crate builds
//! the stage execution graph, assigns work to worker nodes through pluggable
//! per-stage schedulers, wires inter-stage data flow (exchange locations and
//! output buffers), and drives the whole query to a terminal state.
//!
//! The physical operator pipeline that runs inside a worker task, split
//! enumeration, node catalogs, and the wire protocol to remote workers are all
//! external collaborators consumed through the traits in [`split`], [`node`],
//! and [`task`].

pub mod config;
pub mod node;
pub mod plan;
pub mod query;
pub mod scheduler;
pub mod split;
pub mod stage;
pub mod task;
pub mod testing;

mod util;
