//! Expansion and launching of hogwild training sweeps.
//!
//! A sweep config names an external training program and an outer batch
//! size axis with inner (optimizer, max_steps) pairs. [`config`] loads it,
//! [`sweep`] expands it into ordered [`sweep::JobDescriptor`]s and the
//! [`invoker`] resets each run's state before handing the job to one of the
//! [`executors`].

pub mod config;
pub mod executors;
pub mod invoker;
pub mod resources;
pub mod state;
pub mod submit;
pub mod sweep;
