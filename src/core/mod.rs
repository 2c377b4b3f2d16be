use rand::distr::{Alphanumeric, SampleString};

pub mod chunk;

pub mod classifier;

pub mod context;

pub mod execution;

pub mod item;

pub mod job;

pub mod listener;

pub mod retry;

pub mod settings;

pub mod skip;

pub mod step;

pub mod transaction;

/// Generates a random name consisting of alphanumeric characters.
///
/// Used for jobs and steps built without an explicit name.
fn build_name() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 8)
}
