pub(crate) use bitcoin::hashes::cmp::fixed_time_eq;

pub(crate) mod utils;
