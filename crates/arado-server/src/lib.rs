//! Process bootstrap for the Arado reconciler binary.

pub mod startup;
