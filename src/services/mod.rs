pub mod position;
pub mod reconcile;
pub mod stats;
