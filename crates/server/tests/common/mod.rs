pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{node_config, wait_for};
