pub mod fixtures;
pub mod mocks;

#[allow(unused_imports)]
pub use fixtures::{Machine, TestCluster, copier, hash_of};
#[allow(unused_imports)]
pub use mocks::{CountingSharedStore, ScriptedFileCopier, Step};
