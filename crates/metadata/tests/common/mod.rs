pub mod mocks;

#[allow(unused_imports)]
pub use mocks::{FlakyEventStream, MockLocationSource, location_store, location_store_with_stream};
