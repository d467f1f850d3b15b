pub mod latest;

pub use latest::LatestValueChannel;
