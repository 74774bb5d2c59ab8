pub mod nevermore;
pub mod prefix;
pub mod wrap;

pub use nevermore::NevermoreProcessor;
pub use prefix::PrefixProcessor;
pub use wrap::WrapProcessor;
