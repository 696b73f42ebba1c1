pub mod queue;
pub mod stop;
pub mod synchronizer;
pub mod watermark;

pub use queue::BoundedQueue;
pub use stop::StopFlag;
pub use synchronizer::{ReaderWriterSynchronization, Synchronizer};
pub use watermark::Watermark;
