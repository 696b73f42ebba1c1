pub mod clock;
pub mod compute;
pub mod config;
pub mod descriptor;
pub mod emit;
pub mod ingest;
pub mod interval;
pub mod pipeline;
pub mod sync;
