pub mod adapter;
pub mod audio;
pub mod dsp;
pub mod memory;
pub mod pipeline;
pub mod runner;
pub mod workers;
