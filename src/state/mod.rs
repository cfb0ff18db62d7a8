pub mod probe_cache;
pub mod windows;

pub use probe_cache::{Liveness, ProbeCache, ProbeConfigSnapshot, ProbeStatusSnapshot, SweepReport};
pub use windows::{DeviceWindows, SlidingWindow, WindowRegistry};
