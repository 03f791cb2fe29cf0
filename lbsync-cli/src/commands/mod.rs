pub mod daemon;
pub mod render;
pub mod show;
pub mod sync;
