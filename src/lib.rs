#[macro_use]
extern crate tracing;

pub mod cli;
pub mod clock;
pub mod devices;
pub mod entropy;
pub mod escape;
pub mod geometry;
pub mod handlers;
pub mod input;
pub mod keycodes;
pub mod motion;
pub mod overlay;
pub mod replay;
pub mod scheduler;
pub mod state;
pub mod xkb;
