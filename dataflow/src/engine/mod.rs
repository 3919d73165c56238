pub mod behavior;
pub mod graph;

mod invalidate;
mod settle;
mod teardown;
