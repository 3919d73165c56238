pub mod node;
pub mod port;
pub mod value;
