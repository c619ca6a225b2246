mod network;
mod random;

pub use network::*;
pub use random::*;
