pub mod dunning;
pub mod system;
