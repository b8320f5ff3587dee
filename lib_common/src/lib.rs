// Declare the modules to re-export
pub mod connections;
pub mod core;
pub mod model;
pub mod tiles;

pub use model::VesselRecord;
pub use tiles::TileKey;
