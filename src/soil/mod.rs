pub mod bgc;
pub mod pools;
pub mod profile;

// Re-exports for convenience
pub use bgc::{SoilDrivers, SoilInputs, SoilModes, SoilParams, SoilRhs};
pub use pools::{distribute_root_uptake, load_state, store_state, SoilFluxes, SoilState};
pub use profile::{LayerKind, SoilClimate, SoilLayer, SoilProfile};
