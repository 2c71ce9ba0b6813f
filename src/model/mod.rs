pub mod model_manager;
pub mod registry;
pub mod residency;
