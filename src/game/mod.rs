//! # Game Orchestrator
//!
//! ## Key Components:
//! - **state**: the pure turn/elimination state machine
//! - **orchestrator**: one serialized worker task per running game
//! - **hub**: game lookup by id, player membership, detection routing

pub mod hub;
pub mod orchestrator;
pub mod state;

pub use hub::GameHub;
