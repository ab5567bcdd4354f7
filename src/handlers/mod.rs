pub mod analyze;
pub mod config;
pub mod games;

pub use analyze::*;
pub use self::config::*;
pub use games::*;
