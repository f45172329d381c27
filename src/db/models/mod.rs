//! Database models split into domain-specific modules.

pub mod playlist;
pub mod spotify;
pub mod track;
pub mod user;

pub use playlist::*;
pub use spotify::*;
pub use track::*;
pub use user::*;
