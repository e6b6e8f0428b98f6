//! HTTP request handlers

pub mod ai_query;
pub mod alert;
pub mod archive;
pub mod block;
pub mod harvest;
pub mod health;
pub mod plant;

pub use ai_query::*;
pub use alert::*;
pub use archive::*;
pub use block::*;
pub use harvest::*;
pub use health::*;
pub use plant::*;
