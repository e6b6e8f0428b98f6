//! Domain models for the Farm Operations Platform

mod alert;
mod archive;
mod block;
mod farm;
mod harvest;
mod plant;

pub use alert::*;
pub use archive::*;
pub use block::*;
pub use farm::*;
pub use harvest::*;
pub use plant::*;
