use lazy_static::lazy_static;
use specs::SpecsCatalog;

pub mod config;
pub mod engine;
pub mod error;
pub mod iso_builder;
pub mod layout_parser;
pub mod location;
pub mod parameters;
pub mod planner;
pub mod plate;
pub mod pool;
pub mod preparation;
pub mod rack;
pub mod rack_layout;
pub mod request;
pub mod sector;
pub mod specs;
pub mod transfection;
pub mod transfer;
pub mod tube;
pub mod units;

pub use isoplan_protocol as protocol;

lazy_static! {
    // Reservoir and pipetting specs known to the planner
    pub static ref SPECS: SpecsCatalog = SpecsCatalog::default();
}
