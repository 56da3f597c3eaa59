//! Communication core for Märklin CS2/CS3 command stations.
//!
//! The station speaks a CAN bus protocol tunneled over TCP in fixed
//! 13-byte frames; bulk data (locomotive and accessory catalogs, icons)
//! travels over a plain HTTP side-channel. This crate covers the frame
//! codec, the transport with request/response correlation, bus member
//! discovery, bi-address accessory reconciliation, the event dispatcher
//! with typed listener fan-out and the liveness watchdog. A virtual
//! in-process station allows running the whole stack without hardware.
//!
//! ```no_run
//! use trackio::config::ControllerConfig;
//! use trackio::CsController;
//!
//! # fn main() -> trackio::Result<()> {
//! let controller = CsController::new(ControllerConfig::virtual_defaults())?;
//! controller.connect()?;
//! controller.events().power.subscribe(|e| println!("power: {:?}", e.state));
//! controller.power(true)?;
//! # Ok(())
//! # }
//! ```

pub mod accessory;
pub mod can;
pub mod catalog;
pub mod config;
pub mod devices;
pub mod error;
pub mod events;
pub mod transport;
pub mod workers;

mod controller;
mod dispatcher;
mod watchdog;

pub use controller::CsController;
pub use error::{Error, Result};
