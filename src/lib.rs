//! `dca-grid-engine`: a multi-user automated DCA/grid crypto trading engine
//! for spot exchanges.
//!
//! See `README`/`SPEC_FULL.md` for the system overview. The crate is split
//! along the same lines as the specification's modules: `domain` (entities),
//! `grid` (leg planning), `exchange` (connector facade), `repository`
//! (persistence), `oms` (order/position orchestration), `fill_monitor` and
//! `risk_engine` (the two background loops), and `broadcaster` (outbound
//! notifications).

pub mod broadcaster;
pub mod common;
pub mod config;
pub mod decimal;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod fill_monitor;
pub mod grid;
pub mod oms;
pub mod repository;
pub mod risk_engine;
pub mod types;

pub use error::{Error, Result};
