//! Background daemon driving Jervis's ingestion and cognitive task pipeline.
//!
//! The daemon supervises a handful of independent loops sharing one staging
//! store: the central poller pulling from connections, the continuous
//! indexer embedding staged artifacts, the background task engine moving
//! tasks through qualification and GPU execution, and the periodic patrol
//! sweep that reclaims work abandoned by crashed workers.

pub mod daemon;
pub mod indexer;
pub mod kpi;
pub mod patrol;
pub mod poller;
pub mod schema_manager;
pub mod task_engine;
