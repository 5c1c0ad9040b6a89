pub mod api;
pub mod canvas;
pub mod checkpoint;
pub mod cli;
pub mod coercion;
pub mod engine;
pub mod error;
pub mod nodes;
pub mod service;
pub mod storage;
pub mod stream;
pub mod versioning;
