// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
pub mod accumulator;
pub mod chain;
pub mod config;
pub mod dedup;
pub mod errors;
pub mod ingest;
pub mod leader;
pub mod lifecycle;
pub mod metrics;
pub mod recovery;
pub mod session_store;
pub mod settlement;
pub mod snapshot;
pub mod store;
pub mod telemetry;
pub mod tenant;
pub mod timing;
pub mod wal;
