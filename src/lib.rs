//! DVR media ingestion service
//!
//! Devices push video segments and snapshots over HTTP. Each upload is
//! streamed into a hidden staging directory, named, signature checked and
//! acknowledged, then processed in the background by a bounded worker pool:
//! remux, compress, upload to object storage, move into the visible
//! directory and announce on the message broker. Files abandoned by a crash
//! are picked up again by the recovery scanner.

pub mod api;
pub mod config;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod naming;
pub mod pipeline;
pub mod pool;
pub mod recovery;
pub mod staging;
pub mod storage;
pub mod transcoder;
