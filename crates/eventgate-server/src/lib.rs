//! # Eventgate Server
//!
//! HTTP surface, configuration, and process lifecycle around the
//! `eventgate-core` ingestion engine.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod api;
pub mod config;
pub mod debug;
