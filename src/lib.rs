#![forbid(unsafe_code)]

//! Shared modules for the Spotit backend.
//!
//! The crate is intentionally small; it exposes the yt-dlp invoker, the
//! filename-derived song library, and their configuration so the server
//! binary and the tests can share struct definitions.

pub mod config;
pub mod error;
pub mod library;
pub mod ytdlp;
