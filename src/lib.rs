//! Media Vault library.
//!
//! A personal media-library and forum-archival server: scrapes forum threads
//! for hosted-media links, verifies those links in the background, runs
//! scheduled jobs, and streams local video files over HTTP with live progress
//! pushed to connected clients.

#![allow(clippy::needless_raw_string_hashes)]

pub mod activity;
pub mod config;
pub mod constants;
pub mod db;
pub mod downloads;
pub mod hub;
pub mod net;
pub mod scheduler;
pub mod scraper;
pub mod streaming;
pub mod verifier;
pub mod web;
