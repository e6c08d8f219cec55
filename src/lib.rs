//! Instagram DM triage core.
//!
//! Ingests inbound DMs via the Meta webhook, classifies them into
//! intent/priority buckets with an LLM (batched, deduplicated), advances
//! subscription lifecycle state on a scheduled sweep, and prunes old read
//! messages. Everything is triggered externally — an HTTP call or a cron
//! hitting the sweep endpoints — so each operation is short-lived and safe
//! to re-invoke.

pub mod classify;
pub mod config;
pub mod crypto;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod instagram;
pub mod lifecycle;
pub mod retention;
pub mod state;
pub mod types;
pub mod webhook;
