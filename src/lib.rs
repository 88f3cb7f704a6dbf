//! # xAPI Bridge
//!
//! Tails an Open edX tracking log, turns recognised events into xAPI
//! statements and publishes them in batches to a Learning Record Store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌───────────┐   ┌──────────────┐   ┌───────┐
//! │ tracking.log│──▶│ LogTailer │──▶│  Converter   │──▶│ Queue │──▶ LRS
//! │ (append)    │   │ (poll)    │   │ (dispatch)   │   │(batch)│
//! └─────────────┘   └───────────┘   └──────────────┘   └───────┘
//!        ▲                  │ identity lost
//!        └──── Supervisor ◀─┘ (flush, reopen at end)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Raw records and xAPI statement types |
//! | [`errors`] | Error taxonomy |
//! | [`statements`] | Per-event statement constructors |
//! | [`converter`] | Event-type dispatch table |
//! | [`lrs`] | Publisher trait and LRS HTTP client |
//! | [`queue`] | Batching publish queue |
//! | [`tailer`] | Append-only file tailing |
//! | [`watch`] | Watch sessions and supervisor loop |
//! | [`server`] | Status endpoint |

pub mod config;
pub mod converter;
pub mod errors;
pub mod lrs;
pub mod models;
pub mod queue;
pub mod server;
pub mod statements;
pub mod tailer;
pub mod watch;
