//! # Repo Lens
//!
//! Map-reduce architecture reports for arbitrary source trees, with
//! follow-up questions grounded in the finished report.
//!
//! A repository too large for one model request is split into token-bounded
//! chunks, each chunk is summarised in parallel (map), and the summaries are
//! merged level by level until one report remains (reduce).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │   Scan   │──▶│  Chunk   │──▶│   Map    │──▶│  Reduce  │──▶ Report
//! │ (walk)   │   │ (budget) │   │ (N calls)│   │ (levels) │      │
//! └──────────┘   └──────────┘   └──────────┘   └──────────┘      ▼
//!                                                          Conversation
//!          progress events ──▶ stderr / JSON / SSE
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export OPENROUTER_API_KEY=...
//! lens analyze ./my-repo --chat
//! lens serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`tokens`] | Token estimation and truncation |
//! | [`chunk`] | Budget-bounded grouping of files into chunks |
//! | [`completion`] | Completion service trait, HTTP client, retry and deadlines |
//! | [`pool`] | Bounded worker pool with cancellation |
//! | [`map`] | Per-chunk summarisation |
//! | [`reduce`] | Hierarchical merge and final synthesis |
//! | [`pipeline`] | Run orchestration and state machine |
//! | [`progress`] | Progress events and sinks |
//! | [`conversation`] | Follow-up questions over a report |
//! | [`prompts`] | Prompt templates and the file listing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`config`] | TOML configuration |
//! | [`scan`] | Filesystem scanner |
//! | [`server`] | HTTP server with SSE progress |
//! | [`analyze`] | The `lens analyze` command |

pub mod analyze;
pub mod chunk;
pub mod completion;
pub mod config;
pub mod conversation;
pub mod error;
pub mod map;
pub mod models;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod prompts;
pub mod reduce;
pub mod scan;
pub mod server;
pub mod tokens;
