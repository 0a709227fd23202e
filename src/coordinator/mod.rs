//! Coordinator HTTP service
//!
//! The service boundary in front of the lock manager, the control plane and
//! the ingestion pipeline, plus the client workers use to talk to it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            Coordinator Server            │
//! │                                          │
//! │  ┌────────────────────────────────────┐  │
//! │  │  REST API (bearer auth)            │  │
//! │  │  /api/tasks[/{id}][/claim|results] │  │
//! │  │  /api/results[/{id}]               │  │
//! │  │  /api/workers[/{id}][/control]     │  │
//! │  │  /api/stats  /api/events (SSE)     │  │
//! │  └────────────────────────────────────┘  │
//! │                                          │
//! │  ┌────────────────────────────────────┐  │
//! │  │  Background loops                  │  │
//! │  │  - orphan lease sweep              │  │
//! │  │  - worker:status listener          │  │
//! │  │  - stale worker monitor            │  │
//! │  │  - stats broadcast                 │  │
//! │  └────────────────────────────────────┘  │
//! │                                          │
//! │  /health/live  /health/ready  /metrics   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use scrapefleet::coordinator::CoordinatorServer;
//!
//! let server = CoordinatorServer::new(&config, store, coordination)?;
//! server.start_with_shutdown(shutdown_signal()).await?;
//! ```

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod health;
pub mod server;

pub use api::{create_router, ApiError, ApiResponse};
pub use client::{ClientConfig, ClientError, CoordinatorClient};
pub use config::CoordinatorConfig;
pub use server::{AppState, CoordinatorServer, ServerError};
