// Copyright (c) Chronik Cache Authors
// SPDX-License-Identifier: Apache-2.0

//! A read-through, write-behind cache sitting in front of a Chronik-style
//! blockchain indexer: serves address/token transaction history out of a
//! durable, content-hashed store, keeping it warm via indexer push
//! notifications and backfilling it on demand through bounded worker
//! pools.
//!
//! Entry point: [`facade::ChronikCache`].

pub mod cache_engine;
pub mod context;
pub mod error;
pub mod hash;
pub mod indexer;
pub mod kv_store;
pub mod metrics;
pub mod notification;
pub mod retry;
pub mod sort_key;
pub mod stats;
pub mod subject;
pub mod subject_store;
pub mod task_queue;

pub mod facade;

pub use context::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use facade::ChronikCache;
pub use indexer::{ChronikClientInterface, MsgType};
pub use subject::{CacheStatus, Subject};
