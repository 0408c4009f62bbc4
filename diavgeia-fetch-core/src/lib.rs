#![doc = "diavgeia-fetch-core: pipeline library for diavgeia-fetch."]

//! This crate contains the crawl → download → upload pipeline that mirrors
//! Diavgeia transparency decisions, plus the daily scheduler that drives it.
//! Concrete object storage backends and the CLI live in the `diavgeia-fetch`
//! binary crate.
//!
//! # Usage
//! Build a [`config::SessionConfig`], hand it to a [`dispatcher::Dispatcher`]
//! and await [`dispatcher::Dispatcher::execute`]. For unattended runs, wrap a
//! [`contract::JobRunner`] in a [`scheduler::Scheduler`].

pub mod api;
pub mod config;
pub mod contract;
pub mod crawler;
pub mod decision;
pub mod dispatcher;
pub mod download;
pub mod fsutil;
pub mod monitor;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod uploader;
