// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Mirror version controlled projects into a memory-backed workspace.
//!
//! Ramsync copies projects from persistent storage into a tmpfs mount for
//! faster builds, remembers where each copy came from, and copies edits back
//! to disk on demand.

pub mod capacity;
pub mod config;
pub mod mirror;
pub mod path;
pub mod registry;
pub mod workspace;
