// Copyright 2025 annex Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A watch-driven, typed local mirror of an authoritative cluster backend.
//!
//! The cache subscribes to the backend's event stream, installs a full snapshot per kind, and
//! then keeps per-kind stores up to date from individual events. Reads are served locally while
//! the watch is healthy and fall through to the upstream otherwise.

mod backend;
mod cache;
mod cert_authority;
mod collection;
mod engine;
mod fncache;
mod guard;
mod metrics;
mod sortcache;
mod static_tokens;
mod store;
mod types;
mod users;

mod prelude;
pub use prelude::*;
