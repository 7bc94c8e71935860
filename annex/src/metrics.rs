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

use std::sync::atomic::AtomicUsize;

/// In-process counters for cache activity.
#[derive(Debug, Default)]
pub struct Metrics {
    /// reads answered from the local mirror
    pub reads_local: AtomicUsize,
    /// reads that fell through to the upstream
    pub reads_upstream: AtomicUsize,

    /// watch events applied to a store
    pub events_applied: AtomicUsize,
    /// watch events dropped (unknown kind or untypeable carrier)
    pub events_dropped: AtomicUsize,

    /// successfully installed generations
    pub generations: AtomicUsize,
    /// recoveries that cleared the stores and paused local reads
    pub resets: AtomicUsize,
}
