// Copyright 2025 Molt Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/// Installs the test tracing subscriber (idempotent; respects
/// `RUST_LOG`). Call at the top of tests whose failures are easier to
/// read with the runtime's trace output.
#[allow(dead_code, reason = "opt-in per test")]
pub(crate) fn trace_init() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
