pub mod bootstrap;
pub mod client;
pub mod connectivity;
pub mod dhcp;
pub mod failover;
pub mod memstore;
pub mod nat;
pub mod observability;
pub mod ops;
pub mod report;
pub mod runtime;
pub mod ssh;
pub mod vpc;

pub use client::{seed_wiring, Fabric};
pub use memstore::MemoryStore;
pub use report::{CaseResult, CaseStatus, TestReport};
pub use runtime::{
    case, Case, RevertStack, SkipFlag, SkipFlags, Suite, TestCtx, TestEnv, TestOpts, TestSkip,
};
pub use ssh::{CommandOutput, NodeRunner, ScriptedRunner, SshRunner};

use std::sync::Arc;

/// All suites in run order. Failover last: it leaves the most room for a
/// failed revert to poison the topology for later cases.
pub fn all_suites() -> Vec<Suite> {
    vec![
        vpc::suite(),
        dhcp::suite(),
        nat::suite(),
        observability::suite(),
        failover::suite(),
    ]
}

/// Run every suite sequentially and collect one report.
pub async fn run_all(ctx: Arc<TestCtx>) -> TestReport {
    let mut report = TestReport::new();
    for suite in all_suites() {
        let results = suite.run(ctx.clone()).await;
        report.extend(results);
    }
    report
}
