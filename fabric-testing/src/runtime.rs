use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use fabric_types::connection::ConnectionKind;
use fabric_types::fab::FabConfig;
use futures::future::BoxFuture;
use log::{error, info, warn};

use crate::client::Fabric;
use crate::report::{CaseResult, CaseStatus};
use crate::ssh::NodeRunner;

/// Environmental predicates a case can declare as skip conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipFlag {
    VirtualSwitch,
    NoServers,
    NoLoki,
    NoProm,
    NoGateway,
    NoMesh,
    NoFabricLink,
    Roce,
    NoExternals,
}

impl SkipFlag {
    const ALL: [SkipFlag; 9] = [
        SkipFlag::VirtualSwitch,
        SkipFlag::NoServers,
        SkipFlag::NoLoki,
        SkipFlag::NoProm,
        SkipFlag::NoGateway,
        SkipFlag::NoMesh,
        SkipFlag::NoFabricLink,
        SkipFlag::Roce,
        SkipFlag::NoExternals,
    ];

    fn bit(self) -> u32 {
        1 << (self as u32)
    }

    fn reason(self) -> &'static str {
        match self {
            SkipFlag::VirtualSwitch => "virtual switches",
            SkipFlag::NoServers => "no servers",
            SkipFlag::NoLoki => "no Loki targets",
            SkipFlag::NoProm => "no Prometheus targets",
            SkipFlag::NoGateway => "no gateway",
            SkipFlag::NoMesh => "no mesh links",
            SkipFlag::NoFabricLink => "no fabric links",
            SkipFlag::Roce => "RoCE enabled",
            SkipFlag::NoExternals => "no externals",
        }
    }
}

/// Bit-set of [`SkipFlag`]s.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SkipFlags(u32);

impl SkipFlags {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn of(flags: &[SkipFlag]) -> Self {
        let mut set = Self::empty();
        for flag in flags {
            set.0 |= flag.bit();
        }
        set
    }

    pub fn contains(&self, flag: SkipFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = SkipFlag> + '_ {
        SkipFlag::ALL.into_iter().filter(|f| self.contains(*f))
    }
}

/// What the live topology actually looks like, evaluated once per run.
#[derive(Clone, Copy, Debug, Default)]
pub struct TestEnv {
    pub virtual_switch: bool,
    pub has_servers: bool,
    pub has_loki: bool,
    pub has_prom: bool,
    pub has_gateway: bool,
    pub has_mesh: bool,
    pub has_fabric_links: bool,
    pub roce: bool,
    pub has_externals: bool,
}

impl TestEnv {
    /// Derive the environment from the live store and the fab config.
    pub async fn detect(fabric: &Fabric, fab: &FabConfig) -> Result<Self> {
        let switches = fabric.switches().await?;
        let servers = fabric.list::<fabric_types::wiring::Server>(&Default::default()).await?;
        let gateways = fabric.gateways().await?;
        let externals = fabric.externals().await?;
        let mesh = fabric.connections_of(ConnectionKind::Mesh).await?;
        let fabric_links = fabric.connections_of(ConnectionKind::Fabric).await?;

        Ok(Self {
            virtual_switch: switches.iter().any(|s| !s.meta.is_hardware()),
            has_servers: !servers.is_empty(),
            has_loki: !fab.observability.loki_targets.is_empty(),
            has_prom: !fab.observability.prometheus_targets.is_empty(),
            has_gateway: !gateways.is_empty(),
            has_mesh: !mesh.is_empty(),
            has_fabric_links: !fabric_links.is_empty(),
            roce: switches.iter().any(|s| s.roce),
            has_externals: !externals.is_empty(),
        })
    }

    fn triggers(&self, flag: SkipFlag) -> bool {
        match flag {
            SkipFlag::VirtualSwitch => self.virtual_switch,
            SkipFlag::NoServers => !self.has_servers,
            SkipFlag::NoLoki => !self.has_loki,
            SkipFlag::NoProm => !self.has_prom,
            SkipFlag::NoGateway => !self.has_gateway,
            SkipFlag::NoMesh => !self.has_mesh,
            SkipFlag::NoFabricLink => !self.has_fabric_links,
            SkipFlag::Roce => self.roce,
            SkipFlag::NoExternals => !self.has_externals,
        }
    }

    /// First matching skip predicate of a case's flag set, if any.
    pub fn skip_reason(&self, flags: SkipFlags) -> Option<String> {
        flags
            .iter()
            .find(|flag| self.triggers(*flag))
            .map(|flag| flag.reason().to_string())
    }
}

/// Run options shared by every case.
#[derive(Clone, Debug)]
pub struct TestOpts {
    /// Iterate every link instead of only the first candidate.
    pub extended: bool,
    pub pause_on_failure: bool,
    /// Tighten the observability pass criterion to all hostnames.
    pub require_all_fresh: bool,
    /// Abort a case after this long; reverts still run.
    pub case_timeout: Option<Duration>,
    /// Scale convergence sleeps; 1.0 for real fabrics, 0.0 in tests.
    pub wait_scale: f64,
}

impl Default for TestOpts {
    fn default() -> Self {
        Self {
            extended: false,
            pause_on_failure: false,
            require_all_fresh: false,
            case_timeout: None,
            wait_scale: 1.0,
        }
    }
}

impl TestOpts {
    pub fn scaled(&self, wait: Duration) -> Duration {
        wait.mul_f64(self.wait_scale.max(0.0))
    }
}

/// Everything a case needs to reach the fabric.
pub struct TestCtx {
    pub fabric: Fabric,
    pub runner: Arc<dyn NodeRunner>,
    pub env: TestEnv,
    pub opts: TestOpts,
    pub fab: FabConfig,
}

/// A structural precondition is absent; reported as skipped, not failed.
#[derive(Debug)]
pub struct TestSkip(pub String);

impl TestSkip {
    /// Shorthand for `return Err(TestSkip::because(...))` inside a case.
    pub fn because(reason: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(TestSkip(reason.into()))
    }
}

impl fmt::Display for TestSkip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "skipped: {}", self.0)
    }
}

impl std::error::Error for TestSkip {}

/// Deferred restore action, run LIFO after the case.
pub type Revert = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Per-case revert stack. Cases push as they mutate, so a mid-case error
/// still unwinds everything done so far.
#[derive(Clone, Default)]
pub struct RevertStack {
    reverts: Arc<Mutex<Vec<Revert>>>,
}

impl RevertStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, revert: Revert) {
        self.reverts.lock().expect("poisoned").push(revert);
    }

    pub fn push_fn<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.push(Box::new(move || Box::pin(f())));
    }

    /// Drain in reverse push order (last mutation unwinds first).
    pub fn drain_lifo(&self) -> Vec<Revert> {
        let mut reverts = self.reverts.lock().expect("poisoned");
        let mut drained: Vec<Revert> = reverts.drain(..).collect();
        drained.reverse();
        drained
    }
}

pub type CaseFuture = BoxFuture<'static, Result<()>>;
pub type CaseFn = Arc<dyn Fn(Arc<TestCtx>, RevertStack) -> CaseFuture + Send + Sync>;

pub struct Case {
    pub name: String,
    pub flags: SkipFlags,
    pub run: CaseFn,
}

/// Build a case from an async closure.
pub fn case<F, Fut>(name: impl Into<String>, flags: SkipFlags, f: F) -> Case
where
    F: Fn(Arc<TestCtx>, RevertStack) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Case {
        name: name.into(),
        flags,
        run: Arc::new(move |ctx, reverts| Box::pin(f(ctx, reverts))),
    }
}

/// An ordered list of cases sharing one revert discipline. Cases run
/// strictly sequentially; switches are a contended global resource and the
/// reverts must restore them before the next case starts.
pub struct Suite {
    pub name: String,
    pub cases: Vec<Case>,
}

/// Upper bound on each individual revert, so a wedged revert cannot hang
/// the run after the case context is gone.
const REVERT_TIMEOUT: Duration = Duration::from_secs(120);

impl Suite {
    pub fn new(name: impl Into<String>, cases: Vec<Case>) -> Self {
        Self {
            name: name.into(),
            cases,
        }
    }

    pub async fn run(&self, ctx: Arc<TestCtx>) -> Vec<CaseResult> {
        let mut results = Vec::new();

        for case in &self.cases {
            if let Some(reason) = ctx.env.skip_reason(case.flags) {
                info!("SKIP {}/{}: {}", self.name, case.name, reason);
                results.push(CaseResult {
                    suite: self.name.clone(),
                    case: case.name.clone(),
                    duration: Duration::ZERO,
                    status: CaseStatus::Skipped,
                    message: Some(reason),
                });
                continue;
            }

            info!("RUN  {}/{}", self.name, case.name);
            let reverts = RevertStack::new();
            let started = Instant::now();

            let outcome = match ctx.opts.case_timeout {
                Some(timeout) => {
                    match tokio::time::timeout(timeout, (case.run)(ctx.clone(), reverts.clone()))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(anyhow!("case timed out after {:?}", timeout)),
                    }
                }
                None => (case.run)(ctx.clone(), reverts.clone()).await,
            };

            let (status, mut message) = match outcome {
                Ok(()) => (CaseStatus::Passed, None),
                Err(err) => match err.downcast_ref::<TestSkip>() {
                    Some(skip) => (CaseStatus::Skipped, Some(skip.0.clone())),
                    None => (CaseStatus::Failed, Some(format!("{:#}", err))),
                },
            };

            if status == CaseStatus::Failed && ctx.opts.pause_on_failure {
                warn!(
                    "{}/{} failed, pausing for inspection before revert (press enter)",
                    self.name, case.name
                );
                let mut line = String::new();
                let _ = std::io::stdin().read_line(&mut line);
            }

            // LIFO unwind, even on failure. Revert errors join the case
            // error, they never replace it or stop the unwind.
            for revert in reverts.drain_lifo() {
                let result = match tokio::time::timeout(REVERT_TIMEOUT, revert()).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("revert timed out after {:?}", REVERT_TIMEOUT)),
                };
                if let Err(err) = result {
                    error!("{}/{}: revert failed: {:#}", self.name, case.name, err);
                    message = Some(match message {
                        Some(original) => format!("{}; revert failed: {:#}", original, err),
                        None => format!("revert failed: {:#}", err),
                    });
                }
            }

            let duration = started.elapsed();
            match status {
                CaseStatus::Passed => info!("PASS {}/{} ({:?})", self.name, case.name, duration),
                CaseStatus::Skipped => info!("SKIP {}/{}", self.name, case.name),
                CaseStatus::Failed => error!(
                    "FAIL {}/{} ({:?}): {}",
                    self.name,
                    case.name,
                    duration,
                    message.as_deref().unwrap_or("")
                ),
            }

            results.push(CaseResult {
                suite: self.name.clone(),
                case: case.name.clone(),
                duration,
                status,
                message,
            });
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::MemoryStore;
    use crate::ssh::ScriptedRunner;

    fn ctx(env: TestEnv) -> Arc<TestCtx> {
        Arc::new(TestCtx {
            fabric: Fabric::new(Arc::new(MemoryStore::new())),
            runner: Arc::new(ScriptedRunner::new()),
            env,
            opts: TestOpts::default(),
            fab: FabConfig::default(),
        })
    }

    #[tokio::test]
    async fn test_skip_flags_against_env() {
        let env = TestEnv {
            virtual_switch: true,
            has_servers: true,
            ..Default::default()
        };
        assert!(env
            .skip_reason(SkipFlags::of(&[SkipFlag::VirtualSwitch]))
            .is_some());
        assert!(env.skip_reason(SkipFlags::of(&[SkipFlag::NoServers])).is_none());
        assert!(env.skip_reason(SkipFlags::of(&[SkipFlag::NoGateway])).is_some());
        assert!(env.skip_reason(SkipFlags::empty()).is_none());
    }

    #[tokio::test]
    async fn test_virtual_switch_cases_are_recorded_skipped() {
        let suite = Suite::new(
            "demo",
            vec![
                case("on-hw-only", SkipFlags::of(&[SkipFlag::VirtualSwitch]), |_, _| async {
                    panic!("must not run");
                }),
                case("anywhere", SkipFlags::empty(), |_, _| async { Ok(()) }),
            ],
        );
        let env = TestEnv {
            virtual_switch: true,
            ..Default::default()
        };
        let results = suite.run(ctx(env)).await;
        assert_eq!(results[0].status, CaseStatus::Skipped);
        assert_eq!(results[0].message.as_deref(), Some("virtual switches"));
        assert_eq!(results[1].status, CaseStatus::Passed);
    }

    #[tokio::test]
    async fn test_reverts_unwind_lifo_even_on_failure() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_for_case = order.clone();
        let suite = Suite::new(
            "demo",
            vec![case("fails", SkipFlags::empty(), move |_, reverts| {
                let order = order_for_case.clone();
                async move {
                    for index in [1, 2, 3] {
                        let order = order.clone();
                        reverts.push_fn(move || async move {
                            order.lock().expect("poisoned").push(index);
                            if index == 2 {
                                // A failing revert must not block the rest.
                                anyhow::bail!("revert {} broke", index);
                            }
                            Ok(())
                        });
                    }
                    anyhow::bail!("case exploded");
                }
            })],
        );

        let results = suite.run(ctx(TestEnv::default())).await;
        assert_eq!(results[0].status, CaseStatus::Failed);

        // r3, r2, r1 in that order.
        assert_eq!(*order.lock().expect("poisoned"), vec![3, 2, 1]);

        // Original failure kept, revert failure joined on.
        let message = results[0].message.as_deref().expect("message");
        assert!(message.contains("case exploded"));
        assert!(message.contains("revert 2 broke"));
    }

    #[tokio::test]
    async fn test_skip_error_is_not_a_failure() {
        let suite = Suite::new(
            "demo",
            vec![case("structural", SkipFlags::empty(), |_, _| async {
                Err(TestSkip::because("no MCLAG connections"))
            })],
        );
        let results = suite.run(ctx(TestEnv::default())).await;
        assert_eq!(results[0].status, CaseStatus::Skipped);
        assert_eq!(results[0].message.as_deref(), Some("no MCLAG connections"));
    }

    #[tokio::test]
    async fn test_case_timeout_still_reverts() {
        let reverted = Arc::new(Mutex::new(false));
        let reverted_for_case = reverted.clone();

        let suite = Suite::new(
            "demo",
            vec![case("hangs", SkipFlags::empty(), move |_, reverts| {
                let reverted = reverted_for_case.clone();
                async move {
                    reverts.push_fn(move || async move {
                        *reverted.lock().expect("poisoned") = true;
                        Ok(())
                    });
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            })],
        );

        let mut context = ctx(TestEnv::default());
        Arc::get_mut(&mut context).expect("sole owner").opts.case_timeout =
            Some(Duration::from_millis(50));

        let results = suite.run(context).await;
        assert_eq!(results[0].status, CaseStatus::Failed);
        assert!(*reverted.lock().expect("poisoned"));
    }
}
