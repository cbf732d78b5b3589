use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fabric_types::meta::LabelSelector;
use fabric_types::wiring::Server;
use futures::future::join_all;
use log::{debug, warn};
use tokio::sync::Semaphore;

use crate::runtime::TestCtx;

/// Concurrent SSH sessions allowed for ping probes.
pub const PING_CONCURRENCY: usize = 10;
/// Concurrent SSH sessions allowed for iperf3 probes.
pub const IPERF_CONCURRENCY: usize = 5;
/// Shared deadline for an iperf3 server/client pair.
pub const IPERF_TIMEOUT: Duration = Duration::from_secs(35);

/// Interfaces that never carry fabric traffic on a server.
const EXCLUDED_IFACES: [&str; 3] = ["lo", "enp2s0", "docker0"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expectation {
    Reachable,
    Unreachable,
}

#[derive(Clone, Debug)]
pub struct PingProbe {
    pub from: String,
    pub to_ip: String,
    pub expect: Expectation,
}

#[derive(Clone, Debug)]
pub struct IperfProbe {
    pub from: String,
    pub to_server: String,
    pub to_ip: String,
}

/// Fabric-facing IPv4 addresses of one server, discovered over SSH.
pub async fn server_ips(ctx: &TestCtx, server: &str) -> Result<Vec<String>> {
    let output = ctx
        .runner
        .run(server, "ip -o -4 addr show")
        .await
        .with_context(|| format!("listing addresses on {}", server))?;
    if !output.success() {
        bail!(
            "ip addr show on {} exited {}: {}",
            server,
            output.exit_code,
            output.stderr.trim()
        );
    }

    let mut ips = Vec::new();
    for line in output.stdout.lines() {
        // "2: enp2s1    inet 10.0.1.5/24 brd 10.0.1.255 scope global ..."
        let mut fields = line.split_whitespace();
        let (Some(_), Some(iface), Some(kind), Some(cidr)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if kind != "inet" || EXCLUDED_IFACES.contains(&iface) {
            continue;
        }
        if let Some((ip, _)) = cidr.split_once('/') {
            ips.push(ip.to_string());
        }
    }
    Ok(ips)
}

/// Discover all servers' fabric addresses, name -> IPs. Servers without an
/// address (not attached or DHCP not settled) map to an empty list.
pub async fn discover_server_ips(ctx: &TestCtx) -> Result<BTreeMap<String, Vec<String>>> {
    let servers: Vec<Server> = ctx.fabric.list(&LabelSelector::all()).await?;
    let mut by_server = BTreeMap::new();
    for server in servers {
        if server.meta.is_hardware() {
            continue;
        }
        let ips = server_ips(ctx, server.name()).await?;
        if ips.is_empty() {
            debug!("{} has no fabric address", server.name());
        }
        by_server.insert(server.name().to_string(), ips);
    }
    Ok(by_server)
}

/// Run every probe under the ping semaphore; collect all expectation
/// mismatches into one assertion error.
pub async fn ping_probes(ctx: &Arc<TestCtx>, probes: Vec<PingProbe>) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(PING_CONCURRENCY));

    let tasks = probes.into_iter().map(|probe| {
        let ctx = ctx.clone();
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore closed");
            let cmd = format!("ping -c 5 -W 2 {}", probe.to_ip);
            let result = ctx.runner.run(&probe.from, &cmd).await;
            match result {
                Ok(output) => {
                    let reachable = output.success();
                    match probe.expect {
                        Expectation::Reachable if !reachable => Some(format!(
                            "{} cannot reach {}: {}",
                            probe.from,
                            probe.to_ip,
                            output.stdout.trim()
                        )),
                        Expectation::Unreachable if reachable => Some(format!(
                            "{} unexpectedly reaches {}",
                            probe.from, probe.to_ip
                        )),
                        _ => None,
                    }
                }
                Err(err) => Some(format!("ping from {} failed: {:#}", probe.from, err)),
            }
        }
    });

    let failures: Vec<String> = join_all(tasks).await.into_iter().flatten().collect();
    if !failures.is_empty() {
        bail!("connectivity mismatches: {}", failures.join("; "));
    }
    Ok(())
}

/// Throughput probes: one-shot iperf3 server on the target, 4 parallel
/// streams for 5 seconds with MSS 1200 from the source.
pub async fn iperf_probes(ctx: &Arc<TestCtx>, probes: Vec<IperfProbe>) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(IPERF_CONCURRENCY));

    let tasks = probes.into_iter().map(|probe| {
        let ctx = ctx.clone();
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore closed");

            let serve = ctx
                .runner
                .run(&probe.to_server, "timeout 30 iperf3 -s -1 -D")
                .await;
            if let Err(err) = serve {
                return Some(format!("iperf3 server on {} failed: {:#}", probe.to_server, err));
            }

            let cmd = format!("iperf3 -c {} -P 4 -t 5 -M 1200 -J", probe.to_ip);
            let run = tokio::time::timeout(IPERF_TIMEOUT, ctx.runner.run(&probe.from, &cmd)).await;
            match run {
                Ok(Ok(output)) if output.success() => None,
                Ok(Ok(output)) => Some(format!(
                    "iperf3 {} -> {} exited {}: {}",
                    probe.from,
                    probe.to_ip,
                    output.exit_code,
                    output.stderr.trim()
                )),
                Ok(Err(err)) => Some(format!("iperf3 from {} failed: {:#}", probe.from, err)),
                Err(_) => Some(format!(
                    "iperf3 {} -> {} timed out after {:?}",
                    probe.from, probe.to_ip, IPERF_TIMEOUT
                )),
            }
        }
    });

    let failures: Vec<String> = join_all(tasks).await.into_iter().flatten().collect();
    if !failures.is_empty() {
        bail!("iperf3 failures: {}", failures.join("; "));
    }
    Ok(())
}

/// End-to-end check used after perturbations: every attached server pings
/// every other server's fabric addresses.
pub async fn test_connectivity(ctx: &Arc<TestCtx>) -> Result<()> {
    let by_server = discover_server_ips(ctx).await?;
    let attached: Vec<(&String, &Vec<String>)> =
        by_server.iter().filter(|(_, ips)| !ips.is_empty()).collect();
    if attached.len() < 2 {
        warn!("fewer than two attached servers, connectivity check is vacuous");
        return Ok(());
    }

    let mut probes = Vec::new();
    for (from, _) in &attached {
        for (to, ips) in &attached {
            if from == to {
                continue;
            }
            for ip in ips.iter() {
                probes.push(PingProbe {
                    from: (*from).clone(),
                    to_ip: ip.clone(),
                    expect: Expectation::Reachable,
                });
            }
        }
    }
    ping_probes(ctx, probes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Fabric;
    use crate::memstore::MemoryStore;
    use crate::runtime::{TestEnv, TestOpts};
    use crate::ssh::{CommandOutput, ScriptedRunner};
    use fabric_types::fab::FabConfig;

    fn ctx_with(runner: Arc<ScriptedRunner>) -> Arc<TestCtx> {
        Arc::new(TestCtx {
            fabric: Fabric::new(Arc::new(MemoryStore::new())),
            runner,
            env: TestEnv::default(),
            opts: TestOpts::default(),
            fab: FabConfig::default(),
        })
    }

    #[tokio::test]
    async fn test_server_ips_excludes_host_ifaces() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            "ip -o -4 addr show",
            "1: lo    inet 127.0.0.1/8 scope host lo\n\
             2: enp2s0    inet 10.0.2.15/24 brd 10.0.2.255 scope global enp2s0\n\
             3: enp2s1    inet 10.0.1.5/24 brd 10.0.1.255 scope global enp2s1\n\
             4: docker0    inet 172.17.0.1/16 scope global docker0\n",
        );
        let ctx = ctx_with(runner);
        let ips = server_ips(&ctx, "server-01").await.expect("discover");
        assert_eq!(ips, vec!["10.0.1.5"]);
    }

    #[tokio::test]
    async fn test_ping_probe_expectations() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond_on(
            "server-01",
            "ping -c 5 -W 2 10.0.1.9",
            CommandOutput {
                exit_code: 1,
                ..Default::default()
            },
        );
        let ctx = ctx_with(runner);

        // Unreachable expected and observed: fine.
        ping_probes(
            &ctx,
            vec![PingProbe {
                from: "server-01".to_string(),
                to_ip: "10.0.1.9".to_string(),
                expect: Expectation::Unreachable,
            }],
        )
        .await
        .expect("expected unreachable");

        // Reachable expected but ping fails: assertion error.
        let err = ping_probes(
            &ctx,
            vec![PingProbe {
                from: "server-01".to_string(),
                to_ip: "10.0.1.9".to_string(),
                expect: Expectation::Reachable,
            }],
        )
        .await
        .expect_err("mismatch");
        assert!(err.to_string().contains("server-01"));
    }
}
