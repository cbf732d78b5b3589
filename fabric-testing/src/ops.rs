use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use fabric_types::agent::Agent;
use fabric_types::wiring::Switch;
use fabric_wiring::SwitchProfile;
use log::info;

use crate::runtime::{RevertStack, TestCtx};

/// Convergence wait after a port perturbation. Deliberately a timed sleep,
/// not agent readiness: the tests disable the agent first.
pub const CONVERGENCE_WAIT: Duration = Duration::from_secs(30);
/// Shorter wait for single-link perturbations.
pub const SHORT_CONVERGENCE_WAIT: Duration = Duration::from_secs(15);
pub const AGENT_ENABLE_RETRIES: usize = 5;
pub const AGENT_ENABLE_BACKOFF: Duration = Duration::from_secs(5);

pub async fn wait(ctx: &TestCtx, duration: Duration) {
    let scaled = ctx.opts.scaled(duration);
    info!("waiting {:?} for convergence", scaled);
    tokio::time::sleep(scaled).await;
}

/// NOS interface name of a front-panel port, via the switch's profile.
pub async fn nos_port(ctx: &TestCtx, switch: &str, port: &str) -> Result<String> {
    let object: Switch = ctx.fabric.get(switch).await?;
    let profile = SwitchProfile::get(&object.profile)
        .ok_or_else(|| anyhow!("switch {} has unknown profile {}", switch, object.profile))?;
    Ok(profile.nos_port(port)?)
}

/// Disable a switch agent so it stops reconciling, and push a revert that
/// re-enables it with bounded retries.
pub async fn disable_agent(
    ctx: &Arc<TestCtx>,
    reverts: &RevertStack,
    switch: &str,
) -> Result<()> {
    info!("disabling agent on {}", switch);
    ctx.fabric
        .update_with::<Agent, _>(switch, |agent| agent.spec.disabled = true)
        .await
        .with_context(|| format!("disabling agent {}", switch))?;

    let ctx = ctx.clone();
    let name = switch.to_string();
    reverts.push_fn(move || async move {
        let mut last_err = None;
        for attempt in 1..=AGENT_ENABLE_RETRIES {
            match ctx
                .fabric
                .update_with::<Agent, _>(&name, |agent| agent.spec.disabled = false)
                .await
            {
                Ok(_) => {
                    info!("agent {} re-enabled", name);
                    return Ok(());
                }
                Err(err) => {
                    last_err = Some(err);
                    if attempt < AGENT_ENABLE_RETRIES {
                        tokio::time::sleep(ctx.opts.scaled(AGENT_ENABLE_BACKOFF)).await;
                    }
                }
            }
        }
        Err(anyhow!(
            "enabling agent {} failed after {} attempts: {}",
            name,
            AGENT_ENABLE_RETRIES,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ))
    });
    Ok(())
}

/// Shut a switch port over SSH and push the matching startup revert.
pub async fn shutdown_port(
    ctx: &Arc<TestCtx>,
    reverts: &RevertStack,
    switch: &str,
    port: &str,
) -> Result<()> {
    let nos = nos_port(ctx, switch, port).await?;
    info!("shutting {}/{} ({})", switch, port, nos);

    let output = ctx
        .runner
        .run(switch, &format!("config interface shutdown {}", nos))
        .await?;
    if !output.success() {
        bail!(
            "shutdown of {}/{} exited {}: {}",
            switch,
            port,
            output.exit_code,
            output.stderr.trim()
        );
    }

    let ctx = ctx.clone();
    let switch = switch.to_string();
    let port = port.to_string();
    reverts.push_fn(move || async move {
        let output = ctx
            .runner
            .run(&switch, &format!("config interface startup {}", nos))
            .await?;
        if !output.success() {
            bail!(
                "startup of {}/{} exited {}: {}",
                switch,
                port,
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(())
    });
    Ok(())
}

/// Bring a port back up immediately, outside the revert discipline. Used
/// between iterations of extended link sweeps; the startup revert pushed by
/// [`shutdown_port`] stays on the stack and is idempotent.
pub async fn startup_port(ctx: &TestCtx, switch: &str, port: &str) -> Result<()> {
    let nos = nos_port(ctx, switch, port).await?;
    let output = ctx
        .runner
        .run(switch, &format!("config interface startup {}", nos))
        .await?;
    if !output.success() {
        bail!(
            "startup of {}/{} exited {}: {}",
            switch,
            port,
            output.exit_code,
            output.stderr.trim()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{seed_wiring, Fabric};
    use crate::memstore::MemoryStore;
    use crate::runtime::{TestEnv, TestOpts};
    use crate::ssh::ScriptedRunner;
    use fabric_types::fab::FabConfig;
    use fabric_wiring::{TopologyIntent, WiringBuilder};

    async fn seeded_ctx() -> (Arc<TestCtx>, Arc<ScriptedRunner>) {
        let graph =
            WiringBuilder::build(&TopologyIntent::default(), &FabConfig::default()).expect("build");
        let fabric = Fabric::new(Arc::new(MemoryStore::new()));
        seed_wiring(&fabric, &graph).await.expect("seed");
        let runner = Arc::new(ScriptedRunner::new());
        let ctx = Arc::new(TestCtx {
            fabric,
            runner: runner.clone(),
            env: TestEnv::default(),
            opts: TestOpts {
                wait_scale: 0.0,
                ..Default::default()
            },
            fab: FabConfig::default(),
        });
        (ctx, runner)
    }

    #[tokio::test]
    async fn test_nos_port_resolution() {
        let (ctx, _) = seeded_ctx().await;
        assert_eq!(nos_port(&ctx, "leaf-01", "E1/1").await.expect("map"), "Ethernet0");
        assert!(nos_port(&ctx, "leaf-01", "M1").await.is_err());
    }

    #[tokio::test]
    async fn test_disable_agent_and_revert() {
        let (ctx, _) = seeded_ctx().await;
        let reverts = RevertStack::new();

        disable_agent(&ctx, &reverts, "leaf-01").await.expect("disable");
        let agent: Agent = ctx.fabric.get("leaf-01").await.expect("agent");
        assert!(agent.spec.disabled);

        // The pushed revert re-enables.
        let mut drained = reverts.drain_lifo();
        assert_eq!(drained.len(), 1);
        drained.pop().expect("revert")().await.expect("revert runs");
        let agent: Agent = ctx.fabric.get("leaf-01").await.expect("agent");
        assert!(!agent.spec.disabled);
    }

    #[tokio::test]
    async fn test_shutdown_port_issues_nos_commands() {
        let (ctx, runner) = seeded_ctx().await;
        let reverts = RevertStack::new();

        shutdown_port(&ctx, &reverts, "leaf-01", "E1/5").await.expect("shutdown");
        let commands = runner.commands_on("leaf-01");
        assert_eq!(commands, vec!["config interface shutdown Ethernet4"]);

        for revert in reverts.drain_lifo() {
            revert().await.expect("revert");
        }
        let commands = runner.commands_on("leaf-01");
        assert_eq!(commands[1], "config interface startup Ethernet4");
    }
}
