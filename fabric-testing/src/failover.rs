use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{bail, Result};
use fabric_types::connection::{Connection, ConnectionKind};
use fabric_types::meta::Meta;
use fabric_types::vpc::{
    GatewayGroup, GatewayGroupMember, GatewayPeering, PeeringEntry, PeeringExpose, PeeringIps,
};
use fabric_types::wiring::Switch;
use fabric_wiring::SwitchProfile;
use log::info;

use crate::connectivity::test_connectivity;
use crate::ops::{
    disable_agent, shutdown_port, startup_port, wait, CONVERGENCE_WAIT, SHORT_CONVERGENCE_WAIT,
};
use crate::runtime::{case, RevertStack, SkipFlag, SkipFlags, Suite, TestCtx, TestSkip};

/// Priorities of the gateway failover group.
pub const GATEWAY_PRIMARY_PRIORITY: u32 = 100;
pub const GATEWAY_BACKUP_PRIORITY: u32 = 50;
const GATEWAY_GROUP_NAME: &str = "failover-test";

pub fn suite() -> Suite {
    Suite::new(
        "failover",
        vec![
            case("mclag", SkipFlags::of(&[SkipFlag::NoServers]), |ctx, reverts| async move {
                link_failover(&ctx, &reverts, ConnectionKind::Mclag).await
            }),
            case("eslag", SkipFlags::of(&[SkipFlag::NoServers]), |ctx, reverts| async move {
                link_failover(&ctx, &reverts, ConnectionKind::Eslag).await
            }),
            case("bundled", SkipFlags::of(&[SkipFlag::NoServers]), |ctx, reverts| async move {
                link_failover(&ctx, &reverts, ConnectionKind::Bundled).await
            }),
            case(
                "spine",
                SkipFlags::of(&[SkipFlag::NoServers, SkipFlag::NoFabricLink]),
                |ctx, reverts| async move { spine_failover(&ctx, &reverts).await },
            ),
            case(
                "mesh",
                SkipFlags::of(&[SkipFlag::NoServers, SkipFlag::NoMesh]),
                |ctx, reverts| async move { mesh_failover(&ctx, &reverts).await },
            ),
            case(
                "gateway",
                SkipFlags::of(&[SkipFlag::NoGateway]),
                |ctx, reverts| async move { gateway_failover(&ctx, &reverts).await },
            ),
            case(
                "breakout",
                SkipFlags::of(&[SkipFlag::VirtualSwitch]),
                |ctx, reverts| async move { breakout_roundtrip(&ctx, &reverts).await },
            ),
            case(
                "roce-marking",
                SkipFlags::of(&[SkipFlag::VirtualSwitch]),
                |ctx, reverts| async move { roce_marking(&ctx, &reverts).await },
            ),
        ],
    )
}

/// Switch-side endpoint of a server-facing link.
fn switch_end(link: &fabric_types::connection::Link) -> &fabric_types::connection::Port {
    &link.to
}

/// Shut one link per connection (every link in extended mode) and check
/// end-to-end connectivity each time. MCLAG and ESLAG connections must have
/// exactly two links, bundled connections at least two.
pub async fn link_failover(
    ctx: &Arc<TestCtx>,
    reverts: &RevertStack,
    kind: ConnectionKind,
) -> Result<()> {
    let conns = ctx.fabric.connections_of(kind).await?;
    if conns.is_empty() {
        return Err(TestSkip::because(format!("no {} connections", kind)));
    }

    let mut disabled: BTreeSet<String> = BTreeSet::new();
    for conn in &conns {
        let links = conn.links();
        match kind {
            ConnectionKind::Mclag | ConnectionKind::Eslag => {
                if links.len() != 2 {
                    bail!(
                        "{} has {} links, want exactly 2",
                        conn.meta.name,
                        links.len()
                    );
                }
            }
            _ => {
                if links.len() < 2 {
                    bail!(
                        "{} has {} links, want at least 2",
                        conn.meta.name,
                        links.len()
                    );
                }
            }
        }

        let count = if ctx.opts.extended { links.len() } else { 1 };
        for link in links.iter().take(count) {
            let end = switch_end(link);
            if disabled.insert(end.device.clone()) {
                disable_agent(ctx, reverts, &end.device).await?;
            }
            shutdown_port(ctx, reverts, &end.device, &end.port).await?;
            wait(ctx, SHORT_CONVERGENCE_WAIT).await;
            test_connectivity(ctx).await?;
            startup_port(ctx, &end.device, &end.port).await?;
        }
    }
    Ok(())
}

/// Disable every spine but the first and shut all their fabric links; the
/// remaining spine must carry all traffic.
pub async fn spine_failover(ctx: &Arc<TestCtx>, reverts: &RevertStack) -> Result<()> {
    let spines: Vec<Switch> = ctx
        .fabric
        .switches()
        .await?
        .into_iter()
        .filter(|s| s.role.is_spine())
        .collect();
    if spines.len() < 2 {
        return Err(TestSkip::because("not enough spines"));
    }

    for spine in &spines[1..] {
        disable_agent(ctx, reverts, spine.name()).await?;
        let conns = ctx
            .fabric
            .device_connections_of(spine.name(), ConnectionKind::Fabric)
            .await?;
        for conn in &conns {
            for link in conn.links() {
                // Fabric links run spine -> leaf.
                shutdown_port(ctx, reverts, spine.name(), &link.from.port).await?;
            }
        }
    }

    wait(ctx, CONVERGENCE_WAIT).await;
    test_connectivity(ctx).await
}

/// On the first leaf carrying at least two mesh connections, shut all mesh
/// links but one.
pub async fn mesh_failover(ctx: &Arc<TestCtx>, reverts: &RevertStack) -> Result<()> {
    let leaves: Vec<Switch> = ctx
        .fabric
        .switches()
        .await?
        .into_iter()
        .filter(|s| s.role.is_leaf())
        .collect();

    let mut candidate = None;
    let mut with_mesh = 0;
    for leaf in &leaves {
        let conns = ctx
            .fabric
            .device_connections_of(leaf.name(), ConnectionKind::Mesh)
            .await?;
        if conns.len() >= 2 {
            with_mesh += 1;
            if candidate.is_none() {
                candidate = Some((leaf.name().to_string(), conns));
            }
        }
    }
    if with_mesh < 2 {
        return Err(TestSkip::because("not enough leaves with mesh links"));
    }
    let (leaf, conns) = candidate.expect("candidate checked above");

    disable_agent(ctx, reverts, &leaf).await?;

    let mut ports = Vec::new();
    for conn in &conns {
        for link in conn.links() {
            let end = if link.from.device == leaf {
                &link.from
            } else {
                &link.to
            };
            ports.push(end.port.clone());
        }
    }
    // Keep exactly one mesh link alive.
    for port in ports.iter().skip(1) {
        shutdown_port(ctx, reverts, &leaf, port).await?;
    }

    wait(ctx, CONVERGENCE_WAIT).await;
    test_connectivity(ctx).await
}

/// Pin a peering to a priority group, kill the primary gateway's links and
/// verify traffic fails over to the backup.
pub async fn gateway_failover(ctx: &Arc<TestCtx>, reverts: &RevertStack) -> Result<()> {
    let gateways = ctx.fabric.gateways().await?;
    if gateways.len() < 2 {
        return Err(TestSkip::because("not enough gateways"));
    }
    let vpcs = ctx.fabric.vpcs().await?;
    if vpcs.len() < 2 {
        return Err(TestSkip::because("not enough VPCs"));
    }

    let group = GatewayGroup {
        meta: Meta::named(GATEWAY_GROUP_NAME),
        members: vec![
            GatewayGroupMember {
                gateway: gateways[0].name().to_string(),
                priority: GATEWAY_PRIMARY_PRIORITY,
            },
            GatewayGroupMember {
                gateway: gateways[1].name().to_string(),
                priority: GATEWAY_BACKUP_PRIORITY,
            },
        ],
    };
    ctx.fabric.create(&group).await?;
    {
        let ctx = ctx.clone();
        reverts.push_fn(move || async move {
            ctx.fabric.delete::<GatewayGroup>(GATEWAY_GROUP_NAME).await?;
            Ok(())
        });
    }

    let peering_name = format!("{}--{}--failover", vpcs[0].name(), vpcs[1].name());
    let mut peering = GatewayPeering {
        meta: Meta::named(&peering_name),
        gateway_group: Some(GATEWAY_GROUP_NAME.to_string()),
        ..Default::default()
    };
    for vpc in [&vpcs[0], &vpcs[1]] {
        peering.peerings.insert(
            vpc.name().to_string(),
            PeeringEntry {
                expose: vec![PeeringExpose {
                    ips: vpc
                        .subnets
                        .keys()
                        .map(|subnet| PeeringIps {
                            cidr: None,
                            vpc_subnet: Some(subnet.clone()),
                        })
                        .collect(),
                    ..Default::default()
                }],
            },
        );
    }
    ctx.fabric.create(&peering).await?;
    {
        let ctx = ctx.clone();
        let name = peering_name.clone();
        reverts.push_fn(move || async move {
            ctx.fabric.delete::<GatewayPeering>(&name).await?;
            Ok(())
        });
    }
    wait(ctx, SHORT_CONVERGENCE_WAIT).await;

    // Cut every link towards the primary gateway, freezing the carrying
    // switches first.
    let primary = gateways[0].name().to_string();
    let conns = ctx
        .fabric
        .device_connections_of(&primary, ConnectionKind::Gateway)
        .await?;
    let mut frozen = BTreeSet::new();
    for conn in &conns {
        for link in conn.links() {
            // Gateway links run switch -> gateway.
            let switch = link.from.device.clone();
            if frozen.insert(switch.clone()) {
                disable_agent(ctx, reverts, &switch).await?;
            }
            shutdown_port(ctx, reverts, &switch, &link.from.port).await?;
        }
    }

    wait(ctx, CONVERGENCE_WAIT).await;
    test_connectivity(ctx).await
}

/// Flip the first unused breakout-capable port of every switch to a
/// non-default single-lane mode and back. Disables RoCE first when on.
pub async fn breakout_roundtrip(ctx: &Arc<TestCtx>, reverts: &RevertStack) -> Result<()> {
    let switches = ctx.fabric.switches().await?;

    for switch in &switches {
        if switch.roce {
            let name = switch.name().to_string();
            ctx.fabric
                .update_with::<Switch, _>(&name, |s| s.roce = false)
                .await?;
            let ctx = ctx.clone();
            reverts.push_fn(move || async move {
                ctx.fabric
                    .update_with::<Switch, _>(&name, |s| s.roce = true)
                    .await?;
                Ok(())
            });
        }
    }

    let mut flipped = 0;
    for switch in &switches {
        let Some(profile) = SwitchProfile::get(&switch.profile) else {
            bail!("switch {} has unknown profile {}", switch.name(), switch.profile);
        };
        let Some(mode) = profile.single_lane_alternative() else {
            continue;
        };

        let conns = ctx
            .fabric
            .list::<Connection>(&fabric_types::meta::LabelSelector::device(switch.name()))
            .await?;
        let used: BTreeSet<String> = conns
            .iter()
            .flat_map(|c| c.ports())
            .filter(|p| p.device == switch.name())
            .map(|p| p.port.clone())
            .collect();

        let Some(port) = profile
            .breakout_ports()
            .into_iter()
            .find(|p| !used.contains(p) && !switch.port_breakouts.contains_key(p))
        else {
            info!("{} has no unused breakout port", switch.name());
            continue;
        };

        info!("flipping {}/{} to {}", switch.name(), port, mode);
        let name = switch.name().to_string();
        let port_for_update = port.clone();
        let mode_string = mode.to_string();
        ctx.fabric
            .update_with::<Switch, _>(&name, |s| {
                s.port_breakouts
                    .insert(port_for_update.clone(), mode_string.clone());
            })
            .await?;
        {
            let ctx = ctx.clone();
            let name = name.clone();
            let port = port.clone();
            reverts.push_fn(move || async move {
                ctx.fabric
                    .update_with::<Switch, _>(&name, |s| {
                        s.port_breakouts.remove(&port);
                    })
                    .await?;
                Ok(())
            });
        }

        wait(ctx, SHORT_CONVERGENCE_WAIT).await;
        let applied: Switch = ctx.fabric.get(&name).await?;
        if applied.port_breakouts.get(&port).map(String::as_str) != Some(mode) {
            bail!("breakout mode on {}/{} did not stick", name, port);
        }
        flipped += 1;
    }

    if flipped == 0 {
        return Err(TestSkip::because("no breakout-capable port available"));
    }
    Ok(())
}

/// RoCE marking: DSCP 24 traffic must land in traffic class UC3 on a
/// RoCE-enabled leaf.
pub async fn roce_marking(ctx: &Arc<TestCtx>, _reverts: &RevertStack) -> Result<()> {
    if !ctx.env.roce {
        return Err(TestSkip::because("RoCE not enabled"));
    }
    let switches = ctx.fabric.switches().await?;
    let Some(leaf) = switches.iter().find(|s| s.roce && s.role.is_leaf()) else {
        return Err(TestSkip::because("no RoCE-enabled leaf"));
    };

    let output = ctx
        .runner
        .run(leaf.name(), "show qos map dscp-tc | grep -w 24")
        .await?;
    if !output.success() {
        bail!(
            "qos map query on {} exited {}: {}",
            leaf.name(),
            output.exit_code,
            output.stderr.trim()
        );
    }
    if !output.stdout.contains("UC3") {
        bail!(
            "DSCP 24 on {} not mapped to UC3, got {:?}",
            leaf.name(),
            output.stdout.trim()
        );
    }
    Ok(())
}
