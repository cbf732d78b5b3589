use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use fabric_types::connection::Connection;
use fabric_types::vpc::{AdvertisedRoute, DhcpOptions, DhcpRange, DhcpSubnet, Vpc, VpcAttachment};
use futures::future::join_all;
use ipnetwork::Ipv4Network;
use log::info;

use crate::ops::{wait, SHORT_CONVERGENCE_WAIT};
use crate::runtime::{case, RevertStack, SkipFlag, SkipFlags, Suite, TestCtx, TestSkip};
use crate::ssh::CommandOutput;

/// Lease set during the renewal test.
pub const RENEWAL_LEASE_SECONDS: u32 = 60;
/// Time for the DHCP server to pick up a changed lease config.
pub const LEASE_PROPAGATION_WAIT: Duration = Duration::from_secs(30);
/// Tolerance when checking an observed lease against the configured one.
pub const LEASE_TOLERANCE_SECONDS: u32 = 120;
const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub fn suite() -> Suite {
    Suite::new(
        "dhcp",
        vec![
            case(
                "options",
                SkipFlags::of(&[SkipFlag::NoServers]),
                |ctx, reverts| async move { dhcp_options(&ctx, &reverts).await },
            ),
            case(
                "renewal",
                SkipFlags::of(&[SkipFlag::NoServers]),
                |ctx, reverts| async move { dhcp_renewal(&ctx, &reverts).await },
            ),
            case(
                "static-lease",
                SkipFlags::of(&[SkipFlag::NoServers]),
                |ctx, reverts| async move { dhcp_static_lease(&ctx, &reverts).await },
            ),
        ],
    )
}

fn renew_cmd(iface: &str) -> String {
    format!("sudo sh -c 'dhclient -r {0}; dhclient {0}'", iface)
}

/// Remaining/configured lease seconds as the server sees them.
const LEASE_QUERY_CMD: &str =
    "grep dhcp-lease-time /var/lib/dhcp/dhclient.leases | tail -1 | tr -dc 0-9";

async fn run_ok(ctx: &TestCtx, node: &str, cmd: &str) -> Result<CommandOutput> {
    let output = ctx.runner.run(node, cmd).await?;
    if !output.success() {
        bail!(
            "{:?} on {} exited {}: {}",
            cmd,
            node,
            output.exit_code,
            output.stderr.trim()
        );
    }
    Ok(output)
}

/// The server and server-side interface behind a VPC attachment.
async fn attachment_endpoint(ctx: &TestCtx, attachment: &VpcAttachment) -> Result<(String, String)> {
    let conn: Connection = ctx.fabric.get(&attachment.connection).await?;
    let link = conn
        .links()
        .first()
        .cloned()
        .cloned()
        .ok_or_else(|| anyhow!("connection {} has no links", attachment.connection))?;
    Ok((link.from.device.clone(), link.from.port.clone()))
}

/// Set DNS/NTP/MTU/lease/route options on one attached subnet and verify
/// each of them from the server's point of view.
pub async fn dhcp_options(ctx: &Arc<TestCtx>, reverts: &RevertStack) -> Result<()> {
    let attachments = ctx.fabric.vpc_attachments().await?;
    let Some(attachment) = attachments.first() else {
        return Err(TestSkip::because("no VPC attachments"));
    };
    let vpc_name = attachment.vpc_name().to_string();
    let subnet_name = attachment.subnet_name().to_string();
    let (server, iface) = attachment_endpoint(ctx, attachment).await?;

    let vpc: Vpc = ctx.fabric.get(&vpc_name).await?;
    let subnet = vpc
        .subnets
        .get(&subnet_name)
        .ok_or_else(|| anyhow!("{} has no subnet {}", vpc_name, subnet_name))?;
    let gateway = subnet.gateway.clone();
    let original = subnet.dhcp.options.clone();

    let options = DhcpOptions {
        dns_servers: vec!["1.1.1.1".to_string()],
        time_servers: vec!["1.1.1.1".to_string()],
        interface_mtu: Some(1400),
        lease_time_seconds: Some(1800),
        advertised_routes: vec![AdvertisedRoute {
            destination: "9.9.9.9/32".to_string(),
            gateway: gateway.clone(),
        }],
        disable_default_route: false,
    };

    {
        let subnet_for_update = subnet_name.clone();
        let new_options = options.clone();
        ctx.fabric
            .update_with::<Vpc, _>(&vpc_name, |live| {
                if let Some(subnet) = live.subnets.get_mut(&subnet_for_update) {
                    subnet.dhcp.options = Some(new_options.clone());
                }
            })
            .await?;
        let ctx = ctx.clone();
        let vpc_name = vpc_name.clone();
        let subnet_name = subnet_name.clone();
        reverts.push_fn(move || async move {
            ctx.fabric
                .update_with::<Vpc, _>(&vpc_name, |live| {
                    if let Some(subnet) = live.subnets.get_mut(&subnet_name) {
                        subnet.dhcp.options = original.clone();
                    }
                })
                .await?;
            Ok(())
        });
    }

    wait(ctx, SHORT_CONVERGENCE_WAIT).await;
    run_ok(ctx, &server, &renew_cmd(&iface)).await?;

    run_ok(ctx, &server, "grep \"nameserver 1.1.1.1\" /etc/resolv.conf").await?;
    run_ok(ctx, &server, "timedatectl show-timesync | grep 1.1.1.1").await?;
    run_ok(
        ctx,
        &server,
        &format!("ip link show dev {} | grep \"mtu 1400\"", iface),
    )
    .await?;

    let lease = run_ok(ctx, &server, LEASE_QUERY_CMD).await?;
    let observed: u32 = lease
        .stdout
        .trim()
        .parse()
        .with_context(|| format!("lease time {:?} is not a number", lease.stdout.trim()))?;
    let want = options.lease_time_seconds.unwrap_or_default();
    if observed.abs_diff(want) > LEASE_TOLERANCE_SECONDS {
        bail!(
            "lease time on {} is {}, want {} +/- {}",
            server,
            observed,
            want,
            LEASE_TOLERANCE_SECONDS
        );
    }

    let route = run_ok(ctx, &server, "ip route show 9.9.9.9/32").await?;
    if !route.stdout.contains(&format!("via {}", gateway)) {
        bail!(
            "route to 9.9.9.9/32 on {} is {:?}, want via {}",
            server,
            route.stdout.trim(),
            gateway
        );
    }

    if options.disable_default_route {
        let default = run_ok(ctx, &server, &format!("ip route show default dev {}", iface)).await?;
        if !default.stdout.trim().is_empty() {
            bail!(
                "default route on {} still present: {:?}",
                server,
                default.stdout.trim()
            );
        }
    }
    Ok(())
}

/// Shrink the lease on every DHCP-enabled subnet of one VPC and wait for
/// every picked server to observe it, one task per server.
pub async fn dhcp_renewal(ctx: &Arc<TestCtx>, reverts: &RevertStack) -> Result<()> {
    let vpcs = ctx.fabric.vpcs().await?;
    let Some(vpc) = vpcs.iter().find(|v| v.dhcp_subnets().next().is_some()) else {
        return Err(TestSkip::because("no DHCP-enabled subnets"));
    };
    let vpc_name = vpc.name().to_string();

    let membership = crate::vpc::servers_by_subnet(ctx, &vpc_name).await?;
    let enabled: Vec<String> = vpc.dhcp_subnets().map(|(name, _)| name.clone()).collect();
    let mut servers: Vec<String> = membership
        .iter()
        .filter(|(_, subnet)| enabled.contains(*subnet))
        .map(|(server, _)| server.clone())
        .collect();
    if servers.is_empty() {
        return Err(TestSkip::because("no servers on DHCP-enabled subnets"));
    }
    if !ctx.opts.extended {
        servers.truncate(1);
    }

    // Save original lease times, then force 60 s everywhere.
    {
        let original = vpc.clone();
        let ctx = ctx.clone();
        let name = vpc_name.clone();
        reverts.push_fn(move || async move {
            ctx.fabric
                .update_with::<Vpc, _>(&name, |live| {
                    for (subnet_name, subnet) in live.subnets.iter_mut() {
                        let was = original
                            .subnets
                            .get(subnet_name)
                            .and_then(|s| s.dhcp.options.as_ref())
                            .and_then(|o| o.lease_time_seconds);
                        if let Some(options) = subnet.dhcp.options.as_mut() {
                            options.lease_time_seconds = was;
                        }
                    }
                })
                .await?;
            Ok(())
        });
    }
    ctx.fabric
        .update_with::<Vpc, _>(&vpc_name, |live| {
            for (_, subnet) in live.subnets.iter_mut() {
                if !subnet.dhcp.enable {
                    continue;
                }
                subnet
                    .dhcp
                    .options
                    .get_or_insert_with(DhcpOptions::default)
                    .lease_time_seconds = Some(RENEWAL_LEASE_SECONDS);
            }
        })
        .await?;

    wait(ctx, LEASE_PROPAGATION_WAIT).await;

    // One polling task per server, bounded by twice the configured lease.
    let deadline = ctx
        .opts
        .scaled(Duration::from_secs(2 * RENEWAL_LEASE_SECONDS as u64));
    let tasks = servers.into_iter().map(|server| {
        let ctx = ctx.clone();
        async move {
            let poll = async {
                loop {
                    if let Ok(output) = ctx.runner.run(&server, LEASE_QUERY_CMD).await {
                        if let Ok(observed) = output.stdout.trim().parse::<u32>() {
                            if observed <= RENEWAL_LEASE_SECONDS {
                                info!("{} renewed with lease {}", server, observed);
                                return Ok(());
                            }
                        }
                    }
                    tokio::time::sleep(ctx.opts.scaled(POLL_INTERVAL)).await;
                    tokio::task::yield_now().await;
                }
            };
            match tokio::time::timeout(deadline.max(Duration::from_millis(10)), poll).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!(
                    "{} did not observe lease <= {} within {:?}",
                    server,
                    RENEWAL_LEASE_SECONDS,
                    deadline
                )),
            }
        }
    });

    let failures: Vec<String> = join_all(tasks)
        .await
        .into_iter()
        .filter_map(|r: Result<()>| r.err().map(|e| e.to_string()))
        .collect();
    if !failures.is_empty() {
        bail!("renewal failures: {}", failures.join("; "));
    }
    Ok(())
}

fn offset_ip(base: Ipv4Addr, offset: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(base) + offset)
}

/// Pin a static lease for one server and verify both the interface address
/// and the DHCP server's allocation map. The allocation may take a moment
/// to surface, so the map check polls.
pub async fn assign_static_lease(
    ctx: &Arc<TestCtx>,
    reverts: &RevertStack,
    vpc_name: &str,
    subnet_name: &str,
    server: &str,
    iface: &str,
    mac: &str,
    target: Ipv4Addr,
) -> Result<()> {
    info!("pinning {} ({}) to {}", server, mac, target);
    {
        let subnet = subnet_name.to_string();
        let mac_key = mac.to_string();
        ctx.fabric
            .update_with::<Vpc, _>(vpc_name, |live| {
                if let Some(subnet) = live.subnets.get_mut(&subnet) {
                    subnet
                        .dhcp
                        .static_leases
                        .insert(mac_key.clone(), target.to_string());
                }
            })
            .await?;
        let ctx = ctx.clone();
        let vpc_name = vpc_name.to_string();
        let subnet = subnet_name.to_string();
        let mac_key = mac.to_string();
        reverts.push_fn(move || async move {
            ctx.fabric
                .update_with::<Vpc, _>(&vpc_name, |live| {
                    if let Some(subnet) = live.subnets.get_mut(&subnet) {
                        subnet.dhcp.static_leases.remove(&mac_key);
                    }
                })
                .await?;
            Ok(())
        });
    }

    wait(ctx, SHORT_CONVERGENCE_WAIT).await;
    run_ok(ctx, server, &renew_cmd(iface)).await?;

    let addr = run_ok(ctx, server, &format!("ip -o -4 addr show dev {}", iface)).await?;
    if !addr.stdout.contains(&target.to_string()) {
        bail!(
            "{} did not take static address {}, has {:?}",
            server,
            target,
            addr.stdout.trim()
        );
    }

    let status_name = format!("{}--{}", vpc_name, subnet_name);
    let deadline = ctx.opts.scaled(Duration::from_secs(60));
    let poll = async {
        loop {
            let status: DhcpSubnet = ctx.fabric.get(&status_name).await?;
            if status.status.allocated.get(mac).map(String::as_str) == Some(&target.to_string()) {
                return Ok::<(), anyhow::Error>(());
            }
            tokio::time::sleep(ctx.opts.scaled(POLL_INTERVAL)).await;
            tokio::task::yield_now().await;
        }
    };
    match tokio::time::timeout(deadline.max(Duration::from_millis(10)), poll).await {
        Ok(result) => result,
        Err(_) => bail!(
            "{} allocation for {} did not reach {} within {:?}",
            status_name,
            mac,
            target,
            deadline
        ),
    }
}

/// Constrain the DHCP range to `base+10..base+50`, then pin a static lease
/// inside the range (base+20) and outside it (base+100).
pub async fn dhcp_static_lease(ctx: &Arc<TestCtx>, reverts: &RevertStack) -> Result<()> {
    let attachments = ctx.fabric.vpc_attachments().await?;
    let Some(attachment) = attachments.first() else {
        return Err(TestSkip::because("no VPC attachments"));
    };
    let vpc_name = attachment.vpc_name().to_string();
    let subnet_name = attachment.subnet_name().to_string();
    let (server, iface) = attachment_endpoint(ctx, attachment).await?;

    let vpc: Vpc = ctx.fabric.get(&vpc_name).await?;
    let subnet = vpc
        .subnets
        .get(&subnet_name)
        .ok_or_else(|| anyhow!("{} has no subnet {}", vpc_name, subnet_name))?;
    let network: Ipv4Network = subnet
        .cidr
        .parse()
        .with_context(|| format!("parsing subnet CIDR {:?}", subnet.cidr))?;
    let base = network.network();

    // Constrain the dynamic range.
    {
        let original_range = subnet.dhcp.range.clone();
        let subnet_for_update = subnet_name.clone();
        let range = DhcpRange {
            start: offset_ip(base, 10).to_string(),
            end: offset_ip(base, 50).to_string(),
        };
        ctx.fabric
            .update_with::<Vpc, _>(&vpc_name, |live| {
                if let Some(subnet) = live.subnets.get_mut(&subnet_for_update) {
                    subnet.dhcp.enable = true;
                    subnet.dhcp.range = Some(range.clone());
                }
            })
            .await?;
        let ctx = ctx.clone();
        let vpc_for_revert = vpc_name.clone();
        let subnet_for_revert = subnet_name.clone();
        reverts.push_fn(move || async move {
            ctx.fabric
                .update_with::<Vpc, _>(&vpc_for_revert, |live| {
                    if let Some(subnet) = live.subnets.get_mut(&subnet_for_revert) {
                        subnet.dhcp.range = original_range.clone();
                    }
                })
                .await?;
            Ok(())
        });
    }

    let mac = run_ok(
        ctx,
        &server,
        &format!("cat /sys/class/net/{}/address", iface),
    )
    .await?
    .stdout
    .trim()
    .to_string();
    if mac.is_empty() {
        bail!("could not read MAC of {}/{}", server, iface);
    }

    // In range, then out of range.
    assign_static_lease(
        ctx,
        reverts,
        &vpc_name,
        &subnet_name,
        &server,
        &iface,
        &mac,
        offset_ip(base, 20),
    )
    .await?;
    assign_static_lease(
        ctx,
        reverts,
        &vpc_name,
        &subnet_name,
        &server,
        &iface,
        &mac,
        offset_ip(base, 100),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Fabric;
    use crate::memstore::MemoryStore;
    use crate::runtime::{TestEnv, TestOpts};
    use crate::ssh::ScriptedRunner;
    use fabric_types::connection::{Link, Port, UnbundledConn};
    use fabric_types::fab::FabConfig;
    use fabric_types::meta::Meta;
    use fabric_types::vpc::{DhcpConfig, DhcpSubnetStatus, VpcSubnet};

    async fn dhcp_ctx() -> (Arc<TestCtx>, Arc<ScriptedRunner>) {
        let fabric = Fabric::new(Arc::new(MemoryStore::new()));

        let mut vpc = Vpc {
            meta: Meta::named("vpc-01"),
            ..Default::default()
        };
        vpc.subnets.insert(
            "default".to_string(),
            VpcSubnet {
                cidr: "10.0.1.0/24".to_string(),
                gateway: "10.0.1.1".to_string(),
                vlan: 1001,
                dhcp: DhcpConfig {
                    enable: true,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        fabric.create(&vpc).await.expect("vpc");

        let mut conn = Connection::named("server-01--unbundled--leaf-01");
        conn.unbundled = Some(UnbundledConn {
            link: Link::new(Port::new("server-01", "enp2s1"), Port::new("leaf-01", "E1/5")),
        });
        fabric.create(&conn).await.expect("conn");

        fabric
            .create(&VpcAttachment {
                meta: Meta::named("vpc-01--default--server-01"),
                subnet: "vpc-01/default".to_string(),
                connection: "server-01--unbundled--leaf-01".to_string(),
            })
            .await
            .expect("attachment");

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
    async fn test_options_set_verified_and_reverted() {
        let (ctx, runner) = dhcp_ctx().await;
        runner.respond("dhcp-lease-time", "1795");
        let reverts = RevertStack::new();

        dhcp_options(&ctx, &reverts).await.expect("case");

        let vpc: Vpc = ctx.fabric.get("vpc-01").await.expect("vpc");
        let options = vpc.subnets["default"].dhcp.options.as_ref().expect("options");
        assert_eq!(options.dns_servers, vec!["1.1.1.1"]);
        assert_eq!(options.interface_mtu, Some(1400));
        assert_eq!(options.lease_time_seconds, Some(1800));
        assert_eq!(options.advertised_routes[0].destination, "9.9.9.9/32");

        // The verifications actually ran against the server.
        let commands = runner.commands_on("server-01");
        assert!(commands.iter().any(|c| c.contains("resolv.conf")));
        assert!(commands.iter().any(|c| c.contains("mtu 1400")));
        assert!(commands.iter().any(|c| c.contains("9.9.9.9/32")));

        for revert in reverts.drain_lifo() {
            revert().await.expect("revert");
        }
        let vpc: Vpc = ctx.fabric.get("vpc-01").await.expect("vpc");
        assert!(vpc.subnets["default"].dhcp.options.is_none());
    }

    #[tokio::test]
    async fn test_options_rejects_drifted_lease() {
        let (ctx, runner) = dhcp_ctx().await;
        runner.respond("dhcp-lease-time", "900");
        let err = dhcp_options(&ctx, &RevertStack::new())
            .await
            .expect_err("lease out of tolerance");
        assert!(err.to_string().contains("lease time"));
    }

    #[tokio::test]
    async fn test_renewal_sets_lease_and_polls() {
        let (ctx, runner) = dhcp_ctx().await;
        runner.respond("dhcp-lease-time", "58");
        let reverts = RevertStack::new();

        dhcp_renewal(&ctx, &reverts).await.expect("case");

        let vpc: Vpc = ctx.fabric.get("vpc-01").await.expect("vpc");
        assert_eq!(
            vpc.subnets["default"]
                .dhcp
                .options
                .as_ref()
                .and_then(|o| o.lease_time_seconds),
            Some(RENEWAL_LEASE_SECONDS)
        );

        for revert in reverts.drain_lifo() {
            revert().await.expect("revert");
        }
        let vpc: Vpc = ctx.fabric.get("vpc-01").await.expect("vpc");
        assert_eq!(
            vpc.subnets["default"]
                .dhcp
                .options
                .as_ref()
                .and_then(|o| o.lease_time_seconds),
            None
        );
    }

    #[tokio::test]
    async fn test_static_lease_in_range() {
        let (ctx, runner) = dhcp_ctx().await;
        runner.respond("/sys/class/net/enp2s1/address", "0c:20:12:fe:03:01");
        runner.respond("ip -o -4 addr show dev enp2s1", "3: enp2s1 inet 10.0.1.20/24");

        // The DHCP server has already surfaced the allocation.
        let mut status = DhcpSubnet {
            meta: Meta::named("vpc-01--default"),
            status: DhcpSubnetStatus::default(),
        };
        status
            .status
            .allocated
            .insert("0c:20:12:fe:03:01".to_string(), "10.0.1.20".to_string());
        ctx.fabric.create(&status).await.expect("dhcp subnet");

        let reverts = RevertStack::new();
        assign_static_lease(
            &ctx,
            &reverts,
            "vpc-01",
            "default",
            "server-01",
            "enp2s1",
            "0c:20:12:fe:03:01",
            Ipv4Addr::new(10, 0, 1, 20),
        )
        .await
        .expect("assign");

        let vpc: Vpc = ctx.fabric.get("vpc-01").await.expect("vpc");
        assert_eq!(
            vpc.subnets["default"]
                .dhcp
                .static_leases
                .get("0c:20:12:fe:03:01")
                .map(String::as_str),
            Some("10.0.1.20")
        );

        for revert in reverts.drain_lifo() {
            revert().await.expect("revert");
        }
        let vpc: Vpc = ctx.fabric.get("vpc-01").await.expect("vpc");
        assert!(vpc.subnets["default"].dhcp.static_leases.is_empty());
    }

    #[test]
    fn test_offset_ip() {
        let base = Ipv4Addr::new(10, 0, 1, 0);
        assert_eq!(offset_ip(base, 10), Ipv4Addr::new(10, 0, 1, 10));
        assert_eq!(offset_ip(base, 100), Ipv4Addr::new(10, 0, 1, 100));
    }
}
