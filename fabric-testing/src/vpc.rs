use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use fabric_types::vpc::Vpc;
use log::info;

use crate::connectivity::{discover_server_ips, ping_probes, Expectation, PingProbe};
use crate::ops::{wait, SHORT_CONVERGENCE_WAIT};
use crate::runtime::{case, RevertStack, SkipFlag, SkipFlags, Suite, TestCtx, TestSkip};

pub fn suite() -> Suite {
    Suite::new(
        "vpc",
        vec![case(
            "isolation-restriction",
            SkipFlags::of(&[SkipFlag::NoServers]),
            |ctx, reverts| async move { isolation_ladder(&ctx, &reverts).await },
        )],
    )
}

/// Should two servers of one VPC reach each other, given the current
/// isolation, restriction and permit-list state?
///
/// Intra-subnet traffic is cut by `restricted`; inter-subnet traffic is cut
/// by `isolated` on either end unless a permit group spans both subnets.
pub fn expect_within_vpc(vpc: &Vpc, subnet_a: &str, subnet_b: &str) -> Expectation {
    let (Some(a), Some(b)) = (vpc.subnets.get(subnet_a), vpc.subnets.get(subnet_b)) else {
        return Expectation::Unreachable;
    };

    if subnet_a == subnet_b {
        return if a.restricted {
            Expectation::Unreachable
        } else {
            Expectation::Reachable
        };
    }

    if !a.isolated && !b.isolated {
        return Expectation::Reachable;
    }
    let permitted = vpc.permits.iter().any(|group| {
        group.iter().any(|s| s == subnet_a) && group.iter().any(|s| s == subnet_b)
    });
    if permitted {
        Expectation::Reachable
    } else {
        Expectation::Unreachable
    }
}

/// Map servers of one VPC to their subnet, through the VPC attachments.
/// The connection names lead with the server name.
pub async fn servers_by_subnet(
    ctx: &TestCtx,
    vpc: &str,
) -> Result<BTreeMap<String, String>> {
    let attachments = ctx.fabric.vpc_attachments().await?;
    let mut by_server = BTreeMap::new();
    for attachment in attachments {
        if attachment.vpc_name() != vpc {
            continue;
        }
        let Some(server) = attachment.connection.split("--").next() else {
            continue;
        };
        by_server.insert(server.to_string(), attachment.subnet_name().to_string());
    }
    Ok(by_server)
}

/// Ping every server pair of the VPC against the model's expectation.
async fn check_vpc_connectivity(ctx: &Arc<TestCtx>, vpc_name: &str) -> Result<()> {
    let vpc: Vpc = ctx.fabric.get(vpc_name).await?;
    let membership = servers_by_subnet(ctx, vpc_name).await?;
    let ips = discover_server_ips(ctx).await?;

    let mut probes = Vec::new();
    for (from, from_subnet) in &membership {
        for (to, to_subnet) in &membership {
            if from == to {
                continue;
            }
            let expect = expect_within_vpc(&vpc, from_subnet, to_subnet);
            for ip in ips.get(to).map(Vec::as_slice).unwrap_or_default() {
                probes.push(PingProbe {
                    from: from.clone(),
                    to_ip: ip.clone(),
                    expect,
                });
            }
        }
    }
    ping_probes(ctx, probes).await
}

/// The isolation ladder: isolate subnet 1, restrict subnet 2, both on
/// subnet 3, then override everything with an explicit permit list.
pub async fn isolation_ladder(ctx: &Arc<TestCtx>, reverts: &RevertStack) -> Result<()> {
    let vpcs = ctx.fabric.vpcs().await?;
    let Some(vpc) = vpcs.iter().find(|v| v.subnets.len() >= 3) else {
        return Err(TestSkip::because("no VPC with three subnets"));
    };
    let name = vpc.name().to_string();
    let subnets: Vec<String> = vpc.subnets.keys().take(3).cloned().collect();

    // One revert restores the original flags and permit list whatever step
    // the case died in.
    {
        let ctx = ctx.clone();
        let name = name.clone();
        let original = vpc.clone();
        reverts.push_fn(move || async move {
            ctx.fabric
                .update_with::<Vpc, _>(&name, |live| {
                    live.permits = original.permits.clone();
                    for (subnet_name, subnet) in live.subnets.iter_mut() {
                        if let Some(was) = original.subnets.get(subnet_name) {
                            subnet.isolated = was.isolated;
                            subnet.restricted = was.restricted;
                        }
                    }
                })
                .await?;
            Ok(())
        });
    }

    let steps: [(usize, bool, bool); 3] = [(0, true, false), (1, false, true), (2, true, true)];
    for (index, isolated, restricted) in steps {
        let subnet = subnets[index].clone();
        info!(
            "setting {}/{} isolated={} restricted={}",
            name, subnet, isolated, restricted
        );
        ctx.fabric
            .update_with::<Vpc, _>(&name, |live| {
                if let Some(subnet) = live.subnets.get_mut(&subnet) {
                    subnet.isolated = isolated;
                    subnet.restricted = restricted;
                }
            })
            .await?;
        wait(ctx, SHORT_CONVERGENCE_WAIT).await;
        check_vpc_connectivity(ctx, &name).await?;
    }

    // Permit list spanning all three subnets overrides the isolation.
    info!("permitting {:?} on {}", subnets, name);
    let permit = subnets.clone();
    ctx.fabric
        .update_with::<Vpc, _>(&name, |live| {
            live.permits = vec![permit.clone()];
        })
        .await?;
    wait(ctx, SHORT_CONVERGENCE_WAIT).await;
    check_vpc_connectivity(ctx, &name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Fabric;
    use crate::memstore::MemoryStore;
    use crate::runtime::{TestEnv, TestOpts};
    use crate::ssh::ScriptedRunner;
    use fabric_types::fab::FabConfig;
    use fabric_types::meta::Meta;
    use fabric_types::vpc::{VpcAttachment, VpcSubnet};

    fn three_subnet_vpc() -> Vpc {
        let mut vpc = Vpc {
            meta: Meta::named("vpc-01"),
            ..Default::default()
        };
        for (index, subnet) in ["subnet-01", "subnet-02", "subnet-03"].iter().enumerate() {
            vpc.subnets.insert(
                subnet.to_string(),
                VpcSubnet {
                    cidr: format!("10.0.{}.0/24", index + 1),
                    gateway: format!("10.0.{}.1", index + 1),
                    vlan: 1001 + index as u16,
                    ..Default::default()
                },
            );
        }
        vpc
    }

    #[test]
    fn test_expectation_model() {
        let mut vpc = three_subnet_vpc();

        // Everything open.
        assert_eq!(
            expect_within_vpc(&vpc, "subnet-01", "subnet-02"),
            Expectation::Reachable
        );
        assert_eq!(
            expect_within_vpc(&vpc, "subnet-01", "subnet-01"),
            Expectation::Reachable
        );

        // Isolation cuts inter-subnet traffic.
        vpc.subnets.get_mut("subnet-01").expect("subnet").isolated = true;
        assert_eq!(
            expect_within_vpc(&vpc, "subnet-01", "subnet-02"),
            Expectation::Unreachable
        );
        assert_eq!(
            expect_within_vpc(&vpc, "subnet-02", "subnet-01"),
            Expectation::Unreachable
        );
        // But not intra-subnet traffic.
        assert_eq!(
            expect_within_vpc(&vpc, "subnet-01", "subnet-01"),
            Expectation::Reachable
        );

        // Restriction cuts intra-subnet traffic only.
        vpc.subnets.get_mut("subnet-02").expect("subnet").restricted = true;
        assert_eq!(
            expect_within_vpc(&vpc, "subnet-02", "subnet-02"),
            Expectation::Unreachable
        );
        assert_eq!(
            expect_within_vpc(&vpc, "subnet-02", "subnet-03"),
            Expectation::Reachable
        );

        // Permit overrides isolation, not restriction.
        vpc.permits = vec![vec!["subnet-01".to_string(), "subnet-02".to_string()]];
        assert_eq!(
            expect_within_vpc(&vpc, "subnet-01", "subnet-02"),
            Expectation::Reachable
        );
        assert_eq!(
            expect_within_vpc(&vpc, "subnet-02", "subnet-02"),
            Expectation::Unreachable
        );
    }

    async fn ladder_ctx() -> Arc<TestCtx> {
        let fabric = Fabric::new(Arc::new(MemoryStore::new()));
        fabric.create(&three_subnet_vpc()).await.expect("vpc");
        for (index, subnet) in ["subnet-01", "subnet-02", "subnet-03"].iter().enumerate() {
            fabric
                .create(&VpcAttachment {
                    meta: Meta::named(format!("vpc-01--{}--server-{:02}", subnet, index + 1)),
                    subnet: format!("vpc-01/{}", subnet),
                    connection: format!("server-{:02}--unbundled--leaf-01", index + 1),
                })
                .await
                .expect("attachment");
        }
        Arc::new(TestCtx {
            fabric,
            runner: Arc::new(ScriptedRunner::new()),
            env: TestEnv::default(),
            opts: TestOpts {
                wait_scale: 0.0,
                ..Default::default()
            },
            fab: FabConfig::default(),
        })
    }

    #[tokio::test]
    async fn test_ladder_mutates_and_reverts() {
        let ctx = ladder_ctx().await;
        let reverts = RevertStack::new();

        isolation_ladder(&ctx, &reverts).await.expect("ladder");

        let vpc: Vpc = ctx.fabric.get("vpc-01").await.expect("vpc");
        assert!(vpc.subnets["subnet-01"].isolated);
        assert!(vpc.subnets["subnet-02"].restricted);
        assert!(vpc.subnets["subnet-03"].isolated && vpc.subnets["subnet-03"].restricted);
        assert_eq!(vpc.permits.len(), 1);

        for revert in reverts.drain_lifo() {
            revert().await.expect("revert");
        }
        let vpc: Vpc = ctx.fabric.get("vpc-01").await.expect("vpc");
        assert!(!vpc.subnets["subnet-01"].isolated);
        assert!(!vpc.subnets["subnet-02"].restricted);
        assert!(vpc.permits.is_empty());
    }

    #[tokio::test]
    async fn test_ladder_skips_without_three_subnets() {
        let fabric = Fabric::new(Arc::new(MemoryStore::new()));
        let ctx = Arc::new(TestCtx {
            fabric,
            runner: Arc::new(ScriptedRunner::new()),
            env: TestEnv::default(),
            opts: TestOpts {
                wait_scale: 0.0,
                ..Default::default()
            },
            fab: FabConfig::default(),
        });
        let err = isolation_ladder(&ctx, &RevertStack::new())
            .await
            .expect_err("skip");
        assert!(err.downcast_ref::<TestSkip>().is_some());
    }

    #[tokio::test]
    async fn test_servers_by_subnet() {
        let ctx = ladder_ctx().await;
        let membership = servers_by_subnet(&ctx, "vpc-01").await.expect("membership");
        assert_eq!(membership.get("server-01").map(String::as_str), Some("subnet-01"));
        assert_eq!(membership.get("server-03").map(String::as_str), Some("subnet-03"));
    }
}
