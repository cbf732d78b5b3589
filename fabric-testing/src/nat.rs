use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use fabric_types::meta::Meta;
use fabric_types::vpc::{
    GatewayPeering, PeeringAs, PeeringEntry, PeeringExpose, PeeringIps, PortForward, Vpc,
};
use ipnetwork::Ipv4Network;
use log::info;

use crate::connectivity::{
    iperf_probes, ping_probes, server_ips, Expectation, IperfProbe, PingProbe,
};
use crate::ops::{wait, SHORT_CONVERGENCE_WAIT};
use crate::runtime::{case, RevertStack, SkipFlag, SkipFlags, Suite, TestCtx, TestSkip};

/// Static NAT: a source maps to the pool address at the same offset from
/// its subnet start. IPv4 only; sources below the subnet start are an error.
pub fn calculate_nat_ip(
    src: Ipv4Addr,
    subnet_start: Ipv4Addr,
    pool_start: Ipv4Addr,
) -> Result<Ipv4Addr> {
    let src = u32::from(src);
    let subnet = u32::from(subnet_start);
    if src < subnet {
        bail!(
            "source {} is below subnet start {}",
            Ipv4Addr::from(src),
            Ipv4Addr::from(subnet)
        );
    }
    let offset = src - subnet;
    Ok(Ipv4Addr::from(u32::from(pool_start) + offset))
}

/// The six NAT shapes the peering tests exercise. The pools are carved
/// from disjoint /24s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NatVariant {
    MasqueradeSource,
    StaticSource,
    StaticDestination,
    Bidirectional,
    Overlap,
    MasqueradePortForward,
}

pub const NAT_POOL_A: &str = "192.168.22.0/24";
pub const NAT_POOL_B: &str = "192.168.33.0/24";
/// Masquerade pools collapse to a single host.
pub const MASQUERADE_POOL_A: &str = "192.168.22.1/32";

impl NatVariant {
    pub fn name(&self) -> &'static str {
        match self {
            NatVariant::MasqueradeSource => "masquerade-source",
            NatVariant::StaticSource => "static-source",
            NatVariant::StaticDestination => "static-destination",
            NatVariant::Bidirectional => "bidirectional",
            NatVariant::Overlap => "overlap",
            NatVariant::MasqueradePortForward => "masquerade-port-forward",
        }
    }

    /// NAT pools applied to (first, second) VPC of the peering.
    fn pools(&self) -> (Option<&'static str>, Option<&'static str>) {
        match self {
            NatVariant::MasqueradeSource | NatVariant::MasqueradePortForward => {
                (Some(MASQUERADE_POOL_A), None)
            }
            NatVariant::StaticSource => (Some(NAT_POOL_A), None),
            NatVariant::StaticDestination => (None, Some(NAT_POOL_B)),
            NatVariant::Bidirectional | NatVariant::Overlap => {
                (Some(NAT_POOL_A), Some(NAT_POOL_B))
            }
        }
    }

    fn port_forwards(&self) -> Vec<PortForward> {
        match self {
            NatVariant::MasqueradePortForward => vec![PortForward {
                protocol: "tcp".to_string(),
                from: 5201,
                to: 5201,
            }],
            _ => Vec::new(),
        }
    }
}

/// Build the peering spec of one variant between two VPCs.
pub fn peering_spec(variant: NatVariant, vpc_a: &Vpc, vpc_b: &Vpc) -> GatewayPeering {
    let (pool_a, pool_b) = variant.pools();
    let mut peering = GatewayPeering {
        meta: Meta::named(format!(
            "{}--{}--{}",
            vpc_a.name(),
            vpc_b.name(),
            variant.name()
        )),
        ..Default::default()
    };

    for (vpc, pool) in [(vpc_a, pool_a), (vpc_b, pool_b)] {
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
                    nat: pool
                        .map(|cidr| {
                            vec![PeeringAs {
                                cidr: Some(cidr.to_string()),
                            }]
                        })
                        .unwrap_or_default(),
                    ports: variant.port_forwards(),
                }],
            },
        );
    }
    peering
}

/// The address an initiator on the far side dials for a server, given the
/// server's VPC exposure. Statically translated exposures rewrite by pool
/// offset; masquerades collapse to the pool host; untranslated exposures
/// keep the real address.
pub fn destination_ip(vpc: &Vpc, pool: Option<&str>, real: Ipv4Addr) -> Result<Ipv4Addr> {
    let Some(pool) = pool else {
        return Ok(real);
    };
    let pool: Ipv4Network = pool.parse()?;
    if pool.prefix() == 32 {
        return Ok(pool.ip());
    }
    let subnet = vpc
        .subnets
        .values()
        .find_map(|s| {
            let network: Ipv4Network = s.cidr.parse().ok()?;
            network.contains(real).then_some(network)
        })
        .ok_or_else(|| anyhow!("{} not in any subnet of {}", real, vpc.name()))?;
    calculate_nat_ip(real, subnet.network(), pool.ip())
}

pub fn suite() -> Suite {
    let variants = [
        NatVariant::MasqueradeSource,
        NatVariant::StaticSource,
        NatVariant::StaticDestination,
        NatVariant::Bidirectional,
        NatVariant::Overlap,
        NatVariant::MasqueradePortForward,
    ];
    let cases = variants
        .into_iter()
        .map(|variant| {
            case(
                format!("nat-{}", variant.name()),
                SkipFlags::of(&[SkipFlag::NoGateway, SkipFlag::NoServers]),
                move |ctx, reverts| async move { nat_peering(&ctx, &reverts, variant).await },
            )
        })
        .collect();
    Suite::new("nat", cases)
}

/// Create the peering, compute the translated destinations and drive ping
/// plus iperf3 through them.
pub async fn nat_peering(
    ctx: &Arc<TestCtx>,
    reverts: &RevertStack,
    variant: NatVariant,
) -> Result<()> {
    let vpcs = ctx.fabric.vpcs().await?;
    if vpcs.len() < 2 {
        return Err(TestSkip::because("not enough VPCs"));
    }
    let (vpc_a, vpc_b) = (&vpcs[0], &vpcs[1]);

    let peering = peering_spec(variant, vpc_a, vpc_b);
    let peering_name = peering.meta.name.clone();
    info!("creating gateway peering {}", peering_name);
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

    // Servers per VPC with their discovered fabric addresses.
    let mut members: BTreeMap<&str, Vec<(String, Ipv4Addr)>> = BTreeMap::new();
    for vpc in [vpc_a, vpc_b] {
        let by_subnet = crate::vpc::servers_by_subnet(ctx, vpc.name()).await?;
        let mut list = Vec::new();
        for server in by_subnet.keys() {
            for ip in server_ips(ctx, server).await? {
                if let Ok(parsed) = ip.parse() {
                    list.push((server.clone(), parsed));
                }
            }
        }
        members.insert(vpc.name(), list);
    }
    let a_members = members.get(vpc_a.name()).cloned().unwrap_or_default();
    let b_members = members.get(vpc_b.name()).cloned().unwrap_or_default();
    if a_members.is_empty() || b_members.is_empty() {
        return Err(TestSkip::because("no attached servers on both VPCs"));
    }

    let (pool_a, pool_b) = variant.pools();
    let mut pings = Vec::new();
    let mut iperfs = Vec::new();

    // A-side initiators dial B's translated addresses and vice versa.
    for (from_side, to_side, to_vpc, to_pool) in [
        (&a_members, &b_members, vpc_b, pool_b),
        (&b_members, &a_members, vpc_a, pool_a),
    ] {
        for (from, _) in from_side.iter() {
            for (to_server, to_real) in to_side.iter() {
                let dest = destination_ip(to_vpc, to_pool, *to_real)?;
                pings.push(PingProbe {
                    from: from.clone(),
                    to_ip: dest.to_string(),
                    expect: Expectation::Reachable,
                });
                iperfs.push(IperfProbe {
                    from: from.clone(),
                    to_server: to_server.clone(),
                    to_ip: dest.to_string(),
                });
            }
        }
    }

    ping_probes(ctx, pings).await?;
    iperf_probes(ctx, iperfs).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_types::vpc::VpcSubnet;

    #[test]
    fn test_calculate_nat_ip() {
        let nat = calculate_nat_ip(
            Ipv4Addr::new(10, 0, 1, 37),
            Ipv4Addr::new(10, 0, 1, 0),
            Ipv4Addr::new(192, 168, 22, 0),
        )
        .expect("compute");
        assert_eq!(nat, Ipv4Addr::new(192, 168, 22, 37));

        let err = calculate_nat_ip(
            Ipv4Addr::new(10, 0, 0, 255),
            Ipv4Addr::new(10, 0, 1, 0),
            Ipv4Addr::new(192, 168, 22, 0),
        )
        .expect_err("below subnet");
        assert!(err.to_string().contains("below subnet start"));
    }

    fn vpc(name: &str, cidr: &str) -> Vpc {
        let mut vpc = Vpc {
            meta: Meta::named(name),
            ..Default::default()
        };
        vpc.subnets.insert(
            "default".to_string(),
            VpcSubnet {
                cidr: cidr.to_string(),
                gateway: String::new(),
                vlan: 1001,
                ..Default::default()
            },
        );
        vpc
    }

    #[test]
    fn test_destination_ip_variants() {
        let vpc_a = vpc("vpc-01", "10.0.1.0/24");
        let real = Ipv4Addr::new(10, 0, 1, 37);

        // No pool: the real address.
        assert_eq!(destination_ip(&vpc_a, None, real).expect("none"), real);

        // Static pool: offset-preserving rewrite.
        assert_eq!(
            destination_ip(&vpc_a, Some(NAT_POOL_A), real).expect("static"),
            Ipv4Addr::new(192, 168, 22, 37)
        );

        // Masquerade: the pool host.
        assert_eq!(
            destination_ip(&vpc_a, Some(MASQUERADE_POOL_A), real).expect("masq"),
            Ipv4Addr::new(192, 168, 22, 1)
        );
    }

    #[test]
    fn test_peering_specs_per_variant() {
        let vpc_a = vpc("vpc-01", "10.0.1.0/24");
        let vpc_b = vpc("vpc-02", "10.0.2.0/24");

        let spec = peering_spec(NatVariant::StaticSource, &vpc_a, &vpc_b);
        assert_eq!(
            spec.peerings["vpc-01"].expose[0].nat[0].cidr.as_deref(),
            Some(NAT_POOL_A)
        );
        assert!(spec.peerings["vpc-02"].expose[0].nat.is_empty());

        let spec = peering_spec(NatVariant::Bidirectional, &vpc_a, &vpc_b);
        assert!(!spec.peerings["vpc-01"].expose[0].nat.is_empty());
        assert!(!spec.peerings["vpc-02"].expose[0].nat.is_empty());

        let spec = peering_spec(NatVariant::MasqueradePortForward, &vpc_a, &vpc_b);
        assert_eq!(spec.peerings["vpc-01"].expose[0].ports.len(), 1);
        assert_eq!(spec.peerings["vpc-01"].expose[0].ports[0].from, 5201);

        let spec = peering_spec(NatVariant::MasqueradeSource, &vpc_a, &vpc_b);
        assert_eq!(
            spec.peerings["vpc-01"].expose[0].nat[0].cidr.as_deref(),
            Some(MASQUERADE_POOL_A)
        );
    }

    #[test]
    fn test_suite_has_six_variants() {
        let suite = suite();
        assert_eq!(suite.cases.len(), 6);
        assert!(suite.cases.iter().any(|c| c.name == "nat-overlap"));
    }
}
