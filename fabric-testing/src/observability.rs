use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use fabric_types::fab::PushTarget;
use log::{info, warn};
use reqwest::StatusCode;

use crate::runtime::{case, RevertStack, SkipFlag, SkipFlags, Suite, TestCtx};

/// An entry younger than this counts as fresh.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(300);
/// Log query lookback.
pub const QUERY_WINDOW: Duration = Duration::from_secs(300);
pub const QUERY_RETRIES: usize = 6;
pub const QUERY_BACKOFF: Duration = Duration::from_secs(10);
pub const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(15);

pub fn suite() -> Suite {
    Suite::new(
        "observability",
        vec![
            case(
                "loki-freshness",
                SkipFlags::of(&[SkipFlag::NoLoki]),
                |ctx, reverts| async move { loki_freshness(&ctx, &reverts).await },
            ),
            case(
                "prometheus-freshness",
                SkipFlags::of(&[SkipFlag::NoProm]),
                |ctx, reverts| async move { prometheus_freshness(&ctx, &reverts).await },
            ),
        ],
    )
}

/// Loki push URL -> query API base.
///
/// Grafana Cloud pushes to `/loki/api/v1/push`; the query API lives next
/// to it. Generic endpoints lose their `/push` suffix and gain `/api/v1`
/// when absent.
pub fn loki_query_base(push_url: &str) -> String {
    let push_url = push_url.trim_end_matches('/');
    if let Some(base) = push_url.strip_suffix("/api/v1/push") {
        return format!("{}/api/v1", base);
    }
    let base = push_url.strip_suffix("/push").unwrap_or(push_url);
    if base.ends_with("/api/v1") {
        base.to_string()
    } else {
        format!("{}/api/v1", base)
    }
}

/// Prometheus push URL -> query API base.
///
/// Grafana Cloud pushes to `/api/prom/push`; remote-write endpoints end in
/// `/api/v1/write`; generic endpoints behave like Loki's.
pub fn prom_query_base(push_url: &str) -> String {
    let push_url = push_url.trim_end_matches('/');
    if let Some(base) = push_url.strip_suffix("/api/prom/push") {
        return format!("{}/api/prom/api/v1", base);
    }
    if let Some(base) = push_url.strip_suffix("/api/v1/write") {
        return format!("{}/api/v1", base);
    }
    let base = push_url.strip_suffix("/push").unwrap_or(push_url);
    if base.ends_with("/api/v1") {
        base.to_string()
    } else {
        format!("{}/api/v1", base)
    }
}

/// Devices expected to push: switches, gateways and the alloy controller
/// pods of the control nodes.
pub async fn expected_hostnames(ctx: &TestCtx) -> Result<Vec<String>> {
    let mut hostnames = Vec::new();
    for switch in ctx.fabric.switches().await? {
        hostnames.push(switch.name().to_string());
    }
    for gateway in ctx.fabric.gateways().await? {
        hostnames.push(gateway.name().to_string());
    }
    for control in &ctx.fab.controls {
        hostnames.push(format!("alloy-{}", control.name));
    }
    Ok(hostnames)
}

fn apply_auth(request: reqwest::RequestBuilder, target: &PushTarget) -> reqwest::RequestBuilder {
    match &target.basic_auth {
        Some(auth) => request.basic_auth(&auth.username, Some(&auth.password)),
        None => request,
    }
}

async fn preflight(
    client: &reqwest::Client,
    target: &PushTarget,
    url: &str,
    target_name: &str,
) -> Result<()> {
    let response = apply_auth(client.get(url), target)
        .timeout(PREFLIGHT_TIMEOUT)
        .send()
        .await
        .with_context(|| format!("preflight against {}", url))?;
    if response.status() == StatusCode::UNAUTHORIZED {
        bail!("authentication failed for target {} ({})", target_name, url);
    }
    if !response.status().is_success() {
        bail!(
            "preflight against {} returned {}",
            url,
            response.status()
        );
    }
    Ok(())
}

/// GET with retries; observability backends shed load routinely.
async fn query_json(
    ctx: &TestCtx,
    client: &reqwest::Client,
    target: &PushTarget,
    url: &str,
) -> Result<serde_json::Value> {
    let mut last: Option<anyhow::Error> = None;
    for attempt in 1..=QUERY_RETRIES {
        let result = apply_auth(client.get(url), target).send().await;
        match result {
            Ok(response) if response.status().is_success() => {
                return response.json().await.context("decoding query response");
            }
            Ok(response) => {
                last = Some(anyhow::anyhow!("{} returned {}", url, response.status()));
            }
            Err(err) => last = Some(err.into()),
        }
        if attempt < QUERY_RETRIES {
            tokio::time::sleep(ctx.opts.scaled(QUERY_BACKOFF)).await;
        }
    }
    Err(last.unwrap_or_else(|| anyhow::anyhow!("query against {} failed", url)))
}

/// Freshness across expected hostnames: pass when any device is fresh,
/// warn on partial misses; `require_all_fresh` tightens to all.
fn evaluate_freshness(
    kind: &str,
    fresh: &[String],
    stale: &[String],
    require_all: bool,
) -> Result<()> {
    if fresh.is_empty() {
        bail!("{}: no expected device has fresh data", kind);
    }
    if !stale.is_empty() {
        if require_all {
            bail!("{}: stale devices: {}", kind, stale.join(", "));
        }
        warn!("{}: no fresh data from: {}", kind, stale.join(", "));
    }
    Ok(())
}

fn loki_result_is_fresh(body: &serde_json::Value, now_ns: i128) -> bool {
    let window_ns = FRESHNESS_WINDOW.as_nanos() as i128;
    body.pointer("/data/result")
        .and_then(|r| r.as_array())
        .map(|streams| {
            streams.iter().any(|stream| {
                stream
                    .pointer("/values")
                    .and_then(|v| v.as_array())
                    .map(|values| {
                        values.iter().any(|entry| {
                            entry
                                .get(0)
                                .and_then(|ts| ts.as_str())
                                .and_then(|ts| ts.parse::<i128>().ok())
                                .map(|ts| now_ns - ts <= window_ns)
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

fn prom_result_is_fresh(body: &serde_json::Value, now_s: f64) -> bool {
    let window_s = FRESHNESS_WINDOW.as_secs_f64();
    body.pointer("/data/result")
        .and_then(|r| r.as_array())
        .map(|series| {
            series.iter().any(|sample| {
                sample
                    .pointer("/value/0")
                    .and_then(|ts| ts.as_f64())
                    .map(|ts| now_s - ts <= window_s)
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

pub async fn loki_freshness(ctx: &Arc<TestCtx>, _reverts: &RevertStack) -> Result<()> {
    let client = reqwest::Client::new();
    let hostnames = expected_hostnames(ctx).await?;

    for (name, target) in &ctx.fab.observability.loki_targets {
        let base = loki_query_base(&target.url);
        preflight(&client, target, &format!("{}/labels", base), name).await?;

        let now = Utc::now();
        let start_ns = (now - chrono::Duration::from_std(QUERY_WINDOW)?).timestamp_nanos_opt();
        let mut fresh = Vec::new();
        let mut stale = Vec::new();
        for hostname in &hostnames {
            let query = format!("{{hostname=\"{}\"}}", hostname);
            let url = format!(
                "{}/query_range?query={}&start={}&limit=10",
                base,
                urlencode(&query),
                start_ns.unwrap_or_default()
            );
            let body = query_json(ctx, &client, target, &url).await?;
            let now_ns = now.timestamp_nanos_opt().unwrap_or_default() as i128;
            if loki_result_is_fresh(&body, now_ns) {
                fresh.push(hostname.clone());
            } else {
                stale.push(hostname.clone());
            }
        }
        info!(
            "loki target {}: {} fresh, {} stale",
            name,
            fresh.len(),
            stale.len()
        );
        evaluate_freshness("loki", &fresh, &stale, ctx.opts.require_all_fresh)?;
    }
    Ok(())
}

pub async fn prometheus_freshness(ctx: &Arc<TestCtx>, _reverts: &RevertStack) -> Result<()> {
    let client = reqwest::Client::new();

    for (name, target) in &ctx.fab.observability.prometheus_targets {
        let base = prom_query_base(&target.url);
        preflight(&client, target, &format!("{}/query?query=up", base), name).await?;

        let query = match target.env_label() {
            Some(env) => format!("fabric_agent_agent_generation{{env=\"{}\"}}", env),
            None => "fabric_agent_agent_generation".to_string(),
        };
        let url = format!("{}/query?query={}", base, urlencode(&query));
        let body = query_json(ctx, &client, target, &url).await?;

        let now_s = Utc::now().timestamp() as f64;
        if !prom_result_is_fresh(&body, now_s) {
            if ctx.opts.require_all_fresh {
                bail!("prometheus target {}: no fresh agent generation samples", name);
            }
            warn!("prometheus target {}: no fresh agent generation samples", name);
        } else {
            info!("prometheus target {}: fresh agent generation samples", name);
        }
    }
    Ok(())
}

fn urlencode(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}
