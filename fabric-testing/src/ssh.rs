use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_ssh2_tokio::{AuthMethod, Client, ServerCheckMethod};
use async_trait::async_trait;
use fabric_vlab::ids::{self, VmIds};
use log::debug;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Command execution against a node named in the wiring. The harness talks
/// to switches, servers and gateways exclusively through this seam so tests
/// can run against a scripted fake.
#[async_trait]
pub trait NodeRunner: Send + Sync {
    async fn run(&self, node: &str, cmd: &str) -> Result<CommandOutput>;
}

/// SSH runner resolving nodes through the VLAB identity space:
/// every VM's SSH lands on `127.0.0.1:22000+vm`.
pub struct SshRunner {
    user: String,
    key_path: PathBuf,
    addrs: BTreeMap<String, (String, u16)>,
}

impl SshRunner {
    pub fn new(user: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            key_path: key_path.into(),
            addrs: BTreeMap::new(),
        }
    }

    /// Register every VM of the identity map at its usernet forward port.
    pub fn with_vlab_ids(mut self, ids: &VmIds) -> Result<Self> {
        for (name, vm) in ids.iter() {
            let port = ids::ssh_port(vm)
                .with_context(|| format!("ssh port for VM {} out of range", name))?;
            self.addrs
                .insert(name.to_string(), ("127.0.0.1".to_string(), port));
        }
        Ok(self)
    }

    pub fn register(&mut self, node: impl Into<String>, host: impl Into<String>, port: u16) {
        self.addrs.insert(node.into(), (host.into(), port));
    }
}

#[async_trait]
impl NodeRunner for SshRunner {
    async fn run(&self, node: &str, cmd: &str) -> Result<CommandOutput> {
        let (host, port) = self
            .addrs
            .get(node)
            .with_context(|| format!("node {} has no known address", node))?;

        debug!("ssh {}@{}:{} {:?}", self.user, host, port, cmd);
        let key_path = self.key_path.to_string_lossy().to_string();
        let client = Client::connect(
            (host.as_str(), *port),
            &self.user,
            AuthMethod::with_key_file(&key_path, None),
            ServerCheckMethod::NoCheck,
        )
        .await
        .with_context(|| format!("connecting to {} at {}:{}", node, host, port))?;

        let result = client
            .execute(cmd)
            .await
            .with_context(|| format!("running {:?} on {}", cmd, node))?;

        Ok(CommandOutput {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_status,
        })
    }
}

/// Scripted runner for harness tests and dry runs: matches commands by
/// substring, records every invocation, and answers with canned output.
#[derive(Default)]
pub struct ScriptedRunner {
    responses: Mutex<Vec<(Option<String>, String, CommandOutput)>>,
    history: Mutex<Vec<(String, String)>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `cmd_contains` on any node with the given stdout.
    pub fn respond(&self, cmd_contains: impl Into<String>, stdout: impl Into<String>) {
        self.responses.lock().expect("poisoned").push((
            None,
            cmd_contains.into(),
            CommandOutput {
                stdout: stdout.into(),
                ..Default::default()
            },
        ));
    }

    /// Answer `cmd_contains` on one node with a full output record.
    pub fn respond_on(
        &self,
        node: impl Into<String>,
        cmd_contains: impl Into<String>,
        output: CommandOutput,
    ) {
        self.responses
            .lock()
            .expect("poisoned")
            .push((Some(node.into()), cmd_contains.into(), output));
    }

    pub fn history(&self) -> Vec<(String, String)> {
        self.history.lock().expect("poisoned").clone()
    }

    pub fn commands_on(&self, node: &str) -> Vec<String> {
        self.history()
            .into_iter()
            .filter(|(n, _)| n == node)
            .map(|(_, cmd)| cmd)
            .collect()
    }
}

#[async_trait]
impl NodeRunner for ScriptedRunner {
    async fn run(&self, node: &str, cmd: &str) -> Result<CommandOutput> {
        self.history
            .lock()
            .expect("poisoned")
            .push((node.to_string(), cmd.to_string()));

        let responses = self.responses.lock().expect("poisoned");
        for (target, needle, output) in responses.iter() {
            if let Some(target) = target {
                if target != node {
                    continue;
                }
            }
            if cmd.contains(needle.as_str()) {
                return Ok(output.clone());
            }
        }
        Ok(CommandOutput::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_runner_matches_and_records() {
        let runner = ScriptedRunner::new();
        runner.respond("ip -o -4 addr show", "2: enp2s1 inet 10.0.1.5/24");
        runner.respond_on(
            "leaf-01",
            "shutdown",
            CommandOutput {
                stdout: String::new(),
                stderr: "err".to_string(),
                exit_code: 1,
            },
        );

        let out = runner
            .run("server-01", "/usr/sbin/ip -o -4 addr show")
            .await
            .expect("run");
        assert!(out.stdout.contains("enp2s1"));
        assert!(out.success());

        let out = runner
            .run("leaf-01", "config interface shutdown Ethernet0")
            .await
            .expect("run");
        assert!(!out.success());

        // Same command on another node falls through to the default.
        let out = runner
            .run("leaf-02", "config interface shutdown Ethernet0")
            .await
            .expect("run");
        assert!(out.success());

        assert_eq!(runner.history().len(), 3);
        assert_eq!(runner.commands_on("leaf-01").len(), 1);
    }
}
