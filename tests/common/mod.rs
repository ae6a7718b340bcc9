#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rshd::channel::MemoryChannel;
use rshd::config::ShellConfig;
use rshd::registry::ClientConnection;
use rshd::shell::probe::{FixedProbe, OsVersion};
use rshd::shell::ShellDispatcher;

/// Generous bound for anything that involves a real shell.
pub const WAIT: Duration = Duration::from_secs(10);

pub const MODERN_HOST: OsVersion = OsVersion::new(10, 0, 19045);
pub const OLD_HOST: OsVersion = OsVersion::new(10, 0, 17134);

/// Connection stub with a fixed user and address.
#[derive(Debug)]
pub struct TestClient {
    pub user: String,
    pub addr: String,
}

impl ClientConnection for TestClient {
    fn user(&self) -> &str {
        &self.user
    }

    fn remote_addr(&self) -> String {
        self.addr.clone()
    }
}

pub fn client(user: &str, addr: &str) -> TestClient {
    TestClient {
        user: user.to_string(),
        addr: addr.to_string(),
    }
}

/// `/bin/sh` for both pseudo-terminal and pipe sessions.
pub fn sh_config() -> ShellConfig {
    ShellConfig {
        program: Some("/bin/sh".into()),
        raw_program: Some("/bin/sh".into()),
        raw_args: Some(Vec::new()),
        drain_timeout_ms: Some(1000),
        ..Default::default()
    }
}

pub fn dispatcher(config: ShellConfig, version: OsVersion) -> Arc<ShellDispatcher> {
    Arc::new(ShellDispatcher::new(config, Arc::new(FixedProbe(version))))
}

/// Wait for `needle` in the channel output without blocking the runtime.
pub async fn wait_for_output(channel: &Arc<MemoryChannel>, needle: &str) -> bool {
    let channel = Arc::clone(channel);
    let needle = needle.to_string();
    tokio::task::spawn_blocking(move || channel.wait_for_output(&needle, WAIT))
        .await
        .expect("wait task panicked")
}
