// Copyright 2024-2025 Joblet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bridge networking. Each managed network owns a bitmap IP pool over its
//! CIDR; per-job wiring happens in two phases so the coordinator can set
//! `NETWORK_READY_FILE` into the child environment before launch and
//! finish the veth plumbing once the child's netns exists.

use crate::config::NetworkConfig;
use crate::model::NetworkAttachment;
use async_trait::async_trait;
use bit_vec::BitVec;
use joblet_common::error::JobletError;
use joblet_common::model::{JobId, NetworkMode};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const DEFAULT_NETWORK: &str = "bridge";

/// First-fit bitmap allocator over a CIDR's host range. The network
/// address, gateway and broadcast address are permanently reserved. The
/// cursor wraps so freshly released addresses are not immediately reused.
pub struct IpPool {
    base: u32,
    size: u32,
    allocated: BitVec,
    cursor: u32,
}

impl IpPool {
    pub fn new(base: Ipv4Addr, prefix_len: u8, gateway: Ipv4Addr) -> Self {
        let size = 1u32 << (32 - prefix_len);
        let base = u32::from(base) & !(size - 1);
        let mut allocated = BitVec::from_elem(size as usize, false);
        // network address, broadcast, gateway
        allocated.set(0, true);
        allocated.set((size - 1) as usize, true);
        allocated.set((u32::from(gateway) - base) as usize, true);
        Self {
            base,
            size,
            allocated,
            cursor: 0,
        }
    }

    pub fn allocate(&mut self) -> Option<Ipv4Addr> {
        for offset in 0..self.size {
            let candidate = (self.cursor + offset) % self.size;
            if !self.allocated.get(candidate as usize).unwrap_or(true) {
                self.allocated.set(candidate as usize, true);
                self.cursor = (candidate + 1) % self.size;
                return Some(Ipv4Addr::from(self.base + candidate));
            }
        }
        None
    }

    pub fn release(&mut self, ip: Ipv4Addr) {
        let value = u32::from(ip);
        if value >= self.base && value < self.base + self.size {
            self.allocated.set((value - self.base) as usize, false);
        }
    }

    pub fn allocated_count(&self) -> u32 {
        // Minus the three permanent reservations.
        self.allocated.iter().filter(|bit| *bit).count() as u32 - 3
    }

    pub fn capacity(&self) -> u32 {
        self.size - 3
    }
}

pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8), JobletError> {
    let (address, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| JobletError::invalid_request(format!("Invalid CIDR: {cidr}")))?;
    let address: Ipv4Addr = address
        .parse()
        .map_err(|_| JobletError::invalid_request(format!("Invalid CIDR address: {cidr}")))?;
    let prefix_len: u8 = prefix
        .parse()
        .map_err(|_| JobletError::invalid_request(format!("Invalid CIDR prefix: {cidr}")))?;
    if !(8..=30).contains(&prefix_len) {
        return Err(JobletError::invalid_request(format!(
            "CIDR prefix out of range (8-30): {cidr}"
        )));
    }
    Ok((address, prefix_len))
}

/// The conventional gateway is the first host of the CIDR.
pub fn gateway_of(base: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let size = 1u32 << (32 - prefix_len);
    let network = u32::from(base) & !(size - 1);
    Ipv4Addr::from(network + 1)
}

#[derive(Clone, Debug)]
pub struct NetworkInfo {
    pub name: String,
    pub cidr: String,
    pub gateway: Ipv4Addr,
    pub bridge: String,
    pub allocated: u32,
    pub capacity: u32,
}

#[async_trait]
pub trait NetworkService: Send + Sync {
    /// Phase 1: reserve an IP in the requested network. Unmanaged modes
    /// (`host`, `none`, `isolated`) return `None`.
    async fn allocate(
        &self,
        job_id: &JobId,
        mode: &NetworkMode,
        rootfs_dir: &std::path::Path,
    ) -> Result<Option<NetworkAttachment>, JobletError>;

    /// Phase 2: wire the veth pair into the child's netns and signal the
    /// readiness flag the child is polling.
    async fn attach(
        &self,
        attachment: &NetworkAttachment,
        pid: u32,
    ) -> Result<(), JobletError>;

    /// Tear down the host veth end and return the IP to the pool.
    async fn release(&self, attachment: &NetworkAttachment) -> Result<(), JobletError>;

    async fn create_network(&self, name: &str, cidr: &str) -> Result<NetworkInfo, JobletError>;

    async fn remove_network(&self, name: &str) -> Result<(), JobletError>;

    async fn list_networks(&self) -> Vec<NetworkInfo>;
}

struct NetworkState {
    cidr: String,
    base: Ipv4Addr,
    prefix_len: u8,
    gateway: Ipv4Addr,
    bridge: String,
    pool: Mutex<IpPool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NatBackend {
    Firewalld,
    Nftables,
    Iptables,
}

pub struct LinuxNetworkService {
    networks: RwLock<HashMap<String, NetworkState>>,
    command_timeout: Duration,
    nat_backend: NatBackend,
}

impl LinuxNetworkService {
    /// Creates the default bridge, assigns the gateway address and
    /// installs the masquerade rule for the default CIDR.
    pub async fn start(config: &NetworkConfig, command_timeout: Duration) -> Result<Self, JobletError> {
        let nat_backend = detect_nat_backend(&config.nat_backend, command_timeout).await;
        info!("NAT backend: {nat_backend:?}");

        let service = Self {
            networks: RwLock::new(HashMap::new()),
            command_timeout,
            nat_backend,
        };

        service
            .install_network(DEFAULT_NETWORK, &config.bridge_cidr, &config.bridge_name)
            .await?;
        Ok(service)
    }

    async fn install_network(
        &self,
        name: &str,
        cidr: &str,
        bridge: &str,
    ) -> Result<NetworkInfo, JobletError> {
        let (base, prefix_len) = parse_cidr(cidr)?;
        let gateway = gateway_of(base, prefix_len);

        self.ensure_bridge(bridge, gateway, prefix_len).await?;
        self.ensure_masquerade(cidr).await?;

        let state = NetworkState {
            cidr: cidr.to_string(),
            base,
            prefix_len,
            gateway,
            bridge: bridge.to_string(),
            pool: Mutex::new(IpPool::new(base, prefix_len, gateway)),
        };
        let info = NetworkInfo {
            name: name.to_string(),
            cidr: state.cidr.clone(),
            gateway,
            bridge: state.bridge.clone(),
            allocated: 0,
            capacity: state.pool.lock().expect("ip pool lock").capacity(),
        };
        self.networks.write().await.insert(name.to_string(), state);
        Ok(info)
    }

    async fn ensure_bridge(
        &self,
        bridge: &str,
        gateway: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), JobletError> {
        // All three are idempotent: "already exists" results are fine.
        let _ = self
            .run("ip", &["link", "add", "name", bridge, "type", "bridge"])
            .await;
        let _ = self
            .run(
                "ip",
                &[
                    "addr",
                    "add",
                    &format!("{gateway}/{prefix_len}"),
                    "dev",
                    bridge,
                ],
            )
            .await;
        self.run("ip", &["link", "set", bridge, "up"]).await?;
        Ok(())
    }

    async fn ensure_masquerade(&self, cidr: &str) -> Result<(), JobletError> {
        let result = match self.nat_backend {
            NatBackend::Firewalld => {
                self.run(
                    "firewall-cmd",
                    &[
                        "--permanent",
                        "--direct",
                        "--add-rule",
                        "ipv4",
                        "nat",
                        "POSTROUTING",
                        "0",
                        "-s",
                        cidr,
                        "-j",
                        "MASQUERADE",
                    ],
                )
                .await
                .map(|_| ())
            }
            NatBackend::Nftables => {
                // Table/chain creation is idempotent under `nft -e`;
                // ignore duplicates on the rule add.
                let _ = self
                    .run("nft", &["add", "table", "ip", "joblet"])
                    .await;
                let _ = self
                    .run(
                        "nft",
                        &[
                            "add",
                            "chain",
                            "ip",
                            "joblet",
                            "postrouting",
                            "{ type nat hook postrouting priority srcnat ; }",
                        ],
                    )
                    .await;
                self.run(
                    "nft",
                    &[
                        "add",
                        "rule",
                        "ip",
                        "joblet",
                        "postrouting",
                        "ip",
                        "saddr",
                        cidr,
                        "masquerade",
                    ],
                )
                .await
                .map(|_| ())
            }
            NatBackend::Iptables => {
                self.run(
                    "iptables",
                    &[
                        "-t",
                        "nat",
                        "-C",
                        "POSTROUTING",
                        "-s",
                        cidr,
                        "-j",
                        "MASQUERADE",
                    ],
                )
                .await
                .map(|_| ())
                .or(self
                    .run(
                        "iptables",
                        &[
                            "-t",
                            "nat",
                            "-A",
                            "POSTROUTING",
                            "-s",
                            cidr,
                            "-j",
                            "MASQUERADE",
                        ],
                    )
                    .await
                    .map(|_| ()))
            }
        };
        result.map_err(|err| JobletError::network("nat-setup", err.to_string()))
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, JobletError> {
        run_command(program, args, self.command_timeout).await
    }
}

async fn run_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, JobletError> {
    let output = tokio::time::timeout(
        timeout,
        tokio::process::Command::new(program).args(args).output(),
    )
    .await
    .map_err(|_| JobletError::timeout(format!("{program} {}", args.join(" ")), timeout))?
    .map_err(|err| JobletError::network("command-spawn", format!("{program}: {err}")))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(JobletError::network(
            "command",
            format!(
                "{program} {} failed ({}): {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ))
    }
}

async fn detect_nat_backend(configured: &str, timeout: Duration) -> NatBackend {
    match configured {
        "firewalld" => return NatBackend::Firewalld,
        "nftables" => return NatBackend::Nftables,
        "iptables" => return NatBackend::Iptables,
        _ => {}
    }
    if run_command("firewall-cmd", &["--state"], timeout).await.is_ok() {
        NatBackend::Firewalld
    } else if run_command("nft", &["--version"], timeout).await.is_ok() {
        NatBackend::Nftables
    } else {
        NatBackend::Iptables
    }
}

#[async_trait]
impl NetworkService for LinuxNetworkService {
    async fn allocate(
        &self,
        job_id: &JobId,
        mode: &NetworkMode,
        rootfs_dir: &std::path::Path,
    ) -> Result<Option<NetworkAttachment>, JobletError> {
        let Some(network_name) = mode.network_name() else {
            return Ok(None);
        };

        let networks = self.networks.read().await;
        let state = networks.get(network_name).ok_or_else(|| {
            JobletError::not_found(format!("Network not found: {network_name}"))
        })?;

        let ip = state
            .pool
            .lock()
            .expect("ip pool lock")
            .allocate()
            .ok_or_else(|| {
                JobletError::ResourceExhausted(format!(
                    "no free addresses in network {network_name} ({})",
                    state.cidr
                ))
            })?;

        let short = job_id.short();
        let ready_name = format!("joblet-network-ready-{job_id}");
        let attachment = NetworkAttachment {
            network: network_name.to_string(),
            ip,
            prefix_len: state.prefix_len,
            gateway: state.gateway,
            bridge: state.bridge.clone(),
            veth_host: format!("vh-{short}"),
            veth_peer: format!("vp-{short}"),
            ready_file_host: rootfs_dir.join("tmp").join(&ready_name),
            ready_file_child: PathBuf::from("/tmp").join(&ready_name),
        };
        debug!(job_id = %job_id, ip = %ip, "Reserved address in {network_name}");
        Ok(Some(attachment))
    }

    async fn attach(
        &self,
        attachment: &NetworkAttachment,
        pid: u32,
    ) -> Result<(), JobletError> {
        let pid_str = pid.to_string();
        let netns_flag = format!("--net=/proc/{pid}/ns/net");
        let address = format!("{}/{}", attachment.ip, attachment.prefix_len);
        let gateway = attachment.gateway.to_string();

        self.run(
            "ip",
            &[
                "link", "add", &attachment.veth_host, "type", "veth", "peer", "name",
                &attachment.veth_peer,
            ],
        )
        .await?;
        self.run(
            "ip",
            &["link", "set", &attachment.veth_peer, "netns", &pid_str],
        )
        .await?;
        self.run(
            "ip",
            &[
                "link",
                "set",
                &attachment.veth_host,
                "master",
                &attachment.bridge,
            ],
        )
        .await?;
        self.run("ip", &["link", "set", &attachment.veth_host, "up"])
            .await?;

        // The remaining configuration happens inside the child's netns.
        for args in [
            vec!["ip", "link", "set", attachment.veth_peer.as_str(), "name", "eth0"],
            vec!["ip", "addr", "add", address.as_str(), "dev", "eth0"],
            vec!["ip", "link", "set", "eth0", "up"],
            vec!["ip", "link", "set", "lo", "up"],
            vec!["ip", "route", "add", "default", "via", gateway.as_str()],
        ] {
            let mut nsenter_args = vec![netns_flag.as_str(), "--"];
            nsenter_args.extend(args);
            self.run("nsenter", &nsenter_args).await?;
        }

        // Release the child from its readiness poll.
        if let Some(parent) = attachment.ready_file_host.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::write(&attachment.ready_file_host, b"ready\n")
            .await
            .map_err(|err| JobletError::network("ready-file", err.to_string()))?;

        Ok(())
    }

    async fn release(&self, attachment: &NetworkAttachment) -> Result<(), JobletError> {
        // The peer end disappears with the netns; only the host end needs
        // explicit removal, and it may already be gone.
        if let Err(err) = self
            .run("ip", &["link", "del", &attachment.veth_host])
            .await
        {
            debug!("veth cleanup: {err}");
        }

        let networks = self.networks.read().await;
        if let Some(state) = networks.get(&attachment.network) {
            state
                .pool
                .lock()
                .expect("ip pool lock")
                .release(attachment.ip);
        }
        Ok(())
    }

    async fn create_network(&self, name: &str, cidr: &str) -> Result<NetworkInfo, JobletError> {
        if name.parse::<NetworkMode>().map_or(true, |mode| {
            !matches!(mode, NetworkMode::Named(_))
        }) {
            return Err(JobletError::invalid_request(format!(
                "Reserved or invalid network name: {name}"
            )));
        }
        if self.networks.read().await.contains_key(name) {
            return Err(JobletError::conflict(format!(
                "Network already exists: {name}"
            )));
        }

        let bridge = bridge_name_for(name);
        self.install_network(name, cidr, &bridge).await
    }

    async fn remove_network(&self, name: &str) -> Result<(), JobletError> {
        if name == DEFAULT_NETWORK {
            return Err(JobletError::conflict(
                "The default bridge network cannot be removed",
            ));
        }
        let mut networks = self.networks.write().await;
        let state = networks
            .get(name)
            .ok_or_else(|| JobletError::not_found(format!("Network not found: {name}")))?;
        let in_use = state.pool.lock().expect("ip pool lock").allocated_count();
        if in_use > 0 {
            return Err(JobletError::conflict(format!(
                "Network {name} has {in_use} allocated address(es)"
            )));
        }
        let bridge = state.bridge.clone();
        networks.remove(name);
        drop(networks);

        if let Err(err) = self.run("ip", &["link", "del", &bridge]).await {
            warn!("Bridge cleanup for {name}: {err}");
        }
        Ok(())
    }

    async fn list_networks(&self) -> Vec<NetworkInfo> {
        let networks = self.networks.read().await;
        let mut result: Vec<NetworkInfo> = networks
            .iter()
            .map(|(name, state)| {
                let pool = state.pool.lock().expect("ip pool lock");
                NetworkInfo {
                    name: name.clone(),
                    cidr: state.cidr.clone(),
                    gateway: state.gateway,
                    bridge: state.bridge.clone(),
                    allocated: pool.allocated_count(),
                    capacity: pool.capacity(),
                }
            })
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }
}

fn bridge_name_for(network: &str) -> String {
    // IFNAMSIZ is 16 including the terminator.
    let mut name = format!("jb-{network}");
    name.truncate(15);
    name
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use rand::seq::SliceRandom;

    #[test]
    fn pool_reserves_network_gateway_and_broadcast() {
        let mut pool = IpPool::new(
            Ipv4Addr::new(10, 10, 0, 0),
            30,
            Ipv4Addr::new(10, 10, 0, 1),
        );
        // /30 leaves a single usable host.
        assert_eq!(pool.capacity(), 1);
        assert_eq!(pool.allocate(), Some(Ipv4Addr::new(10, 10, 0, 2)));
        assert_eq!(pool.allocate(), None);
    }

    #[test]
    fn pool_cursor_wraps_instead_of_reusing_immediately() {
        let mut pool = IpPool::new(
            Ipv4Addr::new(10, 0, 0, 0),
            29,
            Ipv4Addr::new(10, 0, 0, 1),
        );
        let first = pool.allocate().unwrap();
        pool.release(first);
        // The next allocation continues past the released address.
        let second = pool.allocate().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn random_alloc_release_restores_free_set() {
        let mut pool = IpPool::new(
            Ipv4Addr::new(172, 20, 0, 0),
            24,
            Ipv4Addr::new(172, 20, 0, 1),
        );
        let capacity = pool.capacity();

        let mut held: Vec<Ipv4Addr> = (0..capacity)
            .map(|_| pool.allocate().expect("pool exhausted early"))
            .collect();
        assert_eq!(pool.allocate(), None);

        let mut rng = rand::rng();
        held.shuffle(&mut rng);
        for ip in held {
            pool.release(ip);
        }

        // Every address must be allocatable again.
        let reallocated: Vec<Ipv4Addr> =
            (0..capacity).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(reallocated.len(), capacity as usize);
        assert_eq!(pool.allocate(), None);
    }

    #[test]
    fn cidr_parsing() {
        let (base, prefix) = parse_cidr("172.20.0.0/16").unwrap();
        assert_eq!(base, Ipv4Addr::new(172, 20, 0, 0));
        assert_eq!(prefix, 16);
        assert_eq!(gateway_of(base, prefix), Ipv4Addr::new(172, 20, 0, 1));

        assert!(parse_cidr("172.20.0.0").is_err());
        assert!(parse_cidr("172.20.0.0/33").is_err());
        assert!(parse_cidr("notanip/16").is_err());
    }

    #[test]
    fn bridge_names_fit_ifnamsiz() {
        assert_eq!(bridge_name_for("ml"), "jb-ml");
        assert!(bridge_name_for("a-very-long-network-name").len() <= 15);
    }
}
