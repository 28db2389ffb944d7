//! Device lifecycle reconciliation
//!
//! Reconciles durable device records against live wg interfaces. Interfaces
//! never outlive the process: every startup recreates them from the store,
//! and teardown removes them again along with the firewall rules recorded by
//! the commander.

use crate::command::{Commander, RuleAction, WgArg};
use crate::config::DaemonConfig;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::{info, warn};
use wgmint_common::{addr, Device, Error, RandomSource, Result, Store};

/// Where the manager is in its process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Reconciling,
    Ready,
    TearingDown,
    Stopped,
}

/// Live state for one reconciled device.
#[derive(Debug, Clone)]
pub struct DeviceRuntime {
    pub iface_index: u32,
    pub ipv4_base: Ipv4Addr,
    pub ipv6_base: Ipv6Addr,
}

impl DeviceRuntime {
    pub fn iface(&self) -> String {
        format!("wg{}", self.iface_index)
    }
}

/// Owns the only writable mapping from device id to live interface. The
/// registry is empty before reconciliation, populated while Reconciling,
/// readable in Ready, and empty again once Stopped.
pub struct DeviceManager {
    store: Store,
    commander: Arc<Commander>,
    config: DaemonConfig,
    phase: Mutex<Phase>,
    registry: RwLock<HashMap<i64, DeviceRuntime>>,
}

impl DeviceManager {
    pub fn new(store: Store, commander: Arc<Commander>, config: DaemonConfig) -> Self {
        Self {
            store,
            commander,
            config,
            phase: Mutex::new(Phase::Uninitialized),
            registry: RwLock::new(HashMap::new()),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    /// Live interface state for a device; readable only in Ready.
    pub fn runtime(&self, device_id: i64) -> Result<DeviceRuntime> {
        self.require_ready()?;
        self.registry
            .read()
            .get(&device_id)
            .cloned()
            .ok_or(Error::NotFound {
                kind: "device",
                id: device_id,
            })
    }

    /// Lowest-id reconciled device; placement target for new peers.
    pub fn default_device(&self) -> Result<(i64, DeviceRuntime)> {
        self.require_ready()?;
        self.registry
            .read()
            .iter()
            .min_by_key(|(id, _)| **id)
            .map(|(id, runtime)| (*id, runtime.clone()))
            .ok_or(Error::Invariant("no devices reconciled".to_string()))
    }

    fn require_ready(&self) -> Result<()> {
        let phase = *self.phase.lock();
        if phase != Phase::Ready {
            return Err(Error::Invariant(format!(
                "interface registry read in phase {:?}",
                phase
            )));
        }
        Ok(())
    }

    /// Bring every stored device live, creating the first device on a fresh
    /// store. Any failure rolls the host back before the error propagates.
    pub async fn startup(&self, rng: &dyn RandomSource) -> Result<()> {
        *self.phase.lock() = Phase::Reconciling;
        if let Err(e) = self.reconcile(rng).await {
            warn!("startup failed, rolling back: {}", e);
            self.teardown().await;
            return Err(e);
        }
        *self.phase.lock() = Phase::Ready;
        info!("device reconciliation complete");
        Ok(())
    }

    async fn reconcile(&self, rng: &dyn RandomSource) -> Result<()> {
        self.commander.sysctl("net.ipv4.ip_forward=1").await?;
        self.commander.sysctl("net.ipv6.conf.all.forwarding=1").await?;

        if self.store.count_devices()? == 0 {
            self.create_first_device(rng).await?;
        }
        for device in self.store.list_devices()? {
            self.bring_up(&device).await?;
        }
        Ok(())
    }

    /// First run: allocate an address block and ask `wg` for a keypair. Keys
    /// are never synthesized locally.
    async fn create_first_device(&self, rng: &dyn RandomSource) -> Result<Device> {
        let (ipv4_base, ipv6_base) = addr::allocate_block(rng);
        let private_key = self.commander.wg(vec![WgArg::lit("genkey")], None).await?;
        let public_key = self
            .commander
            .wg(vec![WgArg::lit("pubkey")], Some(&private_key))
            .await?;
        let device = self.store.create_device(
            "",
            ipv4_base,
            ipv6_base,
            &private_key,
            &public_key,
            self.config.tunnel.listen_port,
        )?;
        info!(
            "created device {} with block {} / {}",
            device.id, ipv4_base, ipv6_base
        );
        Ok(device)
    }

    /// Probe `wg0`, `wg1`, ... until an interface name query fails; that slot
    /// is free. Probing continues from the highest slot already mapped.
    async fn next_free_iface(&self) -> Result<u32> {
        let mut index = self
            .registry
            .read()
            .values()
            .map(|r| r.iface_index + 1)
            .max()
            .unwrap_or(0);
        loop {
            let iface = format!("wg{}", index);
            match self.commander.ip(&["address", "show", "dev", &iface]).await {
                // assume the error is: Device "wgX" does not exist.
                Err(Error::Execution { .. }) => return Ok(index),
                Err(e) => return Err(e),
                Ok(_) => index += 1,
            }
        }
    }

    async fn bring_up(&self, device: &Device) -> Result<()> {
        let index = self.next_free_iface().await?;
        let runtime = DeviceRuntime {
            iface_index: index,
            ipv4_base: device.ipv4_base,
            ipv6_base: device.ipv6_base,
        };
        let iface = runtime.iface();
        {
            let mut registry = self.registry.write();
            registry.insert(device.id, runtime);
            // interface slots and device ids stay in 1:1 increasing order
            if registry.len() as i64 != device.id {
                return Err(Error::Invariant(format!(
                    "device {} mapped out of order ({} interfaces registered)",
                    device.id,
                    registry.len()
                )));
            }
        }

        let mtu = self.config.tunnel.mtu.to_string();
        self.commander
            .ip(&["link", "add", "dev", &iface, "type", "wireguard"])
            .await?;
        self.commander
            .ip(&["link", "set", "mtu", &mtu, "up", "dev", &iface])
            .await?;
        let ipv4 = addr::device_ipv4(device.ipv4_base).to_string();
        let ipv6 = addr::device_ipv6(device.ipv6_base).to_string();
        self.commander
            .ip(&["-4", "address", "add", "dev", &iface, &ipv4])
            .await?;
        self.commander
            .ip(&["-6", "address", "add", "dev", &iface, &ipv6])
            .await?;
        self.commander
            .wg(
                vec![
                    WgArg::lit("set"),
                    WgArg::lit(&iface),
                    WgArg::lit("private-key"),
                    WgArg::secret(&device.private_key),
                ],
                None,
            )
            .await?;
        self.commander
            .wg(
                vec![
                    WgArg::lit("set"),
                    WgArg::lit(&iface),
                    WgArg::lit("listen-port"),
                    WgArg::lit(device.listen_port.to_string()),
                ],
                None,
            )
            .await?;
        self.commander
            .iptables(RuleAction::append(
                "FORWARD",
                &["--in-interface", &iface, "--jump", "ACCEPT"],
            ))
            .await?;
        self.commander
            .iptables(RuleAction::append_in_table(
                "nat",
                "POSTROUTING",
                &[
                    "--out-interface",
                    &self.config.tunnel.uplink_interface,
                    "--jump",
                    "MASQUERADE",
                ],
            ))
            .await?;

        info!("interface {} up for device {}", iface, device.id);
        Ok(())
    }

    /// Roll back everything reconciliation applied: firewall rules first,
    /// then every created interface. Best-effort, and safe to call from any
    /// phase; the registry is empty afterwards.
    pub async fn teardown(&self) {
        *self.phase.lock() = Phase::TearingDown;
        self.commander.undo_all().await;

        let mut mapped: Vec<DeviceRuntime> =
            self.registry.write().drain().map(|(_, r)| r).collect();
        mapped.sort_by_key(|r| r.iface_index);
        for runtime in mapped {
            let iface = runtime.iface();
            if let Err(e) = self.commander.ip(&["link", "del", "dev", &iface]).await {
                warn!("failed to delete {}: {}", iface, e);
            }
        }
        *self.phase.lock() = Phase::Stopped;
        info!("teardown complete");
    }
}
