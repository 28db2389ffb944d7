//! Peer registration and startup replay
//!
//! A peer is a public key bound to an account and placed on a device. The
//! durable record is the source of truth; the live `wg` peer entry is
//! derived from it, at registration time and again on every startup.

use crate::command::{Commander, WgArg};
use crate::lifecycle::DeviceManager;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::{debug, info};
use wgmint_common::{addr, Account, Error, Peer, Result, Store, ValidationError};

/// A registered peer's allowed-address set, rendered as
/// `<ipv4>/32,<ipv6>/128` on the wire and in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowedIps {
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
}

impl fmt::Display for AllowedIps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/32,{}/128", self.ipv4, self.ipv6)
    }
}

pub struct Provisioner {
    store: Store,
    commander: Arc<Commander>,
    devices: Arc<DeviceManager>,
}

impl Provisioner {
    pub fn new(store: Store, commander: Arc<Commander>, devices: Arc<DeviceManager>) -> Self {
        Self {
            store,
            commander,
            devices,
        }
    }

    /// Key shape check: WireGuard public keys are 44 base64 characters, but
    /// the accepted range is kept loose for other curve encodings.
    pub fn validate_pubkey(key: &str) -> Result<()> {
        if !(42..=71).contains(&key.len()) {
            return Err(ValidationError::PubkeyLength.into());
        }
        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '+' | '='))
        {
            return Err(ValidationError::PubkeyCharset.into());
        }
        Ok(())
    }

    /// Register `public_key` for `account` on `device_id`.
    ///
    /// Re-registration by the owning account returns the existing addresses;
    /// a key held by another account is a conflict. The quota check and the
    /// insert are not one atomic unit: concurrent registrations for the same
    /// account can land inside the window and transiently exceed the quota.
    /// A `wg set` failure after the insert leaves the record in place with
    /// no live peer; the next startup replay converges the two.
    pub async fn register(
        &self,
        account: &Account,
        device_id: i64,
        public_key: &str,
    ) -> Result<AllowedIps> {
        Self::validate_pubkey(public_key)?;

        if let Some(existing) = self.store.peer_by_pubkey(public_key)? {
            if existing.account_id != account.id {
                return Err(Error::Conflict);
            }
            debug!("peer {} re-registered", existing.id);
            return self.addresses_for(&existing);
        }

        let count = self.store.count_peers_for_account(account.id)?;
        if count >= account.peers_max {
            return Err(Error::QuotaExceeded);
        }

        let peer = self.store.create_peer(account.id, public_key, device_id)?;
        let ips = self.push_live(&peer).await?;
        info!("registered peer {} for account {}", peer.id, account.id);
        Ok(ips)
    }

    fn addresses_for(&self, peer: &Peer) -> Result<AllowedIps> {
        let runtime = self.devices.runtime(peer.device_id)?;
        let (ipv4, ipv6) = addr::peer_addresses(runtime.ipv4_base, runtime.ipv6_base, peer.id);
        Ok(AllowedIps { ipv4, ipv6 })
    }

    /// Push one stored peer onto its live interface. Idempotent: `wg set
    /// peer` replaces an existing entry, so replaying onto a fresh interface
    /// is the normal path.
    pub async fn push_live(&self, peer: &Peer) -> Result<AllowedIps> {
        let runtime = self.devices.runtime(peer.device_id)?;
        let (ipv4, ipv6) = addr::peer_addresses(runtime.ipv4_base, runtime.ipv6_base, peer.id);
        let ips = AllowedIps { ipv4, ipv6 };
        self.commander
            .wg(
                vec![
                    WgArg::lit("set"),
                    WgArg::lit(runtime.iface()),
                    WgArg::lit("peer"),
                    WgArg::lit(&peer.public_key),
                    WgArg::lit("allowed-ips"),
                    WgArg::lit(ips.to_string()),
                ],
                None,
            )
            .await?;
        Ok(ips)
    }

    /// Replay every stored peer in id order onto the live interfaces. Runs
    /// after device reconciliation on every startup.
    pub async fn replay_all(&self) -> Result<()> {
        for peer in self.store.list_peers()? {
            self.push_live(&peer).await?;
            debug!("replayed peer {}", peer.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingExecutor;
    use crate::config::DaemonConfig;
    use wgmint_common::SeededRandom;

    struct Fixture {
        executor: Arc<RecordingExecutor>,
        store: Store,
        devices: Arc<DeviceManager>,
        provisioner: Provisioner,
    }

    async fn fixture() -> Fixture {
        let executor = RecordingExecutor::new();
        executor.fail_when("address show");
        let store = Store::open_memory().unwrap();
        let commander = Arc::new(Commander::new(executor.clone()));
        let devices = Arc::new(DeviceManager::new(
            store.clone(),
            commander.clone(),
            DaemonConfig::default(),
        ));
        devices.startup(&SeededRandom::new(42)).await.unwrap();
        let provisioner = Provisioner::new(store.clone(), commander, devices.clone());
        Fixture {
            executor,
            store,
            devices,
            provisioner,
        }
    }

    fn test_key(n: u32) -> String {
        // syntactically valid: 44 base64 characters
        format!("{:043}=", n)
    }

    fn account_with_quota(store: &Store, code: &str, quota: i64) -> Account {
        store
            .create_account(code, quota, 0, i64::MAX, "")
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_is_idempotent_per_account() {
        let fx = fixture().await;
        let account = account_with_quota(&fx.store, "OWNER", 7);
        let (device_id, _) = fx.devices.default_device().unwrap();

        let first = fx
            .provisioner
            .register(&account, device_id, &test_key(1))
            .await
            .unwrap();
        let second = fx
            .provisioner
            .register(&account, device_id, &test_key(1))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(fx.store.count_peers_for_account(account.id).unwrap(), 1);

        // peer ordinal 1: both addresses sit at base + 39
        let runtime = fx.devices.runtime(device_id).unwrap();
        assert_eq!(
            u32::from(first.ipv4) - u32::from(runtime.ipv4_base),
            39
        );
        assert!(first.to_string().contains("/32,"));
        assert!(first.to_string().ends_with("/128"));
    }

    #[tokio::test]
    async fn test_foreign_key_conflicts() {
        let fx = fixture().await;
        let owner = account_with_quota(&fx.store, "OWNER", 7);
        let other = account_with_quota(&fx.store, "OTHER", 7);
        let (device_id, _) = fx.devices.default_device().unwrap();

        fx.provisioner
            .register(&owner, device_id, &test_key(1))
            .await
            .unwrap();
        let err = fx
            .provisioner
            .register(&other, device_id, &test_key(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict));
        assert_eq!(fx.store.count_peers_for_account(other.id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_quota_exhaustion() {
        let fx = fixture().await;
        let account = account_with_quota(&fx.store, "LIMITED", 7);
        let (device_id, _) = fx.devices.default_device().unwrap();

        for n in 0..7 {
            fx.provisioner
                .register(&account, device_id, &test_key(n))
                .await
                .unwrap();
        }
        let err = fx
            .provisioner
            .register(&account, device_id, &test_key(99))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded));
        assert_eq!(fx.store.count_peers_for_account(account.id).unwrap(), 7);

        // re-registering an existing key still succeeds at quota
        fx.provisioner
            .register(&account, device_id, &test_key(3))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pubkey_shape() {
        assert!(matches!(
            Provisioner::validate_pubkey("too-short"),
            Err(Error::Validation(ValidationError::PubkeyLength))
        ));
        assert!(matches!(
            Provisioner::validate_pubkey(&"x".repeat(72)),
            Err(Error::Validation(ValidationError::PubkeyLength))
        ));
        assert!(matches!(
            Provisioner::validate_pubkey(&format!("{}{}", "!", "a".repeat(43))),
            Err(Error::Validation(ValidationError::PubkeyCharset))
        ));
        assert!(Provisioner::validate_pubkey(&test_key(5)).is_ok());
        assert!(Provisioner::validate_pubkey(&"A".repeat(42)).is_ok());
        assert!(Provisioner::validate_pubkey(&"A".repeat(71)).is_ok());
    }

    #[tokio::test]
    async fn test_register_pushes_live() {
        let fx = fixture().await;
        let account = account_with_quota(&fx.store, "OWNER", 7);
        let (device_id, _) = fx.devices.default_device().unwrap();

        let ips = fx
            .provisioner
            .register(&account, device_id, &test_key(1))
            .await
            .unwrap();
        let expected = format!("wg set wg0 peer {} allowed-ips {}", test_key(1), ips);
        assert!(fx.executor.commands().contains(&expected));
    }

    #[tokio::test]
    async fn test_replay_all_in_id_order() {
        let fx = fixture().await;
        let account = account_with_quota(&fx.store, "OWNER", 7);
        let (device_id, _) = fx.devices.default_device().unwrap();

        for n in 0..3 {
            fx.provisioner
                .register(&account, device_id, &test_key(n))
                .await
                .unwrap();
        }

        let before = fx.executor.commands().len();
        fx.provisioner.replay_all().await.unwrap();
        let replayed: Vec<String> = fx.executor.commands()[before..]
            .iter()
            .filter(|c| c.contains(" peer "))
            .cloned()
            .collect();
        assert_eq!(replayed.len(), 3);
        assert!(replayed[0].contains(&test_key(0)));
        assert!(replayed[2].contains(&test_key(2)));
    }
}
