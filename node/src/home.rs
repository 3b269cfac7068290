//! # Data Directory
//!
//! Layout of a node's data directory:
//!
//! ```text
//! <data_dir>/
//!   device.key    hex-encoded Ed25519 seed (0600 on unix)
//!   config.json   EngineConfig, optional
//!   db/           sled intent store
//! ```

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use toss_protocol::auth::StaticGate;
use toss_protocol::clock::{system_clock, SharedClock};
use toss_protocol::config::EngineConfig;
use toss_protocol::crypto::DeviceKeypair;
use toss_protocol::storage::{PersistentStore, SledStore};
use toss_protocol::OfflineDevice;

use crate::offline::{DisconnectedLedger, NoRadio};

const KEY_FILE: &str = "device.key";
const CONFIG_FILE: &str = "config.json";
const DB_DIR: &str = "db";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn key_path(&self) -> PathBuf {
        self.root.join(KEY_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join(DB_DIR)
    }

    /// Create the directory, a fresh device key and a default config.
    /// An existing key is kept unless `force` is set; an existing config is
    /// never touched.
    pub fn init(&self, force: bool) -> Result<DeviceKeypair> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create data directory {}", self.root.display()))?;

        let key_path = self.key_path();
        if key_path.exists() && !force {
            bail!(
                "device key already exists at {} (use --force to replace it)",
                key_path.display()
            );
        }
        let keypair = DeviceKeypair::generate();
        write_secret(&key_path, &hex::encode(keypair.secret_key_bytes()))?;

        let config_path = self.config_path();
        if !config_path.exists() {
            let json = serde_json::to_string_pretty(&EngineConfig::default())
                .context("failed to serialize default config")?;
            fs::write(&config_path, json)
                .with_context(|| format!("failed to write {}", config_path.display()))?;
        }

        Ok(keypair)
    }

    pub fn load_keypair(&self) -> Result<DeviceKeypair> {
        let key_path = self.key_path();
        let hex = fs::read_to_string(&key_path).with_context(|| {
            format!(
                "failed to read device key {} (run `toss-node init` first)",
                key_path.display()
            )
        })?;
        DeviceKeypair::from_hex(&hex)
            .with_context(|| format!("malformed device key in {}", key_path.display()))
    }

    /// `explicit` wins; otherwise `config.json` in the data directory if it
    /// exists; otherwise defaults. Missing fields take their defaults.
    pub fn load_config(&self, explicit: Option<&Path>) -> Result<EngineConfig> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let path = self.config_path();
                if !path.exists() {
                    return Ok(EngineConfig::default());
                }
                path
            }
        };
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Open the sled store and assemble the device on top of it.
    pub fn open_device(&self, config: EngineConfig) -> Result<(OfflineDevice, Arc<SledStore>)> {
        self.open_device_with_clock(config, system_clock())
    }

    pub fn open_device_with_clock(
        &self,
        config: EngineConfig,
        clock: SharedClock,
    ) -> Result<(OfflineDevice, Arc<SledStore>)> {
        let keypair = self.load_keypair()?;
        let db_path = self.db_path();
        let store = Arc::new(
            SledStore::open(&db_path)
                .with_context(|| format!("failed to open intent store at {}", db_path.display()))?,
        );
        let backend: Arc<dyn PersistentStore> = store.clone();
        // No one to ask for credentials on a headless node.
        let device = OfflineDevice::new(
            keypair,
            config,
            clock,
            backend,
            Arc::new(DisconnectedLedger),
            Arc::new(NoRadio),
            Arc::new(StaticGate(false)),
        )
        .context("failed to assemble device engine")?;
        Ok((device, store))
    }
}

fn write_secret(path: &Path, contents: &str) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_load_round_trips_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let home = DataDir::new(dir.path().join("node"));

        let created = home.init(false).unwrap();
        let loaded = home.load_keypair().unwrap();
        assert_eq!(created.public_key(), loaded.public_key());
        assert!(home.config_path().exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(home.key_path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let home = DataDir::new(dir.path());

        let first = home.init(false).unwrap();
        assert!(home.init(false).is_err());
        let second = home.init(true).unwrap();
        assert_ne!(first.public_key(), second.public_key());
    }

    #[test]
    fn config_falls_back_to_defaults_and_fills_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let home = DataDir::new(dir.path());
        assert_eq!(home.load_config(None).unwrap().mtu, EngineConfig::default().mtu);

        let custom = dir.path().join("custom.json");
        fs::write(&custom, r#"{ "mtu": 128 }"#).unwrap();
        let config = home.load_config(Some(&custom)).unwrap();
        assert_eq!(config.mtu, 128);
        assert_eq!(config.max_peers, EngineConfig::default().max_peers);
    }

    #[test]
    fn missing_key_is_a_clear_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DataDir::new(dir.path()).load_keypair().unwrap_err();
        assert!(format!("{:#}", err).contains("toss-node init"));
    }

    #[tokio::test]
    async fn device_opens_on_the_sled_store() {
        let dir = tempfile::tempdir().unwrap();
        let home = DataDir::new(dir.path());
        let keypair = home.init(false).unwrap();

        let (device, store) = home.open_device(EngineConfig::default()).unwrap();
        assert_eq!(device.public_key(), keypair.public_key());
        store.flush().unwrap();
    }
}
