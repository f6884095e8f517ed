//! Pairing record
//!
//! The daemon's half of a pairing: the secret, the session id and the
//! addresses it advertises. Persisted as TOML readable only by the owner,
//! and rendered as the QR text the client scans.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use ras_core::config::DaemonConfig;
use ras_core::stun::discover_reflexive;
use ras_core::time::current_time_secs;
use ras_core::{netinfo, overlay};
use ras_protocol::{MasterSecret, PairingPayload, MASTER_SECRET_SIZE};

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    session_id: String,
    secret: String,
    rendezvous: SocketAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    overlay_address: Option<SocketAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    public_address: Option<SocketAddr>,
    created_at: u64,
}

/// One pairing, as the daemon stores it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRecord {
    payload: PairingPayload,
    created_at: u64,
}

impl PairingRecord {
    /// Fresh pairing with a random secret and session id
    pub fn generate(
        rendezvous: SocketAddr,
        overlay_address: Option<SocketAddr>,
        public_address: Option<SocketAddr>,
    ) -> Result<Self> {
        let mut secret = [0u8; MASTER_SECRET_SIZE];
        OsRng.fill_bytes(&mut secret);
        let session_id = uuid::Uuid::new_v4().to_string();

        let mut payload =
            PairingPayload::new(rendezvous, MasterSecret::from_bytes(secret), session_id)
                .context("Failed to build pairing payload")?;
        if let Some(addr) = overlay_address {
            payload = payload.with_overlay_address(addr);
        }
        if let Some(addr) = public_address {
            payload = payload.with_public_address(addr);
        }

        Ok(Self {
            payload,
            created_at: current_time_secs(),
        })
    }

    pub fn payload(&self) -> &PairingPayload {
        &self.payload
    }

    pub fn session_id(&self) -> &str {
        self.payload.session_id()
    }

    /// Unix time the pairing was created
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Text to render as a QR code
    pub fn qr_text(&self) -> String {
        self.payload.to_qr_text()
    }

    /// Same pairing, advertised at a new rendezvous address
    pub fn with_rendezvous(&self, rendezvous: SocketAddr) -> Self {
        Self {
            payload: self.payload.with_rendezvous(rendezvous),
            created_at: self.created_at,
        }
    }

    /// Load a stored record
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pairing record {:?}", path))?;
        let stored: StoredRecord =
            toml::from_str(&content).context("Failed to parse pairing record")?;

        let bytes = hex::decode(&stored.secret).context("Pairing secret is not hex")?;
        let secret: [u8; MASTER_SECRET_SIZE] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Pairing secret must be {} bytes", MASTER_SECRET_SIZE))?;

        let mut payload = PairingPayload::new(
            stored.rendezvous,
            MasterSecret::from_bytes(secret),
            stored.session_id,
        )
        .context("Stored pairing record is invalid")?;
        if let Some(addr) = stored.overlay_address {
            payload = payload.with_overlay_address(addr);
        }
        if let Some(addr) = stored.public_address {
            payload = payload.with_public_address(addr);
        }

        Ok(Self {
            payload,
            created_at: stored.created_at,
        })
    }

    /// Write the record, readable only by the owner on Unix
    pub fn save(&self, path: &Path) -> Result<()> {
        let stored = StoredRecord {
            session_id: self.payload.session_id().to_string(),
            secret: hex::encode(self.payload.secret().expose_secret()),
            rendezvous: self.payload.rendezvous(),
            overlay_address: self.payload.overlay_address(),
            public_address: self.payload.public_address(),
            created_at: self.created_at,
        };
        let content = toml::to_string_pretty(&stored).context("Failed to encode pairing record")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write pairing record {:?}", path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to restrict permissions on {:?}", path))?;
        }

        Ok(())
    }
}

/// Address clients should signal, from the bind address or the LAN route
pub fn rendezvous_address(config: &DaemonConfig) -> Option<SocketAddr> {
    let port = config.signaling_bind.port();
    let ip = if config.signaling_bind.ip().is_unspecified() {
        netinfo::detect_lan_ip()?
    } else {
        config.signaling_bind.ip()
    };
    Some(SocketAddr::new(ip, port))
}

/// Overlay address to advertise, when Tailscale is up
pub fn overlay_address(config: &DaemonConfig) -> Option<SocketAddr> {
    overlay::local_overlay_ip().map(|ip: IpAddr| SocketAddr::new(ip, config.signaling_bind.port()))
}

/// Public address as seen by STUN, paired with the signaling port
pub async fn public_address(config: &DaemonConfig) -> Option<SocketAddr> {
    if config.stun_servers.is_empty() {
        return None;
    }
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    match discover_reflexive(&socket, &config.stun_servers, Duration::from_secs(2)).await {
        Ok(reflexive) => Some(SocketAddr::new(reflexive.ip(), config.signaling_bind.port())),
        Err(e) => {
            tracing::debug!("Public address discovery failed: {}", e);
            None
        }
    }
}

/// Load the stored pairing, or create and store a new one
pub async fn load_or_generate(config: &DaemonConfig, regenerate: bool) -> Result<PairingRecord> {
    let path = &config.pairing_path;
    if path.exists() && !regenerate {
        tracing::info!("Loading pairing record from {:?}", path);
        return PairingRecord::load(path);
    }

    let rendezvous = rendezvous_address(config)
        .context("Could not determine a LAN address to advertise")?;
    let record = PairingRecord::generate(
        rendezvous,
        overlay_address(config),
        public_address(config).await,
    )?;
    record.save(path)?;
    tracing::info!(
        "Created pairing {} advertising {}",
        record.session_id(),
        rendezvous
    );
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_is_unique() {
        let rendezvous: SocketAddr = "192.168.1.100:8821".parse().unwrap();
        let a = PairingRecord::generate(rendezvous, None, None).unwrap();
        let b = PairingRecord::generate(rendezvous, None, None).unwrap();

        assert_ne!(a.session_id(), b.session_id());
        assert_ne!(a.payload().secret(), b.payload().secret());
        assert_eq!(a.payload().rendezvous(), rendezvous);
    }

    #[test]
    fn test_qr_text_parses_back() {
        let record = PairingRecord::generate(
            "192.168.1.100:8821".parse().unwrap(),
            Some("100.101.102.103:8821".parse().unwrap()),
            None,
        )
        .unwrap();

        let parsed = PairingPayload::from_qr_text(&record.qr_text()).unwrap();
        assert_eq!(&parsed, record.payload());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("pairing.toml");
        let record = PairingRecord::generate(
            "10.0.0.5:8821".parse().unwrap(),
            None,
            Some("203.0.113.7:8821".parse().unwrap()),
        )
        .unwrap();

        record.save(&path).unwrap();
        let loaded = PairingRecord::load(&path).unwrap();
        assert_eq!(loaded, record);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(record.session_id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_record_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("pairing.toml");
        PairingRecord::generate("10.0.0.5:8821".parse().unwrap(), None, None)
            .unwrap()
            .save(&path)
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_load_rejects_short_secret() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pairing.toml");
        std::fs::write(
            &path,
            "session_id = \"s\"\nsecret = \"abcd\"\nrendezvous = \"10.0.0.5:8821\"\ncreated_at = 0\n",
        )
        .unwrap();

        assert!(PairingRecord::load(&path).is_err());
    }

    #[test]
    fn test_rendezvous_uses_explicit_bind() {
        let config = DaemonConfig {
            signaling_bind: "192.168.1.100:8821".parse().unwrap(),
            ..DaemonConfig::default()
        };
        assert_eq!(
            rendezvous_address(&config),
            Some("192.168.1.100:8821".parse().unwrap())
        );
    }
}
