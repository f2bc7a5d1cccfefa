use std::{
    fs,
    fs::File,
    path::{Path, PathBuf},
    process::Child,
};

use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    config::LabConfig,
    error::{LabError, Result},
    hostnet::HostNet,
    leases,
    library::{Arch, FirmwareDescriptor, Library},
    overlay::OverlayStore,
    qemu::{self, Nic},
    supervisor,
};

const PENDING_IP: &str = "pending";

/// Secondary NICs get their own tap namespace so `ip link` output reads
/// at a glance which side of the lab a device is on.
const INTERNAL_TAP_SUFFIX: &str = "_int";

/// One running emulator instance and everything the manager must release
/// when it goes away.
pub struct ActiveInstance {
    pub run_id: String,
    pub firmware_id: String,
    pub arch: Arch,
    pub name: String,
    pub pid: u32,
    pub tap: String,
    pub mac: String,
    pub ip: String,
    pub multi_homed: bool,
    pub tap_internal: Option<String>,
    pub mac_internal: Option<String>,
    pub ip_internal: Option<String>,
    pub log_path: PathBuf,
    pub overlay_path: Option<PathBuf>,
    child: Child,
    // held open so the child's output has somewhere to go for the
    // instance's whole lifetime; closed on stop
    log_file: File,
}

impl ActiveInstance {
    fn alive(&mut self) -> bool {
        supervisor::alive(&mut self.child)
    }

    fn view(&mut self) -> InstanceView {
        let alive = self.alive();
        InstanceView {
            run_id: self.run_id.clone(),
            firmware_id: self.firmware_id.clone(),
            arch: self.arch,
            name: self.name.clone(),
            pid: self.pid,
            tap: self.tap.clone(),
            mac: self.mac.clone(),
            ip: self.ip.clone(),
            multi_homed: self.multi_homed,
            tap_internal: self.tap_internal.clone(),
            mac_internal: self.mac_internal.clone(),
            ip_internal: self.ip_internal.clone(),
            log: self.log_path.display().to_string(),
            alive,
        }
    }
}

/// Public projection of an instance: no process handle, no log handle, no
/// overlay path. Internal-NIC fields appear only for multi-homed devices.
#[derive(Clone, Debug, Serialize)]
pub struct InstanceView {
    pub run_id: String,
    pub firmware_id: String,
    pub arch: Arch,
    pub name: String,
    pub pid: u32,
    pub tap: String,
    pub mac: String,
    pub ip: String,
    pub multi_homed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tap_internal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_internal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_internal: Option<String>,
    pub log: String,
    pub alive: bool,
}

/// Inverse of one provisioning step, run in reverse order when a later
/// step fails. Each variant's cleanup is best-effort and idempotent.
enum Undo {
    Tap(String),
    Overlay(PathBuf),
}

/// The lab's control plane: owns every running instance and the host
/// resources behind it.
///
/// Callers serialize access by wrapping the manager in a mutex held for the
/// whole of each operation (including compensation), so spawn/stop/reset
/// never interleave.
pub struct LabManager {
    config: LabConfig,
    library: Library,
    hostnet: HostNet,
    overlays: OverlayStore,
    instances: Vec<ActiveInstance>,
}

impl LabManager {
    pub fn new(config: LabConfig) -> Result<Self> {
        let library = Library::new(config.library_dir.clone());
        let hostnet = HostNet::new()?;
        let overlays = OverlayStore::new(config.overlay_dir.clone());
        Ok(Self {
            config,
            library,
            hostnet,
            overlays,
            instances: Vec::new(),
        })
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    /// Boot a new instance of `firmware_id`. Returns its run id.
    ///
    /// Either the instance is fully provisioned and registered, or every
    /// host-side effect has been reversed before the error returns.
    pub async fn spawn(&mut self, firmware_id: &str) -> Result<String> {
        let fw = self
            .library
            .find(firmware_id)
            .ok_or_else(|| LabError::UnknownFirmware(firmware_id.to_string()))?;

        if fw.arch == Arch::CortexM3 {
            let blocking = self
                .instances
                .iter_mut()
                .filter(|inst| inst.arch == Arch::CortexM3)
                .find_map(|inst| inst.alive().then(|| inst.run_id.clone()));
            if let Some(run_id) = blocking {
                return Err(LabError::SocMacConflict(run_id));
            }
        }

        let tap = self.hostnet.next_tap_name("");
        let mac = if fw.arch == Arch::CortexM3 {
            qemu::STELLARIS_MAC.to_string()
        } else {
            self.fresh_mac(&[])
        };

        let (tap_internal, mac_internal) = if fw.multi_homed {
            self.hostnet
                .ensure_bridge(
                    &self.config.internal_bridge,
                    self.config.internal_gateway,
                    self.config.internal_prefix_len,
                )
                .await?;
            (
                Some(self.hostnet.next_tap_name(INTERNAL_TAP_SUFFIX)),
                Some(self.fresh_mac(&[mac.as_str()])),
            )
        } else {
            (None, None)
        };

        let run_id = generate_run_id(firmware_id);

        // validate files before creating any per-instance host state
        let kernel = fw.kernel_path();
        if !kernel.is_file() {
            return Err(LabError::MissingFile {
                kind: "kernel",
                path: kernel,
            });
        }
        let rootfs = fw.rootfs_path();
        if let Some(path) = &rootfs {
            if !path.is_file() {
                return Err(LabError::MissingFile {
                    kind: "rootfs",
                    path: path.clone(),
                });
            }
        }

        // everything past this point allocates host state; undo on failure
        let mut undo = Vec::new();
        match self
            .provision(
                &fw,
                &run_id,
                &tap,
                &mac,
                tap_internal.as_deref(),
                mac_internal.as_deref(),
                rootfs.as_deref(),
                &mut undo,
            )
            .await
        {
            Ok((child, log_file, log_path, overlay_path)) => {
                let pid = child.id();
                info!(
                    "spawned {} pid={} tap={} mac={}",
                    run_id, pid, tap, mac
                );
                self.instances.push(ActiveInstance {
                    run_id: run_id.clone(),
                    firmware_id: fw.id.clone(),
                    arch: fw.arch,
                    name: fw.name.clone(),
                    pid,
                    tap,
                    mac,
                    ip: PENDING_IP.into(),
                    multi_homed: fw.multi_homed,
                    tap_internal,
                    mac_internal,
                    ip_internal: fw.multi_homed.then(|| PENDING_IP.to_string()),
                    log_path,
                    overlay_path,
                    child,
                    log_file,
                });
                Ok(run_id)
            }
            Err(e) => {
                self.unwind(undo).await;
                Err(e)
            }
        }
    }

    /// The host-mutating half of a spawn: taps, overlay, argv, log, child.
    /// Pushes an undo entry after each completed allocation so the caller
    /// can unwind exactly what exists.
    #[allow(clippy::too_many_arguments)]
    async fn provision(
        &self,
        fw: &FirmwareDescriptor,
        run_id: &str,
        tap: &str,
        mac: &str,
        tap_internal: Option<&str>,
        mac_internal: Option<&str>,
        rootfs: Option<&Path>,
        undo: &mut Vec<Undo>,
    ) -> Result<(Child, File, PathBuf, Option<PathBuf>)> {
        self.hostnet
            .create_tap(tap, &self.config.external_bridge)
            .await?;
        undo.push(Undo::Tap(tap.to_string()));

        if let Some(tap_int) = tap_internal {
            self.hostnet
                .create_tap(tap_int, &self.config.internal_bridge)
                .await?;
            undo.push(Undo::Tap(tap_int.to_string()));
        }

        let overlay_path = match rootfs {
            Some(base) => {
                let path = self.overlays.create(base, run_id).await?;
                undo.push(Undo::Overlay(path.clone()));
                Some(path)
            }
            None => None,
        };

        let nic_internal = tap_internal
            .zip(mac_internal)
            .map(|(tap, mac)| Nic { tap, mac });
        let argv = qemu::build_command(
            fw,
            Nic { tap, mac },
            nic_internal,
            overlay_path.as_deref(),
        )?;

        fs::create_dir_all(&self.config.log_dir).map_err(|e| {
            LabError::resource(
                format!("failed to create log dir {}", self.config.log_dir.display()),
                e,
            )
        })?;
        let log_path = self.config.log_dir.join(format!("qemu-{}.log", run_id));
        let (child, log_file) = supervisor::start(&argv, &log_path)
            .map_err(|e| LabError::resource(format!("failed to start {}", argv[0]), e))?;

        Ok((child, log_file, log_path, overlay_path))
    }

    async fn unwind(&self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            match step {
                Undo::Tap(name) => self.hostnet.release_tap(&name).await,
                Undo::Overlay(path) => self.overlays.delete(&path),
            }
        }
    }

    /// Stop an instance and release everything it held. Returns false for
    /// an unknown run id. Cleanup is best-effort: each step swallows its
    /// own errors so the rest still runs.
    pub async fn stop(&mut self, run_id: &str) -> bool {
        let Some(pos) = self.instances.iter().position(|i| i.run_id == run_id) else {
            return false;
        };
        let mut inst = self.instances.remove(pos);

        if inst.alive() {
            info!("stopping {} (pid {})", inst.run_id, inst.pid);
            supervisor::stop(&mut inst.child, supervisor::STOP_GRACE).await;
        }

        let ActiveInstance {
            child,
            log_file,
            tap,
            tap_internal,
            overlay_path,
            ..
        } = inst;
        drop(log_file);
        drop(child);

        self.hostnet.release_tap(&tap).await;
        if let Some(tap_int) = &tap_internal {
            self.hostnet.release_tap(tap_int).await;
        }
        if let Some(overlay) = &overlay_path {
            self.overlays.delete(overlay);
        }

        info!("cleaned up {}", run_id);
        true
    }

    /// Stop every instance. Returns how many stops were attempted.
    pub async fn reset(&mut self) -> usize {
        let run_ids: Vec<String> = self.instances.iter().map(|i| i.run_id.clone()).collect();
        for run_id in &run_ids {
            if !self.stop(run_id).await {
                warn!("{} disappeared during reset", run_id);
            }
        }
        run_ids.len()
    }

    /// Snapshot of all instances in spawn order, with liveness polled now.
    pub fn topology(&mut self) -> Vec<InstanceView> {
        self.instances.iter_mut().map(|inst| inst.view()).collect()
    }

    /// One reconciliation pass over both lease files. Instances that
    /// already know their address are left alone, so repeated calls are
    /// no-ops until a new lease appears.
    pub fn refresh_ips(&mut self) {
        for inst in &mut self.instances {
            if ip_unresolved(&inst.ip) {
                if let Some(ip) = leases::find_ip(&self.config.external_leases, &inst.mac) {
                    info!("{} acquired IP {}", inst.run_id, ip);
                    inst.ip = ip.to_string();
                }
            }

            if let (Some(mac_int), Some(ip_int)) =
                (&inst.mac_internal, &mut inst.ip_internal)
            {
                if ip_unresolved(ip_int) {
                    if let Some(ip) = leases::find_ip(&self.config.internal_leases, mac_int) {
                        info!("{} acquired internal IP {}", inst.run_id, ip);
                        *ip_int = ip.to_string();
                    }
                }
            }
        }
    }

    /// A random QEMU-OUI MAC not used by any active instance and not in
    /// `reserved` (MACs already drawn for the spawn in progress).
    fn fresh_mac(&self, reserved: &[&str]) -> String {
        fresh_mac_excluding(|mac| {
            reserved.contains(&mac)
                || self.instances.iter().any(|inst| {
                    inst.mac == mac || inst.mac_internal.as_deref() == Some(mac)
                })
        })
    }
}

/// Draw random MACs until one passes the `taken` check.
fn fresh_mac_excluding(taken: impl Fn(&str) -> bool) -> String {
    loop {
        let mac = random_qemu_mac();
        if !taken(&mac) {
            return mac;
        }
    }
}

fn ip_unresolved(ip: &str) -> bool {
    ip == "pending" || ip == "unknown"
}

fn random_qemu_mac() -> String {
    let bytes: [u8; 3] = rand::thread_rng().gen();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}

fn generate_run_id(firmware_id: &str) -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill(&mut bytes[..]);
    format!("{}_{}", firmware_id, hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_config(tag: &str) -> LabConfig {
        let root = std::env::temp_dir().join(format!("labvisor-mgr-{}-{}", std::process::id(), tag));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(root.join("library")).unwrap();
        LabConfig {
            library_dir: root.join("library"),
            log_dir: root.join("logs"),
            overlay_dir: root.join("overlays"),
            external_leases: root.join("dnsmasq-br0.leases"),
            internal_leases: root.join("dnsmasq-br_internal.leases"),
            ..LabConfig::default()
        }
    }

    fn write_descriptor(config: &LabConfig, id: &str, body: &str) {
        let dir = config.library_dir.join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config.json"), body).unwrap();
    }

    #[test]
    fn mac_is_in_qemu_oui_range() {
        for _ in 0..32 {
            let mac = random_qemu_mac();
            assert_eq!(mac.len(), 17);
            assert!(mac.starts_with("52:54:00:"));
            assert_eq!(mac, mac.to_ascii_lowercase());
        }
    }

    #[test]
    fn run_id_shape() {
        let run_id = generate_run_id("dvrf_v03");
        let suffix = run_id.strip_prefix("dvrf_v03_").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn empty_manager_boundaries() {
        let mut manager = LabManager::new(scratch_config("empty")).unwrap();
        assert!(manager.topology().is_empty());
        assert_eq!(manager.reset().await, 0);
        assert!(!manager.stop("ghost_00000000").await);
        assert!(manager.topology().is_empty());
    }

    #[tokio::test]
    async fn spawn_unknown_firmware_is_not_found() {
        let mut manager = LabManager::new(scratch_config("unknown")).unwrap();
        let err = manager.spawn("nope").await.unwrap_err();
        assert!(matches!(err, LabError::UnknownFirmware(_)));
        assert!(err.to_string().contains("nope"));
        assert!(manager.topology().is_empty());
    }

    #[tokio::test]
    async fn spawn_with_missing_kernel_fails_before_host_mutation() {
        let config = scratch_config("nokernel");
        write_descriptor(
            &config,
            "ghostfw",
            r#"{"id": "ghostfw", "arch": "mipsel", "kernel": "vmlinux-missing"}"#,
        );
        let mut manager = LabManager::new(config).unwrap();

        let err = manager.spawn("ghostfw").await.unwrap_err();
        assert!(matches!(err, LabError::MissingFile { kind: "kernel", .. }));
        assert!(err.to_string().contains("vmlinux-missing"));
        assert!(manager.topology().is_empty());
    }

    #[tokio::test]
    async fn spawn_with_missing_rootfs_names_the_file() {
        let config = scratch_config("norootfs");
        let dir = config.library_dir.join("halffw");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vmlinux"), b"\x7fELF").unwrap();
        fs::write(
            dir.join("config.json"),
            r#"{"id": "halffw", "arch": "mipsel", "kernel": "vmlinux", "rootfs": "rootfs.qcow2"}"#,
        )
        .unwrap();
        let mut manager = LabManager::new(config).unwrap();

        let err = manager.spawn("halffw").await.unwrap_err();
        assert!(matches!(err, LabError::MissingFile { kind: "rootfs", .. }));
        assert!(manager.topology().is_empty());
    }

    #[test]
    fn fresh_mac_skips_taken_addresses() {
        use std::cell::RefCell;

        let draws = RefCell::new(Vec::new());
        // reject the first two draws; the loop must redraw and terminate
        let mac = fresh_mac_excluding(|candidate| {
            let mut draws = draws.borrow_mut();
            draws.push(candidate.to_string());
            draws.len() <= 2
        });

        let draws = draws.into_inner();
        assert_eq!(draws.len(), 3);
        assert_eq!(draws.last().map(String::as_str), Some(mac.as_str()));
        assert!(mac.starts_with("52:54:00:"));
    }
}
