use std::path::Path;

use crate::{
    error::{LabError, Result},
    library::{Arch, FirmwareDescriptor},
};

/// The lm3s6965evb SoC's Stellaris Ethernet controller hardcodes this MAC;
/// `macaddr=` on the command line has no effect on it.
pub const STELLARIS_MAC: &str = "00:00:94:00:83:00";

/// A guest NIC: the host TAP it attaches to and the MAC it presents.
pub struct Nic<'a> {
    pub tap: &'a str,
    pub mac: &'a str,
}

/// How an architecture's NICs are expressed on the QEMU command line.
enum NicForm {
    /// Modern `-netdev tap` + `-device <model>` pair.
    Netdev { device: &'static str },
    /// Legacy `-net nic` / `-net tap` pair (the arm boards we emulate
    /// predate netdev plumbing in their kernel configs).
    Legacy,
}

struct LinuxProfile {
    qemu_bin: &'static str,
    append: &'static str,
    nic: NicForm,
}

fn linux_profile(arch: Arch) -> LinuxProfile {
    match arch {
        Arch::Mipsel => LinuxProfile {
            qemu_bin: "qemu-system-mipsel",
            append: "root=/dev/sda1 console=ttyS0",
            nic: NicForm::Netdev { device: "e1000" },
        },
        Arch::Armel => LinuxProfile {
            qemu_bin: "qemu-system-arm",
            append: "root=/dev/sda1 console=ttyAMA0",
            nic: NicForm::Legacy,
        },
        Arch::CortexM3 | Arch::Riscv32 => unreachable!("bare-metal arch has no linux profile"),
    }
}

fn nic_args(form: &NicForm, index: usize, nic: &Nic<'_>) -> Vec<String> {
    match form {
        NicForm::Netdev { device } => vec![
            "-netdev".into(),
            format!(
                "tap,id=net{},ifname={},script=no,downscript=no",
                index, nic.tap
            ),
            "-device".into(),
            format!("{},netdev=net{},mac={}", device, index, nic.mac),
        ],
        NicForm::Legacy => vec![
            "-net".into(),
            format!("nic,macaddr={}", nic.mac),
            "-net".into(),
            format!("tap,ifname={},script=no,downscript=no", nic.tap),
        ],
    }
}

/// Build the full QEMU argument vector (binary first) for a firmware image
/// with its allocated resources.
pub fn build_command(
    fw: &FirmwareDescriptor,
    nic: Nic<'_>,
    nic_internal: Option<Nic<'_>>,
    overlay: Option<&Path>,
) -> Result<Vec<String>> {
    if (fw.multi_homed || nic_internal.is_some()) && fw.arch.is_bare_metal() {
        return Err(LabError::Config(format!(
            "firmware '{}': multi_homed is not supported on {}",
            fw.id, fw.arch
        )));
    }

    let kernel = fw.kernel_path().display().to_string();

    match fw.arch {
        Arch::CortexM3 => Ok(vec![
            "qemu-system-arm".into(),
            "-M".into(),
            fw.qemu_machine.clone(),
            "-kernel".into(),
            kernel,
            "-nographic".into(),
            "-net".into(),
            "nic,model=stellaris".into(),
            "-net".into(),
            format!("tap,ifname={},script=no,downscript=no", nic.tap),
        ]),

        Arch::Riscv32 => Ok(vec![
            "qemu-system-riscv32".into(),
            "-M".into(),
            fw.qemu_machine.clone(),
            "-bios".into(),
            "none".into(),
            "-m".into(),
            "256".into(),
            "-kernel".into(),
            kernel,
            "-nographic".into(),
            "-netdev".into(),
            format!("tap,id=net0,ifname={},script=no,downscript=no", nic.tap),
            "-device".into(),
            format!("virtio-net-device,netdev=net0,mac={}", nic.mac),
        ]),

        Arch::Mipsel | Arch::Armel => {
            let profile = linux_profile(fw.arch);
            let rootfs = fw.rootfs_path().ok_or_else(|| {
                LabError::Config(format!("firmware '{}' has no rootfs", fw.id))
            })?;
            // boot from the per-instance overlay when one was allocated
            let drive = overlay.unwrap_or(&rootfs);

            let mut cmd = vec![
                profile.qemu_bin.into(),
                "-M".into(),
                fw.qemu_machine.clone(),
                "-kernel".into(),
                kernel,
                "-drive".into(),
                format!("file={},format=qcow2", drive.display()),
                "-nographic".into(),
                "-append".into(),
                profile.append.into(),
                "-m".into(),
                fw.memory.clone(),
            ];
            cmd.extend(nic_args(&profile.nic, 0, &nic));
            if let Some(internal) = &nic_internal {
                cmd.extend(nic_args(&profile.nic, 1, internal));
            }
            if let Some(initrd) = fw.initrd_path() {
                cmd.push("-initrd".into());
                cmd.push(initrd.display().to_string());
            }
            Ok(cmd)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn descriptor(arch: Arch) -> FirmwareDescriptor {
        FirmwareDescriptor {
            id: "fw".into(),
            name: "Test Firmware".into(),
            arch,
            qemu_machine: "malta".into(),
            kernel: "vmlinux".into(),
            rootfs: Some("rootfs.qcow2".into()),
            initrd: None,
            memory: "256".into(),
            multi_homed: false,
            default_creds: None,
            dir: PathBuf::from("/lib/fw"),
        }
    }

    fn nic() -> Nic<'static> {
        Nic {
            tap: "tap0",
            mac: "52:54:00:aa:bb:cc",
        }
    }

    #[test]
    fn mipsel_linux_form() {
        let cmd = build_command(&descriptor(Arch::Mipsel), nic(), None, None).unwrap();
        assert_eq!(cmd[0], "qemu-system-mipsel");
        assert!(cmd.contains(&"-drive".to_string()));
        assert!(cmd.contains(&"file=/lib/fw/rootfs.qcow2,format=qcow2".to_string()));
        assert!(cmd.contains(&"root=/dev/sda1 console=ttyS0".to_string()));
        assert!(cmd
            .contains(&"tap,id=net0,ifname=tap0,script=no,downscript=no".to_string()));
        assert!(cmd.contains(&"e1000,netdev=net0,mac=52:54:00:aa:bb:cc".to_string()));
    }

    #[test]
    fn overlay_replaces_base_drive() {
        let cmd = build_command(
            &descriptor(Arch::Mipsel),
            nic(),
            None,
            Some(Path::new("/overlays/fw_12345678.qcow2")),
        )
        .unwrap();
        assert!(cmd.contains(&"file=/overlays/fw_12345678.qcow2,format=qcow2".to_string()));
        assert!(!cmd.iter().any(|a| a.contains("rootfs.qcow2")));
    }

    #[test]
    fn armel_uses_legacy_nic_and_console() {
        let mut fw = descriptor(Arch::Armel);
        fw.qemu_machine = "versatilepb".into();
        fw.initrd = Some("initrd.img".into());
        let cmd = build_command(&fw, nic(), None, None).unwrap();
        assert_eq!(cmd[0], "qemu-system-arm");
        assert!(cmd.contains(&"root=/dev/sda1 console=ttyAMA0".to_string()));
        assert!(cmd.contains(&"nic,macaddr=52:54:00:aa:bb:cc".to_string()));
        assert!(cmd.contains(&"tap,ifname=tap0,script=no,downscript=no".to_string()));
        // initrd rides at the end
        assert_eq!(cmd[cmd.len() - 2], "-initrd");
        assert_eq!(cmd[cmd.len() - 1], "/lib/fw/initrd.img");
    }

    #[test]
    fn cortex_m3_is_kernel_only() {
        let mut fw = descriptor(Arch::CortexM3);
        fw.qemu_machine = "lm3s6965evb".into();
        fw.rootfs = None;
        let cmd = build_command(&fw, nic(), None, None).unwrap();
        assert_eq!(cmd[0], "qemu-system-arm");
        assert!(cmd.contains(&"nic,model=stellaris".to_string()));
        assert!(!cmd.contains(&"-drive".to_string()));
        assert!(!cmd.contains(&"-append".to_string()));
        // the SoC MAC is fixed; the software MAC must not leak in
        assert!(!cmd.iter().any(|a| a.contains("macaddr")));
    }

    #[test]
    fn riscv32_is_bare_metal_with_virtio() {
        let mut fw = descriptor(Arch::Riscv32);
        fw.qemu_machine = "virt".into();
        fw.rootfs = None;
        let cmd = build_command(&fw, nic(), None, None).unwrap();
        assert_eq!(cmd[0], "qemu-system-riscv32");
        assert!(cmd.windows(2).any(|w| w == ["-bios", "none"]));
        assert!(cmd.windows(2).any(|w| w == ["-m", "256"]));
        assert!(cmd.contains(&"virtio-net-device,netdev=net0,mac=52:54:00:aa:bb:cc".to_string()));
        assert!(!cmd.contains(&"-append".to_string()));
    }

    #[test]
    fn multi_homed_emits_second_nic() {
        let mut fw = descriptor(Arch::Mipsel);
        fw.multi_homed = true;
        let internal = Nic {
            tap: "tap1_int",
            mac: "52:54:00:11:22:33",
        };
        let cmd = build_command(&fw, nic(), Some(internal), None).unwrap();
        assert!(cmd
            .contains(&"tap,id=net1,ifname=tap1_int,script=no,downscript=no".to_string()));
        assert!(cmd.contains(&"e1000,netdev=net1,mac=52:54:00:11:22:33".to_string()));
    }

    #[test]
    fn multi_homed_rejected_on_bare_metal() {
        let mut fw = descriptor(Arch::Riscv32);
        fw.rootfs = None;
        fw.multi_homed = true;
        let err = build_command(&fw, nic(), None, None).unwrap_err();
        assert!(matches!(err, LabError::Config(_)));
        assert!(err.to_string().contains("riscv32"));
    }
}
