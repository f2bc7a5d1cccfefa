use std::{
    ffi::OsStr,
    fmt, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arch {
    #[serde(rename = "mipsel")]
    Mipsel,
    #[serde(rename = "armel")]
    Armel,
    #[serde(rename = "cortex-m3")]
    CortexM3,
    #[serde(rename = "riscv32")]
    Riscv32,
}

impl Arch {
    /// Bare-metal profiles boot the kernel image directly: no root
    /// filesystem, no console append line.
    pub fn is_bare_metal(self) -> bool {
        matches!(self, Arch::CortexM3 | Arch::Riscv32)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Arch::Mipsel => "mipsel",
            Arch::Armel => "armel",
            Arch::CortexM3 => "cortex-m3",
            Arch::Riscv32 => "riscv32",
        };
        f.write_str(name)
    }
}

fn default_machine() -> String {
    "malta".into()
}

fn default_memory() -> String {
    "256".into()
}

/// One firmware image in the library, as described by its `config.json`.
/// Paths are relative to the descriptor's directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FirmwareDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub arch: Arch,
    #[serde(default = "default_machine")]
    pub qemu_machine: String,
    pub kernel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd: Option<String>,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default)]
    pub multi_homed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_creds: Option<String>,
    // where the descriptor was found; never serialized back out
    #[serde(skip)]
    pub dir: PathBuf,
}

impl FirmwareDescriptor {
    pub fn kernel_path(&self) -> PathBuf {
        self.dir.join(&self.kernel)
    }

    pub fn rootfs_path(&self) -> Option<PathBuf> {
        self.rootfs.as_ref().map(|p| self.dir.join(p))
    }

    pub fn initrd_path(&self) -> Option<PathBuf> {
        self.initrd.as_ref().map(|p| self.dir.join(p))
    }
}

/// The firmware library: a directory tree holding one `config.json` per
/// image. Rescanned on each use: the library is small and may be edited
/// while the manager runs.
pub struct Library {
    dir: PathBuf,
}

impl Library {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// All valid descriptors, ordered by their on-disk source path.
    /// Malformed descriptors are skipped with a warning.
    pub fn scan(&self) -> Vec<FirmwareDescriptor> {
        let mut paths = Vec::new();
        collect_configs(&self.dir, &mut paths);
        paths.sort();

        let mut descriptors = Vec::new();
        for path in paths {
            match load_descriptor(&path) {
                Ok(fw) => descriptors.push(fw),
                Err(e) => warn!("skipping {}: {}", path.display(), e),
            }
        }
        descriptors
    }

    pub fn find(&self, id: &str) -> Option<FirmwareDescriptor> {
        self.scan().into_iter().find(|fw| fw.id == id)
    }
}

fn collect_configs(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_configs(&path, out);
        } else if path.file_name() == Some(OsStr::new("config.json")) {
            out.push(path);
        }
    }
}

fn load_descriptor(path: &Path) -> anyhow::Result<FirmwareDescriptor> {
    let raw = fs::read_to_string(path)?;
    let mut fw: FirmwareDescriptor = serde_json::from_str(&raw)?;
    fw.dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    if fw.name.is_empty() {
        fw.name = fw.id.clone();
    }
    Ok(fw)
}
