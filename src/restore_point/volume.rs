//! Removable volume detection.
//!
//! Mounted disks come from `sysinfo`. A disk is a candidate when it reports itself
//! removable or when its device is linked from `/dev/disk/by-id/usb-*` (USB hard
//! drives usually do not set the removable flag). The root filesystem and whatever
//! holds the backup root never qualify.

use getset::Getters;
use itertools::Itertools;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use sysinfo::Disks;

/// A mounted removable volume that can be added to a restore point.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct VolumeCandidate {
    mount_point: PathBuf,
    label: String,
    size_bytes: u64,
}

impl VolumeCandidate {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(mount_point: P, label: S, size_bytes: u64) -> Self {
        Self {
            mount_point: mount_point.into(),
            label: label.into(),
            size_bytes,
        }
    }
}

pub trait VolumeDetector {
    /// Currently mounted candidates. Empty when there are none.
    fn detect(&self) -> Vec<VolumeCandidate>;
}

/// What the detector needs to know about one mounted disk.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MountedDisk {
    /// Kernel device name, `sdb1`
    device: String,
    mount_point: PathBuf,
    removable: bool,
    total_space: u64,
}

impl From<&sysinfo::Disk> for MountedDisk {
    fn from(disk: &sysinfo::Disk) -> Self {
        let name = Path::new(disk.name());
        Self {
            device: name
                .file_name()
                .unwrap_or(name.as_os_str())
                .to_string_lossy()
                .into_owned(),
            mount_point: disk.mount_point().to_path_buf(),
            removable: disk.is_removable(),
            total_space: disk.total_space(),
        }
    }
}

/// Detector backed by the system's disk list and udev's device links.
#[derive(Debug, Clone)]
pub struct SystemVolumeDetector {
    by_id_dir: PathBuf,
    by_label_dir: PathBuf,
    excluded_roots: Vec<PathBuf>,
}

impl SystemVolumeDetector {
    /// `backup_root` is never offered, nor is any mount containing it.
    pub fn new<P: Into<PathBuf>>(backup_root: P) -> Self {
        Self {
            by_id_dir: "/dev/disk/by-id".into(),
            by_label_dir: "/dev/disk/by-label".into(),
            excluded_roots: vec![backup_root.into()],
        }
    }

    fn usb_devices(&self) -> HashSet<String> {
        let Ok(read_dir) = std::fs::read_dir(&self.by_id_dir) else {
            tracing::debug!("No device links under {:?}", self.by_id_dir);
            return HashSet::new();
        };

        read_dir
            .filter_map(|res| res.ok())
            .filter(|de| de.file_name().to_string_lossy().starts_with("usb-"))
            .filter_map(|de| device_name(&self.by_id_dir, &de.path()))
            .collect()
    }

    fn labels(&self) -> Vec<(String, String)> {
        let Ok(read_dir) = std::fs::read_dir(&self.by_label_dir) else {
            return Vec::new();
        };

        read_dir
            .filter_map(|res| res.ok())
            .filter_map(|de| {
                let device = device_name(&self.by_label_dir, &de.path())?;
                Some((device, unescape_udev(&de.file_name().to_string_lossy())))
            })
            .collect()
    }

    fn is_excluded(&self, mount_point: &Path) -> bool {
        mount_point == Path::new("/")
            || self
                .excluded_roots
                .iter()
                .any(|root| root.starts_with(mount_point))
    }

    fn candidates<I: IntoIterator<Item = MountedDisk>>(&self, disks: I) -> Vec<VolumeCandidate> {
        let usb = self.usb_devices();
        let labels = self.labels();

        disks
            .into_iter()
            .filter(|disk| disk.removable || usb.contains(&disk.device))
            .filter(|disk| !self.is_excluded(&disk.mount_point))
            .unique_by(|disk| disk.mount_point.clone())
            .map(|disk| {
                let label = labels
                    .iter()
                    .find(|(d, _)| *d == disk.device)
                    .map(|(_, label)| label.clone())
                    .or_else(|| {
                        disk.mount_point
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                    })
                    .unwrap_or_else(|| disk.device.clone());
                tracing::debug!(
                    "Removable volume {:?} ({}) at {:?}",
                    label,
                    disk.total_space,
                    disk.mount_point
                );
                VolumeCandidate {
                    mount_point: disk.mount_point,
                    label,
                    size_bytes: disk.total_space,
                }
            })
            .collect()
    }
}

impl VolumeDetector for SystemVolumeDetector {
    fn detect(&self) -> Vec<VolumeCandidate> {
        let disks = Disks::new_with_refreshed_list();
        self.candidates(disks.list().iter().map(MountedDisk::from))
    }
}

/// Resolves a udev symlink to the kernel device name it points at.
fn device_name(link_dir: &Path, link: &Path) -> Option<String> {
    let target = std::fs::read_link(link).ok()?;
    let resolved = if target.is_absolute() {
        target
    } else {
        link_dir.join(target)
    };
    Some(resolved.file_name()?.to_string_lossy().into_owned())
}

/// udev link names escape with `\xHH`.
fn unescape_udev(name: &str) -> String {
    let mut out = Vec::with_capacity(name.len());
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'x') {
            if let Some(b) = name
                .get(i + 2..i + 4)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
