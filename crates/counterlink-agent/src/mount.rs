//! Mount locator
//!
//! Finds where the counter's USB mass-storage device is mounted right now.
//! The answer is recomputed every cycle: the device may be unplugged, or come
//! back under a different automount directory.

use crate::config::AgentConfig;
use crate::error::DeviceAbsent;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One line of the kernel mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
}

/// Locates the counter's mount point
#[derive(Debug, Clone)]
pub struct MountLocator {
    mount_root: PathBuf,
    media_root: PathBuf,
    labels: Vec<String>,
    mount_table: PathBuf,
}

impl MountLocator {
    pub fn new(
        mount_root: impl Into<PathBuf>,
        media_root: impl Into<PathBuf>,
        labels: Vec<String>,
        mount_table: impl Into<PathBuf>,
    ) -> Self {
        Self {
            mount_root: mount_root.into(),
            media_root: media_root.into(),
            labels: labels.into_iter().map(|l| l.to_lowercase()).collect(),
            mount_table: mount_table.into(),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            config.mount_root.clone(),
            config.media_root.clone(),
            config.device_labels.clone(),
            config.mount_table.clone(),
        )
    }

    /// Current mount point of the counter, or [`DeviceAbsent`]
    pub fn locate(&self) -> Result<PathBuf, DeviceAbsent> {
        let table = match std::fs::read_to_string(&self.mount_table) {
            Ok(content) => Some(parse_mount_table(&content)),
            Err(e) => {
                debug!(
                    mount_table = %self.mount_table.display(),
                    error = %e,
                    "Mount table unreadable, falling back to directory checks"
                );
                None
            }
        };

        self.resolve(table.as_deref()).ok_or_else(|| DeviceAbsent {
            mount_root: self.mount_root.clone(),
            media_root: self.media_root.clone(),
        })
    }

    fn resolve(&self, table: Option<&[MountEntry]>) -> Option<PathBuf> {
        match table {
            Some(entries) => {
                if self.mount_root.is_dir()
                    && entries.iter().any(|e| e.mount_point == self.mount_root)
                {
                    return Some(self.mount_root.clone());
                }

                let mut candidates: Vec<&Path> = entries
                    .iter()
                    .map(|e| e.mount_point.as_path())
                    .filter(|p| p.starts_with(&self.media_root) && p != &self.media_root)
                    .filter(|p| self.is_counter_label(p))
                    .filter(|p| p.is_dir())
                    .collect();
                candidates.sort();

                if candidates.len() > 1 {
                    warn!(
                        count = candidates.len(),
                        chosen = %candidates[0].display(),
                        "Several counter-like devices mounted, using the first"
                    );
                }
                candidates.first().map(|p| p.to_path_buf())
            }
            None => {
                if self.mount_root.is_dir() {
                    return Some(self.mount_root.clone());
                }
                self.scan_media_root()
            }
        }
    }

    fn scan_media_root(&self) -> Option<PathBuf> {
        let entries = std::fs::read_dir(&self.media_root).ok()?;

        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.is_dir() && self.is_counter_label(p))
            .collect();
        candidates.sort();
        candidates.into_iter().next()
    }

    fn is_counter_label(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let name = name.to_lowercase();
        self.labels.iter().any(|label| name.contains(label.as_str()))
    }
}

/// Parse `/proc/mounts` content; malformed lines are skipped
pub fn parse_mount_table(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                device: unescape(device),
                mount_point: PathBuf::from(unescape(mount_point)),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

/// Decode the kernel's `\ooo` octal escapes (`\040` is a space)
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn locator(root: &Path, table: &Path) -> MountLocator {
        MountLocator::new(
            root.join("mnt/usb"),
            root.join("media/pi"),
            vec!["apollyon".to_string(), "TRAX".to_string()],
            table,
        )
    }

    #[test]
    fn test_parse_mount_table_decodes_escapes() {
        let table = "/dev/sda1 /media/pi/TRAX\\040DATA vfat rw,relatime 0 0\nbroken\n";
        let entries = parse_mount_table(table);

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].device, "/dev/sda1");
        assert_eq!(entries[0].mount_point, PathBuf::from("/media/pi/TRAX DATA"));
        assert_eq!(entries[0].fs_type, "vfat");
    }

    #[test]
    fn test_mount_root_wins_when_mounted() {
        let dir = TempDir::new().unwrap();
        let mount_root = dir.path().join("mnt/usb");
        std::fs::create_dir_all(&mount_root).unwrap();
        std::fs::create_dir_all(dir.path().join("media/pi/TRAX")).unwrap();
        let table = dir.path().join("mounts");
        std::fs::write(
            &table,
            format!(
                "/dev/sda1 {} vfat rw 0 0\n/dev/sdb1 {} vfat rw 0 0\n",
                mount_root.display(),
                dir.path().join("media/pi/TRAX").display()
            ),
        )
        .unwrap();

        assert_eq!(locator(dir.path(), &table).locate().unwrap(), mount_root);
    }

    #[test]
    fn test_unmounted_directory_is_not_a_device() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("mnt/usb")).unwrap();
        let apollyon = dir.path().join("media/pi/Apollyon");
        std::fs::create_dir_all(&apollyon).unwrap();
        let table = dir.path().join("mounts");
        std::fs::write(
            &table,
            format!("proc /proc proc rw 0 0\n/dev/sda1 {} vfat rw 0 0\n", apollyon.display()),
        )
        .unwrap();

        assert_eq!(locator(dir.path(), &table).locate().unwrap(), apollyon);
    }

    #[test]
    fn test_absent_device_reports_searched_paths() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("mounts");
        std::fs::write(&table, "proc /proc proc rw 0 0\n").unwrap();

        let err = locator(dir.path(), &table).locate().unwrap_err();
        assert_eq!(err.mount_root, dir.path().join("mnt/usb"));
        assert!(err.to_string().contains("not mounted"));
    }

    #[test]
    fn test_unreadable_table_falls_back_to_directories() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("no-such-mounts");
        let trax = dir.path().join("media/pi/trax-0412");
        std::fs::create_dir_all(&trax).unwrap();
        std::fs::create_dir_all(dir.path().join("media/pi/camera")).unwrap();

        assert_eq!(locator(dir.path(), &table).locate().unwrap(), trax);

        std::fs::create_dir_all(dir.path().join("mnt/usb")).unwrap();
        assert_eq!(
            locator(dir.path(), &table).locate().unwrap(),
            dir.path().join("mnt/usb")
        );
    }
}
