//! The daemon's mount surface: the `-o` option string and the
//! mountpoint, validated together against the configured tiers before
//! anything is wired up.
//!
//! Each `-o` knob knows the token that raises it, the token that lowers
//! it, and its default, so the last token wins the way mount(8) treats
//! `ro,rw`. Checks report every problem in one pass, and include the
//! overlap hazards specific to a union of backing directories.

use std::path::{Path, PathBuf};

use autotier_config::TierSpec;
use fuser::MountOption;

use crate::error::{FuseError, Result};

struct Knob {
    raise: &'static str,
    lower: Option<&'static str>,
    default_on: bool,
    mapped: MountOption,
}

static KNOBS: &[Knob] = &[
    Knob {
        raise: "allow_other",
        lower: None,
        default_on: false,
        mapped: MountOption::AllowOther,
    },
    Knob {
        raise: "allow_root",
        lower: None,
        default_on: false,
        mapped: MountOption::AllowRoot,
    },
    Knob {
        raise: "default_permissions",
        lower: None,
        default_on: false,
        mapped: MountOption::DefaultPermissions,
    },
    Knob {
        raise: "auto_unmount",
        lower: Some("noauto_unmount"),
        default_on: true,
        mapped: MountOption::AutoUnmount,
    },
    Knob {
        raise: "ro",
        lower: Some("rw"),
        default_on: false,
        mapped: MountOption::RO,
    },
];

/// The validated mount surface handed to `fuser`.
#[derive(Debug)]
pub struct MountSpec {
    mountpoint: PathBuf,
    options: Vec<MountOption>,
}

impl MountSpec {
    /// Validate the mountpoint and `-o` string against the configured
    /// tiers, collecting every problem before failing.
    pub fn build(mountpoint: &Path, opts: &str, tiers: &[TierSpec]) -> Result<MountSpec> {
        let mut problems = Vec::new();
        let mut raised: Vec<bool> = KNOBS.iter().map(|k| k.default_on).collect();

        for token in opts.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if let Some(i) = KNOBS.iter().position(|k| k.raise == token) {
                raised[i] = true;
            } else if let Some(i) = KNOBS.iter().position(|k| k.lower == Some(token)) {
                raised[i] = false;
            } else {
                problems.push(format!("unknown mount option: {token}"));
            }
        }

        check_mountpoint(mountpoint, tiers, &mut problems);

        if !problems.is_empty() {
            return Err(FuseError::MountSetup {
                mountpoint: mountpoint.display().to_string(),
                problems,
            });
        }

        let mut options = vec![MountOption::FSName("autotier".to_string())];
        options.extend(
            KNOBS
                .iter()
                .zip(&raised)
                .filter(|(_, &on)| on)
                .map(|(knob, _)| knob.mapped.clone()),
        );
        Ok(MountSpec {
            mountpoint: mountpoint.to_path_buf(),
            options,
        })
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Options in the form `fuser::spawn_mount2` takes.
    pub fn fuser_options(&self) -> &[MountOption] {
        &self.options
    }

    /// Whether the union view was requested read-only.
    pub fn read_only(&self) -> bool {
        self.options.contains(&MountOption::RO)
    }
}

/// The mountpoint must be an existing directory and must not overlap
/// any tier: a mountpoint inside a backing root would hand the crawler
/// its own union view, and a backing root under the mountpoint becomes
/// unreachable once the mount is up.
fn check_mountpoint(mountpoint: &Path, tiers: &[TierSpec], problems: &mut Vec<String>) {
    match std::fs::metadata(mountpoint) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            problems.push(format!(
                "mountpoint is not a directory: \"{}\"",
                mountpoint.display()
            ));
            return;
        }
        Err(e) => {
            problems.push(format!(
                "cannot use mountpoint \"{}\": {e}",
                mountpoint.display()
            ));
            return;
        }
    }
    let Ok(mount_canon) = std::fs::canonicalize(mountpoint) else {
        return;
    };
    for tier in tiers {
        let tier_canon =
            std::fs::canonicalize(&tier.path).unwrap_or_else(|_| tier.path.clone());
        if mount_canon.starts_with(&tier_canon) {
            problems.push(format!(
                "mountpoint \"{}\" is inside tier {} (\"{}\")",
                mountpoint.display(),
                tier.id,
                tier.path.display()
            ));
        } else if tier_canon.starts_with(&mount_canon) {
            problems.push(format!(
                "tier {} (\"{}\") is inside the mountpoint \"{}\"",
                tier.id,
                tier.path.display(),
                mountpoint.display()
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(id: &str, path: &Path) -> TierSpec {
        TierSpec {
            id: id.to_string(),
            path: path.to_path_buf(),
            watermark: 50,
        }
    }

    #[test]
    fn test_defaults_name_the_fs_and_auto_unmount() {
        let mnt = tempfile::tempdir().unwrap();
        let t0 = tempfile::tempdir().unwrap();
        let t1 = tempfile::tempdir().unwrap();
        let tiers = [tier("fast", t0.path()), tier("slow", t1.path())];
        let spec = MountSpec::build(mnt.path(), "", &tiers).unwrap();
        assert!(spec.fuser_options().contains(&MountOption::AutoUnmount));
        assert!(spec
            .fuser_options()
            .iter()
            .any(|o| matches!(o, MountOption::FSName(n) if n == "autotier")));
        assert!(!spec.read_only());
        assert_eq!(spec.mountpoint(), mnt.path());
    }

    #[test]
    fn test_raising_knobs() {
        let mnt = tempfile::tempdir().unwrap();
        let t0 = tempfile::tempdir().unwrap();
        let t1 = tempfile::tempdir().unwrap();
        let tiers = [tier("fast", t0.path()), tier("slow", t1.path())];
        let spec =
            MountSpec::build(mnt.path(), "allow_other,ro,default_permissions", &tiers).unwrap();
        assert!(spec.fuser_options().contains(&MountOption::AllowOther));
        assert!(spec.fuser_options().contains(&MountOption::DefaultPermissions));
        assert!(spec.read_only());
    }

    #[test]
    fn test_last_token_wins() {
        let mnt = tempfile::tempdir().unwrap();
        let t0 = tempfile::tempdir().unwrap();
        let t1 = tempfile::tempdir().unwrap();
        let tiers = [tier("fast", t0.path()), tier("slow", t1.path())];
        let spec = MountSpec::build(mnt.path(), "ro,rw", &tiers).unwrap();
        assert!(!spec.read_only());
        let spec = MountSpec::build(mnt.path(), "rw,ro", &tiers).unwrap();
        assert!(spec.read_only());
    }

    #[test]
    fn test_lowering_a_default_knob() {
        let mnt = tempfile::tempdir().unwrap();
        let t0 = tempfile::tempdir().unwrap();
        let t1 = tempfile::tempdir().unwrap();
        let tiers = [tier("fast", t0.path()), tier("slow", t1.path())];
        let spec = MountSpec::build(mnt.path(), "noauto_unmount", &tiers).unwrap();
        assert!(!spec.fuser_options().contains(&MountOption::AutoUnmount));
    }

    #[test]
    fn test_all_problems_reported_together() {
        let t0 = tempfile::tempdir().unwrap();
        let tiers = [tier("fast", t0.path())];
        let err = MountSpec::build(
            Path::new("/nonexistent/autotier/mnt"),
            "bogus,also_bogus",
            &tiers,
        )
        .unwrap_err();
        let FuseError::MountSetup { problems, .. } = err;
        assert_eq!(problems.len(), 3);
        assert!(problems
            .iter()
            .any(|p| p.contains("unknown mount option: bogus")));
        assert!(problems
            .iter()
            .any(|p| p.contains("unknown mount option: also_bogus")));
        assert!(problems.iter().any(|p| p.contains("cannot use mountpoint")));
    }

    #[test]
    fn test_mountpoint_must_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let err = MountSpec::build(&file, "", &[]).unwrap_err();
        let FuseError::MountSetup { problems, .. } = err;
        assert!(problems.iter().any(|p| p.contains("not a directory")));
    }

    #[test]
    fn test_mountpoint_inside_tier_rejected() {
        let t0 = tempfile::tempdir().unwrap();
        let t1 = tempfile::tempdir().unwrap();
        let mnt = t0.path().join("mnt");
        std::fs::create_dir(&mnt).unwrap();
        let tiers = [tier("fast", t0.path()), tier("slow", t1.path())];
        let err = MountSpec::build(&mnt, "", &tiers).unwrap_err();
        let FuseError::MountSetup { problems, .. } = err;
        assert!(problems.iter().any(|p| p.contains("is inside tier fast")));
    }

    #[test]
    fn test_tier_inside_mountpoint_rejected() {
        let mnt = tempfile::tempdir().unwrap();
        let t1 = tempfile::tempdir().unwrap();
        let nested = mnt.path().join("t0");
        std::fs::create_dir(&nested).unwrap();
        let tiers = [tier("fast", &nested), tier("slow", t1.path())];
        let err = MountSpec::build(mnt.path(), "", &tiers).unwrap_err();
        let FuseError::MountSetup { problems, .. } = err;
        assert!(problems
            .iter()
            .any(|p| p.contains("is inside the mountpoint")));
    }

    #[test]
    fn test_whitespace_and_empty_tokens_ignored() {
        let mnt = tempfile::tempdir().unwrap();
        let t0 = tempfile::tempdir().unwrap();
        let t1 = tempfile::tempdir().unwrap();
        let tiers = [tier("fast", t0.path()), tier("slow", t1.path())];
        let spec = MountSpec::build(mnt.path(), " allow_other , ,ro ", &tiers).unwrap();
        assert!(spec.fuser_options().contains(&MountOption::AllowOther));
        assert!(spec.read_only());
    }
}
