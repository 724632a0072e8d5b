// src/image/squashfs.rs

//! squashfs-tools backend for [`ImageTool`]
//!
//! Builds always overwrite (`-noappend`) and pin every input that could make
//! two identical trees hash differently: ownership, root mode, timestamps,
//! xattrs and the codec.

use super::packlist::PackList;
use super::ImageTool;
use crate::config::SquashfsConfig;
use crate::error::{Error, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// mksquashfs / unsquashfs subprocess wrapper
#[derive(Debug, Clone)]
pub struct SquashfsTool {
    mksquashfs: PathBuf,
    unsquashfs: PathBuf,
    compression: String,
    compression_level: u32,
}

impl SquashfsTool {
    pub fn new(config: &SquashfsConfig) -> Self {
        Self {
            mksquashfs: config.mksquashfs.clone(),
            unsquashfs: config.unsquashfs.clone(),
            compression: config.compression.clone(),
            compression_level: config.compression_level,
        }
    }

    /// Confirm both binaries can be executed
    pub fn check(&self) -> Result<()> {
        for tool in [&self.mksquashfs, &self.unsquashfs] {
            let output = Command::new(tool)
                .arg("-version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            if let Err(e) = output {
                return Err(Error::NotFound(format!("{}: {}", tool.display(), e)));
            }
        }
        Ok(())
    }

    /// Arguments shared by every build
    fn determinism_args(&self) -> Vec<String> {
        let mut args = vec![
            "-noappend".to_string(),
            "-no-xattrs".to_string(),
            "-mkfs-time".to_string(),
            "0".to_string(),
            "-all-time".to_string(),
            "0".to_string(),
            "-root-mode".to_string(),
            "755".to_string(),
            "-comp".to_string(),
            self.compression.clone(),
        ];
        if matches!(self.compression.as_str(), "zstd" | "gzip") {
            args.push("-Xcompression-level".to_string());
            args.push(self.compression_level.to_string());
        }
        args.push("-no-progress".to_string());
        args
    }

    fn mksquashfs_command(&self, source: &Path, dest: &Path) -> Command {
        let mut cmd = Command::new(&self.mksquashfs);
        cmd.arg(source).arg(dest).args(self.determinism_args());
        cmd
    }
}

impl ImageTool for SquashfsTool {
    fn build_from_dir(&self, source: &Path, dest: &Path) -> Result<()> {
        info!("Building {} from {}", dest.display(), source.display());
        let mut cmd = self.mksquashfs_command(source, dest);
        cmd.args(["-all-root", "-force-uid", "0", "-force-gid", "0"]);
        run_tool(&mut cmd, &self.mksquashfs)
    }

    fn build_from_pack_list(&self, list: &PackList, dest: &Path) -> Result<()> {
        info!("Building {} from pack list ({} entries)", dest.display(), list.len());

        let mut pseudo = tempfile::Builder::new()
            .prefix("cefs-packlist-")
            .suffix(".pf")
            .tempfile()?;
        pseudo.write_all(list.to_pseudo_file()?.as_bytes())?;
        pseudo.as_file().sync_all()?;

        // "-" means no source directories, everything comes from -pf
        let mut cmd = self.mksquashfs_command(Path::new("-"), dest);
        cmd.arg("-pf").arg(pseudo.path());
        run_tool(&mut cmd, &self.mksquashfs)
    }

    fn extract(&self, image: &Path, dest: &Path, subpath: Option<&Path>) -> Result<PathBuf> {
        info!("Extracting {} to {}", image.display(), dest.display());
        let mut cmd = Command::new(&self.unsquashfs);
        cmd.args(["-f", "-no-progress", "-d"]).arg(dest).arg(image);
        if let Some(sub) = subpath {
            cmd.arg(crate::paths::strip_root(sub));
        }
        run_tool(&mut cmd, &self.unsquashfs)?;

        Ok(match subpath {
            Some(sub) => dest.join(crate::paths::strip_root(sub)),
            None => dest.to_path_buf(),
        })
    }
}

/// Run a tool to completion, mapping non-zero exit to `BuildFailure`
fn run_tool(cmd: &mut Command, tool: &Path) -> Result<()> {
    debug!("Running {:?}", cmd);
    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("{} is not installed", tool.display()))
            }
            _ => Error::Io(e),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::BuildFailure {
            tool: tool.display().to_string(),
            status: output.status.to_string(),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(())
}
