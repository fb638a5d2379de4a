//! Frame sources: a sorted directory of static images or an external
//! capture command writing one frame per call.

use chrono::Local;
use spotter_core::config::CaptureConfig;
use spotter_core::{host_name, Error, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Image file handed to a pipeline for one cycle.
///
/// Transient frames are deleted when dropped.
#[derive(Debug)]
pub struct Frame {
    path: PathBuf,
    transient: bool,
}

impl Frame {
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            transient: false,
        }
    }

    pub fn transient(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            transient: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if !self.transient {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove transient frame {:?}: {}", self.path, e);
            }
        }
    }
}

pub trait FrameSource: Send {
    /// Next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Regular files directly inside `dir`, absolute and sorted.
pub fn list_static_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let dir = std::fs::canonicalize(dir)
        .map_err(|e| Error::Acquisition(format!("input directory {:?}: {}", dir, e)))?;
    let mut files = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Pre-enumerated list of image files, visited once in order.
pub struct StaticFileSource {
    files: Vec<PathBuf>,
    position: usize,
}

impl StaticFileSource {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self { files, position: 0 }
    }

    pub fn from_dir(dir: &Path) -> Result<Self> {
        let files = list_static_files(dir)?;
        debug!("Static image folder: {:?}", dir);
        info!("Number of image files found: {}", files.len());
        Ok(Self::new(files))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.files.len() - self.position
    }
}

impl FrameSource for StaticFileSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.files.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;
        debug!("Image {} of {}: {:?}", self.position, self.files.len(), path);
        Ok(Some(Frame::persistent(path.clone())))
    }
}

/// `<YYYYMMDDHHMMSS>-<host>-webcam<ext>`
pub fn raw_frame_name(now: chrono::DateTime<Local>, host: &str, extension: &str) -> String {
    format!("{}-{}-webcam{}", now.format("%Y%m%d%H%M%S"), host, extension)
}

/// Captures a frame per call by running an external program
/// (`ffmpeg` by default) with `{device}` and `{output}` substituted.
pub struct CommandCaptureSource {
    program: String,
    args: Vec<String>,
    device: String,
    dir: PathBuf,
    extension: String,
    keep: bool,
    host: String,
}

impl CommandCaptureSource {
    /// Frames land in `dir`; unless `keep` is set they are removed after
    /// the cycle that consumed them.
    pub fn new(config: &CaptureConfig, camera: u32, dir: impl Into<PathBuf>, extension: &str, keep: bool) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            device: format!("/dev/video{}", camera),
            dir: dir.into(),
            extension: extension.to_string(),
            keep,
            host: host_name(),
        }
    }

    pub fn command_for(&self, output: &Path) -> Command {
        let output = output.to_string_lossy();
        let mut command = Command::new(&self.program);
        for arg in &self.args {
            command.arg(arg.replace("{device}", &self.device).replace("{output}", &output));
        }
        command
    }
}

impl FrameSource for CommandCaptureSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        std::fs::create_dir_all(&self.dir)?;
        let path = std::path::absolute(self.dir.join(raw_frame_name(Local::now(), &self.host, &self.extension)))?;

        let output = self
            .command_for(&path)
            .output()
            .map_err(|e| Error::Acquisition(format!("cannot run {}: {}", self.program, e)))?;
        if !output.status.success() {
            return Err(Error::Acquisition(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if !path.is_file() {
            return Err(Error::Acquisition(format!(
                "{} did not write {:?}",
                self.program, path
            )));
        }

        debug!("Captured frame {:?}", path);
        Ok(Some(if self.keep {
            Frame::persistent(path)
        } else {
            Frame::transient(path)
        }))
    }
}
