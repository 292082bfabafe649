//! Files written around a solve: the staged frame, the RA/Dec record, the
//! observation log and the image archive.

use crate::config::ObservingConfig;
use crate::state::SolvedField;
use chrono::{DateTime, Local};
use shared::camera_interface::Frame;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const RADEC_FILE: &str = "radec.txt";
pub const OBS_LOG_FILE: &str = "obs.log";
pub const HISTORY_DIR: &str = "history";
const STAGED_STEM: &str = "cap";

/// `HH:MM:SS RA Dec constellations` as shown in status and the observation log.
pub fn solution_line(field: &SolvedField, when: DateTime<Local>) -> String {
    format!(
        "{} {:.6} {:.6} {}",
        when.format("%H:%M:%S"),
        field.ra,
        field.dec,
        field.constellations.join(", ")
    )
    .trim_end()
    .to_string()
}

pub struct SolveArtifacts {
    dir: PathBuf,
    observing: ObservingConfig,
}

impl SolveArtifacts {
    pub fn new(dir: impl Into<PathBuf>, observing: ObservingConfig) -> Self {
        Self {
            dir: dir.into(),
            observing,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn radec_path(&self) -> PathBuf {
        self.dir.join(RADEC_FILE)
    }

    pub fn obs_log_path(&self) -> PathBuf {
        self.dir.join(OBS_LOG_FILE)
    }

    pub fn history_dir(&self) -> PathBuf {
        self.dir.join(HISTORY_DIR)
    }

    /// Write `frame` to `cap.<ext>` in the solve directory.
    pub fn stage(&self, frame: &Frame) -> io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self
            .dir
            .join(format!("{STAGED_STEM}.{}", frame.format.extension()));
        std::fs::write(&path, &frame.data)?;
        Ok(path)
    }

    /// Overwrite the RA/Dec record.
    pub fn write_radec(&self, ra: f64, dec: f64) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.radec_path(), format!("{ra:.6} {dec:.6}\n"))
    }

    /// Persist a successful solve and return its status line.
    pub fn record_solution(
        &self,
        field: &SolvedField,
        image: &Path,
        when: DateTime<Local>,
    ) -> io::Result<String> {
        self.write_radec(field.ra, field.dec)?;
        let line = solution_line(field, when);

        if self.observing.save_position {
            let mut log = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.obs_log_path())?;
            writeln!(log, "{line}")?;
        }

        if self.observing.save_image {
            let history = self.history_dir();
            std::fs::create_dir_all(&history)?;
            let ext = image
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("jpg");
            let target = history.join(format!("{}.{ext}", when.format("%m_%d_%y_%H_%M_%S")));
            std::fs::copy(image, &target)?;
            tracing::info!("Archived solved image to {}", target.display());
        }

        Ok(line)
    }

    /// Load the observation log for navigation.
    pub fn observations(&self) -> io::Result<ObservationCursor> {
        let text = std::fs::read_to_string(self.obs_log_path())?;
        Ok(ObservationCursor::new(
            text.lines()
                .filter(|l| !l.trim().is_empty())
                .map(ObservationEntry::parse)
                .collect(),
        ))
    }
}

/// One line of the observation log.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationEntry {
    pub line: String,
    pub position: Option<(f64, f64)>,
}

impl ObservationEntry {
    pub fn parse(line: &str) -> Self {
        let mut fields = line.split_whitespace().skip(1);
        let position = match (fields.next(), fields.next()) {
            (Some(ra), Some(dec)) => ra.parse().ok().zip(dec.parse().ok()),
            _ => None,
        };
        Self {
            line: line.trim_end().to_string(),
            position,
        }
    }
}

/// Clamped cursor over the recorded observations.
#[derive(Debug, Clone, Default)]
pub struct ObservationCursor {
    entries: Vec<ObservationEntry>,
    index: usize,
}

impl ObservationCursor {
    pub fn new(entries: Vec<ObservationEntry>) -> Self {
        Self { entries, index: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> Option<&ObservationEntry> {
        self.entries.get(self.index)
    }

    pub fn next(&mut self) -> Option<&ObservationEntry> {
        if self.index + 1 < self.entries.len() {
            self.index += 1;
        }
        self.current()
    }

    pub fn prev(&mut self) -> Option<&ObservationEntry> {
        self.index = self.index.saturating_sub(1);
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::TimeZone;
    use shared::camera_interface::{FrameSource, ImageFormat};
    use tempfile::TempDir;

    fn field() -> SolvedField {
        SolvedField {
            ra: 83.822083,
            dec: -5.391111,
            field_size: Some("1.2 x 0.9 degrees".to_string()),
            pixel_scale: None,
            constellations: vec!["Ori".to_string(), "Mon".to_string()],
        }
    }

    fn when() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 21, 4, 5).unwrap()
    }

    #[test]
    fn test_solution_line() {
        assert_eq!(
            solution_line(&field(), when()),
            "21:04:05 83.822083 -5.391111 Ori, Mon"
        );
    }

    #[test]
    fn test_stage_uses_frame_extension() {
        let dir = TempDir::new().unwrap();
        let artifacts = SolveArtifacts::new(dir.path(), ObservingConfig::default());
        let frame = Frame::new(Bytes::from_static(b"\x89PNG"), 1, FrameSource::Live, ImageFormat::Png);
        let path = artifacts.stage(&frame).unwrap();
        assert_eq!(path, dir.path().join("cap.png"));
        assert_eq!(std::fs::read(path).unwrap(), b"\x89PNG");
    }

    #[test]
    fn test_record_solution_writes_all_enabled_artifacts() {
        let dir = TempDir::new().unwrap();
        let artifacts = SolveArtifacts::new(
            dir.path(),
            ObservingConfig {
                save_position: true,
                save_image: true,
            },
        );
        let image = dir.path().join("cap.jpg");
        std::fs::write(&image, b"\xFF\xD8jpeg").unwrap();

        artifacts.record_solution(&field(), &image, when()).unwrap();
        artifacts.record_solution(&field(), &image, when()).unwrap();

        assert_eq!(
            std::fs::read_to_string(artifacts.radec_path()).unwrap(),
            "83.822083 -5.391111\n"
        );
        let log = std::fs::read_to_string(artifacts.obs_log_path()).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(artifacts
            .history_dir()
            .join("03_09_24_21_04_05.jpg")
            .exists());
    }

    #[test]
    fn test_position_logging_disabled() {
        let dir = TempDir::new().unwrap();
        let artifacts = SolveArtifacts::new(
            dir.path(),
            ObservingConfig {
                save_position: false,
                save_image: false,
            },
        );
        artifacts
            .record_solution(&field(), &dir.path().join("cap.jpg"), when())
            .unwrap();
        assert!(artifacts.radec_path().exists());
        assert!(!artifacts.obs_log_path().exists());
        assert!(!artifacts.history_dir().exists());
    }

    #[test]
    fn test_cursor_clamps() {
        let mut cursor = ObservationCursor::new(vec![
            ObservationEntry::parse("01:00:00 10.0 20.0 Ori"),
            ObservationEntry::parse("02:00:00 30.0 -40.0"),
        ]);
        assert_eq!(cursor.prev().unwrap().position, Some((10.0, 20.0)));
        assert_eq!(cursor.next().unwrap().position, Some((30.0, -40.0)));
        assert_eq!(cursor.next().unwrap().position, Some((30.0, -40.0)));
        assert_eq!(cursor.index(), 1);
    }

    #[test]
    fn test_entry_without_position() {
        let entry = ObservationEntry::parse("garbage");
        assert!(entry.position.is_none());
        assert_eq!(entry.line, "garbage");
    }
}
