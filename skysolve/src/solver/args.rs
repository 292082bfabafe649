use crate::config::SolverConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Previous position passed to the solver to narrow its search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHint {
    pub ra: f64,
    pub dec: f64,
    /// Degrees
    pub radius: f64,
}

/// One staged frame plus the parameters for a single solve attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveRequest {
    pub image: PathBuf,
    pub depth: u32,
    pub sigma: f64,
    pub scale_upper: f64,
    pub cpu_limit: Duration,
    pub hint: Option<SearchHint>,
}

impl SolveRequest {
    /// Build a request for `image`. The hint is only attached when directed
    /// search is enabled and a previous position exists.
    pub fn new(image: &Path, config: &SolverConfig, last_position: Option<(f64, f64)>) -> Self {
        let hint = last_position
            .filter(|_| config.search_enabled)
            .map(|(ra, dec)| SearchHint {
                ra,
                dec,
                radius: config.search_radius,
            });
        Self {
            image: image.to_path_buf(),
            depth: config.depth,
            sigma: config.sigma,
            scale_upper: config.scale_upper,
            cpu_limit: config.cpu_limit,
            hint,
        }
    }

    /// Command line arguments following the binary name.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.image.display().to_string(),
            "--depth".to_string(),
            self.depth.to_string(),
            "--sigma".to_string(),
            self.sigma.to_string(),
            "--overwrite".to_string(),
            "-u".to_string(),
            "app".to_string(),
            "-L".to_string(),
            self.scale_upper.to_string(),
            "--cpulimit".to_string(),
            self.cpu_limit.as_secs().max(1).to_string(),
        ];
        if let Some(hint) = &self.hint {
            args.extend([
                "--ra".to_string(),
                hint.ra.to_string(),
                "--dec".to_string(),
                hint.dec.to_string(),
                "--radius".to_string(),
                hint.radius.to_string(),
            ]);
        }
        args
    }
}
