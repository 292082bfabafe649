//! Classifier for the solver's line-oriented stdout.

use crate::state::SolvedField;

/// One stdout line, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum SolverLine {
    /// `Field center: (RA,Dec) = (83.822083, -5.391111) deg.`
    FieldCenter { ra: f64, dec: f64 },
    /// `Field size: 1.2 x 0.9 degrees`, text after the colon
    FieldSize(String),
    /// `Field 1: ... pixel scale 2.51 arcsec/pix.`, text after `scale `
    PixelScale(String),
    /// `The star Betelgeuse (alpha Ori)`, constellation abbreviation
    Star(String),
    Other,
}

impl SolverLine {
    pub fn classify(line: &str) -> Self {
        let line = line.trim_end();

        if line.starts_with("Field center") {
            if let Some((ra, dec)) = parse_center(line) {
                return SolverLine::FieldCenter { ra, dec };
            }
        } else if line.starts_with("Field size") {
            if let Some((_, size)) = line.split_once(':') {
                return SolverLine::FieldSize(size.trim().to_string());
            }
        } else if line.contains("pixel scale") {
            if let Some((_, scale)) = line.split_once("scale ") {
                return SolverLine::PixelScale(scale.trim().to_string());
            }
        } else if line.contains("The star") {
            let stripped = line.replace(')', "");
            let stripped = stripped.trim_end();
            if let Some(start) = stripped.len().checked_sub(3) {
                if let Some(con) = stripped.get(start..) {
                    if !con.trim().is_empty() {
                        return SolverLine::Star(con.to_string());
                    }
                }
            }
        }

        SolverLine::Other
    }
}

fn parse_center(line: &str) -> Option<(f64, f64)> {
    let (_, rest) = line.split_once("= (")?;
    let (inner, _) = rest.split_once(')')?;
    let (ra, dec) = inner.split_once(',')?;
    Some((ra.trim().parse().ok()?, dec.trim().parse().ok()?))
}

/// Folds classified lines into the fields of a solution.
#[derive(Debug, Clone, Default)]
pub struct SolveAccumulator {
    center: Option<(f64, f64)>,
    field_size: Option<String>,
    pixel_scale: Option<String>,
    constellations: Vec<String>,
}

impl SolveAccumulator {
    pub fn feed(&mut self, line: &str) -> SolverLine {
        let classified = SolverLine::classify(line);
        match &classified {
            SolverLine::FieldCenter { ra, dec } => self.center = Some((*ra, *dec)),
            SolverLine::FieldSize(size) => self.field_size = Some(size.clone()),
            SolverLine::PixelScale(scale) => self.pixel_scale = Some(scale.clone()),
            SolverLine::Star(con) => {
                if !self.constellations.contains(con) {
                    self.constellations.push(con.clone());
                }
            }
            SolverLine::Other => {}
        }
        classified
    }

    pub fn has_center(&self) -> bool {
        self.center.is_some()
    }

    /// The solution, if a field center was ever reported.
    pub fn finish(self) -> Option<SolvedField> {
        let (ra, dec) = self.center?;
        Some(SolvedField {
            ra,
            dec,
            field_size: self.field_size,
            pixel_scale: self.pixel_scale,
            constellations: self.constellations,
        })
    }
}
