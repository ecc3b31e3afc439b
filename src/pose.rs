//! Camera exterior orientation table.

use crate::error::Error;
use nalgebra::Vector3;
use std::{
    collections::{HashMap, hash_map::Entry},
    fs,
    path::Path,
};
use tracing::{debug, warn};
use uom::si::{
    angle::{degree, radian},
    f64::Angle,
};

const COLUMNS: usize = 7;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
#[error("could not find {stem} in the camera position and orientation file")]
pub struct PoseNotFound {
    pub stem: String,
}

/// Position and orientation of the camera when an image was captured.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoseRecord {
    pub easting: f64,
    pub northing: f64,
    pub altitude: f64,
    pub omega: Angle,
    pub phi: Angle,
    pub kappa: Angle,
}

impl PoseRecord {
    /// Camera position as (easting, northing, altitude).
    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.easting, self.northing, self.altitude)
    }

    /// Omega, phi and kappa in radians.
    pub fn orientation(&self) -> Vector3<f64> {
        Vector3::new(
            self.omega.get::<radian>(),
            self.phi.get::<radian>(),
            self.kappa.get::<radian>(),
        )
    }
}

/// Pose records keyed by image stem.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PoseTable {
    records: HashMap<String, PoseRecord>,
}

impl PoseTable {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path).map_err(|err| Error::PoseFileRead {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let table = Self::parse(&text).map_err(|(line, reason)| Error::PoseTableParse {
            path: path.to_path_buf(),
            line,
            reason,
        })?;
        debug!(path = %path.display(), count = table.len(), "read pose table");
        Ok(table)
    }

    /// Parse whitespace-separated `id easting northing altitude omega phi kappa`
    /// rows, angles in degrees. Blank lines are ignored.
    ///
    /// On failure returns the 1-based line number and a reason.
    pub fn parse(text: &str) -> Result<Self, (usize, String)> {
        let mut records = HashMap::new();
        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            if fields.len() != COLUMNS {
                return Err((
                    line_no,
                    format!("expected {COLUMNS} columns but found {}", fields.len()),
                ));
            }

            let mut values = [0.0f64; COLUMNS - 1];
            for (value, field) in values.iter_mut().zip(&fields[1..]) {
                *value = field
                    .parse()
                    .map_err(|_| (line_no, format!("`{field}` is not a number")))?;
            }
            let [easting, northing, altitude, omega, phi, kappa] = values;
            let record = PoseRecord {
                easting,
                northing,
                altitude,
                omega: Angle::new::<degree>(omega),
                phi: Angle::new::<degree>(phi),
                kappa: Angle::new::<degree>(kappa),
            };

            match records.entry(fields[0].to_string()) {
                Entry::Vacant(entry) => {
                    entry.insert(record);
                }
                Entry::Occupied(entry) => {
                    warn!(
                        "{} appears again on line {line_no}, keeping the first entry",
                        entry.key()
                    );
                }
            }
        }

        Ok(Self { records })
    }

    pub fn lookup(&self, stem: &str) -> Result<&PoseRecord, PoseNotFound> {
        self.records.get(stem).ok_or_else(|| PoseNotFound {
            stem: stem.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;
    use std::f64::consts::PI;

    #[test]
    fn converts_row_to_position_and_radians() {
        let table = PoseTable::parse("img001 500000.0 4000000.0 1200.0 1.5 -0.3 90.0\n").unwrap();
        let record = table.lookup("img001").unwrap();

        assert_eq!(record.position(), Vector3::new(500000.0, 4000000.0, 1200.0));
        assert_relative_eq!(
            record.orientation(),
            Vector3::new(1.5, -0.3, 90.0) * PI / 180.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn missing_stem_is_reported() {
        let table = PoseTable::parse("img001 1 2 3 4 5 6").unwrap();
        assert_eq!(
            table.lookup("img002"),
            Err(PoseNotFound {
                stem: "img002".into()
            })
        );
    }

    #[test]
    fn tabs_and_repeated_spaces_separate_columns() {
        let table = PoseTable::parse("a\t1  2 3\t\t4 5 6\n\n   \nb 7 8 9 10 11 12\n").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup("b").unwrap().altitude, 9.0);
    }

    #[test]
    fn first_duplicate_wins() {
        let table = PoseTable::parse("a 1 2 3 4 5 6\na 7 8 9 10 11 12\n").unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup("a").unwrap().easting, 1.0);
    }

    #[rstest]
    #[case("a 1 2 3 4 5\n", 1)]
    #[case("a 1 2 3 4 5 6\nb 1 2 3 4 5 6 7\n", 2)]
    #[case("a 1 2 3 4 5 6\n\nb 1 2 x 4 5 6\n", 3)]
    fn structural_mismatch_names_line(#[case] text: &str, #[case] line: usize) {
        assert_eq!(PoseTable::parse(text).unwrap_err().0, line);
    }

    #[test]
    fn load_wraps_parse_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("poses.txt");
        fs::write(&path, "a 1 2 3\n").unwrap();

        assert!(matches!(
            PoseTable::load(&path),
            Err(Error::PoseTableParse { line: 1, .. })
        ));
    }

    #[test]
    fn unreadable_file_names_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("poses.txt");
        fs::write(&path, [b'a', b' ', 0xff, 0xfe, b'\n']).unwrap();

        match PoseTable::load(&path) {
            Err(err @ Error::PoseFileRead { .. }) => {
                assert!(err.to_string().contains(&path.display().to_string()))
            }
            other => panic!("expected PoseFileRead, got {other:?}"),
        }
    }
}
