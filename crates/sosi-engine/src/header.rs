//! File header values read from the `.HODE` group.

use sosi_common::names::split_name;
use sosi_common::{Result, SosiError, SosiName};

/// Header values the engine needs for coordinate scaling and validation.
#[derive(Debug, Clone, PartialEq)]
pub struct FileHeader {
    /// Plane unit (`...ENHET`).
    pub unit: f64,
    /// Height unit (`...ENHET-H`), the plane unit when absent.
    pub unit_height: f64,
    /// Depth unit (`...ENHET-D`), the plane unit when absent.
    pub unit_depth: f64,
    /// Origin north (`...ORIGO-NØ`).
    pub origin_north: f64,
    /// Origin east (`...ORIGO-NØ`).
    pub origin_east: f64,
    /// NGIS layer (`..NGIS-LAG`).
    pub ngis_layer: Option<String>,
    /// SOSI version (`..SOSI-VERSJON`).
    pub sosi_version: Option<String>,
}

impl Default for FileHeader {
    fn default() -> Self {
        Self {
            unit: 1.0,
            unit_height: 1.0,
            unit_depth: 1.0,
            origin_north: 0.0,
            origin_east: 0.0,
            ngis_layer: None,
            sosi_version: None,
        }
    }
}

fn first_f64(rest: &str) -> Option<f64> {
    rest.split_whitespace().next()?.parse().ok()
}

fn two_f64(rest: &str) -> Option<(f64, f64)> {
    let mut it = rest.split_whitespace();
    let a = it.next()?.parse().ok()?;
    let b = it.next()?.parse().ok()?;
    Some((a, b))
}

fn first_word(rest: &str) -> Option<String> {
    rest.split_whitespace().next().map(str::to_string)
}

impl FileHeader {
    /// Extracts header values from the attribute lines of group 0.
    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut header = Self::default();
        let mut unit_height = None;
        let mut unit_depth = None;

        for line in lines {
            let (Some(name), rest) = split_name(line) else {
                continue;
            };
            match name.to_uppercase().as_str() {
                "...ENHET" => header.unit = first_f64(rest).unwrap_or(header.unit),
                "...ENHET-H" => unit_height = first_f64(rest),
                "...ENHET-D" => unit_depth = first_f64(rest),
                "...ORIGO-NØ" => {
                    if let Some((n, e)) = two_f64(rest) {
                        header.origin_north = n;
                        header.origin_east = e;
                    }
                }
                "..NGIS-LAG" => header.ngis_layer = first_word(rest),
                "..SOSI-VERSJON" => header.sosi_version = first_word(rest),
                _ => {}
            }
        }

        header.unit_height = unit_height.unwrap_or(header.unit);
        header.unit_depth = unit_depth.unwrap_or(header.unit);
        header
    }

    /// Rejects a header line that contradicts the values already in use.
    ///
    /// Only checked while the file has groups besides the header, since existing
    /// coordinates were scaled with the current values.
    pub fn check_line(&self, name: SosiName, rest: &str) -> Result<()> {
        let conflict = match name {
            SosiName::Enhet3 => first_f64(rest) != Some(self.unit),
            SosiName::Enhet3H => first_f64(rest) != Some(self.unit_height),
            SosiName::Enhet3D => first_f64(rest) != Some(self.unit_depth),
            SosiName::OrigoNo => two_f64(rest) != Some((self.origin_north, self.origin_east)),
            SosiName::NgisLag => first_word(rest) != self.ngis_layer,
            _ => false,
        };
        if conflict {
            return Err(SosiError::HeaderConflict(format!(
                "{} {} does not match the file header",
                name.as_str(),
                rest
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HODE: &[&str] = &[
        ".HODE",
        "..TEGNSETT ISO8859-10",
        "..TRANSPAR",
        "...KOORDSYS 22",
        "...ORIGO-NØ 6600000 500000",
        "...ENHET 0.01",
        "...ENHET-H 0.1",
        "..SOSI-VERSJON 4.0",
        "..NGIS-LAG Vegnett",
    ];

    #[test]
    fn test_from_lines() {
        let h = FileHeader::from_lines(HODE.iter().copied());
        assert_eq!(h.unit, 0.01);
        assert_eq!(h.unit_height, 0.1);
        assert_eq!(h.unit_depth, 0.01);
        assert_eq!(h.origin_north, 6_600_000.0);
        assert_eq!(h.origin_east, 500_000.0);
        assert_eq!(h.ngis_layer.as_deref(), Some("Vegnett"));
        assert_eq!(h.sosi_version.as_deref(), Some("4.0"));
    }

    #[test]
    fn test_defaults() {
        let h = FileHeader::from_lines([".HODE"]);
        assert_eq!(h, FileHeader::default());
    }

    #[test]
    fn test_check_line() {
        let h = FileHeader::from_lines(HODE.iter().copied());
        assert!(h.check_line(SosiName::Enhet3, "0.01").is_ok());
        assert!(h.check_line(SosiName::Enhet3, "0.001").is_err());
        assert!(h.check_line(SosiName::OrigoNo, "6600000 500000").is_ok());
        let err = h.check_line(SosiName::OrigoNo, "0 0").unwrap_err();
        assert!(matches!(err, SosiError::HeaderConflict(_)));
        assert!(h.check_line(SosiName::NgisLag, "Annet").is_err());
        assert!(h.check_line(SosiName::Objtype, "Veg").is_ok());
    }
}
