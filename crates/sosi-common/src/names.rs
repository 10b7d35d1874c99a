//! SOSI name dictionary.
//!
//! Group-start names (one leading dot) are identified by a [`GroupName`] code that
//! is stored in the group table. The other predefined names are the ones the engine
//! itself interprets while scanning and editing attribute lines.

use serde::{Deserialize, Serialize};

/// Group-start names with their stored codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum GroupName {
    Slutt = 0,
    Punkt = 1,
    Linje = 2,
    Kurve = 3,
    Bue = 4,
    Buep = 5,
    Sirkel = 6,
    Sirkelp = 7,
    Klotoide = 8,
    Sverm = 9,
    Tekst = 10,
    Trase = 11,
    Flate = 12,
    Bezier = 13,
    Raster = 14,
    Def = 15,
    Objdef = 16,
    Mlinje = 17,
    Struktur = 18,
    Objekt = 19,
    Symbol = 20,
    Hode = 21,
}

const GROUP_NAMES: [(GroupName, &str); 22] = [
    (GroupName::Slutt, ".SLUTT"),
    (GroupName::Punkt, ".PUNKT"),
    (GroupName::Linje, ".LINJE"),
    (GroupName::Kurve, ".KURVE"),
    (GroupName::Bue, ".BUE"),
    (GroupName::Buep, ".BUEP"),
    (GroupName::Sirkel, ".SIRKEL"),
    (GroupName::Sirkelp, ".SIRKELP"),
    (GroupName::Klotoide, ".KLOTOIDE"),
    (GroupName::Sverm, ".SVERM"),
    (GroupName::Tekst, ".TEKST"),
    (GroupName::Trase, ".TRASE"),
    (GroupName::Flate, ".FLATE"),
    (GroupName::Bezier, ".BEZIER"),
    (GroupName::Raster, ".RASTER"),
    (GroupName::Def, ".DEF"),
    (GroupName::Objdef, ".OBJDEF"),
    (GroupName::Mlinje, ".MLINJE"),
    (GroupName::Struktur, ".STRUKTUR"),
    (GroupName::Objekt, ".OBJEKT"),
    (GroupName::Symbol, ".SYMBOL"),
    (GroupName::Hode, ".HODE"),
];

impl GroupName {
    /// Returns the stored code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Returns the name for a stored code.
    pub fn from_code(code: u16) -> Option<Self> {
        GROUP_NAMES.get(code as usize).map(|(g, _)| *g)
    }

    /// Returns the SOSI spelling, including the leading dot.
    pub fn as_str(self) -> &'static str {
        GROUP_NAMES[self as usize].1
    }

    /// Looks up an upper-cased group-start name.
    pub fn from_name(name: &str) -> Option<Self> {
        GROUP_NAMES.iter().find(|(_, n)| *n == name).map(|(g, _)| *g)
    }

    /// Returns true for names whose geometry is a circle or arc.
    pub fn is_arc(self) -> bool {
        matches!(
            self,
            GroupName::Bue | GroupName::Buep | GroupName::Sirkel | GroupName::Sirkelp
        )
    }

    /// Returns true for line-like groups that polygons may reference.
    pub fn is_line(self) -> bool {
        matches!(
            self,
            GroupName::Linje
                | GroupName::Kurve
                | GroupName::Bue
                | GroupName::Buep
                | GroupName::Sirkel
                | GroupName::Sirkelp
                | GroupName::Klotoide
                | GroupName::Trase
        )
    }
}

impl std::fmt::Display for GroupName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Predefined names below group level that the engine interprets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SosiName {
    Group(GroupName),
    Na,
    Nah,
    Nad,
    Ref1,
    Ref2,
    Radius,
    Enhet2,
    Enhet2H,
    Enhet2D,
    Enhet3,
    Enhet3H,
    Enhet3D,
    OrigoNo,
    Hoyde,
    Dybde,
    NgisFlagg,
    NgisLag,
    Objtype,
    Kp,
}

const OTHER_NAMES: [(SosiName, &str); 19] = [
    (SosiName::Na, "..NØ"),
    (SosiName::Nah, "..NØH"),
    (SosiName::Nad, "..NØD"),
    (SosiName::Ref1, ".."),
    (SosiName::Ref2, "..REF"),
    (SosiName::Radius, "..RADIUS"),
    (SosiName::Enhet2, "..ENHET"),
    (SosiName::Enhet2H, "..ENHET-H"),
    (SosiName::Enhet2D, "..ENHET-D"),
    (SosiName::Enhet3, "...ENHET"),
    (SosiName::Enhet3H, "...ENHET-H"),
    (SosiName::Enhet3D, "...ENHET-D"),
    (SosiName::OrigoNo, "...ORIGO-NØ"),
    (SosiName::Hoyde, "..HØYDE"),
    (SosiName::Dybde, "..DYBDE"),
    (SosiName::NgisFlagg, "..NGIS-FLAGG"),
    (SosiName::NgisLag, "..NGIS-LAG"),
    (SosiName::Objtype, "..OBJTYPE"),
    (SosiName::Kp, "...KP"),
];

impl SosiName {
    /// Looks up an upper-cased name.
    pub fn lookup(name: &str) -> Option<Self> {
        if let Some(g) = GroupName::from_name(name) {
            return Some(SosiName::Group(g));
        }
        OTHER_NAMES.iter().find(|(_, n)| *n == name).map(|(s, _)| *s)
    }

    /// Returns the SOSI spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            SosiName::Group(g) => g.as_str(),
            other => OTHER_NAMES
                .iter()
                .find(|(s, _)| *s == other)
                .map(|(_, n)| *n)
                .unwrap_or(""),
        }
    }

    /// Returns true for the coordinate block starters.
    pub fn is_coordinate(self) -> bool {
        matches!(self, SosiName::Na | SosiName::Nah | SosiName::Nad)
    }
}

/// Number of leading dots of a name token.
pub fn level(token: &str) -> usize {
    token.bytes().take_while(|b| *b == b'.').count()
}

/// Returns true if a token starts a SOSI name rather than a number such as `.5`.
pub fn is_name_token(token: &str) -> bool {
    let dots = level(token);
    dots > 0 && !token[dots..].starts_with(|c: char| c.is_ascii_digit())
}

/// Splits a line into its leading name token and the remainder.
///
/// Returns `None` as name when the line does not start with a SOSI name.
pub fn split_name(line: &str) -> (Option<&str>, &str) {
    let trimmed = line.trim_start();
    let end = trimmed
        .find(char::is_whitespace)
        .unwrap_or(trimmed.len());
    let token = &trimmed[..end];
    if is_name_token(token) {
        (Some(token), trimmed[end..].trim_start())
    } else {
        (None, trimmed)
    }
}
