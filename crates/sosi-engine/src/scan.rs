//! Line-oriented reader that splits a SOSI source into groups.
//!
//! Each group starts at a line whose first token is a one-dot name and runs until
//! the next one. Reading stops at `.SLUTT`. Source bytes are not transcoded; lines
//! that are not valid UTF-8 are read lossily.

use crate::header::FileHeader;
use crate::ring::{GroupBody, PointInfo};
use sosi_common::names::{level, split_name};
use sosi_common::{GroupName, InfoFlags, SerialNo, SosiName, HOYDE_MANGLER};

/// One group as read from the source file.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedGroup {
    /// Byte offset of the group's first line.
    pub source_offset: u64,
    pub name: GroupName,
    /// Serial number from line 1, `None` for the header.
    pub serial: Option<SerialNo>,
    /// Attribute lines, line 1 normalised to `NAME snr:`.
    pub lines: Vec<String>,
    pub east: Vec<f64>,
    pub north: Vec<f64>,
    pub point_info: Vec<PointInfo>,
    /// NUL-terminated point-attribute text, addressed by `PointInfo::pinfo_offset`.
    pub point_attr: Vec<u8>,
    pub info: InfoFlags,
    pub unit: f64,
    pub unit_height: f64,
    pub unit_depth: f64,
    pub objtype: String,
}

impl ScannedGroup {
    /// Converts the group into a record-cache body.
    pub fn body(&self) -> GroupBody {
        let mut attr_text = Vec::new();
        for line in &self.lines {
            attr_text.extend_from_slice(line.as_bytes());
            attr_text.push(0);
        }
        GroupBody {
            attr_text,
            east: self.east.clone(),
            north: self.north.clone(),
            point_info: self.point_info.clone(),
            point_attr: self.point_attr.clone(),
        }
    }
}

/// Kind of coordinate block being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoordKind {
    Plain,
    Height,
    Depth,
}

impl CoordKind {
    fn values_per_point(self) -> usize {
        match self {
            CoordKind::Plain => 2,
            _ => 3,
        }
    }
}

/// Parses a serial number of the form `12:`.
pub fn parse_serial(rest: &str) -> Option<SerialNo> {
    let token = rest.split_whitespace().next()?;
    token.trim_end_matches(':').parse().ok()
}

/// Builds line 1 of a group.
pub fn first_line(name: GroupName, serial: Option<SerialNo>) -> String {
    match serial {
        Some(snr) => format!("{} {}:", name.as_str(), snr),
        None => name.as_str().to_string(),
    }
}

/// Sequential group reader over the source bytes.
pub struct Scanner<'a> {
    data: &'a [u8],
    pos: usize,
    line_no: usize,
    finished: bool,
}

/// A source line with its position.
struct RawLine {
    offset: usize,
    number: usize,
    text: String,
}

impl<'a> Scanner<'a> {
    /// Creates a scanner positioned at the start of the source.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            line_no: 0,
            finished: false,
        }
    }

    fn peek_line(&self) -> Option<RawLine> {
        if self.pos >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.pos..];
        let len = rest.iter().position(|b| *b == b'\n').unwrap_or(rest.len());
        let mut raw = &rest[..len];
        if raw.last() == Some(&b'\r') {
            raw = &raw[..raw.len() - 1];
        }
        Some(RawLine {
            offset: self.pos,
            number: self.line_no + 1,
            text: String::from_utf8_lossy(raw).into_owned(),
        })
    }

    fn advance(&mut self) {
        let rest = &self.data[self.pos..];
        let len = rest.iter().position(|b| *b == b'\n').map(|p| p + 1).unwrap_or(rest.len());
        self.pos += len;
        self.line_no += 1;
    }

    fn starts_group(text: &str) -> bool {
        matches!(split_name(text).0, Some(name) if level(name) == 1)
    }

    /// Reads the next group. Returns `None` at `.SLUTT` or the end of the source.
    ///
    /// `header` supplies the default units and origin; pass the default header while
    /// reading the `.HODE` group itself.
    pub fn next_group(&mut self, header: &FileHeader) -> Option<ScannedGroup> {
        loop {
            if self.finished {
                return None;
            }
            // Skip anything before the next group start
            let first = loop {
                let line = self.peek_line()?;
                self.advance();
                if Self::starts_group(&line.text) {
                    break line;
                }
            };

            let (name_token, rest) = split_name(&first.text);
            let token = name_token.unwrap_or_default().to_uppercase();
            let name = match GroupName::from_name(&token) {
                Some(GroupName::Slutt) => {
                    self.finished = true;
                    return None;
                }
                Some(name) => name,
                None => {
                    tracing::warn!(line = first.number, name = %token, "Unknown group name, skipping group");
                    self.skip_body();
                    continue;
                }
            };

            let serial = if name == GroupName::Hode {
                None
            } else {
                let serial = parse_serial(rest);
                if serial.is_none() {
                    tracing::warn!(line = first.number, "Group without serial number");
                }
                serial
            };

            return Some(self.read_body(first.offset as u64, name, serial, header));
        }
    }

    fn skip_body(&mut self) {
        while let Some(line) = self.peek_line() {
            if Self::starts_group(&line.text) {
                return;
            }
            self.advance();
        }
    }

    fn read_body(&mut self, source_offset: u64, name: GroupName, serial: Option<SerialNo>, header: &FileHeader) -> ScannedGroup {
        let mut group = ScannedGroup {
            source_offset,
            name,
            serial,
            lines: vec![first_line(name, serial)],
            east: Vec::new(),
            north: Vec::new(),
            point_info: Vec::new(),
            point_attr: Vec::new(),
            info: InfoFlags::empty(),
            unit: header.unit,
            unit_height: header.unit_height,
            unit_depth: header.unit_depth,
            objtype: String::new(),
        };
        let mut unit_height = None;
        let mut unit_depth = None;
        let mut coords: Option<CoordKind> = None;

        while let Some(line) = self.peek_line() {
            if Self::starts_group(&line.text) {
                break;
            }
            self.advance();

            let text = line.text.trim();
            if text.is_empty() {
                continue;
            }
            if text.starts_with('!') {
                if coords.is_none() {
                    group.lines.push(text.to_string());
                }
                continue;
            }

            let (name_token, rest) = split_name(text);
            let Some(token) = name_token else {
                match coords {
                    Some(kind) => {
                        let scale = Scale::new(&group, header, kind, unit_height, unit_depth);
                        read_coord_line(text, line.number, kind, &scale, &mut group);
                    }
                    None => match (group.lines.len() > 1, group.lines.last_mut()) {
                        // Continuation of the previous attribute line
                        (true, Some(last)) => {
                            last.push(' ');
                            last.push_str(text);
                        }
                        _ => tracing::warn!(line = line.number, "Dropping line without a name"),
                    },
                }
                continue;
            };

            let upper = token.to_uppercase();
            let known = SosiName::lookup(&upper);

            if let Some(k) = known.filter(|k| k.is_coordinate()) {
                let kind = match k {
                    SosiName::Nah => {
                        group.info.set(InfoFlags::NAH, true);
                        CoordKind::Height
                    }
                    SosiName::Nad => {
                        group.info.set(InfoFlags::NAD, true);
                        CoordKind::Depth
                    }
                    _ => CoordKind::Plain,
                };
                coords = Some(kind);
                if !rest.is_empty() {
                    let scale = Scale::new(&group, header, kind, unit_height, unit_depth);
                    read_coord_line(rest, line.number, kind, &scale, &mut group);
                }
                continue;
            }

            if let Some(kind) = coords {
                if level(&upper) >= 3 {
                    let scale = Scale::new(&group, header, kind, unit_height, unit_depth);
                    read_coord_line(text, line.number, kind, &scale, &mut group);
                } else {
                    tracing::warn!(line = line.number, name = %upper, "Attribute line inside coordinate block");
                }
                continue;
            }

            match known {
                Some(SosiName::Enhet2) => {
                    if let Some(u) = first_number(rest) {
                        group.unit = u;
                    }
                }
                Some(SosiName::Enhet2H) => unit_height = first_number(rest),
                Some(SosiName::Enhet2D) => unit_depth = first_number(rest),
                Some(SosiName::Ref1) | Some(SosiName::Ref2) => {
                    group.info.set(InfoFlags::REF, true);
                    if rest.contains('(') {
                        group.info.set(InfoFlags::OY_REF, true);
                    }
                }
                Some(SosiName::Objtype) => {
                    group.objtype = rest.split_whitespace().next().unwrap_or_default().to_string();
                }
                Some(SosiName::NgisFlagg) => {
                    group.info.set(InfoFlags::NGIS, true);
                    if matches!(rest.chars().next(), Some('R' | 'H' | 'r' | 'h')) {
                        group.info.set(InfoFlags::READ_ONLY, true);
                    }
                }
                _ => {}
            }

            if rest.is_empty() {
                group.lines.push(upper);
            } else {
                group.lines.push(format!("{} {}", upper, rest));
            }
        }

        group.unit_height = z_unit(unit_height, header.unit_height, &group, header);
        group.unit_depth = z_unit(unit_depth, header.unit_depth, &group, header);
        group
    }
}

/// Reads numbers and point attributes from one line of a coordinate block.
fn read_coord_line(text: &str, line_no: usize, kind: CoordKind, scale: &Scale, group: &mut ScannedGroup) {
    let per_point = kind.values_per_point();
    let mut values: Vec<f64> = Vec::with_capacity(per_point);
    let mut tokens = text.split_whitespace().peekable();

    while let Some(token) = tokens.next() {
        if sosi_common::names::is_name_token(token) {
            let mut value = Vec::new();
            while let Some(next) = tokens.peek() {
                if sosi_common::names::is_name_token(next) {
                    break;
                }
                value.push(*next);
                tokens.next();
            }
            attach_point_attr(group, &token.to_uppercase(), &value.join(" "), line_no);
            continue;
        }

        match token.parse::<f64>() {
            Ok(v) => values.push(v),
            Err(_) => {
                tracing::warn!(line = line_no, token, "Unreadable coordinate value");
                return;
            }
        }
        if values.len() == per_point {
            let n = scale.origin_north + values[0] * scale.unit;
            let e = scale.origin_east + values[1] * scale.unit;
            let height = match kind {
                CoordKind::Plain => HOYDE_MANGLER,
                CoordKind::Height | CoordKind::Depth => values[2] * scale.unit_z,
            };
            group.north.push(n);
            group.east.push(e);
            group.point_info.push(PointInfo {
                height,
                ..Default::default()
            });
            values.clear();
        }
    }

    if !values.is_empty() {
        tracing::warn!(line = line_no, "Incomplete coordinate dropped");
    }
}

/// Units and origin in effect for one coordinate line.
struct Scale {
    unit: f64,
    unit_z: f64,
    origin_north: f64,
    origin_east: f64,
}

impl Scale {
    fn new(group: &ScannedGroup, header: &FileHeader, kind: CoordKind, unit_height: Option<f64>, unit_depth: Option<f64>) -> Self {
        let unit_z = match kind {
            CoordKind::Depth => z_unit(unit_depth, header.unit_depth, group, header),
            _ => z_unit(unit_height, header.unit_height, group, header),
        };
        Self {
            unit: group.unit,
            unit_z,
            origin_north: header.origin_north,
            origin_east: header.origin_east,
        }
    }
}

/// Height or depth unit of a group.
///
/// A group-level `..ENHET-H`/`..ENHET-D` wins. A group that overrides its plane
/// unit uses that unit, otherwise the header's height or depth unit applies.
fn z_unit(group_z: Option<f64>, header_z: f64, group: &ScannedGroup, header: &FileHeader) -> f64 {
    match group_z {
        Some(u) => u,
        None if group.unit != header.unit => group.unit,
        None => header_z,
    }
}

fn first_number(rest: &str) -> Option<f64> {
    rest.split_whitespace().next()?.parse().ok()
}

/// Attaches `...NAME value` to the last point read.
fn attach_point_attr(group: &mut ScannedGroup, name: &str, value: &str, line_no: usize) {
    let Some(point) = group.point_info.last_mut() else {
        tracing::warn!(line = line_no, name, "Point attribute before first coordinate");
        return;
    };

    if SosiName::lookup(name) == Some(SosiName::Kp) {
        point.kp = value.split_whitespace().next().and_then(|v| v.parse().ok()).unwrap_or(1);
        group.info.set(InfoFlags::KP, true);
        return;
    }

    let item = if value.is_empty() {
        name.to_string()
    } else {
        format!("{} {}", name, value)
    };
    if point.has_pinfo() {
        // Extend this point's text, which is always the last one in the buffer
        group.point_attr.pop();
        group.point_attr.push(b' ');
    } else {
        point.pinfo_offset = group.point_attr.len() as u32;
    }
    group.point_attr.extend_from_slice(item.as_bytes());
    group.point_attr.push(0);
    group.info.set(InfoFlags::PINFO, true);
}
