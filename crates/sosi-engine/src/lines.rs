//! Attribute lines of the selected group.
//!
//! All lines live in one byte buffer, each terminated by NUL, with a start offset
//! per line. Line numbers are 1-based.

use crate::header::FileHeader;
use sosi_common::names::split_name;
use sosi_common::{GroupName, Result, SosiError, SosiName, SLUTT_OY, START_OY};

/// What a `set_line` call changed besides the text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineChange {
    /// New object type from an `..OBJTYPE` line.
    pub objtype: Option<String>,
    /// The line is a reference line.
    pub reference: bool,
    /// The reference line contains an island.
    pub island: bool,
}

/// NUL-separated attribute lines with per-line offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeLineBuffer {
    text: Vec<u8>,
    offsets: Vec<usize>,
}

/// Trims a line and upper-cases its leading name token.
pub fn canonicalize(line: &str) -> String {
    let trimmed = line.trim();
    match split_name(trimmed) {
        (Some(name), _) => format!("{}{}", name.to_uppercase(), &trimmed[name.len()..]),
        (None, _) => trimmed.to_string(),
    }
}

/// Serial numbers referenced from `..` and `..REF` lines.
///
/// Island starts and ends appear as [`START_OY`] and [`SLUTT_OY`].
pub fn parse_references<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<i64> {
    let mut refs = Vec::new();
    for line in lines {
        let (name, rest) = split_name(line);
        if !matches!(name.and_then(SosiName::lookup), Some(SosiName::Ref1 | SosiName::Ref2)) {
            continue;
        }
        for token in rest.split_whitespace() {
            let mut t = token;
            while let Some(r) = t.strip_prefix('(') {
                refs.push(START_OY);
                t = r;
            }
            let mut closes = 0;
            while let Some(r) = t.strip_suffix(')') {
                closes += 1;
                t = r;
            }
            let (reversed, t) = match t.strip_prefix('-') {
                Some(r) => (true, r),
                None => (false, t),
            };
            match t.strip_prefix(':').map(str::parse::<i64>) {
                Some(Ok(v)) if reversed => refs.push(-v),
                Some(Ok(v)) => refs.push(v),
                _ if t.is_empty() => {}
                _ => tracing::warn!(token, "Unreadable reference"),
            }
            refs.extend(std::iter::repeat(SLUTT_OY).take(closes));
        }
    }
    refs
}

/// References of the outer boundary, islands left out.
pub fn outer_references(refs: &[i64]) -> impl Iterator<Item = i64> + '_ {
    let mut depth = 0usize;
    refs.iter().filter_map(move |&r| match r {
        START_OY => {
            depth += 1;
            None
        }
        SLUTT_OY => {
            depth = depth.saturating_sub(1);
            None
        }
        r if depth == 0 => Some(r),
        _ => None,
    })
}

impl AttributeLineBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a buffer from the stored attribute text.
    ///
    /// Invalid UTF-8 is replaced with U+FFFD.
    pub fn from_text(text: Vec<u8>) -> Self {
        let text = match String::from_utf8(text) {
            Ok(s) => s.into_bytes(),
            Err(e) => {
                tracing::warn!(error = %e.utf8_error(), "Attribute text is not UTF-8");
                String::from_utf8_lossy(e.as_bytes()).into_owned().into_bytes()
            }
        };
        let mut buffer = Self {
            text,
            offsets: Vec::new(),
        };
        buffer.rebuild_offsets();
        buffer
    }

    /// Builds a buffer from individual lines.
    pub fn from_lines<S: AsRef<str>>(lines: &[S]) -> Self {
        let mut text = Vec::new();
        for line in lines {
            text.extend_from_slice(line.as_ref().as_bytes());
            text.push(0);
        }
        Self::from_text(text)
    }

    /// Recomputes the line offsets by scanning for NUL terminators.
    pub fn rebuild_offsets(&mut self) {
        self.offsets.clear();
        let mut start = 0;
        for (i, b) in self.text.iter().enumerate() {
            if *b == 0 {
                self.offsets.push(start);
                start = i + 1;
            }
        }
        // Unterminated tail
        if start < self.text.len() {
            self.text.push(0);
            self.offsets.push(start);
        }
    }

    /// Number of lines.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Returns true if the buffer holds no lines.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Total text length including NUL terminators.
    pub fn text_len(&self) -> usize {
        self.text.len()
    }

    /// The raw NUL-separated text.
    pub fn as_bytes(&self) -> &[u8] {
        &self.text
    }

    fn span(&self, n: usize) -> Result<(usize, usize)> {
        if n == 0 || n > self.offsets.len() {
            return Err(SosiError::IllegalLine(n));
        }
        let start = self.offsets[n - 1];
        let end = match self.offsets.get(n) {
            Some(next) => next - 1,
            None => self.text.len() - 1,
        };
        Ok((start, end))
    }

    /// Returns line `n`.
    pub fn line(&self, n: usize) -> Result<&str> {
        let (start, end) = self.span(n)?;
        std::str::from_utf8(&self.text[start..end]).map_err(|e| SosiError::Internal(e.to_string()))
    }

    /// Iterates over all lines.
    pub fn lines(&self) -> impl Iterator<Item = &str> + '_ {
        (1..=self.len()).filter_map(move |n| self.line(n).ok())
    }

    /// Replaces the text of line `n` without validation.
    pub(crate) fn replace_line(&mut self, n: usize, text: &str) -> Result<()> {
        let (start, end) = self.span(n)?;
        let new = text.as_bytes();
        if end - start == new.len() {
            self.text[start..end].copy_from_slice(new);
        } else if n == self.offsets.len() {
            self.text.truncate(start);
            self.text.extend_from_slice(new);
            self.text.push(0);
        } else {
            self.text.splice(start..end, new.iter().copied());
            self.rebuild_offsets();
        }
        Ok(())
    }

    /// Validates and stores line `n`.
    ///
    /// `header` is given when the line belongs to the file header of a file that
    /// already has groups, so unit and origin changes can be refused.
    pub fn set_line(&mut self, n: usize, text: &str, header: Option<&FileHeader>) -> Result<LineChange> {
        self.span(n)?;
        let line = canonicalize(text);
        if line.chars().any(|c| c.is_control() && c != '\t') {
            return Err(SosiError::IllegalText(n));
        }
        let (name, rest) = split_name(&line);
        let known = name.and_then(SosiName::lookup);

        if n == 1 {
            if !matches!(known, Some(SosiName::Group(_))) {
                return Err(SosiError::InvalidName(line));
            }
        } else if let Some(SosiName::Group(g)) = known {
            return Err(SosiError::InvalidName(g.as_str().to_string()));
        }

        if let (Some(header), Some(k)) = (header, known) {
            header.check_line(k, rest)?;
        }

        let mut change = LineChange::default();
        match known {
            Some(SosiName::Objtype) => {
                change.objtype = rest.split_whitespace().next().map(str::to_string);
            }
            Some(SosiName::Ref1) | Some(SosiName::Ref2) => {
                change.reference = true;
                change.island = rest.contains('(');
            }
            _ => {}
        }

        self.replace_line(n, &line)?;
        Ok(change)
    }

    /// Appends an empty line and returns its number.
    pub fn append_line(&mut self) -> usize {
        self.offsets.push(self.text.len());
        self.text.push(0);
        self.offsets.len()
    }

    /// Inserts `count` empty lines before line `at`.
    ///
    /// `at == len() + 1` appends.
    pub fn insert_lines(&mut self, at: usize, count: usize) -> Result<()> {
        if at == 0 || at > self.len() + 1 {
            return Err(SosiError::IllegalLine(at));
        }
        if at == self.len() + 1 {
            for _ in 0..count {
                self.append_line();
            }
            return Ok(());
        }
        let pos = self.offsets[at - 1];
        self.text.splice(pos..pos, std::iter::repeat(0u8).take(count));
        self.rebuild_offsets();
        Ok(())
    }

    /// Deletes up to `count` lines starting at `from`. Line 1 is never deleted.
    ///
    /// Returns the number of lines removed.
    pub fn delete_lines(&mut self, from: usize, count: usize) -> Result<usize> {
        if from == 0 || from > self.len() {
            return Err(SosiError::IllegalLine(from));
        }
        let (start, count) = if from < 2 {
            (2, count.saturating_sub(2 - from))
        } else {
            (from, count)
        };
        if count == 0 || start > self.len() {
            return Ok(0);
        }
        let end = (start + count - 1).min(self.len());
        let removed = end - start + 1;

        let byte_start = self.offsets[start - 1];
        if end == self.len() {
            self.text.truncate(byte_start);
            self.offsets.truncate(start - 1);
        } else {
            let byte_end = self.offsets[end];
            self.text.drain(byte_start..byte_end);
            self.rebuild_offsets();
        }
        Ok(removed)
    }

    /// Finds the first line at or after `start` whose leading name is `name`.
    pub fn find_name(&self, name: &str, start: usize) -> Option<usize> {
        (start.max(1)..=self.len()).find(|&n| {
            self.line(n)
                .ok()
                .and_then(|l| split_name(l).0)
                .is_some_and(|token| token.eq_ignore_ascii_case(name))
        })
    }

    /// Returns the value part of the first line named `name`.
    pub fn value_of(&self, name: &str) -> Option<&str> {
        let n = self.find_name(name, 1)?;
        self.line(n).ok().map(|l| split_name(l).1)
    }

    /// Group name from line 1.
    pub fn group_name(&self) -> Option<GroupName> {
        let first = self.line(1).ok()?;
        split_name(first).0.and_then(GroupName::from_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AttributeLineBuffer {
        AttributeLineBuffer::from_lines(&[".KURVE 12:", "..OBJTYPE Veg", "..VNR 1", "..KVALITET 82"])
    }

    fn all(b: &AttributeLineBuffer) -> Vec<String> {
        b.lines().map(str::to_string).collect()
    }

    #[test]
    fn test_line_access() {
        let b = sample();
        assert_eq!(b.len(), 4);
        assert_eq!(b.line(1).unwrap(), ".KURVE 12:");
        assert_eq!(b.line(4).unwrap(), "..KVALITET 82");
        assert!(matches!(b.line(0), Err(SosiError::IllegalLine(0))));
        assert!(matches!(b.line(5), Err(SosiError::IllegalLine(5))));
        assert_eq!(b.text_len(), ".KURVE 12:..OBJTYPE Veg..VNR 1..KVALITET 82".len() + 4);
    }

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize("  ..objtype Veg  "), "..OBJTYPE Veg");
        assert_eq!(canonicalize("..nøh"), "..NØH");
        assert_eq!(canonicalize(" 100 200 "), "100 200");
    }

    #[test]
    fn test_reflow_same_length() {
        let mut b = sample();
        b.set_line(3, "..VNR 2", None).unwrap();
        assert_eq!(all(&b)[2], "..VNR 2");
        assert_eq!(b.len(), 4);
    }

    #[test]
    fn test_reflow_last_line() {
        let mut b = sample();
        let before = b.text_len();
        b.set_line(4, "..KVALITET 82 5", None).unwrap();
        assert_eq!(b.line(4).unwrap(), "..KVALITET 82 5");
        assert_eq!(b.text_len(), before + 2);
    }

    #[test]
    fn test_reflow_middle_grow_and_shrink() {
        let mut b = sample();
        let len = b.text_len();
        let offsets = b.offsets.clone();

        // "Veg" -> "Vegsenterlinje" grows line 2 by 11 bytes
        b.set_line(2, "..OBJTYPE Vegsenterlinje", None).unwrap();
        assert_eq!(
            all(&b),
            vec![".KURVE 12:", "..OBJTYPE Vegsenterlinje", "..VNR 1", "..KVALITET 82"]
        );
        assert_eq!(b.text_len(), len + 11);
        assert_eq!(&b.offsets[..2], &offsets[..2]);
        assert_eq!(b.offsets[2], offsets[2] + 11);
        assert_eq!(b.offsets[3], offsets[3] + 11);

        // Back down to "V", 2 bytes shorter than the start
        b.set_line(2, "..OBJTYPE V", None).unwrap();
        assert_eq!(all(&b), vec![".KURVE 12:", "..OBJTYPE V", "..VNR 1", "..KVALITET 82"]);
        assert_eq!(b.text_len(), len - 2);
        assert_eq!(b.offsets[2], offsets[2] - 2);
        assert_eq!(b.offsets[3], offsets[3] - 2);
        // Offsets still line up with the terminators
        let rebuilt = AttributeLineBuffer::from_text(b.as_bytes().to_vec());
        assert_eq!(rebuilt, b);
    }

    #[test]
    fn test_set_line_validation() {
        let mut b = sample();
        assert!(matches!(
            b.set_line(1, "..OBJTYPE Veg", None),
            Err(SosiError::InvalidName(_))
        ));
        assert!(matches!(b.set_line(2, ".PUNKT 3:", None), Err(SosiError::InvalidName(_))));
        assert_eq!(b.line(2).unwrap(), "..OBJTYPE Veg");
        assert!(b.set_line(1, ".linje 12:", None).is_ok());
        assert_eq!(b.line(1).unwrap(), ".LINJE 12:");
        assert_eq!(b.group_name(), Some(GroupName::Linje));
    }

    #[test]
    fn test_set_line_rejects_control_characters() {
        let mut b = sample();
        assert!(matches!(
            b.set_line(2, "..OBJTYPE Veg\0..VNR 2", None),
            Err(SosiError::IllegalText(2))
        ));
        assert!(matches!(
            b.set_line(3, "..VNR 1\n.PUNKT 99:", None),
            Err(SosiError::IllegalText(3))
        ));
        assert_eq!(b.len(), 4);
        assert_eq!(b.line(2).unwrap(), "..OBJTYPE Veg");
        assert_eq!(b.line(3).unwrap(), "..VNR 1");
        assert!(b.set_line(3, "..VNR\t1", None).is_ok());
    }

    #[test]
    fn test_invalid_utf8_read_lossily() {
        let b = AttributeLineBuffer::from_text(b".KURVE 1:\0..NAVN Tr\xf8nd\0".to_vec());
        assert_eq!(b.len(), 2);
        assert_eq!(b.line(2).unwrap(), "..NAVN Tr\u{FFFD}nd");
    }

    #[test]
    fn test_set_line_change() {
        let mut b = sample();
        let c = b.set_line(2, "..objtype Bygning", None).unwrap();
        assert_eq!(c.objtype.as_deref(), Some("Bygning"));
        let c = b.set_line(3, "..REF :1 (:2 :3)", None).unwrap();
        assert!(c.reference && c.island);
        let c = b.set_line(4, ".. :1 -:4", None).unwrap();
        assert!(c.reference && !c.island);
    }

    #[test]
    fn test_header_conflict() {
        let header = FileHeader::from_lines([".HODE", "..TRANSPAR", "...ENHET 0.01"]);
        let mut b = AttributeLineBuffer::from_lines(&[".HODE", "..TRANSPAR", "...ENHET 0.01"]);
        assert!(matches!(
            b.set_line(3, "...ENHET 0.1", Some(&header)),
            Err(SosiError::HeaderConflict(_))
        ));
        assert_eq!(b.line(3).unwrap(), "...ENHET 0.01");
        assert!(b.set_line(3, "...enhet 0.01", Some(&header)).is_ok());
        assert!(b.set_line(3, "...ENHET 0.1", None).is_ok());
    }

    #[test]
    fn test_append_and_insert() {
        let mut b = sample();
        assert_eq!(b.append_line(), 5);
        assert_eq!(b.line(5).unwrap(), "");

        b.insert_lines(2, 2).unwrap();
        assert_eq!(b.len(), 7);
        assert_eq!(b.line(2).unwrap(), "");
        assert_eq!(b.line(3).unwrap(), "");
        assert_eq!(b.line(4).unwrap(), "..OBJTYPE Veg");

        b.insert_lines(8, 1).unwrap();
        assert_eq!(b.len(), 8);
        assert!(matches!(b.insert_lines(10, 1), Err(SosiError::IllegalLine(10))));
        assert!(matches!(b.insert_lines(0, 1), Err(SosiError::IllegalLine(0))));
    }

    #[test]
    fn test_delete_lines() {
        let mut b = sample();
        // Line 1 is protected; the count shrinks accordingly
        assert_eq!(b.delete_lines(1, 2).unwrap(), 1);
        assert_eq!(all(&b), vec![".KURVE 12:", "..VNR 1", "..KVALITET 82"]);

        let mut b = sample();
        assert_eq!(b.delete_lines(3, 100).unwrap(), 2);
        assert_eq!(all(&b), vec![".KURVE 12:", "..OBJTYPE Veg"]);
        assert_eq!(b.text_len(), ".KURVE 12:..OBJTYPE Veg".len() + 2);

        let mut b = sample();
        assert_eq!(b.delete_lines(2, 1).unwrap(), 1);
        assert_eq!(all(&b), vec![".KURVE 12:", "..VNR 1", "..KVALITET 82"]);
        assert!(b.delete_lines(9, 1).is_err());
    }

    #[test]
    fn test_find_name() {
        let b = AttributeLineBuffer::from_lines(&[
            ".FLATE 3:",
            "..OBJTYPE Bygning",
            "..REF :1 :2",
            "..NGIS-FLAGG V",
            "..REF :5",
        ]);
        assert_eq!(b.find_name("..REF", 1), Some(3));
        assert_eq!(b.find_name("..REF", 4), Some(5));
        assert_eq!(b.find_name("..ref", 1), Some(3));
        assert_eq!(b.find_name("..HØYDE", 1), None);
        assert_eq!(b.value_of("..NGIS-FLAGG"), Some("V"));
    }

    #[test]
    fn test_parse_references() {
        let lines = [".FLATE 5:", "..REF :1 -:2 (:3 :4)", ".. :7", "..OBJTYPE Hus"];
        let refs = parse_references(lines);
        assert_eq!(refs, vec![1, -2, START_OY, 3, 4, SLUTT_OY, 7]);
        assert_eq!(outer_references(&refs).collect::<Vec<_>>(), vec![1, -2, 7]);
    }
}
