//! In-memory model of an INI-style CouchDB config document.
//!
//! Every line keeps its original text, so sections that are never written
//! to render back byte-for-byte. Only lines that [`ConfigDocument::set`]
//! actually changes or adds are re-rendered, as `key = value`.

use crate::error::{AppError, AppResult};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Entry {
        key: String,
        value: String,
        raw: String,
    },
    /// Indented line following an entry (multi-line value)
    Continuation(String),
    /// Comment or blank line
    Other(String),
}

impl Line {
    fn raw(&self) -> &str {
        match self {
            Line::Entry { raw, .. } => raw,
            Line::Continuation(raw) | Line::Other(raw) => raw,
        }
    }
}

/// A named `[section]` and its lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    name: String,
    /// Lines rendered before the header (separator for appended sections)
    prologue: Vec<String>,
    header: String,
    lines: Vec<Line>,
}

impl Section {
    fn parsed(name: String, header: String) -> Self {
        Self {
            name,
            prologue: Vec::new(),
            header,
            lines: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| match line {
            Line::Entry { key: k, value, .. } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Key/value pairs in file order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines.iter().filter_map(|line| match line {
            Line::Entry { key, value, .. } => Some((key.as_str(), value.as_str())),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set(&mut self, key: &str, value: &str, eol: &str) -> bool {
        let existing = self.lines.iter_mut().find_map(|line| match line {
            Line::Entry { key: k, value, raw } if k == key => Some((value, raw)),
            _ => None,
        });

        if let Some((current, raw)) = existing {
            if current == value {
                return false;
            }
            *current = value.to_string();
            *raw = render_entry(key, value, eol);
            return true;
        }

        // Append after the last entry and its continuation lines, so trailing
        // comments and blank lines stay at the end of the section.
        let position = match self
            .lines
            .iter()
            .rposition(|line| matches!(line, Line::Entry { .. }))
        {
            Some(last) => {
                let mut pos = last + 1;
                while matches!(self.lines.get(pos), Some(Line::Continuation(_))) {
                    pos += 1;
                }
                pos
            }
            None => 0,
        };
        self.lines.insert(
            position,
            Line::Entry {
                key: key.to_string(),
                value: value.to_string(),
                raw: render_entry(key, value, eol),
            },
        );
        true
    }

    fn rendered_lines(&self) -> impl Iterator<Item = &str> {
        self.prologue
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.header.as_str()))
            .chain(self.lines.iter().map(Line::raw))
    }
}

fn render_entry(key: &str, value: &str, eol: &str) -> String {
    format!("{} = {}{}", key, value, eol)
}

fn check_name(kind: &str, name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err(format!("empty {}", kind));
    }
    if name.trim() != name {
        return Err(format!(
            "{} '{}' has surrounding whitespace",
            kind,
            name.escape_debug()
        ));
    }
    if name.contains(|c: char| matches!(c, '=' | ':' | '[' | ']' | '\r' | '\n')) {
        return Err(format!("{} '{}' contains a reserved character", kind, name.escape_debug()));
    }
    Ok(())
}

/// A config document identified by name and backing file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDocument {
    name: String,
    path: PathBuf,
    preamble: Vec<String>,
    sections: Vec<Section>,
    trailing_newline: bool,
    crlf: bool,
}

impl ConfigDocument {
    /// A document with no content, for a file that does not exist yet.
    pub fn empty(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            preamble: Vec::new(),
            sections: Vec::new(),
            trailing_newline: true,
            crlf: false,
        }
    }

    /// Parse document text.
    ///
    /// Duplicate sections, duplicate keys within a section, and key/value
    /// lines before the first section header are rejected.
    pub fn parse(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        text: &str,
    ) -> AppResult<Self> {
        let mut document = Self::empty(name, path);
        if text.is_empty() {
            return Ok(document);
        }

        document.trailing_newline = text.ends_with('\n');
        let body = text.strip_suffix('\n').unwrap_or(text);
        document.crlf = body.split('\n').next().is_some_and(|l| l.ends_with('\r'));

        let mut in_value = false;
        for (index, raw) in body.split('\n').enumerate() {
            let line_no = index + 1;
            let content = raw.strip_suffix('\r').unwrap_or(raw);
            let trimmed = content.trim();

            if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
                in_value = false;
                document.push_other(raw.to_string());
                continue;
            }

            if in_value && content.starts_with(char::is_whitespace) {
                if let Some(section) = document.sections.last_mut() {
                    section.lines.push(Line::Continuation(raw.to_string()));
                }
                continue;
            }
            in_value = false;

            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                let name = trimmed[1..trimmed.len() - 1].trim().to_string();
                if document.section(&name).is_some() {
                    return Err(document.parse_error(line_no, format!("duplicate section [{}]", name)));
                }
                document.sections.push(Section::parsed(name, raw.to_string()));
                continue;
            }

            let Some(split) = trimmed.find(|c: char| c == '=' || c == ':') else {
                return Err(document.parse_error(line_no, "expected `key = value`"));
            };
            let key = trimmed[..split].trim().to_string();
            let value = trimmed[split + 1..].trim().to_string();
            if key.is_empty() {
                return Err(document.parse_error(line_no, "empty key"));
            }

            let reason = match document.sections.last() {
                None => Some("entry outside of a section".to_string()),
                Some(section) if section.get(&key).is_some() => {
                    Some(format!("duplicate key '{}' in [{}]", key, section.name))
                }
                Some(_) => None,
            };
            if let Some(reason) = reason {
                return Err(document.parse_error(line_no, reason));
            }
            let Some(section) = document.sections.last_mut() else {
                continue;
            };
            section.lines.push(Line::Entry {
                key,
                value,
                raw: raw.to_string(),
            });
            in_value = true;
        }

        Ok(document)
    }

    fn push_other(&mut self, raw: String) {
        match self.sections.last_mut() {
            Some(section) => section.lines.push(Line::Other(raw)),
            None => self.preamble.push(raw),
        }
    }

    fn parse_error(&self, line: usize, reason: impl Into<String>) -> AppError {
        AppError::ConfigParse {
            path: self.path.clone(),
            line,
            reason: reason.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)?.get(key)
    }

    /// Set `key = value` in `section`, creating the section if needed.
    ///
    /// The value is trimmed the way [`ConfigDocument::parse`] trims it, so a
    /// rendered entry always reads back unchanged. Names that would not
    /// survive a render and re-parse, and values spanning several lines, are
    /// rejected with `InvalidEntry` and leave the document untouched.
    ///
    /// Returns whether the rendered document changed.
    pub fn set(&mut self, section: &str, key: &str, value: &str) -> AppResult<bool> {
        check_name("section", section).map_err(|reason| self.invalid_entry(reason))?;
        check_name("key", key).map_err(|reason| self.invalid_entry(reason))?;
        if key.starts_with(';') || key.starts_with('#') {
            return Err(self.invalid_entry(format!("key '{}' reads as a comment", key)));
        }
        let value = value.trim();
        if value.contains(|c: char| c == '\r' || c == '\n') {
            return Err(self.invalid_entry(format!("value for [{}] {} spans lines", section, key)));
        }

        let eol = if self.crlf { "\r" } else { "" };

        if let Some(existing) = self.sections.iter_mut().find(|s| s.name == section) {
            return Ok(existing.set(key, value, eol));
        }

        let needs_separator = self
            .rendered_lines()
            .last()
            .is_some_and(|last| !last.trim().is_empty());

        let mut created = Section::parsed(section.to_string(), format!("[{}]{}", section, eol));
        if needs_separator {
            created.prologue.push(eol.to_string());
        }
        created.set(key, value, eol);
        self.sections.push(created);
        Ok(true)
    }

    fn invalid_entry(&self, reason: String) -> AppError {
        AppError::InvalidEntry {
            path: self.path.clone(),
            reason,
        }
    }

    fn rendered_lines(&self) -> impl Iterator<Item = &str> {
        self.preamble
            .iter()
            .map(String::as_str)
            .chain(self.sections.iter().flat_map(Section::rendered_lines))
    }

    /// Render the complete file contents.
    pub fn render(&self) -> String {
        let mut out = self.rendered_lines().collect::<Vec<_>>().join("\n");
        if self.trailing_newline && !out.is_empty() {
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL_INI: &str = "\
; CouchDB Configuration Settings

; Custom settings should be made in this file.

[couchdb]
;max_document_size = 4294967296 ; bytes
uuid = 8ac1c4c5

[httpd]
;port = 5984
;bind_address = 127.0.0.1
socket_options = [{recbuf, 262144}, {sndbuf, 262144}]

[log]
level = info
";

    fn parse(text: &str) -> ConfigDocument {
        ConfigDocument::parse("local", "/tmp/local.ini", text).unwrap()
    }

    #[test]
    fn test_untouched_document_renders_identically() {
        let doc = parse(LOCAL_INI);
        assert_eq!(doc.render(), LOCAL_INI);
        assert_eq!(doc.get("couchdb", "uuid"), Some("8ac1c4c5"));
        assert_eq!(
            doc.get("httpd", "socket_options"),
            Some("[{recbuf, 262144}, {sndbuf, 262144}]")
        );
        assert_eq!(doc.get("httpd", "port"), None);
    }

    #[test]
    fn test_set_existing_key_rewrites_only_that_line() {
        let mut doc = parse(LOCAL_INI);
        assert!(doc.set("log", "level", "debug").unwrap());

        let rendered = doc.render();
        assert!(rendered.ends_with("[log]\nlevel = debug\n"));
        assert!(rendered.starts_with(&LOCAL_INI[..LOCAL_INI.find("[log]").unwrap()]));
    }

    #[test]
    fn test_set_same_value_is_not_a_change() {
        let mut doc = parse("[log]\nlevel=info\n");
        assert!(!doc.set("log", "level", "info").unwrap());
        assert_eq!(doc.render(), "[log]\nlevel=info\n");
    }

    #[test]
    fn test_new_key_lands_after_last_entry() {
        let mut doc = parse(LOCAL_INI);
        assert!(doc.set("httpd", "port", "5984").unwrap());

        let rendered = doc.render();
        assert!(rendered.contains(
            "socket_options = [{recbuf, 262144}, {sndbuf, 262144}]\nport = 5984\n\n[log]"
        ));
        // comments inside the touched section survive
        assert!(rendered.contains(";bind_address = 127.0.0.1\n"));
    }

    #[test]
    fn test_new_section_appended_with_separator() {
        let mut doc = parse("[a]\nx = 1\n");
        assert!(doc.set("b", "y", "2").unwrap());
        assert_eq!(doc.render(), "[a]\nx = 1\n\n[b]\ny = 2\n");
        assert_eq!(doc.get("a", "x"), Some("1"));
        assert_eq!(doc.get("b", "y"), Some("2"));
    }

    #[test]
    fn test_empty_document() {
        let mut doc = ConfigDocument::empty("local", "/tmp/local.ini");
        assert_eq!(doc.render(), "");
        doc.set("admins", "admin", "secret").unwrap();
        assert_eq!(doc.render(), "[admins]\nadmin = secret\n");
    }

    #[test]
    fn test_comment_only_file() {
        let mut doc = parse(";Test");
        assert_eq!(doc.render(), ";Test");
        doc.set("httpd", "port", "5984").unwrap();
        assert_eq!(doc.render(), ";Test\n\n[httpd]\nport = 5984");
    }

    #[test]
    fn test_crlf_preserved() {
        let text = "[a]\r\nx = 1\r\n\r\n[b]\r\ny = 2\r\n";
        let mut doc = parse(text);
        assert_eq!(doc.render(), text);

        doc.set("a", "z", "3").unwrap();
        assert_eq!(doc.render(), "[a]\r\nx = 1\r\nz = 3\r\n\r\n[b]\r\ny = 2\r\n");
    }

    #[test]
    fn test_continuation_lines_stay_with_their_entry() {
        let text = "[vhosts]\nrules = a\n  b\n  c\n; end\n";
        let mut doc = parse(text);
        assert_eq!(doc.render(), text);
        assert_eq!(doc.get("vhosts", "rules"), Some("a"));

        doc.set("vhosts", "extra", "d").unwrap();
        assert_eq!(doc.render(), "[vhosts]\nrules = a\n  b\n  c\nextra = d\n; end\n");
    }

    #[test]
    fn test_colon_delimiter() {
        let doc = parse("[replicator]\ndb: _replicator\nurl = http://a:5984\n");
        assert_eq!(doc.get("replicator", "db"), Some("_replicator"));
        assert_eq!(doc.get("replicator", "url"), Some("http://a:5984"));
    }

    #[test]
    fn test_duplicate_section_rejected() {
        let err = ConfigDocument::parse("local", "/tmp/local.ini", "[a]\nx=1\n[a]\ny=2\n")
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigParse { line: 3, .. }));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let err =
            ConfigDocument::parse("local", "/tmp/local.ini", "[a]\nx=1\nx=2\n").unwrap_err();
        assert!(matches!(err, AppError::ConfigParse { line: 3, .. }));
    }

    #[test]
    fn test_entry_before_section_rejected() {
        let err = ConfigDocument::parse("local", "/tmp/local.ini", "x=1\n[a]\n").unwrap_err();
        assert!(matches!(err, AppError::ConfigParse { line: 1, .. }));
    }

    #[test]
    fn test_section_entries_in_file_order() {
        let doc = parse("[admins]\nadmin = a\nreplication = r\n");
        let section = doc.section("admins").unwrap();
        let entries: Vec<_> = section.entries().collect();
        assert_eq!(entries, vec![("admin", "a"), ("replication", "r")]);
        assert_eq!(section.len(), 2);
        assert!(!section.is_empty());
        assert_eq!(doc.sections().len(), 1);
    }

    #[test]
    fn test_value_trimmed_like_the_parser() {
        let mut doc = parse("[httpd]\nbind_address = 0.0.0.0\n");
        assert!(!doc.set("httpd", "bind_address", " 0.0.0.0\n").unwrap());

        assert!(doc.set("httpd", "port", "\t5984\r\n").unwrap());
        let rendered = doc.render();
        assert_eq!(rendered, "[httpd]\nbind_address = 0.0.0.0\nport = 5984\n");
        assert_eq!(parse(&rendered), doc);
    }

    #[test]
    fn test_unrenderable_entries_rejected() {
        let mut doc = parse("[httpd]\nport = 5984\n");
        let cases = [
            ("httpd", "bind_address", "a\nb"),
            ("httpd", "bind_address", "a\rb"),
            ("httpd", "port ", "1"),
            ("httpd", " port", "1"),
            ("httpd", "", "1"),
            ("httpd", "a:b", "1"),
            ("httpd", ";port", "1"),
            ("", "port", "1"),
            ("ht]tpd", "port", "1"),
            ("httpd\n", "port", "1"),
        ];
        for (section, key, value) in cases {
            let err = doc.set(section, key, value).unwrap_err();
            assert!(matches!(err, AppError::InvalidEntry { .. }), "{:?}", (section, key));
        }
        assert_eq!(doc.render(), "[httpd]\nport = 5984\n");
    }
}
