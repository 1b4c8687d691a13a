//! XML property list reader and writer.
//!
//! The parser accepts the usual real-world junk around device-produced
//! documents: byte-order marks, comments, CDATA, processing instructions and
//! any line-ending flavor. Three hostile-but-common inputs are repaired
//! before parsing:
//!
//! - leading garbage before `<?xml` is trimmed to the declaration;
//! - duplicate `<?xml ... ?>` declarations keep the first, the rest are
//!   deleted;
//! - U+FFFD replacement characters are dropped when they sit between two
//!   tags, before the first tag, or after the last one.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{DateTime, NaiveDateTime, Utc};

use super::{Dictionary, PlistError, PlistValue};

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";
const DOCTYPE: &str = "<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n";

/// Serializes a value as a complete XML plist document.
pub fn to_xml(value: &PlistValue) -> String {
    let mut out = String::with_capacity(256);
    out.push_str(XML_DECLARATION);
    out.push_str(DOCTYPE);
    out.push_str("<plist version=\"1.0\">\n");
    write_value(value, 0, &mut out);
    out.push_str("</plist>\n");
    out
}

fn indent(depth: usize, out: &mut String) {
    for _ in 0..depth {
        out.push('\t');
    }
}

fn write_value(value: &PlistValue, depth: usize, out: &mut String) {
    indent(depth, out);
    match value {
        PlistValue::Null => out.push_str("<null/>\n"),
        PlistValue::Boolean(true) => out.push_str("<true/>\n"),
        PlistValue::Boolean(false) => out.push_str("<false/>\n"),
        PlistValue::Integer(i) => {
            out.push_str("<integer>");
            out.push_str(&i.to_string());
            out.push_str("</integer>\n");
        }
        PlistValue::Real(r) => {
            out.push_str("<real>");
            out.push_str(&r.to_string());
            out.push_str("</real>\n");
        }
        PlistValue::Date(d) => {
            out.push_str("<date>");
            out.push_str(&d.format("%Y-%m-%dT%H:%M:%SZ").to_string());
            out.push_str("</date>\n");
        }
        PlistValue::Data(d) => {
            out.push_str("<data>");
            out.push_str(&B64.encode(d));
            out.push_str("</data>\n");
        }
        PlistValue::String(s) => {
            out.push_str("<string>");
            out.push_str(&escape(s));
            out.push_str("</string>\n");
        }
        PlistValue::Array(items) => {
            if items.is_empty() {
                out.push_str("<array/>\n");
            } else {
                out.push_str("<array>\n");
                for item in items {
                    write_value(item, depth + 1, out);
                }
                indent(depth, out);
                out.push_str("</array>\n");
            }
        }
        PlistValue::Dictionary(dict) => {
            if dict.is_empty() {
                out.push_str("<dict/>\n");
            } else {
                out.push_str("<dict>\n");
                for (key, val) in dict {
                    indent(depth + 1, out);
                    out.push_str("<key>");
                    out.push_str(&escape(key));
                    out.push_str("</key>\n");
                    write_value(val, depth + 1, out);
                }
                indent(depth, out);
                out.push_str("</dict>\n");
            }
        }
        PlistValue::Uid(u) => {
            // CF$UID convention, the same shape Apple's own serializer uses
            out.push_str("<dict>\n");
            indent(depth + 1, out);
            out.push_str("<key>CF$UID</key>\n");
            indent(depth + 1, out);
            out.push_str("<integer>");
            out.push_str(&u.to_string());
            out.push_str("</integer>\n");
            indent(depth, out);
            out.push_str("</dict>\n");
        }
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Parses an XML plist document into a value.
pub fn from_xml(input: &str) -> Result<PlistValue, PlistError> {
    let cleaned = cleanup(input);
    if cleaned.trim().is_empty() {
        return Err(PlistError::EmptyDocument);
    }

    let mut parser = Parser {
        input: cleaned.as_bytes(),
        pos: 0,
    };
    parser.skip_misc()?;
    if parser.at_end() {
        return Err(PlistError::EmptyDocument);
    }
    if parser.peek() != Some(b'<') {
        return Err(PlistError::NoRootElement);
    }

    let (root, self_closing) = parser.open_tag()?;
    if root != "plist" {
        return Err(PlistError::RootNotPlist);
    }
    if self_closing {
        return Err(PlistError::EmptyDocument);
    }

    parser.skip_misc()?;
    if parser.try_close_tag("plist") {
        return Err(PlistError::EmptyDocument);
    }
    let value = parser.parse_value()?;
    parser.skip_misc()?;
    if !parser.try_close_tag("plist") {
        return Err(PlistError::UnclosedTag("plist".into()));
    }
    Ok(value)
}

/// Repairs the three hostile-but-common input shapes before parsing.
///
/// The rules only drop material outside the document or at known-safe
/// boundaries, never inside text.
fn cleanup(input: &str) -> String {
    let mut text = input.strip_prefix('\u{feff}').unwrap_or(input).to_string();

    // Leading garbage: trim to the first declaration
    if let Some(pos) = text.find("<?xml") {
        if pos > 0 {
            text.replace_range(..pos, "");
        }
    }

    // Replacement characters
    loop {
        let Some(pos) = text.find('\u{fffd}') else {
            break;
        };
        let before_has_tag = text[..pos].contains('<');
        let after_has_tag = text[pos..].contains('<');
        if !before_has_tag {
            match text.find('<') {
                Some(lt) => text.replace_range(..lt, ""),
                None => text.clear(),
            }
        } else if !after_has_tag {
            match text.rfind('>') {
                Some(gt) => text.truncate(gt + 1),
                None => text.clear(),
            }
        } else {
            text.remove(pos);
        }
    }

    // Duplicate XML declarations: keep the first
    let mut search_from = match text.find("<?xml") {
        Some(p) => p + "<?xml".len(),
        None => return text,
    };
    while let Some(rel) = text[search_from..].find("<?xml") {
        let start = search_from + rel;
        match text[start..].find("?>") {
            Some(end) => text.replace_range(start..start + end + 2, ""),
            None => {
                text.truncate(start);
                break;
            }
        }
    }

    text
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn rest(&self) -> &'a [u8] {
        &self.input[self.pos.min(self.input.len())..]
    }

    fn starts_with(&self, pat: &str) -> bool {
        self.rest().starts_with(pat.as_bytes())
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    /// Skips whitespace, comments, processing instructions and DOCTYPE.
    fn skip_misc(&mut self) -> Result<(), PlistError> {
        loop {
            self.skip_whitespace();
            if self.starts_with("<!--") {
                self.skip_until("-->")?;
            } else if self.starts_with("<?") {
                self.skip_until("?>")?;
            } else if self.starts_with("<!") {
                self.skip_doctype()?;
            } else {
                return Ok(());
            }
        }
    }

    fn skip_until(&mut self, terminator: &str) -> Result<(), PlistError> {
        let term = terminator.as_bytes();
        let mut i = self.pos;
        while i + term.len() <= self.input.len() {
            if &self.input[i..i + term.len()] == term {
                self.pos = i + term.len();
                return Ok(());
            }
            i += 1;
        }
        Err(PlistError::UnexpectedEof)
    }

    fn skip_doctype(&mut self) -> Result<(), PlistError> {
        // a DOCTYPE may carry an internal subset in brackets
        let mut depth = 0usize;
        while let Some(c) = self.peek() {
            self.pos += 1;
            match c {
                b'[' => depth += 1,
                b']' => depth = depth.saturating_sub(1),
                b'>' if depth == 0 => return Ok(()),
                _ => {}
            }
        }
        Err(PlistError::UnexpectedEof)
    }

    /// Consumes `<name attrs...>`, returning the name and whether the tag
    /// was self-closing.
    fn open_tag(&mut self) -> Result<(String, bool), PlistError> {
        if self.peek() != Some(b'<') {
            return Err(PlistError::NoRootElement);
        }
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'-' || c == b':' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let name = String::from_utf8_lossy(&self.input[start..self.pos]).to_string();
        if name.is_empty() {
            return Err(PlistError::UnexpectedTag(String::new()));
        }

        // skip attributes, tracking quotes
        let mut in_quote: Option<u8> = None;
        let mut self_closing = false;
        loop {
            match self.peek() {
                None => return Err(PlistError::UnclosedTag(name)),
                Some(q @ (b'"' | b'\'')) => {
                    match in_quote {
                        Some(open) if open == q => in_quote = None,
                        None => in_quote = Some(q),
                        _ => {}
                    }
                    self.pos += 1;
                }
                Some(b'>') if in_quote.is_none() => {
                    self_closing = self.pos > 0 && self.input[self.pos - 1] == b'/';
                    self.pos += 1;
                    break;
                }
                Some(_) => self.pos += 1,
            }
        }
        Ok((name, self_closing))
    }

    /// Consumes `</name>` if it is next, returning whether it was.
    fn try_close_tag(&mut self, name: &str) -> bool {
        let saved = self.pos;
        if !self.starts_with("</") {
            return false;
        }
        self.pos += 2;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'-' || c == b':' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let found = &self.input[start..self.pos];
        self.skip_whitespace();
        if found == name.as_bytes() && self.peek() == Some(b'>') {
            self.pos += 1;
            true
        } else {
            self.pos = saved;
            false
        }
    }

    fn parse_value(&mut self) -> Result<PlistValue, PlistError> {
        self.skip_misc()?;
        let (name, self_closing) = self.open_tag()?;
        match name.as_str() {
            "dict" => {
                if self_closing {
                    return Ok(PlistValue::Dictionary(Dictionary::new()));
                }
                self.parse_dict()
            }
            "array" => {
                if self_closing {
                    return Ok(PlistValue::Array(Vec::new()));
                }
                let mut items = Vec::new();
                loop {
                    self.skip_misc()?;
                    if self.try_close_tag("array") {
                        return Ok(PlistValue::Array(items));
                    }
                    if self.at_end() {
                        return Err(PlistError::UnclosedTag("array".into()));
                    }
                    items.push(self.parse_value()?);
                }
            }
            "string" => {
                if self_closing {
                    return Ok(PlistValue::String(String::new()));
                }
                Ok(PlistValue::String(self.text_content("string")?))
            }
            "integer" => {
                let text = if self_closing {
                    String::new()
                } else {
                    self.text_content("integer")?
                };
                let trimmed = text.trim();
                trimmed
                    .parse::<i128>()
                    .map(PlistValue::Integer)
                    .map_err(|_| PlistError::InvalidContent("integer", trimmed.to_string()))
            }
            "real" => {
                let text = if self_closing {
                    String::new()
                } else {
                    self.text_content("real")?
                };
                let trimmed = text.trim();
                trimmed
                    .parse::<f64>()
                    .map(PlistValue::Real)
                    .map_err(|_| PlistError::InvalidContent("real", trimmed.to_string()))
            }
            "true" => {
                if !self_closing && !self.try_close_tag("true") {
                    return Err(PlistError::UnclosedTag("true".into()));
                }
                Ok(PlistValue::Boolean(true))
            }
            "false" => {
                if !self_closing && !self.try_close_tag("false") {
                    return Err(PlistError::UnclosedTag("false".into()));
                }
                Ok(PlistValue::Boolean(false))
            }
            "null" => {
                if !self_closing && !self.try_close_tag("null") {
                    return Err(PlistError::UnclosedTag("null".into()));
                }
                Ok(PlistValue::Null)
            }
            "date" => {
                let text = if self_closing {
                    String::new()
                } else {
                    self.text_content("date")?
                };
                parse_date(text.trim()).map(PlistValue::Date)
            }
            "data" => {
                let text = if self_closing {
                    String::new()
                } else {
                    self.text_content("data")?
                };
                let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
                B64.decode(compact.as_bytes())
                    .map(PlistValue::Data)
                    .map_err(|e| PlistError::InvalidContent("data", e.to_string()))
            }
            other => Err(PlistError::UnexpectedTag(other.to_string())),
        }
    }

    fn parse_dict(&mut self) -> Result<PlistValue, PlistError> {
        let mut dict = Dictionary::new();
        loop {
            self.skip_misc()?;
            if self.try_close_tag("dict") {
                // single-key CF$UID dictionaries are the XML spelling of a UID
                if dict.len() == 1 {
                    if let Some(PlistValue::Integer(u)) = dict.get("CF$UID") {
                        if let Ok(u) = u64::try_from(*u) {
                            return Ok(PlistValue::Uid(u));
                        }
                    }
                }
                return Ok(PlistValue::Dictionary(dict));
            }
            if self.at_end() {
                return Err(PlistError::UnclosedTag("dict".into()));
            }
            let (name, self_closing) = self.open_tag()?;
            if name != "key" {
                return Err(PlistError::UnexpectedTag(name));
            }
            let key = if self_closing {
                String::new()
            } else {
                self.text_content("key")?
            };
            let value = self.parse_value()?;
            dict.insert(key, value);
        }
    }

    /// Reads text up to `</tag>`, decoding entities and CDATA sections and
    /// skipping comments.
    fn text_content(&mut self, tag: &str) -> Result<String, PlistError> {
        let mut out = String::new();
        let mut run_start = self.pos;
        loop {
            match self.peek() {
                None => return Err(PlistError::UnclosedTag(tag.to_string())),
                Some(b'<') => {
                    out.push_str(&unescape(&self.input[run_start..self.pos])?);
                    if self.starts_with("<![CDATA[") {
                        self.pos += "<![CDATA[".len();
                        let start = self.pos;
                        self.skip_until("]]>")?;
                        out.push_str(&String::from_utf8_lossy(
                            &self.input[start..self.pos - 3],
                        ));
                    } else if self.starts_with("<!--") {
                        self.skip_until("-->")?;
                    } else if self.try_close_tag(tag) {
                        return Ok(out);
                    } else {
                        return Err(PlistError::UnclosedTag(tag.to_string()));
                    }
                    run_start = self.pos;
                }
                Some(_) => self.pos += 1,
            }
        }
    }
}

fn unescape(raw: &[u8]) -> Result<String, PlistError> {
    let text = String::from_utf8_lossy(raw);
    if !text.contains('&') {
        return Ok(text.to_string());
    }
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices();
    while let Some((i, c)) = chars.next() {
        if c != '&' {
            out.push(c);
            continue;
        }
        let rest = &text[i..];
        let Some(end) = rest.find(';') else {
            return Err(PlistError::InvalidContent("entity", rest.to_string()));
        };
        let entity = &rest[1..end];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                match code.and_then(char::from_u32) {
                    Some(c) => out.push(c),
                    None => {
                        return Err(PlistError::InvalidContent("entity", entity.to_string()))
                    }
                }
            }
        }
        // consume the entity body
        for _ in 0..end {
            chars.next();
        }
    }
    Ok(out)
}

fn parse_date(text: &str) -> Result<DateTime<Utc>, PlistError> {
    if let Ok(d) = DateTime::parse_from_rfc3339(text) {
        return Ok(d.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%SZ")
        .map(|naive| naive.and_utc())
        .map_err(|_| PlistError::InvalidContent("date", text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> PlistValue {
        let mut inner = Dictionary::new();
        inner.insert("name".into(), "Molly's <Device>".into());
        inner.insert("count".into(), 42i64.into());
        inner.insert("ratio".into(), 0.5f64.into());
        inner.insert("enabled".into(), true.into());
        inner.insert("blob".into(), vec![0x00u8, 0xFF, 0x42].into());
        inner.insert(
            "when".into(),
            Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap().into(),
        );
        let mut dict = Dictionary::new();
        dict.insert("inner".into(), PlistValue::Dictionary(inner));
        dict.insert(
            "list".into(),
            PlistValue::Array(vec!["a".into(), 1i64.into(), PlistValue::Null]),
        );
        PlistValue::Dictionary(dict)
    }

    #[test]
    fn round_trip() {
        let value = sample();
        let text = to_xml(&value);
        assert_eq!(from_xml(&text).unwrap(), value);
    }

    #[test]
    fn parses_simple_dict() {
        let text = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<plist version=\"1.0\"><dict><key>x</key><integer>42</integer></dict></plist>";
        let mut expected = Dictionary::new();
        expected.insert("x".into(), 42i64.into());
        assert_eq!(
            from_xml(text).unwrap(),
            PlistValue::Dictionary(expected)
        );
    }

    #[test]
    fn leading_replacement_char_is_dropped() {
        let text = "\u{fffd}<?xml version=\"1.0\"?><plist version=\"1.0\"><dict><key>x</key><integer>42</integer></dict></plist>";
        let mut expected = Dictionary::new();
        expected.insert("x".into(), 42i64.into());
        assert_eq!(
            from_xml(text).unwrap(),
            PlistValue::Dictionary(expected)
        );
    }

    #[test]
    fn replacement_char_between_tags_is_dropped() {
        let text = "<?xml version=\"1.0\"?><plist version=\"1.0\"><dict>\u{fffd}<key>x</key><integer>1</integer></dict></plist>";
        assert!(from_xml(text).is_ok());
    }

    #[test]
    fn trailing_replacement_char_is_dropped() {
        let text =
            "<?xml version=\"1.0\"?><plist version=\"1.0\"><string>ok</string></plist>\u{fffd}junk";
        assert_eq!(from_xml(text).unwrap(), PlistValue::String("ok".into()));
    }

    #[test]
    fn leading_garbage_is_trimmed() {
        let text = "GARBAGE BYTES HERE<?xml version=\"1.0\"?><plist version=\"1.0\"><string>ok</string></plist>";
        assert_eq!(from_xml(text).unwrap(), PlistValue::String("ok".into()));
    }

    #[test]
    fn duplicate_declarations_keep_the_first() {
        let text = "<?xml version=\"1.0\"?><?xml version=\"1.0\"?><plist version=\"1.0\"><string>ok</string></plist>";
        assert_eq!(from_xml(text).unwrap(), PlistValue::String("ok".into()));
    }

    #[test]
    fn all_cleanups_compose() {
        let text = "junk\u{fffd}<?xml version=\"1.0\"?><?xml version=\"1.0\"?><plist version=\"1.0\"><dict>\u{fffd}<key>x</key><integer>7</integer></dict></plist>\u{fffd}tail";
        let mut expected = Dictionary::new();
        expected.insert("x".into(), 7i64.into());
        assert_eq!(
            from_xml(text).unwrap(),
            PlistValue::Dictionary(expected)
        );
    }

    #[test]
    fn accepts_comments_cdata_and_bom() {
        let text = "\u{feff}<?xml version=\"1.0\"?>\r\n<!-- generated -->\r\n<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\r\n<plist version=\"1.0\"><string><![CDATA[a < b]]></string></plist>";
        assert_eq!(from_xml(text).unwrap(), PlistValue::String("a < b".into()));
    }

    #[test]
    fn rejects_missing_root() {
        assert!(matches!(
            from_xml("no tags at all"),
            Err(PlistError::EmptyDocument | PlistError::NoRootElement)
        ));
    }

    #[test]
    fn rejects_non_plist_root() {
        assert!(matches!(
            from_xml("<html><body/></html>"),
            Err(PlistError::RootNotPlist)
        ));
    }

    #[test]
    fn rejects_unclosed_tag() {
        let text = "<?xml version=\"1.0\"?><plist version=\"1.0\"><dict><key>x</key><integer>1</integer>";
        assert!(matches!(from_xml(text), Err(PlistError::UnclosedTag(_))));
    }

    #[test]
    fn rejects_empty_after_cleanup() {
        assert!(matches!(from_xml("\u{fffd}"), Err(PlistError::EmptyDocument)));
        assert!(matches!(from_xml("   "), Err(PlistError::EmptyDocument)));
    }

    #[test]
    fn escapes_special_characters() {
        let value = PlistValue::String("a&b<c>\"d'".into());
        let text = to_xml(&value);
        assert!(text.contains("a&amp;b&lt;c&gt;&quot;d&apos;"));
        assert_eq!(from_xml(&text).unwrap(), value);
    }

    #[test]
    fn uid_round_trips_via_cfuid() {
        let value = PlistValue::Uid(7);
        let text = to_xml(&value);
        assert!(text.contains("CF$UID"));
        assert_eq!(from_xml(&text).unwrap(), value);
    }
}
