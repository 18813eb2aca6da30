//! Minimal path-indexed XML reader for key box documents.
//!
//! Parses a document into an [`Element`] tree in one pass over the input and
//! answers queries like `AndroidAttestation.Keybox[1].Key[0].PrivateKey`.
//! Document type declarations are refused outright: entity expansion has no
//! place in key material files.

use std::collections::HashMap;

use thiserror::Error;

/// Key under which [`Document::attributes_and_text`] reports element text.
pub const TEXT_KEY: &str = "text";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum XmlError {
    #[error("DTD is not allowed in key box documents")]
    DoctypeRejected,
    #[error("document contains no element")]
    NoRoot,
    #[error("unexpected end of document inside <{0}>")]
    UnexpectedEof(String),
    #[error("malformed markup at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: &'static str },
    #[error("closing tag </{found}> does not match <{expected}>")]
    MismatchedTag { expected: String, found: String },
    #[error("duplicate attribute `{attribute}` on <{element}>")]
    DuplicateAttribute { element: String, attribute: String },
    #[error("unresolved entity reference `&{0};`")]
    UnresolvedEntity(String),
    #[error("invalid path segment `{segment}` in `{path}`")]
    InvalidPath { path: String, segment: String },
    #[error("path root mismatch: {requested} vs {actual}")]
    RootMismatch { requested: String, actual: String },
    #[error("path not found: {0}")]
    NotFound(String),
}

/// A parsed element. Children are grouped by tag name, each group in
/// document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    attributes: HashMap<String, String>,
    text: Option<String>,
    children: HashMap<String, Vec<Element>>,
}

impl Element {
    fn new(name: String) -> Self {
        Element {
            name,
            attributes: HashMap::new(),
            text: None,
            children: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    /// Trimmed, concatenated character data of this element.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Children named `name`, in document order.
    pub fn children(&self, name: &str) -> &[Element] {
        self.children.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    fn push_text(&mut self, fragment: &str) {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return;
        }
        match &mut self.text {
            Some(text) => text.push_str(fragment),
            None => self.text = Some(fragment.to_owned()),
        }
    }

    fn add_child(&mut self, child: Element) {
        self.children
            .entry(child.name.clone())
            .or_default()
            .push(child);
    }
}

/// A parsed document: the first top-level element and everything under it.
#[derive(Debug, Clone)]
pub struct Document {
    root: Element,
}

impl Document {
    /// Parse `source`. Anything after the first top-level element closes is
    /// ignored.
    pub fn parse(source: &str) -> Result<Self, XmlError> {
        reject_doctype(source)?;
        Parser::new(source).run().map(|root| Document { root })
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    /// Strict lookup: every segment must resolve.
    pub fn get(&self, path: &str) -> Result<&Element, XmlError> {
        self.resolve(path)
    }

    /// Lenient lookup: `None` when any segment is missing or malformed.
    pub fn find(&self, path: &str) -> Option<&Element> {
        self.resolve(path).ok()
    }

    /// Number of `child_name` children under `path`; 0 if `path` is absent.
    pub fn child_count(&self, path: &str, child_name: &str) -> usize {
        self.find(path)
            .map(|element| element.children(child_name).len())
            .unwrap_or(0)
    }

    /// Attributes of the element at `path`, plus its text under [`TEXT_KEY`].
    pub fn attributes_and_text(&self, path: &str) -> Result<HashMap<String, String>, XmlError> {
        self.get(path).map(collect_attributes_and_text)
    }

    /// Lenient variant of [`Document::attributes_and_text`].
    pub fn find_attributes_and_text(&self, path: &str) -> Option<HashMap<String, String>> {
        self.find(path).map(collect_attributes_and_text)
    }

    fn resolve(&self, path: &str) -> Result<&Element, XmlError> {
        let mut segments = path.split('.');
        let first = segments.next().unwrap_or_default();
        let (root_name, root_index) = parse_segment(path, first)?;
        if root_name != self.root.name {
            return Err(XmlError::RootMismatch {
                requested: root_name.to_owned(),
                actual: self.root.name.clone(),
            });
        }
        if root_index != 0 {
            return Err(XmlError::NotFound(path.to_owned()));
        }

        let mut current = &self.root;
        for segment in segments {
            let (name, index) = parse_segment(path, segment)?;
            current = current
                .children(name)
                .get(index)
                .ok_or_else(|| XmlError::NotFound(path.to_owned()))?;
        }
        Ok(current)
    }
}

fn collect_attributes_and_text(element: &Element) -> HashMap<String, String> {
    let mut result = element.attributes.clone();
    if let Some(text) = &element.text {
        result.insert(TEXT_KEY.to_owned(), text.clone());
    }
    result
}

/// Split `Name[3]` into `("Name", 3)`; a bare name selects index 0.
fn parse_segment<'p>(path: &str, segment: &'p str) -> Result<(&'p str, usize), XmlError> {
    let invalid = || XmlError::InvalidPath {
        path: path.to_owned(),
        segment: segment.to_owned(),
    };
    let Some(open) = segment.find('[') else {
        if segment.is_empty() || segment.contains(']') {
            return Err(invalid());
        }
        return Ok((segment, 0));
    };
    let name = &segment[..open];
    let index = segment[open + 1..]
        .strip_suffix(']')
        .ok_or_else(invalid)?
        .parse::<usize>()
        .map_err(|_| invalid())?;
    if name.is_empty() {
        return Err(invalid());
    }
    Ok((name, index))
}

/// Refuse any `<!DOCTYPE` before a single element is built.
fn reject_doctype(source: &str) -> Result<(), XmlError> {
    const NEEDLE: &[u8] = b"<!DOCTYPE";
    let found = source
        .as_bytes()
        .windows(NEEDLE.len())
        .any(|window| window.eq_ignore_ascii_case(NEEDLE));
    if found {
        return Err(XmlError::DoctypeRejected);
    }
    Ok(())
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    stack: Vec<Element>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Parser {
            src,
            pos: 0,
            stack: Vec::new(),
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn malformed(&self, reason: &'static str) -> XmlError {
        XmlError::Malformed {
            offset: self.pos,
            reason,
        }
    }

    fn run(mut self) -> Result<Element, XmlError> {
        while self.pos < self.src.len() {
            let rest = self.rest();
            if rest.starts_with("<?") {
                self.skip_past("?>", "unterminated processing instruction")?;
            } else if rest.starts_with("<!--") {
                self.skip_past("-->", "unterminated comment")?;
            } else if rest.starts_with("<![CDATA[") {
                self.pos += "<![CDATA[".len();
                let end = self
                    .rest()
                    .find("]]>")
                    .ok_or_else(|| self.malformed("unterminated CDATA section"))?;
                let data = &self.rest()[..end];
                if let Some(current) = self.stack.last_mut() {
                    current.push_text(data);
                }
                self.pos += end + "]]>".len();
            } else if rest.starts_with("<!") {
                if rest
                    .get(2..9)
                    .is_some_and(|keyword| keyword.eq_ignore_ascii_case("DOCTYPE"))
                {
                    return Err(XmlError::DoctypeRejected);
                }
                return Err(self.malformed("unsupported markup declaration"));
            } else if rest.starts_with("</") {
                if let Some(root) = self.end_tag()? {
                    return Ok(root);
                }
            } else if rest.starts_with('<') {
                if let Some(root) = self.start_tag()? {
                    return Ok(root);
                }
            } else {
                self.text()?;
            }
        }
        match self.stack.pop() {
            Some(open) => Err(XmlError::UnexpectedEof(open.name)),
            None => Err(XmlError::NoRoot),
        }
    }

    fn skip_past(&mut self, terminator: &str, reason: &'static str) -> Result<(), XmlError> {
        let end = self
            .rest()
            .find(terminator)
            .ok_or_else(|| self.malformed(reason))?;
        self.pos += end + terminator.len();
        Ok(())
    }

    fn text(&mut self) -> Result<(), XmlError> {
        let end = self.rest().find('<').unwrap_or(self.rest().len());
        let raw = &self.rest()[..end];
        match self.stack.last_mut() {
            Some(current) => current.push_text(&decode_entities(raw)?),
            None if raw.trim().is_empty() => {}
            None => return Err(self.malformed("text outside of the root element")),
        }
        self.pos += end;
        Ok(())
    }

    /// Returns the finished root when the closing tag empties the stack.
    fn end_tag(&mut self) -> Result<Option<Element>, XmlError> {
        let end = self
            .rest()
            .find('>')
            .ok_or_else(|| self.malformed("unterminated closing tag"))?;
        let name = self.rest()[2..end].trim().to_owned();
        self.pos += end + 1;

        let finished = self.stack.pop().ok_or_else(|| XmlError::MismatchedTag {
            expected: String::new(),
            found: name.clone(),
        })?;
        if finished.name != name {
            return Err(XmlError::MismatchedTag {
                expected: finished.name,
                found: name,
            });
        }
        Ok(self.close(finished))
    }

    fn start_tag(&mut self) -> Result<Option<Element>, XmlError> {
        self.pos += 1;
        let name = self.name()?;
        let mut element = Element::new(name.to_owned());

        loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.starts_with("/>") {
                self.pos += 2;
                return Ok(self.close(element));
            }
            if rest.starts_with('>') {
                self.pos += 1;
                self.stack.push(element);
                return Ok(None);
            }
            if rest.is_empty() {
                return Err(XmlError::UnexpectedEof(element.name));
            }

            let key = self.name()?.to_owned();
            self.skip_whitespace();
            if !self.rest().starts_with('=') {
                return Err(self.malformed("attribute without value"));
            }
            self.pos += 1;
            self.skip_whitespace();
            let value = self.quoted()?;
            if element.attributes.contains_key(&key) {
                return Err(XmlError::DuplicateAttribute {
                    element: element.name,
                    attribute: key,
                });
            }
            element.attributes.insert(key, value);
        }
    }

    /// Attach a finished element to its parent, or hand it back as the root.
    fn close(&mut self, finished: Element) -> Option<Element> {
        match self.stack.last_mut() {
            Some(parent) => {
                parent.add_child(finished);
                None
            }
            None => Some(finished),
        }
    }

    fn name(&mut self) -> Result<&'a str, XmlError> {
        let rest = self.rest();
        let len = rest
            .find(|c: char| c.is_whitespace() || matches!(c, '>' | '/' | '=' | '<'))
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(self.malformed("expected a name"));
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    fn quoted(&mut self) -> Result<String, XmlError> {
        let quote = match self.rest().chars().next() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(self.malformed("attribute value must be quoted")),
        };
        self.pos += 1;
        let end = self
            .rest()
            .find(quote)
            .ok_or_else(|| self.malformed("unterminated attribute value"))?;
        let value = decode_entities(&self.rest()[..end])?;
        self.pos += end + 1;
        Ok(value)
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }
}

/// Expand the predefined entities and numeric character references.
fn decode_entities(raw: &str) -> Result<String, XmlError> {
    if !raw.contains('&') {
        return Ok(raw.to_owned());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp + 1..];
        let semi = rest
            .find(';')
            .ok_or_else(|| XmlError::UnresolvedEntity(rest.to_owned()))?;
        let entity = &rest[..semi];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .map(|hex| u32::from_str_radix(hex, 16))
                .or_else(|| entity.strip_prefix('#').map(str::parse::<u32>))
                .and_then(Result::ok)
                .and_then(char::from_u32),
        };
        out.push(decoded.ok_or_else(|| XmlError::UnresolvedEntity(entity.to_owned()))?);
        rest = &rest[semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
