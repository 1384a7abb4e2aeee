//! The instance-writer collaborator.
//!
//! A [`MarkupWriter`] turns tags, attributes, and text into output chunks.
//! The renderer calls it and buffers whatever comes back; it never inspects
//! the produced bytes. The bundled [`HtmlWriter`] is a minimal writer with
//! baseline escaping — enough for tests and simple documents, not a full
//! markup-language implementation.

use crate::error::{ErrorKind, RenderError, Result};
use bytes::Bytes;
use std::cell::RefCell;
use std::collections::HashSet;

/// Serializes instances into output chunks.
///
/// Implementations own their validation caches; the renderer constructs one
/// writer per renderer instance and threads it through explicitly.
pub trait MarkupWriter {
    /// Appends the opening of an element (start tag, attributes, `>`).
    fn push_element_start(
        &self,
        out: &mut Vec<Bytes>,
        tag: &str,
        attrs: &[(String, String)],
    ) -> Result<()>;

    /// Appends the closing of an element, if the tag has one.
    fn push_element_end(&self, out: &mut Vec<Bytes>, tag: &str) -> Result<()>;

    /// Appends escaped text content.
    fn push_text(&self, out: &mut Vec<Bytes>, text: &str);
}

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// A minimal markup writer with a per-instance validated-name cache.
pub struct HtmlWriter {
    validated: RefCell<HashSet<String>>,
}

impl HtmlWriter {
    /// Creates a writer with an empty validation cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            validated: RefCell::new(HashSet::new()),
        }
    }

    fn validate_name(&self, name: &str) -> Result<()> {
        if self.validated.borrow().contains(name) {
            return Ok(());
        }
        let mut chars = name.chars();
        let valid = match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':')
            }
            _ => false,
        };
        if !valid {
            return Err(RenderError::new(ErrorKind::InvalidMarkup)
                .with_message(format!("invalid name: {name:?}")));
        }
        self.validated.borrow_mut().insert(name.to_owned());
        Ok(())
    }
}

impl Default for HtmlWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkupWriter for HtmlWriter {
    fn push_element_start(
        &self,
        out: &mut Vec<Bytes>,
        tag: &str,
        attrs: &[(String, String)],
    ) -> Result<()> {
        self.validate_name(tag)?;
        let mut buf = String::with_capacity(tag.len() + 2 + attrs.len() * 16);
        buf.push('<');
        buf.push_str(tag);
        for (name, value) in attrs {
            self.validate_name(name)?;
            buf.push(' ');
            buf.push_str(name);
            buf.push_str("=\"");
            escape_attr_into(&mut buf, value);
            buf.push('"');
        }
        buf.push('>');
        out.push(Bytes::from(buf));
        Ok(())
    }

    fn push_element_end(&self, out: &mut Vec<Bytes>, tag: &str) -> Result<()> {
        if VOID_TAGS.contains(&tag) {
            return Ok(());
        }
        let mut buf = String::with_capacity(tag.len() + 3);
        buf.push_str("</");
        buf.push_str(tag);
        buf.push('>');
        out.push(Bytes::from(buf));
        Ok(())
    }

    fn push_text(&self, out: &mut Vec<Bytes>, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut buf = String::with_capacity(text.len());
        escape_text_into(&mut buf, text);
        out.push(Bytes::from(buf));
    }
}

fn escape_text_into(buf: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => buf.push_str("&amp;"),
            '<' => buf.push_str("&lt;"),
            '>' => buf.push_str("&gt;"),
            _ => buf.push(c),
        }
    }
}

pub(crate) fn escape_attr_into(buf: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => buf.push_str("&amp;"),
            '<' => buf.push_str("&lt;"),
            '"' => buf.push_str("&quot;"),
            '\'' => buf.push_str("&#x27;"),
            _ => buf.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(chunks: &[Bytes]) -> String {
        let mut out = Vec::new();
        for c in chunks {
            out.extend_from_slice(c);
        }
        String::from_utf8(out).expect("utf8")
    }

    #[test]
    fn start_tag_with_escaped_attrs() {
        let w = HtmlWriter::new();
        let mut out = Vec::new();
        w.push_element_start(
            &mut out,
            "a",
            &[("href".to_owned(), "/x?a=1&b=\"2\"".to_owned())],
        )
        .expect("valid");
        assert_eq!(collect(&out), "<a href=\"/x?a=1&amp;b=&quot;2&quot;\">");
    }

    #[test]
    fn void_tags_have_no_end() {
        let w = HtmlWriter::new();
        let mut out = Vec::new();
        w.push_element_end(&mut out, "br").expect("valid");
        assert!(out.is_empty());
        w.push_element_end(&mut out, "div").expect("valid");
        assert_eq!(collect(&out), "</div>");
    }

    #[test]
    fn text_is_escaped() {
        let w = HtmlWriter::new();
        let mut out = Vec::new();
        w.push_text(&mut out, "1 < 2 & 3 > 2");
        assert_eq!(collect(&out), "1 &lt; 2 &amp; 3 &gt; 2");
    }

    #[test]
    fn invalid_tag_is_rejected_once_and_cached_when_valid() {
        let w = HtmlWriter::new();
        let mut out = Vec::new();
        let err = w
            .push_element_start(&mut out, "1bad", &[])
            .expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::InvalidMarkup);
        w.push_element_start(&mut out, "div", &[]).expect("valid");
        assert!(w.validated.borrow().contains("div"));
    }
}
