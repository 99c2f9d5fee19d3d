//! A forgiving HTML fragment parser.
//!
//! This is not a full HTML5 tree builder; the input is
//! machine-serialised article HTML from the wiki API, which is well-formed
//! in practice. The recovery rules are the usual lenient ones: unknown end
//! tags are dropped, mismatched end tags close up to the nearest matching
//! open element, and anything still open at the end of input closes there.

use super::{Element, Fragment, NodeData, RAW_TEXT_ELEMENTS, VOID_ELEMENTS};
use html_escape::decode_html_entities;

/// Parses an HTML fragment into an arena tree.
pub fn parse(html: &str) -> Fragment {
    let mut fragment = Fragment::new();
    let mut open = vec![fragment.root()];
    let mut lexer = Lexer { html, at: 0 };

    while let Some(token) = lexer.next_token() {
        let top = *open.last().expect("the root never closes");
        match token {
            Token::Text(text) => {
                fragment.append(top, NodeData::Text(text));
            }
            Token::Comment(body) => {
                fragment.append(top, NodeData::Comment(body.to_string()));
            }
            Token::Start {
                name,
                attrs,
                self_closing,
            } => {
                let element = Element::new(name, attrs);
                let raw = RAW_TEXT_ELEMENTS.contains(element.name.as_str());
                let void = VOID_ELEMENTS.contains(element.name.as_str());
                let raw_name = element.name.clone();
                let id = fragment.append(top, NodeData::Element(element));
                if raw {
                    // Raw text runs to the matching end tag, entities and
                    // markup untouched.
                    let text = lexer.raw_text(&raw_name);
                    if !text.is_empty() {
                        fragment.append(id, NodeData::Text(text.to_string()));
                    }
                } else if !void && !self_closing {
                    open.push(id);
                }
            }
            Token::End(name) => {
                let name = name.to_ascii_lowercase();
                if let Some(depth) = open.iter().rposition(|&id| {
                    fragment
                        .element(id)
                        .is_some_and(|element| element.name == name)
                }) && depth > 0
                {
                    open.truncate(depth);
                }
            }
        }
    }

    fragment
}

/// A lexed token.
enum Token<'a> {
    /// Character data, entities decoded.
    Text(String),
    /// `<!-- … -->`.
    Comment(&'a str),
    /// `<name attr="…">`.
    Start {
        name: &'a str,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    /// `</name>`.
    End(&'a str),
}

/// Cursor over the input.
struct Lexer<'a> {
    html: &'a str,
    at: usize,
}

impl<'a> Lexer<'a> {
    fn next_token(&mut self) -> Option<Token<'a>> {
        let rest = &self.html[self.at..];
        if rest.is_empty() {
            return None;
        }

        if let Some(rest) = rest.strip_prefix('<') {
            if let Some(body) = rest.strip_prefix("!--") {
                let end = body.find("-->").unwrap_or(body.len());
                self.at += "<!--".len() + end + "-->".len().min(body.len() - end);
                return Some(Token::Comment(&body[..end]));
            }
            if rest.starts_with('!') || rest.starts_with('?') {
                // Doctype or processing instruction: skip.
                let end = rest.find('>').map_or(self.html.len(), |i| {
                    self.at + "<".len() + i + ">".len()
                });
                self.at = end;
                return self.next_token();
            }
            if let Some(rest) = rest.strip_prefix('/') {
                let end = rest.find('>').unwrap_or(rest.len());
                let name = rest[..end].trim_ascii();
                self.at += "</".len() + end + ">".len().min(rest.len() - end);
                return Some(Token::End(name));
            }
            if rest.starts_with(|c: char| c.is_ascii_alphabetic()) {
                return Some(self.start_tag());
            }
        }

        // Plain text up to the next plausible tag.
        let offset = memchr::memchr(b'<', &rest.as_bytes()[1..])
            .map_or(rest.len(), |i| i + 1);
        self.at += offset;
        Some(Token::Text(
            decode_html_entities(&rest[..offset]).into_owned(),
        ))
    }

    /// Lexes a start tag; the cursor sits on `<`.
    fn start_tag(&mut self) -> Token<'a> {
        let start = self.at + 1;
        let mut at = start;
        let bytes = self.html.as_bytes();

        while at < bytes.len()
            && matches!(bytes[at], b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b':')
        {
            at += 1;
        }
        let name = &self.html[start..at];

        let mut attrs = Vec::new();
        let mut self_closing = false;
        loop {
            while at < bytes.len() && bytes[at].is_ascii_whitespace() {
                at += 1;
            }
            match bytes.get(at) {
                None => break,
                Some(b'>') => {
                    at += 1;
                    break;
                }
                Some(b'/') => {
                    self_closing = true;
                    at += 1;
                }
                Some(_) => {
                    let (attr, next) = self.attribute(at);
                    if let Some(attr) = attr {
                        attrs.push(attr);
                    }
                    // Defend against a stuck cursor on malformed input.
                    at = next.max(at + 1);
                }
            }
        }

        self.at = at;
        Token::Start {
            name,
            attrs,
            self_closing,
        }
    }

    /// Lexes one `name[=value]` attribute starting at `at`; returns the
    /// attribute and the position after it.
    fn attribute(&self, mut at: usize) -> (Option<(String, String)>, usize) {
        let bytes = self.html.as_bytes();
        let name_start = at;
        while at < bytes.len()
            && !bytes[at].is_ascii_whitespace()
            && !matches!(bytes[at], b'=' | b'>' | b'/')
        {
            at += 1;
        }
        if at == name_start {
            return (None, at);
        }
        let name = self.html[name_start..at].to_ascii_lowercase();

        while at < bytes.len() && bytes[at].is_ascii_whitespace() {
            at += 1;
        }
        if bytes.get(at) != Some(&b'=') {
            return (Some((name, String::new())), at);
        }
        at += 1;
        while at < bytes.len() && bytes[at].is_ascii_whitespace() {
            at += 1;
        }

        let value = match bytes.get(at) {
            Some(&quote @ (b'"' | b'\'')) => {
                at += 1;
                let value_start = at;
                while at < bytes.len() && bytes[at] != quote {
                    at += 1;
                }
                let value = &self.html[value_start..at];
                at = (at + 1).min(bytes.len());
                value
            }
            _ => {
                let value_start = at;
                while at < bytes.len()
                    && !bytes[at].is_ascii_whitespace()
                    && bytes[at] != b'>'
                {
                    at += 1;
                }
                &self.html[value_start..at]
            }
        };

        (
            Some((name, decode_html_entities(value).into_owned())),
            at,
        )
    }

    /// Consumes raw text up to (and including) `</name>`, returning the
    /// text.
    fn raw_text(&mut self, name: &str) -> &'a str {
        let rest = &self.html[self.at..];
        let lower = rest.to_ascii_lowercase();
        let close = format!("</{name}");
        let end = lower.find(&close).unwrap_or(rest.len());
        let text = &rest[..end];

        let mut at = self.at + end;
        if let Some(offset) = self.html[at..].find('>') {
            at += offset + 1;
        } else {
            at = self.html.len();
        }
        self.at = at;
        text
    }
}

#[cfg(test)]
mod tests {
    use super::parse;

    /// Parse → serialise with no mutation should be structure-preserving,
    /// and a second round trip must be byte-identical to the first.
    fn round_trip(html: &str) -> String {
        let first = parse(html).to_html();
        let second = parse(&first).to_html();
        assert_eq!(first, second, "serialisation must be idempotent");
        first
    }

    #[test]
    fn simple_fragment() {
        assert_eq!(
            round_trip("<p>Hello <b>world</b></p>"),
            "<p>Hello <b>world</b></p>"
        );
    }

    #[test]
    fn attributes_and_entities() {
        assert_eq!(
            round_trip(r#"<a href="/wiki/A%26B" title="A &amp; B">A &amp; B</a>"#),
            r#"<a href="/wiki/A%26B" title="A &amp; B">A &amp; B</a>"#
        );
    }

    #[test]
    fn unquoted_and_single_quoted_attributes() {
        assert_eq!(
            round_trip("<img src=foo.png alt='a b'>"),
            r#"<img src="foo.png" alt="a b">"#
        );
    }

    #[test]
    fn void_elements_do_not_nest() {
        assert_eq!(
            round_trip("<p><br>one<img src=\"x\">two</p>"),
            "<p><br>one<img src=\"x\">two</p>"
        );
    }

    #[test]
    fn self_closing_foreign_content() {
        assert_eq!(round_trip("<math/><p>after</p>"), "<math></math><p>after</p>");
    }

    #[test]
    fn stray_end_tags_are_dropped() {
        assert_eq!(round_trip("</div><p>ok</p></p>"), "<p>ok</p>");
    }

    #[test]
    fn mismatched_nesting_recovers() {
        assert_eq!(round_trip("<div><b>x</div>"), "<div><b>x</b></div>");
    }

    #[test]
    fn comments_survive() {
        assert_eq!(round_trip("a<!-- keep -->b"), "a<!-- keep -->b");
    }

    #[test]
    fn doctype_is_dropped() {
        assert_eq!(round_trip("<!DOCTYPE html><p>x</p>"), "<p>x</p>");
    }

    #[test]
    fn raw_text_is_untouched() {
        assert_eq!(
            round_trip("<style>a > b { color: red; }</style>"),
            "<style>a > b { color: red; }</style>"
        );
    }

    #[test]
    fn boolean_attributes() {
        assert_eq!(
            round_trip("<input disabled>"),
            r#"<input disabled="">"#
        );
    }

    #[test]
    fn truncated_input_does_not_panic() {
        round_trip("<p><a href=\"x");
        round_trip("<p");
        round_trip("text <");
        round_trip("<!-- unterminated");
    }
}
