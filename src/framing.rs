//! XMPP stream framing: top-level unit extraction from a TCP byte stream.
//!
//! The reader loop keeps a byte buffer and repeatedly calls [`extract_unit`]
//! to cut complete units (stream header, stanza, stream close) out of it.
//! Anything left over stays in the buffer until the next read completes it.

use quick_xml::errors::SyntaxError;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{Error, Result};
use crate::ns;

/// Closing tag of the stream.
pub const STREAM_CLOSE: &str = "</stream:stream>";

/// A complete top-level unit found in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// `<stream:stream ...>` opening tag, with any preceding XML declaration.
    StreamOpen(String),
    /// A complete top-level element (stanza or nonza).
    Element(String),
    /// `</stream:stream>`.
    StreamClose,
}

/// State machine for unit boundary detection.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    /// Between units, or before the stream header.
    Idle,
    /// Inside a top-level element, collecting events.
    InElement,
}

/// Convert a unit's bytes to a String. Non-UTF-8 input is a protocol violation.
fn bytes_to_string(bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| Error::Protocol(format!("invalid UTF-8 in stream: {}", e)))
}

fn is_stream_tag(qname: &[u8]) -> bool {
    qname == b"stream:stream"
}

/// Syntax errors quick-xml reports when the slice simply ends too early.
fn is_incomplete(e: &quick_xml::Error) -> bool {
    matches!(
        e,
        quick_xml::Error::Syntax(
            SyntaxError::UnclosedTag
                | SyntaxError::UnclosedComment
                | SyntaxError::UnclosedCData
                | SyntaxError::UnclosedPIOrXmlDecl
                | SyntaxError::UnclosedDoctype
        )
    )
}

/// Extract the next complete unit from the given buffer slice.
///
/// Returns `Ok(Some((unit, bytes_consumed)))` when a unit is complete and
/// `Ok(None)` when more bytes are needed. Malformed markup is an error: the
/// stream cannot be resynchronised after it.
pub fn extract_unit(buffer: &[u8]) -> Result<Option<(Unit, usize)>> {
    // The stream close appears alone, without its opening tag in the buffer
    let start = buffer.iter().position(|b| !b.is_ascii_whitespace());
    if let Some(start) = start {
        if buffer[start..].starts_with(STREAM_CLOSE.as_bytes()) {
            return Ok(Some((Unit::StreamClose, start + STREAM_CLOSE.len())));
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    // End names are verified when the element itself is parsed
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ParserState::Idle;
    let mut unit_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                continue;
            }
            Ok(Event::Start(e)) => {
                if state == ParserState::Idle && is_stream_tag(e.name().as_ref()) {
                    let tag_end = reader.buffer_position() as usize;
                    let header = bytes_to_string(&buffer[..tag_end])?;
                    return Ok(Some((Unit::StreamOpen(header), tag_end)));
                }

                depth += 1;
                if state == ParserState::Idle && depth == 1 {
                    state = ParserState::InElement;
                    unit_start = pos;
                }
            }
            Ok(Event::Empty(e)) => {
                if state == ParserState::Idle && is_stream_tag(e.name().as_ref()) {
                    return Err(Error::Protocol("self-closing stream header".to_string()));
                }

                // Self-closing top-level unit (e.g. <presence/>, <r xmlns='urn:xmpp:sm:3'/>)
                if state == ParserState::Idle && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    let element = bytes_to_string(&buffer[pos..tag_end])?;
                    return Ok(Some((Unit::Element(element), tag_end)));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(e)) => {
                if depth == 0 {
                    if is_stream_tag(e.name().as_ref()) {
                        let tag_end = reader.buffer_position() as usize;
                        return Ok(Some((Unit::StreamClose, tag_end)));
                    }
                    return Err(Error::Protocol(format!(
                        "unexpected closing tag </{}>",
                        String::from_utf8_lossy(e.name().as_ref())
                    )));
                }

                depth -= 1;
                if state == ParserState::InElement && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    let element = bytes_to_string(&buffer[unit_start..tag_end])?;
                    return Ok(Some((Unit::Element(element), tag_end)));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Err(e) if is_incomplete(&e) => return Ok(None),
            Err(e) => return Err(Error::Protocol(format!("malformed XML in stream: {}", e))),
        }
    }
}

/// Opening tag of a client-to-server stream.
pub fn stream_open(domain: &str, lang: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream to='{}' version='1.0' xml:lang='{}' xmlns='{}' xmlns:stream='{}'>",
        quick_xml::escape::escape(domain),
        quick_xml::escape::escape(lang),
        ns::CLIENT,
        ns::STREAMS
    )
}

/// Attributes of the server's stream header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub id: Option<String>,
    pub from: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
}

impl StreamHeader {
    pub fn parse(header: &str) -> Result<StreamHeader> {
        let mut reader = Reader::from_str(header);
        loop {
            match reader.read_event()? {
                Event::Start(e) | Event::Empty(e) if is_stream_tag(e.name().as_ref()) => {
                    let mut parsed = StreamHeader::default();
                    for attr in e.attributes() {
                        let attr = attr.map_err(|e| Error::Xml(e.to_string()))?;
                        let value = attr.unescape_value()?.into_owned();
                        match attr.key.as_ref() {
                            b"id" => parsed.id = Some(value),
                            b"from" => parsed.from = Some(value),
                            b"version" => parsed.version = Some(value),
                            b"xml:lang" => parsed.lang = Some(value),
                            _ => {}
                        }
                    }
                    return Ok(parsed);
                }
                Event::Eof => return Err(Error::Protocol("missing stream header".to_string())),
                Event::Start(_) | Event::Empty(_) => {
                    return Err(Error::Protocol("expected stream header".to_string()));
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(buf: &[u8]) -> (String, usize) {
        match extract_unit(buf).unwrap().unwrap() {
            (Unit::Element(s), consumed) => (s, consumed),
            (other, _) => panic!("expected element, got {:?}", other),
        }
    }

    #[test]
    fn test_extract_stream_opening() {
        let buf = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>";
        let (unit, consumed) = extract_unit(buf).unwrap().unwrap();
        match unit {
            Unit::StreamOpen(header) => {
                assert!(header.contains("<?xml"));
                assert!(header.contains("<stream:stream"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_extract_stream_features() {
        let buf = b"<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism><mechanism>SCRAM-SHA-1</mechanism></mechanisms><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features>";
        let (features, consumed) = element(buf);
        assert!(features.starts_with("<stream:features"));
        assert!(features.ends_with("</stream:features>"));
        assert!(features.contains("<starttls"));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_extract_simple_stanza() {
        let (stanza, consumed) = element(b"<presence/>");
        assert_eq!(stanza, "<presence/>");
        assert_eq!(consumed, 11);
    }

    #[test]
    fn test_extract_multiple_stanzas() {
        let buf = b"<presence from='user@example.com'/><message to='other@example.com'><body>Hello</body></message>";
        let mut offset = 0;

        let (first, consumed) = element(&buf[offset..]);
        offset += consumed;
        assert!(first.contains("<presence"));
        assert!(!first.contains("<message"));

        let (second, consumed) = element(&buf[offset..]);
        offset += consumed;
        assert!(second.contains("Hello"));
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn test_extract_incomplete_stanza() {
        let buf = b"<iq type='get'><query xmlns='jabber:iq:roster'>";
        assert!(extract_unit(buf).unwrap().is_none());
    }

    #[test]
    fn test_extract_partial_tag() {
        assert!(extract_unit(b"<message to='a@b").unwrap().is_none());
        assert!(extract_unit(b"<message><body><![CDATA[half").unwrap().is_none());
    }

    #[test]
    fn test_extract_stream_closing() {
        let (unit, consumed) = extract_unit(b"  </stream:stream>").unwrap().unwrap();
        assert_eq!(unit, Unit::StreamClose);
        assert_eq!(consumed, 18);
    }

    #[test]
    fn test_extract_empty_and_whitespace_buffers() {
        assert!(extract_unit(b"").unwrap().is_none());
        assert!(extract_unit(b"   \n  ").unwrap().is_none());
    }

    #[test]
    fn test_extract_sm_units() {
        let buf = b"<r xmlns='urn:xmpp:sm:3'/><a xmlns='urn:xmpp:sm:3' h='5'/>";
        let (r, consumed) = element(buf);
        assert!(r.starts_with("<r "));
        let (a, rest) = element(&buf[consumed..]);
        assert!(a.contains("h='5'"));
        assert_eq!(consumed + rest, buf.len());
    }

    #[test]
    fn test_extract_server_stream_and_features() {
        let buf = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='example.com' id='abc' version='1.0'><stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></stream:features>";
        let (unit, c1) = extract_unit(buf).unwrap().unwrap();
        assert!(matches!(unit, Unit::StreamOpen(_)));
        let (features, c2) = element(&buf[c1..]);
        assert!(features.contains("<required/>"));
        assert_eq!(c1 + c2, buf.len());
    }

    #[test]
    fn test_extract_fragmented_features() {
        let part = b"<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>";
        assert!(extract_unit(part).unwrap().is_none());

        let mut full = part.to_vec();
        full.extend_from_slice(b"</stream:features>");
        let (features, consumed) = element(&full);
        assert!(features.contains("<starttls"));
        assert_eq!(consumed, full.len());
    }

    #[test]
    fn test_extract_keeps_entities_and_cdata_raw() {
        let (stanza, _) = element(b"<message from='a@b'><body>Hello &amp; <![CDATA[<raw>]]></body></message>");
        assert!(stanza.contains("&amp;"));
        assert!(stanza.contains("CDATA"));
    }

    #[test]
    fn test_extract_stray_closing_tag_is_error() {
        assert!(extract_unit(b"</message>").is_err());
    }

    #[test]
    fn test_stream_open_format() {
        let open = stream_open("example.com", "en");
        assert!(open.starts_with("<?xml version='1.0'?><stream:stream to='example.com'"));
        assert!(open.contains("xmlns:stream='http://etherx.jabber.org/streams'"));
        let (unit, consumed) = extract_unit(open.as_bytes()).unwrap().unwrap();
        assert!(matches!(unit, Unit::StreamOpen(_)));
        assert_eq!(consumed, open.len());
    }

    #[test]
    fn test_stream_header_parse() {
        let header = StreamHeader::parse(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='example.com' id='s-42' version='1.0' xml:lang='en'>",
        )
        .unwrap();
        assert_eq!(header.id.as_deref(), Some("s-42"));
        assert_eq!(header.from.as_deref(), Some("example.com"));
        assert_eq!(header.version.as_deref(), Some("1.0"));
        assert_eq!(header.lang.as_deref(), Some("en"));
    }
}
