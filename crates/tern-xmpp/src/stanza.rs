use std::str::FromStr;

use xmpp_parsers::minidom::Element;
use xmpp_parsers::ns;

use crate::error::StanzaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

impl StanzaKind {
    pub fn name(&self) -> &'static str {
        match self {
            StanzaKind::Message => "message",
            StanzaKind::Presence => "presence",
            StanzaKind::Iq => "iq",
        }
    }
}

/// One top-level `jabber:client` stanza. The payload stays an untyped
/// element; extension parsing happens above this crate.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    kind: StanzaKind,
    element: Element,
}

impl Stanza {
    pub fn parse(raw: &[u8]) -> Result<Self, StanzaError> {
        parse_stanza(raw)
    }

    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    pub fn stanza_type(&self) -> Option<&str> {
        self.element.attr("type")
    }

    /// `<iq type='get'/>` and `<iq type='set'/>` expect a timely reply.
    pub fn is_iq_request(&self) -> bool {
        self.kind == StanzaKind::Iq && matches!(self.stanza_type(), Some("get") | Some("set"))
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn into_element(self) -> Element {
        self.element
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StanzaError> {
        serialize_element(&self.element)
    }
}

impl TryFrom<Element> for Stanza {
    type Error = StanzaError;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        let kind = match element.name() {
            "message" => StanzaKind::Message,
            "presence" => StanzaKind::Presence,
            "iq" => StanzaKind::Iq,
            other => {
                return Err(StanzaError::Unsupported(other.to_string()));
            }
        };
        if element.ns() != ns::JABBER_CLIENT {
            return Err(StanzaError::Unsupported(format!(
                "{{{}}}{}",
                element.ns(),
                element.name()
            )));
        }
        Ok(Self { kind, element })
    }
}

impl From<Stanza> for Element {
    fn from(value: Stanza) -> Self {
        value.element
    }
}

impl FromStr for Stanza {
    type Err = StanzaError;

    fn from_str(xml: &str) -> Result<Self, Self::Err> {
        parse_stanza(xml.as_bytes())
    }
}

pub fn parse_stanza(raw: &[u8]) -> Result<Stanza, StanzaError> {
    let element = parse_element(raw)?;
    Stanza::try_from(element)
}

pub(crate) fn parse_element(raw: &[u8]) -> Result<Element, StanzaError> {
    let xml = std::str::from_utf8(raw)
        .map_err(|error| StanzaError::Parse(format!("invalid UTF-8 frame: {error}")))?;
    let trimmed = xml.trim();
    if trimmed.is_empty() {
        return Err(StanzaError::Parse("frame is empty".to_string()));
    }

    Element::from_str(trimmed)
        .map_err(|error| StanzaError::Parse(format!("failed to parse XML frame: {error}")))
}

pub(crate) fn serialize_element(element: &Element) -> Result<Vec<u8>, StanzaError> {
    let mut payload = Vec::new();
    element.write_to(&mut payload).map_err(|error| {
        StanzaError::Serialize(format!("failed to serialize <{}/>: {error}", element.name()))
    })?;
    Ok(payload)
}
