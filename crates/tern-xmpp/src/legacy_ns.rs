//! Namespaces of the pre-RFC 6120 session and XEP-0138 compression
//! features, which `xmpp_parsers::ns` does not carry.

pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
pub const COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";
pub const COMPRESS_PROTOCOL: &str = "http://jabber.org/protocol/compress";
