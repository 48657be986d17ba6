use std::collections::HashSet;

use xmpp_parsers::minidom::Element;
use xmpp_parsers::stream_features::StreamFeatures as AdvertisedFeatures;

use crate::error::ConnectionError;
use crate::legacy_ns;

/// What the server advertised in its most recent `<stream:features/>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFeatures {
    pub starttls: bool,
    pub starttls_required: bool,
    pub mechanisms: HashSet<String>,
    pub compression_methods: Vec<String>,
    pub bind: bool,
    pub session: bool,
    pub session_optional: bool,
    pub stream_management: bool,
}

impl StreamFeatures {
    pub fn parse(element: &Element) -> Result<Self, ConnectionError> {
        let advertised = AdvertisedFeatures::try_from(element.clone()).map_err(|error| {
            ConnectionError::StreamError(format!(
                "invalid <stream:features/> (got <{}/>): {error}",
                element.name()
            ))
        })?;

        let mut features = StreamFeatures {
            starttls: advertised.can_starttls(),
            starttls_required: advertised
                .starttls
                .as_ref()
                .is_some_and(|starttls| starttls.required),
            mechanisms: advertised
                .sasl_mechanisms
                .mechanisms
                .iter()
                .map(|mechanism| mechanism.trim().to_string())
                .collect(),
            bind: advertised.can_bind(),
            stream_management: advertised.stream_management.is_some(),
            ..StreamFeatures::default()
        };

        // Compression and the legacy session have no typed parsers.
        for other in &advertised.others {
            if other.is("compression", legacy_ns::COMPRESS_FEATURE) {
                features.compression_methods = other
                    .children()
                    .filter(|method| method.is("method", legacy_ns::COMPRESS_FEATURE))
                    .map(|method| method.text().trim().to_string())
                    .collect();
            } else if other.is("session", legacy_ns::SESSION) {
                features.session = true;
                features.session_optional = other.has_child("optional", legacy_ns::SESSION);
            }
        }

        Ok(features)
    }

    /// A legacy session still has to be established after binding.
    pub fn requires_session(&self) -> bool {
        self.session && !self.session_optional
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use assert_matches::assert_matches;

    use super::*;

    fn parse(xml: &str) -> Result<StreamFeatures, ConnectionError> {
        StreamFeatures::parse(&Element::from_str(xml).unwrap())
    }

    #[test]
    fn parses_pre_tls_features() {
        let features = parse(
            "<stream:features xmlns:stream='http://etherx.jabber.org/streams'>\
               <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
               <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
                 <mechanism>SCRAM-SHA-1</mechanism><mechanism>PLAIN</mechanism>\
               </mechanisms>\
             </stream:features>",
        )
        .unwrap();

        assert!(features.starttls);
        assert!(features.starttls_required);
        assert_eq!(
            features.mechanisms,
            HashSet::from(["SCRAM-SHA-1".to_string(), "PLAIN".to_string()])
        );
        assert!(!features.bind);
    }

    #[test]
    fn parses_post_auth_features() {
        let features = parse(
            "<stream:features xmlns:stream='http://etherx.jabber.org/streams'>\
               <compression xmlns='http://jabber.org/features/compress'><method>zlib</method></compression>\
               <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
               <session xmlns='urn:ietf:params:xml:ns:xmpp-session'><optional/></session>\
               <sm xmlns='urn:xmpp:sm:3'/>\
             </stream:features>",
        )
        .unwrap();

        assert_eq!(features.compression_methods, vec!["zlib".to_string()]);
        assert!(features.bind);
        assert!(features.session);
        assert!(!features.requires_session());
        assert!(features.stream_management);
        assert!(!features.starttls);
    }

    #[test]
    fn rejects_other_elements() {
        assert_matches!(
            parse("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"),
            Err(ConnectionError::StreamError(_))
        );
    }
}
