use xmpp_parsers::minidom::Element;

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;

/// Header of a freshly (re)opened stream.
#[derive(Debug, Clone)]
pub struct StreamOpened {
    pub id: Option<String>,
    /// The `<stream:features/>` element the server sent after the header.
    pub features: Element,
}

/// Produces transports for a configuration. DNS lookup, direct TLS and the
/// socket itself live behind this seam.
pub trait TransportConnector: Send + Sync + 'static {
    type Transport: XmppTransport;

    fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<Self::Transport, ConnectionError>> + Send;
}

/// One XML stream over one socket. Frames are whole top-level elements.
///
/// During negotiation the connection drives the transport directly. Once the
/// stream is established it is split into a reader half and a writer half
/// that run on their own tasks.
pub trait XmppTransport: Send + 'static {
    type Reader: FrameReader;
    type Writer: FrameWriter;

    fn open_stream(
        &mut self,
        domain: &str,
    ) -> impl Future<Output = Result<StreamOpened, ConnectionError>> + Send;

    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>, ConnectionError>> + Send;

    fn start_tls(
        &mut self,
        domain: &str,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn enable_compression(
        &mut self,
        method: &str,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn is_secure(&self) -> bool;

    fn close(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn into_split(self) -> (Self::Reader, Self::Writer);
}

pub trait FrameReader: Send + 'static {
    /// Next top-level element, or `None` once the peer closed the stream.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>, ConnectionError>> + Send;
}

pub trait FrameWriter: Send + 'static {
    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}
