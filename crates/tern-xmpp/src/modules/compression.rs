use tracing::debug;
use xmpp_parsers::minidom::Element;

use super::ModuleRuntime;
use crate::error::ConnectionError;
use crate::fsm::{ConnectionContext, Feasibility, TransitionOutcome};
use crate::legacy_ns;
use crate::transport::TransportConnector;

/// XEP-0138 stream compression.
#[derive(Debug, Default)]
pub struct Compression {
    method: Option<String>,
}

impl Compression {
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// First configured method the server also offers.
    fn choose<C: TransportConnector>(ctx: &ConnectionContext<C>) -> Option<String> {
        let offered = &ctx.features().compression_methods;
        ctx.config()
            .modules
            .compression_methods
            .iter()
            .find(|method| offered.contains(method))
            .cloned()
    }

    async fn negotiate<C: TransportConnector>(
        &mut self,
        ctx: &mut ConnectionContext<C>,
    ) -> Result<TransitionOutcome, ConnectionError> {
        let Some(method) = Self::choose(ctx) else {
            return Ok(TransitionOutcome::failed("no common compression method"));
        };
        debug!(%method, "requesting stream compression");

        let request = Element::builder("compress", legacy_ns::COMPRESS_PROTOCOL)
            .append(
                Element::builder("method", legacy_ns::COMPRESS_PROTOCOL)
                    .append(method.clone())
                    .build(),
            )
            .build();
        ctx.send_element(&request).await?;

        let reply = ctx.next_element().await?;
        if reply.is("compressed", legacy_ns::COMPRESS_PROTOCOL) {
            ctx.enable_compression(&method).await?;
            ctx.restart_stream().await?;
            ctx.set_compression(method.clone());
            self.method = Some(method.clone());
            Ok(TransitionOutcome::success(format!("compressed with {method}")))
        } else if reply.is("failure", legacy_ns::COMPRESS_PROTOCOL) {
            let condition = reply
                .children()
                .next()
                .map(|child| child.name().to_string())
                .unwrap_or_else(|| "unspecified".to_string());
            Ok(TransitionOutcome::failed(format!(
                "server refused compression: {condition}"
            )))
        } else {
            Err(ConnectionError::StreamError(format!(
                "unexpected <{}/> in reply to compression request",
                reply.name()
            )))
        }
    }
}

impl ModuleRuntime for Compression {
    fn is_transition_possible<C: TransportConnector>(&self, ctx: &ConnectionContext<C>) -> Feasibility {
        if ctx.features().compression_methods.is_empty() {
            return Feasibility::Impossible("server does not offer stream compression".to_string());
        }
        match Self::choose(ctx) {
            Some(_) => Feasibility::Possible,
            None => Feasibility::Impossible(format!(
                "no common compression method; server offers {}",
                ctx.features().compression_methods.join(", ")
            )),
        }
    }

    async fn transition_into<C: TransportConnector>(
        &mut self,
        ctx: &mut ConnectionContext<C>,
    ) -> TransitionOutcome {
        self.negotiate(ctx).await.into()
    }

    fn reset_state(&mut self) {
        self.method = None;
    }
}
