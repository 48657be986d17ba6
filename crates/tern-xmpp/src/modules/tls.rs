use tracing::debug;
use xmpp_parsers::minidom::Element;
use xmpp_parsers::ns;

use super::ModuleRuntime;
use crate::error::ConnectionError;
use crate::fsm::{ConnectionContext, Feasibility, TransitionOutcome};
use crate::transport::TransportConnector;

/// RFC 6120 § 5 STARTTLS upgrade.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartTls;

impl StartTls {
    async fn negotiate<C: TransportConnector>(
        &mut self,
        ctx: &mut ConnectionContext<C>,
    ) -> Result<TransitionOutcome, ConnectionError> {
        if ctx.is_secure() {
            return Ok(TransitionOutcome::success("transport already secure"));
        }

        ctx.send_element(&Element::builder("starttls", ns::TLS).build())
            .await?;

        let reply = ctx.next_element().await?;
        if reply.is("proceed", ns::TLS) {
            debug!("server accepted STARTTLS, upgrading transport");
            ctx.start_tls().await?;
            ctx.restart_stream().await?;
            Ok(TransitionOutcome::success("TLS established"))
        } else if reply.is("failure", ns::TLS) {
            Err(ConnectionError::TlsHandshakeFailed(
                "server refused STARTTLS".to_string(),
            ))
        } else {
            Err(ConnectionError::StreamError(format!(
                "unexpected <{}/> in reply to STARTTLS",
                reply.name()
            )))
        }
    }
}

impl ModuleRuntime for StartTls {
    fn is_transition_possible<C: TransportConnector>(&self, ctx: &ConnectionContext<C>) -> Feasibility {
        if ctx.is_secure() || ctx.features().starttls {
            Feasibility::Possible
        } else {
            Feasibility::Impossible("server does not offer STARTTLS".to_string())
        }
    }

    async fn transition_into<C: TransportConnector>(
        &mut self,
        ctx: &mut ConnectionContext<C>,
    ) -> TransitionOutcome {
        self.negotiate(ctx).await.into()
    }

    fn reset_state(&mut self) {}
}
