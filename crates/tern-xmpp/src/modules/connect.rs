use tracing::{debug, info};

use super::ModuleRuntime;
use crate::error::ConnectionError;
use crate::fsm::{ConnectionContext, Feasibility, TransitionOutcome};
use crate::transport::TransportConnector;

/// Stands for a state that only records progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct Marker;

impl ModuleRuntime for Marker {
    fn is_transition_possible<C: TransportConnector>(&self, _ctx: &ConnectionContext<C>) -> Feasibility {
        Feasibility::Possible
    }

    async fn transition_into<C: TransportConnector>(
        &mut self,
        _ctx: &mut ConnectionContext<C>,
    ) -> TransitionOutcome {
        TransitionOutcome::success("reached")
    }

    fn reset_state(&mut self) {}
}

/// Resolves the server, opens the socket and the initial stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct Connect;

impl Connect {
    async fn establish<C: TransportConnector>(
        &mut self,
        ctx: &mut ConnectionContext<C>,
    ) -> Result<TransitionOutcome, ConnectionError> {
        let domain = ctx.domain()?;
        debug!(%domain, "opening transport");

        ctx.open_transport().await?;

        Ok(TransitionOutcome::success(format!(
            "connected to {domain} (stream {})",
            ctx.stream_id().unwrap_or("without id")
        )))
    }
}

impl ModuleRuntime for Connect {
    fn is_transition_possible<C: TransportConnector>(&self, _ctx: &ConnectionContext<C>) -> Feasibility {
        Feasibility::Possible
    }

    async fn transition_into<C: TransportConnector>(
        &mut self,
        ctx: &mut ConnectionContext<C>,
    ) -> TransitionOutcome {
        self.establish(ctx).await.into()
    }

    fn reset_state(&mut self) {}
}

/// Terminal state of a full negotiation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Established;

impl ModuleRuntime for Established {
    fn is_transition_possible<C: TransportConnector>(&self, _ctx: &ConnectionContext<C>) -> Feasibility {
        Feasibility::Possible
    }

    async fn transition_into<C: TransportConnector>(
        &mut self,
        ctx: &mut ConnectionContext<C>,
    ) -> TransitionOutcome {
        let jid = ctx.bound_jid().unwrap_or(&ctx.config().jid).to_string();
        if ctx.resumed() {
            info!(%jid, "previous session resumed");
            TransitionOutcome::success(format!("resumed session for {jid}"))
        } else {
            info!(%jid, "session established");
            TransitionOutcome::success(format!("bound as {jid}"))
        }
    }

    fn reset_state(&mut self) {}
}
